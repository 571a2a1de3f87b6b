//! IPv4 reassembly scenarios, driven straight through `ipv4::process`
//! with packets built in the device's own pool.

mod common;

use std::sync::{Mutex, MutexGuard};

use common::*;
use sis_rtos::config::{IPV4_FRAG_DROP_TIMEOUT, IPV4_FRAG_TIMEOUT};
use sis_rtos::drivers::loopback::{self, Loopback, LoopbackConfig};
use sis_rtos::fs::buffer::BufFlags;
use sis_rtos::fs::FdRef;
use sis_rtos::kernel::{sched, tick};
use sis_rtos::net::{ipv4, NetBuffer};
use sis_rtos::Error;

static TESTS: Mutex<()> = Mutex::new(());

fn serial() -> MutexGuard<'static, ()> {
    match TESTS.lock() {
        Ok(g) => g,
        Err(poisoned) => poisoned.into_inner(),
    }
}

const OUR_IP: u32 = 0xC0A8_0032; // 192.168.0.50
const PEER_IP: u32 = 0xC0A8_000A; // 192.168.0.10

/// An unhandled protocol number: reassembly completes, dispatch reports
/// the datagram as unknown, and the test keeps the buffer to inspect.
const PROTO_TEST: u8 = 222;

const MF: u16 = 0x2000;

fn device(name: &str, config: LoopbackConfig) -> Loopback {
    let lo = loopback::create(name, [0x02, 0, 0, 0, 0, 0x30], config);
    ipv4::set_device_address(&lo.fd(), OUR_IP, 0xFFFF_FF00).unwrap();
    lo
}

/// Check out a list from the device pool holding the given packet bytes.
fn packet(fd: &FdRef, bytes: &[u8]) -> NetBuffer {
    let list = fd
        .with_pool(|pool| {
            let list = pool.get_list(BufFlags::empty())?;
            pool.list_push(list, bytes, BufFlags::empty())?;
            Ok::<_, Error>(list)
        })
        .unwrap();
    NetBuffer::new(fd.clone(), list)
}

fn fragment(id: u16, offset_units: u16, more: bool, payload: &[u8]) -> Vec<u8> {
    let flag_off = offset_units | if more { MF } else { 0 };
    let mut p = ipv4_header(PEER_IP, OUR_IP, PROTO_TEST, id, flag_off, payload.len());
    p.extend_from_slice(payload);
    p
}

fn pool_counts(fd: &FdRef) -> (usize, usize) {
    fd.with_pool(|pool| (pool.free_buffers(), pool.free_list_heads()))
}

fn pool_full(fd: &FdRef) -> bool {
    fd.with_pool(|pool| {
        pool.free_buffers() == pool.num_buffers() && pool.free_list_heads() == pool.num_lists()
    })
}

#[test]
fn test_out_of_order_fragments_reassemble_once() {
    let _g = serial();
    sis_rtos::sys_reset();
    let lo = device(
        "\\eth_fr",
        LoopbackConfig {
            num_buffers: 64,
            buffer_size: 256,
            num_lists: 16,
            threshold_buffers: 2,
            threshold_lists: 2,
            mtu: 1500,
        },
    );
    let fd = lo.fd();

    // Offsets 0, 185, 370 in 8-octet units; sizes 1480/1480/40; id 0xBEEF.
    let payload: Vec<u8> = (0..3000u32).map(|i| (i % 251) as u8).collect();
    let f0 = fragment(0xBEEF, 0, true, &payload[..1480]);
    let f185 = fragment(0xBEEF, 185, true, &payload[1480..2960]);
    let f370 = fragment(0xBEEF, 370, false, &payload[2960..]);

    // Arrival order 370, 0, 185; the first two park in the slot.
    let b370 = packet(&fd, &f370);
    assert_eq!(ipv4::process(&lo.dev, &b370, false), Err(Error::NoAction));
    assert_eq!(b370.total_len(), 0);
    b370.free();

    let b0 = packet(&fd, &f0);
    assert_eq!(ipv4::process(&lo.dev, &b0, false), Err(Error::NoAction));
    b0.free();

    // The gap-filler completes reassembly; dispatch then rejects the
    // unhandled protocol, leaving the whole datagram in the buffer.
    let b185 = packet(&fd, &f185);
    assert_eq!(ipv4::process(&lo.dev, &b185, false), Err(Error::UnknownProto));

    let whole = b185.to_vec();
    assert_eq!(whole.len(), 20 + 3000);
    // Reassembled datagram keeps the first fragment's header.
    assert_eq!(&whole[..20], &f0[..20]);
    assert_eq!(&whole[20..], &payload[..]);

    b185.free();
    assert!(pool_full(&fd), "fragment slot still holds buffers");
}

#[test]
fn test_threshold_locked_drops_all_fragment_flows() {
    let _g = serial();
    sis_rtos::sys_reset();
    // num_buffers = 8, threshold = 2 per the backpressure scenario.
    let lo = device(
        "\\eth_th",
        LoopbackConfig {
            num_buffers: 8,
            buffer_size: 128,
            num_lists: 12,
            threshold_buffers: 2,
            threshold_lists: 1,
            mtu: 1500,
        },
    );
    let fd = lo.fd();
    let body = [0u8; 96];

    // Five parked fragments across three flows hold five buffers.
    for (id, off) in [(1u16, 0u16), (1, 40), (2, 0), (2, 40), (3, 0)] {
        let frag = packet(&fd, &fragment(id, off, true, &body));
        assert_eq!(ipv4::process(&lo.dev, &frag, false), Err(Error::NoAction));
        frag.free();
    }
    let (free_bufs, _) = pool_counts(&fd);
    assert_eq!(free_bufs, 3);

    // The sixth arrival leaves only the reserved margin free; nothing in
    // flight can ever complete now, so every flow drops.
    let frag = packet(&fd, &fragment(4, 0, true, &body));
    assert_eq!(ipv4::process(&lo.dev, &frag, false), Err(Error::Threshold));
    frag.free();
    assert!(pool_full(&fd), "dropped flows must release their buffers");

    // Late fragments of a dropped flow are discarded outright.
    let frag = packet(&fd, &fragment(1, 80, true, &body));
    assert_eq!(
        ipv4::process(&lo.dev, &frag, false),
        Err(Error::BufferNoSpace)
    );
    frag.free();

    // After the drop window the slots recycle and reassembly resumes.
    tick::advance_to(tick::current_system_tick().wrapping_add(IPV4_FRAG_DROP_TIMEOUT + 1));
    sched::run_until_idle();
    let frag = packet(&fd, &fragment(9, 0, true, &body));
    assert_eq!(ipv4::process(&lo.dev, &frag, false), Err(Error::NoAction));
    frag.free();
}

#[test]
fn test_incomplete_fragments_expire() {
    let _g = serial();
    sis_rtos::sys_reset();
    let lo = device("\\eth_exp", LoopbackConfig::default());
    let fd = lo.fd();

    let frag = packet(&fd, &fragment(7, 0, true, &[0x11; 100]));
    assert_eq!(ipv4::process(&lo.dev, &frag, false), Err(Error::NoAction));
    frag.free();
    assert!(!pool_full(&fd));

    sched::run_until_idle();
    tick::advance_to(tick::current_system_tick().wrapping_add(IPV4_FRAG_TIMEOUT + 1));
    sched::run_until_idle();

    assert!(pool_full(&fd), "expired slot must return its buffers");
}

#[test]
fn test_single_fragment_with_zero_offset_is_plain_packet() {
    let _g = serial();
    sis_rtos::sys_reset();
    let lo = device("\\eth_pl", LoopbackConfig::default());
    let fd = lo.fd();

    // Offset 0 and MF clear: nothing to reassemble, straight to dispatch.
    let packet_bytes = fragment(1, 0, false, &[0x22; 64]);
    let buf = packet(&fd, &packet_bytes);
    assert_eq!(ipv4::process(&lo.dev, &buf, false), Err(Error::UnknownProto));
    assert_eq!(buf.total_len(), packet_bytes.len());
    buf.free();
    assert!(pool_full(&fd));
}

#[test]
fn test_corrupt_header_checksum_is_rejected() {
    let _g = serial();
    sis_rtos::sys_reset();
    let lo = device("\\eth_bad", LoopbackConfig::default());
    let fd = lo.fd();

    let mut bytes = fragment(1, 0, false, &[0u8; 32]);
    bytes[10] ^= 0xFF;
    let buf = packet(&fd, &bytes);
    assert_eq!(
        ipv4::process(&lo.dev, &buf, false),
        Err(Error::InvalidChecksum)
    );
    buf.free();
}
