//! End-to-end TCP scenarios against a scripted peer: frames are injected
//! into a loopback device's receive queue the way a MAC ISR would deliver
//! them, and the stack's responses are captured off the same device.

mod common;

use std::sync::{Mutex, MutexGuard};

use common::*;
use sis_rtos::config::{TCP_MAX_RTO, TCP_MSL, TCP_RTO, TCP_WND_SCALE};
use sis_rtos::drivers::loopback::{self, Loopback, LoopbackConfig};
use sis_rtos::fs;
use sis_rtos::kernel::{sched, tick};
use sis_rtos::net::ipv4;
use sis_rtos::net::tcp::{self, SocketAddress, TcpState};
use sis_rtos::Error;

static TESTS: Mutex<()> = Mutex::new(());

fn serial() -> MutexGuard<'static, ()> {
    match TESTS.lock() {
        Ok(g) => g,
        Err(poisoned) => poisoned.into_inner(),
    }
}

const SERVER_IP: u32 = 0xC0A8_0032; // 192.168.0.50
const CLIENT_IP: u32 = 0xC0A8_000A; // 192.168.0.10

fn device(name: &str, addr: u32) -> Loopback {
    let lo = loopback::create(name, [0x02, 0, 0, 0, 0, 0x10], LoopbackConfig::default());
    ipv4::set_device_address(&lo.fd(), addr, 0xFFFF_FF00).unwrap();
    lo
}

/// Drain captured frames, returning the parsed TCP ones.
fn drain_tcp(lo: &Loopback) -> Vec<ParsedTcp> {
    let mut out = Vec::new();
    while let Some(frame) = lo.take_frame() {
        if let Some(parsed) = parse_tcp(&frame) {
            out.push(parsed);
        }
    }
    out
}

/// Establish a client connection against a scripted peer.
///
/// Seeds the ISS generator so the connection's `snd_una` after the
/// handshake equals `iss + 1`, and answers the SYN with the peer's
/// SYN-ACK (`peer_seq`, no window scaling).
fn establish(lo: &Loopback, port: &fs::FdRef, iss: u32, peer_seq: u32, peer_wnd: u16) {
    tcp::set_iss(iss.wrapping_sub(1));
    let synack = tcp_frame(
        SERVER_IP,
        CLIENT_IP,
        11000,
        50000,
        peer_seq,
        iss.wrapping_add(1),
        TCP_SYN | TCP_ACK,
        peer_wnd,
        &[2, 4, 0x05, 0xB4], // MSS 1460
        &[],
    );
    loopback::inject_rx(&lo.fd(), &synack).unwrap();
    tcp::tcp_connect(port).unwrap();
    assert_eq!(tcp::state_of(port), TcpState::Estab);
}

fn client_port(name: &str) -> fs::FdRef {
    tcp::tcp_register(
        name,
        SocketAddress {
            local_ip: CLIENT_IP,
            local_port: 50000,
            foreign_ip: SERVER_IP,
            foreign_port: 11000,
        },
    )
    .unwrap()
}

#[test]
fn test_passive_open_three_way_handshake() {
    let _g = serial();
    sis_rtos::sys_reset();
    let lo = device("\\eth_po", SERVER_IP);

    let server = tcp::tcp_register(
        "\\tcp_po_srv",
        SocketAddress {
            local_ip: SERVER_IP,
            local_port: 11000,
            ..Default::default()
        },
    )
    .unwrap();
    tcp::tcp_listen(&server).unwrap();
    let accepted = tcp::tcp_register("\\tcp_po_cli", SocketAddress::default()).unwrap();

    tcp::set_iss(0);
    let iss = 1u32; // first sequence the acceptor will pick

    // Client SYN: seq=1000 wnd=8192 MSS=1460 WS=0.
    let syn = tcp_frame(
        CLIENT_IP,
        SERVER_IP,
        50000,
        11000,
        1000,
        0,
        TCP_SYN,
        8192,
        &[2, 4, 0x05, 0xB4, 3, 3, 0, 1],
        &[],
    );
    loopback::inject_rx(&lo.fd(), &syn).unwrap();
    sched::run_until_idle();
    assert_eq!(tcp::inspect(&server, |p| p.backlog_len()), 1);

    // The handshake-completing ACK is queued behind the SYN-ACK the
    // acceptor is about to send.
    let handshake_ack = tcp_frame(
        CLIENT_IP,
        SERVER_IP,
        50000,
        11000,
        1001,
        iss.wrapping_add(1),
        TCP_ACK,
        8192,
        &[],
        &[],
    );
    loopback::inject_rx(&lo.fd(), &handshake_ack).unwrap();

    tcp::tcp_accept(&server, &accepted).unwrap();

    assert_eq!(tcp::state_of(&accepted), TcpState::Estab);
    tcp::inspect(&accepted, |p| {
        assert_eq!(p.rcv_nxt, 1001);
        assert_eq!(p.snd_una, iss + 1);
        assert_eq!(p.snd_nxt, iss + 1);
        assert_eq!(p.sa.foreign_ip, CLIENT_IP);
        assert_eq!(p.sa.foreign_port, 50000);
    });

    // The wire saw exactly one SYN-ACK with our options echoed.
    let frames = drain_tcp(&lo);
    let synack: Vec<_> = frames
        .iter()
        .filter(|f| f.flags == TCP_SYN | TCP_ACK)
        .collect();
    assert_eq!(synack.len(), 1);
    let synack = synack[0];
    assert_eq!(synack.seq, iss);
    assert_eq!(synack.ack, 1001);
    assert_eq!(synack.wnd, 8192);
    assert_eq!(find_option(&synack.options, 2), Some(vec![0x05, 0xB4]));
    assert_eq!(find_option(&synack.options, 3), Some(vec![TCP_WND_SCALE]));

    tcp::tcp_unregister(&accepted).unwrap();
    tcp::tcp_unregister(&server).unwrap();
}

#[test]
fn test_retransmission_after_loss() {
    let _g = serial();
    sis_rtos::sys_reset();
    let lo = device("\\eth_rto", CLIENT_IP);
    let port = client_port("\\tcp_rto");

    // snd_nxt lands on 2000 after the handshake.
    establish(&lo, &port, 1999, 8000, 8192);
    drain_tcp(&lo);

    let payload = vec![0x5Au8; 500];
    assert_eq!(fs::fs_write(&port, &payload), Ok(500));

    let sent = drain_tcp(&lo);
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].seq, 2000);
    assert_eq!(sent[0].payload, payload);

    tcp::inspect(&port, |p| {
        assert_eq!(p.rtx_slots_in_use(), 1);
        assert_eq!(p.rtx_slot(0), Some((2000, 500, true)));
        assert_eq!(p.rtx_backoff(), TCP_RTO);
    });

    // No ACK: the retransmission timer fires at RTO and doubles.
    tick::advance_to(tick::current_system_tick().wrapping_add(TCP_RTO));
    sched::run_until_idle();

    let resent = drain_tcp(&lo);
    assert_eq!(resent.len(), 1);
    assert_eq!(resent[0].seq, 2000);
    assert_eq!(resent[0].payload, payload);
    tcp::inspect(&port, |p| {
        assert_eq!(p.rtx_backoff(), 2 * TCP_RTO);
        assert!(p.rtx_backoff() <= TCP_MAX_RTO);
        assert_eq!(p.rtx_slot(0), Some((2000, 500, true)));
    });

    tcp::tcp_unregister(&port).unwrap();
}

#[test]
fn test_fast_retransmit_on_third_duplicate_ack() {
    let _g = serial();
    sis_rtos::sys_reset();
    let lo = device("\\eth_frtx", CLIENT_IP);
    let port = client_port("\\tcp_frtx");

    // snd_una = 5000 after the handshake.
    establish(&lo, &port, 4999, 8000, 8192);
    drain_tcp(&lo);

    // Two segments move snd_nxt to 7000 (mss 1460 + 540).
    let payload: Vec<u8> = (0..2000u32).map(|i| i as u8).collect();
    assert_eq!(fs::fs_write(&port, &payload), Ok(2000));
    let sent = drain_tcp(&lo);
    assert_eq!(sent.len(), 2);
    assert_eq!(sent[0].seq, 5000);
    assert_eq!(sent[1].seq, 6460);
    tcp::inspect(&port, |p| assert_eq!(p.snd_nxt, 7000));

    // Three duplicate ACKs of 5000: the third triggers the resend.
    for i in 0..3 {
        let dup = tcp_frame(
            SERVER_IP, CLIENT_IP, 11000, 50000, 8001, 5000, TCP_ACK, 8192, &[], &[],
        );
        loopback::inject_rx(&lo.fd(), &dup).unwrap();
        sched::run_until_idle();
        let resent = drain_tcp(&lo);
        if i < 2 {
            assert!(resent.is_empty(), "resent before the third duplicate");
        } else {
            assert_eq!(resent.len(), 1);
            assert_eq!(resent[0].seq, 5000);
            assert_eq!(resent[0].payload.len(), 1460);
        }
    }

    // Fast retransmit leaves the backoff clock alone.
    tcp::inspect(&port, |p| assert_eq!(p.rtx_backoff(), TCP_RTO));

    tcp::tcp_unregister(&port).unwrap();
}

#[test]
fn test_graceful_close_through_time_wait() {
    let _g = serial();
    sis_rtos::sys_reset();
    let lo = device("\\eth_cls", CLIENT_IP);
    let port = client_port("\\tcp_cls");

    // snd_nxt = 1001 after the handshake; our FIN will carry seq 1001.
    establish(&lo, &port, 1000, 5000, 8192);
    drain_tcp(&lo);

    // Peer acknowledges our FIN (seq 1001, so ack 1002) and closes too.
    let finack = tcp_frame(
        SERVER_IP, CLIENT_IP, 11000, 50000, 5001, 1002, TCP_FIN | TCP_ACK, 8192, &[], &[],
    );
    loopback::inject_rx(&lo.fd(), &finack).unwrap();

    let before = tick::current_system_tick();
    tcp::tcp_close(&port);

    assert_eq!(tcp::state_of(&port), TcpState::Closed);
    let elapsed = tick::current_system_tick().wrapping_sub(before);
    assert!(elapsed >= 2 * TCP_MSL, "TIME_WAIT held only {} ticks", elapsed);

    // Our FIN went out before the teardown completed.
    let frames = drain_tcp(&lo);
    assert!(frames.iter().any(|f| f.flags & TCP_FIN != 0 && f.seq == 1001));

    // The closed port reports its state to late readers.
    let mut buf = [0u8; 16];
    assert_eq!(fs::fs_read(&port, &mut buf), Err(Error::Closed));

    tcp::tcp_unregister(&port).unwrap();
}

#[test]
fn test_sequence_number_wrap() {
    let _g = serial();
    sis_rtos::sys_reset();
    let lo = device("\\eth_wrap", CLIENT_IP);
    let port = client_port("\\tcp_wrap");

    // snd_una = 2^32 - 10 after the handshake.
    let iss = u32::MAX - 10;
    establish(&lo, &port, iss, 3000, 8192);
    tcp::inspect(&port, |p| assert_eq!(p.snd_una, iss.wrapping_add(1)));
    drain_tcp(&lo);

    let payload = [0x42u8; 20];
    assert_eq!(fs::fs_write(&port, &payload), Ok(20));
    let expected_ack = iss.wrapping_add(1).wrapping_add(20); // wraps past zero

    let ack = tcp_frame(
        SERVER_IP, CLIENT_IP, 11000, 50000, 3001, expected_ack, TCP_ACK, 8192, &[], &[],
    );
    loopback::inject_rx(&lo.fd(), &ack).unwrap();
    sched::run_until_idle();

    tcp::inspect(&port, |p| {
        assert_eq!(p.snd_una, expected_ack);
        assert_eq!(p.rtx_slots_in_use(), 0);
    });

    tcp::tcp_unregister(&port).unwrap();
}

#[test]
fn test_out_of_order_segments_reassemble_on_read() {
    let _g = serial();
    sis_rtos::sys_reset();
    let lo = device("\\eth_oo", CLIENT_IP);
    let port = client_port("\\tcp_oo");

    // snd_una = 101 after the handshake; peer segments acknowledge it.
    establish(&lo, &port, 100, 5000, 8192);
    drain_tcp(&lo);
    let rcv_nxt = 5001u32;

    // A segment 100 bytes past the expected sequence waits out of order.
    let later = vec![0xBBu8; 100];
    let seg_late = tcp_frame(
        SERVER_IP, CLIENT_IP, 11000, 50000, rcv_nxt + 100, 101, TCP_ACK, 8192, &[], &later,
    );
    loopback::inject_rx(&lo.fd(), &seg_late).unwrap();
    sched::run_until_idle();
    tcp::inspect(&port, |p| {
        assert_eq!(p.oo_queue_len(), 1);
        assert_eq!(p.rcv_nxt, rcv_nxt);
    });

    // The gap-filling segment drains the out-of-order queue.
    let first = vec![0xAAu8; 100];
    let seg_first = tcp_frame(
        SERVER_IP, CLIENT_IP, 11000, 50000, rcv_nxt, 101, TCP_ACK, 8192, &[], &first,
    );
    loopback::inject_rx(&lo.fd(), &seg_first).unwrap();
    sched::run_until_idle();
    tcp::inspect(&port, |p| {
        assert_eq!(p.oo_queue_len(), 0);
        assert_eq!(p.rcv_nxt, rcv_nxt + 200);
    });

    let mut out = [0u8; 256];
    let n = fs::fs_read(&port, &mut out).unwrap();
    assert_eq!(n, 200);
    assert_eq!(&out[..100], &first[..]);
    assert_eq!(&out[100..200], &later[..]);

    // Every delivery was acknowledged with the current rcv_nxt.
    let acks = drain_tcp(&lo);
    assert_eq!(acks.last().map(|f| f.ack), Some(rcv_nxt + 200));

    tcp::tcp_unregister(&port).unwrap();
}

#[test]
fn test_listen_backpressure_drops_syn_when_threshold_locked() {
    let _g = serial();
    sis_rtos::sys_reset();
    // A pool tight enough that a few parked lists reach the margin.
    let lo = loopback::create(
        "\\eth_bp",
        [0x02, 0, 0, 0, 0, 0x20],
        LoopbackConfig {
            num_buffers: 8,
            buffer_size: 128,
            num_lists: 8,
            threshold_buffers: 2,
            threshold_lists: 2,
            mtu: 1500,
        },
    );
    ipv4::set_device_address(&lo.fd(), SERVER_IP, 0xFFFF_FF00).unwrap();

    let server = tcp::tcp_register(
        "\\tcp_bp_srv",
        SocketAddress {
            local_ip: SERVER_IP,
            local_port: 11000,
            ..Default::default()
        },
    )
    .unwrap();
    tcp::tcp_listen(&server).unwrap();

    // Flood SYNs from distinct source ports; each backlogged SYN parks a
    // list until the pool locks its margin.
    for i in 0..8u16 {
        let syn = tcp_frame(
            CLIENT_IP,
            SERVER_IP,
            50000 + i,
            11000,
            1000,
            0,
            TCP_SYN,
            8192,
            &[2, 4, 0x05, 0xB4],
            &[],
        );
        let _ = loopback::inject_rx(&lo.fd(), &syn);
        sched::run_until_idle();
    }

    let backlogged = tcp::inspect(&server, |p| p.backlog_len());
    assert!(backlogged >= 1);
    assert!(
        backlogged < 8,
        "threshold never engaged: all {} SYNs were backlogged",
        backlogged
    );

    tcp::tcp_unregister(&server).unwrap();
}
