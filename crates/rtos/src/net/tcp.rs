//! TCP.
//!
//! Ports are descriptors: applications read and write them through the
//! descriptor API while the network task drives the RFC 793 state machine
//! underneath. Each port owns a fixed set of retransmission slots whose
//! buffers are withheld from the pool via the list free callback until
//! acknowledged, an out-of-order queue sorted by sequence number, and a
//! listen backlog of unprocessed SYNs.
//!
//! All segment processing happens in the network task under the port's
//! lock; outbound segments are planned there and built afterwards so a
//! buffer allocation can never block while a lock is held.

use alloc::boxed::Box;
use alloc::collections::VecDeque;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::any::Any;
use core::sync::atomic::{AtomicU32, Ordering};

use bitflags::bitflags;

use lazy_static::lazy_static;
use spin::Mutex;

use crate::config::{
    TCP_MAX_RTO, TCP_MSL, TCP_NUM_RTX, TCP_RTO, TCP_WND_SCALE, TCP_WND_SIZE,
};
use crate::fs::buffer::{self, BufFlags, ListFreeData};
use crate::fs::{self, Fd, FdFlags, FdOps, FdRef, FS_BLOCK_READ, FS_BLOCK_WRITE};
use crate::kernel::condition::{suspend_on, Suspend, SuspendParam};
use crate::kernel::semaphore::Semaphore;
use crate::kernel::tick::{self, Tick};
use crate::net::ipv4::{self, IPV4_HDR_SIZE};
use crate::net::{condition, csum, device, NetBuffer, IP_PROTO_TCP};
use crate::status::{Disposition, Error, Result};

pub const TCP_HDR_SIZE: usize = 20;

const SRC_PORT_OFFSET: usize = 0;
const DST_PORT_OFFSET: usize = 2;
const SEQ_NUM_OFFSET: usize = 4;
const ACK_NUM_OFFSET: usize = 8;
const FLAGS_OFFSET: usize = 12;
const WND_SIZE_OFFSET: usize = 14;
const CSUM_OFFSET: usize = 16;

const HDR_LEN_MASK: u16 = 0xF000;
const HDR_LEN_SHIFT: u16 = 12;

const OPT_END: u8 = 0;
const OPT_NOP: u8 = 1;
const OPT_MSS: u8 = 2;
const OPT_WIND_SCALE: u8 = 3;

bitflags! {
    /// On-wire TCP header flags (low bits of the offset/flags word).
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct TcpHdrFlags: u16 {
        const FIN = 1 << 0;
        const SYN = 1 << 1;
        const RST = 1 << 2;
        const PSH = 1 << 3;
        const ACK = 1 << 4;
        const URG = 1 << 5;
    }
}

bitflags! {
    /// Options negotiated with the peer.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    struct TcpOptFlags: u8 {
        const MSS = 1 << 0;
        const WND_SCALE = 1 << 1;
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    struct RtxFlags: u8 {
        const IN_USE = 1 << 0;
        const BUFFER_RETURNED = 1 << 1;
    }
}

/// Connection endpoint addresses. Zero fields are unspecified (listening
/// ports leave the foreign pair unset).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SocketAddress {
    pub local_ip: u32,
    pub local_port: u16,
    pub foreign_ip: u32,
    pub foreign_port: u16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TcpState {
    Closed,
    Listen,
    SynSent,
    SynRcvd,
    Estab,
    FinWait1,
    FinWait2,
    Closing,
    LastAck,
    TimeWait,
}

struct RtxSlot {
    flags: RtxFlags,
    buf: Option<NetBuffer>,
    seq_num: u32,
    seg_len: u16,
}

impl RtxSlot {
    const fn new() -> Self {
        RtxSlot {
            flags: RtxFlags::empty(),
            buf: None,
            seq_num: 0,
            seg_len: 0,
        }
    }
}

/// Per-port protocol state, stored as the port descriptor's private data.
pub struct TcpPort {
    pub sa: SocketAddress,
    pub state: TcpState,
    opt_flags: TcpOptFlags,
    pub mss: u16,

    pub snd_una: u32,
    pub snd_nxt: u32,
    pub snd_wnd: u32,
    pub snd_wnd_scale: u8,

    pub rcv_nxt: u32,
    pub rcv_wnd: u32,
    pub rcv_wnd_scale: u8,

    nacks: u8,

    rtx: [RtxSlot; TCP_NUM_RTX],
    rtx_timeout: Tick,
    rtx_timeout_enable: bool,
    rtx_time: Tick,

    event_timeout: Tick,
    event_timeout_enable: bool,

    rx_buffer: Option<NetBuffer>,
    /// Out-of-order segments, each prefixed with its 4-byte starting
    /// sequence, ascending.
    oo_list: Vec<NetBuffer>,
    backlog: VecDeque<NetBuffer>,

    timer: Option<usize>,
}

impl TcpPort {
    fn new(sa: SocketAddress) -> Self {
        TcpPort {
            sa,
            state: TcpState::Closed,
            opt_flags: TcpOptFlags::empty(),
            mss: 0,
            snd_una: 0,
            snd_nxt: 0,
            snd_wnd: 0,
            snd_wnd_scale: 0,
            rcv_nxt: 0,
            rcv_wnd: TCP_WND_SIZE,
            rcv_wnd_scale: 0,
            nacks: 0,
            rtx: core::array::from_fn(|_| RtxSlot::new()),
            rtx_timeout: 0,
            rtx_timeout_enable: false,
            rtx_time: 0,
            event_timeout: 0,
            event_timeout_enable: false,
            rx_buffer: None,
            oo_list: Vec::new(),
            backlog: VecDeque::new(),
            timer: None,
        }
    }

    /// Session defaults re-applied on every open.
    fn initialize(&mut self) {
        self.rcv_wnd = TCP_WND_SIZE;
        self.rcv_wnd_scale = 0;
        self.snd_wnd_scale = 0;
        self.nacks = 0;
        self.event_timeout_enable = false;
        self.rtx_timeout_enable = false;
    }

    /// Window advertised on the wire.
    fn wire_wnd(&self) -> u16 {
        (self.rcv_wnd >> self.rcv_wnd_scale) as u16
    }
}

struct Ports {
    lock: Semaphore,
    list: Mutex<Vec<FdRef>>,
}

lazy_static! {
    static ref PORTS: Ports = Ports {
        lock: Semaphore::new(1, 1),
        list: Mutex::new(Vec::new()),
    };
}

/// Initial send sequence source: a counter kept ahead of every observed
/// `snd_nxt`. Randomized generation per RFC 6528 is deliberately not
/// implemented.
static TCP_ISS: AtomicU32 = AtomicU32::new(0);

/// Run `f` under the port descriptor's lock.
fn with_port<R>(fd: &FdRef, f: impl FnOnce(&mut TcpPort) -> R) -> R {
    fd.with_state(|state| {
        let port = state
            .private
            .as_mut()
            .and_then(|p| p.downcast_mut::<TcpPort>())
            .expect("descriptor is not a TCP port");
        f(port)
    })
}

struct TcpOps;

impl FdOps for TcpOps {
    fn read(&self, fd: &FdRef, buf: &mut [u8]) -> Result<usize> {
        tcp_read_data(fd, buf)
    }

    fn write(&self, fd: &FdRef, data: &[u8]) -> Result<usize> {
        tcp_write_data(fd, data)
    }

    fn close(&self, fd: &FdRef) {
        tcp_close(fd);
    }
}

/// Register a TCP port with the stack and the descriptor registry.
pub fn tcp_register(name: &str, sa: SocketAddress) -> Result<FdRef> {
    let fd = Fd::new(name, FdFlags::BLOCK, Box::new(TcpOps));
    fd.with_state(|state| {
        let mut port = TcpPort::new(sa);
        port.initialize();
        state.private = Some(Box::new(port) as Box<dyn Any + Send>);
    });
    timer_register(&fd);

    PORTS.lock.obtain(None)?;
    PORTS.list.lock().push(fd.clone());
    PORTS.lock.release();

    fs::fs_register(fd.clone())?;
    condition::net_init();
    Ok(fd)
}

/// Unregister a TCP port, returning every held buffer to its pool.
pub fn tcp_unregister(fd: &FdRef) -> Result<()> {
    PORTS.lock.obtain(None)?;
    PORTS.list.lock().retain(|p| !Arc::ptr_eq(p, fd));
    PORTS.lock.release();

    rtx_free_all(fd);

    let (rx, oo, backlog, timer) = with_port(fd, |port| {
        (
            port.rx_buffer.take(),
            core::mem::take(&mut port.oo_list),
            core::mem::take(&mut port.backlog),
            port.timer.take(),
        )
    });
    if let Some(rx) = rx {
        rx.free();
    }
    for buf in oo {
        buf.free();
    }
    for buf in backlog {
        buf.free();
    }
    if let Some(timer) = timer {
        condition::remove(timer);
    }

    fs::fs_unregister(fd)
}

/// Move a port to the listen state.
pub fn tcp_listen(fd: &FdRef) -> Result<()> {
    with_port(fd, |port| port.state = TcpState::Listen);
    Ok(())
}

fn tcp_port_wait(fd: &FdRef, flag: u32) -> Result<()> {
    let (timeout, priority) = fd.with_state(|s| (s.timeout, s.priority));
    let deadline = timeout.map(|t| tick::current_system_tick().wrapping_add(t));
    let suspend = Suspend::new(SuspendParam { flag, num: 0 }, priority, deadline);
    suspend_on(&[&fd.condition], &suspend, || {
        let flags = fd.flags();
        !(((flag & FS_BLOCK_READ != 0) && flags.contains(FdFlags::DATA_AVAILABLE))
            || ((flag & FS_BLOCK_WRITE != 0) && flags.contains(FdFlags::SPACE_AVAILABLE)))
    })
}

fn resume_socket(fd: &FdRef, flags: u32) {
    if flags & FS_BLOCK_READ != 0 {
        fd.data_available();
    }
    if flags & FS_BLOCK_WRITE != 0 {
        fd.space_available();
    }
}

// Timer plumbing: one network-condition entry per port serves both the
// retransmission timer and the TIME_WAIT event timer.

fn timer_register(fd: &FdRef) {
    let weak = Arc::downgrade(fd);
    let handle = condition::add(
        None,
        Box::new(move |_status| {
            if let Some(fd) = weak.upgrade() {
                timeout_callback(&fd);
            }
        }),
    );
    with_port(fd, |port| port.timer = Some(handle));
}

/// Arm the port's network-condition timer with the nearer of the
/// retransmission and event deadlines.
fn timeout_update(fd: &FdRef) {
    let (timer, deadline) = with_port(fd, |port| {
        let mut deadline = port.event_timeout_enable.then_some(port.event_timeout);
        if port.rtx_timeout_enable
            && deadline.map_or(true, |d| tick::int32cmp(d, port.rtx_timeout) > 0)
        {
            deadline = Some(port.rtx_timeout);
        }
        (port.timer, deadline)
    });
    if let Some(timer) = timer {
        condition::set_timeout(timer, deadline);
        condition::updated();
    }
}

fn timeout_callback(fd: &FdRef) {
    let now = tick::current_system_tick();
    enum Action {
        None,
        Closed,
        Resend(NetBuffer),
    }

    let action = with_port(fd, |port| match port.state {
        TcpState::TimeWait => {
            if port.event_timeout_enable && tick::int32cmp(now, port.event_timeout) >= 0 {
                port.state = TcpState::Closed;
                port.event_timeout_enable = false;
                Action::Closed
            } else {
                Action::None
            }
        }
        TcpState::SynSent
        | TcpState::SynRcvd
        | TcpState::LastAck
        | TcpState::FinWait1
        | TcpState::Closing
        | TcpState::Estab => {
            if !(port.rtx_timeout_enable && tick::int32cmp(now, port.rtx_timeout) >= 0) {
                return Action::None;
            }
            // Retransmit the slot holding the smallest sequence number.
            let mut least: Option<usize> = None;
            for (i, slot) in port.rtx.iter().enumerate() {
                if slot.flags.contains(RtxFlags::IN_USE)
                    && least.map_or(true, |l| tick::int32cmp(port.rtx[l].seq_num, slot.seq_num) >= 0)
                {
                    least = Some(i);
                }
            }
            let mut action = Action::None;
            if let Some(i) = least {
                if port.rtx[i].flags.contains(RtxFlags::BUFFER_RETURNED) {
                    port.rtx[i].flags.remove(RtxFlags::BUFFER_RETURNED);
                    if let Some(buf) = port.rtx[i].buf.clone() {
                        action = Action::Resend(buf);
                    }
                }
                match port.state {
                    TcpState::Estab => {
                        // Exponential backoff, capped.
                        port.rtx_time = (port.rtx_time * 2).min(TCP_MAX_RTO);
                        port.rtx_timeout = now.wrapping_add(port.rtx_time);
                    }
                    _ => {
                        port.rtx_timeout = now.wrapping_add(TCP_RTO);
                    }
                }
            }
            action
        }
        _ => Action::None,
    });

    match action {
        Action::None => {}
        Action::Closed => {
            resume_socket(fd, FS_BLOCK_READ | FS_BLOCK_WRITE);
        }
        Action::Resend(buf) => {
            let kept = device::transmit(&buf, IP_PROTO_TCP);
            if matches!(kept, Ok(Disposition::Free)) {
                with_port(fd, |port| {
                    for slot in port.rtx.iter_mut() {
                        if slot.flags.contains(RtxFlags::IN_USE)
                            && slot.buf.as_ref().is_some_and(|b| b.list == buf.list)
                        {
                            slot.flags.insert(RtxFlags::BUFFER_RETURNED);
                        }
                    }
                });
            }
        }
    }

    // Free everything if the port fell out of a running state.
    let stale = with_port(fd, |port| {
        matches!(port.state, TcpState::Closed | TcpState::Listen | TcpState::FinWait2)
    });
    if stale {
        rtx_free_all(fd);
    }
    timeout_update(fd);
}

// Retransmission slots.

/// List free callback: hand the buffer back to its retransmission slot
/// instead of the pool.
fn rtx_return_buffer(data: &ListFreeData, list: buffer::ListId) -> bool {
    let Some(fd) = data.fd.upgrade() else {
        return false;
    };
    with_port(&fd, |port| {
        let slot = &mut port.rtx[data.index];
        if slot.flags.contains(RtxFlags::IN_USE)
            && slot.buf.as_ref().is_some_and(|b| b.list == list)
        {
            slot.flags.insert(RtxFlags::BUFFER_RETURNED);
            true
        } else {
            false
        }
    })
}

/// Release every slot covered by `ack_num`. Returns whether a slot was
/// freed; re-arms or disables the retransmission timer.
fn rtx_process_ack(port: &mut TcpPort, ack_num: u32) -> bool {
    let mut freed = false;
    let mut do_rtx = false;
    let mut to_free: Vec<NetBuffer> = Vec::new();

    for slot in port.rtx.iter_mut() {
        if !slot.flags.contains(RtxFlags::IN_USE) {
            continue;
        }
        if tick::int32cmp(slot.seq_num.wrapping_add(slot.seg_len as u32), ack_num) <= 0 {
            if let Some(buf) = slot.buf.take() {
                buf.fd.with_pool(|pool| pool.take_free_hook(buf.list));
                if slot.flags.contains(RtxFlags::BUFFER_RETURNED) {
                    to_free.push(buf);
                }
            }
            slot.flags = RtxFlags::empty();
            freed = true;
        } else {
            do_rtx = true;
        }
    }

    if do_rtx {
        port.rtx_timeout = tick::current_system_tick().wrapping_add(TCP_RTO);
        port.rtx_time = TCP_RTO;
        port.rtx_timeout_enable = true;
    } else {
        port.rtx_timeout_enable = false;
    }

    for buf in to_free {
        buf.free();
    }
    freed
}

/// Free every retransmission buffer and disable the timer.
fn rtx_free_all(fd: &FdRef) {
    let to_free = with_port(fd, |port| {
        let mut bufs = Vec::new();
        for slot in port.rtx.iter_mut() {
            if slot.flags.contains(RtxFlags::IN_USE) {
                if let Some(buf) = slot.buf.take() {
                    buf.fd.with_pool(|pool| pool.take_free_hook(buf.list));
                    if slot.flags.contains(RtxFlags::BUFFER_RETURNED) {
                        bufs.push(buf);
                    }
                }
            }
            slot.flags = RtxFlags::empty();
        }
        port.rtx_timeout_enable = false;
        bufs
    });
    for buf in to_free {
        buf.free();
    }
    timeout_update(fd);
}

/// Immediately resend the slot holding `seq_num` (third duplicate ACK);
/// the backoff clock is left untouched.
fn fast_rtx(fd: &FdRef, seq_num: u32) {
    let resend = with_port(fd, |port| {
        for slot in port.rtx.iter_mut() {
            if slot.flags.contains(RtxFlags::IN_USE)
                && slot.seq_num == seq_num
                && slot.flags.contains(RtxFlags::BUFFER_RETURNED)
            {
                slot.flags.remove(RtxFlags::BUFFER_RETURNED);
                return slot.buf.clone();
            }
        }
        None
    });
    if let Some(buf) = resend {
        if matches!(device::transmit(&buf, IP_PROTO_TCP), Ok(Disposition::Free)) {
            with_port(fd, |port| {
                for slot in port.rtx.iter_mut() {
                    if slot.flags.contains(RtxFlags::IN_USE) && slot.seq_num == seq_num {
                        slot.flags.insert(RtxFlags::BUFFER_RETURNED);
                    }
                }
            });
        }
    }
    timeout_update(fd);
}

// Options.

fn process_options(
    buf: &NetBuffer,
    port: &mut TcpPort,
    offset: usize,
    total_opt_size: usize,
) -> Result<()> {
    if offset + total_opt_size > buf.total_len() {
        return Err(Error::InvalidHeader);
    }

    let mut index = 0usize;
    while index < total_opt_size {
        let opt_type = buf.peek_u8(offset + index)?;
        index += 1;

        let opt_len = match opt_type {
            OPT_END => return Ok(()),
            OPT_NOP => continue,
            _ => {
                if index >= total_opt_size {
                    return Err(Error::InvalidHeader);
                }
                let l = buf.peek_u8(offset + index)?;
                index += 1;
                // Length covers the type and length octets themselves.
                if l < 2 {
                    return Err(Error::InvalidHeader);
                }
                (l - 2) as usize
            }
        };

        if index + opt_len > total_opt_size {
            return Err(Error::InvalidHeader);
        }

        match opt_type {
            OPT_MSS => {
                if opt_len != 2 {
                    return Err(Error::InvalidHeader);
                }
                let mss = buf.peek_u16(offset + index)?;
                if mss < port.mss {
                    port.mss = mss;
                }
                port.opt_flags.insert(TcpOptFlags::MSS);
            }
            OPT_WIND_SCALE => {
                if opt_len != 1 {
                    return Err(Error::InvalidHeader);
                }
                port.snd_wnd_scale = buf.peek_u8(offset + index)?;
                port.opt_flags.insert(TcpOptFlags::WND_SCALE);
            }
            _ => {}
        }
        index += opt_len;
    }
    Ok(())
}

/// Append the options selected by `opt_flags` (SYN segments carry no
/// payload, so tail appends land directly after the header). Returns the
/// option byte count and latches the receive window scale when the
/// window-scale option goes out.
fn add_options(
    buf: &NetBuffer,
    port_fd: &FdRef,
    opt_flags: TcpOptFlags,
    flags: BufFlags,
) -> Result<usize> {
    let mut size = 0usize;

    if opt_flags.contains(TcpOptFlags::MSS) {
        let mss = with_port(port_fd, |port| port.mss);
        buf.push(&[OPT_MSS, 4], flags)?;
        buf.push(&mss.to_be_bytes(), flags)?;
        size += 4;
    }

    if opt_flags.contains(TcpOptFlags::WND_SCALE) {
        buf.push(&[OPT_WIND_SCALE, 3, TCP_WND_SCALE], flags)?;
        with_port(port_fd, |port| port.rcv_wnd_scale = TCP_WND_SCALE);
        size += 3;
    }

    while size % 4 != 0 {
        buf.push(&[OPT_NOP], flags)?;
        size += 1;
    }
    Ok(size)
}

/// Push a TCP header (options already appended, `opt_len` bytes).
pub fn tcp_header_add(
    buf: &NetBuffer,
    sa: &SocketAddress,
    seq_num: u32,
    ack_num: u32,
    tcp_flags: TcpHdrFlags,
    wnd_size: u16,
    opt_len: usize,
) -> Result<()> {
    let flags_word =
        tcp_flags.bits() | ((((TCP_HDR_SIZE + opt_len) as u16) << (HDR_LEN_SHIFT - 2)) & HDR_LEN_MASK);
    // Fields pushed in reverse so they land in wire order.
    buf.push_u32(0, BufFlags::HEAD)?; // checksum + urgent pointer
    buf.push_u16(wnd_size, BufFlags::HEAD)?;
    buf.push_u16(flags_word, BufFlags::HEAD)?;
    buf.push_u32(ack_num, BufFlags::HEAD)?;
    buf.push_u32(seq_num, BufFlags::HEAD)?;
    buf.push_u16(sa.foreign_port, BufFlags::HEAD)?;
    buf.push_u16(sa.local_port, BufFlags::HEAD)?;
    Ok(())
}

/// Build and transmit one segment.
///
/// With `rtx_on` the segment takes a retransmission slot and its buffer
/// is withheld from the pool until acknowledged;
/// `NoRtxAvailable` is returned when every slot is busy.
#[allow(clippy::too_many_arguments)]
fn tcp_send_segment(
    fd: &FdRef,
    sa: &SocketAddress,
    seq_num: u32,
    ack_num: u32,
    tcp_flags: TcpHdrFlags,
    wnd_size: u16,
    data: Option<&[u8]>,
    rtx_on: bool,
    bflags: BufFlags,
) -> Result<()> {
    // Keep the ISS generator ahead of every sequence we have used.
    let snd_nxt = with_port(fd, |port| port.snd_nxt);
    if tick::int32cmp(TCP_ISS.load(Ordering::SeqCst), snd_nxt) < 0 {
        TCP_ISS.store(snd_nxt, Ordering::SeqCst);
    }

    let net_device = ipv4::get_source_device(sa.local_ip).ok_or(Error::InvalidFd)?;
    let list = buffer::get_list(&net_device.fd, bflags)?;
    let buf = NetBuffer::new(net_device.fd.clone(), list);
    let data_len = data.map_or(0, |d| d.len());

    let mut rtx_index: Option<usize> = None;

    let built = (|| -> Result<()> {
        if let Some(data) = data {
            buf.push(data, bflags & (BufFlags::TH | BufFlags::SUSPEND))?;
        }

        let mut opt_size = 0;
        if tcp_flags.contains(TcpHdrFlags::SYN) {
            let opt_flags = if tcp_flags.contains(TcpHdrFlags::ACK) {
                // Echo only what the remote offered.
                with_port(fd, |port| port.opt_flags)
            } else {
                TcpOptFlags::MSS | TcpOptFlags::WND_SCALE
            };
            opt_size = add_options(&buf, fd, opt_flags, bflags - BufFlags::SUSPEND)?;
        }

        tcp_header_add(&buf, sa, seq_num, ack_num, tcp_flags, wnd_size, opt_size)?;

        let csum = csum::net_pseudo_csum_calculate(
            &buf,
            sa.local_ip,
            sa.foreign_ip,
            IP_PROTO_TCP,
            buf.total_len() as u16,
            0,
        )?;
        buf.push_offset(&csum.to_be_bytes(), CSUM_OFFSET, BufFlags::UPDATE)?;

        if rtx_on {
            rtx_index = with_port(fd, |port| {
                let index = port
                    .rtx
                    .iter()
                    .position(|s| !s.flags.contains(RtxFlags::IN_USE))?;
                let slot = &mut port.rtx[index];
                slot.flags = RtxFlags::IN_USE;
                slot.seq_num = seq_num;
                slot.seg_len = data_len as u16;
                slot.buf = Some(buf.clone());
                if !port.rtx_timeout_enable {
                    port.rtx_timeout = tick::current_system_tick().wrapping_add(TCP_RTO);
                    port.rtx_timeout_enable = true;
                    port.rtx_time = TCP_RTO;
                }
                Some(index)
            });
            match rtx_index {
                Some(index) => {
                    buf.fd.with_pool(|pool| {
                        pool.set_free_hook(
                            buf.list,
                            rtx_return_buffer,
                            ListFreeData {
                                fd: Arc::downgrade(fd),
                                index,
                            },
                        )
                    });
                }
                None => return Err(Error::NoRtxAvailable),
            }
        }
        Ok(())
    })();

    if let Err(e) = built {
        buf.fd.with_pool(|pool| pool.take_free_hook(buf.list));
        buf.free();
        if rtx_index.is_some() {
            with_port(fd, |port| {
                if let Some(index) = rtx_index {
                    port.rtx[index].flags = RtxFlags::empty();
                    port.rtx[index].buf = None;
                }
            });
        }
        return Err(e);
    }

    match ipv4::transmit(&buf, IP_PROTO_TCP, sa.local_ip, sa.foreign_ip, bflags) {
        Ok(Disposition::Free) => {
            if let Some(index) = rtx_index {
                // Driver is done with it: the buffer sits with the slot.
                with_port(fd, |port| {
                    port.rtx[index].flags.insert(RtxFlags::BUFFER_RETURNED)
                });
            } else {
                buf.fd.with_pool(|pool| pool.take_free_hook(buf.list));
                buf.free();
            }
        }
        Ok(Disposition::Consumed) => {}
        Err(e) => {
            buf.fd.with_pool(|pool| pool.take_free_hook(buf.list));
            buf.free();
            if let Some(index) = rtx_index {
                with_port(fd, |port| {
                    port.rtx[index].flags = RtxFlags::empty();
                    port.rtx[index].buf = None;
                });
            }
            return Err(e);
        }
    }

    if rtx_index.is_some() {
        timeout_update(fd);
    }
    Ok(())
}

/// RFC 793 §3.3 acceptability test, with the two zero-length edge cases.
fn check_sequence(seg_seq: u32, seg_len: u32, rcv_nxt: u32, rcv_wnd: u32) -> bool {
    let in_wnd = |seq: u32| {
        tick::int32cmp(rcv_nxt, seq) <= 0 && tick::int32cmp(seq, rcv_nxt.wrapping_add(rcv_wnd)) < 0
    };
    if rcv_wnd == 0 {
        seg_len == 0 && seg_seq == rcv_nxt
    } else if seg_len == 0 {
        in_wnd(seg_seq)
    } else {
        in_wnd(seg_seq) || in_wnd(seg_seq.wrapping_add(seg_len - 1))
    }
}

/// A segment send planned while the port lock is held and executed after
/// it drops.
struct SegPlan {
    sa: SocketAddress,
    seq: u32,
    ack: u32,
    flags: TcpHdrFlags,
    wnd: u16,
}

struct Plan {
    sends: Vec<SegPlan>,
    resume: u32,
    stop_timer: bool,
    disposition: Disposition,
    fast_rtx_seq: Option<u32>,
    update_timer: bool,
}

impl Plan {
    fn new() -> Self {
        Plan {
            sends: Vec::new(),
            resume: 0,
            stop_timer: false,
            disposition: Disposition::Free,
            fast_rtx_seq: None,
            update_timer: false,
        }
    }

    fn send(&mut self, sa: SocketAddress, seq: u32, ack: u32, flags: TcpHdrFlags, wnd: u16) {
        self.sends.push(SegPlan {
            sa,
            seq,
            ack,
            flags,
            wnd,
        });
    }
}

/// `RCV.NXT := FIN.SEQ + 1`, acknowledge the FIN, and account for our own
/// FIN going out with the ACK.
fn process_finbit(port: &mut TcpPort, plan: &mut Plan, fin_seq: u32) {
    port.rcv_nxt = fin_seq.wrapping_add(1);
    plan.send(
        port.sa,
        port.snd_nxt,
        port.rcv_nxt,
        TcpHdrFlags::ACK | TcpHdrFlags::FIN,
        port.wire_wnd(),
    );
    port.snd_nxt = port.snd_una.wrapping_add(1);
}

/// Merge an in-window data segment into the port's receive buffers.
/// In-order data lands in the primary RX buffer and drains the
/// out-of-order queue; anything else is held sorted by sequence, with
/// overlapping segments discarded outright.
fn rx_buffer_merge(
    port: &mut TcpPort,
    buf: &NetBuffer,
    seg_len: u32,
    seg_seq: u32,
    plan: &mut Plan,
) -> Result<Disposition> {
    // Drop everything except the TCP payload.
    buf.pull(None, buf.total_len() - seg_len as usize, BufFlags::empty())?;

    let mut disposition = Disposition::Free;
    let mut new_data = false;

    if seg_seq == port.rcv_nxt {
        match &port.rx_buffer {
            Some(rx) => {
                debug_assert!(rx.same_pool(buf));
                rx.fd
                    .with_pool(|pool| pool.list_move_data(rx.list, buf.list, BufFlags::empty()));
            }
            None => {
                port.rx_buffer = Some(buf.clone());
                disposition = Disposition::Consumed;
            }
        }
        port.rcv_nxt = seg_seq.wrapping_add(seg_len);

        // Drain the out-of-order queue while it continues the stream.
        while let Some(head) = port.oo_list.first() {
            let head_seq = head.peek_u32(0)?;
            if head_seq != port.rcv_nxt {
                break;
            }
            let head = port.oo_list.remove(0);
            head.pull(None, 4, BufFlags::empty())?;
            port.rcv_nxt = head_seq.wrapping_add(head.total_len() as u32);
            let rx = port.rx_buffer.as_ref().expect("primary RX buffer");
            rx.fd
                .with_pool(|pool| pool.list_move_data(rx.list, head.list, BufFlags::empty()));
            head.free();
        }
        // Whatever remains cannot continue the stream yet; the window
        // reopens, so let the peer resend into it.
        for stale in core::mem::take(&mut port.oo_list) {
            stale.free();
        }

        port.rcv_wnd = TCP_WND_SIZE;
        new_data = true;
    } else {
        // Sorted insert; any overlap with a queued segment discards the
        // newcomer (conservative, no coalescing).
        let mut insert_at = port.oo_list.len();
        let mut conflict = false;
        for (i, queued) in port.oo_list.iter().enumerate() {
            let queued_seq = queued.peek_u32(0)?;
            if tick::int32cmp(queued_seq, seg_seq) > 0 {
                if tick::int32cmp(seg_seq.wrapping_add(seg_len), queued_seq) >= 0 {
                    conflict = true;
                }
                insert_at = i;
                break;
            }
        }
        if !conflict {
            buf.push(&seg_seq.to_be_bytes(), BufFlags::HEAD)?;
            port.oo_list.insert(insert_at, buf.clone());
            disposition = Disposition::Consumed;
            port.rcv_wnd = port.rcv_wnd.wrapping_add(seg_len);
        }
    }

    if new_data {
        plan.resume |= FS_BLOCK_READ;
    }
    plan.send(
        port.sa,
        port.snd_nxt,
        port.rcv_nxt,
        TcpHdrFlags::ACK,
        port.wire_wnd(),
    );
    Ok(disposition)
}

fn find_port(sa: &SocketAddress) -> Option<FdRef> {
    PORTS.lock.obtain(None).ok()?;
    let result = {
        let list = PORTS.list.lock();
        let mut partial: Option<FdRef> = None;
        let mut exact: Option<FdRef> = None;
        for fd in list.iter() {
            with_port(fd, |port| {
                if port.sa == *sa {
                    exact = Some(fd.clone());
                } else if partial.is_none()
                    && port.sa.local_port == sa.local_port
                    && (port.sa.local_ip == sa.local_ip || port.sa.local_ip == 0)
                    && port.sa.foreign_ip == 0
                {
                    partial = Some(fd.clone());
                }
            });
            if exact.is_some() {
                break;
            }
        }
        exact.or(partial)
    };
    PORTS.lock.release();
    result
}

/// Process one inbound TCP segment (IPv4 header still on the buffer).
pub(crate) fn process_segment(
    buf: &NetBuffer,
    ihl: usize,
    iface_addr: u32,
    src_ip: u32,
    dst_ip: u32,
) -> Result<Disposition> {
    let total = buf.total_len();
    if total - ihl < TCP_HDR_SIZE {
        return Err(Error::InvalidHeader);
    }
    if csum::net_pseudo_csum_calculate(buf, src_ip, dst_ip, IP_PROTO_TCP, (total - ihl) as u16, ihl)?
        != 0
    {
        return Err(Error::InvalidChecksum);
    }

    let foreign_port = buf.peek_u16(ihl + SRC_PORT_OFFSET)?;
    let local_port = buf.peek_u16(ihl + DST_PORT_OFFSET)?;
    let seg_seq = buf.peek_u32(ihl + SEQ_NUM_OFFSET)?;
    let seg_ack = buf.peek_u32(ihl + ACK_NUM_OFFSET)?;
    let flags_word = buf.peek_u16(ihl + FLAGS_OFFSET)?;
    let seg_wnd = buf.peek_u16(ihl + WND_SIZE_OFFSET)?;

    let data_off = (((flags_word & HDR_LEN_MASK) >> HDR_LEN_SHIFT) as usize) * 4;
    if data_off < TCP_HDR_SIZE || ihl + data_off > total {
        return Err(Error::InvalidHeader);
    }
    let seg_len = (total - ihl - data_off) as u32;
    let hdr = TcpHdrFlags::from_bits_truncate(flags_word & !HDR_LEN_MASK);

    let sa = SocketAddress {
        local_ip: dst_ip,
        local_port,
        foreign_ip: src_ip,
        foreign_port,
    };

    let Some(fd) = find_port(&sa) else {
        if iface_addr == dst_ip {
            return Err(Error::DstPortUnreachable);
        }
        return Ok(Disposition::Free);
    };

    let mut plan = Plan::new();
    let mut disposition = Disposition::Free;

    let threshold_locked = buffer::threshold_locked(&buf.fd);

    with_port(&fd, |port| -> Result<()> {
        // The advertised window rides on every segment.
        port.snd_wnd = (seg_wnd as u32) << port.snd_wnd_scale;

        match port.state {
            TcpState::Closed => {}

            TcpState::Listen => {
                if hdr.contains(TcpHdrFlags::RST) {
                    // Ignored.
                } else if hdr.contains(TcpHdrFlags::ACK) {
                    plan.send(sa, seg_ack, 0, TcpHdrFlags::RST, port.wire_wnd());
                } else if hdr.contains(TcpHdrFlags::SYN) {
                    if !threshold_locked {
                        port.backlog.push_back(buf.clone());
                        disposition = Disposition::Consumed;
                        plan.resume |= FS_BLOCK_READ;
                    } else {
                        return Err(Error::Threshold);
                    }
                }
            }

            TcpState::SynSent => {
                if hdr.contains(TcpHdrFlags::ACK) {
                    let ack_ok = tick::int32cmp(seg_ack, port.snd_una) >= 0
                        && tick::int32cmp(seg_ack, port.snd_nxt) <= 0;
                    if !ack_ok {
                        plan.send(port.sa, port.snd_nxt, 0, TcpHdrFlags::RST, port.wire_wnd());
                    } else if hdr.contains(TcpHdrFlags::RST) {
                        port.state = TcpState::Closed;
                        plan.stop_timer = true;
                        plan.resume |= FS_BLOCK_READ;
                    } else if hdr.contains(TcpHdrFlags::SYN) && seg_ack == port.snd_nxt {
                        port.opt_flags &= TcpOptFlags::WND_SCALE;
                        let opt_res = process_options(
                            buf,
                            port,
                            ihl + TCP_HDR_SIZE,
                            data_off - TCP_HDR_SIZE,
                        );
                        match opt_res {
                            Ok(()) => {
                                if !port.opt_flags.contains(TcpOptFlags::WND_SCALE) {
                                    port.snd_wnd_scale = 0;
                                    port.rcv_wnd_scale = 0;
                                }
                                port.rcv_nxt = seg_seq.wrapping_add(1);
                                port.snd_una = seg_ack;
                                port.nacks = 0;
                                // The SYN this ACKs no longer needs its slot.
                                rtx_process_ack(port, seg_ack);
                                plan.send(
                                    port.sa,
                                    port.snd_nxt,
                                    port.rcv_nxt,
                                    TcpHdrFlags::ACK,
                                    port.wire_wnd(),
                                );
                                port.state = TcpState::Estab;
                                if port.snd_wnd > 0 {
                                    plan.resume |= FS_BLOCK_WRITE;
                                }
                            }
                            Err(_) => {
                                plan.send(sa, seg_ack, 0, TcpHdrFlags::RST, port.wire_wnd());
                                port.state = TcpState::Closed;
                            }
                        }
                        plan.stop_timer = true;
                        plan.resume |= FS_BLOCK_READ;
                    }
                }
            }

            TcpState::SynRcvd
            | TcpState::Estab
            | TcpState::LastAck
            | TcpState::FinWait1
            | TcpState::FinWait2
            | TcpState::Closing
            | TcpState::TimeWait => {
                if !check_sequence(seg_seq, seg_len, port.rcv_nxt, port.rcv_wnd) {
                    if !hdr.contains(TcpHdrFlags::RST) {
                        plan.send(
                            port.sa,
                            port.snd_nxt,
                            port.rcv_nxt,
                            TcpHdrFlags::ACK,
                            port.wire_wnd(),
                        );
                    }
                } else if hdr.contains(TcpHdrFlags::RST) {
                    port.state = TcpState::Closed;
                    plan.stop_timer = true;
                    plan.resume |= FS_BLOCK_READ | FS_BLOCK_WRITE;
                } else if hdr.contains(TcpHdrFlags::SYN) {
                    plan.send(port.sa, port.snd_nxt, 0, TcpHdrFlags::RST, port.wire_wnd());
                    port.state = TcpState::Closed;
                    plan.stop_timer = true;
                    plan.resume |= FS_BLOCK_READ | FS_BLOCK_WRITE;
                } else if hdr.contains(TcpHdrFlags::ACK) {
                    match port.state {
                        TcpState::SynRcvd => {
                            if tick::int32cmp(port.snd_una, seg_ack) <= 0
                                && tick::int32cmp(seg_ack, port.snd_nxt) <= 0
                            {
                                port.state = TcpState::Estab;
                                port.snd_una = seg_ack;
                                port.nacks = 0;
                                // The SYN-ACK this ACKs no longer needs
                                // its slot.
                                rtx_process_ack(port, seg_ack);
                                // Scale only takes effect if the peer
                                // offered it on its SYN.
                                if port.opt_flags.contains(TcpOptFlags::WND_SCALE) {
                                    port.rcv_wnd_scale = TCP_WND_SCALE;
                                } else {
                                    port.rcv_wnd_scale = 0;
                                    port.snd_wnd_scale = 0;
                                }
                                plan.stop_timer = true;
                                plan.resume |= FS_BLOCK_READ;
                                if port.snd_wnd > 0 {
                                    plan.resume |= FS_BLOCK_WRITE;
                                }
                            } else if hdr.contains(TcpHdrFlags::FIN) {
                                process_finbit(port, &mut plan, seg_seq);
                                port.state = TcpState::LastAck;
                                plan.resume |= FS_BLOCK_READ | FS_BLOCK_WRITE;
                            } else {
                                plan.send(
                                    port.sa,
                                    port.snd_nxt,
                                    0,
                                    TcpHdrFlags::RST,
                                    port.wire_wnd(),
                                );
                                port.state = TcpState::Closed;
                                plan.stop_timer = true;
                                plan.resume |= FS_BLOCK_READ | FS_BLOCK_WRITE;
                            }
                        }

                        TcpState::Estab | TcpState::FinWait1 | TcpState::FinWait2 => {
                            let mut invalid_ack = false;

                            if tick::int32cmp(port.snd_una, seg_ack) < 0
                                && tick::int32cmp(seg_ack, port.snd_nxt) <= 0
                            {
                                port.snd_una = seg_ack;
                                port.nacks = 0;
                                if rtx_process_ack(port, seg_ack) && port.snd_wnd > 0 {
                                    plan.resume |= FS_BLOCK_WRITE;
                                }
                                plan.update_timer = true;
                            } else if port.state == TcpState::Estab {
                                if port.snd_una == seg_ack {
                                    if port.nacks < 3 {
                                        port.nacks += 1;
                                    }
                                    if port.nacks == 3 {
                                        plan.fast_rtx_seq = Some(seg_ack);
                                    }
                                } else {
                                    invalid_ack = true;
                                }
                            }

                            if !invalid_ack {
                                if seg_len > 0 {
                                    disposition =
                                        rx_buffer_merge(port, buf, seg_len, seg_seq, &mut plan)?;
                                }

                                match port.state {
                                    TcpState::Estab => {
                                        if hdr.contains(TcpHdrFlags::FIN) {
                                            process_finbit(
                                                port,
                                                &mut plan,
                                                seg_seq.wrapping_add(seg_len),
                                            );
                                            port.state = TcpState::LastAck;
                                            plan.resume |= FS_BLOCK_READ | FS_BLOCK_WRITE;
                                        }
                                    }
                                    TcpState::FinWait1 => {
                                        if seg_ack == port.snd_nxt {
                                            if hdr.contains(TcpHdrFlags::FIN) {
                                                process_finbit(
                                                    port,
                                                    &mut plan,
                                                    seg_seq.wrapping_add(seg_len),
                                                );
                                                port.event_timeout = tick::current_system_tick()
                                                    .wrapping_add(2 * TCP_MSL);
                                                port.event_timeout_enable = true;
                                                plan.update_timer = true;
                                                port.state = TcpState::TimeWait;
                                            } else {
                                                port.state = TcpState::FinWait2;
                                            }
                                        } else if hdr.contains(TcpHdrFlags::FIN) {
                                            process_finbit(
                                                port,
                                                &mut plan,
                                                seg_seq.wrapping_add(seg_len),
                                            );
                                            port.state = TcpState::Closing;
                                        }
                                    }
                                    TcpState::FinWait2 => {
                                        if hdr.contains(TcpHdrFlags::FIN) {
                                            process_finbit(
                                                port,
                                                &mut plan,
                                                seg_seq.wrapping_add(seg_len),
                                            );
                                            port.event_timeout = tick::current_system_tick()
                                                .wrapping_add(2 * TCP_MSL);
                                            port.event_timeout_enable = true;
                                            plan.update_timer = true;
                                            port.state = TcpState::TimeWait;
                                        }
                                    }
                                    _ => {}
                                }
                            }
                        }

                        TcpState::LastAck | TcpState::Closing | TcpState::TimeWait => {
                            if tick::int32cmp(port.snd_una, seg_ack) < 0
                                && tick::int32cmp(seg_ack, port.snd_nxt) <= 0
                                && seg_ack == port.snd_nxt
                            {
                                match port.state {
                                    TcpState::LastAck => {
                                        port.state = TcpState::Closed;
                                        plan.stop_timer = true;
                                        plan.resume |= FS_BLOCK_READ | FS_BLOCK_WRITE;
                                    }
                                    TcpState::Closing | TcpState::TimeWait => {
                                        port.event_timeout = tick::current_system_tick()
                                            .wrapping_add(2 * TCP_MSL);
                                        port.event_timeout_enable = true;
                                        plan.update_timer = true;
                                        port.state = TcpState::TimeWait;
                                    }
                                    _ => {}
                                }
                            }
                        }

                        _ => {}
                    }
                }
            }
        }

        if plan.stop_timer {
            port.event_timeout_enable = false;
            port.rtx_timeout_enable = false;
        }
        Ok(())
    })?;

    // Lock released: execute the plan.
    if plan.stop_timer || plan.update_timer {
        timeout_update(&fd);
    }
    if let Some(seq) = plan.fast_rtx_seq {
        fast_rtx(&fd, seq);
    }
    for seg in &plan.sends {
        let _ = tcp_send_segment(
            &fd,
            &seg.sa,
            seg.seq,
            seg.ack,
            seg.flags,
            seg.wnd,
            None,
            false,
            BufFlags::TH,
        );
    }
    if plan.resume != 0 {
        resume_socket(&fd, plan.resume);
    }

    Ok(disposition)
}

// Application API.

/// Actively open a connection to the port's foreign address.
pub fn tcp_connect(fd: &FdRef) -> Result<()> {
    let sa = with_port(fd, |port| port.sa);
    let net_device = ipv4::get_source_device(sa.local_ip).ok_or(Error::InvalidFd)?;

    let iss = TCP_ISS.load(Ordering::SeqCst).wrapping_add(1);
    let wnd = with_port(fd, |port| {
        if port.state != TcpState::Closed {
            return None;
        }
        port.snd_una = iss;
        port.snd_nxt = iss.wrapping_add(1);
        port.mss = ((net_device.mtu - (IPV4_HDR_SIZE + TCP_HDR_SIZE)) as u32).min(TCP_WND_SIZE) as u16;
        port.initialize();
        Some(port.wire_wnd())
    });
    let Some(wnd) = wnd else {
        return Err(Error::NoAction);
    };

    tcp_send_segment(
        fd,
        &sa,
        iss,
        0,
        TcpHdrFlags::SYN,
        wnd,
        None,
        true,
        BufFlags::TH | BufFlags::SUSPEND,
    )?;
    with_port(fd, |port| port.state = TcpState::SynSent);

    loop {
        let state = with_port(fd, |port| port.state);
        match state {
            TcpState::SynSent => {
                tcp_port_wait(fd, FS_BLOCK_READ)?;
                fd.data_flushed();
            }
            TcpState::Estab => return Ok(()),
            _ => return Err(Error::Refused),
        }
    }
}

/// Accept one connection on a listening port. The client port carries the
/// new session; caller registers it beforehand.
pub fn tcp_accept(server_fd: &FdRef, client_fd: &FdRef) -> Result<()> {
    tcp_port_wait(server_fd, FS_BLOCK_READ)?;

    let (maybe_buf, drained, state, server_snd_wnd, server_snd_wnd_scale) =
        with_port(server_fd, |port| {
            let buf = port.backlog.pop_front();
            (
                buf,
                port.backlog.is_empty(),
                port.state,
                port.snd_wnd,
                port.snd_wnd_scale,
            )
        });
    let Some(buf) = maybe_buf else {
        if state == TcpState::Closed {
            return Err(Error::Closed);
        }
        return Err(Error::NoAction);
    };
    if drained {
        server_fd.data_flushed();
    }

    let result = (|| -> Result<()> {
        let inner_ihl = (((buf.peek_u8(0)?) & 0x0F) as usize) << 2;
        let flags_word = buf.peek_u16(inner_ihl + FLAGS_OFFSET)?;
        let data_off = (((flags_word & HDR_LEN_MASK) >> HDR_LEN_SHIFT) as usize) * 4;

        let mtu = device::get_mtu(&buf.fd)?;
        let (iss, rcv_nxt, client_sa, wnd) = {
            let foreign_ip = buf.peek_u32(12)?;
            let local_ip = buf.peek_u32(16)?;
            let foreign_port = buf.peek_u16(inner_ihl + SRC_PORT_OFFSET)?;
            let local_port = buf.peek_u16(inner_ihl + DST_PORT_OFFSET)?;
            let irs = buf.peek_u32(inner_ihl + SEQ_NUM_OFFSET)?;

            with_port(client_fd, |port| -> Result<_> {
                port.mss =
                    ((mtu - (IPV4_HDR_SIZE + TCP_HDR_SIZE)) as u32).min(TCP_WND_SIZE) as u16;
                port.initialize();
                port.opt_flags = TcpOptFlags::empty();
                Ok(())
            })?;
            with_port(client_fd, |port| {
                process_options(&buf, port, inner_ihl + TCP_HDR_SIZE, data_off - TCP_HDR_SIZE)
            })?;

            with_port(client_fd, |port| {
                port.sa = SocketAddress {
                    local_ip,
                    local_port,
                    foreign_ip,
                    foreign_port,
                };
                port.rcv_nxt = irs.wrapping_add(1);
                let iss = TCP_ISS.load(Ordering::SeqCst).wrapping_add(1);
                port.snd_nxt = iss.wrapping_add(1);
                port.snd_una = iss;
                port.state = TcpState::SynRcvd;
                port.snd_wnd = server_snd_wnd;
                port.snd_wnd_scale = server_snd_wnd_scale;
                (iss, port.rcv_nxt, port.sa, port.wire_wnd())
            })
        };

        tcp_send_segment(
            client_fd,
            &client_sa,
            iss,
            rcv_nxt,
            TcpHdrFlags::SYN | TcpHdrFlags::ACK,
            wnd,
            None,
            true,
            BufFlags::TH | BufFlags::SUSPEND,
        )
    })();

    buf.free();
    result?;

    // Wait for the handshake to finish on the client port.
    loop {
        let state = with_port(client_fd, |port| port.state);
        match state {
            TcpState::SynRcvd => {
                tcp_port_wait(client_fd, FS_BLOCK_READ)?;
                client_fd.data_flushed();
            }
            TcpState::Estab => {
                let wnd = with_port(client_fd, |port| port.snd_wnd);
                if wnd > 0 {
                    client_fd.space_available();
                }
                return Ok(());
            }
            _ => return Err(Error::Refused),
        }
    }
}

/// Close a port: FIN handshake from ESTAB, instant close from
/// LISTEN/SYN_SENT. Blocks until the port reaches CLOSED, then wakes
/// every reader and writer with `Closed`.
pub fn tcp_close(fd: &FdRef) {
    let state = with_port(fd, |port| port.state);
    let mut status = Ok(());

    match state {
        TcpState::Listen | TcpState::SynSent => {
            with_port(fd, |port| port.state = TcpState::Closed);
        }
        TcpState::SynRcvd | TcpState::Estab => {
            // All queued sends must drain before the FIN goes out.
            status = tcp_port_wait(fd, FS_BLOCK_WRITE);
            if status.is_ok() {
                let (sa, seq, ack, wnd) = with_port(fd, |port| {
                    (port.sa, port.snd_nxt, port.rcv_nxt, port.wire_wnd())
                });
                status = tcp_send_segment(
                    fd,
                    &sa,
                    seq,
                    ack,
                    TcpHdrFlags::FIN | TcpHdrFlags::ACK,
                    wnd,
                    None,
                    true,
                    BufFlags::TH | BufFlags::SUSPEND,
                );
            }
            if status.is_ok() {
                with_port(fd, |port| {
                    port.snd_nxt = port.snd_nxt.wrapping_add(1);
                    port.state = TcpState::FinWait1;
                });
            }
        }
        _ => {}
    }

    while status.is_ok() {
        let state = with_port(fd, |port| port.state);
        if state == TcpState::Closed {
            break;
        }
        status = tcp_port_wait(fd, FS_BLOCK_READ);
        if status.is_ok() {
            fd.data_flushed();
        }
    }

    if status.is_ok() {
        rtx_free_all(fd);
    }
    // Leave the port readable and writable so later calls reach the
    // vtable and report the closed state, and hand waiting callers the
    // error directly.
    fd.set_flag(FdFlags::DATA_AVAILABLE | FdFlags::SPACE_AVAILABLE);
    fd.resume_all(Err(Error::Closed));
}

fn tcp_read_data(fd: &FdRef, out: &mut [u8]) -> Result<usize> {
    let (rx, state) = with_port(fd, |port| (port.rx_buffer.take(), port.state));

    let Some(rx) = rx else {
        fd.data_flushed();
        if state != TcpState::Estab {
            return Err(Error::Closed);
        }
        return Ok(0);
    };

    let available = rx.total_len();
    let n = available.min(out.len());
    rx.pull(Some(&mut out[..n]), n, BufFlags::empty())?;

    if rx.total_len() != 0 {
        with_port(fd, |port| {
            debug_assert!(port.rx_buffer.is_none());
            port.rx_buffer = Some(rx);
        });
        fd.data_available();
    } else {
        rx.free();
        if state != TcpState::Estab {
            // Keep the closed state readable so the next read reports it.
            fd.data_available();
        } else {
            fd.data_flushed();
        }
    }
    Ok(n)
}

fn tcp_write_data(fd: &FdRef, data: &[u8]) -> Result<usize> {
    let mut sent = 0usize;
    let mut rest = data;

    loop {
        let (state, sa, snd_nxt, rcv_nxt, snd_wnd, mss, wnd) = with_port(fd, |port| {
            (
                port.state,
                port.sa,
                port.snd_nxt,
                port.rcv_nxt,
                port.snd_wnd,
                port.mss,
                port.wire_wnd(),
            )
        });
        if state != TcpState::Estab {
            return Err(Error::Closed);
        }
        if rest.is_empty() {
            break;
        }
        if snd_wnd == 0 || mss == 0 {
            fd.space_consumed();
            break;
        }

        let nbytes = rest.len().min(mss as usize).min(snd_wnd as usize);
        tcp_send_segment(
            fd,
            &sa,
            snd_nxt,
            rcv_nxt,
            TcpHdrFlags::ACK,
            wnd,
            Some(&rest[..nbytes]),
            true,
            BufFlags::TH | BufFlags::SUSPEND,
        )?;

        let still_open = with_port(fd, |port| {
            if port.state != TcpState::Estab {
                return false;
            }
            port.snd_nxt = port.snd_nxt.wrapping_add(nbytes as u32);
            port.snd_wnd = port.snd_wnd.saturating_sub(nbytes as u32);
            true
        });
        if !still_open {
            return Err(Error::Closed);
        }

        sent += nbytes;
        rest = &rest[nbytes..];

        let wnd_now = with_port(fd, |port| port.snd_wnd);
        if wnd_now == 0 {
            fd.space_consumed();
        }
    }

    Ok(sent)
}

impl TcpPort {
    /// Number of retransmission slots currently held.
    pub fn rtx_slots_in_use(&self) -> usize {
        self.rtx
            .iter()
            .filter(|s| s.flags.contains(RtxFlags::IN_USE))
            .count()
    }

    /// `(seq, len, buffer_returned)` of slot `i`, if held.
    pub fn rtx_slot(&self, i: usize) -> Option<(u32, u16, bool)> {
        let slot = self.rtx.get(i)?;
        slot.flags.contains(RtxFlags::IN_USE).then_some((
            slot.seq_num,
            slot.seg_len,
            slot.flags.contains(RtxFlags::BUFFER_RETURNED),
        ))
    }

    /// Current retransmission backoff interval.
    pub fn rtx_backoff(&self) -> Tick {
        self.rtx_time
    }

    /// `(enabled, deadline)` of the event timer (TIME_WAIT).
    pub fn event_timer(&self) -> (bool, Tick) {
        (self.event_timeout_enable, self.event_timeout)
    }

    pub fn oo_queue_len(&self) -> usize {
        self.oo_list.len()
    }

    pub fn backlog_len(&self) -> usize {
        self.backlog.len()
    }
}

/// Read-only view of a port's protocol state (diagnostics, tests).
pub fn inspect<R>(fd: &FdRef, f: impl FnOnce(&TcpPort) -> R) -> R {
    with_port(fd, |port| f(port))
}

pub fn state_of(fd: &FdRef) -> TcpState {
    with_port(fd, |port| port.state)
}

/// Seed the ISS generator (boot code, deterministic test setups).
pub fn set_iss(v: u32) {
    TCP_ISS.store(v, Ordering::SeqCst);
}

#[doc(hidden)]
pub fn reset() {
    PORTS.list.lock().clear();
    TCP_ISS.store(0, Ordering::SeqCst);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_check_sequence_rfc793() {
        // Zero window accepts only a zero-length probe at RCV.NXT.
        assert!(check_sequence(1000, 0, 1000, 0));
        assert!(!check_sequence(1001, 0, 1000, 0));
        assert!(!check_sequence(1000, 1, 1000, 0));

        // Open window: either edge may fall inside.
        assert!(check_sequence(1000, 100, 1000, 500));
        assert!(check_sequence(999, 2, 1000, 500));
        assert!(!check_sequence(998, 1, 1000, 500));
        assert!(!check_sequence(1500, 1, 1000, 500));

        // Wrap-around.
        assert!(check_sequence(u32::MAX - 1, 10, u32::MAX - 1, 500));
    }

    #[test]
    fn test_header_flags_word() {
        let flags = TcpHdrFlags::SYN | TcpHdrFlags::ACK;
        let word = flags.bits() | (((TCP_HDR_SIZE as u16) << (HDR_LEN_SHIFT - 2)) & HDR_LEN_MASK);
        assert_eq!(word & 0x0FFF, 0x0012);
        assert_eq!((word & HDR_LEN_MASK) >> HDR_LEN_SHIFT, 5);
    }
}
