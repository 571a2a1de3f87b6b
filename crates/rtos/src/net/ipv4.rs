//! IPv4: receive validation, per-device fragment reassembly, transmit
//! fragmentation.

use alloc::sync::{Arc, Weak};
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU16, Ordering};

use bitflags::bitflags;

use crate::config::{IPV4_FRAG_DROP_TIMEOUT, IPV4_FRAG_TIMEOUT, IPV4_NUM_FRAGMENTS};
use crate::fs::buffer::{self, BufFlags};
use crate::fs::FdRef;
use crate::kernel::tick::{self, Tick};
use crate::net::device::{self, NetDevice};
use crate::net::{condition, csum, route, tcp, NetBuffer, IPV4_ADDR_UNSPEC};
use crate::net::{IP_PROTO_ICMP, IP_PROTO_TCP, IP_PROTO_UDP};
use crate::status::{Disposition, Error, Result};

pub const IPV4_HDR_SIZE: usize = 20;

const VER_IHL_OFFSET: usize = 0;
const LENGTH_OFFSET: usize = 2;
const ID_OFFSET: usize = 4;
const FLAG_FRAG_OFFSET: usize = 6;
const PROTO_OFFSET: usize = 9;
const CSUM_OFFSET: usize = 10;
const SRC_OFFSET: usize = 12;
const DST_OFFSET: usize = 16;

const VER_MASK: u8 = 0xF0;
const VER: u8 = 0x40;
const IHL_MASK: u8 = 0x0F;

/// More-fragments bit and the 13-bit offset (in 8-octet units).
pub const FLAG_MF: u16 = 0x2000;
pub const FRAG_MASK: u16 = 0x1FFF;

const DEFAULT_TTL: u8 = 128;

static NEXT_ID: AtomicU16 = AtomicU16::new(0);

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    struct FragFlags: u8 {
        const IN_USE = 1 << 0;
        const HAVE_FIRST = 1 << 1;
        const LAST_RCVD = 1 << 2;
        const DROP = 1 << 3;
    }
}

struct FragSlot {
    flags: FragFlags,
    sa: u32,
    id: u16,
    timeout: Tick,
    /// Parked fragments (with IP headers), sorted by fragment offset.
    frags: Vec<NetBuffer>,
}

impl FragSlot {
    fn new() -> Self {
        FragSlot {
            flags: FragFlags::empty(),
            sa: 0,
            id: 0,
            timeout: 0,
            frags: Vec::new(),
        }
    }

    fn clear(&mut self) -> Vec<NetBuffer> {
        self.flags = FragFlags::empty();
        self.sa = 0;
        self.id = 0;
        self.timeout = 0;
        core::mem::take(&mut self.frags)
    }
}

/// Per-device IPv4 state.
pub struct Ipv4Device {
    pub address: u32,
    pub subnet: u32,
    fragments: Vec<FragSlot>,
    timer: Option<usize>,
}

impl Ipv4Device {
    pub(crate) fn new() -> Self {
        Ipv4Device {
            address: IPV4_ADDR_UNSPEC,
            subnet: 0,
            fragments: (0..IPV4_NUM_FRAGMENTS).map(|_| FragSlot::new()).collect(),
            timer: None,
        }
    }
}

/// Assign a device's IPv4 address and insert its host route.
pub fn set_device_address(fd: &FdRef, address: u32, subnet: u32) -> Result<()> {
    let dev = device::for_fd(fd).ok_or(Error::InvalidFd)?;
    {
        let mut ip = dev.ipv4.lock();
        ip.address = address;
        ip.subnet = subnet;
    }
    route::add(route::Route {
        interface: Arc::downgrade(fd),
        destination: address,
        gateway: 0,
        source: address,
        subnet_mask: subnet,
        metric: 0,
    })
}

/// Read back a device's IPv4 address and subnet.
pub fn get_device_address(fd: &FdRef) -> Result<(u32, u32)> {
    let dev = device::for_fd(fd).ok_or(Error::InvalidFd)?;
    Ok(dev.ipv4_address())
}

/// Device whose assigned address equals `address`.
pub fn get_source_device(address: u32) -> Option<Arc<NetDevice>> {
    device::devices()
        .into_iter()
        .find(|d| d.ipv4_address().0 == address)
}

/// Process a received IPv4 packet (link header already stripped).
pub fn process(dev: &Arc<NetDevice>, buf: &NetBuffer, broadcast: bool) -> Result<Disposition> {
    if buf.total_len() < 1 {
        return Err(Error::InvalidHeader);
    }
    let ver_ihl = buf.peek_u8(VER_IHL_OFFSET)?;
    if ver_ihl & VER_MASK != VER {
        return Err(Error::InvalidHeader);
    }
    let ihl = ((ver_ihl & IHL_MASK) as usize) << 2;
    if ihl < IPV4_HDR_SIZE || buf.total_len() < ihl {
        return Err(Error::InvalidHeader);
    }
    if csum::net_csum_calculate(buf, 0, ihl)? != 0 {
        return Err(Error::InvalidChecksum);
    }

    let flag_offset = buf.peek_u16(FLAG_FRAG_OFFSET)?;
    let ip_dst = buf.peek_u32(DST_OFFSET)?;
    let (dev_addr, _subnet) = dev.ipv4_address();
    let ip_iface = if dev_addr != IPV4_ADDR_UNSPEC {
        dev_addr
    } else {
        ip_dst
    };

    let ip_length = buf.peek_u16(LENGTH_OFFSET)? as usize;
    if ip_length < buf.total_len() {
        // Ethernet minimum-frame padding past the datagram.
        buf.pull(None, buf.total_len() - ip_length, BufFlags::TAIL)?;
    } else if ip_length > buf.total_len() {
        return Err(Error::InvalidHeader);
    }

    if flag_offset & FLAG_MF != 0 || flag_offset & FRAG_MASK != 0 {
        // Broadcast and multicast packets cannot be fragmented; only
        // reassemble what is addressed to us.
        if !broadcast && ip_iface != IPV4_ADDR_UNSPEC && ip_dst == ip_iface {
            fragment_add(dev, buf, flag_offset)?;
        } else {
            return Err(Error::NoAction);
        }
    }

    let proto = buf.peek_u8(PROTO_OFFSET)?;
    let ip_src = buf.peek_u32(SRC_OFFSET)?;

    match proto {
        IP_PROTO_TCP => tcp::process_segment(buf, ihl, ip_iface, ip_src, ip_dst),
        // ICMP and UDP handlers are external collaborators; their
        // contract here is only the dispatch seam.
        IP_PROTO_ICMP | IP_PROTO_UDP => Err(Error::UnknownProto),
        _ => {
            if ip_dst == ip_iface {
                Err(Error::UnknownProto)
            } else {
                Err(Error::DstUnreachable)
            }
        }
    }
}

fn frag_offset_of(buf: &NetBuffer) -> Result<u16> {
    Ok(buf.peek_u16(FLAG_FRAG_OFFSET)? & FRAG_MASK)
}

fn ihl_of(buf: &NetBuffer) -> Result<usize> {
    Ok(((buf.peek_u8(VER_IHL_OFFSET)? & IHL_MASK) as usize) << 2)
}

/// Add one received fragment. On completion the reassembled datagram is
/// moved back into `buf` and `Ok` returned so dispatch can continue;
/// `NoAction` means the fragment was parked (or dropped) and `buf` is
/// left empty for the caller to free.
fn fragment_add(dev: &Arc<NetDevice>, buf: &NetBuffer, flag_offset: u16) -> Result<()> {
    let id = buf.peek_u16(ID_OFFSET)?;
    let sa = buf.peek_u32(SRC_OFFSET)?;

    let mut ip = dev.ipv4.lock();
    let timer = ip.timer;

    let slot_index = {
        let mut free = None;
        let mut found = None;
        for (i, slot) in ip.fragments.iter().enumerate() {
            if !slot.flags.contains(FragFlags::IN_USE) {
                if free.is_none() {
                    free = Some(i);
                }
            } else if slot.sa == sa && slot.id == id {
                found = Some(i);
                break;
            }
        }
        found.or(free).ok_or(Error::BufferNoSpace)?
    };

    if buffer::threshold_locked(&buf.fd) {
        // Once fragments start being dropped no flow in flight can ever
        // complete; drop them all promptly to free buffers.
        let now = tick::current_system_tick();
        let mut to_free = Vec::new();
        for slot in ip.fragments.iter_mut() {
            if slot.flags.contains(FragFlags::IN_USE) {
                to_free.append(&mut slot.frags);
                slot.flags.insert(FragFlags::DROP);
                slot.timeout = now.wrapping_add(IPV4_FRAG_DROP_TIMEOUT);
            }
        }
        update_timer(&mut ip, timer);
        drop(ip);
        for frag in to_free {
            frag.free();
        }
        return Err(Error::Threshold);
    }

    if ip.fragments[slot_index].flags.contains(FragFlags::DROP) {
        return Err(Error::BufferNoSpace);
    }

    let parked_list = buf.fd.with_pool(|pool| pool.get_list(BufFlags::TH))?;
    let parked = NetBuffer::new(buf.fd.clone(), parked_list);
    buf.fd
        .with_pool(|pool| pool.list_move_data(parked.list, buf.list, BufFlags::empty()));

    {
        let slot = &mut ip.fragments[slot_index];
        if !slot.flags.contains(FragFlags::IN_USE) {
            slot.flags.insert(FragFlags::IN_USE);
            slot.id = id;
            slot.sa = sa;
            slot.timeout = tick::current_system_tick().wrapping_add(IPV4_FRAG_TIMEOUT);
        }
    }
    update_timer(&mut ip, timer);

    // Offset-sorted insert.
    let new_offset = flag_offset & FRAG_MASK;
    {
        let slot = &mut ip.fragments[slot_index];
        let mut at = slot.frags.len();
        for (i, frag) in slot.frags.iter().enumerate() {
            if frag_offset_of(frag)? >= new_offset {
                at = i;
                break;
            }
        }
        slot.frags.insert(at, parked);

        if new_offset == 0 {
            slot.flags.insert(FragFlags::HAVE_FIRST);
        }
        if flag_offset & FLAG_MF == 0 {
            slot.flags.insert(FragFlags::LAST_RCVD);
        }
    }

    let merged = fragment_merge(&mut ip.fragments[slot_index], buf)?;
    if merged {
        ip.fragments[slot_index].clear();
        update_timer(&mut ip, timer);
        Ok(())
    } else {
        Err(Error::NoAction)
    }
}

/// Merge contiguous runs in place; when first and last are present and no
/// holes remain, move the reassembled datagram into `out` and report
/// completion.
fn fragment_merge(slot: &mut FragSlot, out: &NetBuffer) -> Result<bool> {
    let mut complete = true;
    let mut i = 0;

    while i + 1 < slot.frags.len() {
        let last = &slot.frags[i];
        let expected =
            frag_offset_of(last)? + (((last.total_len() - ihl_of(last)?) >> 3) as u16);
        let cur = &slot.frags[i + 1];
        if frag_offset_of(cur)? == expected {
            // Contiguous: strip the inner IP header and concatenate.
            let inner_ihl = ihl_of(cur)?;
            cur.pull(None, inner_ihl, BufFlags::empty())?;
            let cur = slot.frags.remove(i + 1);
            let last = &slot.frags[i];
            last.fd
                .with_pool(|pool| pool.list_move_data(last.list, cur.list, BufFlags::empty()));
            cur.free();
        } else {
            complete = false;
            i += 1;
        }
    }

    if complete
        && slot.flags.contains(FragFlags::HAVE_FIRST)
        && slot.flags.contains(FragFlags::LAST_RCVD)
        && slot.frags.len() == 1
    {
        let whole = slot.frags.remove(0);
        out.fd
            .with_pool(|pool| pool.list_move_data(out.list, whole.list, BufFlags::empty()));
        whole.free();
        return Ok(true);
    }
    Ok(false)
}

fn update_timer(ip: &mut Ipv4Device, timer: Option<usize>) {
    let next = ip
        .fragments
        .iter()
        .filter(|s| s.flags.contains(FragFlags::IN_USE) || s.flags.contains(FragFlags::DROP))
        .map(|s| s.timeout)
        .min_by(|a, b| tick::int32cmp(*a, *b).cmp(&0));
    if let Some(timer) = timer {
        condition::set_timeout(timer, next);
        condition::updated();
    }
}

/// Register the fragment table's expiry timer with the network task.
pub(crate) fn fragment_init(dev: &Arc<NetDevice>) {
    let weak: Weak<NetDevice> = Arc::downgrade(dev);
    let handle = condition::add(
        None,
        alloc::boxed::Box::new(move |_status| {
            if let Some(dev) = weak.upgrade() {
                fragment_expired(&dev);
            }
        }),
    );
    dev.ipv4.lock().timer = Some(handle);
}

fn fragment_expired(dev: &Arc<NetDevice>) {
    let now = tick::current_system_tick();
    let mut to_free = Vec::new();
    {
        let mut ip = dev.ipv4.lock();
        let timer = ip.timer;
        for slot in ip.fragments.iter_mut() {
            let armed = slot.flags.contains(FragFlags::IN_USE) || slot.flags.contains(FragFlags::DROP);
            if armed && tick::int32cmp(now, slot.timeout) >= 0 {
                to_free.append(&mut slot.clear());
            }
        }
        update_timer(&mut ip, timer);
    }
    for frag in to_free {
        frag.free();
    }
}

/// Push an IPv4 header and transmit, fragmenting to the egress MTU. The
/// first piece keeps the caller's buffer; extra pieces are pool-allocated
/// and freed here once the driver is done with them.
pub fn transmit(
    buf: &NetBuffer,
    proto: u8,
    src_addr: u32,
    dst_addr: u32,
    flags: BufFlags,
) -> Result<Disposition> {
    let mtu = device::get_mtu(&buf.fd)?;
    // Fragment payloads are measured in 8-octet units.
    let max_payload = (mtu - IPV4_HDR_SIZE) & !7;
    let id = NEXT_ID.fetch_add(1, Ordering::SeqCst).wrapping_add(1);

    let mut piece = buf.clone();
    let mut first = true;
    let mut first_disposition = Disposition::Free;
    let mut offset_bytes = 0usize;

    loop {
        let more = piece.total_len() > max_payload;
        let rest = if more {
            let rest_list = piece
                .fd
                .with_pool(|pool| pool.list_divide(piece.list, max_payload, flags))?;
            Some(NetBuffer::new(piece.fd.clone(), rest_list))
        } else {
            None
        };

        let payload_len = piece.total_len();
        let mut flag_offset = (offset_bytes >> 3) as u16;
        if more {
            flag_offset |= FLAG_MF;
        }
        header_push(&piece, proto, src_addr, dst_addr, id, flag_offset, payload_len)?;

        let disposition = device::transmit(&piece, proto)?;
        if first {
            first_disposition = disposition;
            first = false;
        } else if disposition == Disposition::Free {
            piece.free();
        }

        offset_bytes += payload_len;
        match rest {
            Some(rest) => piece = rest,
            None => break,
        }
    }

    Ok(first_disposition)
}

fn header_push(
    buf: &NetBuffer,
    proto: u8,
    src_addr: u32,
    dst_addr: u32,
    id: u16,
    flag_offset: u16,
    payload_len: usize,
) -> Result<()> {
    let total_len = (payload_len + IPV4_HDR_SIZE) as u16;
    // Fields pushed in reverse so they land in wire order.
    buf.push_u32(dst_addr, BufFlags::HEAD)?;
    buf.push_u32(src_addr, BufFlags::HEAD)?;
    buf.push_u16(0, BufFlags::HEAD)?; // checksum, patched below
    buf.push(&[DEFAULT_TTL, proto], BufFlags::HEAD)?;
    buf.push_u16(flag_offset, BufFlags::HEAD)?;
    buf.push_u16(id, BufFlags::HEAD)?;
    buf.push_u16(total_len, BufFlags::HEAD)?;
    buf.push(&[VER | (IPV4_HDR_SIZE >> 2) as u8, 0], BufFlags::HEAD)?;

    let csum = csum::net_csum_calculate(buf, 0, IPV4_HDR_SIZE)?;
    buf.push_offset(&csum.to_be_bytes(), CSUM_OFFSET, BufFlags::UPDATE)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_offsets() {
        assert_eq!(VER | (IPV4_HDR_SIZE >> 2) as u8, 0x45);
        assert_eq!(SRC_OFFSET + 4, DST_OFFSET);
    }
}
