//! Minimal ARP: answer requests for our address, learn peer mappings.
//!
//! Only the seam the dispatch and the transmit path need; everything
//! beyond request/reply and a small translation cache stays in the
//! drivers' hands.

use heapless::Vec as FixedVec;
use lazy_static::lazy_static;
use spin::Mutex;

use crate::config::ARP_CACHE_ENTRIES;
use crate::fs::buffer::{self, BufFlags};
use crate::net::device::{self, NetDevice};
use crate::net::ethernet::ETH_ADDR_LEN;
use crate::net::{NetBuffer, ETH_TYPE_ARP};
use crate::status::{Disposition, Error, Result};

const ARP_HDR_SIZE: usize = 28;
const OPER_REQUEST: u16 = 1;
const OPER_REPLY: u16 = 2;

lazy_static! {
    static ref CACHE: Mutex<FixedVec<(u32, [u8; ETH_ADDR_LEN]), ARP_CACHE_ENTRIES>> =
        Mutex::new(FixedVec::new());
}

fn learn(ip: u32, mac: [u8; ETH_ADDR_LEN]) {
    let mut cache = CACHE.lock();
    if let Some(entry) = cache.iter_mut().find(|(a, _)| *a == ip) {
        entry.1 = mac;
        return;
    }
    if cache.push((ip, mac)).is_err() {
        // Table full: evict the oldest mapping.
        cache.remove(0);
        let _ = cache.push((ip, mac));
    }
}

/// Translate an IPv4 next hop to a link address.
pub fn resolve(ip: u32) -> Option<[u8; ETH_ADDR_LEN]> {
    CACHE.lock().iter().find(|(a, _)| *a == ip).map(|(_, m)| *m)
}

/// Handle a received ARP packet (Ethernet header already stripped).
pub fn process(dev: &alloc::sync::Arc<NetDevice>, buf: &NetBuffer) -> Result<Disposition> {
    if buf.total_len() < ARP_HDR_SIZE {
        return Err(Error::InvalidHeader);
    }
    let oper = buf.peek_u16(6)?;
    let mut sha = [0u8; ETH_ADDR_LEN];
    buf.pull_offset(Some(&mut sha), ETH_ADDR_LEN, 8, BufFlags::INPLACE)?;
    let spa = buf.peek_u32(14)?;
    let tpa = buf.peek_u32(24)?;

    let our_ip = dev.ipv4_address().0;

    match oper {
        OPER_REQUEST if our_ip != 0 && tpa == our_ip => {
            learn(spa, sha);
            send_reply(dev, &sha, spa)?;
            Ok(Disposition::Free)
        }
        OPER_REPLY => {
            learn(spa, sha);
            Ok(Disposition::Free)
        }
        _ => Err(Error::NoAction),
    }
}

fn send_reply(dev: &alloc::sync::Arc<NetDevice>, dst_mac: &[u8; ETH_ADDR_LEN], dst_ip: u32) -> Result<()> {
    let list = buffer::get_list(&dev.fd, BufFlags::TH)?;
    let reply = NetBuffer::new(dev.fd.clone(), list);

    let our_ip = dev.ipv4_address().0;
    let build = (|| -> Result<()> {
        reply.push_u16(1, BufFlags::empty())?; // Ethernet
        reply.push_u16(crate::net::ETH_TYPE_IPV4, BufFlags::empty())?;
        reply.push(&[ETH_ADDR_LEN as u8, 4], BufFlags::empty())?;
        reply.push_u16(OPER_REPLY, BufFlags::empty())?;
        reply.push(&dev.mac, BufFlags::empty())?;
        reply.push_u32(our_ip, BufFlags::empty())?;
        reply.push(dst_mac, BufFlags::empty())?;
        reply.push_u32(dst_ip, BufFlags::empty())?;
        Ok(())
    })();
    if build.is_err() {
        reply.free();
        return build;
    }

    match device::transmit_raw(dev, &reply, ETH_TYPE_ARP, *dst_mac)? {
        Disposition::Free => {
            reply.free();
            Ok(())
        }
        Disposition::Consumed => Ok(()),
    }
}

#[doc(hidden)]
pub fn reset() {
    CACHE.lock().clear();
}
