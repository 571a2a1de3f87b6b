//! Network devices.
//!
//! A device is a buffered descriptor plus link parameters and a transmit
//! hook. Drivers enqueue received frames on the descriptor's RX queue and
//! kick the network task; the task drains the queues through
//! [`process_rx`]. Outbound buffer lists get their link header pushed
//! here and are handed to the driver; a `Free` disposition leaves the
//! buffer with the caller (retransmission keeps the network-layer bytes
//! intact).

use alloc::boxed::Box;
use alloc::sync::Arc;
use alloc::vec::Vec;

use lazy_static::lazy_static;
use spin::Mutex;

use crate::fs::buffer::{self, BufFlags, BufKind};
use crate::fs::FdRef;
use crate::net::ethernet::{self, ETH_ADDR_LEN, ETH_ADDR_BCAST, ETH_HDR_SIZE};
use crate::net::ipv4::{self, Ipv4Device};
use crate::net::{arp, NetBuffer, ETH_TYPE_ARP, ETH_TYPE_IPV4};
use crate::status::{Disposition, Error, Result};

/// Driver-side transmit hook. The frame (with link header) is in `buf`;
/// return `Consumed` if the driver kept the buffer.
pub trait NetDriver: Send + Sync {
    fn transmit(&self, dev: &Arc<NetDevice>, buf: &NetBuffer) -> Result<Disposition>;
}

pub struct NetDevice {
    pub fd: FdRef,
    pub mtu: usize,
    pub mac: [u8; ETH_ADDR_LEN],
    pub ipv4: Mutex<Ipv4Device>,
    driver: Box<dyn NetDriver>,
}

impl NetDevice {
    /// Assigned IPv4 `(address, subnet mask)`.
    pub fn ipv4_address(&self) -> (u32, u32) {
        let ip = self.ipv4.lock();
        (ip.address, ip.subnet)
    }
}

lazy_static! {
    static ref DEVICES: Mutex<Vec<Arc<NetDevice>>> = Mutex::new(Vec::new());
}

/// Register a device with the networking stack and arm its fragment
/// timer.
pub fn register(
    fd: FdRef,
    mtu: usize,
    mac: [u8; ETH_ADDR_LEN],
    driver: Box<dyn NetDriver>,
) -> Arc<NetDevice> {
    let dev = Arc::new(NetDevice {
        fd,
        mtu,
        mac,
        ipv4: Mutex::new(Ipv4Device::new()),
        driver,
    });
    ipv4::fragment_init(&dev);
    DEVICES.lock().push(dev.clone());
    dev
}

/// Snapshot of the registered devices.
pub fn devices() -> Vec<Arc<NetDevice>> {
    DEVICES.lock().clone()
}

/// Device owning the given descriptor.
pub fn for_fd(fd: &FdRef) -> Option<Arc<NetDevice>> {
    DEVICES
        .lock()
        .iter()
        .find(|d| Arc::ptr_eq(&d.fd, fd))
        .cloned()
}

/// MTU of the device behind a descriptor.
pub fn get_mtu(fd: &FdRef) -> Result<usize> {
    for_fd(fd).map(|d| d.mtu).ok_or(Error::InvalidFd)
}

/// Whether any device has received frames waiting.
pub(crate) fn rx_pending() -> bool {
    devices()
        .iter()
        .any(|d| d.fd.with_pool(|pool| pool.rx_count() > 0))
}

/// Drain every device's RX queue through the protocol dispatch. Per
/// packet errors free the buffer and are logged; nothing is fatal.
pub(crate) fn poll_rx() {
    for dev in devices() {
        while let Some(list) = buffer::get_queued(&dev.fd, BufKind::Rx, BufFlags::empty()) {
            let buf = NetBuffer::new(dev.fd.clone(), list);
            match process_rx(&dev, &buf) {
                Ok(Disposition::Consumed) => {}
                Ok(Disposition::Free) => buf.free(),
                Err(e) => {
                    crate::log::debug_ctx(
                        "NET",
                        "dropped received frame",
                        &[("err", e.code().unsigned_abs() as u64)],
                    );
                    buf.free();
                }
            }
        }
    }
}

/// Dispatch one received frame.
pub fn process_rx(dev: &Arc<NetDevice>, buf: &NetBuffer) -> Result<Disposition> {
    let frame = ethernet::process(buf)?;
    match frame.ethertype {
        ETH_TYPE_IPV4 => ipv4::process(dev, buf, frame.broadcast),
        ETH_TYPE_ARP => arp::process(dev, buf),
        _ => Err(Error::UnknownProto),
    }
}

/// Transmit a network-layer packet: resolve the link destination, frame
/// it, hand it to the driver. On a `Free` disposition the link header is
/// stripped again so a retransmission sees the packet it stored.
pub fn transmit(buf: &NetBuffer, _proto: u8) -> Result<Disposition> {
    let dev = for_fd(&buf.fd).ok_or(Error::InvalidFd)?;
    let dst_ip = buf.peek_u32(16)?;
    let dst_mac = arp::resolve(dst_ip).unwrap_or(ETH_ADDR_BCAST);
    transmit_raw(&dev, buf, ETH_TYPE_IPV4, dst_mac)
}

/// Frame and transmit a buffer with an explicit type and destination.
pub fn transmit_raw(
    dev: &Arc<NetDevice>,
    buf: &NetBuffer,
    ethertype: u16,
    dst_mac: [u8; ETH_ADDR_LEN],
) -> Result<Disposition> {
    ethernet::header_add(buf, &dst_mac, &dev.mac, ethertype)?;
    let disposition = dev.driver.transmit(dev, buf);
    match disposition {
        Ok(Disposition::Consumed) => Ok(Disposition::Consumed),
        Ok(Disposition::Free) => {
            buf.pull(None, ETH_HDR_SIZE, BufFlags::empty())?;
            Ok(Disposition::Free)
        }
        Err(e) => {
            buf.pull(None, ETH_HDR_SIZE, BufFlags::empty())?;
            Err(e)
        }
    }
}

#[doc(hidden)]
pub fn reset() {
    DEVICES.lock().clear();
    arp::reset();
}
