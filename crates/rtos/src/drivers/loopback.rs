//! Loopback Ethernet device.
//!
//! A RAM-backed device with a real buffer pool. Transmitted frames either
//! cross over to a peer device's receive queue (a back-to-back cable) or
//! are captured for inspection when no peer is attached. Reception
//! mirrors a MAC driver's ISR half: allocate a list threshold-aware, copy
//! the frame in, queue it RX and kick the network task.

use alloc::boxed::Box;
use alloc::collections::VecDeque;
use alloc::sync::{Arc, Weak};
use alloc::vec::Vec;

use spin::Mutex;

use crate::fs::buffer::{self, BufFlags, BufKind, BufferPool};
use crate::fs::{Fd, FdFlags, FdOps, FdRef};
use crate::net::condition;
use crate::net::device::{self, NetDevice, NetDriver};
use crate::net::ethernet::ETH_ADDR_LEN;
use crate::net::NetBuffer;
use crate::status::{Disposition, Result};

/// Pool geometry for one loopback device.
pub struct LoopbackConfig {
    pub num_buffers: usize,
    pub buffer_size: usize,
    pub num_lists: usize,
    pub threshold_buffers: usize,
    pub threshold_lists: usize,
    pub mtu: usize,
}

impl Default for LoopbackConfig {
    fn default() -> Self {
        LoopbackConfig {
            num_buffers: 32,
            buffer_size: 256,
            num_lists: 16,
            threshold_buffers: 2,
            threshold_lists: 2,
            mtu: 1500,
        }
    }
}

struct Shared {
    peer: Mutex<Option<Weak<Fd>>>,
    captured: Mutex<VecDeque<Vec<u8>>>,
}

/// Test/application handle to a loopback device.
#[derive(Clone)]
pub struct Loopback {
    shared: Arc<Shared>,
    pub dev: Arc<NetDevice>,
}

impl Loopback {
    /// Cable this device to `peer`: transmitted frames arrive on the
    /// peer's RX queue.
    pub fn connect_peer(&self, peer: &FdRef) {
        *self.shared.peer.lock() = Some(Arc::downgrade(peer));
    }

    /// Next captured frame (peerless devices only).
    pub fn take_frame(&self) -> Option<Vec<u8>> {
        self.shared.captured.lock().pop_front()
    }

    pub fn captured_frames(&self) -> usize {
        self.shared.captured.lock().len()
    }

    pub fn fd(&self) -> FdRef {
        self.dev.fd.clone()
    }
}

struct LoopbackDriver {
    shared: Arc<Shared>,
}

impl NetDriver for LoopbackDriver {
    fn transmit(&self, _dev: &Arc<NetDevice>, buf: &NetBuffer) -> Result<Disposition> {
        let frame = buf.to_vec();
        let peer = self.shared.peer.lock().clone();
        match peer.and_then(|p| p.upgrade()) {
            Some(peer_fd) => {
                // A dropped frame on the wire is not a transmit error.
                let _ = inject_rx(&peer_fd, &frame);
            }
            None => self.shared.captured.lock().push_back(frame),
        }
        Ok(Disposition::Free)
    }
}

struct LoopbackOps {
    shared: Arc<Shared>,
}

impl FdOps for LoopbackOps {
    /// Raw frame read: pop the next captured frame.
    fn read(&self, fd: &FdRef, out: &mut [u8]) -> Result<usize> {
        let mut captured = self.shared.captured.lock();
        match captured.pop_front() {
            Some(frame) => {
                let n = frame.len().min(out.len());
                out[..n].copy_from_slice(&frame[..n]);
                if captured.is_empty() {
                    drop(captured);
                    fd.data_flushed();
                }
                Ok(n)
            }
            None => Ok(0),
        }
    }

    /// Raw frame write: hand the bytes straight to the wire side.
    fn write(&self, fd: &FdRef, data: &[u8]) -> Result<usize> {
        inject_rx(fd, data)?;
        Ok(data.len())
    }
}

/// Create and register a loopback device.
pub fn create(name: &str, mac: [u8; ETH_ADDR_LEN], config: LoopbackConfig) -> Loopback {
    let shared = Arc::new(Shared {
        peer: Mutex::new(None),
        captured: Mutex::new(VecDeque::new()),
    });

    let fd = Fd::new(
        name,
        FdFlags::empty(),
        Box::new(LoopbackOps {
            shared: shared.clone(),
        }),
    );
    fd.set_pool(BufferPool::new(
        config.num_buffers,
        config.buffer_size,
        config.num_lists,
        config.threshold_buffers,
        config.threshold_lists,
    ));
    let _ = crate::fs::fs_register(fd.clone());

    let dev = device::register(
        fd,
        config.mtu,
        mac,
        Box::new(LoopbackDriver {
            shared: shared.clone(),
        }),
    );
    condition::net_init();

    Loopback { shared, dev }
}

/// Deliver a raw frame into a device's receive queue, the way a MAC
/// driver's receive interrupt would: fill a threshold-aware list inside a
/// critical section, queue it RX, signal the network task.
pub fn inject_rx(fd: &FdRef, frame: &[u8]) -> Result<()> {
    let list = crate::kernel::intr::critical(|| {
        fd.with_pool(|pool| {
            let list = pool.get_list(BufFlags::TH)?;
            match pool.list_push(list, frame, BufFlags::TH) {
                Ok(()) => Ok(list),
                Err(e) => {
                    pool.add_list(list, BufKind::ListFree, BufFlags::empty());
                    Err(e)
                }
            }
        })
    })?;
    buffer::add_list(fd, list, BufKind::Rx, BufFlags::ACTIVE);
    condition::kick();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::ethernet::ETH_HDR_SIZE;
    use crate::status::Disposition;

    #[test]
    fn test_peered_devices_cross_frames() {
        let _g = crate::testutil::lock();
        crate::sys_reset();
        let a = create("\\lo_a", [2, 0, 0, 0, 0, 1], LoopbackConfig::default());
        let b = create("\\lo_b", [2, 0, 0, 0, 0, 2], LoopbackConfig::default());
        a.connect_peer(&b.fd());

        let list = a.fd().with_pool(|pool| {
            let list = pool.get_list(BufFlags::empty()).unwrap();
            pool.list_push(list, b"payload", BufFlags::empty()).unwrap();
            list
        });
        let buf = NetBuffer::new(a.fd(), list);
        let disposition =
            device::transmit_raw(&a.dev, &buf, crate::net::ETH_TYPE_IPV4, [0xFF; 6]).unwrap();
        assert_eq!(disposition, Disposition::Free);
        // The link header was stripped again after the driver ran.
        assert_eq!(buf.total_len(), 7);
        buf.free();

        // The frame crossed over to the peer's receive queue.
        let rx = buffer::get_queued(&b.fd(), BufKind::Rx, BufFlags::empty()).unwrap();
        let bytes = b.fd().with_pool(|pool| pool.list_to_vec(rx));
        assert_eq!(bytes.len(), ETH_HDR_SIZE + 7);
        assert_eq!(&bytes[ETH_HDR_SIZE..], b"payload");
        buffer::add_list(&b.fd(), rx, BufKind::ListFree, BufFlags::ACTIVE);
    }

    #[test]
    fn test_capture_without_peer() {
        let _g = crate::testutil::lock();
        crate::sys_reset();
        let lo = create("\\lo_cap", [2, 0, 0, 0, 0, 3], LoopbackConfig::default());

        let list = lo.fd().with_pool(|pool| {
            let list = pool.get_list(BufFlags::empty()).unwrap();
            pool.list_push(list, &[0xABu8; 32], BufFlags::empty()).unwrap();
            list
        });
        let buf = NetBuffer::new(lo.fd(), list);
        device::transmit_raw(&lo.dev, &buf, crate::net::ETH_TYPE_IPV4, [0xFF; 6]).unwrap();
        buf.free();

        assert_eq!(lo.captured_frames(), 1);
        let frame = lo.take_frame().unwrap();
        assert_eq!(frame.len(), ETH_HDR_SIZE + 32);
    }
}
