//! Networking engine.
//!
//! A single network condition task pumps every device's received buffer
//! lists through the protocol dispatch (Ethernet → ARP / IPv4 → TCP) and
//! fires every armed protocol timer. All protocol state mutates inside
//! that one task's context; per-port locks exist for the benefit of
//! application tasks calling read and write.

pub mod arp;
pub mod condition;
pub mod csum;
pub mod device;
pub mod ethernet;
pub mod ipv4;
pub mod route;
pub mod tcp;

use crate::fs::buffer::{self, BufFlags, BufKind, ListId};
use crate::fs::FdRef;
use crate::status::Result;

/// IPv4 protocol numbers.
pub const IP_PROTO_ICMP: u8 = 1;
pub const IP_PROTO_TCP: u8 = 6;
pub const IP_PROTO_UDP: u8 = 17;

/// Ethernet frame types.
pub const ETH_TYPE_IPV4: u16 = 0x0800;
pub const ETH_TYPE_ARP: u16 = 0x0806;

/// Unspecified IPv4 address.
pub const IPV4_ADDR_UNSPEC: u32 = 0;
/// Limited broadcast.
pub const IPV4_ADDR_BCAST: u32 = 0xFFFF_FFFF;

/// A buffer list checked out of a device's pool, together with the
/// descriptor that owns the pool. The handle every protocol layer passes
/// around.
#[derive(Clone)]
pub struct NetBuffer {
    pub fd: FdRef,
    pub list: ListId,
}

impl NetBuffer {
    pub fn new(fd: FdRef, list: ListId) -> Self {
        NetBuffer { fd, list }
    }

    pub fn same_pool(&self, other: &NetBuffer) -> bool {
        alloc::sync::Arc::ptr_eq(&self.fd, &other.fd)
    }

    pub fn total_len(&self) -> usize {
        self.fd.with_pool(|pool| pool.list_len(self.list))
    }

    pub fn push(&self, data: &[u8], flags: BufFlags) -> Result<()> {
        self.fd.with_pool(|pool| pool.list_push(self.list, data, flags))
    }

    pub fn push_offset(&self, data: &[u8], offset: usize, flags: BufFlags) -> Result<()> {
        self.fd
            .with_pool(|pool| pool.list_push_offset(self.list, data, offset, flags))
    }

    pub fn pull(&self, out: Option<&mut [u8]>, n: usize, flags: BufFlags) -> Result<()> {
        self.fd.with_pool(|pool| pool.list_pull(self.list, out, n, flags))
    }

    pub fn pull_offset(
        &self,
        out: Option<&mut [u8]>,
        n: usize,
        offset: usize,
        flags: BufFlags,
    ) -> Result<()> {
        self.fd
            .with_pool(|pool| pool.list_pull_offset(self.list, out, n, offset, flags))
    }

    /// Peek an on-wire u8 at `offset`.
    pub fn peek_u8(&self, offset: usize) -> Result<u8> {
        let mut b = [0u8; 1];
        self.pull_offset(Some(&mut b), 1, offset, BufFlags::INPLACE)?;
        Ok(b[0])
    }

    /// Peek an on-wire u16 at `offset` (network byte order).
    pub fn peek_u16(&self, offset: usize) -> Result<u16> {
        let mut b = [0u8; 2];
        self.pull_offset(Some(&mut b), 2, offset, BufFlags::INPLACE)?;
        Ok(u16::from_be_bytes(b))
    }

    /// Peek an on-wire u32 at `offset` (network byte order).
    pub fn peek_u32(&self, offset: usize) -> Result<u32> {
        let mut b = [0u8; 4];
        self.pull_offset(Some(&mut b), 4, offset, BufFlags::INPLACE)?;
        Ok(u32::from_be_bytes(b))
    }

    /// Push an on-wire u16 (`HEAD` prepends).
    pub fn push_u16(&self, v: u16, flags: BufFlags) -> Result<()> {
        self.push(&v.to_be_bytes(), flags - BufFlags::PACKED)
    }

    /// Push an on-wire u32 (`HEAD` prepends).
    pub fn push_u32(&self, v: u32, flags: BufFlags) -> Result<()> {
        self.push(&v.to_be_bytes(), flags - BufFlags::PACKED)
    }

    /// Gather the whole list into a contiguous vector.
    pub fn to_vec(&self) -> alloc::vec::Vec<u8> {
        self.fd.with_pool(|pool| pool.list_to_vec(self.list))
    }

    /// Return the list (and its buffers) to its pool, waking waiters.
    pub fn free(self) {
        buffer::add_list(&self.fd, self.list, BufKind::ListFree, BufFlags::ACTIVE);
    }
}
