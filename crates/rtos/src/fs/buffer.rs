//! Buffer pools, single buffers and buffer lists.
//!
//! Every descriptor that moves packet data owns a [`BufferPool`]: a fixed
//! arena of single buffers plus preallocated list heads, circulating
//! between four queues (free buffers, free lists, RX-ready, TX-pending).
//! Data travels as a *buffer list*, a chain of single buffers with head
//! and tail room and a maintained total length, so headers are pushed and
//! pulled in O(1) without copying payload.
//!
//! Buffers are identified by small indices into the pool's arena; the
//! queue linkage is the `next` index stored in each node, so list surgery
//! stays O(1) and nothing is ever allocated per packet.
//!
//! The pool's thresholds are the system's only back-pressure: allocations
//! made with [`BufFlags::TH`] pledge to leave the threshold margin behind,
//! and [`BufferPool::threshold_locked`] tells receive paths to shed load
//! instead of enqueueing.

use alloc::sync::Weak;
use alloc::vec;
use alloc::vec::Vec;

use bitflags::bitflags;

use crate::fs::{Fd, FdFlags, FdRef};
use crate::kernel::condition::{suspend_on, Resume, Suspend, SuspendParam};
use crate::status::{Error, Result};

pub type BufId = u16;
pub type ListId = u16;

bitflags! {
    /// Buffer operation flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct BufFlags: u16 {
        /// Peek without dequeuing / read without removing.
        const INPLACE = 1 << 0;
        /// Network byte order: reverse bytes of the pushed/pulled value.
        const PACKED = 1 << 1;
        /// Operate on the head end.
        const HEAD = 1 << 2;
        /// Operate on the tail end.
        const TAIL = 1 << 3;
        /// Overwrite existing data in place.
        const UPDATE = 1 << 4;
        /// Block until the pool can satisfy the request.
        const SUSPEND = 1 << 5;
        /// Leave the configured threshold margin in the pool.
        const TH = 1 << 6;
        /// Actively notify waiters of the state change.
        const ACTIVE = 1 << 7;
    }
}

/// Which pool queue an operation targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufKind {
    /// Free single buffers.
    Free,
    /// Free list heads.
    ListFree,
    /// Received, ready for protocol processing.
    Rx,
    /// Pending transmission.
    Tx,
}

/// Context handed to a list's free callback.
pub struct ListFreeData {
    /// Descriptor that owns the interested party (a TCP port).
    pub fd: Weak<Fd>,
    /// Slot index inside that owner.
    pub index: usize,
}

/// Reclaim hook run when a list is returned to the pool. Returning true
/// keeps the list checked out (the owner still needs it, e.g. for
/// retransmission).
pub type ListFreeFn = fn(&ListFreeData, ListId) -> bool;

struct BufNode {
    /// Read/write cursor, an offset into this buffer's fixed arena slot.
    cur: usize,
    /// Valid bytes starting at `cur`.
    len: usize,
    next: Option<BufId>,
}

struct ListNode {
    head: Option<BufId>,
    tail: Option<BufId>,
    total: usize,
    next: Option<ListId>,
    free: Option<(ListFreeFn, ListFreeData)>,
}

#[derive(Default)]
struct Queue {
    head: Option<u16>,
    tail: Option<u16>,
    count: usize,
}

/// Selector for the three list-carrying queues.
#[derive(Clone, Copy)]
enum Lq {
    FreeLists,
    Rx,
    Tx,
}

pub struct BufferPool {
    buf_size: usize,
    mem: Vec<u8>,
    bufs: Vec<BufNode>,
    lists: Vec<ListNode>,
    free_bufs: Queue,
    free_lists: Queue,
    rx_lists: Queue,
    tx_lists: Queue,
    threshold_bufs: usize,
    threshold_lists: usize,
}

impl BufferPool {
    pub fn new(
        num_buffers: usize,
        buf_size: usize,
        num_lists: usize,
        threshold_bufs: usize,
        threshold_lists: usize,
    ) -> Self {
        let mut pool = BufferPool {
            buf_size,
            mem: vec![0; num_buffers * buf_size],
            bufs: (0..num_buffers)
                .map(|_| BufNode {
                    cur: 0,
                    len: 0,
                    next: None,
                })
                .collect(),
            lists: (0..num_lists)
                .map(|_| ListNode {
                    head: None,
                    tail: None,
                    total: 0,
                    next: None,
                    free: None,
                })
                .collect(),
            free_bufs: Queue::default(),
            free_lists: Queue::default(),
            rx_lists: Queue::default(),
            tx_lists: Queue::default(),
            threshold_bufs,
            threshold_lists,
        };
        for id in 0..num_buffers as BufId {
            pool.bq_append(id);
        }
        for id in 0..num_lists as ListId {
            pool.lq_append(Lq::FreeLists, id);
        }
        pool
    }

    pub fn buf_size(&self) -> usize {
        self.buf_size
    }

    pub fn num_buffers(&self) -> usize {
        self.bufs.len()
    }

    pub fn num_lists(&self) -> usize {
        self.lists.len()
    }

    pub fn free_buffers(&self) -> usize {
        self.free_bufs.count
    }

    pub fn free_list_heads(&self) -> usize {
        self.free_lists.count
    }

    pub fn rx_count(&self) -> usize {
        self.rx_lists.count
    }

    pub fn tx_count(&self) -> usize {
        self.tx_lists.count
    }

    pub fn threshold_buffers(&self) -> usize {
        self.threshold_bufs
    }

    pub fn threshold_lists(&self) -> usize {
        self.threshold_lists
    }

    /// True when the pool is at or below its reserved margin and receive
    /// paths must shed load.
    pub fn threshold_locked(&self) -> bool {
        self.free_bufs.count <= self.threshold_bufs
            || self.free_lists.count <= self.threshold_lists
    }

    fn margin(&self, kind: BufKind, flags: BufFlags) -> usize {
        if flags.contains(BufFlags::TH) {
            match kind {
                BufKind::Free => self.threshold_bufs,
                BufKind::ListFree => self.threshold_lists,
                _ => 0,
            }
        } else {
            0
        }
    }

    // Free-buffer queue (single buffers).

    fn bq_append(&mut self, id: BufId) {
        self.bufs[id as usize].next = None;
        match self.free_bufs.tail {
            Some(tail) => self.bufs[tail as usize].next = Some(id),
            None => self.free_bufs.head = Some(id),
        }
        self.free_bufs.tail = Some(id);
        self.free_bufs.count += 1;
    }

    fn bq_pop(&mut self) -> Option<BufId> {
        let id = self.free_bufs.head?;
        self.free_bufs.head = self.bufs[id as usize].next;
        if self.free_bufs.head.is_none() {
            self.free_bufs.tail = None;
        }
        self.bufs[id as usize].next = None;
        self.free_bufs.count -= 1;
        Some(id)
    }

    // List queues.

    fn lq(&mut self, q: Lq) -> &mut Queue {
        match q {
            Lq::FreeLists => &mut self.free_lists,
            Lq::Rx => &mut self.rx_lists,
            Lq::Tx => &mut self.tx_lists,
        }
    }

    fn lq_append(&mut self, q: Lq, id: ListId) {
        self.lists[id as usize].next = None;
        let tail = self.lq(q).tail;
        match tail {
            Some(tail) => self.lists[tail as usize].next = Some(id),
            None => self.lq(q).head = Some(id),
        }
        let queue = self.lq(q);
        queue.tail = Some(id);
        queue.count += 1;
    }

    fn lq_push(&mut self, q: Lq, id: ListId) {
        let head = self.lq(q).head;
        self.lists[id as usize].next = head;
        let queue = self.lq(q);
        if queue.tail.is_none() {
            queue.tail = Some(id);
        }
        queue.head = Some(id);
        queue.count += 1;
    }

    fn lq_pop(&mut self, q: Lq) -> Option<ListId> {
        let id = self.lq(q).head?;
        let next = self.lists[id as usize].next;
        let queue = self.lq(q);
        queue.head = next;
        if queue.head.is_none() {
            queue.tail = None;
        }
        queue.count -= 1;
        self.lists[id as usize].next = None;
        Some(id)
    }

    fn lq_peek(&mut self, q: Lq) -> Option<ListId> {
        self.lq(q).head
    }

    // Allocation.

    /// Whether a single-buffer allocation would succeed.
    pub fn can_get_buf(&self, flags: BufFlags) -> bool {
        self.free_bufs.count > self.margin(BufKind::Free, flags)
    }

    /// Whether a list allocation would succeed.
    pub fn can_get_list(&self, flags: BufFlags) -> bool {
        self.free_lists.count > self.margin(BufKind::ListFree, flags)
    }

    /// Take a free single buffer, honouring the threshold margin.
    pub fn get_buf(&mut self, flags: BufFlags) -> Result<BufId> {
        if !self.can_get_buf(flags) {
            return Err(Error::BufferNoSpace);
        }
        self.bq_pop().ok_or(Error::BufferNoSpace)
    }

    /// Take a free list head, honouring the threshold margin.
    pub fn get_list(&mut self, flags: BufFlags) -> Result<ListId> {
        if !self.can_get_list(flags) {
            return Err(Error::BufferNoSpace);
        }
        self.lq_pop(Lq::FreeLists).ok_or(Error::BufferNoSpace)
    }

    /// Take (or peek, with `INPLACE`) the next RX or TX list.
    pub fn get_queued(&mut self, kind: BufKind, flags: BufFlags) -> Option<ListId> {
        let q = match kind {
            BufKind::Rx => Lq::Rx,
            BufKind::Tx => Lq::Tx,
            _ => return None,
        };
        if flags.contains(BufFlags::INPLACE) {
            self.lq_peek(q)
        } else {
            self.lq_pop(q)
        }
    }

    /// Return a single buffer to the free queue.
    pub fn add_buf(&mut self, id: BufId) {
        let node = &mut self.bufs[id as usize];
        node.cur = 0;
        node.len = 0;
        node.next = None;
        self.bq_append(id);
    }

    /// Take the list's free callback, if any. The caller decides whether
    /// to run it before actually returning the list.
    pub fn take_free_hook(&mut self, id: ListId) -> Option<(ListFreeFn, ListFreeData)> {
        self.lists[id as usize].free.take()
    }

    /// Attach a free callback to a checked-out list.
    pub fn set_free_hook(&mut self, id: ListId, hook: ListFreeFn, data: ListFreeData) {
        self.lists[id as usize].free = Some((hook, data));
    }

    /// Queue a checked-out list on RX or TX, or return it (and its member
    /// buffers) to the free queues. Does not run free callbacks; use the
    /// descriptor-level [`add_list`] for that.
    pub fn add_list(&mut self, id: ListId, kind: BufKind, flags: BufFlags) {
        match kind {
            BufKind::Rx => {
                if flags.contains(BufFlags::HEAD) {
                    self.lq_push(Lq::Rx, id);
                } else {
                    self.lq_append(Lq::Rx, id);
                }
            }
            BufKind::Tx => {
                if flags.contains(BufFlags::HEAD) {
                    self.lq_push(Lq::Tx, id);
                } else {
                    self.lq_append(Lq::Tx, id);
                }
            }
            BufKind::Free | BufKind::ListFree => {
                // Member buffers go back first, then the reinitialized head.
                let mut b = self.lists[id as usize].head;
                while let Some(bid) = b {
                    b = self.bufs[bid as usize].next;
                    self.add_buf(bid);
                }
                let node = &mut self.lists[id as usize];
                node.head = None;
                node.tail = None;
                node.total = 0;
                node.free = None;
                self.lq_append(Lq::FreeLists, id);
            }
        }
    }

    // Single-buffer primitives.

    fn slot(&self, id: BufId) -> core::ops::Range<usize> {
        let base = id as usize * self.buf_size;
        base..base + self.buf_size
    }

    pub fn buf_len(&self, id: BufId) -> usize {
        self.bufs[id as usize].len
    }

    pub fn buf_headroom(&self, id: BufId) -> usize {
        self.bufs[id as usize].cur
    }

    pub fn buf_tailroom(&self, id: BufId) -> usize {
        let node = &self.bufs[id as usize];
        self.buf_size - node.cur - node.len
    }

    /// Valid bytes of a single buffer.
    pub fn buf_bytes(&self, id: BufId) -> &[u8] {
        let node = &self.bufs[id as usize];
        let base = id as usize * self.buf_size;
        &self.mem[base + node.cur..base + node.cur + node.len]
    }

    /// Push bytes onto one buffer. `HEAD` prepends into head room, the
    /// default appends into tail room; `PACKED` reverses byte order.
    pub fn buf_push(&mut self, id: BufId, data: &[u8], flags: BufFlags) -> Result<()> {
        let n = data.len();
        let node = &self.bufs[id as usize];
        let slot = self.slot(id);
        let (start, new_cur) = if flags.contains(BufFlags::HEAD) {
            if node.cur < n {
                return Err(Error::BufferNoSpace);
            }
            (slot.start + node.cur - n, Some(node.cur - n))
        } else {
            if self.buf_size - node.cur - node.len < n {
                return Err(Error::BufferNoSpace);
            }
            (slot.start + node.cur + node.len, None)
        };

        copy_maybe_packed(&mut self.mem[start..start + n], data, flags);

        let node = &mut self.bufs[id as usize];
        if let Some(cur) = new_cur {
            node.cur = cur;
        }
        node.len += n;
        Ok(())
    }

    /// Overwrite `data.len()` bytes at `offset` from the head of the valid
    /// region without changing the length.
    pub fn buf_push_offset(
        &mut self,
        id: BufId,
        data: &[u8],
        offset: usize,
        flags: BufFlags,
    ) -> Result<()> {
        debug_assert!(flags.contains(BufFlags::UPDATE));
        let node = &self.bufs[id as usize];
        if offset + data.len() > node.len {
            return Err(Error::BufferNoSpace);
        }
        let start = self.slot(id).start + node.cur + offset;
        copy_maybe_packed(&mut self.mem[start..start + data.len()], data, flags);
        Ok(())
    }

    /// Pull bytes off one buffer; head end by default, `TAIL` for the
    /// other end, `INPLACE` to peek.
    pub fn buf_pull(
        &mut self,
        id: BufId,
        out: Option<&mut [u8]>,
        n: usize,
        flags: BufFlags,
    ) -> Result<()> {
        let node = &self.bufs[id as usize];
        if node.len < n {
            return Err(Error::BufferNoSpace);
        }
        let start = if flags.contains(BufFlags::TAIL) {
            self.slot(id).start + node.cur + node.len - n
        } else {
            self.slot(id).start + node.cur
        };
        if let Some(out) = out {
            copy_maybe_packed(out, &self.mem[start..start + n], flags);
        }
        if !flags.contains(BufFlags::INPLACE) {
            let node = &mut self.bufs[id as usize];
            node.len -= n;
            if !flags.contains(BufFlags::TAIL) {
                node.cur += n;
            }
        }
        Ok(())
    }

    /// Reserve `n` bytes of head room by shifting the valid region toward
    /// the tail.
    pub fn buf_add_head(&mut self, id: BufId, n: usize) -> Result<()> {
        if self.buf_tailroom(id) < n {
            return Err(Error::BufferNoSpace);
        }
        let node = &self.bufs[id as usize];
        let base = self.slot(id).start;
        let from = base + node.cur;
        self.mem.copy_within(from..from + node.len, from + n);
        self.bufs[id as usize].cur += n;
        Ok(())
    }

    /// Split one buffer at byte `at`; the tail bytes move into a freshly
    /// allocated buffer which is returned.
    pub fn buf_divide(&mut self, id: BufId, at: usize, flags: BufFlags) -> Result<BufId> {
        let len = self.bufs[id as usize].len;
        if at > len {
            return Err(Error::BufferNoSpace);
        }
        let new = self.get_buf(flags)?;
        let tail_len = len - at;

        let src = self.slot(id).start + self.bufs[id as usize].cur + at;
        let dst = self.slot(new).start;
        self.mem.copy_within(src..src + tail_len, dst);

        self.bufs[id as usize].len = at;
        let new_node = &mut self.bufs[new as usize];
        new_node.cur = 0;
        new_node.len = tail_len;
        new_node.next = None;
        Ok(new)
    }

    // Buffer-list primitives.

    pub fn list_len(&self, id: ListId) -> usize {
        self.lists[id as usize].total
    }

    pub fn list_head_buf(&self, id: ListId) -> Option<BufId> {
        self.lists[id as usize].head
    }

    /// Append one buffer to a list (`HEAD` prepends).
    pub fn list_append_buf(&mut self, id: ListId, buf: BufId, flags: BufFlags) {
        let len = self.bufs[buf as usize].len;
        if flags.contains(BufFlags::HEAD) {
            let head = self.lists[id as usize].head;
            self.bufs[buf as usize].next = head;
            let node = &mut self.lists[id as usize];
            if node.tail.is_none() {
                node.tail = Some(buf);
            }
            node.head = Some(buf);
        } else {
            self.bufs[buf as usize].next = None;
            let tail = self.lists[id as usize].tail;
            match tail {
                Some(tail) => self.bufs[tail as usize].next = Some(buf),
                None => self.lists[id as usize].head = Some(buf),
            }
            self.lists[id as usize].tail = Some(buf);
        }
        self.lists[id as usize].total += len;
    }

    /// Bytes the list could still absorb with the given allocation flags.
    fn list_capacity(&self, id: ListId, flags: BufFlags) -> usize {
        let spare = self
            .free_bufs
            .count
            .saturating_sub(self.margin(BufKind::Free, flags));
        let tail_room = match self.lists[id as usize].tail {
            Some(tail) => self.buf_tailroom(tail),
            None => 0,
        };
        tail_room + spare * self.buf_size
    }

    /// Push bytes onto a list, growing it with buffers from the free
    /// queue as needed. `HEAD` prepends (header push), default appends.
    pub fn list_push(&mut self, id: ListId, data: &[u8], flags: BufFlags) -> Result<()> {
        let mut scratch = [0u8; PACKED_MAX];
        let data = maybe_packed(data, flags, &mut scratch)?;

        if flags.contains(BufFlags::HEAD) {
            // Headers are pushed whole; they are far smaller than a buffer.
            let fits_head = match self.lists[id as usize].head {
                Some(head) => self.buf_headroom(head) >= data.len(),
                None => false,
            };
            if fits_head {
                let head = self.lists[id as usize].head.unwrap();
                self.buf_push(head, data, BufFlags::HEAD)?;
                self.lists[id as usize].total += data.len();
            } else {
                if data.len() > self.buf_size {
                    return Err(Error::BufferNoSpace);
                }
                let buf = self.get_buf(flags)?;
                // All head room: pushes land at the slot's end.
                self.bufs[buf as usize].cur = self.buf_size;
                self.buf_push(buf, data, BufFlags::HEAD)?;
                self.list_append_buf(id, buf, BufFlags::HEAD);
            }
            return Ok(());
        }

        if self.list_capacity(id, flags) < data.len() {
            return Err(Error::BufferNoSpace);
        }
        let mut rest = data;
        while !rest.is_empty() {
            let tail_room = match self.lists[id as usize].tail {
                Some(tail) => self.buf_tailroom(tail),
                None => 0,
            };
            if tail_room == 0 {
                let buf = self.get_buf(flags)?;
                self.list_append_buf(id, buf, BufFlags::empty());
                continue;
            }
            let tail = self.lists[id as usize].tail.unwrap();
            let chunk = rest.len().min(tail_room);
            self.buf_push(tail, &rest[..chunk], BufFlags::empty())?;
            self.lists[id as usize].total += chunk;
            rest = &rest[chunk..];
        }
        Ok(())
    }

    /// Overwrite bytes at `offset` from the list head (header checksum
    /// patches). Length is unchanged.
    pub fn list_push_offset(
        &mut self,
        id: ListId,
        data: &[u8],
        offset: usize,
        flags: BufFlags,
    ) -> Result<()> {
        debug_assert!(flags.contains(BufFlags::UPDATE));
        if offset + data.len() > self.lists[id as usize].total {
            return Err(Error::BufferNoSpace);
        }
        let mut scratch = [0u8; PACKED_MAX];
        let data = maybe_packed(data, flags, &mut scratch)?;

        let mut skip = offset;
        let mut rest = data;
        let mut b = self.lists[id as usize].head;
        while let Some(bid) = b {
            let blen = self.bufs[bid as usize].len;
            if skip >= blen {
                skip -= blen;
                b = self.bufs[bid as usize].next;
                continue;
            }
            let n = rest.len().min(blen - skip);
            let start = self.slot(bid).start + self.bufs[bid as usize].cur + skip;
            self.mem[start..start + n].copy_from_slice(&rest[..n]);
            rest = &rest[n..];
            if rest.is_empty() {
                return Ok(());
            }
            skip = 0;
            b = self.bufs[bid as usize].next;
        }
        Err(Error::BufferNoSpace)
    }

    /// Pull bytes off a list. Default is a destructive pull from the
    /// head; `TAIL` trims the other end (padding strip); `INPLACE` peeks;
    /// `PACKED` reverses the bytes read. Emptied member buffers return to
    /// the free queue.
    pub fn list_pull(
        &mut self,
        id: ListId,
        out: Option<&mut [u8]>,
        n: usize,
        flags: BufFlags,
    ) -> Result<()> {
        self.list_pull_offset(id, out, n, 0, flags)
    }

    /// Pull at an offset from the head. Non-`INPLACE` pulls must start at
    /// the head (offset 0) or use `TAIL`.
    pub fn list_pull_offset(
        &mut self,
        id: ListId,
        mut out: Option<&mut [u8]>,
        n: usize,
        offset: usize,
        flags: BufFlags,
    ) -> Result<()> {
        let total = self.lists[id as usize].total;
        if offset + n > total {
            return Err(Error::BufferNoSpace);
        }

        if flags.contains(BufFlags::INPLACE) {
            let mut skip = if flags.contains(BufFlags::TAIL) {
                total - offset - n
            } else {
                offset
            };
            let mut copied = 0usize;
            let mut b = self.lists[id as usize].head;
            while let Some(bid) = b {
                let blen = self.bufs[bid as usize].len;
                if skip >= blen {
                    skip -= blen;
                    b = self.bufs[bid as usize].next;
                    continue;
                }
                let take = (blen - skip).min(n - copied);
                if let Some(out) = out.as_deref_mut() {
                    let start = self.slot(bid).start + self.bufs[bid as usize].cur + skip;
                    out[copied..copied + take].copy_from_slice(&self.mem[start..start + take]);
                }
                copied += take;
                if copied == n {
                    break;
                }
                skip = 0;
                b = self.bufs[bid as usize].next;
            }
            if let Some(out) = out {
                reverse_if_packed(out, flags);
            }
            return Ok(());
        }

        if flags.contains(BufFlags::TAIL) {
            debug_assert_eq!(offset, 0);
            // Trim from the tail end.
            let mut remaining = n;
            while remaining > 0 {
                let tail = self.lists[id as usize].tail.expect("non-empty list");
                let blen = self.bufs[tail as usize].len;
                let take = blen.min(remaining);
                self.buf_pull(tail, None, take, BufFlags::TAIL)?;
                self.lists[id as usize].total -= take;
                remaining -= take;
                if self.bufs[tail as usize].len == 0 {
                    self.unlink_tail(id);
                    self.add_buf(tail);
                }
            }
            return Ok(());
        }

        debug_assert_eq!(offset, 0);
        let mut copied = 0usize;
        while copied < n {
            let head = self.lists[id as usize].head.expect("non-empty list");
            let blen = self.bufs[head as usize].len;
            let take = blen.min(n - copied);
            match out.as_deref_mut() {
                Some(out) => {
                    self.buf_pull(head, Some(&mut out[copied..copied + take]), take, BufFlags::empty())?
                }
                None => self.buf_pull(head, None, take, BufFlags::empty())?,
            }
            self.lists[id as usize].total -= take;
            copied += take;
            if self.bufs[head as usize].len == 0 {
                let next = self.bufs[head as usize].next;
                self.lists[id as usize].head = next;
                if next.is_none() {
                    self.lists[id as usize].tail = None;
                }
                self.add_buf(head);
            }
        }
        if let Some(out) = out {
            reverse_if_packed(out, flags);
        }
        Ok(())
    }

    fn unlink_tail(&mut self, id: ListId) {
        let node = &self.lists[id as usize];
        let tail = node.tail.expect("non-empty list");
        let mut prev = None;
        let mut b = node.head;
        while let Some(bid) = b {
            if bid == tail {
                break;
            }
            prev = Some(bid);
            b = self.bufs[bid as usize].next;
        }
        match prev {
            Some(prev) => {
                self.bufs[prev as usize].next = None;
                self.lists[id as usize].tail = Some(prev);
            }
            None => {
                self.lists[id as usize].head = None;
                self.lists[id as usize].tail = None;
            }
        }
    }

    /// Relink every buffer of `src` onto `dst` (`HEAD` prepends); `src`
    /// is left empty but stays checked out.
    pub fn list_move_data(&mut self, dst: ListId, src: ListId, flags: BufFlags) {
        let (src_head, src_tail, src_total) = {
            let node = &mut self.lists[src as usize];
            let r = (node.head, node.tail, node.total);
            node.head = None;
            node.tail = None;
            node.total = 0;
            r
        };
        let (Some(sh), Some(st)) = (src_head, src_tail) else {
            return;
        };
        let (dst_head, dst_tail) = {
            let node = &self.lists[dst as usize];
            (node.head, node.tail)
        };
        if flags.contains(BufFlags::HEAD) {
            self.bufs[st as usize].next = dst_head;
            let node = &mut self.lists[dst as usize];
            node.head = Some(sh);
            if dst_tail.is_none() {
                node.tail = Some(st);
            }
        } else {
            match dst_tail {
                Some(tail) => self.bufs[tail as usize].next = Some(sh),
                None => self.lists[dst as usize].head = Some(sh),
            }
            self.lists[dst as usize].tail = Some(st);
        }
        self.lists[dst as usize].total += src_total;
    }

    /// Split a list at byte `at`: the tail part moves to a new list
    /// allocated from the pool.
    pub fn list_divide(&mut self, id: ListId, at: usize, flags: BufFlags) -> Result<ListId> {
        let total = self.lists[id as usize].total;
        if at > total {
            return Err(Error::BufferNoSpace);
        }
        let new = self.get_list(flags)?;

        // Find the buffer containing byte `at` and split inside it if the
        // boundary is not already a buffer boundary.
        let mut consumed = 0usize;
        let mut prev: Option<BufId> = None;
        let mut b = self.lists[id as usize].head;
        let mut split_head: Option<BufId> = None;
        while let Some(bid) = b {
            let blen = self.bufs[bid as usize].len;
            if consumed + blen == at {
                split_head = self.bufs[bid as usize].next;
                self.bufs[bid as usize].next = None;
                prev = Some(bid);
                break;
            }
            if consumed + blen > at {
                let inner = at - consumed;
                if inner == 0 {
                    split_head = Some(bid);
                    if let Some(p) = prev {
                        self.bufs[p as usize].next = None;
                    }
                } else {
                    match self.buf_divide(bid, inner, flags) {
                        Ok(tail_buf) => {
                            self.bufs[tail_buf as usize].next = self.bufs[bid as usize].next;
                            self.bufs[bid as usize].next = None;
                            split_head = Some(tail_buf);
                            prev = Some(bid);
                        }
                        Err(e) => {
                            self.add_list(new, BufKind::ListFree, BufFlags::empty());
                            return Err(e);
                        }
                    }
                }
                break;
            }
            consumed += blen;
            prev = Some(bid);
            b = self.bufs[bid as usize].next;
        }

        // Rewire both lists.
        let old = &mut self.lists[id as usize];
        let old_tail = old.tail;
        old.total = at;
        if at == 0 {
            old.head = None;
            old.tail = None;
        } else {
            old.tail = prev;
        }
        let new_node = &mut self.lists[new as usize];
        new_node.head = split_head;
        new_node.tail = if split_head.is_some() { old_tail } else { None };
        // The divided buffer may have become the new chain's tail.
        if let Some(sh) = split_head {
            if self.bufs[sh as usize].next.is_none() {
                self.lists[new as usize].tail = Some(sh);
            }
        }
        self.lists[new as usize].total = total - at;
        Ok(new)
    }

    /// Append `src`'s data to `dst` and return `src`'s head to the pool.
    pub fn list_merge(&mut self, dst: ListId, src: ListId) {
        self.list_move_data(dst, src, BufFlags::empty());
        self.add_list(src, BufKind::ListFree, BufFlags::empty());
    }

    /// Visit the list's bytes in `offset..offset + len` as contiguous
    /// slices.
    pub fn list_for_each(
        &self,
        id: ListId,
        offset: usize,
        len: usize,
        mut f: impl FnMut(&[u8]),
    ) -> Result<()> {
        if offset + len > self.lists[id as usize].total {
            return Err(Error::BufferNoSpace);
        }
        let mut skip = offset;
        let mut remaining = len;
        let mut b = self.lists[id as usize].head;
        while let Some(bid) = b {
            if remaining == 0 {
                break;
            }
            let blen = self.bufs[bid as usize].len;
            if skip >= blen {
                skip -= blen;
                b = self.bufs[bid as usize].next;
                continue;
            }
            let take = (blen - skip).min(remaining);
            let start = self.slot(bid).start + self.bufs[bid as usize].cur + skip;
            f(&self.mem[start..start + take]);
            remaining -= take;
            skip = 0;
            b = self.bufs[bid as usize].next;
        }
        Ok(())
    }

    /// Gather the whole list into a vector (diagnostics, drivers that
    /// need contiguous frames).
    pub fn list_to_vec(&self, id: ListId) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.lists[id as usize].total);
        let _ = self.list_for_each(id, 0, self.lists[id as usize].total, |chunk| {
            out.extend_from_slice(chunk)
        });
        out
    }

    /// Pool consistency: totals match member lengths and the tail
    /// terminates the chain. Debug builds call this from tests.
    pub fn check_list(&self, id: ListId) -> bool {
        let node = &self.lists[id as usize];
        let mut sum = 0;
        let mut b = node.head;
        let mut last = None;
        while let Some(bid) = b {
            sum += self.bufs[bid as usize].len;
            last = Some(bid);
            b = self.bufs[bid as usize].next;
        }
        sum == node.total && last == node.tail
    }
}

/// Longest value the PACKED byte-reversal handles; covers every on-wire
/// integer this stack pushes.
const PACKED_MAX: usize = 16;

fn maybe_packed<'a>(data: &'a [u8], flags: BufFlags, scratch: &'a mut [u8; PACKED_MAX]) -> Result<&'a [u8]> {
    if !flags.contains(BufFlags::PACKED) {
        return Ok(data);
    }
    if data.len() > PACKED_MAX {
        return Err(Error::InvalidBufferType);
    }
    for (i, b) in data.iter().rev().enumerate() {
        scratch[i] = *b;
    }
    Ok(&scratch[..data.len()])
}

fn copy_maybe_packed(dst: &mut [u8], src: &[u8], flags: BufFlags) {
    if flags.contains(BufFlags::PACKED) {
        for (d, s) in dst.iter_mut().zip(src.iter().rev()) {
            *d = *s;
        }
    } else {
        dst.copy_from_slice(src);
    }
}

fn reverse_if_packed(out: &mut [u8], flags: BufFlags) {
    if flags.contains(BufFlags::PACKED) {
        out.reverse();
    }
}

// Descriptor-level wrappers: blocking allocation, free-callback handling
// and DATA_AVAILABLE / SPACE_AVAILABLE housekeeping.

const KIND_BUF: u32 = 1;
const KIND_LIST: u32 = 2;

/// Whether the descriptor's pool is at or below its reserved margin.
pub fn threshold_locked(fd: &FdRef) -> bool {
    fd.with_pool(|pool| pool.threshold_locked())
}

/// Allocate a list head from the descriptor's pool; `SUSPEND` blocks on
/// the pool condition until the request (plus any `TH` margin) is
/// satisfiable.
pub fn get_list(fd: &FdRef, flags: BufFlags) -> Result<ListId> {
    loop {
        let (got, needed) = fd.with_pool(|pool| {
            let needed = pool.margin(BufKind::ListFree, flags) + 1;
            (pool.get_list(flags).ok(), needed)
        });
        if let Some(id) = got {
            return Ok(id);
        }
        if !flags.contains(BufFlags::SUSPEND) {
            return Err(Error::BufferNoSpace);
        }
        let suspend = Suspend::new(
            SuspendParam {
                flag: KIND_LIST,
                num: needed as u32,
            },
            fd.priority(),
            None,
        );
        suspend_on(&[&fd.buffer_condition], &suspend, || {
            fd.with_pool(|pool| pool.free_list_heads() < needed)
        })?;
    }
}

/// Allocate a single buffer from the descriptor's pool; `SUSPEND` blocks
/// like [`get_list`].
pub fn get_buf(fd: &FdRef, flags: BufFlags) -> Result<BufId> {
    loop {
        let (got, needed, drained) = fd.with_pool(|pool| {
            let needed = pool.margin(BufKind::Free, flags) + 1;
            let got = pool.get_buf(flags).ok();
            (got, needed, pool.free_buffers() == 0)
        });
        if drained {
            fd.space_consumed();
        }
        if let Some(id) = got {
            return Ok(id);
        }
        if !flags.contains(BufFlags::SUSPEND) {
            return Err(Error::BufferNoSpace);
        }
        let suspend = Suspend::new(
            SuspendParam {
                flag: KIND_BUF,
                num: needed as u32,
            },
            fd.priority(),
            None,
        );
        suspend_on(&[&fd.buffer_condition], &suspend, || {
            fd.with_pool(|pool| pool.free_buffers() < needed)
        })?;
    }
}

/// Take the next queued RX (or TX) list from the descriptor, clearing
/// `DATA_AVAILABLE` when the RX queue drains.
pub fn get_queued(fd: &FdRef, kind: BufKind, flags: BufFlags) -> Option<ListId> {
    let (got, rx_empty) = fd.with_pool(|pool| {
        let got = pool.get_queued(kind, flags);
        (got, pool.rx_count() == 0)
    });
    if kind == BufKind::Rx && !flags.contains(BufFlags::INPLACE) && rx_empty {
        fd.data_flushed();
    }
    got
}

/// Return (or queue) a list on the descriptor, running its free callback
/// first; `ACTIVE` wakes waiters, otherwise only the state flags are set.
pub fn add_list(fd: &FdRef, id: ListId, kind: BufKind, flags: BufFlags) {
    if matches!(kind, BufKind::Free | BufKind::ListFree) {
        if let Some((hook, data)) = fd.with_pool(|pool| pool.take_free_hook(id)) {
            if hook(&data, id) {
                // The callback kept the list.
                return;
            }
        }
    }

    let (free_bufs, free_lists) = fd.with_pool(|pool| {
        pool.add_list(id, kind, flags);
        (pool.free_buffers(), pool.free_list_heads())
    });

    match kind {
        BufKind::Free | BufKind::ListFree => {
            if flags.contains(BufFlags::ACTIVE) {
                fd.space_available();
            } else {
                fd.set_flag(FdFlags::SPACE_AVAILABLE);
            }
            resume_pool_waiters(fd, free_bufs, free_lists);
        }
        BufKind::Rx => {
            if flags.contains(BufFlags::ACTIVE) {
                fd.data_available();
            } else {
                fd.set_flag(FdFlags::DATA_AVAILABLE);
            }
        }
        BufKind::Tx => {}
    }
}

/// Return a single buffer to the descriptor's pool.
pub fn add_buf(fd: &FdRef, id: BufId, flags: BufFlags) {
    let (free_bufs, free_lists) = fd.with_pool(|pool| {
        pool.add_buf(id);
        (pool.free_buffers(), pool.free_list_heads())
    });
    if flags.contains(BufFlags::ACTIVE) {
        fd.space_available();
    } else {
        fd.set_flag(FdFlags::SPACE_AVAILABLE);
    }
    resume_pool_waiters(fd, free_bufs, free_lists);
}

fn resume_pool_waiters(fd: &FdRef, free_bufs: usize, free_lists: usize) {
    fd.buffer_condition.resume(&Resume {
        filter: Some(&move |p: &SuspendParam| match p.flag {
            KIND_BUF => free_bufs >= p.num as usize,
            KIND_LIST => free_lists >= p.num as usize,
            _ => false,
        }),
        status: Ok(()),
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pool() -> BufferPool {
        BufferPool::new(8, 64, 4, 2, 1)
    }

    #[test]
    fn test_push_pull_round_trip() {
        let mut p = pool();
        let l = p.get_list(BufFlags::empty()).unwrap();
        let data = [1u8, 2, 3, 4, 5];
        p.list_push(l, &data, BufFlags::empty()).unwrap();
        assert_eq!(p.list_len(l), 5);
        assert!(p.check_list(l));

        let mut out = [0u8; 5];
        p.list_pull(l, Some(&mut out), 5, BufFlags::INPLACE).unwrap();
        assert_eq!(out, data);
        assert_eq!(p.list_len(l), 5);

        p.list_pull(l, Some(&mut out), 5, BufFlags::empty()).unwrap();
        assert_eq!(out, data);
        assert_eq!(p.list_len(l), 0);
    }

    #[test]
    fn test_packed_is_network_order() {
        let mut p = pool();
        let l = p.get_list(BufFlags::empty()).unwrap();
        p.list_push(l, &0xBEEFu16.to_le_bytes(), BufFlags::PACKED)
            .unwrap();
        assert_eq!(p.list_to_vec(l), alloc::vec![0xBE, 0xEF]);

        let mut out = [0u8; 2];
        p.list_pull(l, Some(&mut out), 2, BufFlags::PACKED | BufFlags::INPLACE)
            .unwrap();
        assert_eq!(u16::from_le_bytes(out), 0xBEEF);
    }

    #[test]
    fn test_head_push_prepends_headers() {
        let mut p = pool();
        let l = p.get_list(BufFlags::empty()).unwrap();
        p.list_push(l, b"payload", BufFlags::empty()).unwrap();
        p.list_push(l, b"HDR", BufFlags::HEAD).unwrap();
        assert_eq!(p.list_to_vec(l), b"HDRpayload");
        assert!(p.check_list(l));
    }

    #[test]
    fn test_list_spans_multiple_buffers() {
        let mut p = BufferPool::new(8, 16, 2, 0, 0);
        let l = p.get_list(BufFlags::empty()).unwrap();
        let data: Vec<u8> = (0..40).collect();
        p.list_push(l, &data, BufFlags::empty()).unwrap();
        assert_eq!(p.list_len(l), 40);
        assert_eq!(p.free_buffers(), 5);
        assert_eq!(p.list_to_vec(l), data);

        // Destructive pull returns emptied members to the free queue.
        let mut out = alloc::vec![0u8; 20];
        p.list_pull(l, Some(&mut out), 20, BufFlags::empty()).unwrap();
        assert_eq!(&out[..], &data[..20]);
        assert_eq!(p.list_len(l), 20);
        assert!(p.free_buffers() >= 6);
        assert!(p.check_list(l));
    }

    #[test]
    fn test_threshold_margin_blocks_allocation() {
        let mut p = pool();
        // threshold_bufs = 2: with TH, only 6 of the 8 are usable.
        let mut taken = Vec::new();
        for _ in 0..6 {
            taken.push(p.get_buf(BufFlags::TH).unwrap());
        }
        assert!(p.get_buf(BufFlags::TH).is_err());
        assert!(p.get_buf(BufFlags::empty()).is_ok());
        assert!(p.threshold_locked());
        for b in taken {
            p.add_buf(b);
        }
    }

    #[test]
    fn test_divide_and_merge_reconstruct() {
        let mut p = BufferPool::new(8, 16, 4, 0, 0);
        let l = p.get_list(BufFlags::empty()).unwrap();
        let data: Vec<u8> = (0..50).collect();
        p.list_push(l, &data, BufFlags::empty()).unwrap();

        let tail = p.list_divide(l, 23, BufFlags::empty()).unwrap();
        assert_eq!(p.list_len(l), 23);
        assert_eq!(p.list_len(tail), 27);
        assert!(p.check_list(l));
        assert!(p.check_list(tail));
        assert_eq!(p.list_to_vec(l), &data[..23]);
        assert_eq!(p.list_to_vec(tail), &data[23..]);

        p.list_merge(l, tail);
        assert_eq!(p.list_to_vec(l), data);
        assert!(p.check_list(l));
    }

    #[test]
    fn test_divide_at_buffer_boundary() {
        let mut p = BufferPool::new(8, 16, 4, 0, 0);
        let l = p.get_list(BufFlags::empty()).unwrap();
        let data: Vec<u8> = (0..32).collect();
        p.list_push(l, &data, BufFlags::empty()).unwrap();
        let tail = p.list_divide(l, 16, BufFlags::empty()).unwrap();
        assert_eq!(p.list_to_vec(l), &data[..16]);
        assert_eq!(p.list_to_vec(tail), &data[16..]);
        assert!(p.check_list(l));
        assert!(p.check_list(tail));
    }

    #[test]
    fn test_buffer_conservation() {
        let mut p = pool();
        let l = p.get_list(BufFlags::empty()).unwrap();
        p.list_push(l, &[0u8; 100], BufFlags::empty()).unwrap();
        let on_list = 100usize.div_ceil(64);
        assert_eq!(p.free_buffers() + on_list, p.num_buffers());
        p.add_list(l, BufKind::ListFree, BufFlags::empty());
        assert_eq!(p.free_buffers(), p.num_buffers());
        assert_eq!(p.free_list_heads(), p.num_lists());
    }

    #[test]
    fn test_update_patch_at_offset() {
        let mut p = pool();
        let l = p.get_list(BufFlags::empty()).unwrap();
        p.list_push(l, &[0u8; 10], BufFlags::empty()).unwrap();
        p.list_push_offset(l, &0xABCDu16.to_le_bytes(), 4, BufFlags::UPDATE | BufFlags::PACKED)
            .unwrap();
        let bytes = p.list_to_vec(l);
        assert_eq!(&bytes[4..6], &[0xAB, 0xCD]);
        assert_eq!(p.list_len(l), 10);
    }

    #[test]
    fn test_tail_trim_strips_padding() {
        let mut p = pool();
        let l = p.get_list(BufFlags::empty()).unwrap();
        p.list_push(l, b"datapadding", BufFlags::empty()).unwrap();
        p.list_pull(l, None, 7, BufFlags::TAIL).unwrap();
        assert_eq!(p.list_to_vec(l), b"data");
        assert!(p.check_list(l));
    }

    #[test]
    fn test_add_head_reserves_room() {
        let mut p = pool();
        let b = p.get_buf(BufFlags::empty()).unwrap();
        p.buf_push(b, b"abc", BufFlags::empty()).unwrap();
        assert_eq!(p.buf_headroom(b), 0);
        p.buf_add_head(b, 8).unwrap();
        assert_eq!(p.buf_headroom(b), 8);
        assert_eq!(p.buf_bytes(b), b"abc");
    }

    #[test]
    fn test_move_data_relinks() {
        let mut p = pool();
        let a = p.get_list(BufFlags::empty()).unwrap();
        let b = p.get_list(BufFlags::empty()).unwrap();
        p.list_push(a, b"aaa", BufFlags::empty()).unwrap();
        p.list_push(b, b"bbb", BufFlags::empty()).unwrap();
        p.list_move_data(a, b, BufFlags::empty());
        assert_eq!(p.list_to_vec(a), b"aaabbb");
        assert_eq!(p.list_len(b), 0);
        assert!(p.check_list(a));
        assert!(p.check_list(b));
    }
}
