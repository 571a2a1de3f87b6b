//! File-descriptor layer.
//!
//! Every I/O object — serial port, network device, TCP port — registers a
//! descriptor with a name, flag bits, a read/write/ioctl vtable, an
//! embedded condition used for blocking I/O, an optional buffer pool, and
//! an optional chain link for fan-out writes.
//!
//! Paths use `\` as separator. Lookup prefix-matches registered roots: a
//! root `\ethernet` serves a request for `\ethernet\eth0` by consuming the
//! prefix and passing the remainder to its `open` callback.

pub mod buffer;

use alloc::boxed::Box;
use alloc::string::String;
use alloc::sync::{Arc, Weak};
use alloc::vec::Vec;
use core::any::Any;

use bitflags::bitflags;
use lazy_static::lazy_static;
use spin::Mutex;

use crate::kernel::condition::{suspend_on, Condition, Resume, Suspend, SuspendParam};
use crate::kernel::semaphore::Semaphore;
use crate::kernel::tick::{self, Tick};
use crate::status::{Error, Result};

use buffer::BufferPool;

bitflags! {
    /// Descriptor flag bits.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct FdFlags: u32 {
        /// Reads and writes may suspend the caller.
        const BLOCK = 1 << 0;
        /// Descriptor carries a buffer pool.
        const BUFFERED = 1 << 1;
        /// At least one RX list is queued.
        const DATA_AVAILABLE = 1 << 2;
        /// A write can currently make progress.
        const SPACE_AVAILABLE = 1 << 3;
        /// Writes loop until every byte is accepted.
        const FLUSH_WRITE = 1 << 4;
        /// Head of a descriptor chain.
        const CHAIN_HEAD = 1 << 5;
        /// Buffered writes proceed without waiting for space.
        const WRITE_NO_BLOCK = 1 << 6;
    }
}

/// Suspend-flag word: waiting for data to read.
pub const FS_BLOCK_READ: u32 = 1;
/// Suspend-flag word: waiting for space to write.
pub const FS_BLOCK_WRITE: u32 = 2;

/// Chain membership. A descriptor is standalone, the head of a chain, or
/// a member of exactly one chain; the states are mutually exclusive.
pub enum Chain {
    None,
    Head { children: Vec<FdRef> },
    Member { head: Weak<Fd> },
}

/// Mutable descriptor state, guarded by the descriptor's lock.
pub struct FdState {
    pub flags: FdFlags,
    pub chain: Chain,
    pub pool: Option<BufferPool>,
    /// Read/write wait timeout in ticks; `None` waits forever.
    pub timeout: Option<Tick>,
    /// Wake priority for tasks suspended on this descriptor.
    pub priority: u8,
    /// Driver- or protocol-private data (downcast by the vtable owner).
    pub private: Option<Box<dyn Any + Send>>,
}

/// Descriptor vtable.
pub trait FdOps: Send + Sync {
    /// Open a node below this root; `rest` is the path remainder after
    /// the registered prefix.
    fn open(&self, _fd: &FdRef, _rest: &str, _flags: FdFlags) -> Result<FdRef> {
        Err(Error::NotSupported)
    }

    fn close(&self, _fd: &FdRef) {}

    fn read(&self, _fd: &FdRef, _buf: &mut [u8]) -> Result<usize> {
        Err(Error::NotSupported)
    }

    fn write(&self, _fd: &FdRef, _data: &[u8]) -> Result<usize> {
        Err(Error::NotSupported)
    }

    fn ioctl(&self, _fd: &FdRef, _cmd: u32, _arg: &mut dyn Any) -> Result<()> {
        Err(Error::NotSupported)
    }
}

/// A registered descriptor.
pub struct Fd {
    name: String,
    state: Mutex<FdState>,
    /// Blocking-I/O wait queue (read and write waiters, by flag).
    pub condition: Condition,
    /// Buffer-pool threshold wait queue.
    pub buffer_condition: Condition,
    ops: Box<dyn FdOps>,
}

pub type FdRef = Arc<Fd>;

impl Fd {
    pub fn new(name: &str, flags: FdFlags, ops: Box<dyn FdOps>) -> FdRef {
        Arc::new(Fd {
            name: String::from(name),
            state: Mutex::new(FdState {
                flags,
                chain: Chain::None,
                pool: None,
                timeout: None,
                priority: 0,
                private: None,
            }),
            condition: Condition::new(),
            buffer_condition: Condition::new(),
            ops,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Run `f` under the descriptor lock.
    pub fn with_state<R>(&self, f: impl FnOnce(&mut FdState) -> R) -> R {
        f(&mut self.state.lock())
    }

    /// Run `f` on the descriptor's buffer pool. Panics if the descriptor
    /// is not buffered; callers check `BUFFERED` first.
    pub fn with_pool<R>(&self, f: impl FnOnce(&mut BufferPool) -> R) -> R {
        let mut state = self.state.lock();
        f(state.pool.as_mut().expect("descriptor has no buffer pool"))
    }

    pub fn flags(&self) -> FdFlags {
        self.state.lock().flags
    }

    pub fn set_flag(&self, flag: FdFlags) {
        self.state.lock().flags.insert(flag);
    }

    pub fn clear_flag(&self, flag: FdFlags) {
        self.state.lock().flags.remove(flag);
    }

    pub fn priority(&self) -> u8 {
        self.state.lock().priority
    }

    /// Attach a buffer pool and mark the descriptor buffered.
    pub fn set_pool(&self, pool: BufferPool) {
        let mut state = self.state.lock();
        state.pool = Some(pool);
        state.flags.insert(FdFlags::BUFFERED | FdFlags::SPACE_AVAILABLE);
    }

    fn resume_waiters(&self, flag: u32, status: crate::kernel::condition::Status) {
        self.condition.resume(&Resume {
            filter: Some(&move |p: &SuspendParam| p.flag & flag != 0),
            status,
        });
    }

    /// New data is readable: set the flag and wake read waiters.
    pub fn data_available(&self) {
        self.set_flag(FdFlags::DATA_AVAILABLE);
        self.resume_waiters(FS_BLOCK_READ, Ok(()));
    }

    /// Nothing left to read.
    pub fn data_flushed(&self) {
        self.clear_flag(FdFlags::DATA_AVAILABLE);
    }

    /// Space freed up: set the flag and wake write waiters.
    pub fn space_available(&self) {
        self.set_flag(FdFlags::SPACE_AVAILABLE);
        self.resume_waiters(FS_BLOCK_WRITE, Ok(()));
    }

    /// No room left to write.
    pub fn space_consumed(&self) {
        self.clear_flag(FdFlags::SPACE_AVAILABLE);
    }

    /// Wake readers and writers with an error status (used when a port
    /// closes underneath its callers).
    pub fn resume_all(&self, status: crate::kernel::condition::Status) {
        self.resume_waiters(FS_BLOCK_READ | FS_BLOCK_WRITE, status);
    }
}

struct Registry {
    lock: Semaphore,
    roots: Mutex<Vec<FdRef>>,
}

lazy_static! {
    static ref REGISTRY: Registry = Registry {
        lock: Semaphore::new(1, 1),
        roots: Mutex::new(Vec::new()),
    };
}

/// Register a descriptor as a path root.
pub fn fs_register(fd: FdRef) -> Result<()> {
    REGISTRY.lock.obtain(None)?;
    REGISTRY.roots.lock().push(fd);
    REGISTRY.lock.release();
    Ok(())
}

/// Remove a descriptor from the registry.
pub fn fs_unregister(fd: &FdRef) -> Result<()> {
    REGISTRY.lock.obtain(None)?;
    REGISTRY.roots.lock().retain(|r| !Arc::ptr_eq(r, fd));
    REGISTRY.lock.release();
    Ok(())
}

/// Match `path` against a registered root name. Returns the unmatched
/// remainder on success (empty string for an exact match).
fn path_match<'a>(name: &str, path: &'a str) -> Option<&'a str> {
    let rest = path.strip_prefix(name)?;
    if rest.is_empty() {
        return Some(rest);
    }
    // Component boundary only.
    rest.strip_prefix('\\')
}

/// Resolve a path to a descriptor. Exact matches resolve directly; prefix
/// matches delegate the remainder to the root's `open`.
pub fn fs_open(path: &str, flags: FdFlags) -> Result<FdRef> {
    REGISTRY.lock.obtain(None)?;
    let found = {
        let roots = REGISTRY.roots.lock();
        roots
            .iter()
            .find_map(|root| path_match(root.name(), path).map(|rest| (root.clone(), String::from(rest))))
    };
    REGISTRY.lock.release();

    match found {
        Some((root, rest)) if rest.is_empty() => Ok(root),
        Some((root, rest)) => root.ops.open(&root, &rest, flags),
        None => Err(Error::InvalidFd),
    }
}

/// Close a descriptor and null the caller's handle.
pub fn fs_close(fd: &mut Option<FdRef>) {
    if let Some(fd) = fd.take() {
        fd.ops.close(&fd);
    }
}

/// Read from a descriptor. On a `BLOCK` descriptor with no data
/// available, suspends until data arrives, the descriptor's timeout
/// expires (`ReadTimeout`), or the wait is resumed with an error.
pub fn fs_read(fd: &FdRef, buf: &mut [u8]) -> Result<usize> {
    let (flags, timeout, priority) = {
        let state = fd.state.lock();
        (state.flags, state.timeout, state.priority)
    };

    if flags.contains(FdFlags::BLOCK) && !flags.contains(FdFlags::DATA_AVAILABLE) {
        let deadline = timeout.map(|t| tick::current_system_tick().wrapping_add(t));
        let suspend = Suspend::new(
            SuspendParam {
                flag: FS_BLOCK_READ,
                num: 0,
            },
            priority,
            deadline,
        );
        let waited = suspend_on(&[&fd.condition], &suspend, || {
            !fd.flags().contains(FdFlags::DATA_AVAILABLE)
        });
        match waited {
            Ok(()) => {}
            Err(Error::ConditionTimeout) => return Err(Error::ReadTimeout),
            Err(e) => return Err(e),
        }
    }

    if !fd.flags().contains(FdFlags::DATA_AVAILABLE) {
        return Ok(0);
    }

    let read = fd.ops.read(fd, buf)?;

    let flags = fd.flags();
    if flags.contains(FdFlags::DATA_AVAILABLE) {
        fd.data_available();
    }
    if flags.contains(FdFlags::SPACE_AVAILABLE) {
        fd.space_available();
    }
    Ok(read)
}

fn write_one(fd: &FdRef, data: &[u8]) -> Result<usize> {
    let (flags, timeout, priority) = {
        let state = fd.state.lock();
        (state.flags, state.timeout, state.priority)
    };
    let mut written = 0usize;
    let mut rest = data;

    loop {
        let flags_now = fd.flags();
        let can_skip_wait = flags_now.contains(FdFlags::SPACE_AVAILABLE)
            || (flags_now.contains(FdFlags::BUFFERED) && flags_now.contains(FdFlags::WRITE_NO_BLOCK));

        if flags.contains(FdFlags::BLOCK) && !can_skip_wait {
            let deadline = timeout.map(|t| tick::current_system_tick().wrapping_add(t));
            let suspend = Suspend::new(
                SuspendParam {
                    flag: FS_BLOCK_WRITE,
                    num: 0,
                },
                priority,
                deadline,
            );
            suspend_on(&[&fd.condition], &suspend, || {
                let f = fd.flags();
                !(f.contains(FdFlags::SPACE_AVAILABLE)
                    || (f.contains(FdFlags::BUFFERED) && f.contains(FdFlags::WRITE_NO_BLOCK)))
            })?;
        }

        let n = fd.ops.write(fd, rest)?;
        written += n;
        rest = &rest[n.min(rest.len())..];

        if !(flags.contains(FdFlags::FLUSH_WRITE) && !rest.is_empty()) {
            break;
        }
    }

    let flags = fd.flags();
    if flags.contains(FdFlags::DATA_AVAILABLE) {
        fd.data_available();
    }
    if flags.contains(FdFlags::SPACE_AVAILABLE) {
        fd.space_available();
    }
    Ok(written)
}

/// Write to a descriptor. Writing to a chain head fans the payload out to
/// every child and returns the average byte count; the head itself is a
/// pure multiplexer and is not written. The first child error aborts the
/// fan-out and propagates.
pub fn fs_write(fd: &FdRef, data: &[u8]) -> Result<usize> {
    let children: Option<Vec<FdRef>> = fd.with_state(|state| match &state.chain {
        Chain::Head { children } if state.flags.contains(FdFlags::CHAIN_HEAD) => {
            Some(children.clone())
        }
        _ => None,
    });

    match children {
        None => write_one(fd, data),
        Some(children) => {
            if children.is_empty() {
                return Ok(0);
            }
            let mut total = 0usize;
            for child in &children {
                total += write_one(child, data)?;
            }
            Ok(total / children.len())
        }
    }
}

/// Execute a control command on a descriptor.
pub fn fs_ioctl(fd: &FdRef, cmd: u32, arg: &mut dyn Any) -> Result<()> {
    fd.ops.ioctl(fd, cmd, arg)
}

/// Connect `fd` into the chain headed by `head`. The head becomes (or
/// stays) a chain head; `fd` must be standalone.
pub fn fs_connect(fd: &FdRef, head: &FdRef) -> Result<()> {
    fd.with_state(|state| {
        if state.flags.contains(FdFlags::CHAIN_HEAD) {
            return Err(Error::InvalidFd);
        }
        match state.chain {
            Chain::None => {
                state.chain = Chain::Member {
                    head: Arc::downgrade(head),
                };
                Ok(())
            }
            _ => Err(Error::InvalidFd),
        }
    })?;

    head.with_state(|state| {
        state.flags.insert(FdFlags::CHAIN_HEAD);
        match &mut state.chain {
            Chain::Head { children } => children.push(fd.clone()),
            Chain::None => {
                state.chain = Chain::Head {
                    children: alloc::vec![fd.clone()],
                };
            }
            Chain::Member { .. } => return Err(Error::InvalidFd),
        }
        Ok(())
    })
}

/// Disconnect `fd` from its chain head.
pub fn fs_disconnect(fd: &FdRef) -> Result<()> {
    let head = fd.with_state(|state| {
        if state.flags.contains(FdFlags::CHAIN_HEAD) {
            return Err(Error::InvalidFd);
        }
        match core::mem::replace(&mut state.chain, Chain::None) {
            Chain::Member { head } => Ok(head.upgrade()),
            other => {
                state.chain = other;
                Err(Error::InvalidFd)
            }
        }
    })?;

    if let Some(head) = head {
        head.with_state(|state| {
            if let Chain::Head { children } = &mut state.chain {
                children.retain(|c| !Arc::ptr_eq(c, fd));
                if children.is_empty() {
                    state.chain = Chain::None;
                    state.flags.remove(FdFlags::CHAIN_HEAD);
                }
            }
        });
    }
    Ok(())
}

#[doc(hidden)]
pub fn reset() {
    REGISTRY.roots.lock().clear();
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::sync::atomic::{AtomicUsize, Ordering};

    fn lock_tests() -> std::sync::MutexGuard<'static, ()> {
        crate::testutil::lock()
    }

    struct SinkOps {
        accepted: Arc<AtomicUsize>,
    }

    impl FdOps for SinkOps {
        fn write(&self, _fd: &FdRef, data: &[u8]) -> Result<usize> {
            self.accepted.fetch_add(data.len(), Ordering::SeqCst);
            Ok(data.len())
        }
    }

    struct EchoOps;

    impl FdOps for EchoOps {
        fn open(&self, fd: &FdRef, rest: &str, _flags: FdFlags) -> Result<FdRef> {
            if rest == "sub" {
                Ok(fd.clone())
            } else {
                Err(Error::InvalidFd)
            }
        }
    }

    #[test]
    fn test_registry_exact_and_prefix_match() {
        let _g = lock_tests();
        crate::sys_reset();
        let fd = Fd::new("\\echo", FdFlags::empty(), Box::new(EchoOps));
        fs_register(fd.clone()).unwrap();

        let exact = fs_open("\\echo", FdFlags::empty()).unwrap();
        assert!(Arc::ptr_eq(&exact, &fd));

        let sub = fs_open("\\echo\\sub", FdFlags::empty()).unwrap();
        assert!(Arc::ptr_eq(&sub, &fd));

        assert!(fs_open("\\echoes", FdFlags::empty()).is_err());
        assert!(fs_open("\\missing", FdFlags::empty()).is_err());
        fs_unregister(&fd).unwrap();
    }

    fn sink(name: &str) -> (FdRef, Arc<AtomicUsize>) {
        let accepted = Arc::new(AtomicUsize::new(0));
        let fd = Fd::new(
            name,
            FdFlags::SPACE_AVAILABLE,
            Box::new(SinkOps {
                accepted: accepted.clone(),
            }),
        );
        (fd, accepted)
    }

    #[test]
    fn test_chain_fanout_returns_average() {
        let _g = lock_tests();
        crate::sys_reset();
        let (head, head_seen) = sink("\\head");
        let (a, a_seen) = sink("\\a");
        let (b, b_seen) = sink("\\b");
        fs_connect(&a, &head).unwrap();
        fs_connect(&b, &head).unwrap();
        assert!(head.flags().contains(FdFlags::CHAIN_HEAD));

        let written = fs_write(&head, b"hello").unwrap();
        assert_eq!(written, 5);

        // Both children saw the payload; the head never did.
        assert_eq!(a_seen.load(Ordering::SeqCst), 5);
        assert_eq!(b_seen.load(Ordering::SeqCst), 5);
        assert_eq!(head_seen.load(Ordering::SeqCst), 0);

        fs_disconnect(&a).unwrap();
        fs_disconnect(&b).unwrap();
        assert!(!head.flags().contains(FdFlags::CHAIN_HEAD));
    }

    #[test]
    fn test_chain_states_are_exclusive() {
        let _g = lock_tests();
        crate::sys_reset();
        let (head, _) = sink("\\h");
        let (a, _) = sink("\\m");
        fs_connect(&a, &head).unwrap();
        // A member cannot join a second chain, a head cannot become a member.
        assert!(fs_connect(&a, &head).is_err());
        assert!(fs_connect(&head, &a).is_err());
        fs_disconnect(&a).unwrap();
        assert!(fs_disconnect(&a).is_err());
    }

    #[test]
    fn test_blocking_read_times_out() {
        let _g = lock_tests();
        crate::sys_reset();
        let fd = Fd::new("\\blk", FdFlags::BLOCK, Box::new(EchoOps));
        fd.with_state(|s| s.timeout = Some(10));
        let mut buf = [0u8; 4];
        assert_eq!(fs_read(&fd, &mut buf), Err(Error::ReadTimeout));
    }

    #[test]
    fn test_nonblocking_read_returns_zero_without_data() {
        let _g = lock_tests();
        crate::sys_reset();
        let fd = Fd::new("\\nb", FdFlags::empty(), Box::new(EchoOps));
        let mut buf = [0u8; 4];
        assert_eq!(fs_read(&fd, &mut buf), Ok(0));
    }
}
