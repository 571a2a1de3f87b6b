//! The condition / suspend / resume wait primitive.
//!
//! A [`Condition`] is a priority-ordered queue of suspended waiters plus a
//! one-shot `PING` flag an ISR can set. Sleep, semaphores, buffer-pool
//! thresholds and every blocking descriptor wait are expressed through it.
//!
//! `suspend_on` atomically re-tests the caller's predicate before sleeping:
//! if the predicate says the condition is already met, no suspend happens
//! and the call returns success immediately. Otherwise the waiter is
//! enqueued (ordered by `Suspend::priority`, FIFO within a priority) on
//! every given condition and the caller blocks until one of them resumes
//! it, the timeout expires, or no task or timer in the system can make
//! progress.
//!
//! Waking is filter-driven: `resume` walks the queue and wakes every waiter
//! whose `SuspendParam` matches, delivering the resume status. A `PING`
//! recorded before the walk guarantees at least one waiter wakes even when
//! the filter matches nobody, so a signal set by an ISR immediately before
//! the wait is never lost.

use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicBool, Ordering};

use spin::Mutex;

use crate::kernel::sched::{self, SleepWaiter, TaskId};
use crate::kernel::tick::Tick;
use crate::status::{Error, Result};

/// Resumption status delivered to a waiter.
pub type Status = Result<()>;

/// Caller words consulted by resume filters.
///
/// `flag` carries an event class (read/write, buffer kind); `num` carries a
/// count (buffers awaited). Their meaning belongs to the condition's owner.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SuspendParam {
    pub flag: u32,
    pub num: u32,
}

/// How a waiter wants to wait.
#[derive(Debug, Clone, Copy)]
pub struct Suspend {
    pub param: SuspendParam,
    /// Wake order among waiters; smaller wakes first.
    pub priority: u8,
    /// Absolute tick at which the wait expires with `ConditionTimeout`.
    pub timeout: Option<Tick>,
}

impl Suspend {
    pub fn new(param: SuspendParam, priority: u8, timeout: Option<Tick>) -> Self {
        Suspend {
            param,
            priority,
            timeout,
        }
    }
}

/// One enqueued wait. Shared between the waiter, the conditions it sits
/// on, and the sleep queue; whoever completes it first wins.
pub struct SuspendRecord {
    pub(crate) task: Option<TaskId>,
    pub param: SuspendParam,
    priority: u8,
    status: Mutex<Option<Status>>,
}

impl SuspendRecord {
    /// Deliver a status. Returns false if the record was already completed.
    pub(crate) fn complete(&self, status: Status) -> bool {
        let mut slot = self.status.lock();
        if slot.is_some() {
            return false;
        }
        *slot = Some(status);
        true
    }

    pub(crate) fn status(&self) -> Option<Status> {
        *self.status.lock()
    }

    pub(crate) fn is_done(&self) -> bool {
        self.status.lock().is_some()
    }
}

/// Wake-up request handed to [`Condition::resume`].
pub struct Resume<'a> {
    /// Waiters whose params pass the filter are woken; `None` wakes all.
    pub filter: Option<&'a dyn Fn(&SuspendParam) -> bool>,
    /// Status delivered to each woken waiter.
    pub status: Status,
}

impl Resume<'_> {
    pub fn all(status: Status) -> Resume<'static> {
        Resume {
            filter: None,
            status,
        }
    }
}

struct CondInner {
    waiters: Mutex<Vec<Arc<SuspendRecord>>>,
    ping: AtomicBool,
}

/// A kernel wait queue. Clones share the same queue.
#[derive(Clone)]
pub struct Condition {
    inner: Arc<CondInner>,
}

impl Default for Condition {
    fn default() -> Self {
        Self::new()
    }
}

impl Condition {
    pub fn new() -> Self {
        Condition {
            inner: Arc::new(CondInner {
                waiters: Mutex::new(Vec::new()),
                ping: AtomicBool::new(false),
            }),
        }
    }

    /// One-shot signal from ISR context. The next resume (or suspend racing
    /// with this ping) is guaranteed to wake at least one waiter.
    pub fn ping(&self) {
        self.inner.ping.store(true, Ordering::SeqCst);
    }

    fn take_ping(&self) -> bool {
        self.inner.ping.swap(false, Ordering::SeqCst)
    }

    pub fn has_waiters(&self) -> bool {
        self.inner.waiters.lock().iter().any(|r| !r.is_done())
    }

    fn enqueue(&self, record: Arc<SuspendRecord>) {
        let mut q = self.inner.waiters.lock();
        q.retain(|r| !r.is_done());
        // Priority-ordered insert, FIFO within equal priorities.
        let at = q
            .iter()
            .position(|r| r.priority > record.priority)
            .unwrap_or(q.len());
        q.insert(at, record);
    }

    fn remove(&self, record: &Arc<SuspendRecord>) {
        self.inner
            .waiters
            .lock()
            .retain(|r| !Arc::ptr_eq(r, record) && !r.is_done());
    }

    /// Wake every waiter matching `resume`, honouring a pending `PING`.
    pub fn resume(&self, resume: &Resume) {
        self.resume_limited(resume, usize::MAX)
    }

    /// Wake at most one matching waiter (semaphore hand-off).
    pub fn resume_one(&self, resume: &Resume) {
        self.resume_limited(resume, 1)
    }

    fn resume_limited(&self, resume: &Resume, limit: usize) {
        let mut woken: Vec<TaskId> = Vec::new();
        {
            let mut q = self.inner.waiters.lock();
            q.retain(|r| !r.is_done());

            let mut matched = 0usize;
            let mut i = 0usize;
            while i < q.len() && matched < limit {
                let pass = match resume.filter {
                    Some(f) => f(&q[i].param),
                    None => true,
                };
                if pass {
                    let record = q.remove(i);
                    if record.complete(resume.status) {
                        if let Some(task) = record.task {
                            woken.push(task);
                        }
                        matched += 1;
                    }
                } else {
                    i += 1;
                }
            }

            // A pending ping guarantees at least one wake-up. With nobody
            // queued the ping stays set for the next waiter to consume.
            if matched == 0 && !q.is_empty() && self.take_ping() {
                let record = q.remove(0);
                if record.complete(resume.status) {
                    if let Some(task) = record.task {
                        woken.push(task);
                    }
                }
            }
        }

        for task in woken {
            sched::make_runnable(task);
        }
    }
}

fn register(
    conds: &[&Condition],
    suspend: &Suspend,
    do_suspend: &mut dyn FnMut() -> bool,
) -> Option<Arc<SuspendRecord>> {
    // Predicate already satisfied: no sleep.
    if !do_suspend() {
        return None;
    }

    let record = Arc::new(SuspendRecord {
        task: sched::current(),
        param: suspend.param,
        priority: suspend.priority,
        status: Mutex::new(None),
    });

    for cond in conds {
        cond.enqueue(record.clone());
    }

    if let Some(deadline) = suspend.timeout {
        sched::sleep_insert(deadline, SleepWaiter::Record(record.clone()));
    }

    // A ping set just before we enqueued must not be lost.
    for cond in conds {
        if cond.take_ping() {
            record.complete(Ok(()));
            break;
        }
    }

    if let Some(task) = record.task {
        if !record.is_done() {
            sched::set_suspended(task);
        }
    }

    Some(record)
}

fn cleanup(conds: &[&Condition], record: &Arc<SuspendRecord>) {
    for cond in conds {
        cond.remove(record);
    }
    sched::sleep_remove(record);
}

/// Block until one of `conds` resumes the caller, the timeout expires, or
/// nothing in the system can make progress.
///
/// `do_suspend` is the owner's predicate: it returns true when the caller
/// still has to wait. It is re-tested before sleeping, so a state change
/// that raced the call cannot be missed.
pub fn suspend_on(
    conds: &[&Condition],
    suspend: &Suspend,
    mut do_suspend: impl FnMut() -> bool,
) -> Status {
    let record = match register(conds, suspend, &mut do_suspend) {
        None => return Ok(()),
        Some(record) => record,
    };

    let status = loop {
        if let Some(status) = record.status() {
            break status;
        }
        // Let the rest of the system run; when it idles, jump to the next
        // armed deadline so timer-driven wakes still fire.
        if sched::run_once() {
            continue;
        }
        match sched::next_deadline() {
            Some(deadline) => crate::kernel::tick::advance_to(deadline),
            None => {
                cleanup(conds, &record);
                if let Some(task) = record.task {
                    sched::make_runnable(task);
                }
                return Err(Error::WouldBlock);
            }
        }
    };

    cleanup(conds, &record);
    if let Some(task) = record.task {
        sched::make_runnable(task);
    }
    status
}

/// Register a wait and return without blocking; the current task stays
/// suspended once its activation returns. Returns `None` when the
/// predicate was already satisfied (the task stays runnable).
///
/// This is the activation-style wait used by tasks that process events in
/// passes, such as the network condition task.
pub fn park_on(
    conds: &[&Condition],
    suspend: &Suspend,
    mut do_suspend: impl FnMut() -> bool,
) -> Option<Arc<SuspendRecord>> {
    debug_assert!(sched::current().is_some());
    let record = register(conds, suspend, &mut do_suspend)?;
    if record.is_done() {
        // Completed while registering (pending ping); stay runnable.
        if let Some(task) = record.task {
            sched::make_runnable(task);
        }
        sched::sleep_remove(&record);
        return None;
    }
    Some(record)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::tick;

    fn lock_tests() -> std::sync::MutexGuard<'static, ()> {
        crate::testutil::lock()
    }

    #[test]
    fn test_predicate_false_returns_without_sleeping() {
        let _g = lock_tests();
        crate::sys_reset();
        let cond = Condition::new();
        let suspend = Suspend::new(SuspendParam::default(), 0, None);
        assert_eq!(suspend_on(&[&cond], &suspend, || false), Ok(()));
        assert!(!cond.has_waiters());
    }

    #[test]
    fn test_timeout_delivers_condition_timeout() {
        let _g = lock_tests();
        crate::sys_reset();
        let cond = Condition::new();
        let deadline = tick::current_system_tick() + 10;
        let suspend = Suspend::new(SuspendParam::default(), 0, Some(deadline));
        let status = suspend_on(&[&cond], &suspend, || true);
        assert_eq!(status, Err(Error::ConditionTimeout));
        assert!(tick::int32cmp(tick::current_system_tick(), deadline) >= 0);
    }

    #[test]
    fn test_no_progress_is_would_block() {
        let _g = lock_tests();
        crate::sys_reset();
        let cond = Condition::new();
        let suspend = Suspend::new(SuspendParam::default(), 0, None);
        assert_eq!(suspend_on(&[&cond], &suspend, || true), Err(Error::WouldBlock));
    }

    #[test]
    fn test_resume_filter_and_status() {
        let _g = lock_tests();
        crate::sys_reset();
        let cond = Condition::new();
        let read_flag = 1u32;

        // Park a task-context waiter on the condition, then resume it with
        // a matching filter and a delivered error status.
        let cond2 = cond.clone();
        let task = sched::task_create(
            "waiter",
            512,
            10,
            alloc::boxed::Box::new(move || {
                let suspend = Suspend::new(
                    SuspendParam {
                        flag: read_flag,
                        num: 0,
                    },
                    0,
                    None,
                );
                let _ = park_on(&[&cond2], &suspend, || true);
            }),
        );
        assert!(sched::run_once());
        assert!(cond.has_waiters());

        cond.resume(&Resume {
            filter: Some(&|p: &SuspendParam| p.flag & read_flag != 0),
            status: Err(Error::Closed),
        });
        assert!(!cond.has_waiters());
        assert!(sched::is_runnable(task));
    }

    #[test]
    fn test_ping_wakes_one_even_without_filter_match() {
        let _g = lock_tests();
        crate::sys_reset();
        let cond = Condition::new();
        let cond2 = cond.clone();
        sched::task_create(
            "pinged",
            512,
            10,
            alloc::boxed::Box::new(move || {
                let suspend = Suspend::new(SuspendParam { flag: 4, num: 0 }, 0, None);
                let _ = park_on(&[&cond2], &suspend, || true);
            }),
        );
        assert!(sched::run_once());

        cond.ping();
        // Filter matches nothing, but the pending ping wakes the head waiter.
        cond.resume(&Resume {
            filter: Some(&|_p: &SuspendParam| false),
            status: Ok(()),
        });
        assert!(!cond.has_waiters());
    }

    #[test]
    fn test_priority_orders_wakeups() {
        let _g = lock_tests();
        crate::sys_reset();
        let cond = Condition::new();

        let mut spawn = |prio: u8| {
            let c = cond.clone();
            sched::task_create(
                "prio",
                512,
                10,
                alloc::boxed::Box::new(move || {
                    let suspend = Suspend::new(
                        SuspendParam {
                            flag: prio as u32,
                            num: 0,
                        },
                        prio,
                        None,
                    );
                    let _ = park_on(&[&c], &suspend, || true);
                }),
            )
        };
        let _low = spawn(9);
        let _high = spawn(1);
        let _mid = spawn(5);
        sched::run_until_idle();

        // A limited resume must pick the smallest suspend priority first.
        let mut woken_flags: Vec<u32> = Vec::new();
        for _ in 0..3 {
            let got = core::cell::Cell::new(0u32);
            cond.resume_one(&Resume {
                filter: Some(&|p: &SuspendParam| {
                    got.set(p.flag);
                    true
                }),
                status: Ok(()),
            });
            woken_flags.push(got.get());
        }
        assert_eq!(woken_flags, alloc::vec![1, 5, 9]);
    }
}
