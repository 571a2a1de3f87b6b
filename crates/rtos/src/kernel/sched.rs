//! Cooperative scheduler.
//!
//! Tasks run to completion per activation: `run_once` picks the
//! highest-priority runnable task (round-robin among equals), invokes its
//! entry, and accounts the ticks it consumed. An ISR may mark a task
//! runnable but never switches context itself; the wake takes effect at
//! the next scheduler pass.
//!
//! The scheduler also owns the central sleep queue. Entries are armed by
//! condition timeouts and plain sleeps; the tick ISR services them,
//! delivering `ConditionTimeout` through the normal resume path.

use alloc::sync::Arc;
use alloc::vec::Vec;

use lazy_static::lazy_static;
use spin::Mutex;

use crate::config;
use crate::kernel::condition::{Suspend, SuspendParam, SuspendRecord};
use crate::kernel::task::{Task, TaskEntry, TaskState};
use crate::kernel::tick::{self, Tick};
use crate::status::{Error, Result};

pub use crate::kernel::task::TaskId;

/// A sleep-queue entry's target.
pub enum SleepWaiter {
    /// Complete the record with `ConditionTimeout` and wake its task.
    Record(Arc<SuspendRecord>),
    /// Just make the task runnable.
    Task(TaskId),
}

struct SleepEntry {
    deadline: Tick,
    waiter: SleepWaiter,
}

struct Scheduler {
    tasks: Vec<Task>,
    /// Tasks whose activation frames are live right now (outermost first).
    active: Vec<TaskId>,
    sleepq: Vec<SleepEntry>,
}

lazy_static! {
    static ref SCHED: Mutex<Scheduler> = Mutex::new(Scheduler {
        tasks: Vec::new(),
        active: Vec::new(),
        sleepq: Vec::new(),
    });
}

/// Register a task. Tasks are created runnable and live forever unless
/// they finish.
pub fn task_create(name: &str, stack_size: usize, priority: u8, entry: TaskEntry) -> TaskId {
    let mut s = SCHED.lock();
    s.tasks.push(Task::new(name, stack_size, priority, entry));
    s.tasks.len() - 1
}

/// The task whose activation is currently running, if any.
pub fn current() -> Option<TaskId> {
    SCHED.lock().active.last().copied()
}

pub fn is_runnable(id: TaskId) -> bool {
    SCHED.lock().tasks[id].state == TaskState::Runnable
}

pub(crate) fn set_suspended(id: TaskId) {
    let mut s = SCHED.lock();
    if s.tasks[id].state == TaskState::Runnable {
        s.tasks[id].state = TaskState::Suspended;
    }
}

/// Make a suspended task runnable again.
pub fn make_runnable(id: TaskId) {
    let mut s = SCHED.lock();
    if s.tasks[id].state == TaskState::Suspended {
        s.tasks[id].state = TaskState::Runnable;
    }
}

/// Mark the current task finished; takes effect when its activation
/// returns.
pub fn exit_current() {
    let mut s = SCHED.lock();
    if let Some(&id) = s.active.last() {
        s.tasks[id].state = TaskState::Finished;
    }
}

fn pick(s: &Scheduler) -> Option<TaskId> {
    let mut best: Option<TaskId> = None;
    for (id, task) in s.tasks.iter().enumerate() {
        if task.state != TaskState::Runnable || s.active.contains(&id) {
            continue;
        }
        match best {
            None => best = Some(id),
            Some(b) => {
                let cur = &s.tasks[b];
                // Priority first; round-robin by least-recently-scheduled
                // among equals.
                if task.priority < cur.priority
                    || (task.priority == cur.priority && task.scheduled < cur.scheduled)
                {
                    best = Some(id);
                }
            }
        }
    }
    best
}

/// Activate the single highest-priority runnable task. Returns false when
/// nothing is runnable.
pub fn run_once() -> bool {
    let (id, mut entry) = {
        let mut s = SCHED.lock();
        let id = match pick(&s) {
            Some(id) => id,
            None => return false,
        };
        s.active.push(id);
        let started = tick::current_system_tick();
        let task = &mut s.tasks[id];
        task.last_active_tick = started;
        task.scheduled += 1;
        let entry = task.entry.take().expect("task entry in use");
        (id, entry)
    };

    // No scheduler lock held while the task body runs; the body is free to
    // create tasks, wait, or pump the scheduler itself.
    entry();

    let mut s = SCHED.lock();
    let now = tick::current_system_tick();
    let task = &mut s.tasks[id];
    task.total_active_ticks += now.wrapping_sub(task.last_active_tick) as u64;
    task.entry = Some(entry);
    if task.stack_exhausted() {
        crate::log::error_ctx("SCHED", "task stack exhausted", &[("task", id as u64)]);
        crate::kernel::sys_info::print_sys_info_locked(&s.tasks);
        panic!("stack overflow: {}", s.tasks[id].name);
    }
    let pos = s.active.iter().rposition(|&a| a == id).unwrap();
    s.active.remove(pos);
    true
}

/// Drain the ready queue.
pub fn run_until_idle() {
    while run_once() {}
}

/// Arm a sleep-queue entry.
pub fn sleep_insert(deadline: Tick, waiter: SleepWaiter) {
    let mut s = SCHED.lock();
    let at = s
        .sleepq
        .iter()
        .position(|e| tick::int32cmp(e.deadline, deadline) > 0)
        .unwrap_or(s.sleepq.len());
    s.sleepq.insert(at, SleepEntry { deadline, waiter });
}

/// Drop any sleep entries for this record.
pub(crate) fn sleep_remove(record: &Arc<SuspendRecord>) {
    SCHED.lock().sleepq.retain(|e| match &e.waiter {
        SleepWaiter::Record(r) => !Arc::ptr_eq(r, record),
        SleepWaiter::Task(_) => true,
    });
}

/// Nearest armed deadline, if any.
pub fn next_deadline() -> Option<Tick> {
    SCHED
        .lock()
        .sleepq
        .iter()
        .map(|e| e.deadline)
        .min_by(|a, b| tick::int32cmp(*a, *b).cmp(&0))
}

/// Deliver every expired sleep entry. Called from the tick ISR.
pub(crate) fn service_sleep_queue() {
    let now = tick::current_system_tick();
    let due: Vec<SleepEntry> = {
        let mut s = SCHED.lock();
        let mut due = Vec::new();
        let mut i = 0;
        while i < s.sleepq.len() {
            if tick::int32cmp(now, s.sleepq[i].deadline) >= 0 {
                due.push(s.sleepq.remove(i));
            } else {
                i += 1;
            }
        }
        due
    };

    for entry in due {
        match entry.waiter {
            SleepWaiter::Record(record) => {
                if record.complete(Err(Error::ConditionTimeout)) {
                    if let Some(task) = record.task {
                        make_runnable(task);
                    }
                }
            }
            SleepWaiter::Task(task) => make_runnable(task),
        }
    }
}

/// Suspend the caller for `ticks` system ticks.
pub fn sleep_ticks(ticks: Tick) -> Result<()> {
    let deadline = tick::current_system_tick().wrapping_add(ticks);
    let suspend = Suspend::new(SuspendParam::default(), 0, Some(deadline));
    match crate::kernel::condition::suspend_on(&[], &suspend, || true) {
        // A sleep wakes through its timeout; that is success here.
        Err(Error::ConditionTimeout) | Ok(()) => Ok(()),
        Err(e) => Err(e),
    }
}

/// Suspend the caller for `ms` milliseconds.
pub fn sleep_fms(ms: u32) -> Result<()> {
    sleep_ticks(config::ms_to_ticks(ms))
}

/// Zero all CPU-usage accounting and rebase the sampling origin.
pub fn usage_reset() {
    let mut s = SCHED.lock();
    let now = tick::current_system_tick();
    for task in s.tasks.iter_mut() {
        task.total_active_ticks = 0;
        task.scheduled = 0;
        task.last_active_tick = now;
    }
}

/// Visit every task (statistics, diagnostics).
pub fn for_each_task(mut f: impl FnMut(TaskId, &Task)) {
    let s = SCHED.lock();
    for (id, task) in s.tasks.iter().enumerate() {
        f(id, task);
    }
}

#[doc(hidden)]
pub fn reset() {
    let mut s = SCHED.lock();
    s.tasks.clear();
    s.active.clear();
    s.sleepq.clear();
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::boxed::Box;
    use alloc::sync::Arc as StdArc;
    use core::sync::atomic::{AtomicUsize, Ordering};

    fn lock_tests() -> std::sync::MutexGuard<'static, ()> {
        crate::testutil::lock()
    }

    #[test]
    fn test_priority_then_round_robin() {
        let _g = lock_tests();
        crate::sys_reset();
        let order = StdArc::new(Mutex::new(Vec::new()));

        let mut spawn = |tag: usize, prio: u8| {
            let order = order.clone();
            task_create(
                "t",
                128,
                prio,
                Box::new(move || {
                    order.lock().push(tag);
                    exit_current();
                }),
            )
        };
        spawn(1, 5);
        spawn(2, 1);
        spawn(3, 5);
        run_until_idle();

        assert_eq!(*order.lock(), alloc::vec![2, 1, 3]);
    }

    #[test]
    fn test_finished_tasks_stay_finished() {
        let _g = lock_tests();
        crate::sys_reset();
        let runs = StdArc::new(AtomicUsize::new(0));
        let runs2 = runs.clone();
        task_create(
            "once",
            128,
            0,
            Box::new(move || {
                runs2.fetch_add(1, Ordering::SeqCst);
                exit_current();
            }),
        );
        run_until_idle();
        run_until_idle();
        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_sleep_advances_clock_and_returns() {
        let _g = lock_tests();
        crate::sys_reset();
        let before = tick::current_system_tick();
        assert_eq!(sleep_ticks(25), Ok(()));
        assert!(tick::int32cmp(tick::current_system_tick(), before + 25) >= 0);
    }

    #[test]
    fn test_usage_accounting_and_reset() {
        let _g = lock_tests();
        crate::sys_reset();
        task_create(
            "worker",
            128,
            0,
            Box::new(|| {
                // Burn simulated time inside the activation.
                for _ in 0..5 {
                    tick::tick_isr();
                }
                exit_current();
            }),
        );
        run_until_idle();

        let mut seen = 0;
        for_each_task(|_, t| {
            if t.name == "worker" {
                seen += 1;
                assert_eq!(t.total_active_ticks, 5);
                assert_eq!(t.scheduled, 1);
            }
        });
        assert_eq!(seen, 1);

        usage_reset();
        for_each_task(|_, t| assert_eq!(t.total_active_ticks, 0));
    }
}
