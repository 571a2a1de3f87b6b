//! Task statistics.
//!
//! Dumps per-task state, stack watermark and CPU usage over the log sink.
//! The fatal paths (stack breach, asserts) call this before halting so the
//! last words on the serial console are the task table.

use crate::kernel::sched;
use crate::kernel::task::{Task, TaskState};
use crate::log;

fn state_str(state: TaskState) -> &'static str {
    match state {
        TaskState::Runnable => "run",
        TaskState::Suspended => "wait",
        TaskState::Finished => "done",
    }
}

fn print_task(name: &str, state: TaskState, stack_size: usize, free: usize, ticks: u64, n: u64) {
    let line = alloc::format!("{} [{}]", name, state_str(state));
    log::error_ctx(
        "SYS",
        &line,
        &[
            ("stack", stack_size as u64),
            ("free", free as u64),
            ("used", (stack_size - free) as u64),
            ("ticks", ticks),
            ("runs", n),
        ],
    );
}

/// Dump statistics for every registered task.
pub fn print_sys_info() {
    log::error("SYS", "task statistics");
    sched::for_each_task(|_, task| {
        print_task(
            &task.name,
            task.state,
            task.stack_size(),
            task.free_stack(),
            task.total_active_ticks,
            task.scheduled,
        );
    });
}

/// Variant for callers already holding the scheduler (fatal paths).
pub(crate) fn print_sys_info_locked(tasks: &[Task]) {
    log::error("SYS", "task statistics");
    for task in tasks {
        print_task(
            &task.name,
            task.state,
            task.stack_size(),
            task.free_stack(),
            task.total_active_ticks,
            task.scheduled,
        );
    }
}
