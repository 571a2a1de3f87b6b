//! The network condition task.
//!
//! Protocol timers (TCP retransmission and events, IPv4 fragment expiry)
//! register an entry here; device drivers queue received buffer lists on
//! their pools and [`kick`] the task. Each activation drains every
//! device's RX queue through the protocol dispatch, fires the timers that
//! came due, then parks until the next kick or the nearest armed
//! deadline.

use alloc::boxed::Box;
use alloc::vec::Vec;

use lazy_static::lazy_static;
use spin::Mutex;

use crate::config::{NET_NUM_CONDITIONS, NET_PRIORITY};
use crate::kernel::condition::{park_on, Condition, Resume, Suspend, SuspendParam};
use crate::kernel::sched;
use crate::kernel::tick::{self, Tick};
use crate::net::device;
use crate::status::{Error, Result};

/// Timer callback; receives `Err(ConditionTimeout)` on expiry.
pub type TimerCallback = Box<dyn FnMut(Result<()>) + Send>;

struct Entry {
    timeout: Option<Tick>,
    callback: Option<TimerCallback>,
}

struct Table {
    entries: Vec<Option<Entry>>,
}

lazy_static! {
    static ref TABLE: Mutex<Table> = Mutex::new(Table {
        entries: Vec::new()
    });
    static ref NET_CV: Condition = Condition::new();
}

static STARTED: core::sync::atomic::AtomicBool = core::sync::atomic::AtomicBool::new(false);

/// Register a timer with the network task. Returns a stable handle.
pub fn add(timeout: Option<Tick>, callback: TimerCallback) -> usize {
    let mut table = TABLE.lock();
    let entry = Entry {
        timeout,
        callback: Some(callback),
    };
    match table.entries.iter().position(|slot| slot.is_none()) {
        Some(i) => {
            table.entries[i] = Some(entry);
            i
        }
        None => {
            debug_assert!(table.entries.len() < NET_NUM_CONDITIONS);
            table.entries.push(Some(entry));
            table.entries.len() - 1
        }
    }
}

/// Unregister a timer.
pub fn remove(handle: usize) {
    let mut table = TABLE.lock();
    if handle < table.entries.len() {
        table.entries[handle] = None;
    }
}

/// Re-arm (or disable) a timer.
pub fn set_timeout(handle: usize, timeout: Option<Tick>) {
    let mut table = TABLE.lock();
    if let Some(Some(entry)) = table.entries.get_mut(handle) {
        entry.timeout = timeout;
    }
}

/// Networking condition data changed: wake the network task so it can
/// recompute its deadline.
pub fn updated() {
    kick();
}

/// Wake the network task (new RX data, timer re-armed).
pub fn kick() {
    NET_CV.ping();
    NET_CV.resume(&Resume::all(Ok(())));
}

fn nearest_timeout() -> Option<Tick> {
    TABLE
        .lock()
        .entries
        .iter()
        .flatten()
        .filter_map(|e| e.timeout)
        .min_by(|a, b| tick::int32cmp(*a, *b).cmp(&0))
}

fn due_timers(now: Tick) -> Vec<usize> {
    TABLE
        .lock()
        .entries
        .iter()
        .enumerate()
        .filter_map(|(i, e)| {
            let e = e.as_ref()?;
            let t = e.timeout?;
            (tick::int32cmp(now, t) >= 0).then_some(i)
        })
        .collect()
}

/// One processing pass: drain device RX queues, fire due timers.
pub fn poll() {
    device::poll_rx();

    let now = tick::current_system_tick();
    for handle in due_timers(now) {
        // The callback re-arms (or disables) its own timeout; take it out
        // of the table so it is free to reconfigure entries.
        let taken = {
            let mut table = TABLE.lock();
            match table.entries.get_mut(handle) {
                Some(Some(entry)) => {
                    entry.timeout = None;
                    entry.callback.take()
                }
                _ => None,
            }
        };
        if let Some(mut callback) = taken {
            callback(Err(Error::ConditionTimeout));
            let mut table = TABLE.lock();
            if let Some(Some(entry)) = table.entries.get_mut(handle) {
                entry.callback = Some(callback);
            }
        }
    }
}

fn pending_work() -> bool {
    if device::rx_pending() {
        return true;
    }
    let now = tick::current_system_tick();
    !due_timers(now).is_empty()
}

fn net_task_body() {
    poll();
    let suspend = Suspend::new(SuspendParam::default(), NET_PRIORITY, nearest_timeout());
    let _ = park_on(&[&NET_CV], &suspend, || !pending_work());
}

/// Create the network condition task. Idempotent.
pub fn net_init() {
    if !STARTED.swap(true, core::sync::atomic::Ordering::SeqCst) {
        sched::task_create("net", 2048, NET_PRIORITY, Box::new(net_task_body));
    }
}

#[doc(hidden)]
pub fn reset() {
    TABLE.lock().entries.clear();
    STARTED.store(false, core::sync::atomic::Ordering::SeqCst);
}
