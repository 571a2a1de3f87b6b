//! Cooperative RTOS core for small microcontrollers.
//!
//! Single core, no preemption between tasks: a task runs until it yields,
//! suspends on a condition, or finishes. Every device is a file descriptor
//! with a read/write/ioctl vtable and an attached fixed-size buffer pool;
//! the networking engine (Ethernet/ARP/IPv4/TCP) pumps all protocol events
//! through one network task so protocol state only ever mutates in a single
//! context.
//!
//! Layering, bottom up:
//!
//! - [`kernel`]: interrupt level, system tick, tasks and the scheduler, the
//!   condition/suspend/resume wait primitive, semaphores.
//! - [`fs`]: the descriptor registry, descriptor chains, and the buffer
//!   pool / buffer list machinery every driver and protocol shares.
//! - [`net`]: devices, routing, checksums, IPv4 with reassembly and
//!   fragmentation, and the TCP state machine.
//! - [`drivers`]: in-tree device drivers (loopback pair used by tests and
//!   hosted images).

#![no_std]

extern crate alloc;

#[cfg(test)]
extern crate std;

#[macro_use]
pub mod log;

pub mod config;
pub mod status;

#[cfg(feature = "bare-heap")]
pub mod heap;

pub mod kernel;

pub mod fs;

pub mod net;

pub mod drivers;

pub use status::{Error, Result};

/// Unit tests share the kernel singletons; they serialize on this guard
/// and re-enter boot state before running.
#[cfg(test)]
pub(crate) mod testutil {
    pub fn lock() -> std::sync::MutexGuard<'static, ()> {
        static GUARD: std::sync::Mutex<()> = std::sync::Mutex::new(());
        match GUARD.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

/// Return the kernel to its cold-boot state.
///
/// Firmware images initialize every singleton exactly once and never tear
/// them down; hosted test images re-enter boot between scenarios instead.
#[doc(hidden)]
pub fn sys_reset() {
    net::condition::reset();
    net::device::reset();
    net::route::reset();
    net::tcp::reset();
    fs::reset();
    kernel::sched::reset();
    kernel::tick::reset();
}
