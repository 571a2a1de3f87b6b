//! Build-time tunables.
//!
//! All times are in system ticks unless a name says otherwise.

use crate::kernel::tick::Tick;

/// System timer rate.
pub const SOFT_TICKS_PER_SEC: u32 = 100;

/// "No timeout" sentinel for waits and timers.
pub const MAX_WAIT: Tick = u32::MAX;

/// Milliseconds to ticks, rounding up so short sleeps never round to zero.
pub const fn ms_to_ticks(ms: u32) -> Tick {
    (ms * SOFT_TICKS_PER_SEC).div_ceil(1000)
}

/// Byte pattern painted over task stacks for watermark measurement.
pub const TASK_STACK_PATTERN: u8 = 0xAA;

/// Priority of the network condition task (smaller is higher).
pub const NET_PRIORITY: u8 = 5;

/// Capacity of the network condition table (device events + port timers).
pub const NET_NUM_CONDITIONS: usize = 16;

/// Capacity of the routing table.
pub const NET_NUM_ROUTES: usize = 8;

/// Capacity of the ARP translation cache.
pub const ARP_CACHE_ENTRIES: usize = 8;

/// Receive window a TCP port starts with and returns to after in-order
/// delivery.
pub const TCP_WND_SIZE: u32 = 8192;

/// Window scale shift we advertise on SYN.
pub const TCP_WND_SCALE: u8 = 2;

/// Initial retransmission timeout (3 s).
pub const TCP_RTO: Tick = 3 * SOFT_TICKS_PER_SEC;

/// Ceiling for the exponential retransmission backoff (60 s).
pub const TCP_MAX_RTO: Tick = 60 * SOFT_TICKS_PER_SEC;

/// Maximum segment lifetime; TIME_WAIT lasts twice this (15 s).
pub const TCP_MSL: Tick = 15 * SOFT_TICKS_PER_SEC;

/// Retransmission slots per TCP port.
pub const TCP_NUM_RTX: usize = 4;

/// IPv4 fragment slots per network device.
pub const IPV4_NUM_FRAGMENTS: usize = 4;

/// How long an incomplete fragment may wait for the rest of its datagram.
pub const IPV4_FRAG_TIMEOUT: Tick = ms_to_ticks(10_000);

/// How long a dropped fragment flow keeps absorbing (and discarding) late
/// fragments before its slot is reclaimed.
pub const IPV4_FRAG_DROP_TIMEOUT: Tick = ms_to_ticks(1_000);
