//! System tick.
//!
//! One 32-bit counter driven by the platform timer. Arithmetic is modular;
//! ordering uses signed differences so wrap-around works for durations up
//! to half the range.

use core::sync::atomic::{AtomicU32, Ordering};

use crate::kernel::sched;

pub type Tick = u32;

static TICK: AtomicU32 = AtomicU32::new(0);

/// Current system tick.
#[inline]
pub fn current_system_tick() -> Tick {
    TICK.load(Ordering::SeqCst)
}

/// Wrap-aware ordering: negative when `a` is before `b`.
#[inline]
pub fn int32cmp(a: Tick, b: Tick) -> i32 {
    a.wrapping_sub(b) as i32
}

/// Timer interrupt body: advance one tick and service expired waits.
pub fn tick_isr() {
    TICK.fetch_add(1, Ordering::SeqCst);
    sched::service_sleep_queue();
}

/// Jump the clock forward to `tick` and service expired waits.
///
/// Hosted images use this to land exactly on the next armed deadline
/// instead of spinning the ISR once per tick.
pub fn advance_to(tick: Tick) {
    if int32cmp(tick, current_system_tick()) > 0 {
        TICK.store(tick, Ordering::SeqCst);
    }
    sched::service_sleep_queue();
}

#[doc(hidden)]
pub fn reset() {
    TICK.store(0, Ordering::SeqCst);
}
