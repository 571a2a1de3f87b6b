//! Interrupt-level primitives.
//!
//! A critical section is `save_and_disable` / `restore`; restoring never
//! enables interrupts that were already masked at save time, so sections
//! nest. Critical sections are bounded: no allocation, no blocking inside.
//!
//! Hosted builds model the mask as a nesting depth; bare-metal ports map
//! the same pair onto PRIMASK/SREG.

use core::sync::atomic::{AtomicU32, Ordering};

/// Opaque saved interrupt state.
#[must_use]
pub struct IntLevel(u32);

static INT_DEPTH: AtomicU32 = AtomicU32::new(0);

/// Mask interrupts and return the previous state.
#[inline]
pub fn save_and_disable() -> IntLevel {
    IntLevel(INT_DEPTH.fetch_add(1, Ordering::SeqCst))
}

/// Restore a previously saved interrupt state.
#[inline]
pub fn restore(level: IntLevel) {
    INT_DEPTH.store(level.0, Ordering::SeqCst);
}

/// Whether interrupts are currently masked.
#[inline]
pub fn disabled() -> bool {
    INT_DEPTH.load(Ordering::SeqCst) != 0
}

/// Run `f` inside a critical section.
#[inline]
pub fn critical<R>(f: impl FnOnce() -> R) -> R {
    let level = save_and_disable();
    let result = f();
    restore(level);
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_nesting_restores_outer_mask() {
        assert!(!disabled());
        let outer = save_and_disable();
        assert!(disabled());
        let inner = save_and_disable();
        restore(inner);
        // Inner restore must not unmask; only the outer one may.
        assert!(disabled());
        restore(outer);
        assert!(!disabled());
    }

    #[test]
    fn test_critical_helper() {
        let r = critical(|| {
            assert!(disabled());
            7
        });
        assert_eq!(r, 7);
        assert!(!disabled());
    }
}
