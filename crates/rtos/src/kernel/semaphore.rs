//! Counting semaphore built on the condition primitive.
//!
//! Guards the descriptor registry and the TCP port table. Waiters queue on
//! the semaphore's condition and wake one at a time, priority-ordered.

use spin::Mutex;

use crate::kernel::condition::{suspend_on, Condition, Resume, Suspend, SuspendParam};
use crate::kernel::tick::{self, Tick};
use crate::status::Result;

pub struct Semaphore {
    count: Mutex<u32>,
    max: u32,
    condition: Condition,
}

impl Semaphore {
    pub const fn max_count(&self) -> u32 {
        self.max
    }

    pub fn new(initial: u32, max: u32) -> Self {
        Semaphore {
            count: Mutex::new(initial),
            max,
            condition: Condition::new(),
        }
    }

    /// Take one count, waiting up to `timeout` ticks (`None` waits
    /// forever).
    pub fn obtain(&self, timeout: Option<Tick>) -> Result<()> {
        let deadline = timeout.map(|t| tick::current_system_tick().wrapping_add(t));
        loop {
            {
                let mut count = self.count.lock();
                if *count > 0 {
                    *count -= 1;
                    return Ok(());
                }
            }
            let suspend = Suspend::new(SuspendParam { flag: 0, num: 1 }, 0, deadline);
            suspend_on(&[&self.condition], &suspend, || *self.count.lock() == 0)?;
        }
    }

    /// Return one count and hand it to the highest-priority waiter.
    pub fn release(&self) {
        {
            let mut count = self.count.lock();
            if *count < self.max {
                *count += 1;
            }
        }
        self.condition.resume_one(&Resume::all(Ok(())));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::status::Error;

    fn lock_tests() -> std::sync::MutexGuard<'static, ()> {
        crate::testutil::lock()
    }

    #[test]
    fn test_obtain_release() {
        let _g = lock_tests();
        crate::sys_reset();
        let sem = Semaphore::new(1, 1);
        assert_eq!(sem.obtain(None), Ok(()));
        sem.release();
        assert_eq!(sem.obtain(None), Ok(()));
        sem.release();
    }

    #[test]
    fn test_obtain_times_out_when_exhausted() {
        let _g = lock_tests();
        crate::sys_reset();
        let sem = Semaphore::new(1, 1);
        assert_eq!(sem.obtain(None), Ok(()));
        assert_eq!(sem.obtain(Some(10)), Err(Error::ConditionTimeout));
        sem.release();
        assert_eq!(sem.obtain(Some(10)), Ok(()));
    }
}
