//! Monotonic scheduling time.
//!
//! Deferral deadlines are absolute milliseconds from this clock. Wall-clock
//! readings are ratcheted through an atomic high-water mark so the value
//! never regresses, even if the system clock steps backwards. Durable
//! stores persist the high-water mark and re-seed the clock on open, which
//! keeps stored deadlines meaningful across restarts.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

pub struct MonotonicClock {
    high_water: AtomicU64,
}

impl MonotonicClock {
    pub fn new() -> Self {
        Self::with_floor(0)
    }

    /// Create a clock that will never report a value below `floor_millis`.
    pub fn with_floor(floor_millis: u64) -> Self {
        MonotonicClock {
            high_water: AtomicU64::new(floor_millis),
        }
    }

    /// Current time in milliseconds. Non-decreasing across calls.
    pub fn now_millis(&self) -> u64 {
        let wall = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);

        let mut prev = self.high_water.load(Ordering::Relaxed);
        loop {
            let next = wall.max(prev);
            match self.high_water.compare_exchange_weak(
                prev,
                next,
                Ordering::SeqCst,
                Ordering::Relaxed,
            ) {
                Ok(_) => return next,
                Err(observed) => prev = observed,
            }
        }
    }

    /// Absolute deadline `delay` from now.
    pub fn deadline_after(&self, delay: Duration) -> u64 {
        self.now_millis().saturating_add(delay.as_millis() as u64)
    }
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_never_decreases() {
        let clock = MonotonicClock::new();
        let mut last = 0;
        for _ in 0..1_000 {
            let now = clock.now_millis();
            assert!(now >= last);
            last = now;
        }
    }

    #[test]
    fn test_floor_is_respected() {
        let far_future = u64::MAX / 2;
        let clock = MonotonicClock::with_floor(far_future);
        assert!(clock.now_millis() >= far_future);
    }

    #[test]
    fn test_deadline_is_in_the_future() {
        let clock = MonotonicClock::new();
        let before = clock.now_millis();
        let deadline = clock.deadline_after(Duration::from_secs(30));
        assert!(deadline >= before + 30_000);
    }
}
