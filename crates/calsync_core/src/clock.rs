//! Time sources.

use crate::types::Timestamp;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Source of wall-clock time for enqueue stamps and retry scheduling.
pub trait Clock: Send + Sync {
    /// Current time in Unix milliseconds.
    fn now(&self) -> Timestamp;
}

/// The system wall clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Timestamp {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as Timestamp
    }
}

/// A clock that only moves when told to. Used by tests.
#[derive(Debug, Default)]
pub struct ManualClock {
    now: AtomicU64,
}

impl ManualClock {
    /// Creates a clock frozen at `start`.
    #[must_use]
    pub fn new(start: Timestamp) -> Self {
        Self {
            now: AtomicU64::new(start),
        }
    }

    /// Moves the clock forward.
    pub fn advance(&self, by: Duration) {
        self.now.fetch_add(by.as_millis() as u64, Ordering::SeqCst);
    }

    /// Sets the clock to an absolute time.
    pub fn set(&self, now: Timestamp) {
        self.now.store(now, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Timestamp {
        self.now.load(Ordering::SeqCst)
    }
}

/// Adds a duration to a timestamp, saturating on overflow.
#[must_use]
pub fn after(now: Timestamp, delay: Duration) -> Timestamp {
    now.saturating_add(delay.as_millis().min(u128::from(u64::MAX)) as u64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn manual_clock_advances() {
        let clock = ManualClock::new(1_000);
        clock.advance(Duration::from_millis(250));
        assert_eq!(clock.now(), 1_250);
        clock.set(5);
        assert_eq!(clock.now(), 5);
    }

    #[test]
    fn after_saturates() {
        assert_eq!(after(u64::MAX - 1, Duration::from_secs(10)), u64::MAX);
        assert_eq!(after(100, Duration::from_millis(50)), 150);
    }

    #[test]
    fn system_clock_is_past_2020() {
        assert!(SystemClock.now() > 1_577_836_800_000);
    }
}
