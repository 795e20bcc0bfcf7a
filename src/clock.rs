//! Time sources for the limiter.
//!
//! Window timestamps are epoch milliseconds so that every process sharing a
//! Redis window agrees on what a score means. [`SystemClock`] clamps the wall
//! clock so it never runs backwards within one process; [`MockClock`] is
//! advanced by hand in tests.

use std::fmt::Debug;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Source of "now" for window arithmetic.
pub trait Clock: Send + Sync + Debug {
    /// Current time in milliseconds since the Unix epoch.
    fn now_millis(&self) -> u64;
}

/// Wall clock that never goes backwards.
///
/// If the system clock steps back (NTP adjustment), the last observed value is
/// returned until real time catches up, keeping each window's event log
/// non-decreasing.
#[derive(Debug, Default)]
pub struct SystemClock {
    last: AtomicU64,
}

impl SystemClock {
    /// Create a new system clock.
    pub fn new() -> Self {
        Self::default()
    }
}

impl Clock for SystemClock {
    fn now_millis(&self) -> u64 {
        let wall = u64::try_from(chrono::Utc::now().timestamp_millis()).unwrap_or(0);
        let prev = self.last.fetch_max(wall, Ordering::AcqRel);
        prev.max(wall)
    }
}

/// Manually driven clock for tests.
///
/// Clones share the same time value.
#[derive(Debug, Clone)]
pub struct MockClock {
    millis: Arc<AtomicU64>,
}

impl MockClock {
    /// Create a mock clock starting at `start_millis`.
    pub fn new(start_millis: u64) -> Self {
        Self {
            millis: Arc::new(AtomicU64::new(start_millis)),
        }
    }

    /// Advance the clock by a duration.
    pub fn advance(&self, by: Duration) {
        let ms = u64::try_from(by.as_millis()).unwrap_or(u64::MAX);
        self.millis.fetch_add(ms, Ordering::AcqRel);
    }

    /// Set the clock to an absolute epoch-millisecond value.
    pub fn set(&self, millis: u64) {
        self.millis.store(millis, Ordering::Release);
    }
}

impl Clock for MockClock {
    fn now_millis(&self) -> u64 {
        self.millis.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_system_clock_is_non_decreasing() {
        let clock = SystemClock::new();
        let t1 = clock.now_millis();
        std::thread::sleep(Duration::from_millis(5));
        let t2 = clock.now_millis();

        assert!(t1 > 1_600_000_000_000);
        assert!(t2 >= t1);
    }

    #[test]
    fn test_system_clock_ignores_backwards_steps() {
        let clock = SystemClock::new();
        let far_future = u64::MAX / 2;
        clock.last.store(far_future, Ordering::Release);

        assert_eq!(clock.now_millis(), far_future);
    }

    #[test]
    fn test_mock_clock() {
        let clock = MockClock::new(1_000);
        assert_eq!(clock.now_millis(), 1_000);

        clock.advance(Duration::from_millis(250));
        assert_eq!(clock.now_millis(), 1_250);

        let shared = clock.clone();
        shared.set(5_000);
        assert_eq!(clock.now_millis(), 5_000);
    }
}
