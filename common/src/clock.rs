//! Time sources.
//!
//! Every timestamp in the log is a microsecond count since the Unix epoch:
//! message timestamps, timeslice math, read cursors, and lag windows all
//! use the same unit. The clock hands out that count directly; nothing in
//! the log ever needs a calendar time.

use std::sync::atomic::{AtomicI64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

pub trait Clock: Send + Sync {
    /// Current time in microseconds since the Unix epoch.
    fn micros(&self) -> i64;
}

/// The wall clock.
pub struct SystemClock;

impl Clock for SystemClock {
    fn micros(&self) -> i64 {
        // A system clock set before the epoch reads as the epoch.
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|elapsed| elapsed.as_micros() as i64)
            .unwrap_or(0)
    }
}

/// A clock that only moves when a test tells it to.
#[derive(Debug)]
pub struct MockClock {
    micros: AtomicI64,
}

impl MockClock {
    /// A clock pinned at the given microsecond offset from the epoch.
    pub fn at_micros(micros: i64) -> Self {
        Self {
            micros: AtomicI64::new(micros),
        }
    }

    pub fn advance(&self, duration: Duration) {
        self.micros
            .fetch_add(duration.as_micros() as i64, Ordering::SeqCst);
    }

    pub fn set_micros(&self, micros: i64) {
        self.micros.store(micros, Ordering::SeqCst);
    }
}

impl Clock for MockClock {
    fn micros(&self) -> i64 {
        self.micros.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn should_report_pinned_micros() {
        // given
        let clock = MockClock::at_micros(1_500_000);

        // when/then
        assert_eq!(clock.micros(), 1_500_000);
    }

    #[test]
    fn should_advance_by_duration() {
        // given
        let clock = MockClock::at_micros(0);

        // when
        clock.advance(Duration::from_millis(250));

        // then
        assert_eq!(clock.micros(), 250_000);
    }

    #[test]
    fn should_set_absolute_micros() {
        // given
        let clock = MockClock::at_micros(10);

        // when
        clock.set_micros(42);

        // then
        assert_eq!(clock.micros(), 42);
    }

    #[test]
    fn should_read_wall_clock_micros() {
        // given/when
        let micros = SystemClock.micros();

        // then - a plausible timestamp (after 2020-01-01)
        assert!(micros > 1_577_836_800_000_000);
    }
}
