//! Wall-clock abstraction.
//!
//! Action start/end times, decommission retry delays and label timestamps are
//! all read through a [`Clock`] so tests can drive time explicitly.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;

/// Provider of the current wall-clock time.
pub trait Clock: Send + Sync {
    /// Current UTC time.
    fn now(&self) -> DateTime<Utc>;
}

/// Clock backed by the system time.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Mock clock that only moves when told to.
#[derive(Debug)]
pub struct MockClock {
    current: Mutex<DateTime<Utc>>,
}

impl MockClock {
    /// Create a mock clock at the given instant.
    pub fn at(time: DateTime<Utc>) -> Self {
        Self {
            current: Mutex::new(time),
        }
    }

    /// Create a mock clock fixed at an RFC 3339 time.
    ///
    /// Falls back to the UNIX epoch when the string does not parse.
    pub fn fixed(iso_time: &str) -> Self {
        let time = DateTime::parse_from_rfc3339(iso_time)
            .map(|t| t.with_timezone(&Utc))
            .unwrap_or_default();
        Self::at(time)
    }

    /// Move the clock forward.
    pub fn advance(&self, by: chrono::Duration) {
        let mut current = self.current.lock();
        *current += by;
    }

    /// Jump to an absolute time.
    pub fn set(&self, time: DateTime<Utc>) {
        *self.current.lock() = time;
    }
}

impl Default for MockClock {
    fn default() -> Self {
        Self::fixed("2024-01-15T10:30:00Z")
    }
}

impl Clock for MockClock {
    fn now(&self) -> DateTime<Utc> {
        *self.current.lock()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mock_clock_advances() {
        let clock = MockClock::fixed("2024-01-15T10:30:00Z");
        let start = clock.now();
        clock.advance(chrono::Duration::seconds(21));
        assert_eq!((clock.now() - start).num_seconds(), 21);
    }

    #[test]
    fn system_clock_is_monotonic_enough() {
        let clock = SystemClock;
        let a = clock.now();
        let b = clock.now();
        assert!(b >= a);
    }
}
