//! Time source abstraction.
//!
//! Every timestamp the engine records (entity `updated_at`, operation
//! `created_at`, retry schedules, tombstones) goes through a [`Clock`] so tests
//! can drive time explicitly. All clocks truncate to millisecond precision,
//! which is the precision the local database persists.

use chrono::{DateTime, Duration, Utc};
use std::sync::Mutex;

/// Source of the current time.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// Wall clock.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        truncate_millis(Utc::now())
    }
}

/// Manually advanced clock for deterministic tests and simulations.
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(truncate_millis(start)),
        }
    }

    /// Clock starting at the unix epoch plus `millis`.
    pub fn at_millis(millis: i64) -> Self {
        Self::new(from_millis(millis))
    }

    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock().unwrap_or_else(|e| e.into_inner());
        *now += by;
    }

    pub fn set(&self, to: DateTime<Utc>) {
        let mut now = self.now.lock().unwrap_or_else(|e| e.into_inner());
        *now = truncate_millis(to);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Drop sub-millisecond precision.
pub fn truncate_millis(at: DateTime<Utc>) -> DateTime<Utc> {
    from_millis(at.timestamp_millis())
}

/// Unix milliseconds to a UTC timestamp. Out-of-range values clamp to the epoch.
pub fn from_millis(millis: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(millis).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_manual_clock_advances() {
        let clock = ManualClock::at_millis(1_000);
        assert_eq!(clock.now().timestamp_millis(), 1_000);

        clock.advance(Duration::milliseconds(250));
        assert_eq!(clock.now().timestamp_millis(), 1_250);
    }

    #[test]
    fn test_system_clock_has_millisecond_precision() {
        let now = SystemClock.now();
        assert_eq!(now, truncate_millis(now));
        assert_eq!(now.timestamp_subsec_nanos() % 1_000_000, 0);
    }
}
