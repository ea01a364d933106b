//! # Retry Policy and Backoff Strategies
//!
//! Decides how long a transiently failed operation waits before its next
//! attempt, and when to stop retrying and park it.
//!
//! Attempts are 1-based: `attempt` is the number of failures recorded so far,
//! so the delay after the first failure is `next_delay(1)`.
//!
//! ## Usage
//!
//! ```rust
//! use std::time::Duration;
//! use xfsync::offline::retry::{BackoffStrategy, RetryPolicy};
//!
//! let policy = RetryPolicy::new(
//!     BackoffStrategy::Exponential {
//!         base: Duration::from_secs(1),
//!         max: Duration::from_secs(300),
//!     },
//!     3,
//! );
//!
//! assert_eq!(policy.next_delay(1), Duration::from_secs(1));
//! assert_eq!(policy.next_delay(3), Duration::from_secs(4));
//! assert!(policy.should_give_up(3));
//! ```

use chrono::{DateTime, Utc};
use std::time::Duration;

/// Backoff strategy
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackoffStrategy {
    /// Same interval between every retry
    Fixed { interval: Duration },
    /// `base * 2^(attempt - 1)`, capped at `max`
    Exponential { base: Duration, max: Duration },
}

/// Retry policy applied to transient gateway failures
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    strategy: BackoffStrategy,
    max_attempts: u32,
}

impl RetryPolicy {
    pub fn new(strategy: BackoffStrategy, max_attempts: u32) -> Self {
        Self {
            strategy,
            max_attempts: max_attempts.max(1),
        }
    }

    pub fn strategy(&self) -> &BackoffStrategy {
        &self.strategy
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Delay before the next attempt, given `attempt` failures so far
    pub fn next_delay(&self, attempt: u32) -> Duration {
        match &self.strategy {
            BackoffStrategy::Fixed { interval } => *interval,
            BackoffStrategy::Exponential { base, max } => {
                let exponent = attempt.saturating_sub(1).min(31);
                base.checked_mul(1u32 << exponent)
                    .map_or(*max, |delay| delay.min(*max))
            }
        }
    }

    /// Whether an operation with `attempt` failures should be parked
    pub fn should_give_up(&self, attempt: u32) -> bool {
        attempt >= self.max_attempts
    }

    /// Wall-clock time of the next attempt
    pub fn next_attempt_at(&self, now: DateTime<Utc>, attempt: u32) -> DateTime<Utc> {
        let delay = chrono::Duration::from_std(self.next_delay(attempt))
            .unwrap_or_else(|_| chrono::Duration::days(1));
        now + delay
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(
            BackoffStrategy::Exponential {
                base: Duration::from_secs(1),
                max: Duration::from_secs(300), // 5 minutes
            },
            3,
        )
    }
}
