//! # Retry Policy
//!
//! How often, and how soon, a change the store rejected is tried again.
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  rejected #1  ──►  pending, next attempt after initial_delay           │
//! │  rejected #2  ──►  pending, next attempt after initial × multiplier    │
//! │  ...                                     (capped at max_delay)         │
//! │  rejected #max_retries + 1  ──►  failed (terminal)                     │
//! │                                                                         │
//! │  initial_delay == 0  ──►  no deferral, retried on the next flush       │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use backoff::backoff::Backoff;
use backoff::ExponentialBackoff;
use chrono::{DateTime, Utc};
use std::time::Duration;

use cellsync_core::DEFAULT_MAX_RETRIES;

/// Retry limit plus exponential deferral between attempts.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy {
            max_retries: DEFAULT_MAX_RETRIES,
            initial_delay: Duration::ZERO,
            max_delay: Duration::from_secs(60),
            multiplier: 2.0,
        }
    }
}

impl RetryPolicy {
    /// Delay before attempt number `retry_count + 1`, `None` when retries
    /// are not deferred.
    pub fn delay_for(&self, retry_count: u32) -> Option<Duration> {
        if self.initial_delay.is_zero() || retry_count == 0 {
            return None;
        }

        let mut backoff = self.create_backoff();
        let mut delay = None;
        for _ in 0..retry_count {
            delay = backoff.next_backoff();
        }
        delay
    }

    /// Earliest time the change may be attempted again.
    pub fn next_attempt_at(&self, retry_count: u32, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let delay = self.delay_for(retry_count)?;
        let delay = chrono::Duration::from_std(delay).ok()?;
        now.checked_add_signed(delay)
    }

    fn create_backoff(&self) -> ExponentialBackoff {
        ExponentialBackoff {
            current_interval: self.initial_delay,
            initial_interval: self.initial_delay,
            randomization_factor: 0.0,
            multiplier: self.multiplier,
            max_interval: self.max_delay.max(self.initial_delay),
            max_elapsed_time: None,
            ..Default::default()
        }
    }
}
