//! Retry Policy and State
//!
//! Exponential backoff shared by stream recovery and the upload queue.
//! The Nth consecutive failure waits `min(base * 2^(N-1), cap)` plus a random
//! jitter in `[0, max_jitter]`. A success resets the counter to zero.

use std::time::Duration;

use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};

/// Backoff configuration
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Failures tolerated before giving up (the Nth failure with N == max is terminal)
    pub max_attempts: u32,
    /// Delay after the first failure
    pub base_delay: Duration,
    /// Ceiling for the exponential part
    pub max_delay: Duration,
    /// Upper bound of the random jitter added to every delay
    pub max_jitter: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(2),
            max_delay: Duration::from_secs(30),
            max_jitter: Duration::from_millis(250),
        }
    }
}

impl RetryPolicy {
    /// Policy without jitter (deterministic delays)
    #[must_use]
    pub fn without_jitter(mut self) -> Self {
        self.max_jitter = Duration::ZERO;
        self
    }

    /// Deterministic part of the delay for the given failure number (1-indexed)
    #[must_use]
    pub fn backoff_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        let factor = 1u32 << exponent;
        self.base_delay
            .checked_mul(factor)
            .map_or(self.max_delay, |d| d.min(self.max_delay))
    }

    /// Delay for the given failure number including jitter
    #[must_use]
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        self.backoff_for_attempt(attempt) + self.jitter()
    }

    fn jitter(&self) -> Duration {
        let max_ms = u64::try_from(self.max_jitter.as_millis()).unwrap_or(u64::MAX);
        if max_ms == 0 {
            return Duration::ZERO;
        }
        Duration::from_millis(rand::thread_rng().gen_range(0..=max_ms))
    }

    /// Check the policy for values that would make retries meaningless
    ///
    /// # Errors
    ///
    /// Returns a description of the first invalid field.
    pub fn validate(&self) -> Result<(), String> {
        if self.max_attempts == 0 {
            return Err("max_attempts must be > 0".to_string());
        }
        if self.base_delay.is_zero() {
            return Err("base_delay must be > 0".to_string());
        }
        if self.max_delay < self.base_delay {
            return Err("max_delay must be >= base_delay".to_string());
        }
        Ok(())
    }
}

/// What to do after a failure
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RetryDecision {
    /// Try again after `delay`
    Retry {
        /// Failure number that produced this decision
        attempt: u32,
        /// How long to wait
        delay: Duration,
    },
    /// Attempts used up
    Exhausted {
        /// Total failures recorded
        attempts: u32,
    },
}

/// Persisted retry bookkeeping for one stream or upload
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryState {
    /// Consecutive failures since the last success
    pub attempt_count: u32,
    /// When the next attempt becomes due, if one is scheduled
    pub next_retry_at: Option<DateTime<Utc>>,
}

impl RetryState {
    /// Record a failure and decide whether another attempt is allowed
    pub fn record_failure(&mut self, policy: &RetryPolicy, now: DateTime<Utc>) -> RetryDecision {
        self.attempt_count = self.attempt_count.saturating_add(1);

        if self.attempt_count >= policy.max_attempts {
            self.next_retry_at = None;
            return RetryDecision::Exhausted {
                attempts: self.attempt_count,
            };
        }

        let delay = policy.delay_for_attempt(self.attempt_count);
        self.next_retry_at = Some(
            now + chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::zero()),
        );
        RetryDecision::Retry {
            attempt: self.attempt_count,
            delay,
        }
    }

    /// Clear the counter after a success
    pub fn reset(&mut self) {
        self.attempt_count = 0;
        self.next_retry_at = None;
    }

    /// Whether an attempt may run at `now`
    #[must_use]
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.next_retry_at.map_or(true, |at| at <= now)
    }
}
