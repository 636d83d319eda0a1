//! Retry interval policy shared by the executor and the reconnect loop.
//!
//! The client waits a fixed interval between attempts by default (the
//! configured retry interval). A multiplier above `1.0` turns the policy into
//! a capped exponential schedule:
//!
//! ```text
//! delay[n] = min(initial * multiplier^(n-1), max_delay)
//! ```
//!
//! A [`RetryPolicy`] is the immutable, copyable template built from
//! configuration. Every retry loop asks it for a fresh [`Backoff`], which
//! tracks the attempt counter for that loop only.
//!
//! ```ignore
//! use std::time::Duration;
//! use pulsebee_client::RetryPolicy;
//!
//! let mut backoff = RetryPolicy::fixed(Duration::from_secs(3)).backoff();
//! assert_eq!(backoff.next_sleep().unwrap(), Duration::from_secs(3));
//! assert_eq!(backoff.next_sleep().unwrap(), Duration::from_secs(3));
//! ```

use std::time::Duration;

use thiserror::Error;

/// Raised when a bounded policy runs out of attempts.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BackoffError {
    /// The `u32` field is the configured limit.
    #[error("Maximum number of attempts exceeded: {0}")]
    MaxAttemptLimitError(u32),
}

/// Copyable description of how long to wait between attempts.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    initial_delay: Duration,
    max_delay: Duration,
    multiplier: f64,
    /// `None` retries forever.
    max_attempts: Option<u32>,
}

impl RetryPolicy {
    /// Waits `interval` between every attempt, forever.
    pub fn fixed(interval: Duration) -> Self {
        Self {
            initial_delay: interval,
            max_delay: interval,
            multiplier: 1.0,
            max_attempts: None,
        }
    }

    /// Starts at `initial`, grows by `multiplier` per attempt and stops growing at `max`.
    ///
    /// Multipliers below `1.0` are treated as `1.0` and a `max` below `initial`
    /// is raised to `initial`, so delays never shrink.
    pub fn exponential(initial: Duration, max: Duration, multiplier: f64) -> Self {
        Self {
            initial_delay: initial,
            max_delay: max.max(initial),
            multiplier: if multiplier.is_finite() { multiplier.max(1.0) } else { 1.0 },
            max_attempts: None,
        }
    }

    /// Bounds the number of waits handed out; `0` disables the bound.
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = (max_attempts > 0).then_some(max_attempts);
        self
    }

    pub fn initial_delay(&self) -> Duration {
        self.initial_delay
    }

    pub fn max_delay(&self) -> Duration {
        self.max_delay
    }

    pub fn max_attempts(&self) -> Option<u32> {
        self.max_attempts
    }

    /// Fresh attempt tracker for one retry loop.
    pub fn backoff(&self) -> Backoff {
        Backoff {
            policy: *self,
            current_delay: self.initial_delay,
            attempt: 0,
        }
    }
}

impl Default for RetryPolicy {
    /// Fixed 3 second interval, unbounded.
    fn default() -> Self {
        Self::fixed(Duration::from_secs(3))
    }
}

/// Per-loop attempt tracker produced by [`RetryPolicy::backoff`].
#[derive(Debug, Clone)]
pub struct Backoff {
    policy: RetryPolicy,
    current_delay: Duration,
    attempt: u32,
}

impl Backoff {
    /// Returns how long to wait before the next attempt and advances the schedule.
    pub fn next_sleep(&mut self) -> Result<Duration, BackoffError> {
        self.attempt = self.attempt.saturating_add(1);

        if let Some(limit) = self.policy.max_attempts {
            if self.attempt > limit {
                return Err(BackoffError::MaxAttemptLimitError(limit));
            }
        }

        let sleep = self.current_delay;

        if self.policy.multiplier > 1.0 {
            let next = self.current_delay.as_secs_f64() * self.policy.multiplier;
            self.current_delay = Duration::try_from_secs_f64(next)
                .unwrap_or(self.policy.max_delay)
                .min(self.policy.max_delay);
        }

        Ok(sleep)
    }

    /// Back to the initial delay, e.g. after a successful attempt.
    pub fn reset(&mut self) {
        self.current_delay = self.policy.initial_delay;
        self.attempt = 0;
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn current_delay(&self) -> Duration {
        self.current_delay
    }
}
