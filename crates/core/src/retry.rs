//! Chunk retry policy.
//!
//! [`RetryPolicy::decide`] is a pure decision: given how many attempts a
//! chunk has used and what kind of failure the last one hit, either retry
//! after a delay or give up. The delay grows exponentially from
//! `base_delay`, is capped at `max_delay`, and gets random jitter added so
//! a burst of simultaneous failures does not come back as a burst.

use std::time::Duration;

use rand::Rng;

use crate::chunk_error::ErrorKind;
use crate::error::CoreError;

/// Default number of attempts (including the first) per chunk.
pub const DEFAULT_MAX_ATTEMPTS: i32 = 3;

/// Default delay before the first retry.
pub const DEFAULT_BASE_DELAY: Duration = Duration::from_secs(1);

/// Default upper bound on the exponential part of the delay.
pub const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(30);

/// Default jitter as a fraction of the capped delay.
pub const DEFAULT_JITTER_RATIO: f64 = 0.2;

/// Outcome of a retry decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Re-queue the chunk once `delay` has elapsed.
    Retry(Duration),
    /// Mark the chunk failed.
    GiveUp,
}

/// Tunable parameters for chunk retries.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts allowed, including the first one.
    pub max_attempts: i32,
    /// Delay before the first retry.
    pub base_delay: Duration,
    /// Upper bound on the exponential part of the delay.
    pub max_delay: Duration,
    /// Jitter upper bound as a fraction of the capped delay (`0.0..=1.0`).
    pub jitter_ratio: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            base_delay: DEFAULT_BASE_DELAY,
            max_delay: DEFAULT_MAX_DELAY,
            jitter_ratio: DEFAULT_JITTER_RATIO,
        }
    }
}

impl RetryPolicy {
    /// Reject nonsensical configurations.
    pub fn validate(&self) -> Result<(), CoreError> {
        if self.max_attempts < 1 {
            return Err(CoreError::Validation(
                "max_attempts must be at least 1".to_string(),
            ));
        }
        if self.max_delay < self.base_delay {
            return Err(CoreError::Validation(
                "max_delay must not be shorter than base_delay".to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&self.jitter_ratio) {
            return Err(CoreError::Validation(format!(
                "jitter_ratio must be within [0.0, 1.0], got {}",
                self.jitter_ratio
            )));
        }
        Ok(())
    }

    /// Decide what to do after attempt number `attempt_count` failed with `kind`.
    ///
    /// Jitter is drawn from the thread-local RNG.
    pub fn decide(&self, attempt_count: i32, kind: ErrorKind) -> RetryDecision {
        let sample: f64 = rand::rng().random_range(0.0..=1.0);
        self.decide_with(attempt_count, kind, sample)
    }

    /// Deterministic core of [`decide`](Self::decide).
    ///
    /// `jitter_sample` in `0.0..=1.0` selects where in the jitter window the
    /// delay lands (`0.0` adds none, `1.0` adds the full window).
    pub fn decide_with(&self, attempt_count: i32, kind: ErrorKind, jitter_sample: f64) -> RetryDecision {
        if !kind.is_transient() || attempt_count >= self.max_attempts {
            return RetryDecision::GiveUp;
        }

        let capped = self.backoff(attempt_count);
        let window_ms = capped.as_millis() as f64 * self.jitter_ratio;
        let jitter_ms = (window_ms * jitter_sample.clamp(0.0, 1.0)) as u64;
        RetryDecision::Retry(capped + Duration::from_millis(jitter_ms))
    }

    /// Exponential delay for `attempt_count`, clamped to `max_delay`.
    ///
    /// `base * 2^(attempt_count - 1)`; attempt counts below 1 are treated as 1.
    pub fn backoff(&self, attempt_count: i32) -> Duration {
        let exponent = (attempt_count.max(1) - 1).min(30) as u32;
        let base_ms = self.base_delay.as_millis() as u64;
        let delay_ms = base_ms.saturating_mul(1u64 << exponent);
        Duration::from_millis(delay_ms).min(self.max_delay)
    }
}
