//! Per-chunk retry decisions and backoff.

use std::time::Duration;

use tracing::trace;

use crate::error::TransportError;
use crate::splitter::ChunkRange;

/// Decides whether a failed chunk is sent again and how long to wait first.
///
/// `attempt` counts failed attempts so far, starting at 1. A chunk is
/// retried while `attempt <= max_retries`, so it gets at most
/// `1 + max_retries` transport calls.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Extra attempts allowed after the first failure.
    pub max_retries: u32,
    /// Delay before the first retry.
    pub initial_backoff: Duration,
    /// Upper bound for any single delay.
    pub max_backoff: Duration,
    /// Multiplier applied per further retry.
    pub backoff_factor: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: crate::options::DEFAULT_MAX_RETRIES,
            initial_backoff: Duration::from_millis(250),
            max_backoff: Duration::from_secs(15),
            backoff_factor: 2.0,
        }
    }
}

impl RetryPolicy {
    /// Policy that never retries.
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            ..Self::default()
        }
    }

    pub fn should_retry(&self, chunk: &ChunkRange, attempt: u32, last_error: &TransportError) -> bool {
        let retry = last_error.is_retryable() && attempt <= self.max_retries;
        trace!(
            index = chunk.index,
            attempt,
            max_retries = self.max_retries,
            retryable = last_error.is_retryable(),
            retry,
            "retry decision"
        );
        retry
    }

    /// Delay before retry number `attempt` (1-based).
    ///
    /// `initial * factor^(attempt-1)`, capped at `max_backoff`. Non-decreasing
    /// in `attempt`.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(63) as i32;
        let secs = self.initial_backoff.as_secs_f64() * self.backoff_factor.max(1.0).powi(exp);
        let capped = secs.min(self.max_backoff.as_secs_f64());
        Duration::from_secs_f64(capped.max(0.0))
    }
}
