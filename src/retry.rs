//! Retry and backoff policy.
//!
//! One policy serves both the backend call path and the scheduler's
//! item-level retry: a failure is retried only if its error kind is
//! transient and the attempt budget is not exhausted. Backoff grows
//! linearly with attempt count and is capped so `max_retries` attempts
//! always complete in finite, predictable time.

use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::error::BackendError;

/// Upper bound on any single backoff delay.
const MAX_DELAY: Duration = Duration::from_secs(60);

/// Decides whether and when failed calls are re-attempted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Maximum number of retries after the initial attempt.
    pub max_retries: u32,
    /// Base delay; attempt `n` waits `base_delay * (n + 1)`, capped.
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(1000),
        }
    }
}

impl RetryPolicy {
    /// Create a policy with the given budget and base delay.
    pub fn new(max_retries: u32, base_delay: Duration) -> Self {
        Self {
            max_retries,
            base_delay,
        }
    }

    /// A policy that never retries.
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            base_delay: Duration::ZERO,
        }
    }

    /// Whether a call that failed with `error` on `attempt` (0-based) may
    /// be re-attempted. Authentication and validation failures are never
    /// retried regardless of the attempt count.
    pub fn should_retry(&self, attempt: u32, error: &BackendError) -> bool {
        attempt < self.max_retries && error.is_retryable()
    }

    /// Delay before re-attempting after `attempt` failures. Linear in the
    /// attempt count, capped at [`MAX_DELAY`].
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let scaled = self.base_delay.saturating_mul(attempt.saturating_add(1));
        scaled.min(MAX_DELAY)
    }

    /// [`delay_for`](Self::delay_for) with up to 10% random jitter added,
    /// so concurrent workers retrying at once do not re-synchronize on the
    /// provider's rate limiter.
    pub fn delay_with_jitter(&self, attempt: u32) -> Duration {
        let base = self.delay_for(attempt);
        if base.is_zero() {
            return base;
        }
        let jitter_cap = (base.as_millis() as u64 / 10).max(1);
        let jitter = rand::thread_rng().gen_range(0..=jitter_cap);
        (base + Duration::from_millis(jitter)).min(MAX_DELAY)
    }

    /// Worst-case total time spent sleeping across the whole budget.
    pub fn total_backoff_bound(&self) -> Duration {
        (0..self.max_retries)
            .map(|attempt| self.delay_for(attempt))
            .fold(Duration::ZERO, |acc, d| acc.saturating_add(d))
    }
}
