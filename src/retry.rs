//! Randomised exponential backoff shared by every network caller.
//!
//! The fetcher, the manifest resolver, and the model client all face the
//! same transient failures (timeouts, connection resets, overloaded
//! servers). One policy object owns the attempt budget and the delay
//! schedule so the tuning lives in a single place instead of being
//! duplicated per call site.

use rand::Rng;
use std::time::Duration;

/// HTTP statuses that warrant a retry: request timeout, rate limiting, and
/// any server-side error. Everything else in the 4xx range is permanent.
pub fn retryable_status(status: u16) -> bool {
    matches!(status, 408 | 429) || (500..=599).contains(&status)
}

/// Attempt budget plus a jittered exponential delay schedule.
///
/// Delays double per attempt from `base_delay_ms` up to `max_delay_ms`,
/// then a uniform jitter in the upper half of the window is applied so
/// concurrent workers retrying at once do not stampede a recovering host.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts including the first. 1 disables retries.
    pub max_attempts: u32,
    /// Delay before the first retry, in milliseconds.
    pub base_delay_ms: u64,
    /// Ceiling for any single delay, in milliseconds.
    pub max_delay_ms: u64,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay_ms: u64, max_delay_ms: u64) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay_ms: base_delay_ms.max(1),
            max_delay_ms: max_delay_ms.max(base_delay_ms.max(1)),
        }
    }

    /// True if `attempt` (1-indexed, the attempt that just failed) leaves
    /// budget for another try.
    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }

    /// Jittered delay before the retry following failed attempt `attempt`
    /// (1-indexed). The exponent is capped so the shift cannot overflow.
    pub fn delay(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(16);
        let ceiling = self
            .base_delay_ms
            .saturating_mul(1u64 << exp)
            .min(self.max_delay_ms);
        let floor = ceiling / 2;
        let ms = if ceiling > floor {
            rand::thread_rng().gen_range(floor..=ceiling)
        } else {
            ceiling
        };
        Duration::from_millis(ms)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(5, 1_000, 60_000)
    }
}
