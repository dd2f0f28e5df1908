//! Conflict retry policy for optimistic transactions.

use std::time::Duration;

/// Controls how often a transaction is re-run after an OCC conflict.
///
/// Delays grow exponentially from `base_delay`, are capped at `max_delay`, and
/// are drawn uniformly from `[0, delay]` so racing retries spread out.
///
/// ```ignore
/// let retry = RetryConfig::default()
///     .with_max_retries(8)
///     .with_base_delay(Duration::from_millis(5));
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryConfig {
    /// Re-runs after the first attempt (0 = never retry).
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 5,
            base_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(250),
        }
    }
}

impl RetryConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn no_retry() -> Self {
        Self {
            max_retries: 0,
            ..Default::default()
        }
    }

    pub fn with_max_retries(mut self, max_retries: usize) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_base_delay(mut self, base_delay: Duration) -> Self {
        self.base_delay = base_delay;
        self
    }

    pub fn with_max_delay(mut self, max_delay: Duration) -> Self {
        self.max_delay = max_delay;
        self
    }

    /// Total attempts allowed, including the first.
    pub fn max_attempts(&self) -> usize {
        self.max_retries.saturating_add(1)
    }

    /// Upper bound of the delay before retry number `retry` (0-based).
    pub(crate) fn delay_ceiling(&self, retry: usize) -> Duration {
        // 2^31 is already far past any sane max_delay
        let shift = retry.min(31) as u32;
        self.base_delay
            .saturating_mul(1u32 << shift)
            .min(self.max_delay)
    }

    /// Sleep before retry number `retry`.
    pub(crate) async fn backoff(&self, retry: usize) {
        let ceiling = self.delay_ceiling(retry).as_micros() as u64;
        if ceiling == 0 {
            tokio::task::yield_now().await;
            return;
        }
        let jittered = fastrand::u64(0..=ceiling);
        tokio::time::sleep(Duration::from_micros(jittered)).await;
    }
}
