//! Backoff schedule for replay delivery.

use std::time::Duration;

/// Retry configuration
///
/// The wait before retry `n` (1-based) is the previous wait multiplied by
/// `n`, starting from `base_interval`: 5s, 10s, 30s, ... with the defaults.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryConfig {
    /// Maximum number of retries after the first attempt
    pub max_retries: u32,
    /// Wait before the first retry
    pub base_interval: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_interval: Duration::from_millis(5_000),
        }
    }
}

impl RetryConfig {
    /// Create a config with no retries
    pub fn no_retry() -> Self {
        Self {
            max_retries: 0,
            ..Default::default()
        }
    }

    /// Builder: set max retries
    pub fn with_max_retries(mut self, retries: u32) -> Self {
        self.max_retries = retries;
        self
    }

    /// Builder: set the first wait
    pub fn with_base_interval(mut self, interval: Duration) -> Self {
        self.base_interval = interval;
        self
    }

    /// Delay before retry `retry` (1-based).
    pub fn delay_for_retry(&self, retry: u32) -> Duration {
        let factor: u32 = (1..=retry.max(1)).product();
        self.base_interval.saturating_mul(factor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delays_grow_with_each_retry() {
        let config = RetryConfig::default();
        let delays: Vec<u64> = (1..=3)
            .map(|n| config.delay_for_retry(n).as_millis() as u64)
            .collect();
        assert_eq!(delays, vec![5_000, 10_000, 30_000]);
    }

    #[test]
    fn builders_override_defaults() {
        let config = RetryConfig::no_retry().with_base_interval(Duration::from_secs(1));
        assert_eq!(config.max_retries, 0);
        assert_eq!(config.delay_for_retry(2), Duration::from_secs(2));
        assert_eq!(config.with_max_retries(7).max_retries, 7);
    }
}
