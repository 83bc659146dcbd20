//! Exponential backoff shared by the offset committer and the batch retry loop.
//!
//! Backoff formula: min(max_delay, base_delay * 2^attempt) + jitter

use crate::config::WriterConfig;
use rand::Rng;
use std::time::Duration;

/// Configuration for exponential backoff retry behavior.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Base delay for first retry (default: 100ms)
    pub base_delay: Duration,
    /// Maximum delay cap (default: 30s)
    pub max_delay: Duration,
    /// Maximum number of attempts (default: 10)
    pub max_retries: u32,
    /// Whether to add jitter to delays (default: true)
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(30),
            max_retries: 10,
            jitter: true,
        }
    }
}

impl RetryConfig {
    /// Create a new retry config with custom settings.
    pub fn new(base_delay: Duration, max_delay: Duration, max_retries: u32) -> Self {
        Self {
            base_delay,
            max_delay,
            max_retries,
            jitter: true,
        }
    }

    /// Retry policy for whole micro-batches.
    pub fn for_batches(config: &WriterConfig) -> Self {
        Self::new(
            Duration::from_millis(config.retry_base_delay_ms),
            Duration::from_millis(config.retry_max_delay_ms),
            config.max_batch_retries.max(1),
        )
    }

    /// Disable jitter (for testing).
    pub fn without_jitter(mut self) -> Self {
        self.jitter = false;
        self
    }

    /// Calculate the backoff delay for a given attempt.
    ///
    /// Jitter is ±25% of the capped delay.
    pub fn calculate_delay(&self, attempt: u32) -> Duration {
        let base_ms = self.base_delay.as_millis() as u64;
        let max_ms = self.max_delay.as_millis() as u64;

        let delay_ms = base_ms.saturating_mul(1u64 << attempt.min(20));
        let capped_delay_ms = delay_ms.min(max_ms);

        let final_delay_ms = if self.jitter && capped_delay_ms >= 4 {
            let jitter_range = capped_delay_ms / 4;
            let jitter = rand::thread_rng().gen_range(0..=jitter_range * 2);
            capped_delay_ms - jitter_range + jitter
        } else {
            capped_delay_ms
        };

        Duration::from_millis(final_delay_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retry_config_default() {
        let config = RetryConfig::default();
        assert_eq!(config.base_delay, Duration::from_millis(100));
        assert_eq!(config.max_delay, Duration::from_secs(30));
        assert_eq!(config.max_retries, 10);
        assert!(config.jitter);
    }

    #[test]
    fn test_retry_config_for_batches() {
        let config = RetryConfig::for_batches(&WriterConfig::default());
        assert_eq!(config.base_delay, Duration::from_millis(200));
        assert_eq!(config.max_delay, Duration::from_secs(10));
        assert_eq!(config.max_retries, 3);
    }

    #[test]
    fn test_for_batches_allows_at_least_one_attempt() {
        let writer = WriterConfig {
            max_batch_retries: 0,
            ..WriterConfig::default()
        };
        assert_eq!(RetryConfig::for_batches(&writer).max_retries, 1);
    }

    #[test]
    fn test_calculate_delay_exponential() {
        let config = RetryConfig::new(Duration::from_millis(100), Duration::from_secs(30), 10)
            .without_jitter();

        assert_eq!(config.calculate_delay(0), Duration::from_millis(100));
        assert_eq!(config.calculate_delay(1), Duration::from_millis(200));
        assert_eq!(config.calculate_delay(2), Duration::from_millis(400));
        assert_eq!(config.calculate_delay(3), Duration::from_millis(800));
    }

    #[test]
    fn test_calculate_delay_caps_at_max() {
        let config = RetryConfig::new(Duration::from_millis(100), Duration::from_secs(1), 10)
            .without_jitter();

        assert_eq!(config.calculate_delay(10), Duration::from_millis(1000));
        assert_eq!(config.calculate_delay(50), Duration::from_millis(1000));
    }

    #[test]
    fn test_calculate_delay_with_jitter() {
        let config = RetryConfig::new(Duration::from_millis(1000), Duration::from_secs(30), 10);

        for _ in 0..50 {
            let delay = config.calculate_delay(0);
            assert!(delay >= Duration::from_millis(750), "delay {:?}", delay);
            assert!(delay <= Duration::from_millis(1250), "delay {:?}", delay);
        }
    }
}
