//! Retry configuration, delay calculation, and the shared retry helper.
//!
//! Read queries retry failed fetches with exponential backoff. Mutations
//! never go through this module.

use std::future::Future;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::key::QueryKey;
use crate::telemetry;
use crate::{Result, SkuldError};

/// Configuration for retry behaviour on failed fetches.
///
/// Uses exponential backoff capped at `max_delay`:
///
/// ```rust
/// # use skuld::RetryConfig;
/// # use std::time::Duration;
/// let config = RetryConfig::retries(3)
///     .initial_delay(Duration::from_millis(200));
/// assert_eq!(config.max_attempts, 4);
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryConfig {
    /// Maximum number of attempts (including the initial request).
    /// 1 = no retry. Default: 4 (three retries).
    pub max_attempts: u32,
    /// Base delay before the first retry. Default: 1s.
    pub initial_delay: Duration,
    /// Maximum delay between retries (caps exponential growth). Default: 30s.
    pub max_delay: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 4,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
        }
    }
}

impl RetryConfig {
    /// Create a new config with sensible defaults.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a config that allows `count` retries after the initial request.
    pub fn retries(count: u32) -> Self {
        Self {
            max_attempts: count.saturating_add(1),
            ..Self::default()
        }
    }

    /// Create a config that disables retries (single attempt).
    pub fn disabled() -> Self {
        Self::retries(0)
    }

    /// Set maximum attempts (including the initial request).
    pub fn max_attempts(mut self, n: u32) -> Self {
        self.max_attempts = n.max(1);
        self
    }

    /// Set the base delay before the first retry.
    pub fn initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    /// Set the maximum delay between retries.
    pub fn max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    /// Number of retries after the initial request.
    pub fn retry_count(&self) -> u32 {
        self.max_attempts.saturating_sub(1)
    }

    /// Calculate the delay for a given attempt number (0-indexed).
    ///
    /// Uses exponential backoff: `initial_delay * 2^attempt`, capped at `max_delay`.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let delay = self
            .initial_delay
            .saturating_mul(2u32.saturating_pow(attempt));
        delay.min(self.max_delay)
    }
}

/// Execute a fetch with retry logic.
///
/// Retries retryable errors (see [`SkuldError::is_retryable()`]) up to
/// `config.max_attempts`. Cancellation of `token` during a backoff sleep
/// ends the loop with [`SkuldError::Cancelled`]; the attempt itself is
/// expected to observe the token on its own.
pub(crate) async fn with_retry<F, Fut, T>(
    config: &RetryConfig,
    key: &QueryKey,
    token: &CancellationToken,
    f: F,
) -> Result<T>
where
    F: Fn() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let attempts = config.max_attempts.max(1);
    let mut attempt = 0;
    loop {
        let err = match f().await {
            Ok(value) => return Ok(value),
            Err(e) => e,
        };
        if !err.is_retryable() || attempt + 1 >= attempts {
            return Err(err);
        }
        metrics::counter!(telemetry::RETRIES_TOTAL, "resource" => key.resource().to_owned())
            .increment(1);
        let delay = config.delay_for_attempt(attempt);
        warn!(
            %key,
            attempt = attempt + 1,
            max_attempts = attempts,
            delay_ms = delay.as_millis() as u64,
            error = %err,
            "retrying failed fetch"
        );
        tokio::select! {
            _ = token.cancelled() => return Err(SkuldError::Cancelled),
            _ = tokio::time::sleep(delay) => {}
        }
        attempt += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast(retries: u32) -> RetryConfig {
        RetryConfig::retries(retries).initial_delay(Duration::from_millis(1))
    }

    #[test]
    fn delay_doubles_and_caps() {
        let config = RetryConfig::new()
            .initial_delay(Duration::from_millis(100))
            .max_delay(Duration::from_millis(350));
        assert_eq!(config.delay_for_attempt(0), Duration::from_millis(100));
        assert_eq!(config.delay_for_attempt(1), Duration::from_millis(200));
        assert_eq!(config.delay_for_attempt(2), Duration::from_millis(350));
        assert_eq!(config.delay_for_attempt(30), Duration::from_millis(350));
    }

    #[test]
    fn retries_maps_to_attempts() {
        assert_eq!(RetryConfig::retries(3).max_attempts, 4);
        assert_eq!(RetryConfig::disabled().max_attempts, 1);
        assert_eq!(RetryConfig::retries(2).retry_count(), 2);
        assert_eq!(RetryConfig::new().max_attempts(0).max_attempts, 1);
    }

    #[tokio::test]
    async fn retries_then_succeeds() {
        let calls = AtomicU32::new(0);
        let key = crate::query_key!["users"];
        let result = with_retry(&fast(3), &key, &CancellationToken::new(), || async {
            if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                Err(SkuldError::Http("reset".into()))
            } else {
                Ok(7)
            }
        })
        .await;
        assert_eq!(result.unwrap(), 7);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn gives_up_after_max_attempts() {
        let calls = AtomicU32::new(0);
        let key = crate::query_key!["users"];
        let result: Result<()> = with_retry(&fast(2), &key, &CancellationToken::new(), || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(SkuldError::Http("down".into()))
        })
        .await;
        assert!(matches!(result, Err(SkuldError::Http(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn permanent_errors_are_not_retried() {
        let calls = AtomicU32::new(0);
        let key = crate::query_key!["users"];
        let result: Result<()> = with_retry(&fast(5), &key, &CancellationToken::new(), || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(SkuldError::Validation("bad".into()))
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_during_backoff() {
        let token = CancellationToken::new();
        let key = crate::query_key!["users"];
        let config = RetryConfig::retries(3).initial_delay(Duration::from_secs(60));
        let canceller = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            canceller.cancel();
        });
        let result: Result<()> = with_retry(&config, &key, &token, || async {
            Err(SkuldError::Http("down".into()))
        })
        .await;
        assert!(matches!(result, Err(SkuldError::Cancelled)));
    }
}
