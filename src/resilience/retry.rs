// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Retry logic with exponential backoff.
//!
//! Provides configurable retry behavior for transient failures.
//! Different presets are available for different use cases.
//!
//! # Example
//!
//! ```
//! use consistency_oracle::RetryConfig;
//! use std::time::Duration;
//!
//! // Startup: fail fast on bad config
//! let startup = RetryConfig::startup();
//! assert_eq!(startup.max_retries, Some(5));
//!
//! // Contention: 3 attempts, 100ms x 2^attempt, +/-50% jitter
//! let contention = RetryConfig::contention(3, Duration::from_millis(100));
//! let (lo, hi) = contention.delay_bounds(1);
//! assert_eq!((lo, hi), (Duration::from_millis(100), Duration::from_millis(300)));
//! ```

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tokio::time::sleep;
use tracing::{info, warn};

/// Configuration for connection/operation retry behavior.
///
/// Use the preset constructors for common patterns:
/// - [`RetryConfig::startup()`] - Fast-fail for initial connections
/// - [`RetryConfig::query()`] - Quick retry for individual reads
/// - [`RetryConfig::contention()`] - Jittered retry for conflicting transactions
#[derive(Debug, Clone)]
pub struct RetryConfig {
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub factor: f64,
    /// Total attempts, including the first. `None` retries forever.
    pub max_retries: Option<usize>,
    /// Relative jitter: each delay is scaled by uniform(1 - jitter, 1 + jitter).
    pub jitter: f64,
}

impl RetryConfig {
    /// Fast-fail retry for initial startup connection.
    /// Attempts 5 times with exponential backoff, failing after ~5 seconds.
    #[must_use]
    pub fn startup() -> Self {
        Self {
            max_retries: Some(5),
            initial_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(2),
            factor: 2.0,
            jitter: 0.0,
        }
    }

    /// Quick retry for individual queries (don't block forever).
    #[must_use]
    pub fn query() -> Self {
        Self {
            max_retries: Some(3),
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(2),
            factor: 2.0,
            jitter: 0.0,
        }
    }

    /// Serialization/deadlock retry for batched updates.
    /// Delay before retry `n` (0-based) is `base x 2^n x uniform(0.5, 1.5)`.
    #[must_use]
    pub fn contention(attempts: usize, base: Duration) -> Self {
        Self {
            max_retries: Some(attempts),
            initial_delay: base,
            max_delay: Duration::from_secs(30),
            factor: 2.0,
            jitter: 0.5,
        }
    }

    /// Fast retry for tests (minimal delays)
    #[cfg(test)]
    pub fn test() -> Self {
        Self {
            max_retries: Some(3),
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(10),
            factor: 2.0,
            jitter: 0.0,
        }
    }

    fn nominal_delay(&self, retry_index: u32) -> Duration {
        let scaled = self.initial_delay.mul_f64(self.factor.powi(retry_index as i32));
        scaled.min(self.max_delay)
    }

    /// Inclusive range a jittered delay before retry `retry_index` falls in.
    #[must_use]
    pub fn delay_bounds(&self, retry_index: u32) -> (Duration, Duration) {
        let nominal = self.nominal_delay(retry_index);
        (
            nominal.mul_f64(1.0 - self.jitter),
            nominal.mul_f64(1.0 + self.jitter),
        )
    }

    /// Delay before retry `retry_index` (0 = after the first failure).
    #[must_use]
    pub fn backoff_delay(&self, retry_index: u32) -> Duration {
        let nominal = self.nominal_delay(retry_index);
        if self.jitter <= 0.0 {
            return nominal;
        }
        let scale = rand::thread_rng().gen_range((1.0 - self.jitter)..=(1.0 + self.jitter));
        nominal.mul_f64(scale)
    }
}

pub async fn retry<F, Fut, T, E>(
    operation_name: &str,
    config: &RetryConfig,
    operation: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    retry_if(operation_name, config, |_| true, operation).await
}

/// Like [`retry`], but only errors accepted by `should_retry` are retried;
/// anything else is returned immediately.
pub async fn retry_if<F, Fut, T, E, P>(
    operation_name: &str,
    config: &RetryConfig,
    should_retry: P,
    mut operation: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
    P: Fn(&E) -> bool,
{
    let mut attempts: usize = 0;

    loop {
        match operation().await {
            Ok(val) => {
                if attempts > 0 {
                    info!("Operation '{}' succeeded after {} retries", operation_name, attempts);
                }
                return Ok(val);
            }
            Err(err) => {
                attempts += 1;

                if !should_retry(&err) {
                    return Err(err);
                }

                if let Some(max) = config.max_retries {
                    if attempts >= max {
                        return Err(err);
                    }
                }

                let delay = config.backoff_delay((attempts - 1) as u32);
                match config.max_retries {
                    Some(max) => warn!(
                        "Operation '{}' failed (attempt {}/{}): {}. Retrying in {:?}...",
                        operation_name, attempts, max, err, delay
                    ),
                    None => warn!(
                        "Operation '{}' failed (attempt {}, will retry forever): {}. Next retry in {:?}...",
                        operation_name, attempts, err, delay
                    ),
                }

                sleep(delay).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::traits::StorageError;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Fails with `errors` in order, then succeeds.
    async fn scripted(calls: &AtomicUsize, errors: &[StorageError]) -> Result<usize, StorageError> {
        let n = calls.fetch_add(1, Ordering::SeqCst);
        match errors.get(n) {
            Some(e) => Err(e.clone()),
            None => Ok(n + 1),
        }
    }

    #[tokio::test]
    async fn test_retry_succeeds_first_try() {
        let calls = AtomicUsize::new(0);
        let result = retry("replica_count", &RetryConfig::test(), || scripted(&calls, &[])).await;
        assert_eq!(result.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_retry_succeeds_after_conflicts() {
        let calls = AtomicUsize::new(0);
        let conflicts = [
            StorageError::Conflict("deadlock".into()),
            StorageError::Conflict("lock wait timeout".into()),
        ];
        let result = retry_if(
            "asset_batch_update",
            &RetryConfig::test(),
            StorageError::is_transient,
            || scripted(&calls, &conflicts),
        )
        .await;

        assert_eq!(result.unwrap(), 3);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_retry_exhausts_attempts() {
        let calls = AtomicUsize::new(0);
        let conflicts = vec![StorageError::Conflict("deadlock".into()); 5];
        let result = retry_if(
            "meter_batch_update",
            &RetryConfig::test(),
            StorageError::is_transient,
            || scripted(&calls, &conflicts),
        )
        .await;

        assert!(matches!(result, Err(StorageError::Conflict(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_retry_if_stops_on_non_transient() {
        let calls = AtomicUsize::new(0);
        let errors = [StorageError::Backend("connection reset".into())];
        let result = retry_if(
            "todo_batch_update",
            &RetryConfig::test(),
            StorageError::is_transient,
            || scripted(&calls, &errors),
        )
        .await;

        assert!(matches!(result, Err(StorageError::Backend(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_retry_config_presets() {
        let startup = RetryConfig::startup();
        assert_eq!(startup.max_retries, Some(5));
        assert_eq!(startup.jitter, 0.0);

        let query = RetryConfig::query();
        assert_eq!(query.max_retries, Some(3));

        let contention = RetryConfig::contention(3, Duration::from_millis(100));
        assert_eq!(contention.max_retries, Some(3));
        assert_eq!(contention.jitter, 0.5);
    }

    #[test]
    fn test_delay_exponential_backoff() {
        let config = RetryConfig::query();
        assert_eq!(config.backoff_delay(0), Duration::from_millis(100));
        assert_eq!(config.backoff_delay(1), Duration::from_millis(200));
        assert_eq!(config.backoff_delay(2), Duration::from_millis(400));
    }

    #[test]
    fn test_delay_caps_at_max() {
        let config = RetryConfig {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(5),
            factor: 10.0,
            max_retries: Some(5),
            jitter: 0.0,
        };
        assert_eq!(config.backoff_delay(1), Duration::from_secs(5));
    }

    #[test]
    fn test_jittered_delay_stays_in_envelope() {
        let config = RetryConfig::contention(3, Duration::from_millis(100));
        for attempt in 0..3 {
            let (lo, hi) = config.delay_bounds(attempt);
            for _ in 0..200 {
                let d = config.backoff_delay(attempt);
                assert!(d >= lo && d <= hi, "{:?} outside [{:?}, {:?}]", d, lo, hi);
            }
        }
        assert_eq!(
            config.delay_bounds(0),
            (Duration::from_millis(50), Duration::from_millis(150))
        );
    }
}
