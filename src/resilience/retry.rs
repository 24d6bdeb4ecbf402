// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Retry logic with exponential or linear backoff.
//!
//! Two retry shapes are used in the crate:
//!
//! - **Reconnection** ([`RetryConfig::reconnect()`]): `base * 2^attempt`,
//!   bounded attempt count. Driven step by step by the connection manager
//!   via [`RetryConfig::delay_for`] so it can abort while the breaker is open.
//! - **Outbound calls** ([`retry_with_timeout`]): each attempt gets a fixed
//!   timeout; on failure the next attempt waits `attempt * base`. The last
//!   error is returned once attempts run out.
//!
//! # Example
//!
//! ```
//! use coord_engine::RetryConfig;
//! use std::time::Duration;
//!
//! let reconnect = RetryConfig::reconnect(Duration::from_millis(1000), 10);
//! assert_eq!(reconnect.delay_for(0), Duration::from_millis(1000));
//! assert_eq!(reconnect.delay_for(3), Duration::from_millis(8000));
//!
//! let outbound = RetryConfig::outbound();
//! assert_eq!(outbound.delay_for(2), outbound.initial_delay * 3);
//! ```

use std::fmt;
use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{info, warn};

/// How the wait between attempts grows.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Backoff {
    /// `initial * factor^attempt`
    Exponential { factor: f64 },
    /// `initial * (attempt + 1)`
    Linear,
}

/// Configuration for connection/operation retry behavior.
///
/// Use the preset constructors for common patterns:
/// - [`RetryConfig::startup()`] - Fast-fail for initial connections
/// - [`RetryConfig::reconnect()`] - Bounded exponential reconnection
/// - [`RetryConfig::outbound()`] - Linear backoff for outbound calls
#[derive(Debug, Clone)]
pub struct RetryConfig {
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub backoff: Backoff,
    pub max_retries: Option<usize>,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::startup()
    }
}

impl RetryConfig {
    /// Fast-fail retry for initial startup connection.
    /// Attempts 5 times with exponential backoff, failing after ~3 seconds.
    #[must_use]
    pub fn startup() -> Self {
        Self {
            max_retries: Some(5),
            initial_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(2),
            backoff: Backoff::Exponential { factor: 2.0 },
        }
    }

    /// Reconnection after an unexpected disconnect: `base * 2^attempt`,
    /// at most `max_attempts` tries. Uncapped so the schedule is exactly
    /// the doubling sequence.
    #[must_use]
    pub fn reconnect(base: Duration, max_attempts: u32) -> Self {
        Self {
            max_retries: Some(max_attempts as usize),
            initial_delay: base,
            max_delay: Duration::MAX,
            backoff: Backoff::Exponential { factor: 2.0 },
        }
    }

    /// Outbound collaborator calls: 3 attempts, 500ms linear steps.
    #[must_use]
    pub fn outbound() -> Self {
        Self {
            max_retries: Some(3),
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(10),
            backoff: Backoff::Linear,
        }
    }

    /// Fast retry for tests (minimal delays)
    #[cfg(test)]
    pub fn test() -> Self {
        Self {
            max_retries: Some(3),
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(10),
            backoff: Backoff::Exponential { factor: 2.0 },
        }
    }

    /// Wait before retry number `attempt` (0-based).
    #[must_use]
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let delay = match self.backoff {
            Backoff::Exponential { factor } => {
                let scale = factor.powi(attempt.min(63) as i32);
                let millis = self.initial_delay.as_millis() as f64 * scale;
                if millis >= u64::MAX as f64 {
                    Duration::MAX
                } else {
                    Duration::from_millis(millis as u64)
                }
            }
            Backoff::Linear => self.initial_delay.saturating_mul(attempt.saturating_add(1)),
        };
        delay.min(self.max_delay)
    }

    /// True if another attempt is allowed after `attempts` failures.
    #[must_use]
    pub fn allows(&self, attempts: usize) -> bool {
        self.max_retries.map_or(true, |max| attempts < max)
    }
}

pub async fn retry<F, Fut, T, E>(
    operation_name: &str,
    config: &RetryConfig,
    mut operation: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: fmt::Display,
{
    let mut attempts = 0usize;

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
                if !config.allows(attempts) {
                    return Err(err);
                }

                let delay = config.delay_for(attempts as u32 - 1);
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

/// Failure of a single attempt under [`retry_with_timeout`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttemptError<E> {
    TimedOut(Duration),
    Failed(E),
}

impl<E: fmt::Display> fmt::Display for AttemptError<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::TimedOut(limit) => write!(f, "attempt timed out after {:?}", limit),
            Self::Failed(e) => write!(f, "{}", e),
        }
    }
}

impl<E: fmt::Debug + fmt::Display> std::error::Error for AttemptError<E> {}

/// Retry `operation` with a per-attempt timeout. An attempt that exceeds
/// `attempt_timeout` is dropped (cancelling the in-flight call) and counts as
/// a failure. Returns the last error when attempts are exhausted.
pub async fn retry_with_timeout<F, Fut, T, E>(
    operation_name: &str,
    config: &RetryConfig,
    attempt_timeout: Duration,
    mut operation: F,
) -> Result<T, AttemptError<E>>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: fmt::Display,
{
    retry(operation_name, config, || {
        let attempt = operation();
        async move {
            match tokio::time::timeout(attempt_timeout, attempt).await {
                Ok(Ok(val)) => Ok(val),
                Ok(Err(e)) => Err(AttemptError::Failed(e)),
                Err(_) => Err(AttemptError::TimedOut(attempt_timeout)),
            }
        }
    })
    .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[derive(Debug)]
    struct TestError(String);

    impl fmt::Display for TestError {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(f, "{}", self.0)
        }
    }

    #[tokio::test]
    async fn test_retry_succeeds_first_try() {
        let result: Result<i32, TestError> = retry(
            "test_op",
            &RetryConfig::test(),
            || async { Ok(42) },
        ).await;

        assert_eq!(result.unwrap(), 42);
    }

    #[tokio::test]
    async fn test_retry_succeeds_after_failures() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let attempts_clone = attempts.clone();

        let result: Result<i32, TestError> = retry(
            "test_op",
            &RetryConfig::test(),
            || {
                let a = attempts_clone.clone();
                async move {
                    let count = a.fetch_add(1, Ordering::SeqCst) + 1;
                    if count < 3 {
                        Err(TestError(format!("fail {}", count)))
                    } else {
                        Ok(42)
                    }
                }
            },
        ).await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_retry_exhausts_retries() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let attempts_clone = attempts.clone();

        let result: Result<i32, TestError> = retry(
            "test_op",
            &RetryConfig::test(),
            || {
                let a = attempts_clone.clone();
                async move {
                    a.fetch_add(1, Ordering::SeqCst);
                    Err(TestError("always fail".to_string()))
                }
            },
        ).await;

        assert!(result.unwrap_err().0.contains("always fail"));
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_reconnect_schedule_doubles() {
        let config = RetryConfig::reconnect(Duration::from_millis(1000), 10);
        let delays: Vec<u64> = (0..5).map(|n| config.delay_for(n).as_millis() as u64).collect();
        assert_eq!(delays, vec![1000, 2000, 4000, 8000, 16000]);
        assert!(config.allows(9));
        assert!(!config.allows(10));
    }

    #[test]
    fn test_linear_schedule() {
        let config = RetryConfig {
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(10),
            backoff: Backoff::Linear,
            max_retries: Some(5),
        };
        assert_eq!(config.delay_for(0), Duration::from_millis(100));
        assert_eq!(config.delay_for(1), Duration::from_millis(200));
        assert_eq!(config.delay_for(4), Duration::from_millis(500));
    }

    #[test]
    fn test_delay_caps_at_max() {
        let config = RetryConfig {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(5),
            backoff: Backoff::Exponential { factor: 10.0 },
            max_retries: Some(5),
        };
        assert_eq!(config.delay_for(1), Duration::from_secs(5));
        assert_eq!(RetryConfig::reconnect(Duration::from_secs(1), 10).delay_for(200), Duration::MAX);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_with_timeout_cancels_slow_attempts() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let attempts_clone = attempts.clone();
        let config = RetryConfig { backoff: Backoff::Linear, ..RetryConfig::test() };

        let result: Result<&str, AttemptError<TestError>> = retry_with_timeout(
            "slow_call",
            &config,
            Duration::from_millis(50),
            || {
                let a = attempts_clone.clone();
                async move {
                    let n = a.fetch_add(1, Ordering::SeqCst);
                    if n < 2 {
                        tokio::time::sleep(Duration::from_secs(10)).await;
                    }
                    Ok("done")
                }
            },
        ).await;

        assert_eq!(result.unwrap(), "done");
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_with_timeout_surfaces_last_error() {
        let result: Result<(), AttemptError<TestError>> = retry_with_timeout(
            "failing_call",
            &RetryConfig::test(),
            Duration::from_millis(50),
            || async { Err(TestError("upstream 502".into())) },
        ).await;

        match result {
            Err(AttemptError::Failed(e)) => assert_eq!(e.0, "upstream 502"),
            other => panic!("unexpected: {:?}", other.map_err(|e| e.to_string())),
        }
    }
}
