//! Fixed-delay retry for transient failures.
//!
//! The publisher makes up to `max_retries + 1` attempts, sleeping a fixed delay between
//! them. Bounding the whole sequence in time is the caller's job (wrap the returned future
//! in `tokio::time::timeout`); dropping the future aborts the sequence, including a
//! pending sleep.
//!
//! # Example
//!
//! ```rust
//! use checkin_messaging_runtime::retry::{RetryPolicy, retry_with_delay};
//! use std::time::Duration;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let policy = RetryPolicy::builder()
//!     .max_retries(3)
//!     .delay(Duration::from_millis(100))
//!     .build();
//!
//! let result = retry_with_delay(&policy, |_attempt| async {
//!     // Your fallible operation here
//!     Ok::<_, String>(42)
//! }).await?;
//! # Ok(())
//! # }
//! ```

use crate::metrics::RetryMetrics;
use std::future::Future;
use std::time::Duration;
use thiserror::Error;
use tokio::time::sleep;

/// Retry policy: a bounded number of extra attempts with a fixed pause between them.
///
/// # Default Values
///
/// - `max_retries`: 3 (four attempts in total)
/// - `delay`: 1 second
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Extra attempts after the first
    pub max_retries: u32,
    /// Pause between attempts
    pub delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            delay: Duration::from_secs(1),
        }
    }
}

impl RetryPolicy {
    /// Create a new policy builder.
    #[must_use]
    pub const fn builder() -> RetryPolicyBuilder {
        RetryPolicyBuilder {
            max_retries: None,
            delay: None,
        }
    }

    /// Total number of attempts the policy allows.
    #[must_use]
    pub const fn total_attempts(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }
}

/// Builder for [`RetryPolicy`].
#[derive(Debug, Clone)]
pub struct RetryPolicyBuilder {
    max_retries: Option<u32>,
    delay: Option<Duration>,
}

impl RetryPolicyBuilder {
    /// Set maximum number of retries.
    #[must_use]
    pub const fn max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }

    /// Set the pause between attempts.
    #[must_use]
    pub const fn delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Build the [`RetryPolicy`].
    #[must_use]
    pub fn build(self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.max_retries.unwrap_or(3),
            delay: self.delay.unwrap_or(Duration::from_secs(1)),
        }
    }
}

/// The operation did not succeed within the policy.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("gave up after {attempts} attempt(s): {last_error}")]
pub struct RetryError<E> {
    /// Attempts made
    pub attempts: u32,
    /// Error from the final attempt
    pub last_error: E,
}

/// Retry an async operation with a fixed delay between attempts.
///
/// The operation receives the 1-based attempt number.
///
/// # Errors
///
/// Returns [`RetryError`] carrying the last error once `policy.total_attempts()` attempts
/// have failed.
pub async fn retry_with_delay<F, Fut, T, E>(
    policy: &RetryPolicy,
    operation: F,
) -> Result<T, RetryError<E>>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    retry_with_predicate(policy, operation, |_| true).await
}

/// Retry an async operation, giving up early on errors `is_retryable` rejects.
///
/// # Errors
///
/// Returns [`RetryError`] carrying the last error once the attempts are exhausted or a
/// non-retryable error is seen.
pub async fn retry_with_predicate<F, Fut, T, E, P>(
    policy: &RetryPolicy,
    mut operation: F,
    is_retryable: P,
) -> Result<T, RetryError<E>>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
    P: Fn(&E) -> bool,
{
    let total = policy.total_attempts();
    let mut attempt = 1;

    loop {
        match operation(attempt).await {
            Ok(result) => {
                if attempt > 1 {
                    tracing::info!(attempt, "Operation succeeded after retry");
                    RetryMetrics::record_success();
                }
                return Ok(result);
            }
            Err(err) => {
                if !is_retryable(&err) {
                    tracing::warn!(
                        attempt,
                        error = %err,
                        "Error is not retryable, failing immediately"
                    );
                    return Err(RetryError {
                        attempts: attempt,
                        last_error: err,
                    });
                }

                if attempt >= total {
                    tracing::error!(
                        attempt,
                        error = %err,
                        "Operation failed after max retries"
                    );
                    RetryMetrics::record_exhausted();
                    return Err(RetryError {
                        attempts: attempt,
                        last_error: err,
                    });
                }

                tracing::warn!(
                    attempt,
                    delay_ms = policy.delay.as_millis(),
                    error = %err,
                    "Operation failed, retrying..."
                );
                RetryMetrics::record_attempt();

                sleep(policy.delay).await;
                attempt += 1;
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn builder_defaults() {
        let policy = RetryPolicy::builder().build();
        assert_eq!(policy, RetryPolicy::default());
        assert_eq!(policy.total_attempts(), 4);
    }

    #[tokio::test]
    async fn test_retry_succeeds_on_first_try() {
        let policy = RetryPolicy::default();
        let counter = Arc::new(AtomicU32::new(0));
        let counter_clone = Arc::clone(&counter);

        let result = retry_with_delay(&policy, |_| {
            let c = Arc::clone(&counter_clone);
            async move {
                c.fetch_add(1, Ordering::SeqCst);
                Ok::<_, String>(42)
            }
        })
        .await;

        assert_eq!(result, Ok(42));
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_succeeds_after_failures() {
        let policy = RetryPolicy::builder()
            .max_retries(3)
            .delay(Duration::from_millis(10))
            .build();

        let result = retry_with_delay(&policy, |attempt| async move {
            if attempt < 3 {
                Err(format!("Attempt {attempt} failed"))
            } else {
                Ok(attempt)
            }
        })
        .await;

        assert_eq!(result, Ok(3));
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_exhausts_retries() {
        let policy = RetryPolicy::builder()
            .max_retries(2)
            .delay(Duration::from_millis(10))
            .build();

        let counter = Arc::new(AtomicU32::new(0));
        let counter_clone = Arc::clone(&counter);
        let started = tokio::time::Instant::now();

        let result = retry_with_delay(&policy, |attempt| {
            let c = Arc::clone(&counter_clone);
            async move {
                c.fetch_add(1, Ordering::SeqCst);
                Err::<i32, _>(format!("failure {attempt}"))
            }
        })
        .await;

        let err = result.unwrap_err();
        assert_eq!(err.attempts, 3);
        assert_eq!(err.last_error, "failure 3");
        assert_eq!(counter.load(Ordering::SeqCst), 3); // Initial + 2 retries
        // Two pauses between three attempts, none after the last
        assert_eq!(started.elapsed(), Duration::from_millis(20));
    }

    #[tokio::test]
    async fn test_retry_with_predicate_skips_non_retryable() {
        let policy = RetryPolicy::default();
        let counter = Arc::new(AtomicU32::new(0));
        let counter_clone = Arc::clone(&counter);

        let result = retry_with_predicate(
            &policy,
            |_| {
                let c = Arc::clone(&counter_clone);
                async move {
                    c.fetch_add(1, Ordering::SeqCst);
                    Err::<i32, _>("permanent error")
                }
            },
            |err: &&str| err.contains("transient"),
        )
        .await;

        assert_eq!(result.unwrap_err().attempts, 1);
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn dropping_the_future_aborts_the_sequence() {
        let policy = RetryPolicy::builder()
            .max_retries(100)
            .delay(Duration::from_secs(1))
            .build();
        let counter = Arc::new(AtomicU32::new(0));
        let counter_clone = Arc::clone(&counter);

        let outcome = tokio::time::timeout(
            Duration::from_millis(2500),
            retry_with_delay(&policy, |_| {
                let c = Arc::clone(&counter_clone);
                async move {
                    c.fetch_add(1, Ordering::SeqCst);
                    Err::<(), _>("down")
                }
            }),
        )
        .await;

        assert!(outcome.is_err());
        // Attempts at t=0s, 1s, 2s; the sleep towards 3s is cut short
        assert_eq!(counter.load(Ordering::SeqCst), 3);
    }
}
