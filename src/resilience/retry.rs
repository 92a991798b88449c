//! Bounded retry with fixed or exponential backoff.
//!
//! An operation runs at most `max_retries + 1` times. Before each retry the
//! caller's predicate decides whether the error is worth retrying; the hook is
//! told about every retry (never about the initial attempt).
//!
//! ```rust
//! use slotguard::resilience::{with_retry, RetryPolicy};
//! use std::time::Duration;
//!
//! # async fn example() -> Result<(), String> {
//! let policy = RetryPolicy::builder()
//!     .max_retries(2)
//!     .base_delay(Duration::from_millis(10))
//!     .build();
//!
//! let value = with_retry(
//!     &policy,
//!     || async { Ok::<_, String>(42) },
//!     |err: &String| err.contains("transient"),
//!     |_attempt, _err: &String| {},
//! )
//! .await?;
//! assert_eq!(value, 42);
//! # Ok(())
//! # }
//! ```

use std::future::Future;
use std::time::Duration;

use tokio::time::sleep;

/// Retry configuration.
///
/// Delay before retry `k` (1-based) is `base_delay` when not exponential,
/// else `base_delay * 2^(k-1)`; either way capped at `max_delay`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Retries after the initial attempt.
    pub max_retries: u32,
    pub base_delay: Duration,
    pub exponential: bool,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 2,
            base_delay: Duration::from_millis(50),
            exponential: true,
            max_delay: Duration::from_secs(2),
        }
    }
}

impl RetryPolicy {
    #[must_use]
    pub fn builder() -> RetryPolicyBuilder {
        RetryPolicyBuilder {
            policy: Self::default(),
        }
    }

    /// Delay inserted before the `retry`-th retry (1-based).
    #[must_use]
    pub fn delay_for_retry(&self, retry: u32) -> Duration {
        let delay = if self.exponential {
            let factor = 2u32.checked_pow(retry.saturating_sub(1)).unwrap_or(u32::MAX);
            self.base_delay.saturating_mul(factor)
        } else {
            self.base_delay
        };
        delay.min(self.max_delay)
    }
}

/// Builder for [`RetryPolicy`].
#[derive(Debug, Clone)]
pub struct RetryPolicyBuilder {
    policy: RetryPolicy,
}

impl RetryPolicyBuilder {
    #[must_use]
    pub const fn max_retries(mut self, max_retries: u32) -> Self {
        self.policy.max_retries = max_retries;
        self
    }

    #[must_use]
    pub const fn base_delay(mut self, delay: Duration) -> Self {
        self.policy.base_delay = delay;
        self
    }

    #[must_use]
    pub const fn exponential(mut self, exponential: bool) -> Self {
        self.policy.exponential = exponential;
        self
    }

    /// Cap for the computed backoff.
    #[must_use]
    pub const fn max_delay(mut self, delay: Duration) -> Self {
        self.policy.max_delay = delay;
        self
    }

    #[must_use]
    pub fn build(self) -> RetryPolicy {
        self.policy
    }
}

/// Run `operation` under `policy`.
///
/// * `should_retry` is consulted on every failure, the last one included;
///   `false` propagates the error immediately.
/// * `on_retry(k, err)` fires once per retry with the 1-based retry index
///   and the error that triggered it.
///
/// The error of the final attempt is returned as-is and never retried.
pub async fn with_retry<F, Fut, T, E, S, R>(
    policy: &RetryPolicy,
    mut operation: F,
    should_retry: S,
    mut on_retry: R,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
    S: Fn(&E) -> bool,
    R: FnMut(u32, &E),
{
    let mut retry = 0u32;
    loop {
        let err = match operation().await {
            Ok(value) => {
                if retry > 0 {
                    tracing::info!(retries = retry, "operation succeeded after retry");
                }
                return Ok(value);
            }
            Err(err) => err,
        };

        if !should_retry(&err) {
            tracing::debug!(error = %err, "error is not retryable, failing immediately");
            return Err(err);
        }
        if retry >= policy.max_retries {
            if policy.max_retries > 0 {
                tracing::error!(retries = retry, error = %err, "operation failed after max retries");
            }
            return Err(err);
        }

        retry += 1;
        let delay = policy.delay_for_retry(retry);
        tracing::warn!(
            retry,
            delay_ms = delay.as_millis() as u64,
            error = %err,
            "operation failed, retrying"
        );
        metrics::counter!(crate::observability::RETRIES_TOTAL).increment(1);
        on_retry(retry, &err);
        sleep(delay).await;
    }
}
