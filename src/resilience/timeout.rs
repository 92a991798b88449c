use std::future::Future;
use std::time::Duration;

use thiserror::Error;

/// The operation did not finish within its deadline. Its outcome is unknown:
/// it may still complete, or may already have taken effect.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message} (timed out after {after:?})")]
pub struct TimeoutError {
    pub message: String,
    pub after: Duration,
}

/// Race `operation` against a timer.
///
/// On expiry the operation future is dropped; side effects it already
/// started elsewhere (a spawned task, a queued write) are not undone.
pub async fn with_timeout<Fut, T, E>(timeout: Duration, message: &str, operation: Fut) -> Result<T, E>
where
    Fut: Future<Output = Result<T, E>>,
    E: From<TimeoutError>,
{
    match tokio::time::timeout(timeout, operation).await {
        Ok(result) => result,
        Err(_) => Err(TimeoutError {
            message: message.to_string(),
            after: timeout,
        }
        .into()),
    }
}
