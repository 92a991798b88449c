//! Cross-cutting policies for calling a fallible dependency.
//!
//! The booking path composes them as
//! `breaker.execute(with_retry(with_timeout(store.insert)))`: each attempt is
//! bounded by a timeout, only retryable errors are retried with backoff, and
//! repeated failures open the breaker so callers fail fast while the
//! dependency recovers.

pub mod circuit_breaker;
mod fallback;
mod retry;
mod timeout;

pub use circuit_breaker::{
    CircuitBreaker, CircuitBreakerConfig, CircuitBreakerError, CircuitObserver, CircuitState,
    CircuitStatus, TracingObserver,
};
pub use fallback::with_fallback;
pub use retry::{with_retry, RetryPolicy, RetryPolicyBuilder};
pub use timeout::{with_timeout, TimeoutError};
