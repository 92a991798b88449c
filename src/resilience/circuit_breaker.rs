//! Circuit breaker for one protected dependency.
//!
//! # States
//!
//! - **Closed**: calls pass through; consecutive failures are counted.
//! - **Open**: `failure_threshold` failures reached; calls fail fast with
//!   [`CircuitBreakerError::Open`] until `reset_timeout` has elapsed since the
//!   last failure.
//! - **HalfOpen**: the cool-down elapsed; calls are let through and the next
//!   completed result decides: success closes, failure re-opens.
//!
//! Every transition is reported exactly once to the breaker's
//! [`CircuitObserver`]. A breaker is owned by whoever protects the dependency;
//! unrelated dependencies get their own instances.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::Mutex;
use tokio::time::Instant;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CircuitBreakerConfig {
    /// Failures (consecutive, reset by any success) before opening.
    pub failure_threshold: u32,
    /// Time after the last failure before an open circuit admits a probe.
    pub reset_timeout: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            reset_timeout: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CircuitStatus {
    Closed,
    Open,
    HalfOpen,
}

impl CircuitStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            CircuitStatus::Closed => "closed",
            CircuitStatus::Open => "open",
            CircuitStatus::HalfOpen => "half_open",
        }
    }
}

/// Point-in-time view of a breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CircuitState {
    pub status: CircuitStatus,
    pub failure_count: u32,
    pub last_failure_time: Option<Instant>,
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum CircuitBreakerError<E> {
    /// Rejected without invoking the operation.
    #[error("circuit breaker is open")]
    Open,
    #[error("{0}")]
    Inner(E),
}

/// Receives state transitions.
pub trait CircuitObserver: Send + Sync {
    fn on_state_change(&self, breaker: &str, from: CircuitStatus, to: CircuitStatus, failure_count: u32);
}

/// Logs transitions and counts them in `slotguard_circuit_transitions_total`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingObserver;

impl CircuitObserver for TracingObserver {
    fn on_state_change(&self, breaker: &str, from: CircuitStatus, to: CircuitStatus, failure_count: u32) {
        metrics::counter!(
            crate::observability::CIRCUIT_TRANSITIONS_TOTAL,
            "breaker" => breaker.to_string(),
            "to" => to.as_str()
        )
        .increment(1);
        match to {
            CircuitStatus::Open => tracing::warn!(
                breaker,
                failures = failure_count,
                "circuit breaker {} -> {}",
                from.as_str(),
                to.as_str()
            ),
            CircuitStatus::HalfOpen | CircuitStatus::Closed => tracing::info!(
                breaker,
                "circuit breaker {} -> {}",
                from.as_str(),
                to.as_str()
            ),
        }
    }
}

type Transition = (CircuitStatus, CircuitStatus, u32);

pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    state: Mutex<CircuitState>,
    observer: Arc<dyn CircuitObserver>,
}

impl std::fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("name", &self.name)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self::with_observer(name, config, Arc::new(TracingObserver))
    }

    pub fn with_observer(
        name: impl Into<String>,
        mut config: CircuitBreakerConfig,
        observer: Arc<dyn CircuitObserver>,
    ) -> Self {
        config.failure_threshold = config.failure_threshold.max(1);
        Self {
            name: name.into(),
            config,
            state: Mutex::new(CircuitState {
                status: CircuitStatus::Closed,
                failure_count: 0,
                last_failure_time: None,
            }),
            observer,
        }
    }

    pub async fn status(&self) -> CircuitStatus {
        self.state.lock().await.status
    }

    pub async fn snapshot(&self) -> CircuitState {
        *self.state.lock().await
    }

    /// Run `operation` through the breaker; every error counts as a failure.
    pub async fn execute<F, Fut, T, E>(&self, operation: F) -> Result<T, CircuitBreakerError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        self.execute_classified(operation, |_| true).await
    }

    /// Like [`execute`](Self::execute), but only errors for which
    /// `is_failure` holds count against the dependency. Other errors prove
    /// the dependency answered and are recorded as successes.
    pub async fn execute_classified<F, Fut, T, E, C>(
        &self,
        operation: F,
        is_failure: C,
    ) -> Result<T, CircuitBreakerError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        C: FnOnce(&E) -> bool,
    {
        if !self.admit().await {
            metrics::counter!(crate::observability::CIRCUIT_REJECTIONS_TOTAL, "breaker" => self.name.clone())
                .increment(1);
            tracing::debug!(breaker = %self.name, "circuit open, rejecting call");
            return Err(CircuitBreakerError::Open);
        }

        match operation().await {
            Ok(value) => {
                self.record_success().await;
                Ok(value)
            }
            Err(err) => {
                if is_failure(&err) {
                    self.record_failure().await;
                } else {
                    self.record_success().await;
                }
                Err(CircuitBreakerError::Inner(err))
            }
        }
    }

    async fn admit(&self) -> bool {
        let (admitted, transition) = {
            let mut state = self.state.lock().await;
            match state.status {
                CircuitStatus::Closed | CircuitStatus::HalfOpen => (true, None),
                CircuitStatus::Open => {
                    let cooled = state
                        .last_failure_time
                        .is_none_or(|t| t.elapsed() >= self.config.reset_timeout);
                    if cooled {
                        state.status = CircuitStatus::HalfOpen;
                        (
                            true,
                            Some((CircuitStatus::Open, CircuitStatus::HalfOpen, state.failure_count)),
                        )
                    } else {
                        (false, None)
                    }
                }
            }
        };
        self.notify(transition);
        admitted
    }

    async fn record_success(&self) {
        let transition = {
            let mut state = self.state.lock().await;
            state.failure_count = 0;
            let from = state.status;
            state.status = CircuitStatus::Closed;
            (from != CircuitStatus::Closed).then_some((from, CircuitStatus::Closed, 0))
        };
        self.notify(transition);
    }

    async fn record_failure(&self) {
        let transition = {
            let mut state = self.state.lock().await;
            state.failure_count = state.failure_count.saturating_add(1);
            state.last_failure_time = Some(Instant::now());
            let from = state.status;
            let trips = match from {
                CircuitStatus::Closed => state.failure_count >= self.config.failure_threshold,
                CircuitStatus::HalfOpen => true,
                CircuitStatus::Open => false,
            };
            if trips {
                state.status = CircuitStatus::Open;
            }
            trips.then_some((from, CircuitStatus::Open, state.failure_count))
        };
        self.notify(transition);
    }

    fn notify(&self, transition: Option<Transition>) {
        if let Some((from, to, failures)) = transition {
            self.observer.on_state_change(&self.name, from, to, failures);
        }
    }
}
