//! CreateBooking: soft lock, then the guarded store insert under
//! `breaker(retry(timeout(insert)))`, then a typed outcome.

use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use thiserror::Error;
use tracing::{debug, warn};
use ulid::Ulid;

use crate::advisory::AdvisorySlotLock;
use crate::config::Config;
use crate::model::*;
use crate::observability::{outcome_label, BOOKINGS_TOTAL, BOOKING_DURATION_SECONDS};
use crate::resilience::{
    with_fallback, with_retry, with_timeout, CircuitBreaker, CircuitBreakerError, RetryPolicy,
    TimeoutError,
};
use crate::store::{validate_candidate, ReservationStore, StoreError};

pub use crate::model::overlaps;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BookingPolicy {
    pub retry: RetryPolicy,
    /// Bound on each store attempt.
    pub attempt_timeout: Duration,
    /// Bound on the whole call, lock wait and backoff included.
    pub deadline: Option<Duration>,
}

impl Default for BookingPolicy {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            attempt_timeout: Duration::from_secs(2),
            deadline: Some(Duration::from_secs(10)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UnavailableReason {
    CircuitOpen,
    /// The last attempt timed out; it may still have committed.
    Timeout,
    RetriesExhausted,
    /// The overall deadline passed; the insert may still have committed.
    DeadlineExceeded,
}

impl std::fmt::Display for UnavailableReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            UnavailableReason::CircuitOpen => "circuit open",
            UnavailableReason::Timeout => "timeout",
            UnavailableReason::RetriesExhausted => "retries exhausted",
            UnavailableReason::DeadlineExceeded => "deadline exceeded",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BookingErrorKind {
    Conflict,
    Unavailable,
    Invalid,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BookingError {
    /// Pick another window; retrying the same one cannot help.
    #[error("slot {window} on resource {resource_id} is unavailable: overlaps reservation {conflicting_id}")]
    Conflict {
        resource_id: Ulid,
        window: TimeWindow,
        conflicting_id: Ulid,
    },
    /// Try again later.
    #[error("booking temporarily unavailable ({reason}): {detail}")]
    Unavailable {
        reason: UnavailableReason,
        detail: String,
    },
    #[error("invalid booking: {0}")]
    Invalid(String),
}

impl BookingError {
    pub fn kind(&self) -> BookingErrorKind {
        match self {
            BookingError::Conflict { .. } => BookingErrorKind::Conflict,
            BookingError::Unavailable { .. } => BookingErrorKind::Unavailable,
            BookingError::Invalid(_) => BookingErrorKind::Invalid,
        }
    }

    fn unavailable(reason: UnavailableReason, detail: impl Into<String>) -> Self {
        BookingError::Unavailable {
            reason,
            detail: detail.into(),
        }
    }
}

/// Failure of a single store attempt.
#[derive(Debug, Error)]
enum AttemptError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Timeout(#[from] TimeoutError),
}

impl AttemptError {
    /// Infrastructure trouble: worth a retry, and counts against the breaker.
    fn is_transient(&self) -> bool {
        match self {
            AttemptError::Store(e) => e.is_retryable(),
            AttemptError::Timeout(_) => true,
        }
    }
}

fn into_booking_error(err: CircuitBreakerError<AttemptError>) -> BookingError {
    match err {
        CircuitBreakerError::Open => {
            BookingError::unavailable(UnavailableReason::CircuitOpen, "reservation store circuit is open")
        }
        CircuitBreakerError::Inner(AttemptError::Timeout(e)) => {
            BookingError::unavailable(UnavailableReason::Timeout, e.to_string())
        }
        CircuitBreakerError::Inner(AttemptError::Store(e)) => match e {
            StoreError::Conflict {
                resource_id,
                conflicting_id,
                window,
            } => BookingError::Conflict {
                resource_id,
                window,
                conflicting_id,
            },
            StoreError::Validation(msg) => BookingError::Invalid(msg),
            StoreError::NotFound(id) => BookingError::Invalid(format!("reservation not found: {id}")),
            StoreError::Transient(msg) => BookingError::unavailable(UnavailableReason::RetriesExhausted, msg),
        },
    }
}

pub struct BookingService {
    store: Arc<dyn ReservationStore>,
    locks: AdvisorySlotLock,
    breaker: CircuitBreaker,
    policy: BookingPolicy,
}

impl BookingService {
    pub fn new(
        store: Arc<dyn ReservationStore>,
        locks: AdvisorySlotLock,
        breaker: CircuitBreaker,
        policy: BookingPolicy,
    ) -> Self {
        Self {
            store,
            locks,
            breaker,
            policy,
        }
    }

    /// In-process advisory locks and a tracing-observed breaker, tuned by `config`.
    pub fn from_config(store: Arc<dyn ReservationStore>, config: &Config) -> Self {
        Self::new(
            store,
            AdvisorySlotLock::in_process(config.advisory_lock()),
            CircuitBreaker::new("reservation_store", config.circuit_breaker()),
            config.booking_policy(),
        )
    }

    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    /// Reserve `candidate.window`. Exactly one terminal outcome per call.
    ///
    /// `Unavailable` with reason `Timeout` or `DeadlineExceeded` means the
    /// outcome is unknown: the reservation may exist.
    pub async fn create_booking(
        &self,
        candidate: ReservationCandidate,
    ) -> Result<Reservation, BookingError> {
        let started = Instant::now();
        let result = match self.policy.deadline {
            Some(deadline) => tokio::time::timeout(deadline, self.create_within_deadline(candidate))
                .await
                .unwrap_or_else(|_| {
                    Err(BookingError::unavailable(
                        UnavailableReason::DeadlineExceeded,
                        format!("no answer from the reservation store within {deadline:?}"),
                    ))
                }),
            None => self.create_within_deadline(candidate).await,
        };

        let outcome = outcome_label(&result);
        metrics::counter!(BOOKINGS_TOTAL, "outcome" => outcome).increment(1);
        metrics::histogram!(BOOKING_DURATION_SECONDS, "outcome" => outcome)
            .record(started.elapsed().as_secs_f64());
        result
    }

    async fn create_within_deadline(
        &self,
        candidate: ReservationCandidate,
    ) -> Result<Reservation, BookingError> {
        validate_candidate(&candidate).map_err(|e| match e {
            StoreError::Validation(msg) => BookingError::Invalid(msg),
            other => BookingError::Invalid(other.to_string()),
        })?;

        let _slot = self
            .locks
            .acquire_or_warn(candidate.resource_id, &candidate.window)
            .await;

        // One id for every attempt, so a retry finds its own earlier commit.
        let id = Ulid::new();
        let candidate = Arc::new(candidate);
        let result = self
            .guarded("reservation insert", move |store| {
                let candidate = candidate.clone();
                async move { store.insert(id, &candidate).await }
            })
            .await;

        match &result {
            Ok(r) => debug!(id = %r.id, resource_id = %r.resource_id, "booking created"),
            Err(CircuitBreakerError::Inner(AttemptError::Store(StoreError::Conflict { .. }))) => {}
            Err(e) => warn!(%id, error = %e, "booking failed"),
        }
        result.map_err(into_booking_error)
    }

    /// Cancel a reservation. Idempotent for already-cancelled reservations;
    /// unknown ids are `Invalid`.
    pub async fn cancel_booking(&self, id: Ulid) -> Result<Reservation, BookingError> {
        self.guarded("reservation cancel", move |store| async move { store.cancel(id).await })
            .await
            .map_err(into_booking_error)
    }

    pub async fn get_booking(&self, id: Ulid) -> Result<Option<Reservation>, BookingError> {
        self.guarded("reservation lookup", move |store| async move { store.get(id).await })
            .await
            .map_err(into_booking_error)
    }

    /// Optional read: any failure yields an empty list.
    pub async fn active_reservations_or_empty(
        &self,
        resource_id: Ulid,
        window: TimeWindow,
    ) -> Vec<Reservation> {
        let read = with_timeout(
            self.policy.attempt_timeout,
            "active reservation read",
            async {
                self.store
                    .active_reservations(resource_id, window)
                    .await
                    .map_err(AttemptError::from)
            },
        );
        with_fallback(read, Vec::new(), |e: &AttemptError| {
            warn!(%resource_id, error = %e, "active reservation read failed, returning empty list")
        })
        .await
    }

    /// `breaker(retry(timeout(op)))`. Each attempt runs as its own task:
    /// a timeout abandons the wait, never a half-finished store mutation.
    async fn guarded<T, F, Fut>(
        &self,
        what: &'static str,
        op: F,
    ) -> Result<T, CircuitBreakerError<AttemptError>>
    where
        F: Fn(Arc<dyn ReservationStore>) -> Fut,
        Fut: Future<Output = Result<T, StoreError>> + Send + 'static,
        T: Send + 'static,
    {
        self.breaker
            .execute_classified(
                || {
                    with_retry(
                        &self.policy.retry,
                        || self.detached_attempt(what, op(self.store.clone())),
                        AttemptError::is_transient,
                        |retry, err: &AttemptError| debug!(what, retry, error = %err, "retrying"),
                    )
                },
                AttemptError::is_transient,
            )
            .await
    }

    async fn detached_attempt<T, Fut>(&self, what: &'static str, attempt: Fut) -> Result<T, AttemptError>
    where
        Fut: Future<Output = Result<T, StoreError>> + Send + 'static,
        T: Send + 'static,
    {
        let task = tokio::spawn(attempt);
        with_timeout(self.policy.attempt_timeout, what, async move {
            match task.await {
                Ok(result) => result.map_err(AttemptError::from),
                Err(e) => Err(StoreError::Transient(format!("{what} task failed: {e}")).into()),
            }
        })
        .await
    }
}
