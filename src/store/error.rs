use ulid::Ulid;

use crate::model::TimeWindow;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// The window overlaps an active reservation on the same resource.
    Conflict {
        resource_id: Ulid,
        conflicting_id: Ulid,
        window: TimeWindow,
    },
    /// Malformed candidate. Never retried.
    Validation(String),
    NotFound(Ulid),
    /// Infrastructure hiccup (durability log, backend I/O). Retryable.
    Transient(String),
}

impl StoreError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, StoreError::Transient(_))
    }
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreError::Conflict {
                resource_id,
                conflicting_id,
                window,
            } => write!(
                f,
                "slot [{}, {}) on resource {resource_id} is unavailable: overlaps reservation {conflicting_id}",
                window.start, window.end
            ),
            StoreError::Validation(msg) => write!(f, "invalid reservation: {msg}"),
            StoreError::NotFound(id) => write!(f, "reservation not found: {id}"),
            StoreError::Transient(msg) => write!(f, "store temporarily unavailable: {msg}"),
        }
    }
}

impl std::error::Error for StoreError {}
