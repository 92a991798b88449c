use std::net::SocketAddr;

use crate::booking::BookingError;

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: CreateBooking outcomes. Labels: outcome.
pub const BOOKINGS_TOTAL: &str = "slotguard_bookings_total";

/// Histogram: CreateBooking latency in seconds. Labels: outcome.
pub const BOOKING_DURATION_SECONDS: &str = "slotguard_booking_duration_seconds";

/// Counter: advisory lock acquisitions that failed or timed out.
pub const ADVISORY_LOCK_FAILURES_TOTAL: &str = "slotguard_advisory_lock_failures_total";

// ── Resilience ──────────────────────────────────────────────────

/// Counter: retries issued by `with_retry`.
pub const RETRIES_TOTAL: &str = "slotguard_retries_total";

/// Counter: circuit breaker transitions. Labels: breaker, to.
pub const CIRCUIT_TRANSITIONS_TOTAL: &str = "slotguard_circuit_transitions_total";

/// Counter: calls refused by an open circuit. Labels: breaker.
pub const CIRCUIT_REJECTIONS_TOTAL: &str = "slotguard_circuit_rejections_total";

// ── USE metrics (resource utilization) ──────────────────────────

/// Gauge: active reservations across all resources.
pub const ACTIVE_RESERVATIONS: &str = "slotguard_active_reservations";

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "slotguard_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (events per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "slotguard_wal_flush_batch_size";

/// Install Prometheus metrics exporter on the given port. No-op if port is None.
/// A failed install is logged; the process keeps running without metrics.
pub fn init(port: Option<u16>) {
    let Some(port) = port else { return };
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    match metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
    {
        Ok(()) => tracing::info!("metrics endpoint: http://0.0.0.0:{port}/metrics"),
        Err(e) => tracing::error!("failed to install Prometheus metrics exporter: {e}"),
    }
}

/// Map a booking result to a short label for metrics.
pub fn outcome_label<T>(result: &Result<T, BookingError>) -> &'static str {
    match result {
        Ok(_) => "created",
        Err(BookingError::Conflict { .. }) => "conflict",
        Err(BookingError::Unavailable { .. }) => "unavailable",
        Err(BookingError::Invalid(_)) => "invalid",
    }
}
