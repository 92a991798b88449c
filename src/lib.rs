//! Double-booking prevention for time-slot reservations.
//!
//! A booking passes a best-effort advisory lock ([`advisory`]), then the
//! authoritative conflict check inside the store's per-resource write lock
//! ([`store`]), wrapped in timeout, retry and circuit breaker policies
//! ([`resilience`]). [`booking::BookingService`] ties them together.

pub mod advisory;
pub mod booking;
pub mod compactor;
pub mod config;
pub mod limits;
pub mod model;
pub mod notify;
pub mod observability;
pub mod resilience;
pub mod store;
pub mod wal;
