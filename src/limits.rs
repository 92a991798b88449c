use crate::model::Ms;

/// Earliest accepted timestamp (unix epoch).
pub const MIN_VALID_TIMESTAMP_MS: Ms = 0;

/// Latest accepted timestamp; keeps every value exactly representable as f64.
pub const MAX_VALID_TIMESTAMP_MS: Ms = (1 << 53) - 1;

/// Widest single reservation: 366 days.
pub const MAX_WINDOW_DURATION_MS: Ms = 366 * 24 * 3_600_000;

pub const MAX_PAYLOAD_LEN: usize = 4096;

pub const MAX_ACTIVE_PER_RESOURCE: usize = 100_000;
