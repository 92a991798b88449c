use crate::limits::*;
use crate::model::*;

use super::StoreError;

pub(crate) fn now_ms() -> Ms {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as Ms)
        .unwrap_or_default()
}

/// Shape checks that need no store state.
pub fn validate_candidate(candidate: &ReservationCandidate) -> Result<(), StoreError> {
    let window = &candidate.window;
    if !window.is_well_formed() {
        return Err(StoreError::Validation(format!(
            "window end {} must be after start {}",
            window.end, window.start
        )));
    }
    if window.start < MIN_VALID_TIMESTAMP_MS || window.end > MAX_VALID_TIMESTAMP_MS {
        return Err(StoreError::Validation("timestamp out of range".into()));
    }
    if window.duration_ms() > MAX_WINDOW_DURATION_MS {
        return Err(StoreError::Validation("window too wide".into()));
    }
    if candidate.payload.len() > MAX_PAYLOAD_LEN {
        return Err(StoreError::Validation("payload too large".into()));
    }
    Ok(())
}

/// Authoritative scan. The caller must hold the calendar's write lock until
/// the new reservation is committed.
pub(crate) fn check_no_conflict(
    calendar: &ResourceCalendar,
    window: &TimeWindow,
) -> Result<(), StoreError> {
    // `overlapping` is only a pre-filter; the decision is `overlaps`.
    match calendar
        .overlapping(window)
        .find(|existing| overlaps(&existing.window, window))
    {
        Some(existing) => Err(StoreError::Conflict {
            resource_id: calendar.id,
            conflicting_id: existing.id,
            window: *window,
        }),
        None => Ok(()),
    }
}
