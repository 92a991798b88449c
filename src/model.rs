use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Unix milliseconds. The only time type.
pub type Ms = i64;

/// Half-open interval `[start, end)` on a resource's calendar.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TimeWindow {
    pub start: Ms,
    pub end: Ms,
}

impl TimeWindow {
    pub fn new(start: Ms, end: Ms) -> Self {
        debug_assert!(start < end, "TimeWindow start must be before end");
        Self { start, end }
    }

    pub fn duration_ms(&self) -> Ms {
        self.end - self.start
    }

    /// `end > start`. Windows built from untrusted input must pass this.
    pub fn is_well_formed(&self) -> bool {
        self.end > self.start
    }

    /// Two windows overlap iff `self.start < other.end && self.end > other.start`.
    /// Windows that merely touch (`self.end == other.start`) do not overlap.
    pub fn overlaps(&self, other: &TimeWindow) -> bool {
        self.start < other.end && self.end > other.start
    }

    pub fn contains_instant(&self, t: Ms) -> bool {
        self.start <= t && t < self.end
    }
}

impl std::fmt::Display for TimeWindow {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}, {})", self.start, self.end)
    }
}

/// Conflict rule shared by client-side pre-validation and the store's
/// authoritative scan.
pub fn overlaps(a: &TimeWindow, b: &TimeWindow) -> bool {
    a.overlaps(b)
}

/// The unvalidated request to reserve `window` on `resource_id`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReservationCandidate {
    pub resource_id: Ulid,
    pub window: TimeWindow,
    /// Opaque to this crate; carried through unchanged.
    #[serde(default)]
    pub payload: String,
}

impl ReservationCandidate {
    pub fn new(resource_id: Ulid, window: TimeWindow, payload: impl Into<String>) -> Self {
        Self {
            resource_id,
            window,
            payload: payload.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReservationStatus {
    Active,
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reservation {
    pub id: Ulid,
    pub resource_id: Ulid,
    pub window: TimeWindow,
    pub status: ReservationStatus,
    pub payload: String,
    pub created_at: Ms,
}

impl Reservation {
    pub fn is_active(&self) -> bool {
        self.status == ReservationStatus::Active
    }
}

/// Everything the store knows about one resource's calendar.
#[derive(Debug, Clone)]
pub struct ResourceCalendar {
    pub id: Ulid,
    /// Active reservations, sorted by `window.start`, pairwise non-overlapping.
    pub active: Vec<Reservation>,
    /// Cancelled reservations since the last compaction.
    pub cancelled: Vec<Reservation>,
}

impl ResourceCalendar {
    pub fn new(id: Ulid) -> Self {
        Self {
            id,
            active: Vec::new(),
            cancelled: Vec::new(),
        }
    }

    /// Insert an active reservation maintaining sort order by `window.start`.
    pub fn insert_active(&mut self, reservation: Reservation) {
        let pos = self
            .active
            .binary_search_by_key(&reservation.window.start, |r| r.window.start)
            .unwrap_or_else(|e| e);
        self.active.insert(pos, reservation);
    }

    /// Move a reservation from the active set to the cancelled set.
    pub fn cancel(&mut self, id: Ulid) -> Option<Reservation> {
        let pos = self.active.iter().position(|r| r.id == id)?;
        let mut reservation = self.active.remove(pos);
        reservation.status = ReservationStatus::Cancelled;
        self.cancelled.push(reservation.clone());
        Some(reservation)
    }

    pub fn find(&self, id: Ulid) -> Option<&Reservation> {
        self.active
            .iter()
            .chain(self.cancelled.iter())
            .find(|r| r.id == id)
    }

    /// Active reservations whose window could overlap `query`.
    /// Binary search skips everything starting at or after `query.end`.
    pub fn overlapping(&self, query: &TimeWindow) -> impl Iterator<Item = &Reservation> {
        let right_bound = self
            .active
            .partition_point(|r| r.window.start < query.end);
        self.active[..right_bound]
            .iter()
            .filter(move |r| r.window.end > query.start)
    }
}

/// The durability log record format: flat, no nesting.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    ReservationCreated {
        id: Ulid,
        resource_id: Ulid,
        window: TimeWindow,
        payload: String,
        created_at: Ms,
    },
    ReservationCancelled {
        id: Ulid,
        resource_id: Ulid,
    },
}

impl Event {
    pub fn resource_id(&self) -> Ulid {
        match self {
            Event::ReservationCreated { resource_id, .. }
            | Event::ReservationCancelled { resource_id, .. } => *resource_id,
        }
    }
}
