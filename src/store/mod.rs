mod conflict;
mod error;
mod mutations;
mod queries;

pub use conflict::validate_candidate;
pub use error::StoreError;

use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::{broadcast, mpsc, oneshot, RwLock};
use ulid::Ulid;

use crate::model::*;
use crate::notify::NotifyHub;
use crate::wal::Wal;

/// The authoritative reservation table.
///
/// `insert` must run its conflict scan and its write as one atomic unit that
/// excludes concurrent writers on the same resource; that is the only
/// guarantee that active windows stay pairwise non-overlapping.
#[async_trait]
pub trait ReservationStore: Send + Sync {
    /// Reserve `candidate.window` under the caller-chosen `id`.
    ///
    /// Re-inserting an `id` that already holds the same resource and window
    /// returns the existing reservation, so a retry after an unknown outcome
    /// cannot conflict with its own earlier commit.
    async fn insert(&self, id: Ulid, candidate: &ReservationCandidate)
    -> Result<Reservation, StoreError>;

    /// Remove a reservation's window from the active set.
    async fn cancel(&self, id: Ulid) -> Result<Reservation, StoreError>;

    async fn get(&self, id: Ulid) -> Result<Option<Reservation>, StoreError>;

    /// Active reservations on `resource_id` overlapping `window`, by start.
    async fn active_reservations(
        &self,
        resource_id: Ulid,
        window: TimeWindow,
    ) -> Result<Vec<Reservation>, StoreError>;
}

pub type SharedCalendar = Arc<RwLock<ResourceCalendar>>;

// ── Group-commit WAL channel ─────────────────────────────

pub(super) enum WalCommand {
    Append {
        event: Event,
        response: oneshot::Sender<io::Result<()>>,
    },
    Maintenance(Maintenance),
}

/// Commands that run between batches, never inside one.
pub(super) enum Maintenance {
    Compact {
        events: Vec<Event>,
        response: oneshot::Sender<io::Result<()>>,
    },
    AppendsSinceCompact {
        response: oneshot::Sender<u64>,
    },
}

/// Background task that owns the WAL and batches appends for group commit.
/// 1. Block until the first Append arrives.
/// 2. Drain every Append already queued behind it.
/// 3. One flush_sync for the whole batch, then answer every sender.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        let (event, response) = match cmd {
            WalCommand::Append { event, response } => (event, response),
            WalCommand::Maintenance(m) => {
                run_maintenance(&mut wal, m);
                continue;
            }
        };

        let mut batch = vec![(event, response)];
        let mut deferred = None;
        while let Ok(next) = rx.try_recv() {
            match next {
                WalCommand::Append { event, response } => batch.push((event, response)),
                WalCommand::Maintenance(m) => {
                    // Flush what we have before compaction reads the file.
                    deferred = Some(m);
                    break;
                }
            }
        }

        metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
        let flush_start = std::time::Instant::now();
        let result = flush_batch(&mut wal, &batch);
        metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
            .record(flush_start.elapsed().as_secs_f64());
        respond_batch(batch, &result);

        if let Some(m) = deferred {
            run_maintenance(&mut wal, m);
        }
    }
}

/// Append and fsync the batch as a unit. On any error the batch is rolled
/// back out of the buffer and the file, so a caller told `Err` never finds
/// its event in the log later.
fn flush_batch(wal: &mut Wal, batch: &[(Event, oneshot::Sender<io::Result<()>>)]) -> io::Result<()> {
    let result = batch
        .iter()
        .try_for_each(|(event, _)| wal.append_buffered(event))
        .and_then(|()| wal.flush_sync());
    if let Err(e) = &result {
        tracing::error!(error = %e, batch = batch.len(), "WAL batch failed, discarding it");
        if let Err(rollback) = wal.discard_pending() {
            tracing::error!(error = %rollback, "WAL rollback failed, refusing appends");
        }
    }
    result
}

fn respond_batch(batch: Vec<(Event, oneshot::Sender<io::Result<()>>)>, result: &io::Result<()>) {
    for (_, tx) in batch {
        let r = match result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(r);
    }
}

fn run_maintenance(wal: &mut Wal, cmd: Maintenance) {
    match cmd {
        Maintenance::Compact { events, response } => {
            let result = Wal::write_compact_file(wal.path(), &events)
                .and_then(|()| wal.swap_compact_file());
            let _ = response.send(result);
        }
        Maintenance::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
    }
}

/// `ReservationStore` backed by in-memory calendars and a group-committed WAL.
///
/// Each resource's calendar sits behind its own `RwLock`. Writers take the
/// write half, scan, append to the WAL and wait for fsync, then apply, all
/// before releasing: a second writer on the same resource blocks in
/// `write_owned()` and re-scans against the committed state.
pub struct WalStore {
    pub(super) calendars: DashMap<Ulid, SharedCalendar>,
    pub(super) wal_tx: mpsc::Sender<WalCommand>,
    pub(super) notify: Arc<NotifyHub>,
    /// Reverse lookup: reservation id → resource id.
    pub(super) reservation_index: DashMap<Ulid, Ulid>,
    /// Mutations hold this shared; compaction holds it exclusively so no
    /// append can land between the snapshot and the file swap.
    pub(super) compaction_gate: RwLock<()>,
}

/// Apply an event to a calendar (no locking; caller holds the lock).
fn apply_to_calendar(cal: &mut ResourceCalendar, event: &Event, index: &DashMap<Ulid, Ulid>) {
    match event {
        Event::ReservationCreated {
            id,
            resource_id,
            window,
            payload,
            created_at,
        } => {
            cal.insert_active(Reservation {
                id: *id,
                resource_id: *resource_id,
                window: *window,
                status: ReservationStatus::Active,
                payload: payload.clone(),
                created_at: *created_at,
            });
            index.insert(*id, *resource_id);
        }
        Event::ReservationCancelled { id, .. } => {
            cal.cancel(*id);
        }
    }
}

/// Whether replay should apply `event`. A creation whose id is already
/// indexed, or whose window overlaps an active reservation, is dropped so
/// the rebuilt calendars hold the same invariants as live inserts.
fn replay_admits(cal: &ResourceCalendar, event: &Event, index: &DashMap<Ulid, Ulid>) -> bool {
    match event {
        Event::ReservationCreated { id, window, .. } => {
            !index.contains_key(id) && cal.overlapping(window).next().is_none()
        }
        Event::ReservationCancelled { .. } => true,
    }
}

impl WalStore {
    /// Replay the log at `wal_path` and start the group-commit writer.
    /// A torn or corrupt tail is truncated first. Must be called inside a
    /// tokio runtime.
    pub fn open(wal_path: PathBuf, notify: Arc<NotifyHub>) -> io::Result<Self> {
        let (wal, events) = Wal::recover(&wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let store = Self {
            calendars: DashMap::new(),
            wal_tx,
            notify,
            reservation_index: DashMap::new(),
            compaction_gate: RwLock::new(()),
        };

        // We are the sole owner of these Arcs, so try_write never contends.
        // Never blocking_write: this may run inside an async context.
        let mut skipped = 0usize;
        for event in &events {
            let calendar = store.calendar(event.resource_id());
            let Ok(mut guard) = calendar.try_write() else {
                return Err(io::Error::other("replay: calendar lock contended"));
            };
            if !replay_admits(&guard, event, &store.reservation_index) {
                tracing::warn!(?event, "skipping duplicate or overlapping creation in log");
                skipped += 1;
                continue;
            }
            apply_to_calendar(&mut guard, event, &store.reservation_index);
        }

        let active: usize = store
            .calendars
            .iter()
            .filter_map(|e| e.value().try_read().ok().map(|g| g.active.len()))
            .sum();
        metrics::gauge!(crate::observability::ACTIVE_RESERVATIONS).set(active as f64);
        tracing::info!(
            path = %wal_path.display(),
            events = events.len(),
            skipped,
            active,
            "reservation log replayed"
        );

        Ok(store)
    }

    /// Get or lazily create the calendar for a resource.
    pub(super) fn calendar(&self, resource_id: Ulid) -> SharedCalendar {
        self.calendars
            .entry(resource_id)
            .or_insert_with(|| Arc::new(RwLock::new(ResourceCalendar::new(resource_id))))
            .value()
            .clone()
    }

    pub(super) fn existing_calendar(&self, resource_id: &Ulid) -> Option<SharedCalendar> {
        self.calendars.get(resource_id).map(|e| e.value().clone())
    }

    pub fn subscribe(&self, resource_id: Ulid) -> broadcast::Receiver<Event> {
        self.notify.subscribe(resource_id)
    }

    /// Write an event through the group-commit writer and wait for fsync.
    async fn wal_append(&self, event: &Event) -> Result<(), StoreError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Append {
                event: event.clone(),
                response: tx,
            })
            .await
            .map_err(|_| StoreError::Transient("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| StoreError::Transient("WAL writer dropped response".into()))?
            .map_err(|e| StoreError::Transient(format!("WAL append failed: {e}")))
    }

    /// WAL-append, then apply and notify. Nothing is applied if the append fails.
    ///
    /// Dropping this future after the event reaches the writer leaves memory
    /// behind the log until the next restart; callers that impose deadlines
    /// must run mutations detached (see `BookingService`).
    pub(super) async fn persist_and_apply(
        &self,
        cal: &mut ResourceCalendar,
        event: &Event,
    ) -> Result<(), StoreError> {
        self.wal_append(event).await?;
        apply_to_calendar(cal, event, &self.reservation_index);
        self.notify.send(event);
        Ok(())
    }
}

#[async_trait]
impl ReservationStore for WalStore {
    async fn insert(
        &self,
        id: Ulid,
        candidate: &ReservationCandidate,
    ) -> Result<Reservation, StoreError> {
        self.insert_reservation(id, candidate).await
    }

    async fn cancel(&self, id: Ulid) -> Result<Reservation, StoreError> {
        self.cancel_reservation(id).await
    }

    async fn get(&self, id: Ulid) -> Result<Option<Reservation>, StoreError> {
        Ok(self.get_reservation(id).await)
    }

    async fn active_reservations(
        &self,
        resource_id: Ulid,
        window: TimeWindow,
    ) -> Result<Vec<Reservation>, StoreError> {
        Ok(self.list_active(resource_id, &window).await)
    }
}
