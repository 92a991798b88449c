use tokio::sync::oneshot;
use tracing::{debug, info};
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::conflict::{check_no_conflict, now_ms, validate_candidate};
use super::{Maintenance, StoreError, WalCommand, WalStore};

impl WalStore {
    pub async fn insert_reservation(
        &self,
        id: Ulid,
        candidate: &ReservationCandidate,
    ) -> Result<Reservation, StoreError> {
        validate_candidate(candidate)?;
        let resource_id = candidate.resource_id;

        if let Some(owner) = self.reservation_index.get(&id).map(|e| *e.value())
            && owner != resource_id
        {
            return Err(StoreError::Validation(format!(
                "reservation id {id} already belongs to another resource"
            )));
        }

        let _gate = self.compaction_gate.read().await;
        let calendar = self.calendar(resource_id);
        // Locking read: held through commit so a competing writer re-scans
        // only after we are durable.
        let mut guard = calendar.write_owned().await;

        if let Some(existing) = guard.find(id) {
            if existing.is_active() && existing.window == candidate.window {
                return Ok(existing.clone());
            }
            return Err(StoreError::Validation(format!(
                "reservation id {id} already used for a different request"
            )));
        }
        if guard.active.len() >= MAX_ACTIVE_PER_RESOURCE {
            return Err(StoreError::Validation(
                "too many active reservations on resource".into(),
            ));
        }

        if let Err(e) = check_no_conflict(&guard, &candidate.window) {
            info!(%resource_id, start = candidate.window.start, end = candidate.window.end, "{e}");
            return Err(e);
        }

        let event = Event::ReservationCreated {
            id,
            resource_id,
            window: candidate.window,
            payload: candidate.payload.clone(),
            created_at: now_ms(),
        };
        self.persist_and_apply(&mut guard, &event).await?;
        metrics::gauge!(crate::observability::ACTIVE_RESERVATIONS).increment(1.0);
        debug!(%id, %resource_id, "reservation committed");

        guard
            .find(id)
            .cloned()
            .ok_or_else(|| StoreError::Transient("committed reservation missing from calendar".into()))
    }

    /// Idempotent: cancelling a cancelled reservation returns it unchanged.
    pub async fn cancel_reservation(&self, id: Ulid) -> Result<Reservation, StoreError> {
        let resource_id = self
            .reservation_index
            .get(&id)
            .map(|e| *e.value())
            .ok_or(StoreError::NotFound(id))?;

        let _gate = self.compaction_gate.read().await;
        let calendar = self
            .existing_calendar(&resource_id)
            .ok_or(StoreError::NotFound(id))?;
        let mut guard = calendar.write_owned().await;

        match guard.find(id) {
            None => return Err(StoreError::NotFound(id)),
            Some(r) if !r.is_active() => return Ok(r.clone()),
            Some(_) => {}
        }

        let event = Event::ReservationCancelled { id, resource_id };
        self.persist_and_apply(&mut guard, &event).await?;
        metrics::gauge!(crate::observability::ACTIVE_RESERVATIONS).decrement(1.0);
        debug!(%id, %resource_id, "reservation cancelled");

        guard.find(id).cloned().ok_or(StoreError::NotFound(id))
    }

    /// Rewrite the WAL with one `ReservationCreated` per active reservation.
    /// Cancelled reservations are forgotten.
    pub async fn compact(&self) -> Result<(), StoreError> {
        let _gate = self.compaction_gate.write().await;

        let mut resource_ids: Vec<Ulid> = self.calendars.iter().map(|e| *e.key()).collect();
        resource_ids.sort();

        let mut events = Vec::new();
        for rid in &resource_ids {
            let Some(calendar) = self.existing_calendar(rid) else {
                continue;
            };
            let guard = calendar.read().await;
            events.extend(guard.active.iter().map(|r| Event::ReservationCreated {
                id: r.id,
                resource_id: r.resource_id,
                window: r.window,
                payload: r.payload.clone(),
                created_at: r.created_at,
            }));
        }

        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Maintenance(Maintenance::Compact {
                events,
                response: tx,
            }))
            .await
            .map_err(|_| StoreError::Transient("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| StoreError::Transient("WAL writer dropped response".into()))?
            .map_err(|e| StoreError::Transient(format!("WAL compaction failed: {e}")))?;

        for rid in &resource_ids {
            let Some(calendar) = self.existing_calendar(rid) else {
                continue;
            };
            let mut guard = calendar.write().await;
            for r in guard.cancelled.drain(..) {
                self.reservation_index.remove(&r.id);
            }
        }
        Ok(())
    }
}
