use tokio::sync::oneshot;
use ulid::Ulid;

use crate::model::*;

use super::{Maintenance, WalCommand, WalStore};

impl WalStore {
    pub async fn get_reservation(&self, id: Ulid) -> Option<Reservation> {
        let resource_id = self.reservation_index.get(&id).map(|e| *e.value())?;
        let calendar = self.existing_calendar(&resource_id)?;
        let guard = calendar.read().await;
        guard.find(id).cloned()
    }

    pub async fn list_active(&self, resource_id: Ulid, window: &TimeWindow) -> Vec<Reservation> {
        let Some(calendar) = self.existing_calendar(&resource_id) else {
            return Vec::new();
        };
        let guard = calendar.read().await;
        guard
            .overlapping(window)
            .filter(|r| overlaps(&r.window, window))
            .cloned()
            .collect()
    }

    pub fn resource_count(&self) -> usize {
        self.calendars.len()
    }

    pub async fn wal_appends_since_compact(&self) -> u64 {
        let (tx, rx) = oneshot::channel();
        if self
            .wal_tx
            .send(WalCommand::Maintenance(Maintenance::AppendsSinceCompact {
                response: tx,
            }))
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }
}
