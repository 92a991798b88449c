//! Best-effort slot locks that thin out contention before the store's
//! authoritative check.
//!
//! Concurrent attempts on the same `(resource, time bucket)` queue up here
//! cheaply instead of piling onto the store's per-resource lock. Nothing
//! relies on these locks for correctness: an acquisition failure is logged
//! and the attempt proceeds straight to the store.
//!
//! Keys are 64-bit hashes of `(resource_id, start / bucket_ms)`. Unrelated
//! slots can still collide on a key; that only serializes them needlessly.

use std::hash::{DefaultHasher, Hash, Hasher};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use thiserror::Error;
use tokio::sync::Mutex;
use ulid::Ulid;

use crate::model::{Ms, TimeWindow};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SlotKey(pub u64);

impl SlotKey {
    pub fn derive(resource_id: Ulid, window: &TimeWindow, bucket_ms: Ms) -> Self {
        let bucket = window.start.div_euclid(bucket_ms.max(1));
        let mut hasher = DefaultHasher::new();
        resource_id.0.hash(&mut hasher);
        bucket.hash(&mut hasher);
        SlotKey(hasher.finish())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LockError {
    #[error("advisory lock not acquired within {0:?}")]
    Timeout(Duration),
    #[error("advisory lock backend unavailable: {0}")]
    Unavailable(String),
}

/// A held advisory lock. Released when dropped; `release` exists for
/// call sites that want the point of release to be explicit.
pub struct LockToken {
    key: SlotKey,
    on_release: Option<Box<dyn FnOnce() + Send>>,
}

impl LockToken {
    pub fn new(key: SlotKey, on_release: impl FnOnce() + Send + 'static) -> Self {
        Self {
            key,
            on_release: Some(Box::new(on_release)),
        }
    }

    pub fn key(&self) -> SlotKey {
        self.key
    }

    pub fn release(self) {}
}

impl Drop for LockToken {
    fn drop(&mut self) {
        if let Some(release) = self.on_release.take() {
            release();
        }
    }
}

impl std::fmt::Debug for LockToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockToken").field("key", &self.key).finish()
    }
}

/// Where advisory locks live: in-process, or an external lock service.
#[async_trait]
pub trait SlotLockBackend: Send + Sync {
    /// Wait until `key` is free and take it.
    async fn acquire(&self, key: SlotKey) -> Result<LockToken, LockError>;
}

/// One async mutex per live key. Entries are pruned when the last holder
/// or waiter lets go.
#[derive(Default)]
pub struct InProcessSlotLocks {
    table: Arc<DashMap<SlotKey, Arc<Mutex<()>>>>,
}

impl InProcessSlotLocks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn live_keys(&self) -> usize {
        self.table.len()
    }
}

#[async_trait]
impl SlotLockBackend for InProcessSlotLocks {
    async fn acquire(&self, key: SlotKey) -> Result<LockToken, LockError> {
        let mutex = self.table.entry(key).or_default().value().clone();
        let table = Arc::downgrade(&self.table);
        let pruner = PruneOnDrop { table, key };
        let guard = mutex.lock_owned().await;
        Ok(LockToken::new(key, move || {
            drop(guard);
            drop(pruner);
        }))
    }
}

/// Drops the table entry for `key` once nobody else references its mutex.
/// Also runs when an acquisition is abandoned mid-wait.
struct PruneOnDrop {
    table: std::sync::Weak<DashMap<SlotKey, Arc<Mutex<()>>>>,
    key: SlotKey,
}

impl Drop for PruneOnDrop {
    fn drop(&mut self) {
        if let Some(table) = self.table.upgrade() {
            // The map's own Arc is the only one left once every holder and
            // waiter is gone.
            table.remove_if(&self.key, |_, m| Arc::strong_count(m) == 1);
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdvisoryLockConfig {
    /// Width of the time bucket windows are truncated to.
    pub bucket_ms: Ms,
    /// Upper bound on waiting for a key; exceeding it is an acquisition failure.
    pub acquire_timeout: Duration,
}

impl Default for AdvisoryLockConfig {
    fn default() -> Self {
        Self {
            bucket_ms: 60_000,
            acquire_timeout: Duration::from_millis(250),
        }
    }
}

pub struct AdvisorySlotLock {
    backend: Arc<dyn SlotLockBackend>,
    config: AdvisoryLockConfig,
}

impl AdvisorySlotLock {
    pub fn new(backend: Arc<dyn SlotLockBackend>, config: AdvisoryLockConfig) -> Self {
        Self { backend, config }
    }

    pub fn in_process(config: AdvisoryLockConfig) -> Self {
        Self::new(Arc::new(InProcessSlotLocks::new()), config)
    }

    pub fn key_for(&self, resource_id: Ulid, window: &TimeWindow) -> SlotKey {
        SlotKey::derive(resource_id, window, self.config.bucket_ms)
    }

    pub async fn acquire(
        &self,
        resource_id: Ulid,
        window: &TimeWindow,
    ) -> Result<LockToken, LockError> {
        let key = self.key_for(resource_id, window);
        tokio::time::timeout(self.config.acquire_timeout, self.backend.acquire(key))
            .await
            .map_err(|_| LockError::Timeout(self.config.acquire_timeout))?
    }

    /// `acquire`, with failure logged and swallowed.
    pub async fn acquire_or_warn(&self, resource_id: Ulid, window: &TimeWindow) -> Option<LockToken> {
        match self.acquire(resource_id, window).await {
            Ok(token) => Some(token),
            Err(e) => {
                metrics::counter!(crate::observability::ADVISORY_LOCK_FAILURES_TOTAL).increment(1);
                tracing::warn!(
                    %resource_id,
                    key = self.key_for(resource_id, window).0,
                    error = %e,
                    "advisory lock unavailable, continuing without it"
                );
                None
            }
        }
    }
}
