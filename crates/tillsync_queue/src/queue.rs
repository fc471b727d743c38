//! The durable local queue.

use crate::error::{StorageError, StorageResult};
use crate::store::{QueueSnapshot, QueueStore};
use parking_lot::Mutex;
use serde_json::Value;
use tillsync_protocol::{EntityKind, Operation, QueueItem, SyncStatus};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Outcome of one item's transmission, as reported by the remote.
#[derive(Debug, Clone, PartialEq)]
pub enum ItemOutcome {
    /// The remote applied the mutation. Carries canonical
    /// server-assigned fields to merge back into the payload.
    Synced {
        /// Replacement payload, when the server assigned fields.
        server_payload: Option<Value>,
    },
    /// The remote rejected the mutation or it never arrived.
    Failed {
        /// Failure reason recorded on the item.
        error: String,
    },
}

/// Item counts per status, computed on demand.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueCounts {
    /// Items waiting for their first or next transmission.
    pub pending: usize,
    /// Items in an in-flight batch.
    pub syncing: usize,
    /// Items acknowledged by the remote.
    pub synced: usize,
    /// Items whose last attempt failed.
    pub failed: usize,
}

/// The durable local queue of pending mutations.
///
/// The queue is the single shared mutable resource of the sync engine.
/// All mutation goes through this API, which serializes concurrent
/// calls so two sync cycles can never select overlapping batches.
///
/// # Status invariants
///
/// - Transitions are pending → syncing → {synced | failed} only, plus
///   failed → pending via [`SyncQueue::reset_failed`]
/// - Synced items are never returned by [`SyncQueue::list_pending`]
/// - Items found `syncing` at open are reset to `pending`: the process
///   cannot have left a request in flight past its own lifetime
pub struct SyncQueue {
    store: Box<dyn QueueStore>,
    inner: Mutex<QueueSnapshot>,
    device_id: String,
}

impl SyncQueue {
    /// Opens the queue over the given store, running crash recovery.
    ///
    /// A fresh store gets a generated v4 device id, persisted
    /// immediately.
    ///
    /// # Errors
    ///
    /// Returns an error if the snapshot cannot be loaded or the
    /// recovered state cannot be persisted.
    pub fn open<S: QueueStore + 'static>(store: S) -> StorageResult<Self> {
        let mut snapshot = store.load()?;
        let mut dirty = false;

        let recovered = snapshot
            .items
            .iter_mut()
            .filter(|item| item.sync_status == SyncStatus::Syncing)
            .map(|item| item.sync_status = SyncStatus::Pending)
            .count();
        if recovered > 0 {
            info!(recovered, "reset in-flight items to pending at startup");
            dirty = true;
        }

        let device_id = match snapshot.device_id.clone() {
            Some(id) => id,
            None => {
                let id = Uuid::new_v4().to_string();
                snapshot.device_id = Some(id.clone());
                dirty = true;
                debug!(device_id = %id, "provisioned device identity");
                id
            }
        };

        if dirty {
            store.save(&snapshot)?;
        }

        Ok(Self {
            store: Box::new(store),
            inner: Mutex::new(snapshot),
            device_id,
        })
    }

    /// Returns the persisted device identity.
    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    /// Returns the last persisted sync checkpoint.
    pub fn last_sync_timestamp(&self) -> Option<i64> {
        self.inner.lock().last_sync_timestamp
    }

    /// Persists a new sync checkpoint.
    ///
    /// # Errors
    ///
    /// Returns an error if the snapshot cannot be saved.
    pub fn set_last_sync_timestamp(&self, timestamp: i64) -> StorageResult<()> {
        let mut inner = self.inner.lock();
        let previous = inner.last_sync_timestamp;
        inner.last_sync_timestamp = Some(timestamp);
        if let Err(err) = self.store.save(&inner) {
            inner.last_sync_timestamp = previous;
            return Err(err);
        }
        Ok(())
    }

    /// Persists a new pending item and returns it.
    ///
    /// The item is visible to [`SyncQueue::list_pending`] as soon as
    /// this returns.
    ///
    /// # Errors
    ///
    /// Returns an error if the item cannot be persisted; the queue is
    /// left unchanged in that case.
    pub fn enqueue(
        &self,
        entity_kind: EntityKind,
        operation: Operation,
        payload: Value,
        now: i64,
    ) -> StorageResult<QueueItem> {
        self.enqueue_for(Uuid::new_v4(), entity_kind, operation, payload, now)
    }

    /// Persists a new pending item under an existing entity identity.
    ///
    /// Updates and deletes should carry the entity's original id so the
    /// remote can match them to the record and conflict resolution can
    /// match server updates back to unsynced local items.
    ///
    /// # Errors
    ///
    /// Returns an error if the item cannot be persisted; the queue is
    /// left unchanged in that case.
    pub fn enqueue_for(
        &self,
        id: Uuid,
        entity_kind: EntityKind,
        operation: Operation,
        payload: Value,
        now: i64,
    ) -> StorageResult<QueueItem> {
        let item = QueueItem::with_id(
            id,
            self.device_id.clone(),
            entity_kind,
            operation,
            payload,
            now,
        );

        let mut inner = self.inner.lock();
        inner.items.push(item.clone());
        if let Err(err) = self.store.save(&inner) {
            inner.items.pop();
            return Err(err);
        }

        debug!(id = %item.id, kind = entity_kind.as_str(), "enqueued mutation");
        Ok(item)
    }

    /// Lists items awaiting transmission, oldest first.
    ///
    /// Returns `pending` items plus `failed` items below the retry
    /// ceiling; failed items at or past the ceiling stay out until
    /// [`SyncQueue::reset_failed`] is called.
    pub fn list_pending(&self, retry_ceiling: u32) -> Vec<QueueItem> {
        let inner = self.inner.lock();
        let mut eligible: Vec<QueueItem> = inner
            .items
            .iter()
            .filter(|item| match item.sync_status {
                SyncStatus::Pending => true,
                SyncStatus::Failed => item.retry_count < retry_ceiling,
                _ => false,
            })
            .cloned()
            .collect();
        eligible.sort_by_key(|item| item.created_at);
        eligible
    }

    /// Transitions the listed items to `syncing` and stamps their
    /// attempt time. Returns the items actually marked.
    ///
    /// Idempotent: items already `syncing` (from a concurrent cycle) or
    /// already `synced` are skipped, never re-selected.
    ///
    /// # Errors
    ///
    /// Returns an error if the transition cannot be persisted. The
    /// in-memory transition is rolled back in that case so the batch
    /// stays selectable once storage recovers.
    pub fn mark_syncing(&self, ids: &[Uuid], now: i64) -> StorageResult<Vec<QueueItem>> {
        let mut inner = self.inner.lock();
        let backup = inner.clone();
        let mut marked = Vec::new();

        for item in inner.items.iter_mut() {
            if ids.contains(&item.id) && item.needs_sync() {
                item.sync_status = SyncStatus::Syncing;
                item.last_attempt_at = Some(now);
                marked.push(item.clone());
            }
        }

        if !marked.is_empty() {
            if let Err(err) = self.store.save(&inner) {
                *inner = backup;
                return Err(err);
            }
        }
        marked.sort_by_key(|item| item.created_at);
        Ok(marked)
    }

    /// Records the remote's outcome for one item.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::UnknownItem`] if the id is not in the
    /// queue, or a storage error if persistence fails. Either way the
    /// failure is scoped to this item; callers log and continue.
    pub fn apply_outcome(&self, id: Uuid, outcome: ItemOutcome) -> StorageResult<()> {
        let mut inner = self.inner.lock();
        let item = inner
            .items
            .iter_mut()
            .find(|item| item.id == id)
            .ok_or(StorageError::UnknownItem(id))?;

        match outcome {
            ItemOutcome::Synced { server_payload } => {
                item.sync_status = SyncStatus::Synced;
                item.last_error = None;
                if let Some(payload) = server_payload {
                    item.payload = payload;
                }
            }
            ItemOutcome::Failed { error } => {
                item.sync_status = SyncStatus::Failed;
                item.retry_count += 1;
                warn!(%id, retry_count = item.retry_count, %error, "item failed to sync");
                item.last_error = Some(error);
            }
        }

        self.store.save(&inner)
    }

    /// Marks a still-unsynced local item for this entity as `synced`
    /// without transmission: the server already reflects or supersedes
    /// it. Returns true if an item was superseded.
    ///
    /// # Errors
    ///
    /// Returns an error if persistence fails; the item is left
    /// untouched and will be transmitted or superseded on a later
    /// cycle.
    pub fn mark_entity_synced(&self, kind: EntityKind, id: Uuid) -> StorageResult<bool> {
        let mut inner = self.inner.lock();
        let Some(idx) = inner
            .items
            .iter()
            .position(|item| item.id == id && item.entity_kind == kind && item.needs_sync())
        else {
            return Ok(false);
        };

        let previous = inner.items[idx].clone();
        let item = &mut inner.items[idx];
        item.sync_status = SyncStatus::Synced;
        item.last_error = None;
        if let Err(err) = self.store.save(&inner) {
            inner.items[idx] = previous;
            return Err(err);
        }
        debug!(%id, "local item superseded by server version");
        Ok(true)
    }

    /// Marks a still-unsynced local item for this entity as `failed`
    /// with the given reason and parks it past any retry ceiling. Used
    /// when the entity was deleted remotely: retransmitting the
    /// mutation could resurrect an entity the remote already removed,
    /// so it is surfaced for an explicit [`SyncQueue::reset_failed`]
    /// instead of retried automatically. Returns true if an item
    /// matched.
    ///
    /// # Errors
    ///
    /// Returns an error if persistence fails; the item is left
    /// untouched in that case.
    pub fn mark_entity_failed(
        &self,
        kind: EntityKind,
        id: Uuid,
        reason: impl Into<String>,
    ) -> StorageResult<bool> {
        let mut inner = self.inner.lock();
        let Some(idx) = inner
            .items
            .iter()
            .position(|item| item.id == id && item.entity_kind == kind && item.needs_sync())
        else {
            return Ok(false);
        };

        let previous = inner.items[idx].clone();
        let item = &mut inner.items[idx];
        item.sync_status = SyncStatus::Failed;
        item.last_error = Some(reason.into());
        item.retry_count = u32::MAX;
        if let Err(err) = self.store.save(&inner) {
            inner.items[idx] = previous;
            return Err(err);
        }
        Ok(true)
    }

    /// Garbage-collects synced items whose last activity predates
    /// `older_than` (milliseconds). Returns the number removed.
    ///
    /// # Errors
    ///
    /// Returns an error if persistence fails.
    pub fn purge_synced(&self, older_than: i64) -> StorageResult<usize> {
        let mut inner = self.inner.lock();
        let before = inner.items.len();
        inner.items.retain(|item| {
            item.sync_status != SyncStatus::Synced
                || item.last_attempt_at.unwrap_or(item.created_at) >= older_than
        });

        let removed = before - inner.items.len();
        if removed > 0 {
            self.store.save(&inner)?;
            debug!(removed, "purged synced items");
        }
        Ok(removed)
    }

    /// Moves all `failed` items back to `pending`, preserving their
    /// retry counts but clearing the attempt stamp so they are
    /// immediately eligible. Returns the number reset.
    ///
    /// # Errors
    ///
    /// Returns an error if persistence fails.
    pub fn reset_failed(&self) -> StorageResult<usize> {
        let mut inner = self.inner.lock();
        let reset = inner
            .items
            .iter_mut()
            .filter(|item| item.sync_status == SyncStatus::Failed)
            .map(|item| {
                item.sync_status = SyncStatus::Pending;
                item.last_attempt_at = None;
            })
            .count();

        if reset > 0 {
            self.store.save(&inner)?;
            info!(reset, "failed items reset for retry");
        }
        Ok(reset)
    }

    /// Returns per-status counts, computed from current state.
    pub fn counts(&self) -> QueueCounts {
        let inner = self.inner.lock();
        let mut counts = QueueCounts::default();
        for item in &inner.items {
            match item.sync_status {
                SyncStatus::Pending => counts.pending += 1,
                SyncStatus::Syncing => counts.syncing += 1,
                SyncStatus::Synced => counts.synced += 1,
                SyncStatus::Failed => counts.failed += 1,
            }
        }
        counts
    }

    /// Looks up a single item by id.
    pub fn get(&self, id: Uuid) -> Option<QueueItem> {
        self.inner.lock().items.iter().find(|item| item.id == id).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryStore;
    use serde_json::json;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    fn open_queue() -> (SyncQueue, MemoryStore) {
        let store = MemoryStore::new();
        let queue = SyncQueue::open(store.clone()).unwrap();
        (queue, store)
    }

    /// A store whose next save fails on demand.
    struct FlakyStore {
        inner: MemoryStore,
        fail_next_save: Arc<AtomicBool>,
    }

    impl QueueStore for FlakyStore {
        fn load(&self) -> StorageResult<QueueSnapshot> {
            self.inner.load()
        }

        fn save(&self, snapshot: &QueueSnapshot) -> StorageResult<()> {
            if self.fail_next_save.swap(false, Ordering::SeqCst) {
                return Err(StorageError::Io(std::io::Error::new(
                    std::io::ErrorKind::Other,
                    "disk full",
                )));
            }
            self.inner.save(snapshot)
        }
    }

    fn open_flaky() -> (SyncQueue, Arc<AtomicBool>) {
        let fail = Arc::new(AtomicBool::new(false));
        let store = FlakyStore {
            inner: MemoryStore::new(),
            fail_next_save: Arc::clone(&fail),
        };
        (SyncQueue::open(store).unwrap(), fail)
    }

    fn enqueue_at(queue: &SyncQueue, at: i64) -> QueueItem {
        queue
            .enqueue(EntityKind::Order, Operation::Insert, json!({"t": at}), at)
            .unwrap()
    }

    #[test]
    fn open_provisions_device_id() {
        let (queue, store) = open_queue();
        assert!(!queue.device_id().is_empty());

        // Identity is persisted, not regenerated per open.
        let reopened = SyncQueue::open(store).unwrap();
        assert_eq!(reopened.device_id(), queue.device_id());
    }

    #[test]
    fn enqueue_is_immediately_pending() {
        let (queue, _) = open_queue();
        let item = enqueue_at(&queue, 10);

        let pending = queue.list_pending(3);
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].id, item.id);
        assert_eq!(queue.counts().pending, 1);
    }

    #[test]
    fn enqueue_for_keeps_entity_identity() {
        let (queue, _) = open_queue();
        let entity = Uuid::new_v4();

        let item = queue
            .enqueue_for(
                entity,
                EntityKind::CustomerUpdate,
                Operation::Update,
                json!({"name": "Ada"}),
                10,
            )
            .unwrap();

        assert_eq!(item.id, entity);
        assert_eq!(queue.get(entity).unwrap().operation, Operation::Update);
    }

    #[test]
    fn list_pending_is_oldest_first() {
        let (queue, _) = open_queue();
        let c = enqueue_at(&queue, 30);
        let a = enqueue_at(&queue, 10);
        let b = enqueue_at(&queue, 20);

        let ids: Vec<Uuid> = queue.list_pending(3).iter().map(|i| i.id).collect();
        assert_eq!(ids, vec![a.id, b.id, c.id]);
    }

    #[test]
    fn mark_syncing_skips_in_flight_items() {
        let (queue, _) = open_queue();
        let a = enqueue_at(&queue, 10);
        let b = enqueue_at(&queue, 20);

        let first = queue.mark_syncing(&[a.id, b.id], 100).unwrap();
        assert_eq!(first.len(), 2);

        // A concurrent cycle selecting the same ids gets nothing.
        let second = queue.mark_syncing(&[a.id, b.id], 101).unwrap();
        assert!(second.is_empty());
        assert!(queue.list_pending(3).is_empty());
    }

    #[test]
    fn apply_outcome_synced_merges_server_payload() {
        let (queue, _) = open_queue();
        let item = enqueue_at(&queue, 10);
        queue.mark_syncing(&[item.id], 50).unwrap();

        queue
            .apply_outcome(
                item.id,
                ItemOutcome::Synced {
                    server_payload: Some(json!({"serverSeq": 7})),
                },
            )
            .unwrap();

        let stored = queue.get(item.id).unwrap();
        assert_eq!(stored.sync_status, SyncStatus::Synced);
        assert_eq!(stored.payload, json!({"serverSeq": 7}));
    }

    #[test]
    fn apply_outcome_failed_increments_retry() {
        let (queue, _) = open_queue();
        let item = enqueue_at(&queue, 10);
        queue.mark_syncing(&[item.id], 50).unwrap();

        queue
            .apply_outcome(
                item.id,
                ItemOutcome::Failed {
                    error: "stock rejected".into(),
                },
            )
            .unwrap();

        let stored = queue.get(item.id).unwrap();
        assert_eq!(stored.sync_status, SyncStatus::Failed);
        assert_eq!(stored.retry_count, 1);
        assert_eq!(stored.last_error.as_deref(), Some("stock rejected"));
    }

    #[test]
    fn apply_outcome_unknown_item() {
        let (queue, _) = open_queue();
        let result = queue.apply_outcome(
            Uuid::new_v4(),
            ItemOutcome::Synced {
                server_payload: None,
            },
        );
        assert!(matches!(result, Err(StorageError::UnknownItem(_))));
    }

    #[test]
    fn retry_ceiling_excludes_items_until_reset() {
        let (queue, _) = open_queue();
        let item = enqueue_at(&queue, 10);

        for round in 0..3 {
            queue.mark_syncing(&[item.id], 50 + round).unwrap();
            queue
                .apply_outcome(item.id, ItemOutcome::Failed { error: "down".into() })
                .unwrap();
        }

        assert!(queue.list_pending(3).is_empty());
        assert_eq!(queue.counts().failed, 1);

        assert_eq!(queue.reset_failed().unwrap(), 1);
        let pending = queue.list_pending(3);
        assert_eq!(pending.len(), 1);
        // Retry count survives the reset; the attempt stamp does not,
        // so the item is eligible without waiting out a backoff.
        assert_eq!(pending[0].retry_count, 3);
        assert!(pending[0].last_attempt_at.is_none());
    }

    #[test]
    fn startup_recovery_resets_syncing_once() {
        let (queue, store) = open_queue();
        let item = enqueue_at(&queue, 10);
        queue.mark_syncing(&[item.id], 50).unwrap();
        drop(queue);

        // Simulated crash: item was in flight.
        let recovered = SyncQueue::open(store.clone()).unwrap();
        assert_eq!(
            recovered.get(item.id).unwrap().sync_status,
            SyncStatus::Pending
        );
        drop(recovered);

        // Recovery is idempotent across repeated startups.
        let again = SyncQueue::open(store).unwrap();
        assert_eq!(again.get(item.id).unwrap().sync_status, SyncStatus::Pending);
        assert_eq!(again.counts().pending, 1);
    }

    #[test]
    fn purge_synced_respects_retention() {
        let (queue, _) = open_queue();
        let old = enqueue_at(&queue, 10);
        let fresh = enqueue_at(&queue, 20);

        queue.mark_syncing(&[old.id], 100).unwrap();
        queue
            .apply_outcome(old.id, ItemOutcome::Synced { server_payload: None })
            .unwrap();
        queue.mark_syncing(&[fresh.id], 5_000).unwrap();
        queue
            .apply_outcome(fresh.id, ItemOutcome::Synced { server_payload: None })
            .unwrap();

        let removed = queue.purge_synced(1_000).unwrap();
        assert_eq!(removed, 1);
        assert!(queue.get(old.id).is_none());
        assert!(queue.get(fresh.id).is_some());
    }

    #[test]
    fn mark_entity_synced_only_touches_unsynced() {
        let (queue, _) = open_queue();
        let item = enqueue_at(&queue, 10);

        assert!(queue.mark_entity_synced(EntityKind::Order, item.id).unwrap());
        assert_eq!(queue.get(item.id).unwrap().sync_status, SyncStatus::Synced);

        // Second call finds nothing left to supersede.
        assert!(!queue.mark_entity_synced(EntityKind::Order, item.id).unwrap());
        // Wrong kind never matches.
        assert!(!queue
            .mark_entity_synced(EntityKind::Transaction, item.id)
            .unwrap());
    }

    #[test]
    fn mark_entity_failed_parks_item_until_reset() {
        let (queue, _) = open_queue();
        let item = enqueue_at(&queue, 10);

        assert!(queue
            .mark_entity_failed(EntityKind::Order, item.id, "deleted remotely")
            .unwrap());

        let stored = queue.get(item.id).unwrap();
        assert_eq!(stored.sync_status, SyncStatus::Failed);
        assert_eq!(stored.last_error.as_deref(), Some("deleted remotely"));

        // Past any ceiling: never auto-selected, only an explicit reset
        // makes it transmittable again.
        assert!(queue.list_pending(1_000).is_empty());
        assert_eq!(queue.reset_failed().unwrap(), 1);
        assert_eq!(queue.list_pending(3).len(), 1);
    }

    #[test]
    fn failed_mark_syncing_save_rolls_back() {
        let (queue, fail) = open_flaky();
        let item = enqueue_at(&queue, 10);

        fail.store(true, Ordering::SeqCst);
        assert!(queue.mark_syncing(&[item.id], 50).is_err());

        // Once storage recovers the batch is still selectable.
        let pending = queue.list_pending(3);
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].sync_status, SyncStatus::Pending);
        assert!(pending[0].last_attempt_at.is_none());

        let marked = queue.mark_syncing(&[item.id], 60).unwrap();
        assert_eq!(marked.len(), 1);
    }

    #[test]
    fn failed_checkpoint_save_rolls_back() {
        let (queue, fail) = open_flaky();
        queue.set_last_sync_timestamp(100).unwrap();

        fail.store(true, Ordering::SeqCst);
        assert!(queue.set_last_sync_timestamp(200).is_err());
        assert_eq!(queue.last_sync_timestamp(), Some(100));
    }

    #[test]
    fn failed_entity_mark_saves_roll_back() {
        let (queue, fail) = open_flaky();
        let item = enqueue_at(&queue, 10);

        fail.store(true, Ordering::SeqCst);
        assert!(queue.mark_entity_synced(EntityKind::Order, item.id).is_err());
        assert_eq!(queue.get(item.id).unwrap().sync_status, SyncStatus::Pending);

        fail.store(true, Ordering::SeqCst);
        assert!(queue
            .mark_entity_failed(EntityKind::Order, item.id, "deleted remotely")
            .is_err());
        let stored = queue.get(item.id).unwrap();
        assert_eq!(stored.sync_status, SyncStatus::Pending);
        assert_eq!(stored.retry_count, 0);
        assert!(stored.last_error.is_none());
    }

    #[test]
    fn checkpoint_roundtrip() {
        let (queue, store) = open_queue();
        assert_eq!(queue.last_sync_timestamp(), None);

        queue.set_last_sync_timestamp(4_200).unwrap();
        assert_eq!(queue.last_sync_timestamp(), Some(4_200));

        let reopened = SyncQueue::open(store).unwrap();
        assert_eq!(reopened.last_sync_timestamp(), Some(4_200));
    }
}
