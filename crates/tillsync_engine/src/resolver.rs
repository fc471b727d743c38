//! Server-wins conflict resolution.
//!
//! The resolver merges `serverUpdates` payloads into local read state
//! and decides which still-unsynced local items the server has
//! superseded. The policy is last-writer-wins-by-authority: the
//! remote's version always beats an unsynced local one. This is a
//! deliberate scoping decision for an append-mostly workload, not a
//! CRDT or operational-transform merge.

use parking_lot::RwLock;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tillsync_protocol::{EntityKind, ServerUpdates};
use tillsync_queue::SyncQueue;
use tracing::{debug, warn};
use uuid::Uuid;

/// Applies server-origin changes for one entity kind to the local
/// cached read state.
pub trait EntityMerger: Send + Sync {
    /// Inserts or replaces the cached record.
    fn upsert(&self, id: Uuid, payload: &Value);

    /// Removes the cached record, if present.
    fn remove(&self, id: Uuid);
}

/// An in-memory cache of one entity kind's records.
#[derive(Debug, Default)]
pub struct MemoryCache {
    entries: RwLock<HashMap<Uuid, Value>>,
}

impl MemoryCache {
    /// Creates an empty cache.
    pub fn new() -> Self {
        Self::default()
    }

    /// Looks up a cached record.
    pub fn get(&self, id: Uuid) -> Option<Value> {
        self.entries.read().get(&id).cloned()
    }

    /// Returns the number of cached records.
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    /// Returns true if the cache is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

impl EntityMerger for MemoryCache {
    fn upsert(&self, id: Uuid, payload: &Value) {
        self.entries.write().insert(id, payload.clone());
    }

    fn remove(&self, id: Uuid) {
        self.entries.write().remove(&id);
    }
}

/// What one resolution pass did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ResolutionSummary {
    /// Local unsynced items marked synced without transmission.
    pub superseded: usize,
    /// Server records merged into the cache.
    pub merged: usize,
    /// Cache entries removed for remote deletions.
    pub removed: usize,
    /// Local pending mutations failed because their entity was deleted
    /// remotely.
    pub rejected_deleted: usize,
}

/// Merges remote-origin updates into local state.
///
/// Merge behavior per entity kind lives behind a handler table; kinds
/// without a registered handler still get their queue bookkeeping
/// (supersede, deleted-remotely) but no cache merge.
pub struct ConflictResolver {
    queue: Arc<SyncQueue>,
    handlers: HashMap<EntityKind, Arc<dyn EntityMerger>>,
}

impl ConflictResolver {
    /// Creates a resolver with no registered merge handlers.
    pub fn new(queue: Arc<SyncQueue>) -> Self {
        Self {
            queue,
            handlers: HashMap::new(),
        }
    }

    /// Registers the merge handler for one entity kind.
    pub fn register(mut self, kind: EntityKind, handler: Arc<dyn EntityMerger>) -> Self {
        self.handlers.insert(kind, handler);
        self
    }

    /// Applies one response's server updates.
    ///
    /// Queue persistence failures are contained here: the affected
    /// record is logged and the pass continues.
    pub fn apply(&self, updates: &ServerUpdates) -> ResolutionSummary {
        let mut summary = ResolutionSummary::default();

        for entity in &updates.updated {
            match self.queue.mark_entity_synced(entity.entity_kind, entity.id) {
                Ok(true) => summary.superseded += 1,
                Ok(false) => {}
                Err(err) => {
                    warn!(id = %entity.id, %err, "failed to record supersede");
                }
            }

            // Server wins: the cache takes the remote payload even when
            // a local mutation was superseded.
            if let Some(handler) = self.handlers.get(&entity.entity_kind) {
                handler.upsert(entity.id, &entity.payload);
                summary.merged += 1;
            } else {
                debug!(
                    kind = entity.entity_kind.as_str(),
                    "no merge handler registered, cache not updated"
                );
            }
        }

        for deleted in &updates.deleted_ids {
            if let Some(handler) = self.handlers.get(&deleted.entity_kind) {
                handler.remove(deleted.id);
                summary.removed += 1;
            }

            match self.queue.mark_entity_failed(
                deleted.entity_kind,
                deleted.id,
                "deleted remotely",
            ) {
                Ok(true) => summary.rejected_deleted += 1,
                Ok(false) => {}
                Err(err) => {
                    warn!(id = %deleted.id, %err, "failed to record remote deletion");
                }
            }
        }

        summary
    }
}
