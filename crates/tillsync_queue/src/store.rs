//! Queue store trait definition.

use crate::error::StorageResult;
use serde::{Deserialize, Serialize};
use tillsync_protocol::QueueItem;

/// The full persisted state of the local queue.
///
/// One snapshot holds the item list plus the two scalar records that
/// live alongside it: the device identity and the last sync
/// checkpoint.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QueueSnapshot {
    /// All queue items, in no particular order.
    pub items: Vec<QueueItem>,
    /// Persisted device identity, generated on first open.
    pub device_id: Option<String>,
    /// Checkpoint up to which server-side updates have been seen.
    pub last_sync_timestamp: Option<i64>,
}

/// A persistence backend for the queue.
///
/// Stores are **opaque snapshot stores**: they load and save the whole
/// queue state without interpreting it. The queue owns all state
/// transitions and invariants.
///
/// # Invariants
///
/// - `load` after a successful `save` returns the saved snapshot
/// - `load` on a never-saved store returns the empty snapshot
/// - `save` replaces the previous snapshot atomically; a crash during
///   `save` must leave either the old or the new snapshot readable
/// - Stores must be `Send + Sync` for concurrent access
///
/// # Implementors
///
/// - [`crate::MemoryStore`] - For testing
/// - [`crate::FileStore`] - For persistent storage
pub trait QueueStore: Send + Sync {
    /// Loads the persisted snapshot.
    ///
    /// # Errors
    ///
    /// Returns an error if the snapshot cannot be read or parsed.
    fn load(&self) -> StorageResult<QueueSnapshot>;

    /// Persists the snapshot, replacing any previous one.
    ///
    /// # Errors
    ///
    /// Returns an error if the snapshot cannot be written durably.
    fn save(&self, snapshot: &QueueSnapshot) -> StorageResult<()>;
}
