//! In-memory queue store for testing.

use crate::error::StorageResult;
use crate::store::{QueueSnapshot, QueueStore};
use parking_lot::RwLock;
use std::sync::Arc;

/// An in-memory queue store.
///
/// Suitable for unit tests, integration tests, and ephemeral queues
/// that don't need persistence. Cloning shares the underlying snapshot,
/// which lets tests reopen "the same store" to exercise recovery.
#[derive(Debug, Default, Clone)]
pub struct MemoryStore {
    snapshot: Arc<RwLock<QueueSnapshot>>,
}

impl MemoryStore {
    /// Creates a new empty in-memory store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a store pre-seeded with a snapshot.
    ///
    /// Useful for testing recovery scenarios.
    #[must_use]
    pub fn with_snapshot(snapshot: QueueSnapshot) -> Self {
        Self {
            snapshot: Arc::new(RwLock::new(snapshot)),
        }
    }

    /// Returns a copy of the current snapshot.
    #[must_use]
    pub fn snapshot(&self) -> QueueSnapshot {
        self.snapshot.read().clone()
    }
}

impl QueueStore for MemoryStore {
    fn load(&self) -> StorageResult<QueueSnapshot> {
        Ok(self.snapshot.read().clone())
    }

    fn save(&self, snapshot: &QueueSnapshot) -> StorageResult<()> {
        *self.snapshot.write() = snapshot.clone();
        Ok(())
    }
}
