//! Sync state, its observable cell, and the on-demand status report.

use parking_lot::RwLock;
use std::sync::mpsc::{self, Receiver, Sender};
use tillsync_queue::QueueCounts;

/// The current state of the sync engine.
///
/// Transitions are driven exclusively by the orchestrator:
/// idle → syncing → {success | error} → idle. Domain and UI code only
/// ever observe this value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncState {
    /// No cycle is running.
    Idle,
    /// A cycle is in flight.
    Syncing,
    /// The last cycle completed.
    Success {
        /// Items acknowledged in that cycle.
        synced: usize,
        /// Items rejected in that cycle.
        failed: usize,
    },
    /// The last cycle failed before receiving per-item outcomes.
    Error(String),
}

/// Counters accumulated across cycles.
#[derive(Debug, Clone, Default)]
pub struct SyncStats {
    /// Completed sync cycles.
    pub cycles_completed: u64,
    /// Items acknowledged by the remote.
    pub items_synced: u64,
    /// Items rejected or failed in transit.
    pub items_failed: u64,
    /// Local items superseded by server versions.
    pub items_superseded: u64,
    /// Last cycle-level error message.
    pub last_error: Option<String>,
    /// Checkpoint of the last successful cycle.
    pub last_success_at: Option<i64>,
}

/// Read-only aggregate over the queue and the engine state.
///
/// Computed on demand; there is no separate mutable cache that can
/// drift from the queue.
#[derive(Debug, Clone, PartialEq)]
pub struct SyncReport {
    /// Per-status item counts.
    pub counts: QueueCounts,
    /// Checkpoint up to which server-side updates have been seen.
    pub last_sync_timestamp: Option<i64>,
    /// The engine's current state.
    pub state: SyncState,
}

/// An observable holder of the current [`SyncState`].
///
/// Observers subscribe over a channel; dropping a receiver never
/// affects the orchestrator (dead subscribers are pruned on the next
/// publish).
#[derive(Default)]
pub struct SyncStateCell {
    current: RwLock<Option<SyncState>>,
    subscribers: RwLock<Vec<Sender<SyncState>>>,
}

impl SyncStateCell {
    /// Creates a cell starting in `Idle`.
    pub fn new() -> Self {
        Self {
            current: RwLock::new(Some(SyncState::Idle)),
            subscribers: RwLock::new(Vec::new()),
        }
    }

    /// Returns the current state.
    pub fn current(&self) -> SyncState {
        self.current.read().clone().unwrap_or(SyncState::Idle)
    }

    /// Publishes a new state to all live subscribers.
    pub fn set(&self, state: SyncState) {
        *self.current.write() = Some(state.clone());
        self.subscribers
            .write()
            .retain(|sender| sender.send(state.clone()).is_ok());
    }

    /// Subscribes to state transitions.
    pub fn subscribe(&self) -> Receiver<SyncState> {
        let (sender, receiver) = mpsc::channel();
        self.subscribers.write().push(sender);
        receiver
    }

    /// Returns the number of live subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.subscribers.read().len()
    }
}
