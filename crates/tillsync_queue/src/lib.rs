//! # tillsync Queue
//!
//! Durable local queue of pending mutations for tillsync.
//!
//! This crate provides the lowest-level persistence layer of the sync
//! engine. The queue exclusively owns `QueueItem` storage plus the two
//! persisted scalars (device id, last sync checkpoint).
//!
//! ## Design Principles
//!
//! - All mutation goes through [`SyncQueue`]'s API; callers never touch
//!   the raw store
//! - Stores are whole-snapshot documents (load, save); the queue owns
//!   all interpretation
//! - Must be `Send + Sync` for concurrent access
//! - Storage errors affect single items only and never propagate to the
//!   orchestrator as fatal
//!
//! ## Available Stores
//!
//! - [`MemoryStore`] - For testing and ephemeral queues
//! - [`FileStore`] - Persistent JSON snapshot with atomic replace
//!
//! ## Example
//!
//! ```rust
//! use tillsync_queue::{MemoryStore, SyncQueue};
//! use tillsync_protocol::{EntityKind, Operation};
//!
//! let queue = SyncQueue::open(MemoryStore::new()).unwrap();
//! let item = queue
//!     .enqueue(
//!         EntityKind::Order,
//!         Operation::Insert,
//!         serde_json::json!({"total": 9.95}),
//!         1_000,
//!     )
//!     .unwrap();
//! assert_eq!(queue.list_pending(3).len(), 1);
//! assert!(item.needs_sync());
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod error;
mod file;
mod memory;
mod queue;
mod store;

pub use error::{StorageError, StorageResult};
pub use file::FileStore;
pub use memory::MemoryStore;
pub use queue::{ItemOutcome, QueueCounts, SyncQueue};
pub use store::{QueueSnapshot, QueueStore};
