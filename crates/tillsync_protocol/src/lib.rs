//! # tillsync Protocol
//!
//! Wire contract for the tillsync batch synchronization protocol.
//!
//! This crate provides:
//! - `QueueItem` and its status model
//! - `BatchSyncRequest` / `BatchSyncResponse` messages
//! - `ServerUpdates` payloads carrying other devices' changes
//!
//! This is a pure protocol crate with no I/O operations. All types
//! serialize to the JSON shapes the sync backend expects (camelCase
//! field names).

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod item;
mod messages;

pub use item::{BatchItem, EntityKind, Operation, QueueItem, SyncStatus};
pub use messages::{
    BatchSyncRequest, BatchSyncResponse, DeletedId, ItemResult, ServerEntity, ServerUpdates,
};
