//! # tillsync Engine
//!
//! Sync orchestrator and state machine for tillsync.
//!
//! This crate provides:
//! - Sync state machine (idle → syncing → {success | error} → idle)
//! - Batch sync protocol client with HTTP transport abstraction
//! - Connectivity monitoring with debounced resume triggers
//! - Server-wins conflict resolution
//! - Retry with exponential backoff and a per-item ceiling
//! - A service facade with a background worker thread
//!
//! ## Architecture
//!
//! The engine implements a **push-with-piggybacked-pull** model: each
//! cycle transmits one bounded batch of locally queued mutations and
//! the response carries both per-item outcomes and any changes other
//! devices made since the client's checkpoint.
//!
//! ## Key Invariants
//!
//! - The server is authoritative; unsynced local items are superseded
//!   by server versions of the same entity
//! - Only one sync cycle runs at a time; concurrent triggers are no-ops
//! - A batch without an explicit per-item outcome is treated as failed,
//!   never as partially succeeded
//! - Enqueueing never blocks on network I/O

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod clock;
mod config;
mod connectivity;
mod engine;
mod error;
mod http;
mod resolver;
mod service;
mod state;
mod transport;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{RetryConfig, SyncConfig};
pub use connectivity::{AtomicProbe, ConnectivityMonitor, ConnectivityProbe, TcpProbe, Transition};
pub use engine::{CycleOutcome, SyncEngine};
pub use error::{SyncError, SyncResult};
pub use http::{HttpClient, HttpTransport};
pub use resolver::{ConflictResolver, EntityMerger, MemoryCache, ResolutionSummary};
pub use service::SyncService;
pub use state::{SyncReport, SyncState, SyncStateCell, SyncStats};
pub use transport::{MockTransport, SyncTransport};
