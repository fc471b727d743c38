//! Queue items and their status model.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// The kind of domain record a mutation targets.
///
/// No ordering guarantee exists between items of different kinds;
/// the kind is primarily a dispatch key for the conflict resolver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EntityKind {
    /// A point-of-sale order.
    Order,
    /// A payment transaction.
    Transaction,
    /// An update to a customer record.
    CustomerUpdate,
}

impl EntityKind {
    /// Returns the wire name of this kind.
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityKind::Order => "order",
            EntityKind::Transaction => "transaction",
            EntityKind::CustomerUpdate => "customer-update",
        }
    }
}

/// The mutation operation carried by a queue item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Operation {
    /// Create a new record.
    Insert,
    /// Modify an existing record.
    Update,
    /// Remove a record.
    Delete,
}

/// Sync status of a queue item.
///
/// Transitions are restricted to pending → syncing → {synced | failed},
/// plus failed → pending on an explicit retry reset. Synced items are
/// never re-transmitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncStatus {
    /// Exists only locally, not yet transmitted.
    Pending,
    /// Part of an in-flight batch.
    Syncing,
    /// Acknowledged by the remote.
    Synced,
    /// Last transmission attempt failed; eligible for retry.
    Failed,
}

/// A single pending mutation awaiting transmission.
///
/// The `id` is generated on the originating device and is stable across
/// retries so the remote can deduplicate resubmissions. Domain entities
/// carry device-generated UUIDs, so the item id doubles as the entity
/// identity when matching server-side updates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueItem {
    /// Locally-generated unique identifier.
    pub id: Uuid,
    /// Identifier of the originating device.
    pub device_id: String,
    /// Kind of the targeted domain record.
    pub entity_kind: EntityKind,
    /// The mutation operation.
    pub operation: Operation,
    /// Opaque serialized domain record.
    pub payload: Value,
    /// Local enqueue timestamp, in milliseconds.
    pub created_at: i64,
    /// Current sync status.
    pub sync_status: SyncStatus,
    /// Number of transmission attempts so far.
    pub retry_count: u32,
    /// Reason for the last failure, if any.
    #[serde(default)]
    pub last_error: Option<String>,
    /// Timestamp of the most recent transmission attempt, in milliseconds.
    #[serde(default)]
    pub last_attempt_at: Option<i64>,
}

impl QueueItem {
    /// Creates a new pending item with a fresh identity. Use this for
    /// inserts, where the item id becomes the entity id.
    pub fn new(
        device_id: impl Into<String>,
        entity_kind: EntityKind,
        operation: Operation,
        payload: Value,
        created_at: i64,
    ) -> Self {
        Self::with_id(
            Uuid::new_v4(),
            device_id,
            entity_kind,
            operation,
            payload,
            created_at,
        )
    }

    /// Creates a new pending item under an existing entity identity.
    /// Updates and deletes target the entity's original id so the
    /// remote, and the conflict resolver, can match them up.
    pub fn with_id(
        id: Uuid,
        device_id: impl Into<String>,
        entity_kind: EntityKind,
        operation: Operation,
        payload: Value,
        created_at: i64,
    ) -> Self {
        Self {
            id,
            device_id: device_id.into(),
            entity_kind,
            operation,
            payload,
            created_at,
            sync_status: SyncStatus::Pending,
            retry_count: 0,
            last_error: None,
            last_attempt_at: None,
        }
    }

    /// Returns true if this item is waiting for transmission.
    pub fn needs_sync(&self) -> bool {
        matches!(self.sync_status, SyncStatus::Pending | SyncStatus::Failed)
    }

    /// Projects this item onto its wire form.
    pub fn to_batch_item(&self) -> BatchItem {
        BatchItem {
            id: self.id,
            entity_kind: self.entity_kind,
            operation: self.operation,
            payload: self.payload.clone(),
            created_at: self.created_at,
        }
    }
}

/// The wire form of a queue item inside a batch request.
///
/// Carries only the fields the remote needs; local bookkeeping
/// (status, retry count) never goes over the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchItem {
    /// Item identifier, stable across retries.
    pub id: Uuid,
    /// Kind of the targeted domain record.
    pub entity_kind: EntityKind,
    /// The mutation operation.
    pub operation: Operation,
    /// Opaque serialized domain record.
    pub payload: Value,
    /// Local enqueue timestamp, in milliseconds.
    pub created_at: i64,
}
