//! Batch sync protocol messages.

use crate::item::{BatchItem, EntityKind};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Batch sync request from client to remote.
///
/// One request carries the whole in-flight batch; the protocol is a
/// single round trip per sync cycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchSyncRequest {
    /// Identifier of the requesting device.
    pub device_id: String,
    /// Checkpoint up to which this client has seen server-side updates.
    pub last_sync_timestamp: Option<i64>,
    /// The items currently marked syncing, in `created_at` order.
    pub items: Vec<BatchItem>,
}

impl BatchSyncRequest {
    /// Creates a new batch request.
    pub fn new(
        device_id: impl Into<String>,
        last_sync_timestamp: Option<i64>,
        items: Vec<BatchItem>,
    ) -> Self {
        Self {
            device_id: device_id.into(),
            last_sync_timestamp,
            items,
        }
    }
}

/// Per-item outcome reported by the remote.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ItemResult {
    /// The item this outcome refers to.
    pub id: Uuid,
    /// Whether the remote applied the mutation.
    pub success: bool,
    /// Rejection reason when `success` is false.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Canonical server-assigned fields to merge back, when present.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_payload: Option<Value>,
}

impl ItemResult {
    /// Creates a success outcome.
    pub fn success(id: Uuid) -> Self {
        Self {
            id,
            success: true,
            error: None,
            server_payload: None,
        }
    }

    /// Creates a success outcome carrying server-assigned fields.
    pub fn success_with_payload(id: Uuid, payload: Value) -> Self {
        Self {
            id,
            success: true,
            error: None,
            server_payload: Some(payload),
        }
    }

    /// Creates a rejection outcome.
    pub fn rejected(id: Uuid, error: impl Into<String>) -> Self {
        Self {
            id,
            success: false,
            error: Some(error.into()),
            server_payload: None,
        }
    }
}

/// An entity created or updated by another device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerEntity {
    /// Kind of the record.
    pub entity_kind: EntityKind,
    /// Entity identifier.
    pub id: Uuid,
    /// Current server-side record.
    pub payload: Value,
}

/// An entity deleted by another device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeletedId {
    /// Kind of the record.
    pub entity_kind: EntityKind,
    /// Entity identifier.
    pub id: Uuid,
}

/// Server-origin changes since the client's last checkpoint.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerUpdates {
    /// Entities created or updated by other devices.
    #[serde(default)]
    pub updated: Vec<ServerEntity>,
    /// Entities deleted by other devices.
    #[serde(default)]
    pub deleted_ids: Vec<DeletedId>,
}

impl ServerUpdates {
    /// Returns true if there is nothing to merge.
    pub fn is_empty(&self) -> bool {
        self.updated.is_empty() && self.deleted_ids.is_empty()
    }
}

/// Batch sync response from the remote.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchSyncResponse {
    /// Whether the batch was processed.
    pub success: bool,
    /// One outcome per submitted item.
    #[serde(default)]
    pub item_results: Vec<ItemResult>,
    /// Changes made by other devices since the client's checkpoint.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_updates: Option<ServerUpdates>,
    /// Checkpoint to persist for the next cycle.
    pub new_sync_timestamp: i64,
}

impl BatchSyncResponse {
    /// Creates a response with the given outcomes and no server updates.
    pub fn new(item_results: Vec<ItemResult>, new_sync_timestamp: i64) -> Self {
        Self {
            success: true,
            item_results,
            server_updates: None,
            new_sync_timestamp,
        }
    }

    /// Attaches server-origin updates.
    pub fn with_server_updates(mut self, updates: ServerUpdates) -> Self {
        self.server_updates = Some(updates);
        self
    }
}
