//! # Entity Model
//!
//! Domain records as the local store sees them, plus the remote-side shapes the
//! network gateway hands back.
//!
//! An [`Entity`] is keyed by a client-generated [`Uuid`] that is stable across
//! devices. The server identifier is bound the first time the remote accepts
//! the entity and never changes afterwards; [`Entity::bind_server_id`] is the
//! only way to set it and refuses to rebind.
//!
//! Application data lives in `data` as a JSON document. Callers go through
//! [`Entity::decode`] and the typed mutation API in
//! [`crate::offline::OfflineManager`] rather than poking at the raw value.

use crate::shared::error::StorageError;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Synchronization state of a local entity
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum SyncStatus {
    /// Matches the last known remote state
    Synced,
    /// Has local changes waiting in the queue
    Pending,
    /// An operation for this entity is in flight
    Syncing,
    /// Retries exhausted or permanently rejected; waits for a user retry
    Failed,
}

impl SyncStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncStatus::Synced => "synced",
            SyncStatus::Pending => "pending",
            SyncStatus::Syncing => "syncing",
            SyncStatus::Failed => "failed",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "synced" => Some(SyncStatus::Synced),
            "pending" => Some(SyncStatus::Pending),
            "syncing" => Some(SyncStatus::Syncing),
            "failed" => Some(SyncStatus::Failed),
            _ => None,
        }
    }

    /// Whether local state may diverge from the remote
    pub fn has_local_changes(&self) -> bool {
        !matches!(self, SyncStatus::Synced)
    }
}

impl fmt::Display for SyncStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A locally stored domain record
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Entity {
    /// Client-generated identifier, stable across devices
    pub id: Uuid,
    /// Server-assigned identifier, immutable once bound
    pub server_id: Option<String>,
    /// Logical collection the record belongs to (e.g. "todos")
    pub collection: String,
    /// Application payload
    pub data: serde_json::Value,
    /// Last-write-wins timestamp of the most recent edit
    pub updated_at: DateTime<Utc>,
    /// Server revision this local copy is based on
    pub base_revision: Option<u64>,
    /// Current synchronization state
    pub sync_status: SyncStatus,
    /// Error from the last failed operation, shown alongside `Failed`
    pub last_error: Option<String>,
}

impl Entity {
    /// Create a new, never-synced entity
    pub fn new(collection: impl Into<String>, data: serde_json::Value, at: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            server_id: None,
            collection: collection.into(),
            data,
            updated_at: at,
            base_revision: None,
            sync_status: SyncStatus::Pending,
            last_error: None,
        }
    }

    /// Materialize a remote record under a local identifier
    pub fn from_remote(id: Uuid, remote: &RemoteEntity) -> Self {
        Self {
            id,
            server_id: Some(remote.server_id.clone()),
            collection: remote.collection.clone(),
            data: remote.data.clone(),
            updated_at: remote.updated_at,
            base_revision: Some(remote.revision),
            sync_status: SyncStatus::Synced,
            last_error: None,
        }
    }

    /// Decode the payload into an application type
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_value(self.data.clone())
    }

    /// Payload snapshot for a queued operation
    pub fn snapshot(&self) -> EntitySnapshot {
        EntitySnapshot {
            collection: self.collection.clone(),
            data: self.data.clone(),
            updated_at: self.updated_at,
        }
    }

    /// This entity's identity carrying the payload of `snapshot`.
    ///
    /// Used to build the outbound value for a queued operation: identity and
    /// base revision come from current local state, the body from the
    /// operation.
    pub fn with_snapshot(&self, snapshot: &EntitySnapshot) -> Self {
        Self {
            collection: snapshot.collection.clone(),
            data: snapshot.data.clone(),
            updated_at: snapshot.updated_at,
            ..self.clone()
        }
    }

    /// Bind the server identifier.
    ///
    /// Binding the same value twice is a no-op. Binding a different value is
    /// an identity conflict and leaves the entity untouched.
    pub fn bind_server_id(&mut self, server_id: &str) -> Result<(), StorageError> {
        match &self.server_id {
            Some(existing) if existing == server_id => Ok(()),
            Some(existing) => Err(StorageError::identity_conflict(
                self.id,
                existing.clone(),
                Some(server_id.to_string()),
            )),
            None => {
                self.server_id = Some(server_id.to_string());
                Ok(())
            }
        }
    }

    /// Validate that `next` may replace `prev` in the store.
    pub fn check_identity(prev: &Entity, next: &Entity) -> Result<(), StorageError> {
        match (&prev.server_id, &next.server_id) {
            (Some(old), Some(new)) if old == new => Ok(()),
            (Some(old), attempted) => Err(StorageError::identity_conflict(
                prev.id,
                old.clone(),
                attempted.clone(),
            )),
            (None, _) => Ok(()),
        }
    }
}

/// Entity payload captured by a queued create or update
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EntitySnapshot {
    pub collection: String,
    pub data: serde_json::Value,
    pub updated_at: DateTime<Utc>,
}

/// Deletion marker retained so removals survive stale remote snapshots
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Tombstone {
    pub entity_id: Uuid,
    /// Server identifier of the deleted entity, if it ever reached the remote
    pub server_id: Option<String>,
    pub collection: String,
    pub deleted_at: DateTime<Utc>,
    /// Whether the remote has confirmed the deletion
    pub acknowledged: bool,
}

/// A record as held by the remote service
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RemoteEntity {
    pub server_id: String,
    /// Client identifier the record was created under, when known
    pub client_id: Option<Uuid>,
    pub collection: String,
    pub data: serde_json::Value,
    /// Last-write-wins timestamp carried over from the writing client
    pub updated_at: DateTime<Utc>,
    /// Server revision, bumped on every accepted write
    pub revision: u64,
}

/// A deletion reported by the remote change feed
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RemoteTombstone {
    pub server_id: String,
    pub client_id: Option<Uuid>,
    pub deleted_at: DateTime<Utc>,
}
