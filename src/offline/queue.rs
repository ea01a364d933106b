//! # Sync Operations
//!
//! A [`SyncOperation`] is the immutable record of one intended mutation. Its
//! identifier doubles as the idempotency key sent to the remote, so replaying
//! the same operation after a dropped response never applies twice.
//!
//! The payload is a tagged [`Change`]: creates and updates carry a typed
//! [`EntitySnapshot`], deletes carry nothing. The persisted form splits the tag
//! into a `kind` column and the snapshot into a nullable JSON column;
//! [`Change::from_parts`] decodes it back in one place.
//!
//! ## Lifecycle
//!
//! 1. `OfflineManager` enqueues the operation in the same commit as the entity write
//! 2. `SyncEngine` drains the queue in FIFO order per entity
//! 3. Success dequeues; a transient failure bumps `retry_count` and sets `next_attempt_at`
//! 4. Give-up or permanent failure moves the operation into the failed set as a
//!    [`FailedOperation`], kept for inspection and manual retry

use crate::shared::entity::EntitySnapshot;
use crate::shared::error::StorageError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Operation kind tag
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    Create,
    Update,
    Delete,
}

impl OperationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationKind::Create => "create",
            OperationKind::Update => "update",
            OperationKind::Delete => "delete",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "create" => Some(OperationKind::Create),
            "update" => Some(OperationKind::Update),
            "delete" => Some(OperationKind::Delete),
            _ => None,
        }
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The mutation an operation carries
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", content = "payload", rename_all = "snake_case")]
pub enum Change {
    Create(EntitySnapshot),
    Update(EntitySnapshot),
    Delete,
}

impl Change {
    pub fn kind(&self) -> OperationKind {
        match self {
            Change::Create(_) => OperationKind::Create,
            Change::Update(_) => OperationKind::Update,
            Change::Delete => OperationKind::Delete,
        }
    }

    pub fn snapshot(&self) -> Option<&EntitySnapshot> {
        match self {
            Change::Create(snapshot) | Change::Update(snapshot) => Some(snapshot),
            Change::Delete => None,
        }
    }

    /// Encoded payload column: snapshot JSON, or `None` for deletes
    pub fn payload_json(&self) -> Result<Option<String>, StorageError> {
        self.snapshot()
            .map(serde_json::to_string)
            .transpose()
            .map_err(StorageError::from)
    }

    /// Rebuild from the persisted `kind` and `payload` columns
    pub fn from_parts(kind: &str, payload: Option<&str>) -> Result<Self, StorageError> {
        let kind = OperationKind::parse(kind)
            .ok_or_else(|| StorageError::corrupt("sync_queue", format!("unknown operation kind '{}'", kind)))?;
        let snapshot = |payload: Option<&str>| -> Result<EntitySnapshot, StorageError> {
            let raw = payload.ok_or_else(|| {
                StorageError::corrupt("sync_queue", format!("{} operation without payload", kind))
            })?;
            Ok(serde_json::from_str(raw)?)
        };
        Ok(match kind {
            OperationKind::Create => Change::Create(snapshot(payload)?),
            OperationKind::Update => Change::Update(snapshot(payload)?),
            OperationKind::Delete => Change::Delete,
        })
    }
}

/// One queued mutation
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SyncOperation {
    /// Operation ID, also the idempotency key
    pub id: Uuid,
    /// Target entity (client identifier)
    pub entity_id: Uuid,
    /// The mutation
    pub change: Change,
    /// Timestamp when queued; FIFO order key
    pub created_at: DateTime<Utc>,
    /// Number of failed attempts so far
    pub retry_count: u32,
    /// Earliest time the next attempt may run
    pub next_attempt_at: Option<DateTime<Utc>>,
    /// Error message from last failure
    pub last_error: Option<String>,
}

impl SyncOperation {
    pub fn new(entity_id: Uuid, change: Change, created_at: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            entity_id,
            change,
            created_at,
            retry_count: 0,
            next_attempt_at: None,
            last_error: None,
        }
    }

    pub fn kind(&self) -> OperationKind {
        self.change.kind()
    }

    /// Whether the backoff window has passed
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.next_attempt_at.map_or(true, |at| at <= now)
    }

    /// Record a transient failure and schedule the next attempt
    pub fn record_failure(&mut self, error: impl Into<String>, next_attempt_at: DateTime<Utc>) {
        self.retry_count += 1;
        self.last_error = Some(error.into());
        self.next_attempt_at = Some(next_attempt_at);
    }

    /// Whether the remote may have seen this operation
    pub fn was_attempted(&self) -> bool {
        self.retry_count > 0 || self.last_error.is_some()
    }

    /// Clear the retry schedule for a manual retry.
    ///
    /// `last_error` survives so [`Self::was_attempted`] stays accurate.
    pub fn reset(&mut self) {
        self.retry_count = 0;
        self.next_attempt_at = None;
    }
}

/// Operation parked after giving up
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FailedOperation {
    pub operation: SyncOperation,
    /// Final error
    pub error: String,
    pub failed_at: DateTime<Utc>,
}

/// Queue statistics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueueStats {
    /// Operations waiting to be pushed
    pub pending: usize,
    /// Pending operations inside a backoff window
    pub backing_off: usize,
    /// Parked operations awaiting manual retry
    pub failed: usize,
}

impl QueueStats {
    pub fn from_parts(pending: &[SyncOperation], failed: usize, now: DateTime<Utc>) -> Self {
        Self {
            pending: pending.len(),
            backing_off: pending.iter().filter(|op| !op.is_due(now)).count(),
            failed,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shared::clock::from_millis;
    use assert_matches::assert_matches;
    use serde_json::json;

    fn snapshot() -> EntitySnapshot {
        EntitySnapshot {
            collection: "todos".into(),
            data: json!({"title": "Buy milk"}),
            updated_at: from_millis(1_000),
        }
    }

    #[test]
    fn test_change_parts_round_trip() {
        for change in [Change::Create(snapshot()), Change::Update(snapshot()), Change::Delete] {
            let payload = change.payload_json().unwrap();
            let decoded = Change::from_parts(change.kind().as_str(), payload.as_deref()).unwrap();
            assert_eq!(decoded, change);
        }
    }

    #[test]
    fn test_delete_has_no_payload() {
        assert_eq!(Change::Delete.payload_json().unwrap(), None);
    }

    #[test]
    fn test_corrupt_parts_are_rejected() {
        assert_matches!(
            Change::from_parts("merge", None),
            Err(StorageError::Corrupt { table: "sync_queue", .. })
        );
        assert_matches!(
            Change::from_parts("update", None),
            Err(StorageError::Corrupt { .. })
        );
        assert_matches!(
            Change::from_parts("create", Some("{not json")),
            Err(StorageError::Serialization(_))
        );
    }

    #[test]
    fn test_operation_failure_and_reset() {
        let mut op = SyncOperation::new(Uuid::new_v4(), Change::Delete, from_millis(0));
        assert!(op.is_due(from_millis(0)));
        assert!(!op.was_attempted());

        op.record_failure("timeout", from_millis(5_000));
        assert_eq!(op.retry_count, 1);
        assert!(!op.is_due(from_millis(4_999)));
        assert!(op.is_due(from_millis(5_000)));

        op.reset();
        assert_eq!(op.retry_count, 0);
        assert!(op.is_due(from_millis(0)));
        assert!(op.was_attempted());
    }

    #[test]
    fn test_queue_stats() {
        let mut waiting = SyncOperation::new(Uuid::new_v4(), Change::Delete, from_millis(0));
        waiting.record_failure("timeout", from_millis(10_000));
        let ready = SyncOperation::new(Uuid::new_v4(), Change::Delete, from_millis(1));

        let stats = QueueStats::from_parts(&[waiting, ready], 2, from_millis(500));
        assert_eq!(stats, QueueStats { pending: 2, backing_off: 1, failed: 2 });
    }
}
