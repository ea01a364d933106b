//! # Offline Mutation API
//!
//! The single surface through which application code changes data. Every
//! mutation writes the entity and enqueues its [`SyncOperation`] in one atomic
//! batch, so the local store is immediately up to date and the change survives
//! a restart even if it never reached the remote.
//!
//! ## Architecture
//!
//! - **Operation Queue**: durable FIFO of pending mutations (`queue.rs`)
//! - **Retry Logic**: exponential backoff and give-up threshold (`retry.rs`)
//! - **Reconciliation**: last-write-wins conflict resolution (`reconciliation.rs`)
//!
//! ## Usage
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use serde::{Deserialize, Serialize};
//! use xfsync::offline::OfflineManager;
//! use xfsync::shared::{SyncStatus, SystemClock};
//! use xfsync::store::MemoryStore;
//!
//! #[derive(Serialize, Deserialize)]
//! struct Todo {
//!     title: String,
//!     done: bool,
//! }
//!
//! # async fn run() -> Result<(), xfsync::shared::SyncError> {
//! let manager = OfflineManager::new(Arc::new(MemoryStore::new()), Arc::new(SystemClock));
//!
//! let todo = manager.create("todos", &Todo { title: "Buy milk".into(), done: false }).await?;
//! assert_eq!(todo.sync_status, SyncStatus::Pending);
//! assert_eq!(manager.queue_stats().await?.pending, 1);
//! # Ok(())
//! # }
//! ```

pub mod queue;
pub mod reconciliation;
pub mod retry;

pub use queue::{Change, FailedOperation, OperationKind, QueueStats, SyncOperation};
pub use reconciliation::{ConflictResolver, Disposition, LastWriteWins, Resolution};
pub use retry::{BackoffStrategy, RetryPolicy};

use crate::shared::clock::Clock;
use crate::shared::entity::{Entity, SyncStatus, Tombstone};
use crate::shared::error::SyncError;
use crate::shared::event::{OperationOutcome, SyncEvent};
use crate::store::{LocalStore, WriteBatch};
use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::broadcast;
use uuid::Uuid;

/// Application-facing mutation API
#[derive(Clone)]
pub struct OfflineManager {
    store: Arc<dyn LocalStore>,
    clock: Arc<dyn Clock>,
}

impl std::fmt::Debug for OfflineManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OfflineManager").finish_non_exhaustive()
    }
}

impl OfflineManager {
    /// Create a new offline manager
    pub fn new(store: Arc<dyn LocalStore>, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    pub fn store(&self) -> &Arc<dyn LocalStore> {
        &self.store
    }

    /// Subscribe to store and sync events
    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.store.events().subscribe()
    }

    /// Create an entity and queue its `create` operation
    pub async fn create<T: Serialize + ?Sized>(&self, collection: &str, value: &T) -> Result<Entity, SyncError> {
        let data = serde_json::to_value(value)?;
        let entity = Entity::new(collection, data, self.clock.now());
        let _guard = self.store.lock_entity(entity.id).await;

        let op = SyncOperation::new(entity.id, Change::Create(entity.snapshot()), entity.updated_at);
        self.store
            .commit(WriteBatch::new().put_entity(entity.clone()).enqueue(op))
            .await?;

        tracing::debug!("Created {} in '{}'", entity.id, collection);
        Ok(entity)
    }

    /// Replace an entity's payload and queue an `update` operation.
    ///
    /// Editing a `failed` entity is an explicit user action: its parked
    /// operations go back into the queue ahead of the new one.
    pub async fn update<T: Serialize + ?Sized>(&self, id: Uuid, value: &T) -> Result<Entity, SyncError> {
        let data = serde_json::to_value(value)?;
        let _guard = self.store.lock_entity(id).await;
        let mut entity = self.store.get(id).await?.ok_or(SyncError::NotFound(id))?;

        let mut batch = self.restore_parked(&entity).await?;
        entity.updated_at = self.next_edit_time(entity.updated_at);
        entity.data = data;
        entity.sync_status = SyncStatus::Pending;
        entity.last_error = None;

        let op = SyncOperation::new(id, Change::Update(entity.snapshot()), entity.updated_at);
        batch = batch.put_entity(entity.clone()).enqueue(op);
        self.store.commit(batch).await?;

        tracing::debug!("Updated {}", id);
        Ok(entity)
    }

    /// Delete an entity, leaving a tombstone and a queued `delete` operation.
    ///
    /// An entity the remote has never seen is dropped together with its
    /// queued operations; nothing is sent.
    pub async fn delete(&self, id: Uuid) -> Result<(), SyncError> {
        let _guard = self.store.lock_entity(id).await;
        let entity = self.store.get(id).await?.ok_or(SyncError::NotFound(id))?;
        let deleted_at = self.next_edit_time(entity.updated_at);

        let pending = self.store.list_pending_for(id).await?;
        let parked = self.store.list_failed_for(id).await?;
        let remote_unaware = entity.server_id.is_none()
            && pending.iter().all(|op| !op.was_attempted())
            && parked.iter().all(|f| !f.operation.was_attempted());

        let mut tombstone = Tombstone {
            entity_id: id,
            server_id: entity.server_id.clone(),
            collection: entity.collection.clone(),
            deleted_at,
            acknowledged: false,
        };

        if remote_unaware {
            tombstone.acknowledged = true;
            let mut batch = WriteBatch::new().remove_entity(id).put_tombstone(tombstone);
            for op in &pending {
                batch = batch.dequeue(op.id);
            }
            for failed in &parked {
                batch = batch.unpark(failed.operation.id);
            }
            self.store.commit(batch).await?;

            for op in pending.iter().chain(parked.iter().map(|f| &f.operation)) {
                self.store
                    .events()
                    .operation_completed(op.id, id, OperationOutcome::Discarded);
            }
            tracing::debug!("Deleted never-synced {}, dropped {} operations", id, pending.len() + parked.len());
            return Ok(());
        }

        let mut batch = self.restore_parked(&entity).await?;
        let op = SyncOperation::new(id, Change::Delete, deleted_at);
        batch = batch.remove_entity(id).put_tombstone(tombstone).enqueue(op);
        self.store.commit(batch).await?;

        tracing::debug!("Deleted {}", id);
        Ok(())
    }

    /// Current local state
    pub async fn get(&self, id: Uuid) -> Result<Option<Entity>, SyncError> {
        Ok(self.store.get(id).await?)
    }

    /// Live entities in a collection
    pub async fn list(&self, collection: &str) -> Result<Vec<Entity>, SyncError> {
        Ok(self.store.list_entities(Some(collection)).await?)
    }

    /// Re-queue the parked operations of one entity.
    ///
    /// Returns the number of operations restored.
    pub async fn retry_failed(&self, entity_id: Uuid) -> Result<usize, SyncError> {
        let _guard = self.store.lock_entity(entity_id).await;
        let parked = self.store.list_failed_for(entity_id).await?;
        if parked.is_empty() {
            return Ok(0);
        }

        let mut batch = WriteBatch::new();
        for failed in &parked {
            let mut op = failed.operation.clone();
            op.reset();
            batch = batch.unpark(op.id).enqueue(op);
        }
        if let Some(mut entity) = self.store.get(entity_id).await? {
            entity.sync_status = SyncStatus::Pending;
            entity.last_error = None;
            batch = batch.put_entity(entity);
        }
        self.store.commit(batch).await?;

        tracing::info!("Re-queued {} failed operations for {}", parked.len(), entity_id);
        Ok(parked.len())
    }

    /// Operations parked after giving up
    pub async fn failed_operations(&self) -> Result<Vec<FailedOperation>, SyncError> {
        Ok(self.store.list_failed().await?)
    }

    pub async fn queue_stats(&self) -> Result<QueueStats, SyncError> {
        let pending = self.store.list_pending().await?;
        let failed = self.store.list_failed().await?.len();
        Ok(QueueStats::from_parts(&pending, failed, self.clock.now()))
    }

    /// Batch that moves a failed entity's parked operations back into the queue
    async fn restore_parked(&self, entity: &Entity) -> Result<WriteBatch, SyncError> {
        let mut batch = WriteBatch::new();
        if entity.sync_status != SyncStatus::Failed {
            return Ok(batch);
        }
        for failed in self.store.list_failed_for(entity.id).await? {
            let mut op = failed.operation;
            op.reset();
            batch = batch.unpark(op.id).enqueue(op);
        }
        Ok(batch)
    }

    /// Edit timestamps strictly increase per entity
    fn next_edit_time(&self, previous: DateTime<Utc>) -> DateTime<Utc> {
        self.clock.now().max(previous + Duration::milliseconds(1))
    }
}
