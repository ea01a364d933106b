//! # Local Store
//!
//! The durable source of truth for entities, the operation queue, parked
//! operations, tombstones and the pull watermark. The rest of the application
//! reads through this trait; the sync engine and the mutation API are the only
//! writers.
//!
//! ## Atomic writes
//!
//! Every change goes through [`LocalStore::commit`] as a [`WriteBatch`]. A
//! batch commits entirely or not at all, which is what pairs an entity write
//! with its enqueue: after a crash either both are on disk or neither is.
//!
//! ## Observers
//!
//! After a batch commits, the store publishes one
//! [`SyncEvent::EntityChanged`](crate::shared::event::SyncEvent) per entity
//! written or removed, in batch order. Failed batches publish nothing.
//!
//! ## Implementations
//!
//! - [`crate::local_db::LocalDatabase`]: SQLite, one transaction per batch
//! - [`MemoryStore`]: in-process, for tests and ephemeral sessions

pub mod locks;
pub mod memory;

pub use locks::EntityLocks;
pub use memory::MemoryStore;

use crate::offline::queue::{FailedOperation, SyncOperation};
use crate::shared::entity::{Entity, Tombstone};
use crate::shared::error::StorageResult;
use crate::shared::event::EventBus;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::OwnedMutexGuard;
use uuid::Uuid;

/// One write inside a [`WriteBatch`]
#[derive(Debug, Clone, PartialEq)]
pub enum StoreWrite {
    /// Upsert by client identifier; refuses to change a bound server id
    PutEntity(Entity),
    RemoveEntity(Uuid),
    /// Upsert by entity identifier
    PutTombstone(Tombstone),
    /// Append to the active queue
    Enqueue(SyncOperation),
    /// Replace a queued operation's retry bookkeeping
    UpdateOperation(SyncOperation),
    Dequeue(Uuid),
    /// Move an operation from the active queue into the failed set
    Park(FailedOperation),
    /// Drop an operation from the failed set
    Unpark(Uuid),
    SetWatermark(DateTime<Utc>),
}

/// Ordered set of writes committed atomically
#[derive(Debug, Clone, Default, PartialEq)]
pub struct WriteBatch {
    writes: Vec<StoreWrite>,
}

impl WriteBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, write: StoreWrite) -> &mut Self {
        self.writes.push(write);
        self
    }

    pub fn put_entity(mut self, entity: Entity) -> Self {
        self.writes.push(StoreWrite::PutEntity(entity));
        self
    }

    pub fn remove_entity(mut self, id: Uuid) -> Self {
        self.writes.push(StoreWrite::RemoveEntity(id));
        self
    }

    pub fn put_tombstone(mut self, tombstone: Tombstone) -> Self {
        self.writes.push(StoreWrite::PutTombstone(tombstone));
        self
    }

    pub fn enqueue(mut self, op: SyncOperation) -> Self {
        self.writes.push(StoreWrite::Enqueue(op));
        self
    }

    pub fn update_operation(mut self, op: SyncOperation) -> Self {
        self.writes.push(StoreWrite::UpdateOperation(op));
        self
    }

    pub fn dequeue(mut self, op_id: Uuid) -> Self {
        self.writes.push(StoreWrite::Dequeue(op_id));
        self
    }

    pub fn park(mut self, failed: FailedOperation) -> Self {
        self.writes.push(StoreWrite::Park(failed));
        self
    }

    pub fn unpark(mut self, op_id: Uuid) -> Self {
        self.writes.push(StoreWrite::Unpark(op_id));
        self
    }

    pub fn set_watermark(mut self, at: DateTime<Utc>) -> Self {
        self.writes.push(StoreWrite::SetWatermark(at));
        self
    }

    pub fn is_empty(&self) -> bool {
        self.writes.is_empty()
    }

    pub fn len(&self) -> usize {
        self.writes.len()
    }

    pub fn writes(&self) -> &[StoreWrite] {
        &self.writes
    }

    pub fn into_writes(self) -> Vec<StoreWrite> {
        self.writes
    }

    /// Publish the entity events this batch implies
    pub(crate) fn publish_to(&self, events: &EventBus) {
        for write in &self.writes {
            match write {
                StoreWrite::PutEntity(entity) => events.entity_changed(entity),
                StoreWrite::RemoveEntity(id) => events.entity_deleted(*id),
                _ => {}
            }
        }
    }
}

/// Store counters
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StoreStats {
    pub entities: u64,
    pub pending_operations: u64,
    pub failed_operations: u64,
    pub tombstones: u64,
    /// Local deletions the remote has not confirmed yet
    pub unacknowledged_tombstones: u64,
    pub watermark: Option<DateTime<Utc>>,
}

/// Durable local storage
#[async_trait]
pub trait LocalStore: Send + Sync {
    /// Entity by client identifier
    async fn get(&self, id: Uuid) -> StorageResult<Option<Entity>>;

    async fn get_by_server_id(&self, server_id: &str) -> StorageResult<Option<Entity>>;

    /// Live entities, optionally restricted to one collection
    async fn list_entities(&self, collection: Option<&str>) -> StorageResult<Vec<Entity>>;

    /// Active queue in FIFO creation order
    async fn list_pending(&self) -> StorageResult<Vec<SyncOperation>>;

    /// Active queue entries for one entity, in FIFO order
    async fn list_pending_for(&self, entity_id: Uuid) -> StorageResult<Vec<SyncOperation>>;

    /// Parked operations in their original FIFO order
    async fn list_failed(&self) -> StorageResult<Vec<FailedOperation>>;

    async fn list_failed_for(&self, entity_id: Uuid) -> StorageResult<Vec<FailedOperation>>;

    async fn tombstone(&self, entity_id: Uuid) -> StorageResult<Option<Tombstone>>;

    async fn tombstone_by_server_id(&self, server_id: &str) -> StorageResult<Option<Tombstone>>;

    /// Remote change-feed position of the last successful pass
    async fn watermark(&self) -> StorageResult<Option<DateTime<Utc>>>;

    /// Apply `batch` atomically, then notify observers
    async fn commit(&self, batch: WriteBatch) -> StorageResult<()>;

    async fn stats(&self) -> StorageResult<StoreStats>;

    /// Remove acknowledged tombstones deleted before `before`
    async fn purge_tombstones(&self, before: DateTime<Utc>) -> StorageResult<u64>;

    fn events(&self) -> &EventBus;

    fn locks(&self) -> &EntityLocks;

    /// Upsert a single entity
    async fn put(&self, entity: Entity) -> StorageResult<()> {
        self.commit(WriteBatch::new().put_entity(entity)).await
    }

    async fn enqueue(&self, op: SyncOperation) -> StorageResult<()> {
        self.commit(WriteBatch::new().enqueue(op)).await
    }

    async fn dequeue(&self, op_id: Uuid) -> StorageResult<()> {
        self.commit(WriteBatch::new().dequeue(op_id)).await
    }

    /// Serialize writers of one entity
    async fn lock_entity(&self, entity_id: Uuid) -> OwnedMutexGuard<()> {
        self.locks().lock(entity_id).await
    }
}
