//! In-process [`LocalStore`].
//!
//! Keeps everything behind one `tokio::sync::RwLock`. A batch is applied in
//! place while recording the inverse of each write; if any write fails the
//! recorded steps are reverted, which gives the same all-or-nothing behaviour
//! as a SQLite transaction.

use super::{EntityLocks, LocalStore, StoreStats, StoreWrite, WriteBatch};
use crate::offline::queue::{FailedOperation, SyncOperation};
use crate::shared::entity::{Entity, Tombstone};
use crate::shared::error::{StorageError, StorageResult};
use crate::shared::event::EventBus;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use tokio::sync::RwLock;
use uuid::Uuid;

#[derive(Debug, Default)]
struct State {
    entities: HashMap<Uuid, Entity>,
    /// Sorted by `created_at`, insertion order among equals
    queue: Vec<SyncOperation>,
    failed: Vec<FailedOperation>,
    tombstones: HashMap<Uuid, Tombstone>,
    watermark: Option<DateTime<Utc>>,
}

/// Inverse of one applied write
#[derive(Debug)]
enum Undo {
    Entity { id: Uuid, prev: Option<Entity> },
    Tombstone { id: Uuid, prev: Option<Tombstone> },
    QueueInsert(usize),
    QueueReplace(usize, SyncOperation),
    QueueRemove(usize, SyncOperation),
    FailedInsert(usize),
    FailedRemove(usize, FailedOperation),
    Watermark(Option<DateTime<Utc>>),
}

impl State {
    fn apply(&mut self, write: StoreWrite, undo: &mut Vec<Undo>) -> StorageResult<()> {
        match write {
            StoreWrite::PutEntity(entity) => {
                if let Some(prev) = self.entities.get(&entity.id) {
                    Entity::check_identity(prev, &entity)?;
                }
                let id = entity.id;
                let prev = self.entities.insert(id, entity);
                undo.push(Undo::Entity { id, prev });
            }
            StoreWrite::RemoveEntity(id) => {
                if let Some(prev) = self.entities.remove(&id) {
                    undo.push(Undo::Entity { id, prev: Some(prev) });
                }
            }
            StoreWrite::PutTombstone(tombstone) => {
                let id = tombstone.entity_id;
                let prev = self.tombstones.insert(id, tombstone);
                undo.push(Undo::Tombstone { id, prev });
            }
            StoreWrite::Enqueue(op) => {
                if self.queue.iter().any(|queued| queued.id == op.id) {
                    return Err(StorageError::corrupt(
                        "sync_queue",
                        format!("duplicate operation id {}", op.id),
                    ));
                }
                let at = self.queue.partition_point(|queued| queued.created_at <= op.created_at);
                self.queue.insert(at, op);
                undo.push(Undo::QueueInsert(at));
            }
            StoreWrite::UpdateOperation(op) => {
                if let Some(at) = self.queue.iter().position(|queued| queued.id == op.id) {
                    let prev = std::mem::replace(&mut self.queue[at], op);
                    undo.push(Undo::QueueReplace(at, prev));
                }
            }
            StoreWrite::Dequeue(op_id) => self.remove_queued(op_id, undo),
            StoreWrite::Park(failed) => {
                self.remove_queued(failed.operation.id, undo);
                self.remove_failed(failed.operation.id, undo);
                let at = self
                    .failed
                    .partition_point(|parked| parked.operation.created_at <= failed.operation.created_at);
                self.failed.insert(at, failed);
                undo.push(Undo::FailedInsert(at));
            }
            StoreWrite::Unpark(op_id) => self.remove_failed(op_id, undo),
            StoreWrite::SetWatermark(at) => {
                let prev = self.watermark.replace(at);
                undo.push(Undo::Watermark(prev));
            }
        }
        Ok(())
    }

    fn remove_queued(&mut self, op_id: Uuid, undo: &mut Vec<Undo>) {
        if let Some(at) = self.queue.iter().position(|queued| queued.id == op_id) {
            let op = self.queue.remove(at);
            undo.push(Undo::QueueRemove(at, op));
        }
    }

    fn remove_failed(&mut self, op_id: Uuid, undo: &mut Vec<Undo>) {
        if let Some(at) = self.failed.iter().position(|parked| parked.operation.id == op_id) {
            let failed = self.failed.remove(at);
            undo.push(Undo::FailedRemove(at, failed));
        }
    }

    /// Undo steps must be reverted newest first
    fn revert(&mut self, step: Undo) {
        match step {
            Undo::Entity { id, prev: Some(entity) } => {
                self.entities.insert(id, entity);
            }
            Undo::Entity { id, prev: None } => {
                self.entities.remove(&id);
            }
            Undo::Tombstone { id, prev: Some(tombstone) } => {
                self.tombstones.insert(id, tombstone);
            }
            Undo::Tombstone { id, prev: None } => {
                self.tombstones.remove(&id);
            }
            Undo::QueueInsert(at) => {
                self.queue.remove(at);
            }
            Undo::QueueReplace(at, op) => self.queue[at] = op,
            Undo::QueueRemove(at, op) => self.queue.insert(at, op),
            Undo::FailedInsert(at) => {
                self.failed.remove(at);
            }
            Undo::FailedRemove(at, failed) => self.failed.insert(at, failed),
            Undo::Watermark(prev) => self.watermark = prev,
        }
    }
}

/// Volatile local store
#[derive(Debug, Default)]
pub struct MemoryStore {
    state: RwLock<State>,
    events: EventBus,
    locks: EntityLocks,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_events(events: EventBus) -> Self {
        Self {
            events,
            ..Self::default()
        }
    }
}

#[async_trait]
impl LocalStore for MemoryStore {
    async fn get(&self, id: Uuid) -> StorageResult<Option<Entity>> {
        Ok(self.state.read().await.entities.get(&id).cloned())
    }

    async fn get_by_server_id(&self, server_id: &str) -> StorageResult<Option<Entity>> {
        let state = self.state.read().await;
        Ok(state
            .entities
            .values()
            .find(|e| e.server_id.as_deref() == Some(server_id))
            .cloned())
    }

    async fn list_entities(&self, collection: Option<&str>) -> StorageResult<Vec<Entity>> {
        let state = self.state.read().await;
        let mut entities: Vec<Entity> = state
            .entities
            .values()
            .filter(|e| collection.map_or(true, |c| e.collection == c))
            .cloned()
            .collect();
        entities.sort_by(|a, b| a.updated_at.cmp(&b.updated_at).then(a.id.cmp(&b.id)));
        Ok(entities)
    }

    async fn list_pending(&self) -> StorageResult<Vec<SyncOperation>> {
        Ok(self.state.read().await.queue.clone())
    }

    async fn list_pending_for(&self, entity_id: Uuid) -> StorageResult<Vec<SyncOperation>> {
        let state = self.state.read().await;
        Ok(state
            .queue
            .iter()
            .filter(|op| op.entity_id == entity_id)
            .cloned()
            .collect())
    }

    async fn list_failed(&self) -> StorageResult<Vec<FailedOperation>> {
        Ok(self.state.read().await.failed.clone())
    }

    async fn list_failed_for(&self, entity_id: Uuid) -> StorageResult<Vec<FailedOperation>> {
        let state = self.state.read().await;
        Ok(state
            .failed
            .iter()
            .filter(|f| f.operation.entity_id == entity_id)
            .cloned()
            .collect())
    }

    async fn tombstone(&self, entity_id: Uuid) -> StorageResult<Option<Tombstone>> {
        Ok(self.state.read().await.tombstones.get(&entity_id).cloned())
    }

    async fn tombstone_by_server_id(&self, server_id: &str) -> StorageResult<Option<Tombstone>> {
        let state = self.state.read().await;
        Ok(state
            .tombstones
            .values()
            .find(|t| t.server_id.as_deref() == Some(server_id))
            .cloned())
    }

    async fn watermark(&self) -> StorageResult<Option<DateTime<Utc>>> {
        Ok(self.state.read().await.watermark)
    }

    async fn commit(&self, batch: WriteBatch) -> StorageResult<()> {
        if batch.is_empty() {
            return Ok(());
        }
        {
            let mut state = self.state.write().await;
            let mut undo = Vec::with_capacity(batch.len());
            for write in batch.writes().iter().cloned() {
                if let Err(e) = state.apply(write, &mut undo) {
                    while let Some(step) = undo.pop() {
                        state.revert(step);
                    }
                    return Err(e);
                }
            }
        }
        batch.publish_to(&self.events);
        Ok(())
    }

    async fn stats(&self) -> StorageResult<StoreStats> {
        let state = self.state.read().await;
        Ok(StoreStats {
            entities: state.entities.len() as u64,
            pending_operations: state.queue.len() as u64,
            failed_operations: state.failed.len() as u64,
            tombstones: state.tombstones.len() as u64,
            unacknowledged_tombstones: state.tombstones.values().filter(|t| !t.acknowledged).count() as u64,
            watermark: state.watermark,
        })
    }

    async fn purge_tombstones(&self, before: DateTime<Utc>) -> StorageResult<u64> {
        let mut state = self.state.write().await;
        let count = state.tombstones.len();
        state
            .tombstones
            .retain(|_, t| !(t.acknowledged && t.deleted_at < before));
        Ok((count - state.tombstones.len()) as u64)
    }

    fn events(&self) -> &EventBus {
        &self.events
    }

    fn locks(&self) -> &EntityLocks {
        &self.locks
    }
}
