//! In-memory remote service.
//!
//! Implements [`NetworkGateway`] against a process-local record set with the
//! semantics the engine expects from a real backend: server-assigned ids,
//! revision checks on update, idempotent replays keyed by operation id and a
//! change feed ordered by a strictly increasing remote clock. Faults can be
//! scripted per call, which is how the integration tests simulate outages and
//! lost responses.

use crate::shared::clock::from_millis;
use crate::shared::entity::{Entity, RemoteEntity, RemoteTombstone};
use crate::shared::error::GatewayError;
use crate::sync::gateway::{ChangeSet, NetworkGateway};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::time::Duration;
use tokio::sync::Mutex;
use uuid::Uuid;

/// Remote clock origin; change times are `origin + tick` milliseconds
const CHANGE_EPOCH_MS: i64 = 1_700_000_000_000;

/// Scripted failure for the next write call
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Fault {
    /// Fail before reaching the remote
    Transient(String),
    /// Apply the write, then lose the response
    DropResponse,
    /// Reject without applying
    Permanent(String),
}

#[derive(Debug, Clone)]
enum Applied {
    Written(RemoteEntity),
    Deleted,
}

#[derive(Debug, Clone)]
struct Record {
    entity: RemoteEntity,
    changed_at: i64,
}

#[derive(Debug, Default)]
struct Inner {
    records: BTreeMap<String, Record>,
    deleted: BTreeMap<String, (RemoteTombstone, i64)>,
    applied: HashMap<Uuid, Applied>,
    write_faults: VecDeque<Fault>,
    pull_faults: VecDeque<GatewayError>,
    tick: i64,
    next_id: u64,
    calls: u64,
    applied_writes: u64,
}

impl Inner {
    fn advance(&mut self) -> i64 {
        self.tick += 1;
        self.tick
    }

    fn time_of(tick: i64) -> DateTime<Utc> {
        from_millis(CHANGE_EPOCH_MS + tick)
    }

    fn find_by_client(&self, client_id: Uuid) -> Option<&Record> {
        self.records
            .values()
            .find(|record| record.entity.client_id == Some(client_id))
    }

    /// Ok(true) means the response of this call gets dropped
    fn take_write_fault(&mut self) -> Result<bool, GatewayError> {
        match self.write_faults.pop_front() {
            None => Ok(false),
            Some(Fault::DropResponse) => Ok(true),
            Some(Fault::Transient(message)) => Err(GatewayError::transient(message)),
            Some(Fault::Permanent(message)) => Err(GatewayError::permanent(message)),
        }
    }

    fn insert(&mut self, client_id: Option<Uuid>, entity: &Entity) -> RemoteEntity {
        self.next_id += 1;
        let remote = RemoteEntity {
            server_id: format!("T{}", self.next_id),
            client_id,
            collection: entity.collection.clone(),
            data: entity.data.clone(),
            updated_at: entity.updated_at,
            revision: 1,
        };
        let changed_at = self.advance();
        self.records.insert(
            remote.server_id.clone(),
            Record {
                entity: remote.clone(),
                changed_at,
            },
        );
        self.applied_writes += 1;
        remote
    }

    fn replace(&mut self, current: RemoteEntity, entity: &Entity) -> RemoteEntity {
        let updated = RemoteEntity {
            collection: entity.collection.clone(),
            data: entity.data.clone(),
            updated_at: entity.updated_at,
            revision: current.revision + 1,
            ..current
        };
        let changed_at = self.advance();
        self.records.insert(
            updated.server_id.clone(),
            Record {
                entity: updated.clone(),
                changed_at,
            },
        );
        self.applied_writes += 1;
        updated
    }

    fn remove(&mut self, server_id: &str) {
        if let Some(record) = self.records.remove(server_id) {
            let changed_at = self.advance();
            let tombstone = RemoteTombstone {
                server_id: server_id.to_string(),
                client_id: record.entity.client_id,
                deleted_at: Self::time_of(changed_at),
            };
            self.deleted.insert(server_id.to_string(), (tombstone, changed_at));
            self.applied_writes += 1;
        }
    }

    fn apply_create(&mut self, entity: &Entity, key: Uuid) -> Result<RemoteEntity, GatewayError> {
        if let Some(Applied::Written(result)) = self.applied.get(&key) {
            return Ok(result.clone());
        }
        if let Some(existing) = self.find_by_client(entity.id) {
            return Err(GatewayError::conflict(Some(existing.entity.clone())));
        }
        if self
            .deleted
            .values()
            .any(|(tombstone, _)| tombstone.client_id == Some(entity.id))
        {
            return Err(GatewayError::conflict(None));
        }

        let remote = self.insert(Some(entity.id), entity);
        self.applied.insert(key, Applied::Written(remote.clone()));
        Ok(remote)
    }

    fn apply_update(&mut self, entity: &Entity, key: Uuid) -> Result<RemoteEntity, GatewayError> {
        if let Some(Applied::Written(result)) = self.applied.get(&key) {
            return Ok(result.clone());
        }
        let Some(server_id) = entity.server_id.as_deref() else {
            return Err(GatewayError::permanent("update requires a server id"));
        };
        let current = match self.records.get(server_id) {
            Some(record) => record.entity.clone(),
            None if self.deleted.contains_key(server_id) => return Err(GatewayError::conflict(None)),
            None => {
                return Err(GatewayError::permanent(format!(
                    "unknown server id '{}'",
                    server_id
                )))
            }
        };
        if entity.base_revision != Some(current.revision) {
            return Err(GatewayError::conflict(Some(current)));
        }

        let updated = self.replace(current, entity);
        self.applied.insert(key, Applied::Written(updated.clone()));
        Ok(updated)
    }

    fn apply_delete(&mut self, server_id: &str, key: Uuid) {
        if matches!(self.applied.get(&key), Some(Applied::Deleted)) {
            return;
        }
        self.remove(server_id);
        self.applied.insert(key, Applied::Deleted);
    }
}

/// Process-local [`NetworkGateway`]
#[derive(Debug, Default)]
pub struct MemoryGateway {
    inner: Mutex<Inner>,
    latency: Option<Duration>,
}

impl MemoryGateway {
    pub fn new() -> Self {
        Self::default()
    }

    /// Delay every call by `latency`
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    /// Queue a fault for the next write call (create, update or delete)
    pub async fn inject(&self, fault: Fault) {
        self.inner.lock().await.write_faults.push_back(fault);
    }

    /// Fail the next change listing with `error`
    pub async fn inject_pull_failure(&self, error: GatewayError) {
        self.inner.lock().await.pull_faults.push_back(error);
    }

    /// Write as another client would, bypassing revision checks.
    ///
    /// Updates the record created under `client_id` when there is one,
    /// otherwise creates a new record.
    pub async fn write_remote(
        &self,
        client_id: Option<Uuid>,
        collection: &str,
        data: serde_json::Value,
        updated_at: DateTime<Utc>,
    ) -> RemoteEntity {
        let mut inner = self.inner.lock().await;
        let mut entity = Entity::new(collection, data, updated_at);
        if let Some(id) = client_id {
            entity.id = id;
        }
        let existing = client_id
            .and_then(|id| inner.find_by_client(id))
            .map(|record| record.entity.clone());
        match existing {
            Some(current) => inner.replace(current, &entity),
            None => inner.insert(client_id, &entity),
        }
    }

    /// Delete as another client would
    pub async fn delete_remote(&self, server_id: &str) {
        self.inner.lock().await.remove(server_id);
    }

    pub async fn remote(&self, server_id: &str) -> Option<RemoteEntity> {
        let inner = self.inner.lock().await;
        inner.records.get(server_id).map(|record| record.entity.clone())
    }

    pub async fn remote_by_client(&self, client_id: Uuid) -> Option<RemoteEntity> {
        let inner = self.inner.lock().await;
        inner.find_by_client(client_id).map(|record| record.entity.clone())
    }

    /// Live remote records ordered by server id
    pub async fn entities(&self) -> Vec<RemoteEntity> {
        let inner = self.inner.lock().await;
        inner.records.values().map(|record| record.entity.clone()).collect()
    }

    /// Number of gateway calls received, faulted ones included
    pub async fn calls(&self) -> u64 {
        self.inner.lock().await.calls
    }

    /// Number of writes that changed remote state
    pub async fn applied_writes(&self) -> u64 {
        self.inner.lock().await.applied_writes
    }

    async fn simulate_latency(&self) {
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }
    }
}

fn deliver<T>(result: Result<T, GatewayError>, drop_response: bool) -> Result<T, GatewayError> {
    match result {
        Ok(_) if drop_response => Err(GatewayError::transient("response lost")),
        other => other,
    }
}

#[async_trait]
impl NetworkGateway for MemoryGateway {
    async fn create(&self, entity: &Entity, idempotency_key: Uuid) -> Result<RemoteEntity, GatewayError> {
        self.simulate_latency().await;
        let mut inner = self.inner.lock().await;
        inner.calls += 1;
        let drop_response = inner.take_write_fault()?;
        deliver(inner.apply_create(entity, idempotency_key), drop_response)
    }

    async fn update(&self, entity: &Entity, idempotency_key: Uuid) -> Result<RemoteEntity, GatewayError> {
        self.simulate_latency().await;
        let mut inner = self.inner.lock().await;
        inner.calls += 1;
        let drop_response = inner.take_write_fault()?;
        deliver(inner.apply_update(entity, idempotency_key), drop_response)
    }

    async fn delete(&self, server_id: &str, idempotency_key: Uuid) -> Result<(), GatewayError> {
        self.simulate_latency().await;
        let mut inner = self.inner.lock().await;
        inner.calls += 1;
        let drop_response = inner.take_write_fault()?;
        inner.apply_delete(server_id, idempotency_key);
        deliver(Ok(()), drop_response)
    }

    async fn fetch(&self, entity: &Entity) -> Result<Option<RemoteEntity>, GatewayError> {
        self.simulate_latency().await;
        let mut inner = self.inner.lock().await;
        inner.calls += 1;
        let found = match entity.server_id.as_deref() {
            Some(server_id) => inner.records.get(server_id),
            None => inner.find_by_client(entity.id),
        };
        Ok(found.map(|record| record.entity.clone()))
    }

    async fn list_changed_since(&self, since: Option<DateTime<Utc>>) -> Result<ChangeSet, GatewayError> {
        self.simulate_latency().await;
        let mut inner = self.inner.lock().await;
        inner.calls += 1;
        if let Some(error) = inner.pull_faults.pop_front() {
            return Err(error);
        }

        let since_tick = since.map(|at| at.timestamp_millis() - CHANGE_EPOCH_MS);
        let is_new = |tick: i64| since_tick.map_or(true, |since| tick > since);

        let mut changed: Vec<&Record> = inner
            .records
            .values()
            .filter(|record| is_new(record.changed_at))
            .collect();
        changed.sort_by_key(|record| record.changed_at);

        let mut deleted: Vec<&(RemoteTombstone, i64)> = inner
            .deleted
            .values()
            .filter(|(_, tick)| is_new(*tick))
            .collect();
        deleted.sort_by_key(|(_, tick)| *tick);

        Ok(ChangeSet {
            entities: changed.into_iter().map(|record| record.entity.clone()).collect(),
            deleted: deleted.into_iter().map(|(tombstone, _)| tombstone.clone()).collect(),
            server_time: Inner::time_of(inner.tick),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use serde_json::json;

    fn todo(title: &str) -> Entity {
        Entity::new("todos", json!({ "title": title }), from_millis(1_000))
    }

    #[tokio::test]
    async fn test_create_assigns_server_ids_in_order() {
        let gateway = MemoryGateway::new();
        let first = gateway.create(&todo("a"), Uuid::new_v4()).await.unwrap();
        let second = gateway.create(&todo("b"), Uuid::new_v4()).await.unwrap();

        assert_eq!(first.server_id, "T1");
        assert_eq!(second.server_id, "T2");
        assert_eq!(first.revision, 1);
    }

    #[tokio::test]
    async fn test_replayed_create_returns_original_result() {
        let gateway = MemoryGateway::new();
        let entity = todo("a");
        let key = Uuid::new_v4();

        let first = gateway.create(&entity, key).await.unwrap();
        let replay = gateway.create(&entity, key).await.unwrap();

        assert_eq!(first, replay);
        assert_eq!(gateway.applied_writes().await, 1);
        assert_eq!(gateway.entities().await.len(), 1);
    }

    #[tokio::test]
    async fn test_dropped_response_still_applies() {
        let gateway = MemoryGateway::new();
        gateway.inject(Fault::DropResponse).await;
        let entity = todo("a");
        let key = Uuid::new_v4();

        let err = gateway.create(&entity, key).await.unwrap_err();
        assert!(err.is_retryable());
        assert!(gateway.remote_by_client(entity.id).await.is_some());

        let replay = gateway.create(&entity, key).await.unwrap();
        assert_eq!(replay.server_id, "T1");
        assert_eq!(gateway.applied_writes().await, 1);
    }

    #[tokio::test]
    async fn test_update_with_stale_revision_conflicts() {
        let gateway = MemoryGateway::new();
        let mut entity = todo("a");
        let created = gateway.create(&entity, Uuid::new_v4()).await.unwrap();
        entity.server_id = Some(created.server_id.clone());
        entity.base_revision = Some(created.revision);

        let updated = gateway.update(&entity, Uuid::new_v4()).await.unwrap();
        assert_eq!(updated.revision, 2);

        let err = gateway.update(&entity, Uuid::new_v4()).await.unwrap_err();
        assert_matches!(err, GatewayError::Conflict { current: Some(current) } if current.revision == 2);
    }

    #[tokio::test]
    async fn test_delete_is_idempotent() {
        let gateway = MemoryGateway::new();
        let created = gateway.create(&todo("a"), Uuid::new_v4()).await.unwrap();

        gateway.delete(&created.server_id, Uuid::new_v4()).await.unwrap();
        gateway.delete(&created.server_id, Uuid::new_v4()).await.unwrap();
        assert!(gateway.remote(&created.server_id).await.is_none());
    }

    #[tokio::test]
    async fn test_change_feed_respects_watermark() {
        let gateway = MemoryGateway::new();
        let first = gateway.create(&todo("a"), Uuid::new_v4()).await.unwrap();
        let watermark = gateway.list_changed_since(None).await.unwrap().server_time;

        gateway.create(&todo("b"), Uuid::new_v4()).await.unwrap();
        gateway.delete_remote(&first.server_id).await;

        let changes = gateway.list_changed_since(Some(watermark)).await.unwrap();
        assert_eq!(changes.entities.len(), 1);
        assert_eq!(changes.entities[0].server_id, "T2");
        assert_eq!(changes.deleted.len(), 1);
        assert_eq!(changes.deleted[0].server_id, first.server_id);
        assert!(changes.server_time > watermark);
    }

    #[tokio::test]
    async fn test_injected_faults_are_consumed_in_order() {
        let gateway = MemoryGateway::new();
        gateway.inject(Fault::Transient("timeout".into())).await;
        gateway.inject(Fault::Permanent("bad request".into())).await;

        assert_matches!(gateway.create(&todo("a"), Uuid::new_v4()).await, Err(GatewayError::Transient(_)));
        assert_matches!(gateway.create(&todo("a"), Uuid::new_v4()).await, Err(GatewayError::Permanent(_)));
        assert!(gateway.create(&todo("a"), Uuid::new_v4()).await.is_ok());
        assert_eq!(gateway.calls().await, 3);
    }
}
