//! Restart behaviour of the on-disk store
//!
//! Each test closes the database mid-flight and reopens the same file, the
//! way a process killed between passes would find it.

use crate::common::*;
use chrono::Duration;
use pretty_assertions::assert_eq;
use std::path::Path;
use std::sync::Arc;
use tempfile::TempDir;
use uuid::Uuid;
use xfsync::local_db::LocalDatabase;
use xfsync::offline::SyncOperation;
use xfsync::shared::{ManualClock, SyncStatus};
use xfsync::sync::{Fault, MemoryGateway};

async fn open_device(
    path: &Path,
    gateway: &Arc<MemoryGateway>,
    clock: &Arc<ManualClock>,
) -> (Arc<LocalDatabase>, Device) {
    let db = Arc::new(assert_ok!(LocalDatabase::open(path).await, "Failed to open database"));
    let device = Device::with_store(db.clone(), gateway, clock, 5);
    (db, device)
}

fn pending_ids(ops: &[SyncOperation]) -> Vec<Uuid> {
    ops.iter().map(|op| op.id).collect()
}

#[tokio::test]
async fn test_queue_survives_restart_in_order() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("local.db");
    let (gateway, clock) = shared_remote();

    let (db, device) = open_device(&path, &gateway, &clock).await;
    device.go_offline();
    let first = device.manager.create("todos", &payload("first")).await.unwrap();
    device.manager.update(first.id, &payload("first, edited")).await.unwrap();
    let second = device.manager.create("todos", &payload("second")).await.unwrap();
    let before = pending_ids(&device.store.list_pending().await.unwrap());
    assert_eq!(before.len(), 3);
    db.close().await;
    drop(device);

    let (_db, device) = open_device(&path, &gateway, &clock).await;
    let after = pending_ids(&device.store.list_pending().await.unwrap());
    assert_eq!(before, after);

    let restored = device.manager.get(first.id).await.unwrap().unwrap();
    assert_eq!(restored.data, payload("first, edited"));
    assert_eq!(restored.sync_status, SyncStatus::Pending);

    let report = device.sync().await;
    assert_eq!(report.pushed, 3);
    assert_eq!(gateway.entities().await.len(), 2);
    assert_eq!(
        gateway.remote_by_client(first.id).await.unwrap().data,
        payload("first, edited")
    );
    assert!(gateway.remote_by_client(second.id).await.is_some());
}

#[tokio::test]
async fn test_restart_after_lost_response_does_not_duplicate() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("local.db");
    let (gateway, clock) = shared_remote();

    let (db, device) = open_device(&path, &gateway, &clock).await;
    let todo = device.manager.create("todos", &payload("Buy milk")).await.unwrap();
    gateway.inject(Fault::DropResponse).await;

    // The remote applied the create but the acknowledgement never arrived
    assert_eq!(device.sync().await.retried, 1);
    assert_eq!(gateway.applied_writes().await, 1);
    db.close().await;
    drop(device);

    let (_db, device) = open_device(&path, &gateway, &clock).await;
    let queued = device.store.list_pending().await.unwrap();
    assert_eq!(queued.len(), 1);
    assert_eq!(queued[0].retry_count, 1);
    assert!(queued[0].next_attempt_at.is_some());

    clock.advance(Duration::seconds(1));
    let report = device.sync().await;
    assert_eq!(report.pushed, 1);

    assert_eq!(gateway.entities().await.len(), 1);
    assert_eq!(gateway.applied_writes().await, 1);
    let synced = device.manager.get(todo.id).await.unwrap().unwrap();
    assert_eq!(synced.server_id.as_deref(), Some("T1"));
    assert_eq!(synced.sync_status, SyncStatus::Synced);
}

#[tokio::test]
async fn test_watermark_and_tombstones_survive_restart() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("local.db");
    let (gateway, clock) = shared_remote();

    let (db, device) = open_device(&path, &gateway, &clock).await;
    let todo = device.manager.create("todos", &payload("Buy milk")).await.unwrap();
    device.sync().await;
    let watermark = device.store.watermark().await.unwrap();
    assert!(watermark.is_some());

    device.go_offline();
    device.manager.delete(todo.id).await.unwrap();
    db.close().await;
    drop(device);

    let (_db, device) = open_device(&path, &gateway, &clock).await;
    assert_eq!(device.store.watermark().await.unwrap(), watermark);
    let tombstone = device.store.tombstone(todo.id).await.unwrap().unwrap();
    assert!(!tombstone.acknowledged);

    let report = device.sync().await;
    assert_eq!(report.pushed, 1);
    assert!(gateway.remote("T1").await.is_none());
    assert!(device.manager.get(todo.id).await.unwrap().is_none());
}
