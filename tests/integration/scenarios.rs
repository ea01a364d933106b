//! Offline editing scenarios against the SQLite store

use crate::common::*;
use chrono::Duration;
use pretty_assertions::assert_eq;
use xfsync::shared::{Clock, OperationOutcome, SyncStatus};
use xfsync::shared::clock::from_millis;
use xfsync::sync::{Fault, SyncOutcome};

#[tokio::test]
async fn test_offline_create_syncs_on_reconnect() {
    let (gateway, clock) = shared_remote();
    let device = Device::sqlite(&gateway, &clock, 3).await;
    device.go_offline();

    let todo = assert_ok!(device.manager.create("todos", &payload("Buy milk")).await);
    assert_eq!(todo.sync_status, SyncStatus::Pending);
    let queued = device.store.list_pending().await.unwrap();
    assert_eq!(queued.len(), 1);
    assert_eq!(queued[0].kind().as_str(), "create");

    assert_eq!(device.engine.sync_now().await.unwrap(), SyncOutcome::Offline);
    assert_eq!(gateway.calls().await, 0);

    device.go_online();
    let report = device.sync().await;
    assert_eq!(report.pushed, 1);

    let synced = device.manager.get(todo.id).await.unwrap().unwrap();
    assert_eq!(synced.server_id.as_deref(), Some("T1"));
    assert_eq!(synced.sync_status, SyncStatus::Synced);
    assert!(device.store.list_pending().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_concurrent_offline_edits_resolve_to_later_write() {
    let (gateway, clock) = shared_remote();
    let device_a = Device::sqlite(&gateway, &clock, 3).await;
    let device_b = Device::sqlite(&gateway, &clock, 3).await;

    let todo = device_a.manager.create("todos", &payload("Buy milk")).await.unwrap();
    device_a.sync().await;
    device_b.sync().await;
    assert!(device_b.manager.get(todo.id).await.unwrap().is_some());

    device_a.go_offline();
    device_b.go_offline();

    clock.set(from_millis(100_000));
    device_a.manager.update(todo.id, &payload("Buy oat milk")).await.unwrap();
    let a_op = device_a.store.list_pending().await.unwrap()[0].id;

    clock.set(from_millis(200_000));
    device_b.manager.update(todo.id, &payload("Buy almond milk")).await.unwrap();

    let mut a_events = device_a.manager.subscribe();
    device_b.go_online();
    device_a.go_online();

    let b_report = device_b.sync().await;
    assert_eq!(b_report.pushed, 1);

    let a_report = device_a.sync().await;
    assert_eq!(a_report.remote_wins, 1);
    assert_eq!(a_report.discarded, 1);
    assert_eq!(a_report.pushed, 0);

    let a_entity = device_a.manager.get(todo.id).await.unwrap().unwrap();
    let b_entity = device_b.manager.get(todo.id).await.unwrap().unwrap();
    assert_eq!(a_entity.data, payload("Buy almond milk"));
    assert_eq!(a_entity.data, b_entity.data);
    assert_eq!(a_entity.sync_status, SyncStatus::Synced);
    assert!(device_a.store.list_pending().await.unwrap().is_empty());

    let events = drain_events(&mut a_events);
    assert_eq!(outcomes_for(&events, a_op), vec![OperationOutcome::Discarded]);
}

#[tokio::test]
async fn test_update_fails_after_exhausting_retries() {
    let (gateway, clock) = shared_remote();
    let device = Device::sqlite(&gateway, &clock, 3).await;

    let todo = device.manager.create("todos", &payload("Buy milk")).await.unwrap();
    device.sync().await;

    device.manager.update(todo.id, &payload("Buy oat milk")).await.unwrap();
    let op_id = device.store.list_pending().await.unwrap()[0].id;
    for _ in 0..3 {
        gateway.inject(Fault::Transient("timeout".into())).await;
    }
    let mut events = device.manager.subscribe();

    let first = device.sync().await;
    assert_eq!(first.retried, 1);
    let queued = device.store.list_pending().await.unwrap();
    assert_eq!(queued[0].retry_count, 1);
    assert_eq!(
        queued[0].next_attempt_at,
        Some(clock.now() + Duration::seconds(1))
    );

    // Still inside the backoff window
    let early = device.sync().await;
    assert_eq!(early.deferred, 1);
    assert_eq!(early.retried, 0);

    clock.advance(Duration::seconds(1));
    assert_eq!(device.sync().await.retried, 1);

    clock.advance(Duration::seconds(2));
    let last = device.sync().await;
    assert_eq!(last.failed, 1);
    assert_eq!(last.errors.len(), 1);
    assert_eq!(last.errors[0].operation_id, op_id);

    let failed_entity = device.manager.get(todo.id).await.unwrap().unwrap();
    assert_eq!(failed_entity.sync_status, SyncStatus::Failed);
    assert!(failed_entity.last_error.unwrap().contains("timeout"));
    assert!(device.store.list_pending().await.unwrap().is_empty());

    let parked = device.manager.failed_operations().await.unwrap();
    assert_eq!(parked.len(), 1);
    assert_eq!(parked[0].operation.id, op_id);
    assert_eq!(parked[0].operation.retry_count, 3);

    let events = drain_events(&mut events);
    let outcomes = outcomes_for(&events, op_id);
    assert_eq!(outcomes.len(), 1);
    assert!(matches!(&outcomes[0], OperationOutcome::Failed { error } if error.contains("timeout")));

    // A manual retry puts it back and it goes through
    assert_eq!(device.manager.retry_failed(todo.id).await.unwrap(), 1);
    assert_eq!(device.sync().await.pushed, 1);
    let remote = gateway.remote("T1").await.unwrap();
    assert_eq!(remote.data, payload("Buy oat milk"));
}

#[tokio::test]
async fn test_offline_delete_survives_stale_pull() {
    let (gateway, clock) = shared_remote();
    let device_a = Device::sqlite(&gateway, &clock, 3).await;
    let device_b = Device::sqlite(&gateway, &clock, 3).await;

    let todo = device_a.manager.create("todos", &payload("Buy milk")).await.unwrap();
    device_a.sync().await;
    device_b.sync().await;

    device_a.go_offline();
    device_a.manager.delete(todo.id).await.unwrap();
    let tombstone = device_a.store.tombstone(todo.id).await.unwrap().unwrap();
    assert!(!tombstone.acknowledged);
    assert_eq!(tombstone.server_id.as_deref(), Some("T1"));

    // Another device touches the entity, so the next pull still carries it
    clock.advance(Duration::seconds(5));
    device_b.manager.update(todo.id, &payload("Buy oat milk")).await.unwrap();
    device_b.sync().await;

    device_a.go_online();
    let report = device_a.sync().await;
    assert_eq!(report.skipped_tombstoned, 1);
    assert_eq!(report.pushed, 1);

    assert!(device_a.manager.get(todo.id).await.unwrap().is_none());
    assert!(device_a.store.tombstone(todo.id).await.unwrap().unwrap().acknowledged);
    assert!(gateway.remote("T1").await.is_none());

    let b_report = device_b.sync().await;
    assert_eq!(b_report.remote_deletions, 1);
    assert!(device_b.manager.get(todo.id).await.unwrap().is_none());
}

#[tokio::test]
async fn test_dropped_responses_create_exactly_once() {
    let (gateway, clock) = shared_remote();
    let device = Device::sqlite(&gateway, &clock, 5).await;

    let todo = device.manager.create("todos", &payload("Buy milk")).await.unwrap();
    let op_id = device.store.list_pending().await.unwrap()[0].id;
    gateway.inject(Fault::DropResponse).await;
    gateway.inject(Fault::DropResponse).await;

    assert_eq!(device.sync().await.retried, 1);
    clock.advance(Duration::seconds(1));
    assert_eq!(device.sync().await.retried, 1);
    clock.advance(Duration::seconds(2));
    let report = device.sync().await;
    assert_eq!(report.pushed, 1);

    assert_eq!(gateway.entities().await.len(), 1);
    assert_eq!(gateway.applied_writes().await, 1);

    let synced = device.manager.get(todo.id).await.unwrap().unwrap();
    assert_eq!(synced.server_id.as_deref(), Some("T1"));
    assert_eq!(synced.sync_status, SyncStatus::Synced);
    assert!(device.store.list_pending().await.unwrap().is_empty());
    assert!(device.manager.failed_operations().await.unwrap().is_empty());
    assert!(device.store.list_pending_for(todo.id).await.unwrap().iter().all(|op| op.id != op_id));
}

#[tokio::test]
async fn test_operations_for_one_entity_push_in_order() {
    let (gateway, clock) = shared_remote();
    let device = Device::sqlite(&gateway, &clock, 3).await;
    device.go_offline();

    let todo = device.manager.create("todos", &payload("v1")).await.unwrap();
    device.manager.update(todo.id, &payload("v2")).await.unwrap();
    device.manager.update(todo.id, &payload("v3")).await.unwrap();

    device.go_online();
    let report = device.sync().await;
    assert_eq!(report.pushed, 3);

    let remote = gateway.remote("T1").await.unwrap();
    assert_eq!(remote.data, payload("v3"));
    assert_eq!(remote.revision, 3);

    let local = device.manager.get(todo.id).await.unwrap().unwrap();
    assert_eq!(local.base_revision, Some(3));
    assert_eq!(local.sync_status, SyncStatus::Synced);
}

#[tokio::test]
async fn test_never_synced_delete_sends_nothing() {
    let (gateway, clock) = shared_remote();
    let device = Device::sqlite(&gateway, &clock, 3).await;
    let mut events = device.manager.subscribe();

    let todo = device.manager.create("todos", &payload("scratch")).await.unwrap();
    let create_id = device.store.list_pending().await.unwrap()[0].id;
    device.manager.delete(todo.id).await.unwrap();

    assert!(device.store.list_pending().await.unwrap().is_empty());
    device.sync().await;
    assert!(gateway.entities().await.is_empty());
    assert_eq!(gateway.applied_writes().await, 0);

    let events = drain_events(&mut events);
    assert_eq!(outcomes_for(&events, create_id), vec![OperationOutcome::Discarded]);
}

#[tokio::test]
async fn test_permanent_rejection_parks_later_operations() {
    let (gateway, clock) = shared_remote();
    let device = Device::sqlite(&gateway, &clock, 3).await;
    let todo = device.manager.create("todos", &payload("rejected")).await.unwrap();
    let other = device.manager.create("todos", &payload("unaffected")).await.unwrap();
    device.manager.update(todo.id, &payload("rejected again")).await.unwrap();

    // The first create in the queue is rejected
    gateway.inject(Fault::Permanent("payload rejected".into())).await;
    let report = device.sync().await;

    assert_eq!(report.failed, 2);
    assert_eq!(
        device.manager.get(todo.id).await.unwrap().unwrap().sync_status,
        SyncStatus::Failed
    );
    assert_eq!(device.manager.failed_operations().await.unwrap().len(), 2);
    assert_eq!(
        device.manager.get(other.id).await.unwrap().unwrap().sync_status,
        SyncStatus::Synced
    );

    // Editing a failed entity re-queues its parked operations ahead of the edit
    device.manager.update(todo.id, &payload("fixed")).await.unwrap();
    assert_eq!(device.store.list_pending().await.unwrap().len(), 3);
    assert!(device.manager.failed_operations().await.unwrap().is_empty());
    assert_eq!(device.sync().await.pushed, 3);
    assert_eq!(
        gateway.remote_by_client(todo.id).await.unwrap().data,
        payload("fixed")
    );
}
