//! Device fixtures
//!
//! A `Device` is one client of the shared remote: its own local store, mutation
//! API and sync engine, driven by a clock the test controls.

use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use xfsync::local_db::LocalDatabase;
use xfsync::offline::{BackoffStrategy, OfflineManager, RetryPolicy};
use xfsync::shared::{ManualClock, SyncEvent};
use xfsync::store::{LocalStore, MemoryStore};
use xfsync::sync::{MemoryGateway, NetworkMonitor, SyncEngine, SyncOutcome, SyncReport};

/// Clock origin for every test
pub const START_MS: i64 = 1_000;

/// Exponential backoff starting at one second
pub fn retry_policy(max_attempts: u32) -> RetryPolicy {
    RetryPolicy::new(
        BackoffStrategy::Exponential {
            base: Duration::from_secs(1),
            max: Duration::from_secs(60),
        },
        max_attempts,
    )
}

pub fn payload(title: &str) -> serde_json::Value {
    json!({ "title": title, "done": false })
}

pub struct Device {
    pub store: Arc<dyn LocalStore>,
    pub manager: OfflineManager,
    pub engine: Arc<SyncEngine>,
    pub monitor: Arc<NetworkMonitor>,
}

impl Device {
    pub fn with_store(
        store: Arc<dyn LocalStore>,
        gateway: &Arc<MemoryGateway>,
        clock: &Arc<ManualClock>,
        max_attempts: u32,
    ) -> Self {
        let monitor = Arc::new(NetworkMonitor::new(true));
        let engine = SyncEngine::new(
            store.clone(),
            gateway.clone(),
            monitor.clone(),
            clock.clone(),
            retry_policy(max_attempts),
        );
        Self {
            manager: OfflineManager::new(store.clone(), clock.clone()),
            store,
            engine: Arc::new(engine),
            monitor,
        }
    }

    /// Device backed by an in-memory SQLite database
    pub async fn sqlite(gateway: &Arc<MemoryGateway>, clock: &Arc<ManualClock>, max_attempts: u32) -> Self {
        let db = LocalDatabase::in_memory()
            .await
            .expect("Failed to create in-memory database");
        Self::with_store(Arc::new(db), gateway, clock, max_attempts)
    }

    /// Device backed by the in-memory store
    pub fn memory(gateway: &Arc<MemoryGateway>, clock: &Arc<ManualClock>, max_attempts: u32) -> Self {
        Self::with_store(Arc::new(MemoryStore::new()), gateway, clock, max_attempts)
    }

    /// Run a pass and return its report
    pub async fn sync(&self) -> SyncReport {
        match self.engine.sync_now().await.expect("sync pass failed") {
            SyncOutcome::Completed(report) => report,
            other => panic!("Expected a completed pass, got {:?}", other),
        }
    }

    pub fn go_offline(&self) {
        self.monitor.set_online(false);
    }

    pub fn go_online(&self) {
        self.monitor.set_online(true);
    }
}

pub fn shared_remote() -> (Arc<MemoryGateway>, Arc<ManualClock>) {
    (
        Arc::new(MemoryGateway::new()),
        Arc::new(ManualClock::at_millis(START_MS)),
    )
}

/// Everything published so far
pub fn drain_events(rx: &mut broadcast::Receiver<SyncEvent>) -> Vec<SyncEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}
