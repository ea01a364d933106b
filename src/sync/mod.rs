//! # Background Sync Service
//!
//! Keeps a device's local store converged with the remote by running
//! [`SyncEngine`] passes in the background.
//!
//! ## Architecture
//!
//! - **Engine**: pull, merge and push passes (`engine.rs`)
//! - **Scheduler**: single-pass admission and retry wake-ups (`scheduler.rs`)
//! - **Network Monitor**: connectivity signal (`network_monitor.rs`)
//! - **Gateway**: the remote service contract (`gateway.rs`) and an in-memory
//!   implementation (`memory_gateway.rs`)
//! - **Sync State** / **Metrics**: what a UI shows about sync
//!
//! A pass starts when any of these fire:
//! - the periodic interval (if `auto_sync` is on);
//! - connectivity coming back;
//! - an explicit [`SyncService::force_sync`];
//! - the earliest backoff window of a queued operation closing.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use xfsync::local_db::LocalDatabase;
//! use xfsync::shared::{SyncConfig, SystemClock};
//! use xfsync::sync::{MemoryGateway, NetworkMonitor, SyncEngine, SyncService};
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let config = SyncConfig::default();
//! let store = Arc::new(LocalDatabase::open(&config.database_path).await?);
//! let monitor = Arc::new(NetworkMonitor::new(true));
//! let engine = SyncEngine::new(
//!     store,
//!     Arc::new(MemoryGateway::new()),
//!     monitor.clone(),
//!     Arc::new(SystemClock),
//!     config.retry_policy(),
//! );
//!
//! let mut service = SyncService::new(Arc::new(engine), &config);
//! service.start()?;
//!
//! // Connectivity transitions wake the service
//! monitor.set_online(false);
//! monitor.set_online(true);
//!
//! service.force_sync();
//! println!("Sync status: {:?}", service.get_status().await);
//! service.stop();
//! # Ok(())
//! # }
//! ```

pub mod engine;
pub mod gateway;
pub mod memory_gateway;
pub mod metrics;
pub mod network_monitor;
pub mod scheduler;
pub mod sync_state;

pub use engine::{OperationFailure, SyncEngine, SyncOutcome, SyncReport};
pub use gateway::{ChangeSet, NetworkGateway};
pub use memory_gateway::{Fault, MemoryGateway};
pub use metrics::SyncMetrics;
pub use network_monitor::{NetworkMonitor, NetworkStatus, Reachability};
pub use scheduler::PassGate;
pub use sync_state::{SyncPhase, SyncState};

use crate::shared::config::SyncConfig;
use crate::shared::error::SyncError;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

/// Runs the engine on a background task
#[derive(Debug)]
pub struct SyncService {
    engine: Arc<SyncEngine>,
    /// Interval between periodic passes
    interval: Duration,
    /// Whether the periodic interval triggers passes
    auto_sync: bool,
    /// Explicit triggers; `Notify` keeps at most one pending permit
    trigger: Arc<Notify>,
    /// Background sync task handle
    background_task: Option<JoinHandle<()>>,
}

impl SyncService {
    pub fn new(engine: Arc<SyncEngine>, config: &SyncConfig) -> Self {
        Self {
            engine,
            interval: config.sync_interval(),
            auto_sync: config.auto_sync,
            trigger: Arc::new(Notify::new()),
            background_task: None,
        }
    }

    pub fn engine(&self) -> &Arc<SyncEngine> {
        &self.engine
    }

    /// Start the background sync loop
    pub fn start(&mut self) -> Result<(), SyncError> {
        if self.background_task.is_some() {
            return Err(SyncError::AlreadyRunning);
        }

        let engine = Arc::clone(&self.engine);
        let online = engine.reachability().subscribe();
        let trigger = Arc::clone(&self.trigger);
        let interval = self.interval;
        let auto_sync = self.auto_sync;

        let handle = tokio::spawn(async move {
            Self::background_sync_loop(engine, online, trigger, interval, auto_sync).await;
        });

        self.background_task = Some(handle);
        tracing::info!("Sync service started (interval {:?}, auto_sync {})", interval, auto_sync);
        Ok(())
    }

    /// Stop the background sync loop; a pass in flight is abandoned
    pub fn stop(&mut self) {
        if let Some(handle) = self.background_task.take() {
            handle.abort();
            tracing::info!("Sync service stopped");
        }
    }

    pub fn is_running(&self) -> bool {
        self.background_task.is_some()
    }

    /// Ask the background loop for a pass as soon as possible
    pub fn force_sync(&self) {
        self.trigger.notify_one();
    }

    /// Run a pass on the caller's task
    pub async fn sync_now(&self) -> Result<SyncOutcome, SyncError> {
        self.engine.sync_now().await
    }

    /// Get current sync status
    pub async fn get_status(&self) -> SyncState {
        self.engine.state().await
    }

    async fn background_sync_loop(
        engine: Arc<SyncEngine>,
        mut online: watch::Receiver<bool>,
        trigger: Arc<Notify>,
        period: Duration,
        auto_sync: bool,
    ) {
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        // Retry deadlines only wake the loop after a pass that completed here;
        // otherwise a due operation would spin it
        let mut retry_wake = true;

        loop {
            let retry_delay = match engine.next_retry_delay().await {
                Ok(delay) if retry_wake => delay,
                Ok(_) => None,
                Err(e) => {
                    tracing::warn!("Failed to read retry schedule: {}", e);
                    None
                }
            };
            let retry_due = async {
                match retry_delay {
                    Some(delay) => tokio::time::sleep(delay).await,
                    None => std::future::pending::<()>().await,
                }
            };

            tokio::select! {
                _ = interval.tick() => {
                    if !auto_sync {
                        continue;
                    }
                }
                changed = online.changed() => {
                    if changed.is_err() {
                        tracing::debug!("Reachability source dropped, stopping sync loop");
                        break;
                    }
                    if !*online.borrow_and_update() {
                        continue;
                    }
                    tracing::info!("Connectivity restored, syncing");
                }
                _ = trigger.notified() => {
                    tracing::debug!("Sync requested");
                }
                _ = retry_due => {
                    tracing::debug!("Retry window elapsed");
                }
            }

            let result = engine.sync_now().await;
            retry_wake = matches!(result, Ok(SyncOutcome::Completed(_)));
            match result {
                Ok(SyncOutcome::Completed(report)) if !report.errors.is_empty() => {
                    tracing::warn!("Sync pass parked {} operations", report.errors.len());
                }
                Ok(_) => {}
                Err(e) => tracing::error!("Sync cycle failed: {}", e),
            }
        }
    }
}

impl Drop for SyncService {
    fn drop(&mut self) {
        if let Some(handle) = self.background_task.take() {
            handle.abort();
        }
    }
}
