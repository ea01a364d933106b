//! xfsync - Local-First Synchronization Engine
//!
//! xfsync keeps application data on the device and reconciles it with a remote
//! service in the background. The local store is authoritative for reads and
//! writes; every mutation is persisted together with a queued operation, and a
//! sync engine later pushes that queue and pulls remote changes.
//!
//! # Overview
//!
//! - Durable FIFO operation queue with idempotent replay
//! - Exponential backoff for transient failures, parking after give-up
//! - Last-write-wins conflict resolution with tombstoned deletes
//! - Delta pulls from a stored watermark
//! - Observer events for UI layers
//!
//! # Module Structure
//!
//! - **`shared`** - Entity model, errors, events, clock and configuration
//! - **`offline`** - Mutation API, operation queue, retry policy, conflict resolver
//! - **`store`** - `LocalStore` contract, atomic write batches, in-memory store
//! - **`local_db`** - SQLite-backed `LocalStore`
//! - **`sync`** - Sync engine, background service, gateway contract
//!
//! # Usage
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use serde_json::json;
//! use xfsync::local_db::LocalDatabase;
//! use xfsync::offline::OfflineManager;
//! use xfsync::shared::{SyncConfig, SystemClock};
//! use xfsync::sync::{MemoryGateway, NetworkMonitor, SyncEngine};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let config = SyncConfig::from_env()?;
//! let store = Arc::new(LocalDatabase::open(&config.database_path).await?);
//! let clock = Arc::new(SystemClock);
//!
//! let manager = OfflineManager::new(store.clone(), clock.clone());
//! manager.create("todos", &json!({ "title": "Buy milk" })).await?;
//!
//! let engine = SyncEngine::new(
//!     store,
//!     Arc::new(MemoryGateway::new()),
//!     Arc::new(NetworkMonitor::new(true)),
//!     clock,
//!     config.retry_policy(),
//! );
//! engine.sync_now().await?;
//! # Ok(())
//! # }
//! ```
//!
//! # Thread Safety
//!
//! Writers of one entity are serialized by a per-entity lock; different
//! entities proceed in parallel. At most one sync pass runs at a time, and
//! triggers arriving during a pass are coalesced into one follow-up pass.
//!
//! # Error Handling
//!
//! Errors are `thiserror` enums in [`shared::error`]. Storage failures are
//! fatal to the call that hit them; gateway failures are classified as
//! transient, conflict or permanent and handled per operation.

/// Shared types and data structures
pub mod shared;

/// Offline mutation API and queue primitives
pub mod offline;

/// Local store contract
pub mod store;

/// SQLite local store
pub mod local_db;

/// Sync engine and background service
pub mod sync;
