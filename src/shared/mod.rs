//! Shared Module
//!
//! Types used across the local store, the mutation API and the sync engine:
//! the entity model, the error taxonomy, observer events, configuration and the
//! clock abstraction.

/// Entity, tombstone and remote record types
pub mod entity;

/// Observer events and the broadcast bus
pub mod event;

/// Error taxonomy
pub mod error;

/// Time source abstraction
pub mod clock;

/// Sync configuration
pub mod config;

/// Re-export commonly used types for convenience
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{ConfigError, RetryConfig, SyncConfig, SyncConfigBuilder};
pub use entity::{Entity, EntitySnapshot, RemoteEntity, RemoteTombstone, SyncStatus, Tombstone};
pub use error::{GatewayError, StorageError, SyncError};
pub use event::{EntityState, EventBus, OperationOutcome, SyncEvent};
