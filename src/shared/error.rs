//! Error Types
//!
//! Every failure the sync engine can surface, grouped by who has to deal with it.
//!
//! # Error Categories
//!
//! - `StorageError` - local persistence failure; fatal to the call that triggered it
//! - `GatewayError` - remote call failure, split into transient, conflict and permanent
//! - `SyncError` - what the mutation API and the sync engine return to callers
//!
//! # Usage
//!
//! ```rust
//! use xfsync::shared::error::GatewayError;
//!
//! let error = GatewayError::transient("connection reset");
//! assert!(error.is_retryable());
//! ```
use crate::shared::entity::RemoteEntity;
use thiserror::Error;
use uuid::Uuid;

/// Local persistence failure
#[derive(Debug, Error)]
pub enum StorageError {
    /// Underlying database error
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Payload could not be encoded or decoded
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Filesystem error while opening the store
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// A stored row could not be interpreted
    #[error("Corrupt row in '{table}': {message}")]
    Corrupt {
        /// Table the row came from
        table: &'static str,
        /// Human-readable error message
        message: String,
    },

    /// Attempt to change an already bound server identifier
    #[error("Entity {entity_id} is bound to server id '{existing}', refusing {attempted:?}")]
    IdentityConflict {
        entity_id: Uuid,
        existing: String,
        attempted: Option<String>,
    },
}

impl StorageError {
    /// Create a new corrupt-row error
    pub fn corrupt(table: &'static str, message: impl Into<String>) -> Self {
        Self::Corrupt {
            table,
            message: message.into(),
        }
    }

    /// Create a new identity conflict error
    pub fn identity_conflict(entity_id: Uuid, existing: String, attempted: Option<String>) -> Self {
        Self::IdentityConflict {
            entity_id,
            existing,
            attempted,
        }
    }
}

/// Failure reported by the network gateway
#[derive(Debug, Error, Clone)]
pub enum GatewayError {
    /// Timeout, connection loss or 5xx; retried per the retry policy
    #[error("Transient network error: {0}")]
    Transient(String),

    /// Version or identity mismatch; carries the authoritative remote copy,
    /// or `None` if the remote no longer has the entity
    #[error("Conflict with remote state")]
    Conflict {
        current: Option<Box<RemoteEntity>>,
    },

    /// Rejected request (4xx other than conflict, malformed payload); never retried
    #[error("Permanent error: {0}")]
    Permanent(String),
}

impl GatewayError {
    /// Create a new transient error
    pub fn transient(message: impl Into<String>) -> Self {
        Self::Transient(message.into())
    }

    /// Create a new permanent error
    pub fn permanent(message: impl Into<String>) -> Self {
        Self::Permanent(message.into())
    }

    /// Create a new conflict error
    pub fn conflict(current: Option<RemoteEntity>) -> Self {
        Self::Conflict {
            current: current.map(Box::new),
        }
    }

    /// Whether the retry policy applies
    pub fn is_retryable(&self) -> bool {
        matches!(self, GatewayError::Transient(_))
    }
}

/// Errors returned by the mutation API and the sync engine
#[derive(Debug, Error)]
pub enum SyncError {
    /// Local store failure
    #[error(transparent)]
    Storage(#[from] StorageError),

    /// The pull phase failed; the pass was aborted before pushing
    #[error("Pull failed: {0}")]
    Pull(GatewayError),

    /// No live entity with this identifier
    #[error("Entity {0} not found")]
    NotFound(Uuid),

    /// Application payload could not be converted to JSON
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The background sync service was started twice
    #[error("Sync service is already running")]
    AlreadyRunning,
}

/// Result type alias for local store operations
pub type StorageResult<T> = std::result::Result<T, StorageError>;
