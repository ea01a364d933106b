//! # Sync State Management
//!
//! Phase of the sync engine plus the status snapshot a UI shows next to it.
//!
//! ```text
//! idle ──trigger──▶ pulling ──merged──▶ pushing ──drained──▶ idle
//!   ▲                  │                   │
//!   └── next trigger ─ error ◀─── fault ───┘
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Engine phase
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "snake_case")]
pub enum SyncPhase {
    #[default]
    Idle,
    /// Fetching and merging remote changes
    Pulling,
    /// Draining the local operation queue
    Pushing,
    /// Last pass hit an unrecoverable fault
    Error,
}

impl SyncPhase {
    pub fn can_transition_to(self, next: SyncPhase) -> bool {
        matches!(
            (self, next),
            (SyncPhase::Idle, SyncPhase::Pulling)
                | (SyncPhase::Pulling, SyncPhase::Pushing)
                | (SyncPhase::Pushing, SyncPhase::Idle)
                | (SyncPhase::Error, SyncPhase::Idle)
                | (_, SyncPhase::Error)
        )
    }

    pub fn is_active(self) -> bool {
        matches!(self, SyncPhase::Pulling | SyncPhase::Pushing)
    }
}

/// Current synchronization state
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncState {
    pub phase: SyncPhase,
    /// Completion time of the last successful pass
    pub last_sync: Option<DateTime<Utc>>,
    /// Number of pending operations
    pub pending_operations: usize,
    /// Number of parked operations
    pub failed_operations: usize,
    /// Fault that moved the engine into `Error`
    pub last_error: Option<String>,
}

impl SyncState {
    pub fn is_syncing(&self) -> bool {
        self.phase.is_active()
    }
}
