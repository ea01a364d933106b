//! # Conflict Resolution
//!
//! Decides which version of an entity survives when a locally pending copy
//! meets a different remote copy, either during pull or when the remote rejects
//! a write as stale.
//!
//! ## Strategy
//!
//! [`LastWriteWins`] compares `updated_at`. A strictly later timestamp wins and
//! an exact tie goes to the remote, so two devices holding the same pair of
//! versions always agree on the outcome.
//!
//! The resolver is pure and total: it never fails and never touches storage.
//! The sync engine applies the returned [`Resolution`].
//!
//! ## Usage
//!
//! ```rust
//! use xfsync::offline::reconciliation::{ConflictResolver, Disposition, LastWriteWins};
//! # use xfsync::shared::{Entity, RemoteEntity};
//! # use xfsync::shared::clock::from_millis;
//! # let local = Entity::new("todos", serde_json::json!({}), from_millis(1));
//! # let remote = RemoteEntity {
//! #     server_id: "T1".into(), client_id: Some(local.id), collection: "todos".into(),
//! #     data: serde_json::json!({}), updated_at: from_millis(2), revision: 1,
//! # };
//!
//! let resolution = LastWriteWins.resolve(&local, &remote);
//! assert_eq!(resolution.disposition, Disposition::RemoteWins);
//! ```

use crate::shared::entity::{Entity, RemoteEntity};
use serde::{Deserialize, Serialize};

/// Which side survived a conflict
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Disposition {
    /// Remote value replaces the local one; pending local operations are dropped
    RemoteWins,
    /// Local value stays; pending local operations are pushed over the remote
    LocalWins,
}

/// Outcome of a conflict
#[derive(Debug, Clone, PartialEq)]
pub struct Resolution {
    pub disposition: Disposition,
    /// Entity to store locally.
    ///
    /// For `RemoteWins` this is the remote value, marked synced. For
    /// `LocalWins` it is the local value rebased onto the remote revision, so
    /// the next push is not rejected as stale again.
    pub winner: Entity,
}

/// Conflict resolution strategy
pub trait ConflictResolver: Send + Sync {
    fn resolve(&self, local: &Entity, remote: &RemoteEntity) -> Resolution;
}

/// Last-write-wins on `updated_at`, ties to the remote
#[derive(Debug, Default, Clone, Copy)]
pub struct LastWriteWins;

impl ConflictResolver for LastWriteWins {
    fn resolve(&self, local: &Entity, remote: &RemoteEntity) -> Resolution {
        if local.updated_at > remote.updated_at {
            let mut winner = local.clone();
            if winner.server_id.is_none() {
                winner.server_id = Some(remote.server_id.clone());
            }
            winner.base_revision = Some(remote.revision);
            Resolution {
                disposition: Disposition::LocalWins,
                winner,
            }
        } else {
            Resolution {
                disposition: Disposition::RemoteWins,
                winner: Entity::from_remote(local.id, remote),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shared::clock::from_millis;
    use crate::shared::entity::SyncStatus;
    use serde_json::json;

    fn pair(local_ms: i64, remote_ms: i64) -> (Entity, RemoteEntity) {
        let mut local = Entity::new("todos", json!({"title": "local"}), from_millis(local_ms));
        local.server_id = Some("T1".into());
        local.base_revision = Some(1);
        let remote = RemoteEntity {
            server_id: "T1".into(),
            client_id: Some(local.id),
            collection: "todos".into(),
            data: json!({"title": "remote"}),
            updated_at: from_millis(remote_ms),
            revision: 2,
        };
        (local, remote)
    }

    #[test]
    fn test_later_remote_wins() {
        let (local, remote) = pair(1_000, 2_000);
        let resolution = LastWriteWins.resolve(&local, &remote);

        assert_eq!(resolution.disposition, Disposition::RemoteWins);
        assert_eq!(resolution.winner.id, local.id);
        assert_eq!(resolution.winner.data, json!({"title": "remote"}));
        assert_eq!(resolution.winner.sync_status, SyncStatus::Synced);
        assert_eq!(resolution.winner.base_revision, Some(2));
    }

    #[test]
    fn test_later_local_wins_and_rebases() {
        let (local, remote) = pair(3_000, 2_000);
        let resolution = LastWriteWins.resolve(&local, &remote);

        assert_eq!(resolution.disposition, Disposition::LocalWins);
        assert_eq!(resolution.winner.data, json!({"title": "local"}));
        assert_eq!(resolution.winner.base_revision, Some(2));
        assert_eq!(resolution.winner.sync_status, SyncStatus::Pending);
    }

    #[test]
    fn test_tie_goes_to_remote() {
        let (local, remote) = pair(2_000, 2_000);
        assert_eq!(
            LastWriteWins.resolve(&local, &remote).disposition,
            Disposition::RemoteWins
        );
    }

    #[test]
    fn test_local_win_binds_missing_server_id() {
        let (mut local, remote) = pair(3_000, 2_000);
        local.server_id = None;
        let resolution = LastWriteWins.resolve(&local, &remote);
        assert_eq!(resolution.winner.server_id.as_deref(), Some("T1"));
    }
}
