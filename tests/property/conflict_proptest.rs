//! Property-based tests for last-write-wins resolution

use proptest::prelude::*;
use serde_json::json;
use xfsync::offline::{ConflictResolver, Disposition, LastWriteWins};
use xfsync::shared::clock::from_millis;
use xfsync::shared::{Entity, RemoteEntity};

fn pair(local_ms: i64, remote_ms: i64, revision: u64) -> (Entity, RemoteEntity) {
    let mut local = Entity::new("todos", json!({"side": "local"}), from_millis(local_ms));
    local.server_id = Some("T1".into());
    local.base_revision = Some(revision.saturating_sub(1));
    let remote = RemoteEntity {
        server_id: "T1".into(),
        client_id: Some(local.id),
        collection: "todos".into(),
        data: json!({"side": "remote"}),
        updated_at: from_millis(remote_ms),
        revision,
    };
    (local, remote)
}

proptest! {
    #[test]
    fn test_resolution_is_deterministic(
        local_ms in 0i64..10_000,
        remote_ms in 0i64..10_000,
        revision in 1u64..100,
    ) {
        let (local, remote) = pair(local_ms, remote_ms, revision);
        let first = LastWriteWins.resolve(&local, &remote);
        let second = LastWriteWins.resolve(&local, &remote);
        prop_assert_eq!(first, second);
    }

    #[test]
    fn test_later_timestamp_wins(
        local_ms in 0i64..10_000,
        remote_ms in 0i64..10_000,
        revision in 1u64..100,
    ) {
        let (local, remote) = pair(local_ms, remote_ms, revision);
        let resolution = LastWriteWins.resolve(&local, &remote);

        if local_ms > remote_ms {
            prop_assert_eq!(resolution.disposition, Disposition::LocalWins);
            prop_assert_eq!(resolution.winner.data, json!({"side": "local"}));
        } else {
            prop_assert_eq!(resolution.disposition, Disposition::RemoteWins);
            prop_assert_eq!(resolution.winner.data, json!({"side": "remote"}));
        }
        prop_assert_eq!(resolution.winner.id, local.id);
        prop_assert_eq!(resolution.winner.base_revision, Some(revision));
    }
}
