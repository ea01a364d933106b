//! Tombstone storage.

use super::{decode_uuid, LocalDatabase};
use crate::shared::clock::from_millis;
use crate::shared::entity::Tombstone;
use crate::shared::error::StorageResult;
use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqliteConnection};
use uuid::Uuid;

fn tombstone_from_row(row: &SqliteRow) -> StorageResult<Tombstone> {
    let entity_id: String = row.try_get("entity_id")?;
    let deleted_at: i64 = row.try_get("deleted_at")?;
    Ok(Tombstone {
        entity_id: decode_uuid("tombstones", &entity_id)?,
        server_id: row.try_get("server_id")?,
        collection: row.try_get("collection")?,
        deleted_at: from_millis(deleted_at),
        acknowledged: row.try_get("acknowledged")?,
    })
}

pub(super) async fn upsert_tombstone(conn: &mut SqliteConnection, tombstone: &Tombstone) -> StorageResult<()> {
    sqlx::query(
        "INSERT OR REPLACE INTO tombstones (entity_id, server_id, collection, deleted_at, acknowledged)
         VALUES (?, ?, ?, ?, ?)",
    )
    .bind(tombstone.entity_id.to_string())
    .bind(tombstone.server_id.as_deref())
    .bind(&tombstone.collection)
    .bind(tombstone.deleted_at.timestamp_millis())
    .bind(tombstone.acknowledged)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

impl LocalDatabase {
    pub async fn get_tombstone(&self, entity_id: Uuid) -> StorageResult<Option<Tombstone>> {
        let row = sqlx::query(
            "SELECT entity_id, server_id, collection, deleted_at, acknowledged
             FROM tombstones WHERE entity_id = ?",
        )
        .bind(entity_id.to_string())
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(tombstone_from_row).transpose()
    }

    pub async fn get_tombstone_by_server_id(&self, server_id: &str) -> StorageResult<Option<Tombstone>> {
        let row = sqlx::query(
            "SELECT entity_id, server_id, collection, deleted_at, acknowledged
             FROM tombstones WHERE server_id = ?
             LIMIT 1",
        )
        .bind(server_id)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(tombstone_from_row).transpose()
    }

    /// Delete acknowledged tombstones older than `before`.
    ///
    /// Unacknowledged tombstones are still needed to push their deletion and
    /// are never purged.
    pub async fn purge_acknowledged_tombstones(&self, before: DateTime<Utc>) -> StorageResult<u64> {
        let result = sqlx::query("DELETE FROM tombstones WHERE acknowledged = 1 AND deleted_at < ?")
            .bind(before.timestamp_millis())
            .execute(&self.pool)
            .await?;

        if result.rows_affected() > 0 {
            tracing::info!("Purged {} acknowledged tombstones", result.rows_affected());
        }
        Ok(result.rows_affected())
    }
}
