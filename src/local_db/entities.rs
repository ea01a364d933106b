//! # Entity Storage
//!
//! Reads and transactional writes for the `entities` table.

use super::{decode_uuid, revision_from_sql, revision_to_sql, LocalDatabase};
use crate::shared::clock::from_millis;
use crate::shared::entity::{Entity, SyncStatus};
use crate::shared::error::{StorageError, StorageResult};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqliteConnection};
use uuid::Uuid;

pub(super) fn entity_from_row(row: &SqliteRow) -> StorageResult<Entity> {
    let id: String = row.try_get("id")?;
    let data: String = row.try_get("data")?;
    let status: String = row.try_get("sync_status")?;
    let updated_at: i64 = row.try_get("updated_at")?;
    let base_revision: Option<i64> = row.try_get("base_revision")?;

    Ok(Entity {
        id: decode_uuid("entities", &id)?,
        server_id: row.try_get("server_id")?,
        collection: row.try_get("collection")?,
        data: serde_json::from_str(&data)?,
        updated_at: from_millis(updated_at),
        base_revision: base_revision.map(|r| revision_from_sql("entities", r)).transpose()?,
        sync_status: SyncStatus::parse(&status)
            .ok_or_else(|| StorageError::corrupt("entities", format!("unknown sync status '{}'", status)))?,
        last_error: row.try_get("last_error")?,
    })
}

async fn fetch_entity(conn: &mut SqliteConnection, id: Uuid) -> StorageResult<Option<Entity>> {
    let row = sqlx::query(
        "SELECT id, server_id, collection, data, updated_at, base_revision, sync_status, last_error
         FROM entities WHERE id = ?",
    )
    .bind(id.to_string())
    .fetch_optional(&mut *conn)
    .await?;

    row.as_ref().map(entity_from_row).transpose()
}

/// Upsert inside a transaction, refusing to rebind a server id
pub(super) async fn upsert_entity(conn: &mut SqliteConnection, entity: &Entity) -> StorageResult<()> {
    if let Some(prev) = fetch_entity(conn, entity.id).await? {
        Entity::check_identity(&prev, entity)?;
    }

    sqlx::query(
        "INSERT INTO entities (id, server_id, collection, data, updated_at, base_revision, sync_status, last_error)
         VALUES (?, ?, ?, ?, ?, ?, ?, ?)
         ON CONFLICT(id) DO UPDATE SET
            server_id = excluded.server_id,
            collection = excluded.collection,
            data = excluded.data,
            updated_at = excluded.updated_at,
            base_revision = excluded.base_revision,
            sync_status = excluded.sync_status,
            last_error = excluded.last_error",
    )
    .bind(entity.id.to_string())
    .bind(entity.server_id.as_deref())
    .bind(&entity.collection)
    .bind(serde_json::to_string(&entity.data)?)
    .bind(entity.updated_at.timestamp_millis())
    .bind(entity.base_revision.map(revision_to_sql).transpose()?)
    .bind(entity.sync_status.as_str())
    .bind(entity.last_error.as_deref())
    .execute(&mut *conn)
    .await?;
    Ok(())
}

pub(super) async fn delete_entity(conn: &mut SqliteConnection, id: Uuid) -> StorageResult<()> {
    sqlx::query("DELETE FROM entities WHERE id = ?")
        .bind(id.to_string())
        .execute(&mut *conn)
        .await?;
    Ok(())
}

impl LocalDatabase {
    /// Entity by client identifier
    pub async fn get_entity(&self, id: Uuid) -> StorageResult<Option<Entity>> {
        let row = sqlx::query(
            "SELECT id, server_id, collection, data, updated_at, base_revision, sync_status, last_error
             FROM entities WHERE id = ?",
        )
        .bind(id.to_string())
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(entity_from_row).transpose()
    }

    /// Entity by server identifier
    pub async fn get_entity_by_server_id(&self, server_id: &str) -> StorageResult<Option<Entity>> {
        let row = sqlx::query(
            "SELECT id, server_id, collection, data, updated_at, base_revision, sync_status, last_error
             FROM entities WHERE server_id = ?
             LIMIT 1",
        )
        .bind(server_id)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(entity_from_row).transpose()
    }

    /// Live entities ordered by last edit
    pub async fn list_entities(&self, collection: Option<&str>) -> StorageResult<Vec<Entity>> {
        let rows = match collection {
            Some(collection) => {
                sqlx::query(
                    "SELECT id, server_id, collection, data, updated_at, base_revision, sync_status, last_error
                     FROM entities WHERE collection = ?
                     ORDER BY updated_at ASC, id ASC",
                )
                .bind(collection)
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query(
                    "SELECT id, server_id, collection, data, updated_at, base_revision, sync_status, last_error
                     FROM entities
                     ORDER BY updated_at ASC, id ASC",
                )
                .fetch_all(&self.pool)
                .await?
            }
        };

        rows.iter().map(entity_from_row).collect()
    }
}
