//! # Sync Queue and Metadata
//!
//! Persistence for the active operation queue, the parked (failed) operations
//! and key/value sync metadata such as the pull watermark.
//!
//! ## Queue layout
//!
//! One row per operation, keyed by operation id:
//! `{id, kind, entity_id, payload?, created_at, retry_count}` plus the retry
//! schedule. Rows drain in `(created_at, seq)` order.

use super::{decode_uuid, LocalDatabase};
use crate::offline::queue::{Change, FailedOperation, SyncOperation};
use crate::shared::clock::from_millis;
use crate::shared::error::{StorageError, StorageResult};
use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqliteConnection};
use uuid::Uuid;

/// Metadata key of the pull watermark
pub const WATERMARK_KEY: &str = "pull_watermark";

fn operation_from_row(table: &'static str, row: &SqliteRow) -> StorageResult<SyncOperation> {
    let id: String = row.try_get("id")?;
    let entity_id: String = row.try_get("entity_id")?;
    let kind: String = row.try_get("kind")?;
    let payload: Option<String> = row.try_get("payload")?;
    let created_at: i64 = row.try_get("created_at")?;
    let retry_count: i64 = row.try_get("retry_count")?;
    let next_attempt_at: Option<i64> = row.try_get("next_attempt_at")?;

    Ok(SyncOperation {
        id: decode_uuid(table, &id)?,
        entity_id: decode_uuid(table, &entity_id)?,
        change: Change::from_parts(&kind, payload.as_deref())?,
        created_at: from_millis(created_at),
        retry_count: u32::try_from(retry_count)
            .map_err(|_| StorageError::corrupt(table, format!("retry_count {} out of range", retry_count)))?,
        next_attempt_at: next_attempt_at.map(from_millis),
        last_error: row.try_get("last_error")?,
    })
}

fn failed_from_row(row: &SqliteRow) -> StorageResult<FailedOperation> {
    let failed_at: i64 = row.try_get("failed_at")?;
    Ok(FailedOperation {
        operation: operation_from_row("failed_operations", row)?,
        error: row.try_get("error")?,
        failed_at: from_millis(failed_at),
    })
}

pub(super) async fn insert_operation(conn: &mut SqliteConnection, op: &SyncOperation) -> StorageResult<()> {
    sqlx::query(
        "INSERT INTO sync_queue (id, entity_id, kind, payload, created_at, retry_count, next_attempt_at, last_error)
         VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(op.id.to_string())
    .bind(op.entity_id.to_string())
    .bind(op.kind().as_str())
    .bind(op.change.payload_json()?)
    .bind(op.created_at.timestamp_millis())
    .bind(i64::from(op.retry_count))
    .bind(op.next_attempt_at.map(|at| at.timestamp_millis()))
    .bind(op.last_error.as_deref())
    .execute(&mut *conn)
    .await?;
    Ok(())
}

/// Rewrite retry bookkeeping; the payload of a queued operation never changes
pub(super) async fn update_operation(conn: &mut SqliteConnection, op: &SyncOperation) -> StorageResult<()> {
    sqlx::query(
        "UPDATE sync_queue SET retry_count = ?, next_attempt_at = ?, last_error = ?
         WHERE id = ?",
    )
    .bind(i64::from(op.retry_count))
    .bind(op.next_attempt_at.map(|at| at.timestamp_millis()))
    .bind(op.last_error.as_deref())
    .bind(op.id.to_string())
    .execute(&mut *conn)
    .await?;
    Ok(())
}

pub(super) async fn delete_operation(conn: &mut SqliteConnection, op_id: Uuid) -> StorageResult<()> {
    sqlx::query("DELETE FROM sync_queue WHERE id = ?")
        .bind(op_id.to_string())
        .execute(&mut *conn)
        .await?;
    Ok(())
}

/// Move an operation from the queue into `failed_operations`
pub(super) async fn park_operation(conn: &mut SqliteConnection, failed: &FailedOperation) -> StorageResult<()> {
    let op = &failed.operation;
    delete_operation(conn, op.id).await?;
    unpark_operation(conn, op.id).await?;

    sqlx::query(
        "INSERT INTO failed_operations
            (id, entity_id, kind, payload, created_at, retry_count, next_attempt_at, last_error, error, failed_at)
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(op.id.to_string())
    .bind(op.entity_id.to_string())
    .bind(op.kind().as_str())
    .bind(op.change.payload_json()?)
    .bind(op.created_at.timestamp_millis())
    .bind(i64::from(op.retry_count))
    .bind(op.next_attempt_at.map(|at| at.timestamp_millis()))
    .bind(op.last_error.as_deref())
    .bind(&failed.error)
    .bind(failed.failed_at.timestamp_millis())
    .execute(&mut *conn)
    .await?;
    Ok(())
}

pub(super) async fn unpark_operation(conn: &mut SqliteConnection, op_id: Uuid) -> StorageResult<()> {
    sqlx::query("DELETE FROM failed_operations WHERE id = ?")
        .bind(op_id.to_string())
        .execute(&mut *conn)
        .await?;
    Ok(())
}

pub(super) async fn set_metadata(
    conn: &mut SqliteConnection,
    key: &str,
    value: &str,
    now: DateTime<Utc>,
) -> StorageResult<()> {
    sqlx::query(
        "INSERT OR REPLACE INTO sync_metadata (key, value, updated_at)
         VALUES (?, ?, ?)",
    )
    .bind(key)
    .bind(value)
    .bind(now.timestamp_millis())
    .execute(&mut *conn)
    .await?;
    Ok(())
}

impl LocalDatabase {
    /// Active queue in FIFO order
    pub async fn pending_operations(&self) -> StorageResult<Vec<SyncOperation>> {
        let rows = sqlx::query(
            "SELECT id, entity_id, kind, payload, created_at, retry_count, next_attempt_at, last_error
             FROM sync_queue
             ORDER BY created_at ASC, seq ASC",
        )
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(|row| operation_from_row("sync_queue", row)).collect()
    }

    pub async fn pending_operations_for(&self, entity_id: Uuid) -> StorageResult<Vec<SyncOperation>> {
        let rows = sqlx::query(
            "SELECT id, entity_id, kind, payload, created_at, retry_count, next_attempt_at, last_error
             FROM sync_queue WHERE entity_id = ?
             ORDER BY created_at ASC, seq ASC",
        )
        .bind(entity_id.to_string())
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(|row| operation_from_row("sync_queue", row)).collect()
    }

    /// Parked operations in original FIFO order
    pub async fn failed_operations(&self) -> StorageResult<Vec<FailedOperation>> {
        let rows = sqlx::query(
            "SELECT id, entity_id, kind, payload, created_at, retry_count, next_attempt_at, last_error, error, failed_at
             FROM failed_operations
             ORDER BY created_at ASC, seq ASC",
        )
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(failed_from_row).collect()
    }

    pub async fn failed_operations_for(&self, entity_id: Uuid) -> StorageResult<Vec<FailedOperation>> {
        let rows = sqlx::query(
            "SELECT id, entity_id, kind, payload, created_at, retry_count, next_attempt_at, last_error, error, failed_at
             FROM failed_operations WHERE entity_id = ?
             ORDER BY created_at ASC, seq ASC",
        )
        .bind(entity_id.to_string())
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(failed_from_row).collect()
    }

    /// Get sync metadata
    pub async fn get_sync_metadata(&self, key: &str) -> StorageResult<Option<String>> {
        let row = sqlx::query("SELECT value FROM sync_metadata WHERE key = ?")
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;

        match row {
            Some(row) => Ok(Some(row.try_get("value")?)),
            None => Ok(None),
        }
    }

    /// Stored pull watermark
    pub async fn get_watermark(&self) -> StorageResult<Option<DateTime<Utc>>> {
        match self.get_sync_metadata(WATERMARK_KEY).await? {
            Some(raw) => {
                let millis: i64 = raw
                    .parse()
                    .map_err(|_| StorageError::corrupt("sync_metadata", format!("bad watermark '{}'", raw)))?;
                Ok(Some(from_millis(millis)))
            }
            None => Ok(None),
        }
    }
}
