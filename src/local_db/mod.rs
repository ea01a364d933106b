//! # Local Database Module
//!
//! SQLite-backed [`LocalStore`] for offline-first operation. Entities, the
//! operation queue, parked operations, tombstones and sync metadata all live in
//! one database file, so a single transaction covers an entity write and its
//! queued operation.
//!
//! ## Architecture
//!
//! - **WAL journal** with `synchronous=NORMAL`: committed batches survive a
//!   process crash
//! - **Single writer**: the pool holds one connection, so batches are applied
//!   strictly one after another
//! - **Versioned schema**: `schema.rs` lists migrations, recorded in
//!   `schema_migrations`
//!
//! ## Key Components
//!
//! - `LocalDatabase`: connection, schema management, [`LocalStore`] impl
//! - `entities.rs`: entity rows
//! - `sync.rs`: operation queue, parked operations, sync metadata
//! - `tombstones.rs`: deletion markers
//!
//! ## Usage
//!
//! ```rust,no_run
//! use xfsync::local_db::LocalDatabase;
//! use xfsync::store::LocalStore;
//!
//! # async fn run() -> Result<(), xfsync::shared::StorageError> {
//! let db = LocalDatabase::open("/tmp/xfsync/local.db").await?;
//! let pending = db.list_pending().await?;
//! println!("{} operations waiting", pending.len());
//! # Ok(())
//! # }
//! ```

pub mod entities;
pub mod schema;
pub mod sync;
pub mod tombstones;

use crate::shared::clock::{Clock, SystemClock};
use crate::shared::entity::{Entity, Tombstone};
use crate::shared::error::{StorageError, StorageResult};
use crate::shared::event::EventBus;
use crate::offline::queue::{FailedOperation, SyncOperation};
use crate::store::{EntityLocks, LocalStore, StoreStats, StoreWrite, WriteBatch};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use sqlx::{Row, SqliteConnection, SqlitePool};
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;
use uuid::Uuid;

/// Local database connection manager
///
/// Owns the SQLite pool, the observer bus and the per-entity locks.
#[derive(Debug)]
pub struct LocalDatabase {
    pool: SqlitePool,
    events: EventBus,
    locks: EntityLocks,
}

impl LocalDatabase {
    /// Open or create the database file at `path`
    ///
    /// Creates parent directories and the file if needed, then applies any
    /// pending migrations.
    pub async fn open(path: impl AsRef<Path>) -> StorageResult<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .foreign_keys(true)
            .busy_timeout(Duration::from_secs(5));

        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await?;

        tracing::debug!("Opened local database at {}", path.display());
        Self::with_pool(pool).await
    }

    /// Fresh database that lives as long as this value
    pub async fn in_memory() -> StorageResult<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?.foreign_keys(true);

        // The database disappears with its connection, so keep exactly one
        // open for the pool's lifetime.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;

        Self::with_pool(pool).await
    }

    async fn with_pool(pool: SqlitePool) -> StorageResult<Self> {
        let db = Self {
            pool,
            events: EventBus::default(),
            locks: EntityLocks::new(),
        };
        db.run_migrations().await?;
        Ok(db)
    }

    /// Replace the observer bus, e.g. to share one bus across components
    pub fn with_events(mut self, events: EventBus) -> Self {
        self.events = events;
        self
    }

    /// Get connection pool reference
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Close the pool, waiting for the connection to be returned
    pub async fn close(&self) {
        self.pool.close().await;
    }

    /// Apply pending schema migrations
    async fn run_migrations(&self) -> StorageResult<()> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS schema_migrations (
                version INTEGER PRIMARY KEY,
                applied_at INTEGER NOT NULL
            )",
        )
        .execute(&self.pool)
        .await?;

        let current: i64 = sqlx::query("SELECT COALESCE(MAX(version), 0) AS version FROM schema_migrations")
            .fetch_one(&self.pool)
            .await?
            .try_get("version")?;

        if !schema::needs_migration(current) {
            return Ok(());
        }

        for (version, script) in schema::pending_migrations(current) {
            let mut tx = self.pool.begin().await?;
            sqlx::raw_sql(script).execute(&mut *tx).await?;
            sqlx::query("INSERT INTO schema_migrations (version, applied_at) VALUES (?, ?)")
                .bind(*version)
                .bind(SystemClock.now().timestamp_millis())
                .execute(&mut *tx)
                .await?;
            tx.commit().await?;
            tracing::info!("Applied local schema migration {}", version);
        }
        Ok(())
    }

    /// Current schema version
    pub async fn schema_version(&self) -> StorageResult<i64> {
        let version: i64 = sqlx::query("SELECT COALESCE(MAX(version), 0) AS version FROM schema_migrations")
            .fetch_one(&self.pool)
            .await?
            .try_get("version")?;
        Ok(version)
    }

    async fn count(&self, sql: &str) -> StorageResult<u64> {
        let count: i64 = sqlx::query(sql).fetch_one(&self.pool).await?.try_get(0)?;
        Ok(u64::try_from(count).unwrap_or_default())
    }

    /// Get database statistics
    pub async fn get_stats(&self) -> StorageResult<StoreStats> {
        Ok(StoreStats {
            entities: self.count("SELECT COUNT(*) FROM entities").await?,
            pending_operations: self.count("SELECT COUNT(*) FROM sync_queue").await?,
            failed_operations: self.count("SELECT COUNT(*) FROM failed_operations").await?,
            tombstones: self.count("SELECT COUNT(*) FROM tombstones").await?,
            unacknowledged_tombstones: self
                .count("SELECT COUNT(*) FROM tombstones WHERE acknowledged = 0")
                .await?,
            watermark: self.get_watermark().await?,
        })
    }

    async fn apply(conn: &mut SqliteConnection, write: &StoreWrite) -> StorageResult<()> {
        match write {
            StoreWrite::PutEntity(entity) => entities::upsert_entity(conn, entity).await,
            StoreWrite::RemoveEntity(id) => entities::delete_entity(conn, *id).await,
            StoreWrite::PutTombstone(tombstone) => tombstones::upsert_tombstone(conn, tombstone).await,
            StoreWrite::Enqueue(op) => sync::insert_operation(conn, op).await,
            StoreWrite::UpdateOperation(op) => sync::update_operation(conn, op).await,
            StoreWrite::Dequeue(op_id) => sync::delete_operation(conn, *op_id).await,
            StoreWrite::Park(failed) => sync::park_operation(conn, failed).await,
            StoreWrite::Unpark(op_id) => sync::unpark_operation(conn, *op_id).await,
            StoreWrite::SetWatermark(at) => {
                sync::set_metadata(
                    conn,
                    sync::WATERMARK_KEY,
                    &at.timestamp_millis().to_string(),
                    SystemClock.now(),
                )
                .await
            }
        }
    }
}

#[async_trait]
impl LocalStore for LocalDatabase {
    async fn get(&self, id: Uuid) -> StorageResult<Option<Entity>> {
        self.get_entity(id).await
    }

    async fn get_by_server_id(&self, server_id: &str) -> StorageResult<Option<Entity>> {
        self.get_entity_by_server_id(server_id).await
    }

    async fn list_entities(&self, collection: Option<&str>) -> StorageResult<Vec<Entity>> {
        LocalDatabase::list_entities(self, collection).await
    }

    async fn list_pending(&self) -> StorageResult<Vec<SyncOperation>> {
        self.pending_operations().await
    }

    async fn list_pending_for(&self, entity_id: Uuid) -> StorageResult<Vec<SyncOperation>> {
        self.pending_operations_for(entity_id).await
    }

    async fn list_failed(&self) -> StorageResult<Vec<FailedOperation>> {
        self.failed_operations().await
    }

    async fn list_failed_for(&self, entity_id: Uuid) -> StorageResult<Vec<FailedOperation>> {
        self.failed_operations_for(entity_id).await
    }

    async fn tombstone(&self, entity_id: Uuid) -> StorageResult<Option<Tombstone>> {
        self.get_tombstone(entity_id).await
    }

    async fn tombstone_by_server_id(&self, server_id: &str) -> StorageResult<Option<Tombstone>> {
        self.get_tombstone_by_server_id(server_id).await
    }

    async fn watermark(&self) -> StorageResult<Option<DateTime<Utc>>> {
        self.get_watermark().await
    }

    async fn commit(&self, batch: WriteBatch) -> StorageResult<()> {
        if batch.is_empty() {
            return Ok(());
        }

        let mut tx = self.pool.begin().await?;
        for write in batch.writes() {
            // Dropping `tx` on error rolls the whole batch back
            Self::apply(&mut *tx, write).await?;
        }
        tx.commit().await?;

        batch.publish_to(&self.events);
        Ok(())
    }

    async fn stats(&self) -> StorageResult<StoreStats> {
        self.get_stats().await
    }

    async fn purge_tombstones(&self, before: DateTime<Utc>) -> StorageResult<u64> {
        self.purge_acknowledged_tombstones(before).await
    }

    fn events(&self) -> &EventBus {
        &self.events
    }

    fn locks(&self) -> &EntityLocks {
        &self.locks
    }
}

/// Parse a stored UUID column
pub(crate) fn decode_uuid(table: &'static str, raw: &str) -> StorageResult<Uuid> {
    Uuid::parse_str(raw).map_err(|e| StorageError::corrupt(table, format!("bad uuid '{}': {}", raw, e)))
}

pub(crate) fn revision_to_sql(revision: u64) -> StorageResult<i64> {
    i64::try_from(revision).map_err(|_| StorageError::corrupt("entities", format!("revision {} overflows", revision)))
}

pub(crate) fn revision_from_sql(table: &'static str, raw: i64) -> StorageResult<u64> {
    u64::try_from(raw).map_err(|_| StorageError::corrupt(table, format!("negative revision {}", raw)))
}
