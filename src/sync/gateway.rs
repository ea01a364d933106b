//! # Network Gateway
//!
//! The remote service as the sync engine sees it. Transport, authentication
//! and wire format live behind this trait; the engine only relies on the
//! error classification in [`GatewayError`] and on idempotent writes.
//!
//! Every write carries an idempotency key (the queued operation's id). A write
//! replayed under a key the remote has already applied must return the
//! original result without applying it again.

use crate::shared::entity::{Entity, RemoteEntity, RemoteTombstone};
use crate::shared::error::GatewayError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

/// Remote changes since a watermark
#[derive(Debug, Clone, PartialEq)]
pub struct ChangeSet {
    /// Entities created or modified since the watermark
    pub entities: Vec<RemoteEntity>,
    /// Entities deleted since the watermark
    pub deleted: Vec<RemoteTombstone>,
    /// Remote clock at the time of the listing; becomes the next watermark
    pub server_time: DateTime<Utc>,
}

impl ChangeSet {
    pub fn is_empty(&self) -> bool {
        self.entities.is_empty() && self.deleted.is_empty()
    }
}

#[async_trait]
pub trait NetworkGateway: Send + Sync {
    /// Create `entity` remotely; the response binds the server identifier
    async fn create(&self, entity: &Entity, idempotency_key: Uuid) -> Result<RemoteEntity, GatewayError>;

    /// Replace the remote copy of `entity`.
    ///
    /// `entity.base_revision` must match the remote revision, otherwise the
    /// remote answers with [`GatewayError::Conflict`].
    async fn update(&self, entity: &Entity, idempotency_key: Uuid) -> Result<RemoteEntity, GatewayError>;

    /// Delete by server identifier; deleting an absent entity succeeds
    async fn delete(&self, server_id: &str, idempotency_key: Uuid) -> Result<(), GatewayError>;

    /// Authoritative remote copy of `entity`, looked up by server identifier
    /// or by client identifier when no server identifier is bound yet
    async fn fetch(&self, entity: &Entity) -> Result<Option<RemoteEntity>, GatewayError>;

    /// Everything that changed strictly after `since`; `None` lists everything
    async fn list_changed_since(&self, since: Option<DateTime<Utc>>) -> Result<ChangeSet, GatewayError>;
}
