//! # Sync Engine
//!
//! Runs sync passes: pull remote changes since the stored watermark and merge
//! them, then drain the operation queue in FIFO order.
//!
//! ## Pull
//!
//! - Remote deletions remove the local entity, acknowledge its tombstone and
//!   discard whatever was still queued for it.
//! - Remote entities the device has never seen are inserted, unless a local
//!   tombstone says they were deleted here.
//! - Synced entities take any newer remote revision as-is.
//! - Entities with local changes go through the [`ConflictResolver`].
//!
//! ## Push
//!
//! Operations are sent one at a time while holding the entity's lock, with the
//! operation id as idempotency key. Per entity, nothing overtakes an operation
//! that is backing off; other entities are unaffected.
//!
//! Transient failures back off per the [`RetryPolicy`] and are parked once
//! attempts run out; permanent failures are parked immediately. A parked
//! operation takes the entity's later operations with it and marks the entity
//! `failed`.

use crate::offline::{
    ConflictResolver, Disposition, FailedOperation, LastWriteWins, OperationKind, RetryPolicy, SyncOperation,
};
use crate::shared::clock::Clock;
use crate::shared::entity::{Entity, EntitySnapshot, RemoteEntity, RemoteTombstone, SyncStatus, Tombstone};
use crate::shared::error::{GatewayError, SyncError};
use crate::shared::event::{OperationOutcome, SyncEvent};
use crate::store::{LocalStore, WriteBatch};
use crate::sync::gateway::NetworkGateway;
use crate::sync::metrics::SyncMetrics;
use crate::sync::network_monitor::Reachability;
use crate::sync::scheduler::{self, PassGate};
use crate::sync::sync_state::{SyncPhase, SyncState};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, RwLock};
use uuid::Uuid;

/// An operation that was parked during a pass
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OperationFailure {
    pub operation_id: Uuid,
    pub entity_id: Uuid,
    pub error: String,
}

/// What a sync call did
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SyncReport {
    /// Passes run, re-triggered ones included
    pub passes: u32,
    /// Remote entities inserted or fast-forwarded
    pub pulled: usize,
    /// Local entities removed because the remote deleted them
    pub remote_deletions: usize,
    /// Remote entities ignored because they were deleted locally
    pub skipped_tombstoned: usize,
    pub local_wins: usize,
    pub remote_wins: usize,
    /// Operations the remote applied
    pub pushed: usize,
    /// Operations left queued because of backoff or ordering
    pub deferred: usize,
    /// Operations that failed transiently and were rescheduled
    pub retried: usize,
    /// Operations parked
    pub failed: usize,
    /// Operations dropped as superseded
    pub discarded: usize,
    pub errors: Vec<OperationFailure>,
}

impl SyncReport {
    pub fn conflicts(&self) -> usize {
        self.local_wins + self.remote_wins
    }

    fn absorb(&mut self, other: SyncReport) {
        self.passes += other.passes;
        self.pulled += other.pulled;
        self.remote_deletions += other.remote_deletions;
        self.skipped_tombstoned += other.skipped_tombstoned;
        self.local_wins += other.local_wins;
        self.remote_wins += other.remote_wins;
        self.pushed += other.pushed;
        self.deferred += other.deferred;
        self.retried += other.retried;
        self.failed += other.failed;
        self.discarded += other.discarded;
        self.errors.extend(other.errors);
    }
}

/// Result of [`SyncEngine::sync_now`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncOutcome {
    /// One or more passes ran to completion
    Completed(SyncReport),
    /// A pass was already running; it will run once more when it finishes
    Coalesced,
    /// Reachability reported offline; nothing was attempted
    Offline,
}

/// Whether the push loop may continue with the entity's next operation
enum Flow {
    Continue,
    Block,
}

pub struct SyncEngine {
    store: Arc<dyn LocalStore>,
    gateway: Arc<dyn NetworkGateway>,
    reachability: Arc<dyn Reachability>,
    clock: Arc<dyn Clock>,
    resolver: Arc<dyn ConflictResolver>,
    policy: RetryPolicy,
    gate: PassGate,
    state: RwLock<SyncState>,
    metrics: RwLock<SyncMetrics>,
}

impl std::fmt::Debug for SyncEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncEngine")
            .field("policy", &self.policy)
            .field("gate", &self.gate)
            .finish_non_exhaustive()
    }
}

impl SyncEngine {
    /// Create an engine resolving conflicts with [`LastWriteWins`]
    pub fn new(
        store: Arc<dyn LocalStore>,
        gateway: Arc<dyn NetworkGateway>,
        reachability: Arc<dyn Reachability>,
        clock: Arc<dyn Clock>,
        policy: RetryPolicy,
    ) -> Self {
        Self {
            store,
            gateway,
            reachability,
            clock,
            resolver: Arc::new(LastWriteWins),
            policy,
            gate: PassGate::new(),
            state: RwLock::new(SyncState::default()),
            metrics: RwLock::new(SyncMetrics::new()),
        }
    }

    pub fn with_resolver(mut self, resolver: Arc<dyn ConflictResolver>) -> Self {
        self.resolver = resolver;
        self
    }

    pub fn store(&self) -> &Arc<dyn LocalStore> {
        &self.store
    }

    pub fn reachability(&self) -> &Arc<dyn Reachability> {
        &self.reachability
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.store.events().subscribe()
    }

    pub async fn state(&self) -> SyncState {
        self.state.read().await.clone()
    }

    pub async fn metrics(&self) -> SyncMetrics {
        self.metrics.read().await.clone()
    }

    /// Time until the earliest backoff window closes
    pub async fn next_retry_delay(&self) -> Result<Option<Duration>, SyncError> {
        let pending = self.store.list_pending().await?;
        Ok(scheduler::next_retry_delay(&pending, self.clock.now()))
    }

    /// Run a sync pass now.
    ///
    /// A call made while a pass is running returns [`SyncOutcome::Coalesced`]
    /// and the running pass repeats once before returning.
    pub async fn sync_now(&self) -> Result<SyncOutcome, SyncError> {
        if !self.reachability.is_online() {
            tracing::debug!("Offline, skipping sync");
            return Ok(SyncOutcome::Offline);
        }
        let Some(mut guard) = self.gate.try_enter() else {
            tracing::debug!("Sync already running, trigger coalesced");
            self.metrics.write().await.record_coalesced();
            return Ok(SyncOutcome::Coalesced);
        };

        let mut report = SyncReport::default();
        loop {
            match self.run_pass().await {
                Ok(pass) => report.absorb(pass),
                Err(e) => {
                    if guard.take_retrigger() {
                        tracing::debug!("Discarding coalesced trigger, the pass failed");
                    }
                    return Err(e);
                }
            }
            if !self.reachability.is_online() {
                if guard.take_retrigger() {
                    tracing::debug!("Discarding coalesced trigger, connectivity lost");
                }
                break;
            }
            match guard.release() {
                Some(held) => {
                    guard = held;
                    tracing::debug!("Re-running sync for a coalesced trigger");
                }
                None => break,
            }
        }
        Ok(SyncOutcome::Completed(report))
    }

    async fn run_pass(&self) -> Result<SyncReport, SyncError> {
        self.metrics.write().await.record_pass_start();
        self.set_phase(SyncPhase::Pulling).await;

        let mut report = SyncReport {
            passes: 1,
            ..SyncReport::default()
        };
        let result = self.execute_pass(&mut report).await;

        match result {
            Ok(()) => {
                self.metrics
                    .write()
                    .await
                    .record_pass_success(report.pushed, report.failed, report.conflicts());
                {
                    let mut state = self.state.write().await;
                    state.last_sync = Some(self.clock.now());
                    state.last_error = None;
                }
                self.refresh_counts().await;
                self.set_phase(SyncPhase::Idle).await;
                tracing::info!(
                    "Sync pass complete: pulled {}, pushed {}, deferred {}, failed {}, conflicts {}",
                    report.pulled,
                    report.pushed,
                    report.deferred,
                    report.failed,
                    report.conflicts()
                );
                Ok(report)
            }
            Err(e) => {
                tracing::error!("Sync pass failed: {}", e);
                self.metrics.write().await.record_pass_failure();
                self.state.write().await.last_error = Some(e.to_string());
                self.refresh_counts().await;
                self.set_phase(SyncPhase::Error).await;
                Err(e)
            }
        }
    }

    async fn execute_pass(&self, report: &mut SyncReport) -> Result<(), SyncError> {
        let watermark = self.store.watermark().await?;
        let changes = self
            .gateway
            .list_changed_since(watermark)
            .await
            .map_err(|e| {
                tracing::warn!("Failed to list remote changes: {}", e);
                SyncError::Pull(e)
            })?;
        tracing::debug!(
            "Pulled {} changed and {} deleted entities since {:?}",
            changes.entities.len(),
            changes.deleted.len(),
            watermark
        );

        for deletion in &changes.deleted {
            self.apply_remote_deletion(deletion, report).await?;
        }
        for remote in &changes.entities {
            self.apply_remote_entity(remote, report).await?;
        }

        self.set_phase(SyncPhase::Pushing).await;
        self.push_queue(report).await?;

        // A pass that fails part-way pulls the same range again next time
        self.store
            .commit(WriteBatch::new().set_watermark(changes.server_time))
            .await?;
        Ok(())
    }

    async fn set_phase(&self, next: SyncPhase) {
        let mut state = self.state.write().await;
        if state.phase == next {
            return;
        }
        if state.phase == SyncPhase::Error && next != SyncPhase::Idle {
            state.phase = SyncPhase::Idle;
            self.store.events().publish(SyncEvent::PhaseChanged {
                phase: SyncPhase::Idle,
            });
        }
        if !state.phase.can_transition_to(next) {
            tracing::debug!("Unexpected phase change {:?} -> {:?}", state.phase, next);
        }
        state.phase = next;
        self.store.events().publish(SyncEvent::PhaseChanged { phase: next });
    }

    async fn refresh_counts(&self) {
        match self.store.stats().await {
            Ok(stats) => {
                let mut state = self.state.write().await;
                state.pending_operations = stats.pending_operations as usize;
                state.failed_operations = stats.failed_operations as usize;
            }
            Err(e) => tracing::warn!("Failed to read store stats: {}", e),
        }
    }

    /// Local id a remote record maps to, if this device knows it
    async fn local_id_for(&self, client_id: Option<Uuid>, server_id: &str) -> Result<Option<Uuid>, SyncError> {
        if let Some(id) = client_id {
            return Ok(Some(id));
        }
        if let Some(entity) = self.store.get_by_server_id(server_id).await? {
            return Ok(Some(entity.id));
        }
        Ok(self
            .store
            .tombstone_by_server_id(server_id)
            .await?
            .map(|tombstone| tombstone.entity_id))
    }

    async fn apply_remote_entity(&self, remote: &RemoteEntity, report: &mut SyncReport) -> Result<(), SyncError> {
        let id = self
            .local_id_for(remote.client_id, &remote.server_id)
            .await?
            .unwrap_or_else(Uuid::new_v4);
        let _guard = self.store.lock_entity(id).await;

        let Some(local) = self.store.get(id).await? else {
            let tombstoned = self.store.tombstone(id).await?.is_some()
                || self.store.tombstone_by_server_id(&remote.server_id).await?.is_some();
            if tombstoned {
                tracing::debug!("Ignoring remote {} for locally deleted {}", remote.server_id, id);
                report.skipped_tombstoned += 1;
            } else {
                self.store.put(Entity::from_remote(id, remote)).await?;
                report.pulled += 1;
            }
            return Ok(());
        };

        if let Some(bound) = local.server_id.as_deref() {
            if bound != remote.server_id {
                tracing::warn!(
                    "Entity {} is bound to '{}' but the remote reports '{}', skipping",
                    id,
                    bound,
                    remote.server_id
                );
                return Ok(());
            }
        }
        if local.base_revision.is_some_and(|base| remote.revision <= base) {
            return Ok(());
        }

        if local.sync_status.has_local_changes() {
            if is_echo(&local, remote) {
                // Our own write came back before its response did; queued
                // operations replay under their original keys
                let mut adopted = local;
                adopted.bind_server_id(&remote.server_id)?;
                adopted.base_revision = adopted.base_revision.max(Some(remote.revision));
                self.store.put(adopted).await?;
                return Ok(());
            }
            self.reconcile_pulled(local, remote, report).await
        } else {
            self.store.put(Entity::from_remote(id, remote)).await?;
            report.pulled += 1;
            Ok(())
        }
    }

    async fn reconcile_pulled(&self, local: Entity, remote: &RemoteEntity, report: &mut SyncReport) -> Result<(), SyncError> {
        let resolution = self.resolver.resolve(&local, remote);
        match resolution.disposition {
            Disposition::RemoteWins => {
                tracing::info!("Conflict on {}: remote revision {} wins", local.id, remote.revision);
                report.remote_wins += 1;
                self.overwrite_with_remote(resolution.winner, report).await
            }
            Disposition::LocalWins => {
                tracing::info!(
                    "Conflict on {}: local edit wins, rebased onto revision {}",
                    local.id,
                    remote.revision
                );
                report.local_wins += 1;
                self.store.put(resolution.winner).await?;
                Ok(())
            }
        }
    }

    /// Store the remote winner and drop everything queued or parked for it
    async fn overwrite_with_remote(&self, winner: Entity, report: &mut SyncReport) -> Result<(), SyncError> {
        let id = winner.id;
        let pending = self.store.list_pending_for(id).await?;
        let parked = self.store.list_failed_for(id).await?;

        let mut batch = WriteBatch::new().put_entity(winner);
        for op in &pending {
            batch = batch.dequeue(op.id);
        }
        for failed in &parked {
            batch = batch.unpark(failed.operation.id);
        }
        self.store.commit(batch).await?;

        let dropped = pending.iter().chain(parked.iter().map(|failed| &failed.operation));
        self.publish_discarded(id, dropped, report);
        Ok(())
    }

    async fn apply_remote_deletion(&self, deletion: &RemoteTombstone, report: &mut SyncReport) -> Result<(), SyncError> {
        let Some(id) = self
            .local_id_for(deletion.client_id, &deletion.server_id)
            .await?
        else {
            return Ok(());
        };
        let _guard = self.store.lock_entity(id).await;
        self.absorb_remote_deletion(id, Some(&deletion.server_id), deletion.deleted_at, report)
            .await
    }

    /// Forget everything local about an entity the remote deleted.
    ///
    /// Caller holds the entity lock.
    async fn absorb_remote_deletion(
        &self,
        id: Uuid,
        server_id: Option<&str>,
        deleted_at: DateTime<Utc>,
        report: &mut SyncReport,
    ) -> Result<(), SyncError> {
        let local = self.store.get(id).await?;
        let existing = self.store.tombstone(id).await?;
        let pending = self.store.list_pending_for(id).await?;
        let parked = self.store.list_failed_for(id).await?;

        let collection = match (&local, &existing) {
            (Some(entity), _) => entity.collection.clone(),
            (None, Some(tombstone)) => tombstone.collection.clone(),
            (None, None) => return Ok(()),
        };
        let settled = existing.as_ref().is_some_and(|tombstone| tombstone.acknowledged);
        if local.is_none() && settled && pending.is_empty() && parked.is_empty() {
            return Ok(());
        }

        let tombstone = Tombstone {
            entity_id: id,
            server_id: local
                .as_ref()
                .and_then(|entity| entity.server_id.clone())
                .or_else(|| existing.as_ref().and_then(|tombstone| tombstone.server_id.clone()))
                .or_else(|| server_id.map(str::to_string)),
            collection,
            deleted_at: existing
                .as_ref()
                .map_or(deleted_at, |tombstone| tombstone.deleted_at),
            acknowledged: true,
        };

        let mut batch = WriteBatch::new().put_tombstone(tombstone);
        if local.is_some() {
            batch = batch.remove_entity(id);
        }
        for op in &pending {
            batch = batch.dequeue(op.id);
        }
        for failed in &parked {
            batch = batch.unpark(failed.operation.id);
        }
        self.store.commit(batch).await?;

        if local.is_some() {
            tracing::info!("Entity {} was deleted remotely", id);
            report.remote_deletions += 1;
        }
        let dropped = pending.iter().chain(parked.iter().map(|failed| &failed.operation));
        self.publish_discarded(id, dropped, report);
        Ok(())
    }

    fn publish_discarded<'a>(
        &self,
        entity_id: Uuid,
        ops: impl Iterator<Item = &'a SyncOperation>,
        report: &mut SyncReport,
    ) {
        for op in ops {
            self.store
                .events()
                .operation_completed(op.id, entity_id, OperationOutcome::Discarded);
            report.discarded += 1;
        }
    }

    async fn push_queue(&self, report: &mut SyncReport) -> Result<(), SyncError> {
        let queue = self.store.list_pending().await?;
        let now = self.clock.now();
        let mut blocked: HashSet<Uuid> = HashSet::new();

        for queued in queue {
            if blocked.contains(&queued.entity_id) {
                report.deferred += 1;
                continue;
            }
            if !queued.is_due(now) {
                blocked.insert(queued.entity_id);
                report.deferred += 1;
                continue;
            }
            if !self.reachability.is_online() {
                tracing::debug!("Connectivity lost, leaving the rest of the queue");
                break;
            }

            let _guard = self.store.lock_entity(queued.entity_id).await;
            // Earlier steps of this pass may have settled or reordered the entity's queue
            let mut current = self.store.list_pending_for(queued.entity_id).await?;
            let Some(position) = current.iter().position(|op| op.id == queued.id) else {
                continue;
            };
            if position > 0 {
                blocked.insert(queued.entity_id);
                report.deferred += 1;
                continue;
            }

            let op = current.swap_remove(0);
            if let Flow::Block = self.push_one(op, report).await? {
                blocked.insert(queued.entity_id);
            }
        }
        Ok(())
    }

    async fn push_one(&self, op: SyncOperation, report: &mut SyncReport) -> Result<Flow, SyncError> {
        let Some(snapshot) = op.change.snapshot().cloned() else {
            return self.push_delete(op, report).await;
        };
        match self.store.get(op.entity_id).await? {
            Some(entity) => self.push_write(op, entity, &snapshot, report).await,
            None => self.push_orphaned_write(op, &snapshot, report).await,
        }
    }

    async fn push_write(
        &self,
        op: SyncOperation,
        mut entity: Entity,
        snapshot: &EntitySnapshot,
        report: &mut SyncReport,
    ) -> Result<Flow, SyncError> {
        if entity.sync_status != SyncStatus::Syncing {
            entity.sync_status = SyncStatus::Syncing;
            self.store.put(entity.clone()).await?;
        }

        let outbound = entity.with_snapshot(snapshot);
        let result = match (op.kind(), outbound.server_id.is_some()) {
            (OperationKind::Update, true) => self.gateway.update(&outbound, op.id).await,
            _ => self.gateway.create(&outbound, op.id).await,
        };

        match result {
            Ok(remote) => self.complete_write(op, entity, &remote, report).await,
            Err(GatewayError::Conflict { current }) => {
                self.resolve_push_conflict(op, entity, snapshot, current.map(|remote| *remote), report)
                    .await
            }
            Err(error) => self.fail(op, Some(entity), error, report).await,
        }
    }

    async fn complete_write(
        &self,
        op: SyncOperation,
        mut entity: Entity,
        remote: &RemoteEntity,
        report: &mut SyncReport,
    ) -> Result<Flow, SyncError> {
        if let Err(e) = entity.bind_server_id(&remote.server_id) {
            tracing::error!("Refusing remote response for {}: {}", entity.id, e);
            return self.park(op, Some(entity), e.to_string(), report).await;
        }
        entity.base_revision = entity.base_revision.max(Some(remote.revision));

        let more_queued = self
            .store
            .list_pending_for(entity.id)
            .await?
            .iter()
            .any(|queued| queued.id != op.id);
        entity.sync_status = if more_queued {
            SyncStatus::Pending
        } else {
            SyncStatus::Synced
        };
        entity.last_error = None;

        let entity_id = entity.id;
        self.store
            .commit(WriteBatch::new().put_entity(entity).dequeue(op.id))
            .await?;
        self.store
            .events()
            .operation_completed(op.id, entity_id, OperationOutcome::Synced);
        report.pushed += 1;
        tracing::debug!(
            "Pushed {} for {} as '{}' revision {}",
            op.kind().as_str(),
            entity_id,
            remote.server_id,
            remote.revision
        );
        Ok(Flow::Continue)
    }

    async fn resolve_push_conflict(
        &self,
        op: SyncOperation,
        entity: Entity,
        snapshot: &EntitySnapshot,
        current: Option<RemoteEntity>,
        report: &mut SyncReport,
    ) -> Result<Flow, SyncError> {
        let current = match current {
            Some(remote) => Some(remote),
            None => match self.gateway.fetch(&entity).await {
                Ok(found) => found,
                Err(error) => return self.fail(op, Some(entity), error, report).await,
            },
        };
        let Some(remote) = current else {
            let now = self.clock.now();
            self.absorb_remote_deletion(entity.id, None, now, report).await?;
            return Ok(Flow::Continue);
        };

        if let Some(bound) = entity.server_id.as_deref() {
            if bound != remote.server_id {
                let message = format!(
                    "remote reported '{}' for an entity bound to '{}'",
                    remote.server_id, bound
                );
                return self.park(op, Some(entity), message, report).await;
            }
        }

        let resolution = self.resolver.resolve(&entity, &remote);
        match resolution.disposition {
            Disposition::RemoteWins => {
                tracing::info!("Push conflict on {}: remote revision {} wins", entity.id, remote.revision);
                report.remote_wins += 1;
                self.overwrite_with_remote(resolution.winner, report).await?;
                Ok(Flow::Continue)
            }
            Disposition::LocalWins => {
                tracing::info!(
                    "Push conflict on {}: local edit wins, resubmitting against revision {}",
                    entity.id,
                    remote.revision
                );
                report.local_wins += 1;
                let winner = resolution.winner;
                let outbound = winner.with_snapshot(snapshot);
                match self.gateway.update(&outbound, op.id).await {
                    Ok(accepted) => self.complete_write(op, winner, &accepted, report).await,
                    Err(GatewayError::Conflict { .. }) => {
                        let error = GatewayError::transient("conflict persisted after resubmit");
                        self.fail(op, Some(winner), error, report).await
                    }
                    Err(error) => self.fail(op, Some(winner), error, report).await,
                }
            }
        }
    }

    /// Create or update whose entity was deleted locally before it was pushed
    async fn push_orphaned_write(
        &self,
        op: SyncOperation,
        snapshot: &EntitySnapshot,
        report: &mut SyncReport,
    ) -> Result<Flow, SyncError> {
        let tombstone = self.store.tombstone(op.entity_id).await?;
        let mut tombstone = match tombstone {
            Some(tombstone)
                if op.kind() == OperationKind::Create
                    && !tombstone.acknowledged
                    && tombstone.server_id.is_none() =>
            {
                tombstone
            }
            _ => {
                self.discard(op, report).await?;
                return Ok(Flow::Continue);
            }
        };

        // The create may already have reached the remote; push it so the
        // queued delete has a target.
        let outbound = Entity {
            id: op.entity_id,
            server_id: None,
            collection: snapshot.collection.clone(),
            data: snapshot.data.clone(),
            updated_at: snapshot.updated_at,
            base_revision: None,
            sync_status: SyncStatus::Syncing,
            last_error: None,
        };
        let remote = match self.gateway.create(&outbound, op.id).await {
            Ok(remote) => remote,
            Err(GatewayError::Conflict { current: Some(remote) }) => *remote,
            Err(GatewayError::Conflict { current: None }) => {
                self.discard(op, report).await?;
                return Ok(Flow::Continue);
            }
            Err(error) => return self.fail(op, None, error, report).await,
        };

        tombstone.server_id = Some(remote.server_id.clone());
        self.store
            .commit(WriteBatch::new().put_tombstone(tombstone).dequeue(op.id))
            .await?;
        self.store
            .events()
            .operation_completed(op.id, op.entity_id, OperationOutcome::Synced);
        report.pushed += 1;
        Ok(Flow::Continue)
    }

    async fn push_delete(&self, op: SyncOperation, report: &mut SyncReport) -> Result<Flow, SyncError> {
        let mut tombstone = match self.store.tombstone(op.entity_id).await? {
            Some(tombstone) if !tombstone.acknowledged => tombstone,
            _ => {
                self.discard(op, report).await?;
                return Ok(Flow::Continue);
            }
        };

        let Some(server_id) = tombstone.server_id.clone() else {
            // Nothing remote to delete
            tombstone.acknowledged = true;
            self.store
                .commit(WriteBatch::new().put_tombstone(tombstone).dequeue(op.id))
                .await?;
            self.store
                .events()
                .operation_completed(op.id, op.entity_id, OperationOutcome::Discarded);
            report.discarded += 1;
            return Ok(Flow::Continue);
        };

        match self.gateway.delete(&server_id, op.id).await {
            Ok(()) | Err(GatewayError::Conflict { .. }) => {
                tombstone.acknowledged = true;
                self.store
                    .commit(WriteBatch::new().put_tombstone(tombstone).dequeue(op.id))
                    .await?;
                self.store
                    .events()
                    .operation_completed(op.id, op.entity_id, OperationOutcome::Synced);
                report.pushed += 1;
                tracing::debug!("Deleted '{}' remotely", server_id);
                Ok(Flow::Continue)
            }
            Err(error) => self.fail(op, None, error, report).await,
        }
    }

    async fn discard(&self, op: SyncOperation, report: &mut SyncReport) -> Result<(), SyncError> {
        self.store.dequeue(op.id).await?;
        self.store
            .events()
            .operation_completed(op.id, op.entity_id, OperationOutcome::Discarded);
        report.discarded += 1;
        tracing::debug!("Discarded {} for {}", op.kind().as_str(), op.entity_id);
        Ok(())
    }

    async fn fail(
        &self,
        mut op: SyncOperation,
        entity: Option<Entity>,
        error: GatewayError,
        report: &mut SyncReport,
    ) -> Result<Flow, SyncError> {
        let message = error.to_string();
        if let GatewayError::Permanent(_) = error {
            return self.park(op, entity, message, report).await;
        }

        let attempt = op.retry_count + 1;
        let now = self.clock.now();
        if self.policy.should_give_up(attempt) {
            op.record_failure(message.clone(), now);
            op.next_attempt_at = None;
            return self.park(op, entity, message, report).await;
        }

        let next_at = self.policy.next_attempt_at(now, attempt);
        op.record_failure(message.clone(), next_at);
        let mut batch = WriteBatch::new().update_operation(op.clone());
        if let Some(mut entity) = entity {
            entity.sync_status = SyncStatus::Pending;
            batch = batch.put_entity(entity);
        }
        self.store.commit(batch).await?;

        tracing::warn!(
            "{} for {} failed (attempt {}/{}), retrying at {}: {}",
            op.kind().as_str(),
            op.entity_id,
            attempt,
            self.policy.max_attempts(),
            next_at,
            message
        );
        report.retried += 1;
        Ok(Flow::Block)
    }

    /// Move `op` and every later operation for its entity to the failed list
    async fn park(
        &self,
        op: SyncOperation,
        entity: Option<Entity>,
        error: String,
        report: &mut SyncReport,
    ) -> Result<Flow, SyncError> {
        let now = self.clock.now();
        let later: Vec<SyncOperation> = self
            .store
            .list_pending_for(op.entity_id)
            .await?
            .into_iter()
            .filter(|queued| queued.id != op.id)
            .collect();

        let mut batch = WriteBatch::new().park(FailedOperation {
            operation: op.clone(),
            error: error.clone(),
            failed_at: now,
        });
        let blocked_error = format!("blocked by failed operation {}", op.id);
        for queued in &later {
            batch = batch.park(FailedOperation {
                operation: queued.clone(),
                error: blocked_error.clone(),
                failed_at: now,
            });
        }
        if let Some(mut entity) = entity {
            entity.sync_status = SyncStatus::Failed;
            entity.last_error = Some(error.clone());
            batch = batch.put_entity(entity);
        }
        self.store.commit(batch).await?;

        let events = self.store.events();
        events.operation_completed(op.id, op.entity_id, OperationOutcome::Failed { error: error.clone() });
        for queued in &later {
            events.operation_completed(
                queued.id,
                queued.entity_id,
                OperationOutcome::Failed {
                    error: blocked_error.clone(),
                },
            );
        }

        tracing::error!(
            "{} for {} failed permanently, {} later operations parked: {}",
            op.kind().as_str(),
            op.entity_id,
            later.len(),
            error
        );
        report.failed += 1 + later.len();
        report.errors.push(OperationFailure {
            operation_id: op.id,
            entity_id: op.entity_id,
            error,
        });
        Ok(Flow::Block)
    }
}

/// Whether `remote` carries exactly the local state
fn is_echo(local: &Entity, remote: &RemoteEntity) -> bool {
    local.updated_at == remote.updated_at && local.collection == remote.collection && local.data == remote.data
}
