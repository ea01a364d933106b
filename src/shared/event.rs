//! Observer Events
//!
//! Everything a UI collaborator can observe about the sync engine is published
//! as a [`SyncEvent`] on an [`EventBus`]. The bus wraps a
//! `tokio::sync::broadcast` channel: every subscriber receives a copy of each
//! event, and publishing with no subscribers is not an error.
//!
//! The local store publishes [`SyncEvent::EntityChanged`] after every committed
//! write; the sync engine publishes operation outcomes and phase changes. No
//! component holds a reference back into the UI layer.

use crate::shared::entity::Entity;
use crate::sync::sync_state::SyncPhase;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use uuid::Uuid;

/// Default channel capacity
pub const DEFAULT_EVENT_CAPACITY: usize = 256;

/// State of an entity after a committed change
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum EntityState {
    /// The entity exists with this value
    Present { entity: Entity },
    /// The entity was deleted locally or remotely
    Deleted,
}

/// Terminal outcome of a sync operation
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum OperationOutcome {
    /// The remote applied the operation
    Synced,
    /// Retries exhausted or permanently rejected; the operation is parked
    Failed { error: String },
    /// Superseded by remote state and dropped without being applied
    Discarded,
}

/// Event published to observers
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SyncEvent {
    /// A committed local store change
    EntityChanged { entity_id: Uuid, new_state: EntityState },
    /// An operation reached a terminal outcome
    OperationCompleted {
        operation_id: Uuid,
        entity_id: Uuid,
        outcome: OperationOutcome,
    },
    /// The engine moved to another phase
    PhaseChanged { phase: SyncPhase },
}

/// Broadcast bus for [`SyncEvent`]s
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<SyncEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Subscribe to all future events
    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.tx.subscribe()
    }

    /// Publish an event, returning the number of subscribers reached
    pub fn publish(&self, event: SyncEvent) -> usize {
        match self.tx.send(event) {
            Ok(count) => count,
            Err(_) => {
                tracing::trace!("[Events] no subscribers");
                0
            }
        }
    }

    pub fn entity_changed(&self, entity: &Entity) {
        self.publish(SyncEvent::EntityChanged {
            entity_id: entity.id,
            new_state: EntityState::Present {
                entity: entity.clone(),
            },
        });
    }

    pub fn entity_deleted(&self, entity_id: Uuid) {
        self.publish(SyncEvent::EntityChanged {
            entity_id,
            new_state: EntityState::Deleted,
        });
    }

    pub fn operation_completed(&self, operation_id: Uuid, entity_id: Uuid, outcome: OperationOutcome) {
        self.publish(SyncEvent::OperationCompleted {
            operation_id,
            entity_id,
            outcome,
        });
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_EVENT_CAPACITY)
    }
}
