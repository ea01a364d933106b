//! Per-entity write locks.
//!
//! Application mutations and the sync engine both take the entity's lock
//! before a read-modify-write, so a local edit can never interleave with the
//! application of a remote value for the same entity. Locks for different
//! entities are independent.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use uuid::Uuid;

/// Registry of per-entity async mutexes
#[derive(Debug, Default)]
pub struct EntityLocks {
    inner: Mutex<HashMap<Uuid, Arc<AsyncMutex<()>>>>,
}

impl EntityLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquire the lock for `entity_id`, waiting for any current holder
    pub async fn lock(&self, entity_id: Uuid) -> OwnedMutexGuard<()> {
        let mutex = {
            let mut map = self.inner.lock().unwrap_or_else(|e| e.into_inner());
            // Entries nobody holds or waits on can go
            map.retain(|_, m| Arc::strong_count(m) > 1);
            Arc::clone(map.entry(entity_id).or_default())
        };
        mutex.lock_owned().await
    }

    /// Number of entities with a live lock entry
    pub fn len(&self) -> usize {
        self.inner.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn test_same_entity_is_serialized() {
        let locks = Arc::new(EntityLocks::new());
        let id = Uuid::new_v4();
        let inside = Arc::new(AtomicUsize::new(0));
        let max_seen = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let locks = Arc::clone(&locks);
            let inside = Arc::clone(&inside);
            let max_seen = Arc::clone(&max_seen);
            handles.push(tokio::spawn(async move {
                let _guard = locks.lock(id).await;
                let now = inside.fetch_add(1, Ordering::SeqCst) + 1;
                max_seen.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(2)).await;
                inside.fetch_sub(1, Ordering::SeqCst);
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(max_seen.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_different_entities_do_not_block() {
        let locks = EntityLocks::new();
        let _a = locks.lock(Uuid::new_v4()).await;
        let b = tokio::time::timeout(Duration::from_millis(100), locks.lock(Uuid::new_v4())).await;
        assert!(b.is_ok());
    }

    #[tokio::test]
    async fn test_released_entries_are_pruned() {
        let locks = EntityLocks::new();
        drop(locks.lock(Uuid::new_v4()).await);
        drop(locks.lock(Uuid::new_v4()).await);
        let _held = locks.lock(Uuid::new_v4()).await;
        assert_eq!(locks.len(), 1);
    }
}
