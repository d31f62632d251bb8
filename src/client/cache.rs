//! Per-backend dispatch cache.
//!
//! Each backend keeps one lazily connected manager client and one worker
//! handle per (database, relation) it has touched. A cache hit routes
//! directly to the worker socket, skipping the manager entirely. Entries
//! are dropped only by explicit invalidation or `terminate`; this cache
//! never observes worker exits on its own.

use crate::error::Result;
use crate::identity::WorkerIdentity;
use crate::client::manager::ManagerClient;
use crate::client::worker::WorkerHandle;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, OnceCell};
use tracing::debug;

pub struct DispatchCache {
    manager: OnceCell<ManagerClient>,
    workers: Mutex<HashMap<WorkerIdentity, Arc<WorkerHandle>>>,
}

impl DispatchCache {
    pub fn new() -> Self {
        Self {
            manager: OnceCell::new(),
            workers: Mutex::new(HashMap::new()),
        }
    }

    /// The manager client, created on first use.
    pub async fn manager(&self) -> &ManagerClient {
        self.manager.get_or_init(|| async { ManagerClient::new() }).await
    }

    /// Return the cached handle for `identity`, or ask the manager to
    /// open the worker and cache a fresh one. On failure nothing is
    /// cached, so the next call retries from scratch.
    pub async fn get_or_create(&self, identity: WorkerIdentity) -> Result<Arc<WorkerHandle>> {
        {
            let workers = self.workers.lock().await;
            if let Some(handle) = workers.get(&identity) {
                return Ok(Arc::clone(handle));
            }
        }

        let pid = self.manager().await.open(identity).await?;
        debug!(%identity, pid, "Caching worker handle");

        let handle = Arc::new(WorkerHandle::new(identity, pid));
        self.workers
            .lock()
            .await
            .insert(identity, Arc::clone(&handle));
        Ok(handle)
    }

    /// Drop the cached handle for `identity`, if any. The worker itself
    /// keeps running; only this backend forgets it.
    pub async fn invalidate(&self, identity: &WorkerIdentity) {
        self.workers.lock().await.remove(identity);
    }

    /// Ask the manager to stop the worker for `identity` and drop every
    /// matching cache entry. The all-relations sentinel prunes every
    /// entry in the database.
    pub async fn terminate(&self, identity: WorkerIdentity) -> Result<()> {
        self.manager().await.close(identity).await?;

        let mut workers = self.workers.lock().await;
        if identity.is_all_relations() {
            workers.retain(|cached, _| cached.database_id != identity.database_id);
        } else {
            workers.remove(&identity);
        }
        Ok(())
    }

    pub async fn len(&self) -> usize {
        self.workers.lock().await.len()
    }

    #[cfg(test)]
    pub(crate) async fn insert(&self, identity: WorkerIdentity, pid: u32) {
        self.workers
            .lock()
            .await
            .insert(identity, Arc::new(WorkerHandle::new(identity, pid)));
    }

    #[cfg(test)]
    pub(crate) async fn contains(&self, identity: &WorkerIdentity) -> bool {
        self.workers.lock().await.contains_key(identity)
    }
}

impl Default for DispatchCache {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ident(db: u32, rel: u32) -> WorkerIdentity {
        WorkerIdentity::new(db, rel)
    }

    #[tokio::test]
    async fn invalidate_drops_exactly_one_entry() {
        let cache = DispatchCache::new();
        cache.insert(ident(1, 10), 100).await;
        cache.insert(ident(1, 11), 101).await;

        cache.invalidate(&ident(1, 10)).await;
        assert!(!cache.contains(&ident(1, 10)).await);
        assert!(cache.contains(&ident(1, 11)).await);

        // Invalidating an absent entry is a no-op.
        cache.invalidate(&ident(9, 9)).await;
        assert_eq!(cache.len().await, 1);
    }

    #[tokio::test]
    async fn sentinel_prunes_a_whole_database() {
        let cache = DispatchCache::new();
        cache.insert(ident(5, 1), 100).await;
        cache.insert(ident(5, 2), 101).await;
        cache.insert(ident(6, 1), 102).await;

        let mut workers = cache.workers.lock().await;
        let sentinel = WorkerIdentity::all_relations(5);
        workers.retain(|cached, _| cached.database_id != sentinel.database_id);
        drop(workers);

        assert!(!cache.contains(&ident(5, 1)).await);
        assert!(!cache.contains(&ident(5, 2)).await);
        assert!(cache.contains(&ident(6, 1)).await);
    }

    #[tokio::test]
    async fn miss_with_dead_manager_caches_nothing() {
        let cache = DispatchCache::new();
        // No manager is listening; open must fail and leave the cache
        // empty so a later attempt can still succeed.
        let result = cache.get_or_create(ident(999_003, 1)).await;
        assert!(result.is_err());
        assert_eq!(cache.len().await, 0);
    }
}
