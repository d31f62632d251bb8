//! Backend-facing storage API: resolves each operation's worker through
//! the dispatch cache, then forwards it over the worker socket.

use crate::client::cache::DispatchCache;
use crate::error::Result;
use crate::identity::WorkerIdentity;
use crate::protocol::OpenArgs;

/// One backend's entry point to the engine. Cheap to create once and
/// hold for the backend's lifetime; the cache inside does the routing.
pub struct KvBackend {
    cache: DispatchCache,
}

impl KvBackend {
    pub fn new() -> Self {
        Self {
            cache: DispatchCache::new(),
        }
    }

    /// Open the relation: makes sure its worker is running and tells it
    /// to open the underlying store.
    pub async fn open(&self, identity: WorkerIdentity, args: OpenArgs) -> Result<()> {
        let worker = self.cache.get_or_create(identity).await?;
        worker.open(args).await
    }

    /// Release this backend's use of the relation. The worker stays up
    /// for other backends; only the cached handle is dropped.
    pub async fn close(&self, identity: WorkerIdentity) -> Result<()> {
        let worker = self.cache.get_or_create(identity).await?;
        worker.close().await?;
        self.cache.invalidate(&identity).await;
        Ok(())
    }

    pub async fn count(&self, identity: WorkerIdentity) -> Result<u64> {
        self.cache.get_or_create(identity).await?.count().await
    }

    pub async fn put(&self, identity: WorkerIdentity, key: Vec<u8>, value: Vec<u8>) -> Result<()> {
        self.cache.get_or_create(identity).await?.put(key, value).await
    }

    pub async fn get(&self, identity: WorkerIdentity, key: Vec<u8>) -> Result<Option<Vec<u8>>> {
        self.cache.get_or_create(identity).await?.get(key).await
    }

    pub async fn delete(&self, identity: WorkerIdentity, key: Vec<u8>) -> Result<bool> {
        self.cache.get_or_create(identity).await?.delete(key).await
    }

    pub async fn load(
        &self,
        identity: WorkerIdentity,
        pairs: Vec<(Vec<u8>, Vec<u8>)>,
    ) -> Result<()> {
        self.cache.get_or_create(identity).await?.load(pairs).await
    }

    pub async fn read_batch(
        &self,
        identity: WorkerIdentity,
        cursor: u64,
        limit: u32,
    ) -> Result<(Vec<(Vec<u8>, Vec<u8>)>, bool)> {
        self.cache
            .get_or_create(identity)
            .await?
            .read_batch(cursor, limit)
            .await
    }

    pub async fn close_cursor(&self, identity: WorkerIdentity, cursor: u64) -> Result<()> {
        self.cache
            .get_or_create(identity)
            .await?
            .close_cursor(cursor)
            .await
    }

    pub async fn range_query(
        &self,
        identity: WorkerIdentity,
        cursor: u64,
        start: Option<Vec<u8>>,
        end: Option<Vec<u8>>,
        limit: u32,
    ) -> Result<(Vec<(Vec<u8>, Vec<u8>)>, bool)> {
        self.cache
            .get_or_create(identity)
            .await?
            .range_query(cursor, start, end, limit)
            .await
    }

    pub async fn clear_range_query(&self, identity: WorkerIdentity, cursor: u64) -> Result<()> {
        self.cache
            .get_or_create(identity)
            .await?
            .clear_range_query(cursor)
            .await
    }

    /// Tear the worker process down for good. Dropping the whole
    /// database's workers goes through the all-relations sentinel.
    pub async fn terminate(&self, identity: WorkerIdentity) -> Result<()> {
        self.cache.terminate(identity).await
    }
}

impl Default for KvBackend {
    fn default() -> Self {
        Self::new()
    }
}
