//! The queued store.
//!
//! Spawns a pool of import workers draining the shared priority queue.
//! Blob batches run the two-tier pipeline: one batched proxy-hash lookup,
//! a synchronous local-cache pass, then a concurrent remote fan-out joined
//! before the worker moves on. Tree and prefetch batches delegate to the
//! remote importer per request.

use std::future::Future;
use std::sync::Arc;
use std::thread;
use std::time::Instant;

use serde::{Deserialize, Serialize};
use tokio::runtime::Handle;
use tokio::task::JoinSet;
use tracing::{debug, error, trace, warn};

use sourcefs_types::{Blob, Hash, ImportPriority, Tree};

use crate::error::{Result, StoreError};
use crate::metrics::{ImportMetrics, ImportObject, RequestStage};
use crate::queue::ImportQueue;
use crate::request::{recv_cancelled, ImportKind, ImportRequest};
use crate::store::{load_proxy_hash, load_proxy_hash_batch, LocalStore, RemoteImporter};

/// Configuration for the queued store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Number of import worker threads.
    pub worker_threads: usize,
    /// Number of requests per import batch.
    pub batch_size: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        StoreConfig {
            worker_threads: 4,
            batch_size: 1,
        }
    }
}

/// Validates a store configuration.
pub fn validate_config(config: &StoreConfig) -> Result<()> {
    if config.worker_threads == 0 {
        return Err(StoreError::InvalidConfig(
            "worker_threads must be >= 1".to_string(),
        ));
    }
    if config.batch_size == 0 {
        return Err(StoreError::InvalidConfig(
            "batch_size must be >= 1".to_string(),
        ));
    }
    Ok(())
}

struct StoreInner {
    local: Arc<dyn LocalStore>,
    remote: Arc<dyn RemoteImporter>,
    runtime: Handle,
    queue: ImportQueue,
    metrics: ImportMetrics,
    batch_size: usize,
}

/// Content-addressed object store front end that batches and deduplicates
/// fetch work behind a priority queue.
pub struct QueuedStore {
    inner: Arc<StoreInner>,
    workers: Vec<thread::JoinHandle<()>>,
}

impl QueuedStore {
    /// Spawns the worker pool and returns the store.
    pub fn new(
        local: Arc<dyn LocalStore>,
        remote: Arc<dyn RemoteImporter>,
        runtime: Handle,
        config: StoreConfig,
    ) -> Result<Self> {
        validate_config(&config)?;

        let inner = Arc::new(StoreInner {
            local,
            remote,
            runtime,
            queue: ImportQueue::new(),
            metrics: ImportMetrics::new(),
            batch_size: config.batch_size,
        });

        let mut workers = Vec::with_capacity(config.worker_threads);
        for i in 0..config.worker_threads {
            let inner = Arc::clone(&inner);
            let handle = thread::Builder::new()
                .name(format!("import-worker-{i}"))
                .spawn(move || worker_loop(inner))?;
            workers.push(handle);
        }

        Ok(QueuedStore { inner, workers })
    }

    /// Fetches a blob, preferring the local data packs.
    ///
    /// The fast path probes the local cache with a freshly loaded proxy
    /// hash and skips the queue entirely on a hit. The returned future
    /// does not borrow the store; it outlives the call and resolves with
    /// [`StoreError::ImportCancelled`] if the store shuts down first.
    pub fn get_blob(
        &self,
        id: Hash,
        priority: ImportPriority,
    ) -> impl Future<Output = Result<Blob>> + Send + 'static {
        let inner = Arc::clone(&self.inner);
        async move {
            if let Ok(Some(proxy)) = load_proxy_hash(&*inner.local, id).await {
                if let Some(blob) = inner.local.get_blob_local(&id, &proxy) {
                    trace!("blob {id} served from local cache without queueing");
                    return Ok(blob);
                }
            }

            let scope = inner
                .metrics
                .scope(RequestStage::Pending, ImportObject::Blob);
            let (request, receiver) = ImportRequest::blob(id, priority, scope);
            inner.queue.enqueue(request);
            receiver.await.map_err(recv_cancelled)?
        }
    }

    /// Fetches a tree through the import queue.
    pub fn get_tree(
        &self,
        id: Hash,
        priority: ImportPriority,
    ) -> impl Future<Output = Result<Tree>> + Send + 'static {
        let inner = Arc::clone(&self.inner);
        async move {
            let scope = inner
                .metrics
                .scope(RequestStage::Pending, ImportObject::Tree);
            let (request, receiver) = ImportRequest::tree(id, priority, scope);
            inner.queue.enqueue(request);
            receiver.await.map_err(recv_cancelled)?
        }
    }

    /// Warms the local cache for a set of blobs.
    pub fn prefetch_blobs(
        &self,
        ids: Vec<Hash>,
    ) -> impl Future<Output = Result<()>> + Send + 'static {
        let inner = Arc::clone(&self.inner);
        async move {
            let scope = inner
                .metrics
                .scope(RequestStage::Pending, ImportObject::Prefetch);
            let (request, receiver) =
                ImportRequest::prefetch(ids, ImportPriority::normal(), scope);
            inner.queue.enqueue(request);
            receiver.await.map_err(recv_cancelled)?
        }
    }

    /// Resolves a commit hash to its root tree. Bypasses the queue.
    pub async fn tree_for_commit(&self, commit: Hash) -> Result<Tree> {
        self.inner.remote.tree_for_commit(commit).await
    }

    /// Resolves a commit plus manifest hash to the root tree. Bypasses the
    /// queue.
    pub async fn tree_for_manifest(&self, commit: Hash, manifest: Hash) -> Result<Tree> {
        self.inner.remote.tree_for_manifest(commit, manifest).await
    }

    /// Outstanding import count for a (stage, object) pair.
    pub fn import_count(&self, stage: RequestStage, object: ImportObject) -> usize {
        self.inner.metrics.count(stage, object)
    }

    /// Oldest outstanding import age for a (stage, object) pair.
    pub fn import_max_age(
        &self,
        stage: RequestStage,
        object: ImportObject,
    ) -> std::time::Duration {
        self.inner.metrics.max_age(stage, object)
    }

    /// Number of requests waiting in the queue.
    pub fn queue_len(&self) -> usize {
        self.inner.queue.len()
    }
}

impl Drop for QueuedStore {
    fn drop(&mut self) {
        self.inner.queue.stop();
        for worker in self.workers.drain(..) {
            if worker.join().is_err() {
                error!("import worker panicked during shutdown");
            }
        }
    }
}

fn worker_loop(inner: Arc<StoreInner>) {
    loop {
        let batch = inner.queue.dequeue(inner.batch_size);
        if batch.is_empty() {
            break;
        }
        match batch[0].kind() {
            ImportKind::Blob => process_blob_batch(&inner, batch),
            ImportKind::Tree => process_tree_batch(&inner, batch),
            ImportKind::Prefetch => process_prefetch_batch(&inner, batch),
        }
    }
    debug!("import worker exiting");
}

fn process_blob_batch(inner: &Arc<StoreInner>, mut requests: Vec<ImportRequest>) {
    let watch = Instant::now();
    let hashes: Vec<Hash> = requests.iter().map(|r| r.hash()).collect();
    debug!(batch = requests.len(), "processing blob import batch");

    let mut proxies = match inner
        .runtime
        .block_on(load_proxy_hash_batch(&*inner.local, &hashes))
    {
        Ok(proxies) => proxies,
        Err(err) => {
            warn!("failed to get proxy hashes: {err}");
            for request in requests {
                request.fulfill_blob(Err(err.duplicate()));
            }
            return;
        }
    };

    // Local-cache pass. Fulfilled requests are removed by swap-and-pop
    // from both vectors in lockstep so index pairing survives.
    assert_eq!(requests.len(), proxies.len());
    let mut cache_hits = 0usize;
    let mut index = 0;
    while index < requests.len() {
        let hash = requests[index].hash();
        if let Some(blob) = inner.local.get_blob_local(&hash, &proxies[index]) {
            trace!("imported blob from local cache for {hash}");
            let request = requests.swap_remove(index);
            proxies.swap_remove(index);
            request.fulfill_blob(Ok(blob));
            cache_hits += 1;
        } else {
            index += 1;
        }
    }
    debug!(
        cache_hits,
        remaining = requests.len(),
        elapsed_ms = watch.elapsed().as_millis() as u64,
        "local cache pass complete"
    );

    // Remote pass: fan out and join before the worker continues.
    assert_eq!(requests.len(), proxies.len());
    if requests.is_empty() {
        return;
    }

    let mut fetches = JoinSet::new();
    for (request, proxy) in requests.into_iter().zip(proxies) {
        let remote = Arc::clone(&inner.remote);
        let live = inner
            .metrics
            .scope(RequestStage::Live, ImportObject::Blob);
        fetches.spawn_on(
            async move {
                let hash = request.hash();
                let result = remote.fetch_blob(&proxy).await;
                trace!("imported blob from remote for {hash}");
                drop(live);
                request.fulfill_blob(result);
            },
            &inner.runtime,
        );
    }
    inner.runtime.block_on(async {
        while let Some(joined) = fetches.join_next().await {
            if let Err(err) = joined {
                error!("blob import task failed to join: {err}");
            }
        }
    });
}

fn process_tree_batch(inner: &Arc<StoreInner>, requests: Vec<ImportRequest>) {
    debug!(batch = requests.len(), "processing tree import batch");
    for request in requests {
        let hash = request.hash();
        let live = inner
            .metrics
            .scope(RequestStage::Live, ImportObject::Tree);
        let result = inner.runtime.block_on(inner.remote.fetch_tree(hash));
        drop(live);
        request.fulfill_tree(result);
    }
}

fn process_prefetch_batch(inner: &Arc<StoreInner>, requests: Vec<ImportRequest>) {
    debug!(batch = requests.len(), "processing prefetch batch");
    for request in requests {
        let hashes = request
            .prefetch_hashes()
            .expect("prefetch batch carries prefetch requests")
            .to_vec();
        let live = inner
            .metrics
            .scope(RequestStage::Live, ImportObject::Prefetch);
        let result = inner.runtime.block_on(inner.remote.prefetch(&hashes));
        drop(live);
        request.fulfill_prefetch(result);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use sourcefs_types::ProxyHash;
    use std::collections::{HashMap, HashSet};

    struct FakeLocal {
        proxies: HashMap<Hash, ProxyHash>,
        cached: HashSet<Hash>,
        fail_batch: bool,
    }

    #[async_trait]
    impl LocalStore for FakeLocal {
        async fn get_batch(&self, keys: &[Hash]) -> Result<Vec<Option<Vec<u8>>>> {
            if self.fail_batch {
                return Err(StoreError::LocalStore("store offline".to_string()));
            }
            Ok(keys
                .iter()
                .map(|k| self.proxies.get(k).map(ProxyHash::encode))
                .collect())
        }

        fn get_blob_local(&self, hash: &Hash, _proxy: &ProxyHash) -> Option<Blob> {
            self.cached
                .contains(hash)
                .then(|| Blob::new(*hash, format!("cached-{hash}").into_bytes()))
        }
    }

    #[derive(Default)]
    struct FakeRemote {
        fetched: Mutex<Vec<ProxyHash>>,
    }

    #[async_trait]
    impl RemoteImporter for FakeRemote {
        async fn fetch_blob(&self, proxy: &ProxyHash) -> Result<Blob> {
            self.fetched.lock().push(proxy.clone());
            Ok(Blob::new(
                proxy.revision,
                format!("remote-{}", proxy.path).into_bytes(),
            ))
        }

        async fn fetch_tree(&self, hash: Hash) -> Result<Tree> {
            Ok(Tree::new(hash, Vec::new()))
        }

        async fn prefetch(&self, _hashes: &[Hash]) -> Result<()> {
            Ok(())
        }

        async fn tree_for_commit(&self, commit: Hash) -> Result<Tree> {
            Ok(Tree::new(commit, Vec::new()))
        }

        async fn tree_for_manifest(&self, _commit: Hash, manifest: Hash) -> Result<Tree> {
            Ok(Tree::new(manifest, Vec::new()))
        }
    }

    fn hash(n: u8) -> Hash {
        Hash::from_bytes([n; 20])
    }

    fn proxy(n: u8) -> ProxyHash {
        ProxyHash::new(format!("path/{n}"), hash(n + 100))
    }

    fn test_inner(
        runtime: &tokio::runtime::Runtime,
        local: FakeLocal,
        remote: Arc<FakeRemote>,
    ) -> Arc<StoreInner> {
        Arc::new(StoreInner {
            local: Arc::new(local),
            remote,
            runtime: runtime.handle().clone(),
            queue: ImportQueue::new(),
            metrics: ImportMetrics::new(),
            batch_size: 3,
        })
    }

    fn blob_request(
        inner: &Arc<StoreInner>,
        n: u8,
    ) -> (ImportRequest, tokio::sync::oneshot::Receiver<Result<Blob>>) {
        let scope = inner
            .metrics
            .scope(RequestStage::Pending, ImportObject::Blob);
        ImportRequest::blob(hash(n), ImportPriority::normal(), scope)
    }

    #[test]
    fn test_blob_batch_partial_cache_hit() {
        let runtime = tokio::runtime::Runtime::new().unwrap();
        let local = FakeLocal {
            proxies: [(hash(1), proxy(1)), (hash(2), proxy(2)), (hash(3), proxy(3))]
                .into_iter()
                .collect(),
            cached: [hash(2)].into_iter().collect(),
            fail_batch: false,
        };
        let remote = Arc::new(FakeRemote::default());
        let inner = test_inner(&runtime, local, Arc::clone(&remote));

        let (r1, f1) = blob_request(&inner, 1);
        let (r2, f2) = blob_request(&inner, 2);
        let (r3, f3) = blob_request(&inner, 3);

        process_blob_batch(&inner, vec![r1, r2, r3]);

        let b1 = runtime.block_on(f1).unwrap().unwrap();
        let b2 = runtime.block_on(f2).unwrap().unwrap();
        let b3 = runtime.block_on(f3).unwrap().unwrap();

        assert_eq!(b2.data(), format!("cached-{}", hash(2)).as_bytes());
        assert_eq!(b1.data(), b"remote-path/1");
        assert_eq!(b3.data(), b"remote-path/3");

        let fetched = remote.fetched.lock();
        assert_eq!(fetched.len(), 2);
        assert!(!fetched.iter().any(|p| p.path == "path/2"));
    }

    #[test]
    fn test_blob_batch_wholesale_proxy_failure() {
        let runtime = tokio::runtime::Runtime::new().unwrap();
        let local = FakeLocal {
            proxies: HashMap::new(),
            cached: HashSet::new(),
            fail_batch: true,
        };
        let remote = Arc::new(FakeRemote::default());
        let inner = test_inner(&runtime, local, Arc::clone(&remote));

        let (r1, f1) = blob_request(&inner, 1);
        let (r2, f2) = blob_request(&inner, 2);

        process_blob_batch(&inner, vec![r1, r2]);

        let e1 = runtime.block_on(f1).unwrap().unwrap_err();
        let e2 = runtime.block_on(f2).unwrap().unwrap_err();
        assert_eq!(e1.to_string(), e2.to_string());
        assert!(remote.fetched.lock().is_empty());
    }

    #[test]
    fn test_blob_batch_missing_proxy_fails_wholesale() {
        let runtime = tokio::runtime::Runtime::new().unwrap();
        let local = FakeLocal {
            proxies: [(hash(1), proxy(1))].into_iter().collect(),
            cached: HashSet::new(),
            fail_batch: false,
        };
        let remote = Arc::new(FakeRemote::default());
        let inner = test_inner(&runtime, local, Arc::clone(&remote));

        let (r1, f1) = blob_request(&inner, 1);
        let (r2, f2) = blob_request(&inner, 2);

        process_blob_batch(&inner, vec![r1, r2]);

        assert!(runtime.block_on(f1).unwrap().is_err());
        assert!(runtime.block_on(f2).unwrap().is_err());
    }

    #[test]
    fn test_default_config() {
        let config = StoreConfig::default();
        assert_eq!(config.worker_threads, 4);
        assert_eq!(config.batch_size, 1);
    }

    #[test]
    fn test_validate_rejects_zero_workers() {
        let config = StoreConfig {
            worker_threads: 0,
            batch_size: 1,
        };
        assert!(validate_config(&config).is_err());
    }

    #[test]
    fn test_validate_rejects_zero_batch() {
        let config = StoreConfig {
            worker_threads: 1,
            batch_size: 0,
        };
        assert!(validate_config(&config).is_err());
    }

    #[test]
    fn test_validate_accepts_defaults() {
        assert!(validate_config(&StoreConfig::default()).is_ok());
    }
}
