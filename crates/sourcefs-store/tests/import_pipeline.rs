//! End-to-end tests for the queued store public surface.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::Notify;

use sourcefs_store::{
    ImportObject, LocalStore, QueuedStore, RemoteImporter, RequestStage, Result,
    StoreConfig, StoreError,
};
use sourcefs_types::{Blob, Hash, ImportPriority, ProxyHash, Tree, TreeEntry, TreeEntryKind};

fn hash(n: u8) -> Hash {
    Hash::from_bytes([n; 20])
}

fn proxy(n: u8) -> ProxyHash {
    ProxyHash::new(format!("src/file{n}.rs"), hash(n + 100))
}

#[derive(Default)]
struct FakeLocal {
    proxies: Mutex<HashMap<Hash, ProxyHash>>,
    cached: Mutex<HashSet<Hash>>,
}

impl FakeLocal {
    fn with_proxies(hashes: &[u8]) -> Self {
        let local = FakeLocal::default();
        for &n in hashes {
            local.proxies.lock().insert(hash(n), proxy(n));
        }
        local
    }

    fn cache(&self, n: u8) {
        self.cached.lock().insert(hash(n));
    }
}

#[async_trait]
impl LocalStore for FakeLocal {
    async fn get_batch(&self, keys: &[Hash]) -> Result<Vec<Option<Vec<u8>>>> {
        let proxies = self.proxies.lock();
        Ok(keys
            .iter()
            .map(|k| proxies.get(k).map(ProxyHash::encode))
            .collect())
    }

    fn get_blob_local(&self, hash: &Hash, _proxy: &ProxyHash) -> Option<Blob> {
        self.cached
            .lock()
            .contains(hash)
            .then(|| Blob::new(*hash, b"local".to_vec()))
    }
}

#[derive(Default)]
struct FakeRemote {
    blob_fetches: Mutex<Vec<String>>,
    tree_fetches: Mutex<Vec<Hash>>,
    prefetches: Mutex<Vec<Vec<Hash>>>,
    gate: Option<Arc<Notify>>,
}

#[async_trait]
impl RemoteImporter for FakeRemote {
    async fn fetch_blob(&self, proxy: &ProxyHash) -> Result<Blob> {
        if let Some(gate) = &self.gate {
            gate.notified().await;
        }
        self.blob_fetches.lock().push(proxy.path.clone());
        Ok(Blob::new(proxy.revision, b"remote".to_vec()))
    }

    async fn fetch_tree(&self, id: Hash) -> Result<Tree> {
        self.tree_fetches.lock().push(id);
        Ok(Tree::new(
            id,
            vec![TreeEntry::new("lib.rs", hash(42), TreeEntryKind::File)],
        ))
    }

    async fn prefetch(&self, hashes: &[Hash]) -> Result<()> {
        self.prefetches.lock().push(hashes.to_vec());
        Ok(())
    }

    async fn tree_for_commit(&self, commit: Hash) -> Result<Tree> {
        Ok(Tree::new(commit, Vec::new()))
    }

    async fn tree_for_manifest(&self, _commit: Hash, manifest: Hash) -> Result<Tree> {
        Ok(Tree::new(manifest, Vec::new()))
    }
}

fn store_with(
    runtime: &tokio::runtime::Runtime,
    local: Arc<FakeLocal>,
    remote: Arc<FakeRemote>,
    config: StoreConfig,
) -> QueuedStore {
    QueuedStore::new(local, remote, runtime.handle().clone(), config).unwrap()
}

#[test]
fn test_get_blob_fast_path_skips_queue() {
    let runtime = tokio::runtime::Runtime::new().unwrap();
    let local = Arc::new(FakeLocal::with_proxies(&[1]));
    local.cache(1);
    let remote = Arc::new(FakeRemote::default());
    let store = store_with(&runtime, local, Arc::clone(&remote), StoreConfig::default());

    let blob = runtime
        .block_on(store.get_blob(hash(1), ImportPriority::normal()))
        .unwrap();
    assert_eq!(blob.data(), b"local");
    assert!(remote.blob_fetches.lock().is_empty());
}

#[test]
fn test_get_blob_falls_back_to_remote() {
    let runtime = tokio::runtime::Runtime::new().unwrap();
    let local = Arc::new(FakeLocal::with_proxies(&[1]));
    let remote = Arc::new(FakeRemote::default());
    let store = store_with(&runtime, local, Arc::clone(&remote), StoreConfig::default());

    let blob = runtime
        .block_on(store.get_blob(hash(1), ImportPriority::normal()))
        .unwrap();
    assert_eq!(blob.data(), b"remote");
    assert_eq!(remote.blob_fetches.lock().as_slice(), ["src/file1.rs"]);
}

#[test]
fn test_get_blob_without_proxy_entry_fails() {
    let runtime = tokio::runtime::Runtime::new().unwrap();
    let local = Arc::new(FakeLocal::default());
    let remote = Arc::new(FakeRemote::default());
    let store = store_with(&runtime, local, remote, StoreConfig::default());

    let err = runtime
        .block_on(store.get_blob(hash(1), ImportPriority::normal()))
        .unwrap_err();
    assert!(matches!(err, StoreError::MissingProxyHash { .. }));
}

#[test]
fn test_get_tree_resolves_through_queue() {
    let runtime = tokio::runtime::Runtime::new().unwrap();
    let local = Arc::new(FakeLocal::default());
    let remote = Arc::new(FakeRemote::default());
    let store = store_with(&runtime, local, Arc::clone(&remote), StoreConfig::default());

    let tree = runtime
        .block_on(store.get_tree(hash(5), ImportPriority::High))
        .unwrap();
    assert_eq!(tree.id(), &hash(5));
    assert_eq!(tree.entries().len(), 1);
    assert_eq!(remote.tree_fetches.lock().as_slice(), [hash(5)]);
}

#[test]
fn test_prefetch_passes_hash_list_through() {
    let runtime = tokio::runtime::Runtime::new().unwrap();
    let local = Arc::new(FakeLocal::default());
    let remote = Arc::new(FakeRemote::default());
    let store = store_with(&runtime, local, Arc::clone(&remote), StoreConfig::default());

    runtime
        .block_on(store.prefetch_blobs(vec![hash(1), hash(2)]))
        .unwrap();
    assert_eq!(
        remote.prefetches.lock().as_slice(),
        [vec![hash(1), hash(2)]]
    );
}

#[test]
fn test_concurrent_blob_imports_all_resolve() {
    let runtime = tokio::runtime::Runtime::new().unwrap();
    let local = Arc::new(FakeLocal::with_proxies(&[1, 2, 3, 4, 5, 6, 7, 8]));
    let remote = Arc::new(FakeRemote::default());
    let store = store_with(
        &runtime,
        local,
        Arc::clone(&remote),
        StoreConfig {
            worker_threads: 2,
            batch_size: 4,
        },
    );

    let results = runtime.block_on(async {
        let tasks: Vec<_> = (1..=8u8)
            .map(|n| tokio::spawn(store.get_blob(hash(n), ImportPriority::normal())))
            .collect();
        let mut out = Vec::new();
        for task in tasks {
            out.push(task.await.unwrap());
        }
        out
    });

    assert_eq!(results.len(), 8);
    for result in results {
        assert_eq!(result.unwrap().data(), b"remote");
    }
    assert_eq!(remote.blob_fetches.lock().len(), 8);
}

#[test]
fn test_shutdown_cancels_queued_imports() {
    let runtime = tokio::runtime::Runtime::new().unwrap();
    let gate = Arc::new(Notify::new());
    let local = Arc::new(FakeLocal::with_proxies(&[1, 2]));
    let remote = Arc::new(FakeRemote {
        gate: Some(Arc::clone(&gate)),
        ..FakeRemote::default()
    });
    let store = store_with(
        &runtime,
        local,
        remote,
        StoreConfig {
            worker_threads: 1,
            batch_size: 1,
        },
    );

    // First import occupies the single worker behind the gate; the second
    // sits in the queue, never dequeued.
    let first = runtime.spawn(store.get_blob(hash(1), ImportPriority::normal()));
    std::thread::sleep(Duration::from_millis(50));
    let second = runtime.spawn(store.get_blob(hash(2), ImportPriority::normal()));
    std::thread::sleep(Duration::from_millis(50));

    // Drop stops the queue up front, which cancels the queued import even
    // while the join inside drop is still waiting for the gated worker.
    let dropper = std::thread::spawn(move || drop(store));

    let second = runtime.block_on(second).unwrap();
    assert!(matches!(second, Err(StoreError::ImportCancelled)));

    gate.notify_one();
    let first = runtime.block_on(first).unwrap();
    assert!(first.is_ok());
    dropper.join().unwrap();
}

#[test]
fn test_pending_metric_tracks_queued_imports() {
    let runtime = tokio::runtime::Runtime::new().unwrap();
    let gate = Arc::new(Notify::new());
    let local = Arc::new(FakeLocal::with_proxies(&[1, 2]));
    let remote = Arc::new(FakeRemote {
        gate: Some(Arc::clone(&gate)),
        ..FakeRemote::default()
    });
    let store = store_with(
        &runtime,
        local,
        remote,
        StoreConfig {
            worker_threads: 1,
            batch_size: 2,
        },
    );

    let task = runtime.spawn(store.get_blob(hash(1), ImportPriority::normal()));
    std::thread::sleep(Duration::from_millis(50));

    assert_eq!(store.import_count(RequestStage::Pending, ImportObject::Blob), 1);
    assert_eq!(store.import_count(RequestStage::Live, ImportObject::Blob), 1);
    assert!(
        store.import_max_age(RequestStage::Pending, ImportObject::Blob)
            > Duration::ZERO
    );

    gate.notify_one();
    runtime.block_on(task).unwrap().unwrap();
    assert_eq!(store.import_count(RequestStage::Pending, ImportObject::Blob), 0);
    assert_eq!(store.import_count(RequestStage::Live, ImportObject::Blob), 0);
}

#[test]
fn test_tree_for_commit_bypasses_queue() {
    let runtime = tokio::runtime::Runtime::new().unwrap();
    let local = Arc::new(FakeLocal::default());
    let remote = Arc::new(FakeRemote::default());
    let store = store_with(&runtime, local, remote, StoreConfig::default());

    let tree = runtime.block_on(store.tree_for_commit(hash(9))).unwrap();
    assert_eq!(tree.id(), &hash(9));
    assert_eq!(store.queue_len(), 0);
}
