//! Contracts the queued store consumes.
//!
//! The local key-value store and the remote object importer are external
//! collaborators; both are consumed purely through these traits.

use async_trait::async_trait;

use sourcefs_types::{Blob, Hash, ProxyHash, Tree};

use crate::error::{Result, StoreError};

/// The persistent local key-value store plus its synchronous data-pack view.
///
/// `get_batch` has wholesale failure semantics: either every key resolves
/// (present or absent) or the whole call fails.
#[async_trait]
pub trait LocalStore: Send + Sync {
    /// Batched point lookup. One output slot per input key, in order.
    async fn get_batch(&self, keys: &[Hash]) -> Result<Vec<Option<Vec<u8>>>>;

    /// Synchronous probe of the local data packs for an already-imported
    /// blob. Returns `None` on a cache miss.
    fn get_blob_local(&self, hash: &Hash, proxy: &ProxyHash) -> Option<Blob>;
}

/// The slower remote object fetcher.
///
/// Per-request errors propagate to the caller of the failing request only.
#[async_trait]
pub trait RemoteImporter: Send + Sync {
    /// Fetches a single blob by its source-control-native identity.
    async fn fetch_blob(&self, proxy: &ProxyHash) -> Result<Blob>;

    /// Fetches a single tree. The fetch consults any local cache itself.
    async fn fetch_tree(&self, hash: Hash) -> Result<Tree>;

    /// Bulk cache-warming fetch. Populates the local cache without
    /// returning payloads.
    async fn prefetch(&self, hashes: &[Hash]) -> Result<()>;

    /// Resolves a commit hash to its root tree.
    async fn tree_for_commit(&self, commit: Hash) -> Result<Tree>;

    /// Resolves a commit plus a known manifest hash to the root tree.
    async fn tree_for_manifest(&self, commit: Hash, manifest: Hash) -> Result<Tree>;
}

/// Loads the proxy hash for a single content hash.
///
/// Returns `None` when the local store has no entry for the hash.
pub async fn load_proxy_hash(
    local: &dyn LocalStore,
    hash: Hash,
) -> Result<Option<ProxyHash>> {
    let mut values = local.get_batch(std::slice::from_ref(&hash)).await?;
    match values.pop().flatten() {
        Some(bytes) => {
            let proxy = ProxyHash::decode(&bytes)
                .map_err(|e| StoreError::LocalStore(e.to_string()))?;
            Ok(Some(proxy))
        }
        None => Ok(None),
    }
}

/// Loads proxy hashes for a whole batch of content hashes.
///
/// Fails wholesale: any store error or missing entry fails the entire batch.
/// On success the output pairs with the input index-for-index.
pub async fn load_proxy_hash_batch(
    local: &dyn LocalStore,
    hashes: &[Hash],
) -> Result<Vec<ProxyHash>> {
    let values = local.get_batch(hashes).await?;
    debug_assert_eq!(values.len(), hashes.len());

    let mut proxies = Vec::with_capacity(hashes.len());
    for (hash, value) in hashes.iter().zip(values) {
        let bytes = value.ok_or(StoreError::MissingProxyHash { hash: *hash })?;
        let proxy = ProxyHash::decode(&bytes)
            .map_err(|e| StoreError::LocalStore(e.to_string()))?;
        proxies.push(proxy);
    }
    Ok(proxies)
}
