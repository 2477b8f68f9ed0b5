//! Import watch lists.
//!
//! Every outstanding import registers itself on a watch list keyed by
//! (stage, object kind). A [`RequestMetricsScope`] registers on construction
//! and removes itself on drop, so the lists stay correct on every exit path.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

/// Stage of an import's life an entry is counted under.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RequestStage {
    /// Enqueued but not yet picked up by a worker.
    Pending,
    /// Actively being fetched by a worker.
    Live,
}

/// Object kind an import is fetching.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ImportObject {
    /// File contents.
    Blob,
    /// Directory manifest.
    Tree,
    /// Bulk cache-warming request.
    Prefetch,
}

impl ImportObject {
    fn as_index(self) -> usize {
        match self {
            ImportObject::Blob => 0,
            ImportObject::Tree => 1,
            ImportObject::Prefetch => 2,
        }
    }
}

#[derive(Default)]
struct WatchListInner {
    watches: HashMap<u64, Instant>,
    next_id: u64,
}

/// A shared list of in-flight import start times.
#[derive(Clone, Default)]
pub struct WatchList {
    inner: Arc<Mutex<WatchListInner>>,
}

impl WatchList {
    /// Creates an empty list.
    pub fn new() -> Self {
        WatchList::default()
    }

    fn register(&self, started: Instant) -> u64 {
        let mut inner = self.inner.lock();
        let id = inner.next_id;
        inner.next_id += 1;
        inner.watches.insert(id, started);
        id
    }

    fn deregister(&self, id: u64) {
        self.inner.lock().watches.remove(&id);
    }

    /// Number of outstanding entries.
    pub fn count(&self) -> usize {
        self.inner.lock().watches.len()
    }

    /// Age of the oldest outstanding entry, or zero when empty.
    pub fn max_age(&self, now: Instant) -> Duration {
        self.inner
            .lock()
            .watches
            .values()
            .map(|started| now.saturating_duration_since(*started))
            .max()
            .unwrap_or(Duration::ZERO)
    }
}

/// Scoped membership in a [`WatchList`].
///
/// Registers on construction, deregisters on drop.
pub struct RequestMetricsScope {
    list: WatchList,
    id: u64,
    started: Instant,
}

impl RequestMetricsScope {
    /// Registers a new entry on `list` starting now.
    pub fn new(list: WatchList) -> Self {
        let started = Instant::now();
        let id = list.register(started);
        RequestMetricsScope { list, id, started }
    }

    /// Wall-clock time since this scope was opened.
    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }
}

impl Drop for RequestMetricsScope {
    fn drop(&mut self) {
        self.list.deregister(self.id);
    }
}

/// The six watch lists: {pending, live} x {blob, tree, prefetch}.
#[derive(Clone, Default)]
pub struct ImportMetrics {
    pending: [WatchList; 3],
    live: [WatchList; 3],
}

impl ImportMetrics {
    /// Creates empty watch lists.
    pub fn new() -> Self {
        ImportMetrics::default()
    }

    /// The watch list for a (stage, object) pair.
    pub fn watch_list(&self, stage: RequestStage, object: ImportObject) -> &WatchList {
        match stage {
            RequestStage::Pending => &self.pending[object.as_index()],
            RequestStage::Live => &self.live[object.as_index()],
        }
    }

    /// Opens a scope on the (stage, object) watch list.
    pub fn scope(&self, stage: RequestStage, object: ImportObject) -> RequestMetricsScope {
        RequestMetricsScope::new(self.watch_list(stage, object).clone())
    }

    /// Outstanding count for a (stage, object) pair.
    pub fn count(&self, stage: RequestStage, object: ImportObject) -> usize {
        self.watch_list(stage, object).count()
    }

    /// Oldest outstanding age for a (stage, object) pair.
    pub fn max_age(&self, stage: RequestStage, object: ImportObject) -> Duration {
        self.watch_list(stage, object).max_age(Instant::now())
    }
}
