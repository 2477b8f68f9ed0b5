//! Import requests.
//!
//! A tagged request paired with a single-shot completion sink. Factories
//! return `(request, receiver)` pairs; the receiver is what callers await.
//! Dropping an unfulfilled request closes the sink, which the caller
//! observes as [`StoreError::ImportCancelled`].

use tokio::sync::oneshot;
use tracing::trace;

use sourcefs_types::{Blob, Hash, ImportPriority, Tree};

use crate::error::{Result, StoreError};
use crate::metrics::RequestMetricsScope;

/// Variant tag for queue batching.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ImportKind {
    /// Fetch one blob.
    Blob,
    /// Fetch one tree.
    Tree,
    /// Warm the cache for a list of hashes.
    Prefetch,
}

enum ImportPayload {
    Blob {
        hash: Hash,
        sender: oneshot::Sender<Result<Blob>>,
    },
    Tree {
        hash: Hash,
        sender: oneshot::Sender<Result<Tree>>,
    },
    Prefetch {
        hashes: Vec<Hash>,
        sender: oneshot::Sender<Result<()>>,
    },
}

/// One queued import with its completion sink and pending-stage scope.
pub struct ImportRequest {
    payload: ImportPayload,
    priority: ImportPriority,
    // Held for its Drop: the pending watch entry lives as long as the
    // request does, across queueing and processing.
    _metrics: RequestMetricsScope,
}

impl ImportRequest {
    /// Builds a blob import and the future resolving to its contents.
    pub fn blob(
        hash: Hash,
        priority: ImportPriority,
        metrics: RequestMetricsScope,
    ) -> (Self, oneshot::Receiver<Result<Blob>>) {
        let (sender, receiver) = oneshot::channel();
        let request = ImportRequest {
            payload: ImportPayload::Blob { hash, sender },
            priority,
            _metrics: metrics,
        };
        (request, receiver)
    }

    /// Builds a tree import and the future resolving to the tree.
    pub fn tree(
        hash: Hash,
        priority: ImportPriority,
        metrics: RequestMetricsScope,
    ) -> (Self, oneshot::Receiver<Result<Tree>>) {
        let (sender, receiver) = oneshot::channel();
        let request = ImportRequest {
            payload: ImportPayload::Tree { hash, sender },
            priority,
            _metrics: metrics,
        };
        (request, receiver)
    }

    /// Builds a prefetch request and the future resolving on completion.
    pub fn prefetch(
        hashes: Vec<Hash>,
        priority: ImportPriority,
        metrics: RequestMetricsScope,
    ) -> (Self, oneshot::Receiver<Result<()>>) {
        let (sender, receiver) = oneshot::channel();
        let request = ImportRequest {
            payload: ImportPayload::Prefetch { hashes, sender },
            priority,
            _metrics: metrics,
        };
        (request, receiver)
    }

    /// The variant tag, used for same-kind batching.
    pub fn kind(&self) -> ImportKind {
        match &self.payload {
            ImportPayload::Blob { .. } => ImportKind::Blob,
            ImportPayload::Tree { .. } => ImportKind::Tree,
            ImportPayload::Prefetch { .. } => ImportKind::Prefetch,
        }
    }

    /// Queue priority.
    pub fn priority(&self) -> ImportPriority {
        self.priority
    }

    /// The hash a blob or tree import is fetching.
    ///
    /// Panics on a prefetch request, which carries a hash list instead.
    pub fn hash(&self) -> Hash {
        match &self.payload {
            ImportPayload::Blob { hash, .. } | ImportPayload::Tree { hash, .. } => *hash,
            ImportPayload::Prefetch { .. } => {
                panic!("prefetch requests carry a hash list, not a single hash")
            }
        }
    }

    /// The hash list of a prefetch request.
    pub fn prefetch_hashes(&self) -> Option<&[Hash]> {
        match &self.payload {
            ImportPayload::Prefetch { hashes, .. } => Some(hashes),
            _ => None,
        }
    }

    /// Resolves a blob import. Consumes the request; the sink fires once.
    pub fn fulfill_blob(self, result: Result<Blob>) {
        match self.payload {
            ImportPayload::Blob { hash, sender } => {
                if sender.send(result).is_err() {
                    trace!("blob import caller went away for {hash}");
                }
            }
            _ => unreachable!("fulfill_blob on a non-blob request"),
        }
    }

    /// Resolves a tree import.
    pub fn fulfill_tree(self, result: Result<Tree>) {
        match self.payload {
            ImportPayload::Tree { hash, sender } => {
                if sender.send(result).is_err() {
                    trace!("tree import caller went away for {hash}");
                }
            }
            _ => unreachable!("fulfill_tree on a non-tree request"),
        }
    }

    /// Resolves a prefetch request.
    pub fn fulfill_prefetch(self, result: Result<()>) {
        match self.payload {
            ImportPayload::Prefetch { sender, .. } => {
                if sender.send(result).is_err() {
                    trace!("prefetch caller went away");
                }
            }
            _ => unreachable!("fulfill_prefetch on a non-prefetch request"),
        }
    }
}

/// Maps a closed completion sink to the cancellation error callers see.
pub fn recv_cancelled(err: oneshot::error::RecvError) -> StoreError {
    let _ = err;
    StoreError::ImportCancelled
}
