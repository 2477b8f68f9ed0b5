//! Import priority queue.
//!
//! Multi-producer / multi-consumer. `enqueue` never blocks; `dequeue`
//! blocks until work arrives or the queue is stopped, and returns a batch
//! of requests that all share the head request's variant so downstream
//! processors can amortize their per-batch setup cost.

use std::cmp::Ordering;
use std::collections::BinaryHeap;

use parking_lot::{Condvar, Mutex};
use tracing::debug;

use crate::request::ImportRequest;

struct QueueEntry {
    sequence: u64,
    request: ImportRequest,
}

impl PartialEq for QueueEntry {
    fn eq(&self, other: &Self) -> bool {
        self.sequence == other.sequence
    }
}

impl Eq for QueueEntry {}

impl PartialOrd for QueueEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for QueueEntry {
    // Max-heap: higher priority wins, then lower sequence (FIFO).
    fn cmp(&self, other: &Self) -> Ordering {
        self.request
            .priority()
            .cmp(&other.request.priority())
            .then_with(|| other.sequence.cmp(&self.sequence))
    }
}

#[derive(Default)]
struct QueueState {
    heap: BinaryHeap<QueueEntry>,
    next_sequence: u64,
    stopped: bool,
}

/// The shared import queue.
#[derive(Default)]
pub struct ImportQueue {
    state: Mutex<QueueState>,
    not_empty: Condvar,
}

impl ImportQueue {
    /// Creates an empty queue.
    pub fn new() -> Self {
        ImportQueue::default()
    }

    /// Enqueues a request. Never blocks.
    ///
    /// A request enqueued after `stop` is dropped; its caller observes
    /// cancellation through the completion sink.
    pub fn enqueue(&self, request: ImportRequest) {
        let mut state = self.state.lock();
        if state.stopped {
            debug!("dropping {:?} import enqueued after stop", request.kind());
            return;
        }
        let sequence = state.next_sequence;
        state.next_sequence += 1;
        state.heap.push(QueueEntry { sequence, request });
        drop(state);
        self.not_empty.notify_one();
    }

    /// Dequeues up to `max_batch` requests of one variant.
    ///
    /// Blocks until at least one request is available or the queue has been
    /// stopped. Returns the empty batch only after `stop`, which is the
    /// worker-exit signal. The batch is taken from the head of the priority
    /// order; requests of other variants behind the head remain queued.
    pub fn dequeue(&self, max_batch: usize) -> Vec<ImportRequest> {
        debug_assert!(max_batch >= 1);
        let mut state = self.state.lock();
        loop {
            if !state.heap.is_empty() {
                break;
            }
            if state.stopped {
                return Vec::new();
            }
            self.not_empty.wait(&mut state);
        }

        let head_kind = state
            .heap
            .peek()
            .map(|entry| entry.request.kind())
            .expect("heap is non-empty");

        let mut batch = Vec::with_capacity(max_batch.min(state.heap.len()));
        while batch.len() < max_batch {
            match state.heap.peek() {
                Some(entry) if entry.request.kind() == head_kind => {
                    let entry = state.heap.pop().expect("peeked entry");
                    batch.push(entry.request);
                }
                _ => break,
            }
        }
        batch
    }

    /// Stops the queue: wakes all waiters; subsequent dequeues return empty.
    ///
    /// Requests still queued are dropped, cancelling their callers.
    pub fn stop(&self) {
        let mut state = self.state.lock();
        state.stopped = true;
        state.heap.clear();
        drop(state);
        self.not_empty.notify_all();
    }

    /// Number of queued requests.
    pub fn len(&self) -> usize {
        self.state.lock().heap.len()
    }

    /// Returns true when nothing is queued.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::{ImportMetrics, ImportObject, RequestStage};
    use crate::request::ImportKind;
    use sourcefs_types::{Hash, ImportPriority};
    use std::sync::Arc;
    use std::time::Duration;

    fn hash(n: u8) -> Hash {
        Hash::from_bytes([n; 20])
    }

    fn blob_request(n: u8, priority: ImportPriority) -> ImportRequest {
        let metrics = ImportMetrics::new();
        let (request, _receiver) = ImportRequest::blob(
            hash(n),
            priority,
            metrics.scope(RequestStage::Pending, ImportObject::Blob),
        );
        request
    }

    fn tree_request(n: u8, priority: ImportPriority) -> ImportRequest {
        let metrics = ImportMetrics::new();
        let (request, _receiver) = ImportRequest::tree(
            hash(n),
            priority,
            metrics.scope(RequestStage::Pending, ImportObject::Tree),
        );
        request
    }

    #[test]
    fn test_fifo_within_same_priority() {
        let queue = ImportQueue::new();
        queue.enqueue(blob_request(1, ImportPriority::Normal));
        queue.enqueue(blob_request(2, ImportPriority::Normal));
        queue.enqueue(blob_request(3, ImportPriority::Normal));

        let batch = queue.dequeue(3);
        let hashes: Vec<Hash> = batch.iter().map(|r| r.hash()).collect();
        assert_eq!(hashes, vec![hash(1), hash(2), hash(3)]);
    }

    #[test]
    fn test_higher_priority_dequeued_first() {
        let queue = ImportQueue::new();
        queue.enqueue(blob_request(1, ImportPriority::Low));
        queue.enqueue(blob_request(2, ImportPriority::High));
        queue.enqueue(blob_request(3, ImportPriority::Normal));

        let batch = queue.dequeue(3);
        let hashes: Vec<Hash> = batch.iter().map(|r| r.hash()).collect();
        assert_eq!(hashes, vec![hash(2), hash(3), hash(1)]);
    }

    #[test]
    fn test_batch_is_variant_homogeneous() {
        let queue = ImportQueue::new();
        queue.enqueue(blob_request(1, ImportPriority::Normal));
        queue.enqueue(tree_request(2, ImportPriority::Normal));
        queue.enqueue(blob_request(3, ImportPriority::Normal));

        let first = queue.dequeue(10);
        assert_eq!(first.len(), 1);
        assert_eq!(first[0].kind(), ImportKind::Blob);

        let second = queue.dequeue(10);
        assert_eq!(second.len(), 1);
        assert_eq!(second[0].kind(), ImportKind::Tree);

        let third = queue.dequeue(10);
        assert_eq!(third.len(), 1);
        assert_eq!(third[0].kind(), ImportKind::Blob);
    }

    #[test]
    fn test_batch_respects_max_size() {
        let queue = ImportQueue::new();
        for n in 1..=5 {
            queue.enqueue(blob_request(n, ImportPriority::Normal));
        }

        let batch = queue.dequeue(2);
        assert_eq!(batch.len(), 2);
        assert_eq!(queue.len(), 3);
    }

    #[test]
    fn test_dequeue_after_stop_returns_empty() {
        let queue = ImportQueue::new();
        queue.stop();
        assert!(queue.dequeue(4).is_empty());
    }

    #[test]
    fn test_stop_wakes_blocked_consumer() {
        let queue = Arc::new(ImportQueue::new());
        let consumer = {
            let queue = Arc::clone(&queue);
            std::thread::spawn(move || queue.dequeue(1))
        };

        std::thread::sleep(Duration::from_millis(20));
        queue.stop();

        let batch = consumer.join().unwrap();
        assert!(batch.is_empty());
    }

    #[test]
    fn test_enqueue_wakes_blocked_consumer() {
        let queue = Arc::new(ImportQueue::new());
        let consumer = {
            let queue = Arc::clone(&queue);
            std::thread::spawn(move || queue.dequeue(1))
        };

        std::thread::sleep(Duration::from_millis(20));
        queue.enqueue(blob_request(9, ImportPriority::Normal));

        let batch = consumer.join().unwrap();
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].hash(), hash(9));
    }

    #[test]
    fn test_enqueue_after_stop_is_dropped() {
        let queue = ImportQueue::new();
        queue.stop();
        queue.enqueue(blob_request(1, ImportPriority::Normal));
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn test_stop_cancels_queued_requests() {
        let queue = ImportQueue::new();
        let metrics = ImportMetrics::new();
        let (request, receiver) = ImportRequest::blob(
            hash(1),
            ImportPriority::Normal,
            metrics.scope(RequestStage::Pending, ImportObject::Blob),
        );
        queue.enqueue(request);
        queue.stop();

        assert!(receiver.await.is_err());
    }
}
