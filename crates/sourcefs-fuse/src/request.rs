//! In-flight request bookkeeping.
//!
//! Every decoded request installs a cancellation context keyed by its
//! kernel-assigned `unique` id. The registry holds weak references; the
//! strong owner is the handler task, so a finished request cannot leak
//! through the registry. Kernel INTERRUPT flips the context's flag and
//! dispatchers observe it cooperatively.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tokio::sync::Notify;
use tracing::trace;

use crate::dispatcher::Errno;
use crate::error::{ChannelError, Result};
use crate::proto::InHeader;

/// Cancellation state shared between the registry and the handler task.
pub struct RequestContext {
    header: InHeader,
    interrupted: AtomicBool,
    notify: Notify,
}

impl RequestContext {
    pub(crate) fn new(header: InHeader) -> Self {
        RequestContext {
            header,
            interrupted: AtomicBool::new(false),
            notify: Notify::new(),
        }
    }

    /// Marks the request interrupted and wakes cooperative waiters.
    /// Idempotent; a lost race with the reply path is harmless.
    pub fn interrupt(&self) {
        self.interrupted.store(true, Ordering::Release);
        // notify_one stores a permit, so a waiter that registers after
        // this call still wakes; notify_waiters covers everyone already
        // parked.
        self.notify.notify_one();
        self.notify.notify_waiters();
    }

    /// Returns true once the kernel has interrupted this request.
    pub fn is_interrupted(&self) -> bool {
        self.interrupted.load(Ordering::Acquire)
    }
}

/// Per-request view handed to the dispatcher: requesting process identity
/// plus the cooperative cancellation surface.
#[derive(Clone)]
pub struct RequestInfo {
    context: Arc<RequestContext>,
}

impl RequestInfo {
    pub(crate) fn new(context: Arc<RequestContext>) -> Self {
        RequestInfo { context }
    }

    /// Kernel-assigned request id.
    pub fn unique(&self) -> u64 {
        self.context.header.unique
    }

    /// Inode the request targets.
    pub fn nodeid(&self) -> u64 {
        self.context.header.nodeid
    }

    /// Uid of the requesting process.
    pub fn uid(&self) -> u32 {
        self.context.header.uid
    }

    /// Gid of the requesting process.
    pub fn gid(&self) -> u32 {
        self.context.header.gid
    }

    /// Pid of the requesting process.
    pub fn pid(&self) -> u32 {
        self.context.header.pid
    }

    /// Returns true once the kernel has interrupted this request.
    pub fn is_interrupted(&self) -> bool {
        self.context.is_interrupted()
    }

    /// Cooperative cancellation check: `EINTR` once interrupted.
    pub fn check_interrupted(&self) -> std::result::Result<(), Errno> {
        if self.is_interrupted() {
            Err(Errno(libc::EINTR))
        } else {
            Ok(())
        }
    }

    /// Resolves when the request is interrupted. Long-running dispatcher
    /// work can race this against its own future.
    pub async fn interrupted(&self) {
        while !self.is_interrupted() {
            self.context.notify.notified().await;
        }
    }

    pub(crate) fn context(&self) -> &Arc<RequestContext> {
        &self.context
    }
}

/// Concurrent map of `unique` id to live cancellation handle.
#[derive(Default)]
pub(crate) struct RequestRegistry {
    requests: Mutex<HashMap<u64, Weak<RequestContext>>>,
}

impl RequestRegistry {
    pub fn new() -> Self {
        RequestRegistry::default()
    }

    /// Installs a request. A duplicate `unique` is a protocol violation;
    /// the kernel never reuses an id while the request is outstanding.
    pub fn insert(&self, unique: u64, context: &Arc<RequestContext>) -> Result<()> {
        let mut requests = self.requests.lock();
        if requests.contains_key(&unique) {
            return Err(ChannelError::ProtocolViolation(format!(
                "duplicate request id {unique}"
            )));
        }
        requests.insert(unique, Arc::downgrade(context));
        Ok(())
    }

    /// Removes a finished request. Returns true when the registry became
    /// empty, which the channel uses to drive the session-complete signal.
    pub fn finish(&self, unique: u64) -> bool {
        let mut requests = self.requests.lock();
        requests.remove(&unique);
        requests.is_empty()
    }

    /// Interrupts the request with the given id, if it is still live.
    pub fn interrupt(&self, unique: u64) -> bool {
        let requests = self.requests.lock();
        match requests.get(&unique).and_then(Weak::upgrade) {
            Some(context) => {
                context.interrupt();
                true
            }
            None => {
                trace!("interrupt for unknown or finished request {unique}");
                false
            }
        }
    }

    /// Interrupts every live request; used while draining the session.
    pub fn interrupt_all(&self) {
        let requests = self.requests.lock();
        for context in requests.values().filter_map(Weak::upgrade) {
            context.interrupt();
        }
    }

    /// Number of live requests.
    pub fn len(&self) -> usize {
        self.requests.lock().len()
    }

    /// Returns true when no requests are live.
    pub fn is_empty(&self) -> bool {
        self.requests.lock().is_empty()
    }
}
