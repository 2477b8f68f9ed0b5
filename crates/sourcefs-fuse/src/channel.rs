//! The FUSE kernel channel.
//!
//! Owns the device descriptor and a pool of symmetric worker threads, each
//! looping: one blocking read, decode, dispatch on the runtime, one gathered
//! write for the reply. Initialization runs a single worker that performs
//! the INIT handshake before the rest of the pool starts; takeover skips the
//! handshake entirely. `steal` hands the descriptor to a successor process
//! for graceful restart.

use std::collections::HashSet;
use std::ffi::OsStr;
use std::io::{self, IoSlice};
use std::mem;
use std::os::fd::{FromRawFd, IntoRawFd, OwnedFd, RawFd};
use std::os::unix::ffi::OsStrExt;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;

use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio::sync::oneshot;
use tracing::{debug, error, info, trace, warn};

use crate::conn::{negotiate, validate_config, ChannelConfig, ConnInfo};
use crate::dispatcher::Dispatcher;
use crate::error::{ChannelError, Result};
use crate::handlers::{handler_for, ReplyBody};
use crate::proto::{self, struct_bytes, InHeader};
use crate::request::{RequestContext, RequestInfo, RequestRegistry};

/// The device descriptor and negotiated state extracted by [`FuseChannel::steal`],
/// handed out-of-band to a successor process during graceful restart.
pub struct TakenDevice {
    /// The still-open kernel device descriptor.
    pub device: OwnedFd,
    /// The connection state the successor resumes with.
    pub conn: ConnInfo,
}

/// Raw-fd device wrapper. `steal` clears ownership so teardown no longer
/// closes the descriptor; worker threads keep using the raw fd either way,
/// exactly like the session they are resuming or handing off.
struct FuseDevice {
    fd: RawFd,
    owned: AtomicBool,
}

impl FuseDevice {
    fn new(fd: OwnedFd) -> Self {
        FuseDevice {
            fd: fd.into_raw_fd(),
            owned: AtomicBool::new(true),
        }
    }

    fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        let n = unsafe { libc::read(self.fd, buf.as_mut_ptr().cast(), buf.len()) };
        if n < 0 {
            Err(io::Error::last_os_error())
        } else {
            Ok(n as usize)
        }
    }

    /// One writev call; the kernel requires each reply to be a single
    /// gathered write.
    fn write_vectored(&self, iov: &[IoSlice<'_>]) -> io::Result<usize> {
        // IoSlice is ABI-compatible with iovec.
        let n = unsafe {
            libc::writev(self.fd, iov.as_ptr().cast(), iov.len() as libc::c_int)
        };
        if n < 0 {
            Err(io::Error::last_os_error())
        } else {
            Ok(n as usize)
        }
    }

    fn steal(&self) -> Option<OwnedFd> {
        if self.owned.swap(false, Ordering::AcqRel) {
            Some(unsafe { OwnedFd::from_raw_fd(self.fd) })
        } else {
            None
        }
    }
}

impl Drop for FuseDevice {
    fn drop(&mut self) {
        if self.owned.load(Ordering::Acquire) {
            unsafe {
                libc::close(self.fd);
            }
        }
    }
}

#[derive(Default)]
struct ChannelState {
    conn: Option<ConnInfo>,
    workers: Vec<thread::JoinHandle<()>>,
    stopped_threads: usize,
    init_started: bool,
    init_succeeded: bool,
    init_tx: Option<oneshot::Sender<Result<()>>>,
    complete_tx: Option<oneshot::Sender<()>>,
}

struct ChannelInner {
    device: FuseDevice,
    mount_path: PathBuf,
    runtime: Handle,
    dispatcher: Arc<dyn Dispatcher>,
    config: ChannelConfig,
    buffer_size: usize,
    session_finished: AtomicBool,
    registry: RequestRegistry,
    state: Mutex<ChannelState>,
    unknown_opcodes: Mutex<HashSet<u32>>,
}

/// Owner of the kernel device descriptor and its worker pool.
pub struct FuseChannel {
    inner: Arc<ChannelInner>,
    complete_rx: Mutex<Option<oneshot::Receiver<()>>>,
}

impl FuseChannel {
    /// Creates the channel over an already-mounted device descriptor.
    ///
    /// Follow up with [`initialize`](Self::initialize) for a fresh mount or
    /// [`initialize_from_takeover`](Self::initialize_from_takeover) when
    /// resuming a negotiated session.
    pub fn new(
        device: OwnedFd,
        mount_path: PathBuf,
        runtime: Handle,
        dispatcher: Arc<dyn Dispatcher>,
        config: ChannelConfig,
    ) -> Result<Self> {
        validate_config(&config)?;

        let buffer_size =
            (config.max_write as usize).max(proto::MIN_READ_BUFFER) + proto::HEADER_ROOM;
        let (complete_tx, complete_rx) = oneshot::channel();

        info!(
            mount = %mount_path.display(),
            workers = config.worker_threads,
            "creating fuse channel"
        );

        let inner = Arc::new(ChannelInner {
            device: FuseDevice::new(device),
            mount_path,
            runtime,
            dispatcher,
            config,
            buffer_size,
            session_finished: AtomicBool::new(false),
            registry: RequestRegistry::new(),
            state: Mutex::new(ChannelState {
                complete_tx: Some(complete_tx),
                ..Default::default()
            }),
            unknown_opcodes: Mutex::new(HashSet::new()),
        });

        Ok(FuseChannel {
            inner,
            complete_rx: Mutex::new(Some(complete_rx)),
        })
    }

    /// Starts the INIT handshake.
    ///
    /// One worker waits for the kernel's INIT request and negotiates; once
    /// that succeeds the remaining workers start and the returned future
    /// completes (on one of the worker threads). Until then no other
    /// request is serviced.
    pub fn initialize(&self) -> Result<oneshot::Receiver<Result<()>>> {
        let (init_tx, init_rx) = oneshot::channel();
        {
            let mut state = self.inner.state.lock();
            if state.init_started {
                return Err(ChannelError::AlreadyInitialized);
            }
            state.init_started = true;
            state.init_tx = Some(init_tx);
        }

        let inner = Arc::clone(&self.inner);
        let handle = thread::Builder::new()
            .name("fuse-init".to_string())
            .spawn(move || init_worker(inner))?;
        self.inner.state.lock().workers.push(handle);

        Ok(init_rx)
    }

    /// Resumes an already-negotiated session (graceful restart takeover).
    ///
    /// Stores the handed-over connection info and immediately starts all
    /// workers; no INIT exchange happens. Like the INIT path, a session
    /// that dies before any worker starts surfaces through the returned
    /// error rather than the session-complete signal.
    pub fn initialize_from_takeover(&self, conn: ConnInfo) -> Result<()> {
        {
            let mut state = self.inner.state.lock();
            if state.init_started {
                return Err(ChannelError::AlreadyInitialized);
            }
            state.init_started = true;
            state.init_succeeded = true;
            state.conn = Some(conn);
        }
        info!(
            mount = %self.inner.mount_path.display(),
            minor = conn.minor,
            "taking over initialized fuse session"
        );

        notify_dispatcher_initialized(&self.inner);
        for _ in 0..self.inner.config.worker_threads {
            spawn_session_worker(&self.inner)?;
        }
        Ok(())
    }

    /// The session-complete future: resolves once initialization succeeded,
    /// every worker has stopped, and no request is in flight. Errors when
    /// taken more than once.
    pub fn session_complete_future(&self) -> Result<oneshot::Receiver<()>> {
        self.complete_rx
            .lock()
            .take()
            .ok_or(ChannelError::CompleteFutureTaken)
    }

    /// Asks the worker pool to stop after their current request.
    ///
    /// Workers parked in the device read return once the kernel delivers
    /// another request or tears the mount down. Live requests are
    /// interrupted so cooperative dispatchers unwind promptly.
    pub fn request_session_exit(&self) {
        self.inner.request_session_exit();
    }

    /// Stops request processing in preparation for handing the device to a
    /// successor process.
    pub fn takeover_stop(&self) {
        self.request_session_exit();
    }

    /// Extracts the device descriptor for graceful restart.
    ///
    /// After this the channel's teardown no longer closes the descriptor.
    /// Must not race the channel's drop; that synchronization is the
    /// caller's obligation.
    pub fn steal(&self) -> Result<TakenDevice> {
        let conn = {
            let state = self.inner.state.lock();
            state.conn.ok_or(ChannelError::NotInitialized)?
        };
        self.inner.request_session_exit();
        let device = self.inner.device.steal().ok_or(ChannelError::DeviceStolen)?;
        info!(
            mount = %self.inner.mount_path.display(),
            "fuse device stolen for takeover"
        );
        Ok(TakenDevice { device, conn })
    }

    /// Tells the kernel to drop cached data for an inode.
    ///
    /// A negative `off` invalidates attributes only; otherwise the byte
    /// range `[off, off + len)` is dropped (`len == 0` meaning everything).
    pub fn invalidate_inode(&self, ino: u64, off: i64, len: i64) -> Result<()> {
        let out = proto::NotifyInvalInodeOut { ino, off, len };
        self.inner
            .write_notify(proto::FUSE_NOTIFY_INVAL_INODE, &[struct_bytes(&out)])
    }

    /// Tells the kernel to drop the dentry `name` under `parent`.
    pub fn invalidate_entry(&self, parent: u64, name: &OsStr) -> Result<()> {
        let bytes = name.as_bytes();
        // The name is NUL-terminated on the wire; namelen excludes the NUL.
        let mut wire_name = Vec::with_capacity(bytes.len() + 1);
        wire_name.extend_from_slice(bytes);
        wire_name.push(0);
        let out = proto::NotifyInvalEntryOut {
            parent,
            namelen: bytes.len() as u32,
            padding: 0,
        };
        self.inner
            .write_notify(proto::FUSE_NOTIFY_INVAL_ENTRY, &[struct_bytes(&out), &wire_name])
    }

    /// The negotiated connection info, once initialization has completed.
    pub fn conn_info(&self) -> Option<ConnInfo> {
        self.inner.state.lock().conn
    }

    /// Number of requests currently in flight.
    pub fn in_flight(&self) -> usize {
        self.inner.registry.len()
    }
}

impl Drop for FuseChannel {
    fn drop(&mut self) {
        self.inner.request_session_exit();
        let workers = {
            let mut state = self.inner.state.lock();
            mem::take(&mut state.workers)
        };
        for handle in workers {
            if handle.join().is_err() {
                error!("fuse worker panicked during shutdown");
            }
        }
    }
}

impl ChannelInner {
    fn request_session_exit(&self) {
        self.session_finished.store(true, Ordering::Release);
        self.registry.interrupt_all();
    }

    fn set_conn(&self, conn: ConnInfo) {
        let mut state = self.state.lock();
        debug_assert!(state.conn.is_none(), "connection info negotiated twice");
        state.conn = Some(conn);
    }

    /// Writes one reply or notification as a single gathered write.
    /// `error` is the raw header field: zero or a negated errno for
    /// replies, a positive notify code for notifications.
    fn write_segments(&self, unique: u64, error: i32, segments: &[&[u8]]) -> Result<()> {
        let payload_len: usize = segments.iter().map(|s| s.len()).sum();
        let header = proto::encode_out_header(unique, error, payload_len);

        let mut iov = Vec::with_capacity(segments.len() + 1);
        iov.push(IoSlice::new(struct_bytes(&header)));
        for segment in segments {
            if !segment.is_empty() {
                iov.push(IoSlice::new(segment));
            }
        }

        let written = self
            .device
            .write_vectored(&iov)
            .map_err(ChannelError::WriteFailed)?;
        if written != header.len as usize {
            return Err(ChannelError::WriteFailed(io::Error::other(format!(
                "short reply write: {} of {}",
                written, header.len
            ))));
        }
        Ok(())
    }

    fn reply_error(&self, header: &InHeader, errno: i32) -> Result<()> {
        self.write_segments(header.unique, -errno, &[])
    }

    fn send_reply(&self, header: &InHeader, body: ReplyBody) -> Result<()> {
        match body {
            ReplyBody::Empty => self.write_segments(header.unique, 0, &[]),
            ReplyBody::Data(data) => self.write_segments(header.unique, 0, &[&data]),
            ReplyBody::Segments(segments) => {
                let slices: Vec<&[u8]> = segments.iter().map(Vec::as_slice).collect();
                self.write_segments(header.unique, 0, &slices)
            }
        }
    }

    /// Notifications are best-effort; ENOENT means the kernel no longer
    /// caches the object, which is fine.
    fn write_notify(&self, code: i32, segments: &[&[u8]]) -> Result<()> {
        match self.write_segments(0, code, segments) {
            Err(ChannelError::WriteFailed(err))
                if err.raw_os_error() == Some(libc::ENOENT) =>
            {
                debug!("kernel had nothing to invalidate");
                Ok(())
            }
            other => other,
        }
    }

    fn finish_request(&self, header: &InHeader) {
        if self.registry.finish(header.unique) {
            self.maybe_dispatch_session_complete();
        }
    }

    fn maybe_dispatch_session_complete(&self) {
        let mut state = self.state.lock();
        if !state.init_succeeded
            || state.stopped_threads < self.config.worker_threads
            || !self.registry.is_empty()
        {
            return;
        }
        if let Some(tx) = state.complete_tx.take() {
            info!(mount = %self.mount_path.display(), "fuse session complete");
            let _ = tx.send(());
        }
    }

    fn log_unknown_opcode(&self, opcode: u32) {
        if self.unknown_opcodes.lock().insert(opcode) {
            warn!("unhandled fuse opcode {opcode}");
        }
    }
}

fn notify_dispatcher_initialized(inner: &Arc<ChannelInner>) {
    let dispatcher = Arc::clone(&inner.dispatcher);
    inner.runtime.spawn(async move {
        dispatcher.initialized().await;
    });
}

fn spawn_session_worker(inner: &Arc<ChannelInner>) -> Result<()> {
    let worker = Arc::clone(inner);
    let handle = thread::Builder::new()
        .name("fuse-worker".to_string())
        .spawn(move || {
            process_session(&worker);
            worker_finished(&worker);
        })?;
    inner.state.lock().workers.push(handle);
    Ok(())
}

fn worker_finished(inner: &Arc<ChannelInner>) {
    {
        let mut state = inner.state.lock();
        state.stopped_threads += 1;
        debug!(stopped = state.stopped_threads, "fuse worker stopped");
    }
    inner.maybe_dispatch_session_complete();
}

fn init_worker(inner: Arc<ChannelInner>) {
    match read_init_packet(&inner) {
        Ok(conn) => {
            inner.set_conn(conn);
            {
                let mut state = inner.state.lock();
                state.init_succeeded = true;
            }
            debug!(
                minor = conn.minor,
                max_write = conn.max_write,
                "fuse init handshake complete"
            );
            notify_dispatcher_initialized(&inner);

            let mut spawn_failure = None;
            for _ in 1..inner.config.worker_threads {
                if let Err(err) = spawn_session_worker(&inner) {
                    spawn_failure = Some(err);
                    break;
                }
            }

            let init_tx = inner.state.lock().init_tx.take();
            if let Some(tx) = init_tx {
                let _ = tx.send(match spawn_failure {
                    Some(err) => Err(err),
                    None => Ok(()),
                });
            }

            // Become a regular session worker.
            process_session(&inner);
        }
        Err(err) => {
            error!("fuse init failed: {err}");
            inner.session_finished.store(true, Ordering::Release);
            let init_tx = inner.state.lock().init_tx.take();
            if let Some(tx) = init_tx {
                let _ = tx.send(Err(err));
            }
        }
    }
    worker_finished(&inner);
}

/// Waits for the kernel's INIT request and negotiates the session.
/// Anything else first is a protocol violation answered with EINVAL.
fn read_init_packet(inner: &Arc<ChannelInner>) -> Result<ConnInfo> {
    let mut buf = vec![0u8; inner.buffer_size];
    loop {
        let n = match inner.device.read(&mut buf) {
            Ok(0) => return Err(ChannelError::KernelClosed),
            Ok(n) => n,
            Err(err) => match err.raw_os_error() {
                Some(libc::EINTR) | Some(libc::EAGAIN) | Some(libc::ENOENT) => continue,
                Some(libc::ENODEV) => return Err(ChannelError::KernelClosed),
                _ => return Err(ChannelError::Io(err)),
            },
        };

        let (header, payload) = proto::split_request(&buf[..n])?;
        if header.opcode != proto::FUSE_INIT {
            warn!(
                opcode = header.opcode,
                "got request before INIT handshake"
            );
            inner.reply_error(&header, libc::EINVAL)?;
            return Err(ChannelError::ProtocolViolation(format!(
                "expected INIT, got opcode {}",
                header.opcode
            )));
        }

        let (init_in, _) = proto::read_struct::<proto::InitIn>(payload).ok_or_else(|| {
            ChannelError::ProtocolViolation("short INIT payload".to_string())
        })?;
        trace!(
            major = init_in.major,
            minor = init_in.minor,
            flags = format_args!("{:#x}", init_in.flags),
            "INIT received"
        );

        let conn = match negotiate(&init_in, &inner.config) {
            Ok(conn) => conn,
            Err(err) => {
                let _ = inner.reply_error(&header, libc::EPROTO);
                return Err(err);
            }
        };

        let out = conn.to_init_out();
        let body = &struct_bytes(&out)[..conn.init_out_size()];
        inner.write_segments(header.unique, 0, &[body])?;
        return Ok(conn);
    }
}

/// Dispatches kernel requests until the session is torn down. Called from
/// each worker thread; blocks in the device read between requests.
fn process_session(inner: &Arc<ChannelInner>) {
    let mut buf = vec![0u8; inner.buffer_size];

    while !inner.session_finished.load(Ordering::Acquire) {
        let n = match inner.device.read(&mut buf) {
            Ok(0) => {
                debug!("fuse device closed");
                inner.request_session_exit();
                break;
            }
            Ok(n) => n,
            Err(err) => match err.raw_os_error() {
                Some(libc::EINTR) | Some(libc::EAGAIN) => continue,
                // The kernel cancelled the request it was about to hand us.
                Some(libc::ENOENT) => continue,
                Some(libc::ENODEV) => {
                    debug!(mount = %inner.mount_path.display(), "fuse device unmounted");
                    inner.request_session_exit();
                    break;
                }
                _ => {
                    error!("fuse device read failed: {err}");
                    inner.request_session_exit();
                    break;
                }
            },
        };

        if let Err(err) = process_one(inner, &buf[..n]) {
            error!("fatal session error: {err}");
            inner.request_session_exit();
            break;
        }
    }
}

fn process_one(inner: &Arc<ChannelInner>, data: &[u8]) -> Result<()> {
    let (header, payload) = proto::split_request(data)?;
    trace!(
        unique = header.unique,
        opcode = header.opcode,
        nodeid = header.nodeid,
        "request"
    );

    match header.opcode {
        // At most one INIT exchange per session.
        proto::FUSE_INIT => {
            warn!("unexpected INIT on initialized session");
            inner.reply_error(&header, libc::EINVAL)?;
            Ok(())
        }
        proto::FUSE_DESTROY => {
            debug!("kernel destroyed the session");
            let dispatcher = Arc::clone(&inner.dispatcher);
            inner.runtime.spawn(async move {
                dispatcher.destroy().await;
            });
            inner.reply_error(&header, 0)?;
            inner.request_session_exit();
            Ok(())
        }
        proto::FUSE_INTERRUPT => {
            let (args, _) = proto::read_struct::<proto::InterruptIn>(payload)
                .ok_or_else(|| {
                    ChannelError::ProtocolViolation("short INTERRUPT payload".to_string())
                })?;
            trace!(unique = args.unique, "interrupt");
            inner.registry.interrupt(args.unique);
            Ok(())
        }
        opcode => match handler_for(opcode) {
            None => {
                inner.log_unknown_opcode(opcode);
                inner.reply_error(&header, libc::ENOSYS)?;
                Ok(())
            }
            Some(entry) => {
                let context = Arc::new(RequestContext::new(header));
                if entry.expects_reply {
                    inner.registry.insert(header.unique, &context)?;
                }
                let request = RequestInfo::new(context);
                let future = (entry.invoke)(
                    Arc::clone(&inner.dispatcher),
                    request,
                    payload.to_vec(),
                );

                let task_inner = Arc::clone(inner);
                let expects_reply = entry.expects_reply;
                let name = entry.name;
                // The reply is written from whichever task resolves the
                // future; the gathered write is the only synchronization
                // the device needs.
                inner.runtime.spawn(async move {
                    let result = future.await;
                    if expects_reply {
                        let written = match result {
                            Ok(body) => task_inner.send_reply(&header, body),
                            Err(errno) => task_inner.reply_error(&header, errno.0),
                        };
                        if let Err(err) = written {
                            warn!("failed to reply to {name}: {err}");
                        }
                        task_inner.finish_request(&header);
                    }
                });
                Ok(())
            }
        },
    }
}
