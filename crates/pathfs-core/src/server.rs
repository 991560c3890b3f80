// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Server loop and mount lifecycle
//!
//! `Unmounted -> Mounting -> Serving -> Unmounting -> Unmounted`
//!
//! A dedicated reader thread blocks on the kernel channel and hands each
//! request to a worker pool, so a slow backend call never stalls unrelated
//! requests. Unmount stops the reader, lets in-flight requests finish (bounded
//! by `drain_timeout_ms` when set) and then releases the channel.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_queue::SegQueue;
use tracing::{debug, error, info, warn};

use crate::backend::FileSystem;
use crate::channel::{ChannelProvider, KernelChannel};
use crate::config::MountOptions;
use crate::dispatcher::Dispatcher;
use crate::error::{ChannelError, ServerError};
use crate::protocol::{
    Operation, Reply, ReplyPayload, Request, KERNEL_MINOR_VERSION, KERNEL_VERSION,
    MINIMUM_MINOR_VERSION,
};
use crate::registry::NodeRegistry;

/// Worker idle wait between queue polls.
const IDLE_WAIT: Duration = Duration::from_millis(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MountState {
    Unmounted,
    Mounting,
    Serving,
    Unmounting,
}

/// Count of dispatched requests whose reply has not been written yet
#[derive(Default)]
struct InFlight {
    count: Mutex<usize>,
    idle: Condvar,
}

impl InFlight {
    fn begin(&self) {
        *self.count.lock().unwrap_or_else(PoisonError::into_inner) += 1;
    }

    fn end(&self) {
        let mut count = self.count.lock().unwrap_or_else(PoisonError::into_inner);
        *count = count.saturating_sub(1);
        if *count == 0 {
            self.idle.notify_all();
        }
    }

    /// Wait until nothing is in flight. Returns the number abandoned on timeout.
    fn drain(&self, timeout: Option<Duration>) -> usize {
        let count = self.count.lock().unwrap_or_else(PoisonError::into_inner);
        let count = match timeout {
            Some(timeout) => {
                self.idle
                    .wait_timeout_while(count, timeout, |n| *n > 0)
                    .unwrap_or_else(PoisonError::into_inner)
                    .0
            }
            None => self
                .idle
                .wait_while(count, |n| *n > 0)
                .unwrap_or_else(PoisonError::into_inner),
        };
        *count
    }
}

/// Fixed pool of threads dispatching queued requests
struct RequestPool {
    queue: Arc<SegQueue<Request>>,
    signal: Arc<(Mutex<bool>, Condvar)>,
    shutdown: Arc<AtomicBool>,
    in_flight: Arc<InFlight>,
    handles: Vec<JoinHandle<()>>,
}

impl RequestPool {
    fn new(
        dispatcher: Arc<Dispatcher>,
        channel: Arc<dyn KernelChannel>,
        thread_count: usize,
    ) -> Result<Self, ServerError> {
        let queue = Arc::new(SegQueue::<Request>::new());
        let signal = Arc::new((Mutex::new(false), Condvar::new()));
        let shutdown = Arc::new(AtomicBool::new(false));
        let in_flight = Arc::new(InFlight::default());
        let mut handles = Vec::with_capacity(thread_count);

        for index in 0..thread_count {
            let queue_clone = Arc::clone(&queue);
            let signal_clone = Arc::clone(&signal);
            let shutdown_clone = Arc::clone(&shutdown);
            let in_flight_clone = Arc::clone(&in_flight);
            let dispatcher_clone = Arc::clone(&dispatcher);
            let channel_clone = Arc::clone(&channel);
            let spawned = thread::Builder::new().name(format!("pathfs-worker-{index}")).spawn(
                move || loop {
                    if shutdown_clone.load(Ordering::Acquire) {
                        break;
                    }

                    match queue_clone.pop() {
                        Some(request) => {
                            serve_one(&dispatcher_clone, channel_clone.as_ref(), &request);
                            in_flight_clone.end();
                        }
                        None => {
                            let (lock, cvar) = &*signal_clone;
                            let guard = lock.lock().unwrap_or_else(PoisonError::into_inner);
                            let _ = cvar.wait_timeout(guard, IDLE_WAIT);
                        }
                    }
                },
            );
            match spawned {
                Ok(handle) => handles.push(handle),
                Err(err) => {
                    let pool = Self {
                        queue,
                        signal,
                        shutdown,
                        in_flight,
                        handles,
                    };
                    pool.stop(true);
                    return Err(ServerError::Spawn(err));
                }
            }
        }

        Ok(Self {
            queue,
            signal,
            shutdown,
            in_flight,
            handles,
        })
    }

    fn submit(&self, request: Request) {
        self.in_flight.begin();
        self.queue.push(request);
        let (lock, cvar) = &*self.signal;
        let mut pending = lock.lock().unwrap_or_else(PoisonError::into_inner);
        *pending = true;
        cvar.notify_one();
    }

    fn signal_shutdown(&self) {
        self.shutdown.store(true, Ordering::Release);
        let (lock, cvar) = &*self.signal;
        let mut pending = lock.lock().unwrap_or_else(PoisonError::into_inner);
        *pending = true;
        cvar.notify_all();
    }

    /// Stop the workers. Busy workers are joined only when `join` is set.
    fn stop(mut self, join: bool) {
        self.signal_shutdown();
        for handle in self.handles.drain(..) {
            if join {
                let _ = handle.join();
            }
        }
    }
}

impl Drop for RequestPool {
    fn drop(&mut self) {
        self.signal_shutdown();
    }
}

/// Dispatch one request and write its reply. A failed write tears the mount down.
fn serve_one(dispatcher: &Dispatcher, channel: &dyn KernelChannel, request: &Request) {
    let Some(reply) = dispatcher.dispatch(request) else {
        return;
    };
    if let Err(err) = channel.reply(reply) {
        match err {
            ChannelError::Closed => {
                debug!(
                    target: "pathfs::server",
                    unique = request.unique,
                    "reply after close dropped"
                );
            }
            err => {
                error!(
                    target: "pathfs::server",
                    unique = request.unique,
                    %err,
                    "reply failed; unmounting"
                );
                let _ = channel.unmount();
            }
        }
    }
}

/// Validate the kernel's `Init` and answer it.
fn handshake(channel: &dyn KernelChannel, options: &MountOptions) -> Result<(), ServerError> {
    let request = channel.receive()?;
    let Operation::Init {
        major,
        minor,
        max_readahead,
        flags,
    } = request.op
    else {
        let _ = channel.reply(Reply::error(request.unique, libc::EPROTO));
        return Err(ServerError::Handshake(format!(
            "expected Init as first request, got opcode {}",
            request.op.opcode()
        )));
    };

    if major != KERNEL_VERSION || minor < MINIMUM_MINOR_VERSION {
        let _ = channel.reply(Reply::error(request.unique, libc::EPROTO));
        return Err(ServerError::Handshake(format!(
            "unsupported kernel protocol {major}.{minor}"
        )));
    }

    let negotiated = minor.min(KERNEL_MINOR_VERSION);
    let max_write = options.effective_max_write();
    debug!(
        target: "pathfs::server",
        kernel_major = major,
        kernel_minor = minor,
        negotiated_minor = negotiated,
        max_readahead,
        max_write,
        flags,
        "protocol handshake"
    );
    channel.reply(Reply::ok(
        request.unique,
        ReplyPayload::Init {
            major: KERNEL_VERSION,
            minor: negotiated,
            max_readahead,
            max_write,
        },
    ))?;
    Ok(())
}

struct Shared {
    state: Mutex<MountState>,
    state_changed: Condvar,
    channel: Arc<dyn KernelChannel>,
    dispatcher: Arc<Dispatcher>,
}

impl Shared {
    fn set_state(&self, state: MountState) {
        *self.lock_state() = state;
        self.state_changed.notify_all();
        debug!(target: "pathfs::server", ?state, "mount state");
    }

    fn state(&self) -> MountState {
        *self.lock_state()
    }

    fn lock_state(&self) -> MutexGuard<'_, MountState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Move `Serving` to `Unmounting`. False when an unmount is already under way.
    fn begin_unmount(&self) -> bool {
        let mut state = self.lock_state();
        if *state != MountState::Serving {
            return false;
        }
        *state = MountState::Unmounting;
        self.state_changed.notify_all();
        true
    }

    /// Undo [`Shared::begin_unmount`] unless the reader already moved on.
    fn resume_serving(&self) {
        let mut state = self.lock_state();
        if *state == MountState::Unmounting {
            *state = MountState::Serving;
        }
    }

    fn wait_unmounted(&self) {
        let state = self.lock_state();
        let _state = self
            .state_changed
            .wait_while(state, |state| *state != MountState::Unmounted)
            .unwrap_or_else(PoisonError::into_inner);
    }
}

/// Marks the mount unmounted if the reader exits without finishing teardown.
struct ReaderExit<'a>(&'a Shared);

impl Drop for ReaderExit<'_> {
    fn drop(&mut self) {
        if self.0.state() != MountState::Unmounted {
            self.0.channel.close();
            self.0.set_state(MountState::Unmounted);
        }
    }
}

/// Reader thread body: pull requests until the mount is torn down, then drain.
fn serve(shared: Arc<Shared>, pool: RequestPool, options: MountOptions) {
    let _exit = ReaderExit(&shared);
    let mut destroy = None;
    loop {
        match shared.channel.receive() {
            Ok(request) if matches!(request.op, Operation::Destroy) => {
                destroy = Some(request);
                break;
            }
            Ok(request) => pool.submit(request),
            Err(ChannelError::Closed) => break,
            Err(err) => {
                error!(target: "pathfs::server", %err, "kernel channel read failed");
                break;
            }
        }
    }

    shared.set_state(MountState::Unmounting);
    let abandoned = pool.in_flight.drain(options.drain_timeout());
    if abandoned > 0 {
        warn!(
            target: "pathfs::server",
            abandoned,
            "drain timeout elapsed; abandoning in-flight requests"
        );
    }
    if let Some(request) = destroy {
        serve_one(&shared.dispatcher, shared.channel.as_ref(), &request);
    }
    pool.stop(abandoned == 0);

    shared.dispatcher.release_all();
    shared.dispatcher.backend().on_unmount();
    shared.channel.close();
    shared.set_state(MountState::Unmounted);
    info!(target: "pathfs::server", fs = %options.fs_name, "unmounted");
}

/// Handle to a serving mount. Dropping it unmounts.
pub struct MountHandle {
    mount_point: PathBuf,
    shared: Arc<Shared>,
    reader: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for MountHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MountHandle")
            .field("mount_point", &self.mount_point)
            .field("state", &self.state())
            .finish()
    }
}

impl MountHandle {
    pub fn mount_point(&self) -> &Path {
        &self.mount_point
    }

    pub fn state(&self) -> MountState {
        self.shared.state()
    }

    pub fn registry(&self) -> &Arc<NodeRegistry> {
        self.shared.dispatcher.registry()
    }

    /// Unmount and wait until every resource is released.
    ///
    /// Safe to call from any thread, including while another thread is
    /// blocked in [`MountHandle::wait`]. Calling it again, or after the
    /// kernel tore the mount down, only waits for the teardown to finish.
    pub fn unmount(&self) -> Result<(), ServerError> {
        if self.shared.begin_unmount() {
            info!(target: "pathfs::server", mount_point = %self.mount_point.display(), "unmounting");
            if let Err(err) = self.shared.channel.unmount() {
                // The reader is still serving; let a later unmount retry.
                self.shared.resume_serving();
                return Err(err.into());
            }
        }
        self.wait();
        Ok(())
    }

    /// Block until the mount ends, for example because the kernel tore it down.
    pub fn wait(&self) {
        self.shared.wait_unmounted();
        if let Some(reader) = self.take_reader() {
            join_reader(reader);
        }
    }

    fn take_reader(&self) -> Option<JoinHandle<()>> {
        self.reader.lock().unwrap_or_else(PoisonError::into_inner).take()
    }
}

fn join_reader(reader: JoinHandle<()>) {
    if reader.join().is_err() {
        error!(target: "pathfs::server", "reader thread panicked");
    }
}

impl Drop for MountHandle {
    fn drop(&mut self) {
        if let Err(err) = self.unmount() {
            warn!(target: "pathfs::server", %err, "unmount on drop failed");
        }
    }
}

/// Mount `backend` at `mount_point` through a channel opened by `provider`.
///
/// Returns once the handshake succeeded and requests are being served. Any
/// failure before that leaves nothing behind: the channel is closed and the
/// backend never sees `on_mount`.
pub fn mount<P>(
    provider: &P,
    mount_point: impl AsRef<Path>,
    backend: Arc<dyn FileSystem>,
    options: MountOptions,
) -> Result<MountHandle, ServerError>
where
    P: ChannelProvider,
{
    let mount_point = mount_point.as_ref().to_path_buf();
    debug!(
        target: "pathfs::server",
        state = ?MountState::Mounting,
        mount_point = %mount_point.display(),
        "mounting"
    );

    let channel: Arc<dyn KernelChannel> = Arc::new(provider.open(&mount_point, &options)?);
    if let Err(err) = handshake(channel.as_ref(), &options) {
        channel.close();
        warn!(target: "pathfs::server", %err, "mount aborted");
        return Err(err);
    }

    let registry = Arc::new(NodeRegistry::new());
    let dispatcher = Arc::new(Dispatcher::new(Arc::clone(&backend), registry, &options));
    let workers = options.worker_count();
    let pool = match RequestPool::new(Arc::clone(&dispatcher), Arc::clone(&channel), workers) {
        Ok(pool) => pool,
        Err(err) => {
            channel.close();
            return Err(err);
        }
    };

    let shared = Arc::new(Shared {
        state: Mutex::new(MountState::Serving),
        state_changed: Condvar::new(),
        channel,
        dispatcher,
    });

    backend.on_mount();
    let reader_shared = Arc::clone(&shared);
    let reader_options = options.clone();
    let reader = thread::Builder::new()
        .name("pathfs-reader".to_string())
        .spawn(move || serve(reader_shared, pool, reader_options));
    let reader = match reader {
        Ok(reader) => reader,
        Err(err) => {
            // The pool moved into the failed closure and was dropped with it.
            backend.on_unmount();
            shared.channel.close();
            shared.set_state(MountState::Unmounted);
            return Err(ServerError::Spawn(err));
        }
    };

    info!(
        target: "pathfs::server",
        fs = %options.fs_name,
        backend = backend.name(),
        mount_point = %mount_point.display(),
        workers,
        read_only = options.read_only,
        "mounted"
    );

    Ok(MountHandle {
        mount_point,
        shared,
        reader: Mutex::new(Some(reader)),
    })
}
