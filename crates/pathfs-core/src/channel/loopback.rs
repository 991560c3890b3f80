// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! In-process kernel channel
//!
//! [`pair`] returns a provider to mount with and a [`KernelSide`] that plays
//! the kernel: it issues requests, collects replies and can tear the mount
//! down. Opening the provider enqueues the kernel's `Init` request, the way a
//! real mount does.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use crossbeam_channel::{select, unbounded, Receiver, RecvTimeoutError, Sender};
use tracing::{debug, trace};

use super::{ChannelProvider, KernelChannel};
use crate::config::MountOptions;
use crate::error::ChannelError;
use crate::protocol::{
    NodeId, Operation, Reply, Request, RequestContext, KERNEL_MINOR_VERSION, KERNEL_VERSION,
    ROOT_ID,
};

const DEFAULT_REPLY_TIMEOUT: Duration = Duration::from_secs(10);

struct Shared {
    requests_tx: Sender<Request>,
    requests_rx: Receiver<Request>,
    replies_tx: Sender<Reply>,
    replies_rx: Receiver<Reply>,
    /// Dropped on teardown to wake every blocked `receive`.
    teardown_tx: Mutex<Option<Sender<()>>>,
    teardown_rx: Receiver<()>,
    torn_down: AtomicBool,
    closed: AtomicBool,
    fail_receive: AtomicBool,
    fail_reply: AtomicBool,
    opened: AtomicBool,
    next_unique: AtomicU64,
    init_unique: AtomicU64,
    init_op: Operation,
    mount_point: Mutex<Option<PathBuf>>,
}

impl Shared {
    fn tear_down(&self) {
        if !self.torn_down.swap(true, Ordering::SeqCst) {
            self.teardown_tx.lock().unwrap_or_else(PoisonError::into_inner).take();
            debug!(target: "pathfs::channel", "loopback mount torn down");
        }
    }
}

/// Create a connected provider/kernel pair speaking the current protocol version.
pub fn pair() -> (LoopbackProvider, KernelSide) {
    pair_with_init(Operation::Init {
        major: KERNEL_VERSION,
        minor: KERNEL_MINOR_VERSION,
        max_readahead: 128 * 1024,
        flags: 0,
    })
}

/// Like [`pair`], but the first request sent after open is `first_request`.
pub fn pair_with_init(first_request: Operation) -> (LoopbackProvider, KernelSide) {
    let (requests_tx, requests_rx) = unbounded();
    let (replies_tx, replies_rx) = unbounded();
    let (teardown_tx, teardown_rx) = unbounded();
    let shared = Arc::new(Shared {
        requests_tx,
        requests_rx,
        replies_tx,
        replies_rx,
        teardown_tx: Mutex::new(Some(teardown_tx)),
        teardown_rx,
        torn_down: AtomicBool::new(false),
        closed: AtomicBool::new(false),
        fail_receive: AtomicBool::new(false),
        fail_reply: AtomicBool::new(false),
        opened: AtomicBool::new(false),
        next_unique: AtomicU64::new(1),
        init_unique: AtomicU64::new(0),
        init_op: first_request,
        mount_point: Mutex::new(None),
    });

    (
        LoopbackProvider {
            shared: Arc::clone(&shared),
        },
        KernelSide {
            shared,
            stash: Mutex::new(HashMap::new()),
        },
    )
}

/// Provider half of a loopback pair. Opens at most once.
pub struct LoopbackProvider {
    shared: Arc<Shared>,
}

impl ChannelProvider for LoopbackProvider {
    type Channel = LoopbackChannel;

    fn open(
        &self,
        mount_point: &Path,
        _options: &MountOptions,
    ) -> Result<LoopbackChannel, ChannelError> {
        if self.shared.opened.swap(true, Ordering::SeqCst) {
            return Err(ChannelError::Open {
                path: mount_point.to_path_buf(),
                reason: "loopback channel already opened".to_string(),
            });
        }
        *self.shared.mount_point.lock().unwrap_or_else(PoisonError::into_inner) =
            Some(mount_point.to_path_buf());

        let unique = self.shared.next_unique.fetch_add(1, Ordering::SeqCst);
        self.shared.init_unique.store(unique, Ordering::SeqCst);
        let init = Request::new(unique, ROOT_ID, self.shared.init_op.clone());
        self.shared.requests_tx.send(init).map_err(|_| ChannelError::Closed)?;

        Ok(LoopbackChannel {
            shared: Arc::clone(&self.shared),
        })
    }
}

/// Server half of a loopback pair
pub struct LoopbackChannel {
    shared: Arc<Shared>,
}

impl KernelChannel for LoopbackChannel {
    fn receive(&self) -> Result<Request, ChannelError> {
        if self.shared.torn_down.load(Ordering::SeqCst) {
            return Err(ChannelError::Closed);
        }
        let request = select! {
            recv(self.shared.requests_rx) -> request => request.map_err(|_| ChannelError::Closed),
            recv(self.shared.teardown_rx) -> _ => Err(ChannelError::Closed),
        }?;
        if self.shared.fail_receive.swap(false, Ordering::SeqCst) {
            return Err(transport_fault("receive", request.unique));
        }
        Ok(request)
    }

    fn reply(&self, reply: Reply) -> Result<(), ChannelError> {
        if self.shared.closed.load(Ordering::SeqCst) {
            return Err(ChannelError::Closed);
        }
        if self.shared.fail_reply.swap(false, Ordering::SeqCst) {
            return Err(transport_fault("reply", reply.unique));
        }
        trace!(target: "pathfs::channel", unique = reply.unique, errno = reply.errno, "reply");
        self.shared.replies_tx.send(reply).map_err(|_| ChannelError::Closed)
    }

    fn unmount(&self) -> Result<(), ChannelError> {
        self.shared.tear_down();
        Ok(())
    }

    fn close(&self) {
        self.shared.tear_down();
        self.shared.closed.store(true, Ordering::SeqCst);
    }
}

fn transport_fault(direction: &str, unique: u64) -> ChannelError {
    ChannelError::Io(std::io::Error::new(
        std::io::ErrorKind::BrokenPipe,
        format!("simulated {direction} failure for request {unique}"),
    ))
}

/// Kernel half of a loopback pair
pub struct KernelSide {
    shared: Arc<Shared>,
    /// Replies received while waiting for a different request.
    stash: Mutex<HashMap<u64, Reply>>,
}

impl KernelSide {
    fn stash(&self) -> MutexGuard<'_, HashMap<u64, Reply>> {
        self.stash.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Queue a request from the root user; returns its request id.
    pub fn send(&self, node_id: NodeId, op: Operation) -> u64 {
        self.send_as(node_id, RequestContext::default(), op)
    }

    pub fn send_as(&self, node_id: NodeId, context: RequestContext, op: Operation) -> u64 {
        let unique = self.shared.next_unique.fetch_add(1, Ordering::SeqCst);
        let request = Request {
            unique,
            node_id,
            context,
            op,
        };
        // The receiver lives in `shared`, so sending cannot fail.
        let _ = self.shared.requests_tx.send(request);
        unique
    }

    /// Wait for the reply to request `unique`.
    pub fn wait_reply(&self, unique: u64) -> Result<Reply, ChannelError> {
        self.wait_reply_timeout(unique, DEFAULT_REPLY_TIMEOUT).ok_or_else(|| {
            ChannelError::Io(std::io::Error::new(
                std::io::ErrorKind::TimedOut,
                format!("no reply for request {unique}"),
            ))
        })
    }

    pub fn wait_reply_timeout(&self, unique: u64, timeout: Duration) -> Option<Reply> {
        if let Some(reply) = self.stash().remove(&unique) {
            return Some(reply);
        }
        let deadline = std::time::Instant::now() + timeout;
        loop {
            let remaining = deadline.saturating_duration_since(std::time::Instant::now());
            match self.shared.replies_rx.recv_timeout(remaining) {
                Ok(reply) if reply.unique == unique => return Some(reply),
                Ok(other) => {
                    self.stash().insert(other.unique, other);
                }
                Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => {
                    return None;
                }
            }
        }
    }

    /// Send a request and wait for its reply.
    pub fn call(&self, node_id: NodeId, op: Operation) -> Result<Reply, ChannelError> {
        let unique = self.send(node_id, op);
        self.wait_reply(unique)
    }

    /// Reply to the `Init` request enqueued when the channel was opened.
    pub fn init_reply(&self) -> Result<Reply, ChannelError> {
        self.wait_reply(self.shared.init_unique.load(Ordering::SeqCst))
    }

    /// Drop `nlookup` references on `node_id`. Forget has no reply.
    pub fn forget(&self, node_id: NodeId, nlookup: u64) {
        self.send(node_id, Operation::Forget { nlookup });
    }

    /// Tear the mount down from the kernel side, as `umount` would.
    pub fn teardown(&self) {
        self.shared.tear_down();
    }

    /// Whether the server released the channel.
    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::SeqCst)
    }

    /// Make the server's next `receive` fail with an I/O error. The request
    /// that wakes it is consumed by the failure.
    pub fn fail_next_receive(&self) {
        self.shared.fail_receive.store(true, Ordering::SeqCst);
    }

    /// Make the server's next `reply` fail with an I/O error.
    pub fn fail_next_reply(&self) {
        self.shared.fail_reply.store(true, Ordering::SeqCst);
    }

    pub fn mount_point(&self) -> Option<PathBuf> {
        self.shared.mount_point.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }
}
