// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Error types for the path-keyed filesystem layer

use std::path::PathBuf;
use thiserror::Error;

use crate::protocol::NodeId;

/// Result type alias for backend and dispatcher operations
pub type FsResult<T> = std::result::Result<T, FsError>;

/// Per-request failures.
///
/// Backends report one of these from every capability; the dispatcher converts
/// them into the errno carried by the reply. Nothing here ever stops the server.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FsError {
    #[error("entry not found")]
    NotFound,

    #[error("attribute not present")]
    NoData,

    #[error("operation not supported by the target")]
    NotSupported,

    /// Raised by the dispatcher when the backend declares no implementation
    /// of the requested capability.
    #[error("capability not implemented")]
    NotImplemented,

    #[error("permission denied")]
    PermissionDenied,

    /// Raised by the dispatcher for mutating requests on a read-only mount.
    #[error("read-only mount")]
    ReadOnly,

    #[error("entry already exists")]
    AlreadyExists,

    #[error("result does not fit the caller buffer")]
    Range,

    #[error("stale node identifier")]
    Stale,

    #[error("invalid argument")]
    InvalidArgument,

    #[error("name too long")]
    NameTooLong,

    #[error("unknown file handle")]
    BadHandle,

    #[error("directory not empty")]
    NotEmpty,

    #[error("is a directory")]
    IsDirectory,

    #[error("not a directory")]
    NotDirectory,

    #[error("I/O error: {0}")]
    Io(String),

    /// Backend status outside the closed vocabulary, passed through verbatim.
    #[error("backend errno {0}")]
    Errno(i32),
}

impl FsError {
    /// Protocol errno for this failure (positive value).
    pub fn to_errno(&self) -> i32 {
        match self {
            FsError::NotFound => libc::ENOENT,
            FsError::NoData => libc::ENODATA,
            FsError::NotSupported => libc::ENOTSUP,
            FsError::NotImplemented => libc::ENOSYS,
            FsError::PermissionDenied => libc::EACCES,
            FsError::ReadOnly => libc::EROFS,
            FsError::AlreadyExists => libc::EEXIST,
            FsError::Range => libc::ERANGE,
            FsError::Stale => libc::ESTALE,
            FsError::InvalidArgument => libc::EINVAL,
            FsError::NameTooLong => libc::ENAMETOOLONG,
            FsError::BadHandle => libc::EBADF,
            FsError::NotEmpty => libc::ENOTEMPTY,
            FsError::IsDirectory => libc::EISDIR,
            FsError::NotDirectory => libc::ENOTDIR,
            FsError::Io(_) => libc::EIO,
            FsError::Errno(errno) => *errno,
        }
    }

    /// Map a raw errno onto the closed vocabulary where possible.
    pub fn from_errno(errno: i32) -> Self {
        match errno {
            libc::ENOENT => FsError::NotFound,
            libc::ENODATA => FsError::NoData,
            libc::ENOTSUP => FsError::NotSupported,
            libc::ENOSYS => FsError::NotImplemented,
            libc::EACCES | libc::EPERM => FsError::PermissionDenied,
            libc::EROFS => FsError::ReadOnly,
            libc::EEXIST => FsError::AlreadyExists,
            libc::ERANGE => FsError::Range,
            libc::ESTALE => FsError::Stale,
            libc::EINVAL => FsError::InvalidArgument,
            libc::ENAMETOOLONG => FsError::NameTooLong,
            libc::EBADF => FsError::BadHandle,
            libc::ENOTEMPTY => FsError::NotEmpty,
            libc::EISDIR => FsError::IsDirectory,
            libc::ENOTDIR => FsError::NotDirectory,
            other => FsError::Errno(other),
        }
    }
}

impl From<std::io::Error> for FsError {
    fn from(err: std::io::Error) -> Self {
        match err.raw_os_error() {
            Some(errno) => FsError::from_errno(errno),
            None => match err.kind() {
                std::io::ErrorKind::NotFound => FsError::NotFound,
                std::io::ErrorKind::PermissionDenied => FsError::PermissionDenied,
                std::io::ErrorKind::AlreadyExists => FsError::AlreadyExists,
                std::io::ErrorKind::InvalidInput => FsError::InvalidArgument,
                _ => FsError::Io(err.to_string()),
            },
        }
    }
}

/// Node registry failures
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum NodeError {
    /// The identifier is not (or no longer) in the registry.
    #[error("stale node {0}")]
    Stale(NodeId),

    /// The node is still referenced by the kernel but has been unlinked or
    /// replaced, so it has no path any more.
    #[error("node {0} is detached from the tree")]
    Detached(NodeId),

    /// A rename would move `node` underneath itself.
    #[error("cannot move node {node} under its descendant {parent}")]
    Cycle { node: NodeId, parent: NodeId },
}

impl From<NodeError> for FsError {
    fn from(err: NodeError) -> Self {
        match err {
            NodeError::Stale(_) => FsError::Stale,
            NodeError::Detached(_) => FsError::NotFound,
            NodeError::Cycle { .. } => FsError::InvalidArgument,
        }
    }
}

/// Kernel channel failures
#[derive(Debug, Error)]
pub enum ChannelError {
    /// The mount has been torn down; no further requests will arrive.
    #[error("kernel channel closed")]
    Closed,

    #[error("kernel channel I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to open kernel channel at {path}: {reason}")]
    Open { path: PathBuf, reason: String },
}

/// Mount lifecycle failures
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("channel error: {0}")]
    Channel(#[from] ChannelError),

    #[error("protocol handshake failed: {0}")]
    Handshake(String),

    #[error("failed to spawn server thread: {0}")]
    Spawn(std::io::Error),
}

/// Mount option loading failures
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON parsing error: {0}")]
    Json(#[from] serde_json::Error),
}
