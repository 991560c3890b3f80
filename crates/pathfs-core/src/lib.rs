// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Path-keyed filesystems over the FUSE kernel protocol
//!
//! The kernel names files by numeric node identifiers; backends here are
//! written against plain paths. This crate sits between the two: it keeps
//! the identifier-to-path tree ([`registry`]), routes each decoded request to
//! the capability a backend declares ([`dispatcher`], [`backend`]) and runs
//! the mount lifecycle over a kernel channel ([`server`], [`channel`]).
//!
//! ```no_run
//! use std::sync::Arc;
//! use pathfs_core::channel::loopback;
//! use pathfs_core::{mount, FileSystem, MountOptions};
//!
//! struct Nothing;
//! impl FileSystem for Nothing {}
//!
//! let (provider, kernel) = loopback::pair();
//! let handle = mount(&provider, "/mnt/demo", Arc::new(Nothing), MountOptions::default())?;
//! kernel.init_reply()?;
//! handle.unmount()?;
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

pub mod backend;
pub mod channel;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod handles;
pub mod protocol;
pub mod registry;
pub mod resolver;
pub mod server;

pub use backend::{Context, FileHandle, FileSystem};
pub use config::{CacheConfig, MountOptions};
pub use dispatcher::Dispatcher;
pub use error::{ChannelError, ConfigError, FsError, FsResult, NodeError, ServerError};
pub use protocol::{
    DirEntry, FileAttr, FileType, NodeId, Operation, Reply, ReplyPayload, Request, ROOT_ID,
};
pub use registry::NodeRegistry;
pub use resolver::PathResolver;
pub use server::{mount, MountHandle, MountState};
