// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Request-time path resolution
//!
//! Every path-based backend call goes through here first, so a stale or
//! detached node identifier fails the single request before the backend is
//! touched.

use std::sync::Arc;

use tracing::debug;

use crate::error::{FsError, FsResult};
use crate::protocol::{NodeId, NAME_MAX};
use crate::registry::{join_path, NodeRegistry};

#[derive(Debug, Clone)]
pub struct PathResolver {
    registry: Arc<NodeRegistry>,
}

impl PathResolver {
    pub fn new(registry: Arc<NodeRegistry>) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &Arc<NodeRegistry> {
        &self.registry
    }

    /// Path of the node a request targets.
    pub fn path_for_request(&self, node_id: NodeId) -> FsResult<String> {
        self.registry.resolve(node_id).map_err(|err| {
            debug!(target: "pathfs::dispatch", node = node_id, %err, "path resolution failed");
            FsError::from(err)
        })
    }

    /// Path of the entry `name` inside the directory node `parent`.
    pub fn child_path(&self, parent: NodeId, name: &str) -> FsResult<String> {
        validate_name(name)?;
        let parent_path = self.path_for_request(parent)?;
        Ok(join_path(&parent_path, name))
    }
}

/// Reject names the kernel should never send for a single path component.
pub fn validate_name(name: &str) -> FsResult<()> {
    if name.len() > NAME_MAX {
        return Err(FsError::NameTooLong);
    }
    if name.is_empty() || name == "." || name == ".." || name.contains('/') || name.contains('\0')
    {
        return Err(FsError::InvalidArgument);
    }
    Ok(())
}
