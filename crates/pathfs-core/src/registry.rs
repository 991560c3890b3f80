// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Node registry
//!
//! Maps kernel node identifiers to entries of a name tree. Nodes live in an
//! arena keyed by identifier; parent and child links are identifiers too, so
//! the tree carries no ownership cycles. A node's path is never cached: it is
//! rebuilt from the parent chain on every resolve, which keeps renames O(1)
//! and makes them visible to all descendants at once.
//!
//! All mutation happens under one write lock. Resolves take the read lock and
//! therefore never observe a half-applied rename or eviction.

use std::collections::HashMap;
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use tracing::{debug, trace};

use crate::error::{FsError, FsResult, NodeError};
use crate::protocol::{FileAttr, NodeId, ROOT_ID};

/// One filesystem entry known to the kernel
#[derive(Debug, Clone)]
struct PathNode {
    name: String,
    /// `None` for the root and for detached nodes.
    parent: Option<NodeId>,
    children: HashMap<String, NodeId>,
    lookup_count: u64,
    generation: u64,
}

impl PathNode {
    fn root() -> Self {
        Self {
            name: String::new(),
            parent: None,
            children: HashMap::new(),
            lookup_count: 1,
            generation: 0,
        }
    }
}

/// Identity handed to the kernel for a registered node
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NodeEntry {
    pub node_id: NodeId,
    pub generation: u64,
}

/// Result of resolving a name under a parent
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LookupOutcome {
    /// The backend knows the entry; the node's lookup count was incremented.
    Found { entry: NodeEntry, attr: FileAttr },
    /// The backend reported no entry. No node was created.
    Absent,
}

/// Snapshot of a node's bookkeeping, for diagnostics and tests
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeInfo {
    pub node_id: NodeId,
    pub name: String,
    pub parent: Option<NodeId>,
    pub lookup_count: u64,
    pub generation: u64,
    pub children: usize,
}

#[derive(Debug)]
struct RegistryInner {
    nodes: HashMap<NodeId, PathNode>,
    /// Identifiers of evicted nodes, reused before fresh ones.
    free_ids: Vec<NodeId>,
    next_id: NodeId,
    /// Bumped whenever a freed identifier is handed out again.
    generation: u64,
}

impl RegistryInner {
    fn allocate(&mut self, parent: NodeId, name: &str) -> NodeEntry {
        let node_id = match self.free_ids.pop() {
            Some(reused) => {
                self.generation += 1;
                reused
            }
            None => {
                let fresh = self.next_id;
                self.next_id += 1;
                fresh
            }
        };

        let node = PathNode {
            name: name.to_string(),
            parent: Some(parent),
            children: HashMap::new(),
            lookup_count: 0,
            generation: self.generation,
        };
        self.nodes.insert(node_id, node);
        if let Some(parent_node) = self.nodes.get_mut(&parent) {
            parent_node.children.insert(name.to_string(), node_id);
        }

        NodeEntry {
            node_id,
            generation: self.generation,
        }
    }

    /// Find or create the child `name` of `parent` and take one lookup reference on it.
    fn link_child(&mut self, parent: NodeId, name: &str) -> Result<NodeEntry, NodeError> {
        let parent_node = self.nodes.get(&parent).ok_or(NodeError::Stale(parent))?;
        if parent != ROOT_ID && parent_node.parent.is_none() {
            return Err(NodeError::Detached(parent));
        }

        let entry = match parent_node.children.get(name).copied() {
            Some(existing) => {
                let generation = self.nodes.get(&existing).map(|n| n.generation).unwrap_or(0);
                NodeEntry {
                    node_id: existing,
                    generation,
                }
            }
            None => self.allocate(parent, name),
        };

        if let Some(node) = self.nodes.get_mut(&entry.node_id) {
            node.lookup_count += 1;
        }
        Ok(entry)
    }

    /// Remove `node_id` from its parent's child map and clear its parent link.
    fn detach(&mut self, node_id: NodeId) -> Option<NodeId> {
        let node = self.nodes.get_mut(&node_id)?;
        let parent = node.parent.take()?;
        let name = node.name.clone();
        if let Some(parent_node) = self.nodes.get_mut(&parent) {
            if parent_node.children.get(&name) == Some(&node_id) {
                parent_node.children.remove(&name);
            }
        }
        Some(parent)
    }

    /// Evict `node_id` if nothing references it any more, then walk up and
    /// evict ancestors that were only kept alive by their children.
    fn evict_unreferenced(&mut self, node_id: NodeId) {
        let mut current = Some(node_id);
        while let Some(id) = current {
            if id == ROOT_ID {
                return;
            }
            let evictable = match self.nodes.get(&id) {
                Some(node) => node.lookup_count == 0 && node.children.is_empty(),
                None => return,
            };
            if !evictable {
                return;
            }

            let parent = self.detach(id);
            self.nodes.remove(&id);
            self.free_ids.push(id);
            trace!(target: "pathfs::registry", node = id, "evicted node");
            current = parent;
        }
    }

    /// Whether `ancestor` is `node_id` or lies on its parent chain.
    fn is_ancestor(&self, ancestor: NodeId, node_id: NodeId) -> bool {
        let mut current = Some(node_id);
        // A well-formed chain is never longer than the arena.
        for _ in 0..=self.nodes.len() {
            match current {
                Some(id) if id == ancestor => return true,
                Some(id) => current = self.nodes.get(&id).and_then(|node| node.parent),
                None => return false,
            }
        }
        false
    }

    fn path_of(&self, node_id: NodeId) -> Result<String, NodeError> {
        let mut segments: Vec<&str> = Vec::new();
        let mut current = node_id;
        loop {
            if current == ROOT_ID {
                break;
            }
            let node = self.nodes.get(&current).ok_or(if current == node_id {
                NodeError::Stale(node_id)
            } else {
                NodeError::Detached(node_id)
            })?;
            segments.push(&node.name);
            match node.parent {
                Some(parent) => current = parent,
                None => return Err(NodeError::Detached(node_id)),
            }
        }

        segments.reverse();
        Ok(segments.join("/"))
    }
}

/// Bidirectional mapping between kernel node identifiers and paths
#[derive(Debug)]
pub struct NodeRegistry {
    inner: RwLock<RegistryInner>,
}

impl Default for NodeRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl NodeRegistry {
    /// Create a registry holding only the root node.
    pub fn new() -> Self {
        let mut nodes = HashMap::new();
        nodes.insert(ROOT_ID, PathNode::root());
        Self {
            inner: RwLock::new(RegistryInner {
                nodes,
                free_ids: Vec::new(),
                next_id: ROOT_ID + 1,
                generation: 0,
            }),
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, RegistryInner> {
        self.inner.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, RegistryInner> {
        self.inner.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Resolve `name` under `parent`.
    ///
    /// `stat` is called with the child's full path and without any registry
    /// lock held, so a slow backend does not block other requests. On success
    /// the child node is created or reused and its lookup count incremented.
    /// `FsError::NotFound` from `stat` yields [`LookupOutcome::Absent`]; any
    /// other error is returned unchanged.
    pub fn lookup<F>(&self, parent: NodeId, name: &str, stat: F) -> FsResult<LookupOutcome>
    where
        F: FnOnce(&str) -> FsResult<FileAttr>,
    {
        let parent_path = self.resolve(parent)?;
        let child_path = join_path(&parent_path, name);

        let mut attr = match stat(&child_path) {
            Ok(attr) => attr,
            Err(FsError::NotFound) => {
                trace!(target: "pathfs::registry", parent, name, "negative lookup");
                return Ok(LookupOutcome::Absent);
            }
            Err(err) => return Err(err),
        };

        let entry = self.write().link_child(parent, name)?;
        attr.ino = entry.node_id;
        debug!(
            target: "pathfs::registry",
            parent,
            name,
            node = entry.node_id,
            generation = entry.generation,
            "lookup registered node"
        );
        Ok(LookupOutcome::Found { entry, attr })
    }

    /// Take one lookup reference on the child `name` of `parent`, creating it if needed.
    ///
    /// Used after the backend has confirmed the entry exists.
    pub fn register(&self, parent: NodeId, name: &str) -> Result<NodeEntry, NodeError> {
        self.write().link_child(parent, name)
    }

    /// Drop `count` lookup references from `node_id`.
    ///
    /// A node reaching zero references with no children is evicted and its
    /// identifier becomes reusable. Unknown identifiers are ignored.
    pub fn forget(&self, node_id: NodeId, count: u64) {
        if node_id == ROOT_ID {
            return;
        }
        let mut inner = self.write();
        match inner.nodes.get_mut(&node_id) {
            Some(node) => {
                node.lookup_count = node.lookup_count.saturating_sub(count);
                trace!(
                    target: "pathfs::registry",
                    node = node_id,
                    count,
                    remaining = node.lookup_count,
                    "forget"
                );
            }
            None => {
                debug!(target: "pathfs::registry", node = node_id, "forget for unknown node");
                return;
            }
        }
        inner.evict_unreferenced(node_id);
    }

    /// Full path of `node_id`, relative to the mount root (`""` for the root).
    pub fn resolve(&self, node_id: NodeId) -> Result<String, NodeError> {
        self.read().path_of(node_id)
    }

    /// Move the child `old_name` of `old_parent` to `new_name` under `new_parent`.
    ///
    /// Called after the backend confirmed the rename. A node previously known
    /// at the destination is detached. Both parents must be registered.
    pub fn register_rename(
        &self,
        old_parent: NodeId,
        old_name: &str,
        new_parent: NodeId,
        new_name: &str,
    ) -> Result<(), NodeError> {
        let mut inner = self.write();
        if !inner.nodes.contains_key(&old_parent) {
            return Err(NodeError::Stale(old_parent));
        }
        if !inner.nodes.contains_key(&new_parent) {
            return Err(NodeError::Stale(new_parent));
        }

        let moving = inner
            .nodes
            .get(&old_parent)
            .and_then(|parent| parent.children.get(old_name).copied());
        let Some(moving) = moving else {
            // The kernel never looked the source up; only the destination can be stale.
            if let Some(replaced) =
                inner.nodes.get(&new_parent).and_then(|p| p.children.get(new_name).copied())
            {
                inner.detach(replaced);
                inner.evict_unreferenced(replaced);
            }
            return Ok(());
        };

        if inner.is_ancestor(moving, new_parent) {
            return Err(NodeError::Cycle {
                node: moving,
                parent: new_parent,
            });
        }

        let replaced =
            inner.nodes.get(&new_parent).and_then(|p| p.children.get(new_name).copied());
        if let Some(replaced) = replaced.filter(|&id| id != moving) {
            inner.detach(replaced);
            inner.evict_unreferenced(replaced);
        }

        inner.detach(moving);
        if let Some(node) = inner.nodes.get_mut(&moving) {
            node.name = new_name.to_string();
            node.parent = Some(new_parent);
        }
        if let Some(parent_node) = inner.nodes.get_mut(&new_parent) {
            parent_node.children.insert(new_name.to_string(), moving);
        }
        if old_parent != new_parent {
            inner.evict_unreferenced(old_parent);
        }

        debug!(
            target: "pathfs::registry",
            node = moving,
            old_parent,
            old_name,
            new_parent,
            new_name,
            "rename applied"
        );
        Ok(())
    }

    /// Detach the child `name` of `parent` after the backend removed it.
    ///
    /// The node stays allocated while the kernel still references it, but its
    /// path no longer resolves.
    pub fn unlink(&self, parent: NodeId, name: &str) {
        let mut inner = self.write();
        let child = inner.nodes.get(&parent).and_then(|p| p.children.get(name).copied());
        if let Some(child) = child {
            inner.detach(child);
            inner.evict_unreferenced(child);
            inner.evict_unreferenced(parent);
            trace!(target: "pathfs::registry", parent, name, node = child, "unlinked");
        }
    }

    /// Identifier of the child `name` of `parent`, if registered.
    pub fn child(&self, parent: NodeId, name: &str) -> Option<NodeId> {
        self.read().nodes.get(&parent).and_then(|p| p.children.get(name).copied())
    }

    pub fn info(&self, node_id: NodeId) -> Option<NodeInfo> {
        self.read().nodes.get(&node_id).map(|node| NodeInfo {
            node_id,
            name: node.name.clone(),
            parent: node.parent,
            lookup_count: node.lookup_count,
            generation: node.generation,
            children: node.children.len(),
        })
    }

    /// Number of live nodes, root included.
    pub fn len(&self) -> usize {
        self.read().nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Join a parent path and a child name without introducing separators at the edges.
pub fn join_path(parent: &str, name: &str) -> String {
    if parent.is_empty() {
        name.to_string()
    } else {
        format!("{parent}/{name}")
    }
}
