// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Kernel file handle tables for open files and directory listings

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::backend::FileHandle;
use crate::error::{FsError, FsResult};
use crate::protocol::{DirEntry, NodeId};

/// An open file as tracked by the dispatcher
pub struct OpenFile {
    pub node_id: NodeId,
    pub handle: Box<dyn FileHandle>,
}

/// Handle table keyed by kernel file handle
pub struct HandleTable<T> {
    entries: Mutex<HashMap<u64, Arc<T>>>,
    next_fh: AtomicU64,
}

impl<T> Default for HandleTable<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> HandleTable<T> {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            next_fh: AtomicU64::new(1),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<u64, Arc<T>>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Store `value` and return the handle the kernel will refer to it by.
    pub fn insert(&self, value: T) -> u64 {
        let fh = self.next_fh.fetch_add(1, Ordering::Relaxed);
        self.lock().insert(fh, Arc::new(value));
        fh
    }

    pub fn get(&self, fh: u64) -> FsResult<Arc<T>> {
        self.lock().get(&fh).cloned().ok_or(FsError::BadHandle)
    }

    pub fn remove(&self, fh: u64) -> FsResult<Arc<T>> {
        self.lock().remove(&fh).ok_or(FsError::BadHandle)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Remove and return every entry.
    pub fn drain(&self) -> Vec<Arc<T>> {
        self.lock().drain().map(|(_, value)| value).collect()
    }
}

/// Listing captured at opendir time and paged through by readdir
pub struct DirListing {
    pub node_id: NodeId,
    pub entries: Vec<DirEntry>,
}
