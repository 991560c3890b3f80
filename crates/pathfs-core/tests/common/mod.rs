// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Common helpers for integration tests

#![allow(dead_code)]

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use pathfs_core::backend::{
    Access, Create, GetAttr, GetXAttr, Link, ListXAttr, Mkdir, Mknod, Open, ReadDir, ReadLink,
    RemoveXAttr, Rename, Rmdir, SetAttr, SetXAttr, StatFs, Symlink, Unlink,
};
use pathfs_core::channel::loopback::{self, KernelSide};
use pathfs_core::protocol::{EntryOut, SetAttrRequest, StatFsOut, XATTR_CREATE, XATTR_REPLACE};
use pathfs_core::{
    mount, Context, DirEntry, FileAttr, FileHandle, FileSystem, FileType, FsError, FsResult,
    MountHandle, MountOptions, NodeId, NodeRegistry, Operation, Reply, ReplyPayload,
};

#[derive(Debug, Clone)]
struct MemEntry {
    kind: FileType,
    perm: u16,
    data: Vec<u8>,
    target: Option<String>,
    xattrs: HashMap<String, Vec<u8>>,
}

impl MemEntry {
    fn new(kind: FileType, perm: u16) -> Self {
        Self {
            kind,
            perm,
            data: Vec::new(),
            target: None,
            xattrs: HashMap::new(),
        }
    }

    fn attr(&self) -> FileAttr {
        let mut attr = FileAttr::new(self.kind, self.perm).with_size(self.data.len() as u64);
        if let Some(target) = &self.target {
            attr = attr.with_size(target.len() as u64);
        }
        attr
    }
}

fn parent_of(path: &str) -> &str {
    path.rsplit_once('/').map(|(parent, _)| parent).unwrap_or("")
}

fn name_of(path: &str) -> &str {
    path.rsplit_once('/').map(|(_, name)| name).unwrap_or(path)
}

type Entries = Arc<Mutex<BTreeMap<String, MemEntry>>>;

/// In-memory path-keyed filesystem implementing every capability.
///
/// `calls` counts capability invocations so tests can check that a request
/// never reached the backend.
pub struct MemoryFs {
    entries: Entries,
    calls: AtomicUsize,
    /// Delay applied to every `get_attr`.
    stat_delay: Option<Duration>,
}

impl MemoryFs {
    pub fn new() -> Self {
        let mut entries = BTreeMap::new();
        entries.insert(String::new(), MemEntry::new(FileType::Directory, 0o755));
        Self {
            entries: Arc::new(Mutex::new(entries)),
            calls: AtomicUsize::new(0),
            stat_delay: None,
        }
    }

    /// A root directory holding one empty regular file without attributes.
    pub fn single_file(name: &str) -> Self {
        let fs = Self::new();
        fs.add_file(name, b"");
        fs
    }

    pub fn with_stat_delay(mut self, delay: Duration) -> Self {
        self.stat_delay = Some(delay);
        self
    }

    pub fn add_file(&self, path: &str, data: &[u8]) {
        let mut entry = MemEntry::new(FileType::RegularFile, 0o644);
        entry.data = data.to_vec();
        self.lock().insert(path.to_string(), entry);
    }

    pub fn add_dir(&self, path: &str) {
        self.lock()
            .insert(path.to_string(), MemEntry::new(FileType::Directory, 0o755));
    }

    /// Drop an entry directly, bypassing the mount.
    pub fn remove(&self, path: &str) {
        self.lock().remove(path);
    }

    pub fn exists(&self, path: &str) -> bool {
        self.lock().contains_key(path)
    }

    pub fn contents(&self, path: &str) -> Option<Vec<u8>> {
        self.lock().get(path).map(|e| e.data.clone())
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn lock(&self) -> MutexGuard<'_, BTreeMap<String, MemEntry>> {
        self.entries.lock().unwrap()
    }

    fn record(&self) {
        self.calls.fetch_add(1, Ordering::SeqCst);
    }

    fn create_entry(&self, path: &str, entry: MemEntry) -> FsResult<()> {
        let mut entries = self.lock();
        match entries.get(parent_of(path)) {
            Some(parent) if parent.kind == FileType::Directory => {}
            Some(_) => return Err(FsError::NotDirectory),
            None => return Err(FsError::NotFound),
        }
        if entries.contains_key(path) {
            return Err(FsError::AlreadyExists);
        }
        entries.insert(path.to_string(), entry);
        Ok(())
    }

    fn has_children(entries: &BTreeMap<String, MemEntry>, path: &str) -> bool {
        let prefix = format!("{path}/");
        entries.keys().any(|key| key.starts_with(&prefix))
    }
}

struct MemHandle {
    entries: Entries,
    path: String,
}

impl FileHandle for MemHandle {
    fn read(&self, offset: u64, size: u32) -> FsResult<Vec<u8>> {
        let entries = self.entries.lock().unwrap();
        let entry = entries.get(&self.path).ok_or(FsError::NotFound)?;
        let start = (offset as usize).min(entry.data.len());
        let end = (start + size as usize).min(entry.data.len());
        Ok(entry.data[start..end].to_vec())
    }

    fn write(&self, offset: u64, data: &[u8]) -> FsResult<u32> {
        let mut entries = self.entries.lock().unwrap();
        let entry = entries.get_mut(&self.path).ok_or(FsError::NotFound)?;
        let end = offset as usize + data.len();
        if entry.data.len() < end {
            entry.data.resize(end, 0);
        }
        entry.data[offset as usize..end].copy_from_slice(data);
        Ok(data.len() as u32)
    }
}

impl GetAttr for MemoryFs {
    fn get_attr(&self, path: &str, _ctx: &Context) -> FsResult<FileAttr> {
        self.record();
        if let Some(delay) = self.stat_delay {
            std::thread::sleep(delay);
        }
        self.lock().get(path).map(MemEntry::attr).ok_or(FsError::NotFound)
    }
}

impl SetAttr for MemoryFs {
    fn set_attr(&self, path: &str, changes: &SetAttrRequest, _ctx: &Context) -> FsResult<FileAttr> {
        self.record();
        let mut entries = self.lock();
        let entry = entries.get_mut(path).ok_or(FsError::NotFound)?;
        if let Some(mode) = changes.mode {
            entry.perm = (mode & 0o7777) as u16;
        }
        if let Some(size) = changes.size {
            entry.data.resize(size as usize, 0);
        }
        Ok(entry.attr())
    }
}

impl ReadLink for MemoryFs {
    fn read_link(&self, path: &str, _ctx: &Context) -> FsResult<String> {
        self.record();
        let entries = self.lock();
        let entry = entries.get(path).ok_or(FsError::NotFound)?;
        entry.target.clone().ok_or(FsError::InvalidArgument)
    }
}

impl Symlink for MemoryFs {
    fn symlink(&self, target: &str, link_path: &str, _ctx: &Context) -> FsResult<()> {
        self.record();
        let mut entry = MemEntry::new(FileType::Symlink, 0o777);
        entry.target = Some(target.to_string());
        self.create_entry(link_path, entry)
    }
}

impl Mknod for MemoryFs {
    fn mknod(&self, path: &str, mode: u32, _rdev: u32, _ctx: &Context) -> FsResult<()> {
        self.record();
        let kind = FileType::from_mode(mode);
        self.create_entry(path, MemEntry::new(kind, (mode & 0o7777) as u16))
    }
}

impl Mkdir for MemoryFs {
    fn mkdir(&self, path: &str, mode: u32, _ctx: &Context) -> FsResult<()> {
        self.record();
        let entry = MemEntry::new(FileType::Directory, (mode & 0o7777) as u16);
        self.create_entry(path, entry)
    }
}

impl Unlink for MemoryFs {
    fn unlink(&self, path: &str, _ctx: &Context) -> FsResult<()> {
        self.record();
        let mut entries = self.lock();
        match entries.get(path) {
            Some(entry) if entry.kind == FileType::Directory => {
                Err(FsError::IsDirectory)
            }
            Some(_) => {
                entries.remove(path);
                Ok(())
            }
            None => Err(FsError::NotFound),
        }
    }
}

impl Rmdir for MemoryFs {
    fn rmdir(&self, path: &str, _ctx: &Context) -> FsResult<()> {
        self.record();
        let mut entries = self.lock();
        match entries.get(path) {
            Some(entry) if entry.kind != FileType::Directory => {
                Err(FsError::NotDirectory)
            }
            Some(_) if Self::has_children(&entries, path) => Err(FsError::NotEmpty),
            Some(_) => {
                entries.remove(path);
                Ok(())
            }
            None => Err(FsError::NotFound),
        }
    }
}

impl Rename for MemoryFs {
    fn rename(&self, old_path: &str, new_path: &str, _ctx: &Context) -> FsResult<()> {
        self.record();
        if new_path.starts_with("cross-device/") {
            return Err(FsError::Errno(libc::EXDEV));
        }
        let mut entries = self.lock();
        if !entries.contains_key(old_path) {
            return Err(FsError::NotFound);
        }
        if !entries.contains_key(parent_of(new_path)) {
            return Err(FsError::NotFound);
        }
        let prefix = format!("{old_path}/");
        let moved: Vec<String> = entries
            .keys()
            .filter(|key| key.as_str() == old_path || key.starts_with(&prefix))
            .cloned()
            .collect();
        for key in moved {
            if let Some(entry) = entries.remove(&key) {
                let renamed = format!("{new_path}{}", &key[old_path.len()..]);
                entries.insert(renamed, entry);
            }
        }
        Ok(())
    }
}

impl Link for MemoryFs {
    fn link(&self, existing_path: &str, new_path: &str, _ctx: &Context) -> FsResult<()> {
        self.record();
        let entry = self.lock().get(existing_path).cloned().ok_or(FsError::NotFound)?;
        self.create_entry(new_path, entry)
    }
}

impl Access for MemoryFs {
    fn access(&self, path: &str, _mask: i32, _ctx: &Context) -> FsResult<()> {
        self.record();
        if self.exists(path) {
            Ok(())
        } else {
            Err(FsError::NotFound)
        }
    }
}

impl Open for MemoryFs {
    fn open(&self, path: &str, flags: i32, _ctx: &Context) -> FsResult<Box<dyn FileHandle>> {
        self.record();
        let mut entries = self.lock();
        let entry = entries.get_mut(path).ok_or(FsError::NotFound)?;
        if entry.kind == FileType::Directory {
            return Err(FsError::IsDirectory);
        }
        if flags & libc::O_TRUNC != 0 {
            entry.data.clear();
        }
        Ok(Box::new(MemHandle {
            entries: Arc::clone(&self.entries),
            path: path.to_string(),
        }))
    }
}

impl Create for MemoryFs {
    fn create(
        &self,
        path: &str,
        _flags: i32,
        mode: u32,
        _ctx: &Context,
    ) -> FsResult<Box<dyn FileHandle>> {
        self.record();
        let entry = MemEntry::new(FileType::RegularFile, (mode & 0o7777) as u16);
        self.create_entry(path, entry)?;
        Ok(Box::new(MemHandle {
            entries: Arc::clone(&self.entries),
            path: path.to_string(),
        }))
    }
}

impl ReadDir for MemoryFs {
    fn read_dir(&self, path: &str, _ctx: &Context) -> FsResult<Vec<DirEntry>> {
        self.record();
        let entries = self.lock();
        match entries.get(path) {
            Some(entry) if entry.kind == FileType::Directory => {}
            Some(_) => return Err(FsError::NotDirectory),
            None => return Err(FsError::NotFound),
        }
        Ok(entries
            .iter()
            .filter(|(key, _)| !key.is_empty() && key.as_str() != path)
            .filter(|(key, _)| parent_of(key) == path)
            .map(|(key, entry)| DirEntry::new(name_of(key), entry.kind))
            .collect())
    }
}

impl StatFs for MemoryFs {
    fn stat_fs(&self, _path: &str, _ctx: &Context) -> FsResult<StatFsOut> {
        self.record();
        let files = self.lock().len() as u64;
        Ok(StatFsOut {
            blocks: 1024,
            bfree: 512,
            bavail: 512,
            files,
            ffree: 1024 - files,
            bsize: 4096,
            namelen: 255,
            frsize: 4096,
        })
    }
}

impl SetXAttr for MemoryFs {
    fn set_xattr(
        &self,
        path: &str,
        name: &str,
        value: &[u8],
        flags: i32,
        _ctx: &Context,
    ) -> FsResult<()> {
        self.record();
        let mut entries = self.lock();
        let entry = entries.get_mut(path).ok_or(FsError::NotFound)?;
        let exists = entry.xattrs.contains_key(name);
        if flags == XATTR_CREATE && exists {
            return Err(FsError::AlreadyExists);
        }
        if flags == XATTR_REPLACE && !exists {
            return Err(FsError::NoData);
        }
        entry.xattrs.insert(name.to_string(), value.to_vec());
        Ok(())
    }
}

impl GetXAttr for MemoryFs {
    fn get_xattr(&self, path: &str, name: &str, _ctx: &Context) -> FsResult<Vec<u8>> {
        self.record();
        let entries = self.lock();
        let entry = entries.get(path).ok_or(FsError::NotFound)?;
        entry.xattrs.get(name).cloned().ok_or(FsError::NoData)
    }
}

impl ListXAttr for MemoryFs {
    fn list_xattr(&self, path: &str, _ctx: &Context) -> FsResult<Vec<String>> {
        self.record();
        let entries = self.lock();
        let entry = entries.get(path).ok_or(FsError::NotFound)?;
        Ok(entry.xattrs.keys().cloned().collect())
    }
}

impl RemoveXAttr for MemoryFs {
    fn remove_xattr(&self, path: &str, name: &str, _ctx: &Context) -> FsResult<()> {
        self.record();
        let mut entries = self.lock();
        let entry = entries.get_mut(path).ok_or(FsError::NotFound)?;
        entry.xattrs.remove(name).map(|_| ()).ok_or(FsError::NoData)
    }
}

impl FileSystem for MemoryFs {
    fn name(&self) -> &str {
        "memory"
    }
    fn get_attr(&self) -> Option<&dyn GetAttr> {
        Some(self)
    }
    fn set_attr(&self) -> Option<&dyn SetAttr> {
        Some(self)
    }
    fn read_link(&self) -> Option<&dyn ReadLink> {
        Some(self)
    }
    fn symlink(&self) -> Option<&dyn Symlink> {
        Some(self)
    }
    fn mknod(&self) -> Option<&dyn Mknod> {
        Some(self)
    }
    fn mkdir(&self) -> Option<&dyn Mkdir> {
        Some(self)
    }
    fn unlink(&self) -> Option<&dyn Unlink> {
        Some(self)
    }
    fn rmdir(&self) -> Option<&dyn Rmdir> {
        Some(self)
    }
    fn rename(&self) -> Option<&dyn Rename> {
        Some(self)
    }
    fn link(&self) -> Option<&dyn Link> {
        Some(self)
    }
    fn access(&self) -> Option<&dyn Access> {
        Some(self)
    }
    fn open(&self) -> Option<&dyn Open> {
        Some(self)
    }
    fn create(&self) -> Option<&dyn Create> {
        Some(self)
    }
    fn read_dir(&self) -> Option<&dyn ReadDir> {
        Some(self)
    }
    fn stat_fs(&self) -> Option<&dyn StatFs> {
        Some(self)
    }
    fn set_xattr(&self) -> Option<&dyn SetXAttr> {
        Some(self)
    }
    fn get_xattr(&self) -> Option<&dyn GetXAttr> {
        Some(self)
    }
    fn list_xattr(&self) -> Option<&dyn ListXAttr> {
        Some(self)
    }
    fn remove_xattr(&self) -> Option<&dyn RemoveXAttr> {
        Some(self)
    }
}

/// Backend declaring no capability at all
pub struct BareFs;

impl FileSystem for BareFs {}

/// A mounted backend plus the simulated kernel driving it
pub struct TestMount {
    pub handle: MountHandle,
    pub kernel: KernelSide,
}

pub fn mount_backend(backend: Arc<dyn FileSystem>, options: MountOptions) -> TestMount {
    let (provider, kernel) = loopback::pair();
    let handle = mount(&provider, "/mnt/pathfs-test", backend, options).unwrap();
    let init = kernel.init_reply().unwrap();
    assert!(init.is_ok(), "handshake failed: {init:?}");
    TestMount { handle, kernel }
}

impl TestMount {
    pub fn call(&self, node: NodeId, op: Operation) -> Reply {
        self.kernel.call(node, op).unwrap()
    }

    /// Look `name` up under `parent` and return the entry; panics on failure.
    pub fn lookup(&self, parent: NodeId, name: &str) -> EntryOut {
        let reply = self.call(parent, Operation::Lookup { name: name.into() });
        match reply.payload {
            ReplyPayload::Entry(entry) if reply.is_ok() => entry,
            _ => panic!("lookup of {name} failed: {reply:?}"),
        }
    }

    /// Poll the registry until `condition` holds. Forgets have no reply, so
    /// this is the only way to observe that one was processed.
    pub fn wait_until(&self, condition: impl Fn(&NodeRegistry) -> bool) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !condition(self.handle.registry()) {
            assert!(Instant::now() < deadline, "registry condition not reached");
            std::thread::sleep(Duration::from_millis(1));
        }
    }

    pub fn getxattr(&self, node: NodeId, name: &str, size: u32) -> Reply {
        self.call(
            node,
            Operation::GetXAttr {
                name: name.into(),
                size,
            },
        )
    }

    pub fn setxattr(&self, node: NodeId, name: &str, value: &[u8], flags: i32) -> Reply {
        self.call(
            node,
            Operation::SetXAttr {
                name: name.into(),
                value: value.to_vec(),
                flags,
            },
        )
    }

    pub fn listxattr(&self, node: NodeId, size: u32) -> Reply {
        self.call(node, Operation::ListXAttr { size })
    }

    pub fn removexattr(&self, node: NodeId, name: &str) -> Reply {
        self.call(node, Operation::RemoveXAttr { name: name.into() })
    }

    /// Attribute value, using a buffer large enough for any test value.
    pub fn xattr_value(&self, node: NodeId, name: &str) -> Result<Vec<u8>, i32> {
        let reply = self.getxattr(node, name, 64 * 1024);
        match reply.payload {
            ReplyPayload::Data(data) if reply.is_ok() => Ok(data),
            _ => Err(reply.errno),
        }
    }

    pub fn xattr_names(&self, node: NodeId) -> Result<Vec<String>, i32> {
        let reply = self.listxattr(node, 64 * 1024);
        match reply.payload {
            ReplyPayload::Data(data) if reply.is_ok() => Ok(data
                .split(|b| *b == 0)
                .filter(|s| !s.is_empty())
                .map(|s| String::from_utf8_lossy(s).into_owned())
                .collect()),
            _ => Err(reply.errno),
        }
    }
}
