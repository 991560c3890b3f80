// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Capability dispatcher
//!
//! Turns one decoded [`Request`] into a call against the backend capability it
//! names, with the node identifier already resolved to a path, and turns the
//! result back into a [`Reply`]. Registry side effects (lookup, create, rename,
//! unlink, forget) are applied here, synchronously, before the reply exists.

use std::sync::Arc;

use tracing::{debug, trace, warn};

use crate::backend::{Context, FileSystem};
use crate::config::{CacheConfig, MountOptions};
use crate::error::{FsError, FsResult};
use crate::handles::{DirListing, HandleTable, OpenFile};
use crate::protocol::{
    DirEntry, DirEntryOut, EntryOut, FileAttr, FileType, NodeId, Operation, Reply, ReplyPayload,
    Request, SetAttrRequest, UNKNOWN_INO,
};
use crate::registry::{LookupOutcome, NodeEntry, NodeRegistry};
use crate::resolver::{validate_name, PathResolver};

/// Missing capability: the dispatcher answers without calling anything.
fn require<T: ?Sized>(capability: Option<&T>) -> FsResult<&T> {
    capability.ok_or(FsError::NotImplemented)
}

pub struct Dispatcher {
    backend: Arc<dyn FileSystem>,
    resolver: PathResolver,
    files: HandleTable<OpenFile>,
    dirs: HandleTable<DirListing>,
    read_only: bool,
    debug: bool,
    cache: CacheConfig,
}

impl Dispatcher {
    pub fn new(
        backend: Arc<dyn FileSystem>,
        registry: Arc<NodeRegistry>,
        options: &MountOptions,
    ) -> Self {
        Self {
            backend,
            resolver: PathResolver::new(registry),
            files: HandleTable::new(),
            dirs: HandleTable::new(),
            read_only: options.read_only,
            debug: options.debug,
            cache: options.cache.clone(),
        }
    }

    pub fn registry(&self) -> &Arc<NodeRegistry> {
        self.resolver.registry()
    }

    pub fn backend(&self) -> &Arc<dyn FileSystem> {
        &self.backend
    }

    /// Open file and directory handles still held by the kernel.
    pub fn open_handles(&self) -> usize {
        self.files.len() + self.dirs.len()
    }

    /// Handle one request. Forget-type requests produce no reply.
    pub fn dispatch(&self, request: &Request) -> Option<Reply> {
        self.log_request(request);

        if request.op.is_forget() {
            self.forget(request);
            return None;
        }

        let reply = match self.handle(request) {
            Ok(payload) => Reply::ok(request.unique, payload),
            Err(err) => {
                if let FsError::Errno(errno) = err {
                    debug!(
                        target: "pathfs::dispatch",
                        unique = request.unique,
                        errno,
                        "backend status passed through"
                    );
                }
                Reply::error(request.unique, err.to_errno())
            }
        };
        self.log_reply(&reply);
        Some(reply)
    }

    /// Release every handle the kernel did not release before unmount.
    pub fn release_all(&self) {
        let files = self.files.drain();
        let dirs = self.dirs.drain();
        if !files.is_empty() || !dirs.is_empty() {
            debug!(
                target: "pathfs::dispatch",
                files = files.len(),
                dirs = dirs.len(),
                "releasing handles left open at unmount"
            );
        }
        for file in files {
            file.handle.release();
        }
    }

    fn handle(&self, request: &Request) -> FsResult<ReplyPayload> {
        if self.read_only && request.op.is_mutating() {
            return Err(FsError::ReadOnly);
        }

        let ctx = &request.context;
        let node = request.node_id;

        match &request.op {
            Operation::Lookup { name } => self.lookup(node, name, ctx),
            Operation::GetAttr => self.get_attr(node, ctx),
            Operation::SetAttr(changes) => self.set_attr(node, changes, ctx),
            Operation::ReadLink => {
                let path = self.resolver.path_for_request(node)?;
                let target = require(self.backend.read_link())?.read_link(&path, ctx)?;
                Ok(ReplyPayload::Data(target.into_bytes()))
            }
            Operation::Symlink { name, target } => {
                let link_path = self.resolver.child_path(node, name)?;
                require(self.backend.symlink())?.symlink(target, &link_path, ctx)?;
                let fallback = FileAttr::new(FileType::Symlink, 0o777).with_size(target.len() as u64);
                self.created_entry(node, name, fallback, ctx).map(ReplyPayload::Entry)
            }
            Operation::Mknod { name, mode, rdev } => {
                let path = self.resolver.child_path(node, name)?;
                require(self.backend.mknod())?.mknod(&path, *mode, *rdev, ctx)?;
                let fallback = FileAttr::new(FileType::from_mode(*mode), perm_bits(*mode));
                self.created_entry(node, name, fallback, ctx).map(ReplyPayload::Entry)
            }
            Operation::Mkdir { name, mode } => {
                let path = self.resolver.child_path(node, name)?;
                require(self.backend.mkdir())?.mkdir(&path, *mode, ctx)?;
                let fallback = FileAttr::new(FileType::Directory, perm_bits(*mode));
                self.created_entry(node, name, fallback, ctx).map(ReplyPayload::Entry)
            }
            Operation::Unlink { name } => {
                let path = self.resolver.child_path(node, name)?;
                require(self.backend.unlink())?.unlink(&path, ctx)?;
                self.registry().unlink(node, name);
                Ok(ReplyPayload::Empty)
            }
            Operation::Rmdir { name } => {
                let path = self.resolver.child_path(node, name)?;
                require(self.backend.rmdir())?.rmdir(&path, ctx)?;
                self.registry().unlink(node, name);
                Ok(ReplyPayload::Empty)
            }
            Operation::Rename {
                name,
                new_parent,
                new_name,
            } => self.rename(node, name, *new_parent, new_name, ctx),
            Operation::Link {
                new_parent,
                new_name,
            } => {
                let existing = self.resolver.path_for_request(node)?;
                let new_path = self.resolver.child_path(*new_parent, new_name)?;
                require(self.backend.link())?.link(&existing, &new_path, ctx)?;
                let fallback = FileAttr::new(FileType::RegularFile, 0o644);
                self.created_entry(*new_parent, new_name, fallback, ctx)
                    .map(ReplyPayload::Entry)
            }
            Operation::Access { mask } => {
                let path = self.resolver.path_for_request(node)?;
                require(self.backend.access())?.access(&path, *mask, ctx)?;
                Ok(ReplyPayload::Empty)
            }
            Operation::Open { flags } => {
                let path = self.resolver.path_for_request(node)?;
                let handle = require(self.backend.open())?.open(&path, *flags, ctx)?;
                let fh = self.files.insert(OpenFile {
                    node_id: node,
                    handle,
                });
                trace!(target: "pathfs::dispatch", node, fh, path = %path, "opened");
                Ok(ReplyPayload::Open { fh, flags: 0 })
            }
            Operation::Create { name, mode, flags } => self.create(node, name, *mode, *flags, ctx),
            Operation::Read { fh, offset, size } => {
                let file = self.files.get(*fh)?;
                let data = file.handle.read(*offset, *size)?;
                Ok(ReplyPayload::Data(data))
            }
            Operation::Write { fh, offset, data } => {
                let file = self.files.get(*fh)?;
                let written = file.handle.write(*offset, data)?;
                Ok(ReplyPayload::Written(written))
            }
            Operation::Flush { fh } => {
                self.files.get(*fh)?.handle.flush()?;
                Ok(ReplyPayload::Empty)
            }
            Operation::Fsync { fh, datasync } => {
                self.files.get(*fh)?.handle.fsync(*datasync)?;
                Ok(ReplyPayload::Empty)
            }
            Operation::Release { fh } => {
                let file = self.files.remove(*fh)?;
                file.handle.release();
                trace!(target: "pathfs::dispatch", node = file.node_id, fh, "released");
                Ok(ReplyPayload::Empty)
            }
            Operation::StatFs => {
                let path = self.resolver.path_for_request(node)?;
                let stats = require(self.backend.stat_fs())?.stat_fs(&path, ctx)?;
                Ok(ReplyPayload::StatFs(stats))
            }
            Operation::OpenDir { .. } => self.open_dir(node, ctx),
            Operation::ReadDir { fh, offset, size } => self.read_dir(node, *fh, *offset, *size),
            Operation::ReleaseDir { fh } => {
                self.dirs.remove(*fh)?;
                Ok(ReplyPayload::Empty)
            }
            Operation::GetXAttr { name, size } => {
                let path = self.resolver.path_for_request(node)?;
                let value = require(self.backend.get_xattr())?.get_xattr(&path, name, ctx)?;
                sized_reply(value, *size)
            }
            Operation::SetXAttr { name, value, flags } => {
                if name.is_empty() {
                    return Err(FsError::InvalidArgument);
                }
                let path = self.resolver.path_for_request(node)?;
                require(self.backend.set_xattr())?.set_xattr(&path, name, value, *flags, ctx)?;
                Ok(ReplyPayload::Empty)
            }
            Operation::ListXAttr { size } => {
                let path = self.resolver.path_for_request(node)?;
                let names = require(self.backend.list_xattr())?.list_xattr(&path, ctx)?;
                sized_reply(encode_xattr_names(&names), *size)
            }
            Operation::RemoveXAttr { name } => {
                let path = self.resolver.path_for_request(node)?;
                require(self.backend.remove_xattr())?.remove_xattr(&path, name, ctx)?;
                Ok(ReplyPayload::Empty)
            }
            Operation::Destroy => Ok(ReplyPayload::Empty),
            Operation::Init { .. } => {
                warn!(target: "pathfs::dispatch", unique = request.unique, "Init after handshake");
                Err(FsError::InvalidArgument)
            }
            Operation::Unknown(opcode) => {
                debug!(target: "pathfs::dispatch", opcode, "unsupported opcode");
                Err(FsError::NotImplemented)
            }
            Operation::Forget { .. } | Operation::BatchForget { .. } => Ok(ReplyPayload::Empty),
        }
    }

    fn forget(&self, request: &Request) {
        match &request.op {
            Operation::Forget { nlookup } => self.registry().forget(request.node_id, *nlookup),
            Operation::BatchForget { nodes } => {
                for (node_id, nlookup) in nodes {
                    self.registry().forget(*node_id, *nlookup);
                }
            }
            _ => {}
        }
    }

    fn lookup(&self, parent: NodeId, name: &str, ctx: &Context) -> FsResult<ReplyPayload> {
        validate_name(name)?;
        let get_attr = require(self.backend.get_attr())?;
        match self.registry().lookup(parent, name, |path| get_attr.get_attr(path, ctx))? {
            LookupOutcome::Found { entry, attr } => {
                Ok(ReplyPayload::Entry(self.entry_out(entry, attr)))
            }
            LookupOutcome::Absent if self.cache.negative_ttl_ms > 0 => {
                Ok(ReplyPayload::Entry(EntryOut {
                    node_id: 0,
                    generation: 0,
                    attr: None,
                    entry_ttl: self.cache.negative_ttl(),
                    attr_ttl: self.cache.negative_ttl(),
                }))
            }
            LookupOutcome::Absent => Err(FsError::NotFound),
        }
    }

    fn get_attr(&self, node: NodeId, ctx: &Context) -> FsResult<ReplyPayload> {
        let path = self.resolver.path_for_request(node)?;
        let mut attr = require(self.backend.get_attr())?.get_attr(&path, ctx)?;
        attr.ino = node;
        Ok(ReplyPayload::Attr {
            attr,
            ttl: self.cache.attr_ttl(),
        })
    }

    fn set_attr(
        &self,
        node: NodeId,
        changes: &SetAttrRequest,
        ctx: &Context,
    ) -> FsResult<ReplyPayload> {
        let path = self.resolver.path_for_request(node)?;
        let mut attr = require(self.backend.set_attr())?.set_attr(&path, changes, ctx)?;
        attr.ino = node;
        Ok(ReplyPayload::Attr {
            attr,
            ttl: self.cache.attr_ttl(),
        })
    }

    fn rename(
        &self,
        parent: NodeId,
        name: &str,
        new_parent: NodeId,
        new_name: &str,
        ctx: &Context,
    ) -> FsResult<ReplyPayload> {
        let old_path = self.resolver.child_path(parent, name)?;
        let new_path = self.resolver.child_path(new_parent, new_name)?;
        require(self.backend.rename())?.rename(&old_path, &new_path, ctx)?;

        if let Err(err) = self.registry().register_rename(parent, name, new_parent, new_name) {
            warn!(
                target: "pathfs::dispatch",
                old = %old_path,
                new = %new_path,
                %err,
                "backend renamed but the registry could not follow"
            );
            return Err(err.into());
        }
        Ok(ReplyPayload::Empty)
    }

    fn create(
        &self,
        parent: NodeId,
        name: &str,
        mode: u32,
        flags: i32,
        ctx: &Context,
    ) -> FsResult<ReplyPayload> {
        let path = self.resolver.child_path(parent, name)?;
        let handle = require(self.backend.create())?.create(&path, flags, mode, ctx)?;
        let fallback = FileAttr::new(FileType::RegularFile, perm_bits(mode));
        let entry = match self.created_entry(parent, name, fallback, ctx) {
            Ok(entry) => entry,
            Err(err) => {
                handle.release();
                return Err(err);
            }
        };
        let fh = self.files.insert(OpenFile {
            node_id: entry.node_id,
            handle,
        });
        Ok(ReplyPayload::Create {
            entry,
            fh,
            flags: 0,
        })
    }

    /// Register a child the backend just created and build its entry reply.
    ///
    /// Attributes come from the backend when it can report them, otherwise
    /// from `fallback`.
    fn created_entry(
        &self,
        parent: NodeId,
        name: &str,
        fallback: FileAttr,
        ctx: &Context,
    ) -> FsResult<EntryOut> {
        match self.backend.get_attr() {
            Some(get_attr) => {
                match self.registry().lookup(parent, name, |path| get_attr.get_attr(path, ctx))? {
                    LookupOutcome::Found { entry, attr } => Ok(self.entry_out(entry, attr)),
                    LookupOutcome::Absent => {
                        warn!(target: "pathfs::dispatch", parent, name, "created entry not found");
                        Err(FsError::Io(format!("created entry {name} vanished")))
                    }
                }
            }
            None => {
                let entry = self.registry().register(parent, name)?;
                let mut attr = fallback;
                attr.ino = entry.node_id;
                Ok(self.entry_out(entry, attr))
            }
        }
    }

    fn entry_out(&self, entry: NodeEntry, attr: FileAttr) -> EntryOut {
        EntryOut {
            node_id: entry.node_id,
            generation: entry.generation,
            attr: Some(attr),
            entry_ttl: self.cache.entry_ttl(),
            attr_ttl: self.cache.attr_ttl(),
        }
    }

    fn open_dir(&self, node: NodeId, ctx: &Context) -> FsResult<ReplyPayload> {
        let path = self.resolver.path_for_request(node)?;
        let listing = require(self.backend.read_dir())?.read_dir(&path, ctx)?;

        let mut entries = Vec::with_capacity(listing.len() + 2);
        entries.push(DirEntry::new(".", FileType::Directory));
        entries.push(DirEntry::new("..", FileType::Directory));
        entries.extend(listing.into_iter().filter(|e| e.name != "." && e.name != ".."));

        let fh = self.dirs.insert(DirListing {
            node_id: node,
            entries,
        });
        Ok(ReplyPayload::Open { fh, flags: 0 })
    }

    /// Page through a listing captured at opendir. `offset` is the index of the
    /// first entry to return; each returned entry carries the offset of the next.
    fn read_dir(&self, node: NodeId, fh: u64, offset: u64, size: u32) -> FsResult<ReplyPayload> {
        let listing = self.dirs.get(fh)?;
        let parent = self.registry().info(node).and_then(|info| info.parent);

        let mut budget = size as usize;
        let mut out = Vec::new();
        let start = usize::try_from(offset).unwrap_or(usize::MAX);
        for (index, entry) in listing.entries.iter().enumerate().skip(start) {
            let ino = match entry.name.as_str() {
                "." => node,
                ".." => parent.unwrap_or(node),
                name => self.registry().child(node, name).unwrap_or(UNKNOWN_INO),
            };
            let dirent = DirEntryOut {
                ino,
                offset: index as u64 + 1,
                kind: entry.kind,
                name: entry.name.clone(),
            };
            let len = dirent.encoded_len();
            if len > budget {
                break;
            }
            budget -= len;
            out.push(dirent);
        }
        Ok(ReplyPayload::Directory(out))
    }

    fn log_request(&self, request: &Request) {
        if self.debug {
            debug!(
                target: "pathfs::dispatch",
                unique = request.unique,
                node = request.node_id,
                opcode = request.op.opcode(),
                op = ?request.op,
                "request"
            );
        } else {
            trace!(
                target: "pathfs::dispatch",
                unique = request.unique,
                node = request.node_id,
                opcode = request.op.opcode(),
                "request"
            );
        }
    }

    fn log_reply(&self, reply: &Reply) {
        if self.debug {
            debug!(target: "pathfs::dispatch", unique = reply.unique, errno = reply.errno, "reply");
        } else {
            trace!(target: "pathfs::dispatch", unique = reply.unique, errno = reply.errno, "reply");
        }
    }
}

fn perm_bits(mode: u32) -> u16 {
    (mode & 0o7777) as u16
}

/// Size-probe convention shared by getxattr and listxattr: a zero size asks
/// for the length, a short buffer is `ERANGE`, never a truncated value.
fn sized_reply(value: Vec<u8>, size: u32) -> FsResult<ReplyPayload> {
    if size == 0 {
        let len = u32::try_from(value.len()).map_err(|_| FsError::Range)?;
        Ok(ReplyPayload::XAttrSize(len))
    } else if value.len() <= size as usize {
        Ok(ReplyPayload::Data(value))
    } else {
        Err(FsError::Range)
    }
}

/// NUL-terminated name list, each name once in first-seen order.
fn encode_xattr_names(names: &[String]) -> Vec<u8> {
    let mut seen = std::collections::HashSet::new();
    let mut buffer = Vec::new();
    for name in names {
        if seen.insert(name.as_str()) {
            buffer.extend_from_slice(name.as_bytes());
            buffer.push(0);
        }
    }
    buffer
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{FileHandle, GetAttr, Open, ReadDir, Rename};
    use crate::protocol::ROOT_ID;

    struct Tree {
        dirs: Vec<&'static str>,
        files: Vec<&'static str>,
    }

    impl GetAttr for Tree {
        fn get_attr(&self, path: &str, _ctx: &Context) -> FsResult<FileAttr> {
            if path.is_empty() || self.dirs.contains(&path) {
                Ok(FileAttr::new(FileType::Directory, 0o755))
            } else if self.files.contains(&path) {
                Ok(FileAttr::new(FileType::RegularFile, 0o644).with_size(5))
            } else {
                Err(FsError::NotFound)
            }
        }
    }

    impl Rename for Tree {
        fn rename(&self, _old: &str, _new: &str, _ctx: &Context) -> FsResult<()> {
            Ok(())
        }
    }

    impl ReadDir for Tree {
        fn read_dir(&self, _path: &str, _ctx: &Context) -> FsResult<Vec<DirEntry>> {
            Ok(self
                .files
                .iter()
                .filter(|name| !name.contains('/'))
                .map(|name| DirEntry::new(*name, FileType::RegularFile))
                .collect())
        }
    }

    struct Hello;

    impl FileHandle for Hello {
        fn read(&self, offset: u64, size: u32) -> FsResult<Vec<u8>> {
            let data = b"hello";
            let start = (offset as usize).min(data.len());
            let end = (start + size as usize).min(data.len());
            Ok(data[start..end].to_vec())
        }
    }

    impl Open for Tree {
        fn open(&self, _path: &str, _flags: i32, _ctx: &Context) -> FsResult<Box<dyn FileHandle>> {
            Ok(Box::new(Hello))
        }
    }

    impl FileSystem for Tree {
        fn get_attr(&self) -> Option<&dyn GetAttr> {
            Some(self)
        }
        fn rename(&self) -> Option<&dyn Rename> {
            Some(self)
        }
        fn read_dir(&self) -> Option<&dyn ReadDir> {
            Some(self)
        }
        fn open(&self) -> Option<&dyn Open> {
            Some(self)
        }
    }

    fn dispatcher(options: MountOptions) -> Dispatcher {
        let tree = Tree {
            dirs: vec!["dir"],
            files: vec!["a", "b", "dir/c"],
        };
        Dispatcher::new(Arc::new(tree), Arc::new(NodeRegistry::new()), &options)
    }

    fn call(dispatcher: &Dispatcher, node: NodeId, op: Operation) -> Reply {
        dispatcher.dispatch(&Request::new(1, node, op)).expect("reply")
    }

    fn lookup(dispatcher: &Dispatcher, parent: NodeId, name: &str) -> NodeId {
        let reply = call(dispatcher, parent, Operation::Lookup { name: name.into() });
        match reply.payload {
            ReplyPayload::Entry(entry) => entry.node_id,
            other => panic!("unexpected payload {other:?}"),
        }
    }

    #[test]
    fn lookup_stamps_node_id_into_attributes() {
        let d = dispatcher(MountOptions::default());
        let reply = call(&d, ROOT_ID, Operation::Lookup { name: "a".into() });
        let ReplyPayload::Entry(entry) = reply.payload else {
            panic!("expected entry");
        };
        assert_eq!(entry.attr.map(|a| a.ino), Some(entry.node_id));
        assert_eq!(entry.attr.map(|a| a.size), Some(5));
    }

    #[test]
    fn absent_lookup_is_enoent_or_negative_entry() {
        let d = dispatcher(MountOptions::default());
        let reply = call(&d, ROOT_ID, Operation::Lookup { name: "nope".into() });
        assert_eq!(reply.errno, libc::ENOENT);

        let mut options = MountOptions::default();
        options.cache.negative_ttl_ms = 500;
        let d = dispatcher(options);
        let reply = call(&d, ROOT_ID, Operation::Lookup { name: "nope".into() });
        assert!(matches!(reply.payload, ReplyPayload::Entry(e) if e.is_negative()));
        assert_eq!(d.registry().len(), 1);
    }

    #[test]
    fn missing_capability_is_enosys_not_enoent() {
        let d = dispatcher(MountOptions::default());
        let reply = call(
            &d,
            ROOT_ID,
            Operation::GetXAttr {
                name: "user.x".into(),
                size: 0,
            },
        );
        assert_eq!(reply.errno, libc::ENOSYS);
        assert_eq!(call(&d, ROOT_ID, Operation::Unknown(4242)).errno, libc::ENOSYS);
    }

    #[test]
    fn read_only_rejects_mutations_before_the_backend() {
        let d = dispatcher(MountOptions {
            read_only: true,
            ..MountOptions::default()
        });
        let reply = call(
            &d,
            ROOT_ID,
            Operation::Rename {
                name: "a".into(),
                new_parent: ROOT_ID,
                new_name: "z".into(),
            },
        );
        assert_eq!(reply.errno, libc::EROFS);
        let reply = call(&d, ROOT_ID, Operation::Open { flags: libc::O_RDWR });
        assert_eq!(reply.errno, libc::EROFS);
        assert!(call(&d, ROOT_ID, Operation::GetAttr).is_ok());
    }

    #[test]
    fn rename_is_visible_to_the_next_request() {
        let d = dispatcher(MountOptions::default());
        let dir = lookup(&d, ROOT_ID, "dir");
        let c = lookup(&d, dir, "c");

        let reply = call(
            &d,
            dir,
            Operation::Rename {
                name: "c".into(),
                new_parent: ROOT_ID,
                new_name: "b".into(),
            },
        );
        assert!(reply.is_ok());
        assert_eq!(d.registry().resolve(c).unwrap(), "b");
    }

    #[test]
    fn forget_produces_no_reply() {
        let d = dispatcher(MountOptions::default());
        let a = lookup(&d, ROOT_ID, "a");
        assert!(d
            .dispatch(&Request::new(2, a, Operation::Forget { nlookup: 1 }))
            .is_none());
        assert_eq!(call(&d, a, Operation::GetAttr).errno, libc::ESTALE);
    }

    #[test]
    fn readdir_pages_under_the_byte_budget() {
        let d = dispatcher(MountOptions::default());
        let ReplyPayload::Open { fh, .. } = call(&d, ROOT_ID, Operation::OpenDir { flags: 0 }).payload
        else {
            panic!("expected open");
        };

        // Room for exactly two 32-byte entries.
        let first = call(&d, ROOT_ID, Operation::ReadDir { fh, offset: 0, size: 64 });
        let ReplyPayload::Directory(page) = first.payload else {
            panic!("expected directory");
        };
        assert_eq!(page.iter().map(|e| e.name.as_str()).collect::<Vec<_>>(), [".", ".."]);

        let next = page[1].offset;
        let rest = call(&d, ROOT_ID, Operation::ReadDir { fh, offset: next, size: 4096 });
        let ReplyPayload::Directory(page) = rest.payload else {
            panic!("expected directory");
        };
        let names: Vec<_> = page.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, ["a", "b"]);
        assert!(page.iter().all(|e| e.ino == UNKNOWN_INO));

        assert!(call(&d, ROOT_ID, Operation::ReleaseDir { fh }).is_ok());
        assert_eq!(
            call(&d, ROOT_ID, Operation::ReadDir { fh, offset: 0, size: 64 }).errno,
            libc::EBADF
        );
    }

    #[test]
    fn open_read_release() {
        let d = dispatcher(MountOptions::default());
        let a = lookup(&d, ROOT_ID, "a");
        let ReplyPayload::Open { fh, .. } = call(&d, a, Operation::Open { flags: 0 }).payload else {
            panic!("expected open");
        };
        let reply = call(&d, a, Operation::Read { fh, offset: 1, size: 3 });
        assert_eq!(reply.payload, ReplyPayload::Data(b"ell".to_vec()));
        assert_eq!(
            call(&d, a, Operation::Write { fh, offset: 0, data: vec![1] }).errno,
            libc::ENOTSUP
        );
        assert!(call(&d, a, Operation::Release { fh }).is_ok());
        assert_eq!(d.open_handles(), 0);
    }

    #[test]
    fn xattr_size_probe_and_range() {
        assert_eq!(sized_reply(b"value".to_vec(), 0), Ok(ReplyPayload::XAttrSize(5)));
        assert_eq!(sized_reply(b"value".to_vec(), 4), Err(FsError::Range));
        assert_eq!(
            sized_reply(b"value".to_vec(), 5),
            Ok(ReplyPayload::Data(b"value".to_vec()))
        );
    }

    #[test]
    fn xattr_names_are_listed_once() {
        let names = vec!["user.a".to_string(), "user.b".to_string(), "user.a".to_string()];
        assert_eq!(encode_xattr_names(&names), b"user.a\0user.b\0".to_vec());
    }
}
