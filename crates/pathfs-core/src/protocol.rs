// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Decoded FUSE requests and replies
//!
//! The byte-level message layout belongs to the kernel channel. Everything in
//! the dispatch layer works on these decoded forms.

use std::time::{Duration, SystemTime};

/// Kernel-visible node identifier
pub type NodeId = u64;

/// Reserved identifier of the mount root
pub const ROOT_ID: NodeId = 1;

/// Protocol major version spoken by this layer
pub const KERNEL_VERSION: u32 = 7;

/// Highest protocol minor version this layer understands
pub const KERNEL_MINOR_VERSION: u32 = 31;

/// Oldest kernel minor version accepted during the handshake
pub const MINIMUM_MINOR_VERSION: u32 = 13;

/// Maximum single path component length
pub const NAME_MAX: usize = 255;

/// `setxattr` flag: fail if the attribute already exists
pub const XATTR_CREATE: i32 = libc::XATTR_CREATE;

/// `setxattr` flag: fail if the attribute does not exist
pub const XATTR_REPLACE: i32 = libc::XATTR_REPLACE;

/// Inode number reported in directory listings when the entry is not registered
pub const UNKNOWN_INO: u64 = 0xffff_ffff;

/// FUSE opcodes, numbered as on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum Opcode {
    Lookup = 1,
    Forget = 2,
    GetAttr = 3,
    SetAttr = 4,
    ReadLink = 5,
    Symlink = 6,
    Mknod = 8,
    Mkdir = 9,
    Unlink = 10,
    Rmdir = 11,
    Rename = 12,
    Link = 13,
    Open = 14,
    Read = 15,
    Write = 16,
    StatFs = 17,
    Release = 18,
    Fsync = 20,
    SetXAttr = 21,
    GetXAttr = 22,
    ListXAttr = 23,
    RemoveXAttr = 24,
    Flush = 25,
    Init = 26,
    OpenDir = 27,
    ReadDir = 28,
    ReleaseDir = 29,
    Access = 34,
    Create = 35,
    Destroy = 38,
    BatchForget = 42,
}

/// Identity of the process issuing a request
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RequestContext {
    pub uid: u32,
    pub gid: u32,
    pub pid: u32,
}

/// Either an explicit timestamp or "now"
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeOrNow {
    SpecificTime(SystemTime),
    Now,
}

/// Attribute changes carried by a `SetAttr` request; `None` leaves a field untouched.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SetAttrRequest {
    pub mode: Option<u32>,
    pub uid: Option<u32>,
    pub gid: Option<u32>,
    pub size: Option<u64>,
    pub atime: Option<TimeOrNow>,
    pub mtime: Option<TimeOrNow>,
    pub fh: Option<u64>,
}

/// Decoded operation body
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Operation {
    Init {
        major: u32,
        minor: u32,
        max_readahead: u32,
        flags: u32,
    },
    Destroy,
    Lookup {
        name: String,
    },
    Forget {
        nlookup: u64,
    },
    BatchForget {
        nodes: Vec<(NodeId, u64)>,
    },
    GetAttr,
    SetAttr(SetAttrRequest),
    ReadLink,
    Symlink {
        name: String,
        target: String,
    },
    Mknod {
        name: String,
        mode: u32,
        rdev: u32,
    },
    Mkdir {
        name: String,
        mode: u32,
    },
    Unlink {
        name: String,
    },
    Rmdir {
        name: String,
    },
    Rename {
        name: String,
        new_parent: NodeId,
        new_name: String,
    },
    Link {
        new_parent: NodeId,
        new_name: String,
    },
    Open {
        flags: i32,
    },
    Read {
        fh: u64,
        offset: u64,
        size: u32,
    },
    Write {
        fh: u64,
        offset: u64,
        data: Vec<u8>,
    },
    StatFs,
    Release {
        fh: u64,
    },
    Fsync {
        fh: u64,
        datasync: bool,
    },
    Flush {
        fh: u64,
    },
    OpenDir {
        flags: i32,
    },
    ReadDir {
        fh: u64,
        offset: u64,
        size: u32,
    },
    ReleaseDir {
        fh: u64,
    },
    Access {
        mask: i32,
    },
    Create {
        name: String,
        mode: u32,
        flags: i32,
    },
    GetXAttr {
        name: String,
        size: u32,
    },
    SetXAttr {
        name: String,
        value: Vec<u8>,
        flags: i32,
    },
    ListXAttr {
        size: u32,
    },
    RemoveXAttr {
        name: String,
    },
    /// Opcode this layer does not decode.
    Unknown(u32),
}

impl Operation {
    /// Wire opcode, or the raw value for unknown operations.
    pub fn opcode(&self) -> u32 {
        let opcode = match self {
            Operation::Init { .. } => Opcode::Init,
            Operation::Destroy => Opcode::Destroy,
            Operation::Lookup { .. } => Opcode::Lookup,
            Operation::Forget { .. } => Opcode::Forget,
            Operation::BatchForget { .. } => Opcode::BatchForget,
            Operation::GetAttr => Opcode::GetAttr,
            Operation::SetAttr(_) => Opcode::SetAttr,
            Operation::ReadLink => Opcode::ReadLink,
            Operation::Symlink { .. } => Opcode::Symlink,
            Operation::Mknod { .. } => Opcode::Mknod,
            Operation::Mkdir { .. } => Opcode::Mkdir,
            Operation::Unlink { .. } => Opcode::Unlink,
            Operation::Rmdir { .. } => Opcode::Rmdir,
            Operation::Rename { .. } => Opcode::Rename,
            Operation::Link { .. } => Opcode::Link,
            Operation::Open { .. } => Opcode::Open,
            Operation::Read { .. } => Opcode::Read,
            Operation::Write { .. } => Opcode::Write,
            Operation::StatFs => Opcode::StatFs,
            Operation::Release { .. } => Opcode::Release,
            Operation::Fsync { .. } => Opcode::Fsync,
            Operation::Flush { .. } => Opcode::Flush,
            Operation::OpenDir { .. } => Opcode::OpenDir,
            Operation::ReadDir { .. } => Opcode::ReadDir,
            Operation::ReleaseDir { .. } => Opcode::ReleaseDir,
            Operation::Access { .. } => Opcode::Access,
            Operation::Create { .. } => Opcode::Create,
            Operation::GetXAttr { .. } => Opcode::GetXAttr,
            Operation::SetXAttr { .. } => Opcode::SetXAttr,
            Operation::ListXAttr { .. } => Opcode::ListXAttr,
            Operation::RemoveXAttr { .. } => Opcode::RemoveXAttr,
            Operation::Unknown(raw) => return *raw,
        };
        opcode as u32
    }

    /// Whether the operation modifies filesystem state.
    ///
    /// `Open` counts as mutating when it asks for write access or truncation.
    pub fn is_mutating(&self) -> bool {
        match self {
            Operation::SetAttr(_)
            | Operation::Symlink { .. }
            | Operation::Mknod { .. }
            | Operation::Mkdir { .. }
            | Operation::Unlink { .. }
            | Operation::Rmdir { .. }
            | Operation::Rename { .. }
            | Operation::Link { .. }
            | Operation::Write { .. }
            | Operation::Create { .. }
            | Operation::SetXAttr { .. }
            | Operation::RemoveXAttr { .. } => true,
            Operation::Open { flags } => open_flags_write(*flags),
            _ => false,
        }
    }

    /// Whether the kernel expects no reply at all.
    pub fn is_forget(&self) -> bool {
        matches!(self, Operation::Forget { .. } | Operation::BatchForget { .. })
    }
}

fn open_flags_write(flags: i32) -> bool {
    let access = flags & libc::O_ACCMODE;
    access == libc::O_WRONLY
        || access == libc::O_RDWR
        || flags & libc::O_TRUNC != 0
        || flags & libc::O_APPEND != 0
}

/// One decoded request as received from the kernel channel
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    /// Request identifier echoed in the reply.
    pub unique: u64,
    /// Node the operation targets (the parent for name-based operations).
    pub node_id: NodeId,
    pub context: RequestContext,
    pub op: Operation,
}

impl Request {
    pub fn new(unique: u64, node_id: NodeId, op: Operation) -> Self {
        Self {
            unique,
            node_id,
            context: RequestContext::default(),
            op,
        }
    }
}

/// File type reported in attributes and directory entries
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FileType {
    NamedPipe,
    CharDevice,
    BlockDevice,
    Directory,
    RegularFile,
    Symlink,
    Socket,
}

impl FileType {
    /// Derive the type from the `S_IFMT` bits of a mode.
    pub fn from_mode(mode: u32) -> Self {
        match mode & libc::S_IFMT {
            m if m == libc::S_IFDIR => FileType::Directory,
            m if m == libc::S_IFLNK => FileType::Symlink,
            m if m == libc::S_IFCHR => FileType::CharDevice,
            m if m == libc::S_IFBLK => FileType::BlockDevice,
            m if m == libc::S_IFIFO => FileType::NamedPipe,
            m if m == libc::S_IFSOCK => FileType::Socket,
            _ => FileType::RegularFile,
        }
    }

    /// `S_IFMT` bits for this type.
    pub fn mode_bits(self) -> u32 {
        match self {
            FileType::NamedPipe => libc::S_IFIFO,
            FileType::CharDevice => libc::S_IFCHR,
            FileType::BlockDevice => libc::S_IFBLK,
            FileType::Directory => libc::S_IFDIR,
            FileType::RegularFile => libc::S_IFREG,
            FileType::Symlink => libc::S_IFLNK,
            FileType::Socket => libc::S_IFSOCK,
        }
    }
}

/// File attributes as reported to the kernel.
///
/// Backends fill everything but `ino`, which the dispatcher overwrites with the
/// node identifier the kernel knows the entry by.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileAttr {
    pub ino: u64,
    pub size: u64,
    pub blocks: u64,
    pub atime: SystemTime,
    pub mtime: SystemTime,
    pub ctime: SystemTime,
    pub kind: FileType,
    pub perm: u16,
    pub nlink: u32,
    pub uid: u32,
    pub gid: u32,
    pub rdev: u32,
    pub blksize: u32,
}

impl FileAttr {
    /// Attributes for an entry of `kind` with permission bits `perm`, everything else zeroed.
    pub fn new(kind: FileType, perm: u16) -> Self {
        Self {
            ino: 0,
            size: 0,
            blocks: 0,
            atime: SystemTime::UNIX_EPOCH,
            mtime: SystemTime::UNIX_EPOCH,
            ctime: SystemTime::UNIX_EPOCH,
            kind,
            perm,
            nlink: if kind == FileType::Directory { 2 } else { 1 },
            uid: 0,
            gid: 0,
            rdev: 0,
            blksize: 512,
        }
    }

    pub fn with_size(mut self, size: u64) -> Self {
        self.size = size;
        self.blocks = size.div_ceil(512);
        self
    }

    /// Full mode word: type bits plus permission bits.
    pub fn mode(&self) -> u32 {
        self.kind.mode_bits() | u32::from(self.perm)
    }
}

/// Reply to entry-producing operations (lookup, mkdir, create, ...)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EntryOut {
    /// Zero for a negative entry.
    pub node_id: NodeId,
    pub generation: u64,
    pub attr: Option<FileAttr>,
    pub entry_ttl: Duration,
    pub attr_ttl: Duration,
}

impl EntryOut {
    pub fn is_negative(&self) -> bool {
        self.node_id == 0
    }
}

/// Filesystem statistics
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatFsOut {
    pub blocks: u64,
    pub bfree: u64,
    pub bavail: u64,
    pub files: u64,
    pub ffree: u64,
    pub bsize: u32,
    pub namelen: u32,
    pub frsize: u32,
}

/// Directory entry as produced by a backend listing
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    pub name: String,
    pub kind: FileType,
}

impl DirEntry {
    pub fn new(name: impl Into<String>, kind: FileType) -> Self {
        Self {
            name: name.into(),
            kind,
        }
    }
}

/// Directory entry as sent to the kernel
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntryOut {
    pub ino: u64,
    /// Offset of the next entry; the kernel passes it back to continue listing.
    pub offset: u64,
    pub kind: FileType,
    pub name: String,
}

impl DirEntryOut {
    /// Bytes this entry occupies in a `fuse_dirent` buffer (24-byte header,
    /// name padded to 8 bytes).
    pub fn encoded_len(&self) -> usize {
        (24 + self.name.len() + 7) & !7
    }
}

/// Successful reply bodies
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplyPayload {
    Empty,
    Init {
        major: u32,
        minor: u32,
        max_readahead: u32,
        max_write: u32,
    },
    Entry(EntryOut),
    Attr {
        attr: FileAttr,
        ttl: Duration,
    },
    Data(Vec<u8>),
    /// Size probe answer for getxattr/listxattr with a zero-sized buffer.
    XAttrSize(u32),
    Open {
        fh: u64,
        flags: u32,
    },
    Written(u32),
    Create {
        entry: EntryOut,
        fh: u64,
        flags: u32,
    },
    StatFs(StatFsOut),
    Directory(Vec<DirEntryOut>),
}

/// One reply written back through the kernel channel
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    pub unique: u64,
    /// Zero on success, otherwise a positive errno.
    pub errno: i32,
    pub payload: ReplyPayload,
}

impl Reply {
    pub fn ok(unique: u64, payload: ReplyPayload) -> Self {
        Self {
            unique,
            errno: 0,
            payload,
        }
    }

    pub fn error(unique: u64, errno: i32) -> Self {
        Self {
            unique,
            errno,
            payload: ReplyPayload::Empty,
        }
    }

    pub fn is_ok(&self) -> bool {
        self.errno == 0
    }
}
