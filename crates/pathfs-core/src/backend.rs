// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Backend filesystem capability contract
//!
//! A backend implements any subset of the capability traits below and
//! advertises them through the probe methods of [`FileSystem`]. Every
//! capability receives a path relative to the mount root (`""` is the root,
//! components are joined with `/`), never a kernel node identifier.
//!
//! ```ignore
//! impl GetXAttr for MyFs {
//!     fn get_xattr(&self, path: &str, name: &str, ctx: &Context) -> FsResult<Vec<u8>> { ... }
//! }
//!
//! impl FileSystem for MyFs {
//!     fn get_xattr(&self) -> Option<&dyn GetXAttr> {
//!         Some(self)
//!     }
//! }
//! ```

use crate::error::{FsError, FsResult};
use crate::protocol::{DirEntry, FileAttr, RequestContext, SetAttrRequest, StatFsOut};

/// Caller identity handed to every capability
pub type Context = RequestContext;

pub trait GetAttr: Send + Sync {
    fn get_attr(&self, path: &str, ctx: &Context) -> FsResult<FileAttr>;
}

pub trait SetAttr: Send + Sync {
    /// Apply the requested changes and return the resulting attributes.
    fn set_attr(&self, path: &str, changes: &SetAttrRequest, ctx: &Context)
        -> FsResult<FileAttr>;
}

pub trait ReadLink: Send + Sync {
    fn read_link(&self, path: &str, ctx: &Context) -> FsResult<String>;
}

pub trait Symlink: Send + Sync {
    fn symlink(&self, target: &str, link_path: &str, ctx: &Context) -> FsResult<()>;
}

pub trait Mknod: Send + Sync {
    fn mknod(&self, path: &str, mode: u32, rdev: u32, ctx: &Context) -> FsResult<()>;
}

pub trait Mkdir: Send + Sync {
    fn mkdir(&self, path: &str, mode: u32, ctx: &Context) -> FsResult<()>;
}

pub trait Unlink: Send + Sync {
    fn unlink(&self, path: &str, ctx: &Context) -> FsResult<()>;
}

pub trait Rmdir: Send + Sync {
    fn rmdir(&self, path: &str, ctx: &Context) -> FsResult<()>;
}

pub trait Rename: Send + Sync {
    fn rename(&self, old_path: &str, new_path: &str, ctx: &Context) -> FsResult<()>;
}

pub trait Link: Send + Sync {
    fn link(&self, existing_path: &str, new_path: &str, ctx: &Context) -> FsResult<()>;
}

pub trait Access: Send + Sync {
    fn access(&self, path: &str, mask: i32, ctx: &Context) -> FsResult<()>;
}

pub trait Open: Send + Sync {
    fn open(&self, path: &str, flags: i32, ctx: &Context) -> FsResult<Box<dyn FileHandle>>;
}

pub trait Create: Send + Sync {
    fn create(
        &self,
        path: &str,
        flags: i32,
        mode: u32,
        ctx: &Context,
    ) -> FsResult<Box<dyn FileHandle>>;
}

pub trait ReadDir: Send + Sync {
    /// Full listing of a directory, without `.` and `..`.
    fn read_dir(&self, path: &str, ctx: &Context) -> FsResult<Vec<DirEntry>>;
}

pub trait StatFs: Send + Sync {
    fn stat_fs(&self, path: &str, ctx: &Context) -> FsResult<StatFsOut>;
}

pub trait SetXAttr: Send + Sync {
    /// Store `value` under `name`. `flags` is passed through from the caller
    /// unmodified (`XATTR_CREATE`, `XATTR_REPLACE` or zero).
    fn set_xattr(
        &self,
        path: &str,
        name: &str,
        value: &[u8],
        flags: i32,
        ctx: &Context,
    ) -> FsResult<()>;
}

pub trait GetXAttr: Send + Sync {
    /// Full attribute value. Absent attribute: [`FsError::NoData`].
    fn get_xattr(&self, path: &str, name: &str, ctx: &Context) -> FsResult<Vec<u8>>;
}

pub trait ListXAttr: Send + Sync {
    fn list_xattr(&self, path: &str, ctx: &Context) -> FsResult<Vec<String>>;
}

pub trait RemoveXAttr: Send + Sync {
    fn remove_xattr(&self, path: &str, name: &str, ctx: &Context) -> FsResult<()>;
}

/// An opened file.
///
/// Every method is optional; the defaults report [`FsError::NotSupported`]
/// except the lifecycle hooks, which succeed.
pub trait FileHandle: Send + Sync {
    fn read(&self, offset: u64, size: u32) -> FsResult<Vec<u8>> {
        let _ = (offset, size);
        Err(FsError::NotSupported)
    }

    fn write(&self, offset: u64, data: &[u8]) -> FsResult<u32> {
        let _ = (offset, data);
        Err(FsError::NotSupported)
    }

    fn flush(&self) -> FsResult<()> {
        Ok(())
    }

    fn fsync(&self, datasync: bool) -> FsResult<()> {
        let _ = datasync;
        Ok(())
    }

    /// Called once when the kernel drops its last reference to the handle.
    fn release(&self) {}
}

/// A path-keyed filesystem backend.
///
/// Each probe returns `Some` for a capability the backend implements. The
/// defaults declare nothing, so a backend only overrides what it supports;
/// the dispatcher answers the rest with `ENOSYS` without calling anything.
pub trait FileSystem: Send + Sync {
    /// Name used in logs.
    fn name(&self) -> &str {
        "pathfs"
    }

    /// Called once the kernel handshake completed.
    fn on_mount(&self) {}

    /// Called once the mount reached the unmounted state.
    fn on_unmount(&self) {}

    fn get_attr(&self) -> Option<&dyn GetAttr> {
        None
    }

    fn set_attr(&self) -> Option<&dyn SetAttr> {
        None
    }

    fn read_link(&self) -> Option<&dyn ReadLink> {
        None
    }

    fn symlink(&self) -> Option<&dyn Symlink> {
        None
    }

    fn mknod(&self) -> Option<&dyn Mknod> {
        None
    }

    fn mkdir(&self) -> Option<&dyn Mkdir> {
        None
    }

    fn unlink(&self) -> Option<&dyn Unlink> {
        None
    }

    fn rmdir(&self) -> Option<&dyn Rmdir> {
        None
    }

    fn rename(&self) -> Option<&dyn Rename> {
        None
    }

    fn link(&self) -> Option<&dyn Link> {
        None
    }

    fn access(&self) -> Option<&dyn Access> {
        None
    }

    fn open(&self) -> Option<&dyn Open> {
        None
    }

    fn create(&self) -> Option<&dyn Create> {
        None
    }

    fn read_dir(&self) -> Option<&dyn ReadDir> {
        None
    }

    fn stat_fs(&self) -> Option<&dyn StatFs> {
        None
    }

    fn set_xattr(&self) -> Option<&dyn SetXAttr> {
        None
    }

    fn get_xattr(&self) -> Option<&dyn GetXAttr> {
        None
    }

    fn list_xattr(&self) -> Option<&dyn ListXAttr> {
        None
    }

    fn remove_xattr(&self) -> Option<&dyn RemoveXAttr> {
        None
    }
}
