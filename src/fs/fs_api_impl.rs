//! The FUSE host adapter: translates kernel requests into the path/ino
//! operation layer. Keeps an ino -> absolute path registry fed by lookup
//! results, because the kernel speaks inode numbers while the operation
//! layer resolves paths.

use std::collections::HashMap;
use std::ffi::OsStr;
use std::time::Duration;

use fuser::{Filesystem, MountOption, ReplyAttr, ReplyCreate, ReplyData, ReplyDirectory,
    ReplyEmpty, ReplyEntry, ReplyOpen, ReplyStatfs, ReplyWrite, Request, TimeOrNow};
use log::{info, warn};

use crate::error::{FsError, FsResult};
use crate::utils::time_util;

use super::fs_layout::WayneFS;
use super::ROOT_INODE;

const TTL: Duration = Duration::new(0, 0);

pub struct FuseDriver {
    fs: WayneFS,
    paths: HashMap<u64, String>,
}

impl FuseDriver {
    pub fn new(fs: WayneFS) -> Self {
        let mut paths = HashMap::new();
        paths.insert(ROOT_INODE as u64, "/".to_string());
        FuseDriver { fs, paths }
    }

    pub fn mount_options() -> Vec<MountOption> {
        vec![
            MountOption::FSName("waynefs".to_string()),
            MountOption::DefaultPermissions,
        ]
    }

    fn path_of(&self, ino: u64) -> FsResult<String> {
        self.paths.get(&ino).cloned().ok_or(FsError::NotFound)
    }

    fn child_path(&self, parent: u64, name: &OsStr) -> FsResult<String> {
        let name = name.to_str().ok_or(FsError::InvalidArgument)?;
        let parent = self.path_of(parent)?;
        if parent == "/" {
            Ok(format!("/{name}"))
        } else {
            Ok(format!("{parent}/{name}"))
        }
    }

    fn register(&mut self, ino: u32, path: String) {
        self.paths.insert(ino as u64, path);
    }

    /// Drop registry entries invalidated by a namespace change under `path`.
    fn forget_subtree(&mut self, path: &str) {
        let prefix = format!("{path}/");
        self.paths
            .retain(|ino, p| *ino == ROOT_INODE as u64 || (p != path && !p.starts_with(&prefix)));
    }
}

impl Filesystem for FuseDriver {
    fn init(
        &mut self,
        _req: &Request<'_>,
        _config: &mut fuser::KernelConfig,
    ) -> Result<(), libc::c_int> {
        info!("filesystem initialized");
        Ok(())
    }

    fn destroy(&mut self) {
        if let Err(e) = self.fs.unmount() {
            warn!("unmount flush failed: {e}");
        }
    }

    fn lookup(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEntry) {
        info!("lookup() called with parent {parent}, name {name:?}");
        let path = match self.child_path(parent, name) {
            Ok(p) => p,
            Err(e) => return reply.error(e.errno()),
        };
        match self.fs.getattr(&path) {
            Ok((ino, inode)) => {
                let attr = inode.file_attr(ino as u64, self.fs.superblock().block_size);
                self.register(ino, path);
                reply.entry(&TTL, &attr, 0);
            }
            Err(e) => reply.error(e.errno()),
        }
    }

    fn getattr(&mut self, _req: &Request<'_>, ino: u64, reply: ReplyAttr) {
        info!("getattr() called with ino {ino}");
        match self.fs.stat_ino(ino as u32) {
            Ok(inode) => reply.attr(&TTL, &inode.file_attr(ino, self.fs.superblock().block_size)),
            Err(e) => reply.error(e.errno()),
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn setattr(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        mode: Option<u32>,
        uid: Option<u32>,
        gid: Option<u32>,
        size: Option<u64>,
        atime: Option<TimeOrNow>,
        mtime: Option<TimeOrNow>,
        _ctime: Option<std::time::SystemTime>,
        fh: Option<u64>,
        _crtime: Option<std::time::SystemTime>,
        _chgtime: Option<std::time::SystemTime>,
        _bkuptime: Option<std::time::SystemTime>,
        _flags: Option<u32>,
        reply: ReplyAttr,
    ) {
        info!(
            "setattr() called with ino {ino}, mode {mode:?}, uid {uid:?}, gid {gid:?}, \
             size {size:?}, fh {fh:?}"
        );
        let ino32 = ino as u32;
        if let Some(size) = size {
            if let Err(e) = self.fs.truncate_ino(ino32, size) {
                return reply.error(e.errno());
            }
        }
        if let Some(mode) = mode {
            if let Err(e) = self.fs.chmod_ino(ino32, mode as u16) {
                return reply.error(e.errno());
            }
        }
        if uid.is_some() || gid.is_some() {
            if let Err(e) = self.fs.chown_ino(ino32, uid, gid) {
                return reply.error(e.errno());
            }
        }
        if atime.is_some() || mtime.is_some() {
            let secs = |t: TimeOrNow| match t {
                TimeOrNow::SpecificTime(t) => time_util::from_system_time(t),
                TimeOrNow::Now => time_util::now_secs(),
            };
            if let Err(e) = self
                .fs
                .utimens_ino(ino32, atime.map(secs), mtime.map(secs))
            {
                return reply.error(e.errno());
            }
        }
        match self.fs.stat_ino(ino32) {
            Ok(inode) => reply.attr(&TTL, &inode.file_attr(ino, self.fs.superblock().block_size)),
            Err(e) => reply.error(e.errno()),
        }
    }

    fn readlink(&mut self, _req: &Request<'_>, ino: u64, reply: ReplyData) {
        info!("readlink() called with ino {ino}");
        match self.fs.readlink_ino(ino as u32) {
            Ok(target) => reply.data(target.as_bytes()),
            Err(e) => reply.error(e.errno()),
        }
    }

    fn mkdir(
        &mut self,
        req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        mode: u32,
        _umask: u32,
        reply: ReplyEntry,
    ) {
        info!("mkdir() called with parent {parent}, name {name:?}");
        let path = match self.child_path(parent, name) {
            Ok(p) => p,
            Err(e) => return reply.error(e.errno()),
        };
        match self.fs.mkdir(&path, mode as u16, req.uid(), req.gid()) {
            Ok((ino, inode)) => {
                let attr = inode.file_attr(ino as u64, self.fs.superblock().block_size);
                self.register(ino, path);
                reply.entry(&TTL, &attr, 0);
            }
            Err(e) => reply.error(e.errno()),
        }
    }

    fn unlink(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        info!("unlink() called with parent {parent}, name {name:?}");
        let path = match self.child_path(parent, name) {
            Ok(p) => p,
            Err(e) => return reply.error(e.errno()),
        };
        match self.fs.unlink(&path) {
            Ok(()) => {
                self.forget_subtree(&path);
                reply.ok();
            }
            Err(e) => reply.error(e.errno()),
        }
    }

    fn rmdir(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        info!("rmdir() called with parent {parent}, name {name:?}");
        let path = match self.child_path(parent, name) {
            Ok(p) => p,
            Err(e) => return reply.error(e.errno()),
        };
        match self.fs.rmdir(&path) {
            Ok(()) => {
                self.forget_subtree(&path);
                reply.ok();
            }
            Err(e) => reply.error(e.errno()),
        }
    }

    fn symlink(
        &mut self,
        req: &Request<'_>,
        parent: u64,
        link_name: &OsStr,
        target: &std::path::Path,
        reply: ReplyEntry,
    ) {
        info!("symlink() called with parent {parent}, name {link_name:?}, target {target:?}");
        let path = match self.child_path(parent, link_name) {
            Ok(p) => p,
            Err(e) => return reply.error(e.errno()),
        };
        let Some(target) = target.to_str() else {
            return reply.error(libc::EINVAL);
        };
        match self.fs.symlink(target, &path, req.uid(), req.gid()) {
            Ok((ino, inode)) => {
                let attr = inode.file_attr(ino as u64, self.fs.superblock().block_size);
                self.register(ino, path);
                reply.entry(&TTL, &attr, 0);
            }
            Err(e) => reply.error(e.errno()),
        }
    }

    fn rename(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        newparent: u64,
        newname: &OsStr,
        flags: u32,
        reply: ReplyEmpty,
    ) {
        info!("rename() called with {parent}/{name:?} -> {newparent}/{newname:?}, flags {flags}");
        let (old_path, new_path) = match (
            self.child_path(parent, name),
            self.child_path(newparent, newname),
        ) {
            (Ok(o), Ok(n)) => (o, n),
            (Err(e), _) | (_, Err(e)) => return reply.error(e.errno()),
        };
        if flags & libc::RENAME_EXCHANGE != 0 {
            return reply.error(libc::EINVAL);
        }
        if flags & libc::RENAME_NOREPLACE != 0 && self.fs.getattr(&new_path).is_ok() {
            return reply.error(libc::EEXIST);
        }
        match self.fs.rename(&old_path, &new_path) {
            Ok(()) => {
                self.forget_subtree(&old_path);
                self.forget_subtree(&new_path);
                reply.ok();
            }
            Err(e) => reply.error(e.errno()),
        }
    }

    fn link(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        newparent: u64,
        newname: &OsStr,
        reply: ReplyEntry,
    ) {
        info!("link() called with ino {ino}, newparent {newparent}, newname {newname:?}");
        let existing = match self.path_of(ino) {
            Ok(p) => p,
            Err(e) => return reply.error(e.errno()),
        };
        let new_path = match self.child_path(newparent, newname) {
            Ok(p) => p,
            Err(e) => return reply.error(e.errno()),
        };
        match self.fs.link(&existing, &new_path) {
            Ok((ino, inode)) => {
                let attr = inode.file_attr(ino as u64, self.fs.superblock().block_size);
                self.register(ino, new_path);
                reply.entry(&TTL, &attr, 0);
            }
            Err(e) => reply.error(e.errno()),
        }
    }

    fn open(&mut self, _req: &Request<'_>, ino: u64, _flags: i32, reply: ReplyOpen) {
        info!("open() called with ino {ino}");
        match self.fs.stat_ino(ino as u32) {
            Ok(_) => {
                let fh = self.fs.open_handle(ino as u32);
                reply.opened(fh, 0);
            }
            Err(e) => reply.error(e.errno()),
        }
    }

    fn read(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        fh: u64,
        offset: i64,
        size: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyData,
    ) {
        info!("read() called with ino {ino}, fh {fh}, offset {offset}, size {size}");
        if offset < 0 {
            return reply.error(libc::EINVAL);
        }
        match self.fs.read(ino as u32, offset as u64, size) {
            Ok(data) => reply.data(&data),
            Err(e) => reply.error(e.errno()),
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn write(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        fh: u64,
        offset: i64,
        data: &[u8],
        _write_flags: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyWrite,
    ) {
        info!("write() called with ino {ino}, fh {fh}, offset {offset}, len {}", data.len());
        if offset < 0 {
            return reply.error(libc::EINVAL);
        }
        match self.fs.write(ino as u32, offset as u64, data) {
            Ok(written) => reply.written(written),
            Err(e) => reply.error(e.errno()),
        }
    }

    fn flush(&mut self, _req: &Request<'_>, ino: u64, _fh: u64, _lock_owner: u64, reply: ReplyEmpty) {
        match self.fs.fsync(ino as u32) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(e.errno()),
        }
    }

    fn release(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        _fh: u64,
        _flags: i32,
        _lock_owner: Option<u64>,
        _flush: bool,
        reply: ReplyEmpty,
    ) {
        info!("release() called with ino {ino}");
        match self.fs.release_handle(ino as u32) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(e.errno()),
        }
    }

    fn fsync(&mut self, _req: &Request<'_>, ino: u64, _fh: u64, _datasync: bool, reply: ReplyEmpty) {
        info!("fsync() called with ino {ino}");
        match self.fs.fsync(ino as u32) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(e.errno()),
        }
    }

    fn readdir(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        _fh: u64,
        offset: i64,
        mut reply: ReplyDirectory,
    ) {
        info!("readdir() called with ino {ino}, offset {offset}");
        if offset < 0 {
            return reply.error(libc::EINVAL);
        }
        let path = match self.path_of(ino) {
            Ok(p) => p,
            Err(e) => return reply.error(e.errno()),
        };
        let entries = match self.fs.readdir(&path) {
            Ok(entries) => entries,
            Err(e) => return reply.error(e.errno()),
        };
        for (i, entry) in entries.iter().enumerate().skip(offset as usize) {
            let full = reply.add(
                entry.ino as u64,
                i as i64 + 1,
                entry.kind.into(),
                &entry.name,
            );
            if full {
                break;
            }
        }
        reply.ok();
    }

    /// Directory fsync forces the same durability point as a file fsync.
    fn fsyncdir(&mut self, _req: &Request<'_>, ino: u64, _fh: u64, _datasync: bool, reply: ReplyEmpty) {
        info!("fsyncdir() called with ino {ino}");
        match self.fs.fsync(ino as u32) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(e.errno()),
        }
    }

    fn statfs(&mut self, _req: &Request<'_>, _ino: u64, reply: ReplyStatfs) {
        let stat = self.fs.statfs();
        reply.statfs(
            stat.total_blocks as u64,
            stat.free_blocks as u64,
            stat.free_blocks as u64,
            (stat.total_inodes - stat.free_inodes) as u64,
            stat.free_inodes as u64,
            stat.block_size,
            super::NAME_MAX as u32,
            stat.block_size,
        );
    }

    fn access(&mut self, _req: &Request<'_>, _ino: u64, _mask: i32, reply: ReplyEmpty) {
        // DefaultPermissions: the kernel enforces mode bits
        reply.ok();
    }

    fn create(
        &mut self,
        req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        mut mode: u32,
        _umask: u32,
        _flags: i32,
        reply: ReplyCreate,
    ) {
        info!("create() called with parent {parent}, name {name:?}");
        let path = match self.child_path(parent, name) {
            Ok(p) => p,
            Err(e) => return reply.error(e.errno()),
        };
        if req.uid() != 0 {
            mode &= !(libc::S_ISUID | libc::S_ISGID);
        }
        match self.fs.create(&path, mode as u16, req.uid(), req.gid()) {
            Ok((ino, inode)) => {
                let attr = inode.file_attr(ino as u64, self.fs.superblock().block_size);
                self.register(ino, path);
                let fh = self.fs.open_handle(ino);
                reply.created(&TTL, &attr, 0, fh, 0);
            }
            Err(e) => reply.error(e.errno()),
        }
    }
}
