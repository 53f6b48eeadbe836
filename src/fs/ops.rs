//! The POSIX operation layer. Every externally visible mutating operation
//! runs as exactly one journal transaction: begin, stage all metadata
//! mutations, order all touched data blocks, commit before returning
//! success, abort on any error.

use log::debug;

use crate::error::{FsError, FsResult};

use super::directory::DirEntry;
use super::filekind::FileKind;
use super::fs_layout::WayneFS;
use super::inode::Inode;
use super::{max_file_size, ROOT_INODE};

/// Post-commit counters for `statfs`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StatFs {
    pub block_size: u32,
    pub total_blocks: u32,
    pub free_blocks: u32,
    pub total_inodes: u32,
    pub free_inodes: u32,
}

impl WayneFS {
    // --- non-mutating operations (no transaction) ---

    pub fn getattr(&mut self, path: &str) -> FsResult<(u32, Inode)> {
        let ino = self.resolve_path(path)?;
        let inode = self.read_inode(ino)?;
        if inode.is_free() {
            return Err(FsError::NotFound);
        }
        Ok((ino, inode))
    }

    pub fn stat_ino(&mut self, ino: u32) -> FsResult<Inode> {
        let inode = self.read_inode(ino)?;
        if inode.is_free() {
            return Err(FsError::NotFound);
        }
        Ok(inode)
    }

    /// Child attributes by parent path + name, through the dentry cache.
    pub fn lookup(&mut self, parent_path: &str, name: &str) -> FsResult<(u32, Inode)> {
        let joined = if parent_path.ends_with('/') {
            format!("{parent_path}{name}")
        } else {
            format!("{parent_path}/{name}")
        };
        self.getattr(&joined)
    }

    pub fn readdir(&mut self, path: &str) -> FsResult<Vec<DirEntry>> {
        let (_ino, inode) = self.getattr(path)?;
        if !inode.is_dir() {
            return Err(FsError::NotDirectory);
        }
        self.dir_entries(&inode)
    }

    /// Byte range from a file; holes read as zeros, reads at or past EOF
    /// come back short or empty.
    pub fn read(&mut self, ino: u32, offset: u64, len: u32) -> FsResult<Vec<u8>> {
        let inode = self.stat_ino(ino)?;
        if inode.is_dir() {
            return Err(FsError::IsDirectory);
        }
        if offset >= inode.size {
            return Ok(Vec::new());
        }
        let bs = self.sb.block_size as u64;
        let end = inode.size.min(offset + len as u64);
        let mut out = vec![0u8; (end - offset) as usize];
        let mut done = 0usize;
        while (offset + done as u64) < end {
            let pos = offset + done as u64;
            let lbi = pos / bs;
            let in_block = (pos % bs) as usize;
            let n = ((bs - in_block as u64).min(end - pos)) as usize;
            if let Some(pbno) = self.lookup_block(&inode, lbi)? {
                let buf = self.cache.get(&self.dev, pbno)?;
                out[done..done + n].copy_from_slice(&buf[in_block..in_block + n]);
            }
            // a hole stays zero
            done += n;
        }
        Ok(out)
    }

    pub fn readlink(&mut self, path: &str) -> FsResult<String> {
        let (_ino, inode) = self.getattr(path)?;
        self.symlink_target(&inode)
    }

    pub fn readlink_ino(&mut self, ino: u32) -> FsResult<String> {
        let inode = self.stat_ino(ino)?;
        self.symlink_target(&inode)
    }

    pub(crate) fn symlink_target(&mut self, inode: &Inode) -> FsResult<String> {
        if !inode.is_symlink() {
            return Err(FsError::InvalidArgument);
        }
        let bs = self.sb.block_size as u64;
        let mut raw = vec![0u8; inode.size as usize];
        let mut done = 0usize;
        while (done as u64) < inode.size {
            let lbi = done as u64 / bs;
            let n = (bs.min(inode.size - done as u64)) as usize;
            if let Some(pbno) = self.lookup_block(inode, lbi)? {
                let buf = self.cache.get(&self.dev, pbno)?;
                raw[done..done + n].copy_from_slice(&buf[..n]);
            }
            done += n;
        }
        String::from_utf8(raw).map_err(|_| FsError::Corrupt("symlink target not UTF-8".into()))
    }

    pub fn statfs(&self) -> StatFs {
        StatFs {
            block_size: self.sb.block_size,
            total_blocks: self.sb.data_block_count(),
            free_blocks: self.sb.free_data_blocks,
            total_inodes: self.sb.inode_count,
            free_inodes: self.sb.free_inodes,
        }
    }

    /// Validate existence and hand out a file handle. Opening pins the
    /// inode: unlink past zero links defers reclamation until release.
    pub fn open(&mut self, path: &str) -> FsResult<(u64, u32)> {
        let (ino, _inode) = self.getattr(path)?;
        let fh = self.open_handle(ino);
        Ok((fh, ino))
    }

    /// Every mutating operation commits before returning, so there is never
    /// an open transaction here; make the durability point explicit anyway.
    pub fn fsync(&mut self, _ino: u32) -> FsResult<()> {
        self.cache.flush_all(&mut self.dev)?;
        self.dev.sync()
    }

    // --- mutating operations (one transaction each) ---

    pub fn create(&mut self, path: &str, mode: u16, uid: u32, gid: u32) -> FsResult<(u32, Inode)> {
        let (parent_ino, name, parent_path) = self.resolve_parent(path)?;
        let parent = self.read_inode(parent_ino)?;
        if self.dir_lookup(&parent, &name)?.is_some() {
            return Err(FsError::Exists);
        }
        debug!("create {path}");
        let created = self.with_txn(|fs, tx| {
            let ino = fs.alloc_inode(tx)?;
            let inode = Inode::new(FileKind::RegularFile, mode, uid, gid);
            fs.write_inode(tx, ino, &inode)?;
            let mut parent = fs.read_inode(parent_ino)?;
            fs.dir_insert(tx, &mut parent, &name, ino, FileKind::RegularFile)?;
            parent.touch_mtime();
            fs.write_inode(tx, parent_ino, &parent)?;
            Ok((ino, inode))
        })?;
        self.dentries.invalidate_prefix(&parent_path);
        Ok(created)
    }

    pub fn mkdir(&mut self, path: &str, mode: u16, uid: u32, gid: u32) -> FsResult<(u32, Inode)> {
        let (parent_ino, name, parent_path) = self.resolve_parent(path)?;
        let parent = self.read_inode(parent_ino)?;
        if self.dir_lookup(&parent, &name)?.is_some() {
            return Err(FsError::Exists);
        }
        debug!("mkdir {path}");
        let created = self.with_txn(|fs, tx| {
            let ino = fs.alloc_inode(tx)?;
            let mut inode = Inode::new(FileKind::Directory, mode, uid, gid);
            inode.nlink = 2; // "." plus the parent's entry
            fs.dir_init(tx, ino, parent_ino, &mut inode)?;
            fs.write_inode(tx, ino, &inode)?;
            let mut parent = fs.read_inode(parent_ino)?;
            fs.dir_insert(tx, &mut parent, &name, ino, FileKind::Directory)?;
            parent.nlink += 1; // the child's ".."
            parent.touch_mtime();
            fs.write_inode(tx, parent_ino, &parent)?;
            Ok((ino, inode))
        })?;
        self.dentries.invalidate_prefix(&parent_path);
        Ok(created)
    }

    pub fn rmdir(&mut self, path: &str) -> FsResult<()> {
        let (parent_ino, name, parent_path) = self.resolve_parent(path)?;
        let parent = self.read_inode(parent_ino)?;
        let (ino, _kind) = self
            .dir_lookup(&parent, &name)?
            .ok_or(FsError::NotFound)?;
        if ino == ROOT_INODE {
            return Err(FsError::InvalidArgument);
        }
        let inode = self.read_inode(ino)?;
        if !inode.is_dir() {
            return Err(FsError::NotDirectory);
        }
        if !self.dir_is_empty(&inode)? {
            return Err(FsError::NotEmpty);
        }
        debug!("rmdir {path}");
        self.with_txn(|fs, tx| {
            let mut parent = fs.read_inode(parent_ino)?;
            fs.dir_remove(tx, &mut parent, &name)?;
            parent.nlink -= 1;
            parent.touch_mtime();
            fs.write_inode(tx, parent_ino, &parent)?;
            let mut inode = fs.read_inode(ino)?;
            fs.truncate_blocks(tx, &mut inode, 0)?;
            fs.free_inode(tx, ino)
        })?;
        self.dentries.invalidate_prefix(&parent_path);
        Ok(())
    }

    pub fn unlink(&mut self, path: &str) -> FsResult<()> {
        let (parent_ino, name, parent_path) = self.resolve_parent(path)?;
        let parent = self.read_inode(parent_ino)?;
        let (ino, _kind) = self
            .dir_lookup(&parent, &name)?
            .ok_or(FsError::NotFound)?;
        let inode = self.read_inode(ino)?;
        if inode.is_dir() {
            return Err(FsError::IsDirectory);
        }
        debug!("unlink {path}");
        let orphaned = self.with_txn(|fs, tx| {
            let mut parent = fs.read_inode(parent_ino)?;
            fs.dir_remove(tx, &mut parent, &name)?;
            parent.touch_mtime();
            fs.write_inode(tx, parent_ino, &parent)?;
            let mut inode = fs.read_inode(ino)?;
            inode.nlink -= 1;
            inode.touch_ctime();
            if inode.nlink == 0 {
                if fs.is_open(ino) {
                    // keep the blocks until the last handle is released
                    fs.write_inode(tx, ino, &inode)?;
                    Ok(true)
                } else {
                    fs.truncate_blocks(tx, &mut inode, 0)?;
                    fs.free_inode(tx, ino)?;
                    Ok(false)
                }
            } else {
                fs.write_inode(tx, ino, &inode)?;
                Ok(false)
            }
        })?;
        if orphaned {
            self.orphans.insert(ino);
        }
        self.dentries.invalidate_prefix(&parent_path);
        Ok(())
    }

    /// Hard link `new_path` to the inode behind `existing`; directories
    /// cannot be linked.
    pub fn link(&mut self, existing: &str, new_path: &str) -> FsResult<(u32, Inode)> {
        let src_ino = self.resolve_path(existing)?;
        let src = self.read_inode(src_ino)?;
        if src.is_dir() {
            return Err(FsError::InvalidArgument);
        }
        let (parent_ino, name, parent_path) = self.resolve_parent(new_path)?;
        let parent = self.read_inode(parent_ino)?;
        if self.dir_lookup(&parent, &name)?.is_some() {
            return Err(FsError::Exists);
        }
        debug!("link {existing} -> {new_path}");
        let kind = src.file_kind()?;
        let linked = self.with_txn(|fs, tx| {
            let mut parent = fs.read_inode(parent_ino)?;
            fs.dir_insert(tx, &mut parent, &name, src_ino, kind)?;
            parent.touch_mtime();
            fs.write_inode(tx, parent_ino, &parent)?;
            let mut src = fs.read_inode(src_ino)?;
            src.nlink += 1;
            src.touch_ctime();
            fs.write_inode(tx, src_ino, &src)?;
            Ok((src_ino, src))
        })?;
        self.dentries.invalidate_prefix(&parent_path);
        Ok(linked)
    }

    /// A symlink inode whose data blocks hold the literal target string.
    pub fn symlink(
        &mut self,
        target: &str,
        path: &str,
        uid: u32,
        gid: u32,
    ) -> FsResult<(u32, Inode)> {
        let (parent_ino, name, parent_path) = self.resolve_parent(path)?;
        let parent = self.read_inode(parent_ino)?;
        if self.dir_lookup(&parent, &name)?.is_some() {
            return Err(FsError::Exists);
        }
        debug!("symlink {path} -> {target}");
        let bs = self.sb.block_size as usize;
        let target_bytes = target.as_bytes().to_vec();
        let created = self.with_txn(|fs, tx| {
            let ino = fs.alloc_inode(tx)?;
            let mut inode = Inode::new(FileKind::SymbolicLink, 0o777, uid, gid);
            for (lbi, chunk) in target_bytes.chunks(bs).enumerate() {
                let pbno = fs.resolve_block(tx, &mut inode, lbi as u64)?;
                let buf = fs.cache.get_mut(&fs.dev, pbno)?;
                buf[..chunk.len()].copy_from_slice(chunk);
                fs.cache.mark_dirty(pbno);
                tx.add_ordered(pbno);
            }
            inode.size = target_bytes.len() as u64;
            fs.write_inode(tx, ino, &inode)?;
            let mut parent = fs.read_inode(parent_ino)?;
            fs.dir_insert(tx, &mut parent, &name, ino, FileKind::SymbolicLink)?;
            parent.touch_mtime();
            fs.write_inode(tx, parent_ino, &parent)?;
            Ok((ino, inode))
        })?;
        self.dentries.invalidate_prefix(&parent_path);
        Ok(created)
    }

    /// Write `data` at `offset`, extending the file and allocating blocks
    /// as needed; every touched data block joins the transaction's ordered
    /// set.
    pub fn write(&mut self, ino: u32, offset: u64, data: &[u8]) -> FsResult<u32> {
        let mut inode = self.stat_ino(ino)?;
        if inode.is_dir() {
            return Err(FsError::IsDirectory);
        }
        if !inode.is_regular_file() {
            return Err(FsError::InvalidArgument);
        }
        let end = offset.saturating_add(data.len() as u64);
        if end > max_file_size(self.sb.block_size) {
            return Err(FsError::InvalidArgument);
        }
        if data.is_empty() {
            return Ok(0);
        }
        let bs = self.sb.block_size as u64;
        self.with_txn(|fs, tx| {
            let mut done = 0usize;
            while done < data.len() {
                let pos = offset + done as u64;
                let lbi = pos / bs;
                let in_block = (pos % bs) as usize;
                let n = (bs as usize - in_block).min(data.len() - done);
                let pbno = fs.resolve_block(tx, &mut inode, lbi)?;
                let buf = fs.cache.get_mut(&fs.dev, pbno)?;
                buf[in_block..in_block + n].copy_from_slice(&data[done..done + n]);
                fs.cache.mark_dirty(pbno);
                tx.add_ordered(pbno);
                done += n;
            }
            if end > inode.size {
                inode.size = end;
            }
            inode.touch_mtime();
            fs.write_inode(tx, ino, &inode)?;
            Ok(data.len() as u32)
        })
    }

    pub fn truncate(&mut self, path: &str, new_size: u64) -> FsResult<()> {
        let ino = self.resolve_path(path)?;
        self.truncate_ino(ino, new_size)
    }

    pub fn truncate_ino(&mut self, ino: u32, new_size: u64) -> FsResult<()> {
        let mut inode = self.stat_ino(ino)?;
        if inode.is_dir() {
            return Err(FsError::IsDirectory);
        }
        if !inode.is_regular_file() {
            return Err(FsError::InvalidArgument);
        }
        if new_size > max_file_size(self.sb.block_size) {
            return Err(FsError::InvalidArgument);
        }
        debug!("truncate ino {ino} to {new_size}");
        self.with_txn(|fs, tx| {
            fs.truncate_blocks(tx, &mut inode, new_size)?;
            inode.touch_mtime();
            fs.write_inode(tx, ino, &inode)
        })
    }

    /// Atomically repoint `new_path` at `old_path`'s inode and drop the old
    /// entry. An existing regular-file target is unlinked; an existing
    /// directory target must be empty. Both parents change in one
    /// transaction.
    pub fn rename(&mut self, old_path: &str, new_path: &str) -> FsResult<()> {
        let norm_old = Self::normalize_path(old_path)?;
        let norm_new = Self::normalize_path(new_path)?;
        if norm_old == norm_new {
            return Ok(());
        }
        if norm_new.starts_with(&format!("{norm_old}/")) {
            // a directory cannot move into its own subtree
            return Err(FsError::InvalidArgument);
        }
        let (old_parent_ino, old_name, old_parent_path) = self.resolve_parent(&norm_old)?;
        let (new_parent_ino, new_name, new_parent_path) = self.resolve_parent(&norm_new)?;
        let old_parent = self.read_inode(old_parent_ino)?;
        let (src_ino, src_kind) = self
            .dir_lookup(&old_parent, &old_name)?
            .ok_or(FsError::NotFound)?;
        let new_parent = self.read_inode(new_parent_ino)?;
        let target = self.dir_lookup(&new_parent, &new_name)?;

        if let Some((t_ino, _)) = target {
            if t_ino == src_ino {
                // hard links to the same inode: rename is a no-op
                return Ok(());
            }
            let t_inode = self.read_inode(t_ino)?;
            let src_inode = self.read_inode(src_ino)?;
            if t_inode.is_dir() {
                if !src_inode.is_dir() {
                    return Err(FsError::IsDirectory);
                }
                if !self.dir_is_empty(&t_inode)? {
                    return Err(FsError::NotEmpty);
                }
            } else if src_inode.is_dir() {
                return Err(FsError::NotDirectory);
            }
        }

        debug!("rename {norm_old} -> {norm_new}");
        let orphaned = self.with_txn(|fs, tx| {
            let mut orphaned = None;
            if let Some((t_ino, t_kind)) = target {
                let mut new_parent = fs.read_inode(new_parent_ino)?;
                fs.dir_remove(tx, &mut new_parent, &new_name)?;
                fs.write_inode(tx, new_parent_ino, &new_parent)?;
                let mut t_inode = fs.read_inode(t_ino)?;
                if t_kind == FileKind::Directory {
                    // overwriting an empty directory: its "." goes away and
                    // its ".." held a link on the new parent
                    fs.truncate_blocks(tx, &mut t_inode, 0)?;
                    fs.free_inode(tx, t_ino)?;
                    let mut np = fs.read_inode(new_parent_ino)?;
                    np.nlink -= 1;
                    fs.write_inode(tx, new_parent_ino, &np)?;
                } else {
                    t_inode.nlink -= 1;
                    t_inode.touch_ctime();
                    if t_inode.nlink == 0 {
                        if fs.is_open(t_ino) {
                            fs.write_inode(tx, t_ino, &t_inode)?;
                            orphaned = Some(t_ino);
                        } else {
                            fs.truncate_blocks(tx, &mut t_inode, 0)?;
                            fs.free_inode(tx, t_ino)?;
                        }
                    } else {
                        fs.write_inode(tx, t_ino, &t_inode)?;
                    }
                }
            }

            let mut old_parent = fs.read_inode(old_parent_ino)?;
            fs.dir_remove(tx, &mut old_parent, &old_name)?;
            old_parent.touch_mtime();
            fs.write_inode(tx, old_parent_ino, &old_parent)?;

            let mut new_parent = fs.read_inode(new_parent_ino)?;
            fs.dir_insert(tx, &mut new_parent, &new_name, src_ino, src_kind)?;
            new_parent.touch_mtime();
            fs.write_inode(tx, new_parent_ino, &new_parent)?;

            if src_kind == FileKind::Directory && old_parent_ino != new_parent_ino {
                let mut src_inode = fs.read_inode(src_ino)?;
                fs.dir_set_entry(tx, &mut src_inode, "..", new_parent_ino)?;
                let mut op = fs.read_inode(old_parent_ino)?;
                op.nlink -= 1;
                fs.write_inode(tx, old_parent_ino, &op)?;
                let mut np = fs.read_inode(new_parent_ino)?;
                np.nlink += 1;
                fs.write_inode(tx, new_parent_ino, &np)?;
            }

            let mut src_inode = fs.read_inode(src_ino)?;
            src_inode.touch_ctime();
            fs.write_inode(tx, src_ino, &src_inode)?;
            Ok(orphaned)
        })?;
        if let Some(ino) = orphaned {
            self.orphans.insert(ino);
        }
        self.dentries.invalidate_prefix(&old_parent_path);
        self.dentries.invalidate_prefix(&new_parent_path);
        Ok(())
    }

    // --- attribute mutation ---

    pub fn chmod(&mut self, path: &str, mode: u16) -> FsResult<Inode> {
        let ino = self.resolve_path(path)?;
        self.chmod_ino(ino, mode)
    }

    pub fn chmod_ino(&mut self, ino: u32, mode: u16) -> FsResult<Inode> {
        let mut inode = self.stat_ino(ino)?;
        self.with_txn(|fs, tx| {
            inode.mode = mode & 0o7777;
            inode.touch_ctime();
            fs.write_inode(tx, ino, &inode)?;
            Ok(inode.clone())
        })
    }

    pub fn chown_ino(&mut self, ino: u32, uid: Option<u32>, gid: Option<u32>) -> FsResult<Inode> {
        let mut inode = self.stat_ino(ino)?;
        self.with_txn(|fs, tx| {
            if let Some(uid) = uid {
                inode.uid = uid;
            }
            if let Some(gid) = gid {
                inode.gid = gid;
            }
            inode.touch_ctime();
            fs.write_inode(tx, ino, &inode)?;
            Ok(inode.clone())
        })
    }

    pub fn utimens_ino(
        &mut self,
        ino: u32,
        atime: Option<u64>,
        mtime: Option<u64>,
    ) -> FsResult<Inode> {
        let mut inode = self.stat_ino(ino)?;
        self.with_txn(|fs, tx| {
            if let Some(atime) = atime {
                inode.atime = atime;
            }
            if let Some(mtime) = mtime {
                inode.mtime = mtime;
            }
            inode.touch_ctime();
            fs.write_inode(tx, ino, &inode)?;
            Ok(inode.clone())
        })
    }
}
