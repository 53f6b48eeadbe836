//! What the mounted filesystem looks like in memory: one value owning the
//! block device, the superblock, both bitmaps, the page cache, the dentry
//! cache, and the journal. Created at mount, injected into the operation
//! layer, destroyed at unmount.

use std::collections::{HashMap, HashSet};
use std::path::Path;

use log::info;

use crate::cache::PageCache;
use crate::dentry::DentryCache;
use crate::device::BlockDev;
use crate::error::{FsError, FsResult};
use crate::journal::{Journal, Transaction};

use super::bitmap::BitmapRegion;
use super::inode::Inode;
use super::superblock::SuperBlock;
use super::{INODE_SIZE, ROOT_INODE, NAME_MAX, SYMLINK_FOLLOW_MAX};

#[derive(Debug)]
pub struct WayneFS {
    pub(crate) dev: BlockDev,
    pub(crate) sb: SuperBlock,
    pub(crate) cache: PageCache,
    pub(crate) dentries: DentryCache,
    pub(crate) journal: Journal,
    pub(crate) inode_bitmap: BitmapRegion,
    pub(crate) data_bitmap: BitmapRegion,
    /// per-inode open handle counts
    pub(crate) open_counts: HashMap<u32, u32>,
    /// inodes with zero links kept alive by open handles
    pub(crate) orphans: HashSet<u32>,
    pub(crate) next_fh: u64,
}

impl WayneFS {
    /// Load the image, replay the journal, and hand back a consistent
    /// filesystem.
    pub fn mount<P>(image_path: P) -> FsResult<Self>
    where
        P: AsRef<Path>,
    {
        let mut dev = BlockDev::open(image_path.as_ref())?;
        let sb = SuperBlock::load(&mut dev)?;
        let mut journal = Journal::load(&dev, &sb)?;
        let replayed = journal.recover(&mut dev)?;
        // replay may have rewritten block 0
        let sb = if replayed > 0 {
            SuperBlock::load(&mut dev)?
        } else {
            sb
        };
        info!(
            "mounted: {} blocks of {} bytes, {} inodes, journal of {} blocks",
            sb.total_blocks, sb.block_size, sb.inode_count, sb.journal_blocks
        );

        let inode_bitmap = BitmapRegion::new(sb.inode_bitmap_start, sb.inode_count);
        let data_bitmap = BitmapRegion::new(sb.data_bitmap_start, sb.data_block_count());
        Ok(WayneFS {
            dev,
            sb,
            cache: PageCache::new(),
            dentries: DentryCache::new(),
            journal,
            inode_bitmap,
            data_bitmap,
            open_counts: HashMap::new(),
            orphans: HashSet::new(),
            next_fh: 1,
        })
    }

    /// Flush every dirty page and hit the durability barrier. After this
    /// the image can be detached.
    pub fn unmount(&mut self) -> FsResult<()> {
        self.cache.flush_all(&mut self.dev)?;
        self.dev.sync()?;
        info!("unmounted cleanly");
        Ok(())
    }

    pub fn superblock(&self) -> &SuperBlock {
        &self.sb
    }

    pub fn journal_mut(&mut self) -> &mut Journal {
        &mut self.journal
    }

    /// Run one externally visible mutation as one transaction: commit on
    /// success, abort (and reload the committed superblock) on any error.
    pub(crate) fn with_txn<T, F>(&mut self, f: F) -> FsResult<T>
    where
        F: FnOnce(&mut WayneFS, &mut Transaction) -> FsResult<T>,
    {
        let mut tx = self.journal.begin();
        match f(self, &mut tx) {
            Ok(v) => {
                self.journal.commit(&mut self.dev, &mut self.cache, tx)?;
                Ok(v)
            }
            Err(e) => {
                self.journal.abort(&mut self.cache, tx);
                self.reload_superblock()?;
                Err(e)
            }
        }
    }

    /// Re-decode block 0 after an abort discarded staged pages; the cache
    /// reloads the last committed copy from the device.
    fn reload_superblock(&mut self) -> FsResult<()> {
        let raw = self.cache.get(&self.dev, 0)?;
        self.sb = SuperBlock::decode(raw)?;
        Ok(())
    }

    pub(crate) fn stage_superblock(&mut self, tx: &mut Transaction) -> FsResult<()> {
        let block = self.sb.encode_block(self.sb.block_size)?;
        tx.stage_meta(0, block);
        Ok(())
    }

    // --- inode table ---

    fn inode_slot(&self, ino: u32) -> FsResult<(u32, usize)> {
        if ino >= self.sb.inode_count {
            return Err(FsError::InvalidArgument);
        }
        let per_block = self.sb.block_size / INODE_SIZE;
        let bno = self.sb.inode_table_start + ino / per_block;
        let off = ((ino % per_block) * INODE_SIZE) as usize;
        Ok((bno, off))
    }

    pub(crate) fn read_inode(&mut self, ino: u32) -> FsResult<Inode> {
        let (bno, off) = self.inode_slot(ino)?;
        let buf = self.cache.get(&self.dev, bno)?;
        Inode::decode_from_slot(&buf[off..off + INODE_SIZE as usize])
    }

    pub(crate) fn write_inode(
        &mut self,
        tx: &mut Transaction,
        ino: u32,
        inode: &Inode,
    ) -> FsResult<()> {
        let (bno, off) = self.inode_slot(ino)?;
        let buf = self.cache.get_mut(&self.dev, bno)?;
        inode.encode_into_slot(&mut buf[off..off + INODE_SIZE as usize])?;
        let staged = buf.clone();
        self.cache.mark_dirty(bno);
        tx.stage_meta(bno, staged);
        Ok(())
    }

    // --- allocation ---

    pub(crate) fn alloc_inode(&mut self, tx: &mut Transaction) -> FsResult<u32> {
        let ino = self
            .inode_bitmap
            .allocate(&self.dev, &mut self.cache, tx)?
            .ok_or(FsError::NoInodes)?;
        self.sb.free_inodes -= 1;
        self.stage_superblock(tx)?;
        Ok(ino)
    }

    /// Clear the table record and the bitmap bit together, in the same
    /// transaction that dropped the last link.
    pub(crate) fn free_inode(&mut self, tx: &mut Transaction, ino: u32) -> FsResult<()> {
        self.write_inode(tx, ino, &Inode::default())?;
        self.inode_bitmap.free(&self.dev, &mut self.cache, tx, ino)?;
        self.sb.free_inodes += 1;
        self.stage_superblock(tx)?;
        Ok(())
    }

    pub(crate) fn alloc_data_block(&mut self, tx: &mut Transaction) -> FsResult<u32> {
        let idx = self
            .data_bitmap
            .allocate(&self.dev, &mut self.cache, tx)?
            .ok_or(FsError::NoSpace)?;
        self.sb.free_data_blocks -= 1;
        self.stage_superblock(tx)?;
        Ok(self.sb.data_start + idx)
    }

    pub(crate) fn free_data_block(&mut self, tx: &mut Transaction, pbno: u32) -> FsResult<()> {
        if pbno < self.sb.data_start {
            return Err(FsError::Corrupt(format!(
                "freeing block {pbno} outside the data region"
            )));
        }
        self.data_bitmap
            .free(&self.dev, &mut self.cache, tx, pbno - self.sb.data_start)?;
        self.sb.free_data_blocks += 1;
        self.stage_superblock(tx)?;
        // the number may be reallocated with fresh contents
        self.cache.discard(pbno);
        Ok(())
    }

    // --- path resolution (dentry cache in front of the directory walk) ---

    pub(crate) fn normalize_path(path: &str) -> FsResult<String> {
        if !path.starts_with('/') {
            return Err(FsError::InvalidArgument);
        }
        let mut parts: Vec<&str> = Vec::new();
        for comp in path.split('/') {
            match comp {
                "" | "." => {}
                ".." => {
                    parts.pop();
                }
                name => parts.push(name),
            }
        }
        if parts.is_empty() {
            Ok("/".to_string())
        } else {
            Ok(format!("/{}", parts.join("/")))
        }
    }

    pub(crate) fn validate_name(name: &str) -> FsResult<()> {
        if name.is_empty() || name == "." || name == ".." {
            return Err(FsError::InvalidArgument);
        }
        if name.len() > NAME_MAX {
            return Err(FsError::NameTooLong);
        }
        if name.contains('/') || name.contains('\0') {
            return Err(FsError::InvalidArgument);
        }
        Ok(())
    }

    /// Resolve an absolute path to an inode number. Intermediate symlinks
    /// are followed (bounded depth); a trailing symlink is returned as
    /// itself, lstat-style.
    pub(crate) fn resolve_path(&mut self, path: &str) -> FsResult<u32> {
        self.resolve_path_depth(path, 0)
    }

    fn resolve_path_depth(&mut self, path: &str, depth: u32) -> FsResult<u32> {
        if depth > SYMLINK_FOLLOW_MAX {
            return Err(FsError::SymlinkLoop);
        }
        let norm = Self::normalize_path(path)?;
        if norm == "/" {
            return Ok(ROOT_INODE);
        }
        if let Some(hit) = self.dentries.lookup(&norm) {
            match hit {
                Some(ino) => {
                    // cheap identity check before trusting the hit
                    if self.inode_bitmap.test(&self.dev, &mut self.cache, ino)? {
                        return Ok(ino);
                    }
                    self.dentries.invalidate(&norm);
                }
                None => return Err(FsError::NotFound),
            }
        }

        let comps: Vec<String> = norm[1..].split('/').map(str::to_string).collect();
        let mut cur = ROOT_INODE;
        let mut walked = String::new();
        for (i, comp) in comps.iter().enumerate() {
            let dir_inode = self.read_inode(cur)?;
            if !dir_inode.is_dir() {
                return Err(FsError::NotDirectory);
            }
            let child = match self.dir_lookup(&dir_inode, comp)? {
                Some((ino, _kind)) => ino,
                None => {
                    if i == comps.len() - 1 {
                        self.dentries.insert_negative(&norm);
                    }
                    return Err(FsError::NotFound);
                }
            };
            let is_last = i == comps.len() - 1;
            let child_inode = self.read_inode(child)?;
            if child_inode.is_symlink() && !is_last {
                let target = self.symlink_target(&child_inode)?;
                let rest = comps[i + 1..].join("/");
                let base = if target.starts_with('/') {
                    target
                } else {
                    format!("{walked}/{target}")
                };
                return self.resolve_path_depth(&format!("{base}/{rest}"), depth + 1);
            }
            walked.push('/');
            walked.push_str(comp);
            self.dentries.insert(&walked, child);
            cur = child;
        }
        Ok(cur)
    }

    /// Split `path` into its parent directory's inode, the final name, and
    /// the parent's normalized path (for dentry invalidation).
    pub(crate) fn resolve_parent(&mut self, path: &str) -> FsResult<(u32, String, String)> {
        let norm = Self::normalize_path(path)?;
        if norm == "/" {
            return Err(FsError::InvalidArgument);
        }
        let cut = norm.rfind('/').expect("normalized path contains '/'");
        let parent_path = if cut == 0 { "/" } else { &norm[..cut] };
        let name = &norm[cut + 1..];
        Self::validate_name(name)?;
        let parent_ino = self.resolve_path_depth(parent_path, 0)?;
        let parent = self.read_inode(parent_ino)?;
        if !parent.is_dir() {
            return Err(FsError::NotDirectory);
        }
        Ok((parent_ino, name.to_string(), parent_path.to_string()))
    }

    // --- open handle tracking ---

    pub fn open_handle(&mut self, ino: u32) -> u64 {
        *self.open_counts.entry(ino).or_insert(0) += 1;
        let fh = self.next_fh;
        self.next_fh += 1;
        fh
    }

    /// Drop one handle; an orphaned inode (zero links) is reclaimed once
    /// its last handle goes away.
    pub fn release_handle(&mut self, ino: u32) -> FsResult<()> {
        let remaining = match self.open_counts.get_mut(&ino) {
            Some(count) => {
                *count = count.saturating_sub(1);
                *count
            }
            None => return Ok(()),
        };
        if remaining == 0 {
            self.open_counts.remove(&ino);
            if self.orphans.remove(&ino) {
                return self.with_txn(|fs, tx| {
                    let mut inode = fs.read_inode(ino)?;
                    fs.truncate_blocks(tx, &mut inode, 0)?;
                    fs.free_inode(tx, ino)
                });
            }
        }
        Ok(())
    }

    pub(crate) fn is_open(&self, ino: u32) -> bool {
        self.open_counts.get(&ino).copied().unwrap_or(0) > 0
    }

    // --- consistency ---

    /// Verify that both bitmaps exactly mirror reachability from live
    /// inodes, and that the superblock free counters equal the zero-bit
    /// populations. The recovery tests call this after every crash point.
    pub fn check_consistency(&mut self) -> FsResult<()> {
        let mut reachable_inodes = HashSet::new();
        let mut reachable_blocks = HashSet::new();
        reachable_inodes.insert(0); // reserved, always marked allocated

        for ino in 1..self.sb.inode_count {
            let inode = self.read_inode(ino)?;
            if inode.is_free() {
                if inode.nlink != 0 {
                    return Err(FsError::Corrupt(format!(
                        "free inode {ino} has nlink {}",
                        inode.nlink
                    )));
                }
                continue;
            }
            if inode.nlink == 0 && !self.orphans.contains(&ino) {
                return Err(FsError::Corrupt(format!("live inode {ino} has nlink 0")));
            }
            reachable_inodes.insert(ino);
            for pbno in self.collect_blocks(&inode)? {
                if !reachable_blocks.insert(pbno) {
                    return Err(FsError::Corrupt(format!(
                        "block {pbno} referenced twice"
                    )));
                }
            }
        }

        for ino in 0..self.sb.inode_count {
            let bit = self.inode_bitmap.test(&self.dev, &mut self.cache, ino)?;
            if bit != reachable_inodes.contains(&ino) {
                return Err(FsError::Corrupt(format!(
                    "inode bitmap bit {ino} is {bit}, reachability disagrees"
                )));
            }
        }
        for idx in 0..self.sb.data_block_count() {
            let bit = self.data_bitmap.test(&self.dev, &mut self.cache, idx)?;
            let pbno = self.sb.data_start + idx;
            if bit != reachable_blocks.contains(&pbno) {
                return Err(FsError::Corrupt(format!(
                    "data bitmap bit for block {pbno} is {bit}, reachability disagrees"
                )));
            }
        }

        let inode_zeros = self.inode_bitmap.count_zeros(&self.dev, &mut self.cache)?;
        if self.sb.free_inodes != inode_zeros {
            return Err(FsError::Corrupt(format!(
                "free inode counter {} != bitmap zero population {}",
                self.sb.free_inodes, inode_zeros
            )));
        }
        let data_zeros = self.data_bitmap.count_zeros(&self.dev, &mut self.cache)?;
        if self.sb.free_data_blocks != data_zeros {
            return Err(FsError::Corrupt(format!(
                "free data-block counter {} != bitmap zero population {}",
                self.sb.free_data_blocks, data_zeros
            )));
        }
        Ok(())
    }
}
