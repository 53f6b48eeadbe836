//! Logical-to-physical block addressing through the inode's pointer array:
//! ten direct slots, one single-indirect index, one double-indirect index.
//! Index blocks are zero-filled on allocation, so an absent pointer reads
//! as zero and a zero pointer is a hole.
//!
//! Every allocation, free, and pointer write lands in the caller's open
//! transaction: the bitmap bit and the pointer referencing it always commit
//! together.

use crate::error::{FsError, FsResult};
use crate::journal::Transaction;

use super::inode::Inode;
use super::{
    pointers_per_block, DOUBLE_INDIRECT_SLOT, DIRECT_SLOTS, SINGLE_INDIRECT_SLOT,
};
use super::fs_layout::WayneFS;

impl WayneFS {
    fn read_ptr(&mut self, index_block: u32, slot: u64) -> FsResult<u32> {
        let buf = self.cache.get(&self.dev, index_block)?;
        let off = slot as usize * 4;
        Ok(u32::from_le_bytes(buf[off..off + 4].try_into().unwrap()))
    }

    fn write_ptr(
        &mut self,
        tx: &mut Transaction,
        index_block: u32,
        slot: u64,
        value: u32,
    ) -> FsResult<()> {
        let buf = self.cache.get_mut(&self.dev, index_block)?;
        let off = slot as usize * 4;
        buf[off..off + 4].copy_from_slice(&value.to_le_bytes());
        let staged = buf.clone();
        self.cache.mark_dirty(index_block);
        tx.stage_meta(index_block, staged);
        Ok(())
    }

    /// A fresh index block: metadata, staged zero-filled.
    fn alloc_index_block(&mut self, tx: &mut Transaction) -> FsResult<u32> {
        let pbno = self.alloc_data_block(tx)?;
        let zeros = vec![0u8; self.sb.block_size as usize];
        self.cache.install(pbno, zeros.clone());
        tx.stage_meta(pbno, zeros);
        Ok(pbno)
    }

    /// A fresh leaf block: ordered data, zero-filled in cache so stale disk
    /// bytes are never visible through a partial write.
    fn alloc_leaf_block(&mut self, tx: &mut Transaction) -> FsResult<u32> {
        let pbno = self.alloc_data_block(tx)?;
        self.cache.install(pbno, vec![0u8; self.sb.block_size as usize]);
        Ok(pbno)
    }

    /// Physical block holding logical index `lbi`, or `None` for a hole.
    pub(crate) fn lookup_block(&mut self, inode: &Inode, lbi: u64) -> FsResult<Option<u32>> {
        let p = pointers_per_block(self.sb.block_size);
        let nonzero = |b: u32| if b == 0 { None } else { Some(b) };

        if lbi < DIRECT_SLOTS as u64 {
            return Ok(nonzero(inode.direct[lbi as usize]));
        }
        if lbi < DIRECT_SLOTS as u64 + p {
            let index = inode.direct[SINGLE_INDIRECT_SLOT];
            if index == 0 {
                return Ok(None);
            }
            return Ok(nonzero(self.read_ptr(index, lbi - DIRECT_SLOTS as u64)?));
        }
        if lbi < DIRECT_SLOTS as u64 + p + p * p {
            let top = inode.direct[DOUBLE_INDIRECT_SLOT];
            if top == 0 {
                return Ok(None);
            }
            let rel = lbi - DIRECT_SLOTS as u64 - p;
            let level2 = self.read_ptr(top, rel / p)?;
            if level2 == 0 {
                return Ok(None);
            }
            return Ok(nonzero(self.read_ptr(level2, rel % p)?));
        }
        Err(FsError::InvalidArgument)
    }

    /// Like `lookup_block` but allocates the leaf (and any missing index
    /// blocks) on the way down. The caller persists the inode afterwards;
    /// `direct` may have changed.
    pub(crate) fn resolve_block(
        &mut self,
        tx: &mut Transaction,
        inode: &mut Inode,
        lbi: u64,
    ) -> FsResult<u32> {
        let p = pointers_per_block(self.sb.block_size);

        if lbi < DIRECT_SLOTS as u64 {
            let slot = lbi as usize;
            if inode.direct[slot] == 0 {
                inode.direct[slot] = self.alloc_leaf_block(tx)?;
            }
            return Ok(inode.direct[slot]);
        }

        if lbi < DIRECT_SLOTS as u64 + p {
            if inode.direct[SINGLE_INDIRECT_SLOT] == 0 {
                inode.direct[SINGLE_INDIRECT_SLOT] = self.alloc_index_block(tx)?;
            }
            let index = inode.direct[SINGLE_INDIRECT_SLOT];
            let slot = lbi - DIRECT_SLOTS as u64;
            let mut leaf = self.read_ptr(index, slot)?;
            if leaf == 0 {
                leaf = self.alloc_leaf_block(tx)?;
                self.write_ptr(tx, index, slot, leaf)?;
            }
            return Ok(leaf);
        }

        if lbi < DIRECT_SLOTS as u64 + p + p * p {
            if inode.direct[DOUBLE_INDIRECT_SLOT] == 0 {
                inode.direct[DOUBLE_INDIRECT_SLOT] = self.alloc_index_block(tx)?;
            }
            let top = inode.direct[DOUBLE_INDIRECT_SLOT];
            let rel = lbi - DIRECT_SLOTS as u64 - p;
            let mut level2 = self.read_ptr(top, rel / p)?;
            if level2 == 0 {
                level2 = self.alloc_index_block(tx)?;
                self.write_ptr(tx, top, rel / p, level2)?;
            }
            let mut leaf = self.read_ptr(level2, rel % p)?;
            if leaf == 0 {
                leaf = self.alloc_leaf_block(tx)?;
                self.write_ptr(tx, level2, rel % p, leaf)?;
            }
            return Ok(leaf);
        }

        Err(FsError::InvalidArgument)
    }

    /// Zero the pointer that references logical block `lbi`.
    fn clear_pointer(
        &mut self,
        tx: &mut Transaction,
        inode: &mut Inode,
        lbi: u64,
    ) -> FsResult<()> {
        let p = pointers_per_block(self.sb.block_size);
        if lbi < DIRECT_SLOTS as u64 {
            inode.direct[lbi as usize] = 0;
        } else if lbi < DIRECT_SLOTS as u64 + p {
            let index = inode.direct[SINGLE_INDIRECT_SLOT];
            self.write_ptr(tx, index, lbi - DIRECT_SLOTS as u64, 0)?;
        } else {
            let top = inode.direct[DOUBLE_INDIRECT_SLOT];
            let rel = lbi - DIRECT_SLOTS as u64 - p;
            let level2 = self.read_ptr(top, rel / p)?;
            if level2 != 0 {
                self.write_ptr(tx, level2, rel % p, 0)?;
            }
        }
        Ok(())
    }

    /// Shrink or grow a file's block map to `new_size`. Shrinking frees the
    /// leaves past the boundary and reclaims index blocks whose subtrees
    /// emptied; growing only moves `size` (holes materialize on write). The
    /// last partial block is left as-is; reads past `size` return EOF.
    pub(crate) fn truncate_blocks(
        &mut self,
        tx: &mut Transaction,
        inode: &mut Inode,
        new_size: u64,
    ) -> FsResult<()> {
        let bs = self.sb.block_size as u64;
        let old_blocks = inode.size.div_ceil(bs);
        let new_blocks = new_size.div_ceil(bs);

        if new_blocks < old_blocks {
            for lbi in new_blocks..old_blocks {
                if let Some(pbno) = self.lookup_block(inode, lbi)? {
                    self.clear_pointer(tx, inode, lbi)?;
                    self.free_data_block(tx, pbno)?;
                }
            }
            self.reclaim_index_blocks(tx, inode, new_blocks)?;
        }
        inode.size = new_size;
        Ok(())
    }

    /// Free index blocks whose subtrees no longer hold any of the first
    /// `keep` logical blocks.
    fn reclaim_index_blocks(
        &mut self,
        tx: &mut Transaction,
        inode: &mut Inode,
        keep: u64,
    ) -> FsResult<()> {
        let p = pointers_per_block(self.sb.block_size);

        if inode.direct[SINGLE_INDIRECT_SLOT] != 0 && keep <= DIRECT_SLOTS as u64 {
            self.free_data_block(tx, inode.direct[SINGLE_INDIRECT_SLOT])?;
            inode.direct[SINGLE_INDIRECT_SLOT] = 0;
        }

        if inode.direct[DOUBLE_INDIRECT_SLOT] != 0 {
            let top = inode.direct[DOUBLE_INDIRECT_SLOT];
            let keep_in_double = keep.saturating_sub(DIRECT_SLOTS as u64 + p);
            let level2_keep = keep_in_double.div_ceil(p);
            for slot in level2_keep..p {
                let level2 = self.read_ptr(top, slot)?;
                if level2 != 0 {
                    self.write_ptr(tx, top, slot, 0)?;
                    self.free_data_block(tx, level2)?;
                }
            }
            if level2_keep == 0 {
                self.free_data_block(tx, top)?;
                inode.direct[DOUBLE_INDIRECT_SLOT] = 0;
            }
        }
        Ok(())
    }

    /// Every physical block reachable from `inode`: leaves plus the index
    /// blocks themselves. Used by the consistency check.
    pub(crate) fn collect_blocks(&mut self, inode: &Inode) -> FsResult<Vec<u32>> {
        let p = pointers_per_block(self.sb.block_size);
        let mut out = Vec::new();

        for slot in 0..DIRECT_SLOTS {
            if inode.direct[slot] != 0 {
                out.push(inode.direct[slot]);
            }
        }
        let index = inode.direct[SINGLE_INDIRECT_SLOT];
        if index != 0 {
            out.push(index);
            for slot in 0..p {
                let leaf = self.read_ptr(index, slot)?;
                if leaf != 0 {
                    out.push(leaf);
                }
            }
        }
        let top = inode.direct[DOUBLE_INDIRECT_SLOT];
        if top != 0 {
            out.push(top);
            for slot in 0..p {
                let level2 = self.read_ptr(top, slot)?;
                if level2 == 0 {
                    continue;
                }
                out.push(level2);
                for inner in 0..p {
                    let leaf = self.read_ptr(level2, inner)?;
                    if leaf != 0 {
                        out.push(leaf);
                    }
                }
            }
        }
        Ok(out)
    }
}
