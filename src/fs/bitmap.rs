use bitvec::prelude::*;

use crate::cache::PageCache;
use crate::device::BlockDev;
use crate::error::{FsError, FsResult};
use crate::journal::Transaction;

/// One bitmap region: a contiguous run of blocks holding one bit per
/// object (inode or data block). A set bit means allocated. Bitmap blocks
/// are ordinary metadata: mutations go through the page cache and are
/// staged into the current transaction.
#[derive(Debug)]
pub struct BitmapRegion {
    start_block: u32,
    nbits: u32,
}

impl BitmapRegion {
    pub fn new(start_block: u32, nbits: u32) -> Self {
        BitmapRegion { start_block, nbits }
    }

    fn locate(&self, dev: &BlockDev, idx: u32) -> FsResult<(u32, usize)> {
        if idx >= self.nbits {
            return Err(FsError::InvalidArgument);
        }
        let bits_per_block = dev.block_size() * 8;
        Ok((
            self.start_block + idx / bits_per_block,
            (idx % bits_per_block) as usize,
        ))
    }

    /// Lowest free index, with its bit flipped to allocated; `None` when
    /// the region is exhausted.
    pub fn allocate(
        &self,
        dev: &BlockDev,
        cache: &mut PageCache,
        tx: &mut Transaction,
    ) -> FsResult<Option<u32>> {
        let bits_per_block = dev.block_size() * 8;
        let nblocks = self.nbits.div_ceil(bits_per_block);
        for i in 0..nblocks {
            let bno = self.start_block + i;
            let limit = (self.nbits - i * bits_per_block).min(bits_per_block) as usize;
            let buf = cache.get_mut(dev, bno)?;
            let bits = &mut buf.view_bits_mut::<Lsb0>()[..limit];
            if let Some(pos) = bits.first_zero() {
                bits.set(pos, true);
                let staged = buf.clone();
                cache.mark_dirty(bno);
                tx.stage_meta(bno, staged);
                return Ok(Some(i * bits_per_block + pos as u32));
            }
        }
        Ok(None)
    }

    pub fn free(
        &self,
        dev: &BlockDev,
        cache: &mut PageCache,
        tx: &mut Transaction,
        idx: u32,
    ) -> FsResult<()> {
        let (bno, pos) = self.locate(dev, idx)?;
        let buf = cache.get_mut(dev, bno)?;
        let bits = buf.view_bits_mut::<Lsb0>();
        if !bits[pos] {
            return Err(FsError::Corrupt(format!("double free of bitmap index {idx}")));
        }
        bits.set(pos, false);
        let staged = buf.clone();
        cache.mark_dirty(bno);
        tx.stage_meta(bno, staged);
        Ok(())
    }

    pub fn test(&self, dev: &BlockDev, cache: &mut PageCache, idx: u32) -> FsResult<bool> {
        let (bno, pos) = self.locate(dev, idx)?;
        let buf = cache.get(dev, bno)?;
        Ok(buf.view_bits::<Lsb0>()[pos])
    }

    /// Zero-bit population; the superblock free counters must equal this.
    pub fn count_zeros(&self, dev: &BlockDev, cache: &mut PageCache) -> FsResult<u32> {
        let bits_per_block = dev.block_size() * 8;
        let nblocks = self.nbits.div_ceil(bits_per_block);
        let mut zeros = 0;
        for i in 0..nblocks {
            let limit = (self.nbits - i * bits_per_block).min(bits_per_block) as usize;
            let buf = cache.get(dev, self.start_block + i)?;
            zeros += buf.view_bits::<Lsb0>()[..limit].count_zeros() as u32;
        }
        Ok(zeros)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::DEFAULT_BLOCK_SIZE;
    use crate::journal::Transaction;
    use std::io::Write;

    fn scratch() -> (tempfile::NamedTempFile, BlockDev, PageCache) {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        f.write_all(&vec![0u8; (8 * DEFAULT_BLOCK_SIZE) as usize])
            .unwrap();
        f.flush().unwrap();
        let dev = BlockDev::open(f.path()).unwrap();
        (f, dev, PageCache::new())
    }

    #[test]
    fn test_allocate_lowest_first() {
        let (_img, dev, mut cache) = scratch();
        let mut tx = Transaction::new(1);
        let bitmap = BitmapRegion::new(2, 100);

        assert_eq!(bitmap.allocate(&dev, &mut cache, &mut tx).unwrap(), Some(0));
        assert_eq!(bitmap.allocate(&dev, &mut cache, &mut tx).unwrap(), Some(1));
        assert!(bitmap.test(&dev, &mut cache, 0).unwrap());
        assert!(!bitmap.test(&dev, &mut cache, 2).unwrap());
        // the touched bitmap block is staged as metadata
        assert!(tx.meta_writes().contains_key(&2));
    }

    #[test]
    fn test_free_reopens_lowest_slot() {
        let (_img, dev, mut cache) = scratch();
        let mut tx = Transaction::new(1);
        let bitmap = BitmapRegion::new(2, 100);

        for _ in 0..5 {
            bitmap.allocate(&dev, &mut cache, &mut tx).unwrap();
        }
        bitmap.free(&dev, &mut cache, &mut tx, 1).unwrap();
        assert_eq!(bitmap.allocate(&dev, &mut cache, &mut tx).unwrap(), Some(1));
    }

    #[test]
    fn test_double_free_detected() {
        let (_img, dev, mut cache) = scratch();
        let mut tx = Transaction::new(1);
        let bitmap = BitmapRegion::new(2, 100);

        bitmap.allocate(&dev, &mut cache, &mut tx).unwrap();
        bitmap.free(&dev, &mut cache, &mut tx, 0).unwrap();
        assert!(bitmap.free(&dev, &mut cache, &mut tx, 0).is_err());
    }

    #[test]
    fn test_exhaustion_and_count() {
        let (_img, dev, mut cache) = scratch();
        let mut tx = Transaction::new(1);
        let bitmap = BitmapRegion::new(2, 9);

        for i in 0..9 {
            assert_eq!(
                bitmap.allocate(&dev, &mut cache, &mut tx).unwrap(),
                Some(i)
            );
        }
        assert_eq!(bitmap.allocate(&dev, &mut cache, &mut tx).unwrap(), None);
        assert_eq!(bitmap.count_zeros(&dev, &mut cache).unwrap(), 0);
        bitmap.free(&dev, &mut cache, &mut tx, 4).unwrap();
        assert_eq!(bitmap.count_zeros(&dev, &mut cache).unwrap(), 1);
    }

    #[test]
    fn test_spans_multiple_blocks() {
        let (_img, dev, mut cache) = scratch();
        let mut tx = Transaction::new(1);
        let bits_per_block = DEFAULT_BLOCK_SIZE * 8;
        let bitmap = BitmapRegion::new(1, bits_per_block + 8);

        // exhaust the first block, then land in the second
        let buf = cache.get_mut(&dev, 1).unwrap();
        buf.fill(0xFF);
        assert_eq!(
            bitmap.allocate(&dev, &mut cache, &mut tx).unwrap(),
            Some(bits_per_block)
        );
        assert!(tx.meta_writes().contains_key(&2));
    }
}
