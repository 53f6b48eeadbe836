use serde::{Deserialize, Serialize};

use crate::device::BlockDev;
use crate::error::{FsError, FsResult};
use crate::utils::fs_size_calculator;

use super::FS_MAGIC;

/// The superblock of this filesystem: block 0 of the image, loaded once at
/// mount and written back through the journal when the free counters change.
///
/// Encoded with fixed-width little-endian integers, so the record is
/// bit-identical between the formatter and the mounter.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub struct SuperBlock {
    /// magic number
    pub magic: u32,
    /// block size in bytes, a power of two
    pub block_size: u32,
    pub total_blocks: u32,
    pub inode_count: u32,
    pub inode_bitmap_start: u32,
    pub inode_bitmap_blocks: u32,
    pub data_bitmap_start: u32,
    pub data_bitmap_blocks: u32,
    pub inode_table_start: u32,
    pub inode_table_blocks: u32,
    pub journal_start: u32,
    pub journal_blocks: u32,
    pub data_start: u32,
    pub free_inodes: u32,
    pub free_data_blocks: u32,
}

impl SuperBlock {
    /// Lay out a fresh image: regions in fixed order from block 0, each
    /// start derived from the previous region's end.
    pub fn new(
        block_size: u32,
        total_blocks: u32,
        inode_count: u32,
        journal_blocks: u32,
    ) -> Self {
        let inode_bitmap_start = 1;
        let inode_bitmap_blocks = fs_size_calculator::bitmap_blocks(inode_count, block_size);
        let data_bitmap_start = inode_bitmap_start + inode_bitmap_blocks;
        // sized for every block in the image; bits past the data region are
        // permanent padding (see DESIGN.md)
        let data_bitmap_blocks = fs_size_calculator::bitmap_blocks(total_blocks, block_size);
        let inode_table_start = data_bitmap_start + data_bitmap_blocks;
        let inode_table_blocks = fs_size_calculator::inode_table_blocks(inode_count, block_size);
        let journal_start = inode_table_start + inode_table_blocks;
        let data_start = journal_start + journal_blocks;

        SuperBlock {
            magic: FS_MAGIC,
            block_size,
            total_blocks,
            inode_count,
            inode_bitmap_start,
            inode_bitmap_blocks,
            data_bitmap_start,
            data_bitmap_blocks,
            inode_table_start,
            inode_table_blocks,
            journal_start,
            journal_blocks,
            data_start,
            free_inodes: 0,
            free_data_blocks: 0,
        }
    }

    /// Decode block 0 and adopt its geometry on the device.
    pub fn load(dev: &mut BlockDev) -> FsResult<Self> {
        let raw = dev.read_at(0, Self::encoded_size())?;
        let sb = Self::decode(raw)?;
        sb.verify_geometry()?;
        dev.set_geometry(sb.block_size);
        if dev.total_blocks() < sb.total_blocks {
            return Err(FsError::Geometry(format!(
                "image holds {} blocks, superblock claims {}",
                dev.total_blocks(),
                sb.total_blocks
            )));
        }
        Ok(sb)
    }

    pub fn decode(raw: &[u8]) -> FsResult<Self> {
        let config = bincode::config::legacy();
        let (sb, _len): (SuperBlock, usize) = bincode::serde::decode_from_slice(raw, config)
            .map_err(|_| FsError::BadMagic)?;
        if sb.magic != FS_MAGIC {
            return Err(FsError::BadMagic);
        }
        Ok(sb)
    }

    /// Serialized record width; the rest of block 0 is zero padding.
    pub fn encoded_size() -> usize {
        15 * std::mem::size_of::<u32>()
    }

    /// The full block-0 image of this superblock, for staging into a
    /// journal transaction.
    pub fn encode_block(&self, block_size: u32) -> FsResult<Vec<u8>> {
        let config = bincode::config::legacy();
        let raw = bincode::serde::encode_to_vec(self, config)
            .map_err(|e| FsError::Corrupt(format!("superblock encode: {e}")))?;
        let mut block = vec![0u8; block_size as usize];
        block[..raw.len()].copy_from_slice(&raw);
        Ok(block)
    }

    pub fn verify_geometry(&self) -> FsResult<()> {
        if !self.block_size.is_power_of_two() || self.block_size < 512 {
            return Err(FsError::Geometry(format!(
                "block size {} is not a power of two >= 512",
                self.block_size
            )));
        }
        if self.inode_count < 2 {
            return Err(FsError::Geometry("fewer than two inodes".into()));
        }
        // regions must be adjacent, disjoint, and cover [0, total_blocks)
        let mut expected = 1; // block 0 is the superblock
        for (name, start, len) in [
            ("inode bitmap", self.inode_bitmap_start, self.inode_bitmap_blocks),
            ("data bitmap", self.data_bitmap_start, self.data_bitmap_blocks),
            ("inode table", self.inode_table_start, self.inode_table_blocks),
            ("journal", self.journal_start, self.journal_blocks),
        ] {
            if start != expected {
                return Err(FsError::Geometry(format!(
                    "{name} starts at block {start}, expected {expected}"
                )));
            }
            expected = start + len;
        }
        if self.data_start != expected || self.data_start >= self.total_blocks {
            return Err(FsError::Geometry(format!(
                "data region start {} (expected {}, total {})",
                self.data_start, expected, self.total_blocks
            )));
        }
        // the journal needs its log superblock plus room for one minimal
        // transaction (descriptor + metadata + commit)
        if self.journal_blocks < 4 {
            return Err(FsError::Geometry(format!(
                "journal of {} blocks is too small",
                self.journal_blocks
            )));
        }
        if self.inode_table_blocks
            != fs_size_calculator::inode_table_blocks(self.inode_count, self.block_size)
        {
            return Err(FsError::Geometry("inode table size mismatch".into()));
        }
        Ok(())
    }

    pub fn data_block_count(&self) -> u32 {
        self.total_blocks - self.data_start
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_decode_round_trip() {
        let mut sb = SuperBlock::new(4096, 32768, 1024, 64);
        sb.free_inodes = 1022;
        sb.free_data_blocks = sb.data_block_count() - 1;

        let block = sb.encode_block(4096).unwrap();
        assert_eq!(block.len(), 4096);
        let back = SuperBlock::decode(&block).unwrap();
        assert_eq!(back, sb);
    }

    #[test]
    fn test_encoded_size_matches_bincode() {
        let sb = SuperBlock::new(4096, 32768, 1024, 64);
        let config = bincode::config::legacy();
        let raw = bincode::serde::encode_to_vec(&sb, config).unwrap();
        assert_eq!(raw.len(), SuperBlock::encoded_size());
    }

    #[test]
    fn test_bad_magic_rejected() {
        let sb = SuperBlock::new(4096, 32768, 1024, 64);
        let mut block = sb.encode_block(4096).unwrap();
        block[0] ^= 0xFF;
        assert!(matches!(SuperBlock::decode(&block), Err(FsError::BadMagic)));
    }

    #[test]
    fn test_geometry_regions_are_adjacent() {
        let sb = SuperBlock::new(4096, 32768, 1024, 64);
        sb.verify_geometry().unwrap();
        assert_eq!(sb.inode_bitmap_start, 1);
        assert_eq!(
            sb.data_bitmap_start,
            sb.inode_bitmap_start + sb.inode_bitmap_blocks
        );
        assert_eq!(
            sb.data_start,
            sb.journal_start + sb.journal_blocks
        );
    }

    #[test]
    fn test_geometry_rejects_overlap() {
        let mut sb = SuperBlock::new(4096, 32768, 1024, 64);
        sb.inode_table_start += 1;
        assert!(matches!(
            sb.verify_geometry(),
            Err(FsError::Geometry(_))
        ));
    }

    #[test]
    fn test_geometry_rejects_odd_block_size() {
        let mut sb = SuperBlock::new(4096, 32768, 1024, 64);
        sb.block_size = 3000;
        assert!(sb.verify_geometry().is_err());
    }
}
