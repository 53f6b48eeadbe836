//! Positional block I/O over a memory-mapped image file.
//!
//! The image is pre-sized by the formatter; the device never grows it.
//! `sync` is the durability barrier the journal relies on between commit
//! phases.

use std::fs::OpenOptions;
use std::path::Path;

use memmap2::MmapMut;

use crate::error::{FsError, FsResult};

pub const DEFAULT_BLOCK_SIZE: u32 = 4096;

#[derive(Debug)]
pub struct BlockDev {
    map: MmapMut,
    block_size: u32,
    total_blocks: u32,
}

impl BlockDev {
    /// Open an existing image for read and write. The block size starts at
    /// the default and is corrected by `set_geometry` once the superblock
    /// has been decoded.
    pub fn open<P>(image_path: P) -> FsResult<Self>
    where
        P: AsRef<Path>,
    {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(image_path.as_ref())?;

        // Safety: a single mounted instance owns the image exclusively, so
        // no other mapping mutates it underneath us.
        let map = unsafe { MmapMut::map_mut(&file)? };
        let total_blocks = (map.len() / DEFAULT_BLOCK_SIZE as usize) as u32;
        Ok(BlockDev {
            map,
            block_size: DEFAULT_BLOCK_SIZE,
            total_blocks,
        })
    }

    /// Adopt the block size recorded in the superblock.
    pub fn set_geometry(&mut self, block_size: u32) {
        self.block_size = block_size;
        self.total_blocks = (self.map.len() / block_size as usize) as u32;
    }

    pub fn block_size(&self) -> u32 {
        self.block_size
    }

    pub fn total_blocks(&self) -> u32 {
        self.total_blocks
    }

    fn check_range(&self, bno: u32) -> FsResult<usize> {
        if bno >= self.total_blocks {
            return Err(FsError::BlockOutOfRange(bno));
        }
        Ok(bno as usize * self.block_size as usize)
    }

    /// Raw positional read, used to decode the superblock before the block
    /// size is known.
    pub fn read_at(&self, offset: usize, len: usize) -> FsResult<&[u8]> {
        if offset + len > self.map.len() {
            return Err(FsError::BlockOutOfRange((offset / self.block_size as usize) as u32));
        }
        Ok(&self.map[offset..offset + len])
    }

    pub fn read_block(&self, bno: u32) -> FsResult<Vec<u8>> {
        let off = self.check_range(bno)?;
        Ok(self.map[off..off + self.block_size as usize].to_vec())
    }

    pub fn read_block_into(&self, bno: u32, buf: &mut [u8]) -> FsResult<()> {
        let off = self.check_range(bno)?;
        buf.copy_from_slice(&self.map[off..off + self.block_size as usize]);
        Ok(())
    }

    pub fn write_block(&mut self, bno: u32, data: &[u8]) -> FsResult<()> {
        let off = self.check_range(bno)?;
        if data.len() != self.block_size as usize {
            return Err(FsError::InvalidArgument);
        }
        self.map[off..off + data.len()].copy_from_slice(data);
        Ok(())
    }

    /// Durability barrier: every prior write is on stable storage when this
    /// returns.
    pub fn sync(&self) -> FsResult<()> {
        self.map.flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn scratch_image(blocks: u32) -> tempfile::NamedTempFile {
        let mut f = tempfile::NamedTempFile::new().expect("create temp image");
        f.write_all(&vec![0u8; (blocks * DEFAULT_BLOCK_SIZE) as usize])
            .expect("size image");
        f.flush().unwrap();
        f
    }

    #[test]
    fn test_block_round_trip() {
        let img = scratch_image(8);
        let mut dev = BlockDev::open(img.path()).unwrap();
        assert_eq!(dev.total_blocks(), 8);

        let mut data = vec![0u8; DEFAULT_BLOCK_SIZE as usize];
        data[0] = 0xAB;
        data[4095] = 0xCD;
        dev.write_block(3, &data).unwrap();
        dev.sync().unwrap();

        let back = dev.read_block(3).unwrap();
        assert_eq!(back, data);
        // neighbours untouched
        assert!(dev.read_block(2).unwrap().iter().all(|b| *b == 0));
    }

    #[test]
    fn test_out_of_range() {
        let img = scratch_image(4);
        let mut dev = BlockDev::open(img.path()).unwrap();
        assert!(matches!(
            dev.read_block(4),
            Err(FsError::BlockOutOfRange(4))
        ));
        let block = vec![0u8; DEFAULT_BLOCK_SIZE as usize];
        assert!(dev.write_block(99, &block).is_err());
    }

    #[test]
    fn test_geometry_switch() {
        let img = scratch_image(4); // 16 KiB
        let mut dev = BlockDev::open(img.path()).unwrap();
        dev.set_geometry(512);
        assert_eq!(dev.total_blocks(), 32);
        let data = vec![7u8; 512];
        dev.write_block(31, &data).unwrap();
        assert_eq!(dev.read_block(31).unwrap(), data);
    }
}
