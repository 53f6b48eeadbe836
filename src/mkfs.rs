//! Create a fresh filesystem image: superblock, zeroed bitmaps, zeroed
//! inode table, an empty journal, and the root directory.

use std::fs::OpenOptions;
use std::path::Path;

use anyhow::anyhow;
use bitvec::prelude::*;
use byte_unit::Byte;

use crate::device::BlockDev;
use crate::fs::directory::{init_dir_block, insert_in_block};
use crate::fs::{FileKind, Inode, SuperBlock, INODE_SIZE, ROOT_INODE};
use crate::journal::Journal;

/// Smallest image worth formatting, in blocks.
const MIN_TOTAL_BLOCKS: u64 = 64;

fn default_journal_blocks(total_blocks: u64) -> u32 {
    (total_blocks / 16).clamp(8, 1024) as u32
}

/// Create a new filesystem image.
/// # Params
/// - `image_file_path`: path of the image file to create (must not exist)
/// - `size_mb`: total image size in MiB
/// - `block_size`: filesystem block size, a power of two >= 512
/// - `inode_count`: number of inodes
/// - `journal_blocks`: journal region size; sized from the image if `None`
pub fn mkfs<P>(
    image_file_path: P,
    size_mb: u64,
    block_size: u32,
    inode_count: u32,
    journal_blocks: Option<u32>,
) -> anyhow::Result<()>
where
    P: AsRef<Path>,
{
    if !block_size.is_power_of_two() || block_size < 512 {
        return Err(anyhow!("block size must be a power of two >= 512"));
    }
    if inode_count < 2 {
        return Err(anyhow!("need at least two inodes (reserved + root)"));
    }

    let total_bytes = size_mb * 1024 * 1024;
    let total_blocks = total_bytes / block_size as u64;
    if total_blocks < MIN_TOTAL_BLOCKS {
        return Err(anyhow!(
            "image of {} is too small; give at least {}",
            Byte::from_bytes(total_bytes as u128).get_appropriate_unit(true),
            Byte::from_bytes((MIN_TOTAL_BLOCKS * block_size as u64) as u128)
                .get_appropriate_unit(true)
        ));
    }

    let journal_blocks = journal_blocks.unwrap_or_else(|| default_journal_blocks(total_blocks));
    let mut sb = SuperBlock::new(block_size, total_blocks as u32, inode_count, journal_blocks);
    if sb.data_start >= sb.total_blocks {
        return Err(anyhow!(
            "layout exceeds image size; increase size or reduce inode count"
        ));
    }
    // reserved inode 0, root inode 1, root directory block 0
    sb.free_inodes = inode_count - 2;
    sb.free_data_blocks = sb.data_block_count() - 1;
    sb.verify_geometry()?;

    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .create_new(true)
        .open(image_file_path.as_ref())?;
    file.set_len(total_blocks * block_size as u64)?;
    drop(file);

    let mut dev = BlockDev::open(image_file_path.as_ref())?;
    dev.set_geometry(block_size);

    // superblock
    dev.write_block(0, &sb.encode_block(block_size)?)?;

    // inode bitmap: reserved inode 0 and the root are allocated
    let mut bitmap_block = vec![0u8; block_size as usize];
    {
        let bits = bitmap_block.view_bits_mut::<Lsb0>();
        bits.set(0, true);
        bits.set(ROOT_INODE as usize, true);
    }
    dev.write_block(sb.inode_bitmap_start, &bitmap_block)?;

    // data bitmap: the root directory owns data block 0
    let mut bitmap_block = vec![0u8; block_size as usize];
    bitmap_block.view_bits_mut::<Lsb0>().set(0, true);
    dev.write_block(sb.data_bitmap_start, &bitmap_block)?;

    // root inode
    let uid = users::get_effective_uid();
    let gid = users::get_effective_gid();
    let mut root = Inode::new(FileKind::Directory, 0o755, uid, gid);
    root.nlink = 2;
    root.size = block_size as u64;
    root.direct[0] = sb.data_start;
    let mut table_block = vec![0u8; block_size as usize];
    let slot = (ROOT_INODE * INODE_SIZE) as usize;
    root.encode_into_slot(&mut table_block[slot..slot + INODE_SIZE as usize])?;
    dev.write_block(sb.inode_table_start, &table_block)?;

    // root directory data
    let mut dir_block = vec![0u8; block_size as usize];
    init_dir_block(&mut dir_block);
    insert_in_block(&mut dir_block, b".", ROOT_INODE, FileKind::Directory as u8)?;
    insert_in_block(&mut dir_block, b"..", ROOT_INODE, FileKind::Directory as u8)?;
    dev.write_block(sb.data_start, &dir_block)?;

    // empty journal
    Journal::format(&mut dev, &sb)?;
    dev.sync()?;

    println!("created image: {}", image_file_path.as_ref().display());
    println!(
        "  block_size={} total_blocks={} inodes={} journal_blocks={}",
        sb.block_size, sb.total_blocks, sb.inode_count, sb.journal_blocks
    );
    println!(
        "  inode_bitmap_start={} data_bitmap_start={} inode_table_start={} journal_start={} data_start={}",
        sb.inode_bitmap_start, sb.data_bitmap_start, sb.inode_table_start, sb.journal_start,
        sb.data_start
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::WayneFS;

    fn image_path(dir: &tempfile::TempDir) -> std::path::PathBuf {
        dir.path().join("test.img")
    }

    #[test]
    fn test_mkfs_then_mount() {
        let dir = tempfile::tempdir().unwrap();
        let img = image_path(&dir);
        mkfs(&img, 16, 4096, 1024, None).unwrap();

        let mut fs = WayneFS::mount(&img).unwrap();
        let (ino, root) = fs.getattr("/").unwrap();
        assert_eq!(ino, ROOT_INODE);
        assert!(root.is_dir());
        assert_eq!(root.nlink, 2);
        assert_eq!(root.mode, 0o755);

        let names: Vec<String> = fs
            .readdir("/")
            .unwrap()
            .into_iter()
            .map(|e| e.name)
            .collect();
        assert_eq!(names, vec![".", ".."]);

        let stat = fs.statfs();
        assert_eq!(stat.free_inodes, 1022);
        assert_eq!(stat.free_blocks, stat.total_blocks - 1);

        fs.check_consistency().unwrap();
    }

    #[test]
    fn test_mkfs_rejects_existing_image() {
        let dir = tempfile::tempdir().unwrap();
        let img = image_path(&dir);
        mkfs(&img, 16, 4096, 1024, None).unwrap();
        assert!(mkfs(&img, 16, 4096, 1024, None).is_err());
    }

    #[test]
    fn test_mkfs_rejects_tiny_image() {
        let dir = tempfile::tempdir().unwrap();
        let img = image_path(&dir);
        assert!(mkfs(&img, 0, 4096, 1024, None).is_err());
    }

    #[test]
    fn test_mkfs_rejects_bad_block_size() {
        let dir = tempfile::tempdir().unwrap();
        let img = image_path(&dir);
        assert!(mkfs(&img, 16, 3000, 1024, None).is_err());
        assert!(mkfs(&img, 16, 256, 1024, None).is_err());
    }

    #[test]
    fn test_small_block_size_layout() {
        let dir = tempfile::tempdir().unwrap();
        let img = image_path(&dir);
        mkfs(&img, 8, 512, 256, Some(16)).unwrap();
        let mut fs = WayneFS::mount(&img).unwrap();
        assert_eq!(fs.superblock().block_size, 512);
        fs.check_consistency().unwrap();
    }
}
