//! The filesystem proper: on-disk records, region managers, block
//! addressing, the directory codec, and the operation layer.

pub mod bitmap;
pub mod block_map;
pub mod directory;
pub mod filekind;
pub mod fs_api_impl;
pub mod fs_layout;
pub mod inode;
pub mod ops;
pub mod superblock;

pub use directory::DirEntry;
pub use filekind::FileKind;
pub use fs_api_impl::FuseDriver;
pub use fs_layout::WayneFS;
pub use inode::Inode;
pub use ops::StatFs;
pub use superblock::SuperBlock;

pub const FS_MAGIC: u32 = 0x5741_594e; // "WAYN"
/// inode 0 is reserved invalid; the root directory is inode 1
pub const ROOT_INODE: u32 = 1;
/// fixed width of one on-disk inode record
pub const INODE_SIZE: u32 = 128;

/// `direct` slots per inode: 0..10 hold data pointers, slot 10 the
/// single-indirect index, slot 11 the double-indirect index
pub const DIRECT_POINTERS: usize = 12;
pub const DIRECT_SLOTS: usize = 10;
pub const SINGLE_INDIRECT_SLOT: usize = 10;
pub const DOUBLE_INDIRECT_SLOT: usize = 11;

pub const NAME_MAX: usize = 255;
pub const SYMLINK_FOLLOW_MAX: u32 = 8;

/// pointers per index block
pub const fn pointers_per_block(block_size: u32) -> u64 {
    (block_size / 4) as u64
}

/// largest byte offset addressable through the direct + single + double
/// indirect scheme
pub const fn max_file_size(block_size: u32) -> u64 {
    let p = pointers_per_block(block_size);
    (DIRECT_SLOTS as u64 + p + p * p) * block_size as u64
}
