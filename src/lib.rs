//! WayneFS: a user-space POSIX-semantics filesystem backed by a single
//! fixed-size disk image and exposed through FUSE.
//!
//! The design is a stack: a block device over the image, superblock and
//! bitmap managers, a fixed inode table, direct/single/double indirect
//! block addressing, a directory codec, a write-back page cache, a dentry
//! cache, an ordered-mode write-ahead journal, and the POSIX operation
//! layer on top. Metadata is crash-consistent: every mutating operation is
//! one journal transaction, and mount replays whatever the log proves
//! durable.

pub mod cache;
pub mod cli_interface;
pub mod dentry;
pub mod device;
pub mod error;
pub mod fs;
pub mod journal;
pub mod mkfs;
pub mod mount;
pub mod utils;

pub use error::{FsError, FsResult};
pub use fs::{DirEntry, FileKind, FuseDriver, Inode, StatFs, SuperBlock, WayneFS};
