use serde::{Deserialize, Serialize};

use crate::error::{FsError, FsResult};
use crate::utils::time_util;

use super::filekind::FileKind;
use super::{DIRECT_POINTERS, INODE_SIZE};

/// One on-disk inode record. Serialized with fixed-width little-endian
/// integers into a 128-byte table slot; the tail of the slot is reserved
/// padding, zeroed on write and ignored on read.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub struct Inode {
    pub kind: u8,
    /// permission bits only; the file type lives in `kind`
    pub mode: u16,
    pub uid: u32,
    pub gid: u32,
    pub nlink: u32,
    pub size: u64,
    pub atime: u64,
    pub mtime: u64,
    pub ctime: u64,
    /// slots 0..10 direct, slot 10 single-indirect, slot 11 double-indirect
    pub direct: [u32; DIRECT_POINTERS],
}

impl Inode {
    pub fn new(kind: FileKind, mode: u16, uid: u32, gid: u32) -> Self {
        let now = time_util::now_secs();
        Inode {
            kind: kind as u8,
            mode,
            uid,
            gid,
            nlink: 1,
            size: 0,
            atime: now,
            mtime: now,
            ctime: now,
            direct: [0u32; DIRECT_POINTERS],
        }
    }

    pub fn file_kind(&self) -> FsResult<FileKind> {
        FileKind::from_disk(self.kind)
    }

    pub fn is_dir(&self) -> bool {
        self.kind == FileKind::Directory as u8
    }

    pub fn is_regular_file(&self) -> bool {
        self.kind == FileKind::RegularFile as u8
    }

    pub fn is_symlink(&self) -> bool {
        self.kind == FileKind::SymbolicLink as u8
    }

    pub fn is_free(&self) -> bool {
        self.kind == FileKind::Free as u8
    }

    pub fn touch_mtime(&mut self) {
        let now = time_util::now_secs();
        self.mtime = now;
        self.ctime = now;
    }

    pub fn touch_ctime(&mut self) {
        self.ctime = time_util::now_secs();
    }

    /// Write this record into its zero-filled table slot.
    pub fn encode_into_slot(&self, slot: &mut [u8]) -> FsResult<()> {
        debug_assert_eq!(slot.len(), INODE_SIZE as usize);
        slot.fill(0);
        let config = bincode::config::legacy();
        let raw = bincode::serde::encode_to_vec(self, config)
            .map_err(|e| FsError::Corrupt(format!("inode encode: {e}")))?;
        slot[..raw.len()].copy_from_slice(&raw);
        Ok(())
    }

    pub fn decode_from_slot(slot: &[u8]) -> FsResult<Self> {
        let config = bincode::config::legacy();
        let (inode, _len): (Inode, usize) = bincode::serde::decode_from_slice(slot, config)
            .map_err(|e| FsError::Corrupt(format!("inode decode: {e}")))?;
        FileKind::from_disk(inode.kind)?;
        Ok(inode)
    }

    pub fn file_attr(&self, ino: u64, block_size: u32) -> fuser::FileAttr {
        let kind = FileKind::from_disk(self.kind).unwrap_or_default();
        fuser::FileAttr {
            ino,
            size: self.size,
            blocks: self.size.div_ceil(block_size as u64),
            atime: time_util::to_system_time(self.atime),
            mtime: time_util::to_system_time(self.mtime),
            ctime: time_util::to_system_time(self.ctime),
            crtime: time_util::to_system_time(self.ctime),
            kind: kind.into(),
            perm: self.mode,
            nlink: self.nlink,
            uid: self.uid,
            gid: self.gid,
            rdev: 0,
            blksize: block_size,
            flags: 0,
        }
    }
}
