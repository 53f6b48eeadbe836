use crate::error::{FsError, FsResult};

/// File kinds stored in the inode's `kind` byte. Zero is the unallocated
/// record, so a zeroed inode-table slot decodes as `Free`.
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
#[repr(u8)]
pub enum FileKind {
    #[default]
    Free = 0,
    RegularFile = 1,
    Directory = 2,
    SymbolicLink = 3,
}

impl FileKind {
    pub fn from_disk(raw: u8) -> FsResult<Self> {
        match raw {
            0 => Ok(FileKind::Free),
            1 => Ok(FileKind::RegularFile),
            2 => Ok(FileKind::Directory),
            3 => Ok(FileKind::SymbolicLink),
            other => Err(FsError::Corrupt(format!("unknown inode kind {other}"))),
        }
    }
}

impl From<FileKind> for fuser::FileType {
    fn from(kind: FileKind) -> Self {
        match kind {
            FileKind::RegularFile => fuser::FileType::RegularFile,
            FileKind::Directory => fuser::FileType::Directory,
            FileKind::SymbolicLink => fuser::FileType::Symlink,
            // a free inode never reaches a reply; treat as a regular file
            FileKind::Free => fuser::FileType::RegularFile,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_disk_round_trip() {
        for kind in [
            FileKind::Free,
            FileKind::RegularFile,
            FileKind::Directory,
            FileKind::SymbolicLink,
        ] {
            assert_eq!(FileKind::from_disk(kind as u8).unwrap(), kind);
        }
        assert!(FileKind::from_disk(9).is_err());
    }
}
