//! Error kinds raised by the filesystem core.
//!
//! Each kind is raised at the layer that detects it and propagated upward
//! unchanged; the FUSE adapter maps kinds to errno values at the boundary.

use thiserror::Error;

pub type FsResult<T> = Result<T, FsError>;

#[derive(Debug, Error)]
pub enum FsError {
    // storage
    #[error("block {0} out of range")]
    BlockOutOfRange(u32),
    #[error("I/O failure: {0}")]
    Io(#[from] std::io::Error),

    // structural
    #[error("bad superblock magic")]
    BadMagic,
    #[error("superblock geometry inconsistent: {0}")]
    Geometry(String),
    #[error("journal unusable: {0}")]
    JournalCorrupt(String),
    #[error("on-disk structure corrupt: {0}")]
    Corrupt(String),

    // resource
    #[error("out of inodes")]
    NoInodes,
    #[error("out of data blocks")]
    NoSpace,

    // semantic
    #[error("no such file or directory")]
    NotFound,
    #[error("file exists")]
    Exists,
    #[error("not a directory")]
    NotDirectory,
    #[error("is a directory")]
    IsDirectory,
    #[error("directory not empty")]
    NotEmpty,
    #[error("name too long")]
    NameTooLong,
    #[error("invalid argument")]
    InvalidArgument,
    #[error("too many levels of symbolic links")]
    SymlinkLoop,
}

impl FsError {
    /// The errno handed back to the kernel through the FUSE reply.
    pub fn errno(&self) -> libc::c_int {
        match self {
            FsError::BlockOutOfRange(_) => libc::EIO,
            FsError::Io(_) => libc::EIO,
            FsError::BadMagic => libc::EIO,
            FsError::Geometry(_) => libc::EIO,
            FsError::JournalCorrupt(_) => libc::EIO,
            FsError::Corrupt(_) => libc::EIO,
            FsError::NoInodes => libc::ENOSPC,
            FsError::NoSpace => libc::ENOSPC,
            FsError::NotFound => libc::ENOENT,
            FsError::Exists => libc::EEXIST,
            FsError::NotDirectory => libc::ENOTDIR,
            FsError::IsDirectory => libc::EISDIR,
            FsError::NotEmpty => libc::ENOTEMPTY,
            FsError::NameTooLong => libc::ENAMETOOLONG,
            FsError::InvalidArgument => libc::EINVAL,
            FsError::SymlinkLoop => libc::ELOOP,
        }
    }

    /// Process exit code for mount failures, one per structural cause.
    pub fn exit_code(&self) -> i32 {
        match self {
            FsError::Io(_) | FsError::BlockOutOfRange(_) => 2,
            FsError::BadMagic | FsError::Geometry(_) => 3,
            FsError::JournalCorrupt(_) => 4,
            _ => 1,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_errno_mapping() {
        assert_eq!(FsError::NotFound.errno(), libc::ENOENT);
        assert_eq!(FsError::Exists.errno(), libc::EEXIST);
        assert_eq!(FsError::NoSpace.errno(), libc::ENOSPC);
        assert_eq!(FsError::NotEmpty.errno(), libc::ENOTEMPTY);
        assert_eq!(FsError::BadMagic.errno(), libc::EIO);
    }

    #[test]
    fn test_exit_codes_are_distinct() {
        assert_eq!(FsError::BadMagic.exit_code(), 3);
        assert_eq!(FsError::JournalCorrupt("x".into()).exit_code(), 4);
        assert_ne!(
            FsError::BadMagic.exit_code(),
            FsError::JournalCorrupt("x".into()).exit_code()
        );
    }
}
