//! Error type for the file-system layer (spec.md §7).

use block_device::BlockError;

/// Errors produced by [`crate::FileSystem`] operations.
#[derive(Debug, thiserror::Error, Clone, Copy, PartialEq, Eq)]
pub enum FsError {
    #[error("no such file or directory")]
    NotFound,
    #[error("not a directory")]
    NotADirectory,
    #[error("is a directory")]
    IsADirectory,
    #[error("directory is not empty")]
    DirectoryNotEmpty,
    #[error("directory is open elsewhere")]
    DirectoryBusy,
    #[error("name already exists in directory")]
    AlreadyExists,
    #[error("invalid file name")]
    InvalidName,
    #[error("file system is out of free sectors")]
    NoSpace,
    #[error("file offset {0} is out of range for this inode")]
    OutOfRange(u64),
    #[error("on-disk inode at sector {0} failed its magic check")]
    Corrupt(u32),
    #[error(transparent)]
    Block(#[from] BlockError),
}
