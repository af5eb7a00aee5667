//! Crate-wide error type (spec.md §7), following the teacher's
//! `kernel/src/error.rs` `Error` → `ov6_syscall::Error` conversion shape:
//! one top-level `thiserror` enum that every subsystem's own error type
//! converts into.

use block_device::BlockError;
use fs::FsError;
use swap::SwapError;
use vm::MmapError;

/// Errors a [`crate::Kernel`] call can surface. Kernel-invariant
/// violations (corrupt inode magic, a sector past `MAX_SECTORS`, a
/// resident frame disagreeing with its owner's page table) are not here —
/// those remain panics per spec.md §7.
#[derive(Debug, thiserror::Error)]
pub enum KernelError {
    #[error(transparent)]
    Fs(#[from] FsError),
    #[error(transparent)]
    Block(#[from] BlockError),
    #[error(transparent)]
    Swap(#[from] SwapError),
    #[error(transparent)]
    Mmap(#[from] MmapError),
    #[error("no such process")]
    NoSuchProcess,
    #[error("bad file descriptor")]
    BadFd,
    #[error("frame table has no free frame and eviction failed")]
    FrameExhausted,
}
