//! Adapts `fs::OpenFile` to `vm::BackingFile` without either crate knowing
//! about the other (the orphan rule forces this indirection into whichever
//! crate wires both together, which is this one).

use alloc::sync::Arc;

use block_device::BlockDevice;
use fs::{FsError, OpenFile};
use sync::Scheduler;
use vm::BackingFile;

/// An open file, shared across every fd that refers to it and every
/// `vm` mapping backed by it.
///
/// Wraps the inner [`OpenFile`] in an `Option` purely so [`Drop`] can take
/// it out and call its consuming `close`, which is the only way an
/// `OpenFile` releases its inode (decrementing `open_count`, freeing the
/// inode's blocks if it was removed while open). Every [`FileHandle`] is
/// held behind an `Arc`, so this runs exactly once, when the last fd table
/// entry and the last `vm` mapping referencing it are both gone.
pub struct FileHandle<S: Scheduler, D: BlockDevice>(Option<OpenFile<S, D>>);

impl<S: Scheduler, D: BlockDevice> FileHandle<S, D> {
    #[must_use]
    pub fn new(file: OpenFile<S, D>) -> Arc<Self> {
        Arc::new(Self(Some(file)))
    }

    fn inner(&self) -> &OpenFile<S, D> {
        self.0.as_ref().expect("FileHandle used after its own Drop ran")
    }

    pub fn seek(&self, position: u64) {
        self.inner().seek(position);
    }

    pub fn tell(&self) -> u64 {
        self.inner().tell()
    }

    pub fn read(&self, buf: &mut [u8]) -> Result<usize, FsError> {
        self.inner().read(buf)
    }

    pub fn write(&self, buf: &[u8]) -> Result<usize, FsError> {
        self.inner().write(buf)
    }

    pub fn length(&self) -> Result<u64, FsError> {
        self.inner().length()
    }

    pub fn inumber(&self) -> u32 {
        self.inner().inumber()
    }

    pub fn isdir(&self) -> Result<bool, FsError> {
        self.inner().isdir()
    }

    pub fn deny_write(&self) {
        self.inner().deny_write();
    }

    pub fn allow_write(&self) {
        self.inner().allow_write();
    }
}

impl<S: Scheduler, D: BlockDevice> BackingFile for FileHandle<S, D> {
    type Error = FsError;

    fn read_at(&self, buf: &mut [u8], offset: u64) -> Result<usize, Self::Error> {
        self.inner().read_at(buf, offset)
    }

    fn write_at(&self, buf: &[u8], offset: u64) -> Result<usize, Self::Error> {
        self.inner().write_at(buf, offset)
    }
}

impl<S: Scheduler, D: BlockDevice> Drop for FileHandle<S, D> {
    fn drop(&mut self) {
        if let Some(file) = self.0.take() {
            if let Err(err) = file.close() {
                log::warn!("pintos-core: error closing file on last reference drop: {err}");
            }
        }
    }
}
