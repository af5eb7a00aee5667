//! Buffered, sectored file system (spec.md §4.5-§4.6).
//!
//! [`FileSystem`] composes a [`BlockCache`], a [`FreeMap`] allocator, and an
//! [`OpenInodeTable`] into the file-system API a syscall layer would sit on
//! top of (spec.md §6 names that surface as `bool`/`null`/`-1` there; this
//! crate returns `Result` and leaves that translation to the caller).
#![cfg_attr(not(test), no_std)]

extern crate alloc;

mod directory;
mod disk_inode;
mod error;
mod free_map;
mod inode;
mod path;

use alloc::sync::Arc;

use block_cache::BlockCache;
use block_device::{BlockDevice, SECTOR_SIZE};
use sync::{Lock, Scheduler};

pub use directory::{DirEntry, MAX_FILE_NAME};
pub use disk_inode::MAX_BLOCK_INDEX;
pub use error::FsError;
pub use free_map::ROOT_DIR_SECTOR;
pub use inode::InodeRef;
pub use path::Resolved;

use disk_inode::DiskInode;
use free_map::FreeMap;
use inode::OpenInodeTable;

/// The file system: a block cache, a free-sector allocator, and the set of
/// currently open inodes.
pub struct FileSystem<S: Scheduler, D: BlockDevice> {
    pub(crate) cache: BlockCache<S, D>,
    pub(crate) free_map: FreeMap<S>,
    open_inodes: OpenInodeTable<S>,
}

impl<S: Scheduler, D: BlockDevice> FileSystem<S, D> {
    /// Formats a fresh file system onto `device`: a zeroed free-sector map
    /// reserving the boot, map, and root-directory sectors, plus an empty
    /// root directory inode at [`ROOT_DIR_SECTOR`].
    ///
    /// Failure here means the device is too small to hold even the boot
    /// layout, which is a kernel configuration bug, not a recoverable
    /// runtime error.
    pub fn format(device: D) -> Self {
        let sector_count = device.sector_count();
        let cache = BlockCache::new(device);
        let free_map = FreeMap::format(sector_count);
        free_map
            .persist(&cache)
            .expect("free-sector map must fit the formatted device");
        let fs = Self {
            cache,
            free_map,
            open_inodes: OpenInodeTable::new(),
        };
        let root = DiskInode::new(true, ROOT_DIR_SECTOR, 0);
        inode::write_disk_inode(&fs.cache, ROOT_DIR_SECTOR, root)
            .expect("root directory inode must be writable right after format");
        fs
    }

    /// Mounts a previously formatted device, loading the persisted
    /// free-sector map.
    pub fn load(device: D) -> Result<Self, FsError> {
        let sector_count = device.sector_count();
        let cache = BlockCache::new(device);
        let free_map = FreeMap::load(&cache, sector_count)?;
        Ok(Self {
            cache,
            free_map,
            open_inodes: OpenInodeTable::new(),
        })
    }

    /// Creates a new, empty regular file named `name` in the directory at
    /// `dir_sector`, pre-sized to `size` bytes.
    pub fn create(&self, dir_sector: u32, name: &str, size: u32) -> Result<(), FsError> {
        let file_sector = self.create_raw_inode(dir_sector, false, size)?;
        if let Err(err) = directory::add(self, dir_sector, name, file_sector) {
            let disk = inode::read_disk_inode(&self.cache, file_sector)?;
            if let Err(rollback_err) = inode::release_all_blocks(&self.cache, &self.free_map, &disk)
            {
                log::warn!("create({name}): rollback of sector {file_sector} failed: {rollback_err}");
            }
            let _ = self.free_map.free_sector(&self.cache, file_sector);
            return Err(err);
        }
        Ok(())
    }

    /// Opens `name` within `dir_sector` for reading and writing.
    ///
    /// Takes `self` via `Arc` rather than `&self`: an open file must be
    /// shareable and outlive the borrow of any single call (it ends up
    /// parked in a process's fd table, held independently of whatever
    /// opened it), so [`OpenFile`] keeps its own `Arc` to the file system
    /// instead of borrowing it.
    pub fn open_file(self: &Arc<Self>, dir_sector: u32, name: &str) -> Result<OpenFile<S, D>, FsError> {
        let sector = directory::lookup(self, dir_sector, name)?.ok_or(FsError::NotFound)?;
        Ok(OpenFile {
            fs: Arc::clone(self),
            inode: self.open(sector),
            position: Lock::new(0),
        })
    }

    /// Removes `name` from `dir_sector`. Fails if it names a non-empty
    /// directory.
    pub fn remove(&self, dir_sector: u32, name: &str) -> Result<(), FsError> {
        directory::remove(self, dir_sector, name)
    }

    /// Creates a new, empty subdirectory named `name` under `dir_sector`,
    /// returning its inode sector.
    pub fn mkdir(&self, dir_sector: u32, name: &str) -> Result<u32, FsError> {
        let new_sector = directory::create(self, dir_sector, 0)?;
        if let Err(err) = directory::add(self, dir_sector, name, new_sector) {
            let disk = inode::read_disk_inode(&self.cache, new_sector)?;
            if let Err(rollback_err) = inode::release_all_blocks(&self.cache, &self.free_map, &disk)
            {
                log::warn!("mkdir({name}): rollback of sector {new_sector} failed: {rollback_err}");
            }
            let _ = self.free_map.free_sector(&self.cache, new_sector);
            return Err(err);
        }
        Ok(new_sector)
    }

    /// Resolves `path` relative to `cwd_sector` (spec.md §4.6).
    pub fn resolve(&self, cwd_sector: u32, path: &str) -> Result<Resolved, FsError> {
        path::resolve(self, cwd_sector, path)
    }

    /// Advances `cursor` to the next live entry of the directory at
    /// `dir_sector`.
    pub fn readdir(&self, dir_sector: u32, cursor: &mut u64) -> Result<Option<DirEntry>, FsError> {
        directory::readdir(self, dir_sector, cursor)
    }

    /// Whether `sector` names a directory inode.
    pub fn isdir(&self, sector: u32) -> Result<bool, FsError> {
        Ok(inode::read_disk_inode(&self.cache, sector)?.is_dir)
    }

    /// The inode sector number, i.e. the file's unique `inumber`.
    pub fn inumber(&self, sector: u32) -> u32 {
        sector
    }

    /// Writes every dirty cache entry back to the device, for an orderly
    /// shutdown (spec.md §9 "tear down in reverse").
    pub fn flush(&self) -> Result<(), FsError> {
        Ok(self.cache.flush_all()?)
    }

    fn open(&self, sector: u32) -> InodeRef<S> {
        self.open_inodes.open(sector)
    }

    /// Drops one reference to `inode`; when it was the last open reference
    /// and the inode had been marked removed, frees its blocks and its own
    /// sector (spec.md §4.5 "removal").
    fn close(&self, inode: InodeRef<S>) -> Result<(), FsError> {
        let removed = inode.is_removed();
        let sector = inode.sector;
        if self.open_inodes.close(&inode) {
            drop(inode);
            if removed {
                let disk = inode::read_disk_inode(&self.cache, sector)?;
                inode::release_all_blocks(&self.cache, &self.free_map, &disk)?;
                self.free_map.free_sector(&self.cache, sector)?;
                self.cache.evict_sector(sector as u64)?;
            }
        }
        Ok(())
    }

    pub(crate) fn create_raw_inode(
        &self,
        parent_sector: u32,
        is_dir: bool,
        length: u32,
    ) -> Result<u32, FsError> {
        let sector = self.free_map.alloc_sector(&self.cache)?;
        let mut disk = DiskInode::new(is_dir, parent_sector, 0);
        inode::extend(&self.cache, &self.free_map, &mut disk, length)?;
        inode::write_disk_inode(&self.cache, sector, disk)?;
        Ok(sector)
    }

    pub(crate) fn inode_length(&self, sector: u32) -> Result<u64, FsError> {
        Ok(inode::read_disk_inode(&self.cache, sector)?.length as u64)
    }

    /// Reads up to `buf.len()` bytes starting at byte `offset` of the inode
    /// at `sector`, clipped at end-of-file. Returns the number of bytes
    /// actually read.
    pub(crate) fn read_at(&self, sector: u32, buf: &mut [u8], offset: u64) -> Result<usize, FsError> {
        let disk = inode::read_disk_inode(&self.cache, sector)?;
        let length = disk.length as u64;
        if offset >= length {
            return Ok(0);
        }
        let to_read = buf.len().min((length - offset) as usize);
        let mut done = 0;
        while done < to_read {
            let pos = offset + done as u64;
            let sector_offset = (pos % SECTOR_SIZE as u64) as usize;
            let chunk = (SECTOR_SIZE - sector_offset).min(to_read - done);
            let data_sector = inode::byte_to_sector(&self.cache, &disk, pos)?
                .ok_or(FsError::OutOfRange(pos))?;
            self.cache
                .read(data_sector as u64, &mut buf[done..done + chunk], chunk, sector_offset)?;
            done += chunk;
        }
        Ok(done)
    }

    /// Writes `buf` at byte `offset` of the inode at `sector`, extending it
    /// first if the write reaches past the current length.
    pub(crate) fn write_at(&self, sector: u32, buf: &[u8], offset: u64) -> Result<usize, FsError> {
        let handle = self.open(sector);
        let result = self.write_at_locked(&handle, sector, buf, offset);
        let _ = self.close(handle);
        result
    }

    fn write_at_locked(
        &self,
        handle: &InodeRef<S>,
        sector: u32,
        buf: &[u8],
        offset: u64,
    ) -> Result<usize, FsError> {
        let _extend_guard = handle
            .extend_lock
            .acquire()
            .unwrap_or_else(|_| unreachable!("write_at never recurses onto its own extend lock"));
        if handle.writes_denied() {
            return Ok(0);
        }
        let mut disk = inode::read_disk_inode(&self.cache, sector)?;
        let end = offset + buf.len() as u64;
        if end > disk.length as u64 {
            inode::extend(&self.cache, &self.free_map, &mut disk, end as u32)?;
            inode::write_disk_inode(&self.cache, sector, disk)?;
        }
        let mut done = 0;
        while done < buf.len() {
            let pos = offset + done as u64;
            let sector_offset = (pos % SECTOR_SIZE as u64) as usize;
            let chunk = (SECTOR_SIZE - sector_offset).min(buf.len() - done);
            let data_sector = inode::byte_to_sector(&self.cache, &disk, pos)?
                .ok_or(FsError::OutOfRange(pos))?;
            self.cache
                .write(data_sector as u64, &buf[done..done + chunk], chunk, sector_offset)?;
            done += chunk;
        }
        Ok(done)
    }
}

/// A handle to an open file: an [`InodeRef`] plus an independent byte
/// cursor for the sequential `read`/`write` syscalls (spec.md §6 `seek`,
/// `tell`). Owns an `Arc` to its file system so it can be held indefinitely
/// (e.g. parked in a process's fd table) independent of the caller that
/// opened it.
pub struct OpenFile<S: Scheduler, D: BlockDevice> {
    fs: Arc<FileSystem<S, D>>,
    inode: InodeRef<S>,
    position: Lock<S, u64>,
}

impl<S: Scheduler, D: BlockDevice> OpenFile<S, D> {
    /// Reads at the current position, advancing it by the number of bytes
    /// actually read.
    pub fn read(&self, buf: &mut [u8]) -> Result<usize, FsError> {
        let mut pos = self.position.acquire().unwrap();
        let n = self.fs.read_at(self.inode.sector, buf, *pos)?;
        *pos += n as u64;
        Ok(n)
    }

    /// Writes at the current position, advancing it by the number of bytes
    /// actually written.
    pub fn write(&self, buf: &[u8]) -> Result<usize, FsError> {
        let mut pos = self.position.acquire().unwrap();
        let n = self.fs.write_at(self.inode.sector, buf, *pos)?;
        *pos += n as u64;
        Ok(n)
    }

    /// Reads `buf.len()` bytes at an explicit offset, ignoring and not
    /// updating the cursor.
    pub fn read_at(&self, buf: &mut [u8], offset: u64) -> Result<usize, FsError> {
        self.fs.read_at(self.inode.sector, buf, offset)
    }

    /// Writes `buf` at an explicit offset, ignoring and not updating the
    /// cursor.
    pub fn write_at(&self, buf: &[u8], offset: u64) -> Result<usize, FsError> {
        self.fs.write_at(self.inode.sector, buf, offset)
    }

    pub fn seek(&self, position: u64) {
        *self.position.acquire().unwrap() = position;
    }

    pub fn tell(&self) -> u64 {
        *self.position.acquire().unwrap()
    }

    pub fn length(&self) -> Result<u64, FsError> {
        self.fs.inode_length(self.inode.sector)
    }

    pub fn inumber(&self) -> u32 {
        self.inode.sector
    }

    pub fn isdir(&self) -> Result<bool, FsError> {
        self.fs.isdir(self.inode.sector)
    }

    /// Forbids further writes to this inode while at least one `deny_write`
    /// is outstanding (spec.md: running executables deny writes to their
    /// own image).
    pub fn deny_write(&self) {
        self.inode.deny_write();
    }

    pub fn allow_write(&self) {
        self.inode.allow_write();
    }

    /// Closes this handle, running last-close teardown if no other open
    /// reference to the same inode remains.
    pub fn close(self) -> Result<(), FsError> {
        let OpenFile { fs, inode, .. } = self;
        fs.close(inode)
    }
}
