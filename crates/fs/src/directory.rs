//! Directory: an inode whose payload is a sequence of fixed-size entries
//! (spec.md §4.6).

use alloc::string::{String, ToString};
use alloc::vec::Vec;

use block_device::BlockDevice;
use sync::Scheduler;

use crate::FileSystem;
use crate::error::FsError;

/// Maximum length of a path component's name.
pub const MAX_FILE_NAME: usize = 14;

const ENTRY_SIZE: usize = 4 + MAX_FILE_NAME + 1;

#[derive(Clone, Copy)]
struct RawEntry {
    inode_sector: u32,
    name: [u8; MAX_FILE_NAME],
    in_use: bool,
}

impl RawEntry {
    fn empty() -> Self {
        Self {
            inode_sector: 0,
            name: [0u8; MAX_FILE_NAME],
            in_use: false,
        }
    }

    fn new(inode_sector: u32, name: &str) -> Result<Self, FsError> {
        if name.is_empty() || name.len() > MAX_FILE_NAME || name.contains('/') {
            return Err(FsError::InvalidName);
        }
        let mut packed = [0u8; MAX_FILE_NAME];
        packed[..name.len()].copy_from_slice(name.as_bytes());
        Ok(Self {
            inode_sector,
            name: packed,
            in_use: true,
        })
    }

    fn name_str(&self) -> String {
        let len = self.name.iter().position(|&b| b == 0).unwrap_or(self.name.len());
        String::from_utf8_lossy(&self.name[..len]).into_owned()
    }

    fn to_bytes(self) -> [u8; ENTRY_SIZE] {
        let mut out = [0u8; ENTRY_SIZE];
        out[0..4].copy_from_slice(&self.inode_sector.to_le_bytes());
        out[4..4 + MAX_FILE_NAME].copy_from_slice(&self.name);
        out[4 + MAX_FILE_NAME] = u8::from(self.in_use);
        out
    }

    fn from_bytes(bytes: &[u8; ENTRY_SIZE]) -> Self {
        let inode_sector = u32::from_le_bytes(bytes[0..4].try_into().unwrap());
        let mut name = [0u8; MAX_FILE_NAME];
        name.copy_from_slice(&bytes[4..4 + MAX_FILE_NAME]);
        let in_use = bytes[4 + MAX_FILE_NAME] != 0;
        Self {
            inode_sector,
            name,
            in_use,
        }
    }
}

/// One entry returned by [`readdir`].
#[derive(Debug, Clone)]
pub struct DirEntry {
    pub name: String,
    pub inode_sector: u32,
}

/// Creates a new directory inode under `parent_sector`, pre-sized to hold
/// `entry_cnt` entries (all initially free, since a freshly extended
/// sector is zero-filled and a zero `in_use` byte means "free").
pub(crate) fn create<S: Scheduler, D: BlockDevice>(
    fs: &FileSystem<S, D>,
    parent_sector: u32,
    entry_cnt: usize,
) -> Result<u32, FsError> {
    fs.create_raw_inode(parent_sector, true, (entry_cnt * ENTRY_SIZE) as u32)
}

/// Linear scan for an in-use entry named `name`.
pub(crate) fn lookup<S: Scheduler, D: BlockDevice>(
    fs: &FileSystem<S, D>,
    dir_sector: u32,
    name: &str,
) -> Result<Option<u32>, FsError> {
    let mut cursor = 0u64;
    while let Some((entry, _)) = read_entry_at(fs, dir_sector, cursor)? {
        if entry.in_use && entry.name_str() == name {
            return Ok(Some(entry.inode_sector));
        }
        cursor += ENTRY_SIZE as u64;
    }
    Ok(None)
}

/// Adds `name -> inode_sector`, failing on an invalid name or a duplicate.
/// Reuses the first free slot if one exists, else appends.
pub(crate) fn add<S: Scheduler, D: BlockDevice>(
    fs: &FileSystem<S, D>,
    dir_sector: u32,
    name: &str,
    inode_sector: u32,
) -> Result<(), FsError> {
    let entry = RawEntry::new(inode_sector, name)?;
    if lookup(fs, dir_sector, name)?.is_some() {
        return Err(FsError::AlreadyExists);
    }

    let mut cursor = 0u64;
    let offset = loop {
        match read_entry_at(fs, dir_sector, cursor)? {
            Some((existing, _)) if !existing.in_use => break cursor,
            Some(_) => cursor += ENTRY_SIZE as u64,
            None => break cursor,
        }
    };

    fs.write_at(dir_sector, &entry.to_bytes(), offset)?;
    Ok(())
}

/// Locates `name`, clears its entry, and removes the underlying inode
/// (spec.md: fails if the target is a non-empty directory).
pub(crate) fn remove<S: Scheduler, D: BlockDevice>(
    fs: &FileSystem<S, D>,
    dir_sector: u32,
    name: &str,
) -> Result<(), FsError> {
    let mut cursor = 0u64;
    let (target_sector, offset) = loop {
        match read_entry_at(fs, dir_sector, cursor)? {
            Some((entry, _)) if entry.in_use && entry.name_str() == name => {
                break (entry.inode_sector, cursor);
            }
            Some(_) => cursor += ENTRY_SIZE as u64,
            None => return Err(FsError::NotFound),
        }
    };

    let handle = fs.open(target_sector);
    let disk = crate::inode::read_disk_inode(&fs.cache, target_sector)?;
    if disk.is_dir {
        if handle.open_count() > 1 {
            fs.close(handle)?;
            return Err(FsError::DirectoryBusy);
        }
        if is_directory_non_empty(fs, target_sector)? {
            fs.close(handle)?;
            return Err(FsError::DirectoryNotEmpty);
        }
    }

    fs.write_at(dir_sector, &RawEntry::empty().to_bytes(), offset)?;
    handle.mark_removed();
    fs.close(handle)?;
    Ok(())
}

fn is_directory_non_empty<S: Scheduler, D: BlockDevice>(
    fs: &FileSystem<S, D>,
    dir_sector: u32,
) -> Result<bool, FsError> {
    let mut cursor = 0u64;
    while let Some((entry, _)) = read_entry_at(fs, dir_sector, cursor)? {
        if entry.in_use {
            return Ok(true);
        }
        cursor += ENTRY_SIZE as u64;
    }
    Ok(false)
}

/// Advances `cursor` to the next in-use entry, returning it if found.
pub(crate) fn readdir<S: Scheduler, D: BlockDevice>(
    fs: &FileSystem<S, D>,
    dir_sector: u32,
    cursor: &mut u64,
) -> Result<Option<DirEntry>, FsError> {
    loop {
        match read_entry_at(fs, dir_sector, *cursor)? {
            Some((entry, next)) => {
                *cursor = next;
                if entry.in_use {
                    return Ok(Some(DirEntry {
                        name: entry.name_str(),
                        inode_sector: entry.inode_sector,
                    }));
                }
            }
            None => return Ok(None),
        }
    }
}

/// Reads the entry at byte offset `offset`, if the directory's length
/// reaches that far. Returns the entry and the offset of the next one.
fn read_entry_at<S: Scheduler, D: BlockDevice>(
    fs: &FileSystem<S, D>,
    dir_sector: u32,
    offset: u64,
) -> Result<Option<(RawEntry, u64)>, FsError> {
    let length = fs.inode_length(dir_sector)?;
    if offset + ENTRY_SIZE as u64 > length {
        return Ok(None);
    }
    let mut buf = [0u8; ENTRY_SIZE];
    let read = fs.read_at(dir_sector, &mut buf, offset)?;
    debug_assert_eq!(read, ENTRY_SIZE);
    Ok(Some((RawEntry::from_bytes(&buf), offset + ENTRY_SIZE as u64)))
}

#[cfg(test)]
mod tests {
    use block_device::MemBlockDevice;
    use sync::StdScheduler;

    use super::*;
    use crate::free_map::ROOT_DIR_SECTOR;

    fn fresh_fs(sectors: usize) -> FileSystem<StdScheduler, MemBlockDevice> {
        FileSystem::format(MemBlockDevice::new(sectors))
    }

    #[test]
    fn add_then_lookup_roundtrips() {
        let fs = fresh_fs(256);
        let dir = create(&fs, ROOT_DIR_SECTOR, 4).unwrap();
        let file = fs.create_raw_inode(dir, false, 0).unwrap();
        add(&fs, dir, "hello.txt", file).unwrap();
        assert_eq!(lookup(&fs, dir, "hello.txt").unwrap(), Some(file));
        assert_eq!(lookup(&fs, dir, "missing").unwrap(), None);
    }

    #[test]
    fn add_rejects_duplicate_names() {
        let fs = fresh_fs(256);
        let dir = create(&fs, ROOT_DIR_SECTOR, 4).unwrap();
        let a = fs.create_raw_inode(dir, false, 0).unwrap();
        let b = fs.create_raw_inode(dir, false, 0).unwrap();
        add(&fs, dir, "a", a).unwrap();
        assert_eq!(add(&fs, dir, "a", b).unwrap_err(), FsError::AlreadyExists);
    }

    #[test]
    fn add_rejects_invalid_names() {
        let fs = fresh_fs(256);
        let dir = create(&fs, ROOT_DIR_SECTOR, 4).unwrap();
        assert_eq!(add(&fs, dir, "", 10).unwrap_err(), FsError::InvalidName);
        assert_eq!(
            add(&fs, dir, "way-too-long-a-name", 10).unwrap_err(),
            FsError::InvalidName
        );
        assert_eq!(add(&fs, dir, "a/b", 10).unwrap_err(), FsError::InvalidName);
    }

    #[test]
    fn remove_frees_slot_for_reuse() {
        let fs = fresh_fs(256);
        let dir = create(&fs, ROOT_DIR_SECTOR, 4).unwrap();
        let a = fs.create_raw_inode(dir, false, 0).unwrap();
        add(&fs, dir, "a", a).unwrap();
        remove(&fs, dir, "a").unwrap();
        assert_eq!(lookup(&fs, dir, "a").unwrap(), None);

        let b = fs.create_raw_inode(dir, false, 0).unwrap();
        add(&fs, dir, "b", b).unwrap();
        assert_eq!(lookup(&fs, dir, "b").unwrap(), Some(b));
    }

    #[test]
    fn remove_non_empty_directory_fails() {
        let fs = fresh_fs(256);
        let dir = create(&fs, ROOT_DIR_SECTOR, 4).unwrap();
        let child = create(&fs, dir, 4).unwrap();
        add(&fs, dir, "child", child).unwrap();
        let grandchild = fs.create_raw_inode(child, false, 0).unwrap();
        add(&fs, child, "leaf", grandchild).unwrap();

        assert_eq!(
            remove(&fs, dir, "child").unwrap_err(),
            FsError::DirectoryNotEmpty
        );
    }

    #[test]
    fn remove_directory_open_elsewhere_fails_busy() {
        let fs = fresh_fs(256);
        let dir = create(&fs, ROOT_DIR_SECTOR, 4).unwrap();
        let child = create(&fs, dir, 4).unwrap();
        add(&fs, dir, "child", child).unwrap();

        let _still_open = fs.open(child);
        assert_eq!(remove(&fs, dir, "child").unwrap_err(), FsError::DirectoryBusy);
    }

    #[test]
    fn readdir_skips_free_entries() {
        let fs = fresh_fs(256);
        let dir = create(&fs, ROOT_DIR_SECTOR, 4).unwrap();
        let a = fs.create_raw_inode(dir, false, 0).unwrap();
        let b = fs.create_raw_inode(dir, false, 0).unwrap();
        add(&fs, dir, "a", a).unwrap();
        add(&fs, dir, "b", b).unwrap();
        remove(&fs, dir, "a").unwrap();

        let mut cursor = 0u64;
        let mut names = Vec::new();
        while let Some(entry) = readdir(&fs, dir, &mut cursor).unwrap() {
            names.push(entry.name);
        }
        assert_eq!(names, alloc::vec!["b".to_string()]);
    }
}
