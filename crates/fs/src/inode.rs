//! In-memory inode bookkeeping and the block-index walk (spec.md §4.5).

use alloc::sync::Arc;

use block_cache::BlockCache;
use block_device::{BlockDevice, SECTOR_SIZE};
use sync::{Lock, Scheduler};

use crate::disk_inode::{
    self, DOUBLE_INDIRECT_BASE, DiskInode, INDIRECT_BASE, INDIRECT_PER_BLOCK, NO_SECTOR,
};
use crate::error::FsError;
use crate::free_map::FreeMap;

/// Per-open-handle bookkeeping shared by every caller that opened the same
/// inode sector (spec.md §4.5 "open-inode deduplication").
pub struct OpenInode<S: Scheduler> {
    pub sector: u32,
    open_count: Lock<S, usize>,
    removed: Lock<S, bool>,
    /// Serializes file-extension operations (spec.md §3 "in-memory
    /// inode").
    pub extend_lock: Lock<S, ()>,
    deny_write_count: Lock<S, i32>,
}

impl<S: Scheduler> OpenInode<S> {
    fn new(sector: u32) -> Arc<Self> {
        Arc::new(Self {
            sector,
            open_count: Lock::new(1),
            removed: Lock::new(false),
            extend_lock: Lock::new(()),
            deny_write_count: Lock::new(0),
        })
    }

    pub fn open_count(&self) -> usize {
        *self.open_count.acquire().unwrap()
    }

    pub fn is_removed(&self) -> bool {
        *self.removed.acquire().unwrap()
    }

    pub fn mark_removed(&self) {
        *self.removed.acquire().unwrap() = true;
    }

    fn bump(&self) {
        *self.open_count.acquire().unwrap() += 1;
    }

    /// Decrements the open count and returns the count after decrementing.
    fn unbump(&self) -> usize {
        let mut count = self.open_count.acquire().unwrap();
        *count -= 1;
        *count
    }

    pub fn deny_write(&self) {
        *self.deny_write_count.acquire().unwrap() += 1;
    }

    pub fn allow_write(&self) {
        *self.deny_write_count.acquire().unwrap() -= 1;
    }

    pub fn writes_denied(&self) -> bool {
        *self.deny_write_count.acquire().unwrap() > 0
    }
}

/// Handle returned by [`crate::FileSystem::open`]; dropping it does not
/// close the inode; callers must call `close` explicitly so the last-close
/// cleanup (spec.md §4.5 "removal") runs deterministically.
pub type InodeRef<S> = Arc<OpenInode<S>>;

/// A kernel-global table of open inodes, deduplicating repeat `open` calls
/// on the same sector onto one shared [`OpenInode`].
pub(crate) struct OpenInodeTable<S: Scheduler> {
    table: Lock<S, alloc::collections::BTreeMap<u32, InodeRef<S>>>,
}

impl<S: Scheduler> OpenInodeTable<S> {
    pub(crate) fn new() -> Self {
        Self {
            table: Lock::new(alloc::collections::BTreeMap::new()),
        }
    }

    pub(crate) fn open(&self, sector: u32) -> InodeRef<S> {
        let mut table = self.table.acquire().unwrap();
        if let Some(existing) = table.get(&sector) {
            existing.bump();
            return Arc::clone(existing);
        }
        let fresh = OpenInode::new(sector);
        table.insert(sector, Arc::clone(&fresh));
        fresh
    }

    /// Decrements `inode`'s open count; if it reaches zero, removes it from
    /// the table and returns `true` (the caller is the last closer and
    /// must run teardown).
    pub(crate) fn close(&self, inode: &InodeRef<S>) -> bool {
        let mut table = self.table.acquire().unwrap();
        let remaining = inode.unbump();
        if remaining == 0 {
            table.remove(&inode.sector);
            true
        } else {
            false
        }
    }
}

/// Reads and validates the on-disk inode at `sector`.
pub(crate) fn read_disk_inode<S: Scheduler, D: BlockDevice>(
    cache: &BlockCache<S, D>,
    sector: u32,
) -> Result<DiskInode, FsError> {
    let mut buf = [0u8; SECTOR_SIZE];
    cache.read(sector as u64, &mut buf, SECTOR_SIZE, 0)?;
    DiskInode::from_bytes(&buf).ok_or(FsError::Corrupt(sector))
}

pub(crate) fn write_disk_inode<S: Scheduler, D: BlockDevice>(
    cache: &BlockCache<S, D>,
    sector: u32,
    inode: DiskInode,
) -> Result<(), FsError> {
    let bytes = inode.to_bytes();
    cache.write(sector as u64, &bytes, SECTOR_SIZE, 0)?;
    Ok(())
}

fn read_index_block<S: Scheduler, D: BlockDevice>(
    cache: &BlockCache<S, D>,
    sector: u32,
) -> Result<[u32; INDIRECT_PER_BLOCK], FsError> {
    let mut buf = [0u8; SECTOR_SIZE];
    cache.read(sector as u64, &mut buf, SECTOR_SIZE, 0)?;
    Ok(disk_inode::index_block_from_bytes(&buf))
}

fn write_index_block<S: Scheduler, D: BlockDevice>(
    cache: &BlockCache<S, D>,
    sector: u32,
    entries: &[u32; INDIRECT_PER_BLOCK],
) -> Result<(), FsError> {
    let bytes = disk_inode::index_block_to_bytes(entries);
    cache.write(sector as u64, &bytes, SECTOR_SIZE, 0)?;
    Ok(())
}

/// Maps byte position `pos` to its data sector, or `None` if `pos` is past
/// the inode's current length (spec.md's `NO_SECTOR`).
pub(crate) fn byte_to_sector<S: Scheduler, D: BlockDevice>(
    cache: &BlockCache<S, D>,
    inode: &DiskInode,
    pos: u64,
) -> Result<Option<u32>, FsError> {
    if pos >= inode.length as u64 {
        return Ok(None);
    }
    let block_index = (pos / SECTOR_SIZE as u64) as usize;
    if block_index < INDIRECT_BASE {
        return Ok(Some(inode.direct[block_index]));
    }
    if block_index < DOUBLE_INDIRECT_BASE {
        let table = read_index_block(cache, inode.indirect)?;
        return Ok(Some(table[block_index - INDIRECT_BASE]));
    }
    let idx = block_index - DOUBLE_INDIRECT_BASE;
    let outer_idx = idx / INDIRECT_PER_BLOCK;
    let inner_idx = idx % INDIRECT_PER_BLOCK;
    let outer = read_index_block(cache, inode.double_indirect)?;
    let inner_sector = outer[outer_idx];
    let inner = read_index_block(cache, inner_sector)?;
    Ok(Some(inner[inner_idx]))
}

/// Grows `inode` from its current length to `new_length`, allocating and
/// zeroing every newly needed data sector plus any index blocks crossed
/// along the way (spec.md §4.5).
pub(crate) fn extend<S: Scheduler, D: BlockDevice>(
    cache: &BlockCache<S, D>,
    free_map: &FreeMap<S>,
    inode: &mut DiskInode,
    new_length: u32,
) -> Result<(), FsError> {
    let old_blocks = inode.block_count();
    inode.length = new_length;
    let new_blocks = inode.block_count();
    let zero_sector = [0u8; SECTOR_SIZE];

    for block_index in old_blocks..new_blocks {
        let data_sector = free_map.alloc_sector(cache)?;
        cache.write(data_sector as u64, &zero_sector, SECTOR_SIZE, 0)?;

        if block_index < INDIRECT_BASE {
            inode.direct[block_index] = data_sector;
            continue;
        }

        if block_index < DOUBLE_INDIRECT_BASE {
            if inode.indirect == NO_SECTOR {
                inode.indirect = free_map.alloc_sector(cache)?;
                write_index_block(cache, inode.indirect, &[NO_SECTOR; INDIRECT_PER_BLOCK])?;
            }
            let mut table = read_index_block(cache, inode.indirect)?;
            table[block_index - INDIRECT_BASE] = data_sector;
            write_index_block(cache, inode.indirect, &table)?;
            continue;
        }

        if inode.double_indirect == NO_SECTOR {
            inode.double_indirect = free_map.alloc_sector(cache)?;
            write_index_block(
                cache,
                inode.double_indirect,
                &[NO_SECTOR; INDIRECT_PER_BLOCK],
            )?;
        }
        let idx = block_index - DOUBLE_INDIRECT_BASE;
        let outer_idx = idx / INDIRECT_PER_BLOCK;
        let inner_idx = idx % INDIRECT_PER_BLOCK;

        let mut outer = read_index_block(cache, inode.double_indirect)?;
        if outer[outer_idx] == NO_SECTOR {
            outer[outer_idx] = free_map.alloc_sector(cache)?;
            write_index_block(cache, outer[outer_idx], &[NO_SECTOR; INDIRECT_PER_BLOCK])?;
            write_index_block(cache, inode.double_indirect, &outer)?;
        }
        let mut inner = read_index_block(cache, outer[outer_idx])?;
        inner[inner_idx] = data_sector;
        write_index_block(cache, outer[outer_idx], &inner)?;
    }
    Ok(())
}

/// Releases every sector reachable from `inode`'s block map, plus the
/// index blocks themselves, back to `free_map`, evicting each from the
/// cache so no stale state lingers (spec.md §4.5 "removal").
pub(crate) fn release_all_blocks<S: Scheduler, D: BlockDevice>(
    cache: &BlockCache<S, D>,
    free_map: &FreeMap<S>,
    inode: &DiskInode,
) -> Result<(), FsError> {
    let blocks = inode.block_count();

    for block_index in 0..blocks.min(INDIRECT_BASE) {
        let sector = inode.direct[block_index];
        free_map.free_sector(cache, sector)?;
        cache.evict_sector(sector as u64)?;
    }

    if blocks > INDIRECT_BASE && inode.indirect != NO_SECTOR {
        let table = read_index_block(cache, inode.indirect)?;
        let upper = blocks.min(DOUBLE_INDIRECT_BASE) - INDIRECT_BASE;
        for &sector in &table[..upper] {
            free_map.free_sector(cache, sector)?;
            cache.evict_sector(sector as u64)?;
        }
        free_map.free_sector(cache, inode.indirect)?;
        cache.evict_sector(inode.indirect as u64)?;
    }

    if blocks > DOUBLE_INDIRECT_BASE && inode.double_indirect != NO_SECTOR {
        let remaining = blocks - DOUBLE_INDIRECT_BASE;
        let outer_count = remaining.div_ceil(INDIRECT_PER_BLOCK);
        let outer = read_index_block(cache, inode.double_indirect)?;
        for (outer_idx, &inner_sector) in outer.iter().enumerate().take(outer_count) {
            if inner_sector == NO_SECTOR {
                continue;
            }
            let inner = read_index_block(cache, inner_sector)?;
            let inner_len = if outer_idx + 1 == outer_count {
                remaining - outer_idx * INDIRECT_PER_BLOCK
            } else {
                INDIRECT_PER_BLOCK
            };
            for &sector in &inner[..inner_len] {
                free_map.free_sector(cache, sector)?;
                cache.evict_sector(sector as u64)?;
            }
            free_map.free_sector(cache, inner_sector)?;
            cache.evict_sector(inner_sector as u64)?;
        }
        free_map.free_sector(cache, inode.double_indirect)?;
        cache.evict_sector(inode.double_indirect as u64)?;
    }

    Ok(())
}
