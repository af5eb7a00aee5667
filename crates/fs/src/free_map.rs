//! Free-sector map: a persistent bitmap allocator for file-system sectors
//! (spec.md §3).

use alloc::vec;
use alloc::vec::Vec;

use bitmap::Bitmap;
use block_cache::BlockCache;
use block_device::{BlockDevice, SECTOR_SIZE};
use sync::{Lock, Scheduler};

use crate::error::FsError;

/// Sector 0: boot block, opaque to this layer.
pub const BOOT_SECTOR: u32 = 0;
/// Sector 1: start of the free-sector bitmap.
pub const FREE_MAP_SECTOR: u32 = 1;
/// Sector 2: the root directory's inode, always allocated.
pub const ROOT_DIR_SECTOR: u32 = 2;

/// The in-memory free-sector map, persisted to sectors starting at
/// [`FREE_MAP_SECTOR`].
pub struct FreeMap<S: Scheduler> {
    bitmap: Lock<S, Bitmap>,
    map_sectors: usize,
}

impl<S: Scheduler> FreeMap<S> {
    fn map_sectors_for(sector_count: usize) -> usize {
        sector_count.div_ceil(8).div_ceil(SECTOR_SIZE).max(1)
    }

    /// Formats a fresh free-sector map for a device with `sector_count`
    /// sectors: the boot sector, the map's own sectors, and the root
    /// directory's sector are marked in use; everything else is free.
    pub fn format(sector_count: usize) -> Self {
        let map_sectors = Self::map_sectors_for(sector_count);
        let mut bitmap = Bitmap::new(sector_count);
        bitmap.set(BOOT_SECTOR as usize);
        for i in 0..map_sectors {
            bitmap.set(FREE_MAP_SECTOR as usize + i);
        }
        bitmap.set(ROOT_DIR_SECTOR as usize);
        Self {
            bitmap: Lock::new(bitmap),
            map_sectors,
        }
    }

    /// Loads a previously formatted free-sector map from disk.
    pub fn load<D: BlockDevice>(
        cache: &BlockCache<S, D>,
        sector_count: usize,
    ) -> Result<Self, FsError> {
        let map_sectors = Self::map_sectors_for(sector_count);
        let mut bytes = vec![0u8; map_sectors * SECTOR_SIZE];
        for i in 0..map_sectors {
            let mut buf = [0u8; SECTOR_SIZE];
            cache.read((FREE_MAP_SECTOR as u64) + i as u64, &mut buf, SECTOR_SIZE, 0)?;
            bytes[i * SECTOR_SIZE..(i + 1) * SECTOR_SIZE].copy_from_slice(&buf);
        }
        Ok(Self {
            bitmap: Lock::new(Bitmap::from_bytes(sector_count, &bytes)),
            map_sectors,
        })
    }

    /// Writes the bitmap's current state to its reserved sectors.
    pub fn persist<D: BlockDevice>(&self, cache: &BlockCache<S, D>) -> Result<(), FsError> {
        let bytes = self.bitmap.acquire().unwrap().to_bytes();
        for i in 0..self.map_sectors {
            let mut buf = [0u8; SECTOR_SIZE];
            let start = i * SECTOR_SIZE;
            let end = (start + SECTOR_SIZE).min(bytes.len());
            buf[..end - start].copy_from_slice(&bytes[start..end]);
            cache.write((FREE_MAP_SECTOR as u64) + i as u64, &buf, SECTOR_SIZE, 0)?;
        }
        Ok(())
    }

    /// Allocates and returns the lowest-indexed free sector.
    pub fn alloc_sector<D: BlockDevice>(&self, cache: &BlockCache<S, D>) -> Result<u32, FsError> {
        let index = {
            let mut bitmap = self.bitmap.acquire().unwrap();
            bitmap.first_fit_set().ok_or(FsError::NoSpace)?
        };
        self.persist(cache)?;
        Ok(index as u32)
    }

    /// Frees `sector`, making it available for future allocation.
    pub fn free_sector<D: BlockDevice>(
        &self,
        cache: &BlockCache<S, D>,
        sector: u32,
    ) -> Result<(), FsError> {
        self.bitmap.acquire().unwrap().clear(sector as usize);
        self.persist(cache)
    }

    /// Number of currently free sectors.
    pub fn free_count(&self) -> usize {
        let bitmap = self.bitmap.acquire().unwrap();
        bitmap.len() - bitmap.count_set()
    }
}
