//! Fixed-size sector cache with clock replacement (spec.md §4.4).
//!
//! A bounded associative cache of [`SECTOR_SIZE`]-byte sectors. Lookup is
//! linear over a fixed array of entries, each independently protected by a
//! payload [`RwLock`](sync::RwLock) plus a separate eviction [`Lock`]
//! (spec.md §5's lock ordering: eviction lock before payload lock). Grounded
//! on `crates/block_io` in the teacher — the `Arc`-per-slot shape and the
//! drop-returns-to-pool idiom carry over — but the teacher's LRU recycle
//! list is replaced with clock replacement (an `accessed` bit swept in
//! array order) and `arrayvec`'s fixed-capacity storage stands in for the
//! teacher's `LinkedList`, since clock needs index-stable slots rather than
//! a move-to-front list.
#![cfg_attr(not(test), no_std)]

extern crate alloc;

use core::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use arrayvec::ArrayVec;
use block_device::{BlockDevice, BlockError, SECTOR_SIZE};
use sync::{Lock, RwLock, Scheduler};

/// Number of entries in the cache (spec.md §4.4).
pub const CACHE_SIZE: usize = 64;

/// Sentinel meaning "not caching any sector".
const NO_SECTOR: u64 = u64::MAX;

struct Payload {
    sector: u64,
    in_use: bool,
    dirty: bool,
    data: [u8; SECTOR_SIZE],
}

impl Payload {
    const fn empty() -> Self {
        Self {
            sector: NO_SECTOR,
            in_use: false,
            dirty: false,
            data: [0u8; SECTOR_SIZE],
        }
    }
}

struct Entry<S: Scheduler> {
    /// Fast, lock-free pre-check; the matching payload lock still must be
    /// taken and the match re-verified before acting on it (spec.md §4.4's
    /// re-verify rule).
    accessed: AtomicBool,
    eviction: Lock<S, ()>,
    payload: RwLock<S, Payload>,
}

impl<S: Scheduler> Entry<S> {
    fn new() -> Self {
        Self {
            accessed: AtomicBool::new(false),
            eviction: Lock::new(()),
            payload: RwLock::new(Payload::empty()),
        }
    }
}

/// A bounded, fixed-capacity cache of device sectors.
pub struct BlockCache<S: Scheduler, D: BlockDevice> {
    device: D,
    entries: ArrayVec<Entry<S>, CACHE_SIZE>,
    /// Clock hand, shared by eviction and read-ahead.
    hand: AtomicUsize,
    read_ahead: Lock<S, alloc::collections::VecDeque<u64>>,
}

impl<S: Scheduler, D: BlockDevice> BlockCache<S, D> {
    /// Creates an empty cache over `device`.
    pub fn new(device: D) -> Self {
        let mut entries = ArrayVec::new();
        for _ in 0..CACHE_SIZE {
            entries.push(Entry::new());
        }
        Self {
            device,
            entries,
            hand: AtomicUsize::new(0),
            read_ahead: Lock::new(alloc::collections::VecDeque::new()),
        }
    }

    /// Copies `size` bytes starting at `offset` within sector `sector` into
    /// `buf`.
    pub fn read(
        &self,
        sector: u64,
        buf: &mut [u8],
        size: usize,
        offset: usize,
    ) -> Result<(), BlockError> {
        assert!(offset + size <= SECTOR_SIZE, "read spans past sector end");
        loop {
            let index = self.find(sector, true)?;
            let entry = &self.entries[index];
            let guard = entry.payload.read();
            if !(guard.in_use && guard.sector == sector) {
                continue;
            }
            buf[..size].copy_from_slice(&guard.data[offset..offset + size]);
            entry.accessed.store(true, Ordering::Relaxed);
            return Ok(());
        }
    }

    /// Copies `size` bytes from `buf` into sector `sector` at `offset`,
    /// marking the entry dirty.
    pub fn write(
        &self,
        sector: u64,
        buf: &[u8],
        size: usize,
        offset: usize,
    ) -> Result<(), BlockError> {
        assert!(offset + size <= SECTOR_SIZE, "write spans past sector end");
        loop {
            let index = self.find(sector, true)?;
            let entry = &self.entries[index];
            let mut guard = entry.payload.write();
            if !(guard.in_use && guard.sector == sector) {
                continue;
            }
            guard.data[offset..offset + size].copy_from_slice(&buf[..size]);
            guard.dirty = true;
            entry.accessed.store(true, Ordering::Relaxed);
            return Ok(());
        }
    }

    /// Locates the entry caching `sector`. If `active` and the sector is
    /// not resident, loads it from disk into an unused entry (evicting via
    /// clock if none is unused), retrying until the load succeeds.
    ///
    /// Returns the entry's index.
    fn find(&self, sector: u64, active: bool) -> Result<usize, BlockError> {
        loop {
            if let Some(index) = self.lookup(sector) {
                return Ok(index);
            }
            if !active {
                return Err(BlockError::OutOfRange(sector as usize));
            }
            let index = match self.find_unused() {
                Some(index) => index,
                None => self.evict_one()?,
            };
            if self.load_from_disk(index, sector)? {
                return Ok(index);
            }
            // Someone else claimed the slot (or resurrected it) between our
            // check and the load attempt; retry the whole search.
        }
    }

    fn lookup(&self, sector: u64) -> Option<usize> {
        self.entries.iter().position(|entry| {
            let guard = entry.payload.read();
            guard.in_use && guard.sector == sector
        })
    }

    fn find_unused(&self) -> Option<usize> {
        self.entries
            .iter()
            .position(|entry| !entry.payload.read().in_use)
    }

    /// Loads `sector` into entry `index` from the backing device.
    ///
    /// Takes the entry's eviction lock, asserts the slot is still idle
    /// (returning `Ok(false)` if not, forcing the caller to retry), reads
    /// the sector, and marks the entry in-use.
    fn load_from_disk(&self, index: usize, sector: u64) -> Result<bool, BlockError> {
        let entry = &self.entries[index];
        let _evict_guard = entry.eviction.acquire().unwrap_or_else(|_| {
            unreachable!("load_from_disk never recurses onto its own eviction lock")
        });
        let mut guard = entry.payload.write();
        if guard.in_use {
            return Ok(false);
        }
        let mut data = [0u8; SECTOR_SIZE];
        self.device.read(sector as usize, &mut data)?;
        guard.sector = sector;
        guard.in_use = true;
        guard.dirty = false;
        guard.data = data;
        drop(guard);
        entry.accessed.store(true, Ordering::Relaxed);
        Ok(true)
    }

    /// Runs clock replacement until it claims a victim, then evicts it.
    /// Returns the index of the now-unused entry.
    fn evict_one(&self) -> Result<usize, BlockError> {
        loop {
            let start = self.hand.load(Ordering::Relaxed);
            let mut victim = None;
            for offset in 0..self.entries.len() {
                let index = (start + offset) % self.entries.len();
                let entry = &self.entries[index];
                if !entry.payload.read().in_use {
                    // Someone freed a slot while we were scanning.
                    self.hand
                        .store((index + 1) % self.entries.len(), Ordering::Relaxed);
                    return Ok(index);
                }
                if entry.accessed.swap(false, Ordering::Relaxed) {
                    continue;
                }
                victim = Some(index);
                self.hand
                    .store((index + 1) % self.entries.len(), Ordering::Relaxed);
                break;
            }
            let Some(index) = victim else {
                // Every entry had its accessed bit set; the sweep above
                // cleared all of them, so the next pass is guaranteed to
                // find a victim.
                continue;
            };
            if self.evict(index)? {
                return Ok(index);
            }
            // The victim was re-pinned or re-verified busy; sweep again.
        }
    }

    /// Evicts the entry at `index`: takes its eviction lock then writer
    /// lock, writes back if dirty, and clears its fields.
    ///
    /// Returns `false` (without evicting) if the entry is no longer
    /// eligible by the time both locks are held.
    fn evict(&self, index: usize) -> Result<bool, BlockError> {
        let entry = &self.entries[index];
        let _evict_guard = entry
            .eviction
            .acquire()
            .unwrap_or_else(|_| unreachable!("evict never recurses onto its own eviction lock"));
        let mut guard = entry.payload.write();
        if !guard.in_use {
            return Ok(false);
        }
        if guard.dirty {
            self.device.write(guard.sector as usize, &guard.data)?;
        }
        *guard = Payload::empty();
        Ok(true)
    }

    /// Evicts whichever entry currently caches `sector`, if any, retrying
    /// under the lookup/lock re-verify pattern used by `read`/`write`.
    pub fn evict_sector(&self, sector: u64) -> Result<(), BlockError> {
        loop {
            let Some(index) = self.lookup(sector) else {
                return Ok(());
            };
            let entry = &self.entries[index];
            let _evict_guard = entry.eviction.acquire().unwrap_or_else(|_| {
                unreachable!("evict_sector never recurses onto its own eviction lock")
            });
            let mut guard = entry.payload.write();
            if !(guard.in_use && guard.sector == sector) {
                continue;
            }
            if guard.dirty {
                self.device.write(guard.sector as usize, &guard.data)?;
            }
            *guard = Payload::empty();
            return Ok(());
        }
    }

    /// Writes back every in-use entry regardless of its dirty bit.
    ///
    /// Usable directly by callers that need a synchronous flush (e.g.
    /// before taking a consistent snapshot in tests). Stops at the first
    /// device error; the write-back worker uses [`Self::flush_all_lenient`]
    /// instead, which keeps going.
    pub fn flush_all(&self) -> Result<(), BlockError> {
        for entry in &self.entries {
            let _evict_guard = entry.eviction.acquire().unwrap_or_else(|_| {
                unreachable!("flush_all never recurses onto its own eviction lock")
            });
            let guard = entry.payload.write();
            if guard.in_use {
                self.device.write(guard.sector as usize, &guard.data)?;
            }
        }
        Ok(())
    }

    /// Writes back every in-use entry, logging and skipping past any
    /// device error instead of stopping (spec.md §7: the write-back
    /// worker "swallows and logs any device error but continues").
    pub fn flush_all_lenient(&self) {
        for entry in &self.entries {
            let _evict_guard = entry.eviction.acquire().unwrap_or_else(|_| {
                unreachable!("flush_all_lenient never recurses onto its own eviction lock")
            });
            let guard = entry.payload.write();
            if guard.in_use {
                if let Err(err) = self.device.write(guard.sector as usize, &guard.data) {
                    log::error!("write-back worker: sector {}: {err}", guard.sector);
                }
            }
        }
    }

    /// Enqueues `sector` for the read-ahead worker to populate.
    ///
    /// Producers call this when a read is satisfied on a multi-sector
    /// file, enqueuing the next sequential sector.
    pub fn enqueue_read_ahead(&self, sector: u64) {
        self.read_ahead.acquire().unwrap().push_back(sector);
    }

    /// Pops one queued sector, if any, and populates the cache for it.
    ///
    /// Returns `true` if a sector was processed, `false` if the queue was
    /// empty (the caller should yield in that case).
    pub fn run_read_ahead_once(&self) -> Result<bool, BlockError> {
        let next = self.read_ahead.acquire().unwrap().pop_front();
        match next {
            Some(sector) => {
                self.find(sector, true)?;
                Ok(true)
            }
            None => Ok(false),
        }
    }
}

/// Runs the write-back worker's body once: writes back every in-use entry.
///
/// A real kernel calls this from a dedicated task loop on a fixed ~10-tick
/// period (spec.md §4.4); the period itself is a scheduling concern out of
/// scope for this crate, so callers own the loop and the delay between
/// calls. Per spec.md §7, a device error here is logged and does not stop
/// the sweep; `flush_all` is what callers reach for when they need a
/// write-back failure to actually propagate.
pub fn write_back_tick<S: Scheduler, D: BlockDevice>(cache: &BlockCache<S, D>) {
    cache.flush_all_lenient();
}

#[cfg(test)]
mod tests {
    use block_device::MemBlockDevice;
    use sync::StdScheduler;

    use super::*;

    fn cache(sectors: usize) -> BlockCache<StdScheduler, MemBlockDevice> {
        BlockCache::new(MemBlockDevice::new(sectors))
    }

    #[test]
    fn write_then_read_roundtrips_through_cache() {
        let c = cache(4);
        let mut buf = [0u8; SECTOR_SIZE];
        buf[..5].copy_from_slice(b"hello");
        c.write(1, &buf, SECTOR_SIZE, 0).unwrap();

        let mut out = [0u8; SECTOR_SIZE];
        c.read(1, &mut out, SECTOR_SIZE, 0).unwrap();
        assert_eq!(&out[..5], b"hello");
    }

    #[test]
    fn partial_offset_read_write_only_touches_requested_bytes() {
        let c = cache(2);
        let full = [0xaau8; SECTOR_SIZE];
        c.write(0, &full, SECTOR_SIZE, 0).unwrap();

        let patch = [0x55u8; 4];
        c.write(0, &patch, 4, 10).unwrap();

        let mut out = [0u8; SECTOR_SIZE];
        c.read(0, &mut out, SECTOR_SIZE, 0).unwrap();
        assert_eq!(&out[10..14], &[0x55; 4]);
        assert_eq!(out[9], 0xaa);
        assert_eq!(out[14], 0xaa);
    }

    #[test]
    fn eviction_writes_back_dirty_entries() {
        let c = cache(CACHE_SIZE + 1);
        for sector in 0..CACHE_SIZE as u64 {
            let mut buf = [0u8; SECTOR_SIZE];
            buf[0] = sector as u8;
            c.write(sector, &buf, SECTOR_SIZE, 0).unwrap();
        }
        // One more distinct sector forces an eviction.
        let mut buf = [0u8; SECTOR_SIZE];
        buf[0] = 0xff;
        c.write(CACHE_SIZE as u64, &buf, SECTOR_SIZE, 0).unwrap();

        // Whichever sector got evicted, its write must have reached the
        // device, so re-reading every sector through the cache reproduces
        // what was written.
        for sector in 0..CACHE_SIZE as u64 {
            let mut out = [0u8; SECTOR_SIZE];
            c.read(sector, &mut out, SECTOR_SIZE, 0).unwrap();
            assert_eq!(out[0], sector as u8);
        }
    }

    #[test]
    fn evict_sector_forces_a_future_reload_from_disk() {
        let c = cache(2);
        let mut buf = [0u8; SECTOR_SIZE];
        buf[0] = 7;
        c.write(0, &buf, SECTOR_SIZE, 0).unwrap();
        c.evict_sector(0).unwrap();

        let mut out = [0u8; SECTOR_SIZE];
        c.read(0, &mut out, SECTOR_SIZE, 0).unwrap();
        assert_eq!(
            out[0], 7,
            "dirty data must have been written back on eviction"
        );
    }

    #[test]
    fn flush_all_writes_back_without_evicting() {
        let c = cache(1);
        let mut buf = [0u8; SECTOR_SIZE];
        buf[0] = 9;
        c.write(0, &buf, SECTOR_SIZE, 0).unwrap();
        c.flush_all().unwrap();

        // Still cached (not evicted) and still readable.
        let mut out = [0u8; SECTOR_SIZE];
        c.read(0, &mut out, SECTOR_SIZE, 0).unwrap();
        assert_eq!(out[0], 9);
    }

    #[test]
    fn read_ahead_queue_populates_cache() {
        let c = cache(4);
        let mut buf = [0u8; SECTOR_SIZE];
        buf[0] = 3;
        c.write(2, &buf, SECTOR_SIZE, 0).unwrap();
        c.evict_sector(2).unwrap();

        c.enqueue_read_ahead(2);
        assert!(c.run_read_ahead_once().unwrap());
        assert!(!c.run_read_ahead_once().unwrap());

        assert!(c.lookup(2).is_some());
    }

    #[test]
    fn write_back_tick_is_idempotent() {
        let c = cache(1);
        let buf = [1u8; SECTOR_SIZE];
        c.write(0, &buf, SECTOR_SIZE, 0).unwrap();
        write_back_tick(&c);
        write_back_tick(&c);
        let mut out = [0u8; SECTOR_SIZE];
        c.read(0, &mut out, SECTOR_SIZE, 0).unwrap();
        assert_eq!(out, buf);
    }
}
