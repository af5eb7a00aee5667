//! Supplemental page table, fault handler, and mmap registry (spec.md
//! §4.7, §4.8).
//!
//! This crate never touches a hardware page directory directly, the same
//! way `frame_table` doesn't: [`Installer`] and `frame_table::PageDirectory`
//! are the contracts a caller (a real kernel) supplies, and [`BackingFile`]
//! plays the same role for file-backed pages so this crate doesn't depend
//! on `fs` directly.
#![cfg_attr(not(test), no_std)]

extern crate alloc;

use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::fmt;

use block_device::BlockDevice;
use frame_table::{Frame, FrameError, FrameTable};
use swap::{PAGE_SIZE, SwapArea, SwapError, SwapSlot};
use sync::{Lock, Scheduler};

/// Installs a freshly loaded page into `owner`'s hardware page table.
/// `frame_table::PageDirectory` covers querying and clearing a mapping;
/// this covers creating one.
pub trait Installer<Id> {
    fn install(&self, owner: Id, vpage: usize, data: &[u8; PAGE_SIZE], writable: bool);
}

/// A file handle this crate can read from and write to, standing in for
/// `fs::OpenFile` without a direct dependency on `fs`.
pub trait BackingFile {
    type Error;

    fn read_at(&self, buf: &mut [u8], offset: u64) -> Result<usize, Self::Error>;
    fn write_at(&self, buf: &[u8], offset: u64) -> Result<usize, Self::Error>;
}

/// Which kind of virtual page a supplemental entry describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Source {
    Executable,
    Stack,
    Mmap,
}

/// Where a non-resident page's authoritative contents presently live.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Location {
    /// Never loaded; materializes as all-zero.
    Anonymous,
    InFile,
    InSwap(SwapSlot),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvictionState {
    Resident,
    Evicting,
    Evicted,
}

/// Backing-file read/write parameters for an `EXECUTABLE` or `MMAP` entry.
pub struct FileBacking<F> {
    pub file: Arc<F>,
    pub file_offset: u64,
    pub file_read_bytes: usize,
    pub file_zero_bytes: usize,
}

impl<F> Clone for FileBacking<F> {
    fn clone(&self) -> Self {
        Self {
            file: self.file.clone(),
            file_offset: self.file_offset,
            file_read_bytes: self.file_read_bytes,
            file_zero_bytes: self.file_zero_bytes,
        }
    }
}

struct Mutable {
    eviction_state: EvictionState,
    location: Location,
    frame: Option<Frame>,
}

/// One virtual page's supplemental metadata (spec.md §3 "Supplemental page
/// entry"). `save_to_swap` is fixed at construction per `source`, matching
/// spec.md §4.7: executable and stack pages always save to swap on
/// eviction; mmap pages always write back to their file.
pub struct SupEntry<S: Scheduler, F> {
    pub vpage: usize,
    pub writable: bool,
    source: Source,
    save_to_swap: bool,
    backing: Option<FileBacking<F>>,
    evict_lock: Lock<S, ()>,
    mutable: Lock<S, Mutable>,
}

impl<S: Scheduler, F> SupEntry<S, F> {
    fn executable(vpage: usize, backing: FileBacking<F>, writable: bool) -> Self {
        Self {
            vpage,
            writable,
            source: Source::Executable,
            save_to_swap: true,
            backing: Some(backing),
            evict_lock: Lock::new(()),
            mutable: Lock::new(Mutable {
                eviction_state: EvictionState::Evicted,
                location: Location::InFile,
                frame: None,
            }),
        }
    }

    fn mmap(vpage: usize, backing: FileBacking<F>, writable: bool) -> Self {
        Self {
            vpage,
            writable,
            source: Source::Mmap,
            save_to_swap: false,
            backing: Some(backing),
            evict_lock: Lock::new(()),
            mutable: Lock::new(Mutable {
                eviction_state: EvictionState::Evicted,
                location: Location::InFile,
                frame: None,
            }),
        }
    }

    fn stack(vpage: usize) -> Self {
        Self {
            vpage,
            writable: true,
            source: Source::Stack,
            save_to_swap: true,
            backing: None,
            evict_lock: Lock::new(()),
            mutable: Lock::new(Mutable {
                eviction_state: EvictionState::Evicted,
                location: Location::Anonymous,
                frame: None,
            }),
        }
    }

    pub fn source(&self) -> Source {
        self.source
    }

    pub fn is_resident(&self) -> bool {
        self.mutable.acquire().unwrap().frame.is_some()
    }

    pub fn eviction_state(&self) -> EvictionState {
        self.mutable.acquire().unwrap().eviction_state
    }
}

/// Per-process map from virtual page to supplemental entry.
pub struct SupplementalTable<S: Scheduler, F> {
    entries: Lock<S, BTreeMap<usize, Arc<SupEntry<S, F>>>>,
}

impl<S: Scheduler, F> SupplementalTable<S, F> {
    pub fn new() -> Self {
        Self {
            entries: Lock::new(BTreeMap::new()),
        }
    }

    pub fn lookup(&self, vpage: usize) -> Option<Arc<SupEntry<S, F>>> {
        self.entries.acquire().unwrap().get(&vpage).cloned()
    }

    pub fn has_conflict(&self, vpage: usize) -> bool {
        self.entries.acquire().unwrap().contains_key(&vpage)
    }

    pub fn insert_executable(&self, vpage: usize, backing: FileBacking<F>, writable: bool) {
        self.entries
            .acquire()
            .unwrap()
            .insert(vpage, Arc::new(SupEntry::executable(vpage, backing, writable)));
    }

    pub fn insert_mmap(&self, vpage: usize, backing: FileBacking<F>, writable: bool) {
        self.entries
            .acquire()
            .unwrap()
            .insert(vpage, Arc::new(SupEntry::mmap(vpage, backing, writable)));
    }

    fn insert_stack(&self, vpage: usize) -> Arc<SupEntry<S, F>> {
        let entry = Arc::new(SupEntry::stack(vpage));
        self.entries.acquire().unwrap().insert(vpage, entry.clone());
        entry
    }

    pub fn remove(&self, vpage: usize) -> Option<Arc<SupEntry<S, F>>> {
        self.entries.acquire().unwrap().remove(&vpage)
    }

    /// Frees every resident frame and drops every entry (spec.md §4.7
    /// "process exit walks the supplemental table").
    pub fn exit<Id: Copy + Eq, D: frame_table::PageDirectory<Id>>(&self, frame_table: &FrameTable<S, Id>, dir: &D) {
        let mut entries = self.entries.acquire().unwrap();
        for entry in entries.values() {
            let mut mutable = entry.mutable.acquire().unwrap();
            if let Some(frame) = mutable.frame.take() {
                frame_table.free(dir, frame);
            }
            mutable.eviction_state = EvictionState::Evicted;
        }
        entries.clear();
    }
}

impl<S: Scheduler, F> Default for SupplementalTable<S, F> {
    fn default() -> Self {
        Self::new()
    }
}

/// Error produced while writing an evicted page back to swap or to its
/// backing file (spec.md §4.2 step 3).
#[derive(Debug)]
pub enum EvictError<E> {
    Swap(SwapError),
    Backing(E),
    /// `evict` was asked about an owner/vpage this registry never
    /// installed an entry for — a frame-table/vm bookkeeping mismatch.
    UnknownEntry,
}

impl<E: fmt::Debug> fmt::Display for EvictError<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Swap(e) => write!(f, "swap write failed: {e}"),
            Self::Backing(e) => write!(f, "backing-file write failed: {e:?}"),
            Self::UnknownEntry => write!(f, "no supplemental entry for the evicted page"),
        }
    }
}

/// Owns the swap area and every process's supplemental table, and is the
/// [`frame_table::EvictionClient`] the frame table calls into (spec.md
/// §4.2 step 3).
pub struct VmRegistry<S: Scheduler, Id: Copy + Eq + Ord, D: BlockDevice, F: BackingFile> {
    swap: SwapArea<S, D>,
    tables: Lock<S, BTreeMap<Id, Arc<SupplementalTable<S, F>>>>,
}

impl<S: Scheduler, Id: Copy + Eq + Ord, D: BlockDevice, F: BackingFile> VmRegistry<S, Id, D, F> {
    pub fn new(swap_device: D) -> Self {
        Self {
            swap: SwapArea::new(swap_device),
            tables: Lock::new(BTreeMap::new()),
        }
    }

    pub fn swap(&self) -> &SwapArea<S, D> {
        &self.swap
    }

    /// Returns `owner`'s supplemental table, creating an empty one on
    /// first use.
    pub fn table(&self, owner: Id) -> Arc<SupplementalTable<S, F>> {
        self.tables
            .acquire()
            .unwrap()
            .entry(owner)
            .or_insert_with(|| Arc::new(SupplementalTable::new()))
            .clone()
    }

    /// Drops `owner`'s table. Callers must run [`SupplementalTable::exit`]
    /// first to free its resident frames.
    pub fn forget(&self, owner: Id) {
        self.tables.acquire().unwrap().remove(&owner);
    }
}

impl<S: Scheduler, Id: Copy + Eq + Ord, D: BlockDevice, F: BackingFile> frame_table::EvictionClient<Id>
    for VmRegistry<S, Id, D, F>
{
    type Error = EvictError<F::Error>;

    fn evict(&self, owner: Id, vpage: usize, frame: &[u8; PAGE_SIZE]) -> Result<(), Self::Error> {
        let table = self
            .tables
            .acquire()
            .unwrap()
            .get(&owner)
            .cloned()
            .ok_or(EvictError::UnknownEntry)?;
        let entry = table.lookup(vpage).ok_or(EvictError::UnknownEntry)?;

        let _evict_guard = entry.evict_lock.acquire().unwrap();
        entry.mutable.acquire().unwrap().eviction_state = EvictionState::Evicting;

        let location = if entry.save_to_swap {
            let slot = self.swap.write(frame).map_err(EvictError::Swap)?;
            Location::InSwap(slot)
        } else {
            let backing = entry
                .backing
                .as_ref()
                .expect("a non-swap-backed entry must carry a backing file");
            backing
                .file
                .write_at(&frame[..backing.file_read_bytes], backing.file_offset)
                .map_err(EvictError::Backing)?;
            Location::InFile
        };

        let mut mutable = entry.mutable.acquire().unwrap();
        mutable.location = location;
        mutable.frame = None;
        mutable.eviction_state = EvictionState::Evicted;
        log::trace!("vm: evicted vpage {vpage:#x}, save_to_swap={}", entry.save_to_swap);
        Ok(())
    }
}

/// Error produced while routing a page fault (spec.md §4.7).
#[derive(Debug)]
pub enum FaultError<E> {
    /// No supplemental entry, and not a legal stack-growth access; the
    /// caller should exit the offending process with status `-1`
    /// (spec.md §4.7 step 3, §7).
    BadAccess,
    Frame(FrameError<EvictError<E>>),
    Swap(SwapError),
    Backing(E),
}

/// The stack-growth heuristic of spec.md §4.7 step 2, factored out so it's
/// directly testable: legal only for a user-mode fault, and only at
/// `esp - 4`, `esp - 32`, or any address above `esp`.
pub fn should_grow_stack(addr: usize, esp: usize, is_user_fault: bool) -> bool {
    if !is_user_fault {
        return false;
    }
    addr > esp || matches!(esp.checked_sub(addr), Some(4) | Some(32))
}

/// Routes a page fault on `fault_addr` against `owner`'s supplemental
/// table (spec.md §4.7 steps 1-6). `Ok(())` means the fault has been
/// resolved and the instruction may be retried; `Err(BadAccess)` means
/// the access was illegal.
#[allow(clippy::too_many_arguments)]
pub fn route_fault<S, Id, D, F, M>(
    registry: &VmRegistry<S, Id, D, F>,
    frame_table: &FrameTable<S, Id>,
    dir: &M,
    owner: Id,
    fault_addr: usize,
    esp: usize,
    is_user_fault: bool,
) -> Result<(), FaultError<F::Error>>
where
    S: Scheduler,
    Id: Copy + Eq + Ord,
    D: BlockDevice,
    F: BackingFile,
    M: frame_table::PageDirectory<Id> + Installer<Id>,
{
    let vpage = fault_addr & !(PAGE_SIZE - 1);
    let table = registry.table(owner);

    let entry = match table.lookup(vpage) {
        Some(entry) => entry,
        None if should_grow_stack(fault_addr, esp, is_user_fault) => table.insert_stack(vpage),
        None => return Err(FaultError::BadAccess),
    };

    if entry.is_resident() {
        return Ok(());
    }
    let _evict_guard = entry.evict_lock.acquire().unwrap();
    if entry.is_resident() {
        return Ok(());
    }

    let mut data = [0u8; PAGE_SIZE];
    let location = entry.mutable.acquire().unwrap().location;
    match location {
        Location::Anonymous => {}
        Location::InFile => {
            let backing = entry
                .backing
                .as_ref()
                .expect("an IN_FILE entry must carry a backing file");
            backing
                .file
                .read_at(&mut data[..backing.file_read_bytes], backing.file_offset)
                .map_err(FaultError::Backing)?;
        }
        Location::InSwap(slot) => {
            registry.swap().read(slot, &mut data).map_err(FaultError::Swap)?;
        }
    }

    let frame = frame_table.get(dir, registry, owner, vpage).map_err(FaultError::Frame)?;
    frame_table.write(frame, &data);
    dir.install(owner, vpage, &data, entry.writable);

    let mut mutable = entry.mutable.acquire().unwrap();
    mutable.frame = Some(frame);
    mutable.eviction_state = EvictionState::Resident;
    Ok(())
}

/// One installed `mmap` mapping (spec.md §3 "Mmap entry").
struct MmapRecord<F> {
    start_vpage: usize,
    page_count: usize,
    file: Arc<F>,
}

/// Per-process map from mapping id to its installed page range (spec.md
/// §4.8).
pub struct MmapTable<S: Scheduler, F> {
    next_id: Lock<S, u32>,
    records: Lock<S, BTreeMap<u32, MmapRecord<F>>>,
}

/// Error produced by [`MmapTable::mmap`]'s precondition checks (spec.md
/// §4.8, §8 "`mmap` fails on null address, non-aligned address,
/// zero-length file, or overlap with any supplemental entry").
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum MmapError {
    #[error("file is empty")]
    EmptyFile,
    #[error("address is null or not page-aligned")]
    BadAddress,
    #[error("mapping overlaps an existing supplemental entry")]
    Overlaps,
}

impl<S: Scheduler, F: BackingFile> MmapTable<S, F> {
    pub fn new() -> Self {
        Self {
            next_id: Lock::new(1),
            records: Lock::new(BTreeMap::new()),
        }
    }

    /// Installs one `MMAP` supplemental entry per page of `file`, starting
    /// at `start_addr`; the final page's `file_read_bytes` is `file_size %
    /// PAGE_SIZE` (or a full page if that's zero).
    pub fn mmap(
        &self,
        table: &SupplementalTable<S, F>,
        file: Arc<F>,
        file_size: u64,
        start_addr: usize,
    ) -> Result<u32, MmapError> {
        if file_size == 0 {
            return Err(MmapError::EmptyFile);
        }
        if start_addr == 0 || start_addr % PAGE_SIZE != 0 {
            return Err(MmapError::BadAddress);
        }
        let page_count = file_size.div_ceil(PAGE_SIZE as u64) as usize;
        for i in 0..page_count {
            if table.has_conflict(start_addr + i * PAGE_SIZE) {
                return Err(MmapError::Overlaps);
            }
        }

        for i in 0..page_count {
            let vpage = start_addr + i * PAGE_SIZE;
            let file_offset = (i * PAGE_SIZE) as u64;
            let file_read_bytes = if i + 1 == page_count {
                let rem = (file_size % PAGE_SIZE as u64) as usize;
                if rem == 0 { PAGE_SIZE } else { rem }
            } else {
                PAGE_SIZE
            };
            table.insert_mmap(
                vpage,
                FileBacking {
                    file: file.clone(),
                    file_offset,
                    file_read_bytes,
                    file_zero_bytes: PAGE_SIZE - file_read_bytes,
                },
                true,
            );
        }

        let mut next_id = self.next_id.acquire().unwrap();
        let id = *next_id;
        *next_id += 1;
        self.records.acquire().unwrap().insert(
            id,
            MmapRecord {
                start_vpage: start_addr,
                page_count,
                file,
            },
        );
        Ok(id)
    }

    /// Writes back any page dirtied in the hardware page directory, frees
    /// every resident frame, and removes every supplemental entry the
    /// mapping installed (spec.md §4.8).
    pub fn munmap<Id: Copy + Eq, D: frame_table::PageDirectory<Id>>(
        &self,
        table: &SupplementalTable<S, F>,
        frame_table: &FrameTable<S, Id>,
        dir: &D,
        owner: Id,
        mapping_id: u32,
    ) -> Result<(), F::Error> {
        let Some(record) = self.records.acquire().unwrap().remove(&mapping_id) else {
            return Ok(());
        };

        for i in 0..record.page_count {
            let vpage = record.start_vpage + i * PAGE_SIZE;
            let Some(entry) = table.remove(vpage) else {
                continue;
            };
            let _evict_guard = entry.evict_lock.acquire().unwrap();
            let mut mutable = entry.mutable.acquire().unwrap();
            if let Some(frame) = mutable.frame.take() {
                if dir.is_dirty(owner, vpage) {
                    let backing = entry
                        .backing
                        .as_ref()
                        .expect("an mmap entry must carry a backing file");
                    let data = frame_table.read(frame);
                    backing.file.write_at(&data[..backing.file_read_bytes], backing.file_offset)?;
                }
                frame_table.free(dir, frame);
            }
        }
        Ok(())
    }

    /// Tears down every remaining mapping (spec.md §4.8 "all maps are torn
    /// down on process exit").
    pub fn exit<Id: Copy + Eq, D: frame_table::PageDirectory<Id>>(
        &self,
        table: &SupplementalTable<S, F>,
        frame_table: &FrameTable<S, Id>,
        dir: &D,
        owner: Id,
    ) -> Result<(), F::Error> {
        let ids: Vec<u32> = self.records.acquire().unwrap().keys().copied().collect();
        for id in ids {
            self.munmap(table, frame_table, dir, owner, id)?;
        }
        Ok(())
    }
}

impl<S: Scheduler, F: BackingFile> Default for MmapTable<S, F> {
    fn default() -> Self {
        Self::new()
    }
}
