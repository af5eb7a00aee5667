//! A software stand-in for the hardware page directory and frame
//! installer (spec.md §1 lists "virtual memory hardware interface" among
//! the external collaborators this crate never implements for real).
//!
//! Mirrors `crates/block_device`'s `MemBlockDevice`: not `cfg(test)`-gated,
//! so both this crate's own unit tests and the end-to-end scenarios under
//! `tests/` can drive `vm::route_fault` and `frame_table::FrameTable`
//! without a real MMU, the same way `MemBlockDevice` lets every layer above
//! `BlockDevice` run without a real disk.

use alloc::collections::BTreeMap;
use alloc::vec::Vec;

use frame_table::PAGE_SIZE;
use sync::{Lock, Scheduler};
use vm::Installer;

#[derive(Debug, Clone, Copy, Default)]
struct Mapping {
    writable: bool,
    accessed: bool,
    dirty: bool,
}

/// An in-memory page directory keyed by `(owner, vpage)`, with accessed/
/// dirty bits tracked explicitly rather than by a real MMU.
pub struct InMemoryPageDirectory<S: Scheduler, Id: Copy + Eq + Ord> {
    pages: Lock<S, BTreeMap<(Id, usize), (Vec<u8>, Mapping)>>,
}

impl<S: Scheduler, Id: Copy + Eq + Ord> InMemoryPageDirectory<S, Id> {
    #[must_use]
    pub fn new() -> Self {
        Self {
            pages: Lock::new(BTreeMap::new()),
        }
    }

    /// Marks `vpage` as written to, the moment a caller's test harness
    /// needs to simulate a user store instruction hitting a resident page
    /// (a real MMU would set this itself on the first write).
    pub fn mark_dirty(&self, owner: Id, vpage: usize) {
        if let Some((_, mapping)) = self.pages.acquire().unwrap().get_mut(&(owner, vpage)) {
            mapping.dirty = true;
        }
    }

    /// Marks `vpage` as touched, the software equivalent of the hardware
    /// accessed bit a real MMU sets on every reference.
    pub fn mark_accessed(&self, owner: Id, vpage: usize) {
        if let Some((_, mapping)) = self.pages.acquire().unwrap().get_mut(&(owner, vpage)) {
            mapping.accessed = true;
        }
    }

    /// Whether `vpage` was last installed writable. Lets a test assert the
    /// fault handler honored `SupEntry::writable` without peeking at `vm`'s
    /// private state.
    pub fn is_writable(&self, owner: Id, vpage: usize) -> bool {
        self.pages
            .acquire()
            .unwrap()
            .get(&(owner, vpage))
            .is_some_and(|(_, m)| m.writable)
    }
}

impl<S: Scheduler, Id: Copy + Eq + Ord> Default for InMemoryPageDirectory<S, Id> {
    fn default() -> Self {
        Self::new()
    }
}

impl<S: Scheduler, Id: Copy + Eq + Ord> frame_table::PageDirectory<Id> for InMemoryPageDirectory<S, Id> {
    fn is_accessed(&self, owner: Id, vpage: usize) -> bool {
        self.pages
            .acquire()
            .unwrap()
            .get(&(owner, vpage))
            .is_some_and(|(_, m)| m.accessed)
    }

    fn clear_accessed(&self, owner: Id, vpage: usize) {
        if let Some((_, mapping)) = self.pages.acquire().unwrap().get_mut(&(owner, vpage)) {
            mapping.accessed = false;
        }
    }

    fn is_dirty(&self, owner: Id, vpage: usize) -> bool {
        self.pages
            .acquire()
            .unwrap()
            .get(&(owner, vpage))
            .is_some_and(|(_, m)| m.dirty)
    }

    fn clear_mapping(&self, owner: Id, vpage: usize) {
        self.pages.acquire().unwrap().remove(&(owner, vpage));
    }
}

impl<S: Scheduler, Id: Copy + Eq + Ord> Installer<Id> for InMemoryPageDirectory<S, Id> {
    fn install(&self, owner: Id, vpage: usize, data: &[u8; PAGE_SIZE], writable: bool) {
        self.pages.acquire().unwrap().insert(
            (owner, vpage),
            (
                data.to_vec(),
                Mapping {
                    writable,
                    accessed: false,
                    dirty: false,
                },
            ),
        );
    }
}
