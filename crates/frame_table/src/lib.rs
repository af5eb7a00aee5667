//! Physical frame table: allocation, pinning, and eviction (spec.md §4.2).
//!
//! The table itself never touches a page directory or a supplemental page
//! table directly — both are out-of-scope external collaborators per
//! spec.md §1 the same way the thread scheduler is. [`PageDirectory`] and
//! [`EvictionClient`] are the contracts a caller (the `vm` crate, in this
//! workspace) must supply; this mirrors the `Scheduler` trait boundary in
//! `crates/sync` and keeps this crate from depending on `vm` while `vm`
//! depends on it.
#![cfg_attr(not(test), no_std)]

extern crate alloc;

use alloc::vec::Vec;
use core::fmt;

use sync::{Lock, Scheduler};
pub use swap::PAGE_SIZE;

/// Physical frame index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Frame(pub usize);

/// Queries and mutations against the hardware page directory for a given
/// owner thread.
///
/// A real kernel implements this on top of the MMU's page tables; frames
/// never read or write a page directory except through this contract.
pub trait PageDirectory<Id> {
    /// Whether the hardware accessed bit is set for `owner`'s mapping of
    /// `vpage`.
    fn is_accessed(&self, owner: Id, vpage: usize) -> bool;
    /// Clears the hardware accessed bit for `owner`'s mapping of `vpage`.
    fn clear_accessed(&self, owner: Id, vpage: usize);
    /// Whether the hardware dirty bit is set for `owner`'s mapping of
    /// `vpage`.
    fn is_dirty(&self, owner: Id, vpage: usize) -> bool;
    /// Removes `owner`'s mapping of `vpage`, if any.
    fn clear_mapping(&self, owner: Id, vpage: usize);
}

/// The supplemental-page-table side of the eviction protocol (spec.md
/// §4.2 steps 2–3).
///
/// Implemented by whatever owns per-process supplemental page tables (the
/// `vm` crate). Given the frame being evicted, the owning thread, and the
/// virtual page it's currently mapped to, the implementation must resolve
/// the supplemental entry, mark it `EVICTING`, save the frame's contents
/// (to swap, or back to the backing file, depending on the entry), and
/// mark it `EVICTED` — acquiring and releasing the entry's `evict_lock`
/// around that work, per spec.md.
pub trait EvictionClient<Id> {
    type Error;

    fn evict(&self, owner: Id, vpage: usize, frame: &[u8; PAGE_SIZE]) -> Result<(), Self::Error>;
}

/// Error produced by the frame table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameError<E> {
    /// Every frame is pinned; eviction could make no progress.
    NoVictim,
    /// The eviction client failed to save the victim's contents.
    EvictionFailed(E),
}

impl<E: fmt::Debug> fmt::Display for FrameError<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NoVictim => write!(f, "no frame available to evict"),
            Self::EvictionFailed(e) => write!(f, "eviction failed: {e:?}"),
        }
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Class {
    /// `(accessed=0, dirty=0)` — cheapest to evict.
    Clean,
    /// `(accessed=0, dirty=1)`.
    Dirty,
    /// `(accessed=1, dirty=0)`.
    Used,
    /// `(accessed=1, dirty=1)` — most expensive.
    UsedDirty,
}

impl Class {
    fn of(accessed: bool, dirty: bool) -> Self {
        match (accessed, dirty) {
            (false, false) => Self::Clean,
            (false, true) => Self::Dirty,
            (true, false) => Self::Used,
            (true, true) => Self::UsedDirty,
        }
    }

    fn rank(self) -> u8 {
        match self {
            Self::Clean => 0,
            Self::Dirty => 1,
            Self::Used => 2,
            Self::UsedDirty => 3,
        }
    }
}

struct Descriptor<Id> {
    in_use: bool,
    owner: Option<Id>,
    vpage: Option<usize>,
    data: alloc::boxed::Box<[u8; PAGE_SIZE]>,
}

impl<Id> Descriptor<Id> {
    fn idle() -> Self {
        Self {
            in_use: false,
            owner: None,
            vpage: None,
            data: alloc::boxed::Box::new([0u8; PAGE_SIZE]),
        }
    }
}

struct State<Id> {
    frames: Vec<Descriptor<Id>>,
    clock_hand: usize,
}

/// The physical frame table.
///
/// `get`/`free` take the global eviction lock implicitly (spec.md requires
/// eviction to run under it); each frame additionally has its own pin lock,
/// held for the duration of any operation that must not race with that
/// frame's eviction.
pub struct FrameTable<S: Scheduler, Id: Copy + Eq> {
    state: Lock<S, State<Id>>,
    pins: Vec<Lock<S, ()>>,
    rng_state: core::sync::atomic::AtomicU64,
}

impl<S: Scheduler, Id: Copy + Eq> FrameTable<S, Id> {
    /// Creates a table of `count` idle frames (spec.md: "initialized with
    /// `N-1` frames taken from the user pool" — the caller decides `N-1`,
    /// this type just manages whatever count it's given).
    pub fn new(count: usize) -> Self {
        let mut frames = Vec::with_capacity(count);
        let mut pins = Vec::with_capacity(count);
        for _ in 0..count {
            frames.push(Descriptor::idle());
            pins.push(Lock::new(()));
        }
        Self {
            state: Lock::new(State {
                frames,
                clock_hand: 0,
            }),
            pins,
            rng_state: core::sync::atomic::AtomicU64::new(0x9e3779b97f4a7c15),
        }
    }

    /// Total number of frames managed by this table.
    pub fn len(&self) -> usize {
        self.pins.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pins.is_empty()
    }

    /// Returns an idle frame if one exists; otherwise evicts one via clock
    /// (falling back to NRU if the clock sweep can't settle) and returns it
    /// with `in_use = true`, owned by `owner` and mapped to `vpage`.
    pub fn get<D, C>(
        &self,
        dir: &D,
        client: &C,
        owner: Id,
        vpage: usize,
    ) -> Result<Frame, FrameError<C::Error>>
    where
        D: PageDirectory<Id>,
        C: EvictionClient<Id>,
    {
        let index = {
            let mut state = self.state.acquire().unwrap();
            match state.frames.iter().position(|f| !f.in_use) {
                Some(index) => index,
                None => {
                    drop(state);
                    self.evict_one(dir, client)?
                }
            }
        };
        let _pin = self.pins[index].acquire().unwrap();
        let mut state = self.state.acquire().unwrap();
        let frame = &mut state.frames[index];
        frame.in_use = true;
        frame.owner = Some(owner);
        frame.vpage = Some(vpage);
        Ok(Frame(index))
    }

    /// Clears `frame`'s mapping in `owner`'s page directory, marks it idle,
    /// and (in debug builds) poisons its contents.
    pub fn free<D: PageDirectory<Id>>(&self, dir: &D, frame: Frame) {
        let _pin = self.pins[frame.0].acquire().unwrap();
        let mut state = self.state.acquire().unwrap();
        let descriptor = &mut state.frames[frame.0];
        if let (Some(owner), Some(vpage)) = (descriptor.owner, descriptor.vpage) {
            dir.clear_mapping(owner, vpage);
        }
        descriptor.in_use = false;
        descriptor.owner = None;
        descriptor.vpage = None;
        #[cfg(debug_assertions)]
        descriptor.data.fill(0xcc);
    }

    /// Returns a copy of the frame descriptor's bookkeeping fields.
    pub fn get_entry(&self, frame: Frame) -> FrameEntry<Id> {
        let state = self.state.acquire().unwrap();
        let descriptor = &state.frames[frame.0];
        FrameEntry {
            in_use: descriptor.in_use,
            owner: descriptor.owner,
            vpage: descriptor.vpage,
        }
    }

    /// Reads the raw contents of `frame`.
    pub fn read(&self, frame: Frame) -> [u8; PAGE_SIZE] {
        *self.state.acquire().unwrap().frames[frame.0].data
    }

    /// Overwrites the raw contents of `frame`.
    pub fn write(&self, frame: Frame, data: &[u8; PAGE_SIZE]) {
        *self.state.acquire().unwrap().frames[frame.0].data = *data;
    }

    fn next_rand(&self) -> usize {
        // xorshift64*, good enough to pick a scan starting point.
        let mut x = self.rng_state.load(core::sync::atomic::Ordering::Relaxed);
        x ^= x << 13;
        x ^= x >> 7;
        x ^= x << 17;
        self.rng_state.store(x, core::sync::atomic::Ordering::Relaxed);
        x as usize
    }

    /// Runs clock replacement, falling back to NRU if the sweep can't
    /// settle on a victim (every frame pinned). Evicts the chosen victim
    /// and returns its now-idle index.
    fn evict_one<D, C>(&self, dir: &D, client: &C) -> Result<usize, FrameError<C::Error>>
    where
        D: PageDirectory<Id>,
        C: EvictionClient<Id>,
    {
        if let Some(index) = self.clock_victim(dir) {
            return self.evict_index(dir, client, index);
        }
        match self.nru_victim(dir) {
            Some(index) => self.evict_index(dir, client, index),
            None => Err(FrameError::NoVictim),
        }
    }

    /// Advances the clock hand; a page whose hardware accessed bit is set
    /// has it cleared and is skipped; the first page found with a clear
    /// bit is selected.
    fn clock_victim<D: PageDirectory<Id>>(&self, dir: &D) -> Option<usize> {
        let len = self.len();
        if len == 0 {
            return None;
        }
        let mut state = self.state.acquire().unwrap();
        for _ in 0..len {
            let index = state.clock_hand;
            state.clock_hand = (state.clock_hand + 1) % len;
            let frame = &state.frames[index];
            if !frame.in_use {
                return Some(index);
            }
            let (owner, vpage) = match (frame.owner, frame.vpage) {
                (Some(o), Some(v)) => (o, v),
                _ => continue,
            };
            if dir.is_accessed(owner, vpage) {
                dir.clear_accessed(owner, vpage);
                continue;
            }
            return Some(index);
        }
        None
    }

    /// Classifies every in-use frame by `(accessed, dirty)` and returns the
    /// lowest-ranked one, scanning from a random starting index to reduce
    /// convoy effects when several threads evict around the same time.
    fn nru_victim<D: PageDirectory<Id>>(&self, dir: &D) -> Option<usize> {
        let len = self.len();
        if len == 0 {
            return None;
        }
        let start = self.next_rand() % len;
        let state = self.state.acquire().unwrap();
        let mut best: Option<(usize, u8)> = None;
        for offset in 0..len {
            let index = (start + offset) % len;
            let frame = &state.frames[index];
            let (owner, vpage) = match (frame.owner, frame.vpage) {
                (Some(o), Some(v)) => (o, v),
                _ => continue,
            };
            let rank = Class::of(dir.is_accessed(owner, vpage), dir.is_dirty(owner, vpage)).rank();
            let better = match best {
                Some((_, best_rank)) => rank < best_rank,
                None => true,
            };
            if better {
                best = Some((index, rank));
                if rank == 0 {
                    break;
                }
            }
        }
        best.map(|(index, _)| index)
    }

    /// Runs the eviction protocol (spec.md §4.2 steps 1–5) against the
    /// frame at `index`, already selected by policy.
    fn evict_index<D, C>(
        &self,
        dir: &D,
        client: &C,
        index: usize,
    ) -> Result<usize, FrameError<C::Error>>
    where
        D: PageDirectory<Id>,
        C: EvictionClient<Id>,
    {
        let _pin = self.pins[index].acquire().unwrap();
        let (owner, vpage, data) = {
            let state = self.state.acquire().unwrap();
            let frame = &state.frames[index];
            match (frame.owner, frame.vpage) {
                (Some(owner), Some(vpage)) => (owner, vpage, *frame.data),
                _ => return Ok(index),
            }
        };
        log::trace!("evicting frame {index} (vpage {vpage})");
        client
            .evict(owner, vpage, &data)
            .map_err(FrameError::EvictionFailed)?;
        dir.clear_mapping(owner, vpage);
        let mut state = self.state.acquire().unwrap();
        let frame = &mut state.frames[index];
        frame.in_use = false;
        frame.owner = None;
        frame.vpage = None;
        frame.data.fill(0);
        Ok(index)
    }
}

/// A snapshot of a frame descriptor's bookkeeping fields.
#[derive(Debug, Clone, Copy)]
pub struct FrameEntry<Id> {
    pub in_use: bool,
    pub owner: Option<Id>,
    pub vpage: Option<usize>,
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;
    use std::collections::HashMap;

    use sync::StdScheduler;

    use super::*;

    #[derive(Default)]
    struct FakeDir {
        accessed: RefCell<HashMap<(u32, usize), bool>>,
        dirty: RefCell<HashMap<(u32, usize), bool>>,
        mapped: RefCell<HashMap<(u32, usize), bool>>,
    }

    impl PageDirectory<u32> for FakeDir {
        fn is_accessed(&self, owner: u32, vpage: usize) -> bool {
            *self.accessed.borrow().get(&(owner, vpage)).unwrap_or(&false)
        }

        fn clear_accessed(&self, owner: u32, vpage: usize) {
            self.accessed.borrow_mut().insert((owner, vpage), false);
        }

        fn is_dirty(&self, owner: u32, vpage: usize) -> bool {
            *self.dirty.borrow().get(&(owner, vpage)).unwrap_or(&false)
        }

        fn clear_mapping(&self, owner: u32, vpage: usize) {
            self.mapped.borrow_mut().insert((owner, vpage), false);
        }
    }

    #[derive(Default)]
    struct FakeEvictionClient {
        evicted: RefCell<alloc::vec::Vec<(u32, usize)>>,
    }

    impl EvictionClient<u32> for FakeEvictionClient {
        type Error = ();

        fn evict(&self, owner: u32, vpage: usize, _frame: &[u8; PAGE_SIZE]) -> Result<(), ()> {
            self.evicted.borrow_mut().push((owner, vpage));
            Ok(())
        }
    }

    #[test]
    fn get_returns_idle_frames_first() {
        let table = FrameTable::<StdScheduler, u32>::new(2);
        let dir = FakeDir::default();
        let client = FakeEvictionClient::default();
        let a = table.get(&dir, &client, 1, 0).unwrap();
        let b = table.get(&dir, &client, 1, 1).unwrap();
        assert_ne!(a.0, b.0);
        assert!(client.evicted.borrow().is_empty());
    }

    #[test]
    fn get_evicts_when_full_and_clears_mapping() {
        let table = FrameTable::<StdScheduler, u32>::new(1);
        let dir = FakeDir::default();
        let client = FakeEvictionClient::default();
        let first = table.get(&dir, &client, 1, 0).unwrap();
        let second = table.get(&dir, &client, 1, 1).unwrap();
        assert_eq!(first.0, second.0);
        assert_eq!(*client.evicted.borrow(), alloc::vec![(1, 0)]);
        assert_eq!(dir.mapped.borrow().get(&(1u32, 0)), Some(&false));
    }

    #[test]
    fn accessed_frames_are_skipped_by_clock_then_cleared() {
        let table = FrameTable::<StdScheduler, u32>::new(2);
        let dir = FakeDir::default();
        let client = FakeEvictionClient::default();
        let a = table.get(&dir, &client, 1, 0).unwrap();
        let _b = table.get(&dir, &client, 1, 1).unwrap();
        dir.accessed.borrow_mut().insert((1, 0), true);

        let c = table.get(&dir, &client, 1, 2).unwrap();
        // frame `a`'s page was accessed, so the clock hand must have
        // skipped it (clearing the bit) and evicted frame `_b` instead.
        assert_eq!(c.0, 1);
        assert_eq!(dir.accessed.borrow().get(&(1u32, 0)), Some(&false));
    }

    #[test]
    fn free_clears_mapping_and_marks_idle() {
        let table = FrameTable::<StdScheduler, u32>::new(1);
        let dir = FakeDir::default();
        let client = FakeEvictionClient::default();
        let frame = table.get(&dir, &client, 1, 0).unwrap();
        table.free(&dir, frame);
        assert_eq!(dir.mapped.borrow().get(&(1u32, 0)), Some(&false));
        assert!(!table.get_entry(frame).in_use);
    }

    #[test]
    fn get_entry_reports_owner_and_vpage() {
        let table = FrameTable::<StdScheduler, u32>::new(1);
        let dir = FakeDir::default();
        let client = FakeEvictionClient::default();
        let frame = table.get(&dir, &client, 9, 42).unwrap();
        let entry = table.get_entry(frame);
        assert_eq!(entry.owner, Some(9));
        assert_eq!(entry.vpage, Some(42));
    }

    #[test]
    fn read_write_roundtrips_frame_contents() {
        let table = FrameTable::<StdScheduler, u32>::new(1);
        let dir = FakeDir::default();
        let client = FakeEvictionClient::default();
        let frame = table.get(&dir, &client, 1, 0).unwrap();
        let mut data = [0u8; PAGE_SIZE];
        data[0] = 42;
        table.write(frame, &data);
        assert_eq!(table.read(frame), data);
    }
}
