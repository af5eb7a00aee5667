//! Swap area over `BLOCK_SWAP` (spec.md §4.3).
//!
//! One slot is one page, laid out as [`SECTORS_PER_PAGE`] contiguous
//! sectors. Occupancy is tracked by a [`Bitmap`]; a single global
//! [`Lock`](sync::Lock) serializes every `write`/`read`, per spec.md §5
//! ("swap reads and writes suspend under `swap_lock`") — there is no
//! per-slot locking to generalize here, unlike the block cache.
#![cfg_attr(not(test), no_std)]

extern crate alloc;

use bitmap::Bitmap;
use block_device::{BlockDevice, BlockError, SECTOR_SIZE};
use sync::{Lock, Scheduler};

/// Page size in bytes; a swap slot holds exactly one page.
pub const PAGE_SIZE: usize = 4096;

/// Sectors per page, hence per swap slot.
pub const SECTORS_PER_PAGE: usize = PAGE_SIZE / SECTOR_SIZE;

/// Identifies an occupied swap slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SwapSlot(pub usize);

/// Error produced by the swap area.
#[derive(Debug, thiserror::Error, Clone, Copy, PartialEq, Eq)]
pub enum SwapError {
    /// The device has no free slot.
    #[error("swap area is full")]
    Full,
    /// `read` was asked for a slot that is not currently occupied.
    #[error("swap slot {0:?} is not in use")]
    NotOccupied(SwapSlot),
    #[error(transparent)]
    Block(#[from] BlockError),
}

struct State {
    occupancy: Bitmap,
}

/// The swap area: a bitmap-managed set of page-sized slots over a
/// [`BlockDevice`].
pub struct SwapArea<S: Scheduler, D: BlockDevice> {
    device: D,
    state: Lock<S, State>,
}

impl<S: Scheduler, D: BlockDevice> SwapArea<S, D> {
    /// Creates a swap area over `device`, sized to the largest whole number
    /// of slots the device holds.
    pub fn new(device: D) -> Self {
        let slot_count = device.sector_count() / SECTORS_PER_PAGE;
        Self {
            device,
            state: Lock::new(State {
                occupancy: Bitmap::new(slot_count),
            }),
        }
    }

    /// Total number of slots.
    pub fn slot_count(&self) -> usize {
        self.state.acquire().unwrap().occupancy.len()
    }

    /// Scans for a cleared bit, sets it, and copies `page` into the
    /// corresponding eight sectors.
    ///
    /// Returns the slot the page now occupies.
    pub fn write(&self, page: &[u8; PAGE_SIZE]) -> Result<SwapSlot, SwapError> {
        let mut state = self.state.acquire().unwrap();
        let slot = state.occupancy.first_fit_set().ok_or(SwapError::Full)?;
        drop(state);

        for sector_in_slot in 0..SECTORS_PER_PAGE {
            let start = sector_in_slot * SECTOR_SIZE;
            let mut buf = [0u8; SECTOR_SIZE];
            buf.copy_from_slice(&page[start..start + SECTOR_SIZE]);
            self.device
                .write(slot * SECTORS_PER_PAGE + sector_in_slot, &buf)?;
        }
        Ok(SwapSlot(slot))
    }

    /// Asserts `slot` is occupied, copies its eight sectors into `page`,
    /// and clears the slot's bit.
    pub fn read(&self, slot: SwapSlot, page: &mut [u8; PAGE_SIZE]) -> Result<(), SwapError> {
        {
            let state = self.state.acquire().unwrap();
            if !state.occupancy.get(slot.0) {
                return Err(SwapError::NotOccupied(slot));
            }
        }

        for sector_in_slot in 0..SECTORS_PER_PAGE {
            let mut buf = [0u8; SECTOR_SIZE];
            self.device
                .read(slot.0 * SECTORS_PER_PAGE + sector_in_slot, &mut buf)?;
            let start = sector_in_slot * SECTOR_SIZE;
            page[start..start + SECTOR_SIZE].copy_from_slice(&buf);
        }

        self.state.acquire().unwrap().occupancy.clear(slot.0);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use block_device::MemBlockDevice;
    use sync::StdScheduler;

    use super::*;

    fn area(slots: usize) -> SwapArea<StdScheduler, MemBlockDevice> {
        SwapArea::new(MemBlockDevice::new(slots * SECTORS_PER_PAGE))
    }

    #[test]
    fn write_then_read_roundtrips_a_page() {
        let area = area(2);
        let mut page = [0u8; PAGE_SIZE];
        page[0] = 1;
        page[PAGE_SIZE - 1] = 2;
        let slot = area.write(&page).unwrap();

        let mut out = [0u8; PAGE_SIZE];
        area.read(slot, &mut out).unwrap();
        assert_eq!(out, page);
    }

    #[test]
    fn read_clears_the_slot_for_reuse() {
        let area = area(1);
        let page = [7u8; PAGE_SIZE];
        let slot = area.write(&page).unwrap();
        assert_eq!(area.write(&page).unwrap_err(), SwapError::Full);

        let mut out = [0u8; PAGE_SIZE];
        area.read(slot, &mut out).unwrap();

        // Freed now; another write should succeed and reuse the slot.
        let slot2 = area.write(&page).unwrap();
        assert_eq!(slot2, slot);
    }

    #[test]
    fn read_of_unoccupied_slot_fails() {
        let area = area(1);
        assert_eq!(
            area.read(SwapSlot(0), &mut [0u8; PAGE_SIZE]).unwrap_err(),
            SwapError::NotOccupied(SwapSlot(0))
        );
    }

    #[test]
    fn full_area_rejects_further_writes() {
        let area = area(1);
        area.write(&[0u8; PAGE_SIZE]).unwrap();
        assert_eq!(area.write(&[0u8; PAGE_SIZE]).unwrap_err(), SwapError::Full);
    }
}
