//! Anonymous swap backing store.
//!
//! A block device partitioned into `PAGE_SIZE` slots, indexed by a bitmap
//! guarded by its own lock (never taken before `frame_lock`/`spt_lock`/
//! `share_lock` in the ordering from the concurrency model). Grounded in
//! the same bitmap-over-a-device shape as the frame pools in `pool.rs`;
//! the block device itself is an external collaborator, modeled as a
//! trait so swap-out/swap-in can be tested without real disk I/O.

use alloc::vec;
use alloc::vec::Vec;

use spin::Mutex;

use super::error::VmError;
use super::PAGE_SIZE;

/// Index of a slot on the swap device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SwapSlot(u64);

/// The block device backing the swap store. The real driver lives outside
/// this crate; tests implement this over an in-memory `Vec` of slots.
pub trait BlockDevice: Send {
    /// Total number of `PAGE_SIZE` slots this device exposes.
    fn slot_count(&self) -> u64;

    /// Reads slot `slot` into `buf`.
    fn read_slot(&self, slot: u64, buf: &mut [u8; PAGE_SIZE]);

    /// Writes `buf` to slot `slot`.
    fn write_slot(&mut self, slot: u64, buf: &[u8; PAGE_SIZE]);
}

/// An in-memory block device for tests.
pub struct MemBlockDevice {
    slots: Vec<[u8; PAGE_SIZE]>,
}

impl MemBlockDevice {
    /// Builds a device with `slot_count` zeroed slots.
    #[must_use]
    pub fn new(slot_count: usize) -> Self {
        Self {
            slots: vec![[0_u8; PAGE_SIZE]; slot_count],
        }
    }
}

impl BlockDevice for MemBlockDevice {
    fn slot_count(&self) -> u64 {
        self.slots.len() as u64
    }

    fn read_slot(&self, slot: u64, buf: &mut [u8; PAGE_SIZE]) {
        buf.copy_from_slice(&self.slots[slot as usize]);
    }

    fn write_slot(&mut self, slot: u64, buf: &[u8; PAGE_SIZE]) {
        self.slots[slot as usize].copy_from_slice(buf);
    }
}

struct SwapBitmap {
    used: Vec<bool>,
}

/// Slot-indexed anonymous page store. `D` is the block device
/// implementation; production wires in the real driver, tests wire in
/// `MemBlockDevice`.
pub struct SwapStore<D: BlockDevice> {
    device: Mutex<D>,
    bitmap: Mutex<SwapBitmap>,
}

impl<D: BlockDevice> SwapStore<D> {
    /// Builds a swap store over `device`.
    pub fn new(device: D) -> Self {
        let slot_count = device.slot_count() as usize;
        Self {
            device: Mutex::new(device),
            bitmap: Mutex::new(SwapBitmap {
                used: vec![false; slot_count],
            }),
        }
    }

    /// Writes `page` to a freshly allocated slot, returning its index.
    ///
    /// # Errors
    /// Returns [`VmError::SwapFull`] if every slot is in use.
    pub fn swap_out(&self, page: &[u8; PAGE_SIZE]) -> Result<SwapSlot, VmError> {
        let slot = {
            let mut bitmap = self.bitmap.lock();
            let index = bitmap
                .used
                .iter()
                .position(|used| !used)
                .ok_or(VmError::SwapFull)?;
            bitmap.used[index] = true;
            index as u64
        };
        self.device.lock().write_slot(slot, page);
        Ok(SwapSlot(slot))
    }

    /// Reads `slot` into `page` and releases it back to the free set.
    pub fn swap_in(&self, slot: SwapSlot, page: &mut [u8; PAGE_SIZE]) {
        self.device.lock().read_slot(slot.0, page);
        self.drop_slot(slot);
    }

    /// Releases `slot` without reading it back, for SPT entries destroyed
    /// at process exit while still swapped out.
    pub fn drop_slot(&self, slot: SwapSlot) {
        self.bitmap.lock().used[slot.0 as usize] = false;
    }

    /// Number of slots currently in use, for test assertions and
    /// diagnostics.
    #[must_use]
    pub fn used_count(&self) -> usize {
        self.bitmap.lock().used.iter().filter(|used| **used).count()
    }
}

#[cfg(test)]
mod tests {
    use super::{MemBlockDevice, SwapStore, PAGE_SIZE};
    use crate::vm::error::VmError;

    #[test]
    fn round_trip_preserves_bytes() {
        let store = SwapStore::new(MemBlockDevice::new(2));
        let mut page = [0_u8; PAGE_SIZE];
        page[0] = 7;
        page[PAGE_SIZE - 1] = 9;

        let slot = store.swap_out(&page).expect("swap out");
        assert_eq!(store.used_count(), 1);

        let mut restored = [0_u8; PAGE_SIZE];
        store.swap_in(slot, &mut restored);
        assert_eq!(restored, page);
        assert_eq!(store.used_count(), 0);
    }

    #[test]
    fn exhausted_store_reports_swap_full() {
        let store = SwapStore::new(MemBlockDevice::new(1));
        let page = [0_u8; PAGE_SIZE];
        store.swap_out(&page).expect("first slot succeeds");
        let err = store.swap_out(&page).expect_err("store should be full");
        assert_eq!(err, VmError::SwapFull);
    }
}
