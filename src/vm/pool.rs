//! Bitmap-backed physical frame pools.
//!
//! Mirrors the teacher's own frame-allocation style (`memory::BootInfoFrameAllocator`
//! stepping over a bootloader memory map) but partitioned into a kernel pool
//! and a user pool the way the source kernel's `palloc` does, each guarded by
//! its own free-bitmap. `FramePool` also owns the backing byte storage for
//! its frames, so the rest of `vm` never needs to know whether a frame's
//! bytes live in a physical-memory-offset-mapped range (production) or a
//! heap-allocated buffer (tests) — both are addressed the same way, through
//! `FrameId`.

use alloc::vec;
use alloc::vec::Vec;

use super::{FrameId, PAGE_SIZE};

/// A pool of same-sized physical frames, each either free or allocated, with
/// a backing byte buffer of `PAGE_SIZE`-sized slots.
pub struct FramePool {
    free: Vec<bool>,
    storage: Vec<[u8; PAGE_SIZE]>,
}

impl FramePool {
    /// Builds a pool of `frame_count` frames, all initially free and zeroed.
    #[must_use]
    pub fn new(frame_count: usize) -> Self {
        Self {
            free: vec![true; frame_count],
            storage: vec![[0_u8; PAGE_SIZE]; frame_count],
        }
    }

    /// Total number of frames in this pool.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.free.len()
    }

    /// Number of frames currently free.
    #[must_use]
    pub fn free_count(&self) -> usize {
        self.free.iter().filter(|free| **free).count()
    }

    /// Claims the first free frame, zeroing it if requested. Returns `None`
    /// if the pool is exhausted.
    pub fn allocate(&mut self, zero: bool) -> Option<FrameId> {
        let index = self.free.iter().position(|free| *free)?;
        self.free[index] = false;
        if zero {
            self.storage[index] = [0_u8; PAGE_SIZE];
        }
        Some(FrameId(index))
    }

    /// Returns `frame` to the free set. The caller must have already
    /// detached every owner and removed any sharing registration.
    pub fn free(&mut self, frame: FrameId) {
        self.free[frame.0] = true;
    }

    /// Read-only access to a frame's bytes.
    #[must_use]
    pub fn bytes(&self, frame: FrameId) -> &[u8; PAGE_SIZE] {
        &self.storage[frame.0]
    }

    /// Mutable access to a frame's bytes.
    pub fn bytes_mut(&mut self, frame: FrameId) -> &mut [u8; PAGE_SIZE] {
        &mut self.storage[frame.0]
    }
}

#[cfg(test)]
mod tests {
    use super::FramePool;

    #[test]
    fn allocate_exhausts_then_frees() {
        let mut pool = FramePool::new(2);
        let a = pool.allocate(false).expect("first allocation");
        let b = pool.allocate(false).expect("second allocation");
        assert!(pool.allocate(false).is_none(), "pool should be exhausted");

        pool.free(a);
        assert_eq!(pool.free_count(), 1);
        let c = pool.allocate(false).expect("reuse freed frame");
        assert_eq!(a, c);
        assert_ne!(b, c);
    }

    #[test]
    fn zeroed_allocation_clears_stale_bytes() {
        let mut pool = FramePool::new(1);
        let frame = pool.allocate(false).expect("allocation");
        pool.bytes_mut(frame)[0] = 0xAB;
        pool.free(frame);

        let frame = pool.allocate(true).expect("reuse");
        assert_eq!(pool.bytes(frame)[0], 0);
    }
}
