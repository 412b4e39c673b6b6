//! The frame manager: owns the physical frame pool, the global frame
//! table, and the second-chance eviction policy.
//!
//! A single lock (`FrameManager::frames`, playing the role of `frame_lock`)
//! guards the frame table, the FIFO eviction list, and the eviction cursor
//! together, matching the concurrency model's requirement that an eviction
//! transition flips page-table presence, owner registration, and SPT
//! location atomically. Re-entrancy (the frame manager may need to evict
//! while already holding its own lock) is resolved the Rust way: the lock
//! is taken once at each public entry point and threaded through as a
//! `&mut` reference to internal helpers rather than re-acquired — see
//! DESIGN.md.

use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use alloc::vec::Vec;

use spin::Mutex;

use super::error::VmError;
use super::pagedir::PageDirectory;
use super::pool::FramePool;
use super::sharing::{ShareKey, SharingRegistry};
use super::spt::Spt;
use super::swap::{BlockDevice, SwapStore};
use super::{FrameId, Pid, UserPage, PAGE_SIZE};

/// One (process, page) pair that aliases a frame. Owns handles back to the
/// process's page directory and SPT so the frame manager can reach into
/// another address space during eviction, the way Pintos's `struct owner`
/// holds a direct `struct thread *` rather than a separate lookup table.
#[derive(Clone)]
pub struct Owner {
    /// Opaque process identity, used only for equality and diagnostics.
    pub pid: Pid,
    pub upage: UserPage,
    pub page_dir: Arc<Mutex<dyn PageDirectory>>,
    pub spt: Arc<Mutex<Spt>>,
}

impl PartialEq for Owner {
    fn eq(&self, other: &Self) -> bool {
        self.pid == other.pid && self.upage == other.upage
    }
}

impl Eq for Owner {}

struct FrameEntry {
    owners: Vec<Owner>,
    share_key: Option<ShareKey>,
    /// Whether this frame's single owner may write to it. Always `false`
    /// while `share_key.is_some()` (invariant 3).
    writable: bool,
    /// Mmap-backed frames are never chosen as an eviction victim (§4.2);
    /// write-back happens only on explicit unmap or process exit.
    pinned: bool,
}

struct FrameTable {
    pool: FramePool,
    entries: BTreeMap<FrameId, FrameEntry>,
    fifo: Vec<FrameId>,
    cursor: usize,
    sharing: SharingRegistry,
}

/// Owns the user frame pool and drives second-chance eviction. Kernel-pool
/// allocations (heap, page tables) go through `allocator`/`memory` instead
/// and never evict; this type only manages the user pool.
pub struct FrameManager<D: BlockDevice> {
    frames: Mutex<FrameTable>,
    swap: SwapStore<D>,
}

impl<D: BlockDevice> FrameManager<D> {
    /// Builds a frame manager over `user_frame_count` frames and a swap
    /// store backed by `device`.
    #[must_use]
    pub fn new(user_frame_count: usize, device: D) -> Self {
        Self {
            frames: Mutex::new(FrameTable {
                pool: FramePool::new(user_frame_count),
                entries: BTreeMap::new(),
                fifo: Vec::new(),
                cursor: 0,
                sharing: SharingRegistry::new(),
            }),
            swap: SwapStore::new(device),
        }
    }

    /// Allocates a user frame for `owner`, evicting a victim if the pool is
    /// exhausted. `writable` and `zero` describe the caller's intended use;
    /// `writable` is recorded for later eviction-policy decisions.
    ///
    /// # Errors
    /// Returns [`VmError::OutOfUserMemory`] if eviction could not free a
    /// frame (a full swap store surfaces through the same error, per §7).
    pub fn get_user_frame(
        &self,
        owner: Owner,
        writable: bool,
        zero: bool,
    ) -> Result<FrameId, VmError> {
        let mut table = self.frames.lock();
        let frame = match table.pool.allocate(zero) {
            Some(frame) => frame,
            None => self.evict(&mut table)?,
        };
        table.entries.insert(
            frame,
            FrameEntry {
                owners: alloc::vec![owner],
                share_key: None,
                writable,
                pinned: false,
            },
        );
        table.fifo.push(frame);
        Ok(frame)
    }

    /// Allocates a frame for an mmap page. Identical to
    /// [`FrameManager::get_user_frame`] except the frame is pinned: the
    /// eviction scan skips it entirely, since mmap write-back only happens
    /// on explicit unmap or process exit (§4.2, §4.5).
    ///
    /// # Errors
    /// Returns [`VmError::OutOfUserMemory`] if eviction could not free a
    /// (non-pinned) frame.
    pub fn get_pinned_frame(&self, owner: Owner) -> Result<FrameId, VmError> {
        let mut table = self.frames.lock();
        let frame = match table.pool.allocate(false) {
            Some(frame) => frame,
            None => self.evict(&mut table)?,
        };
        table.entries.insert(
            frame,
            FrameEntry {
                owners: alloc::vec![owner],
                share_key: None,
                writable: true,
                pinned: true,
            },
        );
        table.fifo.push(frame);
        Ok(frame)
    }

    /// Opaque physical-address tag identifying `frame`, passed to
    /// [`PageDirectory::map`]. `FramePool` owns its frames' backing bytes
    /// directly rather than indexing a real offset-mapped physical range
    /// (see `pool::FramePool`), so this is a stable per-frame identity
    /// rather than a literal physical address.
    #[must_use]
    pub fn frame_address(&self, frame: FrameId) -> u64 {
        frame.0 as u64 * PAGE_SIZE as u64
    }

    /// Registers `owner` as an additional reader of an already-resident
    /// shared frame (the sharing path in `load_page`).
    pub fn attach_owner(&self, frame: FrameId, owner: Owner) {
        let mut table = self.frames.lock();
        if let Some(entry) = table.entries.get_mut(&frame) {
            entry.owners.push(owner);
        }
    }

    /// Looks up a shared frame by file identity.
    #[must_use]
    pub fn lookup_shared(&self, file_name: &str, page_index: u64) -> Option<FrameId> {
        self.frames.lock().sharing.lookup(file_name, page_index)
    }

    /// Registers a freshly loaded frame as shared for `(file_name,
    /// page_index)` and marks it read-only (invariant 3).
    pub fn share(&self, frame: FrameId, file_name: &str, page_index: u64) {
        let mut table = self.frames.lock();
        let key = table.sharing.insert(file_name, page_index, frame);
        if let Some(entry) = table.entries.get_mut(&frame) {
            entry.share_key = Some(key);
            entry.writable = false;
        }
    }

    /// Removes `owner` from `frame`'s owner set. The caller must already
    /// have torn down its own page-table mapping. If the set becomes
    /// empty, any sharing registration is removed and the frame returns to
    /// the pool.
    pub fn detach_owner(&self, frame: FrameId, pid: Pid, upage: UserPage) {
        let mut table = self.frames.lock();
        let Some(entry) = table.entries.get_mut(&frame) else {
            return;
        };
        entry.owners.retain(|owner| !(owner.pid == pid && owner.upage == upage));
        if entry.owners.is_empty() {
            let share_key = entry.share_key;
            table.entries.remove(&frame);
            table.fifo.retain(|candidate| *candidate != frame);
            if let Some(key) = share_key {
                table.sharing.remove(key);
            }
            table.pool.free(frame);
        }
    }

    /// Runs a closure with mutable access to a frame's bytes, for loaders
    /// writing file/zero content or copying swapped-in data.
    pub fn with_bytes_mut<R>(&self, frame: FrameId, action: impl FnOnce(&mut [u8; PAGE_SIZE]) -> R) -> R {
        let mut table = self.frames.lock();
        action(table.pool.bytes_mut(frame))
    }

    /// The swap store backing this frame manager, for the page-fault
    /// resolver's swap-in path.
    #[must_use]
    pub const fn swap(&self) -> &SwapStore<D> {
        &self.swap
    }

    /// Number of free frames remaining in the user pool, for diagnostics
    /// and tests.
    #[must_use]
    pub fn free_count(&self) -> usize {
        self.frames.lock().pool.free_count()
    }

    /// Runs second-chance eviction to free exactly one frame, returning it
    /// ready for the caller to claim. `table` is already locked by the
    /// caller (`get_user_frame`), so this never re-acquires `frame_lock`.
    fn evict(&self, table: &mut FrameTable) -> Result<FrameId, VmError> {
        if table.fifo.is_empty() {
            return Err(VmError::OutOfUserMemory);
        }

        // Standard second-chance proof: at most two full passes are needed
        // before every frame has either been skipped once (access bit
        // cleared) or selected.
        let max_passes = 2 * table.fifo.len();
        for _ in 0..max_passes {
            if table.cursor >= table.fifo.len() {
                table.cursor = 0;
            }
            let frame = table.fifo[table.cursor];
            let entry = table.entries.get(&frame).expect("fifo/table consistency");
            if entry.pinned {
                table.cursor += 1;
                continue;
            }
            let accessed = entry
                .owners
                .iter()
                .any(|owner| owner.page_dir.lock().is_accessed(owner.upage));

            if accessed {
                for owner in &entry.owners {
                    owner.page_dir.lock().clear_accessed(owner.upage);
                }
                table.cursor += 1;
                continue;
            }

            return self.evict_victim(table, frame);
        }

        Err(VmError::OutOfUserMemory)
    }

    /// Detaches (and, if dirty and writable, swaps out) the chosen victim,
    /// removes its table/fifo/sharing bookkeeping, and returns the
    /// now-free frame to the caller. On a swap-out, the victim's own SPT
    /// entry is updated here (via its owner's `spt` handle) to transition
    /// to `Location::Swap`, since this is the only point that holds both
    /// `frame_lock` and the fact that a swap-out happened.
    fn evict_victim(&self, table: &mut FrameTable, frame: FrameId) -> Result<FrameId, VmError> {
        let entry = table.entries.remove(&frame).expect("victim must be in the table");
        table.fifo.retain(|candidate| *candidate != frame);
        if table.cursor > 0 && table.cursor <= table.fifo.len() {
            table.cursor -= 1;
        }
        if let Some(key) = entry.share_key {
            table.sharing.remove(key);
        }

        let dirty_single_owner_writable = entry.share_key.is_none()
            && entry.writable
            && entry.owners.len() == 1
            && entry.owners[0].page_dir.lock().is_dirty(entry.owners[0].upage);

        if dirty_single_owner_writable {
            let bytes = *table.pool.bytes(frame);
            let slot = self.swap.swap_out(&bytes)?;
            let owner = &entry.owners[0];
            owner.page_dir.lock().unmap(owner.upage);
            if let Some(spt_entry) = owner.spt.lock().find_mut(owner.upage) {
                spt_entry.mark_swapped_out(slot);
            }
        } else {
            for owner in &entry.owners {
                owner.page_dir.lock().unmap(owner.upage);
            }
        }

        table.pool.free(frame);
        Ok(frame)
    }
}

#[cfg(test)]
mod tests {
    use alloc::sync::Arc;

    use spin::Mutex;

    use super::{FrameManager, Owner};
    use crate::vm::pagedir::FakePageDirectory;
    use crate::vm::spt::Spt;
    use crate::vm::swap::MemBlockDevice;
    use crate::vm::UserPage;

    fn owner(pid: u64, addr: u64, dir: &Arc<Mutex<FakePageDirectory>>, spt: &Arc<Mutex<Spt>>) -> Owner {
        Owner {
            pid,
            upage: UserPage::containing(addr),
            page_dir: dir.clone(),
            spt: spt.clone(),
        }
    }

    #[test]
    fn allocation_registers_single_owner_and_is_freed_on_detach() {
        let manager = FrameManager::new(2, MemBlockDevice::new(2));
        let dir: Arc<Mutex<FakePageDirectory>> = Arc::new(Mutex::new(FakePageDirectory::new()));
        let spt = Arc::new(Mutex::new(Spt::new()));
        let o = owner(1, 0x40_0000, &dir, &spt);
        let frame = manager.get_user_frame(o.clone(), true, true).expect("allocate");
        assert_eq!(manager.free_count(), 1);

        manager.detach_owner(frame, o.pid, o.upage);
        assert_eq!(manager.free_count(), 2);
    }

    #[test]
    fn eviction_recycles_frame_when_pool_exhausted() {
        let manager = FrameManager::new(1, MemBlockDevice::new(1));
        let dir_a: Arc<Mutex<FakePageDirectory>> = Arc::new(Mutex::new(FakePageDirectory::new()));
        let spt_a = Arc::new(Mutex::new(Spt::new()));
        let dir_b: Arc<Mutex<FakePageDirectory>> = Arc::new(Mutex::new(FakePageDirectory::new()));
        let spt_b = Arc::new(Mutex::new(Spt::new()));

        let a = owner(1, 0x40_0000, &dir_a, &spt_a);
        let frame_a = manager.get_user_frame(a.clone(), false, true).expect("allocate a");
        dir_a.lock().map(a.upage, 0, false);

        let b = owner(2, 0x40_0000, &dir_b, &spt_b);
        // Pool is exhausted: this must evict `a`'s frame (clean, read-only,
        // single owner) rather than fail.
        let frame_b = manager.get_user_frame(b.clone(), false, true).expect("allocate b via eviction");
        assert_eq!(frame_a, frame_b, "the single free frame should be recycled");
        assert!(dir_a.lock().translate(a.upage).is_none(), "evicted owner must be unmapped");
    }

    #[test]
    fn dirty_writable_single_owner_eviction_swaps_out_and_updates_spt() {
        use crate::vm::spt::{Location, SptEntry};

        let manager = FrameManager::new(1, MemBlockDevice::new(1));
        let dir_a: Arc<Mutex<FakePageDirectory>> = Arc::new(Mutex::new(FakePageDirectory::new()));
        let spt_a = Arc::new(Mutex::new(Spt::new()));
        let a = owner(1, 0x40_0000, &dir_a, &spt_a);
        spt_a.lock().insert(SptEntry::stack(a.upage)).expect("insert spt entry");

        let frame = manager.get_user_frame(a.clone(), true, true).expect("allocate a");
        dir_a.lock().map(a.upage, 0, true);
        dir_a.lock().simulate_write(a.upage);

        let dir_b: Arc<Mutex<FakePageDirectory>> = Arc::new(Mutex::new(FakePageDirectory::new()));
        let spt_b = Arc::new(Mutex::new(Spt::new()));
        let b = owner(2, 0x50_0000, &dir_b, &spt_b);
        let frame_b = manager.get_user_frame(b, true, true).expect("eviction frees the dirty frame");
        assert_eq!(frame, frame_b);

        let spt_guard = spt_a.lock();
        let entry = spt_guard.find(a.upage).expect("spt entry remains");
        assert_eq!(entry.location(), Location::Swap);
        assert!(entry.swap_slot().is_some());
    }

    #[test]
    fn shared_frame_eviction_detaches_every_owner() {
        let manager = FrameManager::new(1, MemBlockDevice::new(1));
        let dir_a: Arc<Mutex<FakePageDirectory>> = Arc::new(Mutex::new(FakePageDirectory::new()));
        let spt_a = Arc::new(Mutex::new(Spt::new()));
        let dir_b: Arc<Mutex<FakePageDirectory>> = Arc::new(Mutex::new(FakePageDirectory::new()));
        let spt_b = Arc::new(Mutex::new(Spt::new()));

        let a = owner(1, 0x40_0000, &dir_a, &spt_a);
        let frame = manager.get_user_frame(a.clone(), false, true).expect("allocate");
        manager.share(frame, "hello", 0);

        let b = owner(2, 0x40_0000, &dir_b, &spt_b);
        manager.attach_owner(frame, b.clone());
        dir_a.lock().map(a.upage, 0, false);
        dir_b.lock().map(b.upage, 0, false);

        let c_dir: Arc<Mutex<FakePageDirectory>> = Arc::new(Mutex::new(FakePageDirectory::new()));
        let c_spt = Arc::new(Mutex::new(Spt::new()));
        let c = owner(3, 0x60_0000, &c_dir, &c_spt);
        manager.get_user_frame(c, false, true).expect("eviction frees the shared frame");

        assert!(dir_a.lock().translate(a.upage).is_none(), "owner a must be detached");
        assert!(dir_b.lock().translate(b.upage).is_none(), "owner b must be detached");
        assert_eq!(manager.lookup_shared("hello", 0), None, "sharing entry must be removed");
    }

    #[test]
    fn pinned_frame_is_never_selected_as_eviction_victim() {
        let manager = FrameManager::new(1, MemBlockDevice::new(1));
        let dir_a: Arc<Mutex<FakePageDirectory>> = Arc::new(Mutex::new(FakePageDirectory::new()));
        let spt_a = Arc::new(Mutex::new(Spt::new()));
        let a = owner(1, 0x40_0000, &dir_a, &spt_a);
        manager.get_pinned_frame(a).expect("pinned allocation");

        let dir_b: Arc<Mutex<FakePageDirectory>> = Arc::new(Mutex::new(FakePageDirectory::new()));
        let spt_b = Arc::new(Mutex::new(Spt::new()));
        let b = owner(2, 0x50_0000, &dir_b, &spt_b);
        let err = manager.get_user_frame(b, true, true).expect_err("only frame is pinned");
        assert_eq!(err, crate::vm::error::VmError::OutOfUserMemory);
    }
}
