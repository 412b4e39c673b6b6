//! Supplemental page table: per-process record of where a user page's data
//! lives when it is not (or was not) resident.

use alloc::collections::BTreeMap;
use alloc::vec::Vec;

use super::swap::SwapSlot;
use super::{FrameId, UserPage};

/// Where an SPT entry's data comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Location {
    /// Backed by a range of the process's executable file.
    File,
    /// Backed by nothing; the page reads as all zero until first touched.
    Zero,
    /// Currently written out to the swap store.
    Swap,
    /// A user stack page, grown on demand.
    Stack,
}

/// One page's backing-store description.
#[derive(Debug, Clone)]
pub struct SptEntry {
    upage: UserPage,
    location: Location,
    /// Location before the most recent swap-out, so swap-in can restore it.
    location_prev: Option<Location>,
    writable: bool,
    /// Byte offset into the executable file (`Location::File` only).
    file_offset: u64,
    /// Bytes to read from the file; the remainder of the page is
    /// zero-filled (`Location::File` only).
    read_bytes: u64,
    /// Slot holding this page's data while `location == Location::Swap`.
    swap_slot: Option<SwapSlot>,
    /// The frame currently backing this page, while it is resident
    /// (`location != Location::Swap`). Lets `Spt::destroy` hand every
    /// still-owned frame back to the frame manager at process exit.
    resident_frame: Option<FrameId>,
}

impl SptEntry {
    /// Builds a `File`-backed entry.
    #[must_use]
    pub const fn file(upage: UserPage, writable: bool, file_offset: u64, read_bytes: u64) -> Self {
        Self {
            upage,
            location: Location::File,
            location_prev: None,
            writable,
            file_offset,
            read_bytes,
            swap_slot: None,
            resident_frame: None,
        }
    }

    /// Builds a `Zero`-backed entry.
    #[must_use]
    pub const fn zero(upage: UserPage, writable: bool) -> Self {
        Self {
            upage,
            location: Location::Zero,
            location_prev: None,
            writable,
            file_offset: 0,
            read_bytes: 0,
            swap_slot: None,
            resident_frame: None,
        }
    }

    /// Builds a `Stack` entry, always writable.
    #[must_use]
    pub const fn stack(upage: UserPage) -> Self {
        Self {
            upage,
            location: Location::Stack,
            location_prev: None,
            writable: true,
            file_offset: 0,
            read_bytes: 0,
            swap_slot: None,
            resident_frame: None,
        }
    }

    /// The page this entry describes.
    #[must_use]
    pub const fn upage(&self) -> UserPage {
        self.upage
    }

    /// Where the page's data currently lives.
    #[must_use]
    pub const fn location(&self) -> Location {
        self.location
    }

    /// Whether writes to this page are permitted.
    #[must_use]
    pub const fn writable(&self) -> bool {
        self.writable
    }

    /// Byte offset into the executable file.
    #[must_use]
    pub const fn file_offset(&self) -> u64 {
        self.file_offset
    }

    /// Bytes to read from the file before zero-filling the rest of the page.
    #[must_use]
    pub const fn read_bytes(&self) -> u64 {
        self.read_bytes
    }

    /// The slot holding this page while swapped out.
    #[must_use]
    pub const fn swap_slot(&self) -> Option<SwapSlot> {
        self.swap_slot
    }

    /// The location this entry had before its most recent swap-out, if any.
    #[must_use]
    pub const fn location_prev(&self) -> Option<Location> {
        self.location_prev
    }

    /// The frame currently backing this page, if resident.
    #[must_use]
    pub const fn resident_frame(&self) -> Option<FrameId> {
        self.resident_frame
    }

    /// Records which frame now backs this (resident) page.
    pub fn mark_resident(&mut self, frame: FrameId) {
        self.resident_frame = Some(frame);
    }

    /// Records a swap-out: remembers the prior location, switches to
    /// `Swap`, and records the slot. The page is no longer resident.
    pub fn mark_swapped_out(&mut self, slot: SwapSlot) {
        self.location_prev = Some(self.location);
        self.location = Location::Swap;
        self.swap_slot = Some(slot);
        self.resident_frame = None;
    }

    /// Records a swap-in: restores the location the entry had before it was
    /// swapped out and drops the slot reference (the caller has already
    /// released the slot itself). The caller must still record the
    /// restored frame with [`SptEntry::mark_resident`].
    pub fn mark_swapped_in(&mut self) {
        if let Some(previous) = self.location_prev.take() {
            self.location = previous;
        }
        self.swap_slot = None;
    }

    /// Merges a second observation of the same page, as happens when a
    /// segment loader's later `PT_LOAD` entry overlays a page an earlier
    /// one already claimed. The more permissive `writable` wins.
    pub fn merge_more_permissive(&mut self, incoming: &Self) {
        self.writable = self.writable || incoming.writable;
    }
}

/// Failure returned by [`Spt::insert`] when the key is already present.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DuplicateKey;

/// A per-process supplemental page table.
#[derive(Default)]
pub struct Spt {
    entries: BTreeMap<UserPage, SptEntry>,
}

impl Spt {
    /// Builds an empty table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts `entry`, failing if its page is already present.
    ///
    /// # Errors
    /// Returns [`DuplicateKey`] if an entry for this page already exists;
    /// the caller should use [`Spt::update`] instead.
    pub fn insert(&mut self, entry: SptEntry) -> Result<(), DuplicateKey> {
        if self.entries.contains_key(&entry.upage) {
            return Err(DuplicateKey);
        }
        self.entries.insert(entry.upage, entry);
        Ok(())
    }

    /// Looks up the entry for `upage`.
    #[must_use]
    pub fn find(&self, upage: UserPage) -> Option<&SptEntry> {
        self.entries.get(&upage)
    }

    /// Looks up a mutable entry for `upage`.
    pub fn find_mut(&mut self, upage: UserPage) -> Option<&mut SptEntry> {
        self.entries.get_mut(&upage)
    }

    /// Whether an entry for `upage` exists.
    #[must_use]
    pub fn contains(&self, upage: UserPage) -> bool {
        self.entries.contains_key(&upage)
    }

    /// Merges `incoming` into the existing entry for its page (more
    /// permissive `writable` wins), or inserts it fresh if absent.
    pub fn update(&mut self, incoming: SptEntry) {
        if let Some(existing) = self.entries.get_mut(&incoming.upage) {
            existing.merge_more_permissive(&incoming);
        } else {
            self.entries.insert(incoming.upage, incoming);
        }
    }

    /// Removes the entry for `upage`, if present.
    pub fn remove(&mut self, upage: UserPage) -> Option<SptEntry> {
        self.entries.remove(&upage)
    }

    /// Called at process exit: drains every entry, returning the swap slots
    /// still held by entries in `Location::Swap`, and the `(upage, frame)`
    /// pairs still resident under a non-mmap entry, so the caller can
    /// release the slots on the swap store and detach the frames from the
    /// frame manager.
    pub fn destroy(&mut self) -> ReleasedResources {
        let swap_slots = self.entries.values().filter_map(SptEntry::swap_slot).collect();
        let frames = self
            .entries
            .values()
            .filter_map(|entry| entry.resident_frame().map(|frame| (entry.upage(), frame)))
            .collect();
        self.entries.clear();
        ReleasedResources { swap_slots, frames }
    }
}

/// What a destroyed [`Spt`] hands back to the caller for release: swap slots
/// still held by `SWAP` entries, and frames still resident under a
/// non-mmap-backed entry.
#[derive(Debug, Default)]
pub struct ReleasedResources {
    /// Swap slots to release on the swap store.
    pub swap_slots: Vec<SwapSlot>,
    /// `(upage, frame)` pairs to detach from the frame manager.
    pub frames: Vec<(UserPage, FrameId)>,
}

#[cfg(test)]
mod tests {
    use super::{Location, Spt, SptEntry};
    use crate::vm::UserPage;

    fn page(addr: u64) -> UserPage {
        UserPage::containing(addr)
    }

    #[test]
    fn insert_rejects_duplicate() {
        let mut spt = Spt::new();
        let upage = page(0x40_0000);
        spt.insert(SptEntry::zero(upage, true)).expect("first insert");
        assert!(spt.insert(SptEntry::zero(upage, true)).is_err());
    }

    #[test]
    fn update_merges_more_permissive_writable() {
        let mut spt = Spt::new();
        let upage = page(0x40_0000);
        spt.insert(SptEntry::file(upage, false, 0, 4096)).expect("insert");
        spt.update(SptEntry::file(upage, true, 0, 4096));

        let entry = spt.find(upage).expect("entry present");
        assert!(entry.writable());
    }

    #[test]
    fn destroy_collects_swap_slots() {
        use crate::vm::swap::{MemBlockDevice, SwapStore};

        let mut spt = Spt::new();
        let upage = page(0x40_0000);
        let mut entry = SptEntry::zero(upage, true);

        let store = SwapStore::new(MemBlockDevice::new(1));
        let slot = store.swap_out(&[0_u8; 4096]).expect("swap out");
        entry.mark_swapped_out(slot);
        spt.insert(entry).expect("insert");

        assert_eq!(spt.find(upage).expect("entry").location(), Location::Swap);

        let released = spt.destroy();
        assert_eq!(released.swap_slots.len(), 1);
        assert!(released.frames.is_empty(), "a swapped-out entry holds no frame");
        assert!(spt.find(upage).is_none());
    }

    #[test]
    fn destroy_collects_resident_frames() {
        use crate::vm::FrameId;

        let mut spt = Spt::new();
        let upage = page(0x40_0000);
        let frame = FrameId(0);
        let mut entry = SptEntry::zero(upage, true);
        entry.mark_resident(frame);
        spt.insert(entry).expect("insert");

        let released = spt.destroy();
        assert!(released.swap_slots.is_empty());
        assert_eq!(released.frames, alloc::vec![(upage, frame)]);
    }
}
