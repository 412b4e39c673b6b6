//! The hardware page-table collaborator.
//!
//! `PageDirectory` abstracts over one process's page tables: install a
//! mapping, tear one down, and read/clear the hardware accessed and dirty
//! bits the eviction policy depends on. The production implementation
//! wraps the kernel's existing `x86_64::structures::paging` usage (see
//! `memory::init` / `userspace::process::map_user_binary`); tests use a
//! plain map so the fault resolver and frame manager can be exercised
//! without real page tables.

use alloc::collections::BTreeMap;

use x86_64::{
    structures::paging::{
        mapper::{MappedFrame, TranslateResult},
        Mapper, Page, PageTableFlags, PhysFrame, Size4KiB, Translate,
    },
    PhysAddr, VirtAddr,
};

use super::UserPage;

/// Hardware page-table operations the VM core needs from a single address
/// space. Implementors must be `Send` so a frame's owners, which may span
/// several address spaces, can be reached from the frame manager's lock.
pub trait PageDirectory: Send {
    /// Installs `upage -> phys` with the given permission. Overwrites any
    /// existing mapping for `upage`.
    fn map(&mut self, upage: UserPage, phys: u64, writable: bool);

    /// Removes the mapping for `upage`, if any.
    fn unmap(&mut self, upage: UserPage);

    /// Returns the physical address `upage` currently maps to, if resident.
    fn translate(&self, upage: UserPage) -> Option<u64>;

    /// Reads the hardware accessed bit for `upage`. A non-resident page is
    /// reported as not accessed.
    fn is_accessed(&self, upage: UserPage) -> bool;

    /// Clears the hardware accessed bit for `upage`.
    fn clear_accessed(&mut self, upage: UserPage);

    /// Reads the hardware dirty bit for `upage`. A non-resident page is
    /// reported as not dirty.
    fn is_dirty(&self, upage: UserPage) -> bool;

    /// Clears the hardware dirty bit for `upage`.
    fn clear_dirty(&mut self, upage: UserPage);

    /// Sets the hardware dirty bit for `upage`. Used only by swap-in, which
    /// must mark a restored page dirty so it is never mistaken for a clean,
    /// re-shareable one (§4.4 step 4).
    fn mark_dirty(&mut self, upage: UserPage);
}

/// Production `PageDirectory` backed by an `x86_64` page mapper.
///
/// `M` is generic over any `Mapper<Size4KiB>` implementation so this type
/// works with both the kernel's `OffsetPageTable` and a per-process mapper
/// once process isolation grows beyond a single address space.
pub struct X86PageDirectory<M: Mapper<Size4KiB> + Translate> {
    mapper: M,
}

impl<M: Mapper<Size4KiB> + Translate> X86PageDirectory<M> {
    /// Wraps an already-initialized mapper.
    #[must_use]
    pub const fn new(mapper: M) -> Self {
        Self { mapper }
    }

    fn page(upage: UserPage) -> Page<Size4KiB> {
        Page::containing_address(VirtAddr::new(upage.addr()))
    }
}

// SAFETY: the wrapped mapper is only ever used behind a `spin::Mutex` owned
// by a single `AddressSpace`; `Mapper` implementations carry no thread-local
// state of their own.
unsafe impl<M: Mapper<Size4KiB> + Translate> Send for X86PageDirectory<M> {}

impl<M: Mapper<Size4KiB> + Translate> PageDirectory for X86PageDirectory<M> {
    fn map(&mut self, upage: UserPage, phys: u64, writable: bool) {
        let page = Self::page(upage);
        let frame = PhysFrame::containing_address(PhysAddr::new(phys));
        let mut flags = PageTableFlags::PRESENT | PageTableFlags::USER_ACCESSIBLE;
        if writable {
            flags |= PageTableFlags::WRITABLE;
        }

        // SAFETY: the caller (frame manager) guarantees `phys` names a frame
        // it currently owns and that no other mapping of it already exists
        // in this address space at a conflicting permission.
        let result = unsafe { self.mapper.map_to_with_table_flags(page, frame, flags, flags, &mut DummyAllocator) };
        if let Ok(flush) = result {
            flush.flush();
        } else if self.mapper.translate_page(page).is_ok() {
            self.mapper.unmap(page).ok();
            // SAFETY: see above; we just removed the stale mapping.
            let retry = unsafe { self.mapper.map_to_with_table_flags(page, frame, flags, flags, &mut DummyAllocator) };
            if let Ok(flush) = retry {
                flush.flush();
            }
        }
    }

    fn unmap(&mut self, upage: UserPage) {
        let page = Self::page(upage);
        if let Ok((_, flush)) = self.mapper.unmap(page) {
            flush.flush();
        }
    }

    fn translate(&self, upage: UserPage) -> Option<u64> {
        self.mapper
            .translate_page(Self::page(upage))
            .ok()
            .map(|frame| frame.start_address().as_u64())
    }

    fn is_accessed(&self, upage: UserPage) -> bool {
        self.flags(upage)
            .is_some_and(|flags| flags.contains(PageTableFlags::ACCESSED))
    }

    fn clear_accessed(&mut self, upage: UserPage) {
        self.update_flags(upage, |flags| flags.remove(PageTableFlags::ACCESSED));
    }

    fn is_dirty(&self, upage: UserPage) -> bool {
        self.flags(upage)
            .is_some_and(|flags| flags.contains(PageTableFlags::DIRTY))
    }

    fn clear_dirty(&mut self, upage: UserPage) {
        self.update_flags(upage, |flags| flags.remove(PageTableFlags::DIRTY));
    }

    fn mark_dirty(&mut self, upage: UserPage) {
        self.update_flags(upage, |flags| flags.insert(PageTableFlags::DIRTY));
    }
}

impl<M: Mapper<Size4KiB> + Translate> X86PageDirectory<M> {
    fn flags(&self, upage: UserPage) -> Option<PageTableFlags> {
        match self.mapper.translate(VirtAddr::new(upage.addr())) {
            TranslateResult::Mapped {
                frame: MappedFrame::Size4KiB(_),
                flags,
                ..
            } => Some(flags),
            _ => None,
        }
    }

    fn update_flags(&mut self, upage: UserPage, update: impl FnOnce(&mut PageTableFlags)) {
        let Some(mut flags) = self.flags(upage) else {
            return;
        };
        update(&mut flags);

        // SAFETY: `flags` was read from the live mapping for `upage` and
        // only the accessed/dirty bits are toggled, so PRESENT/WRITABLE/
        // USER_ACCESSIBLE (and therefore the page's actual permissions)
        // are unchanged.
        if let Ok(flush) = unsafe { self.mapper.update_flags(Self::page(upage), flags) } {
            flush.flush();
        }
    }
}

/// `FrameAllocator` stub passed to `map_to_with_table_flags` when no
/// intermediate page-table frame needs allocating (the kernel's existing
/// page tables already cover the user range). Always returns `None`: if a
/// new intermediate table were genuinely required this would need the
/// kernel's real frame allocator instead.
struct DummyAllocator;

// SAFETY: `allocate_frame` never returns a frame, so this allocator can
// never hand out an invalid or already-used one.
unsafe impl x86_64::structures::paging::FrameAllocator<Size4KiB> for DummyAllocator {
    fn allocate_frame(&mut self) -> Option<PhysFrame<Size4KiB>> {
        None
    }
}

/// Test-only `PageDirectory`: a plain map from page to (physical address,
/// writable, accessed, dirty), with no real hardware underneath. Lets
/// `vm::fault`, `vm::frame`, and `vm::mmap` unit tests exercise every code
/// path deterministically.
#[derive(Default)]
pub struct FakePageDirectory {
    entries: BTreeMap<UserPage, FakeEntry>,
}

struct FakeEntry {
    phys: u64,
    writable: bool,
    accessed: bool,
    dirty: bool,
}

impl FakePageDirectory {
    /// Builds an empty page directory.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Test helper: marks `upage` as having been accessed by hardware,
    /// simulating a CPU access since the last `clear_accessed`.
    pub fn simulate_access(&mut self, upage: UserPage) {
        if let Some(entry) = self.entries.get_mut(&upage) {
            entry.accessed = true;
        }
    }

    /// Test helper: marks `upage` dirty, simulating a CPU write.
    pub fn simulate_write(&mut self, upage: UserPage) {
        if let Some(entry) = self.entries.get_mut(&upage) {
            entry.dirty = true;
        }
    }
}

impl PageDirectory for FakePageDirectory {
    fn map(&mut self, upage: UserPage, phys: u64, writable: bool) {
        self.entries.insert(
            upage,
            FakeEntry {
                phys,
                writable,
                accessed: false,
                dirty: false,
            },
        );
    }

    fn unmap(&mut self, upage: UserPage) {
        self.entries.remove(&upage);
    }

    fn translate(&self, upage: UserPage) -> Option<u64> {
        self.entries.get(&upage).map(|entry| entry.phys)
    }

    fn is_accessed(&self, upage: UserPage) -> bool {
        self.entries.get(&upage).is_some_and(|entry| entry.accessed)
    }

    fn clear_accessed(&mut self, upage: UserPage) {
        if let Some(entry) = self.entries.get_mut(&upage) {
            entry.accessed = false;
        }
    }

    fn is_dirty(&self, upage: UserPage) -> bool {
        self.entries.get(&upage).is_some_and(|entry| entry.dirty)
    }

    fn clear_dirty(&mut self, upage: UserPage) {
        if let Some(entry) = self.entries.get_mut(&upage) {
            entry.dirty = false;
        }
    }

    fn mark_dirty(&mut self, upage: UserPage) {
        if let Some(entry) = self.entries.get_mut(&upage) {
            entry.dirty = true;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{FakePageDirectory, PageDirectory};
    use crate::vm::UserPage;

    #[test]
    fn map_then_translate() {
        let mut dir = FakePageDirectory::new();
        let page = UserPage::containing(0x40_0000);
        dir.map(page, 0x1234_000, true);
        assert_eq!(dir.translate(page), Some(0x1234_000));
    }

    #[test]
    fn unmap_clears_translation() {
        let mut dir = FakePageDirectory::new();
        let page = UserPage::containing(0x40_0000);
        dir.map(page, 0x1000, false);
        dir.unmap(page);
        assert_eq!(dir.translate(page), None);
    }

    #[test]
    fn accessed_and_dirty_bits_round_trip() {
        let mut dir = FakePageDirectory::new();
        let page = UserPage::containing(0x40_0000);
        dir.map(page, 0x1000, true);
        assert!(!dir.is_accessed(page));
        dir.simulate_access(page);
        assert!(dir.is_accessed(page));
        dir.clear_accessed(page);
        assert!(!dir.is_accessed(page));

        dir.simulate_write(page);
        assert!(dir.is_dirty(page));
        dir.clear_dirty(page);
        assert!(!dir.is_dirty(page));
    }
}
