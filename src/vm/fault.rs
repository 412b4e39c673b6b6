//! Page-fault resolver.
//!
//! Called by the trap dispatcher with the faulting address, the write/user
//! bits from the CPU error code, the saved user stack pointer (if known),
//! and whether the faulting thread was inside a system call. Classifies the
//! fault and dispatches to the right backing store per §4.4.

use alloc::string::String;
use alloc::sync::Arc;

use spin::Mutex;

use super::error::VmError;
use super::file::ExecutableFile;
use super::frame::{FrameManager, Owner};
use super::mmap::MmapTable;
use super::pagedir::PageDirectory;
use super::spt::{Location, Spt, SptEntry};
use super::swap::BlockDevice;
use super::{Pid, UserPage, PAGE_SIZE, PHYS_BASE, STACK_MAX_SIZE, USER_VADDR_BASE};

fn is_user_address(addr: u64) -> bool {
    addr >= USER_VADDR_BASE && addr < PHYS_BASE
}

fn is_stack_growth(addr: u64, esp: u64, upage: UserPage) -> bool {
    let near_esp = addr >= esp || addr == esp.wrapping_sub(4) || addr == esp.wrapping_sub(32);
    near_esp && PHYS_BASE - upage.addr() <= STACK_MAX_SIZE
}

/// Step 7: a fault during a syscall does not kill the process, it fails the
/// syscall instead. Applies only to the two "kill the process" error kinds;
/// resource-exhaustion kinds (`OutOfUserMemory`/`SwapFull`) are unaffected.
fn disposition(err: VmError, in_syscall: bool) -> VmError {
    if in_syscall && matches!(err, VmError::BadUserAccess | VmError::ReadOnlyWrite) {
        VmError::KernelAccessFaultInSyscall
    } else {
        err
    }
}

/// Resolves one page fault. Returns `Ok(())` once the page is installed and
/// resumable; an `Err` tells the caller how to dispose of the fault per §7.
///
/// # Errors
/// See [`VmError`] for the kinds this can return and their disposition.
#[allow(clippy::too_many_arguments)]
pub fn resolve_fault<D: BlockDevice>(
    frames: &FrameManager<D>,
    pid: Pid,
    page_dir: &Arc<Mutex<dyn PageDirectory>>,
    spt: &Arc<Mutex<Spt>>,
    mmap: &Mutex<MmapTable>,
    file: &Arc<Mutex<dyn ExecutableFile + Send>>,
    addr: u64,
    is_write: bool,
    is_user: bool,
    esp: Option<u64>,
    in_syscall: bool,
) -> Result<(), VmError> {
    if is_user && !is_user_address(addr) {
        return Err(disposition(VmError::BadUserAccess, in_syscall));
    }

    let upage = UserPage::containing(addr);
    let hit = spt.lock().find(upage).cloned();

    if let Some(entry) = hit {
        if is_write && !entry.writable() {
            return Err(disposition(VmError::ReadOnlyWrite, in_syscall));
        }
        return match entry.location() {
            Location::File | Location::Zero => {
                load_page(frames, pid, page_dir, spt, file, &entry).map_err(|error| disposition(error, in_syscall))
            }
            Location::Swap => {
                swap_in_page(frames, pid, page_dir, spt, file, &entry).map_err(|error| disposition(error, in_syscall))
            }
            // Already resident; a second thread lost the race to install it.
            Location::Stack => Ok(()),
        };
    }

    if let Some((file_offset, mmap_file)) = mmap.lock().lookup(upage) {
        return load_mmap_page(frames, pid, page_dir, spt, mmap, upage, file_offset, &mmap_file)
            .map_err(|error| disposition(error, in_syscall));
    }

    if let Some(esp) = esp {
        if is_stack_growth(addr, esp, upage) {
            let owner = Owner {
                pid,
                upage,
                page_dir: page_dir.clone(),
                spt: spt.clone(),
            };
            let frame = frames.get_user_frame(owner, true, true)?;
            let phys = frames.frame_address(frame);
            page_dir.lock().map(upage, phys, true);
            let mut entry = SptEntry::stack(upage);
            entry.mark_resident(frame);
            spt.lock().insert(entry).ok();
            return Ok(());
        }
    }

    Err(disposition(VmError::BadUserAccess, in_syscall))
}

/// §4.4.1. Loads a `File`- or `Zero`-backed page. Read-only file pages are
/// shared across processes via the sharing registry; everything else gets
/// its own frame.
fn load_page<D: BlockDevice>(
    frames: &FrameManager<D>,
    pid: Pid,
    page_dir: &Arc<Mutex<dyn PageDirectory>>,
    spt: &Arc<Mutex<Spt>>,
    file: &Arc<Mutex<dyn ExecutableFile + Send>>,
    entry: &SptEntry,
) -> Result<(), VmError> {
    let upage = entry.upage();

    if entry.location() == Location::Zero {
        let owner = Owner {
            pid,
            upage,
            page_dir: page_dir.clone(),
            spt: spt.clone(),
        };
        let frame = frames.get_user_frame(owner, entry.writable(), true)?;
        let phys = frames.frame_address(frame);
        page_dir.lock().map(upage, phys, entry.writable());
        if let Some(spt_entry) = spt.lock().find_mut(upage) {
            spt_entry.mark_resident(frame);
        }
        return Ok(());
    }

    let page_index = entry.file_offset() / PAGE_SIZE as u64;
    let file_name = String::from(file.lock().name());

    if !entry.writable() {
        if let Some(shared_frame) = frames.lookup_shared(&file_name, page_index) {
            let owner = Owner {
                pid,
                upage,
                page_dir: page_dir.clone(),
                spt: spt.clone(),
            };
            frames.attach_owner(shared_frame, owner);
            let phys = frames.frame_address(shared_frame);
            page_dir.lock().map(upage, phys, false);
            if let Some(spt_entry) = spt.lock().find_mut(upage) {
                spt_entry.mark_resident(shared_frame);
            }
            return Ok(());
        }
    }

    let owner = Owner {
        pid,
        upage,
        page_dir: page_dir.clone(),
        spt: spt.clone(),
    };
    let frame = frames.get_user_frame(owner, entry.writable(), false)?;
    let read_bytes = entry.read_bytes() as usize;
    let file_offset = entry.file_offset();
    frames.with_bytes_mut(frame, |bytes| {
        let filled = file.lock().read_at(&mut bytes[..read_bytes], file_offset)?;
        for byte in &mut bytes[filled..] {
            *byte = 0;
        }
        Ok::<(), VmError>(())
    })?;

    let phys = frames.frame_address(frame);
    page_dir.lock().map(upage, phys, entry.writable());
    if !entry.writable() {
        frames.share(frame, &file_name, page_index);
    }
    if let Some(spt_entry) = spt.lock().find_mut(upage) {
        spt_entry.mark_resident(frame);
    }
    Ok(())
}

/// §4.4 step 4, `SWAP` case: reads the page back in and restores its prior
/// location. A restore whose prior location was a read-only file page is
/// sharing-eligible the same way a fresh `load_page` is: it first tries to
/// attach to an already-resident shared frame instead of reading its own
/// copy back from swap. Anything else is marked dirty so it is never
/// mistaken for a clean, re-shareable page.
fn swap_in_page<D: BlockDevice>(
    frames: &FrameManager<D>,
    pid: Pid,
    page_dir: &Arc<Mutex<dyn PageDirectory>>,
    spt: &Arc<Mutex<Spt>>,
    file: &Arc<Mutex<dyn ExecutableFile + Send>>,
    entry: &SptEntry,
) -> Result<(), VmError> {
    let upage = entry.upage();
    let slot = entry.swap_slot().ok_or(VmError::KernelInvariantViolation)?;
    let sharing_eligible = entry.location_prev() == Some(Location::File) && !entry.writable();

    if sharing_eligible {
        let page_index = entry.file_offset() / PAGE_SIZE as u64;
        let file_name = String::from(file.lock().name());
        if let Some(shared_frame) = frames.lookup_shared(&file_name, page_index) {
            let owner = Owner {
                pid,
                upage,
                page_dir: page_dir.clone(),
                spt: spt.clone(),
            };
            frames.attach_owner(shared_frame, owner);
            frames.swap().drop_slot(slot);
            let phys = frames.frame_address(shared_frame);
            page_dir.lock().map(upage, phys, false);
            if let Some(spt_entry) = spt.lock().find_mut(upage) {
                spt_entry.mark_swapped_in();
                spt_entry.mark_resident(shared_frame);
            }
            return Ok(());
        }
    }

    let owner = Owner {
        pid,
        upage,
        page_dir: page_dir.clone(),
        spt: spt.clone(),
    };
    let frame = frames.get_user_frame(owner, entry.writable(), false)?;
    frames.with_bytes_mut(frame, |bytes| frames.swap().swap_in(slot, bytes));

    let phys = frames.frame_address(frame);
    page_dir.lock().map(upage, phys, entry.writable());
    if sharing_eligible {
        let page_index = entry.file_offset() / PAGE_SIZE as u64;
        let file_name = String::from(file.lock().name());
        frames.share(frame, &file_name, page_index);
    } else {
        page_dir.lock().mark_dirty(upage);
    }
    if let Some(spt_entry) = spt.lock().find_mut(upage) {
        spt_entry.mark_swapped_in();
        spt_entry.mark_resident(frame);
    }
    Ok(())
}

/// §4.5 `load_mmap_page`: always a writable, pinned frame; never shared,
/// never an eviction victim.
#[allow(clippy::too_many_arguments)]
fn load_mmap_page<D: BlockDevice>(
    frames: &FrameManager<D>,
    pid: Pid,
    page_dir: &Arc<Mutex<dyn PageDirectory>>,
    spt: &Arc<Mutex<Spt>>,
    mmap: &Mutex<MmapTable>,
    upage: UserPage,
    file_offset: u64,
    file: &Arc<Mutex<dyn ExecutableFile + Send>>,
) -> Result<(), VmError> {
    let owner = Owner {
        pid,
        upage,
        page_dir: page_dir.clone(),
        spt: spt.clone(),
    };
    let frame = frames.get_pinned_frame(owner)?;
    frames.with_bytes_mut(frame, |bytes| {
        let filled = file.lock().read_at(bytes, file_offset)?;
        for byte in &mut bytes[filled..] {
            *byte = 0;
        }
        Ok::<(), VmError>(())
    })?;

    let phys = frames.frame_address(frame);
    page_dir.lock().map(upage, phys, true);
    mmap.lock().mark_resident(upage, frame);
    Ok(())
}

#[cfg(test)]
mod tests {
    use alloc::sync::Arc;
    use alloc::vec;

    use spin::Mutex;

    use super::resolve_fault;
    use crate::vm::file::MemFile;
    use crate::vm::frame::FrameManager;
    use crate::vm::mmap::MmapTable;
    use crate::vm::pagedir::{FakePageDirectory, PageDirectory};
    use crate::vm::spt::{Location, Spt, SptEntry};
    use crate::vm::swap::MemBlockDevice;
    use crate::vm::{UserPage, PAGE_SIZE, PHYS_BASE};

    struct Fixture {
        frames: FrameManager<MemBlockDevice>,
        dir_concrete: Arc<Mutex<FakePageDirectory>>,
        dir: Arc<Mutex<dyn PageDirectory>>,
        spt: Arc<Mutex<Spt>>,
        mmap: Mutex<MmapTable>,
        file: Arc<Mutex<dyn crate::vm::file::ExecutableFile + Send>>,
    }

    fn fixture(frame_count: usize, file_data: alloc::vec::Vec<u8>) -> Fixture {
        let dir_concrete = Arc::new(Mutex::new(FakePageDirectory::new()));
        let dir: Arc<Mutex<dyn PageDirectory>> = dir_concrete.clone();
        Fixture {
            frames: FrameManager::new(frame_count, MemBlockDevice::new(frame_count)),
            dir_concrete,
            dir,
            spt: Arc::new(Mutex::new(Spt::new())),
            mmap: Mutex::new(MmapTable::new()),
            file: Arc::new(Mutex::new(MemFile::new("prog", file_data))),
        }
    }

    #[test]
    fn zero_fill_hit_installs_a_zeroed_page() {
        let fx = fixture(1, vec![]);
        let upage = UserPage::containing(0x40_0000);
        fx.spt.lock().insert(SptEntry::zero(upage, true)).expect("insert");

        resolve_fault(&fx.frames, 1, &fx.dir, &fx.spt, &fx.mmap, &fx.file, upage.addr(), false, true, None, false)
            .expect("resolve");

        assert!(fx.dir.lock().translate(upage).is_some());
    }

    #[test]
    fn write_to_read_only_page_is_bad_access() {
        let fx = fixture(1, vec![]);
        let upage = UserPage::containing(0x40_0000);
        fx.spt.lock().insert(SptEntry::zero(upage, false)).expect("insert");

        let err = resolve_fault(&fx.frames, 1, &fx.dir, &fx.spt, &fx.mmap, &fx.file, upage.addr(), true, true, None, false)
            .expect_err("must fail");
        assert_eq!(err, crate::vm::error::VmError::ReadOnlyWrite);
    }

    #[test]
    fn syscall_fault_is_reported_as_fixup_not_kill() {
        let fx = fixture(1, vec![]);
        let upage = UserPage::containing(0x40_0000);

        let err = resolve_fault(&fx.frames, 1, &fx.dir, &fx.spt, &fx.mmap, &fx.file, upage.addr(), false, true, None, true)
            .expect_err("unmapped page with no stack hint must fail");
        assert_eq!(err, crate::vm::error::VmError::KernelAccessFaultInSyscall);
    }

    #[test]
    fn stack_growth_creates_entry_below_esp() {
        let fx = fixture(2, vec![]);
        let esp = PHYS_BASE - PAGE_SIZE as u64;
        let fault_addr = esp - 4;

        resolve_fault(&fx.frames, 1, &fx.dir, &fx.spt, &fx.mmap, &fx.file, fault_addr, true, true, Some(esp), false)
            .expect("stack growth");

        let upage = UserPage::containing(fault_addr);
        assert_eq!(fx.spt.lock().find(upage).expect("entry").location(), Location::Stack);
        assert!(fx.dir.lock().translate(upage).is_some());
    }

    #[test]
    fn unrelated_address_with_no_stack_hint_is_bad_access() {
        let fx = fixture(1, vec![]);
        let err = resolve_fault(&fx.frames, 1, &fx.dir, &fx.spt, &fx.mmap, &fx.file, 0x40_0000, false, true, None, false)
            .expect_err("must fail");
        assert_eq!(err, crate::vm::error::VmError::BadUserAccess);
    }

    #[test]
    fn mmap_fault_loads_pinned_frame_and_survives_eviction_pressure() {
        let fx = fixture(1, vec![0xAB; PAGE_SIZE]);
        let upage = UserPage::containing(0x20_0000);
        let concrete: Arc<Mutex<MemFile>> = Arc::new(Mutex::new(MemFile::new("m", vec![0xAB; PAGE_SIZE])));
        let mmap_file: Arc<Mutex<dyn crate::vm::file::ExecutableFile + Send>> = concrete;
        fx.mmap.lock().mmap(mmap_file, upage.addr(), |_| false).expect("mmap");

        resolve_fault(&fx.frames, 1, &fx.dir, &fx.spt, &fx.mmap, &fx.file, upage.addr(), false, true, None, false)
            .expect("resolve mmap fault");

        // Only frame in the pool is pinned; a second allocation must fail
        // rather than evicting the mmap page.
        let dir_b: Arc<Mutex<dyn PageDirectory>> = Arc::new(Mutex::new(FakePageDirectory::new()));
        let spt_b = Arc::new(Mutex::new(Spt::new()));
        let other = UserPage::containing(0x30_0000);
        spt_b.lock().insert(SptEntry::zero(other, true)).expect("insert");
        let err = resolve_fault(&fx.frames, 2, &dir_b, &spt_b, &fx.mmap, &fx.file, other.addr(), false, true, None, false)
            .expect_err("pinned frame must not be evicted");
        assert_eq!(err, crate::vm::error::VmError::OutOfUserMemory);
    }

    #[test]
    fn dirty_page_survives_forced_swap_out_and_swap_in() {
        let fx = fixture(1, vec![]);
        let upage_a = UserPage::containing(0x40_0000);
        fx.spt.lock().insert(SptEntry::zero(upage_a, true)).expect("insert a");
        resolve_fault(&fx.frames, 1, &fx.dir, &fx.spt, &fx.mmap, &fx.file, upage_a.addr(), true, true, None, false)
            .expect("fault in a");
        fx.dir_concrete.lock().simulate_write(upage_a);

        let dir_b: Arc<Mutex<dyn PageDirectory>> = Arc::new(Mutex::new(FakePageDirectory::new()));
        let spt_b = Arc::new(Mutex::new(Spt::new()));
        let upage_b = UserPage::containing(0x50_0000);
        spt_b.lock().insert(SptEntry::zero(upage_b, true)).expect("insert b");
        resolve_fault(&fx.frames, 2, &dir_b, &spt_b, &fx.mmap, &fx.file, upage_b.addr(), true, true, None, false)
            .expect("fault in b forces eviction of a");

        let entry = fx.spt.lock().find(upage_a).expect("entry survives").clone();
        assert_eq!(entry.location(), Location::Swap);

        resolve_fault(&fx.frames, 1, &fx.dir, &fx.spt, &fx.mmap, &fx.file, upage_a.addr(), false, true, None, false)
            .expect("fault a back in from swap");
        assert_eq!(fx.spt.lock().find(upage_a).expect("entry").location(), Location::Zero);
        assert!(fx.dir_concrete.lock().is_dirty(upage_a), "swapped-in page must be marked dirty");
    }

    #[test]
    fn swap_in_reattaches_to_shared_frame_when_sharing_eligible() {
        let fx = fixture(1, vec![0xAB; PAGE_SIZE]);
        let upage_a = UserPage::containing(0x40_0000);
        fx.spt
            .lock()
            .insert(SptEntry::file(upage_a, false, 0, PAGE_SIZE as u64))
            .expect("insert a");
        resolve_fault(&fx.frames, 1, &fx.dir, &fx.spt, &fx.mmap, &fx.file, upage_a.addr(), false, true, None, false)
            .expect("load a, registers the shared frame");

        // Process B's SPT entry describes the same read-only file page, but
        // already in Swap with `location_prev = File` and `writable = false`:
        // sharing-eligible on restore, per the resolved open question.
        let dir_b: Arc<Mutex<dyn PageDirectory>> = Arc::new(Mutex::new(FakePageDirectory::new()));
        let spt_b = Arc::new(Mutex::new(Spt::new()));
        let upage_b = UserPage::containing(0x40_0000);
        let mut entry_b = SptEntry::file(upage_b, false, 0, PAGE_SIZE as u64);
        let slot = fx.frames.swap().swap_out(&[0_u8; PAGE_SIZE]).expect("swap out placeholder");
        entry_b.mark_swapped_out(slot);
        spt_b.lock().insert(entry_b).expect("insert b");

        resolve_fault(&fx.frames, 2, &dir_b, &spt_b, &fx.mmap, &fx.file, upage_b.addr(), false, true, None, false)
            .expect("swap-in reattaches to the shared frame instead of reading swap");

        assert_eq!(spt_b.lock().find(upage_b).expect("entry").location(), Location::File);
        assert!(dir_b.lock().translate(upage_b).is_some());
    }
}
