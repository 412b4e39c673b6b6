//! Per-process address space and the subsystem's external entry points.
//!
//! `VmSystem` is the single global handle the syscall layer and the trap
//! dispatcher hold: one frame manager shared by every process, plus a
//! registry of per-process [`AddressSpace`]s keyed by [`Pid`]. This is the
//! "constructed once by `VmSystem::new` and held behind `spin::Mutex`"
//! pattern the kernel already uses for `PICS`/`IDT`/`SERIAL1`.

use alloc::collections::BTreeMap;
use alloc::sync::Arc;

use spin::Mutex;

use super::error::VmError;
use super::fault;
use super::file::ExecutableFile;
use super::frame::FrameManager;
use super::loader;
use super::mmap::MmapTable;
use super::pagedir::PageDirectory;
use super::spt::Spt;
use super::swap::BlockDevice;
use super::{Pid, UserPage};

/// Everything the VM subsystem tracks for one user process.
pub struct AddressSpace {
    page_dir: Arc<Mutex<dyn PageDirectory>>,
    spt: Arc<Mutex<Spt>>,
    mmap: Mutex<MmapTable>,
    file: Arc<Mutex<dyn ExecutableFile + Send>>,
    /// Saved user stack pointer, updated by the syscall layer before any
    /// operation that might fault on the user stack; read by the
    /// stack-growth heuristic (§4.4 step 6).
    esp: Mutex<Option<u64>>,
}

impl AddressSpace {
    /// Builds a fresh, empty address space over `page_dir` and the process's
    /// executable `file`.
    #[must_use]
    pub fn new(page_dir: Arc<Mutex<dyn PageDirectory>>, file: Arc<Mutex<dyn ExecutableFile + Send>>) -> Self {
        Self {
            page_dir,
            spt: Arc::new(Mutex::new(Spt::new())),
            mmap: Mutex::new(MmapTable::new()),
            file,
            esp: Mutex::new(None),
        }
    }

    /// Records the user stack pointer ahead of an operation that may fault.
    pub fn set_esp(&self, esp: u64) {
        *self.esp.lock() = Some(esp);
    }
}

/// The subsystem's single global handle: one frame manager shared by every
/// process, and a registry of address spaces keyed by [`Pid`].
pub struct VmSystem<D: BlockDevice> {
    frames: FrameManager<D>,
    spaces: Mutex<BTreeMap<Pid, Arc<AddressSpace>>>,
}

impl<D: BlockDevice> VmSystem<D> {
    /// Builds a VM system over `user_frame_count` frames and a swap device.
    #[must_use]
    pub fn new(user_frame_count: usize, swap_device: D) -> Self {
        Self {
            frames: FrameManager::new(user_frame_count, swap_device),
            spaces: Mutex::new(BTreeMap::new()),
        }
    }

    /// Registers a new process's address space. The caller has already built
    /// the hardware page directory and opened the executable file.
    pub fn new_process(&self, pid: Pid, page_dir: Arc<Mutex<dyn PageDirectory>>, file: Arc<Mutex<dyn ExecutableFile + Send>>) {
        self.spaces.lock().insert(pid, Arc::new(AddressSpace::new(page_dir, file)));
    }

    /// Number of free frames remaining in the user pool, for diagnostics and
    /// tests.
    #[must_use]
    pub fn free_frame_count(&self) -> usize {
        self.frames.free_count()
    }

    /// Loads `pid`'s executable file, populating its SPT with one entry per
    /// page of every `PT_LOAD` segment.
    ///
    /// # Errors
    /// Returns [`VmError::KernelInvariantViolation`] if `pid` is unknown, or
    /// propagates [`VmError::BadUserAccess`] from a malformed executable.
    pub fn load_executable(&self, pid: Pid) -> Result<(), VmError> {
        let space = self.space(pid)?;
        let file_guard = space.file.lock();
        let mut spt_guard = space.spt.lock();
        loader::load_executable(&*file_guard, &mut spt_guard)
    }

    /// Records `pid`'s current user stack pointer ahead of an operation that
    /// may fault on the stack (syscall argument copy-in, `PUSH`/`PUSHA`).
    ///
    /// # Errors
    /// Returns [`VmError::KernelInvariantViolation`] if `pid` is unknown.
    pub fn set_stack_pointer(&self, pid: Pid, esp: u64) -> Result<(), VmError> {
        let space = self.space(pid)?;
        space.set_esp(esp);
        Ok(())
    }

    /// Resolves one page fault for `pid`. See [`fault::resolve_fault`].
    ///
    /// # Errors
    /// See [`VmError`]; disposition of each kind is the caller's
    /// responsibility (§7).
    pub fn handle_page_fault(&self, pid: Pid, addr: u64, is_write: bool, is_user: bool, in_syscall: bool) -> Result<(), VmError> {
        let space = self.space(pid)?;
        let esp = *space.esp.lock();
        fault::resolve_fault(
            &self.frames,
            pid,
            &space.page_dir,
            &space.spt,
            &space.mmap,
            &space.file,
            addr,
            is_write,
            is_user,
            esp,
            in_syscall,
        )
    }

    /// Maps `file` at `addr` in `pid`'s address space.
    ///
    /// # Errors
    /// Returns [`VmError::DuplicateMapping`] per [`MmapTable::mmap`]'s
    /// contract, or [`VmError::KernelInvariantViolation`] if `pid` is
    /// unknown.
    pub fn mmap(&self, pid: Pid, file: Arc<Mutex<dyn ExecutableFile + Send>>, addr: u64) -> Result<u64, VmError> {
        let space = self.space(pid)?;
        let spt = space.spt.lock();
        space.mmap.lock().mmap(file, addr, |upage: UserPage| spt.contains(upage))
    }

    /// Unmaps `mapping_id` in `pid`'s address space, writing back dirty
    /// pages per the hardware dirty bit.
    ///
    /// # Errors
    /// Propagates any [`VmError`] the file write returns, or
    /// [`VmError::KernelInvariantViolation`] if `pid` is unknown.
    pub fn munmap(&self, pid: Pid, mapping_id: u64) -> Result<(), VmError> {
        let space = self.space(pid)?;
        let mut page_dir = space.page_dir.lock();
        space.mmap.lock().unmap(mapping_id, pid, &mut *page_dir, &self.frames)
    }

    /// Tears down `pid`'s address space: writes back mmap'd files (detaching
    /// the process from each mmap frame as it goes), releases swap slots
    /// still held by the SPT, detaches the process from every frame it
    /// still holds resident under a non-mmap SPT entry (§5 Cancellation),
    /// and drops the process from the registry. Destroying the page table
    /// itself is the caller's responsibility.
    ///
    /// # Errors
    /// Returns [`VmError::KernelInvariantViolation`] if `pid` is unknown.
    pub fn exit_process(&self, pid: Pid) -> Result<(), VmError> {
        let space = self.space(pid)?;
        {
            let mut page_dir = space.page_dir.lock();
            space.mmap.lock().exit(pid, &mut *page_dir, &self.frames)?;
        }
        let released = space.spt.lock().destroy();
        for slot in released.swap_slots {
            self.frames.swap().drop_slot(slot);
        }
        for (upage, frame) in released.frames {
            self.frames.detach_owner(frame, pid, upage);
        }
        self.spaces.lock().remove(&pid);
        Ok(())
    }

    fn space(&self, pid: Pid) -> Result<Arc<AddressSpace>, VmError> {
        self.spaces
            .lock()
            .get(&pid)
            .cloned()
            .ok_or(VmError::KernelInvariantViolation)
    }
}

#[cfg(test)]
mod tests {
    use alloc::sync::Arc;
    use alloc::vec;

    use spin::Mutex;

    use super::VmSystem;
    use crate::vm::file::MemFile;
    use crate::vm::pagedir::FakePageDirectory;
    use crate::vm::swap::MemBlockDevice;
    use crate::vm::UserPage;

    fn elf_with_one_zero_segment() -> alloc::vec::Vec<u8> {
        let mut data = vec![0_u8; 52 + 32];
        data[0..7].copy_from_slice(b"\x7fELF\x01\x01\x01");
        data[16..18].copy_from_slice(&2_u16.to_le_bytes());
        data[18..20].copy_from_slice(&3_u16.to_le_bytes());
        data[20..24].copy_from_slice(&1_u32.to_le_bytes());
        data[28..32].copy_from_slice(&52_u32.to_le_bytes());
        data[42..44].copy_from_slice(&32_u16.to_le_bytes());
        data[44..46].copy_from_slice(&1_u16.to_le_bytes());
        // one PT_LOAD segment, all zero-fill
        data[52..56].copy_from_slice(&1_u32.to_le_bytes());
        data[60..64].copy_from_slice(&0x40_0000_u32.to_le_bytes());
        data[68..72].copy_from_slice(&0_u32.to_le_bytes());
        data[72..76].copy_from_slice(&4096_u32.to_le_bytes());
        data[76..80].copy_from_slice(&0x6_u32.to_le_bytes());
        data
    }

    #[test]
    fn load_and_fault_installs_a_page() {
        let system: VmSystem<MemBlockDevice> = VmSystem::new(4, MemBlockDevice::new(4));
        let page_dir = Arc::new(Mutex::new(FakePageDirectory::new()));
        let file = Arc::new(Mutex::new(MemFile::new("prog", elf_with_one_zero_segment())));
        system.new_process(1, page_dir.clone(), file);
        system.load_executable(1).expect("load");

        system.handle_page_fault(1, 0x40_0000, false, true, false).expect("fault resolves");
        assert!(page_dir.lock().translate(UserPage::containing(0x40_0000)).is_some());
    }

    #[test]
    fn exit_process_removes_the_address_space() {
        let system: VmSystem<MemBlockDevice> = VmSystem::new(4, MemBlockDevice::new(4));
        let page_dir = Arc::new(Mutex::new(FakePageDirectory::new()));
        let file = Arc::new(Mutex::new(MemFile::new("prog", vec![])));
        system.new_process(7, page_dir, file);
        system.exit_process(7).expect("exit");
        assert!(system.handle_page_fault(7, 0x40_0000, false, true, false).is_err());
    }

    #[test]
    fn exit_process_returns_resident_non_mmap_frames_to_the_pool() {
        let system: VmSystem<MemBlockDevice> = VmSystem::new(4, MemBlockDevice::new(4));
        let page_dir = Arc::new(Mutex::new(FakePageDirectory::new()));
        let file = Arc::new(Mutex::new(MemFile::new("prog", elf_with_one_zero_segment())));
        system.new_process(1, page_dir, file);
        system.load_executable(1).expect("load");
        system.handle_page_fault(1, 0x40_0000, false, true, false).expect("fault resolves");

        assert_eq!(system.free_frame_count(), 3, "the zero page consumed one frame");
        system.exit_process(1).expect("exit");
        assert_eq!(system.free_frame_count(), 4, "exit must return the resident frame");
    }

    #[test]
    fn unknown_pid_is_a_kernel_invariant_violation() {
        let system: VmSystem<MemBlockDevice> = VmSystem::new(4, MemBlockDevice::new(4));
        let err = system.load_executable(99).expect_err("unknown pid");
        assert_eq!(err, crate::vm::error::VmError::KernelInvariantViolation);
    }
}
