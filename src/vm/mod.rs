//! User-process virtual memory subsystem.
//!
//! This module implements demand-paged virtual memory for user processes:
//! lazy loading from executable files, an anonymous swap backing store, a
//! read-only page sharing layer, memory-mapped files, second-chance frame
//! eviction, and on-demand user stack growth.
//!
//! The subsystem does not implement a scheduler, a file-descriptor table, or
//! syscall argument marshalling: those are external collaborators. The three
//! surfaces this module actually calls into (the filesystem, the block
//! device, and the hardware page tables) are represented as traits in
//! [`file`], [`swap`], and [`pagedir`] so the subsystem can be driven by
//! in-memory fakes in tests.

pub mod error;
pub mod fault;
pub mod file;
pub mod frame;
pub mod loader;
pub mod mmap;
pub mod pagedir;
pub mod pool;
pub mod process;
pub mod sharing;
pub mod spt;
pub mod swap;

use spin::Mutex;

/// Signature the scheduler's fault handler must have: `(addr, is_write,
/// is_user, in_syscall) -> resolved`. A `fn` pointer rather than a trait
/// object, so the `#PF` IDT entry in `interrupts` never needs to know the
/// scheduler's process-identity type or the `VmSystem`'s `BlockDevice`
/// parameter.
pub type PageFaultHandler = fn(u64, bool, bool, bool) -> bool;

static PAGE_FAULT_HOOK: Mutex<Option<PageFaultHandler>> = Mutex::new(None);

/// Registers the scheduler's fault handler. Called once at boot, after the
/// first process's `VmSystem` exists.
pub fn install_page_fault_hook(hook: PageFaultHandler) {
    *PAGE_FAULT_HOOK.lock() = Some(hook);
}

/// Called by the `#PF` IDT entry (`interrupts::page_fault_handler`). Returns
/// whether the fault was resolved; `false` means the caller must terminate
/// the faulting context.
#[must_use]
pub fn dispatch_page_fault(addr: u64, is_write: bool, is_user: bool, in_syscall: bool) -> bool {
    match *PAGE_FAULT_HOOK.lock() {
        Some(hook) => hook(addr, is_write, is_user, in_syscall),
        None => false,
    }
}

/// Size in bytes of a page on this architecture.
pub const PAGE_SIZE: usize = 4096;

/// Base of the user address range, matching the teacher's flat-binary loader
/// layout (`userspace::USER_CODE_START`): nothing below this address is a
/// legal user page.
pub const USER_VADDR_BASE: u64 = 0x40_0000;

/// Top of the user address space; the stack grows down from here.
pub const PHYS_BASE: u64 = 0x8000_0000;

/// Upper bound on how far below `PHYS_BASE` the stack may grow
/// automatically. 8 MiB, a conventional default stack-size limit.
pub const STACK_MAX_SIZE: u64 = 8 * 1024 * 1024;

/// A process identity. The scheduler/process-lifecycle module that owns
/// these values is external; the VM subsystem only needs them as opaque,
/// comparable, copyable keys for ownership tracking.
pub type Pid = u64;

/// A page-aligned user virtual address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct UserPage(u64);

impl UserPage {
    /// Rounds `addr` down to the containing page.
    #[must_use]
    pub const fn containing(addr: u64) -> Self {
        Self(addr & !(PAGE_SIZE as u64 - 1))
    }

    /// Builds a `UserPage` from an address that must already be page-aligned.
    #[must_use]
    pub const fn new_aligned(addr: u64) -> Option<Self> {
        if addr % PAGE_SIZE as u64 == 0 {
            Some(Self(addr))
        } else {
            None
        }
    }

    /// Returns the raw address of this page.
    #[must_use]
    pub const fn addr(self) -> u64 {
        self.0
    }

    /// Returns the page one `PAGE_SIZE` below this one.
    #[must_use]
    pub const fn prev(self) -> Self {
        Self(self.0 - PAGE_SIZE as u64)
    }

    /// Returns the page one `PAGE_SIZE` above this one.
    #[must_use]
    pub const fn next(self) -> Self {
        Self(self.0 + PAGE_SIZE as u64)
    }
}

/// A physical frame, identified by its index in the pool that owns it. In
/// production this indexes a physical-memory-offset-mapped range (see
/// `pool::FramePool`); in tests it indexes an in-memory `Vec` of pages. The
/// rest of the subsystem never needs to know which.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct FrameId(pub(crate) usize);

#[cfg(test)]
mod tests {
    use super::{UserPage, PAGE_SIZE};

    #[test]
    fn containing_rounds_down() {
        let page = UserPage::containing(0x1000 + 17);
        assert_eq!(page.addr(), 0x1000);
    }

    #[test]
    fn new_aligned_rejects_misaligned() {
        assert!(UserPage::new_aligned(1).is_none());
        assert!(UserPage::new_aligned(PAGE_SIZE as u64).is_some());
    }

    #[test]
    fn next_prev_roundtrip() {
        let page = UserPage::containing(0x10_0000);
        assert_eq!(page.next().prev(), page);
    }
}
