//! Error kinds surfaced by the virtual memory subsystem.

use core::fmt;

/// Every failure mode a caller (trap dispatcher or syscall layer) needs to
/// distinguish. Disposition is the caller's responsibility: some kinds kill
/// the faulting process, some return a syscall failure, some are simply
/// propagated as an allocation failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VmError {
    /// Eviction could not free a frame: the user pool has no evictable
    /// entry. Not fatal by itself; the caller decides.
    OutOfUserMemory,
    /// A user-mode fault landed on an address that is not described by the
    /// SPT, the mmap table, or the stack-growth heuristic. The faulting
    /// process must be terminated.
    BadUserAccess,
    /// A fault occurred while the thread was executing a system call. The
    /// syscall's fixup path must run instead of killing the process.
    KernelAccessFaultInSyscall,
    /// A write landed on a page whose SPT entry is not writable. The
    /// faulting process must be terminated.
    ReadOnlyWrite,
    /// An `mmap` request overlapped an existing SPT entry or mmap range.
    DuplicateMapping,
    /// Eviction needed to swap a dirty page out but the swap store has no
    /// free slot.
    SwapFull,
    /// An internal invariant documented in the data model was violated.
    /// There is no recovery: the caller should panic.
    KernelInvariantViolation,
}

impl fmt::Display for VmError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let message = match self {
            Self::OutOfUserMemory => "out of user memory",
            Self::BadUserAccess => "bad user access",
            Self::KernelAccessFaultInSyscall => "kernel access fault in syscall",
            Self::ReadOnlyWrite => "write to read-only page",
            Self::DuplicateMapping => "duplicate mmap mapping",
            Self::SwapFull => "swap store is full",
            Self::KernelInvariantViolation => "kernel invariant violation",
        };
        f.write_str(message)
    }
}
