//! The executable/data file collaborator.
//!
//! The real filesystem module lives outside this crate. Everything the VM
//! subsystem needs from it is this one trait: random-access reads (for
//! lazy segment loading and mmap faults) and writes (for mmap write-back).

use alloc::string::String;

use super::error::VmError;

/// A file handle as seen by the VM subsystem. The production kernel
/// implements this over its own file abstraction; tests implement it over
/// an in-memory byte buffer (see the `tests` module below).
pub trait ExecutableFile {
    /// Total length of the file in bytes.
    fn len(&self) -> u64;

    /// Whether the file is empty.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The name the file was opened with. Used as the sharing registry's
    /// file-identity key.
    fn name(&self) -> &str;

    /// Reads into `buf`, starting at byte `offset`. Returns the number of
    /// bytes actually read, which may be less than `buf.len()` at end of
    /// file.
    fn read_at(&self, buf: &mut [u8], offset: u64) -> Result<usize, VmError>;

    /// Writes `buf` at byte `offset`. Used only for mmap write-back; never
    /// called for the backing executable itself.
    fn write_at(&mut self, buf: &[u8], offset: u64) -> Result<(), VmError>;
}

/// An in-memory `ExecutableFile` used by unit tests so the fault resolver,
/// the loader, and the mmap manager can be exercised without a real
/// filesystem.
pub struct MemFile {
    name: String,
    data: alloc::vec::Vec<u8>,
}

impl MemFile {
    /// Builds a file with the given name and initial contents.
    #[must_use]
    pub fn new(name: &str, data: alloc::vec::Vec<u8>) -> Self {
        Self {
            name: String::from(name),
            data,
        }
    }

    /// Returns the current contents, for test assertions.
    #[must_use]
    pub fn contents(&self) -> &[u8] {
        &self.data
    }
}

impl ExecutableFile for MemFile {
    fn len(&self) -> u64 {
        self.data.len() as u64
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn read_at(&self, buf: &mut [u8], offset: u64) -> Result<usize, VmError> {
        let offset = offset as usize;
        if offset >= self.data.len() {
            return Ok(0);
        }
        let available = &self.data[offset..];
        let count = available.len().min(buf.len());
        buf[..count].copy_from_slice(&available[..count]);
        Ok(count)
    }

    fn write_at(&mut self, buf: &[u8], offset: u64) -> Result<(), VmError> {
        let offset = offset as usize;
        let end = offset
            .checked_add(buf.len())
            .ok_or(VmError::KernelInvariantViolation)?;
        if end > self.data.len() {
            self.data.resize(end, 0);
        }
        self.data[offset..end].copy_from_slice(buf);
        Ok(())
    }
}
