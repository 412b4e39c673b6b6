//! Per-process memory-mapped file manager.
//!
//! Distinct from the SPT: an mmap'd region is only consulted on an SPT
//! *miss* (§4.4 step 5), and its dirty pages are written back only on
//! explicit `munmap` or process exit — never by the frame-eviction path,
//! which treats mmap pages as off-limits victims (§4.2).

use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use alloc::vec::Vec;

use spin::Mutex;

use super::error::VmError;
use super::file::ExecutableFile;
use super::frame::FrameManager;
use super::pagedir::PageDirectory;
use super::swap::BlockDevice;
use super::{FrameId, Pid, UserPage, PAGE_SIZE};

/// One page of an active mapping.
struct PageMmapEntry {
    file_offset: u64,
    mapping_id: u64,
    /// Set once the page has been faulted in; `None` means it was never
    /// touched and there is nothing to write back.
    resident_frame: Option<FrameId>,
}

/// One active mapping: the reopened file, and the page range it covers.
struct FileMmapEntry {
    file: Arc<Mutex<dyn ExecutableFile + Send>>,
    base: UserPage,
    page_count: u64,
}

/// Per-process mmap bookkeeping.
#[derive(Default)]
pub struct MmapTable {
    page_table: BTreeMap<UserPage, PageMmapEntry>,
    file_table: BTreeMap<u64, FileMmapEntry>,
    next_id: u64,
}

impl MmapTable {
    /// Builds an empty table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether any mmap page entry exists at `upage`.
    #[must_use]
    pub fn contains_page(&self, upage: UserPage) -> bool {
        self.page_table.contains_key(&upage)
    }

    /// Registers a new mapping of `file` at `addr`, covering
    /// `ceil(file.len() / PAGE_SIZE)` pages. `overlaps` is a caller-supplied
    /// predicate (checking the SPT and installed pages) so this module does
    /// not need to know about the SPT directly.
    ///
    /// # Errors
    /// Returns [`VmError::DuplicateMapping`] if `addr` is not page-aligned,
    /// is zero, or any covered page overlaps an existing SPT entry, an
    /// installed page, or another mmap range.
    pub fn mmap(
        &mut self,
        file: Arc<Mutex<dyn ExecutableFile + Send>>,
        addr: u64,
        overlaps: impl Fn(UserPage) -> bool,
    ) -> Result<u64, VmError> {
        if addr == 0 || addr % PAGE_SIZE as u64 != 0 {
            return Err(VmError::DuplicateMapping);
        }
        let base = UserPage::containing(addr);
        let length = file.lock().len();
        if length == 0 {
            return Err(VmError::DuplicateMapping);
        }
        let page_count = length.div_ceil(PAGE_SIZE as u64);

        let mut page = base;
        for _ in 0..page_count {
            if self.page_table.contains_key(&page) || overlaps(page) {
                return Err(VmError::DuplicateMapping);
            }
            page = page.next();
        }

        let mapping_id = self.next_id + 1;
        self.next_id = mapping_id;

        let mut page = base;
        for index in 0..page_count {
            self.page_table.insert(
                page,
                PageMmapEntry {
                    file_offset: index * PAGE_SIZE as u64,
                    mapping_id,
                    resident_frame: None,
                },
            );
            page = page.next();
        }
        self.file_table.insert(
            mapping_id,
            FileMmapEntry {
                file,
                base,
                page_count,
            },
        );

        Ok(mapping_id)
    }

    /// Returns the file offset to load for a page that faulted via the
    /// mmap table (SPT miss path), and the mapping's file handle.
    #[must_use]
    pub fn lookup(&self, upage: UserPage) -> Option<(u64, Arc<Mutex<dyn ExecutableFile + Send>>)> {
        let entry = self.page_table.get(&upage)?;
        let file_entry = self.file_table.get(&entry.mapping_id)?;
        Some((entry.file_offset, file_entry.file.clone()))
    }

    /// Records that `upage` was faulted in and now lives in `frame`.
    pub fn mark_resident(&mut self, upage: UserPage, frame: FrameId) {
        if let Some(entry) = self.page_table.get_mut(&upage) {
            entry.resident_frame = Some(frame);
        }
    }

    /// Writes back every dirty, resident page of `mapping_id` and removes
    /// the mapping. Clean pages are discarded without being written.
    ///
    /// # Errors
    /// Propagates any [`VmError`] the file write returns.
    pub fn unmap<D: BlockDevice>(
        &mut self,
        mapping_id: u64,
        pid: Pid,
        page_dir: &mut dyn PageDirectory,
        frames: &FrameManager<D>,
    ) -> Result<(), VmError> {
        let Some(file_entry) = self.file_table.remove(&mapping_id) else {
            return Ok(());
        };

        let mut page = file_entry.base;
        for _ in 0..file_entry.page_count {
            if let Some(entry) = self.page_table.remove(&page) {
                self.write_back_one(&entry, &file_entry, page, pid, page_dir, frames)?;
            }
            page = page.next();
        }
        Ok(())
    }

    /// Writes back and removes every mapping still open for this process,
    /// called at process exit.
    ///
    /// # Errors
    /// Propagates any [`VmError`] the file write returns.
    pub fn exit<D: BlockDevice>(
        &mut self,
        pid: Pid,
        page_dir: &mut dyn PageDirectory,
        frames: &FrameManager<D>,
    ) -> Result<(), VmError> {
        let mapping_ids: Vec<u64> = self.file_table.keys().copied().collect();
        for mapping_id in mapping_ids {
            self.unmap(mapping_id, pid, page_dir, frames)?;
        }
        Ok(())
    }

    fn write_back_one<D: BlockDevice>(
        &self,
        entry: &PageMmapEntry,
        file_entry: &FileMmapEntry,
        upage: UserPage,
        pid: Pid,
        page_dir: &mut dyn PageDirectory,
        frames: &FrameManager<D>,
    ) -> Result<(), VmError> {
        let Some(frame) = entry.resident_frame else {
            return Ok(());
        };
        if page_dir.is_dirty(upage) {
            frames.with_bytes_mut(frame, |bytes| {
                file_entry.file.lock().write_at(bytes, entry.file_offset)
            })?;
        }
        page_dir.unmap(upage);
        frames.detach_owner(frame, pid, upage);
        Ok(())
    }
}
