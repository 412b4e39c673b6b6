//! ELF32 executable loader.
//!
//! Validates the header and program headers per §6, then turns each
//! `PT_LOAD` segment into a run of `Location::File`/`Location::Zero` SPT
//! entries, exactly as the page-fault resolver's `load_page` expects to
//! find them. Does not read segment bytes itself: that stays lazy, done
//! later by `fault::load_page` on first touch.

use super::error::VmError;
use super::file::ExecutableFile;
use super::spt::{Spt, SptEntry};
use super::{UserPage, PAGE_SIZE, PHYS_BASE};

const ELF_MAGIC: [u8; 7] = *b"\x7fELF\x01\x01\x01";
const ET_EXEC: u16 = 2;
const EM_386: u16 = 3;
const EV_CURRENT: u32 = 1;
const PHDR_SIZE: u16 = 32;
const MAX_PROGRAM_HEADERS: u16 = 1024;

const PT_LOAD: u32 = 1;
const PT_DYNAMIC: u32 = 2;
const PT_INTERP: u32 = 3;
const PT_SHLIB: u32 = 5;

struct Ehdr {
    e_phoff: u32,
    e_phnum: u16,
}

struct Phdr {
    p_type: u32,
    p_offset: u32,
    p_vaddr: u32,
    p_filesz: u32,
    p_memsz: u32,
    p_flags: u32,
}

const PF_W: u32 = 0x2;

fn read_u16(buf: &[u8], offset: usize) -> u16 {
    u16::from_le_bytes([buf[offset], buf[offset + 1]])
}

fn read_u32(buf: &[u8], offset: usize) -> u32 {
    u32::from_le_bytes([buf[offset], buf[offset + 1], buf[offset + 2], buf[offset + 3]])
}

fn parse_ehdr(file: &dyn ExecutableFile) -> Result<Ehdr, VmError> {
    let mut header = [0_u8; 52];
    let read = file.read_at(&mut header, 0)?;
    if read < header.len() {
        return Err(VmError::BadUserAccess);
    }

    if header[..7] != ELF_MAGIC {
        return Err(VmError::BadUserAccess);
    }
    let e_type = read_u16(&header, 16);
    let e_machine = read_u16(&header, 18);
    let e_version = read_u32(&header, 20);
    let e_phoff = read_u32(&header, 28);
    let e_phentsize = read_u16(&header, 42);
    let e_phnum = read_u16(&header, 44);

    if e_type != ET_EXEC
        || e_machine != EM_386
        || e_version != EV_CURRENT
        || e_phentsize != PHDR_SIZE
        || e_phnum > MAX_PROGRAM_HEADERS
    {
        return Err(VmError::BadUserAccess);
    }

    Ok(Ehdr { e_phoff, e_phnum })
}

fn parse_phdr(file: &dyn ExecutableFile, offset: u32) -> Result<Phdr, VmError> {
    let mut buf = [0_u8; 32];
    let read = file.read_at(&mut buf, u64::from(offset))?;
    if read < buf.len() {
        return Err(VmError::BadUserAccess);
    }
    Ok(Phdr {
        p_type: read_u32(&buf, 0),
        p_offset: read_u32(&buf, 4),
        p_vaddr: read_u32(&buf, 8),
        p_filesz: read_u32(&buf, 16),
        p_memsz: read_u32(&buf, 20),
        p_flags: read_u32(&buf, 24),
    })
}

fn validate_segment(phdr: &Phdr) -> Result<(), VmError> {
    if u64::from(phdr.p_offset) % PAGE_SIZE as u64 != u64::from(phdr.p_vaddr) % PAGE_SIZE as u64 {
        return Err(VmError::BadUserAccess);
    }
    if u64::from(phdr.p_vaddr) < PAGE_SIZE as u64 {
        return Err(VmError::BadUserAccess);
    }
    if phdr.p_memsz < phdr.p_filesz {
        return Err(VmError::BadUserAccess);
    }
    let end = u64::from(phdr.p_vaddr)
        .checked_add(u64::from(phdr.p_memsz))
        .ok_or(VmError::BadUserAccess)?;
    if end <= u64::from(phdr.p_vaddr) && phdr.p_memsz > 0 {
        return Err(VmError::BadUserAccess);
    }
    if end > PHYS_BASE {
        return Err(VmError::BadUserAccess);
    }
    Ok(())
}

/// Loads `file` as an ELF32 executable, populating `spt` with one entry per
/// page of every `PT_LOAD` segment: whole file-backed pages as
/// `Location::File`, the all-zero tail as `Location::Zero`. Overlapping
/// segment pages merge via [`Spt::update`] (more permissive `writable`
/// wins, per the resolved open question in §9).
///
/// Returns the entry point address on success.
///
/// # Errors
/// Returns [`VmError::BadUserAccess`] if the header or any program header
/// fails validation, or if a segment contains a non-`PT_LOAD` type that
/// must fail the load (`PT_DYNAMIC`/`PT_INTERP`/`PT_SHLIB`).
pub fn load_executable(file: &dyn ExecutableFile, spt: &mut Spt) -> Result<(), VmError> {
    let ehdr = parse_ehdr(file)?;

    let mut offset = ehdr.e_phoff;
    for _ in 0..ehdr.e_phnum {
        let phdr = parse_phdr(file, offset)?;
        offset += u32::from(PHDR_SIZE);

        match phdr.p_type {
            PT_DYNAMIC | PT_INTERP | PT_SHLIB => return Err(VmError::BadUserAccess),
            PT_LOAD => {
                validate_segment(&phdr)?;
                load_segment(&phdr, spt);
            }
            _ => {}
        }
    }

    Ok(())
}

fn load_segment(phdr: &Phdr, spt: &mut Spt) {
    let writable = phdr.p_flags & PF_W != 0;
    let file_page = u64::from(phdr.p_offset) & !(PAGE_SIZE as u64 - 1);
    let mem_page = u64::from(phdr.p_vaddr) & !(PAGE_SIZE as u64 - 1);
    let page_offset = u64::from(phdr.p_vaddr) % PAGE_SIZE as u64;

    let read_bytes_total = page_offset + u64::from(phdr.p_filesz);
    let total_bytes = page_offset + u64::from(phdr.p_memsz);
    let total_pages = total_bytes.div_ceil(PAGE_SIZE as u64);

    for index in 0..total_pages {
        let upage = UserPage::new_aligned(mem_page + index * PAGE_SIZE as u64)
            .unwrap_or_else(|| UserPage::containing(mem_page + index * PAGE_SIZE as u64));
        let page_start = index * PAGE_SIZE as u64;
        let entry = if page_start < read_bytes_total {
            let read_bytes = (read_bytes_total - page_start).min(PAGE_SIZE as u64);
            SptEntry::file(upage, writable, file_page + page_start, read_bytes)
        } else {
            SptEntry::zero(upage, writable)
        };
        spt.update(entry);
    }
}

#[cfg(test)]
mod tests {
    use alloc::vec;
    use alloc::vec::Vec;

    use super::{load_executable, EM_386, ET_EXEC, EV_CURRENT, PHDR_SIZE, PT_LOAD};
    use crate::vm::file::MemFile;
    use crate::vm::spt::{Location, Spt};
    use crate::vm::UserPage;

    fn build_elf(segments: &[(u32, u32, u32, u32, u32)]) -> Vec<u8> {
        // Header (52 bytes) + one 32-byte phdr per segment, no segment data
        // (the loader never reads segment bytes itself).
        let mut data = vec![0_u8; 52];
        data[0..7].copy_from_slice(b"\x7fELF\x01\x01\x01");
        data[16..18].copy_from_slice(&ET_EXEC.to_le_bytes());
        data[18..20].copy_from_slice(&EM_386.to_le_bytes());
        data[20..24].copy_from_slice(&EV_CURRENT.to_le_bytes());
        data[28..32].copy_from_slice(&52_u32.to_le_bytes());
        data[42..44].copy_from_slice(&PHDR_SIZE.to_le_bytes());
        data[44..46].copy_from_slice(&(segments.len() as u16).to_le_bytes());

        for &(p_offset, p_vaddr, p_filesz, p_memsz, p_flags) in segments {
            let mut phdr = vec![0_u8; 32];
            phdr[0..4].copy_from_slice(&PT_LOAD.to_le_bytes());
            phdr[4..8].copy_from_slice(&p_offset.to_le_bytes());
            phdr[8..12].copy_from_slice(&p_vaddr.to_le_bytes());
            phdr[16..20].copy_from_slice(&p_filesz.to_le_bytes());
            phdr[20..24].copy_from_slice(&p_memsz.to_le_bytes());
            phdr[24..28].copy_from_slice(&p_flags.to_le_bytes());
            data.extend_from_slice(&phdr);
        }
        data
    }

    #[test]
    fn single_segment_splits_file_and_zero_pages() {
        let data = build_elf(&[(0x1000, 0x40_0000, 100, 4096 + 50, 0)]);
        let file = MemFile::new("prog", data);
        let mut spt = Spt::new();
        load_executable(&file, &mut spt).expect("load");

        let page0 = UserPage::containing(0x40_0000);
        let page1 = page0.next();
        assert_eq!(spt.find(page0).expect("page0").location(), Location::File);
        assert_eq!(spt.find(page1).expect("page1").location(), Location::Zero);
    }

    #[test]
    fn overlapping_segments_merge_to_more_permissive_writable() {
        let data = build_elf(&[
            (0x1000, 0x40_0000, 4096, 4096, 0),
            (0x1000, 0x40_0000, 4096, 4096, super::PF_W),
        ]);
        let file = MemFile::new("prog", data);
        let mut spt = Spt::new();
        load_executable(&file, &mut spt).expect("load");

        let page0 = UserPage::containing(0x40_0000);
        assert!(spt.find(page0).expect("page0").writable());
    }

    #[test]
    fn non_executable_header_is_rejected() {
        let mut data = build_elf(&[]);
        data[16..18].copy_from_slice(&0_u16.to_le_bytes());
        let file = MemFile::new("prog", data);
        let mut spt = Spt::new();
        assert!(load_executable(&file, &mut spt).is_err());
    }

    #[test]
    fn segment_spilling_past_phys_base_is_rejected() {
        let data = build_elf(&[(0x1000, 0x7fff_f000, 0, 0x2000, 0)]);
        let file = MemFile::new("prog", data);
        let mut spt = Spt::new();
        assert!(load_executable(&file, &mut spt).is_err());
    }
}
