//! Segmented images: a file holding several physical runs with headers
//! between them.
//!
//! Two layouts are recognised:
//! - LiME: each run is preceded by a 32-byte `EMiL` header carrying the
//!   inclusive physical start/end.
//! - ELF core dumps: each `PT_LOAD` program header describes one run.

use crate::memory::error::{MemoryError, MemoryResult};
use crate::memory::layers::mmap_file::MmapFileStore;
use crate::memory::traits::BackingStore;
use goblin::elf::{header, program_header, Elf};
use std::ops::Range;
use std::path::Path;
use tracing::{debug, warn};

const LIME_MAGIC: u32 = 0x4C69_4D45; // "EMiL" read as little-endian
const LIME_HEADER_SIZE: usize = 32;

/// One physical run and where its bytes sit in the file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Run {
    pub start: u64,
    pub file_offset: u64,
    pub length: u64,
}

impl Run {
    pub fn end(&self) -> u64 {
        self.start + self.length
    }

    fn contains(&self, offset: u64) -> bool {
        offset >= self.start && offset < self.end()
    }
}

/// A backing store whose logical space is a sorted list of runs over a
/// mapped file.
pub struct SegmentedStore {
    name: String,
    file: MmapFileStore,
    runs: Vec<Run>,
}

impl SegmentedStore {
    /// Build from explicit runs. Runs are sorted; a run overlapping an
    /// earlier one is dropped, and a run reaching past the end of the file
    /// is an error.
    pub fn new(name: impl Into<String>, file: MmapFileStore, mut runs: Vec<Run>) -> MemoryResult<Self> {
        let name = name.into();
        let file_size = file.size();

        runs.retain(|r| r.length > 0);
        runs.sort_by_key(|r| r.start);

        let mut kept: Vec<Run> = Vec::with_capacity(runs.len());
        for run in runs {
            if run.file_offset.saturating_add(run.length) > file_size {
                return Err(MemoryError::container(format!(
                    "{}: run at {:#x} ({} bytes) extends past end of file",
                    name, run.start, run.length
                )));
            }
            if run.start.checked_add(run.length).is_none() {
                return Err(MemoryError::container(format!(
                    "{}: run at {:#x} overflows the address space",
                    name, run.start
                )));
            }
            match kept.last() {
                Some(prev) if prev.end() > run.start => {
                    warn!(
                        "{}: dropping run {:#x}..{:#x} overlapping {:#x}..{:#x}",
                        name,
                        run.start,
                        run.end(),
                        prev.start,
                        prev.end()
                    );
                }
                _ => kept.push(run),
            }
        }

        if kept.is_empty() {
            return Err(MemoryError::container(format!("{}: no populated runs", name)));
        }

        debug!("{}: {} runs", name, kept.len());
        Ok(SegmentedStore {
            name,
            file,
            runs: kept,
        })
    }

    /// True when the bytes start with a LiME header.
    pub fn is_lime(bytes: &[u8]) -> bool {
        read_u32(bytes, 0) == Some(LIME_MAGIC)
    }

    /// True when the bytes are an ELF core file.
    pub fn is_elf_core(bytes: &[u8]) -> bool {
        bytes.len() >= header::SIZEOF_IDENT
            && &bytes[..header::SELFMAG] == header::ELFMAG
            && Elf::parse_header(bytes)
                .map(|h| h.e_type == header::ET_CORE)
                .unwrap_or(false)
    }

    /// Open a LiME capture.
    pub fn open_lime(path: impl AsRef<Path>) -> MemoryResult<Self> {
        let file = MmapFileStore::open_path(path)?;
        let runs = parse_lime_runs(file.as_slice())?;
        let name = file.name().to_string();
        Self::new(name, file, runs)
    }

    /// Open an ELF core dump. Each `PT_LOAD` segment is a run at its
    /// physical address, or its virtual address when no physical address is
    /// recorded. Only the file-backed part (`p_filesz`) is populated.
    pub fn open_elf_core(path: impl AsRef<Path>) -> MemoryResult<Self> {
        let file = MmapFileStore::open_path(path)?;
        let runs = parse_elf_runs(file.as_slice())?;
        let name = file.name().to_string();
        Self::new(name, file, runs)
    }

    pub fn segments(&self) -> &[Run] {
        &self.runs
    }

    fn find_run(&self, offset: u64) -> Option<&Run> {
        let idx = self.runs.partition_point(|r| r.start <= offset);
        let run = self.runs.get(idx.checked_sub(1)?)?;
        run.contains(offset).then_some(run)
    }
}

impl BackingStore for SegmentedStore {
    fn read_raw(&self, offset: u64, length: usize) -> MemoryResult<Vec<u8>> {
        let run = self.find_run(offset).ok_or_else(|| {
            MemoryError::backing_store(&self.name, offset, "offset not inside any run")
        })?;
        if offset.saturating_add(length as u64) > run.end() {
            return Err(MemoryError::backing_store(
                &self.name,
                run.end(),
                "read crosses the end of a run",
            ));
        }
        self.file
            .read_bytes(run.file_offset + (offset - run.start), length, false)
    }

    fn size(&self) -> u64 {
        self.runs.last().map(|r| r.end()).unwrap_or(0)
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn runs(&self) -> Vec<Range<u64>> {
        let mut ranges: Vec<Range<u64>> = Vec::with_capacity(self.runs.len());
        for run in &self.runs {
            match ranges.last_mut() {
                Some(last) if last.end == run.start => last.end = run.end(),
                _ => ranges.push(run.start..run.end()),
            }
        }
        ranges
    }
}

fn read_u32(bytes: &[u8], at: usize) -> Option<u32> {
    bytes
        .get(at..at + 4)
        .and_then(|b| b.try_into().ok())
        .map(u32::from_le_bytes)
}

fn read_u64(bytes: &[u8], at: usize) -> Option<u64> {
    bytes
        .get(at..at + 8)
        .and_then(|b| b.try_into().ok())
        .map(u64::from_le_bytes)
}

/// LiME segment header (32 bytes):
/// magic u32 | version u32 | start u64 | end u64 (inclusive) | reserved u64
fn parse_lime_runs(data: &[u8]) -> MemoryResult<Vec<Run>> {
    let mut runs = Vec::new();
    let mut offset = 0usize;

    while offset + LIME_HEADER_SIZE <= data.len() {
        if read_u32(data, offset) != Some(LIME_MAGIC) {
            warn!("LiME: no segment header at file offset {:#x}, stopping", offset);
            break;
        }
        let (start, end) = match (read_u64(data, offset + 8), read_u64(data, offset + 16)) {
            (Some(s), Some(e)) => (s, e),
            _ => break,
        };
        if end < start {
            return Err(MemoryError::container(format!(
                "LiME segment at file offset {:#x} ends ({:#x}) before it starts ({:#x})",
                offset, end, start
            )));
        }
        let length = end - start + 1;
        let file_offset = (offset + LIME_HEADER_SIZE) as u64;
        if file_offset.saturating_add(length) > data.len() as u64 {
            return Err(MemoryError::container(format!(
                "LiME segment {:#x}..={:#x} is truncated",
                start, end
            )));
        }

        runs.push(Run {
            start,
            file_offset,
            length,
        });
        offset = (file_offset + length) as usize;
    }

    if runs.is_empty() {
        return Err(MemoryError::container("no LiME segments found"));
    }
    Ok(runs)
}

fn parse_elf_runs(data: &[u8]) -> MemoryResult<Vec<Run>> {
    let elf = Elf::parse(data).map_err(|e| MemoryError::container(format!("ELF: {}", e)))?;
    if elf.header.e_type != header::ET_CORE {
        return Err(MemoryError::container(format!(
            "ELF type {} is not a core file",
            elf.header.e_type
        )));
    }

    let runs: Vec<Run> = elf
        .program_headers
        .iter()
        .filter(|ph| ph.p_type == program_header::PT_LOAD && ph.p_filesz > 0)
        .map(|ph| Run {
            start: if ph.p_paddr != 0 { ph.p_paddr } else { ph.p_vaddr },
            file_offset: ph.p_offset,
            length: ph.p_filesz,
        })
        .collect();

    if runs.is_empty() {
        return Err(MemoryError::container("ELF core has no loadable segments"));
    }
    Ok(runs)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    pub(crate) fn lime_image(segments: &[(u64, &[u8])]) -> Vec<u8> {
        let mut out = Vec::new();
        for (start, data) in segments {
            out.extend_from_slice(&LIME_MAGIC.to_le_bytes());
            out.extend_from_slice(&1u32.to_le_bytes());
            out.extend_from_slice(&start.to_le_bytes());
            out.extend_from_slice(&(start + data.len() as u64 - 1).to_le_bytes());
            out.extend_from_slice(&[0u8; 8]);
            out.extend_from_slice(data);
        }
        out
    }

    /// Minimal little-endian ELF64 core file with one PT_LOAD per segment.
    pub(crate) fn elf_core_image(segments: &[(u64, &[u8])]) -> Vec<u8> {
        const EHDR: usize = 64;
        const PHDR: usize = 56;
        let mut out = Vec::new();
        out.extend_from_slice(&[0x7f, b'E', b'L', b'F', 2, 1, 1, 0]);
        out.extend_from_slice(&[0u8; 8]);
        out.extend_from_slice(&4u16.to_le_bytes()); // ET_CORE
        out.extend_from_slice(&62u16.to_le_bytes()); // EM_X86_64
        out.extend_from_slice(&1u32.to_le_bytes());
        out.extend_from_slice(&0u64.to_le_bytes()); // entry
        out.extend_from_slice(&(EHDR as u64).to_le_bytes()); // phoff
        out.extend_from_slice(&0u64.to_le_bytes()); // shoff
        out.extend_from_slice(&0u32.to_le_bytes()); // flags
        out.extend_from_slice(&(EHDR as u16).to_le_bytes());
        out.extend_from_slice(&(PHDR as u16).to_le_bytes());
        out.extend_from_slice(&(segments.len() as u16).to_le_bytes());
        out.extend_from_slice(&64u16.to_le_bytes()); // shentsize
        out.extend_from_slice(&0u16.to_le_bytes()); // shnum
        out.extend_from_slice(&0u16.to_le_bytes()); // shstrndx
        assert_eq!(out.len(), EHDR);

        let mut data_offset = (EHDR + PHDR * segments.len()) as u64;
        for (paddr, data) in segments {
            out.extend_from_slice(&program_header::PT_LOAD.to_le_bytes());
            out.extend_from_slice(&4u32.to_le_bytes()); // PF_R
            out.extend_from_slice(&data_offset.to_le_bytes());
            out.extend_from_slice(&(0xffff_8000_0000_0000u64 + paddr).to_le_bytes());
            out.extend_from_slice(&paddr.to_le_bytes());
            out.extend_from_slice(&(data.len() as u64).to_le_bytes());
            out.extend_from_slice(&(data.len() as u64).to_le_bytes());
            out.extend_from_slice(&0x1000u64.to_le_bytes());
            data_offset += data.len() as u64;
        }
        for (_, data) in segments {
            out.extend_from_slice(data);
        }
        out
    }

    fn write_temp(bytes: &[u8]) -> NamedTempFile {
        let mut tmp = NamedTempFile::new().unwrap();
        tmp.write_all(bytes).unwrap();
        tmp.flush().unwrap();
        tmp
    }

    #[test]
    fn test_lime_runs() {
        let image = lime_image(&[(0x1000, b"AAAA"), (0x1004, b"BBBB"), (0x8000, b"CC")]);
        assert!(SegmentedStore::is_lime(&image));
        let tmp = write_temp(&image);
        let store = SegmentedStore::open_lime(tmp.path()).unwrap();

        assert_eq!(store.segments().len(), 3);
        // Adjacent runs coalesce in the run list.
        assert_eq!(store.runs(), vec![0x1000..0x1008, 0x8000..0x8002]);
        assert_eq!(store.size(), 0x8002);
        assert_eq!(store.read_raw(0x1002, 2).unwrap(), b"AA");
        assert_eq!(store.read_raw(0x1004, 4).unwrap(), b"BBBB");
        assert_eq!(store.read_raw(0x8000, 2).unwrap(), b"CC");
        // Gaps and run-crossing reads are errors at this layer.
        assert!(store.read_raw(0x2000, 1).is_err());
        assert!(store.read_raw(0x1002, 4).is_err());
    }

    #[test]
    fn test_truncated_lime_segment() {
        let mut image = lime_image(&[(0x0, b"AAAA")]);
        image.truncate(image.len() - 2);
        let tmp = write_temp(&image);
        assert!(matches!(
            SegmentedStore::open_lime(tmp.path()),
            Err(MemoryError::Container(_))
        ));
    }

    #[test]
    fn test_elf_core_runs() {
        let image = elf_core_image(&[(0x2000, b"core"), (0x0, b"low!")]);
        assert!(SegmentedStore::is_elf_core(&image));
        assert!(!SegmentedStore::is_lime(&image));
        let tmp = write_temp(&image);
        let store = SegmentedStore::open_elf_core(tmp.path()).unwrap();

        // p_paddr 0 falls back to p_vaddr.
        let starts: Vec<u64> = store.segments().iter().map(|r| r.start).collect();
        assert_eq!(starts, vec![0x2000, 0xffff_8000_0000_0000]);
        assert_eq!(store.read_raw(0x2000, 4).unwrap(), b"core");
        assert_eq!(store.read_raw(0xffff_8000_0000_0000, 4).unwrap(), b"low!");
    }

    #[test]
    fn test_overlapping_runs_are_dropped() {
        let tmp = write_temp(&[0u8; 64]);
        let file = MmapFileStore::open_path(tmp.path()).unwrap();
        let store = SegmentedStore::new(
            "overlap",
            file,
            vec![
                Run { start: 0, file_offset: 0, length: 16 },
                Run { start: 8, file_offset: 16, length: 16 },
                Run { start: 16, file_offset: 32, length: 16 },
            ],
        )
        .unwrap();
        assert_eq!(store.segments().len(), 2);
        assert_eq!(store.runs(), vec![0..32]);
    }
}
