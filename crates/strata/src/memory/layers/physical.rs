//! The physical address space: identity translation onto a backing store.

use crate::memory::traits::{
    AddressSpace, BackingStore, FillPolicy, MappedRange, PartialRead, Translation,
};
use std::ops::Range;
use std::sync::Arc;
use tracing::debug;

/// Granularity reported for physical translations.
const PHYSICAL_PAGE: u64 = 0x1000;

/// Offset N is byte N of the store. Bytes outside the store's runs, and runs
/// whose reads fail, are faults.
pub struct PhysicalSpace {
    name: String,
    store: Arc<dyn BackingStore>,
    runs: Vec<Range<u64>>,
    fill_policy: FillPolicy,
}

impl PhysicalSpace {
    pub fn new(store: Arc<dyn BackingStore>, fill_policy: FillPolicy) -> Self {
        let runs = store.runs();
        PhysicalSpace {
            name: "physical".to_string(),
            store,
            runs,
            fill_policy,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn store(&self) -> &Arc<dyn BackingStore> {
        &self.store
    }

    /// Index of the run containing `offset`, or of the first run after it.
    fn run_at_or_after(&self, offset: u64) -> Option<usize> {
        let idx = self.runs.partition_point(|r| r.end <= offset);
        (idx < self.runs.len()).then_some(idx)
    }
}

impl AddressSpace for PhysicalSpace {
    fn name(&self) -> &str {
        &self.name
    }

    fn maximum_address(&self) -> u64 {
        self.runs.last().map(|r| r.end - 1).unwrap_or(0)
    }

    fn fill_policy(&self) -> FillPolicy {
        self.fill_policy
    }

    fn base_name(&self) -> Option<&str> {
        Some(self.store.name())
    }

    fn translate(&self, offset: u64) -> Option<Translation> {
        let run = &self.runs[self.run_at_or_after(offset)?];
        (run.start <= offset).then_some(Translation {
            mapped_offset: offset,
            page_size: PHYSICAL_PAGE,
        })
    }

    fn read_partial(&self, offset: u64, length: usize) -> PartialRead {
        let mut out = PartialRead::filled(offset, length);
        let end = offset.saturating_add(length as u64);

        let mut pos = offset;
        while pos < end {
            let run = match self.run_at_or_after(pos) {
                Some(idx) => self.runs[idx].clone(),
                None => {
                    out.push_fault(pos..end);
                    break;
                }
            };
            if run.start > pos {
                let gap_end = run.start.min(end);
                out.push_fault(pos..gap_end);
                pos = gap_end;
                continue;
            }
            let take_end = run.end.min(end);
            let take = (take_end - pos) as usize;
            let at = (pos - offset) as usize;
            match self.store.read_raw(pos, take) {
                Ok(bytes) => {
                    let got = bytes.len().min(take);
                    out.data[at..at + got].copy_from_slice(&bytes[..got]);
                    if got < take {
                        debug!("{}: short read at {:#x}, {} of {} bytes", self.name, pos, got, take);
                        out.push_fault(pos + got as u64..take_end);
                    }
                }
                Err(e) => {
                    debug!("{}: {:#x}..{:#x} unreadable: {}", self.name, pos, take_end, e);
                    out.push_fault(pos..take_end);
                }
            }
            pos = take_end;
        }
        out
    }

    fn is_mapped(&self, offset: u64, length: u64) -> bool {
        if length == 0 {
            return false;
        }
        let end = match offset.checked_add(length) {
            Some(e) => e,
            None => return false,
        };
        let mut pos = offset;
        while pos < end {
            match self.run_at_or_after(pos).map(|i| &self.runs[i]) {
                Some(run) if run.start <= pos => pos = run.end,
                _ => return false,
            }
        }
        true
    }

    fn next_mapped(&self, offset: u64) -> Option<u64> {
        let run = &self.runs[self.run_at_or_after(offset)?];
        Some(run.start.max(offset))
    }

    fn mapped_ranges(&self, start: u64, end: u64) -> Vec<MappedRange> {
        self.runs
            .iter()
            .filter(|r| r.start < end && start < r.end)
            .map(|r| {
                let s = r.start.max(start);
                let e = r.end.min(end);
                MappedRange {
                    start: s,
                    length: e - s,
                    mapped_offset: s,
                }
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::layers::buffer::BufferStore;
    use crate::memory::layers::MmapFileStore;
    use std::io::Write;

    fn space_with_holes() -> PhysicalSpace {
        let data: Vec<u8> = (0..64u8).collect();
        let store = BufferStore::new("buf", data).with_hole(16..32);
        PhysicalSpace::new(Arc::new(store), FillPolicy::Zero)
    }

    #[test]
    fn test_flat_image_round_trip() {
        let mut tmp = tempfile::NamedTempFile::new().unwrap();
        let contents: Vec<u8> = (0..=255u8).cycle().take(8192).collect();
        tmp.write_all(&contents).unwrap();
        tmp.flush().unwrap();

        let store = MmapFileStore::open_path(tmp.path()).unwrap();
        let space = PhysicalSpace::new(Arc::new(store), FillPolicy::Fault);
        for (offset, len) in [(0u64, 16usize), (100, 4000), (8191, 1), (4096, 4096)] {
            let read = space.read(offset, len).unwrap();
            assert_eq!(read, &contents[offset as usize..offset as usize + len]);
        }
        assert_eq!(space.maximum_address(), 8191);
        assert!(space.is_mapped(0, 8192));
        assert!(!space.is_mapped(0, 8193));
    }

    #[test]
    fn test_hole_is_filled_and_reported() {
        let space = space_with_holes();
        let read = space.read_partial(8, 32);
        assert_eq!(read.data.len(), 32);
        assert_eq!(&read.data[..8], &[8, 9, 10, 11, 12, 13, 14, 15]);
        assert!(read.data[8..24].iter().all(|b| *b == 0));
        assert_eq!(read.data[24], 32);
        assert_eq!(read.faults, vec![16..32]);
    }

    #[test]
    fn test_out_of_range_reads_never_fail_under_zero_policy() {
        let space = space_with_holes();
        let read = space.read(1000, 8).unwrap();
        assert_eq!(read, vec![0u8; 8]);

        let read = space.read_partial(u64::MAX - 3, 8);
        assert_eq!(read.data.len(), 8);
        assert_eq!(read.faults, vec![u64::MAX - 3..u64::MAX]);
        assert_eq!(read.faulted_bytes(), 8);
        assert_eq!(space.read_partial(u64::MAX, 1).faulted_bytes(), 1);
    }

    #[test]
    fn test_fault_policy_reports_partial_read() {
        let data: Vec<u8> = vec![0xAA; 32];
        let store = BufferStore::new("buf", data).with_hole(8..16);
        let space = PhysicalSpace::new(Arc::new(store), FillPolicy::Fault);
        let err = space.read(0, 32).unwrap_err();
        assert_eq!(err.faults, vec![8..16]);
        assert_eq!(err.data[0], 0xAA);
        assert_eq!(err.data[8], 0);
    }

    /// Claims eight bytes but only ever returns four.
    struct ShortStore;

    impl BackingStore for ShortStore {
        fn read_raw(&self, _offset: u64, length: usize) -> crate::memory::MemoryResult<Vec<u8>> {
            Ok(vec![0xCC; length.min(4)])
        }

        fn size(&self) -> u64 {
            8
        }

        fn name(&self) -> &str {
            "short"
        }
    }

    #[test]
    fn test_short_store_read_is_a_fault() {
        let space = PhysicalSpace::new(Arc::new(ShortStore), FillPolicy::Fault);
        let read = space.read_partial(0, 8);
        assert_eq!(&read.data[..4], &[0xCC; 4]);
        assert_eq!(&read.data[4..], &[0; 4]);
        assert_eq!(read.faults, vec![4..8]);
        assert!(!read.is_complete());
        assert!(space.read(0, 8).is_err());
    }

    #[test]
    fn test_next_mapped_and_ranges() {
        let space = space_with_holes();
        assert_eq!(space.next_mapped(0), Some(0));
        assert_eq!(space.next_mapped(20), Some(32));
        assert_eq!(space.next_mapped(64), None);
        assert!(space.translate(20).is_none());
        assert_eq!(space.translate(40).map(|t| t.mapped_offset), Some(40));

        let ranges = space.mapped_ranges(8, 40);
        assert_eq!(ranges.len(), 2);
        assert_eq!((ranges[0].start, ranges[0].length), (8, 8));
        assert_eq!((ranges[1].start, ranges[1].length), (32, 8));
    }
}
