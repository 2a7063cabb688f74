//! In-memory backing store.

use crate::memory::error::{MemoryError, MemoryResult};
use crate::memory::traits::BackingStore;
use std::ops::Range;

/// Image bytes held in a `Vec`, optionally with holes.
///
/// Used for images that are already in memory (carved regions, decoded
/// snapshots) and for building synthetic images.
pub struct BufferStore {
    name: String,
    data: Vec<u8>,
    holes: Vec<Range<u64>>,
}

impl BufferStore {
    pub fn new(name: impl Into<String>, data: Vec<u8>) -> Self {
        BufferStore {
            name: name.into(),
            data,
            holes: Vec::new(),
        }
    }

    /// Mark a range as not populated.
    pub fn with_hole(mut self, hole: Range<u64>) -> Self {
        self.holes.push(hole);
        self.holes.sort_by_key(|r| r.start);
        self
    }

    fn in_hole(&self, range: &Range<u64>) -> bool {
        self.holes
            .iter()
            .any(|h| h.start < range.end && range.start < h.end)
    }
}

impl BackingStore for BufferStore {
    fn read_raw(&self, offset: u64, length: usize) -> MemoryResult<Vec<u8>> {
        let end = offset.saturating_add(length as u64);
        if end > self.data.len() as u64 || self.in_hole(&(offset..end)) {
            return Err(MemoryError::backing_store(
                &self.name,
                offset,
                "range not populated",
            ));
        }
        Ok(self.data[offset as usize..end as usize].to_vec())
    }

    fn size(&self) -> u64 {
        self.data.len() as u64
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn runs(&self) -> Vec<Range<u64>> {
        let mut runs = Vec::new();
        let mut pos = 0u64;
        let size = self.size();
        for hole in &self.holes {
            if hole.start > pos {
                runs.push(pos..hole.start.min(size));
            }
            pos = pos.max(hole.end);
        }
        if pos < size {
            runs.push(pos..size);
        }
        runs.retain(|r| r.start < r.end);
        runs
    }
}
