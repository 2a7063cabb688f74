//! Core traits for abstracting memory access.
//!
//! A [`BackingStore`] is where image bytes physically live (a raw file, LiME
//! segments, a compressed container). An [`AddressSpace`] is a view that maps
//! offsets onto a base: the physical space maps identically onto a store, a
//! paged space maps virtual pages onto its parent space.

use crate::memory::error::MemoryResult;
use serde::{Deserialize, Serialize};
use std::ops::Range;

/// What a read does about bytes that cannot be translated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FillPolicy {
    /// Fill with zeros and succeed.
    #[default]
    Zero,
    /// Fill with zeros but report the read as failed.
    Fault,
}

impl std::str::FromStr for FillPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "zero" => Ok(FillPolicy::Zero),
            "fault" => Ok(FillPolicy::Fault),
            other => Err(format!("unknown fill policy '{}'", other)),
        }
    }
}

/// Result of a read that may have hit unmapped bytes.
///
/// `data` is always exactly as long as requested; `faults` lists the
/// sub-ranges (absolute offsets, ordered, non-adjacent) that were filled.
/// A read running past the top of the 64-bit space has no representable
/// range for its tail; those bytes are filled and counted in `truncated`.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct PartialRead {
    pub data: Vec<u8>,
    pub faults: Vec<Range<u64>>,
    pub truncated: u64,
}

impl PartialRead {
    /// A zero-filled buffer for a read of `length` bytes at `offset`, with
    /// the bytes beyond `u64::MAX` already counted as truncated.
    pub fn filled(offset: u64, length: usize) -> Self {
        let representable = offset.saturating_add(length as u64) - offset;
        PartialRead {
            data: vec![0u8; length],
            faults: Vec::new(),
            truncated: length as u64 - representable,
        }
    }

    /// A read where every byte faulted.
    pub fn unmapped(offset: u64, length: usize) -> Self {
        let mut read = Self::filled(offset, length);
        read.push_fault(offset..offset.saturating_add(length as u64));
        read
    }

    pub fn is_complete(&self) -> bool {
        self.faults.is_empty() && self.truncated == 0
    }

    /// Number of bytes that were filled rather than read.
    pub fn faulted_bytes(&self) -> u64 {
        self.faults.iter().map(|r| r.end - r.start).sum::<u64>() + self.truncated
    }

    /// Record a faulted range, merging with the previous one when they touch.
    /// Ranges must be pushed in ascending order.
    pub fn push_fault(&mut self, range: Range<u64>) {
        if range.start >= range.end {
            return;
        }
        if let Some(last) = self.faults.last_mut() {
            if last.end >= range.start {
                last.end = last.end.max(range.end);
                return;
            }
        }
        self.faults.push(range);
    }
}

/// Where one offset lands in the base.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Translation {
    /// Offset in the base space (or store) the byte maps to.
    pub mapped_offset: u64,
    /// Size of the page that contains the offset.
    pub page_size: u64,
}

/// A contiguous mapped stretch of an address space.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct MappedRange {
    pub start: u64,
    pub length: u64,
    pub mapped_offset: u64,
}

impl MappedRange {
    pub fn end(&self) -> u64 {
        self.start.saturating_add(self.length)
    }
}

/// Trait for the storage under the physical address space.
pub trait BackingStore: Send + Sync {
    /// Read `length` bytes at logical `offset`. The range must lie inside one
    /// of [`BackingStore::runs`]; reads outside are reported as errors.
    fn read_raw(&self, offset: u64, length: usize) -> MemoryResult<Vec<u8>>;

    /// Logical size: one past the highest populated offset.
    fn size(&self) -> u64;

    /// The name of this store.
    fn name(&self) -> &str;

    /// Populated logical ranges, ordered and non-overlapping.
    fn runs(&self) -> Vec<Range<u64>> {
        vec![0..self.size()]
    }
}

/// Trait for reading through an address space.
pub trait AddressSpace: Send + Sync {
    /// The name of this space.
    fn name(&self) -> &str;

    /// Highest addressable offset.
    fn maximum_address(&self) -> u64;

    fn fill_policy(&self) -> FillPolicy;

    /// Name of the space this one translates into, if any.
    fn base_name(&self) -> Option<&str> {
        None
    }

    /// Translate one offset. `None` means unmapped.
    fn translate(&self, offset: u64) -> Option<Translation>;

    /// Read exactly `length` bytes, filling and reporting untranslatable ones.
    fn read_partial(&self, offset: u64, length: usize) -> PartialRead;

    /// Read under this space's fill policy.
    fn read(&self, offset: u64, length: usize) -> Result<Vec<u8>, PartialRead> {
        let read = self.read_partial(offset, length);
        match self.fill_policy() {
            FillPolicy::Fault if !read.is_complete() => Err(read),
            _ => Ok(read.data),
        }
    }

    /// Read with zero fill regardless of policy.
    fn read_padded(&self, offset: u64, length: usize) -> Vec<u8> {
        self.read_partial(offset, length).data
    }

    /// True when every byte of `[offset, offset + length)` translates.
    fn is_mapped(&self, offset: u64, length: u64) -> bool;

    /// First mapped offset at or after `offset`, if any.
    fn next_mapped(&self, offset: u64) -> Option<u64>;

    /// Mapped stretches intersecting `[start, end)`, in order.
    fn mapped_ranges(&self, start: u64, end: u64) -> Vec<MappedRange>;
}
