//! Chunked multi-pattern scanner.
//!
//! An address space is read in chunks of `chunk_size` bytes, each extended by
//! `overlap` bytes (at least the longest pattern minus one). A match belongs
//! to the chunk that contains its first byte, so a match straddling a chunk
//! boundary is found exactly once: by the earlier chunk, through its overlap.
//!
//! With `skip_unmapped`, chunks never read past the end of the mapped stretch
//! they start in, so every match lies wholly inside mapped memory.

use crate::memory::scanners::needle::find_all_with;
use crate::memory::scanners::{ScanConfig, ScanError, ScanMatch, ScanRange};
use crate::memory::traits::AddressSpace;
use aho_corasick::{AhoCorasick, AhoCorasickBuilder, MatchKind};
use memchr::memmem::Finder;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::ops::Range;
use std::sync::Arc;
use tracing::debug;

enum Matcher {
    /// One pattern: memmem.
    Single(Finder<'static>),
    /// Several patterns: one Aho-Corasick automaton, overlapping search.
    Multi(AhoCorasick),
}

pub struct Scanner {
    patterns: Vec<Vec<u8>>,
    matcher: Matcher,
    chunk_size: usize,
    overlap: usize,
    alignment: Option<u64>,
    skip_unmapped: bool,
}

impl std::fmt::Debug for Scanner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scanner")
            .field("patterns", &self.patterns.len())
            .field("chunk_size", &self.chunk_size)
            .field("overlap", &self.overlap)
            .field("alignment", &self.alignment)
            .field("skip_unmapped", &self.skip_unmapped)
            .finish()
    }
}

impl Scanner {
    pub fn new(patterns: Vec<Vec<u8>>, config: ScanConfig) -> Result<Self, ScanError> {
        if patterns.is_empty() {
            return Err(ScanError::NoPatterns);
        }
        if let Some(idx) = patterns.iter().position(|p| p.is_empty()) {
            return Err(ScanError::EmptyPattern(idx));
        }
        if config.chunk_size == 0 {
            return Err(ScanError::InvalidConfig("chunk_size must be non-zero".into()));
        }
        if config.alignment == Some(0) {
            return Err(ScanError::InvalidConfig("alignment must be non-zero".into()));
        }

        let longest = patterns.iter().map(Vec::len).max().unwrap_or(1);
        let overlap = config.overlap.unwrap_or(0).max(longest - 1);

        let matcher = if patterns.len() == 1 {
            Matcher::Single(Finder::new(&patterns[0]).into_owned())
        } else {
            let automaton = AhoCorasickBuilder::new()
                .match_kind(MatchKind::Standard)
                .build(&patterns)
                .map_err(|e| ScanError::Build(e.to_string()))?;
            Matcher::Multi(automaton)
        };

        Ok(Scanner {
            patterns,
            matcher,
            chunk_size: config.chunk_size,
            overlap,
            alignment: config.alignment,
            skip_unmapped: config.skip_unmapped,
        })
    }

    pub fn patterns(&self) -> &[Vec<u8>] {
        &self.patterns
    }

    pub fn pattern(&self, id: usize) -> Option<&[u8]> {
        self.patterns.get(id).map(Vec::as_slice)
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    /// Effective overlap after raising it to the longest pattern.
    pub fn overlap(&self) -> usize {
        self.overlap
    }

    /// Matches in `data` (located at `base`) whose first byte lies in the
    /// first `owned` bytes, sorted.
    fn find_in(&self, data: &[u8], base: u64, owned: usize) -> Vec<ScanMatch> {
        let mut found: Vec<ScanMatch> = match &self.matcher {
            Matcher::Single(finder) => find_all_with(finder, data)
                .into_iter()
                .take_while(|pos| *pos < owned)
                .map(|pos| ScanMatch {
                    offset: base + pos as u64,
                    pattern_id: 0,
                })
                .collect(),
            Matcher::Multi(automaton) => automaton
                .find_overlapping_iter(data)
                .filter(|m| m.start() < owned)
                .map(|m| ScanMatch {
                    offset: base + m.start() as u64,
                    pattern_id: m.pattern().as_usize(),
                })
                .collect(),
        };
        if let Some(align) = self.alignment {
            found.retain(|m| m.offset % align == 0);
        }
        found.sort_unstable();
        found.dedup();
        found
    }

    /// Scan a plain buffer located at `base`.
    pub fn scan_bytes(&self, data: &[u8], base: u64) -> Vec<ScanMatch> {
        self.find_in(data, base, data.len())
    }

    /// Read and scan the chunk owning `[start, owned_end)`, never reading at
    /// or past `limit`.
    fn scan_chunk(
        &self,
        space: &dyn AddressSpace,
        start: u64,
        owned_end: u64,
        limit: u64,
    ) -> Vec<ScanMatch> {
        let read_end = owned_end.saturating_add(self.overlap as u64).min(limit);
        let read = space.read_partial(start, (read_end - start) as usize);
        if !read.is_complete() {
            debug!(
                "{}: {} bytes of chunk {:#x}..{:#x} unreadable, scanned as fill",
                space.name(),
                read.faulted_bytes(),
                start,
                read_end
            );
        }
        self.find_in(&read.data, start, (owned_end - start) as usize)
    }

    /// Mapped stretches of `[start, end)`, clipped to it, with touching
    /// ranges coalesced.
    fn mapped_segments(space: &dyn AddressSpace, start: u64, end: u64) -> Vec<Range<u64>> {
        let mut segments: Vec<Range<u64>> = Vec::new();
        for range in space.mapped_ranges(start, end) {
            let (lo, hi) = (range.start.max(start), range.end().min(end));
            if lo >= hi {
                continue;
            }
            match segments.last_mut() {
                Some(last) if last.end == lo => last.end = hi,
                _ => segments.push(lo..hi),
            }
        }
        segments
    }

    fn limit(space: &dyn AddressSpace, range: &ScanRange) -> u64 {
        range
            .end
            .unwrap_or_else(|| space.maximum_address().saturating_add(1))
    }

    /// Lazily scan `range` of `space`.
    pub fn scan(self: &Arc<Self>, space: Arc<dyn AddressSpace>, range: ScanRange) -> ScanIter {
        let end = Self::limit(space.as_ref(), &range);
        ScanIter {
            scanner: self.clone(),
            space,
            next_chunk: (range.start < end).then_some(range.start),
            chunk_start: range.start,
            end,
            pending: VecDeque::new(),
            last: None,
        }
    }

    /// Continue a scan from a cursor taken with [`ScanIter::cursor`].
    pub fn resume(self: &Arc<Self>, space: Arc<dyn AddressSpace>, cursor: ScanCursor) -> ScanIter {
        ScanIter {
            scanner: self.clone(),
            space,
            next_chunk: (cursor.position < cursor.end).then_some(cursor.position),
            chunk_start: cursor.position,
            end: cursor.end,
            pending: VecDeque::new(),
            last: cursor.after,
        }
    }

    /// Scan `range` with chunks spread over the rayon pool. Returns every
    /// match, sorted and de-duplicated.
    pub fn scan_parallel(&self, space: &dyn AddressSpace, range: ScanRange) -> Vec<ScanMatch> {
        let end = Self::limit(space, &range);
        if range.start >= end {
            return Vec::new();
        }

        let segments: Vec<Range<u64>> = if self.skip_unmapped {
            Self::mapped_segments(space, range.start, end)
        } else {
            vec![range.start..end]
        };

        let chunk = self.chunk_size as u64;
        let mut results: Vec<ScanMatch> = segments
            .par_iter()
            .flat_map(|segment| {
                let count = (segment.end - segment.start).div_ceil(chunk);
                let segment = segment.clone();
                (0..count).into_par_iter().flat_map_iter(move |i| {
                    let start = segment.start + i * chunk;
                    let owned_end = start.saturating_add(chunk).min(segment.end);
                    self.scan_chunk(space, start, owned_end, segment.end)
                })
            })
            .collect();

        results.par_sort_unstable();
        results.dedup();
        results
    }
}

/// Where a scan stopped. Serializable so long scans can be checkpointed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanCursor {
    /// Start of the chunk to scan next.
    pub position: u64,
    /// Exclusive end of the scan.
    pub end: u64,
    /// Last match already delivered; matches at or before it are skipped.
    pub after: Option<ScanMatch>,
}

impl ScanCursor {
    pub fn is_finished(&self) -> bool {
        self.position >= self.end
    }
}

/// Lazy iterator over the matches of one scan, in ascending offset order.
/// Chunks are read on demand; dropping the iterator stops the scan.
pub struct ScanIter {
    scanner: Arc<Scanner>,
    space: Arc<dyn AddressSpace>,
    next_chunk: Option<u64>,
    /// Start of the chunk whose matches are in `pending`.
    chunk_start: u64,
    end: u64,
    pending: VecDeque<ScanMatch>,
    last: Option<ScanMatch>,
}

impl ScanIter {
    pub fn scanner(&self) -> &Arc<Scanner> {
        &self.scanner
    }

    pub fn space(&self) -> &Arc<dyn AddressSpace> {
        &self.space
    }

    /// Checkpoint. Resuming from it yields exactly the matches this iterator
    /// has not yet returned.
    pub fn cursor(&self) -> ScanCursor {
        let position = if !self.pending.is_empty() {
            self.chunk_start
        } else {
            self.next_chunk.unwrap_or(self.end)
        };
        ScanCursor {
            position,
            end: self.end,
            after: self.last,
        }
    }

    /// Read the next chunk into `pending`. Returns false when the scan is
    /// done.
    fn fill(&mut self) -> bool {
        let Some(mut start) = self.next_chunk else {
            return false;
        };
        let chunk = self.scanner.chunk_size as u64;
        let mut limit = self.end;
        if self.scanner.skip_unmapped {
            match self.space.next_mapped(start) {
                Some(mapped) if mapped < self.end => start = mapped,
                _ => {
                    self.next_chunk = None;
                    return false;
                }
            }
            // Only the window this chunk can read matters.
            let window_end = start
                .saturating_add(chunk)
                .saturating_add(self.scanner.overlap as u64)
                .min(self.end);
            limit = Scanner::mapped_segments(self.space.as_ref(), start, window_end)
                .first()
                .map_or(window_end, |run| run.end);
        }

        let owned_end = start.saturating_add(chunk).min(limit);
        let found = self
            .scanner
            .scan_chunk(self.space.as_ref(), start, owned_end, limit);

        self.chunk_start = start;
        self.next_chunk = (owned_end < self.end).then_some(owned_end);
        self.pending.extend(found);
        true
    }
}

impl Iterator for ScanIter {
    type Item = ScanMatch;

    fn next(&mut self) -> Option<ScanMatch> {
        loop {
            if let Some(m) = self.pending.pop_front() {
                if self.last.is_some_and(|last| m <= last) {
                    continue;
                }
                self.last = Some(m);
                return Some(m);
            }
            if !self.fill() {
                return None;
            }
        }
    }
}
