//! Hierarchical page-table translation.
//!
//! [`PagedSpace`] walks Intel-style page tables stored in a parent address
//! space. Every walk is bounded by the mode's level count and keeps a visited
//! set of table addresses, so a table that points back at itself (or at any
//! table already on the current path) ends the walk: that page reads as
//! unmapped instead of looping or mapping garbage.
//!
//! Two caches sit in front of the walker:
//! - translations, keyed by 4K-aligned virtual page. Insert-only, so its size
//!   is bounded by the number of distinct pages touched.
//! - table pages read from the parent, in an LRU.

use crate::memory::error::{MemoryError, MemoryResult};
use crate::memory::traits::{AddressSpace, FillPolicy, MappedRange, PartialRead, Translation};
use crate::memory::translators::intel::{
    mask, page_is_valid, PagingMode, MAX_WALK_DEPTH, PAGE_PSE, PAGE_SHIFT, PAGE_SIZE,
};
use isf::{decode_unsigned, Endian};
use lru::LruCache;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Default capacity of the table-page LRU.
pub const DEFAULT_TABLE_CACHE: usize = 4096;

/// Most tables a single `mapped_ranges` enumeration will read.
const MAX_ENUM_TABLES: usize = 1 << 16;

/// Why a walk did not produce a mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Miss {
    /// An entry on the path is not present.
    NotPresent,
    /// A table could not be fully read, or is filled with one repeated entry.
    BadTable,
    /// A table on the path was already visited in this walk.
    Cycle,
    /// The address is outside the mode's virtual range.
    NonCanonical,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Walk {
    Mapped { frame: u64, page_size: u64 },
    /// `invalid_bits`: log2 of the size of the unmapped region around the
    /// address, used to skip ahead.
    Unmapped { invalid_bits: u32, miss: Miss },
}

/// One level of a walk, for diagnostics.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WalkStep {
    pub level: &'static str,
    pub table: u64,
    pub index: u64,
    pub entry_address: u64,
    pub entry: u64,
}

/// Result of [`PagedSpace::vtop`].
#[derive(Debug, Clone, Serialize)]
pub struct VtopTrace {
    pub address: u64,
    pub steps: Vec<WalkStep>,
    pub physical: Option<u64>,
    pub page_size: Option<u64>,
    pub miss: Option<Miss>,
}

/// Options for building a [`PagedSpace`].
#[derive(Debug, Clone)]
pub struct PagingOptions {
    /// Treat Windows transition PTEs as valid.
    pub transition: bool,
    pub fill_policy: FillPolicy,
    pub table_cache_size: usize,
}

impl Default for PagingOptions {
    fn default() -> Self {
        PagingOptions {
            transition: false,
            fill_policy: FillPolicy::Zero,
            table_cache_size: DEFAULT_TABLE_CACHE,
        }
    }
}

type TableKey = (u64, usize);

/// A virtual address space translated through page tables in `parent`.
pub struct PagedSpace {
    name: String,
    mode: PagingMode,
    root: u64,
    parent: Arc<dyn AddressSpace>,
    transition: bool,
    fill_policy: FillPolicy,
    translations: RwLock<HashMap<u64, Walk>>,
    tables: Mutex<LruCache<TableKey, Option<Arc<Vec<u8>>>>>,
}

impl PagedSpace {
    /// Build a paged space rooted at `dtb` (a CR3-style value; the low flag
    /// bits are dropped as the hardware does).
    ///
    /// Fails when the root table cannot be fully read from `parent` or has
    /// no valid entry.
    pub fn new(
        name: impl Into<String>,
        parent: Arc<dyn AddressSpace>,
        mode: PagingMode,
        dtb: u64,
        options: PagingOptions,
    ) -> MemoryResult<Self> {
        let name = name.into();
        let root = dtb & !(mode.root_alignment() - 1);
        let cache_size = NonZeroUsize::new(options.table_cache_size)
            .unwrap_or(NonZeroUsize::new(DEFAULT_TABLE_CACHE).unwrap_or(NonZeroUsize::MIN));

        let space = PagedSpace {
            name,
            mode,
            root,
            parent,
            transition: options.transition,
            fill_policy: options.fill_policy,
            translations: RwLock::new(HashMap::new()),
            tables: Mutex::new(LruCache::new(cache_size)),
        };
        space.validate_root()?;

        info!(
            "{}: {:?} paging, root {:#x} over '{}'",
            space.name,
            mode,
            root,
            space.parent.name()
        );
        Ok(space)
    }

    fn validate_root(&self) -> MemoryResult<()> {
        let level = &self.mode.structure()[0];
        let size = self.mode.table_size(level);
        let table = self.table(self.root, size).ok_or_else(|| {
            MemoryError::translation(
                &self.name,
                self.root,
                "root table is unreadable or degenerate",
            )
        })?;
        let entry_size = self.mode.entry_size();
        let any_valid =
            (0..size / entry_size).any(|i| page_is_valid(read_entry(&table, i, entry_size), false));
        if !any_valid {
            return Err(MemoryError::translation(
                &self.name,
                self.root,
                "root table has no valid entries",
            ));
        }
        Ok(())
    }

    pub fn mode(&self) -> PagingMode {
        self.mode
    }

    /// Physical address of the root table.
    pub fn root(&self) -> u64 {
        self.root
    }

    pub fn parent(&self) -> &Arc<dyn AddressSpace> {
        &self.parent
    }

    /// Read a table from the parent. `None` when any byte of it faults or
    /// when every entry is identical (garbage or a freed table).
    fn table(&self, address: u64, size: usize) -> Option<Arc<Vec<u8>>> {
        let key = (address, size);
        if let Some(cached) = self.tables.lock().get(&key) {
            return cached.clone();
        }

        let read = self.parent.read_partial(address, size);
        let table = if !read.is_complete() {
            debug!("{}: table at {:#x} not fully readable", self.name, address);
            None
        } else {
            let entry_size = self.mode.entry_size();
            let first = &read.data[..entry_size];
            let duplicate = size > entry_size
                && read.data.chunks_exact(entry_size).all(|chunk| chunk == first);
            if duplicate && first.iter().any(|b| *b != 0) {
                debug!("{}: table at {:#x} repeats one entry", self.name, address);
            }
            (!duplicate).then(|| Arc::new(read.data))
        };

        self.tables.lock().put(key, table.clone());
        table
    }

    fn walk(&self, vaddr: u64, mut trace: Option<&mut Vec<WalkStep>>) -> Walk {
        if !self.mode.is_addressable(vaddr) {
            return Walk::Unmapped {
                invalid_bits: self.mode.max_virt_bits() - 1,
                miss: Miss::NonCanonical,
            };
        }

        let structure = self.mode.structure();
        let max_phys = self.mode.max_phys_bits();
        let entry_size = self.mode.entry_size();

        let mut position = self.mode.max_virt_bits() - 1;
        let mut table_addr = self.root;
        let mut visited = [0u64; MAX_WALK_DEPTH];

        for (depth, level) in structure.iter().enumerate() {
            if visited[..depth].contains(&table_addr) {
                debug!(
                    "{}: cycle at table {:#x} translating {:#x}",
                    self.name, table_addr, vaddr
                );
                return Walk::Unmapped {
                    invalid_bits: position + 1,
                    miss: Miss::Cycle,
                };
            }
            visited[depth] = table_addr;

            let table = match self.table(table_addr, self.mode.table_size(level)) {
                Some(t) => t,
                None => {
                    return Walk::Unmapped {
                        invalid_bits: position + 1,
                        miss: Miss::BadTable,
                    }
                }
            };

            let low = position + 1 - level.bits;
            let index = mask(vaddr, position, low) >> low;
            let entry = read_entry(&table, index as usize, entry_size);
            if let Some(steps) = trace.as_deref_mut() {
                steps.push(WalkStep {
                    level: level.name,
                    table: table_addr,
                    index,
                    entry_address: table_addr + index * entry_size as u64,
                    entry,
                });
            }

            if !page_is_valid(entry, self.transition) {
                return Walk::Unmapped {
                    invalid_bits: low,
                    miss: Miss::NotPresent,
                };
            }

            let last = depth + 1 == structure.len();
            if last || (level.large_page && entry & PAGE_PSE != 0) {
                let frame = mask(entry, max_phys - 1, low) | mask(vaddr, low - 1, PAGE_SHIFT);
                return Walk::Mapped {
                    frame,
                    page_size: 1u64 << low,
                };
            }

            table_addr = mask(entry, max_phys - 1, PAGE_SHIFT);
            position = low - 1;
        }

        // Every mode's last level maps a page, so the loop always returns.
        Walk::Unmapped {
            invalid_bits: PAGE_SHIFT,
            miss: Miss::NotPresent,
        }
    }

    fn lookup(&self, vaddr: u64) -> Walk {
        let page = vaddr & !(PAGE_SIZE - 1);
        if let Some(hit) = self.translations.read().get(&page) {
            return *hit;
        }
        let walk = self.walk(page, None);
        self.translations.write().entry(page).or_insert(walk);
        walk
    }

    /// Walk `vaddr` and report every level visited.
    pub fn vtop(&self, vaddr: u64) -> VtopTrace {
        let mut steps = Vec::with_capacity(MAX_WALK_DEPTH);
        let walk = self.walk(vaddr, Some(&mut steps));
        match walk {
            Walk::Mapped { frame, page_size } => VtopTrace {
                address: vaddr,
                steps,
                physical: Some(frame + (vaddr & (PAGE_SIZE - 1))),
                page_size: Some(page_size),
                miss: None,
            },
            Walk::Unmapped { miss, .. } => VtopTrace {
                address: vaddr,
                steps,
                physical: None,
                page_size: None,
                miss: Some(miss),
            },
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn enumerate(
        &self,
        table_addr: u64,
        depth: usize,
        vbase: u64,
        position: u32,
        bounds: (u64, u64),
        path: &mut Vec<u64>,
        budget: &mut usize,
        out: &mut Vec<MappedRange>,
    ) {
        let structure = self.mode.structure();
        let level = &structure[depth];
        if path.contains(&table_addr) {
            debug!("{}: cycle at table {:#x} during enumeration", self.name, table_addr);
            return;
        }
        if *budget == 0 {
            return;
        }
        *budget -= 1;

        let table = match self.table(table_addr, self.mode.table_size(level)) {
            Some(t) => t,
            None => return,
        };

        let (start, end) = bounds;
        let entry_size = self.mode.entry_size();
        let max_phys = self.mode.max_phys_bits();
        let low = position + 1 - level.bits;
        let span = 1u64 << low;
        let last = depth + 1 == structure.len();

        path.push(table_addr);
        for index in 0..(1u64 << level.bits) {
            let va = vbase | (index << low);
            let canon = self.mode.canonicalize(va);
            let last_byte = canon.saturating_add(span - 1);
            if canon >= end || last_byte < start {
                continue;
            }
            let entry = read_entry(&table, index as usize, entry_size);
            if !page_is_valid(entry, self.transition) {
                continue;
            }
            if last || (level.large_page && entry & PAGE_PSE != 0) {
                let phys = mask(entry, max_phys - 1, low);
                let s = canon.max(start);
                let e = last_byte.min(end - 1);
                push_coalesced(
                    out,
                    MappedRange {
                        start: s,
                        length: e - s + 1,
                        mapped_offset: phys + (s - canon),
                    },
                );
            } else {
                let next = mask(entry, max_phys - 1, PAGE_SHIFT);
                self.enumerate(next, depth + 1, va, low - 1, bounds, path, budget, out);
            }
        }
        path.pop();
    }
}

fn read_entry(table: &[u8], index: usize, entry_size: usize) -> u64 {
    let at = index * entry_size;
    table
        .get(at..at + entry_size)
        .map(|b| decode_unsigned(b, Endian::Little))
        .unwrap_or(0)
}

fn push_coalesced(out: &mut Vec<MappedRange>, range: MappedRange) {
    if let Some(last) = out.last_mut() {
        if last.end() == range.start && last.mapped_offset + last.length == range.mapped_offset {
            last.length += range.length;
            return;
        }
    }
    out.push(range);
}

impl AddressSpace for PagedSpace {
    fn name(&self) -> &str {
        &self.name
    }

    fn maximum_address(&self) -> u64 {
        self.mode.maximum_address()
    }

    fn fill_policy(&self) -> FillPolicy {
        self.fill_policy
    }

    fn base_name(&self) -> Option<&str> {
        Some(self.parent.name())
    }

    fn translate(&self, offset: u64) -> Option<Translation> {
        match self.lookup(offset) {
            Walk::Mapped { frame, page_size } => Some(Translation {
                mapped_offset: frame + (offset & (PAGE_SIZE - 1)),
                page_size,
            }),
            Walk::Unmapped { .. } => None,
        }
    }

    fn read_partial(&self, offset: u64, length: usize) -> PartialRead {
        let mut out = PartialRead::filled(offset, length);
        let end = offset.saturating_add(length as u64);

        let mut pos = offset;
        while pos < end {
            match self.lookup(pos) {
                Walk::Mapped { frame, page_size } => {
                    let page_end = (pos - pos % page_size).saturating_add(page_size).min(end);
                    let phys = frame + (pos & (PAGE_SIZE - 1));
                    let take = (page_end - pos) as usize;
                    let at = (pos - offset) as usize;

                    let read = self.parent.read_partial(phys, take);
                    out.data[at..at + take].copy_from_slice(&read.data);
                    for fault in read.faults {
                        out.push_fault(pos + (fault.start - phys)..pos + (fault.end - phys));
                    }
                    if read.truncated > 0 {
                        out.push_fault(page_end - read.truncated..page_end);
                    }
                    pos = page_end;
                }
                Walk::Unmapped { invalid_bits, .. } => {
                    // Only the current 4K page is known to be unmapped when
                    // the walk stopped at the last level.
                    let span = (1u64 << invalid_bits.max(PAGE_SHIFT)) - 1;
                    let next = (pos | span).saturating_add(1).min(end);
                    let next = if next <= pos { end } else { next };
                    out.push_fault(pos..next);
                    pos = next;
                }
            }
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
            match self.lookup(pos) {
                Walk::Mapped { page_size, .. } => {
                    pos = match (pos - pos % page_size).checked_add(page_size) {
                        Some(next) => next,
                        None => return true,
                    };
                }
                Walk::Unmapped { .. } => return false,
            }
        }
        true
    }

    fn next_mapped(&self, offset: u64) -> Option<u64> {
        let mut pos = offset;
        loop {
            pos = self.mode.next_addressable(pos)?;
            match self.lookup(pos) {
                Walk::Mapped { .. } => return Some(pos),
                Walk::Unmapped { invalid_bits, .. } => {
                    let span = (1u64 << invalid_bits.max(PAGE_SHIFT)) - 1;
                    pos = (pos | span).checked_add(1)?;
                }
            }
        }
    }

    fn mapped_ranges(&self, start: u64, end: u64) -> Vec<MappedRange> {
        let mut out = Vec::new();
        if start >= end {
            return out;
        }
        let mut budget = MAX_ENUM_TABLES;
        let mut path = Vec::with_capacity(MAX_WALK_DEPTH);
        self.enumerate(
            self.root,
            0,
            0,
            self.mode.max_virt_bits() - 1,
            (start, end),
            &mut path,
            &mut budget,
            &mut out,
        );
        if budget == 0 {
            warn!(
                "{}: mapping enumeration stopped after {} tables",
                self.name, MAX_ENUM_TABLES
            );
        }
        out
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::memory::layers::{BufferStore, PhysicalSpace};
    use crate::memory::translators::intel::{PAGE_PRESENT, PAGE_TRANSITION};

    /// Builds a physical image and writes page-table entries into it.
    pub(crate) struct ImageBuilder {
        pub data: Vec<u8>,
        entry_size: usize,
    }

    impl ImageBuilder {
        pub(crate) fn new(size: usize, mode: PagingMode) -> Self {
            ImageBuilder {
                data: vec![0u8; size],
                entry_size: mode.entry_size(),
            }
        }

        pub(crate) fn entry(&mut self, table: u64, index: usize, value: u64) -> &mut Self {
            let at = table as usize + index * self.entry_size;
            let bytes = value.to_le_bytes();
            self.data[at..at + self.entry_size].copy_from_slice(&bytes[..self.entry_size]);
            self
        }

        pub(crate) fn fill(&mut self, at: u64, bytes: &[u8]) -> &mut Self {
            self.data[at as usize..at as usize + bytes.len()].copy_from_slice(bytes);
            self
        }

        pub(crate) fn physical(&self) -> Arc<dyn AddressSpace> {
            Arc::new(PhysicalSpace::new(
                Arc::new(BufferStore::new("synthetic", self.data.clone())),
                FillPolicy::Zero,
            ))
        }
    }

    fn paged(builder: &ImageBuilder, mode: PagingMode, root: u64) -> PagedSpace {
        PagedSpace::new("virtual", builder.physical(), mode, root, PagingOptions::default()).unwrap()
    }

    /// Two-level table: PD at 0x1000, PT at 0x2000.
    /// va 0x0000 -> 0x5000, va 0x1000 unmapped, va 0x2000 -> 0x6000,
    /// va 0x800000.. -> 4M large page at 0x400000.
    fn intel32_image() -> ImageBuilder {
        let mut b = ImageBuilder::new(0x8000, PagingMode::Intel32);
        b.entry(0x1000, 0, 0x2000 | PAGE_PRESENT)
            .entry(0x1000, 2, 0x0040_0000 | PAGE_PSE | PAGE_PRESENT)
            .entry(0x2000, 0, 0x5000 | PAGE_PRESENT)
            .entry(0x2000, 2, 0x6000 | PAGE_PRESENT)
            .fill(0x5000, &[b'A'; 0x1000])
            .fill(0x6000, &[b'B'; 0x1000]);
        b
    }

    #[test]
    fn test_two_level_valid_and_invalid_entries() {
        let space = paged(&intel32_image(), PagingMode::Intel32, 0x1000);

        let read = space.read_partial(0, 0x3000);
        assert_eq!(read.data.len(), 0x3000);
        assert!(read.data[..0x1000].iter().all(|b| *b == b'A'));
        assert!(read.data[0x1000..0x2000].iter().all(|b| *b == 0));
        assert!(read.data[0x2000..].iter().all(|b| *b == b'B'));
        assert_eq!(read.faults, vec![0x1000..0x2000]);

        assert_eq!(space.translate(0x2abc).map(|t| t.mapped_offset), Some(0x6abc));
        assert!(space.translate(0x1abc).is_none());
        assert!(space.is_mapped(0, 0x1000));
        assert!(!space.is_mapped(0, 0x1001));
    }

    #[test]
    fn test_large_page_translation() {
        let space = paged(&intel32_image(), PagingMode::Intel32, 0x1000);
        let t = space.translate(0x80_1234).unwrap();
        assert_eq!(t.mapped_offset, 0x40_1234);
        assert_eq!(t.page_size, 4 << 20);
        // Frame is beyond the 32K image: the parent faults, so does the read.
        let read = space.read_partial(0x80_1000, 16);
        assert_eq!(read.faults, vec![0x80_1000..0x80_1010]);
    }

    #[test]
    fn test_cyclic_table_terminates_as_unmapped() {
        let mut b = ImageBuilder::new(0x8000, PagingMode::Intel32);
        // PD[0] points back at the PD itself; PD[1] is a proper table.
        b.entry(0x1000, 0, 0x1000 | PAGE_PRESENT)
            .entry(0x1000, 1, 0x2000 | PAGE_PRESENT)
            .entry(0x2000, 0, 0x5000 | PAGE_PRESENT)
            .fill(0x5000, b"data");
        let space = paged(&b, PagingMode::Intel32, 0x1000);

        let read = space.read_partial(0, 0x2000);
        assert_eq!(read.faults, vec![0..0x2000]);
        assert_eq!(space.vtop(0x10).miss, Some(Miss::Cycle));
        assert_eq!(&space.read(0x40_0000, 4).unwrap(), b"data");

        let ranges = space.mapped_ranges(0, u64::MAX);
        assert_eq!(ranges.len(), 1);
        assert_eq!(ranges[0].start, 0x40_0000);
        assert_eq!(space.next_mapped(0), Some(0x40_0000));
    }

    #[test]
    fn test_fully_self_referencing_amd64_tables() {
        let mut b = ImageBuilder::new(0x4000, PagingMode::Amd64);
        for i in 0..512 {
            // Alternate two values so the table is not a single repeated entry.
            let flags = if i % 2 == 0 { PAGE_PRESENT } else { PAGE_PRESENT | 0x2 };
            b.entry(0x1000, i, 0x1000 | flags);
        }
        let space = paged(&b, PagingMode::Amd64, 0x1000);
        assert!(space.mapped_ranges(0, u64::MAX).is_empty());
        assert!(space.translate(0x7fff_0000_0000).is_none());
        assert_eq!(space.next_mapped(0), None);
    }

    fn amd64_image() -> ImageBuilder {
        let mut b = ImageBuilder::new(0x10000, PagingMode::Amd64);
        b.entry(0x1000, 0, 0x2000 | PAGE_PRESENT)
            .entry(0x1000, 256, 0x2000 | PAGE_PRESENT)
            .entry(0x2000, 0, 0x3000 | PAGE_PRESENT)
            .entry(0x3000, 0, 0x4000 | PAGE_PRESENT)
            .entry(0x3000, 1, 0x20_0000 | PAGE_PSE | PAGE_PRESENT)
            .entry(0x4000, 5, 0x8000 | PAGE_PRESENT | (1 << 63))
            .fill(0x8000, b"kernel page");
        b
    }

    #[test]
    fn test_amd64_walk_and_canonical_high_half() {
        // Low CR3 flag bits (PCID) are ignored.
        let space = paged(&amd64_image(), PagingMode::Amd64, 0x1002);
        assert_eq!(space.root(), 0x1000);

        assert_eq!(&space.read(0x5000, 11).unwrap(), b"kernel page");
        assert_eq!(
            &space.read(0xffff_8000_0000_5000, 11).unwrap(),
            b"kernel page"
        );
        assert_eq!(
            space.translate(0x20_0123).map(|t| (t.mapped_offset, t.page_size)),
            Some((0x20_0123, 2 << 20))
        );
        // Non-canonical addresses never translate.
        assert!(space.translate(0x0000_8000_0000_5000).is_none());
    }

    #[test]
    fn test_read_wrapping_past_top_reports_every_byte() {
        let space = paged(&amd64_image(), PagingMode::Amd64, 0x1000);
        let read = space.read_partial(u64::MAX - 3, 8);
        assert_eq!(read.data.len(), 8);
        assert_eq!(read.faults, vec![u64::MAX - 3..u64::MAX]);
        assert_eq!(read.faulted_bytes(), 8);
        assert!(!read.is_complete());
    }

    #[test]
    fn test_amd64_mapped_ranges_and_next_mapped() {
        let space = paged(&amd64_image(), PagingMode::Amd64, 0x1000);
        let ranges = space.mapped_ranges(0, u64::MAX);
        let summary: Vec<(u64, u64, u64)> = ranges
            .iter()
            .map(|r| (r.start, r.length, r.mapped_offset))
            .collect();
        assert_eq!(
            summary,
            vec![
                (0x5000, 0x1000, 0x8000),
                (0x20_0000, 0x20_0000, 0x20_0000),
                (0xffff_8000_0000_5000, 0x1000, 0x8000),
                (0xffff_8000_0020_0000, 0x20_0000, 0x20_0000),
            ]
        );

        let clipped = space.mapped_ranges(0x5800, 0x20_1000);
        assert_eq!(clipped[0].start, 0x5800);
        assert_eq!(clipped[0].mapped_offset, 0x8800);
        assert_eq!(clipped[1].length, 0x1000);

        assert_eq!(space.next_mapped(0), Some(0x5000));
        assert_eq!(space.next_mapped(0x6000), Some(0x20_0000));
        assert_eq!(space.next_mapped(0x40_0000), Some(0xffff_8000_0000_5000));
    }

    #[test]
    fn test_vtop_trace() {
        let space = paged(&amd64_image(), PagingMode::Amd64, 0x1000);
        let trace = space.vtop(0x5010);
        assert_eq!(trace.physical, Some(0x8010));
        assert_eq!(trace.steps.len(), 4);
        assert_eq!(trace.steps[3].level, "page table");
        assert_eq!(trace.steps[3].index, 5);
        assert_eq!(trace.steps[3].entry_address, 0x4000 + 5 * 8);

        let trace = space.vtop(0x6000);
        assert_eq!(trace.miss, Some(Miss::NotPresent));
        assert_eq!(trace.physical, None);
    }

    #[test]
    fn test_pae_walk() {
        let mut b = ImageBuilder::new(0x8000, PagingMode::Pae);
        // PDPT is 32 bytes at 0x1020.
        b.entry(0x1020, 1, 0x2000 | PAGE_PRESENT)
            .entry(0x2000, 0, 0x3000 | PAGE_PRESENT)
            .entry(0x2000, 1, 0x60_0000 | PAGE_PSE | PAGE_PRESENT)
            .entry(0x3000, 3, 0x7000 | PAGE_PRESENT)
            .fill(0x7000, b"pae");
        let space = paged(&b, PagingMode::Pae, 0x1020);
        assert_eq!(&space.read(0x4000_3000, 3).unwrap(), b"pae");
        assert_eq!(
            space.translate(0x4020_0010).map(|t| t.mapped_offset),
            Some(0x60_0010)
        );
        assert!(space.translate(0x3000).is_none());
    }

    #[test]
    fn test_transition_pages_are_optional() {
        let mut b = ImageBuilder::new(0x8000, PagingMode::Intel32);
        b.entry(0x1000, 0, 0x2000 | PAGE_PRESENT)
            .entry(0x2000, 0, 0x5000 | PAGE_PRESENT)
            .entry(0x2000, 1, 0x6000 | PAGE_TRANSITION)
            .fill(0x6000, b"standby");

        let strict = paged(&b, PagingMode::Intel32, 0x1000);
        assert!(strict.translate(0x1000).is_none());

        let lenient = PagedSpace::new(
            "virtual",
            b.physical(),
            PagingMode::Intel32,
            0x1000,
            PagingOptions {
                transition: true,
                ..PagingOptions::default()
            },
        )
        .unwrap();
        assert_eq!(&lenient.read(0x1000, 7).unwrap(), b"standby");
    }

    #[test]
    fn test_invalid_root_is_fatal() {
        let b = intel32_image();
        // Past the end of the image.
        let err = PagedSpace::new(
            "virtual",
            b.physical(),
            PagingMode::Intel32,
            0x10_0000,
            PagingOptions::default(),
        )
        .err()
        .unwrap();
        assert!(matches!(err, MemoryError::AddressTranslation { .. }));

        // Readable but empty.
        let err = PagedSpace::new(
            "virtual",
            b.physical(),
            PagingMode::Intel32,
            0x3000,
            PagingOptions::default(),
        )
        .err()
        .unwrap();
        assert!(matches!(err, MemoryError::AddressTranslation { .. }));
    }

    #[test]
    fn test_fault_policy_surfaces_partial_reads() {
        let b = intel32_image();
        let space = PagedSpace::new(
            "virtual",
            b.physical(),
            PagingMode::Intel32,
            0x1000,
            PagingOptions {
                fill_policy: FillPolicy::Fault,
                ..PagingOptions::default()
            },
        )
        .unwrap();
        assert!(space.read(0, 0x1000).is_ok());
        let err = space.read(0x800, 0x1000).unwrap_err();
        assert_eq!(err.faults, vec![0x1000..0x1800]);
    }
}
