//! Intel x86 paging structures.
//!
//! ```text
//! AMD64   (48-bit VA, 8-byte entries):  PML4 9 | PDPT 9 (1G) | PD 9 (2M) | PT 9 | offset 12
//! PAE     (32-bit VA, 8-byte entries):  PDPT 2 | PD 9 (2M) | PT 9 | offset 12
//! INTEL32 (32-bit VA, 4-byte entries):  PD 10 (4M) | PT 10 | offset 12
//! ```
//!
//! Windows additionally marks non-present PTEs with a prototype bit (10) and
//! a transition bit (11). A transition PTE (V=0, T=1, P=0) still points at
//! the right physical frame, so it may optionally be treated as valid.

use serde::{Deserialize, Serialize};

/// Page table entry flags.
pub const PAGE_PRESENT: u64 = 1 << 0;
pub const PAGE_PSE: u64 = 1 << 7; // Page Size Extension (large page)
pub const PAGE_PROTOTYPE: u64 = 1 << 10;
pub const PAGE_TRANSITION: u64 = 1 << 11;

pub const PAGE_SHIFT: u32 = 12;
pub const PAGE_SIZE: u64 = 1 << PAGE_SHIFT;

/// One level of the table hierarchy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Level {
    pub name: &'static str,
    /// Virtual address bits consumed by this level's index.
    pub bits: u32,
    /// Whether an entry at this level may map a large page directly.
    pub large_page: bool,
}

const AMD64_STRUCTURE: [Level; 4] = [
    Level { name: "page map layer 4", bits: 9, large_page: false },
    Level { name: "page directory pointer", bits: 9, large_page: true },
    Level { name: "page directory", bits: 9, large_page: true },
    Level { name: "page table", bits: 9, large_page: false },
];

const PAE_STRUCTURE: [Level; 3] = [
    Level { name: "page directory pointer", bits: 2, large_page: false },
    Level { name: "page directory", bits: 9, large_page: true },
    Level { name: "page table", bits: 9, large_page: false },
];

const INTEL32_STRUCTURE: [Level; 2] = [
    Level { name: "page directory", bits: 10, large_page: true },
    Level { name: "page table", bits: 10, large_page: false },
];

/// Longest walk of any supported mode.
pub const MAX_WALK_DEPTH: usize = AMD64_STRUCTURE.len();

/// Paging mode of a virtual address space.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PagingMode {
    #[default]
    Amd64,
    Pae,
    Intel32,
}

impl PagingMode {
    pub fn structure(&self) -> &'static [Level] {
        match self {
            PagingMode::Amd64 => &AMD64_STRUCTURE,
            PagingMode::Pae => &PAE_STRUCTURE,
            PagingMode::Intel32 => &INTEL32_STRUCTURE,
        }
    }

    /// Bytes per table entry.
    pub fn entry_size(&self) -> usize {
        match self {
            PagingMode::Intel32 => 4,
            _ => 8,
        }
    }

    pub fn max_phys_bits(&self) -> u32 {
        match self {
            PagingMode::Amd64 => 52,
            PagingMode::Pae => 36,
            PagingMode::Intel32 => 32,
        }
    }

    pub fn max_virt_bits(&self) -> u32 {
        match self {
            PagingMode::Amd64 => 48,
            _ => 32,
        }
    }

    /// Required alignment of the root table address.
    pub fn root_alignment(&self) -> u64 {
        match self {
            PagingMode::Pae => 32,
            _ => PAGE_SIZE,
        }
    }

    /// Size in bytes of a table at `level`.
    pub fn table_size(&self, level: &Level) -> usize {
        (1usize << level.bits) * self.entry_size()
    }

    /// Highest virtual address. AMD64 covers the whole 64-bit range, of
    /// which only canonical addresses translate.
    pub fn maximum_address(&self) -> u64 {
        match self {
            PagingMode::Amd64 => u64::MAX,
            _ => (1u64 << self.max_virt_bits()) - 1,
        }
    }

    /// Whether `addr` is representable in this mode (canonical on AMD64).
    pub fn is_addressable(&self, addr: u64) -> bool {
        match self {
            PagingMode::Amd64 => {
                let top = addr >> (self.max_virt_bits() - 1);
                top == 0 || top == (u64::MAX >> (self.max_virt_bits() - 1))
            }
            _ => addr <= self.maximum_address(),
        }
    }

    /// Sign-extend a table-derived address into canonical form.
    pub fn canonicalize(&self, addr: u64) -> u64 {
        match self {
            PagingMode::Amd64 if addr & (1u64 << 47) != 0 => addr | 0xffff_0000_0000_0000,
            _ => addr,
        }
    }

    /// Next addressable offset at or after `addr` (skips the AMD64
    /// non-canonical hole).
    pub fn next_addressable(&self, addr: u64) -> Option<u64> {
        if self.is_addressable(addr) {
            return Some(addr);
        }
        match self {
            PagingMode::Amd64 if addr < 0xffff_8000_0000_0000 => Some(0xffff_8000_0000_0000),
            _ => None,
        }
    }
}

impl std::str::FromStr for PagingMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "amd64" | "intel32e" | "x64" => Ok(PagingMode::Amd64),
            "pae" | "intelpae" => Ok(PagingMode::Pae),
            "intel32" | "intel" | "x86" => Ok(PagingMode::Intel32),
            other => Err(format!("unknown paging mode '{}'", other)),
        }
    }
}

/// Mask `value` to bits `low_bit..=high_bit`.
#[inline]
pub fn mask(value: u64, high_bit: u32, low_bit: u32) -> u64 {
    let high_mask = if high_bit >= 63 {
        u64::MAX
    } else {
        (1u64 << (high_bit + 1)).wrapping_sub(1)
    };
    let low_mask = if low_bit >= 64 {
        u64::MAX
    } else {
        (1u64 << low_bit).wrapping_sub(1)
    };
    value & (high_mask ^ low_mask)
}

/// Whether an entry maps something. With `transition`, Windows transition
/// entries count as valid.
#[inline]
pub fn page_is_valid(entry: u64, transition: bool) -> bool {
    if entry & PAGE_PRESENT != 0 {
        return true;
    }
    transition && entry & PAGE_TRANSITION != 0 && entry & PAGE_PROTOTYPE == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mask() {
        assert_eq!(mask(0xFF, 7, 0), 0xFF);
        assert_eq!(mask(0xFF, 7, 4), 0xF0);
        assert_eq!(mask(0x12345678, 15, 8), 0x5600);
        assert_eq!(mask(u64::MAX, 63, 0), u64::MAX);
    }

    #[test]
    fn test_page_is_valid() {
        assert!(page_is_valid(0x1, false));
        assert!(page_is_valid(0x1001, false));
        assert!(!page_is_valid(0x0, false));
        assert!(!page_is_valid(0x1000, false));

        let transition = 0x5000 | PAGE_TRANSITION;
        assert!(!page_is_valid(transition, false));
        assert!(page_is_valid(transition, true));
        assert!(!page_is_valid(transition | PAGE_PROTOTYPE, true));
    }

    #[test]
    fn test_mode_geometry() {
        assert_eq!(PagingMode::Amd64.table_size(&AMD64_STRUCTURE[0]), 4096);
        assert_eq!(PagingMode::Pae.table_size(&PAE_STRUCTURE[0]), 32);
        assert_eq!(PagingMode::Intel32.table_size(&INTEL32_STRUCTURE[1]), 4096);
        let total: u32 = PagingMode::Amd64.structure().iter().map(|l| l.bits).sum();
        assert_eq!(total + PAGE_SHIFT, 48);
        let total: u32 = PagingMode::Pae.structure().iter().map(|l| l.bits).sum();
        assert_eq!(total + PAGE_SHIFT, 32);
    }

    #[test]
    fn test_canonical_addresses() {
        let mode = PagingMode::Amd64;
        assert!(mode.is_addressable(0x0000_7fff_ffff_ffff));
        assert!(mode.is_addressable(0xffff_8000_0000_0000));
        assert!(!mode.is_addressable(0x0000_8000_0000_0000));
        assert_eq!(mode.next_addressable(0x0000_8000_0000_0000), Some(0xffff_8000_0000_0000));
        assert_eq!(mode.canonicalize(0x0000_8000_0000_1000), 0xffff_8000_0000_1000);
        assert_eq!(PagingMode::Intel32.next_addressable(0x1_0000_0000), None);
        assert_eq!("pae".parse::<PagingMode>().unwrap(), PagingMode::Pae);
    }
}
