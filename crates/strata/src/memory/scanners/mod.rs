//! Pattern scanning over address spaces.
//!
//! - `scanner` - multi-pattern chunked scanner with lazy, resumable iteration
//!   and a rayon-parallel variant
//! - `needle` - single-pattern helpers over plain byte slices

pub mod needle;
pub mod scanner;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use scanner::{ScanCursor, ScanIter, Scanner};

/// Default bytes read per chunk.
pub const DEFAULT_CHUNK_SIZE: usize = 16 << 20;

/// One occurrence of a pattern.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ScanMatch {
    pub offset: u64,
    /// Index into the scanner's pattern list.
    pub pattern_id: usize,
}

/// Offsets to scan. `end` is exclusive; `None` scans to the end of the space.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ScanRange {
    pub start: u64,
    pub end: Option<u64>,
}

impl ScanRange {
    pub fn new(start: u64, end: u64) -> Self {
        ScanRange {
            start,
            end: Some(end),
        }
    }

    /// From `start` to the end of the space.
    pub fn from(start: u64) -> Self {
        ScanRange { start, end: None }
    }

    /// Everything.
    pub fn all() -> Self {
        ScanRange::default()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScanConfig {
    pub chunk_size: usize,
    /// Bytes read past each chunk. Raised to `longest pattern - 1` when
    /// smaller or absent.
    pub overlap: Option<usize>,
    /// Only report matches whose offset is a multiple of this.
    pub alignment: Option<u64>,
    /// Jump over unmapped stretches instead of reading them as fill bytes.
    pub skip_unmapped: bool,
}

impl Default for ScanConfig {
    fn default() -> Self {
        ScanConfig {
            chunk_size: DEFAULT_CHUNK_SIZE,
            overlap: None,
            alignment: None,
            skip_unmapped: true,
        }
    }
}

#[derive(Error, Debug)]
pub enum ScanError {
    #[error("No patterns given")]
    NoPatterns,

    #[error("Pattern {0} is empty")]
    EmptyPattern(usize),

    #[error("Invalid scan configuration: {0}")]
    InvalidConfig(String),

    #[error("Failed to build automaton: {0}")]
    Build(String),
}
