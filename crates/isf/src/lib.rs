//! ISF (Intermediate Symbol Format) profiles.
//!
//! This crate loads the JSON-based ISF documents that describe a target's
//! kernel structures, symbols and enums, and resolves them into a
//! [`Profile`]:
//!
//! - Parsing of `.json` and `.json.xz` (LZMA-compressed) ISF files
//! - Runtime type descriptors for structs, unions, pointers, arrays, enums
//!   and bitfields
//! - Field-level overlay merging for hot-fixing layouts
//! - Symbol lookup with base address relocation
//!
//! # Example
//!
//! ```rust,ignore
//! use isf::load_profile;
//!
//! let profile = load_profile("ntkrnlmp.json.xz", &["fixes.json"])?;
//! let eprocess_size = profile.type_size("_EPROCESS");
//! let pid_offset = profile.field_offset("_EPROCESS", "UniqueProcessId");
//! ```

pub mod descriptor;
pub mod error;
pub mod merge;
pub mod parser;
pub mod profile;
pub mod types;

// Re-export key types at crate root.
pub use descriptor::{
    decode_unsigned, sign_extend, ArrayCount, BitRange, EnumType, Endian, Field, Primitive,
    PrimitiveKind, StructKind, StructType, TypeDescriptor,
};
pub use error::{IsfError, IsfResult};
pub use merge::merge;
pub use parser::{
    load_profile, parse_isf_bytes, parse_isf_file, parse_isf_str, parse_overlay_file,
    parse_overlay_str,
};
pub use profile::{Profile, SymbolDef};
pub use types::Metadata;
