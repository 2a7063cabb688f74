//! Virtual address translation.
//!
//! - `intel` - x86 paging geometry (AMD64, PAE, 32-bit) and entry decoding
//! - `paging` - the generic table walker shared by every mode

pub mod intel;
pub mod paging;

pub use intel::PagingMode;
pub use paging::{Miss, PagedSpace, PagingOptions, VtopTrace, WalkStep};
