//! strata: layered memory-image analysis.
//!
//! - `memory` - backing stores, the physical space, page-table translation
//!   and pattern scanning
//! - `object` - profile-driven typed views over address spaces
//! - `plugins` - the plugin trait, records, registry and generic built-ins
//! - `session` - one image, profile and paging setup with its registry
//! - `config` - session configuration

pub mod config;
pub mod memory;
pub mod object;
pub mod plugins;
pub mod session;

pub use config::SessionConfig;
pub use session::{ProfileSource, Session, SessionError};
