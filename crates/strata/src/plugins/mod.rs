//! Analysis plugins.
//!
//! A plugin reads from a [`PluginContext`] and produces a lazy stream of
//! [`Record`]s. The built-ins are generic: they drive the scanner, the
//! object model and the page-table walker without knowing any OS layout.
//!
//! - `search` - byte pattern search with context
//! - `structscan` - signature scan with a typed overlay per hit
//! - `listwalk` - walk a profile-described linked list
//! - `dump` - raw bytes at an offset
//! - `vtop` - page-table walk trace
//! - `mappings` - mapped virtual ranges

pub mod dump;
pub mod listwalk;
pub mod mappings;
pub mod record;
pub mod registry;
pub mod search;
pub mod structscan;
pub mod vtop;

use crate::config::{parse_u64, SessionConfig};
use crate::memory::scanners::ScanError;
use crate::memory::translators::PagedSpace;
use crate::memory::{AddressSpace, MemoryError};
use crate::object::{ObjectError, ObjectResult, TypedObject, Value};
use isf::{PrimitiveKind, Profile, TypeDescriptor};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;

pub use record::{records_to_json, Cell, Record, RecordBuilder, RecordError};
pub use registry::{PluginRegistry, Records};

/// Lazy stream of plugin output. An `Err` item becomes an error record in
/// place; the stream continues after it.
pub type RecordStream<'a> = Box<dyn Iterator<Item = Result<Record, RecordError>> + 'a>;

#[derive(Error, Debug)]
pub enum PluginError {
    #[error("Unknown plugin: {0}")]
    UnknownPlugin(String),

    #[error("Invalid parameters: {0}")]
    InvalidParams(String),

    #[error("No virtual address space (set physical_offset/dtb)")]
    MissingVirtualSpace,

    #[error("No profile loaded")]
    MissingProfile,

    #[error(transparent)]
    Object(#[from] ObjectError),

    #[error(transparent)]
    Memory(#[from] MemoryError),

    #[error(transparent)]
    Scan(#[from] ScanError),
}

/// Plugin metadata.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PluginInfo {
    pub name: String,
    pub description: String,
    pub category: String,
}

pub trait Plugin: Send + Sync {
    fn name(&self) -> &'static str;

    fn description(&self) -> &'static str;

    fn category(&self) -> &'static str {
        "generic"
    }

    /// Start the plugin. Parameter and setup errors are returned here;
    /// everything after is reported per record.
    fn run<'a>(
        &self,
        ctx: &'a PluginContext,
        params: &serde_json::Value,
    ) -> Result<RecordStream<'a>, PluginError>;

    fn info(&self) -> PluginInfo {
        PluginInfo {
            name: self.name().to_string(),
            description: self.description().to_string(),
            category: self.category().to_string(),
        }
    }
}

/// Read-only inputs shared by every plugin run of a session.
#[derive(Clone)]
pub struct PluginContext {
    pub physical: Arc<dyn AddressSpace>,
    pub virtual_space: Option<Arc<PagedSpace>>,
    pub profile: Option<Arc<Profile>>,
    pub config: SessionConfig,
}

/// Which layer a plugin reads from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Layer {
    Physical,
    Virtual,
}

impl PluginContext {
    pub fn new(physical: Arc<dyn AddressSpace>, config: SessionConfig) -> Self {
        PluginContext {
            physical,
            virtual_space: None,
            profile: None,
            config,
        }
    }

    pub fn require_virtual(&self) -> Result<&Arc<PagedSpace>, PluginError> {
        self.virtual_space
            .as_ref()
            .ok_or(PluginError::MissingVirtualSpace)
    }

    pub fn require_profile(&self) -> Result<&Arc<Profile>, PluginError> {
        self.profile.as_ref().ok_or(PluginError::MissingProfile)
    }

    /// The requested layer, or without a request the virtual layer when
    /// there is one.
    pub fn resolve_layer(&self, requested: Option<Layer>) -> Result<Layer, PluginError> {
        match (requested, &self.virtual_space) {
            (Some(Layer::Virtual), None) => Err(PluginError::MissingVirtualSpace),
            (Some(layer), _) => Ok(layer),
            (None, Some(_)) => Ok(Layer::Virtual),
            (None, None) => Ok(Layer::Physical),
        }
    }

    pub fn space(&self, layer: Layer) -> Result<Arc<dyn AddressSpace>, PluginError> {
        match layer {
            Layer::Physical => Ok(self.physical.clone()),
            Layer::Virtual => Ok(self.require_virtual()?.clone() as Arc<dyn AddressSpace>),
        }
    }
}

/// Decode plugin parameters. `null` counts as `{}`; a string holding JSON is
/// parsed first.
pub(crate) fn parse_params<T: DeserializeOwned>(params: &serde_json::Value) -> Result<T, PluginError> {
    let value = match params {
        serde_json::Value::Null => serde_json::Value::Object(serde_json::Map::new()),
        serde_json::Value::String(s) => serde_json::from_str(s)
            .map_err(|e| PluginError::InvalidParams(format!("params is not JSON: {}", e)))?,
        other => other.clone(),
    };
    serde_json::from_value(value).map_err(|e| PluginError::InvalidParams(e.to_string()))
}

/// Either an address or a symbol name, as plugins accept for start points.
pub(crate) fn resolve_address(
    ctx: &PluginContext,
    text: &str,
) -> Result<u64, PluginError> {
    if let Ok(addr) = parse_u64(text) {
        return Ok(addr);
    }
    let profile = ctx.require_profile()?;
    profile
        .symbol_address(text)
        .map_err(|e| PluginError::Object(e.into()))
}

/// Text of a character array, `None` for every other type.
fn char_array_text(obj: &TypedObject) -> ObjectResult<Option<String>> {
    let TypeDescriptor::Array { element, .. } = obj.resolved()? else {
        return Ok(None);
    };
    match obj.profile().resolve_descriptor(element)? {
        TypeDescriptor::Primitive(p) if p.kind == PrimitiveKind::Char && p.width == 1 => {
            Ok(Some(obj.read_cstring(obj.size() as usize)?))
        }
        TypeDescriptor::Primitive(p) if p.kind == PrimitiveKind::Char && p.width == 2 => {
            Ok(Some(obj.read_utf16_string(obj.size() as usize)?))
        }
        _ => Ok(None),
    }
}

/// Cell for the member at `path` of `obj`: character arrays as text, other
/// members as objects, failures inline.
pub(crate) fn field_cell(obj: &TypedObject, path: &str) -> Cell {
    let rendered = obj.path(path).and_then(|member| {
        Ok(match char_array_text(&member)? {
            Some(text) => Cell::Value(serde_json::Value::String(text)),
            None => Cell::Object(member),
        })
    });
    rendered.unwrap_or_else(|e| Cell::Error(e.to_string()))
}

/// Whether the member at `path` holds `expected`. Numbers compare by value,
/// strings against character arrays, enum names or hex/decimal text.
pub(crate) fn field_matches(
    obj: &TypedObject,
    path: &str,
    expected: &serde_json::Value,
) -> ObjectResult<bool> {
    let member = obj.path(path)?;
    if let Some(text) = char_array_text(&member)? {
        return Ok(expected.as_str() == Some(text.as_str()));
    }
    let value = member.value()?;
    Ok(match expected {
        serde_json::Value::Bool(b) => value == Value::Bool(*b),
        serde_json::Value::Number(n) => match (n.as_u64(), n.as_i64()) {
            (Some(u), _) => value.as_u64() == Some(u),
            (None, Some(i)) => value.as_i64() == Some(i),
            (None, None) => value.as_f64() == n.as_f64(),
        },
        serde_json::Value::String(s) => match &value {
            Value::Enum { name: Some(name), .. } if name == s => true,
            _ => parse_u64(s).is_ok_and(|n| value.as_u64() == Some(n)),
        },
        _ => false,
    })
}

/// One-line hex string (space-separated bytes).
pub(crate) fn hex_dump_inline(data: &[u8]) -> String {
    data.iter()
        .map(|b| format!("{:02x}", b))
        .collect::<Vec<_>>()
        .join(" ")
}

/// Bytes as printable ASCII, everything else as '.'.
pub(crate) fn printable_ascii(bytes: &[u8]) -> String {
    bytes
        .iter()
        .map(|&b| {
            if b.is_ascii_graphic() || b == b' ' {
                b as char
            } else {
                '.'
            }
        })
        .collect()
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use crate::memory::layers::{BufferStore, PhysicalSpace};
    use crate::memory::FillPolicy;

    /// A context over a flat buffer, no paging.
    pub fn flat_context(data: Vec<u8>) -> PluginContext {
        let store = Arc::new(BufferStore::new("test", data));
        let physical: Arc<dyn AddressSpace> = Arc::new(PhysicalSpace::new(store, FillPolicy::Zero));
        PluginContext::new(physical, SessionConfig::default())
    }

    /// A 32-bit paged context: virtual 0x0000 -> 0x5000 ('A' fill) and
    /// 0x2000 -> 0x6000 (holding "secret" at 0x6010); 0x1000 unmapped.
    pub fn paged_context() -> PluginContext {
        use crate::memory::translators::intel::PAGE_PRESENT;
        use crate::memory::translators::paging::tests::ImageBuilder;
        use crate::memory::translators::{PagingMode, PagingOptions};

        let mut image = ImageBuilder::new(0x8000, PagingMode::Intel32);
        image
            .entry(0x1000, 0, 0x2000 | PAGE_PRESENT)
            .entry(0x2000, 0, 0x5000 | PAGE_PRESENT)
            .entry(0x2000, 2, 0x6000 | PAGE_PRESENT)
            .fill(0x5000, &[b'A'; 0x1000])
            .fill(0x6010, b"secret");
        let physical = image.physical();
        let paged = PagedSpace::new(
            "virtual",
            physical.clone(),
            PagingMode::Intel32,
            0x1000,
            PagingOptions::default(),
        )
        .unwrap();
        let mut ctx = PluginContext::new(physical, SessionConfig::default());
        ctx.virtual_space = Some(Arc::new(paged));
        ctx
    }

    /// A context over the object-model fixture image and profile.
    pub fn fixture_context() -> PluginContext {
        let (space, profile) = crate::object::fixtures::fixture();
        let mut ctx = PluginContext::new(space, SessionConfig::default());
        ctx.profile = Some(profile);
        ctx
    }

    pub fn collect(stream: RecordStream<'_>) -> Vec<Record> {
        stream.map(|r| r.unwrap_or_else(Record::from_error)).collect()
    }
}
