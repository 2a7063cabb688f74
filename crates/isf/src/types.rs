//! Serde model of an ISF (Intermediate Symbol Format) document.
//!
//! These structs mirror the on-disk JSON one to one. They are converted into
//! [`crate::Profile`] and [`crate::TypeDescriptor`] values by the parser;
//! nothing outside this crate works with them directly except metadata.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Top-level ISF file structure.
///
/// Overlay documents use the same shape but may omit the metadata block,
/// user type sizes and whole sections.
#[derive(Debug, Deserialize)]
pub struct IsfFile {
    #[serde(default)]
    pub metadata: Metadata,
    #[serde(default)]
    pub base_types: BTreeMap<String, BaseType>,
    #[serde(default)]
    pub user_types: BTreeMap<String, UserType>,
    #[serde(default)]
    pub symbols: BTreeMap<String, Symbol>,
    #[serde(default)]
    pub enums: BTreeMap<String, EnumDef>,
}

/// ISF metadata block. `format` is the schema version tag.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Metadata {
    #[serde(default)]
    pub format: String,
    #[serde(default)]
    pub producer: Option<Producer>,
    #[serde(default)]
    pub windows: Option<WindowsMetadata>,
    #[serde(default)]
    pub linux: Option<LinuxMetadata>,
    #[serde(default)]
    pub mac: Option<MacMetadata>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Producer {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub datetime: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct WindowsMetadata {
    #[serde(default)]
    pub major: Option<u32>,
    #[serde(default)]
    pub minor: Option<u32>,
    #[serde(default)]
    pub revision: Option<u32>,
    #[serde(default)]
    pub build: Option<u32>,
    #[serde(default)]
    pub pe_file: Option<String>,
    #[serde(default)]
    pub pdb_file: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct LinuxMetadata {
    #[serde(default)]
    pub banner: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct MacMetadata {
    #[serde(default)]
    pub banner: Option<String>,
}

/// A base (primitive) type definition.
#[derive(Debug, Clone, Deserialize)]
pub struct BaseType {
    pub size: usize,
    #[serde(default)]
    pub signed: bool,
    pub kind: String,
    #[serde(default = "default_endian")]
    pub endian: String,
}

fn default_endian() -> String {
    "little".to_string()
}

/// A user-defined (struct/union/class) type.
#[derive(Debug, Clone, Deserialize)]
pub struct UserType {
    /// Declared size. Optional so overlays and hand-written profiles can let
    /// the size be derived from the field list.
    #[serde(default)]
    pub size: Option<u64>,
    #[serde(default)]
    pub fields: BTreeMap<String, FieldDef>,
    #[serde(default)]
    pub kind: Option<String>,
}

/// A field within a user type.
#[derive(Debug, Clone, Deserialize)]
pub struct FieldDef {
    pub offset: u64,
    #[serde(rename = "type")]
    pub type_info: TypeInfo,
}

/// Type information for a field, recursive to handle nested types.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct TypeInfo {
    pub kind: String,

    /// For kind="struct", "union", "base", "enum": the type name.
    #[serde(default)]
    pub name: Option<String>,

    /// For kind="pointer" and "array": the pointed-to / element type.
    #[serde(default)]
    pub subtype: Option<Box<TypeInfo>>,

    /// For kind="array": element count. Absent or zero means dynamic.
    #[serde(default)]
    pub count: Option<u64>,

    /// For kind="bitfield": bit position and bit length.
    #[serde(default)]
    pub bit_position: Option<u32>,
    #[serde(default)]
    pub bit_length: Option<u32>,

    /// Older producers name the enum under "enum" instead of "name".
    #[serde(default, rename = "enum")]
    pub enum_name: Option<String>,

    /// For kind="bitfield" the underlying type, and for older producers the
    /// element type of arrays and pointers.
    #[serde(default, rename = "type")]
    pub element_type: Option<Box<TypeInfo>>,
}

impl TypeInfo {
    /// Element / target type, whichever key the producer used.
    pub fn inner(&self) -> Option<&TypeInfo> {
        self.subtype
            .as_deref()
            .or(self.element_type.as_deref())
    }
}

/// A symbol (named address).
#[derive(Debug, Clone, Deserialize)]
pub struct Symbol {
    pub address: u64,
    #[serde(default, rename = "type")]
    pub type_info: Option<TypeInfo>,
    /// Base64-encoded constant data (rare).
    #[serde(default)]
    pub constant_data: Option<String>,
}

/// An enumeration type.
#[derive(Debug, Clone, Deserialize)]
pub struct EnumDef {
    pub size: usize,
    pub base: String,
    pub constants: BTreeMap<String, i64>,
}
