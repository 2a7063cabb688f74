//! Resolved type descriptors.
//!
//! A [`TypeDescriptor`] is the runtime form of one ISF type. Profiles are
//! loaded at runtime, so types are data rather than Rust structs: consumers
//! dispatch on the variant. References to other named types stay symbolic
//! ([`TypeDescriptor::Named`]) and are resolved through the owning
//! [`crate::Profile`], which is what lets `_LIST_ENTRY` point at itself.

use serde::Serialize;
use std::collections::BTreeMap;

/// Byte order of a primitive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Endian {
    Little,
    Big,
}

impl Endian {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "little" => Some(Endian::Little),
            "big" => Some(Endian::Big),
            _ => None,
        }
    }
}

/// Interpretation of a primitive's bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PrimitiveKind {
    Int,
    Float,
    Bool,
    Char,
}

impl PrimitiveKind {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "int" => Some(PrimitiveKind::Int),
            "float" => Some(PrimitiveKind::Float),
            "bool" => Some(PrimitiveKind::Bool),
            "char" => Some(PrimitiveKind::Char),
            _ => None,
        }
    }
}

/// A fixed-width scalar.
#[derive(Debug, Clone, PartialEq)]
pub struct Primitive {
    pub name: String,
    pub width: usize,
    pub signed: bool,
    pub endian: Endian,
    pub kind: PrimitiveKind,
}

impl Primitive {
    /// Decode `bytes` (at least `width` long) as an unsigned value.
    pub fn decode_unsigned(&self, bytes: &[u8]) -> u64 {
        decode_unsigned(&bytes[..self.width.min(bytes.len())], self.endian)
    }

    /// Decode `bytes` honouring the declared signedness.
    pub fn decode_signed(&self, bytes: &[u8]) -> i64 {
        let raw = self.decode_unsigned(bytes);
        if self.signed {
            sign_extend(raw, self.width)
        } else {
            raw as i64
        }
    }
}

/// Decode up to eight bytes as an unsigned integer in the given byte order.
pub fn decode_unsigned(bytes: &[u8], endian: Endian) -> u64 {
    let mut buf = [0u8; 8];
    let n = bytes.len().min(8);
    match endian {
        Endian::Little => {
            buf[..n].copy_from_slice(&bytes[..n]);
            u64::from_le_bytes(buf)
        }
        Endian::Big => {
            buf[8 - n..].copy_from_slice(&bytes[..n]);
            u64::from_be_bytes(buf)
        }
    }
}

/// Sign-extend a `width`-byte two's complement value.
pub fn sign_extend(value: u64, width: usize) -> i64 {
    if width == 0 || width >= 8 {
        return value as i64;
    }
    let shift = 64 - (width as u32) * 8;
    ((value << shift) as i64) >> shift
}

/// Half-open bit range `[start, end)` within a field's storage unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct BitRange {
    pub start: u32,
    pub end: u32,
}

impl BitRange {
    pub fn len(&self) -> u32 {
        self.end.saturating_sub(self.start)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Extract the bits from a raw storage value.
    pub fn extract(&self, raw: u64) -> u64 {
        let len = self.len();
        if len == 0 || self.start >= 64 {
            return 0;
        }
        let shifted = raw >> self.start;
        if len >= 64 {
            shifted
        } else {
            shifted & ((1u64 << len) - 1)
        }
    }
}

/// One member of a struct or union.
#[derive(Debug, Clone, PartialEq)]
pub struct Field {
    pub name: String,
    pub offset: u64,
    pub ty: TypeDescriptor,
    pub bits: Option<BitRange>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StructKind {
    Struct,
    Union,
    Class,
}

impl StructKind {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "struct" => Some(StructKind::Struct),
            "union" => Some(StructKind::Union),
            "class" => Some(StructKind::Class),
            _ => None,
        }
    }
}

/// A struct/union layout. Fields are kept ordered by `(offset, name)`;
/// offsets may repeat or overlap (unions, anonymous members).
#[derive(Debug, Clone, PartialEq)]
pub struct StructType {
    pub name: String,
    pub kind: StructKind,
    pub declared_size: Option<u64>,
    pub fields: Vec<Field>,
}

impl StructType {
    pub fn field(&self, name: &str) -> Option<&Field> {
        self.fields.iter().find(|f| f.name == name)
    }

    pub fn field_names(&self) -> impl Iterator<Item = &str> {
        self.fields.iter().map(|f| f.name.as_str())
    }

    pub(crate) fn sort_fields(&mut self) {
        self.fields
            .sort_by(|a, b| a.offset.cmp(&b.offset).then_with(|| a.name.cmp(&b.name)));
    }
}

/// An enumeration over a primitive.
#[derive(Debug, Clone, PartialEq)]
pub struct EnumType {
    pub name: String,
    pub base: Primitive,
    /// Constant name → value, as declared.
    pub constants: BTreeMap<String, i64>,
}

impl EnumType {
    /// Name for a value. When several constants share the value the
    /// lexicographically first name wins, so the answer is stable.
    pub fn name_of(&self, value: i64) -> Option<&str> {
        self.constants
            .iter()
            .find(|(_, v)| **v == value)
            .map(|(k, _)| k.as_str())
    }

    pub fn value_of(&self, name: &str) -> Option<i64> {
        self.constants.get(name).copied()
    }
}

/// Element count of an array type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ArrayCount {
    Fixed(u64),
    Dynamic,
}

/// A tagged description of one type.
#[derive(Debug, Clone, PartialEq)]
pub enum TypeDescriptor {
    Primitive(Primitive),
    Struct(StructType),
    Pointer {
        target: Box<TypeDescriptor>,
        width: usize,
        endian: Endian,
    },
    Array {
        element: Box<TypeDescriptor>,
        count: ArrayCount,
    },
    Enum(EnumType),
    /// Symbolic reference to a type defined elsewhere in the profile.
    Named(String),
    Void,
    Function,
}

impl TypeDescriptor {
    /// Short tag used in error messages and serialized objects.
    pub fn kind_name(&self) -> &'static str {
        match self {
            TypeDescriptor::Primitive(_) => "primitive",
            TypeDescriptor::Struct(s) => match s.kind {
                StructKind::Union => "union",
                _ => "struct",
            },
            TypeDescriptor::Pointer { .. } => "pointer",
            TypeDescriptor::Array { .. } => "array",
            TypeDescriptor::Enum(_) => "enum",
            TypeDescriptor::Named(_) => "named",
            TypeDescriptor::Void => "void",
            TypeDescriptor::Function => "function",
        }
    }

    /// Human-readable type name, e.g. `_EPROCESS`, `pointer to _LIST_ENTRY`.
    pub fn display_name(&self) -> String {
        match self {
            TypeDescriptor::Primitive(p) => p.name.clone(),
            TypeDescriptor::Struct(s) => s.name.clone(),
            TypeDescriptor::Pointer { target, .. } => {
                format!("pointer to {}", target.display_name())
            }
            TypeDescriptor::Array { element, count } => match count {
                ArrayCount::Fixed(n) => format!("array[{}] of {}", n, element.display_name()),
                ArrayCount::Dynamic => format!("array of {}", element.display_name()),
            },
            TypeDescriptor::Enum(e) => e.name.clone(),
            TypeDescriptor::Named(n) => n.clone(),
            TypeDescriptor::Void => "void".to_string(),
            TypeDescriptor::Function => "function".to_string(),
        }
    }

    pub fn as_struct(&self) -> Option<&StructType> {
        match self {
            TypeDescriptor::Struct(s) => Some(s),
            _ => None,
        }
    }

    /// Visit every `Named` reference reachable without crossing into other
    /// named types.
    pub(crate) fn for_each_reference(&self, f: &mut dyn FnMut(&str)) {
        match self {
            TypeDescriptor::Named(n) => f(n),
            TypeDescriptor::Struct(s) => {
                for field in &s.fields {
                    field.ty.for_each_reference(f);
                }
            }
            TypeDescriptor::Pointer { target, .. } => target.for_each_reference(f),
            TypeDescriptor::Array { element, .. } => element.for_each_reference(f),
            TypeDescriptor::Primitive(_)
            | TypeDescriptor::Enum(_)
            | TypeDescriptor::Void
            | TypeDescriptor::Function => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn u16_be() -> Primitive {
        Primitive {
            name: "unsigned short".into(),
            width: 2,
            signed: false,
            endian: Endian::Big,
            kind: PrimitiveKind::Int,
        }
    }

    #[test]
    fn test_decode_little_and_big_endian() {
        assert_eq!(decode_unsigned(&[0x34, 0x12], Endian::Little), 0x1234);
        assert_eq!(decode_unsigned(&[0x12, 0x34], Endian::Big), 0x1234);
        assert_eq!(u16_be().decode_unsigned(&[0xAB, 0xCD, 0xFF]), 0xABCD);
    }

    #[test]
    fn test_signed_decode() {
        let i8_type = Primitive {
            name: "char".into(),
            width: 1,
            signed: true,
            endian: Endian::Little,
            kind: PrimitiveKind::Int,
        };
        assert_eq!(i8_type.decode_signed(&[0xFF]), -1);
        assert_eq!(i8_type.decode_signed(&[0x7F]), 127);
        assert_eq!(sign_extend(0xFFFF_FFFE, 4), -2);
        assert_eq!(sign_extend(0x7FFF_FFFF, 4), 0x7FFF_FFFF);
    }

    #[test]
    fn test_bit_range_extract() {
        let bits = BitRange { start: 3, end: 6 };
        assert_eq!(bits.len(), 3);
        assert_eq!(bits.extract(0b0010_1000), 0b101);
        let full = BitRange { start: 0, end: 64 };
        assert_eq!(full.extract(u64::MAX), u64::MAX);
        assert_eq!(BitRange { start: 70, end: 72 }.extract(u64::MAX), 0);
    }

    #[test]
    fn test_enum_lookup_is_stable() {
        let mut constants = BTreeMap::new();
        constants.insert("Beta".to_string(), 1);
        constants.insert("Alpha".to_string(), 1);
        constants.insert("Zero".to_string(), 0);
        let e = EnumType {
            name: "_E".into(),
            base: u16_be(),
            constants,
        };
        assert_eq!(e.name_of(1), Some("Alpha"));
        assert_eq!(e.value_of("Zero"), Some(0));
        assert_eq!(e.name_of(7), None);
    }

    #[test]
    fn test_display_name() {
        let ptr = TypeDescriptor::Pointer {
            target: Box::new(TypeDescriptor::Named("_LIST_ENTRY".into())),
            width: 8,
            endian: Endian::Little,
        };
        assert_eq!(ptr.display_name(), "pointer to _LIST_ENTRY");
        let arr = TypeDescriptor::Array {
            element: Box::new(TypeDescriptor::Named("unsigned char".into())),
            count: ArrayCount::Fixed(15),
        };
        assert_eq!(arr.display_name(), "array[15] of unsigned char");
        assert_eq!(arr.kind_name(), "array");
    }
}
