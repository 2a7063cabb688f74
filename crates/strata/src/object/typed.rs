//! Typed views over address spaces.
//!
//! A [`TypedObject`] is a coordinate: an address space, an offset and a type
//! descriptor. It owns no bytes; every accessor reads through the space, so
//! two objects at the same coordinate always see the same values.

use crate::memory::traits::{AddressSpace, FillPolicy};
use crate::object::error::{ObjectError, ObjectResult};
use crate::object::value::Value;
use isf::{
    decode_unsigned, sign_extend, ArrayCount, BitRange, Primitive, PrimitiveKind, Profile,
    TypeDescriptor,
};
use serde_json::json;
use std::sync::Arc;

/// Elements of an array rendered by [`TypedObject::to_json`].
const JSON_MAX_ELEMENTS: u64 = 64;

/// Where an object sits inside the object it was derived from. Only the
/// parent's coordinate is kept; the parent itself is rebuilt on demand.
#[derive(Debug, Clone)]
pub struct Context {
    parent_offset: u64,
    parent_ty: TypeDescriptor,
    parent_context: Option<Arc<Context>>,
    /// Field name, or `[i]` for array elements.
    pub member: String,
}

#[derive(Clone)]
pub struct TypedObject {
    space: Arc<dyn AddressSpace>,
    profile: Arc<Profile>,
    offset: u64,
    ty: TypeDescriptor,
    bits: Option<BitRange>,
    context: Option<Arc<Context>>,
    /// Produced by dereferencing a null pointer.
    from_null: bool,
}

impl std::fmt::Debug for TypedObject {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TypedObject")
            .field("space", &self.space.name())
            .field("offset", &format_args!("{:#x}", self.offset))
            .field("type", &self.ty.display_name())
            .field("from_null", &self.from_null)
            .finish()
    }
}

impl TypedObject {
    pub fn new(
        space: Arc<dyn AddressSpace>,
        profile: Arc<Profile>,
        offset: u64,
        ty: TypeDescriptor,
    ) -> Self {
        TypedObject {
            space,
            profile,
            offset,
            ty,
            bits: None,
            context: None,
            from_null: false,
        }
    }

    /// An object of the named profile type.
    pub fn from_type_name(
        space: Arc<dyn AddressSpace>,
        profile: Arc<Profile>,
        type_name: &str,
        offset: u64,
    ) -> ObjectResult<Self> {
        profile.resolve(type_name)?;
        Ok(Self::new(
            space,
            profile,
            offset,
            TypeDescriptor::Named(type_name.to_string()),
        ))
    }

    /// The object a profile symbol describes, at its (relocated) address.
    pub fn from_symbol(
        space: Arc<dyn AddressSpace>,
        profile: Arc<Profile>,
        symbol: &str,
    ) -> ObjectResult<Self> {
        let address = profile.symbol_address(symbol)?;
        let ty = profile
            .symbol_type(symbol)
            .cloned()
            .ok_or_else(|| ObjectError::UnknownType(format!("type of symbol '{}'", symbol)))?;
        Ok(Self::new(space, profile, address, ty))
    }

    fn child(&self, offset: u64, ty: TypeDescriptor, bits: Option<BitRange>, member: String) -> Self {
        TypedObject {
            space: self.space.clone(),
            profile: self.profile.clone(),
            offset,
            ty,
            bits,
            context: Some(Arc::new(Context {
                parent_offset: self.offset,
                parent_ty: self.ty.clone(),
                parent_context: self.context.clone(),
                member,
            })),
            from_null: self.from_null,
        }
    }

    pub fn offset(&self) -> u64 {
        self.offset
    }

    pub fn space(&self) -> &Arc<dyn AddressSpace> {
        &self.space
    }

    pub fn profile(&self) -> &Arc<Profile> {
        &self.profile
    }

    /// The descriptor as given, possibly a `Named` reference.
    pub fn type_descriptor(&self) -> &TypeDescriptor {
        &self.ty
    }

    pub fn type_name(&self) -> String {
        self.ty.display_name()
    }

    pub fn bits(&self) -> Option<BitRange> {
        self.bits
    }

    /// The concrete descriptor behind any `Named` references.
    pub fn resolved(&self) -> ObjectResult<&TypeDescriptor> {
        Ok(self.profile.resolve_descriptor(&self.ty)?)
    }

    /// Size of the type in bytes.
    pub fn size(&self) -> u64 {
        self.profile.size_of(&self.ty)
    }

    /// False for objects reached through a null pointer and for objects of
    /// which no byte is mapped.
    pub fn is_valid(&self) -> bool {
        if self.from_null {
            return false;
        }
        let end = self.offset.saturating_add(self.size().max(1));
        self.space
            .next_mapped(self.offset)
            .is_some_and(|mapped| mapped < end)
    }

    /// The object this one was derived from via `field` or `index`.
    pub fn parent(&self) -> Option<TypedObject> {
        self.context.as_ref().map(|c| TypedObject {
            space: self.space.clone(),
            profile: self.profile.clone(),
            offset: c.parent_offset,
            ty: c.parent_ty.clone(),
            bits: None,
            context: c.parent_context.clone(),
            from_null: self.from_null,
        })
    }

    /// Name of this object inside its parent.
    pub fn member_name(&self) -> Option<&str> {
        self.context.as_ref().map(|c| c.member.as_str())
    }

    fn read_at(&self, offset: u64, length: usize) -> ObjectResult<Vec<u8>> {
        if self.from_null {
            return match self.space.fill_policy() {
                FillPolicy::Zero => Ok(vec![0u8; length]),
                FillPolicy::Fault => Err(ObjectError::Fault {
                    offset,
                    length,
                    faulted: length as u64,
                }),
            };
        }
        self.space
            .read(offset, length)
            .map_err(|partial| ObjectError::Fault {
                offset,
                length,
                faulted: partial.faulted_bytes(),
            })
    }

    // -- Navigation --

    /// Member `name` of a struct. Pointers to structs are followed first.
    pub fn field(&self, name: &str) -> ObjectResult<TypedObject> {
        match self.resolved()? {
            TypeDescriptor::Struct(st) => {
                let field = st.field(name).ok_or_else(|| ObjectError::UnknownField {
                    type_name: st.name.clone(),
                    field: name.to_string(),
                })?;
                Ok(self.child(
                    self.offset.wrapping_add(field.offset),
                    field.ty.clone(),
                    field.bits,
                    name.to_string(),
                ))
            }
            TypeDescriptor::Pointer { .. } => self.dereference()?.field(name),
            other => Err(ObjectError::NotAStruct(other.display_name())),
        }
    }

    /// Follow a dotted path of fields, e.g. `tasks.next`.
    pub fn path(&self, path: &str) -> ObjectResult<TypedObject> {
        path.split('.')
            .filter(|p| !p.is_empty())
            .try_fold(self.clone(), |obj, name| obj.field(name))
    }

    /// Element `index` of an array. Fixed arrays reject `index >= count`;
    /// dynamic arrays accept any index.
    pub fn index(&self, index: u64) -> ObjectResult<TypedObject> {
        match self.resolved()? {
            TypeDescriptor::Array { element, count } => {
                if let ArrayCount::Fixed(n) = count {
                    if index >= *n {
                        return Err(ObjectError::IndexOutOfRange { index, count: *n });
                    }
                }
                let stride = self.profile.size_of(element);
                Ok(self.child(
                    self.offset.wrapping_add(index.wrapping_mul(stride)),
                    (**element).clone(),
                    None,
                    format!("[{}]", index),
                ))
            }
            other => Err(ObjectError::NotAnArray(other.display_name())),
        }
    }

    /// The raw address stored in a pointer object.
    pub fn pointer_value(&self) -> ObjectResult<u64> {
        match self.resolved()? {
            TypeDescriptor::Pointer { width, endian, .. } => {
                let bytes = self.read_at(self.offset, *width)?;
                Ok(decode_unsigned(&bytes, *endian))
            }
            other => Err(ObjectError::NotAPointer(other.display_name())),
        }
    }

    /// The pointed-to object, in this object's address space.
    pub fn dereference(&self) -> ObjectResult<TypedObject> {
        self.dereference_in(self.space.clone())
    }

    /// The pointed-to object, in `space` (e.g. a pointer read from physical
    /// memory that holds a virtual address).
    pub fn dereference_in(&self, space: Arc<dyn AddressSpace>) -> ObjectResult<TypedObject> {
        let target = match self.resolved()? {
            TypeDescriptor::Pointer { target, .. } => (**target).clone(),
            other => return Err(ObjectError::NotAPointer(other.display_name())),
        };
        let address = self.pointer_value()?;
        Ok(TypedObject {
            space,
            profile: self.profile.clone(),
            offset: address,
            ty: target,
            bits: None,
            context: None,
            from_null: address == 0,
        })
    }

    /// The same coordinate viewed as another profile type.
    pub fn cast(&self, type_name: &str) -> ObjectResult<TypedObject> {
        self.profile.resolve(type_name)?;
        Ok(TypedObject {
            ty: TypeDescriptor::Named(type_name.to_string()),
            bits: None,
            ..self.clone()
        })
    }

    /// All members of a struct, in offset order.
    pub fn members(&self) -> ObjectResult<Vec<TypedObject>> {
        match self.resolved()? {
            TypeDescriptor::Struct(st) => Ok(st
                .fields
                .iter()
                .map(|f| {
                    self.child(
                        self.offset.wrapping_add(f.offset),
                        f.ty.clone(),
                        f.bits,
                        f.name.clone(),
                    )
                })
                .collect()),
            other => Err(ObjectError::NotAStruct(other.display_name())),
        }
    }

    /// All elements of a fixed-count array.
    pub fn elements(&self) -> ObjectResult<Vec<TypedObject>> {
        match self.resolved()? {
            TypeDescriptor::Array {
                count: ArrayCount::Fixed(n),
                ..
            } => (0..*n).map(|i| self.index(i)).collect(),
            TypeDescriptor::Array { .. } => Err(ObjectError::UnboundedArray(self.type_name())),
            other => Err(ObjectError::NotAnArray(other.display_name())),
        }
    }

    // -- Values --

    /// Decode a scalar: primitive, enum, pointer or bit field.
    pub fn value(&self) -> ObjectResult<Value> {
        match self.resolved()? {
            TypeDescriptor::Primitive(p) => self.primitive_value(p),
            TypeDescriptor::Enum(e) => {
                let raw = self.read_unsigned(&e.base)?;
                let value = match self.bits {
                    Some(bits) => bits.extract(raw) as i64,
                    None if e.base.signed => sign_extend(raw, e.base.width),
                    None => raw as i64,
                };
                Ok(Value::Enum {
                    value,
                    name: e.name_of(value).map(str::to_string),
                })
            }
            TypeDescriptor::Pointer { .. } => Ok(Value::Pointer(self.pointer_value()?)),
            other => Err(ObjectError::NotAScalar(other.display_name())),
        }
    }

    fn read_unsigned(&self, p: &Primitive) -> ObjectResult<u64> {
        let bytes = self.read_at(self.offset, p.width)?;
        Ok(p.decode_unsigned(&bytes))
    }

    fn primitive_value(&self, p: &Primitive) -> ObjectResult<Value> {
        let raw = self.read_unsigned(p)?;
        if let Some(bits) = self.bits {
            return Ok(Value::Bitfield {
                value: bits.extract(raw),
                width: bits.len(),
            });
        }
        Ok(match p.kind {
            PrimitiveKind::Int if p.signed => Value::Signed(sign_extend(raw, p.width)),
            PrimitiveKind::Int => Value::Unsigned(raw),
            PrimitiveKind::Float => match p.width {
                4 => Value::Float(f32::from_bits(raw as u32) as f64),
                8 => Value::Float(f64::from_bits(raw)),
                _ => Value::Unsigned(raw),
            },
            PrimitiveKind::Bool => Value::Bool(raw != 0),
            PrimitiveKind::Char => {
                Value::Char(char::from_u32(raw as u32).unwrap_or(char::REPLACEMENT_CHARACTER))
            }
        })
    }

    pub fn as_u64(&self) -> ObjectResult<u64> {
        self.value()?
            .as_u64()
            .ok_or_else(|| ObjectError::NotAScalar(self.type_name()))
    }

    pub fn as_i64(&self) -> ObjectResult<i64> {
        self.value()?
            .as_i64()
            .ok_or_else(|| ObjectError::NotAScalar(self.type_name()))
    }

    /// The object's bytes (`size()` of them).
    pub fn read_bytes(&self) -> ObjectResult<Vec<u8>> {
        self.read_at(self.offset, self.size() as usize)
    }

    /// NUL-terminated 8-bit string of at most `max_len` bytes.
    pub fn read_cstring(&self, max_len: usize) -> ObjectResult<String> {
        let bytes = self.read_at(self.offset, max_len)?;
        let end = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
        Ok(String::from_utf8_lossy(&bytes[..end]).into_owned())
    }

    /// NUL-terminated UTF-16LE string of at most `max_bytes` bytes.
    pub fn read_utf16_string(&self, max_bytes: usize) -> ObjectResult<String> {
        let bytes = self.read_at(self.offset, max_bytes)?;
        let units: Vec<u16> = bytes
            .chunks_exact(2)
            .map(|c| u16::from_le_bytes([c[0], c[1]]))
            .take_while(|u| *u != 0)
            .collect();
        Ok(String::from_utf16_lossy(&units))
    }

    // -- Serialization --

    /// `{type, offset, value}` with structs and fixed arrays expanded `depth`
    /// levels. Unreadable values become `{"error": ...}`.
    pub fn to_json(&self, depth: usize) -> serde_json::Value {
        json!({
            "type": self.type_name(),
            "offset": self.offset,
            "value": self.json_value(depth),
        })
    }

    fn json_value(&self, depth: usize) -> serde_json::Value {
        let error = |e: ObjectError| json!({ "error": e.to_string() });
        match self.resolved() {
            Err(e) => error(e),
            Ok(TypeDescriptor::Struct(_)) if depth == 0 => serde_json::Value::Null,
            Ok(TypeDescriptor::Struct(_)) => match self.members() {
                Ok(members) => {
                    let mut map = serde_json::Map::new();
                    for m in members {
                        let name = m.member_name().unwrap_or_default().to_string();
                        map.insert(name, m.json_value(depth - 1));
                    }
                    serde_json::Value::Object(map)
                }
                Err(e) => error(e),
            },
            Ok(TypeDescriptor::Array {
                count: ArrayCount::Fixed(n),
                ..
            }) if depth > 0 => {
                let shown = (*n).min(JSON_MAX_ELEMENTS);
                let items: Vec<serde_json::Value> = (0..shown)
                    .map(|i| match self.index(i) {
                        Ok(el) => el.json_value(depth - 1),
                        Err(e) => error(e),
                    })
                    .collect();
                serde_json::Value::Array(items)
            }
            Ok(TypeDescriptor::Array { .. })
            | Ok(TypeDescriptor::Void)
            | Ok(TypeDescriptor::Function) => serde_json::Value::Null,
            Ok(_) => match self.value() {
                Ok(v) => serde_json::to_value(v).unwrap_or(serde_json::Value::Null),
                Err(e) => error(e),
            },
        }
    }
}
