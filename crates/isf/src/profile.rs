//! The resolved profile: types, symbols and metadata for one target build.

use crate::descriptor::{
    ArrayCount, BitRange, EnumType, Endian, Field, Primitive, PrimitiveKind, StructKind,
    StructType, TypeDescriptor,
};
use crate::error::{IsfError, IsfResult};
use crate::types::{BaseType, IsfFile, Metadata, TypeInfo, UserType};
use std::collections::{HashMap, HashSet};
use tracing::debug;

/// Longest `Named` → `Named` alias chain followed before giving up.
const MAX_ALIAS_DEPTH: usize = 32;

/// Deepest by-value struct nesting considered when deriving sizes. A profile
/// that embeds a struct in itself would otherwise recurse forever.
const MAX_NESTING: usize = 64;

/// A named address, optionally typed.
#[derive(Debug, Clone, PartialEq)]
pub struct SymbolDef {
    pub name: String,
    pub address: u64,
    pub ty: Option<TypeDescriptor>,
    pub constant_data: Option<String>,
}

/// Versioned schema of type layouts and symbol addresses.
///
/// Immutable once built; lookups hand out references tied to the profile.
#[derive(Debug, Clone)]
pub struct Profile {
    pub(crate) types: HashMap<String, TypeDescriptor>,
    pub(crate) symbols: HashMap<String, SymbolDef>,
    pub(crate) metadata: Metadata,
    pub(crate) pointer_size: usize,
    pub(crate) pointer_endian: Endian,
    pub(crate) base_address: u64,
    /// Producer names of every document folded into this profile, base first.
    pub(crate) lineage: Vec<String>,
    /// User types whose document left out `kind`; they read as structs.
    pub(crate) implicit_kinds: HashSet<String>,
}

impl Profile {
    /// Build a profile from a parsed document and check every type reference.
    pub fn from_document(doc: IsfFile) -> IsfResult<Self> {
        let profile = Self::build(doc, true)?;
        profile.validate()?;
        Ok(profile)
    }

    /// Build without reference validation. Used for overlays, whose fields may
    /// name types that only exist in the base they will be merged onto.
    pub fn from_document_unchecked(doc: IsfFile) -> IsfResult<Self> {
        Self::build(doc, false)
    }

    fn build(doc: IsfFile, strict: bool) -> IsfResult<Self> {
        let pointer = doc.base_types.get("pointer");
        let pointer_size = pointer.map(|bt| bt.size).unwrap_or(8);
        let pointer_endian = pointer
            .and_then(|bt| Endian::parse(&bt.endian))
            .unwrap_or(Endian::Little);

        let mut types: HashMap<String, TypeDescriptor> = HashMap::new();
        let mut insert = |name: &str, desc: TypeDescriptor| -> IsfResult<()> {
            if types.insert(name.to_string(), desc).is_some() {
                return Err(IsfError::DuplicateType(name.to_string()));
            }
            Ok(())
        };

        for (name, base) in &doc.base_types {
            insert(name, convert_base_type(name, base)?)?;
        }

        let conv = Converter {
            pointer_size,
            pointer_endian,
        };
        let mut implicit_kinds = HashSet::new();
        for (name, user) in &doc.user_types {
            insert(name, conv.user_type(name, user)?)?;
            if user.kind.is_none() {
                implicit_kinds.insert(name.clone());
            }
        }

        for (name, def) in &doc.enums {
            let base = match doc.base_types.get(&def.base) {
                Some(bt) => primitive_from_base(&def.base, bt)?,
                None if strict => {
                    return Err(IsfError::UndefinedType {
                        name: def.base.clone(),
                        referenced_by: name.clone(),
                    })
                }
                None => Primitive {
                    name: def.base.clone(),
                    width: def.size,
                    signed: false,
                    endian: pointer_endian,
                    kind: PrimitiveKind::Int,
                },
            };
            insert(
                name,
                TypeDescriptor::Enum(EnumType {
                    name: name.clone(),
                    base,
                    constants: def.constants.clone(),
                }),
            )?;
        }

        let mut symbols = HashMap::with_capacity(doc.symbols.len());
        for (name, sym) in &doc.symbols {
            let ty = match &sym.type_info {
                Some(info) => Some(conv.type_info(name, info)?),
                None => None,
            };
            symbols.insert(
                name.clone(),
                SymbolDef {
                    name: name.clone(),
                    address: sym.address,
                    ty,
                    constant_data: sym.constant_data.clone(),
                },
            );
        }

        let lineage = doc
            .metadata
            .producer
            .as_ref()
            .and_then(|p| p.name.clone())
            .into_iter()
            .collect();

        debug!(
            "built profile: {} types, {} symbols, pointer_size={}",
            types.len(),
            symbols.len(),
            pointer_size
        );

        Ok(Profile {
            types,
            symbols,
            metadata: doc.metadata,
            pointer_size,
            pointer_endian,
            base_address: 0,
            lineage,
            implicit_kinds,
        })
    }

    /// Check that every `Named` reference resolves.
    pub fn validate(&self) -> IsfResult<()> {
        for (name, desc) in &self.types {
            match desc {
                TypeDescriptor::Struct(s) => {
                    for field in &s.fields {
                        self.check_references(&field.ty, &format!("{}.{}", name, field.name))?;
                    }
                }
                other => self.check_references(other, name)?,
            }
        }
        for (name, sym) in &self.symbols {
            if let Some(ty) = &sym.ty {
                self.check_references(ty, name)?;
            }
        }
        Ok(())
    }

    fn check_references(&self, desc: &TypeDescriptor, referenced_by: &str) -> IsfResult<()> {
        let mut missing = None;
        desc.for_each_reference(&mut |r| {
            if missing.is_none() && !self.types.contains_key(r) {
                missing = Some(r.to_string());
            }
        });
        match missing {
            Some(name) => Err(IsfError::UndefinedType {
                name,
                referenced_by: referenced_by.to_string(),
            }),
            None => Ok(()),
        }
    }

    // -- Types --

    /// Look up a type by name, following aliases to a concrete descriptor.
    pub fn resolve(&self, type_name: &str) -> IsfResult<&TypeDescriptor> {
        let desc = self
            .types
            .get(type_name)
            .ok_or_else(|| IsfError::UnknownType(type_name.to_string()))?;
        self.resolve_descriptor(desc)
    }

    /// Follow `Named` references until a concrete descriptor is reached.
    pub fn resolve_descriptor<'a>(&'a self, desc: &'a TypeDescriptor) -> IsfResult<&'a TypeDescriptor> {
        let mut current = desc;
        for _ in 0..MAX_ALIAS_DEPTH {
            match current {
                TypeDescriptor::Named(name) => {
                    current = self
                        .types
                        .get(name)
                        .ok_or_else(|| IsfError::UnknownType(name.clone()))?;
                }
                concrete => return Ok(concrete),
            }
        }
        Err(IsfError::invalid(desc.display_name(), "alias chain too deep"))
    }

    /// Whether a type of this name exists.
    pub fn has_type(&self, type_name: &str) -> bool {
        self.types.contains_key(type_name)
    }

    /// Look up a struct definition by name.
    pub fn struct_type(&self, type_name: &str) -> Option<&StructType> {
        self.resolve(type_name).ok().and_then(|d| d.as_struct())
    }

    /// Look up a field offset within a struct.
    pub fn field_offset(&self, type_name: &str, field_name: &str) -> Option<u64> {
        self.struct_type(type_name)
            .and_then(|s| s.field(field_name))
            .map(|f| f.offset)
    }

    /// Size in bytes of a named type.
    pub fn type_size(&self, type_name: &str) -> Option<u64> {
        self.types.get(type_name).map(|d| self.size_of(d))
    }

    /// Size in bytes of a descriptor. Structs without a declared size use
    /// `max(offset + size)` over their fields; dynamic arrays are zero sized.
    pub fn size_of(&self, desc: &TypeDescriptor) -> u64 {
        self.size_of_depth(desc, 0)
    }

    fn size_of_depth(&self, desc: &TypeDescriptor, depth: usize) -> u64 {
        if depth > MAX_NESTING {
            return 0;
        }
        match desc {
            TypeDescriptor::Primitive(p) => p.width as u64,
            TypeDescriptor::Struct(s) => match s.declared_size {
                Some(size) => size,
                None => s
                    .fields
                    .iter()
                    .map(|f| f.offset.saturating_add(self.size_of_depth(&f.ty, depth + 1)))
                    .max()
                    .unwrap_or(0),
            },
            TypeDescriptor::Pointer { width, .. } => *width as u64,
            TypeDescriptor::Array { element, count } => match count {
                ArrayCount::Fixed(n) => n.saturating_mul(self.size_of_depth(element, depth + 1)),
                ArrayCount::Dynamic => 0,
            },
            TypeDescriptor::Enum(e) => e.base.width as u64,
            TypeDescriptor::Named(name) => self
                .types
                .get(name)
                .map(|t| self.size_of_depth(t, depth + 1))
                .unwrap_or(0),
            TypeDescriptor::Void | TypeDescriptor::Function => 0,
        }
    }

    /// All type names, sorted.
    pub fn type_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.types.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    /// A pointer descriptor to the named type, using this profile's width.
    pub fn pointer_to(&self, type_name: &str) -> TypeDescriptor {
        TypeDescriptor::Pointer {
            target: Box::new(TypeDescriptor::Named(type_name.to_string())),
            width: self.pointer_size,
            endian: self.pointer_endian,
        }
    }

    // -- Enums --

    /// Look up an enum value by constant name.
    pub fn enum_value(&self, enum_name: &str, constant_name: &str) -> Option<i64> {
        match self.resolve(enum_name).ok()? {
            TypeDescriptor::Enum(e) => e.value_of(constant_name),
            _ => None,
        }
    }

    /// Reverse-lookup an enum constant name by value.
    pub fn enum_name(&self, enum_name: &str, value: i64) -> Option<&str> {
        match self.resolve(enum_name).ok()? {
            TypeDescriptor::Enum(e) => e.name_of(value),
            _ => None,
        }
    }

    // -- Symbols --

    /// Address of a symbol, relocated by the profile's base address.
    pub fn symbol_address(&self, name: &str) -> IsfResult<u64> {
        self.symbols
            .get(name)
            .map(|s| self.base_address.wrapping_add(s.address))
            .ok_or_else(|| IsfError::UnknownSymbol(name.to_string()))
    }

    pub fn symbol(&self, name: &str) -> Option<&SymbolDef> {
        self.symbols.get(name)
    }

    /// Declared type of a symbol, when the profile carries one.
    pub fn symbol_type(&self, name: &str) -> Option<&TypeDescriptor> {
        self.symbols.get(name).and_then(|s| s.ty.as_ref())
    }

    pub fn symbol_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.symbols.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    /// A copy whose symbol addresses are offset by `base` (kernel base
    /// relocation for RVAs).
    pub fn relocated(&self, base: u64) -> Profile {
        let mut copy = self.clone();
        copy.base_address = base;
        copy
    }

    pub fn base_address(&self) -> u64 {
        self.base_address
    }

    // -- Metadata --

    pub fn metadata(&self) -> &Metadata {
        &self.metadata
    }

    /// The schema version tag. Not interpreted by the engine.
    pub fn version(&self) -> &str {
        &self.metadata.format
    }

    /// Producers of the documents merged into this profile, base first.
    pub fn lineage(&self) -> &[String] {
        &self.lineage
    }

    pub fn pointer_size(&self) -> usize {
        self.pointer_size
    }

    pub fn pointer_endian(&self) -> Endian {
        self.pointer_endian
    }
}

fn convert_base_type(name: &str, base: &BaseType) -> IsfResult<TypeDescriptor> {
    if base.kind == "void" {
        return Ok(TypeDescriptor::Void);
    }
    primitive_from_base(name, base).map(TypeDescriptor::Primitive)
}

fn primitive_from_base(name: &str, base: &BaseType) -> IsfResult<Primitive> {
    let kind = PrimitiveKind::parse(&base.kind)
        .ok_or_else(|| IsfError::invalid(name, format!("unknown base kind '{}'", base.kind)))?;
    let endian = Endian::parse(&base.endian)
        .ok_or_else(|| IsfError::invalid(name, format!("unknown endian '{}'", base.endian)))?;
    Ok(Primitive {
        name: name.to_string(),
        width: base.size,
        signed: base.signed,
        endian,
        kind,
    })
}

/// Converts ISF `TypeInfo` trees into descriptors.
struct Converter {
    pointer_size: usize,
    pointer_endian: Endian,
}

impl Converter {
    fn user_type(&self, name: &str, user: &UserType) -> IsfResult<TypeDescriptor> {
        let kind = match user.kind.as_deref() {
            None => StructKind::Struct,
            Some(k) => StructKind::parse(k)
                .ok_or_else(|| IsfError::invalid(name, format!("unknown user type kind '{}'", k)))?,
        };

        let mut fields = Vec::with_capacity(user.fields.len());
        for (field_name, def) in &user.fields {
            let context = format!("{}.{}", name, field_name);
            let (ty, bits) = if def.type_info.kind == "bitfield" {
                let inner = def
                    .type_info
                    .inner()
                    .ok_or_else(|| IsfError::invalid(&context, "bitfield without storage type"))?;
                let start = def.type_info.bit_position.unwrap_or(0);
                let len = def.type_info.bit_length.unwrap_or(0);
                (
                    self.type_info(&context, inner)?,
                    Some(BitRange {
                        start,
                        end: start.saturating_add(len),
                    }),
                )
            } else {
                (self.type_info(&context, &def.type_info)?, None)
            };
            fields.push(Field {
                name: field_name.clone(),
                offset: def.offset,
                ty,
                bits,
            });
        }

        let mut st = StructType {
            name: name.to_string(),
            kind,
            declared_size: user.size,
            fields,
        };
        st.sort_fields();
        Ok(TypeDescriptor::Struct(st))
    }

    fn type_info(&self, context: &str, info: &TypeInfo) -> IsfResult<TypeDescriptor> {
        match info.kind.as_str() {
            "base" | "struct" | "union" | "class" | "enum" => {
                let name = info
                    .name
                    .as_ref()
                    .or(info.enum_name.as_ref())
                    .ok_or_else(|| {
                        IsfError::invalid(context, format!("{} reference without a name", info.kind))
                    })?;
                Ok(TypeDescriptor::Named(name.clone()))
            }
            "pointer" => {
                let target = match info.inner() {
                    Some(inner) => self.type_info(context, inner)?,
                    None => TypeDescriptor::Void,
                };
                Ok(TypeDescriptor::Pointer {
                    target: Box::new(target),
                    width: self.pointer_size,
                    endian: self.pointer_endian,
                })
            }
            "array" => {
                let inner = info
                    .inner()
                    .ok_or_else(|| IsfError::invalid(context, "array without element type"))?;
                let count = match info.count {
                    Some(n) if n > 0 => ArrayCount::Fixed(n),
                    _ => ArrayCount::Dynamic,
                };
                Ok(TypeDescriptor::Array {
                    element: Box::new(self.type_info(context, inner)?),
                    count,
                })
            }
            "void" => Ok(TypeDescriptor::Void),
            "function" => Ok(TypeDescriptor::Function),
            "bitfield" => Err(IsfError::invalid(context, "bitfield outside a struct field")),
            other => Err(IsfError::invalid(context, format!("unknown type kind '{}'", other))),
        }
    }
}
