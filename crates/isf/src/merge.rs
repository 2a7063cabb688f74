//! Overlay merging.
//!
//! An overlay is a partial profile layered on a base. Precedence:
//!
//! * struct onto struct of the same name: fields are matched by name. An
//!   overlay field replaces the base field wholesale (offset, type, bits),
//!   base-only fields are kept, overlay-only fields are added. Distinct names
//!   that overlap in offset are left alone since unions look exactly like that.
//!   The size is the overlay's declared size if it has one, otherwise the larger
//!   of the base size and the extent of the merged fields. An overlay without
//!   `kind` keeps the base's kind.
//! * enum onto enum: constants are unioned, the overlay wins per name.
//! * anything else with the same name: the overlay definition replaces the base.
//! * symbols: the overlay wins per name, but a type or constant data the
//!   overlay leaves out is kept from the base.
//!
//! The merged profile is validated as a whole, so an overlay may reference
//! types that only the base defines.

use crate::descriptor::{Endian, StructType, TypeDescriptor};
use crate::error::IsfResult;
use crate::profile::Profile;
use std::collections::HashSet;
use tracing::debug;

impl Profile {
    /// Layer `overlay` on top of this profile, producing a new profile.
    pub fn merged_with(&self, overlay: &Profile) -> IsfResult<Profile> {
        merge(self, overlay)
    }
}

/// Merge `overlay` onto `base`. Neither input is modified.
pub fn merge(base: &Profile, overlay: &Profile) -> IsfResult<Profile> {
    let mut merged = base.clone();

    // Overlays without their own pointer base type were built with the
    // default pointer width; re-point them at the base's.
    let adopt_pointer = !overlay.types.contains_key("pointer");

    let mut replaced = 0usize;
    let mut added = 0usize;
    for (name, incoming) in &overlay.types {
        let mut incoming = incoming.clone();
        if adopt_pointer {
            repoint(&mut incoming, base.pointer_size, base.pointer_endian);
        }
        let implicit = overlay.implicit_kinds.contains(name);
        let next = match (merged.types.get(name), incoming) {
            (Some(TypeDescriptor::Struct(old)), TypeDescriptor::Struct(new)) => {
                replaced += 1;
                if !implicit {
                    merged.implicit_kinds.remove(name);
                }
                TypeDescriptor::Struct(merge_struct(&merged, old, new, implicit))
            }
            (Some(TypeDescriptor::Enum(old)), TypeDescriptor::Enum(mut new)) => {
                replaced += 1;
                let mut constants = old.constants.clone();
                constants.append(&mut new.constants);
                if !overlay.types.contains_key(&new.base.name) {
                    new.base = old.base.clone();
                }
                new.constants = constants;
                TypeDescriptor::Enum(new)
            }
            (Some(_), other) => {
                replaced += 1;
                mark_kind(&mut merged.implicit_kinds, name, implicit);
                other
            }
            (None, other) => {
                added += 1;
                mark_kind(&mut merged.implicit_kinds, name, implicit);
                other
            }
        };
        merged.types.insert(name.clone(), next);
    }

    for (name, sym) in &overlay.symbols {
        let mut sym = sym.clone();
        if adopt_pointer {
            if let Some(ty) = sym.ty.as_mut() {
                repoint(ty, base.pointer_size, base.pointer_endian);
            }
        }
        if let Some(old) = merged.symbols.get(name) {
            if sym.ty.is_none() {
                sym.ty = old.ty.clone();
            }
            if sym.constant_data.is_none() {
                sym.constant_data = old.constant_data.clone();
            }
        }
        merged.symbols.insert(name.clone(), sym);
    }

    if !overlay.metadata.format.is_empty() {
        merged.metadata.format = overlay.metadata.format.clone();
    }
    if overlay.metadata.producer.is_some() {
        merged.metadata.producer = overlay.metadata.producer.clone();
    }
    if !adopt_pointer {
        merged.pointer_size = overlay.pointer_size;
        merged.pointer_endian = overlay.pointer_endian;
    }
    merged.lineage.extend(overlay.lineage.iter().cloned());

    debug!(
        "merged overlay: {} types replaced, {} added, {} symbols",
        replaced,
        added,
        overlay.symbols.len()
    );

    merged.validate()?;
    Ok(merged)
}

fn mark_kind(implicit_kinds: &mut HashSet<String>, name: &str, implicit: bool) {
    if implicit {
        implicit_kinds.insert(name.to_string());
    } else {
        implicit_kinds.remove(name);
    }
}

fn merge_struct(profile: &Profile, old: &StructType, new: StructType, keep_kind: bool) -> StructType {
    let StructType {
        name,
        kind,
        declared_size,
        fields: overlay_fields,
    } = new;
    let kind = if keep_kind { old.kind } else { kind };

    let mut fields = old.fields.clone();
    for field in overlay_fields {
        match fields.iter_mut().find(|f| f.name == field.name) {
            Some(existing) => *existing = field,
            None => fields.push(field),
        }
    }

    let mut merged = StructType {
        name,
        kind,
        declared_size: None,
        fields,
    };
    merged.sort_fields();

    merged.declared_size = match declared_size {
        Some(size) => Some(size),
        None => {
            let extent = profile.size_of(&TypeDescriptor::Struct(merged.clone()));
            let base_size = profile.size_of(&TypeDescriptor::Struct(old.clone()));
            Some(extent.max(base_size))
        }
    };
    merged
}

fn repoint(desc: &mut TypeDescriptor, width: usize, endian: Endian) {
    match desc {
        TypeDescriptor::Pointer {
            target,
            width: w,
            endian: e,
        } => {
            *w = width;
            *e = endian;
            repoint(target, width, endian);
        }
        TypeDescriptor::Array { element, .. } => repoint(element, width, endian),
        TypeDescriptor::Struct(s) => {
            for field in &mut s.fields {
                repoint(&mut field.ty, width, endian);
            }
        }
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use crate::parser::{parse_isf_str, parse_overlay_str};
    use crate::{IsfError, StructKind, TypeDescriptor};

    const BASE: &str = r#"{
        "metadata": { "format": "6.2.0", "producer": { "name": "pdbconv" } },
        "base_types": {
            "pointer": { "size": 4, "signed": false, "kind": "int" },
            "unsigned long": { "size": 4, "signed": false, "kind": "int" },
            "unsigned short": { "size": 2, "signed": false, "kind": "int" },
            "unsigned char": { "size": 1, "signed": false, "kind": "char" }
        },
        "user_types": {
            "_HEADER": {
                "size": 16,
                "fields": {
                    "Magic": { "offset": 0, "type": { "kind": "base", "name": "unsigned long" } },
                    "Length": { "offset": 4, "type": { "kind": "base", "name": "unsigned long" } },
                    "Flags": { "offset": 8, "type": { "kind": "base", "name": "unsigned short" } },
                    "Raw": { "offset": 8, "type": { "kind": "array", "count": 2, "subtype": { "kind": "base", "name": "unsigned char" } } }
                }
            }
        },
        "symbols": { "HeaderList": { "address": 256 } },
        "enums": {
            "_KIND": { "size": 4, "base": "unsigned long", "constants": { "A": 1, "B": 2 } }
        }
    }"#;

    const OVERLAY: &str = r#"{
        "metadata": { "producer": { "name": "hotfix" } },
        "user_types": {
            "_HEADER": {
                "fields": {
                    "Length": { "offset": 12, "type": { "kind": "base", "name": "unsigned long" } },
                    "Next": { "offset": 16, "type": { "kind": "pointer", "subtype": { "kind": "struct", "name": "_HEADER" } } }
                }
            }
        },
        "symbols": { "HeaderList": { "address": 512 } },
        "enums": {
            "_KIND": { "size": 4, "base": "unsigned long", "constants": { "B": 20, "C": 3 } }
        }
    }"#;

    #[test]
    fn test_field_level_merge() {
        let base = parse_isf_str(BASE).unwrap();
        let overlay = parse_overlay_str(OVERLAY).unwrap();
        let merged = base.merged_with(&overlay).unwrap();

        let header = merged.struct_type("_HEADER").unwrap();
        // Overlay replaced Length's offset.
        assert_eq!(header.field("Length").unwrap().offset, 12);
        // Base-only fields survive, including the union-style overlap at 8.
        assert_eq!(header.field("Magic").unwrap().offset, 0);
        assert_eq!(header.field("Flags").unwrap().offset, 8);
        assert_eq!(header.field("Raw").unwrap().offset, 8);
        // Overlay-only field added; pointer width taken from the base.
        let next = header.field("Next").unwrap();
        assert_eq!(next.offset, 16);
        assert_eq!(merged.size_of(&next.ty), 4);
        // No declared size in the overlay: max(base 16, extent 20).
        assert_eq!(merged.type_size("_HEADER"), Some(20));

        let names: Vec<&str> = header.field_names().collect();
        assert_eq!(names, vec!["Magic", "Flags", "Raw", "Length", "Next"]);
    }

    #[test]
    fn test_enum_and_symbol_merge() {
        let base = parse_isf_str(BASE).unwrap();
        let overlay = parse_overlay_str(OVERLAY).unwrap();
        let merged = base.merged_with(&overlay).unwrap();

        assert_eq!(merged.enum_value("_KIND", "A"), Some(1));
        assert_eq!(merged.enum_value("_KIND", "B"), Some(20));
        assert_eq!(merged.enum_value("_KIND", "C"), Some(3));
        assert_eq!(merged.symbol_address("HeaderList").unwrap(), 512);
        assert_eq!(merged.version(), "6.2.0");
        assert_eq!(
            merged.lineage(),
            &["pdbconv".to_string(), "hotfix".to_string()]
        );

        // Inputs are untouched.
        assert_eq!(base.symbol_address("HeaderList").unwrap(), 256);
        assert_eq!(base.field_offset("_HEADER", "Length"), Some(4));
    }

    #[test]
    fn test_overlay_declared_size_wins() {
        let base = parse_isf_str(BASE).unwrap();
        let overlay = parse_overlay_str(
            r#"{ "user_types": { "_HEADER": { "size": 8, "fields": {} } } }"#,
        )
        .unwrap();
        let merged = base.merged_with(&overlay).unwrap();
        assert_eq!(merged.type_size("_HEADER"), Some(8));
        assert_eq!(merged.struct_type("_HEADER").unwrap().fields.len(), 4);
    }

    #[test]
    fn test_non_struct_replaced_wholesale() {
        let base = parse_isf_str(BASE).unwrap();
        let overlay = parse_overlay_str(
            r#"{ "base_types": { "unsigned short": { "size": 2, "signed": true, "kind": "int" } } }"#,
        )
        .unwrap();
        let merged = base.merged_with(&overlay).unwrap();
        match merged.resolve("unsigned short").unwrap() {
            TypeDescriptor::Primitive(p) => assert!(p.signed),
            other => panic!("expected primitive, got {:?}", other),
        }
    }

    #[test]
    fn test_fields_left_out_of_overlay_keep_base_values() {
        let base = parse_isf_str(
            r#"{
                "base_types": {
                    "pointer": { "size": 8, "signed": false, "kind": "int" },
                    "unsigned int": { "size": 4, "signed": false, "kind": "int" }
                },
                "user_types": {
                    "_VALUE": {
                        "kind": "union",
                        "size": 4,
                        "fields": { "Raw": { "offset": 0, "type": { "kind": "base", "name": "unsigned int" } } }
                    }
                },
                "symbols": {
                    "Counter": { "address": 16, "type": { "kind": "base", "name": "unsigned int" } }
                }
            }"#,
        )
        .unwrap();

        let overlay = parse_overlay_str(
            r#"{
                "user_types": {
                    "_VALUE": { "fields": { "Bits": { "offset": 0, "type": { "kind": "base", "name": "unsigned int" } } } }
                },
                "symbols": { "Counter": { "address": 32 } }
            }"#,
        )
        .unwrap();
        let merged = base.merged_with(&overlay).unwrap();
        assert_eq!(merged.struct_type("_VALUE").unwrap().kind, StructKind::Union);
        assert_eq!(merged.symbol_address("Counter").unwrap(), 32);
        assert!(merged.symbol_type("Counter").is_some());

        // A declared kind still replaces the base's.
        let declared = parse_overlay_str(
            r#"{ "user_types": { "_VALUE": { "kind": "struct", "fields": {} } } }"#,
        )
        .unwrap();
        let merged = merged.merged_with(&declared).unwrap();
        assert_eq!(merged.struct_type("_VALUE").unwrap().kind, StructKind::Struct);
    }

    #[test]
    fn test_merged_profile_is_validated() {
        let base = parse_isf_str(BASE).unwrap();
        let overlay = parse_overlay_str(
            r#"{ "user_types": { "_X": { "fields": { "y": { "offset": 0, "type": { "kind": "struct", "name": "_MISSING" } } } } } }"#,
        )
        .unwrap();
        match base.merged_with(&overlay) {
            Err(IsfError::UndefinedType { name, referenced_by }) => {
                assert_eq!(name, "_MISSING");
                assert_eq!(referenced_by, "_X.y");
            }
            other => panic!("expected UndefinedType, got {:?}", other),
        }
    }
}
