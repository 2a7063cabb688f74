//! Walk a linked list described by the profile.

use crate::config::parse_u64;
use crate::object::list::DEFAULT_MAX_ENTRIES;
use crate::object::{ListWalker, ObjectError, TypedObject};
use crate::plugins::{
    field_cell, parse_params, resolve_address, Layer, Plugin, PluginContext, PluginError, Record,
    RecordStream,
};
use isf::TypeDescriptor;
use serde::Deserialize;

fn default_next_field() -> String {
    "next".to_string()
}

fn default_max_entries() -> usize {
    DEFAULT_MAX_ENTRIES
}

#[derive(Debug, Deserialize)]
struct ListWalkParams {
    /// Symbol name or address of the list head (or of a first container).
    start: String,
    /// Type at `start`. Defaults to the symbol's type, else the link type.
    start_type: Option<String>,
    /// Container type.
    #[serde(rename = "type")]
    type_name: String,
    /// Member of the container that links it into the list.
    link_field: String,
    #[serde(default = "default_next_field")]
    next_field: String,
    #[serde(default)]
    fields: Vec<String>,
    #[serde(default = "default_max_entries")]
    max_entries: usize,
    layer: Option<Layer>,
}

pub struct ListWalk;

impl ListWalk {
    fn start_object(
        ctx: &PluginContext,
        layer: Layer,
        params: &ListWalkParams,
    ) -> Result<TypedObject, PluginError> {
        let profile = ctx.require_profile()?.clone();
        let space = ctx.space(layer)?;
        let address = resolve_address(ctx, &params.start)?;

        let symbol_type = match parse_u64(&params.start) {
            Ok(_) => None,
            Err(_) => profile.symbol_type(&params.start).cloned(),
        };
        let ty = match (&params.start_type, symbol_type) {
            (Some(name), _) => {
                profile
                    .resolve(name)
                    .map_err(|e| PluginError::Object(e.into()))?;
                TypeDescriptor::Named(name.clone())
            }
            (None, Some(ty)) => ty,
            (None, None) => {
                let container = profile
                    .struct_type(&params.type_name)
                    .ok_or_else(|| ObjectError::UnknownType(params.type_name.clone()))?;
                container
                    .field(&params.link_field)
                    .ok_or_else(|| ObjectError::UnknownField {
                        type_name: params.type_name.clone(),
                        field: params.link_field.clone(),
                    })?
                    .ty
                    .clone()
            }
        };
        Ok(TypedObject::new(space, profile, address, ty))
    }
}

impl Plugin for ListWalk {
    fn name(&self) -> &'static str {
        "listwalk"
    }

    fn description(&self) -> &'static str {
        "Walk a linked list of profile structures from a symbol or address"
    }

    fn category(&self) -> &'static str {
        "objects"
    }

    fn run<'a>(
        &self,
        ctx: &'a PluginContext,
        params: &serde_json::Value,
    ) -> Result<RecordStream<'a>, PluginError> {
        let params: ListWalkParams = parse_params(params)?;
        let layer = ctx.resolve_layer(params.layer)?;
        let start = Self::start_object(ctx, layer, &params)?;
        let walker = ListWalker::new(params.type_name.as_str(), params.link_field.as_str())
            .next_field(params.next_field.as_str())
            .max_entries(params.max_entries);
        let entries = walker.walk(&start)?;
        let fields = params.fields;

        Ok(Box::new(entries.enumerate().map(move |(index, obj)| {
            let mut record = Record::builder()
                .value("index", index)
                .value("offset", obj.offset())
                .value("layer", layer);
            if fields.is_empty() {
                record = record.object("object", obj);
            } else {
                for path in &fields {
                    record = record.cell(path.as_str(), field_cell(&obj, path));
                }
            }
            Ok(record.build())
        })))
    }
}
