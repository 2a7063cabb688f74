//! Find structures by signature.
//!
//! Scans for a byte signature (a pool tag, a magic value, a known string
//! member) and overlays a profile type at a fixed distance from each hit.
//! Overlays that are unmapped, or whose checked members do not hold the
//! expected values, are dropped. This is how carving finds objects that are
//! no longer linked into any list.

use crate::config::deserialize_optional_u64_hex;
use crate::memory::scanners::{ScanRange, Scanner};
use crate::object::TypedObject;
use crate::plugins::search::Encoding;
use crate::plugins::{
    field_cell, field_matches, parse_params, Layer, Plugin, PluginContext, PluginError, Record,
    RecordStream,
};
use serde::Deserialize;
use std::sync::Arc;
use tracing::debug;

#[derive(Debug, Deserialize)]
struct StructScanParams {
    signature: String,
    #[serde(default)]
    encoding: Encoding,
    #[serde(rename = "type")]
    type_name: String,
    /// Address of the structure minus address of the signature.
    #[serde(default)]
    struct_offset: i64,
    /// Member paths to report. Without any, the whole object is reported.
    #[serde(default)]
    fields: Vec<String>,
    /// Member path to expected value; every one must match.
    #[serde(default)]
    checks: serde_json::Map<String, serde_json::Value>,
    layer: Option<Layer>,
    #[serde(default, deserialize_with = "deserialize_optional_u64_hex")]
    start: Option<u64>,
    #[serde(default, deserialize_with = "deserialize_optional_u64_hex")]
    end: Option<u64>,
    alignment: Option<u64>,
    /// Most structures to report; 0 for all.
    #[serde(default)]
    limit: usize,
}

pub struct StructScan;

impl Plugin for StructScan {
    fn name(&self) -> &'static str {
        "structscan"
    }

    fn description(&self) -> &'static str {
        "Scan for a signature and overlay a profile type at each hit"
    }

    fn category(&self) -> &'static str {
        "scan"
    }

    fn run<'a>(
        &self,
        ctx: &'a PluginContext,
        params: &serde_json::Value,
    ) -> Result<RecordStream<'a>, PluginError> {
        let params: StructScanParams = parse_params(params)?;
        let profile = ctx.require_profile()?.clone();
        profile
            .resolve(&params.type_name)
            .map_err(|e| PluginError::Object(e.into()))?;
        let signature = params
            .encoding
            .encode(&params.signature)
            .map_err(PluginError::InvalidParams)?;

        let mut config = ctx.config.scan_config();
        config.alignment = params.alignment;
        let scanner = Arc::new(Scanner::new(vec![signature], config)?);
        let layer = ctx.resolve_layer(params.layer)?;
        let space = ctx.space(layer)?;
        let range = ScanRange {
            start: params.start.unwrap_or(0),
            end: params.end,
        };
        let limit = if params.limit == 0 {
            usize::MAX
        } else {
            params.limit
        };
        let StructScanParams {
            type_name,
            struct_offset,
            fields,
            checks,
            ..
        } = params;

        let overlays = scanner
            .scan(space.clone(), range)
            .filter_map(move |hit| {
                let address = hit.offset.checked_add_signed(struct_offset)?;
                let obj = TypedObject::from_type_name(
                    space.clone(),
                    profile.clone(),
                    &type_name,
                    address,
                )
                .ok()?;
                if !obj.is_valid() {
                    debug!("Overlay at {:#x} unmapped, skipped", address);
                    return None;
                }
                for (path, expected) in &checks {
                    match field_matches(&obj, path, expected) {
                        Ok(true) => {}
                        Ok(false) => return None,
                        Err(e) => {
                            debug!("Check '{}' at {:#x} failed: {}", path, address, e);
                            return None;
                        }
                    }
                }
                Some((hit.offset, obj))
            })
            .take(limit);

        Ok(Box::new(overlays.map(move |(hit, obj)| {
            let mut record = Record::builder()
                .value("offset", obj.offset())
                .value("hit", hit)
                .value("layer", layer)
                .value("type", obj.type_name());
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
