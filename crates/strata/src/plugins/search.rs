//! Search an address space for byte patterns.
//!
//! Patterns are given as ASCII text, text to encode as UTF-16LE, or hex.
//! Each hit carries a window of surrounding bytes as hex and printable
//! ASCII, which is enough to spot flag strings, paths or resident file data.

use crate::config::deserialize_optional_u64_hex;
use crate::memory::scanners::needle::utf16le;
use crate::memory::scanners::{ScanRange, Scanner};
use crate::plugins::{
    hex_dump_inline, parse_params, printable_ascii, Layer, Plugin, PluginContext, PluginError,
    Record, RecordStream,
};
use serde::Deserialize;
use std::sync::Arc;

/// Widest context window accepted, per side.
const MAX_CONTEXT: usize = 4096;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Encoding {
    #[default]
    Ascii,
    Utf16le,
    Hex,
}

impl Encoding {
    /// Bytes to search for.
    pub fn encode(&self, pattern: &str) -> Result<Vec<u8>, String> {
        let bytes = match self {
            Encoding::Ascii => pattern.as_bytes().to_vec(),
            Encoding::Utf16le => utf16le(pattern),
            Encoding::Hex => {
                let clean: String = pattern.chars().filter(|c| !c.is_whitespace()).collect();
                hex::decode(&clean).map_err(|e| format!("invalid hex pattern '{}': {}", pattern, e))?
            }
        };
        if bytes.is_empty() {
            return Err("empty search pattern".to_string());
        }
        Ok(bytes)
    }
}

fn default_context() -> usize {
    64
}

fn default_limit() -> usize {
    20
}

#[derive(Debug, Deserialize)]
struct SearchParams {
    pattern: Option<String>,
    #[serde(default)]
    patterns: Vec<String>,
    #[serde(default)]
    encoding: Encoding,
    /// Bytes of context on each side of a hit.
    #[serde(default = "default_context")]
    context: usize,
    /// Most hits to report; 0 for all.
    #[serde(default = "default_limit")]
    limit: usize,
    layer: Option<Layer>,
    #[serde(default, deserialize_with = "deserialize_optional_u64_hex")]
    start: Option<u64>,
    #[serde(default, deserialize_with = "deserialize_optional_u64_hex")]
    end: Option<u64>,
    alignment: Option<u64>,
}

pub struct Search;

impl Plugin for Search {
    fn name(&self) -> &'static str {
        "search"
    }

    fn description(&self) -> &'static str {
        "Search memory for byte patterns (ascii, utf16le or hex) with context"
    }

    fn category(&self) -> &'static str {
        "scan"
    }

    fn run<'a>(
        &self,
        ctx: &'a PluginContext,
        params: &serde_json::Value,
    ) -> Result<RecordStream<'a>, PluginError> {
        let params: SearchParams = parse_params(params)?;
        let mut texts = params.patterns;
        if let Some(p) = params.pattern {
            texts.insert(0, p);
        }
        if texts.is_empty() {
            return Err(PluginError::InvalidParams(
                "'pattern' or 'patterns' is required".into(),
            ));
        }
        let patterns = texts
            .iter()
            .map(|t| params.encoding.encode(t))
            .collect::<Result<Vec<_>, _>>()
            .map_err(PluginError::InvalidParams)?;

        let mut config = ctx.config.scan_config();
        config.alignment = params.alignment;
        let scanner = Arc::new(Scanner::new(patterns, config)?);
        let layer = ctx.resolve_layer(params.layer)?;
        let space = ctx.space(layer)?;
        let range = ScanRange {
            start: params.start.unwrap_or(0),
            end: params.end,
        };
        let context = params.context.min(MAX_CONTEXT);
        let limit = if params.limit == 0 {
            usize::MAX
        } else {
            params.limit
        };

        let hits = scanner.scan(space.clone(), range).take(limit);
        Ok(Box::new(hits.map(move |m| {
            let pattern_len = scanner.pattern(m.pattern_id).map_or(0, <[u8]>::len);
            let ctx_start = m.offset.saturating_sub(context as u64);
            let ctx_len = (m.offset - ctx_start) as usize + pattern_len + context;
            let window = space.read_padded(ctx_start, ctx_len);
            let mut record = Record::builder()
                .value("offset", m.offset)
                .value("layer", layer)
                .value("pattern", &texts[m.pattern_id]);
            if layer == Layer::Virtual {
                record = record.value(
                    "physical",
                    space.translate(m.offset).map(|t| t.mapped_offset),
                );
            }
            Ok(record
                .value("context_offset", ctx_start)
                .value("context_hex", hex_dump_inline(&window))
                .value("context_ascii", printable_ascii(&window))
                .build())
        })))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plugins::testing::{collect, flat_context, paged_context};
    use serde_json::json;

    fn offsets(records: &[Record]) -> Vec<u64> {
        records
            .iter()
            .map(|r| r.value("offset").and_then(|v| v.as_u64()).unwrap())
            .collect()
    }

    fn run(data: &[u8], params: serde_json::Value) -> Result<Vec<Record>, PluginError> {
        let ctx = flat_context(data.to_vec());
        Search.run(&ctx, &params).map(collect)
    }

    #[test]
    fn test_single_match_ascii() {
        let mut data = vec![0u8; 4096];
        data[100..110].copy_from_slice(b"FLAG{test}");
        let records = run(&data, json!({"pattern": "FLAG{", "context": 4})).unwrap();
        assert_eq!(offsets(&records), vec![100]);
        let json = records[0].to_json();
        assert_eq!(json["context_offset"], 96);
        assert_eq!(json["context_ascii"], "....FLAG{test");
        assert_eq!(json["layer"], "physical");
        assert!(json.get("physical").is_none());
    }

    #[test]
    fn test_multiple_patterns_and_limit() {
        let data = b"..cat..dog..cat..dog..".to_vec();
        let records = run(&data, json!({"patterns": ["cat", "dog"], "limit": 0})).unwrap();
        assert_eq!(offsets(&records), vec![2, 7, 12, 17]);
        assert_eq!(records[1].value("pattern"), Some(&json!("dog")));

        let records = run(&data, json!({"patterns": ["cat", "dog"], "limit": 3})).unwrap();
        assert_eq!(records.len(), 3);
    }

    #[test]
    fn test_utf16le_and_hex_patterns() {
        let mut data = vec![0u8; 256];
        data[10..16].copy_from_slice(&utf16le("abc"));
        data[200..204].copy_from_slice(&[0xde, 0xad, 0xbe, 0xef]);

        let records = run(&data, json!({"pattern": "abc", "encoding": "utf16le"})).unwrap();
        assert_eq!(offsets(&records), vec![10]);
        let records = run(&data, json!({"pattern": "de ad be ef", "encoding": "hex"})).unwrap();
        assert_eq!(offsets(&records), vec![200]);
        assert!(records[0].to_json()["context_hex"]
            .as_str()
            .unwrap()
            .contains("de ad be ef"));
    }

    #[test]
    fn test_range_and_alignment() {
        let data = b"MZ..MZ..MZ..MZ..".to_vec();
        let records = run(&data, json!({"pattern": "MZ", "start": "0x4", "end": 12})).unwrap();
        assert_eq!(offsets(&records), vec![4, 8]);
        let records = run(&data, json!({"pattern": "MZ", "alignment": 8})).unwrap();
        assert_eq!(offsets(&records), vec![0, 8]);
    }

    #[test]
    fn test_invalid_params() {
        assert!(matches!(run(b"x", json!({})), Err(PluginError::InvalidParams(_))));
        assert!(matches!(
            run(b"x", json!({"pattern": "zz", "encoding": "hex"})),
            Err(PluginError::InvalidParams(_))
        ));
        assert!(matches!(
            run(b"x", json!({"pattern": ""})),
            Err(PluginError::InvalidParams(_))
        ));
        assert!(matches!(
            run(b"x", json!({"pattern": "x", "layer": "virtual"})),
            Err(PluginError::MissingVirtualSpace)
        ));
    }

    #[test]
    fn test_virtual_layer_reports_physical() {
        let ctx = paged_context();
        let records = collect(Search.run(&ctx, &json!({"pattern": "secret"})).unwrap());
        assert_eq!(offsets(&records), vec![0x2010]);
        let json = records[0].to_json();
        assert_eq!(json["layer"], "virtual");
        assert_eq!(json["physical"], 0x6010);

        let records = collect(
            Search
                .run(&ctx, &json!({"pattern": "secret", "layer": "physical"}))
                .unwrap(),
        );
        assert_eq!(offsets(&records), vec![0x6010]);
    }

    #[test]
    fn test_no_match() {
        assert!(run(b"hello world", json!({"pattern": "xyz"})).unwrap().is_empty());
    }
}
