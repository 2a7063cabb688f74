//! Mapped ranges of the virtual address space.

use crate::config::deserialize_optional_u64_hex;
use crate::memory::AddressSpace;
use crate::plugins::{parse_params, Plugin, PluginContext, PluginError, Record, RecordStream};
use serde::Deserialize;

#[derive(Debug, Deserialize)]
struct MappingsParams {
    #[serde(default, deserialize_with = "deserialize_optional_u64_hex")]
    start: Option<u64>,
    /// Exclusive; defaults to the end of the space.
    #[serde(default, deserialize_with = "deserialize_optional_u64_hex")]
    end: Option<u64>,
    /// Most ranges to report; 0 for all.
    #[serde(default)]
    limit: usize,
}

pub struct Mappings;

impl Plugin for Mappings {
    fn name(&self) -> &'static str {
        "mappings"
    }

    fn description(&self) -> &'static str {
        "List mapped virtual ranges and the physical offsets behind them"
    }

    fn category(&self) -> &'static str {
        "memory"
    }

    fn run<'a>(
        &self,
        ctx: &'a PluginContext,
        params: &serde_json::Value,
    ) -> Result<RecordStream<'a>, PluginError> {
        let params: MappingsParams = parse_params(params)?;
        let paged = ctx.require_virtual()?;
        let start = params.start.unwrap_or(0);
        let end = params
            .end
            .unwrap_or_else(|| paged.maximum_address().saturating_add(1));
        if start > end {
            return Err(PluginError::InvalidParams(format!(
                "start {:#x} is past end {:#x}",
                start, end
            )));
        }
        let limit = if params.limit == 0 {
            usize::MAX
        } else {
            params.limit
        };

        let ranges = paged.mapped_ranges(start, end);
        Ok(Box::new(ranges.into_iter().take(limit).map(|r| {
            Ok(Record::builder()
                .value("start", r.start)
                .value("end", r.end())
                .value("length", r.length)
                .value("physical", r.mapped_offset)
                .build())
        })))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plugins::testing::{collect, flat_context, paged_context};
    use serde_json::json;

    fn triples(records: &[Record]) -> Vec<(u64, u64, u64)> {
        records
            .iter()
            .map(|r| {
                let j = r.to_json();
                (
                    j["start"].as_u64().unwrap(),
                    j["length"].as_u64().unwrap(),
                    j["physical"].as_u64().unwrap(),
                )
            })
            .collect()
    }

    #[test]
    fn test_lists_mapped_pages() {
        let ctx = paged_context();
        let records = collect(Mappings.run(&ctx, &json!(null)).unwrap());
        assert_eq!(
            triples(&records),
            vec![(0, 0x1000, 0x5000), (0x2000, 0x1000, 0x6000)]
        );
        assert_eq!(records[1].to_json()["end"], 0x3000);
    }

    #[test]
    fn test_bounds_and_limit() {
        let ctx = paged_context();
        let records = collect(
            Mappings
                .run(&ctx, &json!({"start": "0x800", "end": "0x2800"}))
                .unwrap(),
        );
        assert_eq!(
            triples(&records),
            vec![(0x800, 0x800, 0x5800), (0x2000, 0x800, 0x6000)]
        );
        let records = collect(Mappings.run(&ctx, &json!({"limit": 1})).unwrap());
        assert_eq!(records.len(), 1);
        assert!(matches!(
            Mappings.run(&ctx, &json!({"start": 16, "end": 8})).map(collect),
            Err(PluginError::InvalidParams(_))
        ));
    }

    #[test]
    fn test_requires_virtual_space() {
        let ctx = flat_context(vec![0u8; 16]);
        assert!(matches!(
            Mappings.run(&ctx, &json!({})).map(collect),
            Err(PluginError::MissingVirtualSpace)
        ));
    }
}
