//! Page-table walk traces.

use crate::config::u64_from_json;
use crate::plugins::{parse_params, Plugin, PluginContext, PluginError, Record, RecordStream};
use serde::Deserialize;

#[derive(Debug, Deserialize)]
struct VtopParams {
    address: Option<serde_json::Value>,
    #[serde(default)]
    addresses: Vec<serde_json::Value>,
}

pub struct Vtop;

impl Plugin for Vtop {
    fn name(&self) -> &'static str {
        "vtop"
    }

    fn description(&self) -> &'static str {
        "Translate virtual addresses and show every page-table level visited"
    }

    fn category(&self) -> &'static str {
        "memory"
    }

    fn run<'a>(
        &self,
        ctx: &'a PluginContext,
        params: &serde_json::Value,
    ) -> Result<RecordStream<'a>, PluginError> {
        let params: VtopParams = parse_params(params)?;
        let paged = ctx.require_virtual()?;
        let addresses = params
            .address
            .iter()
            .chain(params.addresses.iter())
            .map(|v| match u64_from_json(v) {
                Ok(Some(addr)) => Ok(addr),
                Ok(None) => Err(PluginError::InvalidParams("null address".into())),
                Err(e) => Err(PluginError::InvalidParams(e)),
            })
            .collect::<Result<Vec<u64>, _>>()?;
        if addresses.is_empty() {
            return Err(PluginError::InvalidParams(
                "'address' or 'addresses' is required".into(),
            ));
        }

        Ok(Box::new(addresses.into_iter().map(move |addr| {
            let trace = paged.vtop(addr);
            Ok(Record::builder()
                .value("address", trace.address)
                .value("physical", trace.physical)
                .value("page_size", trace.page_size)
                .value("miss", trace.miss)
                .value("steps", &trace.steps)
                .build())
        })))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plugins::testing::{collect, flat_context, paged_context};
    use serde_json::json;

    #[test]
    fn test_mapped_and_unmapped_addresses() {
        let ctx = paged_context();
        let records = collect(
            Vtop.run(&ctx, &json!({"address": "0x2010", "addresses": [4096]}))
                .unwrap(),
        );
        assert_eq!(records.len(), 2);

        let mapped = records[0].to_json();
        assert_eq!(mapped["address"], 0x2010);
        assert_eq!(mapped["physical"], 0x6010);
        assert_eq!(mapped["page_size"], 0x1000);
        assert!(mapped["miss"].is_null());
        let steps = mapped["steps"].as_array().unwrap();
        assert_eq!(steps.len(), 2);
        assert_eq!(steps[0]["table"], 0x1000);
        assert_eq!(steps[1]["table"], 0x2000);
        assert_eq!(steps[1]["index"], 2);

        let unmapped = records[1].to_json();
        assert!(unmapped["physical"].is_null());
        assert_eq!(unmapped["miss"], "not_present");
    }

    #[test]
    fn test_requires_virtual_space_and_address() {
        let ctx = flat_context(vec![0u8; 16]);
        assert!(matches!(
            Vtop.run(&ctx, &json!({"address": 0})).map(collect),
            Err(PluginError::MissingVirtualSpace)
        ));
        let ctx = paged_context();
        assert!(matches!(
            Vtop.run(&ctx, &json!({})).map(collect),
            Err(PluginError::InvalidParams(_))
        ));
        assert!(matches!(
            Vtop.run(&ctx, &json!({"address": "0xq"})).map(collect),
            Err(PluginError::InvalidParams(_))
        ));
    }
}
