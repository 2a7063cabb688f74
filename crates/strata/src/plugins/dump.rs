//! Raw bytes at an offset, sixteen per record.

use crate::config::deserialize_u64_hex;
use crate::plugins::{
    parse_params, printable_ascii, Layer, Plugin, PluginContext, PluginError, Record,
    RecordStream,
};
use serde::Deserialize;
use std::fmt::Write;
use std::ops::Range;

/// Longest dump accepted.
pub const MAX_DUMP_LENGTH: usize = 1 << 20;

const ROW: usize = 16;

fn default_length() -> usize {
    256
}

#[derive(Debug, Deserialize)]
struct DumpParams {
    #[serde(deserialize_with = "deserialize_u64_hex")]
    offset: u64,
    #[serde(default = "default_length")]
    length: usize,
    layer: Option<Layer>,
}

/// `xx xx ... xx  xx xx ... xx`, padded to a full row.
fn hex_row(data: &[u8]) -> String {
    let mut out = String::with_capacity(ROW * 3 + 1);
    for j in 0..ROW {
        if j == 8 {
            out.push(' ');
        }
        match data.get(j) {
            Some(byte) => {
                let _ = write!(out, "{:02x} ", byte);
            }
            None => out.push_str("   "),
        }
    }
    out.truncate(out.trim_end().len());
    out
}

/// Bytes of `row` covered by `faults`.
fn faulted_in(row: &Range<u64>, faults: &[Range<u64>]) -> u64 {
    faults
        .iter()
        .map(|f| {
            let start = f.start.max(row.start);
            let end = f.end.min(row.end);
            end.saturating_sub(start)
        })
        .sum()
}

pub struct Dump;

impl Plugin for Dump {
    fn name(&self) -> &'static str {
        "dump"
    }

    fn description(&self) -> &'static str {
        "Hex dump of raw bytes at an offset, with unreadable bytes marked"
    }

    fn category(&self) -> &'static str {
        "memory"
    }

    fn run<'a>(
        &self,
        ctx: &'a PluginContext,
        params: &serde_json::Value,
    ) -> Result<RecordStream<'a>, PluginError> {
        let params: DumpParams = parse_params(params)?;
        if params.length == 0 || params.length > MAX_DUMP_LENGTH {
            return Err(PluginError::InvalidParams(format!(
                "length must be between 1 and {}",
                MAX_DUMP_LENGTH
            )));
        }
        let layer = ctx.resolve_layer(params.layer)?;
        let space = ctx.space(layer)?;
        let read = space.read_partial(params.offset, params.length);
        let base = params.offset;

        let rows: Vec<Record> = read
            .data
            .chunks(ROW)
            .enumerate()
            .map(|(i, chunk)| {
                let start = base.wrapping_add((i * ROW) as u64);
                let span = start..start.saturating_add(chunk.len() as u64);
                let mut record = Record::builder()
                    .value("offset", start)
                    .value("hex", hex_row(chunk))
                    .value("ascii", printable_ascii(chunk));
                if layer == Layer::Virtual {
                    record = record.value("physical", space.translate(start).map(|t| t.mapped_offset));
                }
                record.value("faulted", faulted_in(&span, &read.faults)).build()
            })
            .collect();
        Ok(Box::new(rows.into_iter().map(Ok)))
    }
}
