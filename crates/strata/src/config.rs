//! Session configuration.
//!
//! Every field has a default, so an empty JSON object is a valid config.
//! Addresses accept a JSON number, a `"0x..."` hex string or a decimal
//! string.

use crate::memory::scanners::{ScanConfig, DEFAULT_CHUNK_SIZE};
use crate::memory::translators::paging::DEFAULT_TABLE_CACHE;
use crate::memory::translators::{PagingMode, PagingOptions};
use crate::memory::FillPolicy;
use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Cannot read config '{path}': {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid config: {0}")]
    Parse(#[from] serde_json::Error),
}

/// Parse an address: decimal, or hex with a `0x`/`0X` prefix.
pub fn parse_u64(text: &str) -> Result<u64, String> {
    let s = text.trim();
    if let Some(hex) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        u64::from_str_radix(hex, 16).map_err(|e| format!("bad hex value '{}': {}", text, e))
    } else {
        s.parse::<u64>()
            .map_err(|e| format!("bad value '{}': {}", text, e))
    }
}

pub(crate) fn u64_from_json(value: &serde_json::Value) -> Result<Option<u64>, String> {
    match value {
        serde_json::Value::Null => Ok(None),
        serde_json::Value::Number(n) => n
            .as_u64()
            .map(Some)
            .ok_or_else(|| "expected unsigned 64-bit integer".to_string()),
        serde_json::Value::String(s) => parse_u64(s).map(Some),
        _ => Err("expected number or hex string".to_string()),
    }
}

/// Deserialize an optional u64 given as a number, hex string or decimal
/// string.
pub(crate) fn deserialize_optional_u64_hex<'de, D>(deserializer: D) -> Result<Option<u64>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let val: Option<serde_json::Value> = Option::deserialize(deserializer)?;
    match val {
        None => Ok(None),
        Some(v) => u64_from_json(&v).map_err(serde::de::Error::custom),
    }
}

/// As [`deserialize_optional_u64_hex`], but the value must be present.
pub(crate) fn deserialize_u64_hex<'de, D>(deserializer: D) -> Result<u64, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let val = serde_json::Value::deserialize(deserializer)?;
    u64_from_json(&val)
        .and_then(|v| v.ok_or_else(|| "expected an address, got null".to_string()))
        .map_err(serde::de::Error::custom)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Physical address of the top-level page table (CR3).
    #[serde(alias = "dtb", deserialize_with = "deserialize_optional_u64_hex")]
    pub physical_offset: Option<u64>,
    pub paging_mode: PagingMode,
    /// Treat Windows transition PTEs as valid.
    pub transition_pages: bool,
    pub fill_policy: FillPolicy,
    /// Added to every profile symbol address.
    #[serde(deserialize_with = "deserialize_optional_u64_hex")]
    pub kernel_base: Option<u64>,
    pub scan_chunk_size: usize,
    pub scan_overlap: Option<usize>,
    /// Capacity of the page-table read cache, in tables.
    pub translation_cache_size: usize,
    /// Stream to open inside a multi-stream container.
    pub stream: Option<String>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        SessionConfig {
            physical_offset: None,
            paging_mode: PagingMode::default(),
            transition_pages: false,
            fill_policy: FillPolicy::default(),
            kernel_base: None,
            scan_chunk_size: DEFAULT_CHUNK_SIZE,
            scan_overlap: None,
            translation_cache_size: DEFAULT_TABLE_CACHE,
            stream: None,
        }
    }
}

impl SessionConfig {
    pub fn from_json_str(text: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(text)?)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_json_str(&text)
    }

    /// Scanner settings derived from this config.
    pub fn scan_config(&self) -> ScanConfig {
        ScanConfig {
            chunk_size: self.scan_chunk_size,
            overlap: self.scan_overlap,
            ..ScanConfig::default()
        }
    }

    pub fn paging_options(&self) -> PagingOptions {
        PagingOptions {
            transition: self.transition_pages,
            fill_policy: self.fill_policy,
            table_cache_size: self.translation_cache_size,
        }
    }
}
