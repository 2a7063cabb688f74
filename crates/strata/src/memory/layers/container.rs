//! Multi-stream chunked container images.
//!
//! A container is a JSON manifest plus a data file. The manifest names one
//! or more logical streams; each stream is a sequence of fixed-size chunks
//! stored raw or xz-compressed in the data file, optionally restricted by a
//! sparse map of populated ranges and carrying a SHA-256 digest of its
//! content.
//!
//! ```json
//! {
//!   "format": "strata-container",
//!   "version": 1,
//!   "provenance": { "tool": "acquire", "host": "ws-17" },
//!   "data_file": "memory.data",
//!   "streams": [{
//!     "name": "physical", "size": 1048576, "chunk_size": 65536,
//!     "compression": "xz",
//!     "chunks": [{ "offset": 0, "stored_size": 812 }, null],
//!     "map": [{ "start": 0, "length": 65536 }],
//!     "sha256": "…"
//!   }]
//! }
//! ```

use crate::memory::error::{MemoryError, MemoryResult};
use crate::memory::layers::mmap_file::MmapFileStore;
use crate::memory::traits::BackingStore;
use lru::LruCache;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::io::Read;
use std::num::NonZeroUsize;
use std::ops::Range;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info};
use xz2::read::XzDecoder;

pub const CONTAINER_FORMAT: &str = "strata-container";

/// Decompressed chunks kept in memory.
const CHUNK_CACHE_SIZE: usize = 64;

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Manifest {
    pub format: String,
    #[serde(default = "default_version")]
    pub version: u32,
    #[serde(default)]
    pub provenance: BTreeMap<String, String>,
    pub data_file: String,
    pub streams: Vec<StreamInfo>,
}

fn default_version() -> u32 {
    1
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Compression {
    #[default]
    None,
    Xz,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct StreamInfo {
    pub name: String,
    pub size: u64,
    pub chunk_size: u64,
    #[serde(default)]
    pub compression: Compression,
    /// Chunk `i` holds logical bytes `[i * chunk_size, (i + 1) * chunk_size)`.
    /// `null` entries are absent chunks.
    pub chunks: Vec<Option<ChunkRef>>,
    #[serde(default)]
    pub map: Option<Vec<MapEntry>>,
    #[serde(default)]
    pub sha256: Option<String>,
}

#[derive(Debug, Clone, Copy, Deserialize, Serialize)]
pub struct ChunkRef {
    pub offset: u64,
    pub stored_size: u64,
}

#[derive(Debug, Clone, Copy, Deserialize, Serialize)]
pub struct MapEntry {
    pub start: u64,
    pub length: u64,
}

/// One stream of a container, exposed as a backing store.
pub struct ContainerStore {
    name: String,
    manifest: Arc<Manifest>,
    stream: StreamInfo,
    data: MmapFileStore,
    runs: Vec<Range<u64>>,
    cache: Mutex<LruCache<usize, Arc<Vec<u8>>>>,
}

impl ContainerStore {
    /// True when `bytes` look like a container manifest.
    pub fn is_manifest(bytes: &[u8]) -> bool {
        #[derive(Deserialize)]
        struct Probe {
            format: String,
        }
        let trimmed = bytes.iter().position(|b| !b.is_ascii_whitespace());
        match trimmed {
            Some(i) if bytes[i] == b'{' => serde_json::from_slice::<Probe>(bytes)
                .map(|p| p.format == CONTAINER_FORMAT)
                .unwrap_or(false),
            _ => false,
        }
    }

    pub fn read_manifest(path: impl AsRef<Path>) -> MemoryResult<Manifest> {
        let path = path.as_ref();
        let text = std::fs::read(path)?;
        let manifest: Manifest = serde_json::from_slice(&text)
            .map_err(|e| MemoryError::container(format!("{}: {}", path.display(), e)))?;
        if manifest.format != CONTAINER_FORMAT {
            return Err(MemoryError::container(format!(
                "{}: unknown container format '{}'",
                path.display(),
                manifest.format
            )));
        }
        Ok(manifest)
    }

    /// Open one stream of the container described by the manifest at
    /// `manifest_path`. Without a stream name the first stream is used.
    pub fn open(manifest_path: impl AsRef<Path>, stream: Option<&str>) -> MemoryResult<Self> {
        let manifest_path = manifest_path.as_ref();
        let manifest = Self::read_manifest(manifest_path)?;

        let info = match stream {
            Some(name) => manifest.streams.iter().find(|s| s.name == name).ok_or_else(|| {
                MemoryError::container(format!("no stream named '{}' in container", name))
            })?,
            None => manifest
                .streams
                .first()
                .ok_or_else(|| MemoryError::container("container has no streams"))?,
        }
        .clone();

        if info.chunk_size == 0 {
            return Err(MemoryError::container(format!(
                "stream '{}' has zero chunk size",
                info.name
            )));
        }
        let needed = info.size.div_ceil(info.chunk_size);
        if (info.chunks.len() as u64) < needed {
            return Err(MemoryError::container(format!(
                "stream '{}' lists {} chunks, needs {}",
                info.name,
                info.chunks.len(),
                needed
            )));
        }

        let data_path = manifest_path
            .parent()
            .unwrap_or_else(|| Path::new("."))
            .join(&manifest.data_file);
        let data = MmapFileStore::open_path(&data_path)?;
        for (idx, chunk) in info.chunks.iter().enumerate() {
            if let Some(c) = chunk {
                if c.offset.saturating_add(c.stored_size) > data.size() {
                    return Err(MemoryError::container(format!(
                        "chunk {} of stream '{}' lies outside the data file",
                        idx, info.name
                    )));
                }
            }
        }

        let runs = compute_runs(&info);
        info!(
            "opened container stream '{}' ({} bytes, {} runs, {:?})",
            info.name,
            info.size,
            runs.len(),
            info.compression
        );

        Ok(ContainerStore {
            name: format!("{}#{}", data.name(), info.name),
            manifest: Arc::new(manifest),
            stream: info,
            data,
            runs,
            cache: Mutex::new(LruCache::new(
                NonZeroUsize::new(CHUNK_CACHE_SIZE).unwrap_or(NonZeroUsize::MIN),
            )),
        })
    }

    pub fn manifest(&self) -> &Manifest {
        &self.manifest
    }

    /// Acquisition metadata recorded in the manifest.
    pub fn provenance(&self) -> &BTreeMap<String, String> {
        &self.manifest.provenance
    }

    pub fn stream_name(&self) -> &str {
        &self.stream.name
    }

    fn chunk_len(&self, idx: usize) -> u64 {
        let start = idx as u64 * self.stream.chunk_size;
        self.stream.chunk_size.min(self.stream.size.saturating_sub(start))
    }

    /// Decompressed contents of chunk `idx`, or `None` for an absent chunk.
    fn chunk(&self, idx: usize) -> MemoryResult<Option<Arc<Vec<u8>>>> {
        if let Some(hit) = self.cache.lock().get(&idx) {
            return Ok(Some(hit.clone()));
        }
        let chunk_ref = match self.stream.chunks.get(idx).copied().flatten() {
            Some(c) => c,
            None => return Ok(None),
        };

        let logical = idx as u64 * self.stream.chunk_size;
        let stored = self
            .data
            .read_bytes(chunk_ref.offset, chunk_ref.stored_size as usize, false)?;
        let bytes = match self.stream.compression {
            Compression::None => stored,
            Compression::Xz => {
                let mut out = Vec::with_capacity(self.stream.chunk_size as usize);
                XzDecoder::new(stored.as_slice())
                    .read_to_end(&mut out)
                    .map_err(|e| {
                        MemoryError::backing_store(&self.name, logical, format!("chunk {}: {}", idx, e))
                    })?;
                out
            }
        };

        let expected = self.chunk_len(idx);
        if (bytes.len() as u64) < expected {
            return Err(MemoryError::backing_store(
                &self.name,
                logical,
                format!("chunk {} holds {} bytes, expected {}", idx, bytes.len(), expected),
            ));
        }

        let bytes = Arc::new(bytes);
        self.cache.lock().put(idx, bytes.clone());
        Ok(Some(bytes))
    }

    /// Check the stream against its recorded digest. Returns `false` when
    /// no digest is recorded.
    pub fn verify(&self) -> MemoryResult<bool> {
        let expected = match &self.stream.sha256 {
            Some(d) => d.to_ascii_lowercase(),
            None => return Ok(false),
        };

        let mut hasher = Sha256::new();
        for idx in 0..self.stream.chunks.len() {
            if let Some(chunk) = self.chunk(idx)? {
                let len = self.chunk_len(idx) as usize;
                hasher.update(&chunk[..len.min(chunk.len())]);
            }
        }
        let actual = hex::encode(hasher.finalize());
        if actual != expected {
            return Err(MemoryError::container(format!(
                "stream '{}' digest mismatch: manifest {}, content {}",
                self.stream.name, expected, actual
            )));
        }
        debug!("stream '{}' digest verified", self.stream.name);
        Ok(true)
    }
}

impl BackingStore for ContainerStore {
    fn read_raw(&self, offset: u64, length: usize) -> MemoryResult<Vec<u8>> {
        let end = offset.saturating_add(length as u64);
        if !self.runs.iter().any(|r| r.start <= offset && end <= r.end) {
            return Err(MemoryError::backing_store(
                &self.name,
                offset,
                "range not inside a populated run",
            ));
        }

        let mut out = Vec::with_capacity(length);
        let mut pos = offset;
        while pos < end {
            let idx = (pos / self.stream.chunk_size) as usize;
            let within = (pos % self.stream.chunk_size) as usize;
            let take = ((self.stream.chunk_size - within as u64).min(end - pos)) as usize;
            let chunk = self.chunk(idx)?.ok_or_else(|| {
                MemoryError::backing_store(&self.name, pos, format!("chunk {} is absent", idx))
            })?;
            out.extend_from_slice(&chunk[within..within + take]);
            pos += take as u64;
        }
        Ok(out)
    }

    fn size(&self) -> u64 {
        self.stream.size
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn runs(&self) -> Vec<Range<u64>> {
        self.runs.clone()
    }
}

/// Populated ranges: present chunks, intersected with the sparse map when
/// one is given. Sorted and coalesced.
fn compute_runs(info: &StreamInfo) -> Vec<Range<u64>> {
    let mut present: Vec<Range<u64>> = Vec::new();
    for (idx, chunk) in info.chunks.iter().enumerate() {
        let start = idx as u64 * info.chunk_size;
        if chunk.is_none() || start >= info.size {
            continue;
        }
        let end = (start + info.chunk_size).min(info.size);
        match present.last_mut() {
            Some(last) if last.end == start => last.end = end,
            _ => present.push(start..end),
        }
    }

    let map = match &info.map {
        Some(map) => map,
        None => return present,
    };

    let mut wanted: Vec<Range<u64>> = map
        .iter()
        .filter(|m| m.length > 0)
        .map(|m| m.start..m.start.saturating_add(m.length))
        .collect();
    wanted.sort_by_key(|r| r.start);

    let mut runs: Vec<Range<u64>> = Vec::new();
    for w in &wanted {
        for p in &present {
            let start = w.start.max(p.start);
            let end = w.end.min(p.end);
            if start >= end {
                continue;
            }
            match runs.last_mut() {
                Some(last) if last.end >= start => last.end = last.end.max(end),
                _ => runs.push(start..end),
            }
        }
    }
    runs
}
