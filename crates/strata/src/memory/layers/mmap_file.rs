//! Memory-mapped file store.
//!
//! Flat raw images map file offset N to physical address N. The map is
//! read-only; images are evidence and are never written.

use crate::memory::error::{MemoryError, MemoryResult};
use crate::memory::traits::BackingStore;
use memmap2::{Mmap, MmapOptions};
use std::fs::File;
use std::path::{Path, PathBuf};

/// A read-only memory-mapped file.
///
/// # Example
///
/// ```rust,ignore
/// use strata::memory::layers::MmapFileStore;
///
/// let store = MmapFileStore::open("/path/to/dump.raw")?;
/// let data = store.read_bytes(0, 4096, false)?;
/// ```
pub struct MmapFileStore {
    name: String,
    path: PathBuf,
    /// None for empty files, which cannot be mapped.
    mmap: Option<Mmap>,
    size: u64,
}

impl MmapFileStore {
    /// Path named by a plain path or a file:// URL.
    fn parse_location(location: &str) -> PathBuf {
        let path_str = match location.strip_prefix("file://") {
            // file:///C:/path -> C:/path
            Some(url_path)
                if url_path.starts_with('/')
                    && url_path.len() > 2
                    && url_path.chars().nth(2) == Some(':') =>
            {
                &url_path[1..]
            }
            Some(url_path) => url_path,
            None => location,
        };
        PathBuf::from(urlencoding_decode(path_str))
    }

    /// Map a file given as a plain path or a file:// URL.
    pub fn open(location: impl AsRef<str>) -> MemoryResult<Self> {
        Self::open_path(Self::parse_location(location.as_ref()))
    }

    pub fn open_path(path: impl AsRef<Path>) -> MemoryResult<Self> {
        let path = path.as_ref().to_path_buf();
        let file = File::open(&path)?;
        let size = file.metadata()?.len();

        let mmap = if size == 0 {
            None
        } else {
            // SAFETY: the map is read-only and the store never hands out
            // references that outlive it.
            Some(unsafe { MmapOptions::new().map(&file)? })
        };

        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.display().to_string());

        Ok(MmapFileStore {
            name,
            path,
            mmap,
            size,
        })
    }

    /// The whole file.
    pub fn as_slice(&self) -> &[u8] {
        self.mmap.as_deref().unwrap_or(&[])
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read bytes from the file.
    ///
    /// With `pad`, out-of-range bytes are zero-filled; otherwise a read that
    /// cannot be fully satisfied is an error.
    pub fn read_bytes(&self, offset: u64, length: usize, pad: bool) -> MemoryResult<Vec<u8>> {
        let data = self.as_slice();

        if offset > self.size || (offset == self.size && length > 0) {
            if pad {
                return Ok(vec![0u8; length]);
            }
            return Err(MemoryError::backing_store(
                &self.name,
                offset,
                "offset outside of the file",
            ));
        }

        let start = offset as usize;
        let available = (self.size - offset) as usize;

        if length <= available {
            Ok(data[start..start + length].to_vec())
        } else if pad {
            let mut result = Vec::with_capacity(length);
            result.extend_from_slice(&data[start..]);
            result.resize(length, 0);
            Ok(result)
        } else {
            Err(MemoryError::backing_store(
                &self.name,
                offset + available as u64,
                "could not read sufficient bytes from the file",
            ))
        }
    }
}

impl BackingStore for MmapFileStore {
    fn read_raw(&self, offset: u64, length: usize) -> MemoryResult<Vec<u8>> {
        self.read_bytes(offset, length, false)
    }

    fn size(&self) -> u64 {
        self.size
    }

    fn name(&self) -> &str {
        &self.name
    }
}

/// Simple URL decoding for file paths.
fn urlencoding_decode(input: &str) -> String {
    let raw = input.as_bytes();
    let mut bytes = Vec::with_capacity(raw.len());
    let mut i = 0;
    while i < raw.len() {
        let escaped = if raw[i] == b'%' {
            raw.get(i + 1..i + 3)
                .and_then(|h| std::str::from_utf8(h).ok())
                .and_then(|h| u8::from_str_radix(h, 16).ok())
        } else {
            None
        };
        match (raw[i], escaped) {
            (_, Some(byte)) => {
                bytes.push(byte);
                i += 3;
            }
            (b'+', None) => {
                bytes.push(b' ');
                i += 1;
            }
            (other, None) => {
                bytes.push(other);
                i += 1;
            }
        }
    }
    String::from_utf8_lossy(&bytes).into_owned()
}
