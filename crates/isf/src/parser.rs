//! Loading ISF documents from disk or memory.
//!
//! Files ending in `.xz` are LZMA-decompressed first; everything else is
//! read as plain JSON.

use crate::error::{IsfError, IsfResult};
use crate::profile::Profile;
use crate::types::IsfFile;
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;
use tracing::info;
use xz2::read::XzDecoder;

fn decode(bytes: &[u8], origin: &str) -> IsfResult<IsfFile> {
    serde_json::from_slice(bytes).map_err(|e| IsfError::JsonParse(format!("{}: {}", origin, e)))
}

fn read_document(path: &Path) -> IsfResult<IsfFile> {
    if !path.exists() {
        return Err(IsfError::FileNotFound(path.display().to_string()));
    }
    let file = File::open(path)
        .map_err(|e| IsfError::Io(format!("opening {}: {}", path.display(), e)))?;

    let compressed = path
        .extension()
        .is_some_and(|ext| ext.eq_ignore_ascii_case("xz"));
    let mut buf = Vec::new();
    if compressed {
        XzDecoder::new(BufReader::new(file))
            .read_to_end(&mut buf)
            .map_err(|e| IsfError::Decompression(format!("{}: {}", path.display(), e)))?;
    } else {
        BufReader::new(file)
            .read_to_end(&mut buf)
            .map_err(|e| IsfError::Io(format!("reading {}: {}", path.display(), e)))?;
    }
    decode(&buf, &path.display().to_string())
}

/// Load and validate a complete profile.
pub fn parse_isf_file(path: impl AsRef<Path>) -> IsfResult<Profile> {
    let path = path.as_ref();
    let profile = Profile::from_document(read_document(path)?)?;
    info!(
        "Loaded profile {} ({} types, {} symbols)",
        path.display(),
        profile.types.len(),
        profile.symbols.len()
    );
    Ok(profile)
}

/// Load an overlay. Overlays are only validated once merged onto a base.
pub fn parse_overlay_file(path: impl AsRef<Path>) -> IsfResult<Profile> {
    Profile::from_document_unchecked(read_document(path.as_ref())?)
}

/// Profile from already-decompressed JSON bytes.
pub fn parse_isf_bytes(bytes: &[u8]) -> IsfResult<Profile> {
    Profile::from_document(decode(bytes, "<bytes>")?)
}

pub fn parse_isf_str(json: &str) -> IsfResult<Profile> {
    parse_isf_bytes(json.as_bytes())
}

pub fn parse_overlay_str(json: &str) -> IsfResult<Profile> {
    Profile::from_document_unchecked(decode(json.as_bytes(), "<overlay>")?)
}

/// Load a base profile and fold each overlay onto it, in order. A later
/// overlay wins over an earlier one for the same member.
pub fn load_profile<B: AsRef<Path>, O: AsRef<Path>>(base: B, overlays: &[O]) -> IsfResult<Profile> {
    let mut profile = parse_isf_file(base)?;
    for overlay in overlays {
        let patch = parse_overlay_file(overlay)?;
        profile = profile.merged_with(&patch)?;
        info!("Applied overlay {}", overlay.as_ref().display());
    }
    Ok(profile)
}
