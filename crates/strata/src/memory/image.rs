//! Image opening with format detection.

use crate::memory::error::MemoryResult;
use crate::memory::layers::{ContainerStore, MmapFileStore, PhysicalSpace, SegmentedStore};
use crate::memory::traits::{AddressSpace, BackingStore, FillPolicy};
use serde::Serialize;
use std::fs::File;
use std::io::Read;
use std::path::Path;
use std::sync::Arc;
use tracing::info;

/// Bytes read from the start of a file to detect its format.
const PROBE_SIZE: usize = 4096;

/// Largest file still considered as a possible container manifest.
const MAX_MANIFEST_SIZE: u64 = 64 << 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ImageFormat {
    Container,
    Lime,
    ElfCore,
    Raw,
}

/// An opened image: its backing store and the format it was read as.
pub struct MemoryImage {
    format: ImageFormat,
    store: Arc<dyn BackingStore>,
}

impl MemoryImage {
    pub fn format(&self) -> ImageFormat {
        self.format
    }

    pub fn store(&self) -> &Arc<dyn BackingStore> {
        &self.store
    }

    /// Size of the logical image in bytes.
    pub fn size(&self) -> u64 {
        self.store.size()
    }

    /// The physical address space over this image.
    pub fn physical_space(&self, fill_policy: FillPolicy) -> Arc<dyn AddressSpace> {
        Arc::new(PhysicalSpace::new(self.store.clone(), fill_policy))
    }
}

/// Identify the format of the file at `path`.
pub fn detect_format(path: impl AsRef<Path>) -> MemoryResult<ImageFormat> {
    let path = path.as_ref();
    let mut file = File::open(path)?;
    let size = file.metadata()?.len();

    let mut probe = Vec::with_capacity(PROBE_SIZE);
    file.by_ref().take(PROBE_SIZE as u64).read_to_end(&mut probe)?;

    if SegmentedStore::is_lime(&probe) {
        return Ok(ImageFormat::Lime);
    }
    if SegmentedStore::is_elf_core(&probe) {
        return Ok(ImageFormat::ElfCore);
    }
    let looks_like_json = probe
        .iter()
        .find(|b| !b.is_ascii_whitespace())
        .is_some_and(|b| *b == b'{');
    if looks_like_json && size <= MAX_MANIFEST_SIZE {
        let text = std::fs::read(path)?;
        if ContainerStore::is_manifest(&text) {
            return Ok(ImageFormat::Container);
        }
    }
    Ok(ImageFormat::Raw)
}

/// Open an image, detecting its format. `stream` selects a stream inside a
/// multi-stream container and is ignored for other formats.
pub fn open_image(path: impl AsRef<Path>, stream: Option<&str>) -> MemoryResult<MemoryImage> {
    let path = path.as_ref();
    let format = detect_format(path)?;
    let store: Arc<dyn BackingStore> = match format {
        ImageFormat::Container => Arc::new(ContainerStore::open(path, stream)?),
        ImageFormat::Lime => Arc::new(SegmentedStore::open_lime(path)?),
        ImageFormat::ElfCore => Arc::new(SegmentedStore::open_elf_core(path)?),
        ImageFormat::Raw => Arc::new(MmapFileStore::open_path(path)?),
    };
    info!(
        "Opened {} as {:?} ({} bytes, {} runs)",
        path.display(),
        format,
        store.size(),
        store.runs().len()
    );
    Ok(MemoryImage { format, store })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::layers::container::tests::write_container;
    use crate::memory::layers::container::Compression;
    use crate::memory::layers::segmented::tests::{elf_core_image, lime_image};

    #[test]
    fn test_detects_each_format() {
        let dir = tempfile::tempdir().unwrap();

        let raw = dir.path().join("raw.bin");
        std::fs::write(&raw, vec![0x41u8; 8192]).unwrap();
        let image = open_image(&raw, None).unwrap();
        assert_eq!(image.format(), ImageFormat::Raw);
        assert_eq!(image.size(), 8192);

        let lime = dir.path().join("mem.lime");
        std::fs::write(&lime, lime_image(&[(0x1000, b"lime data")])).unwrap();
        let image = open_image(&lime, None).unwrap();
        assert_eq!(image.format(), ImageFormat::Lime);
        let phys = image.physical_space(FillPolicy::Zero);
        assert_eq!(&phys.read(0x1000, 9).unwrap(), b"lime data");

        let core = dir.path().join("vmcore");
        std::fs::write(&core, elf_core_image(&[(0x2000, b"core data")])).unwrap();
        let image = open_image(&core, None).unwrap();
        assert_eq!(image.format(), ImageFormat::ElfCore);
        let phys = image.physical_space(FillPolicy::Zero);
        assert_eq!(&phys.read(0x2000, 9).unwrap(), b"core data");

        let content: Vec<u8> = (0..=255u8).cycle().take(4096).collect();
        let manifest = write_container(dir.path(), &content, 1024, Compression::Xz, &[], None);
        let image = open_image(&manifest, None).unwrap();
        assert_eq!(image.format(), ImageFormat::Container);
        let phys = image.physical_space(FillPolicy::Fault);
        assert_eq!(phys.read(1000, 100).unwrap(), &content[1000..1100]);
    }

    #[test]
    fn test_json_that_is_not_a_manifest_is_raw() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("notes.json");
        std::fs::write(&path, br#"{"format": "something-else"}"#).unwrap();
        assert_eq!(detect_format(&path).unwrap(), ImageFormat::Raw);
    }

    #[test]
    fn test_missing_file_is_an_error() {
        assert!(open_image("/nonexistent/strata/image.raw", None).is_err());
    }
}
