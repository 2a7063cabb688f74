//! Analysis sessions.
//!
//! A session binds one image to an optional profile and paging setup and
//! owns the plugin registry used against them. Everything is built up front;
//! afterwards the session is read-only and plugin runs can borrow it freely.

use crate::config::SessionConfig;
use crate::memory::translators::PagedSpace;
use crate::memory::{open_image, AddressSpace, ImageFormat, MemoryError};
use crate::plugins::{PluginContext, PluginError, PluginInfo, PluginRegistry, Records};
use chrono::{DateTime, Utc};
use isf::{load_profile, IsfError, Profile};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tracing::info;

#[derive(Error, Debug)]
pub enum SessionError {
    #[error(transparent)]
    Memory(#[from] MemoryError),

    #[error("Profile: {0}")]
    Profile(#[from] IsfError),
}

/// A base profile and the overlays folded onto it, in order.
#[derive(Debug, Clone, Default)]
pub struct ProfileSource {
    pub base: PathBuf,
    pub overlays: Vec<PathBuf>,
}

impl ProfileSource {
    pub fn new(base: impl Into<PathBuf>) -> Self {
        ProfileSource {
            base: base.into(),
            overlays: Vec::new(),
        }
    }

    pub fn with_overlay(mut self, overlay: impl Into<PathBuf>) -> Self {
        self.overlays.push(overlay.into());
        self
    }

    fn load(&self) -> Result<Profile, IsfError> {
        load_profile(&self.base, &self.overlays)
    }
}

/// Session summary.
#[derive(Debug, Clone, Serialize)]
pub struct SessionInfo {
    pub session_id: String,
    pub image_path: Option<String>,
    pub image_format: Option<ImageFormat>,
    pub image_size: u64,
    pub profile: Option<Vec<String>>,
    pub paging_root: Option<u64>,
    pub created_at: String,
}

pub struct Session {
    id: String,
    image_path: Option<PathBuf>,
    image_format: Option<ImageFormat>,
    created_at: DateTime<Utc>,
    context: PluginContext,
    registry: PluginRegistry,
}

impl Session {
    /// Open `image`, load the profile and build the paged space when the
    /// config names a root table. A root table that does not hold a usable
    /// table is an error.
    pub fn open(
        image: impl AsRef<Path>,
        profile: Option<&ProfileSource>,
        config: SessionConfig,
    ) -> Result<Self, SessionError> {
        let path = image.as_ref();
        let image = open_image(path, config.stream.as_deref())?;
        let physical = image.physical_space(config.fill_policy);
        let profile = profile.map(ProfileSource::load).transpose()?;

        let mut session = Self::from_parts(physical, profile, config)?;
        session.image_path = Some(path.to_path_buf());
        session.image_format = Some(image.format());
        Ok(session)
    }

    /// A session over an already-built physical space.
    pub fn from_parts(
        physical: Arc<dyn AddressSpace>,
        profile: Option<Profile>,
        config: SessionConfig,
    ) -> Result<Self, SessionError> {
        let profile = profile.map(|p| match config.kernel_base {
            Some(base) => Arc::new(p.relocated(base)),
            None => Arc::new(p),
        });

        let virtual_space = match config.physical_offset {
            Some(root) => Some(Arc::new(PagedSpace::new(
                "virtual",
                physical.clone(),
                config.paging_mode,
                root,
                config.paging_options(),
            )?)),
            None => None,
        };

        let id = uuid::Uuid::new_v4().to_string();
        info!(
            "Session {} ready: {} physical bytes, profile: {}, paging: {}",
            id,
            physical.maximum_address().saturating_add(1),
            profile.is_some(),
            virtual_space.is_some()
        );

        let mut context = PluginContext::new(physical, config);
        context.virtual_space = virtual_space;
        context.profile = profile;
        Ok(Session {
            id,
            image_path: None,
            image_format: None,
            created_at: Utc::now(),
            context,
            registry: PluginRegistry::with_builtins(),
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn context(&self) -> &PluginContext {
        &self.context
    }

    pub fn registry(&self) -> &PluginRegistry {
        &self.registry
    }

    pub fn registry_mut(&mut self) -> &mut PluginRegistry {
        &mut self.registry
    }

    pub fn plugins(&self) -> Vec<PluginInfo> {
        self.registry.list()
    }

    /// Run a plugin against this session's layers and profile.
    pub fn run(&self, plugin: &str, params: &serde_json::Value) -> Result<Records<'_>, PluginError> {
        self.registry.run(plugin, &self.context, params)
    }

    pub fn info(&self) -> SessionInfo {
        SessionInfo {
            session_id: self.id.clone(),
            image_path: self.image_path.as_ref().map(|p| p.display().to_string()),
            image_format: self.image_format,
            image_size: self.context.physical.maximum_address().saturating_add(1),
            profile: self.context.profile.as_ref().map(|p| p.lineage().to_vec()),
            paging_root: self.context.virtual_space.as_ref().map(|v| v.root()),
            created_at: self.created_at.to_rfc3339(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::translators::intel::PAGE_PRESENT;
    use crate::memory::translators::paging::tests::ImageBuilder;
    use crate::memory::translators::PagingMode;
    use crate::object::fixtures::PROFILE;
    use crate::plugins::Record;
    use serde_json::json;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn write_temp(bytes: &[u8], suffix: &str) -> NamedTempFile {
        let mut tmp = tempfile::Builder::new().suffix(suffix).tempfile().unwrap();
        tmp.write_all(bytes).unwrap();
        tmp.flush().unwrap();
        tmp
    }

    /// Raw 32-bit image: virtual 0x3000 -> physical 0x5000 holding "needle".
    fn raw_image() -> NamedTempFile {
        let mut image = ImageBuilder::new(0x8000, PagingMode::Intel32);
        image
            .entry(0x1000, 0, 0x2000 | PAGE_PRESENT)
            .entry(0x2000, 3, 0x5000 | PAGE_PRESENT)
            .fill(0x5040, b"needle");
        write_temp(&image.data, ".raw")
    }

    fn paged_config() -> SessionConfig {
        SessionConfig {
            physical_offset: Some(0x1000),
            paging_mode: PagingMode::Intel32,
            ..SessionConfig::default()
        }
    }

    #[test]
    fn test_open_with_paging_and_profile() {
        let image = raw_image();
        let profile = write_temp(PROFILE.as_bytes(), ".json");
        let source = ProfileSource::new(profile.path());
        let session = Session::open(image.path(), Some(&source), paged_config()).unwrap();

        let info = session.info();
        assert_eq!(info.image_format, Some(ImageFormat::Raw));
        assert_eq!(info.image_size, 0x8000);
        assert_eq!(info.paging_root, Some(0x1000));
        assert_eq!(info.profile, Some(vec!["fixture".to_string()]));
        assert_eq!(uuid::Uuid::parse_str(session.id()).unwrap().get_version_num(), 4);

        let hits: Vec<Record> = session.run("search", &json!({"pattern": "needle"})).unwrap().collect();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].to_json()["offset"], 0x3040);
        assert_eq!(hits[0].to_json()["physical"], 0x5040);
    }

    #[test]
    fn test_invalid_root_is_fatal() {
        let image = raw_image();
        let config = SessionConfig {
            physical_offset: Some(0x4000),
            ..paged_config()
        };
        assert!(matches!(
            Session::open(image.path(), None, config),
            Err(SessionError::Memory(MemoryError::AddressTranslation { .. }))
        ));
    }

    #[test]
    fn test_without_paging_or_profile() {
        let image = raw_image();
        let session = Session::open(image.path(), None, SessionConfig::default()).unwrap();
        assert!(session.context().virtual_space.is_none());
        assert!(matches!(
            session.run("vtop", &json!({"address": 0})),
            Err(PluginError::MissingVirtualSpace)
        ));
        assert!(matches!(
            session.run("listwalk", &json!({"start": "tasks_head", "type": "task", "link_field": "tasks"})),
            Err(PluginError::MissingProfile)
        ));
        let hits: Vec<Record> = session.run("search", &json!({"pattern": "needle"})).unwrap().collect();
        assert_eq!(hits[0].to_json()["offset"], 0x5040);
        assert_eq!(session.plugins().len(), 6);
    }

    #[test]
    fn test_kernel_base_relocates_symbols() {
        let (space, _) = crate::object::fixtures::fixture();
        let profile = isf::parse_isf_str(PROFILE).unwrap();
        let config = SessionConfig {
            kernel_base: Some(0x10),
            ..SessionConfig::default()
        };
        let session = Session::from_parts(space, Some(profile), config).unwrap();
        let profile = session.context().profile.as_ref().unwrap();
        assert_eq!(profile.symbol_address("init_task").unwrap(), 0x1010);
    }

    #[test]
    fn test_missing_inputs() {
        assert!(matches!(
            Session::open("/nonexistent/image.raw", None, SessionConfig::default()),
            Err(SessionError::Memory(_))
        ));
        let image = raw_image();
        let source = ProfileSource::new("/nonexistent/profile.json");
        assert!(matches!(
            Session::open(image.path(), Some(&source), SessionConfig::default()),
            Err(SessionError::Profile(IsfError::FileNotFound(_)))
        ));
    }
}
