//! Plugin lookup and execution.

use crate::plugins::dump::Dump;
use crate::plugins::listwalk::ListWalk;
use crate::plugins::mappings::Mappings;
use crate::plugins::record::Record;
use crate::plugins::search::Search;
use crate::plugins::structscan::StructScan;
use crate::plugins::vtop::Vtop;
use crate::plugins::{Plugin, PluginContext, PluginError, PluginInfo, RecordStream};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Named plugins of one session.
#[derive(Default, Clone)]
pub struct PluginRegistry {
    plugins: BTreeMap<&'static str, Arc<dyn Plugin>>,
}

impl PluginRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry holding the generic built-in plugins.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(Search));
        registry.register(Arc::new(StructScan));
        registry.register(Arc::new(ListWalk));
        registry.register(Arc::new(Dump));
        registry.register(Arc::new(Vtop));
        registry.register(Arc::new(Mappings));
        registry
    }

    /// Add a plugin, replacing (and returning) any plugin of the same name.
    pub fn register(&mut self, plugin: Arc<dyn Plugin>) -> Option<Arc<dyn Plugin>> {
        let name = plugin.name();
        let previous = self.plugins.insert(name, plugin);
        if previous.is_some() {
            debug!("Plugin '{}' replaced", name);
        }
        previous
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Plugin>> {
        self.plugins.get(name).cloned()
    }

    /// Registered plugins, sorted by name.
    pub fn list(&self) -> Vec<PluginInfo> {
        self.plugins.values().map(|p| p.info()).collect()
    }

    /// Run a plugin. Records it fails to produce come out as error records
    /// at their position in the stream.
    pub fn run<'a>(
        &self,
        name: &str,
        ctx: &'a PluginContext,
        params: &serde_json::Value,
    ) -> Result<Records<'a>, PluginError> {
        let plugin = self
            .get(name)
            .ok_or_else(|| PluginError::UnknownPlugin(name.to_string()))?;
        info!("Running plugin '{}'", plugin.name());
        let stream = plugin.run(ctx, params)?;
        Ok(Records {
            plugin: plugin.name(),
            stream,
            produced: 0,
            failed: 0,
        })
    }
}

/// Record stream of one plugin run, with failures turned into records.
pub struct Records<'a> {
    plugin: &'static str,
    stream: RecordStream<'a>,
    produced: usize,
    failed: usize,
}

impl Records<'_> {
    pub fn produced(&self) -> usize {
        self.produced
    }

    pub fn failed(&self) -> usize {
        self.failed
    }
}

impl Iterator for Records<'_> {
    type Item = Record;

    fn next(&mut self) -> Option<Record> {
        let item = match self.stream.next() {
            Some(item) => item,
            None => {
                debug!(
                    "Plugin '{}' finished: {} records, {} failed",
                    self.plugin, self.produced, self.failed
                );
                return None;
            }
        };
        self.produced += 1;
        Some(item.unwrap_or_else(|e| {
            self.failed += 1;
            warn!("Plugin '{}' record {} failed: {}", self.plugin, self.produced, e);
            Record::from_error(e)
        }))
    }
}
