use crate::plugin::Plugin;
use std::collections::HashMap;
use std::sync::Arc;

/// Thread-safe plugin registry.
///
/// Built once at startup, immutable thereafter. Worker threads receive a
/// shared `Arc<PluginRegistry>` and configure worker-local instances
/// from the factories it holds.
pub struct PluginRegistry {
    plugins: HashMap<String, Arc<dyn Plugin>>,
}

impl PluginRegistry {
    pub fn new() -> Self {
        Self {
            plugins: HashMap::new(),
        }
    }

    /// Register a plugin factory.
    pub fn register(&mut self, plugin: Arc<dyn Plugin>) {
        let name = plugin.name().to_string();
        tracing::info!(plugin = %name, "Registered plugin");
        self.plugins.insert(name, plugin);
    }

    /// Get a plugin factory by name.
    pub fn get(&self, name: &str) -> Option<&Arc<dyn Plugin>> {
        self.plugins.get(name)
    }

    /// List all registered plugin names.
    pub fn list(&self) -> Vec<&str> {
        self.plugins.keys().map(|s| s.as_str()).collect()
    }

    pub fn len(&self) -> usize {
        self.plugins.len()
    }

    pub fn is_empty(&self) -> bool {
        self.plugins.is_empty()
    }
}

impl Default for PluginRegistry {
    fn default() -> Self {
        Self::new()
    }
}
