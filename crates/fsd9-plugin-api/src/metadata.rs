use serde::{Deserialize, Serialize};

use crate::event::EventKind;
use crate::PLUGIN_API_LEVEL;

/// Plugin descriptor, fixed at registration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PluginDescriptor {
    pub name: String,
    pub version: String,
    /// Plugin API level the plugin was written against
    pub api_level: u32,
    /// Events the plugin wants to see
    pub capabilities: Vec<EventKind>,
}

impl PluginDescriptor {
    /// Creates a descriptor at the current API level.
    pub fn new(name: impl Into<String>, version: impl Into<String>, capabilities: Vec<EventKind>) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
            api_level: PLUGIN_API_LEVEL,
            capabilities,
        }
    }

    pub fn with_api_level(mut self, api_level: u32) -> Self {
        self.api_level = api_level;
        self
    }

    /// Returns true if the plugin declared `kind`.
    pub fn handles(&self, kind: EventKind) -> bool {
        self.capabilities.contains(&kind)
    }
}

impl std::fmt::Display for PluginDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {}", self.name, self.version)
    }
}
