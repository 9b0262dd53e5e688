// fsd9 Plugin API
// Ordered, in-process plugins that observe and veto server events

pub mod context;
pub mod error;
pub mod event;
pub mod metadata;
pub mod registry;

pub use context::{ClientInfo, PluginContext};
pub use error::{PluginError, PluginResult};
pub use event::{Event, EventKind, EventOutcome, LineOutcome, Plugin};
pub use metadata::PluginDescriptor;
pub use registry::PluginRegistry;

/// Plugin API level implemented by this server
pub const PLUGIN_API_LEVEL: u32 = 1;
