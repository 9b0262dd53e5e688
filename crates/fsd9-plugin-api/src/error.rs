use thiserror::Error;

/// Plugin system error types
#[derive(Debug, Error)]
pub enum PluginError {
    #[error("Invalid plugin metadata: {0}")]
    InvalidMetadata(String),

    #[error("Plugin already registered: {0}")]
    DuplicatePlugin(String),

    #[error("Plugin {name} targets API level {level}, this server supports up to {supported}")]
    UnsupportedApiLevel {
        name: String,
        level: u32,
        supported: u32,
    },

    #[error("Plugin not found: {0}")]
    NotFound(String),

    #[error("Plugin execution error: {0}")]
    ExecutionError(String),

    #[error("Invalid plugin settings: {0}")]
    SettingsError(#[from] serde_yaml::Error),
}

pub type PluginResult<T> = Result<T, PluginError>;
