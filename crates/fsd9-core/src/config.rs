//! Configuration management for the fsd9 daemon.
//!
//! This module provides the configuration system used by the binary and the
//! admin tool:
//! - Loading from YAML files
//! - Environment variable overrides (`FSD9__SECTION__KEY`)
//! - Validation of all settings
//! - Listener, weather policy, credential store, plugin and logging settings

use crate::error::{ConfigError, Result};
use crate::types::{FetchMode, FetchPolicy};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::Level;

/// Main application configuration.
///
/// Root of the YAML document. Every section and every field has a default,
/// so an empty file yields a runnable daemon.
///
/// # Examples
///
/// ```no_run
/// use fsd9_core::config::AppConfig;
///
/// let config = AppConfig::from_file("config/config.yaml").unwrap();
/// config.validate().unwrap();
/// ```
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// Listener and session settings
    #[serde(default)]
    pub server: ServerSettings,

    /// Weather acquisition policy
    #[serde(default)]
    pub metar: MetarConfig,

    /// Credential store
    #[serde(default)]
    pub database: DatabaseConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Plugin enablement and per-plugin settings
    #[serde(default)]
    pub plugins: PluginsConfig,

    /// Metrics configuration
    #[serde(default)]
    pub metrics: MetricsConfig,
}

impl AppConfig {
    /// Creates a new default configuration.
    pub fn new() -> Self {
        Self::default()
    }

    /// Loads configuration from a YAML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(ConfigError::file_not_found(path.display().to_string()).into());
        }

        let contents = std::fs::read_to_string(path).map_err(|e| ConfigError::LoadFailed {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;

        Self::from_yaml(&contents)
    }

    /// Loads configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        if yaml.trim().is_empty() {
            return Ok(Self::default());
        }

        serde_yaml::from_str(yaml).map_err(|e| {
            ConfigError::InvalidFormat {
                reason: e.to_string(),
            }
            .into()
        })
    }

    /// Loads configuration using the `config` crate, layering `FSD9__*`
    /// environment variables over the file.
    ///
    /// # Errors
    ///
    /// Returns an error if configuration cannot be loaded or merged.
    pub fn from_config_builder<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        let config = config::Config::builder()
            .add_source(config::File::from(path).required(true))
            // FSD9__SERVER__PORT=6810 overrides server.port
            .add_source(
                config::Environment::with_prefix("FSD9")
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .map_err(|e| ConfigError::LoadFailed {
                path: path.display().to_string(),
                reason: e.to_string(),
            })?;

        config.try_deserialize().map_err(|e| {
            ConfigError::InvalidFormat {
                reason: e.to_string(),
            }
            .into()
        })
    }

    /// Validates the configuration.
    ///
    /// # Errors
    ///
    /// Returns the first invalid field found.
    pub fn validate(&self) -> Result<()> {
        self.server.validate()?;
        self.metar.validate()?;
        self.database.validate()?;
        self.logging.parse_level()?;
        Ok(())
    }
}

/// Listener and per-session settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerSettings {
    /// Bind address
    #[serde(default = "default_host")]
    pub host: String,

    /// Bind port
    #[serde(default = "default_port")]
    pub port: u16,

    /// Message of the day, one wire line per text line
    #[serde(default = "default_motd")]
    pub motd: String,

    /// "ascii" or "utf-8"
    #[serde(default = "default_motd_encoding")]
    pub motd_encoding: String,

    /// Peer addresses that are dropped on accept
    #[serde(default)]
    pub denylist: Vec<String>,

    /// Maximum number of concurrent sessions
    #[serde(default = "default_max_clients")]
    pub max_clients: usize,

    /// Maximum inbound line length in bytes
    #[serde(default = "default_max_line_length")]
    pub max_line_length: usize,

    /// Seconds without position or login before a session is dropped
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout_secs: u64,

    /// Consecutive bad credentials allowed before the connection is closed
    #[serde(default = "default_auth_attempts")]
    pub auth_attempts: u32,

    /// Interval between wind delta broadcasts
    #[serde(default = "default_heartbeat_interval")]
    pub heartbeat_interval_secs: u64,

    /// Close the session on unknown commands and short packets
    #[serde(default = "default_true")]
    pub strict_syntax: bool,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    6809
}

fn default_motd() -> String {
    "Welcome to fsd9.\nPlease be nice to each other.".to_string()
}

fn default_motd_encoding() -> String {
    "ascii".to_string()
}

fn default_max_clients() -> usize {
    1000
}

fn default_max_line_length() -> usize {
    1024
}

fn default_idle_timeout() -> u64 {
    800
}

fn default_auth_attempts() -> u32 {
    3
}

fn default_heartbeat_interval() -> u64 {
    70
}

fn default_true() -> bool {
    true
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            motd: default_motd(),
            motd_encoding: default_motd_encoding(),
            denylist: Vec::new(),
            max_clients: default_max_clients(),
            max_line_length: default_max_line_length(),
            idle_timeout_secs: default_idle_timeout(),
            auth_attempts: default_auth_attempts(),
            heartbeat_interval_secs: default_heartbeat_interval(),
            strict_syntax: true,
        }
    }
}

impl ServerSettings {
    /// Validates the listener configuration.
    pub fn validate(&self) -> Result<()> {
        if self.port == 0 {
            return Err(ConfigError::invalid_value("server.port", "Port cannot be 0").into());
        }

        self.parsed_denylist()?;

        if self.auth_attempts == 0 {
            return Err(ConfigError::invalid_value(
                "server.auth_attempts",
                "At least one attempt must be allowed",
            )
            .into());
        }

        if self.max_line_length == 0 {
            return Err(ConfigError::invalid_value(
                "server.max_line_length",
                "Line length limit cannot be 0",
            )
            .into());
        }

        match self.motd_encoding.to_ascii_lowercase().as_str() {
            "ascii" | "utf-8" | "utf8" => {}
            other => {
                return Err(ConfigError::invalid_value(
                    "server.motd_encoding",
                    format!("Unsupported encoding: {}", other),
                )
                .into())
            }
        }

        Ok(())
    }

    /// Parses the denylist into addresses.
    pub fn parsed_denylist(&self) -> Result<Vec<IpAddr>> {
        self.denylist
            .iter()
            .map(|entry| {
                entry.trim().parse::<IpAddr>().map_err(|_| {
                    ConfigError::invalid_value(
                        "server.denylist",
                        format!("Not an IP address: {}", entry),
                    )
                    .into()
                })
            })
            .collect()
    }

    /// Returns the listener bind address.
    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// True when the MOTD must be restricted to ASCII.
    pub fn motd_is_ascii(&self) -> bool {
        self.motd_encoding.eq_ignore_ascii_case("ascii")
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }
}

/// Weather acquisition settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetarConfig {
    /// "cron" or "once"
    #[serde(default = "default_metar_mode")]
    pub mode: FetchMode,

    /// Seconds between sweeps in cron mode
    #[serde(default = "default_cron_interval")]
    pub cron_interval_secs: u64,

    /// Fetcher ids in priority order
    #[serde(default = "default_fetchers")]
    pub fetchers: Vec<String>,

    /// Run the opposite mode when the active one fails
    #[serde(default = "default_true")]
    pub fallback: bool,

    /// Exclude the fetcher that failed a code in the sweep from its fallback
    #[serde(default = "default_true")]
    pub skip_previous_fetcher: bool,

    /// Per-fetch deadline
    #[serde(default = "default_fetch_timeout")]
    pub fetch_timeout_secs: u64,

    /// Maximum age of a once-mode record before it is fetched again
    #[serde(default)]
    pub once_max_age_secs: Option<u64>,
}

fn default_metar_mode() -> FetchMode {
    FetchMode::Cron
}

fn default_cron_interval() -> u64 {
    3600
}

fn default_fetchers() -> Vec<String> {
    vec!["NOAA".to_string()]
}

fn default_fetch_timeout() -> u64 {
    15
}

impl Default for MetarConfig {
    fn default() -> Self {
        Self {
            mode: default_metar_mode(),
            cron_interval_secs: default_cron_interval(),
            fetchers: default_fetchers(),
            fallback: true,
            skip_previous_fetcher: true,
            fetch_timeout_secs: default_fetch_timeout(),
            once_max_age_secs: None,
        }
    }
}

impl MetarConfig {
    /// Validates the weather settings.
    pub fn validate(&self) -> Result<()> {
        if self.mode == FetchMode::Cron && self.cron_interval_secs == 0 {
            return Err(ConfigError::invalid_value(
                "metar.cron_interval_secs",
                "Cron interval cannot be 0",
            )
            .into());
        }

        if self.fetch_timeout_secs == 0 {
            return Err(ConfigError::invalid_value(
                "metar.fetch_timeout_secs",
                "Fetch timeout cannot be 0",
            )
            .into());
        }

        Ok(())
    }

    /// Builds the runtime fetch policy.
    pub fn policy(&self) -> FetchPolicy {
        FetchPolicy {
            mode: self.mode,
            fetcher_order: self.fetchers.clone(),
            fallback_enabled: self.fallback,
            skip_previous_fetcher_on_fallback: self.skip_previous_fetcher,
            cron_interval: Duration::from_secs(self.cron_interval_secs),
            fetch_timeout: Duration::from_secs(self.fetch_timeout_secs),
            once_max_age: self.once_max_age_secs.map(Duration::from_secs),
        }
    }
}

/// Credential store settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// Backend type
    #[serde(default)]
    pub backend: DatabaseBackend,

    /// Database file for the sqlite backend
    #[serde(default = "default_database_path")]
    pub path: PathBuf,

    /// Accounts created at startup when missing
    #[serde(default)]
    pub seed_users: Vec<SeedUser>,
}

fn default_database_path() -> PathBuf {
    PathBuf::from("fsd9.db")
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            backend: DatabaseBackend::default(),
            path: default_database_path(),
            seed_users: Vec::new(),
        }
    }
}

impl DatabaseConfig {
    pub fn validate(&self) -> Result<()> {
        for user in &self.seed_users {
            if user.callsign.is_empty() {
                return Err(ConfigError::invalid_value(
                    "database.seed_users",
                    "Seed user without callsign",
                )
                .into());
            }
        }
        Ok(())
    }
}

/// Credential store backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DatabaseBackend {
    /// In-memory store (volatile)
    Memory,
    /// SQLite database file
    #[default]
    Sqlite,
}

/// An account created at startup.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SeedUser {
    pub callsign: String,
    pub password: String,
    #[serde(default = "default_seed_rating")]
    pub rating: u8,
}

fn default_seed_rating() -> u8 {
    1
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log format: "text" or "json"
    #[serde(default = "default_log_format")]
    pub format: LogFormat,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> LogFormat {
    LogFormat::Text
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

impl LoggingConfig {
    /// Parses the log level string to a tracing Level.
    pub fn parse_level(&self) -> Result<Level> {
        self.level.parse().map_err(|_| {
            ConfigError::invalid_value("logging.level", format!("Invalid log level: {}", self.level))
                .into()
        })
    }
}

/// Log format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Human-readable text format
    Text,
    /// JSON format for structured logging
    Json,
}

/// Plugin configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PluginsConfig {
    /// Built-in plugins to register, in priority order
    #[serde(default)]
    pub enabled: Vec<String>,

    /// Free-form settings block per plugin name
    #[serde(default)]
    pub settings: HashMap<String, serde_yaml::Value>,
}

/// Metrics configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    /// Whether the Prometheus exporter is started
    #[serde(default)]
    pub enabled: bool,

    /// Exporter listen address
    #[serde(default = "default_metrics_listen")]
    pub listen: String,
}

fn default_metrics_listen() -> String {
    "127.0.0.1:9100".to_string()
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            listen: default_metrics_listen(),
        }
    }
}
