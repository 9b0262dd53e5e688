//! Shared server state
//!
//! One `ServerContext` is built at boot and shared by every session. It is
//! also what plugins see through the `PluginContext` trait.

use async_trait::async_trait;
use fsd9_core::config::{AppConfig, ServerSettings};
use fsd9_core::packet::ascii_only;
use fsd9_core::MetarRecord;
use fsd9_db::DatabaseGateway;
use fsd9_metar::MetarService;
use fsd9_plugin_api::{ClientInfo, PluginContext, PluginRegistry};
use std::collections::HashMap;
use std::sync::Arc;

use crate::directory::ClientDirectory;
use crate::metrics::ServerMetrics;

pub struct ServerContext {
    pub settings: ServerSettings,
    pub directory: Arc<ClientDirectory>,
    pub metar: Arc<MetarService>,
    pub database: Arc<dyn DatabaseGateway>,
    pub registry: Arc<PluginRegistry>,
    pub metrics: Arc<ServerMetrics>,
    plugin_settings: HashMap<String, serde_yaml::Value>,
    motd: Vec<String>,
}

impl ServerContext {
    pub fn new(
        config: &AppConfig,
        database: Arc<dyn DatabaseGateway>,
        metar: Arc<MetarService>,
        registry: Arc<PluginRegistry>,
    ) -> Self {
        let settings = config.server.clone();
        let motd = motd_lines(&settings);

        Self {
            settings,
            directory: Arc::new(ClientDirectory::new()),
            metar,
            database,
            registry,
            metrics: Arc::new(ServerMetrics::new()),
            plugin_settings: config.plugins.settings.clone(),
            motd,
        }
    }

    /// MOTD lines, already encoded for the wire.
    pub fn motd(&self) -> &[String] {
        &self.motd
    }
}

fn motd_lines(settings: &ServerSettings) -> Vec<String> {
    settings
        .motd
        .lines()
        .map(|line| {
            if settings.motd_is_ascii() {
                ascii_only(line)
            } else {
                line.to_string()
            }
        })
        .collect()
}

#[async_trait]
impl PluginContext for ServerContext {
    fn send_to(&self, callsign: &str, line: &str) -> bool {
        self.directory.send_to(callsign, line)
    }

    fn broadcast(&self, line: &str, exclude: Option<&str>) -> usize {
        self.directory.broadcast(line, exclude)
    }

    fn online_callsigns(&self) -> Vec<String> {
        self.directory.callsigns()
    }

    fn online_clients(&self) -> Vec<ClientInfo> {
        self.directory.infos()
    }

    fn kick(&self, callsign: &str) -> bool {
        self.directory.kick(callsign)
    }

    async fn metar(&self, icao: &str) -> Option<MetarRecord> {
        self.metar.request(icao).await
    }

    fn plugin_settings(&self, plugin: &str) -> Option<serde_yaml::Value> {
        self.plugin_settings.get(plugin).cloned()
    }
}
