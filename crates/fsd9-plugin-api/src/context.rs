use async_trait::async_trait;
use chrono::{DateTime, Utc};
use fsd9_core::types::{FlightPlan, PositionReport};
use fsd9_core::{ClientKind, MetarRecord};
use serde::Serialize;

/// A logged-in client as plugins see it.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ClientInfo {
    pub callsign: String,
    pub cid: String,
    pub realname: String,
    pub kind: ClientKind,
    pub rating: u8,
    pub logon_time: DateTime<Utc>,
    pub position: Option<PositionReport>,
    pub flight_plan: Option<FlightPlan>,
}

/// Server services available to plugins.
///
/// Implemented by the server. Lines are written without terminator; the
/// server appends `\r\n`.
#[async_trait]
pub trait PluginContext: Send + Sync {
    /// Sends a line to one logged-in client. Returns false if the callsign is
    /// not online.
    fn send_to(&self, callsign: &str, line: &str) -> bool;

    /// Sends a line to every logged-in client except `exclude`. Returns the
    /// number of recipients.
    fn broadcast(&self, line: &str, exclude: Option<&str>) -> usize;

    /// Callsigns of every logged-in client.
    fn online_callsigns(&self) -> Vec<String>;

    /// Snapshot of every logged-in client.
    fn online_clients(&self) -> Vec<ClientInfo>;

    /// Disconnects a client. Returns false if the callsign is not online.
    fn kick(&self, callsign: &str) -> bool;

    /// Looks up a weather report through the server's weather service.
    async fn metar(&self, icao: &str) -> Option<MetarRecord>;

    /// The `plugins.settings.{name}` block from the configuration.
    fn plugin_settings(&self, plugin: &str) -> Option<serde_yaml::Value>;
}
