//! Built-in plugins
//!
//! The binary enables plugins by name from `plugins.enabled`; the order of
//! that list is the dispatch order.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use fsd9_core::config::PluginsConfig;
use fsd9_core::packet::{break_packet, FsdCommand};
use fsd9_core::types::FlightPlan;
use fsd9_core::ClientKind;
use fsd9_plugin_api::{
    ClientInfo, Event, EventKind, EventOutcome, LineOutcome, Plugin, PluginContext, PluginDescriptor,
    PluginError, PluginRegistry, PluginResult,
};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

pub const AUDIT_LOG: &str = "audit-log";
pub const WORD_FILTER: &str = "word-filter";
pub const WHAZZUP: &str = "whazzup";

/// Logs client lifecycle and every inbound line with its outcome.
pub struct AuditLog {
    descriptor: PluginDescriptor,
}

impl AuditLog {
    pub fn new() -> Self {
        Self {
            descriptor: PluginDescriptor::new(
                AUDIT_LOG,
                env!("CARGO_PKG_VERSION"),
                vec![
                    EventKind::AfterStart,
                    EventKind::BeforeStop,
                    EventKind::ClientCreated,
                    EventKind::LineAudited,
                    EventKind::ClientDisconnected,
                ],
            ),
        }
    }
}

impl Default for AuditLog {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Plugin for AuditLog {
    fn descriptor(&self) -> &PluginDescriptor {
        &self.descriptor
    }

    async fn handle(&self, ctx: &dyn PluginContext, event: &mut Event<'_>) -> PluginResult<EventOutcome> {
        match event {
            Event::AfterStart => info!(plugin = AUDIT_LOG, "Server started"),
            Event::BeforeStop => info!(
                plugin = AUDIT_LOG,
                online = ctx.online_callsigns().len(),
                "Server stopping"
            ),
            Event::ClientCreated { session } => info!(
                plugin = AUDIT_LOG,
                callsign = %session.display_callsign(),
                cid = session.cid.as_deref().unwrap_or(""),
                rating = session.rating,
                "Client created"
            ),
            Event::LineAudited { session, line, outcome } => {
                let (by_plugin, ok) = match outcome {
                    LineOutcome::HandledByPlugin => (true, true),
                    LineOutcome::Handled { packet_ok, has_result } => (false, *packet_ok && *has_result),
                };
                debug!(
                    plugin = AUDIT_LOG,
                    connection_id = %session.connection_id,
                    callsign = %session.display_callsign(),
                    line = %line,
                    by_plugin,
                    ok,
                    "Line"
                );
            }
            Event::ClientDisconnected { session } => info!(
                plugin = AUDIT_LOG,
                connection_id = %session.connection_id,
                callsign = %session.display_callsign(),
                state = %session.state(),
                "Client gone"
            ),
            _ => {}
        }
        Ok(EventOutcome::Continue)
    }
}

#[derive(Debug, Default, Deserialize)]
struct WordFilterSettings {
    #[serde(default)]
    words: Vec<String>,
}

/// Drops text messages containing a configured word and tells the sender.
pub struct WordFilter {
    descriptor: PluginDescriptor,
    words: Vec<String>,
}

impl WordFilter {
    pub fn new<I, S>(words: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            descriptor: PluginDescriptor::new(WORD_FILTER, env!("CARGO_PKG_VERSION"), vec![EventKind::LineReceived]),
            words: words
                .into_iter()
                .map(|w| w.as_ref().trim().to_lowercase())
                .filter(|w| !w.is_empty())
                .collect(),
        }
    }

    /// Builds the filter from its `plugins.settings.word-filter` block.
    pub fn from_settings(settings: Option<&serde_yaml::Value>) -> PluginResult<Self> {
        let parsed: WordFilterSettings = match settings {
            Some(value) => serde_yaml::from_value(value.clone())?,
            None => WordFilterSettings::default(),
        };
        Ok(Self::new(parsed.words))
    }

    fn matching_word(&self, text: &str) -> Option<&str> {
        let text = text.to_lowercase();
        self.words.iter().find(|w| text.contains(w.as_str())).map(String::as_str)
    }
}

#[async_trait]
impl Plugin for WordFilter {
    fn descriptor(&self) -> &PluginDescriptor {
        &self.descriptor
    }

    async fn handle(&self, ctx: &dyn PluginContext, event: &mut Event<'_>) -> PluginResult<EventOutcome> {
        let Event::LineReceived { session, line } = event else {
            return Ok(EventOutcome::Continue);
        };
        let packet = break_packet(*line);
        if packet.command != Some(FsdCommand::Message) || !session.state().is_logged_in() {
            return Ok(EventOutcome::Continue);
        }

        let Some(word) = self.matching_word(&packet.rest_from(2)) else {
            return Ok(EventOutcome::Continue);
        };

        let callsign = session.display_callsign();
        info!(plugin = WORD_FILTER, callsign = %callsign, word = %word, "Message blocked");
        ctx.send_to(
            callsign,
            &format!("{}server:{}:Message not delivered", FsdCommand::Message, callsign),
        );
        Ok(EventOutcome::Prevent)
    }
}

// ============================================================================
// Whazzup
// ============================================================================

const WHAZZUP_VERSION: u32 = 3;

#[derive(Debug, Deserialize)]
#[serde(default)]
struct WhazzupSettings {
    path: PathBuf,
    refresh_secs: u64,
}

impl Default for WhazzupSettings {
    fn default() -> Self {
        Self {
            path: PathBuf::from("whazzup.json"),
            refresh_secs: 15,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct WhazzupGeneral {
    pub version: u32,
    pub reload: u32,
    /// `YYYYMMDDhhmmss`
    pub update: String,
    pub update_timestamp: DateTime<Utc>,
    pub connected_clients: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct WhazzupFlightPlan {
    pub flight_rules: String,
    pub aircraft: String,
    pub cruise_tas: String,
    pub departure: String,
    pub deptime: String,
    pub altitude: String,
    pub arrival: String,
    pub hrs_enroute_time: String,
    pub min_enroute_time: String,
    pub hrs_fuel_time: String,
    pub min_fuel_time: String,
    pub alternate: String,
    pub remarks: String,
    pub route: String,
}

impl WhazzupFlightPlan {
    fn from_plan(plan: &FlightPlan) -> Self {
        let field = |i: usize| plan.fields.get(i).cloned().unwrap_or_default();
        Self {
            flight_rules: field(0),
            aircraft: field(1),
            cruise_tas: field(2),
            departure: field(3),
            deptime: field(4),
            altitude: field(6),
            arrival: field(7),
            hrs_enroute_time: field(8),
            min_enroute_time: field(9),
            hrs_fuel_time: field(10),
            min_fuel_time: field(11),
            alternate: field(12),
            remarks: field(13),
            route: field(14),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct WhazzupPilot {
    pub cid: String,
    pub name: String,
    pub callsign: String,
    pub rating: u8,
    pub logon_time: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub latitude: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub longitude: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub altitude: Option<i32>,
    pub flight_plan: Option<WhazzupFlightPlan>,
}

#[derive(Debug, Clone, Serialize)]
pub struct WhazzupController {
    pub cid: String,
    pub name: String,
    pub callsign: String,
    pub rating: u8,
    pub logon_time: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub latitude: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub longitude: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub facility: Option<u8>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub visual_range: Option<u32>,
}

/// Version 3 whazzup status document.
#[derive(Debug, Clone, Serialize)]
pub struct WhazzupDocument {
    pub general: WhazzupGeneral,
    pub pilots: Vec<WhazzupPilot>,
    pub controllers: Vec<WhazzupController>,
}

impl WhazzupDocument {
    pub fn from_clients(clients: &[ClientInfo], now: DateTime<Utc>) -> Self {
        let mut pilots = Vec::new();
        let mut controllers = Vec::new();

        for client in clients {
            let position = client.position;
            match client.kind {
                ClientKind::Pilot => pilots.push(WhazzupPilot {
                    cid: client.cid.clone(),
                    name: client.realname.clone(),
                    callsign: client.callsign.clone(),
                    rating: client.rating,
                    logon_time: client.logon_time,
                    latitude: position.map(|p| p.latitude),
                    longitude: position.map(|p| p.longitude),
                    altitude: position.map(|p| p.altitude),
                    flight_plan: client.flight_plan.as_ref().map(WhazzupFlightPlan::from_plan),
                }),
                ClientKind::Atc => controllers.push(WhazzupController {
                    cid: client.cid.clone(),
                    name: client.realname.clone(),
                    callsign: client.callsign.clone(),
                    rating: client.rating,
                    logon_time: client.logon_time,
                    latitude: position.map(|p| p.latitude),
                    longitude: position.map(|p| p.longitude),
                    facility: position.and_then(|p| p.facility),
                    visual_range: position.and_then(|p| p.visual_range),
                }),
            }
        }

        Self {
            general: WhazzupGeneral {
                version: WHAZZUP_VERSION,
                reload: 1,
                update: now.format("%Y%m%d%H%M%S").to_string(),
                update_timestamp: now,
                connected_clients: clients.len(),
            },
            pilots,
            controllers,
        }
    }
}

/// Writes a whazzup JSON snapshot of the online clients to a file.
///
/// The file is written at start and stop, and on client activity at most
/// once per `refresh_secs`.
pub struct Whazzup {
    descriptor: PluginDescriptor,
    path: PathBuf,
    refresh: Duration,
    last_write: Mutex<Option<Instant>>,
}

impl Whazzup {
    pub fn new(path: impl Into<PathBuf>, refresh: Duration) -> Self {
        Self {
            descriptor: PluginDescriptor::new(
                WHAZZUP,
                env!("CARGO_PKG_VERSION"),
                vec![
                    EventKind::AfterStart,
                    EventKind::BeforeStop,
                    EventKind::ClientCreated,
                    EventKind::LineAudited,
                    EventKind::ClientDisconnected,
                ],
            ),
            path: path.into(),
            refresh,
            last_write: Mutex::new(None),
        }
    }

    /// Builds the plugin from its `plugins.settings.whazzup` block.
    pub fn from_settings(settings: Option<&serde_yaml::Value>) -> PluginResult<Self> {
        let parsed: WhazzupSettings = match settings {
            Some(value) => serde_yaml::from_value(value.clone())?,
            None => WhazzupSettings::default(),
        };
        Ok(Self::new(parsed.path, Duration::from_secs(parsed.refresh_secs)))
    }

    fn claim_write(&self, force: bool) -> bool {
        let mut last = self.last_write.lock();
        let now = Instant::now();
        let due = force || last.map_or(true, |at| now.duration_since(at) >= self.refresh);
        if due {
            *last = Some(now);
        }
        due
    }

    /// Writes the current snapshot.
    pub async fn write(&self, ctx: &dyn PluginContext) -> PluginResult<()> {
        let clients = ctx.online_clients();
        let document = WhazzupDocument::from_clients(&clients, Utc::now());
        let body = serde_json::to_vec_pretty(&document)
            .map_err(|e| PluginError::ExecutionError(format!("Failed to encode whazzup: {}", e)))?;

        tokio::fs::write(&self.path, body).await.map_err(|e| {
            PluginError::ExecutionError(format!("Failed to write {}: {}", self.path.display(), e))
        })?;

        debug!(plugin = WHAZZUP, path = %self.path.display(), clients = clients.len(), "Whazzup written");
        Ok(())
    }
}

#[async_trait]
impl Plugin for Whazzup {
    fn descriptor(&self) -> &PluginDescriptor {
        &self.descriptor
    }

    async fn handle(&self, ctx: &dyn PluginContext, event: &mut Event<'_>) -> PluginResult<EventOutcome> {
        let force = matches!(event, Event::AfterStart | Event::BeforeStop);
        if self.claim_write(force) {
            self.write(ctx).await?;
        }
        Ok(EventOutcome::Continue)
    }
}

/// Builds the registry from `plugins.enabled`. Unknown names are logged and
/// skipped.
pub fn build_registry(config: &PluginsConfig) -> Result<PluginRegistry, PluginError> {
    let mut registry = PluginRegistry::new();

    for name in &config.enabled {
        let plugin: Arc<dyn Plugin> = match name.as_str() {
            AUDIT_LOG => Arc::new(AuditLog::new()),
            WORD_FILTER => Arc::new(WordFilter::from_settings(config.settings.get(name))?),
            WHAZZUP => Arc::new(Whazzup::from_settings(config.settings.get(name))?),
            other => {
                warn!(plugin = %other, "Unknown plugin, skipping");
                continue;
            }
        };
        registry.register(plugin)?;
        info!(plugin = %name, "Plugin enabled");
    }

    Ok(registry)
}

#[cfg(test)]
mod tests {
    use super::*;
    use fsd9_core::types::PositionReport;
    use fsd9_core::{MetarRecord, Session, SessionState};

    #[derive(Default)]
    struct Capture {
        sent: Mutex<Vec<(String, String)>>,
        clients: Vec<ClientInfo>,
    }

    #[async_trait]
    impl PluginContext for Capture {
        fn send_to(&self, callsign: &str, line: &str) -> bool {
            self.sent.lock().push((callsign.to_string(), line.to_string()));
            true
        }

        fn broadcast(&self, _line: &str, _exclude: Option<&str>) -> usize {
            0
        }

        fn online_callsigns(&self) -> Vec<String> {
            self.clients.iter().map(|c| c.callsign.clone()).collect()
        }

        fn online_clients(&self) -> Vec<ClientInfo> {
            self.clients.clone()
        }

        fn kick(&self, _callsign: &str) -> bool {
            false
        }

        async fn metar(&self, _icao: &str) -> Option<MetarRecord> {
            None
        }

        fn plugin_settings(&self, _plugin: &str) -> Option<serde_yaml::Value> {
            None
        }
    }

    fn logged_in(callsign: &str) -> Session {
        let mut session = Session::new("127.0.0.1:50000".parse().unwrap());
        session.transition(SessionState::AwaitingAuth).unwrap();
        session.transition(SessionState::Authenticated).unwrap();
        session.callsign = Some(callsign.to_string());
        session
    }

    #[test]
    fn test_build_registry_in_order() {
        let config: PluginsConfig = serde_yaml::from_str(
            "enabled: [word-filter, audit-log, nonsense]\nsettings:\n  word-filter:\n    words: [spam]\n",
        )
        .unwrap();

        let registry = build_registry(&config).unwrap();
        let names: Vec<&str> = registry.descriptors().map(|d| d.name.as_str()).collect();
        assert_eq!(names, vec![WORD_FILTER, AUDIT_LOG]);
    }

    #[test]
    fn test_duplicate_enabled_plugin_rejected() {
        let config: PluginsConfig = serde_yaml::from_str("enabled: [audit-log, audit-log]").unwrap();
        assert!(matches!(build_registry(&config), Err(PluginError::DuplicatePlugin(_))));
    }

    #[test]
    fn test_bad_filter_settings() {
        let value: serde_yaml::Value = serde_yaml::from_str("words: 12").unwrap();
        assert!(WordFilter::from_settings(Some(&value)).is_err());
    }

    #[tokio::test]
    async fn test_word_filter_prevents_and_notifies() {
        let filter = WordFilter::new(["SPAM"]);
        let ctx = Capture::default();
        let mut session = logged_in("N123");

        let outcome = filter
            .handle(
                &ctx,
                &mut Event::LineReceived {
                    session: &mut session,
                    line: "#TMN123:*:buy spam now",
                },
            )
            .await
            .unwrap();
        assert_eq!(outcome, EventOutcome::Prevent);
        assert_eq!(
            ctx.sent.lock().as_slice(),
            &[("N123".to_string(), "#TMserver:N123:Message not delivered".to_string())]
        );

        let outcome = filter
            .handle(
                &ctx,
                &mut Event::LineReceived {
                    session: &mut session,
                    line: "#TMN123:*:hello",
                },
            )
            .await
            .unwrap();
        assert_eq!(outcome, EventOutcome::Continue);
    }

    #[tokio::test]
    async fn test_blank_words_match_nothing() {
        let filter = WordFilter::new(["", "   ", "spam"]);
        assert_eq!(filter.words, vec!["spam".to_string()]);

        let ctx = Capture::default();
        let mut session = logged_in("N123");
        let outcome = filter
            .handle(
                &ctx,
                &mut Event::LineReceived {
                    session: &mut session,
                    line: "#TMN123:*:hello",
                },
            )
            .await
            .unwrap();
        assert_eq!(outcome, EventOutcome::Continue);
        assert!(ctx.sent.lock().is_empty());
    }

    #[tokio::test]
    async fn test_audit_log_never_prevents() {
        let plugin = AuditLog::new();
        let ctx = Capture::default();
        let mut session = logged_in("N123");
        let outcome = LineOutcome::Handled {
            packet_ok: true,
            has_result: false,
        };

        let result = plugin
            .handle(
                &ctx,
                &mut Event::LineAudited {
                    session: &mut session,
                    line: "#TMN123:*:hello",
                    outcome: &outcome,
                },
            )
            .await
            .unwrap();
        assert_eq!(result, EventOutcome::Continue);
    }

    fn client(callsign: &str, kind: ClientKind, position: Option<PositionReport>) -> ClientInfo {
        ClientInfo {
            callsign: callsign.to_string(),
            cid: "100".to_string(),
            realname: "Jane Doe".to_string(),
            kind,
            rating: 5,
            logon_time: Utc::now(),
            position,
            flight_plan: None,
        }
    }

    #[test]
    fn test_whazzup_document_splits_clients() {
        let mut pilot = client("KLM123", ClientKind::Pilot, Some(PositionReport::pilot(52.31, 4.76, 1500)));
        pilot.flight_plan = Some(FlightPlan::new(
            "I:B738:450:EHAM:1200:1200:FL350:EGLL:1:10:3:0:EHRD:none:LOPIK UL980"
                .split(':')
                .map(str::to_string)
                .collect(),
        ));
        let tower = client("EHAM_TWR", ClientKind::Atc, Some(PositionReport::atc(52.3, 4.76, 4, 50)));
        let lurker = client("N1", ClientKind::Pilot, None);

        let now = Utc::now();
        let document = WhazzupDocument::from_clients(&[pilot, tower, lurker], now);
        assert_eq!(document.general.version, 3);
        assert_eq!(document.general.connected_clients, 3);
        assert_eq!(document.general.update, now.format("%Y%m%d%H%M%S").to_string());

        let json = serde_json::to_value(&document).unwrap();
        assert_eq!(json["pilots"][0]["callsign"], "KLM123");
        assert_eq!(json["pilots"][0]["altitude"], 1500);
        assert_eq!(json["pilots"][0]["flight_plan"]["departure"], "EHAM");
        assert_eq!(json["pilots"][0]["flight_plan"]["arrival"], "EGLL");
        assert_eq!(json["pilots"][0]["flight_plan"]["alternate"], "EHRD");
        assert_eq!(json["pilots"][0]["flight_plan"]["route"], "LOPIK UL980");
        assert!(json["pilots"][1].get("latitude").is_none());
        assert_eq!(json["controllers"][0]["facility"], 4);
        assert_eq!(json["controllers"][0]["visual_range"], 50);
    }

    #[tokio::test]
    async fn test_whazzup_writes_on_start_and_throttles() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("whazzup.json");
        let plugin = Whazzup::new(&path, Duration::from_secs(3600));
        let ctx = Capture {
            clients: vec![client("N123", ClientKind::Pilot, None)],
            ..Capture::default()
        };

        plugin.handle(&ctx, &mut Event::AfterStart).await.unwrap();
        let written: serde_json::Value = serde_json::from_slice(&std::fs::read(&path).unwrap()).unwrap();
        assert_eq!(written["pilots"][0]["callsign"], "N123");

        // Activity inside the refresh window does not rewrite
        std::fs::remove_file(&path).unwrap();
        let mut session = logged_in("N123");
        let outcome = LineOutcome::Handled {
            packet_ok: true,
            has_result: true,
        };
        plugin
            .handle(
                &ctx,
                &mut Event::LineAudited {
                    session: &mut session,
                    line: "$PIN123:SERVER:x",
                    outcome: &outcome,
                },
            )
            .await
            .unwrap();
        assert!(!path.exists());

        plugin.handle(&ctx, &mut Event::BeforeStop).await.unwrap();
        assert!(path.exists());
    }

    #[test]
    fn test_whazzup_settings() {
        let value: serde_yaml::Value = serde_yaml::from_str("path: /tmp/w.json\nrefresh_secs: 5").unwrap();
        let plugin = Whazzup::from_settings(Some(&value)).unwrap();
        assert_eq!(plugin.path, PathBuf::from("/tmp/w.json"));
        assert_eq!(plugin.refresh, Duration::from_secs(5));

        let plugin = Whazzup::from_settings(None).unwrap();
        assert_eq!(plugin.path, PathBuf::from("whazzup.json"));
    }
}
