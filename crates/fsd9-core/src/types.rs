//! Core types for the fsd9 daemon.
//!
//! Connection identifiers, the per-connection session record and its state
//! machine, user and weather records, and the weather fetch policy.

use crate::error::ProtocolError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::SocketAddr;
use std::time::Duration;
use uuid::Uuid;

/// The only protocol revision this server speaks.
pub const PROTOCOL_REVISION: u32 = 9;

/// Unique identifier for a client connection.
///
/// Wraps a UUID v4. Each accepted socket gets one for its whole lifetime,
/// before any callsign is known.
///
/// # Examples
///
/// ```
/// use fsd9_core::types::ConnectionId;
///
/// let id = ConnectionId::new();
/// println!("Connection: {}", id);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ConnectionId(Uuid);

impl ConnectionId {
    /// Creates a new random connection identifier.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Returns the underlying UUID.
    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Lifecycle state of a client session.
///
/// States only move forward one step at a time, except that `Closing` can be
/// entered from any other state. `Closing` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SessionState {
    /// Socket accepted, plugins not yet consulted
    Connecting,
    /// Waiting for an add pilot / add ATC line
    AwaitingAuth,
    /// Credentials accepted, no position yet
    Authenticated,
    /// At least one position report received
    Active,
    /// Being torn down
    Closing,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionState::Connecting => write!(f, "CONNECTING"),
            SessionState::AwaitingAuth => write!(f, "AWAITING_AUTH"),
            SessionState::Authenticated => write!(f, "AUTHENTICATED"),
            SessionState::Active => write!(f, "ACTIVE"),
            SessionState::Closing => write!(f, "CLOSING"),
        }
    }
}

impl SessionState {
    /// Returns true if moving from `self` to `next` is allowed.
    pub fn can_transition_to(&self, next: SessionState) -> bool {
        use SessionState::*;
        matches!(
            (*self, next),
            (Connecting, AwaitingAuth)
                | (AwaitingAuth, Authenticated)
                | (Authenticated, Active)
                | (Connecting | AwaitingAuth | Authenticated | Active, Closing)
        )
    }

    /// Returns true once the client has logged in.
    pub fn is_logged_in(&self) -> bool {
        matches!(self, SessionState::Authenticated | SessionState::Active)
    }

    pub fn is_closing(&self) -> bool {
        matches!(self, SessionState::Closing)
    }
}

/// Kind of client behind a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClientKind {
    Pilot,
    Atc,
}

impl fmt::Display for ClientKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ClientKind::Pilot => write!(f, "pilot"),
            ClientKind::Atc => write!(f, "ATC"),
        }
    }
}

/// Last position a client reported.
///
/// Only the fields the range filter needs are kept; the rest of the report
/// is rebuilt from the wire line when it is relayed.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PositionReport {
    pub latitude: f64,
    pub longitude: f64,
    pub altitude: i32,
    /// Controller facility type, ATC only
    pub facility: Option<u8>,
    /// Controller visibility range in nautical miles, ATC only
    pub visual_range: Option<u32>,
}

impl PositionReport {
    /// Creates a pilot position.
    pub fn pilot(latitude: f64, longitude: f64, altitude: i32) -> Self {
        Self {
            latitude,
            longitude,
            altitude,
            facility: None,
            visual_range: None,
        }
    }

    /// Creates a controller position.
    pub fn atc(latitude: f64, longitude: f64, facility: u8, visual_range: u32) -> Self {
        Self {
            latitude,
            longitude,
            altitude: 0,
            facility: Some(facility),
            visual_range: Some(visual_range),
        }
    }

    /// A position at exactly 0/0 or above 100000 ft is a placeholder.
    pub fn is_valid(&self) -> bool {
        !(self.latitude == 0.0 && self.longitude == 0.0) && self.altitude < 100_000
    }
}

/// Filed flight plan, kept as the wire fields after the destination.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct FlightPlan {
    pub fields: Vec<String>,
}

impl FlightPlan {
    pub fn new(fields: Vec<String>) -> Self {
        Self { fields }
    }

    /// IFR/VFR marker, first field.
    pub fn plan_type(&self) -> &str {
        self.fields.first().map(String::as_str).unwrap_or("")
    }

    /// Plan fields joined for the wire, empty if the type is empty.
    pub fn wire_body(&self) -> String {
        if self.plan_type().is_empty() {
            String::new()
        } else {
            self.fields.join(":")
        }
    }
}

/// State of one client connection.
#[derive(Debug, Clone)]
pub struct Session {
    pub connection_id: ConnectionId,
    pub peer: SocketAddr,
    pub callsign: Option<String>,
    state: SessionState,
    pub protocol_revision: Option<u32>,
    pub last_activity: DateTime<Utc>,
    pub kind: Option<ClientKind>,
    pub cid: Option<String>,
    pub realname: Option<String>,
    pub rating: u8,
    pub sim_type: Option<String>,
    pub failed_auth_attempts: u32,
    pub position: Option<PositionReport>,
    pub flight_plan: Option<FlightPlan>,
}

impl Session {
    /// Creates a session in `Connecting` for a freshly accepted socket.
    pub fn new(peer: SocketAddr) -> Self {
        Self {
            connection_id: ConnectionId::new(),
            peer,
            callsign: None,
            state: SessionState::Connecting,
            protocol_revision: None,
            last_activity: Utc::now(),
            kind: None,
            cid: None,
            realname: None,
            rating: 0,
            sim_type: None,
            failed_auth_attempts: 0,
            position: None,
            flight_plan: None,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Moves the session to `next`.
    ///
    /// # Errors
    ///
    /// Returns `IllegalTransition` and leaves the state untouched when the
    /// move is not allowed.
    pub fn transition(&mut self, next: SessionState) -> Result<(), ProtocolError> {
        if !self.state.can_transition_to(next) {
            return Err(ProtocolError::IllegalTransition {
                from: self.state.to_string(),
                to: next.to_string(),
            });
        }
        self.state = next;
        Ok(())
    }

    /// Enters `Closing`. Returns false if the session was already closing.
    pub fn begin_close(&mut self) -> bool {
        self.transition(SessionState::Closing).is_ok()
    }

    /// Records activity on the session.
    pub fn touch(&mut self) {
        self.last_activity = Utc::now();
    }

    /// Callsign, or `unknown` before login.
    pub fn display_callsign(&self) -> &str {
        self.callsign.as_deref().unwrap_or("unknown")
    }

    pub fn is_atc(&self) -> bool {
        self.kind == Some(ClientKind::Atc)
    }
}

/// An account in the credential store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserRecord {
    /// Account id (the CID the client logs in with)
    pub callsign: String,
    pub credential_hash: String,
    pub rating: u8,
}

/// A cached weather report for one station.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetarRecord {
    pub icao: String,
    pub raw_text: String,
    pub fetched_at: DateTime<Utc>,
    /// Id of the fetcher that produced it
    pub source: String,
}

impl MetarRecord {
    pub fn new(icao: impl Into<String>, raw_text: impl Into<String>, source: impl Into<String>) -> Self {
        Self {
            icao: icao.into().to_ascii_uppercase(),
            raw_text: raw_text.into(),
            fetched_at: Utc::now(),
            source: source.into(),
        }
    }

    /// Returns true if the record is younger than `max_age`.
    pub fn is_younger_than(&self, max_age: Duration) -> bool {
        let age = Utc::now().signed_duration_since(self.fetched_at);
        match age.to_std() {
            Ok(age) => age < max_age,
            // fetched_at in the future
            Err(_) => true,
        }
    }
}

/// Weather acquisition mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FetchMode {
    /// Periodic bulk sweeps
    Cron,
    /// Fetch on demand
    Once,
}

impl fmt::Display for FetchMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FetchMode::Cron => write!(f, "cron"),
            FetchMode::Once => write!(f, "once"),
        }
    }
}

/// Runtime weather acquisition policy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchPolicy {
    pub mode: FetchMode,
    pub fetcher_order: Vec<String>,
    pub fallback_enabled: bool,
    pub skip_previous_fetcher_on_fallback: bool,
    pub cron_interval: Duration,
    pub fetch_timeout: Duration,
    pub once_max_age: Option<Duration>,
}

impl FetchPolicy {
    /// Skipping only applies to the sweep-to-on-demand fallback.
    pub fn skips_previous_fetcher(&self) -> bool {
        self.fallback_enabled && self.skip_previous_fetcher_on_fallback && self.mode == FetchMode::Cron
    }
}

impl Default for FetchPolicy {
    fn default() -> Self {
        Self {
            mode: FetchMode::Cron,
            fetcher_order: vec!["NOAA".to_string()],
            fallback_enabled: true,
            skip_previous_fetcher_on_fallback: true,
            cron_interval: Duration::from_secs(3600),
            fetch_timeout: Duration::from_secs(15),
            once_max_age: None,
        }
    }
}
