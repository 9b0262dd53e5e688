//! Client directory
//!
//! Logged-in clients indexed by callsign. Each entry holds the outbound
//! queue of its session plus the snapshot of position and flight plan that
//! other sessions need for range checks and `$CQ` lookups.

use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use flume::{Receiver, Sender, TrySendError};
use fsd9_core::packet::LINE_TERMINATOR;
use fsd9_core::types::{FlightPlan, PositionReport};
use fsd9_core::{ClientKind, ConnectionId};
use fsd9_plugin_api::ClientInfo;
use parking_lot::RwLock;
use std::sync::Arc;
use tokio::sync::Notify;
use tracing::{debug, warn};

use crate::broadcast::Presence;

/// Lines queued per client before new ones are dropped
pub const OUTBOUND_CAPACITY: usize = 1024;

/// Write side of one session: its line queue and its close signal.
#[derive(Debug, Clone)]
pub struct Outbound {
    tx: Sender<String>,
    closer: Arc<Notify>,
}

impl Outbound {
    /// Creates the queue and returns the receiving end for the writer task.
    pub fn new() -> (Self, Receiver<String>) {
        let (tx, rx) = flume::bounded(OUTBOUND_CAPACITY);
        (
            Self {
                tx,
                closer: Arc::new(Notify::new()),
            },
            rx,
        )
    }

    /// Queues a line, appending the terminator. Returns false if the line
    /// was dropped.
    pub fn send(&self, line: &str) -> bool {
        let mut framed = String::with_capacity(line.len() + LINE_TERMINATOR.len());
        framed.push_str(line);
        framed.push_str(LINE_TERMINATOR);

        match self.tx.try_send(framed) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                warn!("Outbound queue full, dropping line");
                false
            }
            Err(TrySendError::Disconnected(_)) => false,
        }
    }

    /// Asks the owning session to close. A signal sent before the session
    /// waits is kept.
    pub fn close(&self) {
        self.closer.notify_one();
    }

    pub(crate) fn closer(&self) -> Arc<Notify> {
        Arc::clone(&self.closer)
    }
}

/// A logged-in client as seen by other sessions.
#[derive(Debug)]
pub struct ClientHandle {
    pub connection_id: ConnectionId,
    pub callsign: String,
    pub kind: ClientKind,
    pub cid: String,
    pub realname: String,
    /// Rating granted at login
    pub rating: u8,
    pub logon_time: DateTime<Utc>,
    outbound: Outbound,
    position: RwLock<Option<PositionReport>>,
    flight_plan: RwLock<Option<FlightPlan>>,
}

impl ClientHandle {
    pub fn new(
        connection_id: ConnectionId,
        callsign: impl Into<String>,
        kind: ClientKind,
        cid: impl Into<String>,
        realname: impl Into<String>,
        rating: u8,
        outbound: Outbound,
    ) -> Self {
        Self {
            connection_id,
            callsign: callsign.into(),
            kind,
            cid: cid.into(),
            realname: realname.into(),
            rating,
            logon_time: Utc::now(),
            outbound,
            position: RwLock::new(None),
            flight_plan: RwLock::new(None),
        }
    }

    pub fn send(&self, line: &str) -> bool {
        self.outbound.send(line)
    }

    pub fn close(&self) {
        self.outbound.close();
    }

    pub fn position(&self) -> Option<PositionReport> {
        *self.position.read()
    }

    pub fn set_position(&self, position: PositionReport) {
        *self.position.write() = Some(position);
    }

    pub fn flight_plan(&self) -> Option<FlightPlan> {
        self.flight_plan.read().clone()
    }

    pub fn set_flight_plan(&self, plan: FlightPlan) {
        *self.flight_plan.write() = Some(plan);
    }

    pub fn info(&self) -> ClientInfo {
        ClientInfo {
            callsign: self.callsign.clone(),
            cid: self.cid.clone(),
            realname: self.realname.clone(),
            kind: self.kind,
            rating: self.rating,
            logon_time: self.logon_time,
            position: self.position(),
            flight_plan: self.flight_plan(),
        }
    }

    pub fn presence(&self) -> Presence {
        Presence {
            kind: self.kind,
            position: self.position(),
        }
    }
}

/// Registry of logged-in clients.
#[derive(Debug, Default)]
pub struct ClientDirectory {
    clients: DashMap<String, Arc<ClientHandle>>,
}

impl ClientDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.clients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }

    pub fn contains(&self, callsign: &str) -> bool {
        self.clients.contains_key(callsign)
    }

    pub fn get(&self, callsign: &str) -> Option<Arc<ClientHandle>> {
        self.clients.get(callsign).map(|entry| Arc::clone(&*entry))
    }

    /// Inserts the handle unless its callsign is taken.
    pub fn try_register(&self, handle: Arc<ClientHandle>) -> bool {
        match self.clients.entry(handle.callsign.clone()) {
            Entry::Occupied(_) => false,
            Entry::Vacant(slot) => {
                debug!(callsign = %handle.callsign, "Client registered");
                slot.insert(handle);
                true
            }
        }
    }

    /// Removes the callsign if it still belongs to `connection_id`.
    pub fn remove(&self, callsign: &str, connection_id: ConnectionId) -> Option<Arc<ClientHandle>> {
        self.clients
            .remove_if(callsign, |_, handle| handle.connection_id == connection_id)
            .map(|(_, handle)| handle)
    }

    pub fn callsigns(&self) -> Vec<String> {
        self.clients.iter().map(|entry| entry.key().clone()).collect()
    }

    fn snapshot(&self) -> Vec<Arc<ClientHandle>> {
        self.clients.iter().map(|entry| Arc::clone(&*entry)).collect()
    }

    /// Plugin view of every client, sorted by callsign.
    pub fn infos(&self) -> Vec<ClientInfo> {
        let mut infos: Vec<ClientInfo> = self.clients.iter().map(|entry| entry.info()).collect();
        infos.sort_by(|a, b| a.callsign.cmp(&b.callsign));
        infos
    }

    pub fn send_to(&self, callsign: &str, line: &str) -> bool {
        match self.get(callsign) {
            Some(handle) => handle.send(line),
            None => false,
        }
    }

    /// Sends to every client except `exclude` for which `keep` holds.
    /// Returns the number of clients the line was queued for.
    pub fn broadcast_where<F>(&self, line: &str, exclude: Option<&str>, mut keep: F) -> usize
    where
        F: FnMut(&ClientHandle) -> bool,
    {
        self.snapshot()
            .into_iter()
            .filter(|handle| Some(handle.callsign.as_str()) != exclude)
            .filter(|handle| keep(handle))
            .filter(|handle| handle.send(line))
            .count()
    }

    pub fn broadcast(&self, line: &str, exclude: Option<&str>) -> usize {
        self.broadcast_where(line, exclude, |_| true)
    }

    /// Signals the client's session to close.
    pub fn kick(&self, callsign: &str) -> bool {
        match self.get(callsign) {
            Some(handle) => {
                handle.close();
                true
            }
            None => false,
        }
    }

    pub fn kick_all(&self) -> usize {
        let clients = self.snapshot();
        for handle in &clients {
            handle.close();
        }
        clients.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn handle(callsign: &str, kind: ClientKind) -> (Arc<ClientHandle>, Receiver<String>) {
        let (outbound, rx) = Outbound::new();
        let handle = ClientHandle::new(ConnectionId::new(), callsign, kind, "100", "Test", 1, outbound);
        (Arc::new(handle), rx)
    }

    #[test]
    fn test_register_rejects_taken_callsign() {
        let directory = ClientDirectory::new();
        let (first, _rx1) = handle("N123", ClientKind::Pilot);
        let (second, _rx2) = handle("N123", ClientKind::Pilot);

        assert!(directory.try_register(first));
        assert!(!directory.try_register(second));
        assert_eq!(directory.len(), 1);
    }

    #[test]
    fn test_remove_only_owner() {
        let directory = ClientDirectory::new();
        let (client, _rx) = handle("N123", ClientKind::Pilot);
        let owner = client.connection_id;
        directory.try_register(client);

        assert!(directory.remove("N123", ConnectionId::new()).is_none());
        assert!(directory.contains("N123"));
        assert!(directory.remove("N123", owner).is_some());
        assert!(directory.is_empty());
    }

    #[test]
    fn test_broadcast_excludes_sender_and_filters() {
        let directory = ClientDirectory::new();
        let (pilot, pilot_rx) = handle("N123", ClientKind::Pilot);
        let (atc, atc_rx) = handle("EHAM_TWR", ClientKind::Atc);
        let (other, other_rx) = handle("N456", ClientKind::Pilot);
        directory.try_register(pilot);
        directory.try_register(atc);
        directory.try_register(other);

        let sent = directory.broadcast_where("#TMN123:*A:hi", Some("N123"), |h| h.kind == ClientKind::Atc);
        assert_eq!(sent, 1);
        assert_eq!(atc_rx.try_recv().unwrap(), "#TMN123:*A:hi\r\n");
        assert!(pilot_rx.try_recv().is_err());
        assert!(other_rx.try_recv().is_err());

        assert_eq!(directory.broadcast("#DLSERVER:*:0:0", None), 3);
    }

    #[test]
    fn test_infos_carry_position_and_plan() {
        let directory = ClientDirectory::new();
        let (pilot, _rx1) = handle("N123", ClientKind::Pilot);
        let (atc, _rx2) = handle("EHAM_TWR", ClientKind::Atc);
        pilot.set_position(PositionReport::pilot(52.3, 4.76, 1500));
        pilot.set_flight_plan(FlightPlan::new(vec!["I".to_string(), "B738".to_string()]));
        directory.try_register(pilot);
        directory.try_register(atc);

        let infos = directory.infos();
        assert_eq!(infos.len(), 2);
        assert_eq!(infos[0].callsign, "EHAM_TWR");
        assert!(infos[0].position.is_none());
        assert_eq!(infos[1].callsign, "N123");
        assert_eq!(infos[1].position.map(|p| p.altitude), Some(1500));
        assert_eq!(infos[1].flight_plan.as_ref().map(|p| p.plan_type()), Some("I"));
    }

    #[test]
    fn test_send_to_unknown() {
        let directory = ClientDirectory::new();
        assert!(!directory.send_to("NOBODY", "line"));
        assert!(!directory.kick("NOBODY"));
    }

    #[tokio::test]
    async fn test_kick_signals_before_wait() {
        let directory = ClientDirectory::new();
        let (outbound, _rx) = Outbound::new();
        let closer = outbound.closer();
        let client = ClientHandle::new(ConnectionId::new(), "N123", ClientKind::Pilot, "100", "", 1, outbound);
        directory.try_register(Arc::new(client));

        assert!(directory.kick("N123"));
        tokio::time::timeout(std::time::Duration::from_secs(1), closer.notified())
            .await
            .expect("close signal kept");
    }

    #[test]
    fn test_full_queue_drops() {
        let (outbound, _rx) = Outbound::new();
        for _ in 0..OUTBOUND_CAPACITY {
            assert!(outbound.send("x"));
        }
        assert!(!outbound.send("x"));
    }
}
