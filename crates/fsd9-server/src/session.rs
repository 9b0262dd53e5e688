//! Client session
//!
//! One task per accepted socket. The task reads `\n` terminated lines,
//! raises plugin events around each one, runs the built-in protocol handling
//! and tears the client down on exit. A separate writer task drains the
//! session's outbound queue into the socket so that broadcasts from other
//! sessions never wait on this client's TCP window.
//!
//! ```text
//!   socket ──► read_line_frame ──► LineReceived ──► handle_line ──► LineAudited
//!                                       │ Prevent
//!                                       └──────────────────────────► LineAudited
//!
//!   Outbound queue ◄── own replies, broadcasts, plugin sends
//!        │
//!        └──► writer task ──► socket
//! ```

use bytes::BytesMut;
use flume::Receiver;
use fsd9_core::packet::{
    break_packet, error_line, is_icao_code, is_multicast, is_valid_callsign, make_packet, FsdCommand, FsdErrorCode,
    Packet,
};
use fsd9_core::types::{FlightPlan, PositionReport, PROTOCOL_REVISION};
use fsd9_core::{ClientKind, ConnectionId, FsdError, ProtocolError, Session, SessionState};
use fsd9_plugin_api::{Event, EventOutcome, LineOutcome};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::broadcast::{message_in_range, position_in_range, within_sender_range, Presence};
use crate::context::ServerContext;
use crate::directory::{ClientHandle, Outbound};

/// Initial buffer capacity for reading
const INITIAL_BUFFER_CAPACITY: usize = 4096;

/// How long the writer may take to flush queued lines after the session ended
const WRITER_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Minimum rating to kill other clients
const KILL_RATING: u8 = 11;

/// Pilot add packet: callsign, _, cid, password, rating, revision, simtype, realname
const ADD_PILOT_FIELDS: usize = 8;

/// ATC add packet: callsign, _, realname, cid, password, rating, revision
const ADD_ATC_FIELDS: usize = 7;

/// Reads one `\n` terminated line, without its terminator. A `\r` before the
/// `\n` is dropped.
///
/// Returns `Ok(None)` on a clean close. A partial line at EOF is discarded.
pub(crate) async fn read_line_frame<R>(
    stream: &mut R,
    buffer: &mut BytesMut,
    max_line_length: usize,
) -> fsd9_core::Result<Option<String>>
where
    R: AsyncReadExt + Unpin,
{
    loop {
        if let Some(pos) = buffer.iter().position(|b| *b == b'\n') {
            let frame = buffer.split_to(pos + 1);
            let mut line = &frame[..pos];
            if line.last() == Some(&b'\r') {
                line = &line[..line.len() - 1];
            }
            if line.len() > max_line_length {
                return Err(ProtocolError::LineTooLong { limit: max_line_length }.into());
            }
            return Ok(Some(String::from_utf8_lossy(line).into_owned()));
        }

        // +1 leaves room for a trailing \r
        if buffer.len() > max_line_length + 1 {
            return Err(ProtocolError::LineTooLong { limit: max_line_length }.into());
        }

        let n = stream.read_buf(buffer).await?;
        if n == 0 {
            if !buffer.is_empty() {
                debug!(bytes = buffer.len(), "Discarding partial line at close");
            }
            return Ok(None);
        }
    }
}

async fn write_loop(mut writer: OwnedWriteHalf, rx: Receiver<String>, connection_id: ConnectionId) {
    while let Ok(line) = rx.recv_async().await {
        if let Err(e) = writer.write_all(line.as_bytes()).await {
            debug!(connection_id = %connection_id, error = %e, "Write error");
            return;
        }
    }
    let _ = writer.shutdown().await;
}

/// How built-in handling went for one line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Handled {
    packet_ok: bool,
    has_result: bool,
    close: bool,
}

impl Handled {
    const fn new(packet_ok: bool, has_result: bool) -> Self {
        Self {
            packet_ok,
            has_result,
            close: false,
        }
    }

    fn closing(mut self) -> Self {
        self.close = true;
        self
    }

    fn outcome(&self) -> LineOutcome {
        LineOutcome::Handled {
            packet_ok: self.packet_ok,
            has_result: self.has_result,
        }
    }
}

/// Which `@` filter a cast uses.
#[derive(Debug, Clone, Copy)]
enum AtFilter {
    SenderRange,
    MessageRange,
}

pub struct ClientSession {
    ctx: Arc<ServerContext>,
    session: Session,
    outbound: Outbound,
    handle: Option<Arc<ClientHandle>>,
    idle_deadline: Instant,
    disconnect_raised: bool,
}

impl ClientSession {
    /// Creates a session in `Connecting`. The receiver feeds the writer task.
    pub fn new(ctx: Arc<ServerContext>, peer: SocketAddr) -> (Self, Receiver<String>) {
        let (outbound, rx) = Outbound::new();
        let idle_deadline = Instant::now() + ctx.settings.idle_timeout();
        let session = Self {
            ctx,
            session: Session::new(peer),
            outbound,
            handle: None,
            idle_deadline,
            disconnect_raised: false,
        };
        (session, rx)
    }

    pub fn connection_id(&self) -> ConnectionId {
        self.session.connection_id
    }

    pub fn outbound(&self) -> &Outbound {
        &self.outbound
    }

    pub fn state(&self) -> SessionState {
        self.session.state()
    }

    /// Runs the session to completion on `stream`.
    pub async fn run(mut self, stream: TcpStream, rx: Receiver<String>) {
        let connection_id = self.session.connection_id;
        let (reader, writer) = stream.into_split();
        let writer_task = tokio::spawn(write_loop(writer, rx, connection_id));

        if self.open().await {
            self.read_loop(reader).await;
        }
        self.close().await;

        // Dropping the session drops its queue sender so the writer can finish
        drop(self);
        let mut writer_task = writer_task;
        if tokio::time::timeout(WRITER_DRAIN_TIMEOUT, &mut writer_task).await.is_err() {
            warn!(connection_id = %connection_id, "Writer did not drain in time");
            writer_task.abort();
        }
    }

    /// Raises `ClientConnected` and moves to `AwaitingAuth`. Returns false if
    /// a plugin prevented the connection.
    pub(crate) async fn open(&mut self) -> bool {
        let ctx = Arc::clone(&self.ctx);
        let outcome = ctx
            .registry
            .dispatch(
                ctx.as_ref(),
                &mut Event::ClientConnected {
                    session: &mut self.session,
                },
            )
            .await;

        if outcome == EventOutcome::Prevent {
            info!(
                connection_id = %self.session.connection_id,
                remote_addr = %self.session.peer,
                "Connection refused by plugin"
            );
            return false;
        }

        match self.session.transition(SessionState::AwaitingAuth) {
            Ok(()) => true,
            Err(e) => {
                // a plugin already closed the session
                debug!(connection_id = %self.session.connection_id, error = %e, "Session not opened");
                false
            }
        }
    }

    async fn read_loop(&mut self, mut reader: OwnedReadHalf) {
        let closer = self.outbound.closer();
        let max_line_length = self.ctx.settings.max_line_length;
        let mut buffer = BytesMut::with_capacity(INITIAL_BUFFER_CAPACITY);

        loop {
            let deadline = self.idle_deadline;
            let frame = tokio::select! {
                frame = read_line_frame(&mut reader, &mut buffer, max_line_length) => frame,
                _ = tokio::time::sleep_until(deadline) => {
                    info!(callsign = %self.session.display_callsign(), "Idle timeout");
                    self.outbound.send("# Timeout");
                    return;
                }
                _ = closer.notified() => {
                    info!(callsign = %self.session.display_callsign(), "Session closed by server");
                    return;
                }
            };

            match frame {
                Ok(Some(line)) => {
                    if self.process_line(&line).await {
                        return;
                    }
                }
                Ok(None) => {
                    debug!(connection_id = %self.session.connection_id, "Client closed connection");
                    return;
                }
                Err(FsdError::Protocol(e)) => {
                    warn!(
                        connection_id = %self.session.connection_id,
                        remote_addr = %self.session.peer,
                        error = %e,
                        "Protocol error"
                    );
                    self.send_error(e.error_code(), "");
                    return;
                }
                Err(e) => {
                    debug!(connection_id = %self.session.connection_id, error = %e, "Read error");
                    return;
                }
            }
        }
    }

    /// Runs one line through the plugins and the built-in handling. Returns
    /// true if the session must close.
    pub(crate) async fn process_line(&mut self, line: &str) -> bool {
        let ctx = Arc::clone(&self.ctx);
        ctx.metrics.record_line();

        let received = ctx
            .registry
            .dispatch(
                ctx.as_ref(),
                &mut Event::LineReceived {
                    session: &mut self.session,
                    line,
                },
            )
            .await;

        // A plugin may have closed the session; nothing more is raised for it
        if self.session.state().is_closing() {
            return true;
        }

        let (outcome, close) = match received {
            EventOutcome::Prevent => (LineOutcome::HandledByPlugin, false),
            EventOutcome::Continue => {
                let handled = self.handle_line(line).await;
                (handled.outcome(), handled.close)
            }
        };

        ctx.registry
            .dispatch(
                ctx.as_ref(),
                &mut Event::LineAudited {
                    session: &mut self.session,
                    line,
                    outcome: &outcome,
                },
            )
            .await;

        close || self.session.state().is_closing()
    }

    /// Enters `Closing`, unregisters the client and raises
    /// `ClientDisconnected`. Safe to call more than once.
    pub(crate) async fn close(&mut self) {
        self.session.begin_close();

        if let Some(handle) = self.handle.take() {
            if self.ctx.directory.remove(&handle.callsign, handle.connection_id).is_some() {
                let command = match handle.kind {
                    ClientKind::Atc => FsdCommand::RemoveAtc,
                    ClientKind::Pilot => FsdCommand::RemovePilot,
                };
                let line = format!("{}{}:{}", command, handle.callsign, handle.cid);
                self.ctx.directory.broadcast(&line, Some(&handle.callsign));
            }
            info!(
                callsign = %handle.callsign,
                remote_addr = %self.session.peer,
                "Client disconnected"
            );
        }

        if !self.disconnect_raised {
            self.disconnect_raised = true;
            let ctx = Arc::clone(&self.ctx);
            ctx.registry
                .dispatch(
                    ctx.as_ref(),
                    &mut Event::ClientDisconnected {
                        session: &mut self.session,
                    },
                )
                .await;
        }
    }

    fn reset_idle_timer(&mut self) {
        self.idle_deadline = Instant::now() + self.ctx.settings.idle_timeout();
        self.session.touch();
    }

    fn send(&self, line: &str) {
        self.outbound.send(line);
    }

    fn send_error(&self, code: FsdErrorCode, env: &str) {
        self.send(&error_line(self.session.callsign.as_deref(), code, env));
    }

    /// `$ER` diagnostic for a protocol error. Fatal errors close the
    /// session, syntax errors close it under strict syntax checking.
    fn reject(&self, error: ProtocolError) -> Handled {
        debug!(
            connection_id = %self.session.connection_id,
            error = %error,
            "Rejected line"
        );
        self.send_error(error.error_code(), "");
        let handled = Handled::new(false, false);
        if error.is_fatal() || (error.is_syntax() && self.ctx.settings.strict_syntax) {
            handled.closing()
        } else {
            handled
        }
    }

    async fn handle_line(&mut self, line: &str) -> Handled {
        if line.is_empty() {
            return Handled::new(true, true);
        }

        let packet = break_packet(line);
        let command = match packet.command {
            Some(command) if command.is_client_command() => command,
            _ => return self.reject(ProtocolError::unknown_command(line)),
        };

        match command {
            FsdCommand::AddPilot => return self.add_client(&packet, ClientKind::Pilot).await,
            FsdCommand::AddAtc => return self.add_client(&packet, ClientKind::Atc).await,
            _ => {}
        }

        // Everything else needs a login; before that it is ignored
        let Some(handle) = self.handle.clone() else {
            return Handled::new(false, false);
        };

        match command {
            FsdCommand::RemovePilot | FsdCommand::RemoveAtc => Handled::new(true, true).closing(),
            FsdCommand::Plan => self.plan(&handle, &packet),
            FsdCommand::PilotPosition => self.pilot_position(&handle, &packet),
            FsdCommand::AtcPosition => self.atc_position(&handle, &packet),
            FsdCommand::Ping if packet.field(1).eq_ignore_ascii_case("server") => self.server_ping(&handle, &packet),
            FsdCommand::Ping | FsdCommand::Pong => self.cast(&handle, &packet, command, 2, true, AtFilter::SenderRange),
            FsdCommand::Message => self.cast(&handle, &packet, command, 3, true, AtFilter::MessageRange),
            FsdCommand::RequestHandoff | FsdCommand::AcHandoff | FsdCommand::ReplyComm => {
                self.cast(&handle, &packet, command, 3, false, AtFilter::SenderRange)
            }
            FsdCommand::Sb | FsdCommand::Pc | FsdCommand::RequestComm => {
                self.cast(&handle, &packet, command, 2, false, AtFilter::SenderRange)
            }
            FsdCommand::Cr => self.cast(&handle, &packet, command, 4, false, AtFilter::SenderRange),
            FsdCommand::Cq => self.cq(&handle, &packet),
            FsdCommand::Weather => self.weather(&handle, &packet).await,
            FsdCommand::RequestAcars => self.acars(&handle, &packet).await,
            FsdCommand::Kill => self.kill(&handle, &packet),
            other => self.reject(ProtocolError::unknown_command(other.prefix())),
        }
    }

    /// Field count and sender checks shared by post-login commands. On
    /// failure the diagnostic has been sent.
    fn admit(
        &self,
        handle: &ClientHandle,
        packet: &Packet<'_>,
        command: FsdCommand,
        required: usize,
        source: Option<usize>,
    ) -> Result<(), Handled> {
        if packet.len() < required {
            return Err(self.reject(ProtocolError::missing_fields(
                command.prefix(),
                required,
                packet.len(),
            )));
        }
        if let Some(index) = source {
            let sender = packet.field(index);
            if sender != handle.callsign {
                self.send_error(FsdErrorCode::SourceInvalid, sender);
                return Err(Handled::new(false, false));
            }
        }
        Ok(())
    }

    async fn add_client(&mut self, packet: &Packet<'_>, kind: ClientKind) -> Handled {
        if self.session.state().is_logged_in() {
            self.send_error(FsdErrorCode::AlreadyRegistered, "");
            return Handled::new(false, false);
        }

        let (required, command) = match kind {
            ClientKind::Pilot => (ADD_PILOT_FIELDS, FsdCommand::AddPilot),
            ClientKind::Atc => (ADD_ATC_FIELDS, FsdCommand::AddAtc),
        };
        if packet.len() < required {
            return self.reject(ProtocolError::missing_fields(command.prefix(), required, packet.len()));
        }

        let (callsign, cid, password, requested_field, revision, sim_type, realname) = match kind {
            ClientKind::Pilot => (
                packet.field(0),
                packet.field(2),
                packet.field(3),
                packet.field(4),
                packet.field(5),
                packet.field(6).parse::<i32>().unwrap_or(0).to_string(),
                packet.field(7),
            ),
            ClientKind::Atc => (
                packet.field(0),
                packet.field(3),
                packet.field(4),
                packet.field(5),
                packet.field(6),
                String::new(),
                packet.field(2),
            ),
        };
        let requested: u8 = if requested_field.is_empty() {
            1
        } else {
            requested_field.parse().unwrap_or(0)
        };

        if !is_valid_callsign(callsign) {
            return self.reject(ProtocolError::invalid_callsign(callsign));
        }
        if revision.parse::<u32>().ok() != Some(PROTOCOL_REVISION) {
            return self.reject(ProtocolError::unsupported_revision(revision));
        }
        if self.ctx.directory.contains(callsign) {
            self.send_error(FsdErrorCode::CallsignInUse, "");
            return Handled::new(true, false);
        }

        let user = match self.ctx.database.authenticate(cid, password).await {
            Ok(user) => user,
            Err(e) => {
                self.session.failed_auth_attempts += 1;
                self.ctx.metrics.record_auth_failure();
                let attempts = self.session.failed_auth_attempts;
                let limit = self.ctx.settings.auth_attempts;
                warn!(
                    callsign = %callsign,
                    cid = %cid,
                    remote_addr = %self.session.peer,
                    attempts,
                    limit,
                    error = %e,
                    "Authentication failed"
                );
                self.send_error(FsdErrorCode::CidInvalid, cid);
                let handled = Handled::new(true, false);
                return if attempts >= limit { handled.closing() } else { handled };
            }
        };
        self.session.failed_auth_attempts = 0;

        if user.rating == 0 {
            self.send_error(FsdErrorCode::Suspended, "");
            return Handled::new(true, false).closing();
        }
        if user.rating < requested {
            self.send_error(FsdErrorCode::Level, requested_field);
            return Handled::new(true, false).closing();
        }

        let handle = Arc::new(ClientHandle::new(
            self.session.connection_id,
            callsign,
            kind,
            cid,
            realname,
            requested,
            self.outbound.clone(),
        ));
        if !self.ctx.directory.try_register(Arc::clone(&handle)) {
            self.send_error(FsdErrorCode::CallsignInUse, "");
            return Handled::new(true, false);
        }
        if let Err(e) = self.session.transition(SessionState::Authenticated) {
            warn!(callsign = %callsign, error = %e, "Login on a session that cannot authenticate");
            self.ctx.directory.remove(callsign, self.session.connection_id);
            return Handled::new(true, false).closing();
        }

        self.session.callsign = Some(callsign.to_string());
        self.session.kind = Some(kind);
        self.session.cid = Some(cid.to_string());
        self.session.realname = Some(realname.to_string());
        self.session.rating = requested;
        self.session.protocol_revision = Some(PROTOCOL_REVISION);
        self.session.sim_type = (kind == ClientKind::Pilot).then(|| sim_type.clone());
        self.handle = Some(Arc::clone(&handle));
        self.reset_idle_timer();

        let announce = match kind {
            ClientKind::Pilot => make_packet([
                format!("{}{}", FsdCommand::AddPilot, callsign).as_str(),
                "SERVER",
                cid,
                "",
                requested_field,
                requested_field,
                sim_type.as_str(),
            ]),
            ClientKind::Atc => make_packet([
                format!("{}{}", FsdCommand::AddAtc, callsign).as_str(),
                "SERVER",
                realname,
                cid,
                "",
                requested_field,
            ]),
        };
        self.ctx.directory.broadcast(&announce, Some(callsign));
        self.send_motd(callsign);

        self.ctx.metrics.record_login();
        info!(
            callsign = %callsign,
            cid = %cid,
            kind = %kind,
            remote_addr = %self.session.peer,
            "New client"
        );

        let ctx = Arc::clone(&self.ctx);
        ctx.registry
            .dispatch(
                ctx.as_ref(),
                &mut Event::ClientCreated {
                    session: &mut self.session,
                },
            )
            .await;

        Handled::new(true, true)
    }

    fn send_motd(&self, callsign: &str) {
        self.send(&format!(
            "{}server:{}:fsd9 {}",
            FsdCommand::Message,
            callsign,
            env!("CARGO_PKG_VERSION")
        ));
        for line in self.ctx.motd() {
            self.send(&make_packet([
                format!("{}server", FsdCommand::Message).as_str(),
                callsign,
                line.as_str(),
            ]));
        }
    }

    fn plan(&mut self, handle: &ClientHandle, packet: &Packet<'_>) -> Handled {
        if let Err(handled) = self.admit(handle, packet, FsdCommand::Plan, 17, Some(0)) {
            return handled;
        }

        let mut fields: Vec<String> = packet.fields[2..17].iter().map(|f| f.to_string()).collect();
        // Only the first character of the type is kept
        fields[0] = fields[0].chars().take(1).collect();
        let plan = FlightPlan::new(fields);

        let line = make_packet([
            format!("{}{}", FsdCommand::Plan, handle.callsign).as_str(),
            "*A",
            plan.wire_body().as_str(),
        ]);
        handle.set_flight_plan(plan.clone());
        self.session.flight_plan = Some(plan);

        self.ctx
            .directory
            .broadcast_where(&line, Some(&handle.callsign), |to| to.kind == ClientKind::Atc);
        Handled::new(true, true)
    }

    fn update_position(&mut self, handle: &ClientHandle, position: PositionReport) {
        if !(-90.0..=90.0).contains(&position.latitude) || !(-180.0..=180.0).contains(&position.longitude) {
            debug!(
                callsign = %handle.callsign,
                latitude = position.latitude,
                longitude = position.longitude,
                "Invalid position"
            );
        }
        handle.set_position(position);
        self.session.position = Some(position);
        if self.session.state() == SessionState::Authenticated {
            if let Err(e) = self.session.transition(SessionState::Active) {
                debug!(callsign = %handle.callsign, error = %e, "Session not activated");
            }
        }
        self.reset_idle_timer();
    }

    fn relay_position(&self, handle: &ClientHandle, line: &str) {
        let from = handle.presence();
        self.ctx
            .directory
            .broadcast_where(line, Some(&handle.callsign), |to| position_in_range(&from, &to.presence()));
    }

    fn pilot_position(&mut self, handle: &ClientHandle, packet: &Packet<'_>) -> Handled {
        if let Err(handled) = self.admit(handle, packet, FsdCommand::PilotPosition, 10, Some(1)) {
            return handled;
        }

        let latitude = parse_f64(packet.field(4));
        let longitude = parse_f64(packet.field(5));
        let altitude = packet.field(6).parse().unwrap_or(0);
        self.update_position(handle, PositionReport::pilot(latitude, longitude, altitude));

        let rating = handle.rating.to_string();
        let (lat, lon) = (format!("{:.5}", latitude), format!("{:.5}", longitude));
        let line = make_packet([
            format!("{}{}", FsdCommand::PilotPosition, packet.field(0)).as_str(),
            handle.callsign.as_str(),
            packet.field(2),
            rating.as_str(),
            lat.as_str(),
            lon.as_str(),
            packet.field(6),
            packet.field(7),
            packet.field(8),
            packet.field(9),
        ]);
        self.relay_position(handle, &line);
        Handled::new(true, true)
    }

    fn atc_position(&mut self, handle: &ClientHandle, packet: &Packet<'_>) -> Handled {
        if let Err(handled) = self.admit(handle, packet, FsdCommand::AtcPosition, 8, Some(0)) {
            return handled;
        }

        let latitude = parse_f64(packet.field(5));
        let longitude = parse_f64(packet.field(6));
        let facility = packet.field(2).parse().unwrap_or(0);
        let visual_range = packet.field(3).parse().unwrap_or(0);
        let mut position = PositionReport::atc(latitude, longitude, facility, visual_range);
        position.altitude = packet.field(7).parse().unwrap_or(0);
        self.update_position(handle, position);

        let rating = handle.rating.to_string();
        let (lat, lon) = (format!("{:.5}", latitude), format!("{:.5}", longitude));
        let line = make_packet([
            format!("{}{}", FsdCommand::AtcPosition, handle.callsign).as_str(),
            packet.field(1),
            packet.field(2),
            packet.field(3),
            rating.as_str(),
            lat.as_str(),
            lon.as_str(),
            packet.field(7),
        ]);
        self.relay_position(handle, &line);
        Handled::new(true, true)
    }

    fn server_ping(&self, handle: &ClientHandle, packet: &Packet<'_>) -> Handled {
        if let Err(handled) = self.admit(handle, packet, FsdCommand::Ping, 2, Some(0)) {
            return handled;
        }
        self.send(&make_packet([
            format!("{}server", FsdCommand::Pong).as_str(),
            handle.callsign.as_str(),
            packet.rest_from(2).as_str(),
        ]));
        Handled::new(true, true)
    }

    /// Relays `{cmd}{from}:{to}:{rest}` to one client or a multicast group.
    fn cast(
        &self,
        handle: &ClientHandle,
        packet: &Packet<'_>,
        command: FsdCommand,
        required: usize,
        multicast: bool,
        at_filter: AtFilter,
    ) -> Handled {
        if let Err(handled) = self.admit(handle, packet, command, required, Some(0)) {
            return handled;
        }

        let target = packet.field(1);
        let head = format!("{}{}", command, handle.callsign);
        let mut parts: Vec<&str> = vec![head.as_str(), target];
        if packet.len() > 2 {
            parts.extend_from_slice(&packet.fields[2..]);
        } else {
            parts.push("");
        }
        let line = make_packet(parts);

        if !is_multicast(target) {
            return Handled::new(true, self.ctx.directory.send_to(target, &line));
        }
        if !multicast {
            return Handled::new(false, false);
        }

        let directory = &self.ctx.directory;
        let exclude = Some(handle.callsign.as_str());
        let sent = match target {
            "*" => directory.broadcast(&line, exclude),
            "*A" => directory.broadcast_where(&line, exclude, |to| to.kind == ClientKind::Atc),
            "*P" => directory.broadcast_where(&line, exclude, |to| to.kind == ClientKind::Pilot),
            _ => {
                let from: Presence = handle.presence();
                directory.broadcast_where(&line, exclude, |to| match at_filter {
                    AtFilter::SenderRange => within_sender_range(&from, &to.presence()),
                    AtFilter::MessageRange => message_in_range(&from, &to.presence()),
                })
            }
        };
        Handled::new(true, sent > 0)
    }

    fn cq(&self, handle: &ClientHandle, packet: &Packet<'_>) -> Handled {
        if !packet.field(1).eq_ignore_ascii_case("server") {
            return self.cast(handle, packet, FsdCommand::Cq, 3, true, AtFilter::SenderRange);
        }
        if let Err(handled) = self.admit(handle, packet, FsdCommand::Cq, 3, Some(0)) {
            return handled;
        }
        if !packet.field(2).eq_ignore_ascii_case("fp") {
            return Handled::new(true, true);
        }
        if packet.len() < 4 {
            self.send_error(FsdErrorCode::Syntax, "");
            return Handled::new(true, false);
        }

        let target = packet.field(3);
        let Some(client) = self.ctx.directory.get(target) else {
            self.send_error(FsdErrorCode::NoSuchCallsign, target);
            return Handled::new(true, false);
        };
        let Some(plan) = client.flight_plan() else {
            self.send_error(FsdErrorCode::NoFlightPlan, "");
            return Handled::new(true, false);
        };
        if handle.kind != ClientKind::Atc {
            return Handled::new(false, false);
        }

        let head = format!("{}{}", FsdCommand::Plan, target);
        let mut parts: Vec<&str> = vec![head.as_str(), handle.callsign.as_str()];
        parts.extend(plan.fields.iter().map(String::as_str));
        self.send(&make_packet(parts));
        Handled::new(true, true)
    }

    async fn reply_metar(&self, handle: &ClientHandle, icao: &str) -> Handled {
        if !is_icao_code(icao) {
            debug!(callsign = %handle.callsign, icao = %icao, "Malformed station code");
            self.send_error(FsdErrorCode::NoWeather, icao);
            return Handled::new(false, false);
        }

        match self.ctx.metar.request(icao).await {
            Some(record) => {
                self.send(&make_packet([
                    format!("{}server", FsdCommand::ReplyAcars).as_str(),
                    handle.callsign.as_str(),
                    "METAR",
                    record.raw_text.as_str(),
                ]));
                Handled::new(true, true)
            }
            None => {
                debug!(callsign = %handle.callsign, icao = %icao, "No weather");
                self.send_error(FsdErrorCode::NoWeather, icao);
                Handled::new(true, false)
            }
        }
    }

    async fn weather(&self, handle: &ClientHandle, packet: &Packet<'_>) -> Handled {
        if let Err(handled) = self.admit(handle, packet, FsdCommand::Weather, 3, Some(0)) {
            return handled;
        }
        self.reply_metar(handle, packet.field(2)).await
    }

    async fn acars(&self, handle: &ClientHandle, packet: &Packet<'_>) -> Handled {
        if let Err(handled) = self.admit(handle, packet, FsdCommand::RequestAcars, 3, Some(0)) {
            return handled;
        }
        if packet.field(2).eq_ignore_ascii_case("METAR") && packet.len() > 3 {
            return self.reply_metar(handle, packet.field(3)).await;
        }
        Handled::new(true, true)
    }

    fn kill(&self, handle: &ClientHandle, packet: &Packet<'_>) -> Handled {
        if let Err(handled) = self.admit(handle, packet, FsdCommand::Kill, 3, None) {
            return handled;
        }

        let (target, reason) = (packet.field(1), packet.field(2));
        let Some(victim) = self.ctx.directory.get(target) else {
            self.send_error(FsdErrorCode::NoSuchCallsign, target);
            return Handled::new(true, false);
        };

        let message = format!("{}server", FsdCommand::Message);
        if handle.rating < KILL_RATING {
            self.send(&make_packet([
                message.as_str(),
                handle.callsign.as_str(),
                "You are not allowed to kill users!",
            ]));
            return Handled::new(true, false);
        }

        info!(callsign = %handle.callsign, target = %target, reason = %reason, "Killing client");
        let attempt = format!("Attempting to kill {}", target);
        self.send(&make_packet([message.as_str(), handle.callsign.as_str(), attempt.as_str()]));

        victim.send(&make_packet([
            format!("{}SERVER", FsdCommand::Kill).as_str(),
            target,
            reason,
        ]));
        victim.close();
        Handled::new(true, true)
    }
}

fn parse_f64(field: &str) -> f64 {
    field.parse().unwrap_or(0.0)
}
