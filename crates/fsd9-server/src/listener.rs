//! Connection listener
//!
//! Accepts TCP connections for the FSD port and spawns one session task per
//! client.
//!
//! ```text
//!          Clients
//!             │
//!       ┌─────▼─────┐
//!       │ TCP:6809  │
//!       └─────┬─────┘
//!             │
//!   ┌─────────▼──────────────────────┐
//!   │       ConnectionListener       │
//!   │  - Accept loop                 │
//!   │  - Denylist (silent drop)      │
//!   │  - Client limit ($ER 012)      │
//!   │  - Per-connection task spawn   │
//!   └─────────┬──────────────────────┘
//!             │
//!      ┌──────┼──────┐
//!      ▼      ▼      ▼
//!   Session Session Session
//! ```

use anyhow::{Context, Result};
use dashmap::DashMap;
use fsd9_core::packet::{error_line, FsdErrorCode, LINE_TERMINATOR};
use fsd9_core::ConnectionId;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::context::ServerContext;
use crate::session::ClientSession;

/// Listener statistics
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ListenerStats {
    /// Connections that got a session
    pub total_accepted: u64,
    /// Connections refused because the server was full
    pub total_rejected: u64,
    /// Connections dropped by the denylist
    pub total_denied: u64,
    /// Sessions currently running
    pub active_connections: usize,
}

/// Shared listener state
#[derive(Debug)]
struct ListenerState {
    accepted: AtomicU64,
    rejected: AtomicU64,
    denied: AtomicU64,
    active: AtomicU64,
    shutdown: AtomicBool,
    /// Close signals of every running session, logged in or not
    sessions: DashMap<ConnectionId, Arc<Notify>>,
}

impl ListenerState {
    fn new() -> Self {
        Self {
            accepted: AtomicU64::new(0),
            rejected: AtomicU64::new(0),
            denied: AtomicU64::new(0),
            active: AtomicU64::new(0),
            shutdown: AtomicBool::new(false),
            sessions: DashMap::new(),
        }
    }

    fn stats(&self) -> ListenerStats {
        ListenerStats {
            total_accepted: self.accepted.load(Ordering::Relaxed),
            total_rejected: self.rejected.load(Ordering::Relaxed),
            total_denied: self.denied.load(Ordering::Relaxed),
            active_connections: self.active.load(Ordering::Relaxed) as usize,
        }
    }
}

/// Accepts clients and hands them to sessions.
pub struct ConnectionListener {
    ctx: Arc<ServerContext>,
    denylist: Arc<Vec<IpAddr>>,
    state: Arc<ListenerState>,
    local_addr: Option<SocketAddr>,
    accept_task: Option<JoinHandle<()>>,
}

impl ConnectionListener {
    /// Creates a listener. The denylist is parsed here so that a bad entry
    /// fails at boot.
    pub fn new(ctx: Arc<ServerContext>) -> Result<Self> {
        let denylist = ctx
            .settings
            .parsed_denylist()
            .context("Invalid server.denylist")?;

        Ok(Self {
            ctx,
            denylist: Arc::new(denylist),
            state: Arc::new(ListenerState::new()),
            local_addr: None,
            accept_task: None,
        })
    }

    /// Binds the configured address and starts the accept loop.
    pub async fn start(&mut self) -> Result<SocketAddr> {
        let bind_addr = self.ctx.settings.bind_address();
        let listener = TcpListener::bind(&bind_addr)
            .await
            .with_context(|| format!("Failed to bind {}", bind_addr))?;
        let local_addr = listener.local_addr()?;

        info!(bind_addr = %local_addr, "Starting FSD listener");

        let ctx = Arc::clone(&self.ctx);
        let denylist = Arc::clone(&self.denylist);
        let state = Arc::clone(&self.state);

        let accept_task = tokio::spawn(async move {
            debug!("Accept loop started");

            loop {
                if state.shutdown.load(Ordering::Relaxed) {
                    info!("Shutdown signal received");
                    break;
                }

                match listener.accept().await {
                    Ok((stream, remote_addr)) => {
                        Self::admit(stream, remote_addr, &ctx, &denylist, &state).await;
                    }
                    Err(e) => {
                        error!(error = %e, "Accept error");
                        tokio::time::sleep(tokio::time::Duration::from_millis(100)).await;
                    }
                }
            }

            debug!("Accept loop stopped");
        });

        self.accept_task = Some(accept_task);
        self.local_addr = Some(local_addr);

        info!(bind_addr = %local_addr, "FSD listener started");
        Ok(local_addr)
    }

    /// Applies the denylist and the client limit, then spawns a session.
    async fn admit(
        mut stream: TcpStream,
        remote_addr: SocketAddr,
        ctx: &Arc<ServerContext>,
        denylist: &[IpAddr],
        state: &Arc<ListenerState>,
    ) {
        if denylist.contains(&remote_addr.ip()) {
            info!(remote_addr = %remote_addr, "Denied connection");
            state.denied.fetch_add(1, Ordering::Relaxed);
            ctx.metrics.record_denied();
            return;
        }

        let current_active = state.active.load(Ordering::Relaxed) as usize;
        if current_active >= ctx.settings.max_clients {
            warn!(
                remote_addr = %remote_addr,
                current = current_active,
                max = ctx.settings.max_clients,
                "Client limit reached, rejecting"
            );
            state.rejected.fetch_add(1, Ordering::Relaxed);
            ctx.metrics.record_rejected();

            let line = error_line(None, FsdErrorCode::ServerFull, "") + LINE_TERMINATOR;
            // The peer may already be gone
            let _ = stream.write_all(line.as_bytes()).await;
            let _ = stream.shutdown().await;
            return;
        }

        let active = state.active.fetch_add(1, Ordering::Relaxed) + 1;
        state.accepted.fetch_add(1, Ordering::Relaxed);
        ctx.metrics.record_accepted();
        ctx.metrics.set_active(active);

        let (session, rx) = ClientSession::new(Arc::clone(ctx), remote_addr);
        let connection_id = session.connection_id();
        state.sessions.insert(connection_id, session.outbound().closer());

        info!(
            connection_id = %connection_id,
            remote_addr = %remote_addr,
            active,
            "Accepted connection"
        );

        let ctx = Arc::clone(ctx);
        let state = Arc::clone(state);
        tokio::spawn(async move {
            session.run(stream, rx).await;

            state.sessions.remove(&connection_id);
            let active = state.active.fetch_sub(1, Ordering::Relaxed).saturating_sub(1);
            ctx.metrics.set_active(active);

            debug!(connection_id = %connection_id, remote_addr = %remote_addr, "Connection closed");
        });
    }

    /// Stops accepting and closes every running session.
    pub async fn stop(&mut self) -> Result<()> {
        info!("Stopping FSD listener");

        self.state.shutdown.store(true, Ordering::Relaxed);

        if let Some(task) = self.accept_task.take() {
            task.abort();
            let _ = task.await;
        }

        for entry in self.state.sessions.iter() {
            entry.value().notify_one();
        }

        info!("FSD listener stopped");
        Ok(())
    }

    /// Address the listener is bound to, once started.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    pub fn stats(&self) -> ListenerStats {
        self.state.stats()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fsd9_core::config::AppConfig;
    use fsd9_core::FetchPolicy;
    use fsd9_db::MemoryGateway;
    use fsd9_metar::MetarService;
    use fsd9_plugin_api::PluginRegistry;
    use std::time::Duration;
    use tokio::io::AsyncReadExt;

    fn context(config: AppConfig) -> Arc<ServerContext> {
        Arc::new(ServerContext::new(
            &config,
            Arc::new(MemoryGateway::new()),
            Arc::new(MetarService::new(FetchPolicy::default(), Vec::new())),
            PluginRegistry::new().freeze(),
        ))
    }

    fn local_config() -> AppConfig {
        let mut config = AppConfig::default();
        config.server.host = "127.0.0.1".to_string();
        config.server.port = 0;
        config
    }

    #[test]
    fn test_bad_denylist_fails_creation() {
        let mut config = local_config();
        config.server.denylist = vec!["not-an-ip".to_string()];
        assert!(ConnectionListener::new(context(config)).is_err());
    }

    #[tokio::test]
    async fn test_full_server_rejects_with_error_line() {
        let mut config = local_config();
        config.server.max_clients = 0;
        let mut listener = ConnectionListener::new(context(config)).unwrap();
        let addr = listener.start().await.unwrap();

        let mut client = TcpStream::connect(addr).await.unwrap();
        let mut reply = String::new();
        tokio::time::timeout(Duration::from_secs(5), client.read_to_string(&mut reply))
            .await
            .unwrap()
            .unwrap();

        assert_eq!(reply, "$ERserver:unknown:012::No more clients\r\n");
        let stats = listener.stats();
        assert_eq!(stats.total_rejected, 1);
        assert_eq!(stats.total_accepted, 0);

        listener.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_denied_peer_gets_no_session() {
        let mut config = local_config();
        config.server.denylist = vec!["127.0.0.1".to_string()];
        let ctx = context(config);
        let mut listener = ConnectionListener::new(Arc::clone(&ctx)).unwrap();
        let addr = listener.start().await.unwrap();

        let mut client = TcpStream::connect(addr).await.unwrap();
        let mut reply = Vec::new();
        tokio::time::timeout(Duration::from_secs(5), client.read_to_end(&mut reply))
            .await
            .unwrap()
            .unwrap();

        assert!(reply.is_empty());
        let stats = listener.stats();
        assert_eq!(stats.total_denied, 1);
        assert_eq!(stats.total_accepted, 0);
        assert_eq!(ctx.metrics.snapshot().connections_denied, 1);
    }
}
