//! Server lifecycle
//!
//! `FsdService` wires the shared context, the listener and the background
//! tasks together and raises the server lifecycle events.

use anyhow::{Context, Result};
use fsd9_core::config::AppConfig;
use fsd9_core::packet::FsdCommand;
use fsd9_db::DatabaseGateway;
use fsd9_metar::{Fetcher, MetarService};
use fsd9_plugin_api::{Event, PluginRegistry};
use rand::Rng;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::context::ServerContext;
use crate::directory::ClientDirectory;
use crate::listener::{ConnectionListener, ListenerStats};

/// A running FSD server.
pub struct FsdService {
    config: AppConfig,
    ctx: Arc<ServerContext>,
    listener: ConnectionListener,
    tasks: Vec<JoinHandle<()>>,
}

impl FsdService {
    pub fn new(
        config: AppConfig,
        database: Arc<dyn DatabaseGateway>,
        fetchers: Vec<Arc<dyn Fetcher>>,
        registry: PluginRegistry,
    ) -> Result<Self> {
        let metar = Arc::new(MetarService::new(config.metar.policy(), fetchers));
        let ctx = Arc::new(ServerContext::new(&config, database, metar, registry.freeze()));
        let listener = ConnectionListener::new(Arc::clone(&ctx))?;

        Ok(Self {
            config,
            ctx,
            listener,
            tasks: Vec::new(),
        })
    }

    /// Starts everything and returns the bound address.
    pub async fn start(&mut self) -> Result<SocketAddr> {
        self.raise(Event::BeforeStart).await;

        let seeded = fsd9_db::seed_users(self.ctx.database.as_ref(), &self.config.database.seed_users)
            .await
            .context("Failed to seed users")?;
        if seeded > 0 {
            info!(count = seeded, "Seed users created");
        }

        if let Some(cron) = Arc::clone(&self.ctx.metar).spawn_cron() {
            info!(interval = ?self.ctx.metar.policy().cron_interval, "METAR cron started");
            self.tasks.push(cron);
        }

        let addr = self.listener.start().await?;

        let interval = self.ctx.settings.heartbeat_interval();
        if !interval.is_zero() {
            self.tasks
                .push(spawn_heartbeat(Arc::clone(&self.ctx.directory), interval));
        }

        self.raise(Event::AfterStart).await;
        info!(bind_addr = %addr, "FSD server running");
        Ok(addr)
    }

    /// Stops accepting, disconnects every client and ends background tasks.
    pub async fn stop(&mut self) -> Result<()> {
        self.raise(Event::BeforeStop).await;

        self.listener.stop().await?;
        let kicked = self.ctx.directory.kick_all();
        debug!(clients = kicked, "Disconnected clients");

        for task in self.tasks.drain(..) {
            task.abort();
        }

        info!("FSD server stopped");
        Ok(())
    }

    async fn raise(&self, mut event: Event<'_>) {
        self.ctx.registry.dispatch(self.ctx.as_ref(), &mut event).await;
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn context(&self) -> &Arc<ServerContext> {
        &self.ctx
    }

    pub fn listener_stats(&self) -> ListenerStats {
        self.listener.stats()
    }
}

/// Wind delta line sent with every heartbeat.
fn heartbeat_line(r: u32) -> String {
    let speed = i64::from(r % 11) - 5;
    let direction = i64::from(r % 21) - 10;
    format!("{}SERVER:*:{}:{}", FsdCommand::WindDelta, speed, direction)
}

fn spawn_heartbeat(directory: Arc<ClientDirectory>, interval: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        // The first tick completes immediately
        ticker.tick().await;

        loop {
            ticker.tick().await;
            let line = heartbeat_line(rand::thread_rng().gen());
            let sent = directory.broadcast(&line, None);
            debug!(clients = sent, "Heartbeat");
        }
    })
}
