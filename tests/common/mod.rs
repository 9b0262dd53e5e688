//! Common test utilities and helpers for integration tests

#![allow(dead_code)]

use async_trait::async_trait;
use fsd9_core::config::{AppConfig, DatabaseBackend, SeedUser};
use fsd9_core::{FetchError, MetarRecord};
use fsd9_metar::Fetcher;
use fsd9_plugin_api::PluginRegistry;
use fsd9_server::FsdService;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;

/// How long a test waits for any single line
pub const READ_TIMEOUT: Duration = Duration::from_secs(5);

pub const EHAM_METAR: &str = "EHAM 121225Z 24012KT 9999 FEW030 08/03 Q1012";

/// Loopback config with an in-memory store and three accounts:
/// 100 (rating 5), 200 (rating 12), 300 (suspended).
pub fn test_config() -> AppConfig {
    let mut config = AppConfig::default();
    config.server.host = "127.0.0.1".to_string();
    config.server.port = 0;
    config.server.heartbeat_interval_secs = 0;
    config.database.backend = DatabaseBackend::Memory;
    config.database.seed_users = vec![seed("100", 5), seed("200", 12), seed("300", 0)];
    config.metar.mode = fsd9_core::FetchMode::Once;
    config.metar.fetchers = vec!["DOWN".to_string(), "UP".to_string()];
    config
}

fn seed(callsign: &str, rating: u8) -> SeedUser {
    SeedUser {
        callsign: callsign.to_string(),
        password: "secret".to_string(),
        rating,
    }
}

/// A weather source that is always unreachable.
pub struct DownFetcher;

#[async_trait]
impl Fetcher for DownFetcher {
    fn id(&self) -> &str {
        "DOWN"
    }

    async fn fetch(&self, _icao: &str) -> Result<MetarRecord, FetchError> {
        Err(FetchError::request(self.id(), "connection refused"))
    }
}

/// A weather source that only knows EHAM.
pub struct UpFetcher;

#[async_trait]
impl Fetcher for UpFetcher {
    fn id(&self) -> &str {
        "UP"
    }

    async fn fetch(&self, icao: &str) -> Result<MetarRecord, FetchError> {
        if icao == "EHAM" {
            Ok(MetarRecord::new(icao, EHAM_METAR, self.id()))
        } else {
            Err(FetchError::no_data(self.id(), icao))
        }
    }
}

pub fn test_fetchers() -> Vec<Arc<dyn Fetcher>> {
    vec![Arc::new(DownFetcher), Arc::new(UpFetcher)]
}

/// Starts a service on an ephemeral port.
pub async fn start_server(config: AppConfig, registry: PluginRegistry) -> (FsdService, SocketAddr) {
    let database = fsd9_db::open(&config.database).expect("Failed to open store");
    let mut service =
        FsdService::new(config, database, test_fetchers(), registry).expect("Failed to create service");
    let addr = service.start().await.expect("Failed to start service");
    (service, addr)
}

/// A raw FSD client.
pub struct TestClient {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
}

impl TestClient {
    pub async fn connect(addr: SocketAddr) -> Self {
        let stream = TcpStream::connect(addr).await.expect("Failed to connect");
        let (read, writer) = stream.into_split();
        Self {
            reader: BufReader::new(read),
            writer,
        }
    }

    pub async fn send(&mut self, line: &str) {
        self.writer
            .write_all(format!("{}\r\n", line).as_bytes())
            .await
            .expect("Failed to write");
    }

    /// Next line without terminator, `None` on EOF.
    pub async fn next_line(&mut self) -> Option<String> {
        let mut line = String::new();
        let read = tokio::time::timeout(READ_TIMEOUT, self.reader.read_line(&mut line))
            .await
            .expect("Timed out waiting for a line")
            .expect("Failed to read");
        if read == 0 {
            return None;
        }
        Some(line.trim_end_matches(['\r', '\n']).to_string())
    }

    /// Skips lines until one starts with `prefix`.
    pub async fn wait_for(&mut self, prefix: &str) -> String {
        loop {
            match self.next_line().await {
                Some(line) if line.starts_with(prefix) => return line,
                Some(_) => continue,
                None => panic!("Connection closed while waiting for {:?}", prefix),
            }
        }
    }

    /// Drains until the server closes the connection. A reset counts as
    /// closed.
    pub async fn expect_closed(&mut self) {
        let mut rest = Vec::new();
        let _ = tokio::time::timeout(READ_TIMEOUT, self.reader.read_to_end(&mut rest))
            .await
            .expect("Server did not close the connection");
    }

    /// Logs in as a pilot and reads past the MOTD.
    pub async fn login_pilot(addr: SocketAddr, callsign: &str, cid: &str) -> Self {
        let mut client = Self::connect(addr).await;
        client
            .send(&format!("#AP{}:SERVER:{}:secret:1:9:1:Test Pilot", callsign, cid))
            .await;
        client.wait_for(&format!("#TMserver:{}:fsd9", callsign)).await;
        client.sync(callsign).await;
        client
    }

    /// Logs in as a controller and reads past the MOTD.
    pub async fn login_atc(addr: SocketAddr, callsign: &str, cid: &str, rating: u8) -> Self {
        let mut client = Self::connect(addr).await;
        client
            .send(&format!("#AA{}:SERVER:Test Controller:{}:secret:{}:9", callsign, cid, rating))
            .await;
        client.wait_for(&format!("#TMserver:{}:fsd9", callsign)).await;
        client.sync(callsign).await;
        client
    }

    /// Round-trips a server ping so that earlier lines have been handled.
    pub async fn sync(&mut self, callsign: &str) {
        self.send(&format!("$PI{}:SERVER:sync", callsign)).await;
        self.wait_for(&format!("$POserver:{}:sync", callsign)).await;
    }
}
