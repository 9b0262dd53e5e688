use anyhow::{Context, Result};
use clap::Parser;
use fsd9_core::config::{AppConfig, LogFormat, LoggingConfig, MetricsConfig};
use fsd9_server::{plugins, FsdService};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use std::path::PathBuf;
use tokio::signal;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

/// fsd9 - Flight-sim FSD server speaking protocol revision 9
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "config/config.yaml", env = "FSD9_CONFIG")]
    config: PathBuf,

    /// Override the listen port
    #[arg(short, long)]
    port: Option<u16>,

    /// Override the log level
    #[arg(long)]
    log_level: Option<String>,
}

fn init_tracing(logging: &LoggingConfig) {
    // RUST_LOG wins over the configured level
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&logging.level));

    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    let _ = match logging.format {
        LogFormat::Json => builder.json().try_init(),
        LogFormat::Text => builder.try_init(),
    };
}

fn init_metrics(metrics: &MetricsConfig) -> Result<()> {
    if !metrics.enabled {
        info!("Metrics export disabled");
        return Ok(());
    }

    let listen: SocketAddr = metrics
        .listen
        .parse()
        .with_context(|| format!("Invalid metrics.listen address: {}", metrics.listen))?;

    PrometheusBuilder::new()
        .with_http_listener(listen)
        .install()
        .context("Failed to install Prometheus exporter")?;

    info!(bind_address = %listen, "Prometheus metrics exporter initialized");
    Ok(())
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    let args = Args::parse();

    let mut config = AppConfig::from_config_builder(&args.config)
        .with_context(|| format!("Failed to load config file: {:?}", args.config))?;
    if let Some(port) = args.port {
        config.server.port = port;
    }
    if let Some(level) = args.log_level {
        config.logging.level = level;
    }
    config.validate().context("Invalid configuration")?;

    init_tracing(&config.logging);
    init_metrics(&config.metrics)?;

    info!(version = env!("CARGO_PKG_VERSION"), "Starting fsd9");
    info!("Configuration loaded from {:?}", args.config);

    let database = fsd9_db::open(&config.database).context("Failed to open credential store")?;
    let registry = plugins::build_registry(&config.plugins).context("Failed to load plugins")?;

    let mut service = FsdService::new(config, database, fsd9_metar::builtin_fetchers(), registry)?;
    if let Err(e) = service.start().await {
        error!("Server error: {:#}", e);
        return Err(e);
    }

    signal::ctrl_c().await.context("Failed to listen for shutdown signal")?;
    info!("Received shutdown signal, stopping server...");

    service.stop().await
}
