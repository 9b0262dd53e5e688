//! fsd9 Server
//!
//! The TCP side of the daemon: one listener, one task per client, a shared
//! directory of logged-in clients and the lifecycle glue around them.
//!
//! # Architecture
//!
//! ```text
//!               ┌────────────────────────────┐
//!               │        FsdService          │
//!               │  (service.rs)              │
//!               │  - Lifecycle events        │
//!               │  - Seed users              │
//!               │  - METAR cron, heartbeat   │
//!               └─────────────┬──────────────┘
//!                             │
//!               ┌─────────────▼──────────────┐
//!               │    ConnectionListener      │
//!               │  (listener.rs)             │
//!               └─────────────┬──────────────┘
//!                             │ one task per client
//!               ┌─────────────▼──────────────┐       ┌─────────────────┐
//!               │      ClientSession         │──────►│ PluginRegistry  │
//!               │  (session.rs)              │       └─────────────────┘
//!               │  - Line framing            │       ┌─────────────────┐
//!               │  - Add client / routing    │──────►│ ClientDirectory │
//!               │  - Idle timeout            │       │ (directory.rs)  │
//!               └────────────────────────────┘       └─────────────────┘
//! ```
//!
//! # Example
//!
//! ```rust,no_run
//! use fsd9_core::AppConfig;
//! use fsd9_db::MemoryGateway;
//! use fsd9_server::{plugins, FsdService};
//! use std::sync::Arc;
//!
//! # async fn run() -> anyhow::Result<()> {
//! let config = AppConfig::default();
//! let registry = plugins::build_registry(&config.plugins)?;
//! let mut service = FsdService::new(
//!     config,
//!     Arc::new(MemoryGateway::new()),
//!     fsd9_metar::builtin_fetchers(),
//!     registry,
//! )?;
//! service.start().await?;
//! tokio::signal::ctrl_c().await?;
//! service.stop().await?;
//! # Ok(())
//! # }
//! ```

pub mod broadcast;
pub mod context;
pub mod directory;
pub mod listener;
pub mod metrics;
pub mod plugins;
pub mod service;
pub mod session;

pub use context::ServerContext;
pub use directory::{ClientDirectory, ClientHandle};
pub use listener::{ConnectionListener, ListenerStats};
pub use metrics::{MetricsSnapshot, ServerMetrics};
pub use service::FsdService;
pub use session::ClientSession;
