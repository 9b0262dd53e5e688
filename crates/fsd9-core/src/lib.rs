//! # fsd9 Core
//!
//! Core types, error handling, configuration and wire format for the fsd9
//! flight-simulation daemon.
//!
//! - **Types**: `ConnectionId`, the `Session` record and its state machine,
//!   `UserRecord`, `MetarRecord` and the weather `FetchPolicy`.
//! - **Errors**: `thiserror` enums for protocol, database, fetch and
//!   configuration failures.
//! - **Configuration**: YAML configuration with environment overrides and
//!   validation.
//! - **Packet**: protocol 9 command prefixes, packet splitting and the
//!   `$ER` error line format.
//!
//! ## Example
//!
//! ```
//! use fsd9_core::packet::{break_packet, FsdCommand};
//! use fsd9_core::config::AppConfig;
//!
//! let config = AppConfig::default();
//! assert_eq!(config.server.port, 6809);
//!
//! let packet = break_packet("$AXN123:SERVER:METAR:EHAM");
//! assert_eq!(packet.command, Some(FsdCommand::RequestAcars));
//! ```

pub mod config;
pub mod error;
pub mod packet;
pub mod types;

pub use config::AppConfig;
pub use error::{DatabaseError, FetchError, FsdError, ProtocolError, Result};
pub use types::{
    ClientKind, ConnectionId, FetchMode, FetchPolicy, MetarRecord, Session, SessionState,
    UserRecord,
};
