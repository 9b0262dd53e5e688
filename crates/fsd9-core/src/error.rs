//! Error types for the fsd9 daemon.
//!
//! Every failure the core can observe maps onto one of the enums below. The
//! session layer decides what each one means for the connection: protocol
//! errors close it, database errors count as failed authentication and fetch
//! errors only ever surface as "no weather".

use serde::{Deserialize, Serialize};
use std::io;

use crate::packet::FsdErrorCode;
use thiserror::Error;

/// Result type alias using FsdError as the error type.
pub type Result<T> = std::result::Result<T, FsdError>;

/// Top-level error type for all fsd9 operations.
#[derive(Debug, Error, Serialize, Deserialize)]
#[serde(tag = "type", content = "details")]
pub enum FsdError {
    /// Wire protocol violations
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// Credential store failures
    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    /// Weather source failures
    #[error("Fetch error: {0}")]
    Fetch(#[from] FetchError),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] IoError),
}

/// Errors raised while parsing or sequencing protocol lines.
///
/// Fatal errors always close the session. Syntax errors close it only when
/// the server runs with strict syntax checking.
#[derive(Debug, Clone, Error, Serialize, Deserialize, PartialEq, Eq)]
pub enum ProtocolError {
    /// A line exceeded the configured maximum length
    #[error("Line exceeds {limit} bytes")]
    LineTooLong { limit: usize },

    /// The line did not start with a known command prefix
    #[error("Unknown command: {line}")]
    UnknownCommand { line: String },

    /// A known command arrived with fewer fields than it needs
    #[error("{command} requires {required} fields, got {actual}")]
    MissingFields {
        command: String,
        required: usize,
        actual: usize,
    },

    /// The announced callsign is malformed
    #[error("Invalid callsign: {callsign}")]
    InvalidCallsign { callsign: String },

    /// The client speaks a protocol revision other than 9
    #[error("Unsupported protocol revision: {revision}")]
    UnsupportedRevision { revision: String },

    /// A session state change that would move backwards
    #[error("Illegal session transition from {from} to {to}")]
    IllegalTransition { from: String, to: String },
}

impl ProtocolError {
    /// Creates a missing fields error.
    pub fn missing_fields(command: impl Into<String>, required: usize, actual: usize) -> Self {
        Self::MissingFields {
            command: command.into(),
            required,
            actual,
        }
    }

    /// Creates an unknown command error.
    pub fn unknown_command(line: impl Into<String>) -> Self {
        Self::UnknownCommand { line: line.into() }
    }

    /// Creates an invalid callsign error.
    pub fn invalid_callsign(callsign: impl Into<String>) -> Self {
        Self::InvalidCallsign {
            callsign: callsign.into(),
        }
    }

    /// Creates an unsupported revision error.
    pub fn unsupported_revision(revision: impl Into<String>) -> Self {
        Self::UnsupportedRevision {
            revision: revision.into(),
        }
    }

    /// Code sent to the client in the `$ER` line.
    pub fn error_code(&self) -> FsdErrorCode {
        match self {
            ProtocolError::InvalidCallsign { .. } => FsdErrorCode::CallsignInvalid,
            ProtocolError::UnsupportedRevision { .. } => FsdErrorCode::Revision,
            ProtocolError::LineTooLong { .. }
            | ProtocolError::UnknownCommand { .. }
            | ProtocolError::MissingFields { .. }
            | ProtocolError::IllegalTransition { .. } => FsdErrorCode::Syntax,
        }
    }

    /// Returns true for errors that end the session whatever the syntax
    /// setting.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            ProtocolError::LineTooLong { .. }
                | ProtocolError::InvalidCallsign { .. }
                | ProtocolError::UnsupportedRevision { .. }
                | ProtocolError::IllegalTransition { .. }
        )
    }

    /// Returns true for errors caused by the shape of a single line, as
    /// opposed to what the line asked for.
    pub fn is_syntax(&self) -> bool {
        matches!(
            self,
            ProtocolError::LineTooLong { .. }
                | ProtocolError::UnknownCommand { .. }
                | ProtocolError::MissingFields { .. }
        )
    }
}

/// Errors returned by a database gateway backend.
#[derive(Debug, Clone, Error, Serialize, Deserialize, PartialEq, Eq)]
pub enum DatabaseError {
    /// Wrong credential, or no such account
    #[error("Authentication failed for {callsign}")]
    AuthFailure { callsign: String },

    /// Lookup of an unknown account
    #[error("User not found: {callsign}")]
    NotFound { callsign: String },

    /// The stored credential could not be parsed
    #[error("Invalid credential hash stored for {callsign}")]
    InvalidHash { callsign: String },

    /// Backend unreachable or inconsistent
    #[error("Backend failure: {reason}")]
    Backend { reason: String },
}

impl DatabaseError {
    /// Creates an authentication failure.
    pub fn auth_failure(callsign: impl Into<String>) -> Self {
        Self::AuthFailure {
            callsign: callsign.into(),
        }
    }

    /// Creates a not found error.
    pub fn not_found(callsign: impl Into<String>) -> Self {
        Self::NotFound {
            callsign: callsign.into(),
        }
    }

    /// Creates a backend error.
    pub fn backend(reason: impl Into<String>) -> Self {
        Self::Backend {
            reason: reason.into(),
        }
    }

    /// Returns true if the failure says nothing about the credential itself.
    pub fn is_backend(&self) -> bool {
        matches!(self, DatabaseError::Backend { .. })
    }
}

/// Errors returned by a single weather fetcher.
#[derive(Debug, Clone, Error, Serialize, Deserialize, PartialEq, Eq)]
pub enum FetchError {
    /// The request could not be sent or the body not read
    #[error("{fetcher}: request failed: {reason}")]
    Request { fetcher: String, reason: String },

    /// The source answered with a non-success status
    #[error("{fetcher}: HTTP status {status}")]
    Status { fetcher: String, status: u16 },

    /// The source had nothing for the requested station
    #[error("{fetcher}: no report for {icao}")]
    NoData { fetcher: String, icao: String },

    /// The source answered with something that is not a report
    #[error("{fetcher}: malformed response: {reason}")]
    Malformed { fetcher: String, reason: String },

    /// The per-fetch deadline elapsed
    #[error("{fetcher}: timed out after {timeout_secs}s")]
    Timeout { fetcher: String, timeout_secs: u64 },
}

impl FetchError {
    /// Creates a request error.
    pub fn request(fetcher: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Request {
            fetcher: fetcher.into(),
            reason: reason.into(),
        }
    }

    /// Creates a no data error.
    pub fn no_data(fetcher: impl Into<String>, icao: impl Into<String>) -> Self {
        Self::NoData {
            fetcher: fetcher.into(),
            icao: icao.into(),
        }
    }

    /// Creates a malformed response error.
    pub fn malformed(fetcher: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Malformed {
            fetcher: fetcher.into(),
            reason: reason.into(),
        }
    }

    /// Returns the id of the fetcher that failed.
    pub fn fetcher(&self) -> &str {
        match self {
            FetchError::Request { fetcher, .. }
            | FetchError::Status { fetcher, .. }
            | FetchError::NoData { fetcher, .. }
            | FetchError::Malformed { fetcher, .. }
            | FetchError::Timeout { fetcher, .. } => fetcher,
        }
    }

    /// Returns true if retrying the same source later may succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            FetchError::Request { .. } | FetchError::Timeout { .. } => true,
            FetchError::Status { status, .. } => *status >= 500,
            FetchError::NoData { .. } | FetchError::Malformed { .. } => false,
        }
    }
}

/// Errors related to configuration.
#[derive(Debug, Error, Serialize, Deserialize)]
pub enum ConfigError {
    /// Configuration file not found
    #[error("Configuration file not found: {path}")]
    FileNotFound { path: String },

    /// Failed to load configuration
    #[error("Failed to load configuration from {path}: {reason}")]
    LoadFailed { path: String, reason: String },

    /// Invalid configuration format
    #[error("Invalid configuration format: {reason}")]
    InvalidFormat { reason: String },

    /// Invalid configuration value
    #[error("Invalid configuration value for '{field}': {reason}")]
    InvalidValue { field: String, reason: String },
}

impl ConfigError {
    /// Creates a file not found error.
    pub fn file_not_found(path: impl Into<String>) -> Self {
        Self::FileNotFound { path: path.into() }
    }

    /// Creates an invalid value error.
    pub fn invalid_value(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidValue {
            field: field.into(),
            reason: reason.into(),
        }
    }
}

/// Wrapper for I/O errors to make them serializable.
#[derive(Debug, Error, Serialize, Deserialize)]
#[error("I/O error: {kind:?}: {message}")]
pub struct IoError {
    pub kind: IoErrorKind,
    pub message: String,
}

impl From<io::Error> for IoError {
    fn from(err: io::Error) -> Self {
        Self {
            kind: err.kind().into(),
            message: err.to_string(),
        }
    }
}

impl From<io::Error> for FsdError {
    fn from(err: io::Error) -> Self {
        FsdError::Io(err.into())
    }
}

/// Serializable subset of std::io::ErrorKind seen on client sockets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum IoErrorKind {
    NotFound,
    PermissionDenied,
    ConnectionRefused,
    ConnectionReset,
    ConnectionAborted,
    AddrInUse,
    BrokenPipe,
    InvalidData,
    TimedOut,
    UnexpectedEof,
    Other,
}

impl From<io::ErrorKind> for IoErrorKind {
    fn from(kind: io::ErrorKind) -> Self {
        match kind {
            io::ErrorKind::NotFound => IoErrorKind::NotFound,
            io::ErrorKind::PermissionDenied => IoErrorKind::PermissionDenied,
            io::ErrorKind::ConnectionRefused => IoErrorKind::ConnectionRefused,
            io::ErrorKind::ConnectionReset => IoErrorKind::ConnectionReset,
            io::ErrorKind::ConnectionAborted => IoErrorKind::ConnectionAborted,
            io::ErrorKind::AddrInUse => IoErrorKind::AddrInUse,
            io::ErrorKind::BrokenPipe => IoErrorKind::BrokenPipe,
            io::ErrorKind::InvalidData => IoErrorKind::InvalidData,
            io::ErrorKind::TimedOut => IoErrorKind::TimedOut,
            io::ErrorKind::UnexpectedEof => IoErrorKind::UnexpectedEof,
            _ => IoErrorKind::Other,
        }
    }
}
