//! Error types for configuration and per-connection handling.
//!
//! `ConfigError` is fatal at startup. `SessionError` is always contained to
//! the connection that produced it.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// Errors raised while building the routing table or TLS context.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// No `default_fallback` entry was configured.
    #[error("missing default_fallback backend")]
    MissingFallback,

    /// The same service identifier was defined more than once.
    #[error("duplicate service identifier '{0}'")]
    DuplicateIdentifier(String),

    /// A service entry has an empty identifier.
    #[error("service identifier cannot be empty")]
    EmptyIdentifier,

    /// A backend entry has an empty host.
    #[error("{context}: host cannot be empty")]
    EmptyHost { context: String },

    /// A port is outside 1-65535.
    #[error("{context}: port {port} out of range (must be 1-65535)")]
    InvalidPort { context: String, port: i64 },

    /// Only `"tls"` mode is supported.
    #[error("unsupported mode '{0}' (expected \"tls\")")]
    UnsupportedMode(String),

    /// The configuration file could not be read.
    #[error("failed to read {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// The configuration file is not valid JSON for the expected shape.
    #[error("config_parse_failed: {0}")]
    Parse(#[from] serde_json::Error),

    /// Certificate or key material is unusable.
    #[error("tls: {0}")]
    Tls(String),
}

impl ConfigError {
    /// Stable reason code for logs.
    pub fn reason_code(&self) -> &'static str {
        match self {
            ConfigError::MissingFallback => "missing_fallback",
            ConfigError::DuplicateIdentifier(_) => "duplicate_identifier",
            ConfigError::EmptyIdentifier => "empty_identifier",
            ConfigError::EmptyHost { .. } => "empty_host",
            ConfigError::InvalidPort { .. } => "invalid_port",
            ConfigError::UnsupportedMode(_) => "unsupported_mode",
            ConfigError::Read { .. } => "config_read_failed",
            ConfigError::Parse(_) => "config_parse_failed",
            ConfigError::Tls(_) => "tls_material_invalid",
        }
    }
}

/// Errors that end (or degrade) a single client session.
#[derive(Debug, Error)]
pub enum SessionError {
    /// TLS negotiation with the client failed or timed out.
    #[error("handshake failed: {0}")]
    Handshake(#[source] io::Error),

    /// The client did not send enough bytes to identify a service in time.
    #[error("key extraction timed out after {buffered} bytes")]
    ExtractTimeout { buffered: usize },

    /// The client sent more than the buffering cap without an identifier.
    #[error("key extraction exceeded {cap} byte cap")]
    ExtractOverflow { cap: usize },

    /// The client closed the connection before routing could be decided.
    #[error("client closed connection after {buffered} bytes, before routing")]
    ConnectionReset { buffered: usize },

    /// The resolved backend could not be dialed.
    #[error("backend {destination} unreachable: {source}")]
    BackendUnreachable {
        destination: String,
        #[source]
        source: io::Error,
    },

    /// I/O failure while splicing the two legs.
    #[error("relay error: {0}")]
    Relay(#[source] io::Error),
}

impl SessionError {
    /// Stable reason code for logs.
    pub fn reason_code(&self) -> &'static str {
        match self {
            SessionError::Handshake(_) => "handshake_failed",
            SessionError::ExtractTimeout { .. } => "extract_timeout",
            SessionError::ExtractOverflow { .. } => "extract_overflow",
            SessionError::ConnectionReset { .. } => "connection_reset",
            SessionError::BackendUnreachable { .. } => "backend_unreachable",
            SessionError::Relay(_) => "relay_error",
        }
    }

    /// Returns true if the session can still be routed to the fallback.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            SessionError::ExtractTimeout { .. } | SessionError::ExtractOverflow { .. }
        )
    }
}
