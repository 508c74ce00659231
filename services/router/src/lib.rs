//! Switchyard router library.
//!
//! Terminates TLS, reads the gRPC service name from the first request of
//! each connection, and splices the connection onto the configured backend.

pub mod config;
pub mod error;
pub mod proxy;
pub mod tls;

pub use config::{RouterConfig, Settings, ValidatedConfig};
pub use error::{ConfigError, SessionError};
pub use proxy::{
    Destination, Endpoint, ExtractConfig, KeyExtractor, Listener, ListenerConfig, ListenerStats,
    PipelineConfig, RoutingDecision, RoutingTable, SharedRoutingTable,
};
