//! TLS-terminating gRPC proxy implementation.
//!
//! This module provides:
//! - TLS listener management
//! - Service identifier extraction from the decrypted request head
//! - Routing table lookup with a mandatory fallback
//! - Connection relaying with prefix replay
//!
//! ## Architecture
//!
//! ```text
//! Client -> Listener (TLS) -> Key Extractor -> Router -> Pipeline -> Backend
//!                                  |                        |
//!                           buffered prefix  ------>  replayed first
//! ```
//!
//! ## Usage
//!
//! ```ignore
//! use proxy::{Listener, ListenerConfig, RoutingTable};
//!
//! let table = Arc::new(RoutingTable::new(services, Some(fallback))?);
//! let acceptor = tls::load_acceptor(&cert_file, &key_file)?;
//!
//! let config = ListenerConfig::new("0.0.0.0:8443".parse()?);
//! let listener = Arc::new(Listener::bind(config, table, acceptor).await?);
//! listener.run().await?;
//! ```

mod backend;
mod extract;
pub mod http;
mod listener;
mod pipeline;
mod router;
mod table;

pub use backend::{BackendDialer, DEFAULT_CONNECT_TIMEOUT};
pub use extract::{
    ExtractConfig, ExtractState, Extraction, KeyExtractor, DEFAULT_EXTRACT_TIMEOUT,
    DEFAULT_MAX_PREFIX_BYTES,
};
pub use http::{Protocol, RequestHead};
pub use listener::{
    Listener, ListenerConfig, ListenerStats, DEFAULT_HANDSHAKE_TIMEOUT, DEFAULT_MAX_CONNECTIONS,
};
pub use pipeline::{
    relay, Pipeline, PipelineConfig, RelayLimits, RelayStats, DEFAULT_HALF_CLOSE_TIMEOUT,
};
pub use router::{FallbackReason, RoutingDecision};
pub use table::{Destination, Endpoint, RoutingTable, ServiceRoute, SharedRoutingTable};
