//! TLS listener and connection handling.
//!
//! This module accepts TCP connections, terminates TLS, extracts the
//! service identifier, routes, and hands the session to the pipeline.
//!
//! - One task per accepted connection; the accept loop never waits on a session
//! - Handshake failures are logged and dropped, never fatal to the listener
//! - Connection-level routing (one decision per connection)

use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::time::timeout;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, error, info, warn, Instrument};

use super::backend::{BackendDialer, DEFAULT_CONNECT_TIMEOUT};
use super::extract::{ExtractConfig, KeyExtractor};
use super::pipeline::{Pipeline, PipelineConfig};
use super::router::RoutingDecision;
use super::table::RoutingTable;
use crate::error::SessionError;

/// Default maximum concurrent connections per listener.
pub const DEFAULT_MAX_CONNECTIONS: usize = 10000;

/// Default TLS handshake timeout.
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Pause after a failed accept.
const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(100);

/// Configuration for a listener.
#[derive(Debug, Clone)]
pub struct ListenerConfig {
    /// Address to bind to.
    pub bind_addr: SocketAddr,
    /// Maximum concurrent connections.
    pub max_connections: usize,
    /// TLS handshake timeout.
    pub handshake_timeout: Duration,
    /// Backend connect timeout.
    pub connect_timeout: Duration,
    /// Key extraction budget.
    pub extract: ExtractConfig,
    /// Relay behaviour.
    pub pipeline: PipelineConfig,
}

impl ListenerConfig {
    /// Create a new listener configuration.
    pub fn new(bind_addr: SocketAddr) -> Self {
        Self {
            bind_addr,
            max_connections: DEFAULT_MAX_CONNECTIONS,
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            extract: ExtractConfig::default(),
            pipeline: PipelineConfig::default(),
        }
    }
}

/// Statistics for a listener.
#[derive(Debug, Default)]
pub struct ListenerStats {
    /// Total connections accepted.
    pub connections_accepted: AtomicU64,
    /// Total connections currently active.
    pub connections_active: AtomicU64,
    /// Total connections closed.
    pub connections_closed: AtomicU64,
    /// Connections rejected due to max limit.
    pub connections_rejected: AtomicU64,
    /// TLS handshakes that failed or timed out.
    pub handshakes_failed: AtomicU64,
    /// Sessions where a service identifier was extracted.
    pub keys_found: AtomicU64,
    /// Sessions without identifier (timeout, overflow, unknown protocol).
    pub keys_missing: AtomicU64,
    /// Sessions routed to a configured service.
    pub routes_matched: AtomicU64,
    /// Sessions routed to the fallback.
    pub routes_fallback: AtomicU64,
    /// Backend connection successes.
    pub backend_connected: AtomicU64,
    /// Backend connection failures.
    pub backend_failed: AtomicU64,
    /// Bytes proxied to backend.
    pub bytes_to_backend: AtomicU64,
    /// Bytes proxied from backend.
    pub bytes_from_backend: AtomicU64,
}

impl ListenerStats {
    fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

/// One admitted connection. Releases its slot and settles the counters when
/// dropped, including when the session task unwinds.
struct ConnectionSlot {
    stats: Arc<ListenerStats>,
    _permit: OwnedSemaphorePermit,
}

impl ConnectionSlot {
    fn open(stats: Arc<ListenerStats>, permit: OwnedSemaphorePermit) -> Self {
        ListenerStats::incr(&stats.connections_accepted);
        ListenerStats::incr(&stats.connections_active);
        Self {
            stats,
            _permit: permit,
        }
    }
}

impl Drop for ConnectionSlot {
    fn drop(&mut self) {
        ListenerStats::incr(&self.stats.connections_closed);
        self.stats.connections_active.fetch_sub(1, Ordering::Relaxed);
    }
}

/// A TLS-terminating listener.
pub struct Listener {
    /// Listener configuration.
    config: ListenerConfig,
    /// The TCP listener.
    listener: TcpListener,
    /// Server-side TLS context.
    acceptor: TlsAcceptor,
    /// Routing table for routing decisions.
    routing_table: Arc<RoutingTable>,
    /// Key extractor.
    extractor: KeyExtractor,
    /// Backend leg and relay.
    pipeline: Pipeline,
    /// Connection semaphore for limiting concurrent connections.
    conn_semaphore: Arc<Semaphore>,
    /// Statistics.
    stats: Arc<ListenerStats>,
}

impl Listener {
    /// Create a new listener.
    pub async fn bind(
        config: ListenerConfig,
        routing_table: Arc<RoutingTable>,
        acceptor: TlsAcceptor,
    ) -> io::Result<Self> {
        let listener = TcpListener::bind(config.bind_addr).await?;
        let local_addr = listener.local_addr()?;

        info!(
            bind_addr = %local_addr,
            max_connections = config.max_connections,
            services = routing_table.len(),
            fallback = %routing_table.fallback(),
            "Listener bound"
        );

        Ok(Self {
            conn_semaphore: Arc::new(Semaphore::new(config.max_connections)),
            extractor: KeyExtractor::with_config(config.extract.clone()),
            pipeline: Pipeline::new(
                BackendDialer::with_timeout(config.connect_timeout),
                config.pipeline.clone(),
            ),
            listener,
            acceptor,
            config,
            routing_table,
            stats: Arc::new(ListenerStats::default()),
        })
    }

    /// Get the local address this listener is bound to.
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Get listener statistics.
    pub fn stats(&self) -> &ListenerStats {
        &self.stats
    }

    /// Shared handle to the statistics, usable after the listener is moved.
    pub fn stats_handle(&self) -> Arc<ListenerStats> {
        Arc::clone(&self.stats)
    }

    /// Run the listener, accepting and handling connections.
    pub async fn run(self: Arc<Self>) -> io::Result<()> {
        let local_addr = self.listener.local_addr()?;
        info!(bind_addr = %local_addr, "Listener started");

        loop {
            match self.listener.accept().await {
                Ok((stream, peer_addr)) => {
                    let Ok(permit) = Arc::clone(&self.conn_semaphore).try_acquire_owned() else {
                        ListenerStats::incr(&self.stats.connections_rejected);
                        warn!(peer_addr = %peer_addr, "Connection rejected: max connections reached");
                        continue;
                    };

                    let slot = ConnectionSlot::open(Arc::clone(&self.stats), permit);
                    let listener = Arc::clone(&self);

                    tokio::spawn(
                        async move {
                            let _slot = slot;
                            if let Err(e) = listener.handle_connection(stream).await {
                                log_session_error(&e);
                            }
                        }
                        .instrument(tracing::info_span!("connection", peer = %peer_addr)),
                    );
                }
                Err(e) => {
                    error!(error = %e, "Accept error");
                    tokio::time::sleep(ACCEPT_ERROR_BACKOFF).await;
                }
            }
        }
    }

    /// Handle a single connection: handshake, extract, route, relay.
    async fn handle_connection(&self, stream: TcpStream) -> Result<(), SessionError> {
        if let Err(e) = stream.set_nodelay(true) {
            debug!(error = %e, "Failed to set TCP_NODELAY on client");
        }

        let mut tls = match timeout(self.config.handshake_timeout, self.acceptor.accept(stream)).await
        {
            Ok(Ok(tls)) => tls,
            Ok(Err(e)) => {
                ListenerStats::incr(&self.stats.handshakes_failed);
                return Err(SessionError::Handshake(e));
            }
            Err(_) => {
                ListenerStats::incr(&self.stats.handshakes_failed);
                return Err(SessionError::Handshake(io::Error::new(
                    io::ErrorKind::TimedOut,
                    "handshake timeout",
                )));
            }
        };

        debug!(
            alpn = ?tls.get_ref().1.alpn_protocol().map(String::from_utf8_lossy),
            "TLS handshake complete"
        );

        let extraction = self.extractor.extract(&mut tls).await?;

        if let Some(e) = extraction.budget_error() {
            debug!(reason = e.reason_code(), error = %e, "Routing to fallback");
        }

        match extraction.identifier() {
            Some(_) => ListenerStats::incr(&self.stats.keys_found),
            None => ListenerStats::incr(&self.stats.keys_missing),
        }

        let decision = self.routing_table.route(extraction.identifier());
        match &decision {
            RoutingDecision::Matched { service, .. } => {
                ListenerStats::incr(&self.stats.routes_matched);
                debug!(service = %service, "Service matched");
            }
            RoutingDecision::Fallback { reason, .. } => {
                ListenerStats::incr(&self.stats.routes_fallback);
                debug!(reason = %reason, "Using fallback backend");
            }
        }

        let destination = decision.destination();
        match self.pipeline.serve(tls, extraction, destination).await {
            Ok(relay) => {
                ListenerStats::incr(&self.stats.backend_connected);
                self.stats
                    .bytes_to_backend
                    .fetch_add(relay.bytes_to_backend, Ordering::Relaxed);
                self.stats
                    .bytes_from_backend
                    .fetch_add(relay.bytes_from_backend, Ordering::Relaxed);

                debug!(
                    destination = %destination,
                    bytes_to_backend = relay.bytes_to_backend,
                    bytes_from_backend = relay.bytes_from_backend,
                    "Connection closed"
                );
                Ok(())
            }
            Err(e @ SessionError::BackendUnreachable { .. }) => {
                ListenerStats::incr(&self.stats.backend_failed);
                Err(e)
            }
            Err(e) => {
                ListenerStats::incr(&self.stats.backend_connected);
                Err(e)
            }
        }
    }
}

fn log_session_error(e: &SessionError) {
    match e {
        SessionError::Handshake(_) | SessionError::BackendUnreachable { .. } => {
            warn!(reason = e.reason_code(), error = %e, "Connection error");
        }
        _ => {
            debug!(reason = e.reason_code(), error = %e, "Connection error");
        }
    }
}
