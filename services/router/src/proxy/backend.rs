//! Backend dialing.
//!
//! Routing is deterministic per service: there is exactly one destination
//! per decision and no retry against an alternative.
//!
//! - Connect timeout to backend: 2s default
//! - TCP_NODELAY on the backend leg

use std::io;
use std::time::Duration;

use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::debug;

use super::table::Destination;
use crate::error::SessionError;

/// Default connect timeout for backend connections.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(2);

/// Opens backend connections with a bounded connect timeout.
#[derive(Debug, Clone)]
pub struct BackendDialer {
    connect_timeout: Duration,
}

impl BackendDialer {
    pub fn new() -> Self {
        Self {
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        }
    }

    pub fn with_timeout(connect_timeout: Duration) -> Self {
        Self { connect_timeout }
    }

    pub fn connect_timeout(&self) -> Duration {
        self.connect_timeout
    }

    /// Dial `destination`, resolving its host if needed.
    pub async fn connect(&self, destination: &Destination) -> Result<TcpStream, SessionError> {
        let addr = (destination.host.as_str(), destination.port);

        let result = match timeout(self.connect_timeout, TcpStream::connect(addr)).await {
            Ok(result) => result,
            Err(_) => Err(io::Error::new(
                io::ErrorKind::TimedOut,
                format!("connect timed out after {:?}", self.connect_timeout),
            )),
        };

        match result {
            Ok(stream) => {
                if let Err(e) = stream.set_nodelay(true) {
                    debug!(error = %e, "Failed to set TCP_NODELAY on backend");
                }
                debug!(destination = %destination, "Connected to backend");
                Ok(stream)
            }
            Err(source) => Err(SessionError::BackendUnreachable {
                destination: destination.to_string(),
                source,
            }),
        }
    }
}

impl Default for BackendDialer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;
    use tokio::net::TcpListener;

    fn destination(host: &str, port: u16) -> Destination {
        Destination {
            host: host.to_string(),
            port,
        }
    }

    #[tokio::test]
    async fn test_connect_success() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let dialer = BackendDialer::new();
        let stream = dialer.connect(&destination("127.0.0.1", port)).await.unwrap();
        assert!(stream.nodelay().unwrap());
    }

    #[tokio::test]
    async fn test_connect_by_hostname() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let dialer = BackendDialer::new();
        assert!(dialer.connect(&destination("localhost", port)).await.is_ok());
    }

    #[tokio::test]
    async fn test_connect_refused() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        match BackendDialer::new().connect(&destination("127.0.0.1", port)).await {
            Err(SessionError::BackendUnreachable { destination, .. }) => {
                assert_eq!(destination, format!("127.0.0.1:{}", port));
            }
            other => panic!("Expected BackendUnreachable, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_connect_bounded_by_timeout() {
        // TEST-NET-1: either unroutable (times out) or rejected outright.
        let dialer = BackendDialer::with_timeout(Duration::from_millis(100));
        let start = Instant::now();

        let result = dialer.connect(&destination("192.0.2.1", 9)).await;
        assert!(matches!(
            result,
            Err(SessionError::BackendUnreachable { .. })
        ));
        assert!(start.elapsed() < Duration::from_secs(2));
    }
}
