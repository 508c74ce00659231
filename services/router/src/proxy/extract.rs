//! Service identifier extraction from the decrypted client stream.
//!
//! The extractor reads just enough of the connection to find the request
//! path (see `http`), bounded by a deadline and a byte cap. Every byte it
//! reads is kept in the returned prefix, which the pipeline replays to the
//! backend before relaying anything else.
//!
//! - extract_timeout: 1000ms default
//! - max_prefix_bytes: 32KiB default

use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::time::{timeout_at, Instant};
use tracing::{debug, warn};

use super::http::{self, Probe, Protocol, RequestHead};
use crate::error::SessionError;

/// Default time budget for identifying the service.
pub const DEFAULT_EXTRACT_TIMEOUT: Duration = Duration::from_millis(1000);

/// Default maximum bytes buffered while searching for the identifier.
pub const DEFAULT_MAX_PREFIX_BYTES: usize = 32 * 1024;

/// Upper bound on a single read while extracting.
const READ_CHUNK: usize = 4096;

/// Where extraction stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExtractState {
    /// Still reading; never present in a returned `Extraction`.
    AwaitingHeaderBytes,
    /// The request head was fully read (identifier may still be absent).
    HeaderComplete,
    /// The deadline passed first.
    TimedOut,
    /// The byte cap was reached first.
    Overflowed { cap: usize },
}

/// Configuration for key extraction.
#[derive(Debug, Clone)]
pub struct ExtractConfig {
    /// Maximum time to wait for the request head.
    pub timeout: Duration,
    /// Maximum bytes to buffer.
    pub max_bytes: usize,
}

impl Default for ExtractConfig {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_EXTRACT_TIMEOUT,
            max_bytes: DEFAULT_MAX_PREFIX_BYTES,
        }
    }
}

/// Outcome of key extraction.
#[derive(Debug, Clone)]
pub struct Extraction {
    pub state: ExtractState,
    pub head: RequestHead,
    /// Every byte read from the client, in order.
    pub prefix: Vec<u8>,
}

impl Extraction {
    /// The service identifier, if one was determined.
    pub fn identifier(&self) -> Option<&str> {
        match self.state {
            ExtractState::HeaderComplete => self.head.service(),
            _ => None,
        }
    }

    pub fn protocol(&self) -> Protocol {
        self.head.protocol
    }

    /// The recoverable error behind a budget miss, if any.
    pub fn budget_error(&self) -> Option<SessionError> {
        match self.state {
            ExtractState::TimedOut => Some(SessionError::ExtractTimeout {
                buffered: self.prefix.len(),
            }),
            ExtractState::Overflowed { cap } => Some(SessionError::ExtractOverflow { cap }),
            _ => None,
        }
    }
}

/// Reads a connection prefix and determines its service identifier.
pub struct KeyExtractor {
    config: ExtractConfig,
}

impl KeyExtractor {
    /// Create a new extractor with default configuration.
    pub fn new() -> Self {
        Self {
            config: ExtractConfig::default(),
        }
    }

    /// Create a new extractor with custom configuration.
    pub fn with_config(config: ExtractConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &ExtractConfig {
        &self.config
    }

    /// Read from `stream` until the identifier is known or the budget runs out.
    ///
    /// Timeouts and overflows are not errors: they yield an `Extraction`
    /// without identifier so the caller can fall back. Only a client that
    /// goes away before a decision is an error.
    pub async fn extract<R: AsyncRead + Unpin>(
        &self,
        stream: &mut R,
    ) -> Result<Extraction, SessionError> {
        let deadline = Instant::now() + self.config.timeout;
        let max_bytes = self.config.max_bytes;

        let mut prefix = Vec::with_capacity(READ_CHUNK.min(max_bytes));
        let mut protocol = Protocol::Unknown;
        let mut state = ExtractState::AwaitingHeaderBytes;

        while state == ExtractState::AwaitingHeaderBytes {
            if prefix.len() >= max_bytes {
                warn!(
                    buffered = prefix.len(),
                    protocol = ?protocol,
                    "Key extraction overflow"
                );
                state = ExtractState::Overflowed { cap: max_bytes };
                break;
            }

            let filled = prefix.len();
            let want = (max_bytes - filled).min(READ_CHUNK);
            prefix.resize(filled + want, 0);

            match timeout_at(deadline, stream.read(&mut prefix[filled..])).await {
                Err(_) => {
                    prefix.truncate(filled);
                    warn!(buffered = filled, protocol = ?protocol, "Key extraction timeout");
                    state = ExtractState::TimedOut;
                }
                Ok(Ok(0)) => {
                    prefix.truncate(filled);
                    return Err(SessionError::ConnectionReset { buffered: filled });
                }
                Ok(Err(e)) => {
                    debug!(error = %e, buffered = filled, "Read error during key extraction");
                    return Err(SessionError::ConnectionReset { buffered: filled });
                }
                Ok(Ok(n)) => {
                    prefix.truncate(filled + n);
                    match http::probe(&prefix) {
                        Probe::Incomplete(p) => protocol = p,
                        Probe::Complete(head) => {
                            debug!(
                                protocol = ?head.protocol,
                                path = ?head.path,
                                buffered = prefix.len(),
                                "Request head complete"
                            );
                            return Ok(Extraction {
                                state: ExtractState::HeaderComplete,
                                head,
                                prefix,
                            });
                        }
                    }
                }
            }
        }

        Ok(Extraction {
            state,
            head: RequestHead::unidentified(protocol, None),
            prefix,
        })
    }
}

impl Default for KeyExtractor {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proxy::http::{encode_frame, FLAG_END_HEADERS, FRAME_HEADERS, FRAME_SETTINGS, H2_PREFACE};
    use proptest::prelude::*;
    use tokio::io::{duplex, AsyncWriteExt};

    fn grpc_request(path: &str) -> Vec<u8> {
        let block = hpack::Encoder::new().encode(vec![
            (&b":method"[..], &b"POST"[..]),
            (&b":scheme"[..], &b"https"[..]),
            (&b":path"[..], path.as_bytes()),
            (&b"content-type"[..], &b"application/grpc"[..]),
        ]);
        let mut buf = H2_PREFACE.to_vec();
        buf.extend(encode_frame(FRAME_SETTINGS, 0, 0, &[]));
        buf.extend(encode_frame(FRAME_HEADERS, FLAG_END_HEADERS, 1, &block));
        buf
    }

    fn extractor(timeout_ms: u64, max_bytes: usize) -> KeyExtractor {
        KeyExtractor::with_config(ExtractConfig {
            timeout: Duration::from_millis(timeout_ms),
            max_bytes,
        })
    }

    #[tokio::test]
    async fn test_extract_grpc_identifier() {
        let request = grpc_request("/greet.Greeter/SayHello");
        let (mut client, mut server) = duplex(64 * 1024);
        client.write_all(&request).await.unwrap();

        let extraction = KeyExtractor::new().extract(&mut server).await.unwrap();
        assert_eq!(extraction.state, ExtractState::HeaderComplete);
        assert_eq!(extraction.identifier(), Some("greet.Greeter"));
        assert_eq!(extraction.protocol(), Protocol::Http2);
        assert_eq!(extraction.prefix, request);
        assert!(extraction.budget_error().is_none());
    }

    #[tokio::test]
    async fn test_extract_tolerates_short_reads() {
        let request = grpc_request("/example.ProductService/Get");
        let mut builder = tokio_test::io::Builder::new();
        for chunk in request.chunks(7) {
            builder.read(chunk);
        }
        let mut mock = builder.build();

        let extraction = KeyExtractor::new().extract(&mut mock).await.unwrap();
        assert_eq!(extraction.identifier(), Some("example.ProductService"));
        assert_eq!(extraction.prefix, request);
    }

    #[tokio::test]
    async fn test_extract_timeout_keeps_partial_prefix() {
        let request = grpc_request("/greet.Greeter/SayHello");
        let partial = &request[..30];
        let (mut client, mut server) = duplex(64 * 1024);
        client.write_all(partial).await.unwrap();

        let extraction = extractor(50, 4096).extract(&mut server).await.unwrap();
        assert_eq!(extraction.state, ExtractState::TimedOut);
        assert_eq!(extraction.identifier(), None);
        assert_eq!(extraction.protocol(), Protocol::Http2);
        assert_eq!(extraction.prefix, partial);
        assert!(matches!(
            extraction.budget_error(),
            Some(SessionError::ExtractTimeout { buffered: 30 })
        ));

        drop(client);
    }

    #[tokio::test]
    async fn test_extract_overflow() {
        let mut data = H2_PREFACE.to_vec();
        data.extend(encode_frame(FRAME_SETTINGS, 0, 0, &[0u8; 2048]));
        let (mut client, mut server) = duplex(64 * 1024);
        client.write_all(&data).await.unwrap();

        let extraction = extractor(1000, 1024).extract(&mut server).await.unwrap();
        assert_eq!(extraction.state, ExtractState::Overflowed { cap: 1024 });
        assert_eq!(extraction.identifier(), None);
        assert_eq!(extraction.prefix.len(), 1024);
        assert_eq!(extraction.prefix, &data[..1024]);
        assert!(matches!(
            extraction.budget_error(),
            Some(SessionError::ExtractOverflow { cap: 1024 })
        ));
    }

    #[tokio::test]
    async fn test_extract_connection_reset() {
        let (mut client, mut server) = duplex(1024);
        client.write_all(b"PRI * HTTP/2.0").await.unwrap();
        drop(client);

        match KeyExtractor::new().extract(&mut server).await {
            Err(SessionError::ConnectionReset { buffered }) => assert_eq!(buffered, 14),
            other => panic!("Expected ConnectionReset, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_extract_immediate_close() {
        let (client, mut server) = duplex(1024);
        drop(client);

        match KeyExtractor::new().extract(&mut server).await {
            Err(SessionError::ConnectionReset { buffered }) => assert_eq!(buffered, 0),
            other => panic!("Expected ConnectionReset, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_extract_unknown_protocol_completes_without_identifier() {
        let (mut client, mut server) = duplex(1024);
        client.write_all(b"\x00\x00binary").await.unwrap();

        let extraction = KeyExtractor::new().extract(&mut server).await.unwrap();
        assert_eq!(extraction.state, ExtractState::HeaderComplete);
        assert_eq!(extraction.protocol(), Protocol::Unknown);
        assert_eq!(extraction.identifier(), None);
        assert_eq!(extraction.prefix, b"\x00\x00binary");
    }

    #[tokio::test]
    async fn test_extract_http1_request_line() {
        let (mut client, mut server) = duplex(1024);
        client
            .write_all(b"POST /YunService/Ping HTTP/1.1\r\nHost: a\r\n\r\n")
            .await
            .unwrap();

        let extraction = KeyExtractor::new().extract(&mut server).await.unwrap();
        assert_eq!(extraction.protocol(), Protocol::Http1);
        assert_eq!(extraction.identifier(), Some("YunService"));
    }

    proptest! {
        #[test]
        fn prop_prefix_plus_rest_is_input(
            tail in proptest::collection::vec(any::<u8>(), 0..4096),
            use_request in any::<bool>(),
        ) {
            let mut input = if use_request {
                grpc_request("/greet.Greeter/SayHello")
            } else {
                Vec::new()
            };
            input.extend_from_slice(&tail);

            let rt = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
                .unwrap();

            let (result, rest) = rt.block_on(async {
                let (mut client, mut server) = duplex(64 * 1024);
                client.write_all(&input).await.unwrap();
                drop(client);

                let result = extractor(200, 8192).extract(&mut server).await;
                let mut rest = Vec::new();
                server.read_to_end(&mut rest).await.unwrap();
                (result, rest)
            });

            match result {
                Ok(extraction) => {
                    let mut replayed = extraction.prefix.clone();
                    replayed.extend_from_slice(&rest);
                    prop_assert_eq!(replayed, input);
                }
                Err(SessionError::ConnectionReset { buffered }) => {
                    prop_assert_eq!(buffered, input.len());
                    prop_assert!(rest.is_empty());
                }
                Err(other) => prop_assert!(false, "unexpected error {:?}", other),
            }
        }
    }
}
