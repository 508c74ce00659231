//! Backend leg and bidirectional relay.
//!
//! Order of operations for a session:
//! 1. dial the destination (bounded by the connect timeout)
//! 2. write the extracted prefix to the backend
//! 3. relay both directions concurrently
//!
//! A clean end-of-stream in one direction half-closes the opposite write
//! side. The surviving direction may then stay quiet for at most the
//! half-close timeout before both legs are closed. An error or idle timeout
//! in either direction ends both. Idleness is measured across both
//! directions, so a one-way stream keeps the session alive. Both connections
//! are owned here and dropped on every return path.

use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::Instant;
use tracing::debug;

use super::backend::BackendDialer;
use super::extract::Extraction;
use super::http::{self, RequestHead};
use super::table::Destination;
use crate::error::SessionError;

/// Relay buffer size per direction.
const RELAY_BUFFER_SIZE: usize = 16 * 1024;

/// Time allowed to deliver a rejection response to the client.
const REJECT_WRITE_TIMEOUT: Duration = Duration::from_secs(1);

/// Message carried in rejection responses.
const UNAVAILABLE_MESSAGE: &str = "backend unavailable";

/// Default quiet period allowed after one direction has closed.
pub const DEFAULT_HALF_CLOSE_TIMEOUT: Duration = Duration::from_secs(5);

/// Pipeline configuration.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Longest time without traffic in either direction (none by default).
    pub idle_timeout: Option<Duration>,
    /// Longest time without traffic once one direction has closed.
    pub half_close_timeout: Duration,
    /// Send a protocol-level error response when the backend is unreachable.
    pub reject_unreachable: bool,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            idle_timeout: None,
            half_close_timeout: DEFAULT_HALF_CLOSE_TIMEOUT,
            reject_unreachable: true,
        }
    }
}

impl PipelineConfig {
    fn relay_limits(&self) -> RelayLimits {
        RelayLimits {
            idle_timeout: self.idle_timeout,
            half_close_timeout: self.half_close_timeout,
        }
    }
}

/// Bytes moved during one session.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RelayStats {
    /// Includes the replayed prefix.
    pub bytes_to_backend: u64,
    pub bytes_from_backend: u64,
}

/// Dials backends and splices sessions onto them.
#[derive(Debug, Clone)]
pub struct Pipeline {
    dialer: BackendDialer,
    config: PipelineConfig,
}

impl Pipeline {
    pub fn new(dialer: BackendDialer, config: PipelineConfig) -> Self {
        Self { dialer, config }
    }

    /// Serve one session to completion.
    pub async fn serve<C>(
        &self,
        mut client: C,
        extraction: Extraction,
        destination: &Destination,
    ) -> Result<RelayStats, SessionError>
    where
        C: AsyncRead + AsyncWrite + Unpin,
    {
        let mut backend = match self.dialer.connect(destination).await {
            Ok(stream) => stream,
            Err(e) => {
                if self.config.reject_unreachable {
                    reject(&mut client, &extraction.head).await;
                }
                let _ = client.shutdown().await;
                return Err(e);
            }
        };

        if !extraction.prefix.is_empty() {
            backend
                .write_all(&extraction.prefix)
                .await
                .map_err(SessionError::Relay)?;
        }
        let prefix_len = extraction.prefix.len() as u64;

        let (to_backend, from_backend) = relay(client, backend, self.config.relay_limits())
            .await
            .map_err(SessionError::Relay)?;

        Ok(RelayStats {
            bytes_to_backend: prefix_len + to_backend,
            bytes_from_backend: from_backend,
        })
    }
}

/// Best-effort protocol-level rejection.
async fn reject<C: AsyncWrite + Unpin>(client: &mut C, head: &RequestHead) {
    let Some(response) = http::unavailable_response(head, UNAVAILABLE_MESSAGE) else {
        return;
    };

    let write = async {
        client.write_all(&response).await?;
        client.flush().await
    };
    match tokio::time::timeout(REJECT_WRITE_TIMEOUT, write).await {
        Ok(Ok(())) => debug!(protocol = ?head.protocol, "Rejection response sent"),
        Ok(Err(e)) => debug!(error = %e, "Failed to send rejection response"),
        Err(_) => debug!("Rejection response timed out"),
    }
}

/// Timers applied while relaying.
#[derive(Debug, Clone, Copy)]
pub struct RelayLimits {
    pub idle_timeout: Option<Duration>,
    pub half_close_timeout: Duration,
}

impl Default for RelayLimits {
    fn default() -> Self {
        Self {
            idle_timeout: None,
            half_close_timeout: DEFAULT_HALF_CLOSE_TIMEOUT,
        }
    }
}

/// Traffic shared by both relay directions.
struct Activity {
    started: Instant,
    /// Milliseconds after `started` of the most recent read.
    last_read_ms: AtomicU64,
}

impl Activity {
    fn new() -> Self {
        Self {
            started: Instant::now(),
            last_read_ms: AtomicU64::new(0),
        }
    }

    fn touch(&self) {
        let elapsed = self.started.elapsed().as_millis() as u64;
        self.last_read_ms.fetch_max(elapsed, Ordering::Relaxed);
    }

    fn last_read(&self) -> Instant {
        self.started + Duration::from_millis(self.last_read_ms.load(Ordering::Relaxed))
    }
}

/// Relay data bidirectionally between two streams.
///
/// Returns (bytes_a_to_b, bytes_b_to_a).
pub async fn relay<A, B>(a: A, b: B, limits: RelayLimits) -> io::Result<(u64, u64)>
where
    A: AsyncRead + AsyncWrite + Unpin,
    B: AsyncRead + AsyncWrite + Unpin,
{
    let (mut a_read, mut a_write) = tokio::io::split(a);
    let (mut b_read, mut b_write) = tokio::io::split(b);

    let activity = Activity::new();
    let a_count = AtomicU64::new(0);
    let b_count = AtomicU64::new(0);

    let a_to_b = copy_half(&mut a_read, &mut b_write, &activity, &a_count);
    let b_to_a = copy_half(&mut b_read, &mut a_write, &activity, &b_count);
    tokio::pin!(a_to_b);
    tokio::pin!(b_to_a);

    let mut a_done = false;
    let mut b_done = false;
    let mut half_closed_at: Option<Instant> = None;

    while !(a_done && b_done) {
        let idle_deadline = limits.idle_timeout.map(|t| activity.last_read() + t);
        let linger_deadline = half_closed_at
            .map(|at| at.max(activity.last_read()) + limits.half_close_timeout);
        let deadline = match (idle_deadline, linger_deadline) {
            (Some(idle), Some(linger)) => Some(idle.min(linger)),
            (idle, linger) => idle.or(linger),
        };

        tokio::select! {
            result = &mut a_to_b, if !a_done => {
                result?;
                a_done = true;
                half_closed_at.get_or_insert_with(Instant::now);
            }
            result = &mut b_to_a, if !b_done => {
                result?;
                b_done = true;
                half_closed_at.get_or_insert_with(Instant::now);
            }
            _ = sleep_until(deadline) => {
                let now = Instant::now();
                if limits.idle_timeout.is_some_and(|t| activity.last_read() + t <= now) {
                    return Err(io::Error::new(io::ErrorKind::TimedOut, "idle timeout"));
                }
                let quiet = activity.last_read() + limits.half_close_timeout <= now;
                if quiet && linger_deadline.is_some_and(|d| d <= now) {
                    debug!(a_done, b_done, "Half-closed relay went quiet, closing both legs");
                    break;
                }
            }
        }
    }

    Ok((a_count.load(Ordering::Relaxed), b_count.load(Ordering::Relaxed)))
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

/// Copy until EOF, then shut down the writer.
async fn copy_half<R, W>(
    reader: &mut R,
    writer: &mut W,
    activity: &Activity,
    total: &AtomicU64,
) -> io::Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; RELAY_BUFFER_SIZE];

    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        activity.touch();
        writer.write_all(&buf[..n]).await?;
        writer.flush().await?;
        total.fetch_add(n as u64, Ordering::Relaxed);
    }

    writer.shutdown().await
}
