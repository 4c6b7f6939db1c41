//! Connection handle and liveness flags.

use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tracing::debug;

use super::ConnectionTarget;
use crate::{AppError, Result};

/// Read half of a transport connection.
pub type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;

/// Write half of a transport connection.
pub type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Lifecycle of a connection handle.
///
/// A handle is only created from an established stream; dialing and
/// accepting happen in [`Connection::connect`] and
/// [`TransportListener::accept`](super::TransportListener::accept).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Both directions usable.
    Open,
    /// One direction has closed or disposal has begun.
    Closing,
    /// Both directions closed or the handle was disposed.
    Closed,
}

impl ConnectionState {
    fn from_u8(raw: u8) -> Self {
        match raw {
            0 => Self::Open,
            1 => Self::Closing,
            _ => Self::Closed,
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            Self::Open => 0,
            Self::Closing => 1,
            Self::Closed => 2,
        }
    }
}

/// Independently queryable close flags for one connection.
///
/// Shared between the framing layer's read and write tasks and whoever wants
/// to explain a failure precisely (reader EOF vs. writer error vs. local
/// disposal).
#[derive(Debug)]
pub struct TransportStatus {
    state: AtomicU8,
    read_closed: AtomicBool,
    write_closed: AtomicBool,
    disposed: AtomicBool,
}

impl TransportStatus {
    /// Fresh status for an open connection.
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: AtomicU8::new(ConnectionState::Open.as_u8()),
            read_closed: AtomicBool::new(false),
            write_closed: AtomicBool::new(false),
            disposed: AtomicBool::new(false),
        }
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        ConnectionState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Both directions are closed.
    #[must_use]
    pub fn is_socket_closed(&self) -> bool {
        self.is_read_closed() && self.is_write_closed()
    }

    /// The peer closed its sending side or reading failed.
    #[must_use]
    pub fn is_read_closed(&self) -> bool {
        self.read_closed.load(Ordering::Acquire)
    }

    /// Our sending side was shut down or writing failed.
    #[must_use]
    pub fn is_write_closed(&self) -> bool {
        self.write_closed.load(Ordering::Acquire)
    }

    /// The owner disposed the connection.
    #[must_use]
    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::Acquire)
    }

    /// Record that the read side ended.
    pub fn mark_read_closed(&self) {
        self.read_closed.store(true, Ordering::Release);
        self.refresh_state();
    }

    /// Record that the write side ended.
    pub fn mark_write_closed(&self) {
        self.write_closed.store(true, Ordering::Release);
        self.refresh_state();
    }

    /// Record disposal. Returns `true` only for the first call.
    pub fn mark_disposed(&self) -> bool {
        let first = !self.disposed.swap(true, Ordering::AcqRel);
        if first {
            self.state
                .store(ConnectionState::Closing.as_u8(), Ordering::Release);
            self.refresh_state();
        }
        first
    }

    /// One-line description used in close diagnostics.
    #[must_use]
    pub fn describe(&self) -> String {
        format!(
            "state={:?} read_closed={} write_closed={} disposed={}",
            self.state(),
            self.is_read_closed(),
            self.is_write_closed(),
            self.is_disposed()
        )
    }

    fn refresh_state(&self) {
        let next = if self.is_socket_closed() {
            ConnectionState::Closed
        } else if self.is_read_closed() || self.is_write_closed() || self.is_disposed() {
            ConnectionState::Closing
        } else {
            return;
        };
        self.state.store(next.as_u8(), Ordering::Release);
    }
}

impl Default for TransportStatus {
    fn default() -> Self {
        Self::new()
    }
}

/// Owns exactly one live transport endpoint.
///
/// The framing layer consumes the handle through [`Connection::into_parts`];
/// the [`TransportStatus`] stays shared so the session can still query it.
pub struct Connection {
    peer: String,
    reader: BoxedReader,
    writer: BoxedWriter,
    status: Arc<TransportStatus>,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("peer", &self.peer)
            .field("status", &self.status)
            .finish_non_exhaustive()
    }
}

impl Connection {
    /// Wrap separate read and write halves.
    #[must_use]
    pub fn from_halves(peer: impl Into<String>, reader: BoxedReader, writer: BoxedWriter) -> Self {
        Self {
            peer: peer.into(),
            reader,
            writer,
            status: Arc::new(TransportStatus::new()),
        }
    }

    /// Wrap any bidirectional stream, e.g. an in-memory duplex pipe.
    #[must_use]
    pub fn from_stream<S>(peer: impl Into<String>, stream: S) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (reader, writer) = tokio::io::split(stream);
        Self::from_halves(peer, Box::new(reader), Box::new(writer))
    }

    /// Wrap an accepted or dialed TCP stream.
    #[must_use]
    pub fn from_tcp(stream: TcpStream) -> Self {
        let peer = stream
            .peer_addr()
            .map_or_else(|_| "tcp:unknown".to_owned(), |addr| format!("tcp:{addr}"));
        if let Err(err) = stream.set_nodelay(true) {
            debug!(%err, "failed to set TCP_NODELAY");
        }
        let (reader, writer) = stream.into_split();
        Self::from_halves(peer, Box::new(reader), Box::new(writer))
    }

    /// Dial `target` directly.
    ///
    /// Used by debug mode on the host and by the guest runtime to connect back.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Transport` if the connection is refused or does not
    /// complete within `timeout`.
    pub async fn connect(target: &ConnectionTarget, timeout: Duration) -> Result<Self> {
        let attempt = async {
            match target {
                ConnectionTarget::Tcp { host, port } => {
                    let stream = TcpStream::connect((host.as_str(), *port))
                        .await
                        .map_err(|err| {
                            AppError::Transport(format!("failed to connect to {target}: {err}"))
                        })?;
                    Ok(Self::from_tcp(stream))
                }
                ConnectionTarget::Pipe { path } => super::listener::connect_local(path).await,
            }
        };

        tokio::time::timeout(timeout, attempt)
            .await
            .map_err(|_| {
                AppError::Transport(format!("timed out after {timeout:?} connecting to {target}"))
            })?
    }

    /// Peer description for diagnostics.
    #[must_use]
    pub fn peer(&self) -> &str {
        &self.peer
    }

    /// Shared liveness flags.
    #[must_use]
    pub fn status(&self) -> Arc<TransportStatus> {
        Arc::clone(&self.status)
    }

    /// Split into halves and status for the framing layer.
    #[must_use]
    pub fn into_parts(self) -> (BoxedReader, BoxedWriter, Arc<TransportStatus>) {
        (self.reader, self.writer, self.status)
    }
}
