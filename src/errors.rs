//! Error types shared across the bridge.

use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};

/// Shared bridge result type.
pub type Result<T> = std::result::Result<T, AppError>;

/// Classification carried by a structured RPC error reply.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RemoteErrorKind {
    /// The addressed service is not bound on the receiving side.
    UnknownService,
    /// The service exists but does not implement the requested method.
    UnknownMethod,
    /// Arguments could not be interpreted by the handler.
    InvalidArguments,
    /// The handler ran and reported a failure.
    Handler,
    /// The connection was torn down before a reply was produced.
    ConnectionClosed,
}

impl Display for RemoteErrorKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let text = match self {
            Self::UnknownService => "unknown service",
            Self::UnknownMethod => "unknown method",
            Self::InvalidArguments => "invalid arguments",
            Self::Handler => "handler failure",
            Self::ConnectionClosed => "connection closed",
        };
        f.write_str(text)
    }
}

/// Structured error transported inside an RPC error reply.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RemoteError {
    /// Failure classification.
    pub kind: RemoteErrorKind,
    /// Human-readable description produced by the remote side.
    pub message: String,
}

impl RemoteError {
    /// Build a remote error of the given kind.
    #[must_use]
    pub fn new(kind: RemoteErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    /// Shorthand for a handler failure.
    #[must_use]
    pub fn handler(message: impl Into<String>) -> Self {
        Self::new(RemoteErrorKind::Handler, message)
    }

    /// Shorthand for an argument decoding failure.
    #[must_use]
    pub fn invalid_args(message: impl Into<String>) -> Self {
        Self::new(RemoteErrorKind::InvalidArguments, message)
    }
}

impl Display for RemoteError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

/// Bridge error enumeration covering all failure modes.
#[derive(Debug)]
pub enum AppError {
    /// Configuration parsing or validation failure.
    Config(String),
    /// Runtime, entry module or connection target could not be prepared.
    Setup(String),
    /// Socket, pipe or stream failure.
    Transport(String),
    /// Malformed frame, unknown message type or sequencing violation.
    Protocol(String),
    /// Local RPC bookkeeping failure (encoding, registration, addressing).
    Rpc(String),
    /// The remote side answered a call with a structured error.
    Remote(RemoteError),
    /// The connection closed before the operation could complete.
    ConnectionClosed(String),
    /// The component was already disposed.
    Disposed(String),
    /// Invalid session state for the requested operation.
    Session(String),
    /// Requested entity does not exist.
    NotFound(String),
    /// File system path failed validation against the workspace root.
    PathViolation(String),
    /// File-system or I/O operation failure.
    Io(String),
}

impl AppError {
    /// Whether this error means the peer connection is gone.
    #[must_use]
    pub fn is_connection_closed(&self) -> bool {
        matches!(self, Self::ConnectionClosed(_) | Self::Disposed(_))
    }
}

impl Display for AppError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Config(msg) => write!(f, "config: {msg}"),
            Self::Setup(msg) => write!(f, "setup: {msg}"),
            Self::Transport(msg) => write!(f, "transport: {msg}"),
            Self::Protocol(msg) => write!(f, "protocol: {msg}"),
            Self::Rpc(msg) => write!(f, "rpc: {msg}"),
            Self::Remote(err) => write!(f, "remote: {err}"),
            Self::ConnectionClosed(msg) => write!(f, "connection closed: {msg}"),
            Self::Disposed(msg) => write!(f, "disposed: {msg}"),
            Self::Session(msg) => write!(f, "session: {msg}"),
            Self::NotFound(msg) => write!(f, "not found: {msg}"),
            Self::PathViolation(msg) => write!(f, "path violation: {msg}"),
            Self::Io(msg) => write!(f, "io: {msg}"),
        }
    }
}

impl std::error::Error for AppError {}

impl From<toml::de::Error> for AppError {
    fn from(err: toml::de::Error) -> Self {
        Self::Config(format!("invalid config: {err}"))
    }
}

impl From<std::io::Error> for AppError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}

impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        Self::Protocol(format!("invalid json: {err}"))
    }
}

impl From<RemoteError> for AppError {
    fn from(err: RemoteError) -> Self {
        Self::Remote(err)
    }
}
