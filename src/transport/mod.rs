//! Byte-stream transport between the host and the guest runtime.
//!
//! The host binds a [`TransportListener`] (loopback TCP, Unix domain socket
//! or Windows named pipe), hands the resulting [`ConnectionTarget`] to the
//! guest through its environment, and accepts exactly one [`Connection`].
//! Debug mode skips the listener and dials a fixed `host:port` directly via
//! [`Connection::connect`].
//!
//! Everything above this module sees a [`Connection`] as a pair of boxed
//! async halves plus a shared [`TransportStatus`]; nothing branches on the
//! concrete socket kind.

pub mod connection;
pub mod listener;

use std::fmt::{Display, Formatter};

pub use connection::{BoxedReader, BoxedWriter, Connection, ConnectionState, TransportStatus};
pub use listener::{TransportKind, TransportListener};

/// Coordinates a guest uses to reach the host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionTarget {
    /// Loopback TCP endpoint.
    Tcp {
        /// Host name or address.
        host: String,
        /// TCP port.
        port: u16,
    },
    /// Unix domain socket path or Windows pipe name.
    Pipe {
        /// Socket path (Unix) or namespaced pipe name (Windows).
        path: String,
    },
}

impl ConnectionTarget {
    /// Whether this target is a local socket rather than TCP.
    #[must_use]
    pub fn is_pipe(&self) -> bool {
        matches!(self, Self::Pipe { .. })
    }
}

impl Display for ConnectionTarget {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Tcp { host, port } => write!(f, "tcp://{host}:{port}"),
            Self::Pipe { path } => write!(f, "pipe://{path}"),
        }
    }
}
