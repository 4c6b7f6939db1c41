//! Host-side listener the guest connects back to.
//!
//! Local sockets go through the `interprocess` crate: a Unix domain socket
//! file on Linux/macOS, a namespaced named pipe on Windows.

use std::path::PathBuf;
use std::time::Duration;

#[cfg(windows)]
use interprocess::local_socket::{GenericNamespaced, ToNsName};
#[cfg(unix)]
use interprocess::local_socket::{GenericFilePath, ToFsName};
use interprocess::local_socket::{
    tokio::{prelude::*, Listener as LocalListener, Stream as LocalStream},
    ListenerOptions,
};
use tokio::net::TcpListener;
use tracing::{debug, info};

use super::{Connection, ConnectionTarget};
use crate::config::TransportMode;
use crate::{AppError, Result};

/// Concrete listener flavour.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    /// Loopback TCP on an ephemeral port.
    Tcp,
    /// Unix domain socket or Windows named pipe.
    LocalSocket,
}

impl TransportKind {
    /// The kind used when configuration does not force one.
    #[must_use]
    pub fn platform_default() -> Self {
        Self::LocalSocket
    }

    /// Resolve the configured mode.
    #[must_use]
    pub fn from_mode(mode: TransportMode) -> Self {
        match mode {
            TransportMode::Auto => Self::platform_default(),
            TransportMode::Tcp => Self::Tcp,
            TransportMode::Pipe => Self::LocalSocket,
        }
    }
}

/// Removes a Unix socket file when dropped.
#[derive(Debug)]
struct SocketFileGuard(Option<PathBuf>);

impl Drop for SocketFileGuard {
    fn drop(&mut self) {
        if let Some(path) = self.0.take() {
            match std::fs::remove_file(&path) {
                Ok(()) => debug!(path = %path.display(), "socket file removed"),
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
                Err(err) => debug!(path = %path.display(), %err, "failed to remove socket file"),
            }
        }
    }
}

enum ListenerInner {
    Tcp(TcpListener),
    Local(LocalListener),
}

/// Listening endpoint that accepts the guest's connection.
///
/// Dropping the listener closes it and removes the socket file, if any.
pub struct TransportListener {
    inner: ListenerInner,
    socket_file: SocketFileGuard,
}

impl std::fmt::Debug for TransportListener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let kind = match self.inner {
            ListenerInner::Tcp(_) => TransportKind::Tcp,
            ListenerInner::Local(_) => TransportKind::LocalSocket,
        };
        f.debug_struct("TransportListener")
            .field("kind", &kind)
            .field("socket_file", &self.socket_file.0)
            .finish()
    }
}

impl TransportListener {
    /// Bind a fresh listener of `kind` and return the target the guest must dial.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Setup` if the listener cannot be created.
    pub async fn bind(kind: TransportKind) -> Result<(Self, ConnectionTarget)> {
        match kind {
            TransportKind::Tcp => {
                let listener = TcpListener::bind(("127.0.0.1", 0))
                    .await
                    .map_err(|err| AppError::Setup(format!("failed to bind tcp listener: {err}")))?;
                let addr = listener
                    .local_addr()
                    .map_err(|err| AppError::Setup(format!("tcp listener has no address: {err}")))?;
                let target = ConnectionTarget::Tcp {
                    host: addr.ip().to_string(),
                    port: addr.port(),
                };
                info!(%target, "transport listening");
                let listener = Self {
                    inner: ListenerInner::Tcp(listener),
                    socket_file: SocketFileGuard(None),
                };
                Ok((listener, target))
            }
            TransportKind::LocalSocket => {
                let (listener, path, guard) = bind_local()?;
                let target = ConnectionTarget::Pipe { path };
                info!(%target, "transport listening");
                let listener = Self {
                    inner: ListenerInner::Local(listener),
                    socket_file: guard,
                };
                Ok((listener, target))
            }
        }
    }

    /// Wait for the guest to connect.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Transport` on accept failure or when `timeout` elapses.
    pub async fn accept(&self, timeout: Duration) -> Result<Connection> {
        let attempt = async {
            match &self.inner {
                ListenerInner::Tcp(listener) => {
                    let (stream, addr) = listener
                        .accept()
                        .await
                        .map_err(|err| AppError::Transport(format!("tcp accept failed: {err}")))?;
                    debug!(%addr, "guest connected over tcp");
                    Ok(Connection::from_tcp(stream))
                }
                ListenerInner::Local(listener) => {
                    let stream = listener.accept().await.map_err(|err| {
                        AppError::Transport(format!("local socket accept failed: {err}"))
                    })?;
                    debug!("guest connected over local socket");
                    Ok(local_connection("local:host", stream))
                }
            }
        };

        tokio::time::timeout(timeout, attempt).await.map_err(|_| {
            AppError::Transport(format!("guest did not connect within {timeout:?}"))
        })?
    }
}

/// Dial a local socket by the path or name carried in a [`ConnectionTarget`].
pub(crate) async fn connect_local(path: &str) -> Result<Connection> {
    #[cfg(unix)]
    let name = path
        .to_fs_name::<GenericFilePath>()
        .map_err(|err| AppError::Transport(format!("invalid socket path '{path}': {err}")))?;
    #[cfg(windows)]
    let name = path
        .to_ns_name::<GenericNamespaced>()
        .map_err(|err| AppError::Transport(format!("invalid pipe name '{path}': {err}")))?;

    let stream = LocalStream::connect(name)
        .await
        .map_err(|err| AppError::Transport(format!("failed to connect to pipe '{path}': {err}")))?;
    Ok(local_connection(&format!("local:{path}"), stream))
}

fn local_connection(peer: &str, stream: LocalStream) -> Connection {
    let (reader, writer) = stream.split();
    Connection::from_halves(peer, Box::new(reader), Box::new(writer))
}

fn fresh_socket_name() -> String {
    format!("exthost-{}", uuid::Uuid::new_v4().simple())
}

#[cfg(unix)]
fn bind_local() -> Result<(LocalListener, String, SocketFileGuard)> {
    let path = std::env::temp_dir().join(format!("{}.sock", fresh_socket_name()));
    let path_text = path.to_string_lossy().into_owned();
    let name = path_text
        .as_str()
        .to_fs_name::<GenericFilePath>()
        .map_err(|err| AppError::Setup(format!("invalid socket path '{path_text}': {err}")))?;
    let listener = ListenerOptions::new()
        .name(name)
        .create_tokio()
        .map_err(|err| AppError::Setup(format!("failed to create local socket listener: {err}")))?;
    Ok((listener, path_text, SocketFileGuard(Some(path))))
}

#[cfg(windows)]
fn bind_local() -> Result<(LocalListener, String, SocketFileGuard)> {
    let pipe_name = fresh_socket_name();
    let name = pipe_name
        .as_str()
        .to_ns_name::<GenericNamespaced>()
        .map_err(|err| AppError::Setup(format!("invalid pipe name '{pipe_name}': {err}")))?;
    let listener = ListenerOptions::new()
        .name(name)
        .create_tokio()
        .map_err(|err| AppError::Setup(format!("failed to create named pipe listener: {err}")))?;
    Ok((listener, pipe_name, SocketFileGuard(None)))
}
