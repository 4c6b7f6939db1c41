//! Pre-RPC handshake messages.
//!
//! The handshake runs over the same framed channel as RPC but is not RPC
//! addressed:
//!
//! 1. guest → host: one-byte `Ready`
//! 2. host → guest: JSON [`InitPayload`] in one frame
//! 3. guest → host: one-byte `Initialized`
//!
//! `Terminate` may be sent by either side at any time afterwards.

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::extensions::ExtensionDescriptor;
use crate::rpc::{ResourceUri, RpcValue};
use crate::{AppError, Result};

/// One-byte control signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HandshakeMessage {
    /// Guest connected and is waiting for its init payload.
    Ready,
    /// Guest processed the init payload.
    Initialized,
    /// Peer requests a graceful shutdown.
    Terminate,
}

impl HandshakeMessage {
    /// Wire code.
    #[must_use]
    pub const fn code(self) -> u8 {
        match self {
            Self::Ready => 1,
            Self::Initialized => 2,
            Self::Terminate => 3,
        }
    }

    /// Parse a control payload. `None` for anything that is not exactly one
    /// known byte.
    #[must_use]
    pub fn parse(payload: &[u8]) -> Option<Self> {
        match payload {
            [1] => Some(Self::Ready),
            [2] => Some(Self::Initialized),
            [3] => Some(Self::Terminate),
            _ => None,
        }
    }

    /// Whether `payload` has the shape of a control message (one byte).
    #[must_use]
    pub fn is_control(payload: &[u8]) -> bool {
        payload.len() == 1
    }

    /// Frame payload for this signal.
    #[must_use]
    pub fn to_bytes(self) -> Bytes {
        Bytes::copy_from_slice(&[self.code()])
    }
}

/// Host environment description.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnvironmentInfo {
    /// Host application name.
    pub app_name: String,
    /// Host bridge version.
    pub app_version: String,
    /// Log level the guest should use.
    pub log_level: String,
    /// Host operating system.
    pub os: String,
    /// Host CPU architecture.
    pub arch: String,
    /// When the host started the session.
    pub started_at: DateTime<Utc>,
}

/// Workspace identity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkspaceInfo {
    /// Display name.
    pub name: String,
    /// Root folder.
    pub root: ResourceUri,
}

/// Structured init payload sent in answer to `Ready`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitPayload {
    /// Session id for log correlation.
    pub session_id: String,
    /// Service catalog version the host speaks.
    pub catalog_version: u32,
    /// Host process id.
    pub parent_pid: u32,
    /// Host environment.
    pub environment: EnvironmentInfo,
    /// Workspace identity.
    pub workspace: WorkspaceInfo,
    /// Full extension catalog.
    pub extensions: Vec<ExtensionDescriptor>,
    /// Initial configuration snapshot.
    #[serde(default)]
    pub settings: RpcValue,
}

impl InitPayload {
    /// Serialise into a frame payload.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Protocol` if serialisation fails.
    pub fn encode(&self) -> Result<Bytes> {
        serde_json::to_vec(self)
            .map(Bytes::from)
            .map_err(|err| AppError::Protocol(format!("failed to encode init payload: {err}")))
    }

    /// Parse a frame payload.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Protocol` if the payload is not an init payload.
    pub fn decode(payload: &[u8]) -> Result<Self> {
        serde_json::from_slice(payload)
            .map_err(|err| AppError::Protocol(format!("invalid init payload: {err}")))
    }
}
