//! RPC envelope carried inside one regular frame.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use super::value::RpcValue;
use crate::errors::RemoteError;
use crate::{AppError, Result};

/// One RPC message.
///
/// ```json
/// {"type":"request","id":7,"service":"ExtHostExtensionService","method":"$activateById","args":[...]}
/// {"type":"reply","id":7,"value":{"$t":"null"}}
/// {"type":"reply_err","id":7,"error":{"kind":"handler","message":"..."}}
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RpcMessage {
    /// Call a method on a named service.
    Request {
        /// Call id, unique per connection and direction.
        id: u64,
        /// Target service name.
        service: String,
        /// Method name.
        method: String,
        /// Positional arguments.
        args: Vec<RpcValue>,
    },
    /// Successful completion of a request.
    Reply {
        /// Id of the originating request.
        id: u64,
        /// Result value.
        value: RpcValue,
    },
    /// Failed completion of a request.
    ReplyErr {
        /// Id of the originating request.
        id: u64,
        /// Structured failure.
        error: RemoteError,
    },
}

impl RpcMessage {
    /// Serialise to a frame payload.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Rpc` if serialisation fails.
    pub fn encode(&self) -> Result<Bytes> {
        serde_json::to_vec(self)
            .map(Bytes::from)
            .map_err(|err| AppError::Rpc(format!("failed to encode rpc message: {err}")))
    }

    /// Parse a frame payload.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Protocol` if the payload is not a valid message.
    pub fn decode(payload: &[u8]) -> Result<Self> {
        serde_json::from_slice(payload)
            .map_err(|err| AppError::Protocol(format!("malformed rpc message: {err}")))
    }

    /// Call id this message refers to.
    #[must_use]
    pub fn id(&self) -> u64 {
        match self {
            Self::Request { id, .. } | Self::Reply { id, .. } | Self::ReplyErr { id, .. } => *id,
        }
    }
}
