//! RPC layer: named-service calls between host and guest.
//!
//! Submodules:
//! - `value` / `uri`: the value model carried in arguments and results.
//! - `message`: JSON envelope for requests and replies.
//! - `service`: the [`LocalService`] trait implemented by bound services.
//! - `protocol`: [`RpcProtocol`], the pending-call table and dispatcher.
//! - `proxy`: [`RemoteProxy`] stubs and [`PendingReply`] handles.

pub mod message;
pub mod protocol;
pub mod proxy;
pub mod service;
pub mod uri;
pub mod value;

pub use message::RpcMessage;
pub use protocol::{PendingCallInfo, RpcProtocol};
pub use proxy::{PendingReply, RemoteProxy};
pub use service::{unknown_method, LocalService, ServiceFuture, ServiceResult};
pub use uri::ResourceUri;
pub use value::{Args, RpcValue};
