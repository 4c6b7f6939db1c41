//! Remote-call stubs and their result handles.

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::sync::oneshot;

use super::protocol::RpcProtocol;
use super::value::RpcValue;
use crate::services::ServiceAddress;
use crate::{AppError, Result};

/// Future resolving to the reply of one outgoing call.
///
/// Resolves exactly once: with the reply value, the remote error, or
/// `ConnectionClosed` when the RPC layer is torn down first. Dropping the
/// handle does not cancel the call.
#[derive(Debug)]
#[must_use = "a pending reply does nothing unless awaited"]
pub struct PendingReply {
    call_id: Option<u64>,
    state: ReplyState,
}

#[derive(Debug)]
enum ReplyState {
    Waiting(oneshot::Receiver<Result<RpcValue>>),
    Failed(Option<AppError>),
}

impl PendingReply {
    pub(crate) fn new(call_id: u64, rx: oneshot::Receiver<Result<RpcValue>>) -> Self {
        Self {
            call_id: Some(call_id),
            state: ReplyState::Waiting(rx),
        }
    }

    pub(crate) fn failed(err: AppError) -> Self {
        Self {
            call_id: None,
            state: ReplyState::Failed(Some(err)),
        }
    }

    /// Id assigned to the call, `None` if it was never issued.
    #[must_use]
    pub fn call_id(&self) -> Option<u64> {
        self.call_id
    }
}

impl Future for PendingReply {
    type Output = Result<RpcValue>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match &mut self.state {
            ReplyState::Waiting(rx) => Pin::new(rx).poll(cx).map(|received| {
                received.unwrap_or_else(|_| {
                    Err(AppError::ConnectionClosed("reply channel dropped".into()))
                })
            }),
            ReplyState::Failed(err) => Poll::Ready(Err(err
                .take()
                .unwrap_or_else(|| AppError::Rpc("pending reply polled after completion".into())))),
        }
    }
}

/// Call stub for one service implemented by the peer.
///
/// Calls issued through the same stub are sent in issue order; replies may
/// complete in any order.
#[derive(Debug, Clone)]
pub struct RemoteProxy {
    rpc: RpcProtocol,
    address: ServiceAddress,
}

impl RemoteProxy {
    pub(crate) fn new(rpc: RpcProtocol, address: ServiceAddress) -> Self {
        Self { rpc, address }
    }

    /// Address this stub calls.
    #[must_use]
    pub fn address(&self) -> ServiceAddress {
        self.address
    }

    /// Issue `method(args)` and return its reply handle immediately.
    pub fn call(&self, method: &str, args: Vec<RpcValue>) -> PendingReply {
        self.rpc.call(self.address, method, args)
    }
}
