//! Call bookkeeping and dispatch over one [`FramedSender`].
//!
//! The RPC layer does not own the read side of the channel: whoever drains
//! [`ChannelEvent::Message`](crate::protocol::ChannelEvent) events forwards
//! the payloads to [`RpcProtocol::handle_message`]. Incoming requests are
//! queued to a single dispatcher task that starts handlers in arrival order,
//! bounded by a semaphore, so a slow handler never stalls the read loop.

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::{Duration, Instant};

use futures_util::FutureExt;
use tokio::sync::{mpsc, oneshot, Semaphore};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, trace, warn};

use super::message::RpcMessage;
use super::proxy::{PendingReply, RemoteProxy};
use super::service::{LocalService, ServiceResult};
use super::value::RpcValue;
use crate::errors::{RemoteError, RemoteErrorKind};
use crate::protocol::FramedSender;
use crate::services::{Direction, ServiceAddress};
use crate::{AppError, Result};

/// Diagnostic view of one outstanding outgoing call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingCallInfo {
    /// Call id.
    pub call_id: u64,
    /// Target service name.
    pub service: &'static str,
    /// Method name.
    pub method: String,
    /// Time since the call was issued.
    pub age: Duration,
}

struct PendingCall {
    service: &'static str,
    method: String,
    created_at: Instant,
    reply: oneshot::Sender<Result<RpcValue>>,
}

#[derive(Default)]
struct CallTable {
    next_id: u64,
    disposed: bool,
    pending: HashMap<u64, PendingCall>,
}

struct Dispatch {
    id: u64,
    service_name: &'static str,
    method: String,
    args: Vec<RpcValue>,
    service: Arc<dyn LocalService>,
}

struct Inner {
    local_side: Direction,
    sender: FramedSender,
    bindings: RwLock<HashMap<&'static str, Arc<dyn LocalService>>>,
    sealed: AtomicBool,
    calls: Mutex<CallTable>,
    dispatch: mpsc::UnboundedSender<Dispatch>,
    tasks: TaskTracker,
    cancel: CancellationToken,
}

/// RPC endpoint for one side of a connection.
///
/// Cheap to clone; all clones share bindings and the pending-call table.
#[derive(Clone)]
pub struct RpcProtocol {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for RpcProtocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RpcProtocol")
            .field("local_side", &self.inner.local_side)
            .field("pending", &self.pending_count())
            .field("disposed", &self.is_disposed())
            .finish_non_exhaustive()
    }
}

impl RpcProtocol {
    /// Create an endpoint that implements `local_side` services and sends
    /// through `sender`. At most `max_concurrent_dispatch` incoming calls run
    /// at once.
    ///
    /// Must be called from within a tokio runtime.
    #[must_use]
    pub fn new(local_side: Direction, sender: FramedSender, max_concurrent_dispatch: usize) -> Self {
        let (dispatch, dispatch_rx) = mpsc::unbounded_channel();
        let tasks = TaskTracker::new();
        let cancel = CancellationToken::new();

        tasks.spawn(run_dispatcher(
            dispatch_rx,
            Arc::new(Semaphore::new(max_concurrent_dispatch.max(1))),
            sender.clone(),
            cancel.clone(),
            tasks.clone(),
        ));

        Self {
            inner: Arc::new(Inner {
                local_side,
                sender,
                bindings: RwLock::new(HashMap::new()),
                sealed: AtomicBool::new(false),
                calls: Mutex::new(CallTable {
                    next_id: 1,
                    ..CallTable::default()
                }),
                dispatch,
                tasks,
                cancel,
            }),
        }
    }

    /// Side whose services this endpoint implements.
    #[must_use]
    pub fn local_side(&self) -> Direction {
        self.inner.local_side
    }

    /// Bind the implementation of `address`.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Rpc` if the address belongs to the other side, is
    /// already bound, or the bindings have been sealed.
    pub fn register_local(
        &self,
        address: ServiceAddress,
        service: Arc<dyn LocalService>,
    ) -> Result<()> {
        if address.direction() != self.inner.local_side {
            return Err(AppError::Rpc(format!(
                "{address} cannot be bound on the {} side",
                self.inner.local_side
            )));
        }
        if self.inner.sealed.load(Ordering::Acquire) {
            return Err(AppError::Rpc(format!(
                "cannot bind {address}: bindings are sealed"
            )));
        }

        let mut bindings = self
            .inner
            .bindings
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        if bindings.contains_key(address.name()) {
            return Err(AppError::Rpc(format!("{address} is already bound")));
        }
        bindings.insert(address.name(), service);
        debug!(service = address.name(), "local service bound");
        Ok(())
    }

    /// Freeze the bindings; later [`register_local`](Self::register_local)
    /// calls fail.
    pub fn seal(&self) {
        self.inner.sealed.store(true, Ordering::Release);
    }

    /// Whether `address` has a local implementation.
    #[must_use]
    pub fn is_bound(&self, address: ServiceAddress) -> bool {
        self.inner
            .bindings
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(address.name())
    }

    /// Call stub for a service implemented by the peer.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Rpc` if `address` is implemented on this side.
    pub fn get_remote(&self, address: ServiceAddress) -> Result<RemoteProxy> {
        if address.direction() == self.inner.local_side {
            return Err(AppError::Rpc(format!(
                "{address} is implemented locally, not by the peer"
            )));
        }
        Ok(RemoteProxy::new(self.clone(), address))
    }

    /// Issue one call. Never blocks; failures surface through the handle.
    pub(crate) fn call(
        &self,
        address: ServiceAddress,
        method: &str,
        args: Vec<RpcValue>,
    ) -> PendingReply {
        let (reply, rx) = oneshot::channel();

        let id = {
            let mut calls = self
                .inner
                .calls
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            if calls.disposed {
                return PendingReply::failed(AppError::Disposed(format!(
                    "rpc layer disposed; {}.{method} not sent",
                    address.name()
                )));
            }
            let id = calls.next_id;
            calls.next_id += 1;
            calls.pending.insert(
                id,
                PendingCall {
                    service: address.name(),
                    method: method.to_owned(),
                    created_at: Instant::now(),
                    reply,
                },
            );
            id
        };

        let message = RpcMessage::Request {
            id,
            service: address.name().to_owned(),
            method: method.to_owned(),
            args,
        };
        let sent = message.encode().and_then(|payload| self.inner.sender.send(payload));
        if let Err(err) = sent {
            debug!(call_id = id, service = address.name(), method, %err, "rpc request not sent");
            self.complete(id, Err(err));
        } else {
            trace!(call_id = id, service = address.name(), method, "rpc request sent");
        }

        PendingReply::new(id, rx)
    }

    /// Route one incoming regular-frame payload.
    ///
    /// Malformed payloads and unmatched replies are logged and discarded.
    pub fn handle_message(&self, payload: &[u8]) {
        match RpcMessage::decode(payload) {
            Ok(RpcMessage::Request {
                id,
                service,
                method,
                args,
            }) => self.accept_request(id, &service, method, args),
            Ok(RpcMessage::Reply { id, value }) => {
                if !self.complete(id, Ok(value)) {
                    warn!(call_id = id, "discarding reply for unknown call");
                }
            }
            Ok(RpcMessage::ReplyErr { id, error }) => {
                if !self.complete(id, Err(AppError::Remote(error))) {
                    warn!(call_id = id, "discarding error reply for unknown call");
                }
            }
            Err(err) => warn!(len = payload.len(), %err, "discarding rpc payload"),
        }
    }

    /// Number of outgoing calls awaiting a reply.
    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.inner
            .calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pending
            .len()
    }

    /// Outstanding outgoing calls ordered by call id.
    #[must_use]
    pub fn pending_calls(&self) -> Vec<PendingCallInfo> {
        let now = Instant::now();
        let calls = self
            .inner
            .calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let mut infos: Vec<PendingCallInfo> = calls
            .pending
            .iter()
            .map(|(id, call)| PendingCallInfo {
                call_id: *id,
                service: call.service,
                method: call.method.clone(),
                age: now.saturating_duration_since(call.created_at),
            })
            .collect();
        infos.sort_by_key(|info| info.call_id);
        infos
    }

    /// Whether [`dispose`](Self::dispose) has run.
    #[must_use]
    pub fn is_disposed(&self) -> bool {
        self.inner
            .calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .disposed
    }

    /// Fail every pending call with `ConnectionClosed` and stop dispatching.
    ///
    /// Synchronous and idempotent. Handlers still running are cancelled and
    /// their replies are never sent.
    pub fn dispose(&self) {
        let drained: Vec<(u64, PendingCall)> = {
            let mut calls = self
                .inner
                .calls
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            if calls.disposed {
                return;
            }
            calls.disposed = true;
            calls.pending.drain().collect()
        };

        let failed = drained.len();
        for (id, call) in drained {
            let err = AppError::ConnectionClosed(format!(
                "call {id} to {}.{} aborted by teardown",
                call.service, call.method
            ));
            let _ = call.reply.send(Err(err));
        }

        self.inner.cancel.cancel();
        self.inner.tasks.close();
        debug!(failed, "rpc layer disposed");
    }

    /// Wait for dispatch tasks to stop after [`dispose`](Self::dispose).
    pub async fn wait_stopped(&self, timeout: Duration) -> bool {
        tokio::time::timeout(timeout, self.inner.tasks.wait())
            .await
            .is_ok()
    }

    fn complete(&self, id: u64, outcome: Result<RpcValue>) -> bool {
        let call = self
            .inner
            .calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pending
            .remove(&id);
        match call {
            Some(call) => {
                trace!(call_id = id, service = call.service, method = %call.method, "rpc call resolved");
                // The caller may have dropped its handle.
                let _ = call.reply.send(outcome);
                true
            }
            None => false,
        }
    }

    fn accept_request(&self, id: u64, service: &str, method: String, args: Vec<RpcValue>) {
        if self.inner.cancel.is_cancelled() {
            debug!(call_id = id, service, method = %method, "request ignored after dispose");
            return;
        }

        let binding = match ServiceAddress::lookup(service) {
            Some(address) if address.direction() == self.inner.local_side => self
                .inner
                .bindings
                .read()
                .unwrap_or_else(PoisonError::into_inner)
                .get(address.name())
                .map(|svc| (address.name(), Arc::clone(svc))),
            _ => None,
        };

        let Some((service_name, service_impl)) = binding else {
            warn!(call_id = id, service, method = %method, "request for unknown service");
            send_reply(
                &self.inner.sender,
                id,
                Err(RemoteError::new(
                    RemoteErrorKind::UnknownService,
                    format!("no {} service named '{service}'", self.inner.local_side),
                )),
            );
            return;
        };

        let job = Dispatch {
            id,
            service_name,
            method,
            args,
            service: service_impl,
        };
        if self.inner.dispatch.send(job).is_err() {
            debug!(call_id = id, "dispatcher stopped; request dropped");
        }
    }
}

async fn run_dispatcher(
    mut queue: mpsc::UnboundedReceiver<Dispatch>,
    limit: Arc<Semaphore>,
    sender: FramedSender,
    cancel: CancellationToken,
    tasks: TaskTracker,
) {
    loop {
        let job = tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            job = queue.recv() => match job {
                Some(job) => job,
                None => break,
            },
        };

        let permit = tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            permit = Arc::clone(&limit).acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => break,
            },
        };

        let sender = sender.clone();
        let cancel = cancel.clone();
        tasks.spawn(async move {
            let _permit = permit;
            let Dispatch {
                id,
                service_name,
                method,
                args,
                service,
            } = job;

            let invocation = AssertUnwindSafe(service.invoke(&method, args)).catch_unwind();
            let outcome = tokio::select! {
                biased;
                () = cancel.cancelled() => return,
                outcome = invocation => outcome.unwrap_or_else(|_| {
                    Err(RemoteError::handler(format!("{service_name}.{method} panicked")))
                }),
            };

            if let Err(err) = &outcome {
                debug!(call_id = id, service = service_name, method = %method, %err, "handler failed");
            }
            send_reply(&sender, id, outcome);
        });
    }
    trace!("rpc dispatcher stopped");
}

fn send_reply(sender: &FramedSender, id: u64, outcome: ServiceResult) {
    let message = match outcome {
        Ok(value) => RpcMessage::Reply { id, value },
        Err(error) => RpcMessage::ReplyErr { id, error },
    };
    if let Err(err) = message.encode().and_then(|payload| sender.send(payload)) {
        debug!(call_id = id, %err, "rpc reply not sent");
    }
}
