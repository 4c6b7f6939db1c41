//! `MainThreadExtensionService`: activation bookkeeping reported by the guest.

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use tokio::sync::watch;
use tracing::{info, warn};

use crate::rpc::{unknown_method, Args, LocalService, RpcValue, ServiceFuture, ServiceResult};
use crate::services::methods::main_extension as m;
use crate::services::MainService;

/// Activation state of one extension as last reported by the guest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ActivationStatus {
    /// `$onWillActivateExtension` received.
    Activating,
    /// `$onDidActivateExtension` received.
    Activated {
        /// Activation time reported by the guest.
        elapsed: Duration,
    },
    /// `$onExtensionActivationError` received.
    Failed {
        /// Failure description.
        message: String,
    },
}

impl ActivationStatus {
    /// Whether activation has finished, successfully or not.
    #[must_use]
    pub fn is_settled(&self) -> bool {
        !matches!(self, Self::Activating)
    }
}

/// Tracks activation notifications per extension id.
#[derive(Debug)]
pub struct ActivationTracker {
    statuses: Mutex<HashMap<String, ActivationStatus>>,
    changes: watch::Sender<u64>,
}

impl Default for ActivationTracker {
    fn default() -> Self {
        let (changes, _) = watch::channel(0);
        Self {
            statuses: Mutex::new(HashMap::new()),
            changes,
        }
    }
}

impl ActivationTracker {
    /// Last reported status of `id`.
    #[must_use]
    pub fn status(&self, id: &str) -> Option<ActivationStatus> {
        self.statuses
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(id)
            .cloned()
    }

    /// Copy of every known status.
    #[must_use]
    pub fn snapshot(&self) -> HashMap<String, ActivationStatus> {
        self.statuses
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Wait until `id` is activated or failed, or `timeout` elapses.
    pub async fn wait_settled(&self, id: &str, timeout: Duration) -> Option<ActivationStatus> {
        let mut changes = self.changes.subscribe();
        let settled = async {
            loop {
                if let Some(status) = self.status(id).filter(ActivationStatus::is_settled) {
                    return Some(status);
                }
                if changes.changed().await.is_err() {
                    return None;
                }
            }
        };
        tokio::time::timeout(timeout, settled).await.ok().flatten()
    }

    fn record(&self, id: &str, status: ActivationStatus) {
        self.statuses
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id.to_owned(), status);
        self.changes.send_modify(|generation| *generation += 1);
    }

    fn dispatch(&self, method: &str, args: &[RpcValue]) -> ServiceResult {
        let args = Args::new(method, args);
        let id = args.string(0, "id")?;
        match method {
            m::ON_WILL_ACTIVATE => {
                info!(extension = id, "extension activating");
                self.record(id, ActivationStatus::Activating);
            }
            m::ON_DID_ACTIVATE => {
                let elapsed_ms = u64::try_from(args.int(1, "elapsed_ms")?).unwrap_or(0);
                info!(extension = id, elapsed_ms, "extension activated");
                self.record(
                    id,
                    ActivationStatus::Activated {
                        elapsed: Duration::from_millis(elapsed_ms),
                    },
                );
            }
            _ => {
                let message = args.string(1, "message")?;
                warn!(extension = id, %message, "extension activation failed");
                self.record(
                    id,
                    ActivationStatus::Failed {
                        message: message.to_owned(),
                    },
                );
            }
        }
        Ok(RpcValue::Null)
    }
}

impl LocalService for ActivationTracker {
    fn invoke<'a>(&'a self, method: &'a str, args: Vec<RpcValue>) -> ServiceFuture<'a> {
        match method {
            m::ON_WILL_ACTIVATE | m::ON_DID_ACTIVATE | m::ON_ACTIVATION_ERROR => {
                Box::pin(async move { self.dispatch(method, &args) })
            }
            _ => unknown_method(MainService::ExtensionService.name(), method),
        }
    }
}
