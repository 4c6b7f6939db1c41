//! `MainThreadCommands`: host command registry.

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex, PoisonError};

use tracing::debug;

use crate::errors::RemoteError;
use crate::rpc::{unknown_method, Args, LocalService, RpcValue, ServiceFuture, ServiceResult};
use crate::services::methods::main_commands as m;
use crate::services::MainService;

/// Host-side command implementation.
pub type CommandHandler = Arc<dyn Fn(Vec<RpcValue>) -> ServiceResult + Send + Sync>;

/// Commands provided by the host plus the ids the guest has announced.
#[derive(Default)]
pub struct CommandRegistry {
    host: Mutex<HashMap<String, CommandHandler>>,
    guest: Mutex<BTreeSet<String>>,
}

impl std::fmt::Debug for CommandRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandRegistry")
            .field("guest", &self.guest_commands())
            .finish_non_exhaustive()
    }
}

impl CommandRegistry {
    /// Register a command implemented by the host.
    pub fn register_host_command(&self, id: impl Into<String>, handler: CommandHandler) {
        self.host
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id.into(), handler);
    }

    /// Command ids announced by the guest, sorted.
    #[must_use]
    pub fn guest_commands(&self) -> Vec<String> {
        self.guest
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .cloned()
            .collect()
    }

    /// Every known command id, host and guest, sorted and deduplicated.
    #[must_use]
    pub fn all_commands(&self) -> Vec<String> {
        let mut ids: BTreeSet<String> = self
            .guest
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        ids.extend(
            self.host
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .keys()
                .cloned(),
        );
        ids.into_iter().collect()
    }

    fn execute(&self, id: &str, args: Vec<RpcValue>) -> ServiceResult {
        let handler = self
            .host
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(id)
            .cloned();
        match handler {
            Some(handler) => handler(args),
            None if self.is_guest_command(id) => Err(RemoteError::handler(format!(
                "command '{id}' is contributed by the guest"
            ))),
            None => Err(RemoteError::handler(format!("command '{id}' not found"))),
        }
    }

    fn is_guest_command(&self, id: &str) -> bool {
        self.guest
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(id)
    }

    fn dispatch(&self, method: &str, args: Vec<RpcValue>) -> ServiceResult {
        match method {
            m::REGISTER => {
                let id = Args::new(method, &args).string(0, "id")?.to_owned();
                debug!(command = %id, "guest command registered");
                self.guest
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .insert(id);
                Ok(RpcValue::Null)
            }
            m::UNREGISTER => {
                let id = Args::new(method, &args).string(0, "id")?;
                debug!(command = id, "guest command unregistered");
                self.guest
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .remove(id);
                Ok(RpcValue::Null)
            }
            m::EXECUTE => {
                let reader = Args::new(method, &args);
                let id = reader.string(0, "id")?.to_owned();
                let call_args = reader.value(1).as_list().map(<[RpcValue]>::to_vec).unwrap_or_default();
                self.execute(&id, call_args)
            }
            _ => Ok(RpcValue::from(self.all_commands())),
        }
    }
}

impl LocalService for CommandRegistry {
    fn invoke<'a>(&'a self, method: &'a str, args: Vec<RpcValue>) -> ServiceFuture<'a> {
        match method {
            m::REGISTER | m::UNREGISTER | m::EXECUTE | m::GET_COMMANDS => {
                Box::pin(async move { self.dispatch(method, args) })
            }
            _ => unknown_method(MainService::Commands.name(), method),
        }
    }
}
