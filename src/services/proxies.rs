//! Typed stubs for the guest services, used by host code.

use crate::rpc::{RemoteProxy, RpcProtocol, RpcValue};
use crate::services::methods::{guest_commands, guest_configuration, guest_extension};
use crate::services::GuestService;
use crate::{AppError, Result};

/// `ExtHostExtensionService` stub.
#[derive(Debug, Clone)]
pub struct ExtensionServiceProxy {
    remote: RemoteProxy,
}

impl ExtensionServiceProxy {
    /// Stub bound to `rpc`.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Rpc` if `rpc` is a guest-side endpoint.
    pub fn new(rpc: &RpcProtocol) -> Result<Self> {
        Ok(Self {
            remote: rpc.get_remote(GuestService::ExtensionService.address())?,
        })
    }

    /// Activate `id` (and its dependencies). Returns whether the guest
    /// knows the extension.
    ///
    /// # Errors
    ///
    /// Returns the remote error if activation failed, or
    /// `ConnectionClosed` on teardown.
    pub async fn activate_by_id(&self, id: &str, reason: &str) -> Result<bool> {
        let value = self
            .remote
            .call(guest_extension::ACTIVATE_BY_ID, vec![id.into(), reason.into()])
            .await?;
        value
            .as_bool()
            .ok_or_else(|| unexpected(guest_extension::ACTIVATE_BY_ID, &value))
    }

    /// Deactivate every active extension.
    ///
    /// # Errors
    ///
    /// Returns the remote error or `ConnectionClosed` on teardown.
    pub async fn deactivate_all(&self) -> Result<()> {
        self.remote
            .call(guest_extension::DEACTIVATE_ALL, Vec::new())
            .await
            .map(drop)
    }

    /// Ids of the extensions currently active in the guest.
    ///
    /// # Errors
    ///
    /// Returns the remote error or `ConnectionClosed` on teardown.
    pub async fn activated_extensions(&self) -> Result<Vec<String>> {
        let value = self
            .remote
            .call(guest_extension::ACTIVATED, Vec::new())
            .await?;
        string_list(guest_extension::ACTIVATED, &value)
    }
}

/// `ExtHostCommands` stub.
#[derive(Debug, Clone)]
pub struct CommandsProxy {
    remote: RemoteProxy,
}

impl CommandsProxy {
    /// Stub bound to `rpc`.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Rpc` if `rpc` is a guest-side endpoint.
    pub fn new(rpc: &RpcProtocol) -> Result<Self> {
        Ok(Self {
            remote: rpc.get_remote(GuestService::Commands.address())?,
        })
    }

    /// Execute a command contributed by a guest extension.
    ///
    /// # Errors
    ///
    /// Returns the remote error or `ConnectionClosed` on teardown.
    pub async fn execute_contributed_command(
        &self,
        id: &str,
        args: Vec<RpcValue>,
    ) -> Result<RpcValue> {
        self.remote
            .call(
                guest_commands::EXECUTE_CONTRIBUTED,
                vec![id.into(), RpcValue::List(args)],
            )
            .await
    }

    /// Command ids contributed by the guest.
    ///
    /// # Errors
    ///
    /// Returns the remote error or `ConnectionClosed` on teardown.
    pub async fn contributed_commands(&self) -> Result<Vec<String>> {
        let value = self
            .remote
            .call(guest_commands::GET_CONTRIBUTED, Vec::new())
            .await?;
        string_list(guest_commands::GET_CONTRIBUTED, &value)
    }
}

/// `ExtHostConfiguration` stub.
#[derive(Debug, Clone)]
pub struct ConfigurationProxy {
    remote: RemoteProxy,
}

impl ConfigurationProxy {
    /// Stub bound to `rpc`.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Rpc` if `rpc` is a guest-side endpoint.
    pub fn new(rpc: &RpcProtocol) -> Result<Self> {
        Ok(Self {
            remote: rpc.get_remote(GuestService::Configuration.address())?,
        })
    }

    /// Push a new settings snapshot to the guest.
    ///
    /// # Errors
    ///
    /// Returns the remote error or `ConnectionClosed` on teardown.
    pub async fn accept_configuration_changed(&self, settings: RpcValue) -> Result<()> {
        self.remote
            .call(guest_configuration::ACCEPT_CONFIGURATION_CHANGED, vec![settings])
            .await
            .map(drop)
    }
}

fn string_list(method: &str, value: &RpcValue) -> Result<Vec<String>> {
    value
        .as_list()
        .and_then(|items| {
            items
                .iter()
                .map(|item| item.as_str().map(str::to_owned))
                .collect::<Option<Vec<_>>>()
        })
        .ok_or_else(|| unexpected(method, value))
}

fn unexpected(method: &str, value: &RpcValue) -> AppError {
    AppError::Rpc(format!(
        "{method} returned an unexpected {} value",
        value.kind_name()
    ))
}
