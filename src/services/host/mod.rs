//! Host implementations of every [`MainService`].

pub mod activation;
pub mod commands;
pub mod configuration;
pub mod fs;
pub mod log;
pub mod messages;

use std::path::PathBuf;
use std::sync::Arc;

pub use activation::{ActivationStatus, ActivationTracker};
pub use commands::{CommandHandler, CommandRegistry};
pub use configuration::ConfigurationStore;
pub use fs::{workspace_path, WorkspaceFileSystem};
pub use log::GuestLogService;
pub use messages::{GuestMessage, MessageSink, Severity};

use super::MainService;
use crate::config::GlobalConfig;
use crate::rpc::{LocalService, RpcProtocol};
use crate::Result;

/// One instance of every host service, shared with the product layer.
#[derive(Debug, Clone)]
pub struct HostServices {
    log: Arc<GuestLogService>,
    activations: Arc<ActivationTracker>,
    commands: Arc<CommandRegistry>,
    messages: Arc<MessageSink>,
    configuration: Arc<ConfigurationStore>,
    file_system: Arc<WorkspaceFileSystem>,
}

impl HostServices {
    /// Services for a workspace rooted at `workspace_root` serving `settings`.
    #[must_use]
    pub fn new(workspace_root: PathBuf, settings: toml::Table) -> Self {
        Self {
            log: Arc::new(GuestLogService),
            activations: Arc::new(ActivationTracker::default()),
            commands: Arc::new(CommandRegistry::default()),
            messages: Arc::new(MessageSink::default()),
            configuration: Arc::new(ConfigurationStore::new(settings)),
            file_system: Arc::new(WorkspaceFileSystem::new(workspace_root)),
        }
    }

    /// Services configured from `config`.
    #[must_use]
    pub fn from_config(config: &GlobalConfig) -> Self {
        Self::new(config.workspace_root.clone(), config.settings.clone())
    }

    /// Implementation bound for `service`.
    #[must_use]
    pub fn binding_for(&self, service: MainService) -> Arc<dyn LocalService> {
        match service {
            MainService::Log => Arc::clone(&self.log) as Arc<dyn LocalService>,
            MainService::ExtensionService => Arc::clone(&self.activations) as Arc<dyn LocalService>,
            MainService::Commands => Arc::clone(&self.commands) as Arc<dyn LocalService>,
            MainService::MessageService => Arc::clone(&self.messages) as Arc<dyn LocalService>,
            MainService::Configuration => Arc::clone(&self.configuration) as Arc<dyn LocalService>,
            MainService::FileSystem => Arc::clone(&self.file_system) as Arc<dyn LocalService>,
        }
    }

    /// Bind every host service into `rpc` and seal it.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Rpc` if `rpc` is not a host-side endpoint or a
    /// service is already bound.
    pub fn register_all(&self, rpc: &RpcProtocol) -> Result<()> {
        for service in MainService::ALL {
            rpc.register_local(service.address(), self.binding_for(service))?;
        }
        rpc.seal();
        Ok(())
    }

    /// Activation notifications reported by the guest.
    #[must_use]
    pub fn activations(&self) -> &ActivationTracker {
        &self.activations
    }

    /// Command registry.
    #[must_use]
    pub fn commands(&self) -> &CommandRegistry {
        &self.commands
    }

    /// Messages shown by the guest.
    #[must_use]
    pub fn messages(&self) -> &MessageSink {
        &self.messages
    }

    /// Settings served to the guest.
    #[must_use]
    pub fn configuration(&self) -> &ConfigurationStore {
        &self.configuration
    }

    /// Workspace file system.
    #[must_use]
    pub fn file_system(&self) -> &WorkspaceFileSystem {
        &self.file_system
    }
}
