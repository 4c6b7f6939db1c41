//! Guest-side service implementations used by the reference runtime.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, PoisonError, RwLock};

use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::errors::RemoteError;
use crate::extensions::ExtensionDescriptor;
use crate::rpc::{
    unknown_method, Args, LocalService, RemoteProxy, RpcProtocol, RpcValue, ServiceFuture,
    ServiceResult,
};
use crate::services::methods::{
    guest_commands, guest_configuration, guest_extension, log, main_commands, main_extension,
};
use crate::services::{GuestService, MainService};
use crate::Result;

/// Log target attached to records forwarded through `MainThreadLog`.
pub const GUEST_LOG_TARGET: &str = "exthost-guest";

/// Built-in commands contributed by the reference guest.
pub const BUILTIN_COMMANDS: [&str; 4] = [
    "exthost.ping",
    "exthost.echo",
    "exthost.activatedExtensions",
    "exthost.getConfiguration",
];

// ── Host stubs ───────────────────────────────────────────

/// Stubs for the main services the guest reports to.
#[derive(Debug, Clone)]
pub struct HostApi {
    log: RemoteProxy,
    extensions: RemoteProxy,
    commands: RemoteProxy,
}

impl HostApi {
    /// Stubs bound to a guest-side `rpc`.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Rpc` if `rpc` is a host-side endpoint.
    pub fn new(rpc: &RpcProtocol) -> Result<Self> {
        Ok(Self {
            log: rpc.get_remote(MainService::Log.address())?,
            extensions: rpc.get_remote(MainService::ExtensionService.address())?,
            commands: rpc.get_remote(MainService::Commands.address())?,
        })
    }

    /// Forward one log record to the host. Failures are only traced locally.
    pub async fn log(&self, level: &str, message: impl Into<String>) {
        let args = vec![
            level.into(),
            GUEST_LOG_TARGET.into(),
            RpcValue::String(message.into()),
        ];
        if let Err(err) = self.log.call(log::LOG, args).await {
            debug!(%err, "log forwarding failed");
        }
    }

    /// Announce a contributed command.
    ///
    /// # Errors
    ///
    /// Returns the remote error or `ConnectionClosed` on teardown.
    pub async fn register_command(&self, id: &str) -> Result<()> {
        self.commands
            .call(main_commands::REGISTER, vec![id.into()])
            .await
            .map(drop)
    }

    async fn notify(&self, method: &str, args: Vec<RpcValue>) {
        if let Err(err) = self.extensions.call(method, args).await {
            warn!(method, %err, "activation notification failed");
        }
    }
}

// ── ExtHostExtensionService ──────────────────────────────

/// Activates extensions from the catalog received in the init payload.
///
/// The reference runtime cannot execute extension code, so activating an
/// extension means checking that its entry module exists.
#[derive(Debug)]
pub struct GuestExtensionHost {
    host: HostApi,
    descriptors: HashMap<String, ExtensionDescriptor>,
    activated: Mutex<Vec<String>>,
}

impl GuestExtensionHost {
    /// Host over `descriptors`, reporting through `host`.
    #[must_use]
    pub fn new(host: HostApi, descriptors: Vec<ExtensionDescriptor>) -> Self {
        Self {
            host,
            descriptors: descriptors
                .into_iter()
                .map(|descriptor| (descriptor.id.clone(), descriptor))
                .collect(),
            activated: Mutex::new(Vec::new()),
        }
    }

    /// Ids activated so far, in activation order.
    pub async fn activated(&self) -> Vec<String> {
        self.activated.lock().await.clone()
    }

    /// Activate `id` after its dependencies.
    ///
    /// Returns `Ok(false)` when `id` is not in the catalog.
    ///
    /// # Errors
    ///
    /// Returns the failure description when `id` or one of its dependencies
    /// cannot be activated.
    pub async fn activate(&self, id: &str, reason: &str) -> std::result::Result<bool, String> {
        if !self.descriptors.contains_key(id) {
            warn!(extension = id, "activation requested for unknown extension");
            self.host
                .log("warn", format!("cannot activate unknown extension {id}"))
                .await;
            return Ok(false);
        }

        let order = match self.activation_order(id) {
            Ok(order) => order,
            Err(message) => {
                self.report_failure(id, &message).await;
                return Err(message);
            }
        };

        // Held for the whole sequence so concurrent requests for a shared
        // dependency activate it once.
        let mut activated = self.activated.lock().await;
        for descriptor in order {
            if activated.iter().any(|done| done == &descriptor.id) {
                continue;
            }
            if let Err(message) = self.activate_one(descriptor, reason).await {
                if descriptor.id != id {
                    self.report_failure(id, &format!("dependency {} failed", descriptor.id))
                        .await;
                }
                return Err(message);
            }
            activated.push(descriptor.id.clone());
        }
        Ok(true)
    }

    /// Forget every activation.
    pub async fn deactivate_all(&self) {
        let mut activated = self.activated.lock().await;
        info!(count = activated.len(), "deactivating all extensions");
        activated.clear();
    }

    /// Dependencies first, `id` last. Fails on missing dependencies and
    /// cycles.
    fn activation_order(&self, id: &str) -> std::result::Result<Vec<&ExtensionDescriptor>, String> {
        let mut order = Vec::new();
        let mut done = HashSet::new();
        let mut visiting = Vec::new();
        self.visit(id, &mut visiting, &mut done, &mut order)?;
        Ok(order)
    }

    fn visit<'a>(
        &'a self,
        id: &str,
        visiting: &mut Vec<String>,
        done: &mut HashSet<String>,
        order: &mut Vec<&'a ExtensionDescriptor>,
    ) -> std::result::Result<(), String> {
        if done.contains(id) {
            return Ok(());
        }
        if visiting.iter().any(|v| v == id) {
            return Err(format!(
                "dependency cycle: {} -> {id}",
                visiting.join(" -> ")
            ));
        }
        let descriptor = self.descriptors.get(id).ok_or_else(|| {
            format!(
                "missing dependency {id} of {}",
                visiting.last().map_or("<root>", String::as_str)
            )
        })?;

        visiting.push(id.to_owned());
        for dependency in &descriptor.dependencies {
            self.visit(dependency, visiting, done, order)?;
        }
        visiting.pop();

        done.insert(id.to_owned());
        order.push(descriptor);
        Ok(())
    }

    async fn activate_one(
        &self,
        descriptor: &ExtensionDescriptor,
        reason: &str,
    ) -> std::result::Result<(), String> {
        let id = descriptor.id.as_str();
        self.host
            .notify(main_extension::ON_WILL_ACTIVATE, vec![id.into()])
            .await;
        let started = Instant::now();

        if let Some(main) = &descriptor.main {
            let entry = descriptor.location.join(main);
            if tokio::fs::metadata(&entry).await.is_err() {
                let message = format!("entry module {} not found", entry.display());
                self.report_failure(id, &message).await;
                return Err(message);
            }
        }

        let elapsed_ms = i64::try_from(started.elapsed().as_millis()).unwrap_or(i64::MAX);
        self.host
            .notify(
                main_extension::ON_DID_ACTIVATE,
                vec![id.into(), RpcValue::Int(elapsed_ms)],
            )
            .await;
        info!(extension = id, reason, elapsed_ms, "extension activated");
        self.host
            .log("info", format!("activated {id} ({reason})"))
            .await;
        Ok(())
    }

    async fn report_failure(&self, id: &str, message: &str) {
        warn!(extension = id, message, "extension activation failed");
        self.host
            .notify(
                main_extension::ON_ACTIVATION_ERROR,
                vec![id.into(), message.into()],
            )
            .await;
        self.host
            .log("error", format!("activating {id} failed: {message}"))
            .await;
    }

    async fn dispatch(&self, method: &str, args: Vec<RpcValue>) -> ServiceResult {
        match method {
            guest_extension::ACTIVATE_BY_ID => {
                let reader = Args::new(method, &args);
                let id = reader.string(0, "id")?;
                let reason = reader.opt_string(1, "reason")?.unwrap_or("api");
                self.activate(id, reason)
                    .await
                    .map(RpcValue::Bool)
                    .map_err(RemoteError::handler)
            }
            guest_extension::DEACTIVATE_ALL => {
                self.deactivate_all().await;
                Ok(RpcValue::Null)
            }
            _ => Ok(RpcValue::from(self.activated().await)),
        }
    }
}

impl LocalService for GuestExtensionHost {
    fn invoke<'a>(&'a self, method: &'a str, args: Vec<RpcValue>) -> ServiceFuture<'a> {
        match method {
            guest_extension::ACTIVATE_BY_ID
            | guest_extension::DEACTIVATE_ALL
            | guest_extension::ACTIVATED => Box::pin(self.dispatch(method, args)),
            _ => unknown_method(GuestService::ExtensionService.name(), method),
        }
    }
}

// ── ExtHostConfiguration ─────────────────────────────────

/// Settings snapshot pushed by the host.
#[derive(Debug, Default)]
pub struct GuestConfiguration {
    settings: RwLock<RpcValue>,
}

impl GuestConfiguration {
    /// Store seeded with the init payload settings.
    #[must_use]
    pub fn new(settings: RpcValue) -> Self {
        Self {
            settings: RwLock::new(settings),
        }
    }

    /// Value at a dotted `key`, or the whole snapshot for `None`.
    #[must_use]
    pub fn section(&self, key: Option<&str>) -> RpcValue {
        let settings = self.settings.read().unwrap_or_else(PoisonError::into_inner);
        let Some(key) = key.filter(|k| !k.is_empty()) else {
            return settings.clone();
        };
        key.split('.')
            .try_fold(&*settings, |node, part| node.get(part))
            .cloned()
            .unwrap_or_default()
    }

    fn replace(&self, args: Vec<RpcValue>) -> ServiceResult {
        let next = args.into_iter().next().unwrap_or_default();
        if !next.is_null() && next.as_map().is_none() {
            return Err(RemoteError::invalid_args(format!(
                "{}: settings must be a map, got {}",
                guest_configuration::ACCEPT_CONFIGURATION_CHANGED,
                next.kind_name()
            )));
        }
        debug!("configuration snapshot replaced");
        *self.settings.write().unwrap_or_else(PoisonError::into_inner) = next;
        Ok(RpcValue::Null)
    }
}

impl LocalService for GuestConfiguration {
    fn invoke<'a>(&'a self, method: &'a str, args: Vec<RpcValue>) -> ServiceFuture<'a> {
        match method {
            guest_configuration::ACCEPT_CONFIGURATION_CHANGED => {
                Box::pin(async move { self.replace(args) })
            }
            _ => unknown_method(GuestService::Configuration.name(), method),
        }
    }
}

// ── ExtHostCommands ──────────────────────────────────────

/// Executes the built-in guest commands.
#[derive(Debug)]
pub struct GuestCommands {
    extensions: Arc<GuestExtensionHost>,
    configuration: Arc<GuestConfiguration>,
}

impl GuestCommands {
    /// Commands backed by the given services.
    #[must_use]
    pub fn new(extensions: Arc<GuestExtensionHost>, configuration: Arc<GuestConfiguration>) -> Self {
        Self {
            extensions,
            configuration,
        }
    }

    async fn execute(&self, id: &str, args: Vec<RpcValue>) -> ServiceResult {
        match id {
            "exthost.ping" => Ok("pong".into()),
            "exthost.echo" => Ok(RpcValue::List(args)),
            "exthost.activatedExtensions" => Ok(RpcValue::from(self.extensions.activated().await)),
            "exthost.getConfiguration" => {
                let key = Args::new(id, &args).opt_string(0, "section")?;
                Ok(self.configuration.section(key))
            }
            _ => Err(RemoteError::handler(format!("command '{id}' not found"))),
        }
    }

    async fn dispatch(&self, method: &str, args: Vec<RpcValue>) -> ServiceResult {
        if method == guest_commands::GET_CONTRIBUTED {
            return Ok(RpcValue::from(
                BUILTIN_COMMANDS.iter().map(|c| (*c).to_owned()).collect::<Vec<_>>(),
            ));
        }
        let reader = Args::new(method, &args);
        let id = reader.string(0, "id")?.to_owned();
        let call_args = reader.value(1).as_list().map(<[RpcValue]>::to_vec).unwrap_or_default();
        self.execute(&id, call_args).await
    }
}

impl LocalService for GuestCommands {
    fn invoke<'a>(&'a self, method: &'a str, args: Vec<RpcValue>) -> ServiceFuture<'a> {
        match method {
            guest_commands::EXECUTE_CONTRIBUTED | guest_commands::GET_CONTRIBUTED => {
                Box::pin(self.dispatch(method, args))
            }
            _ => unknown_method(GuestService::Commands.name(), method),
        }
    }
}
