//! Global configuration parsing and validation.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::extensions::DescriptorOverride;
use crate::{AppError, Result};

/// Guest runtime location and launch settings.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct RuntimeConfig {
    /// Executable name looked up on `PATH` when no bundled copy exists.
    pub executable: String,
    /// Bundled runtime binary; preferred over the system lookup when present.
    #[serde(default)]
    pub bundled_path: Option<PathBuf>,
    /// Minimum accepted runtime version (`major.minor[.patch]`).
    #[serde(default)]
    pub min_version: Option<String>,
    /// Arguments placed before the entry module.
    #[serde(default)]
    pub args: Vec<String>,
    /// Guest entry module handed to the runtime as its last argument.
    #[serde(default)]
    pub entry: Option<PathBuf>,
    /// Arguments used to probe the runtime version.
    #[serde(default = "default_version_args")]
    pub version_args: Vec<String>,
}

fn default_version_args() -> Vec<String> {
    vec!["--version".into()]
}

/// Transport selection.
#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum TransportMode {
    /// Platform default (local socket / named pipe).
    #[default]
    Auto,
    /// Loopback TCP on an ephemeral port.
    Tcp,
    /// Unix domain socket or Windows named pipe.
    Pipe,
}

/// Transport configuration.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub struct TransportConfig {
    /// Listener kind used when spawning a guest.
    #[serde(default)]
    pub mode: TransportMode,
    /// Debug mode host; together with `debug_port` bypasses process spawning.
    #[serde(default)]
    pub debug_host: Option<String>,
    /// Debug mode port.
    #[serde(default)]
    pub debug_port: Option<u16>,
}

/// Framing protocol timing and limits.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct ProtocolConfig {
    /// Idle period after which a keep-alive frame is emitted.
    #[serde(default = "default_keepalive_ms")]
    pub keepalive_interval_ms: u64,
    /// Silence window after which the peer is reported unresponsive.
    #[serde(default = "default_unresponsive_ms")]
    pub unresponsive_after_ms: u64,
    /// Delay before a standalone acknowledgement is sent.
    #[serde(default = "default_ack_delay_ms")]
    pub ack_delay_ms: u64,
    /// Largest accepted frame payload.
    #[serde(default = "default_max_frame_bytes")]
    pub max_frame_bytes: usize,
}

fn default_keepalive_ms() -> u64 {
    5_000
}

fn default_unresponsive_ms() -> u64 {
    20_000
}

fn default_ack_delay_ms() -> u64 {
    2_000
}

fn default_max_frame_bytes() -> usize {
    4 * 1_048_576
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        Self {
            keepalive_interval_ms: default_keepalive_ms(),
            unresponsive_after_ms: default_unresponsive_ms(),
            ack_delay_ms: default_ack_delay_ms(),
            max_frame_bytes: default_max_frame_bytes(),
        }
    }
}

/// Bounded waits used by the supervisor and the handshake.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct TimeoutConfig {
    /// How long the guest has to connect back after launch.
    #[serde(default = "default_handshake_seconds")]
    pub connect_seconds: u64,
    /// How long the guest has to send `Ready` once connected.
    #[serde(default = "default_handshake_seconds")]
    pub ready_seconds: u64,
    /// How long the guest has to send `Initialized` after the init payload.
    #[serde(default = "default_handshake_seconds")]
    pub initialized_seconds: u64,
    /// Grace period between the termination request and a forced kill.
    #[serde(default = "default_stop_grace_ms")]
    pub stop_grace_ms: u64,
    /// Upper bound for the runtime `--version` probe.
    #[serde(default = "default_version_probe_seconds")]
    pub version_probe_seconds: u64,
}

fn default_handshake_seconds() -> u64 {
    10
}

fn default_stop_grace_ms() -> u64 {
    2_000
}

fn default_version_probe_seconds() -> u64 {
    5
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            connect_seconds: default_handshake_seconds(),
            ready_seconds: default_handshake_seconds(),
            initialized_seconds: default_handshake_seconds(),
            stop_grace_ms: default_stop_grace_ms(),
            version_probe_seconds: default_version_probe_seconds(),
        }
    }
}

impl TimeoutConfig {
    /// Connect-back window.
    #[must_use]
    pub fn connect(&self) -> Duration {
        Duration::from_secs(self.connect_seconds)
    }

    /// `Ready` window.
    #[must_use]
    pub fn ready(&self) -> Duration {
        Duration::from_secs(self.ready_seconds)
    }

    /// `Initialized` window.
    #[must_use]
    pub fn initialized(&self) -> Duration {
        Duration::from_secs(self.initialized_seconds)
    }

    /// Graceful stop window.
    #[must_use]
    pub fn stop_grace(&self) -> Duration {
        Duration::from_millis(self.stop_grace_ms)
    }

    /// Version probe window.
    #[must_use]
    pub fn version_probe(&self) -> Duration {
        Duration::from_secs(self.version_probe_seconds)
    }
}

/// Outbound proxy overrides forwarded to the guest.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub struct ProxyConfig {
    /// Proxy for plain HTTP traffic.
    #[serde(default)]
    pub http: Option<String>,
    /// Proxy for HTTPS traffic.
    #[serde(default)]
    pub https: Option<String>,
    /// Hosts that bypass the proxy.
    #[serde(default)]
    pub no_proxy: Option<String>,
}

/// RPC dispatch limits.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct RpcConfig {
    /// Maximum number of incoming calls executing at once.
    #[serde(default = "default_max_concurrent_dispatch")]
    pub max_concurrent_dispatch: usize,
}

fn default_max_concurrent_dispatch() -> usize {
    64
}

impl Default for RpcConfig {
    fn default() -> Self {
        Self {
            max_concurrent_dispatch: default_max_concurrent_dispatch(),
        }
    }
}

fn default_app_name() -> String {
    "exthost".into()
}

fn default_log_level() -> String {
    "info".into()
}

/// Global configuration parsed from `config.toml`.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub struct GlobalConfig {
    /// Workspace folder the session is bound to.
    pub workspace_root: PathBuf,
    /// Display name of the workspace; defaults to the folder name.
    #[serde(default)]
    pub workspace_name: Option<String>,
    /// Host application name reported to the guest.
    #[serde(default = "default_app_name")]
    pub app_name: String,
    /// Log level forwarded to the guest.
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Directories whose children hold extension manifests.
    #[serde(default)]
    pub extension_dirs: Vec<PathBuf>,
    /// Guest modules activated as soon as the session is active.
    #[serde(default)]
    pub activate: Vec<String>,
    /// Guest runtime settings.
    pub runtime: RuntimeConfig,
    /// Transport settings.
    #[serde(default)]
    pub transport: TransportConfig,
    /// Framing protocol settings.
    #[serde(default)]
    pub protocol: ProtocolConfig,
    /// Timeout settings.
    #[serde(default)]
    pub timeouts: TimeoutConfig,
    /// Proxy overrides.
    #[serde(default)]
    pub proxy: ProxyConfig,
    /// RPC dispatch settings.
    #[serde(default)]
    pub rpc: RpcConfig,
    /// Host-side descriptor overrides keyed by extension id.
    #[serde(default)]
    pub extensions: HashMap<String, DescriptorOverride>,
    /// Settings served to the guest through the configuration service.
    #[serde(default)]
    pub settings: toml::Table,
}

impl GlobalConfig {
    /// Load and validate configuration from a TOML file path.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if the file cannot be read or contains
    /// invalid TOML, or if validation fails.
    pub fn load_from_path(path: impl AsRef<Path>) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .map_err(|err| AppError::Config(format!("failed to read config: {err}")))?;
        Self::from_toml_str(&raw)
    }

    /// Parse configuration from a TOML string and normalize paths.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if parsing or validation fails.
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        let mut config: Self = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Workspace display name, falling back to the folder name.
    #[must_use]
    pub fn workspace_name(&self) -> String {
        self.workspace_name.clone().unwrap_or_else(|| {
            self.workspace_root
                .file_name()
                .map_or_else(|| "workspace".to_owned(), |n| n.to_string_lossy().into_owned())
        })
    }

    /// Debug connection target, when both host and port are configured.
    #[must_use]
    pub fn debug_target(&self) -> Option<(String, u16)> {
        match (&self.transport.debug_host, self.transport.debug_port) {
            (Some(host), Some(port)) => Some((host.clone(), port)),
            _ => None,
        }
    }

    /// Replace the workspace root, canonicalising it.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if the path does not exist.
    pub fn set_workspace_root(&mut self, root: &Path) -> Result<()> {
        self.workspace_root = root
            .canonicalize()
            .map_err(|err| AppError::Config(format!("invalid workspace root: {err}")))?;
        Ok(())
    }

    fn validate(&mut self) -> Result<()> {
        if self.runtime.executable.trim().is_empty() && self.runtime.bundled_path.is_none() {
            return Err(AppError::Config(
                "runtime.executable or runtime.bundled_path must be set".into(),
            ));
        }

        if self.transport.debug_host.is_some() != self.transport.debug_port.is_some() {
            return Err(AppError::Config(
                "transport.debug_host and transport.debug_port must be set together".into(),
            ));
        }

        if self.protocol.max_frame_bytes == 0 {
            return Err(AppError::Config(
                "protocol.max_frame_bytes must be greater than zero".into(),
            ));
        }

        if self.protocol.keepalive_interval_ms == 0
            || self.protocol.unresponsive_after_ms <= self.protocol.keepalive_interval_ms
        {
            return Err(AppError::Config(
                "protocol.unresponsive_after_ms must exceed a non-zero keepalive_interval_ms"
                    .into(),
            ));
        }

        if self.rpc.max_concurrent_dispatch == 0 {
            return Err(AppError::Config(
                "rpc.max_concurrent_dispatch must be greater than zero".into(),
            ));
        }

        let canonical_root = self
            .workspace_root
            .canonicalize()
            .map_err(|err| AppError::Config(format!("workspace_root invalid: {err}")))?;
        self.workspace_root = canonical_root;

        Ok(())
    }
}
