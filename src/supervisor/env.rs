//! Child-process environment contract.
//!
//! The host passes the connection target to the guest through a fixed set
//! of variables; [`connection_target_from_env`] is the guest-side reader of
//! the same contract.

use std::collections::BTreeMap;
use std::ffi::OsString;
use std::path::{Path, PathBuf};

use tracing::warn;

use crate::config::ProxyConfig;
use crate::transport::ConnectionTarget;
use crate::{AppError, Result};

/// `"1"` when the target is a local socket / named pipe, `"0"` for TCP.
pub const ENV_USE_PIPE: &str = "EXTHOST_USE_PIPE";
/// Local socket path or pipe name.
pub const ENV_PIPE_PATH: &str = "EXTHOST_PIPE_PATH";
/// TCP host.
pub const ENV_SOCKET_HOST: &str = "EXTHOST_SOCKET_HOST";
/// TCP port.
pub const ENV_SOCKET_PORT: &str = "EXTHOST_SOCKET_PORT";
/// Host process id, so the guest can notice an orphaned parent.
pub const ENV_PARENT_PID: &str = "EXTHOST_PARENT_PID";

const TARGET_VARS: [&str; 4] = [ENV_USE_PIPE, ENV_PIPE_PATH, ENV_SOCKET_HOST, ENV_SOCKET_PORT];

const PROXY_VARS: [(&str, &str); 3] = [
    ("HTTP_PROXY", "http_proxy"),
    ("HTTPS_PROXY", "https_proxy"),
    ("NO_PROXY", "no_proxy"),
];

/// Tool folders commonly missing from the `PATH` of GUI-launched hosts.
#[must_use]
pub fn common_tool_paths() -> Vec<PathBuf> {
    if cfg!(windows) {
        std::env::var_os("ProgramFiles")
            .map(|pf| vec![PathBuf::from(pf).join("nodejs")])
            .unwrap_or_default()
    } else {
        ["/usr/local/bin", "/opt/homebrew/bin", "/usr/bin", "/bin"]
            .iter()
            .map(PathBuf::from)
            .collect()
    }
}

/// The parent's environment as UTF-8 pairs.
///
/// Entries whose key or value is not valid Unicode are left out of the
/// child environment and logged.
#[must_use]
pub fn inherited_env() -> Vec<(String, String)> {
    std::env::vars_os()
        .filter_map(|(key, value)| match (key.into_string(), value.into_string()) {
            (Ok(key), Ok(value)) => Some((key, value)),
            (Ok(key), Err(_)) => {
                warn!(%key, "skipping environment variable with non-UTF-8 value");
                None
            }
            (Err(key), _) => {
                warn!(key = %key.to_string_lossy(), "skipping environment variable with non-UTF-8 name");
                None
            }
        })
        .collect()
}

/// Build the full child environment from `base` (normally the parent's).
///
/// - `PATH` becomes `runtime_dir`, then [`common_tool_paths`], then the
///   inherited entries, without duplicates.
/// - Stale connection variables are replaced by `target`.
/// - Proxy variables come from `proxy` overrides, else from `base`, and are
///   written in both upper and lower case.
///
/// # Errors
///
/// Returns `AppError::Setup` if a `PATH` entry contains the separator.
pub fn build_child_env<I>(
    base: I,
    runtime_dir: Option<&Path>,
    target: &ConnectionTarget,
    proxy: &ProxyConfig,
) -> Result<BTreeMap<String, String>>
where
    I: IntoIterator<Item = (String, String)>,
{
    let mut env: BTreeMap<String, String> = base.into_iter().collect();
    for key in TARGET_VARS {
        env.remove(key);
    }

    let path_key = env
        .keys()
        .find(|k| if cfg!(windows) { k.eq_ignore_ascii_case("PATH") } else { *k == "PATH" })
        .cloned()
        .unwrap_or_else(|| "PATH".to_owned());
    let inherited = env.get(&path_key).cloned().unwrap_or_default();
    env.insert(path_key, prepend_paths(runtime_dir, &inherited)?);

    match target {
        ConnectionTarget::Pipe { path } => {
            env.insert(ENV_USE_PIPE.into(), "1".into());
            env.insert(ENV_PIPE_PATH.into(), path.clone());
        }
        ConnectionTarget::Tcp { host, port } => {
            env.insert(ENV_USE_PIPE.into(), "0".into());
            env.insert(ENV_SOCKET_HOST.into(), host.clone());
            env.insert(ENV_SOCKET_PORT.into(), port.to_string());
        }
    }
    env.insert(ENV_PARENT_PID.into(), std::process::id().to_string());

    let overrides = [&proxy.http, &proxy.https, &proxy.no_proxy];
    for ((upper, lower), configured) in PROXY_VARS.into_iter().zip(overrides) {
        let value = configured
            .clone()
            .or_else(|| env.get(upper).cloned())
            .or_else(|| env.get(lower).cloned());
        if let Some(value) = value.filter(|v| !v.is_empty()) {
            env.insert(upper.into(), value.clone());
            env.insert(lower.into(), value);
        }
    }

    Ok(env)
}

fn prepend_paths(runtime_dir: Option<&Path>, inherited: &str) -> Result<String> {
    let mut entries: Vec<PathBuf> = Vec::new();
    let inherited: Vec<PathBuf> = std::env::split_paths(inherited).collect();
    let front = runtime_dir
        .map(Path::to_path_buf)
        .into_iter()
        .chain(common_tool_paths());
    for entry in front.chain(inherited) {
        if !entry.as_os_str().is_empty() && !entries.contains(&entry) {
            entries.push(entry);
        }
    }
    let joined: OsString = std::env::join_paths(entries)
        .map_err(|err| AppError::Setup(format!("cannot build child PATH: {err}")))?;
    Ok(joined.to_string_lossy().into_owned())
}

/// Read the connection target injected by the host.
///
/// # Errors
///
/// Returns `AppError::Setup` if the variables are missing or malformed.
pub fn connection_target_from_env<F>(lookup: F) -> Result<ConnectionTarget>
where
    F: Fn(&str) -> Option<String>,
{
    let use_pipe = lookup(ENV_USE_PIPE)
        .ok_or_else(|| AppError::Setup(format!("{ENV_USE_PIPE} is not set")))?;
    match use_pipe.trim() {
        "1" | "true" => {
            let path = lookup(ENV_PIPE_PATH)
                .filter(|p| !p.is_empty())
                .ok_or_else(|| AppError::Setup(format!("{ENV_PIPE_PATH} is not set")))?;
            Ok(ConnectionTarget::Pipe { path })
        }
        "0" | "false" => {
            let host = lookup(ENV_SOCKET_HOST)
                .filter(|h| !h.is_empty())
                .ok_or_else(|| AppError::Setup(format!("{ENV_SOCKET_HOST} is not set")))?;
            let port = lookup(ENV_SOCKET_PORT)
                .ok_or_else(|| AppError::Setup(format!("{ENV_SOCKET_PORT} is not set")))?
                .trim()
                .parse::<u16>()
                .map_err(|err| AppError::Setup(format!("invalid {ENV_SOCKET_PORT}: {err}")))?;
            Ok(ConnectionTarget::Tcp { host, port })
        }
        other => Err(AppError::Setup(format!(
            "invalid {ENV_USE_PIPE} value '{other}'"
        ))),
    }
}
