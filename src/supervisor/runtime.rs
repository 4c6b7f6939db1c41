//! Runtime executable resolution and version checks.

use std::ffi::OsStr;
use std::fmt::{Display, Formatter};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::OnceLock;
use std::time::Duration;

use regex::Regex;
use tokio::process::Command;
use tracing::{debug, info};

use crate::config::RuntimeConfig;
use crate::{AppError, Result};

/// `major.minor.patch` runtime version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Version {
    /// Major component.
    pub major: u64,
    /// Minor component.
    pub minor: u64,
    /// Patch component, `0` when absent.
    pub patch: u64,
}

impl Version {
    /// First `major.minor[.patch]` found anywhere in `text`.
    ///
    /// Accepts decorated output such as `v18.17.1` or `runtime 2.4`.
    #[must_use]
    pub fn find_in(text: &str) -> Option<Self> {
        let caps = version_pattern()?.captures(text)?;
        let part = |i: usize| -> Option<u64> {
            caps.get(i).map_or(Some(0), |m| m.as_str().parse().ok())
        };
        Some(Self {
            major: part(1)?,
            minor: part(2)?,
            patch: part(3)?,
        })
    }
}

impl Display for Version {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

fn version_pattern() -> Option<&'static Regex> {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    PATTERN
        .get_or_init(|| Regex::new(r"(\d+)\.(\d+)(?:\.(\d+))?").ok())
        .as_ref()
}

/// A runtime executable that passed resolution and the version check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedRuntime {
    /// Absolute executable path.
    pub executable: PathBuf,
    /// Version reported by the probe; `None` when no minimum is configured.
    pub version: Option<Version>,
    /// Whether the bundled copy was used.
    pub bundled: bool,
}

impl ResolvedRuntime {
    /// Folder holding the executable, prepended to the child `PATH`.
    #[must_use]
    pub fn directory(&self) -> Option<&Path> {
        self.executable.parent().filter(|p| !p.as_os_str().is_empty())
    }
}

/// Search `path_var` (a `PATH`-style list) for `name`.
///
/// Names containing a path separator are checked as-is. On Windows each
/// `PATHEXT` extension is tried as well.
#[must_use]
pub fn find_on_path(name: &str, path_var: Option<&OsStr>) -> Option<PathBuf> {
    let direct = Path::new(name);
    if direct.components().count() > 1 {
        return direct.is_file().then(|| direct.to_path_buf());
    }

    let extensions = executable_extensions();
    std::env::split_paths(path_var?).find_map(|dir| {
        extensions.iter().find_map(|ext| {
            let candidate = dir.join(format!("{name}{ext}"));
            candidate.is_file().then_some(candidate)
        })
    })
}

#[cfg(windows)]
fn executable_extensions() -> Vec<String> {
    let mut exts = vec![String::new()];
    let pathext = std::env::var("PATHEXT").unwrap_or_else(|_| ".COM;.EXE;.BAT;.CMD".into());
    exts.extend(
        pathext
            .split(';')
            .filter(|e| !e.is_empty())
            .map(str::to_ascii_lowercase),
    );
    exts
}

#[cfg(not(windows))]
fn executable_extensions() -> Vec<String> {
    vec![String::new()]
}

/// Locate the runtime: the bundled copy when present, else a `PATH` lookup.
///
/// # Errors
///
/// Returns `AppError::Setup` if neither location yields an executable.
pub fn locate_executable(config: &RuntimeConfig) -> Result<(PathBuf, bool)> {
    if let Some(bundled) = &config.bundled_path {
        if bundled.is_file() {
            debug!(path = %bundled.display(), "using bundled runtime");
            return Ok((bundled.clone(), true));
        }
        debug!(path = %bundled.display(), "bundled runtime missing; searching PATH");
    }

    let path_var = std::env::var_os("PATH");
    find_on_path(&config.executable, path_var.as_deref())
        .map(|found| (found, false))
        .ok_or_else(|| {
            AppError::Setup(format!(
                "runtime '{}' not found: install it or set runtime.bundled_path",
                config.executable
            ))
        })
}

/// Run `executable` with `args` and parse the version it prints.
///
/// # Errors
///
/// Returns `AppError::Setup` if the probe cannot run, times out, or prints
/// no recognisable version.
pub async fn probe_version(executable: &Path, args: &[String], timeout: Duration) -> Result<Version> {
    let output = Command::new(executable)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .output();

    let output = tokio::time::timeout(timeout, output)
        .await
        .map_err(|_| {
            AppError::Setup(format!(
                "version probe of {} timed out after {timeout:?}",
                executable.display()
            ))
        })?
        .map_err(|err| {
            AppError::Setup(format!("cannot run {}: {err}", executable.display()))
        })?;

    let stdout = String::from_utf8_lossy(&output.stdout);
    let stderr = String::from_utf8_lossy(&output.stderr);
    Version::find_in(&stdout)
        .or_else(|| Version::find_in(&stderr))
        .ok_or_else(|| {
            AppError::Setup(format!(
                "{} printed no version: {}",
                executable.display(),
                stdout.trim()
            ))
        })
}

/// Locate the runtime and enforce `min_version`.
///
/// # Errors
///
/// Returns `AppError::Setup` if the runtime is missing, its version cannot
/// be determined, or it is older than the configured minimum.
pub async fn resolve_runtime(config: &RuntimeConfig, probe_timeout: Duration) -> Result<ResolvedRuntime> {
    let (executable, bundled) = locate_executable(config)?;

    let Some(min_raw) = &config.min_version else {
        return Ok(ResolvedRuntime {
            executable,
            version: None,
            bundled,
        });
    };
    let minimum = Version::find_in(min_raw).ok_or_else(|| {
        AppError::Config(format!("runtime.min_version '{min_raw}' is not a version"))
    })?;

    let version = probe_version(&executable, &config.version_args, probe_timeout).await?;
    if version < minimum {
        return Err(AppError::Setup(format!(
            "runtime {} is version {version}; {minimum} or newer is required",
            executable.display()
        )));
    }

    info!(path = %executable.display(), %version, bundled, "runtime resolved");
    Ok(ResolvedRuntime {
        executable,
        version: Some(version),
        bundled,
    })
}
