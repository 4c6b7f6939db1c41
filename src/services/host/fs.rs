//! `MainThreadFileSystem`: read-only file access confined to the workspace.
//!
//! Every path is normalised against the workspace root; `..` traversal and
//! symlinks resolving outside the root are rejected.

use std::path::{Component, Path, PathBuf};
use std::time::UNIX_EPOCH;

use crate::errors::RemoteError;
use crate::rpc::{
    unknown_method, Args, LocalService, ResourceUri, RpcValue, ServiceFuture, ServiceResult,
};
use crate::services::methods::file_system as m;
use crate::services::MainService;
use crate::{AppError, Result};

/// Resolve `candidate` inside `workspace_root`.
///
/// Relative paths are joined to the root. Absolute paths must already lie
/// under it. Returns the resolved absolute path on success.
///
/// # Errors
///
/// Returns `AppError::PathViolation` if:
/// - The workspace root cannot be canonicalized.
/// - The candidate contains `..` segments that escape the root.
/// - The resolved path does not start with the workspace root.
/// - The resolved path is a symlink whose target escapes the workspace.
pub fn workspace_path(workspace_root: &Path, candidate: impl AsRef<Path>) -> Result<PathBuf> {
    let root = workspace_root
        .canonicalize()
        .map_err(|err| AppError::PathViolation(format!("workspace root invalid: {err}")))?;
    resolve_within(&root, candidate.as_ref(), 0)
}

/// Link hops followed through dangling symlinks before giving up.
const MAX_LINK_HOPS: usize = 40;

fn resolve_within(root: &Path, candidate: &Path, hops: usize) -> Result<PathBuf> {
    let mut normalized = PathBuf::new();
    for component in candidate.components() {
        match component {
            Component::ParentDir => {
                if !normalized.pop() {
                    return Err(AppError::PathViolation(
                        "path attempts to escape workspace".into(),
                    ));
                }
            }
            Component::CurDir => {}
            Component::RootDir | Component::Prefix(_) => normalized.push(component.as_os_str()),
            Component::Normal(part) => normalized.push(part),
        }
    }

    let absolute = if normalized.is_absolute() {
        normalized
    } else {
        root.join(normalized)
    };

    if !absolute.starts_with(root) {
        return Err(AppError::PathViolation(format!(
            "{} is outside the workspace",
            candidate.display()
        )));
    }

    if absolute.exists() {
        let canonical = absolute
            .canonicalize()
            .map_err(|err| AppError::PathViolation(format!("cannot resolve path: {err}")))?;
        if !canonical.starts_with(root) {
            return Err(AppError::PathViolation(
                "symlink target escapes workspace".into(),
            ));
        }
        return Ok(canonical);
    }

    // Dangling link: its target must stay inside too.
    let is_link = std::fs::symlink_metadata(&absolute).is_ok_and(|meta| meta.file_type().is_symlink());
    if is_link {
        if hops >= MAX_LINK_HOPS {
            return Err(AppError::PathViolation("too many levels of symlinks".into()));
        }
        let target = std::fs::read_link(&absolute)
            .map_err(|err| AppError::PathViolation(format!("cannot read symlink: {err}")))?;
        let target = match absolute.parent() {
            Some(parent) if target.is_relative() => parent.join(target),
            _ => target,
        };
        return match resolve_within(root, &target, hops + 1) {
            Ok(_) => Ok(absolute),
            Err(_) => Err(AppError::PathViolation(
                "symlink target escapes workspace".into(),
            )),
        };
    }

    // Missing path: the nearest existing ancestor decides.
    if let Some(ancestor) = absolute.ancestors().skip(1).find(|a| a.exists()) {
        let canonical = ancestor
            .canonicalize()
            .map_err(|err| AppError::PathViolation(format!("cannot resolve path: {err}")))?;
        if !canonical.starts_with(root) {
            return Err(AppError::PathViolation(
                "symlink target escapes workspace".into(),
            ));
        }
    }
    Ok(absolute)
}

/// Read-only workspace file system.
#[derive(Debug)]
pub struct WorkspaceFileSystem {
    root: PathBuf,
}

impl WorkspaceFileSystem {
    /// Serve files under `root`.
    #[must_use]
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    /// Workspace root.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn resolve(&self, uri: &ResourceUri) -> std::result::Result<PathBuf, RemoteError> {
        let path = uri.to_file_path().ok_or_else(|| {
            RemoteError::invalid_args(format!("unsupported resource '{uri}'"))
        })?;
        workspace_path(&self.root, path).map_err(|err| RemoteError::handler(err.to_string()))
    }

    async fn stat(&self, args: &[RpcValue]) -> ServiceResult {
        let path = self.resolve(Args::new(m::STAT, args).uri(0, "uri")?)?;
        let meta = tokio::fs::symlink_metadata(&path).await.map_err(io_error(&path))?;
        let mtime_ms = meta
            .modified()
            .ok()
            .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
            .and_then(|d| i64::try_from(d.as_millis()).ok())
            .unwrap_or(0);
        Ok(RpcValue::map([
            ("type", RpcValue::from(file_type_name(&meta.file_type()))),
            ("size", RpcValue::Int(i64::try_from(meta.len()).unwrap_or(i64::MAX))),
            ("mtime_ms", RpcValue::Int(mtime_ms)),
        ]))
    }

    async fn read_file(&self, args: &[RpcValue]) -> ServiceResult {
        let path = self.resolve(Args::new(m::READ_FILE, args).uri(0, "uri")?)?;
        let bytes = tokio::fs::read(&path).await.map_err(io_error(&path))?;
        Ok(RpcValue::Buffer(bytes))
    }

    async fn read_directory(&self, args: &[RpcValue]) -> ServiceResult {
        let path = self.resolve(Args::new(m::READ_DIRECTORY, args).uri(0, "uri")?)?;
        let mut entries = tokio::fs::read_dir(&path).await.map_err(io_error(&path))?;
        let mut listing = Vec::new();
        while let Some(entry) = entries.next_entry().await.map_err(io_error(&path))? {
            let kind = entry
                .file_type()
                .await
                .map_or("unknown", |t| file_type_name(&t));
            listing.push((entry.file_name().to_string_lossy().into_owned(), kind));
        }
        listing.sort();
        Ok(RpcValue::List(
            listing
                .into_iter()
                .map(|(name, kind)| RpcValue::List(vec![name.into(), kind.into()]))
                .collect(),
        ))
    }
}

impl LocalService for WorkspaceFileSystem {
    fn invoke<'a>(&'a self, method: &'a str, args: Vec<RpcValue>) -> ServiceFuture<'a> {
        match method {
            m::STAT => Box::pin(async move { self.stat(&args).await }),
            m::READ_FILE => Box::pin(async move { self.read_file(&args).await }),
            m::READ_DIRECTORY => Box::pin(async move { self.read_directory(&args).await }),
            _ => unknown_method(MainService::FileSystem.name(), method),
        }
    }
}

fn file_type_name(file_type: &std::fs::FileType) -> &'static str {
    if file_type.is_symlink() {
        "symlink"
    } else if file_type.is_dir() {
        "directory"
    } else if file_type.is_file() {
        "file"
    } else {
        "unknown"
    }
}

fn io_error(path: &Path) -> impl Fn(std::io::Error) -> RemoteError + '_ {
    move |err| {
        if err.kind() == std::io::ErrorKind::NotFound {
            RemoteError::handler(format!("not found: {}", path.display()))
        } else {
            RemoteError::handler(format!("{}: {err}", path.display()))
        }
    }
}
