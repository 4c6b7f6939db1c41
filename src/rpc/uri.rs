//! Structured resource identifiers carried through RPC calls.

use std::fmt::{Display, Formatter};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::{AppError, Result};

/// A URI kept as its components so it survives the wire without lossy
/// string round-trips.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ResourceUri {
    /// Scheme, e.g. `file`.
    pub scheme: String,
    /// Authority (host), empty for local files.
    #[serde(default)]
    pub authority: String,
    /// Path, always starting with `/` when non-empty.
    pub path: String,
    /// Query string without the leading `?`.
    #[serde(default)]
    pub query: String,
    /// Fragment without the leading `#`.
    #[serde(default)]
    pub fragment: String,
}

impl ResourceUri {
    /// A `file` URI for a local path.
    ///
    /// Backslashes are normalised to forward slashes and Windows drive paths
    /// gain a leading slash: `C:\foo\bar` → `/C:/foo/bar`.
    #[must_use]
    pub fn from_file_path(path: &Path) -> Self {
        let forward = path.to_string_lossy().replace('\\', "/");
        let path = if forward.starts_with('/') {
            forward
        } else {
            format!("/{forward}")
        };
        Self {
            scheme: "file".into(),
            authority: String::new(),
            path,
            query: String::new(),
            fragment: String::new(),
        }
    }

    /// Parse `scheme:[//authority]path[?query][#fragment]`.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Rpc` if the scheme is missing or invalid.
    pub fn parse(raw: &str) -> Result<Self> {
        let (scheme, rest) = raw
            .split_once(':')
            .ok_or_else(|| AppError::Rpc(format!("uri has no scheme: '{raw}'")))?;
        let valid_scheme = scheme
            .chars()
            .next()
            .is_some_and(|c| c.is_ascii_alphabetic())
            && scheme
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '+' | '-' | '.'));
        if !valid_scheme {
            return Err(AppError::Rpc(format!("invalid uri scheme: '{scheme}'")));
        }

        let (rest, fragment) = rest.split_once('#').unwrap_or((rest, ""));
        let (rest, query) = rest.split_once('?').unwrap_or((rest, ""));
        let (authority, path) = match rest.strip_prefix("//") {
            Some(after) => match after.find('/') {
                Some(idx) => (&after[..idx], &after[idx..]),
                None => (after, ""),
            },
            None => ("", rest),
        };

        Ok(Self {
            scheme: scheme.to_ascii_lowercase(),
            authority: authority.to_owned(),
            path: path.to_owned(),
            query: query.to_owned(),
            fragment: fragment.to_owned(),
        })
    }

    /// Local path for `file` URIs.
    #[must_use]
    pub fn to_file_path(&self) -> Option<PathBuf> {
        if self.scheme != "file" || !self.authority.is_empty() {
            return None;
        }
        let path = self.path.as_str();
        // `/C:/foo` → `C:/foo`
        let bytes = path.as_bytes();
        if bytes.len() >= 3 && bytes[0] == b'/' && bytes[1].is_ascii_alphabetic() && bytes[2] == b':'
        {
            return Some(PathBuf::from(&path[1..]));
        }
        Some(PathBuf::from(path))
    }
}

impl Display for ResourceUri {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:", self.scheme)?;
        if !self.authority.is_empty() || self.scheme == "file" {
            write!(f, "//{}", self.authority)?;
        }
        f.write_str(&self.path)?;
        if !self.query.is_empty() {
            write!(f, "?{}", self.query)?;
        }
        if !self.fragment.is_empty() {
            write!(f, "#{}", self.fragment)?;
        }
        Ok(())
    }
}
