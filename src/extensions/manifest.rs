//! `package.json` manifest parsing.

use std::fs;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use tracing::{debug, warn};

use super::{ExtensionCapabilities, ExtensionDescriptor};
use crate::{AppError, Result};

/// Manifest file name inside an extension folder.
pub const MANIFEST_FILE: &str = "package.json";

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Manifest {
    name: String,
    publisher: String,
    version: String,
    #[serde(default)]
    main: Option<String>,
    #[serde(default)]
    activation_events: Vec<String>,
    #[serde(default)]
    extension_dependencies: Vec<String>,
    #[serde(default)]
    capabilities: ExtensionCapabilities,
}

/// Parse the manifest in `dir`.
///
/// # Errors
///
/// Returns `AppError::Config` if the manifest is missing, is not valid
/// JSON, or has an empty `name`/`publisher`.
pub fn load_manifest(dir: &Path) -> Result<ExtensionDescriptor> {
    let path = dir.join(MANIFEST_FILE);
    let raw = fs::read_to_string(&path)
        .map_err(|err| AppError::Config(format!("cannot read {}: {err}", path.display())))?;
    let manifest: Manifest = serde_json::from_str(&raw)
        .map_err(|err| AppError::Config(format!("invalid manifest {}: {err}", path.display())))?;

    if manifest.name.trim().is_empty() || manifest.publisher.trim().is_empty() {
        return Err(AppError::Config(format!(
            "manifest {} must declare name and publisher",
            path.display()
        )));
    }

    Ok(ExtensionDescriptor {
        id: format!("{}.{}", manifest.publisher, manifest.name),
        name: manifest.name,
        publisher: manifest.publisher,
        version: manifest.version,
        location: dir.to_path_buf(),
        main: manifest.main,
        activation_events: manifest.activation_events,
        dependencies: manifest.extension_dependencies,
        capabilities: manifest.capabilities,
    })
}

/// Parse every child folder of `dirs` that holds a manifest.
///
/// Unreadable directories and invalid manifests are logged and skipped.
#[must_use]
pub fn scan_extension_dirs(dirs: &[PathBuf]) -> Vec<ExtensionDescriptor> {
    let mut found = Vec::new();
    for dir in dirs {
        let entries = match fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(err) => {
                warn!(dir = %dir.display(), %err, "cannot read extension directory");
                continue;
            }
        };

        let mut children: Vec<PathBuf> = entries
            .filter_map(std::result::Result::ok)
            .map(|entry| entry.path())
            .filter(|path| path.join(MANIFEST_FILE).is_file())
            .collect();
        children.sort();

        for child in children {
            match load_manifest(&child) {
                Ok(descriptor) => {
                    debug!(id = %descriptor.id, location = %child.display(), "extension manifest loaded");
                    found.push(descriptor);
                }
                Err(err) => warn!(%err, "skipping extension"),
            }
        }
    }
    found
}
