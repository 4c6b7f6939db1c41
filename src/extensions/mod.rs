//! Extension descriptors: manifest parsing, host overrides and the
//! immutable per-session catalog.

pub mod catalog;
pub mod manifest;

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

pub use catalog::ExtensionCatalog;
pub use manifest::{load_manifest, scan_extension_dirs};

/// Capability flags declared by an extension.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExtensionCapabilities {
    /// May run in untrusted workspaces.
    #[serde(default)]
    pub untrusted_workspaces: bool,
    /// May run in virtual (non-file) workspaces.
    #[serde(default)]
    pub virtual_workspaces: bool,
}

/// Host-side overrides for one descriptor, from `[extensions.<id>]`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct DescriptorOverride {
    /// `false` drops the extension from the catalog.
    #[serde(default)]
    pub enabled: Option<bool>,
    /// Replaces the manifest activation events.
    #[serde(default)]
    pub activation_events: Option<Vec<String>>,
    /// Replaces the manifest capabilities.
    #[serde(default)]
    pub capabilities: Option<ExtensionCapabilities>,
}

/// One guest extension as sent to the guest in the init payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExtensionDescriptor {
    /// Globally unique id, `publisher.name`.
    pub id: String,
    /// Manifest `name`.
    pub name: String,
    /// Manifest `publisher`.
    pub publisher: String,
    /// Manifest `version`.
    pub version: String,
    /// Extension folder.
    pub location: PathBuf,
    /// Entry module relative to `location`, if any.
    #[serde(default)]
    pub main: Option<String>,
    /// Activation triggers, e.g. `onStartupFinished`.
    #[serde(default)]
    pub activation_events: Vec<String>,
    /// Ids that must be activated first.
    #[serde(default)]
    pub dependencies: Vec<String>,
    /// Capability flags.
    #[serde(default)]
    pub capabilities: ExtensionCapabilities,
}

impl ExtensionDescriptor {
    /// Apply host overrides. Returns `None` when the override disables it.
    #[must_use]
    pub fn with_override(mut self, overrides: Option<&DescriptorOverride>) -> Option<Self> {
        let Some(overrides) = overrides else {
            return Some(self);
        };
        if overrides.enabled == Some(false) {
            return None;
        }
        if let Some(events) = &overrides.activation_events {
            self.activation_events.clone_from(events);
        }
        if let Some(capabilities) = &overrides.capabilities {
            self.capabilities = capabilities.clone();
        }
        Some(self)
    }

    /// Whether the extension asks to start without an explicit request.
    #[must_use]
    pub fn activates_on_startup(&self) -> bool {
        self.activation_events
            .iter()
            .any(|e| e == "*" || e == "onStartupFinished")
    }
}
