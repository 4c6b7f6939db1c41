//! Immutable, id-keyed set of extension descriptors for one session.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::warn;

use super::{manifest, DescriptorOverride, ExtensionDescriptor};
use crate::config::GlobalConfig;
use crate::{AppError, Result};

/// Read-only extension catalog. Cheap to clone.
#[derive(Debug, Clone, Default)]
pub struct ExtensionCatalog {
    ordered: Arc<Vec<ExtensionDescriptor>>,
    by_id: Arc<HashMap<String, usize>>,
}

impl ExtensionCatalog {
    /// Build from parsed descriptors and host overrides.
    ///
    /// Disabled extensions are dropped. Dependencies missing from the result
    /// are logged; the guest reports them again at activation time.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if two descriptors share an id.
    pub fn build(
        descriptors: Vec<ExtensionDescriptor>,
        overrides: &HashMap<String, DescriptorOverride>,
    ) -> Result<Self> {
        let mut ordered = Vec::with_capacity(descriptors.len());
        let mut by_id = HashMap::with_capacity(descriptors.len());

        for descriptor in descriptors {
            let id = descriptor.id.clone();
            let Some(descriptor) = descriptor.with_override(overrides.get(&id)) else {
                continue;
            };
            if by_id.insert(id.clone(), ordered.len()).is_some() {
                return Err(AppError::Config(format!("duplicate extension id '{id}'")));
            }
            ordered.push(descriptor);
        }

        for descriptor in &ordered {
            for dependency in &descriptor.dependencies {
                if !by_id.contains_key(dependency) {
                    warn!(id = %descriptor.id, %dependency, "extension dependency not in catalog");
                }
            }
        }

        Ok(Self {
            ordered: Arc::new(ordered),
            by_id: Arc::new(by_id),
        })
    }

    /// Scan `config.extension_dirs` and apply `config.extensions` overrides.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` on duplicate ids.
    pub fn from_config(config: &GlobalConfig) -> Result<Self> {
        Self::build(
            manifest::scan_extension_dirs(&config.extension_dirs),
            &config.extensions,
        )
    }

    /// Descriptor for `id`.
    #[must_use]
    pub fn get(&self, id: &str) -> Option<&ExtensionDescriptor> {
        self.by_id.get(id).map(|&index| &self.ordered[index])
    }

    /// Whether `id` is in the catalog.
    #[must_use]
    pub fn contains(&self, id: &str) -> bool {
        self.by_id.contains_key(id)
    }

    /// Descriptors in discovery order.
    #[must_use]
    pub fn descriptors(&self) -> &[ExtensionDescriptor] {
        &self.ordered
    }

    /// Number of descriptors.
    #[must_use]
    pub fn len(&self) -> usize {
        self.ordered.len()
    }

    /// Whether the catalog is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.ordered.is_empty()
    }
}
