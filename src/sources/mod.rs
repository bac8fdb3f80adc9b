//! Filesystem Sources
//!
//! Provides the filesystem sources the provisioner drives:
//! - Managed: filesystems layered on provisioned volumes
//! - Rootfs: directories on the agent's root filesystem
//! - Tmpfs: in-memory scratch filesystems

pub mod managed;
pub mod rootfs;
pub mod tmpfs;

pub use managed::*;
pub use rootfs::*;
pub use tmpfs::*;

use crate::domain::ports::{FilesystemSourceRef, ProviderRegistry};
use crate::error::{Error, Result};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::Arc;
use tracing::info;

/// Builds a source for a storage directory
pub type SourceFactory = Box<dyn Fn(&Path) -> Result<FilesystemSourceRef> + Send + Sync>;

/// Registry of storage providers known to this agent
pub struct SourceRegistry {
    factories: HashMap<String, SourceFactory>,
    non_dynamic: HashSet<String>,
    /// Sources already built, one per provider
    instances: Mutex<HashMap<String, FilesystemSourceRef>>,
}

impl Default for SourceRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl SourceRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self {
            factories: HashMap::new(),
            non_dynamic: HashSet::new(),
            instances: Mutex::new(HashMap::new()),
        }
    }

    /// Registry with the built-in providers.
    ///
    /// `rootfs` and `tmpfs` are dynamic; `loop` filesystems are made on
    /// volumes by the machine provisioner.
    pub fn with_defaults(tmpfs_capacity: u64) -> Self {
        let mut registry = Self::new();
        registry.register_factory("rootfs", |storage_dir| {
            let source: FilesystemSourceRef = Arc::new(RootfsSource::new(storage_dir));
            Ok(source)
        });
        let tmpfs: FilesystemSourceRef = Arc::new(TmpfsSource::new(tmpfs_capacity));
        registry.register_source("tmpfs", tmpfs);
        registry.register_non_dynamic("loop");
        registry
    }

    /// Register a provider built on first use
    pub fn register_factory(
        &mut self,
        provider: impl Into<String>,
        factory: impl Fn(&Path) -> Result<FilesystemSourceRef> + Send + Sync + 'static,
    ) {
        let provider = provider.into();
        self.non_dynamic.remove(&provider);
        self.factories.insert(provider, Box::new(factory));
    }

    /// Register an already built provider source
    pub fn register_source(&mut self, provider: impl Into<String>, source: FilesystemSourceRef) {
        self.register_factory(provider, move |_| Ok(source.clone()));
    }

    /// Register a provider that cannot create filesystems itself
    pub fn register_non_dynamic(&mut self, provider: impl Into<String>) {
        let provider = provider.into();
        self.factories.remove(&provider);
        self.non_dynamic.insert(provider);
    }

    /// Names of every registered provider
    pub fn providers(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .factories
            .keys()
            .chain(self.non_dynamic.iter())
            .cloned()
            .collect();
        names.sort();
        names
    }
}

impl ProviderRegistry for SourceRegistry {
    fn dynamic_source(&self, provider: &str, storage_dir: &Path) -> Result<FilesystemSourceRef> {
        if self.non_dynamic.contains(provider) {
            return Err(Error::NonDynamicProvider {
                provider: provider.to_string(),
            });
        }
        let mut instances = self.instances.lock();
        if let Some(source) = instances.get(provider) {
            return Ok(source.clone());
        }
        let factory = self
            .factories
            .get(provider)
            .ok_or_else(|| Error::UnknownProvider {
                provider: provider.to_string(),
            })?;
        let source = factory(storage_dir)?;
        info!("Instantiated filesystem source for provider {}", provider);
        instances.insert(provider.to_string(), source.clone());
        Ok(source)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn test_default_providers() {
        let registry = SourceRegistry::with_defaults(1024);
        assert_eq!(registry.providers(), vec!["loop", "rootfs", "tmpfs"]);

        let storage_dir = Path::new("/var/lib/storage");
        let source = registry.dynamic_source("rootfs", storage_dir).unwrap();
        assert_eq!(source.name(), "rootfs");
        assert_matches!(
            registry.dynamic_source("loop", storage_dir).err(),
            Some(Error::NonDynamicProvider { .. })
        );
        assert_matches!(
            registry.dynamic_source("ceph", storage_dir).err(),
            Some(Error::UnknownProvider { .. })
        );
    }

    #[test]
    fn test_sources_are_cached() {
        let registry = SourceRegistry::with_defaults(1024);
        let storage_dir = Path::new("/var/lib/storage");
        let first = registry.dynamic_source("rootfs", storage_dir).unwrap();
        let second = registry.dynamic_source("rootfs", storage_dir).unwrap();
        assert!(Arc::ptr_eq(&first, &second));
    }
}
