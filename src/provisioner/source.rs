//! Source Resolver
//!
//! Partitions operation parameters by provider type and resolves each
//! provider type to the filesystem source that serves it.
//!
//! For now there is a single source per provider type, with no
//! per-instance configuration.

use crate::domain::ports::{FilesystemSourceRef, ProviderRegistry};
use crate::domain::types::{Filesystem, FilesystemAttachmentParams, FilesystemParams, FilesystemTag};
use crate::error::Result;
use indexmap::IndexMap;
use std::collections::HashMap;
use std::path::Path;
use tracing::debug;

/// Outcome of resolving one provider type
#[derive(Clone)]
pub enum ResolvedSource {
    /// A source that can serve the parameters
    Ready(FilesystemSourceRef),
    /// The provider is not dynamic; the machine provisioner owns these entities
    Deferred,
    /// Managed source required but this deployment has none
    Missing,
}

impl std::fmt::Debug for ResolvedSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ResolvedSource::Ready(source) => write!(f, "Ready({})", source.name()),
            ResolvedSource::Deferred => write!(f, "Deferred"),
            ResolvedSource::Missing => write!(f, "Missing"),
        }
    }
}

/// Parameters grouped by source name, in first-seen order
#[derive(Debug)]
pub struct Partition<P> {
    pub params: IndexMap<String, Vec<P>>,
    pub sources: IndexMap<String, ResolvedSource>,
}

impl<P> Partition<P> {
    /// Iterate `(source name, resolved source, params)` groups
    pub fn groups(self) -> impl Iterator<Item = (String, ResolvedSource, Vec<P>)> {
        let Partition { params, mut sources } = self;
        params.into_iter().map(move |(name, params)| {
            let source = sources.swap_remove(&name).unwrap_or(ResolvedSource::Missing);
            (name, source, params)
        })
    }

    pub fn is_empty(&self) -> bool {
        self.params.is_empty()
    }
}

/// Shared collaborators for resolution
pub struct SourceResolver<'a> {
    pub storage_dir: &'a Path,
    pub managed: Option<&'a FilesystemSourceRef>,
    pub registry: &'a dyn ProviderRegistry,
}

impl<'a> SourceResolver<'a> {
    /// Resolve one provider type. `managed` routes to the injected managed source.
    fn resolve(&self, provider: &str, managed: bool) -> Result<ResolvedSource> {
        if managed {
            return Ok(match self.managed {
                Some(source) => ResolvedSource::Ready(source.clone()),
                None => ResolvedSource::Missing,
            });
        }
        match self.registry.dynamic_source(provider, self.storage_dir) {
            Ok(source) => Ok(ResolvedSource::Ready(source)),
            Err(err) if err.is_non_dynamic() => {
                debug!("provider {:?} is not dynamic, deferring", provider);
                Ok(ResolvedSource::Deferred)
            }
            Err(err) => Err(err),
        }
    }

    /// Group parameters by provider type.
    ///
    /// The first parameter seen for a provider type decides whether the
    /// provider is served by the managed source. Parameters whose source is
    /// deferred are dropped from the partition.
    fn partition<P: Clone>(
        &self,
        params: &[P],
        route: impl Fn(&P) -> (&str, bool),
    ) -> Result<Partition<P>> {
        let mut sources: IndexMap<String, ResolvedSource> = IndexMap::new();
        for p in params {
            let (provider, managed) = route(p);
            if sources.contains_key(provider) {
                continue;
            }
            let resolved = self.resolve(provider, managed)?;
            sources.insert(provider.to_string(), resolved);
        }

        let mut by_source: IndexMap<String, Vec<P>> = IndexMap::new();
        for p in params {
            let (provider, _) = route(p);
            if matches!(sources.get(provider), Some(ResolvedSource::Deferred)) {
                continue;
            }
            by_source.entry(provider.to_string()).or_default().push(p.clone());
        }

        Ok(Partition {
            params: by_source,
            sources,
        })
    }

    /// Partition filesystem parameters; a backing volume selects the managed source
    pub fn filesystems(&self, params: &[FilesystemParams]) -> Result<Partition<FilesystemParams>> {
        self.partition(params, |p| (p.provider.as_str(), p.is_managed()))
    }

    /// Partition attachment parameters.
    ///
    /// A filesystem that is unknown locally, or that is backed by a volume,
    /// is attached through the managed source whatever its provider says.
    pub fn attachments(
        &self,
        params: &[FilesystemAttachmentParams],
        filesystems: &HashMap<FilesystemTag, Filesystem>,
    ) -> Result<Partition<FilesystemAttachmentParams>> {
        self.partition(params, |p| {
            let managed = filesystems
                .get(&p.filesystem)
                .map_or(true, |fs| fs.volume.is_some());
            (p.provider.as_str(), managed)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sources::{ManagedFilesystemSource, SourceRegistry, TmpfsSource};
    use crate::domain::types::{MachineTag, VolumeTag};
    use std::collections::HashSet;
    use std::sync::Arc;

    fn registry() -> SourceRegistry {
        let mut registry = SourceRegistry::new();
        let tmpfs: FilesystemSourceRef = Arc::new(TmpfsSource::new(1 << 20));
        registry.register_source("tmpfs", tmpfs);
        registry.register_non_dynamic("loop");
        registry
    }

    fn fs(id: &str, provider: &str, volume: Option<&str>) -> FilesystemParams {
        FilesystemParams {
            tag: FilesystemTag::new(id),
            volume: volume.map(VolumeTag::new),
            size: 64,
            provider: provider.into(),
        }
    }

    #[test]
    fn test_partition_drops_exactly_non_dynamic() {
        let registry = registry();
        let managed: FilesystemSourceRef = Arc::new(ManagedFilesystemSource::new("/storage"));
        let resolver = SourceResolver {
            storage_dir: Path::new("/storage"),
            managed: Some(&managed),
            registry: &registry,
        };
        let params = vec![
            fs("0", "tmpfs", None),
            fs("1", "loop", None),
            fs("2", "tmpfs", None),
            fs("3", "loop", None),
        ];

        let partition = resolver.filesystems(&params).unwrap();
        assert!(matches!(partition.sources["loop"], ResolvedSource::Deferred));
        let kept: HashSet<String> = partition
            .params
            .values()
            .flatten()
            .map(|p| p.tag.id().to_string())
            .collect();
        assert_eq!(kept, ["0", "2"].iter().map(|s| s.to_string()).collect());
        assert_eq!(partition.params["tmpfs"].len(), 2);
    }

    #[test]
    fn test_backing_volume_selects_managed_source() {
        let registry = registry();
        let managed: FilesystemSourceRef = Arc::new(ManagedFilesystemSource::new("/storage"));
        let resolver = SourceResolver {
            storage_dir: Path::new("/storage"),
            managed: Some(&managed),
            registry: &registry,
        };

        let partition = resolver.filesystems(&[fs("0", "loop", Some("5"))]).unwrap();
        match &partition.sources["loop"] {
            ResolvedSource::Ready(source) => assert_eq!(source.name(), "managed"),
            other => panic!("unexpected source {:?}", other),
        }
        assert_eq!(partition.params["loop"].len(), 1);
    }

    #[test]
    fn test_unknown_provider_aborts() {
        let registry = registry();
        let resolver = SourceResolver {
            storage_dir: Path::new("/storage"),
            managed: None,
            registry: &registry,
        };
        assert!(resolver.filesystems(&[fs("0", "ceph", None)]).is_err());
    }

    #[test]
    fn test_attachment_of_managed_filesystem_uses_managed_source() {
        let registry = registry();
        let managed: FilesystemSourceRef = Arc::new(ManagedFilesystemSource::new("/storage"));
        let resolver = SourceResolver {
            storage_dir: Path::new("/storage"),
            managed: Some(&managed),
            registry: &registry,
        };
        let mut filesystems = HashMap::new();
        filesystems.insert(
            FilesystemTag::new("0"),
            Filesystem {
                tag: FilesystemTag::new("0"),
                volume: Some(VolumeTag::new("0")),
                filesystem_id: "fs-0".into(),
                size: 64,
                pool: None,
            },
        );
        let params = FilesystemAttachmentParams {
            filesystem: FilesystemTag::new("0"),
            machine: MachineTag::new("0"),
            provider: "tmpfs".into(),
            filesystem_id: "fs-0".into(),
            path: None,
            read_only: false,
        };

        let partition = resolver.attachments(&[params], &filesystems).unwrap();
        let (name, source, params) = partition.groups().next().unwrap();
        assert_eq!(name, "tmpfs");
        assert_eq!(params.len(), 1);
        match source {
            ResolvedSource::Ready(source) => assert_eq!(source.name(), "managed"),
            other => panic!("unexpected source {:?}", other),
        }
    }

    #[test]
    fn test_missing_managed_source_is_reported() {
        let registry = registry();
        let resolver = SourceResolver {
            storage_dir: Path::new("/storage"),
            managed: None,
            registry: &registry,
        };
        let partition = resolver.filesystems(&[fs("0", "tmpfs", Some("1"))]).unwrap();
        assert!(matches!(partition.sources["tmpfs"], ResolvedSource::Missing));
        assert_eq!(partition.params["tmpfs"].len(), 1);
    }
}
