//! Rootfs Filesystem Source
//!
//! A dynamic source that carves filesystems out of the agent's own root
//! filesystem as directories under `<storage_dir>/filesystems`.

use crate::domain::ports::{EntityResults, FilesystemSource};
use crate::domain::types::{
    Filesystem, FilesystemAttachment, FilesystemAttachmentParams, FilesystemParams,
};
use crate::error::{Error, Result};
use async_trait::async_trait;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

const PROVIDER: &str = "rootfs";

/// Directory-backed dynamic source
pub struct RootfsSource {
    root: PathBuf,
}

impl RootfsSource {
    pub fn new(storage_dir: impl AsRef<Path>) -> Self {
        Self {
            root: storage_dir.as_ref().join("filesystems"),
        }
    }

    /// Directory holding a filesystem's data
    pub fn filesystem_dir(&self, filesystem_id: &str) -> PathBuf {
        self.root.join(filesystem_id)
    }

    fn provider_error(err: impl std::fmt::Display) -> Error {
        Error::Provider {
            provider: PROVIDER.into(),
            reason: err.to_string(),
        }
    }

    async fn create_one(&self, params: &FilesystemParams) -> Result<Filesystem> {
        let filesystem_id = format!("fs-{}", params.tag.id());
        let dir = self.filesystem_dir(&filesystem_id);
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| Self::provider_error(format!("creating {}: {}", dir.display(), e)))?;
        info!("Created rootfs filesystem {} at {}", params.tag, dir.display());
        Ok(Filesystem {
            tag: params.tag.clone(),
            volume: None,
            filesystem_id,
            size: params.size,
            pool: None,
        })
    }

    async fn attach_one(&self, params: &FilesystemAttachmentParams) -> Result<FilesystemAttachment> {
        let dir = self.filesystem_dir(&params.filesystem_id);
        if !tokio::fs::try_exists(&dir).await.unwrap_or(false) {
            return Err(Self::provider_error(format!(
                "filesystem {} does not exist",
                params.filesystem_id
            )));
        }
        let path = params.path.clone().ok_or_else(|| Error::Validation {
            entity: params.filesystem.to_string(),
            reason: "attachment has no mount path".into(),
        })?;
        tokio::fs::create_dir_all(&path)
            .await
            .map_err(|e| Self::provider_error(format!("creating {}: {}", path.display(), e)))?;
        debug!("attached {} to {} at {}", params.filesystem, params.machine, path.display());
        Ok(FilesystemAttachment {
            filesystem: params.filesystem.clone(),
            machine: params.machine.clone(),
            path,
            read_only: params.read_only,
        })
    }

    async fn destroy_one(&self, filesystem_id: &str) -> Result<()> {
        let dir = self.filesystem_dir(filesystem_id);
        match tokio::fs::remove_dir_all(&dir).await {
            Ok(()) => {
                info!("Destroyed rootfs filesystem {}", filesystem_id);
                Ok(())
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Self::provider_error(format!("removing {}: {}", dir.display(), e))),
        }
    }
}

#[async_trait]
impl FilesystemSource for RootfsSource {
    fn name(&self) -> &str {
        PROVIDER
    }

    fn validate_filesystem_params(&self, params: &FilesystemParams) -> Result<()> {
        if params.size == 0 {
            return Err(Error::Validation {
                entity: params.tag.to_string(),
                reason: "size must be positive".into(),
            });
        }
        if params.volume.is_some() {
            return Err(Error::Validation {
                entity: params.tag.to_string(),
                reason: "rootfs filesystems cannot be backed by a volume".into(),
            });
        }
        Ok(())
    }

    async fn create_filesystems(
        &self,
        params: &[FilesystemParams],
    ) -> Result<EntityResults<Filesystem>> {
        let mut results = Vec::with_capacity(params.len());
        for p in params {
            results.push(self.create_one(p).await);
        }
        Ok(results)
    }

    async fn attach_filesystems(
        &self,
        params: &[FilesystemAttachmentParams],
    ) -> Result<EntityResults<FilesystemAttachment>> {
        let mut results = Vec::with_capacity(params.len());
        for p in params {
            results.push(self.attach_one(p).await);
        }
        Ok(results)
    }

    async fn detach_filesystems(
        &self,
        params: &[FilesystemAttachmentParams],
    ) -> Result<EntityResults<()>> {
        // Mount paths are plain directories; nothing to unmount.
        Ok(params.iter().map(|_| Ok(())).collect())
    }

    async fn destroy_filesystems(&self, filesystem_ids: &[String]) -> Result<EntityResults<()>> {
        let mut results = Vec::with_capacity(filesystem_ids.len());
        for id in filesystem_ids {
            results.push(self.destroy_one(id).await);
        }
        Ok(results)
    }

    async fn release_filesystems(&self, filesystem_ids: &[String]) -> Result<EntityResults<()>> {
        Ok(filesystem_ids.iter().map(|_| Ok(())).collect())
    }
}
