//! Managed Filesystem Source
//!
//! Serves filesystems layered on an already provisioned volume. The volume
//! provisioner owns the lifetime of the storage, so creation only records the
//! filesystem and removal is a no-op.

use crate::domain::ports::{EntityResults, FilesystemSource};
use crate::domain::types::{
    Filesystem, FilesystemAttachment, FilesystemAttachmentParams, FilesystemParams,
    MachineStorageId,
};
use crate::error::{Error, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Source for volume-backed filesystems
pub struct ManagedFilesystemSource {
    storage_dir: PathBuf,
    /// Mount points recorded by attach
    mounts: Mutex<HashMap<MachineStorageId, PathBuf>>,
}

impl ManagedFilesystemSource {
    pub fn new(storage_dir: impl AsRef<Path>) -> Self {
        Self {
            storage_dir: storage_dir.as_ref().to_path_buf(),
            mounts: Mutex::new(HashMap::new()),
        }
    }

    /// Current mount of an attachment, if any
    pub fn mount_point(&self, id: &MachineStorageId) -> Option<PathBuf> {
        self.mounts.lock().get(id).cloned()
    }
}

#[async_trait]
impl FilesystemSource for ManagedFilesystemSource {
    fn name(&self) -> &str {
        "managed"
    }

    fn validate_filesystem_params(&self, params: &FilesystemParams) -> Result<()> {
        if params.volume.is_none() {
            return Err(Error::Validation {
                entity: params.tag.to_string(),
                reason: "managed filesystems require a backing volume".into(),
            });
        }
        Ok(())
    }

    async fn create_filesystems(
        &self,
        params: &[FilesystemParams],
    ) -> Result<EntityResults<Filesystem>> {
        Ok(params
            .iter()
            .map(|p| {
                let volume = p.volume.clone().ok_or_else(|| Error::Validation {
                    entity: p.tag.to_string(),
                    reason: "managed filesystems require a backing volume".into(),
                })?;
                debug!("recording {} on {}", p.tag, volume);
                Ok(Filesystem {
                    tag: p.tag.clone(),
                    filesystem_id: format!("managed-{}", volume.id()),
                    volume: Some(volume),
                    size: p.size,
                    pool: None,
                })
            })
            .collect())
    }

    async fn attach_filesystems(
        &self,
        params: &[FilesystemAttachmentParams],
    ) -> Result<EntityResults<FilesystemAttachment>> {
        let mut mounts = self.mounts.lock();
        Ok(params
            .iter()
            .map(|p| {
                let path = p
                    .path
                    .clone()
                    .unwrap_or_else(|| self.storage_dir.join(&p.filesystem_id));
                mounts.insert(p.id(), path.clone());
                Ok(FilesystemAttachment {
                    filesystem: p.filesystem.clone(),
                    machine: p.machine.clone(),
                    path,
                    read_only: p.read_only,
                })
            })
            .collect())
    }

    async fn detach_filesystems(
        &self,
        params: &[FilesystemAttachmentParams],
    ) -> Result<EntityResults<()>> {
        let mut mounts = self.mounts.lock();
        Ok(params
            .iter()
            .map(|p| {
                mounts.remove(&p.id());
                Ok(())
            })
            .collect())
    }

    async fn destroy_filesystems(&self, filesystem_ids: &[String]) -> Result<EntityResults<()>> {
        Ok(filesystem_ids.iter().map(|_| Ok(())).collect())
    }

    async fn release_filesystems(&self, filesystem_ids: &[String]) -> Result<EntityResults<()>> {
        Ok(filesystem_ids.iter().map(|_| Ok(())).collect())
    }
}
