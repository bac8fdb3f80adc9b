//! Tmpfs Filesystem Source
//!
//! A dynamic in-memory source bounded by a fixed capacity. Useful for
//! scratch storage and for exercising the engine without touching disk.

use crate::domain::ports::{EntityResults, FilesystemSource};
use crate::domain::types::{
    Filesystem, FilesystemAttachment, FilesystemAttachmentParams, FilesystemParams,
    MachineStorageId,
};
use crate::error::{Error, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::debug;

const PROVIDER: &str = "tmpfs";

#[derive(Debug, Default)]
struct TmpfsState {
    /// Allocated MiB
    used: u64,
    /// Extent sizes by filesystem id
    extents: HashMap<String, u64>,
    mounts: HashSet<MachineStorageId>,
}

/// In-memory dynamic source
pub struct TmpfsSource {
    /// Capacity in MiB
    capacity: u64,
    state: Mutex<TmpfsState>,
    next_id: AtomicU64,
}

impl TmpfsSource {
    pub fn new(capacity: u64) -> Self {
        Self {
            capacity,
            state: Mutex::new(TmpfsState::default()),
            next_id: AtomicU64::new(0),
        }
    }

    /// MiB still available
    pub fn available(&self) -> u64 {
        self.capacity.saturating_sub(self.state.lock().used)
    }

    pub fn is_mounted(&self, id: &MachineStorageId) -> bool {
        self.state.lock().mounts.contains(id)
    }

    fn free(&self, filesystem_id: &str) {
        let mut state = self.state.lock();
        if let Some(size) = state.extents.remove(filesystem_id) {
            state.used -= size;
        }
    }
}

#[async_trait]
impl FilesystemSource for TmpfsSource {
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
                reason: "tmpfs filesystems cannot be backed by a volume".into(),
            });
        }
        Ok(())
    }

    async fn create_filesystems(
        &self,
        params: &[FilesystemParams],
    ) -> Result<EntityResults<Filesystem>> {
        let mut state = self.state.lock();
        Ok(params
            .iter()
            .map(|p| {
                let available = self.capacity.saturating_sub(state.used);
                if p.size > available {
                    return Err(Error::InsufficientCapacity {
                        requested: p.size,
                        available,
                    });
                }
                let filesystem_id = format!(
                    "tmpfs-{}",
                    self.next_id.fetch_add(1, Ordering::Relaxed)
                );
                state.used += p.size;
                state.extents.insert(filesystem_id.clone(), p.size);
                debug!("allocated {} MiB for {} as {}", p.size, p.tag, filesystem_id);
                Ok(Filesystem {
                    tag: p.tag.clone(),
                    volume: None,
                    filesystem_id,
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
        let mut state = self.state.lock();
        Ok(params
            .iter()
            .map(|p| {
                if !state.extents.contains_key(&p.filesystem_id) {
                    return Err(Error::Provider {
                        provider: PROVIDER.into(),
                        reason: format!("filesystem {:?} not found", p.filesystem_id),
                    });
                }
                let path = p.path.clone().ok_or_else(|| Error::Validation {
                    entity: p.filesystem.to_string(),
                    reason: "attachment has no mount path".into(),
                })?;
                state.mounts.insert(p.id());
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
        let mut state = self.state.lock();
        Ok(params
            .iter()
            .map(|p| {
                state.mounts.remove(&p.id());
                Ok(())
            })
            .collect())
    }

    async fn destroy_filesystems(&self, filesystem_ids: &[String]) -> Result<EntityResults<()>> {
        Ok(filesystem_ids
            .iter()
            .map(|id| {
                self.free(id);
                Ok(())
            })
            .collect())
    }

    async fn release_filesystems(&self, filesystem_ids: &[String]) -> Result<EntityResults<()>> {
        // Memory cannot outlive the source; releasing frees it like destroy.
        self.destroy_filesystems(filesystem_ids).await
    }
}
