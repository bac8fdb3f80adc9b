//! In-Memory Controller
//!
//! A controller facade keeping persisted state in process. Backs the
//! standalone binary and lets tests inspect exactly what the engine
//! published.

use crate::domain::ports::{ControllerFacade, EntityResults};
use crate::domain::types::{
    EntityStatus, Filesystem, FilesystemAttachment, FilesystemTag, MachineStorageId,
    RemoveFilesystemParams,
};
use crate::error::{Error, Result};
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap, HashSet};
use tracing::debug;

#[derive(Debug, Default)]
struct ControllerState {
    filesystems: BTreeMap<FilesystemTag, Filesystem>,
    attachments: BTreeMap<MachineStorageId, FilesystemAttachment>,
    /// Latest status per entity tag
    statuses: BTreeMap<String, EntityStatus>,
    status_history: Vec<EntityStatus>,
    remove_params: BTreeMap<FilesystemTag, RemoveFilesystemParams>,
    /// Entities whose records are refused
    rejected: HashSet<String>,
    /// Operations whose next call fails as a whole
    failing: HashSet<&'static str>,
    calls: HashMap<&'static str, usize>,
}

impl ControllerState {
    fn begin(&mut self, operation: &'static str) -> Result<()> {
        *self.calls.entry(operation).or_default() += 1;
        if self.failing.remove(operation) {
            return Err(Error::controller(operation, "connection refused"));
        }
        Ok(())
    }

    fn accept(&self, entity: String) -> Result<()> {
        if self.rejected.contains(&entity) {
            return Err(Error::ControllerRecord {
                entity,
                reason: "record refused".into(),
            });
        }
        Ok(())
    }
}

/// Controller facade with in-process state
#[derive(Debug, Default)]
pub struct InMemoryController {
    state: RwLock<ControllerState>,
}

impl InMemoryController {
    pub fn new() -> Self {
        Self::default()
    }

    /// Tell the controller how a dying filesystem should be removed
    pub fn set_remove_params(&self, tag: FilesystemTag, params: RemoveFilesystemParams) {
        self.state.write().remove_params.insert(tag, params);
    }

    /// Refuse every record for an entity (tag string form)
    pub fn reject(&self, entity: impl Into<String>) {
        self.state.write().rejected.insert(entity.into());
    }

    /// Make the next call of `operation` fail at the transport level
    pub fn fail_next(&self, operation: &'static str) {
        self.state.write().failing.insert(operation);
    }

    /// Number of calls made to `operation`
    pub fn calls(&self, operation: &str) -> usize {
        self.state.read().calls.get(operation).copied().unwrap_or(0)
    }

    pub fn filesystem(&self, tag: &FilesystemTag) -> Option<Filesystem> {
        self.state.read().filesystems.get(tag).cloned()
    }

    pub fn filesystems(&self) -> Vec<Filesystem> {
        self.state.read().filesystems.values().cloned().collect()
    }

    pub fn attachment(&self, id: &MachineStorageId) -> Option<FilesystemAttachment> {
        self.state.read().attachments.get(id).cloned()
    }

    pub fn attachments(&self) -> Vec<FilesystemAttachment> {
        self.state.read().attachments.values().cloned().collect()
    }

    /// Latest status published for an entity tag
    pub fn status(&self, tag: &str) -> Option<EntityStatus> {
        self.state.read().statuses.get(tag).cloned()
    }

    pub fn status_history(&self) -> Vec<EntityStatus> {
        self.state.read().status_history.clone()
    }
}

#[async_trait]
impl ControllerFacade for InMemoryController {
    async fn set_filesystem_info(&self, filesystems: &[Filesystem]) -> Result<EntityResults<()>> {
        let mut state = self.state.write();
        state.begin("SetFilesystemInfo")?;
        Ok(filesystems
            .iter()
            .map(|fs| {
                state.accept(fs.tag.to_string())?;
                state.filesystems.insert(fs.tag.clone(), fs.clone());
                Ok(())
            })
            .collect())
    }

    async fn set_filesystem_attachment_info(
        &self,
        attachments: &[FilesystemAttachment],
    ) -> Result<EntityResults<()>> {
        let mut state = self.state.write();
        state.begin("SetFilesystemAttachmentInfo")?;
        Ok(attachments
            .iter()
            .map(|a| {
                state.accept(a.filesystem.to_string())?;
                state.attachments.insert(a.id(), a.clone());
                Ok(())
            })
            .collect())
    }

    async fn set_status(&self, statuses: &[EntityStatus]) -> Result<EntityResults<()>> {
        let mut state = self.state.write();
        state.begin("SetStatus")?;
        Ok(statuses
            .iter()
            .map(|s| {
                state.accept(s.tag.clone())?;
                debug!("status of {} is now {}", s.tag, s.status);
                state.statuses.insert(s.tag.clone(), s.clone());
                state.status_history.push(s.clone());
                Ok(())
            })
            .collect())
    }

    async fn remove(&self, tags: &[FilesystemTag]) -> Result<EntityResults<()>> {
        let mut state = self.state.write();
        state.begin("Remove")?;
        Ok(tags
            .iter()
            .map(|tag| {
                state.accept(tag.to_string())?;
                state.filesystems.remove(tag);
                state.remove_params.remove(tag);
                Ok(())
            })
            .collect())
    }

    async fn remove_attachments(&self, ids: &[MachineStorageId]) -> Result<EntityResults<()>> {
        let mut state = self.state.write();
        state.begin("RemoveAttachments")?;
        Ok(ids
            .iter()
            .map(|id| {
                state.accept(id.filesystem.to_string())?;
                state.attachments.remove(id);
                Ok(())
            })
            .collect())
    }

    async fn remove_params(
        &self,
        tags: &[FilesystemTag],
    ) -> Result<EntityResults<RemoveFilesystemParams>> {
        let mut state = self.state.write();
        state.begin("RemoveFilesystemParams")?;
        Ok(tags
            .iter()
            .map(|tag| {
                state
                    .remove_params
                    .get(tag)
                    .cloned()
                    .ok_or_else(|| Error::ResourceNotFound {
                        kind: "filesystem".into(),
                        name: tag.to_string(),
                    })
            })
            .collect())
    }
}
