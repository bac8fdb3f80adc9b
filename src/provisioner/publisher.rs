//! Status & State Publisher
//!
//! Sends accumulated status records and confirmed storage facts to the
//! controller once per batch.
//!
//! Status publication is best effort. Persistence calls propagate a
//! transport failure to the caller; records the controller refuses are only
//! logged, since provider-side effects have already happened and the next
//! reconciliation pass re-derives desired state from the controller.

use crate::domain::ports::{ControllerFacadeRef, EntityResults};
use crate::domain::types::{EntityStatus, Filesystem, FilesystemAttachment, FilesystemTag, MachineStorageId};
use crate::error::{Error, Result};
use std::fmt::Display;
use tracing::{error, warn};

/// Publishes engine outcomes to the controller
#[derive(Clone)]
pub struct StatusPublisher {
    controller: ControllerFacadeRef,
}

impl StatusPublisher {
    pub fn new(controller: ControllerFacadeRef) -> Self {
        Self { controller }
    }

    /// Log per-record failures; returns how many records were refused
    fn log_rejections<T: Display>(what: &str, entities: &[T], results: EntityResults<()>) -> usize {
        let mut refused = 0;
        for (entity, result) in entities.iter().zip(results) {
            if let Err(err) = result {
                warn!("publishing {} {} to state: {}", what, entity, err);
                refused += 1;
            }
        }
        refused
    }

    /// Send status records. Never fails the batch.
    pub async fn publish_status(&self, statuses: &[EntityStatus]) {
        if statuses.is_empty() {
            return;
        }
        match self.controller.set_status(statuses).await {
            Ok(results) => {
                let tags: Vec<&str> = statuses.iter().map(|s| s.tag.as_str()).collect();
                Self::log_rejections("status of", &tags, results);
            }
            Err(err) => error!("failed to set status: {}", err),
        }
    }

    /// Record provisioned filesystems
    pub async fn persist_filesystems(&self, filesystems: &[Filesystem]) -> Result<()> {
        if filesystems.is_empty() {
            return Ok(());
        }
        let results = self
            .controller
            .set_filesystem_info(filesystems)
            .await
            .map_err(|e| annotate("publishing filesystems to state", e))?;
        let tags: Vec<&FilesystemTag> = filesystems.iter().map(|fs| &fs.tag).collect();
        Self::log_rejections("filesystem", &tags, results);
        Ok(())
    }

    /// Record filesystem attachments
    pub async fn persist_attachments(&self, attachments: &[FilesystemAttachment]) -> Result<()> {
        if attachments.is_empty() {
            return Ok(());
        }
        let results = self
            .controller
            .set_filesystem_attachment_info(attachments)
            .await
            .map_err(|e| annotate("publishing filesystem attachments to state", e))?;
        let ids: Vec<MachineStorageId> = attachments.iter().map(FilesystemAttachment::id).collect();
        Self::log_rejections("attachment", &ids, results);
        Ok(())
    }

    /// Remove filesystems from controller state
    pub async fn remove_filesystems(&self, tags: &[FilesystemTag]) -> Result<()> {
        if tags.is_empty() {
            return Ok(());
        }
        let results = self
            .controller
            .remove(tags)
            .await
            .map_err(|e| annotate("removing filesystems from state", e))?;
        Self::log_rejections("removal of", tags, results);
        Ok(())
    }

    /// Remove attachments from controller state
    pub async fn remove_attachments(&self, ids: &[MachineStorageId]) -> Result<()> {
        if ids.is_empty() {
            return Ok(());
        }
        let results = self
            .controller
            .remove_attachments(ids)
            .await
            .map_err(|e| annotate("removing attachments from state", e))?;
        Self::log_rejections("removal of attachment", ids, results);
        Ok(())
    }

    /// Removal parameters for each tag, position aligned with `tags`
    pub async fn remove_params(
        &self,
        tags: &[FilesystemTag],
    ) -> Result<EntityResults<crate::domain::types::RemoveFilesystemParams>> {
        self.controller
            .remove_params(tags)
            .await
            .map_err(|e| annotate("getting filesystem removal params", e))
    }
}

fn annotate(context: &str, err: Error) -> Error {
    match err {
        Error::Controller { operation, reason } => Error::Controller {
            operation,
            reason: format!("{}: {}", context, reason),
        },
        other => Error::controller(context, other),
    }
}
