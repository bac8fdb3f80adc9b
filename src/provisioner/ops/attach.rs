//! Attach Executor

use super::{check_result_count, BatchOutcome};
use crate::domain::ports::FilesystemSourceRef;
use crate::domain::types::{
    EntityStatus, FilesystemAttachment, FilesystemAttachmentParams, MachineStorageId, Status,
};
use crate::error::{Error, Result};
use crate::provisioner::context::ProvisionerContext;
use crate::provisioner::operation::{Operation, OperationKey, RetryClassifier};
use crate::provisioner::source::ResolvedSource;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Mount path used when an attachment does not name one: the provider's
/// filesystem id under the storage directory.
pub fn default_mount_path(storage_dir: &Path, params: &FilesystemAttachmentParams) -> PathBuf {
    if params.filesystem_id.is_empty() {
        storage_dir.join(params.filesystem.id())
    } else {
        storage_dir.join(&params.filesystem_id)
    }
}

/// Attach filesystems for a batch of attach operations
pub async fn attach_filesystems(ctx: &mut ProvisionerContext, ops: Vec<Operation>) -> Result<()> {
    let keys: Vec<OperationKey> = ops.iter().map(Operation::key).collect();

    let mut by_id: HashMap<MachineStorageId, Operation> = HashMap::new();
    let mut params = Vec::with_capacity(ops.len());
    for op in ops {
        let Some(p) = op.attachment_params() else {
            continue;
        };
        let mut p = p.clone();
        if p.path.as_ref().map_or(true, |path| path.as_os_str().is_empty()) {
            p.path = Some(default_mount_path(&ctx.config.storage_dir, &p));
        }
        by_id.insert(p.id(), op);
        params.push(p);
    }

    let partition = ctx.resolver().attachments(&params, &ctx.filesystems)?;
    let mut outcome = BatchOutcome::default();
    for (name, source, params) in partition.groups() {
        if outcome.is_aborted() {
            outcome.reschedule.extend(params.iter().filter_map(|p| by_id.remove(&p.id())));
            continue;
        }
        match source {
            ResolvedSource::Ready(source) => outcome.merge(
                attach_from_source(&name, &source, params, &mut by_id, &ctx.classifier).await,
            ),
            ResolvedSource::Deferred => continue,
            ResolvedSource::Missing => outcome.abort(
                Error::SourceUnavailable { source_name: name },
                params.iter().filter_map(|p| by_id.remove(&p.id())),
            ),
        }
    }

    let BatchOutcome {
        statuses,
        reschedule,
        completed,
        error,
    } = outcome;
    ctx.flush("attach", keys, reschedule, statuses, completed.len()).await;

    if !completed.is_empty() {
        if let Err(err) = ctx.publisher.persist_attachments(&completed).await {
            ctx.requeue(completed.iter().filter_map(|a| by_id.remove(&a.id())));
            return Err(error.unwrap_or(err));
        }
        info!("attached {} filesystems", completed.len());
        for attachment in completed {
            let id = attachment.id();
            ctx.pending_attachments.remove(&id);
            ctx.attachments.insert(id, attachment);
        }
    }
    error.map_or(Ok(()), Err)
}

async fn attach_from_source(
    source_name: &str,
    source: &FilesystemSourceRef,
    params: Vec<FilesystemAttachmentParams>,
    ops: &mut HashMap<MachineStorageId, Operation>,
    classifier: &RetryClassifier,
) -> BatchOutcome<FilesystemAttachment> {
    debug!("attaching filesystems from {:?}: {:?}", source_name, params);
    let mut outcome = BatchOutcome::default();
    let results = match source.attach_filesystems(&params).await {
        Ok(results) => results,
        Err(err) => {
            outcome.abort(
                Error::batch_call("attaching", source_name, err),
                params.iter().filter_map(|p| ops.remove(&p.id())),
            );
            return outcome;
        }
    };
    if let Err(err) = check_result_count("attaching", source_name, params.len(), &results) {
        outcome.abort(err, params.iter().filter_map(|p| ops.remove(&p.id())));
        return outcome;
    }

    for (p, result) in params.iter().zip(results) {
        match result {
            Ok(attachment) => outcome.succeed(
                attachment,
                Some(EntityStatus::new(&p.filesystem, Status::Attached)),
            ),
            Err(err) => {
                debug!("failed to attach {} to {}: {}", p.filesystem, p.machine, err);
                outcome.fail(classifier, ops.remove(&p.id()), &p.filesystem, Status::Attaching, &err);
            }
        }
    }
    outcome
}
