//! Detach Executor

use super::{check_result_count, BatchOutcome};
use crate::domain::ports::FilesystemSourceRef;
use crate::domain::types::{EntityStatus, FilesystemAttachmentParams, MachineStorageId, Status};
use crate::error::{Error, Result};
use crate::provisioner::context::ProvisionerContext;
use crate::provisioner::operation::{Operation, OperationKey, RetryClassifier};
use crate::provisioner::source::ResolvedSource;
use std::collections::HashMap;
use tracing::{debug, info, warn};

/// Detach filesystems for a batch of detach operations
pub async fn detach_filesystems(ctx: &mut ProvisionerContext, ops: Vec<Operation>) -> Result<()> {
    let keys: Vec<OperationKey> = ops.iter().map(Operation::key).collect();

    let mut by_id: HashMap<MachineStorageId, Operation> = HashMap::new();
    let mut params = Vec::with_capacity(ops.len());
    for op in ops {
        if let Some(p) = op.attachment_params() {
            params.push(p.clone());
            by_id.insert(p.id(), op);
        }
    }

    let tolerate_missing = ctx.config.environment.tolerate_missing_detach_source;
    let partition = ctx.resolver().attachments(&params, &ctx.filesystems)?;
    let mut outcome = BatchOutcome::default();
    for (name, source, params) in partition.groups() {
        if outcome.is_aborted() {
            outcome.reschedule.extend(params.iter().filter_map(|p| by_id.remove(&p.id())));
            continue;
        }
        match source {
            ResolvedSource::Ready(source) => outcome.merge(
                detach_from_source(&name, &source, params, &mut by_id, &ctx.classifier).await,
            ),
            ResolvedSource::Deferred => continue,
            ResolvedSource::Missing if tolerate_missing => {
                warn!(
                    "no filesystem source for {:?}, skipping detach of {} attachments",
                    name,
                    params.len()
                );
            }
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
    ctx.flush("detach", keys, reschedule, statuses, completed.len()).await;

    if !completed.is_empty() {
        if let Err(err) = ctx.publisher.remove_attachments(&completed).await {
            ctx.requeue(completed.iter().filter_map(|id| by_id.remove(id)));
            return Err(error.unwrap_or(err));
        }
        info!("detached {} filesystems", completed.len());
        for id in &completed {
            ctx.attachments.remove(id);
        }
    }
    error.map_or(Ok(()), Err)
}

async fn detach_from_source(
    source_name: &str,
    source: &FilesystemSourceRef,
    params: Vec<FilesystemAttachmentParams>,
    ops: &mut HashMap<MachineStorageId, Operation>,
    classifier: &RetryClassifier,
) -> BatchOutcome<MachineStorageId> {
    debug!("detaching filesystems from {:?}: {:?}", source_name, params);
    let mut outcome = BatchOutcome::default();
    let results = match source.detach_filesystems(&params).await {
        Ok(results) => results,
        Err(err) => {
            outcome.abort(
                Error::batch_call("detaching", source_name, err),
                params.iter().filter_map(|p| ops.remove(&p.id())),
            );
            return outcome;
        }
    };
    if let Err(err) = check_result_count("detaching", source_name, params.len(), &results) {
        outcome.abort(err, params.iter().filter_map(|p| ops.remove(&p.id())));
        return outcome;
    }

    for (p, result) in params.iter().zip(results) {
        let id = p.id();
        match result {
            // A filesystem has at most one attachment, so it is now detached.
            Ok(()) => outcome.succeed(id, Some(EntityStatus::new(&p.filesystem, Status::Detached))),
            Err(err) => {
                debug!("failed to detach {} from {}: {}", p.filesystem, p.machine, err);
                outcome.fail(classifier, ops.remove(&id), &p.filesystem, Status::Detaching, &err);
            }
        }
    }
    outcome
}
