//! Remove Executor
//!
//! Destroys or releases filesystems the controller no longer wants. Whether
//! the underlying storage is deleted is decided per filesystem by the
//! controller's removal parameters.

use super::{check_result_count, BatchOutcome};
use crate::domain::ports::FilesystemSourceRef;
use crate::domain::types::{FilesystemParams, FilesystemTag, RemoveFilesystemParams, Status};
use crate::error::{Error, Result};
use crate::provisioner::context::ProvisionerContext;
use crate::provisioner::operation::{Operation, OperationKey, RetryClassifier};
use crate::provisioner::source::ResolvedSource;
use std::collections::HashMap;
use tracing::{debug, info};

/// Filesystems of one source split by removal mode, as `(tag, filesystem id)`
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Removals {
    pub destroy: Vec<(FilesystemTag, String)>,
    pub release: Vec<(FilesystemTag, String)>,
}

/// Split removals into disjoint destroy and release sets, keeping order
pub fn split_removals(tags: &[FilesystemTag], params: &[RemoveFilesystemParams]) -> Removals {
    let mut removals = Removals::default();
    for (tag, p) in tags.iter().zip(params) {
        let entry = (tag.clone(), p.filesystem_id.clone());
        if p.destroy {
            removals.destroy.push(entry);
        } else {
            removals.release.push(entry);
        }
    }
    removals
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RemovalMode {
    /// Delete the underlying storage
    Destroy,
    /// Drop the provider relationship, keeping the data
    Release,
}

impl RemovalMode {
    fn verb(self) -> &'static str {
        match self {
            RemovalMode::Destroy => "destroying",
            RemovalMode::Release => "releasing",
        }
    }
}

/// Remove the filesystems of a batch of remove operations
pub async fn remove_filesystems(ctx: &mut ProvisionerContext, ops: Vec<Operation>) -> Result<()> {
    let keys: Vec<OperationKey> = ops.iter().map(Operation::key).collect();

    let mut by_tag: HashMap<FilesystemTag, Operation> = HashMap::new();
    let mut tags = Vec::with_capacity(ops.len());
    for op in ops {
        if let Some(tag) = op.remove_tag() {
            tags.push(tag.clone());
            by_tag.insert(tag.clone(), op);
        }
    }
    if tags.is_empty() {
        ctx.flush("remove", keys, Vec::new(), Vec::new(), 0).await;
        return Ok(());
    }

    let results = ctx.publisher.remove_params(&tags).await?;
    if results.len() != tags.len() {
        return Err(Error::controller(
            "getting filesystem removal params",
            format!("expected {} results, got {}", tags.len(), results.len()),
        ));
    }

    let mut outcome = BatchOutcome::default();
    let mut removal_params: HashMap<FilesystemTag, RemoveFilesystemParams> = HashMap::new();
    let mut params = Vec::with_capacity(tags.len());
    for (tag, result) in tags.iter().zip(results) {
        match result {
            Ok(p) => {
                params.push(FilesystemParams {
                    tag: tag.clone(),
                    volume: ctx.filesystems.get(tag).and_then(|fs| fs.volume.clone()),
                    size: 0,
                    provider: p.provider.clone(),
                });
                removal_params.insert(tag.clone(), p);
            }
            Err(err) => {
                debug!("failed to get removal params for {}: {}", tag, err);
                outcome.fail(&ctx.classifier, by_tag.remove(tag), tag, Status::Destroying, &err);
            }
        }
    }

    let partition = ctx.resolver().filesystems(&params)?;
    for (name, source, params) in partition.groups() {
        if outcome.is_aborted() {
            outcome.reschedule.extend(params.iter().filter_map(|p| by_tag.remove(&p.tag)));
            continue;
        }
        let source = match source {
            ResolvedSource::Ready(source) => source,
            ResolvedSource::Deferred => continue,
            ResolvedSource::Missing => {
                outcome.abort(
                    Error::SourceUnavailable { source_name: name },
                    params.iter().filter_map(|p| by_tag.remove(&p.tag)),
                );
                continue;
            }
        };
        debug!("removing filesystems from {:?}: {:?}", name, params);
        let tags: Vec<FilesystemTag> = params.into_iter().map(|p| p.tag).collect();
        let source_params: Vec<RemoveFilesystemParams> = tags
            .iter()
            .filter_map(|tag| removal_params.get(tag).cloned())
            .collect();
        let removals = split_removals(&tags, &source_params);

        for (mode, entries) in [
            (RemovalMode::Destroy, removals.destroy),
            (RemovalMode::Release, removals.release),
        ] {
            if outcome.is_aborted() {
                outcome
                    .reschedule
                    .extend(entries.iter().filter_map(|(tag, _)| by_tag.remove(tag)));
                continue;
            }
            outcome.merge(
                remove_from_source(&name, &source, mode, entries, &mut by_tag, &ctx.classifier)
                    .await,
            );
        }
    }

    let BatchOutcome {
        statuses,
        reschedule,
        completed,
        error,
    } = outcome;
    ctx.flush("remove", keys, reschedule, statuses, completed.len()).await;

    if !completed.is_empty() {
        if let Err(err) = ctx.publisher.remove_filesystems(&completed).await {
            ctx.requeue(completed.iter().filter_map(|tag| by_tag.remove(tag)));
            return Err(error.unwrap_or(err));
        }
        info!("removed {} filesystems", completed.len());
        for tag in &completed {
            ctx.filesystems.remove(tag);
            ctx.unpublished.remove(tag);
        }
    }
    error.map_or(Ok(()), Err)
}

async fn remove_from_source(
    source_name: &str,
    source: &FilesystemSourceRef,
    mode: RemovalMode,
    entries: Vec<(FilesystemTag, String)>,
    ops: &mut HashMap<FilesystemTag, Operation>,
    classifier: &RetryClassifier,
) -> BatchOutcome<FilesystemTag> {
    let mut outcome = BatchOutcome::default();
    if entries.is_empty() {
        return outcome;
    }

    let ids: Vec<String> = entries.iter().map(|(_, id)| id.clone()).collect();
    let results = match mode {
        RemovalMode::Destroy => source.destroy_filesystems(&ids).await,
        RemovalMode::Release => source.release_filesystems(&ids).await,
    };
    let checked = results
        .map_err(|err| Error::batch_call(mode.verb(), source_name, err))
        .and_then(|results| {
            check_result_count(mode.verb(), source_name, ids.len(), &results).map(|()| results)
        });
    let results = match checked {
        Ok(results) => results,
        Err(err) => {
            outcome.abort(err, entries.iter().filter_map(|(tag, _)| ops.remove(tag)));
            return outcome;
        }
    };

    for ((tag, _), result) in entries.into_iter().zip(results) {
        match result {
            Ok(()) => outcome.succeed(tag, None),
            Err(err) => {
                debug!("{} {} failed: {}", mode.verb(), tag, err);
                outcome.fail(classifier, ops.remove(&tag), &tag, Status::Destroying, &err);
            }
        }
    }
    outcome
}
