//! Create Executor
//!
//! Validates and creates filesystems, one bulk call per source, then records
//! the created filesystems with the controller.

use super::{check_result_count, BatchOutcome};
use crate::domain::ports::FilesystemSourceRef;
use crate::domain::types::{EntityStatus, Filesystem, FilesystemParams, FilesystemTag, Status};
use crate::error::{Error, Result};
use crate::provisioner::context::ProvisionerContext;
use crate::provisioner::operation::{Operation, OperationKey, RetryClassifier};
use crate::provisioner::source::ResolvedSource;
use std::collections::HashMap;
use tracing::{debug, info};

/// Create the filesystems described by a batch of create operations
pub async fn create_filesystems(ctx: &mut ProvisionerContext, ops: Vec<Operation>) -> Result<()> {
    let keys: Vec<OperationKey> = ops.iter().map(Operation::key).collect();

    let mut by_tag: HashMap<FilesystemTag, Operation> = HashMap::new();
    let mut submit = Vec::with_capacity(ops.len());
    let mut republish = Vec::new();
    for op in ops {
        let Some(params) = op.create_params() else {
            continue;
        };
        if ctx.filesystems.contains_key(&params.tag) {
            debug!("{} already provisioned, skipping create", params.tag);
            continue;
        }
        let tag = params.tag.clone();
        // Created by the provider earlier, but never accepted by the controller.
        if let Some(fs) = ctx.unpublished.get(&tag) {
            debug!("{} already created, publishing again", tag);
            republish.push(fs.clone());
        } else {
            submit.push(params.clone());
        }
        by_tag.insert(tag, op);
    }

    let partition = ctx.resolver().filesystems(&submit)?;
    let mut outcome = BatchOutcome::default();
    for (name, source, params) in partition.groups() {
        if outcome.is_aborted() {
            outcome.reschedule.extend(params.iter().filter_map(|p| by_tag.remove(&p.tag)));
            continue;
        }
        match source {
            ResolvedSource::Ready(source) => outcome.merge(
                create_from_source(&name, &source, params, &mut by_tag, &ctx.classifier).await,
            ),
            ResolvedSource::Deferred => continue,
            ResolvedSource::Missing => outcome.abort(
                Error::SourceUnavailable { source_name: name },
                params.iter().filter_map(|p| by_tag.remove(&p.tag)),
            ),
        }
    }

    let BatchOutcome {
        mut statuses,
        reschedule,
        completed,
        error,
    } = outcome;
    for fs in &completed {
        ctx.unpublished.insert(fs.tag.clone(), fs.clone());
    }
    statuses.extend(
        republish
            .iter()
            .map(|fs| EntityStatus::new(&fs.tag, Status::Attaching)),
    );
    let succeeded = completed.len() + republish.len();
    ctx.flush("create", keys, reschedule, statuses, succeeded).await;

    let mut created = republish;
    created.extend(completed);
    if !created.is_empty() {
        if let Err(err) = ctx.publisher.persist_filesystems(&created).await {
            // Stay unpublished; the retry publishes without creating again.
            ctx.requeue(created.iter().filter_map(|fs| by_tag.remove(&fs.tag)));
            return Err(error.unwrap_or(err));
        }
        info!("provisioned {} filesystems", created.len());
        for fs in created {
            ctx.unpublished.remove(&fs.tag);
            ctx.filesystems.insert(fs.tag.clone(), fs);
        }
    }
    error.map_or(Ok(()), Err)
}

async fn create_from_source(
    source_name: &str,
    source: &FilesystemSourceRef,
    params: Vec<FilesystemParams>,
    ops: &mut HashMap<FilesystemTag, Operation>,
    classifier: &RetryClassifier,
) -> BatchOutcome<Filesystem> {
    debug!("creating filesystems from {:?}: {:?}", source_name, params);
    let mut outcome = BatchOutcome::default();

    // Validation failures are permanent; only the valid remainder is submitted.
    let mut valid = Vec::with_capacity(params.len());
    for p in params {
        match source.validate_filesystem_params(&p) {
            Ok(()) => valid.push(p),
            Err(err) => {
                debug!("failed to validate parameters for {}: {}", p.tag, err);
                ops.remove(&p.tag);
                outcome
                    .statuses
                    .push(EntityStatus::new(&p.tag, Status::Error).with_info(&err));
            }
        }
    }
    if valid.is_empty() {
        return outcome;
    }

    let results = match source.create_filesystems(&valid).await {
        Ok(results) => results,
        Err(err) => {
            outcome.abort(
                Error::batch_call("creating", source_name, err),
                valid.iter().filter_map(|p| ops.remove(&p.tag)),
            );
            return outcome;
        }
    };
    if let Err(err) = check_result_count("creating", source_name, valid.len(), &results) {
        outcome.abort(err, valid.iter().filter_map(|p| ops.remove(&p.tag)));
        return outcome;
    }

    for (p, result) in valid.iter().zip(results) {
        match result {
            Ok(fs) => outcome.succeed(fs, Some(EntityStatus::new(&p.tag, Status::Attaching))),
            Err(err) => {
                debug!("failed to create {}: {}", p.tag, err);
                outcome.fail(classifier, ops.remove(&p.tag), &p.tag, Status::Pending, &err);
            }
        }
    }
    outcome
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::types::VolumeTag;
    use crate::provisioner::operation::classify_by_action;
    use crate::provisioner::ops::fake::{harness, two_source_harness};
    use assert_matches::assert_matches;

    fn create(id: &str, provider: &str) -> Operation {
        Operation::create(FilesystemParams {
            tag: FilesystemTag::new(id),
            volume: None,
            size: 1024,
            provider: provider.into(),
        })
    }

    #[tokio::test]
    async fn test_create_success() {
        let (mut ctx, source, controller) = harness();

        create_filesystems(&mut ctx, vec![create("0", "loop")]).await.unwrap();

        let tag = FilesystemTag::new("0");
        assert_eq!(
            controller.status("filesystem-0").map(|s| s.status),
            Some(Status::Attaching)
        );
        assert_eq!(controller.filesystem(&tag).unwrap().filesystem_id, "fs-0");
        assert_eq!(ctx.filesystem(&tag).unwrap().filesystem_id, "fs-0");
        assert!(!ctx.is_unpublished(&tag));
        assert!(ctx.registry().is_empty());
        assert_eq!(source.calls("create"), vec![vec!["0".to_string()]]);
    }

    #[tokio::test]
    async fn test_entity_error_keeps_pending_and_reschedules() {
        let (mut ctx, source, controller) = harness();
        source.fail("0");

        create_filesystems(&mut ctx, vec![create("0", "loop")]).await.unwrap();

        let status = controller.status("filesystem-0").unwrap();
        assert_eq!(status.status, Status::Pending);
        assert!(status.info.unwrap().contains("busy"));
        assert!(controller.filesystems().is_empty());
        assert_eq!(controller.calls("SetFilesystemInfo"), 0);

        let key = OperationKey::Filesystem(FilesystemTag::new("0"));
        let pending = ctx.registry().pending(&key).unwrap();
        assert_eq!(pending.retry.attempt, 1);
        assert_eq!(pending.retry.next_delay, ctx.registry().policy().initial_delay);
    }

    #[tokio::test]
    async fn test_validation_failure_keeps_alignment() {
        let (mut ctx, source, controller) = harness();
        source.reject("1");
        source.fail("2");

        let ops = vec![create("0", "loop"), create("1", "loop"), create("2", "loop")];
        create_filesystems(&mut ctx, ops).await.unwrap();

        assert_eq!(source.calls("create"), vec![vec!["0".to_string(), "2".to_string()]]);
        let status = |tag: &str| controller.status(tag).map(|s| s.status);
        assert_eq!(status("filesystem-0"), Some(Status::Attaching));
        assert_eq!(status("filesystem-1"), Some(Status::Error));
        assert_eq!(status("filesystem-2"), Some(Status::Pending));

        // The rejected entity is never retried.
        assert!(!ctx
            .registry()
            .is_pending(&OperationKey::Filesystem(FilesystemTag::new("1"))));
        assert!(ctx
            .registry()
            .is_pending(&OperationKey::Filesystem(FilesystemTag::new("2"))));
    }

    #[tokio::test]
    async fn test_one_status_publication_per_batch() {
        let (mut ctx, source, controller) = harness();
        let managed = std::sync::Arc::new(crate::sources::ManagedFilesystemSource::new("/storage"));
        ctx = ctx.with_managed_source(managed);
        source.fail("1");

        let mut on_volume = create("2", "managed");
        if let crate::provisioner::operation::OperationKind::Create(params) = &mut on_volume.kind {
            params.volume = Some(VolumeTag::new("7"));
        }
        let ops = vec![create("0", "loop"), create("1", "loop"), on_volume];
        create_filesystems(&mut ctx, ops).await.unwrap();

        assert_eq!(controller.calls("SetStatus"), 1);
        assert_eq!(controller.status_history().len(), 3);
    }

    #[tokio::test]
    async fn test_non_dynamic_provider_is_deferred() {
        let (mut ctx, source, controller) = harness();

        create_filesystems(&mut ctx, vec![create("0", "ebs")]).await.unwrap();

        assert!(source.calls("create").is_empty());
        assert_eq!(controller.calls("SetStatus"), 0);
        assert!(ctx.registry().is_empty());
    }

    #[tokio::test]
    async fn test_already_created_is_not_resubmitted() {
        let (mut ctx, source, controller) = harness();
        controller.fail_next("SetFilesystemInfo");

        let err = create_filesystems(&mut ctx, vec![create("0", "loop")]).await.unwrap_err();
        assert_matches!(err, Error::Controller { .. });
        assert!(ctx.is_unpublished(&FilesystemTag::new("0")));

        // Replay after the failed publication.
        create_filesystems(&mut ctx, vec![create("0", "loop")]).await.unwrap();
        assert_eq!(source.calls("create").len(), 1);
        assert_eq!(controller.filesystems().len(), 1);

        // Replay once confirmed.
        create_filesystems(&mut ctx, vec![create("0", "loop")]).await.unwrap();
        assert_eq!(source.calls("create").len(), 1);
        assert_eq!(controller.filesystems().len(), 1);
    }

    #[tokio::test]
    async fn test_bulk_call_failure_aborts_batch() {
        let (mut ctx, source, controller) = harness();
        source.fail_next_call();

        let err = create_filesystems(&mut ctx, vec![create("0", "loop")]).await.unwrap_err();
        assert_matches!(err, Error::BatchCall { operation: "creating", .. });
        assert_eq!(controller.calls("SetStatus"), 0);
    }

    #[tokio::test]
    async fn test_bulk_call_failure_rearms_unsubmitted() {
        let (mut ctx, source, _controller) = harness();
        source.fail_next_call();

        create_filesystems(&mut ctx, vec![create("0", "loop")]).await.unwrap_err();

        let key = OperationKey::Filesystem(FilesystemTag::new("0"));
        assert!(ctx.registry().is_pending(&key));
        assert_eq!(ctx.registry().pending(&key).unwrap().retry.attempt, 1);
    }

    #[tokio::test]
    async fn test_failed_source_keeps_earlier_creates() {
        let (mut ctx, first, second, controller) = two_source_harness();
        second.fail_next_call();

        let ops = vec![create("0", "loop"), create("1", "nfs")];
        let err = create_filesystems(&mut ctx, ops).await.unwrap_err();
        assert_matches!(err, Error::BatchCall { operation: "creating", .. });

        // The first source's filesystem is recorded despite the failure.
        let tag = FilesystemTag::new("0");
        assert!(ctx.filesystem(&tag).is_some());
        assert!(controller.filesystem(&tag).is_some());
        assert_eq!(
            controller.status("filesystem-0").map(|s| s.status),
            Some(Status::Attaching)
        );
        assert!(!ctx.registry().is_pending(&OperationKey::Filesystem(tag)));
        assert!(ctx
            .registry()
            .is_pending(&OperationKey::Filesystem(FilesystemTag::new("1"))));

        let ops = vec![create("0", "loop"), create("1", "nfs")];
        create_filesystems(&mut ctx, ops).await.unwrap();
        assert_eq!(first.calls("create"), vec![vec!["0".to_string()]]);
        assert_eq!(second.calls("create").len(), 2);
        assert_eq!(controller.filesystems().len(), 2);
    }

    #[tokio::test]
    async fn test_publication_failure_rearms_created_but_not_rejected() {
        let (mut ctx, source, controller) = harness();
        source.reject("1");
        controller.fail_next("SetFilesystemInfo");

        let err = create_filesystems(&mut ctx, vec![create("0", "loop"), create("1", "loop")])
            .await
            .unwrap_err();
        assert_matches!(err, Error::Controller { .. });

        assert!(ctx
            .registry()
            .is_pending(&OperationKey::Filesystem(FilesystemTag::new("0"))));
        assert!(!ctx
            .registry()
            .is_pending(&OperationKey::Filesystem(FilesystemTag::new("1"))));
        assert_eq!(
            controller.status("filesystem-1").map(|s| s.status),
            Some(Status::Error)
        );
    }

    #[tokio::test]
    async fn test_action_classifier_gives_up_on_invalid_params() {
        let (ctx, source, controller) = harness();
        let mut ctx = ctx.with_classifier(classify_by_action());
        source.refuse("0");
        source.fail("1");

        create_filesystems(&mut ctx, vec![create("0", "loop"), create("1", "loop")])
            .await
            .unwrap();

        let status = controller.status("filesystem-0").unwrap();
        assert_eq!(status.status, Status::Error);
        assert!(status.info.unwrap().contains("refused by provider"));
        assert!(!ctx
            .registry()
            .is_pending(&OperationKey::Filesystem(FilesystemTag::new("0"))));

        // Provider failures stay transient.
        assert_eq!(
            controller.status("filesystem-1").map(|s| s.status),
            Some(Status::Pending)
        );
        assert_eq!(ctx.registry().len(), 1);
        assert_eq!(ctx.metrics().operations("create", "failed"), 1);
    }

    #[tokio::test]
    async fn test_missing_managed_source_is_fatal() {
        let (mut ctx, _source, _controller) = harness();
        let mut op = create("0", "loop");
        if let crate::provisioner::operation::OperationKind::Create(params) = &mut op.kind {
            params.volume = Some(VolumeTag::new("3"));
        }

        let err = create_filesystems(&mut ctx, vec![op]).await.unwrap_err();
        assert_matches!(err, Error::SourceUnavailable { .. });
    }
}
