//! End-to-end tests driving the worker loop against real sources and the
//! in-memory controller.

use assert_matches::assert_matches;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use storage_provisioner::{
    DesiredChange, Error, FilesystemAttachmentParams, FilesystemParams, FilesystemTag,
    InMemoryController, MachineTag, ProvisionerConfig, ProvisionerContext,
    RemoveFilesystemParams, SourceRegistry, Status, Worker, WorkerConfig, WorkerHandle,
};

fn config(storage_dir: &Path) -> WorkerConfig {
    let mut config = WorkerConfig {
        storage_dir: storage_dir.to_path_buf(),
        tmpfs_capacity_mib: 100,
        ..Default::default()
    };
    config.retry.initial_delay_ms = 10;
    config.retry.max_delay_ms = 40;
    config
}

fn start(config: &WorkerConfig) -> (Worker, WorkerHandle, Arc<InMemoryController>) {
    let controller = Arc::new(InMemoryController::new());
    let ctx = ProvisionerContext::new(
        ProvisionerConfig::from(config),
        Arc::new(SourceRegistry::with_defaults(config.tmpfs_capacity_mib)),
        controller.clone(),
    );
    let (worker, handle) = Worker::new(ctx, config.drain_interval());
    (worker, handle, controller)
}

fn filesystem(id: &str, provider: &str, size: u64) -> FilesystemParams {
    FilesystemParams {
        tag: FilesystemTag::new(id),
        volume: None,
        size,
        provider: provider.into(),
    }
}

fn attachment(id: &str, provider: &str) -> FilesystemAttachmentParams {
    FilesystemAttachmentParams {
        filesystem: FilesystemTag::new(id),
        machine: MachineTag::new("0"),
        provider: provider.into(),
        filesystem_id: String::new(),
        path: None,
        read_only: false,
    }
}

fn status(controller: &InMemoryController, tag: &str) -> Option<Status> {
    controller.status(tag).map(|s| s.status)
}

#[tokio::test]
async fn test_rootfs_lifecycle() {
    let dir = tempfile::tempdir().unwrap();
    let config = config(dir.path());
    let (mut worker, handle, controller) = start(&config);
    let tag = FilesystemTag::new("0");
    let id = attachment("0", "rootfs").id();

    handle
        .send(DesiredChange::FilesystemAlive(filesystem("0", "rootfs", 10)))
        .unwrap();
    handle
        .send(DesiredChange::AttachmentAlive(attachment("0", "rootfs")))
        .unwrap();

    // Create, then attach once the filesystem exists.
    worker.run_once(Instant::now()).await.unwrap();
    assert!(dir.path().join("filesystems").join("fs-0").is_dir());
    assert_eq!(status(&controller, "filesystem-0"), Some(Status::Attaching));

    worker.run_once(Instant::now()).await.unwrap();
    let mount = dir.path().join("fs-0");
    assert!(mount.is_dir());
    assert_eq!(controller.attachment(&id).map(|a| a.path), Some(mount));
    assert_eq!(status(&controller, "filesystem-0"), Some(Status::Attached));

    handle
        .send(DesiredChange::AttachmentDead(attachment("0", "rootfs")))
        .unwrap();
    worker.run_once(Instant::now()).await.unwrap();
    assert!(controller.attachment(&id).is_none());
    assert!(worker.context().attachment(&id).is_none());
    assert_eq!(status(&controller, "filesystem-0"), Some(Status::Detached));

    controller.set_remove_params(
        tag.clone(),
        RemoveFilesystemParams {
            destroy: true,
            filesystem_id: "fs-0".into(),
            provider: "rootfs".into(),
        },
    );
    handle
        .send(DesiredChange::FilesystemDead { tag: tag.clone() })
        .unwrap();
    worker.run_once(Instant::now()).await.unwrap();
    assert!(!dir.path().join("filesystems").join("fs-0").exists());
    assert!(controller.filesystem(&tag).is_none());
    assert!(worker.context().filesystem(&tag).is_none());
    assert!(worker.context().registry().is_empty());
}

#[tokio::test]
async fn test_capacity_failure_retries_until_space_is_released() {
    let dir = tempfile::tempdir().unwrap();
    let config = config(dir.path());
    let (mut worker, handle, controller) = start(&config);

    handle
        .send(DesiredChange::FilesystemAlive(filesystem("0", "tmpfs", 80)))
        .unwrap();
    handle
        .send(DesiredChange::FilesystemAlive(filesystem("1", "tmpfs", 80)))
        .unwrap();
    worker.run_once(Instant::now()).await.unwrap();

    assert_eq!(status(&controller, "filesystem-0"), Some(Status::Attaching));
    let pending = controller.status("filesystem-1").unwrap();
    assert_eq!(pending.status, Status::Pending);
    assert!(pending.info.unwrap().contains("Insufficient capacity"));
    assert_eq!(worker.metrics().operations("create", "succeeded"), 1);
    assert_eq!(worker.metrics().operations("create", "retried"), 1);
    assert_eq!(worker.metrics().pending(), 1);

    let filesystem_id = controller
        .filesystem(&FilesystemTag::new("0"))
        .unwrap()
        .filesystem_id;
    controller.set_remove_params(
        FilesystemTag::new("0"),
        RemoveFilesystemParams {
            destroy: false,
            filesystem_id,
            provider: "tmpfs".into(),
        },
    );
    handle
        .send(DesiredChange::FilesystemDead {
            tag: FilesystemTag::new("0"),
        })
        .unwrap();
    worker.run_once(Instant::now()).await.unwrap();
    assert!(controller.filesystem(&FilesystemTag::new("0")).is_none());

    tokio::time::sleep(Duration::from_millis(100)).await;
    worker.run_once(Instant::now()).await.unwrap();
    assert!(controller.filesystem(&FilesystemTag::new("1")).is_some());
    assert_eq!(status(&controller, "filesystem-1"), Some(Status::Attaching));
}

#[tokio::test]
async fn test_non_dynamic_provider_is_left_alone() {
    let dir = tempfile::tempdir().unwrap();
    let (mut worker, handle, controller) = start(&config(dir.path()));

    handle
        .send(DesiredChange::FilesystemAlive(filesystem("0", "loop", 10)))
        .unwrap();
    assert_eq!(worker.run_once(Instant::now()).await.unwrap(), 1);

    assert!(controller.filesystems().is_empty());
    assert!(controller.status_history().is_empty());
    assert!(worker.context().registry().is_empty());
}

#[tokio::test]
async fn test_unknown_provider_fails_the_pass() {
    let dir = tempfile::tempdir().unwrap();
    let (mut worker, handle, _controller) = start(&config(dir.path()));

    handle
        .send(DesiredChange::FilesystemAlive(filesystem("0", "nfs", 10)))
        .unwrap();
    let err = worker.run_once(Instant::now()).await.unwrap_err();
    assert_matches!(err, Error::UnknownProvider { .. });
    assert_eq!(worker.metrics().batch_failures("create"), 1);
    assert_eq!(worker.context().registry().len(), 1);
}

#[tokio::test]
async fn test_publication_failure_does_not_create_twice() {
    let dir = tempfile::tempdir().unwrap();
    let (mut worker, handle, controller) = start(&config(dir.path()));
    controller.fail_next("SetFilesystemInfo");

    handle
        .send(DesiredChange::FilesystemAlive(filesystem("0", "tmpfs", 60)))
        .unwrap();
    let err = worker.run_once(Instant::now()).await.unwrap_err();
    assert_matches!(err, Error::Controller { .. });
    assert!(worker.context().is_unpublished(&FilesystemTag::new("0")));

    tokio::time::sleep(Duration::from_millis(100)).await;
    worker.run_once(Instant::now()).await.unwrap();

    // A second provider create would not fit in the remaining capacity.
    let fs = controller.filesystem(&FilesystemTag::new("0")).unwrap();
    assert_eq!(fs.size, 60);
    assert_eq!(controller.filesystems().len(), 1);
    assert!(worker.context().filesystem(&FilesystemTag::new("0")).is_some());
    assert_eq!(status(&controller, "filesystem-0"), Some(Status::Attaching));
}

#[test]
fn test_manifest_file() {
    let dir = tempfile::tempdir().unwrap();
    let path: PathBuf = dir.path().join("manifest.yaml");
    std::fs::write(
        &path,
        "- change: filesystem_alive\n  tag: \"0\"\n  size: 10\n  provider: rootfs\n",
    )
    .unwrap();

    let changes = storage_provisioner::load_manifest(&path).unwrap();
    assert_eq!(
        changes,
        vec![DesiredChange::FilesystemAlive(filesystem("0", "rootfs", 10))]
    );
}
