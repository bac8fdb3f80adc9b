//! Provisioner Context
//!
//! State owned by the reconciliation loop: the operation registry, local
//! caches of filesystems and attachments, and the collaborators the batch
//! executors call. Only the loop's single task touches it, so nothing in here
//! is locked.

use super::metrics::{outcome, ProvisionerMetrics};
use super::operation::{retry_all, Operation, OperationKey, RetryClassifier, RetryPolicy};
use super::publisher::StatusPublisher;
use super::scheduler::OperationRegistry;
use super::source::SourceResolver;
use crate::config::{ModelKind, WorkerConfig};
use crate::domain::ports::{ControllerFacadeRef, FilesystemSourceRef, ProviderRegistryRef};
use crate::domain::types::{
    EntityStatus, Filesystem, FilesystemAttachment, FilesystemAttachmentParams, FilesystemTag,
    MachineStorageId, Status,
};
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Instant;

/// Capabilities of the environment the worker runs in
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeploymentEnvironment {
    pub kind: ModelKind,
    /// Detach skips a source that cannot be found instead of failing the batch
    pub tolerate_missing_detach_source: bool,
}

impl DeploymentEnvironment {
    pub fn new(kind: ModelKind) -> Self {
        Self {
            kind,
            tolerate_missing_detach_source: kind == ModelKind::Caas,
        }
    }
}

/// Settings the executors consult
#[derive(Debug, Clone)]
pub struct ProvisionerConfig {
    pub storage_dir: PathBuf,
    pub environment: DeploymentEnvironment,
    pub retry: RetryPolicy,
}

impl From<&WorkerConfig> for ProvisionerConfig {
    fn from(config: &WorkerConfig) -> Self {
        Self {
            storage_dir: config.storage_dir.clone(),
            environment: DeploymentEnvironment {
                kind: config.model_kind,
                tolerate_missing_detach_source: config.tolerates_missing_detach_source(),
            },
            retry: config.retry.policy(),
        }
    }
}

/// Everything one reconciliation loop owns
pub struct ProvisionerContext {
    pub(crate) config: ProvisionerConfig,
    pub(crate) registry: OperationRegistry,
    /// Filesystems confirmed by the controller
    pub(crate) filesystems: HashMap<FilesystemTag, Filesystem>,
    /// Filesystems created by a provider but not yet accepted by the controller
    pub(crate) unpublished: HashMap<FilesystemTag, Filesystem>,
    pub(crate) attachments: HashMap<MachineStorageId, FilesystemAttachment>,
    /// Attachments waiting for their filesystem to be provisioned
    pub(crate) pending_attachments: HashMap<MachineStorageId, FilesystemAttachmentParams>,
    pub(crate) managed_source: Option<FilesystemSourceRef>,
    pub(crate) providers: ProviderRegistryRef,
    pub(crate) publisher: StatusPublisher,
    pub(crate) classifier: RetryClassifier,
    pub(crate) metrics: ProvisionerMetrics,
}

impl ProvisionerContext {
    pub fn new(
        config: ProvisionerConfig,
        providers: ProviderRegistryRef,
        controller: ControllerFacadeRef,
    ) -> Self {
        Self {
            registry: OperationRegistry::new(config.retry),
            config,
            filesystems: HashMap::new(),
            unpublished: HashMap::new(),
            attachments: HashMap::new(),
            pending_attachments: HashMap::new(),
            managed_source: None,
            providers,
            publisher: StatusPublisher::new(controller),
            classifier: retry_all(),
            metrics: ProvisionerMetrics::new(),
        }
    }

    /// Source for filesystems layered on volumes
    pub fn with_managed_source(mut self, source: FilesystemSourceRef) -> Self {
        self.managed_source = Some(source);
        self
    }

    /// Policy deciding which provider errors are retried
    pub fn with_classifier(mut self, classifier: RetryClassifier) -> Self {
        self.classifier = classifier;
        self
    }

    pub fn with_metrics(mut self, metrics: ProvisionerMetrics) -> Self {
        self.metrics = metrics;
        self
    }

    /// Seed the local cache with filesystems the controller already knows
    pub fn with_filesystems(mut self, filesystems: impl IntoIterator<Item = Filesystem>) -> Self {
        for fs in filesystems {
            self.filesystems.insert(fs.tag.clone(), fs);
        }
        self
    }

    pub fn config(&self) -> &ProvisionerConfig {
        &self.config
    }

    pub fn registry(&self) -> &OperationRegistry {
        &self.registry
    }

    pub fn registry_mut(&mut self) -> &mut OperationRegistry {
        &mut self.registry
    }

    pub fn metrics(&self) -> &ProvisionerMetrics {
        &self.metrics
    }

    pub fn filesystem(&self, tag: &FilesystemTag) -> Option<&Filesystem> {
        self.filesystems.get(tag)
    }

    pub fn attachment(&self, id: &MachineStorageId) -> Option<&FilesystemAttachment> {
        self.attachments.get(id)
    }

    pub fn pending_attachment(&self, id: &MachineStorageId) -> Option<&FilesystemAttachmentParams> {
        self.pending_attachments.get(id)
    }

    pub fn is_unpublished(&self, tag: &FilesystemTag) -> bool {
        self.unpublished.contains_key(tag)
    }

    pub(crate) fn resolver(&self) -> SourceResolver<'_> {
        SourceResolver {
            storage_dir: &self.config.storage_dir,
            managed: self.managed_source.as_ref(),
            registry: self.providers.as_ref(),
        }
    }

    /// Finish a batch: settle every drained key, re-arm failures and
    /// publish statuses, once.
    pub(crate) async fn flush(
        &mut self,
        kind: &'static str,
        keys: Vec<OperationKey>,
        reschedule: Vec<Operation>,
        statuses: Vec<EntityStatus>,
        succeeded: usize,
    ) {
        for key in &keys {
            self.registry.complete(key);
        }
        let now = Instant::now();
        let retried = reschedule.len();
        for op in reschedule {
            self.registry.reschedule(op, now);
        }

        let failed = statuses.iter().filter(|s| s.status == Status::Error).count();
        self.metrics.record(kind, outcome::SUCCEEDED, succeeded);
        self.metrics.record(kind, outcome::RETRIED, retried);
        self.metrics.record(kind, outcome::FAILED, failed);
        self.metrics.set_pending(self.registry.len());

        self.publisher.publish_status(&statuses).await;
    }

    /// Re-arm operations whose outcome could not be recorded
    pub(crate) fn requeue(&mut self, ops: impl IntoIterator<Item = Operation>) {
        let now = Instant::now();
        for op in ops {
            self.registry.reschedule(op, now);
        }
        self.metrics.set_pending(self.registry.len());
    }
}

/// Shorthand used by tests across the provisioner
#[cfg(test)]
pub(crate) fn test_context(
    storage_dir: &str,
    providers: ProviderRegistryRef,
    controller: ControllerFacadeRef,
) -> ProvisionerContext {
    ProvisionerContext::new(
        ProvisionerConfig {
            storage_dir: PathBuf::from(storage_dir),
            environment: DeploymentEnvironment::new(ModelKind::Iaas),
            retry: RetryPolicy::default(),
        },
        providers,
        controller,
    )
}
