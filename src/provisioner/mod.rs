//! Storage Provisioner
//!
//! The reconciliation engine: an operation registry with per-entity backoff,
//! source resolution, the four batch executors and the loop driving them.

pub mod context;
pub mod metrics;
pub mod operation;
pub mod ops;
pub mod publisher;
pub mod scheduler;
pub mod source;
pub mod worker;

pub use context::{DeploymentEnvironment, ProvisionerConfig, ProvisionerContext};
pub use metrics::ProvisionerMetrics;
pub use operation::{
    classify_by_action, retry_all, ErrorClass, Operation, OperationKey, OperationKind,
    RetryClassifier, RetryPolicy, RetryState,
};
pub use ops::{default_mount_path, split_removals, Removals};
pub use publisher::StatusPublisher;
pub use scheduler::OperationRegistry;
pub use source::{Partition, ResolvedSource, SourceResolver};
pub use worker::{
    load_manifest, parse_manifest, DesiredChange, RestartBackoff, Worker, WorkerHandle,
};
