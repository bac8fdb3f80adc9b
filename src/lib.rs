//! Storage Provisioner
//!
//! Reconciles the filesystems and filesystem attachments a controller wants
//! with what storage providers actually hold.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────────┐
//! │                        Desired State (WorkerHandle)                         │
//! ├─────────────────────────────────────────────────────────────────────────────┤
//! │                           Reconciliation Loop                               │
//! │  ┌─────────────────┐  ┌─────────────────┐  ┌─────────────────────────────┐  │
//! │  │   Operation     │  │     Source      │  │      Batch Executors        │  │
//! │  │   Registry      │──│    Resolver     │──│ create/attach/detach/remove │  │
//! │  └─────────────────┘  └─────────────────┘  └─────────────┬───────────────┘  │
//! │                                                          │                  │
//! │                                            ┌─────────────┴───────────────┐  │
//! │                                            │  Status & State Publisher   │  │
//! │                                            └─────────────────────────────┘  │
//! ├─────────────────────────────────────────────────────────────────────────────┤
//! │                           Filesystem Sources                                │
//! │  ┌─────────────────┐  ┌─────────────────┐  ┌─────────────────────────────┐  │
//! │  │    Managed      │  │     Rootfs      │  │           Tmpfs             │  │
//! │  │ (volume-backed) │  │  (directories)  │  │        (in-memory)          │  │
//! │  └─────────────────┘  └─────────────────┘  └─────────────────────────────┘  │
//! └─────────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Modules
//!
//! - [`provisioner`]: Operation registry, executors and the worker loop
//! - [`sources`]: Filesystem sources and the provider registry
//! - [`controller`]: In-memory controller facade
//! - [`domain`]: Core domain types and ports
//! - [`config`]: Worker configuration
//! - [`error`]: Error types and handling

pub mod config;
pub mod controller;
pub mod domain;
pub mod error;
pub mod provisioner;
pub mod sources;

// Re-export commonly used types
pub use config::{ErrorClassification, ModelKind, RetryConfig, WorkerConfig};

pub use controller::InMemoryController;

pub use domain::ports::{
    ControllerFacade, ControllerFacadeRef, EntityResults, FilesystemSource, FilesystemSourceRef,
    ProviderRegistry, ProviderRegistryRef,
};
pub use domain::types::{
    EntityStatus, Filesystem, FilesystemAttachment, FilesystemAttachmentParams, FilesystemParams,
    FilesystemTag, MachineStorageId, MachineTag, RemoveFilesystemParams, Status, VolumeTag,
};

pub use error::{Error, ErrorAction, Result};

pub use provisioner::{
    load_manifest, parse_manifest, DeploymentEnvironment, DesiredChange, OperationRegistry, ProvisionerConfig,
    ProvisionerContext, ProvisionerMetrics, RestartBackoff, RetryClassifier, RetryPolicy, Worker,
    WorkerHandle,
};

pub use sources::{ManagedFilesystemSource, RootfsSource, SourceRegistry, TmpfsSource};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library name
pub const NAME: &str = env!("CARGO_PKG_NAME");
