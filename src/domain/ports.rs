//! Domain Ports - Core trait definitions for the provisioner
//!
//! These traits define the boundaries between the reconciliation engine and
//! the systems it drives: storage providers and the controller.
//!
//! Every bulk call is order preserving. The returned vector holds exactly one
//! result per input element, at the same position. A top-level `Err` means
//! the call as a whole failed and nothing can be said about single entities.

use crate::domain::types::{
    Filesystem, FilesystemAttachment, FilesystemAttachmentParams, FilesystemParams,
    FilesystemTag, EntityStatus, MachineStorageId, RemoveFilesystemParams,
};
use crate::error::Result;
use async_trait::async_trait;
use std::path::Path;
use std::sync::Arc;

/// Per-entity outcome of a bulk call
pub type EntityResults<T> = Vec<Result<T>>;

// =============================================================================
// Filesystem Source Port
// =============================================================================

/// Bulk storage API of one provider
#[async_trait]
pub trait FilesystemSource: Send + Sync {
    /// Source name used in logs
    fn name(&self) -> &str;

    /// Reject parameters the source can never satisfy
    fn validate_filesystem_params(&self, params: &FilesystemParams) -> Result<()>;

    /// Create filesystems
    async fn create_filesystems(
        &self,
        params: &[FilesystemParams],
    ) -> Result<EntityResults<Filesystem>>;

    /// Attach filesystems to machines
    async fn attach_filesystems(
        &self,
        params: &[FilesystemAttachmentParams],
    ) -> Result<EntityResults<FilesystemAttachment>>;

    /// Detach filesystems from machines
    async fn detach_filesystems(
        &self,
        params: &[FilesystemAttachmentParams],
    ) -> Result<EntityResults<()>>;

    /// Destroy filesystems and the data on them
    async fn destroy_filesystems(&self, filesystem_ids: &[String]) -> Result<EntityResults<()>>;

    /// Drop the provider relationship, keeping the data
    async fn release_filesystems(&self, filesystem_ids: &[String]) -> Result<EntityResults<()>>;
}

// =============================================================================
// Provider Registry Port
// =============================================================================

/// Resolves provider types to dynamic filesystem sources
pub trait ProviderRegistry: Send + Sync {
    /// Instantiate the dynamic source of a provider.
    ///
    /// Returns [`crate::Error::NonDynamicProvider`] when the provider exists but
    /// cannot create filesystems on its own.
    fn dynamic_source(&self, provider: &str, storage_dir: &Path) -> Result<FilesystemSourceRef>;
}

// =============================================================================
// Controller Facade Port
// =============================================================================

/// Client contract to the controller holding persisted entity state
#[async_trait]
pub trait ControllerFacade: Send + Sync {
    /// Record provisioned filesystems
    async fn set_filesystem_info(&self, filesystems: &[Filesystem]) -> Result<EntityResults<()>>;

    /// Record filesystem attachments
    async fn set_filesystem_attachment_info(
        &self,
        attachments: &[FilesystemAttachment],
    ) -> Result<EntityResults<()>>;

    /// Publish status transitions
    async fn set_status(&self, statuses: &[EntityStatus]) -> Result<EntityResults<()>>;

    /// Remove dead filesystems from state
    async fn remove(&self, tags: &[FilesystemTag]) -> Result<EntityResults<()>>;

    /// Remove detached attachments from state
    async fn remove_attachments(&self, ids: &[MachineStorageId]) -> Result<EntityResults<()>>;

    /// How each filesystem should be removed
    async fn remove_params(
        &self,
        tags: &[FilesystemTag],
    ) -> Result<EntityResults<RemoveFilesystemParams>>;
}

// =============================================================================
// Type Aliases for Arc'd Traits
// =============================================================================

pub type FilesystemSourceRef = Arc<dyn FilesystemSource>;
pub type ProviderRegistryRef = Arc<dyn ProviderRegistry>;
pub type ControllerFacadeRef = Arc<dyn ControllerFacade>;
