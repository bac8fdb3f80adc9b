//! Domain Types - Filesystems, attachments and their lifecycle status
//!
//! Tags identify entities the controller knows about. Provider-assigned
//! identifiers (`filesystem_id`) only exist once a source has created the
//! filesystem.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

// =============================================================================
// Tags
// =============================================================================

macro_rules! entity_tag {
    ($(#[$meta:meta])* $name:ident, $prefix:literal) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        pub struct $name(pub String);

        impl $name {
            pub const PREFIX: &'static str = $prefix;

            pub fn new(id: impl Into<String>) -> Self {
                Self(id.into())
            }

            /// The bare identifier, without the kind prefix
            pub fn id(&self) -> &str {
                &self.0
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}-{}", $prefix, self.0)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_string())
            }
        }
    };
}

entity_tag!(
    /// Stable identifier of a filesystem
    FilesystemTag,
    "filesystem"
);
entity_tag!(
    /// Identifier of a volume backing a managed filesystem
    VolumeTag,
    "volume"
);
entity_tag!(
    /// Identifier of the machine a filesystem is attached to
    MachineTag,
    "machine"
);

/// Composite key of a filesystem attachment
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct MachineStorageId {
    pub machine: MachineTag,
    pub filesystem: FilesystemTag,
}

impl MachineStorageId {
    pub fn new(machine: MachineTag, filesystem: FilesystemTag) -> Self {
        Self { machine, filesystem }
    }
}

impl std::fmt::Display for MachineStorageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.filesystem, self.machine)
    }
}

/// Storage provider type name, e.g. `rootfs` or `tmpfs`
pub type ProviderType = String;

// =============================================================================
// Entities
// =============================================================================

/// A provisioned filesystem
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Filesystem {
    pub tag: FilesystemTag,
    /// Backing volume, set only for managed filesystems
    pub volume: Option<VolumeTag>,
    /// Identifier assigned by the provider
    pub filesystem_id: String,
    /// Size in MiB
    pub size: u64,
    /// Provider-specific pool, if any
    pub pool: Option<String>,
}

/// A filesystem bound to a machine at a mount path
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilesystemAttachment {
    pub filesystem: FilesystemTag,
    pub machine: MachineTag,
    pub path: PathBuf,
    pub read_only: bool,
}

impl FilesystemAttachment {
    pub fn id(&self) -> MachineStorageId {
        MachineStorageId::new(self.machine.clone(), self.filesystem.clone())
    }
}

// =============================================================================
// Parameters
// =============================================================================

/// Parameters for creating a filesystem
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilesystemParams {
    pub tag: FilesystemTag,
    /// Backing volume; a managed filesystem is layered on it
    #[serde(default)]
    pub volume: Option<VolumeTag>,
    /// Requested size in MiB
    pub size: u64,
    pub provider: ProviderType,
}

impl FilesystemParams {
    pub fn is_managed(&self) -> bool {
        self.volume.is_some()
    }
}

/// Parameters for attaching or detaching a filesystem
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilesystemAttachmentParams {
    pub filesystem: FilesystemTag,
    pub machine: MachineTag,
    pub provider: ProviderType,
    /// Provider-assigned filesystem identifier, known once the filesystem exists
    #[serde(default)]
    pub filesystem_id: String,
    /// Mount path; synthesized from the storage directory when empty
    #[serde(default)]
    pub path: Option<PathBuf>,
    #[serde(default)]
    pub read_only: bool,
}

impl FilesystemAttachmentParams {
    pub fn id(&self) -> MachineStorageId {
        MachineStorageId::new(self.machine.clone(), self.filesystem.clone())
    }
}

/// What the controller says to do with a filesystem being removed
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoveFilesystemParams {
    /// Destroy the underlying storage rather than releasing it
    pub destroy: bool,
    pub filesystem_id: String,
    pub provider: ProviderType,
}

// =============================================================================
// Status
// =============================================================================

/// Lifecycle states reported to the controller
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    Pending,
    Attaching,
    Attached,
    Detaching,
    Detached,
    Destroying,
    Error,
}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Status::Pending => write!(f, "pending"),
            Status::Attaching => write!(f, "attaching"),
            Status::Attached => write!(f, "attached"),
            Status::Detaching => write!(f, "detaching"),
            Status::Detached => write!(f, "detached"),
            Status::Destroying => write!(f, "destroying"),
            Status::Error => write!(f, "error"),
        }
    }
}

/// One status transition sent to the controller
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntityStatus {
    /// Entity tag in string form, e.g. `filesystem-0`
    pub tag: String,
    pub status: Status,
    /// Human readable detail, usually the last error
    pub info: Option<String>,
    pub since: DateTime<Utc>,
}

impl EntityStatus {
    pub fn new(tag: &FilesystemTag, status: Status) -> Self {
        Self {
            tag: tag.to_string(),
            status,
            info: None,
            since: Utc::now(),
        }
    }

    pub fn with_info(mut self, info: impl std::fmt::Display) -> Self {
        self.info = Some(info.to_string());
        self
    }
}
