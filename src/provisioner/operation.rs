//! Pending Operations
//!
//! An operation is one unit of work against one entity: the request payload
//! plus the retry state accumulated by previous failed attempts.

use crate::domain::types::{FilesystemAttachmentParams, FilesystemParams, FilesystemTag, MachineStorageId};
use crate::error::{Error, ErrorAction};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

// =============================================================================
// Operation Key
// =============================================================================

/// Entity an operation targets. At most one operation per key is live.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum OperationKey {
    Filesystem(FilesystemTag),
    Attachment(MachineStorageId),
}

impl std::fmt::Display for OperationKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OperationKey::Filesystem(tag) => write!(f, "{}", tag),
            OperationKey::Attachment(id) => write!(f, "{}", id),
        }
    }
}

// =============================================================================
// Operation
// =============================================================================

/// Request payload of an operation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OperationKind {
    Create(FilesystemParams),
    Attach(FilesystemAttachmentParams),
    Detach(FilesystemAttachmentParams),
    Remove(FilesystemTag),
}

impl OperationKind {
    /// Short verb used for logs and metric labels
    pub fn verb(&self) -> &'static str {
        match self {
            OperationKind::Create(_) => "create",
            OperationKind::Attach(_) => "attach",
            OperationKind::Detach(_) => "detach",
            OperationKind::Remove(_) => "remove",
        }
    }
}

/// A pending unit of work with its backoff state
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Operation {
    pub kind: OperationKind,
    pub retry: RetryState,
}

impl Operation {
    pub fn new(kind: OperationKind) -> Self {
        Self {
            kind,
            retry: RetryState::default(),
        }
    }

    pub fn create(params: FilesystemParams) -> Self {
        Self::new(OperationKind::Create(params))
    }

    pub fn attach(params: FilesystemAttachmentParams) -> Self {
        Self::new(OperationKind::Attach(params))
    }

    pub fn detach(params: FilesystemAttachmentParams) -> Self {
        Self::new(OperationKind::Detach(params))
    }

    pub fn remove(tag: FilesystemTag) -> Self {
        Self::new(OperationKind::Remove(tag))
    }

    /// Parameters of a create operation
    pub fn create_params(&self) -> Option<&FilesystemParams> {
        match &self.kind {
            OperationKind::Create(params) => Some(params),
            _ => None,
        }
    }

    /// Parameters of an attach or detach operation
    pub fn attachment_params(&self) -> Option<&FilesystemAttachmentParams> {
        match &self.kind {
            OperationKind::Attach(params) | OperationKind::Detach(params) => Some(params),
            _ => None,
        }
    }

    /// Target of a remove operation
    pub fn remove_tag(&self) -> Option<&FilesystemTag> {
        match &self.kind {
            OperationKind::Remove(tag) => Some(tag),
            _ => None,
        }
    }

    pub fn key(&self) -> OperationKey {
        match &self.kind {
            OperationKind::Create(params) => OperationKey::Filesystem(params.tag.clone()),
            OperationKind::Remove(tag) => OperationKey::Filesystem(tag.clone()),
            OperationKind::Attach(params) | OperationKind::Detach(params) => {
                OperationKey::Attachment(params.id())
            }
        }
    }
}

// =============================================================================
// Retry Policy
// =============================================================================

/// Exponential backoff parameters shared by all operations
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(30),
            max_delay: Duration::from_secs(30 * 60),
            multiplier: 2.0,
        }
    }
}

impl RetryPolicy {
    /// Delay following `current`, never above `max_delay`
    pub fn next_delay(&self, current: Duration) -> Duration {
        if current.is_zero() {
            return self.initial_delay.min(self.max_delay);
        }
        Duration::try_from_secs_f64(current.as_secs_f64() * self.multiplier.max(1.0))
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }
}

/// Backoff state of one operation
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RetryState {
    /// Failed attempts so far
    pub attempt: u32,
    /// Delay to wait before the next attempt; zero for a fresh operation
    pub next_delay: Duration,
}

impl RetryState {
    /// Record one more failure
    pub fn advance(&mut self, policy: &RetryPolicy) {
        self.attempt = self.attempt.saturating_add(1);
        self.next_delay = policy.next_delay(self.next_delay);
    }
}

// =============================================================================
// Retry Classification
// =============================================================================

/// Whether a per-entity provider error is worth retrying
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    Transient,
    Permanent,
}

/// Decides the class of a per-entity provider error
pub type RetryClassifier = Arc<dyn Fn(&Error) -> ErrorClass + Send + Sync>;

/// Every provider error is retried. This is the default.
pub fn retry_all() -> RetryClassifier {
    Arc::new(|_| ErrorClass::Transient)
}

/// Errors that should not be requeued are permanent
pub fn classify_by_action() -> RetryClassifier {
    Arc::new(|err| match err.action() {
        ErrorAction::NoRequeue => ErrorClass::Permanent,
        _ => ErrorClass::Transient,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::types::MachineTag;

    fn attachment(machine: &str, fs: &str) -> FilesystemAttachmentParams {
        FilesystemAttachmentParams {
            filesystem: FilesystemTag::new(fs),
            machine: MachineTag::new(machine),
            provider: "rootfs".into(),
            filesystem_id: String::new(),
            path: None,
            read_only: false,
        }
    }

    #[test]
    fn test_create_and_remove_share_key() {
        let create = Operation::create(FilesystemParams {
            tag: FilesystemTag::new("0"),
            volume: None,
            size: 1024,
            provider: "rootfs".into(),
        });
        let remove = Operation::remove(FilesystemTag::new("0"));
        assert_eq!(create.key(), remove.key());
    }

    #[test]
    fn test_attach_and_detach_share_key() {
        let attach = Operation::attach(attachment("1", "0"));
        let detach = Operation::detach(attachment("1", "0"));
        assert_eq!(attach.key(), detach.key());
        assert_ne!(attach.key(), Operation::attach(attachment("2", "0")).key());
    }

    #[test]
    fn test_backoff_is_capped() {
        let policy = RetryPolicy {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(10),
            multiplier: 2.0,
        };
        let mut state = RetryState::default();
        let mut delays = Vec::new();
        for _ in 0..6 {
            state.advance(&policy);
            delays.push(state.next_delay.as_secs());
        }
        assert_eq!(delays, vec![1, 2, 4, 8, 10, 10]);
        assert_eq!(state.attempt, 6);
    }

    #[test]
    fn test_huge_multiplier_saturates_at_ceiling() {
        let policy = RetryPolicy {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            multiplier: 1.0e20,
        };
        let mut state = RetryState::default();
        for _ in 0..3 {
            state.advance(&policy);
        }
        assert_eq!(state.next_delay, Duration::from_secs(60));

        let unbounded = RetryPolicy {
            multiplier: f64::INFINITY,
            ..policy
        };
        assert_eq!(unbounded.next_delay(Duration::from_secs(1)), Duration::from_secs(60));
    }

    #[test]
    fn test_classifiers() {
        let validation = Error::Validation {
            entity: "filesystem-0".into(),
            reason: "bad".into(),
        };
        assert_eq!(retry_all()(&validation), ErrorClass::Transient);
        assert_eq!(classify_by_action()(&validation), ErrorClass::Permanent);

        let provider = Error::Provider {
            provider: "tmpfs".into(),
            reason: "busy".into(),
        };
        assert_eq!(classify_by_action()(&provider), ErrorClass::Transient);
    }
}
