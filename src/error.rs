//! Error types for the storage provisioner
//!
//! Provides structured error types for the reconciliation engine including
//! provider sources, source resolution, the controller facade and configuration.

use std::time::Duration;
use thiserror::Error;

/// Unified error type for the provisioner
#[derive(Error, Debug)]
pub enum Error {
    // =========================================================================
    // Internal Errors
    // =========================================================================
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    // =========================================================================
    // Parameter Errors
    // =========================================================================
    #[error("Invalid parameters for {entity}: {reason}")]
    Validation { entity: String, reason: String },

    #[error("Resource not found: {kind}/{name}")]
    ResourceNotFound { kind: String, name: String },

    // =========================================================================
    // Provider Errors
    // =========================================================================
    #[error("Provider {provider} failed: {reason}")]
    Provider { provider: String, reason: String },

    #[error("Insufficient capacity: requested {requested} MiB, available {available} MiB")]
    InsufficientCapacity { requested: u64, available: u64 },

    #[error("Storage provider {provider:?} does not support dynamic filesystems")]
    NonDynamicProvider { provider: String },

    #[error("Storage provider {provider:?} is not registered")]
    UnknownProvider { provider: String },

    #[error("No filesystem source available for {source_name:?}")]
    SourceUnavailable { source_name: String },

    #[error("{operation} filesystems from source {source_name:?}: {cause}")]
    BatchCall {
        operation: &'static str,
        source_name: String,
        #[source]
        cause: Box<Error>,
    },

    // =========================================================================
    // Controller Errors
    // =========================================================================
    #[error("Controller call {operation} failed: {reason}")]
    Controller { operation: String, reason: String },

    #[error("Controller rejected {entity}: {reason}")]
    ControllerRecord { entity: String, reason: String },

    // =========================================================================
    // Parse Errors
    // =========================================================================
    #[error("YAML parse error: {0}")]
    YamlParse(#[from] serde_yaml::Error),

    // =========================================================================
    // IO Errors
    // =========================================================================
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Action to take on error during reconciliation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorAction {
    /// Requeue with exponential backoff
    RequeueWithBackoff,
    /// Requeue after specific duration
    RequeueAfter(Duration),
    /// Don't requeue, wait for changes
    NoRequeue,
}

impl Error {
    /// Wrap a failed bulk provider call with the operation and source it belongs to
    pub fn batch_call(operation: &'static str, source_name: impl Into<String>, cause: Error) -> Self {
        Error::BatchCall {
            operation,
            source_name: source_name.into(),
            cause: Box::new(cause),
        }
    }

    /// Shorthand for a controller transport failure
    pub fn controller(operation: impl Into<String>, reason: impl std::fmt::Display) -> Self {
        Error::Controller {
            operation: operation.into(),
            reason: reason.to_string(),
        }
    }

    /// Determine what action to take for this error
    pub fn action(&self) -> ErrorAction {
        match self {
            // Transient errors - retry with backoff
            Error::Provider { .. }
            | Error::Controller { .. }
            | Error::SourceUnavailable { .. }
            | Error::Io(_) => ErrorAction::RequeueWithBackoff,

            // Resource issues - medium retry
            Error::InsufficientCapacity { .. } => {
                ErrorAction::RequeueAfter(Duration::from_secs(60))
            }

            Error::BatchCall { cause, .. } => cause.action(),

            // Configuration/validation errors - don't retry automatically
            Error::Configuration(_)
            | Error::Validation { .. }
            | Error::UnknownProvider { .. }
            | Error::YamlParse(_) => ErrorAction::NoRequeue,

            // All other errors - retry with backoff
            _ => ErrorAction::RequeueWithBackoff,
        }
    }

    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        !matches!(self.action(), ErrorAction::NoRequeue)
    }

    /// Check if this error is transient
    pub fn is_transient(&self) -> bool {
        match self {
            Error::BatchCall { cause, .. } => cause.is_transient(),
            _ => matches!(
                self,
                Error::Provider { .. } | Error::Controller { .. } | Error::SourceUnavailable { .. }
            ),
        }
    }

    /// Check if this is the signal that a provider cannot create filesystems dynamically
    pub fn is_non_dynamic(&self) -> bool {
        matches!(self, Error::NonDynamicProvider { .. })
    }
}

/// Result type alias for the provisioner
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_actions() {
        let err = Error::InsufficientCapacity {
            requested: 1000,
            available: 500,
        };
        assert_eq!(
            err.action(),
            ErrorAction::RequeueAfter(Duration::from_secs(60))
        );

        let err = Error::Configuration("bad config".into());
        assert_eq!(err.action(), ErrorAction::NoRequeue);

        let err = Error::Validation {
            entity: "filesystem-0".into(),
            reason: "size must be positive".into(),
        };
        assert_eq!(err.action(), ErrorAction::NoRequeue);
    }

    #[test]
    fn test_error_retryable() {
        let transient = Error::Provider {
            provider: "rootfs".into(),
            reason: "quota exceeded".into(),
        };
        assert!(transient.is_retryable());
        assert!(transient.is_transient());

        let config_err = Error::Configuration("invalid".into());
        assert!(!config_err.is_retryable());
        assert!(!config_err.is_transient());
    }

    #[test]
    fn test_batch_call_annotation() {
        let err = Error::batch_call(
            "creating",
            "tmpfs",
            Error::controller("CreateFilesystems", "connection reset"),
        );
        assert_eq!(
            err.to_string(),
            "creating filesystems from source \"tmpfs\": Controller call CreateFilesystems failed: connection reset"
        );
        assert!(err.is_transient());
        assert!(!Error::NonDynamicProvider { provider: "loop".into() }.is_transient());
        assert!(Error::NonDynamicProvider { provider: "loop".into() }.is_non_dynamic());
    }
}
