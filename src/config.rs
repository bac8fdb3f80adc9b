//! Worker Configuration
//!
//! Loaded from YAML; every field has a default so an empty document is a
//! valid configuration.

use crate::error::{Error, Result};
use crate::provisioner::operation::{classify_by_action, retry_all, RetryClassifier, RetryPolicy};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Kind of model the worker provisions storage for
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModelKind {
    /// Machines managed by an infrastructure provider
    #[default]
    Iaas,
    /// Container workloads on a cluster
    Caas,
}

impl std::fmt::Display for ModelKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ModelKind::Iaas => write!(f, "iaas"),
            ModelKind::Caas => write!(f, "caas"),
        }
    }
}

/// Largest accepted backoff multiplier
pub const MAX_RETRY_MULTIPLIER: f64 = 10.0;

/// Which per-entity provider errors are retried
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClassification {
    /// Retry every provider error
    #[default]
    RetryAll,
    /// Give up on errors whose action is not to requeue
    ByAction,
}

/// Backoff settings in milliseconds
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub multiplier: f64,
    pub classification: ErrorClassification,
}

impl Default for RetryConfig {
    fn default() -> Self {
        let policy = RetryPolicy::default();
        Self {
            initial_delay_ms: policy.initial_delay.as_millis() as u64,
            max_delay_ms: policy.max_delay.as_millis() as u64,
            multiplier: policy.multiplier,
            classification: ErrorClassification::default(),
        }
    }
}

impl RetryConfig {
    pub fn policy(&self) -> RetryPolicy {
        RetryPolicy {
            initial_delay: Duration::from_millis(self.initial_delay_ms),
            max_delay: Duration::from_millis(self.max_delay_ms),
            multiplier: self.multiplier,
        }
    }

    pub fn classifier(&self) -> RetryClassifier {
        match self.classification {
            ErrorClassification::RetryAll => retry_all(),
            ErrorClassification::ByAction => classify_by_action(),
        }
    }
}

/// Configuration of the storage provisioner worker
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Base directory for filesystems and default mount paths
    pub storage_dir: PathBuf,
    pub model_kind: ModelKind,
    /// Skip detach batches whose source cannot be found; defaults by model kind
    pub tolerate_missing_detach_source: Option<bool>,
    pub retry: RetryConfig,
    /// How often the loop drains ready operations
    pub drain_interval_ms: u64,
    /// Capacity of the tmpfs provider in MiB
    pub tmpfs_capacity_mib: u64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            storage_dir: PathBuf::from("/var/lib/storage-provisioner/storage"),
            model_kind: ModelKind::Iaas,
            tolerate_missing_detach_source: None,
            retry: RetryConfig::default(),
            drain_interval_ms: 1_000,
            tmpfs_capacity_mib: 1024,
        }
    }
}

impl WorkerConfig {
    /// Parse and validate a YAML document
    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        let config: WorkerConfig = if yaml.trim().is_empty() {
            WorkerConfig::default()
        } else {
            serde_yaml::from_str(yaml)?
        };
        config.validate()?;
        Ok(config)
    }

    /// Load and validate a YAML file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml_str(&contents)
    }

    pub fn validate(&self) -> Result<()> {
        if self.storage_dir.as_os_str().is_empty() {
            return Err(Error::Configuration("storage_dir must not be empty".into()));
        }
        if self.retry.initial_delay_ms == 0 {
            return Err(Error::Configuration("retry.initial_delay_ms must be positive".into()));
        }
        if self.retry.max_delay_ms < self.retry.initial_delay_ms {
            return Err(Error::Configuration(
                "retry.max_delay_ms must not be below retry.initial_delay_ms".into(),
            ));
        }
        if !(1.0..=MAX_RETRY_MULTIPLIER).contains(&self.retry.multiplier) {
            return Err(Error::Configuration(format!(
                "retry.multiplier must be between 1 and {}",
                MAX_RETRY_MULTIPLIER
            )));
        }
        if self.drain_interval_ms == 0 {
            return Err(Error::Configuration("drain_interval_ms must be positive".into()));
        }
        Ok(())
    }

    /// Whether detach may skip a source it cannot find
    pub fn tolerates_missing_detach_source(&self) -> bool {
        self.tolerate_missing_detach_source
            .unwrap_or(self.model_kind == ModelKind::Caas)
    }

    pub fn drain_interval(&self) -> Duration {
        Duration::from_millis(self.drain_interval_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provisioner::operation::ErrorClass;
    use assert_matches::assert_matches;
    use std::io::Write;

    #[test]
    fn test_empty_document_is_default() {
        let config = WorkerConfig::from_yaml_str("").unwrap();
        assert_eq!(config.model_kind, ModelKind::Iaas);
        assert!(!config.tolerates_missing_detach_source());
        assert_eq!(config.retry.policy(), RetryPolicy::default());
    }

    #[test]
    fn test_caas_tolerates_missing_detach_source_by_default() {
        let config = WorkerConfig::from_yaml_str("model_kind: caas\n").unwrap();
        assert!(config.tolerates_missing_detach_source());

        let config = WorkerConfig::from_yaml_str(
            "model_kind: caas\ntolerate_missing_detach_source: false\n",
        )
        .unwrap();
        assert!(!config.tolerates_missing_detach_source());
    }

    #[test]
    fn test_invalid_retry_rejected() {
        let err = WorkerConfig::from_yaml_str(
            "retry:\n  initial_delay_ms: 5000\n  max_delay_ms: 1000\n",
        )
        .unwrap_err();
        assert_matches!(err, Error::Configuration(_));

        for multiplier in ["0.5", "1.0e20", ".inf", ".nan"] {
            let yaml = format!("retry:\n  multiplier: {}\n", multiplier);
            let err = WorkerConfig::from_yaml_str(&yaml).unwrap_err();
            assert_matches!(err, Error::Configuration(_));
        }
    }

    #[test]
    fn test_error_classification() {
        let validation = Error::Validation {
            entity: "filesystem-0".into(),
            reason: "bad size".into(),
        };

        let config = WorkerConfig::from_yaml_str("").unwrap();
        assert_eq!(config.retry.classification, ErrorClassification::RetryAll);
        assert_eq!(config.retry.classifier()(&validation), ErrorClass::Transient);

        let config = WorkerConfig::from_yaml_str("retry:\n  classification: by_action\n").unwrap();
        assert_eq!(config.retry.classifier()(&validation), ErrorClass::Permanent);
    }

    #[test]
    fn test_malformed_yaml() {
        let err = WorkerConfig::from_yaml_str("storage_dir: [").unwrap_err();
        assert_matches!(err, Error::YamlParse(_));
    }

    #[test]
    fn test_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "storage_dir: /srv/storage").unwrap();
        writeln!(file, "drain_interval_ms: 250").unwrap();

        let config = WorkerConfig::from_file(file.path()).unwrap();
        assert_eq!(config.storage_dir, PathBuf::from("/srv/storage"));
        assert_eq!(config.drain_interval(), Duration::from_millis(250));
    }
}
