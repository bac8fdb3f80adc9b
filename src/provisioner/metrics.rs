//! Provisioner Metrics
//!
//! Prometheus metrics for the reconciliation loop, kept in a registry owned
//! by the worker so several workers can live in one process.

use prometheus::{IntCounterVec, IntGauge, Opts, Registry};

/// Operation outcomes used as the `outcome` label
pub mod outcome {
    pub const SUCCEEDED: &str = "succeeded";
    pub const RETRIED: &str = "retried";
    pub const FAILED: &str = "failed";
}

/// Metrics of one provisioner
#[derive(Clone)]
pub struct ProvisionerMetrics {
    registry: Registry,
    operations: IntCounterVec,
    batch_failures: IntCounterVec,
    pending: IntGauge,
}

impl Default for ProvisionerMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl ProvisionerMetrics {
    pub fn new() -> Self {
        let registry = Registry::new();
        let operations = IntCounterVec::new(
            Opts::new(
                "storage_provisioner_operations_total",
                "Operations processed, by kind and outcome",
            ),
            &["kind", "outcome"],
        )
        .expect("valid operations metric");
        let batch_failures = IntCounterVec::new(
            Opts::new(
                "storage_provisioner_batch_failures_total",
                "Batches aborted by a transport failure",
            ),
            &["kind"],
        )
        .expect("valid batch failure metric");
        let pending = IntGauge::new(
            "storage_provisioner_pending_operations",
            "Operations waiting in the registry",
        )
        .expect("valid pending metric");

        // Names are unique within a fresh registry.
        let _ = registry.register(Box::new(operations.clone()));
        let _ = registry.register(Box::new(batch_failures.clone()));
        let _ = registry.register(Box::new(pending.clone()));

        Self {
            registry,
            operations,
            batch_failures,
            pending,
        }
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn record(&self, kind: &str, outcome: &str, count: usize) {
        if count > 0 {
            self.operations
                .with_label_values(&[kind, outcome])
                .inc_by(count as u64);
        }
    }

    pub fn record_batch_failure(&self, kind: &str) {
        self.batch_failures.with_label_values(&[kind]).inc();
    }

    pub fn set_pending(&self, pending: usize) {
        self.pending.set(pending as i64);
    }

    /// Current value of an operation counter
    pub fn operations(&self, kind: &str, outcome: &str) -> u64 {
        self.operations.with_label_values(&[kind, outcome]).get()
    }

    pub fn batch_failures(&self, kind: &str) -> u64 {
        self.batch_failures.with_label_values(&[kind]).get()
    }

    pub fn pending(&self) -> i64 {
        self.pending.get()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_and_gather() {
        let metrics = ProvisionerMetrics::new();
        metrics.record("create", outcome::SUCCEEDED, 3);
        metrics.record("create", outcome::RETRIED, 0);
        metrics.record_batch_failure("attach");
        metrics.set_pending(2);

        assert_eq!(metrics.operations("create", outcome::SUCCEEDED), 3);
        assert_eq!(metrics.batch_failures("attach"), 1);
        assert_eq!(metrics.pending(), 2);

        let names: Vec<String> = metrics
            .registry()
            .gather()
            .iter()
            .map(|family| family.get_name().to_string())
            .collect();
        assert!(names.contains(&"storage_provisioner_operations_total".to_string()));
    }
}
