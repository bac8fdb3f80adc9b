//! Batch Executors
//!
//! Each executor follows the same shape: partition by source, one bulk
//! provider call per source, per-entity interpretation, then a single flush
//! of statuses, reschedules and controller updates.
//!
//! Per-source processing returns a [`BatchOutcome`]; the executor merges the
//! outcomes and flushes them once after every source has been handled.
//!
//! A bulk call that fails as a whole aborts the batch, but what earlier
//! sources already did is still flushed and recorded before the error is
//! returned. Operations that were never submitted are re-armed.

pub mod attach;
pub mod create;
pub mod detach;
pub mod remove;

pub use attach::{attach_filesystems, default_mount_path};
pub use create::create_filesystems;
pub use detach::detach_filesystems;
pub use remove::{remove_filesystems, split_removals, Removals};

use super::operation::{ErrorClass, Operation, RetryClassifier};
use crate::domain::types::{EntityStatus, FilesystemTag, Status};
use crate::error::{Error, Result};
use tracing::debug;

/// What processing one source produced
#[derive(Debug)]
pub(crate) struct BatchOutcome<T> {
    pub statuses: Vec<EntityStatus>,
    pub reschedule: Vec<Operation>,
    pub completed: Vec<T>,
    /// First whole-call failure; later sources are not called
    pub error: Option<Error>,
}

impl<T> Default for BatchOutcome<T> {
    fn default() -> Self {
        Self {
            statuses: Vec::new(),
            reschedule: Vec::new(),
            completed: Vec::new(),
            error: None,
        }
    }
}

impl<T> BatchOutcome<T> {
    pub fn merge(&mut self, other: BatchOutcome<T>) {
        self.statuses.extend(other.statuses);
        self.reschedule.extend(other.reschedule);
        self.completed.extend(other.completed);
        if self.error.is_none() {
            self.error = other.error;
        }
    }

    pub fn is_aborted(&self) -> bool {
        self.error.is_some()
    }

    /// Record a whole-call failure, re-arming the operations it left unsubmitted
    pub fn abort(&mut self, err: Error, unsubmitted: impl IntoIterator<Item = Operation>) {
        self.reschedule.extend(unsubmitted);
        if self.error.is_none() {
            self.error = Some(err);
        }
    }

    pub fn succeed(&mut self, item: T, status: Option<EntityStatus>) {
        self.completed.push(item);
        self.statuses.extend(status);
    }

    /// Record a per-entity failure.
    ///
    /// Transient failures keep the in-progress status and re-arm the
    /// operation; permanent ones end in `error`.
    pub fn fail(
        &mut self,
        classifier: &RetryClassifier,
        op: Option<Operation>,
        tag: &FilesystemTag,
        in_progress: Status,
        err: &Error,
    ) {
        match classifier(err) {
            ErrorClass::Transient => {
                self.statuses
                    .push(EntityStatus::new(tag, in_progress).with_info(err));
                self.reschedule.extend(op);
            }
            ErrorClass::Permanent => {
                self.statuses.push(EntityStatus::new(tag, Status::Error).with_info(err));
            }
        }
    }
}

/// Providers must return one result per submitted entity
pub(crate) fn check_result_count<T>(
    operation: &'static str,
    source_name: &str,
    submitted: usize,
    results: &[T],
) -> Result<()> {
    if results.len() != submitted {
        debug!(
            "source {:?} returned {} results for {} entities",
            source_name,
            results.len(),
            submitted
        );
        return Err(Error::batch_call(
            operation,
            source_name,
            Error::Internal(format!(
                "expected {} results, got {}",
                submitted,
                results.len()
            )),
        ));
    }
    Ok(())
}
