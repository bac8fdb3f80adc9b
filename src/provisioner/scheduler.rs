//! Operation Registry & Scheduler
//!
//! Tracks the pending operation of every entity and releases operations once
//! their backoff delay has elapsed.
//!
//! Drained operations are *in flight* until they are either rescheduled or
//! completed. Scheduling an operation for a key that is in flight is allowed:
//! the reconciliation loop finishes the in-flight batch before it drains
//! again, so the newer operation is never executed concurrently with the old.

use super::operation::{Operation, OperationKey, RetryPolicy};
use std::collections::{HashMap, HashSet};
use std::time::Instant;
use tracing::debug;

#[derive(Debug)]
struct Scheduled {
    op: Operation,
    due: Instant,
    seq: u64,
}

/// Pending operations keyed by entity
#[derive(Debug)]
pub struct OperationRegistry {
    policy: RetryPolicy,
    pending: HashMap<OperationKey, Scheduled>,
    in_flight: HashSet<OperationKey>,
    seq: u64,
}

impl OperationRegistry {
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            policy,
            pending: HashMap::new(),
            in_flight: HashSet::new(),
            seq: 0,
        }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    fn insert(&mut self, op: Operation, now: Instant) -> Option<Operation> {
        self.seq += 1;
        let due = now + op.retry.next_delay;
        let scheduled = Scheduled {
            op,
            due,
            seq: self.seq,
        };
        self.pending
            .insert(scheduled.op.key(), scheduled)
            .map(|previous| previous.op)
    }

    /// Insert or replace the pending operation for the operation's entity.
    ///
    /// Returns the operation that was replaced, if any.
    pub fn schedule(&mut self, op: Operation, now: Instant) -> Option<Operation> {
        let replaced = self.insert(op, now);
        if let Some(previous) = &replaced {
            debug!("replaced pending {} operation for {}", previous.kind.verb(), previous.key());
        }
        replaced
    }

    /// Remove and return every operation whose delay has elapsed, oldest first
    pub fn drain_ready(&mut self, now: Instant) -> Vec<Operation> {
        let mut ready: Vec<OperationKey> = self
            .pending
            .iter()
            .filter(|(_, scheduled)| scheduled.due <= now)
            .map(|(key, _)| key.clone())
            .collect();
        ready.sort_by_key(|key| {
            let scheduled = &self.pending[key];
            (scheduled.due, scheduled.seq)
        });

        let mut drained = Vec::with_capacity(ready.len());
        for key in ready {
            if let Some(scheduled) = self.pending.remove(&key) {
                self.in_flight.insert(key);
                drained.push(scheduled.op);
            }
        }
        drained
    }

    /// Re-arm a failed in-flight operation with its backoff advanced.
    ///
    /// If newer desired state was scheduled for the same entity while the
    /// operation was in flight, the newer operation wins and `false` is returned.
    pub fn reschedule(&mut self, mut op: Operation, now: Instant) -> bool {
        let key = op.key();
        self.in_flight.remove(&key);
        if self.pending.contains_key(&key) {
            debug!("not rescheduling {} for {}: superseded", op.kind.verb(), key);
            return false;
        }
        op.retry.advance(&self.policy);
        debug!(
            "rescheduling {} for {} in {:?} (attempt {})",
            op.kind.verb(),
            key,
            op.retry.next_delay,
            op.retry.attempt
        );
        self.insert(op, now);
        true
    }

    /// Drop the pending operation of an entity
    pub fn cancel(&mut self, key: &OperationKey) -> Option<Operation> {
        self.pending.remove(key).map(|scheduled| scheduled.op)
    }

    /// Mark an in-flight operation as finished
    pub fn complete(&mut self, key: &OperationKey) {
        self.in_flight.remove(key);
    }

    pub fn is_pending(&self, key: &OperationKey) -> bool {
        self.pending.contains_key(key)
    }

    pub fn is_in_flight(&self, key: &OperationKey) -> bool {
        self.in_flight.contains(key)
    }

    pub fn pending(&self, key: &OperationKey) -> Option<&Operation> {
        self.pending.get(key).map(|scheduled| &scheduled.op)
    }

    /// Earliest instant at which an operation becomes ready
    pub fn next_due(&self) -> Option<Instant> {
        self.pending.values().map(|scheduled| scheduled.due).min()
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}
