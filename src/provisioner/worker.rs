//! Reconciliation Loop
//!
//! Turns desired-state changes into scheduled operations and drains the
//! operation registry on a fixed interval. A drain cycle runs four passes in
//! order: create, attach, detach, remove.
//!
//! The worker owns its [`ProvisionerContext`] outright; changes arrive over a
//! channel through cloneable [`WorkerHandle`]s, so nothing else ever touches
//! the caches.

use super::context::ProvisionerContext;
use super::metrics::ProvisionerMetrics;
use super::operation::{Operation, OperationKey, OperationKind};
use super::ops;
use crate::domain::types::{FilesystemAttachmentParams, FilesystemParams, FilesystemTag};
use crate::error::{Error, Result};
use backoff::backoff::Backoff;
use backoff::ExponentialBackoff;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

// =============================================================================
// Desired State
// =============================================================================

/// A change in what the controller wants to exist
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "change", rename_all = "snake_case")]
pub enum DesiredChange {
    FilesystemAlive(FilesystemParams),
    FilesystemDead { tag: FilesystemTag },
    AttachmentAlive(FilesystemAttachmentParams),
    AttachmentDead(FilesystemAttachmentParams),
}

/// Parse a YAML list of desired changes
pub fn parse_manifest(yaml: &str) -> Result<Vec<DesiredChange>> {
    if yaml.trim().is_empty() {
        return Ok(Vec::new());
    }
    Ok(serde_yaml::from_str(yaml)?)
}

/// Load a YAML list of desired changes from a file
pub fn load_manifest(path: impl AsRef<Path>) -> Result<Vec<DesiredChange>> {
    parse_manifest(&std::fs::read_to_string(path)?)
}

/// Sends desired-state changes to a running worker
#[derive(Debug, Clone)]
pub struct WorkerHandle {
    tx: mpsc::UnboundedSender<DesiredChange>,
}

impl WorkerHandle {
    pub fn send(&self, change: DesiredChange) -> Result<()> {
        self.tx
            .send(change)
            .map_err(|_| Error::Internal("storage provisioner worker has stopped".into()))
    }
}

// =============================================================================
// Restart Policy
// =============================================================================

/// Delays between restarts of a loop that keeps failing
pub struct RestartBackoff {
    backoff: ExponentialBackoff,
}

impl RestartBackoff {
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self {
            backoff: ExponentialBackoff {
                initial_interval: initial,
                current_interval: initial,
                max_interval: max,
                randomization_factor: 0.0,
                max_elapsed_time: None,
                ..Default::default()
            },
        }
    }

    /// Delay before restarting a loop that failed after running for `ran`.
    ///
    /// A run that outlasted the longest delay starts over from the shortest.
    pub fn after_failure(&mut self, ran: Duration) -> Duration {
        if ran >= self.backoff.max_interval {
            self.backoff.reset();
        }
        self.backoff
            .next_backoff()
            .unwrap_or(self.backoff.max_interval)
    }
}

// =============================================================================
// Worker
// =============================================================================

/// One executor pass of a drain cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Pass {
    Create,
    Attach,
    Detach,
    Remove,
}

impl Pass {
    fn kind(self) -> &'static str {
        match self {
            Pass::Create => "create",
            Pass::Attach => "attach",
            Pass::Detach => "detach",
            Pass::Remove => "remove",
        }
    }
}

/// The single reconciliation loop of one model
pub struct Worker {
    ctx: ProvisionerContext,
    rx: mpsc::UnboundedReceiver<DesiredChange>,
    drain_interval: Duration,
}

impl Worker {
    pub fn new(ctx: ProvisionerContext, drain_interval: Duration) -> (Self, WorkerHandle) {
        let (tx, rx) = mpsc::unbounded_channel();
        let worker = Self {
            ctx,
            rx,
            drain_interval,
        };
        (worker, WorkerHandle { tx })
    }

    pub fn context(&self) -> &ProvisionerContext {
        &self.ctx
    }

    pub fn metrics(&self) -> &ProvisionerMetrics {
        self.ctx.metrics()
    }

    /// Schedule the operations a desired-state change calls for
    pub fn apply(&mut self, change: DesiredChange, now: Instant) {
        match change {
            DesiredChange::FilesystemAlive(params) => {
                if self.ctx.filesystems.contains_key(&params.tag) {
                    debug!("{} is already provisioned", params.tag);
                    return;
                }
                self.ctx.registry.schedule(Operation::create(params), now);
            }
            DesiredChange::FilesystemDead { tag } => {
                let key = OperationKey::Filesystem(tag.clone());
                self.ctx.registry.cancel(&key);
                self.ctx
                    .pending_attachments
                    .retain(|id, _| id.filesystem != tag);
                self.ctx.registry.schedule(Operation::remove(tag), now);
            }
            DesiredChange::AttachmentAlive(mut params) => {
                let id = params.id();
                if self.ctx.attachments.contains_key(&id) {
                    debug!("{} is already attached", id);
                    return;
                }
                match self.ctx.filesystems.get(&params.filesystem) {
                    Some(fs) => {
                        if params.filesystem_id.is_empty() {
                            params.filesystem_id = fs.filesystem_id.clone();
                        }
                        self.ctx.registry.schedule(Operation::attach(params), now);
                    }
                    None => {
                        debug!("{} waits for {} to be provisioned", id, params.filesystem);
                        self.ctx.pending_attachments.insert(id, params);
                    }
                }
            }
            DesiredChange::AttachmentDead(params) => {
                let id = params.id();
                let key = OperationKey::Attachment(id.clone());
                self.ctx.pending_attachments.remove(&id);
                self.ctx.registry.cancel(&key);
                // Nothing to undo unless an attach completed.
                if self.ctx.attachments.contains_key(&id) {
                    self.ctx.registry.schedule(Operation::detach(params), now);
                }
            }
        }
    }

    /// Apply every change already queued on the channel
    pub fn intake(&mut self, now: Instant) -> usize {
        let mut applied = 0;
        while let Ok(change) = self.rx.try_recv() {
            self.apply(change, now);
            applied += 1;
        }
        applied
    }

    /// Schedule attaches whose filesystem has been provisioned since
    fn promote_pending_attachments(&mut self, now: Instant) {
        let ready: Vec<FilesystemAttachmentParams> = self
            .ctx
            .pending_attachments
            .values()
            .filter(|p| self.ctx.filesystems.contains_key(&p.filesystem))
            .filter(|p| {
                let key = OperationKey::Attachment(p.id());
                !self.ctx.registry.is_pending(&key) && !self.ctx.registry.is_in_flight(&key)
            })
            .cloned()
            .collect();
        for mut params in ready {
            if let Some(fs) = self.ctx.filesystems.get(&params.filesystem) {
                if params.filesystem_id.is_empty() {
                    params.filesystem_id = fs.filesystem_id.clone();
                }
            }
            debug!("{} can now be attached", params.id());
            self.ctx.registry.schedule(Operation::attach(params), now);
        }
    }

    /// Run one drain cycle. Returns how many operations were drained.
    pub async fn run_once(&mut self, now: Instant) -> Result<usize> {
        self.intake(now);
        let drained = self.ctx.registry.drain_ready(now);
        if drained.is_empty() {
            return Ok(0);
        }
        let total = drained.len();

        let mut creates = Vec::new();
        let mut attaches = Vec::new();
        let mut detaches = Vec::new();
        let mut removes = Vec::new();
        for op in drained {
            match op.kind {
                OperationKind::Create(_) => creates.push(op),
                OperationKind::Attach(_) => attaches.push(op),
                OperationKind::Detach(_) => detaches.push(op),
                OperationKind::Remove(_) => removes.push(op),
            }
        }
        debug!(
            "draining {} creates, {} attaches, {} detaches, {} removes",
            creates.len(),
            attaches.len(),
            detaches.len(),
            removes.len()
        );

        let mut passes = vec![
            (Pass::Create, creates),
            (Pass::Attach, attaches),
            (Pass::Detach, detaches),
            (Pass::Remove, removes),
        ]
        .into_iter();
        while let Some((pass, batch)) = passes.next() {
            if !batch.is_empty() {
                if let Err(err) = self.execute(pass, batch.clone()).await {
                    self.ctx.metrics.record_batch_failure(pass.kind());
                    let unrun: Vec<Operation> = passes.by_ref().flat_map(|(_, rest)| rest).collect();
                    self.rearm(batch.into_iter().chain(unrun));
                    return Err(err);
                }
            }
            if pass == Pass::Create {
                self.promote_pending_attachments(now);
            }
        }
        Ok(total)
    }

    async fn execute(&mut self, pass: Pass, batch: Vec<Operation>) -> Result<()> {
        match pass {
            Pass::Create => ops::create_filesystems(&mut self.ctx, batch).await,
            Pass::Attach => ops::attach_filesystems(&mut self.ctx, batch).await,
            Pass::Detach => ops::detach_filesystems(&mut self.ctx, batch).await,
            Pass::Remove => ops::remove_filesystems(&mut self.ctx, batch).await,
        }
    }

    /// Put back drained operations an aborted pass left unsettled.
    ///
    /// Executors settle whatever they got to before failing, so only keys
    /// still in flight are re-armed, never over newer ones.
    fn rearm(&mut self, ops: impl IntoIterator<Item = Operation>) {
        let unsettled: Vec<Operation> = ops
            .into_iter()
            .filter(|op| self.ctx.registry.is_in_flight(&op.key()))
            .collect();
        self.ctx.requeue(unsettled);
    }

    /// Run until cancelled or a pass fails
    pub async fn run(&mut self, cancel: CancellationToken) -> Result<()> {
        info!(
            "Starting storage provisioner loop (drain interval {:?})",
            self.drain_interval
        );
        let mut ticker = tokio::time::interval(self.drain_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut intake_open = true;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("Storage provisioner loop stopped");
                    return Ok(());
                }
                change = self.rx.recv(), if intake_open => match change {
                    Some(change) => self.apply(change, Instant::now()),
                    None => {
                        debug!("desired state channel closed");
                        intake_open = false;
                    }
                },
                _ = ticker.tick() => {
                    if let Err(err) = self.run_once(Instant::now()).await {
                        error!("storage provisioner pass failed: {}", err);
                        return Err(err);
                    }
                }
            }
        }
    }
}
