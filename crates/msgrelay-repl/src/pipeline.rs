//! The sequential replication run.
//!
//! Collector → GroupingMerger → (per unit, in order) dedup check →
//! RecoveryController/Dispatcher → commit. One unit is in flight at a time.
//! Cancellation is observed at suspension points and between units, never
//! in the middle of a send.
//!
//! The checkpoint advances to a low watermark: every id at or below it has
//! been handled. Replies spliced ahead of lower ids, units still held by the
//! merger and units later in the current batch all keep it down, so a crash
//! can only replay work, never skip it. Replays are absorbed by the
//! deduplicator.

use std::path::Path;
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::watch;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::checkpoint::{Checkpoint, CheckpointStore, LoadOutcome};
use crate::collector::Collector;
use crate::config::ReplConfig;
use crate::dedup::{Deduplicator, Fingerprint};
use crate::dispatch::Dispatcher;
use crate::error::{ReplError, ReplResult};
use crate::grouping::GroupingMerger;
use crate::item::{ItemId, ProcessingUnit};
use crate::ledger::{LedgerSummary, ReplicationLedger};
use crate::lock::InstanceLock;
use crate::media::MediaTransfer;
use crate::progress::{ProgressReporter, ProgressSnapshot, RunSummary};
use crate::rate_limit::RateLimiter;
use crate::recovery::RecoveryController;
use crate::remote::{EntityHandle, MessageSink, MessageSource};

/// Persisted state of a state directory, for `status`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StatusReport {
    /// Decoded checkpoint, default when absent or corrupt.
    pub checkpoint: Checkpoint,
    /// Whether the checkpoint file was missing, valid or corrupt.
    pub checkpoint_state: String,
    /// Fingerprints retained by the deduplicator.
    pub dedup_retained: usize,
    /// Ledger statistics.
    pub ledger: LedgerSummary,
    /// PID in the lock file, if a lock exists.
    pub lock_holder: Option<u32>,
}

/// A configured replication run between one source and one sink.
pub struct ReplicationPipeline {
    config: ReplConfig,
    source: Arc<dyn MessageSource>,
    sink: Arc<dyn MessageSink>,
}

impl ReplicationPipeline {
    /// Create a pipeline. Nothing is touched until [`run`](Self::run).
    pub fn new(config: ReplConfig, source: Arc<dyn MessageSource>, sink: Arc<dyn MessageSink>) -> Self {
        Self {
            config,
            source,
            sink,
        }
    }

    /// The run configuration.
    pub fn config(&self) -> &ReplConfig {
        &self.config
    }

    /// Replicate until the source is exhausted, `cancel` fires, or an
    /// unrecoverable error stops the run.
    ///
    /// Cancellation is not an error: the summary comes back with
    /// `cancelled` set and the checkpoint intact.
    pub async fn run(&self, cancel: CancellationToken) -> ReplResult<RunSummary> {
        self.config.validate()?;
        let dry_run = self.config.dry_run;
        let _lock = if dry_run {
            None
        } else {
            Some(InstanceLock::acquire(&self.config.state_dir)?)
        };

        let (mut checkpoint, outcome) = CheckpointStore::load(self.config.checkpoint_path())?;
        if dry_run {
            checkpoint = checkpoint.detached();
        }
        if let LoadOutcome::Corrupt { reason } = &outcome {
            warn!(%reason, "replaying from the beginning; duplicates within the dedup horizon are skipped");
        }
        if let Some(pending) = checkpoint.checkpoint().pending_unit {
            info!(%pending, "resuming with a unit that was in flight");
        }
        let mut dedup = Deduplicator::open(self.config.dedup_path(), self.config.dedup_retention)?;
        let mut ledger = if self.config.ledger_enabled && !dry_run {
            ReplicationLedger::open(self.config.ledger_path())?
        } else {
            ReplicationLedger::disabled()
        };

        let mut recovery = RecoveryController::new(self.config.remote_retry(), cancel.clone());
        let (source_handle, sink_handle) = match self.prepare(&mut recovery, &mut checkpoint).await {
            Ok(handles) => handles,
            Err(ReplError::Cancelled) => {
                info!("stop requested before replication started");
                return Ok(RunSummary {
                    suspended_for: recovery.stats().suspended_for,
                    cancelled: true,
                    ..RunSummary::default()
                });
            }
            Err(e) => return Err(e),
        };
        info!(
            source = %source_handle.identifier,
            target = %sink_handle.identifier,
            resume_after = ?checkpoint.last_completed_id(),
            dry_run,
            "replication starting"
        );

        let collector = Collector::new(
            self.source.clone(),
            source_handle.clone(),
            self.config.collector(),
            cancel.clone(),
        );
        let media = MediaTransfer::new(
            self.source.clone(),
            source_handle,
            self.config.max_attachment_bytes,
        );
        let rate = RateLimiter::with_cancellation(self.config.rate_limit(), cancel.clone());
        let dispatcher = Dispatcher::new(self.sink.clone(), sink_handle, media, rate, dry_run);

        let (progress_tx, progress_rx) = watch::channel(ProgressSnapshot {
            last_completed_id: checkpoint.last_completed_id(),
            ..ProgressSnapshot::default()
        });
        let reporter_cancel = cancel.child_token();
        let reporter = self.config.progress_interval().map(|interval| {
            ProgressReporter::new(interval, progress_rx, reporter_cancel.clone())
                .with_recovery_state(recovery.subscribe())
                .spawn()
        });

        let started = Instant::now();
        let mut run = Run {
            cancel,
            collector,
            merger: GroupingMerger::new(self.config.grouping()),
            dispatcher,
            recovery,
            dedup: &mut dedup,
            checkpoint: &mut checkpoint,
            ledger: &mut ledger,
            progress: ProgressSnapshot::default(),
            progress_tx,
        };
        run.progress.last_completed_id = run.checkpoint.last_completed_id();
        let result = run.drive().await;

        let summary = RunSummary {
            progress: run.progress.clone(),
            elapsed: started.elapsed(),
            rate_wait: run.dispatcher.rate_limiter().total_wait(),
            suspended_for: run.recovery.stats().suspended_for,
            refreshes: run.recovery.stats().refreshes,
            retries: run.collector.stats().retries + run.recovery.stats().remote_retries,
            peak_resident_items: run.merger.stats().peak_resident,
            cancelled: matches!(result, Err(ReplError::Cancelled)),
        };
        drop(run);
        if let Some(path) = ledger.path() {
            debug!(
                path = %path.display(),
                recorded = ledger.session().units,
                "ledger updated"
            );
        }

        reporter_cancel.cancel();
        if let Some(handle) = reporter {
            let _ = handle.await;
        }
        if !dry_run {
            if let Err(e) = checkpoint.flush() {
                warn!(error = %e, "final checkpoint flush failed");
            }
        }
        summary.log();

        match result {
            Ok(()) | Err(ReplError::Cancelled) => Ok(summary),
            Err(e) => Err(e),
        }
    }

    /// Sleep out a suspension left by a previous run, then resolve both
    /// entities. Mandatory waits raised while resolving are served in full.
    async fn prepare(
        &self,
        recovery: &mut RecoveryController,
        checkpoint: &mut CheckpointStore,
    ) -> ReplResult<(EntityHandle, EntityHandle)> {
        if !self.config.dry_run {
            recovery.resume(checkpoint).await?;
        }
        let source = loop {
            match self.source.resolve(&self.config.source).await {
                Err(ReplError::MandatoryWait { wait }) => recovery.suspend(wait, None, checkpoint).await?,
                other => break other?,
            }
        };
        let sink = loop {
            match self.sink.resolve(&self.config.target).await {
                Err(ReplError::MandatoryWait { wait }) => recovery.suspend(wait, None, checkpoint).await?,
                other => break other?,
            }
        };
        Ok((source, sink))
    }

    /// Read the persisted state of `config.state_dir` without changing it.
    pub fn status(config: &ReplConfig) -> ReplResult<StatusReport> {
        let (store, outcome) = CheckpointStore::load(config.checkpoint_path())?;
        let checkpoint_state = match outcome {
            LoadOutcome::Fresh => "missing".to_string(),
            LoadOutcome::Resumed => "valid".to_string(),
            LoadOutcome::Corrupt { reason } => format!("corrupt: {reason}"),
        };
        let dedup = Deduplicator::open(config.dedup_path(), config.dedup_retention)?;
        Ok(StatusReport {
            checkpoint: store.checkpoint().clone(),
            checkpoint_state,
            dedup_retained: dedup.len(),
            ledger: ReplicationLedger::summary(&config.ledger_path())?,
            lock_holder: InstanceLock::holder(&config.state_dir)?,
        })
    }

    /// Forget all progress in `config.state_dir`. The ledger is kept.
    pub fn reset(config: &ReplConfig) -> ReplResult<()> {
        let state_dir: &Path = &config.state_dir;
        let _lock = InstanceLock::acquire(state_dir)?;
        let (mut checkpoint, _) = CheckpointStore::load(config.checkpoint_path())?;
        checkpoint.reset()?;
        Deduplicator::open(config.dedup_path(), config.dedup_retention)?.clear()?;
        info!(state_dir = %state_dir.display(), "replication state reset");
        Ok(())
    }
}

/// Components of one run, borrowed for its duration.
struct Run<'a> {
    cancel: CancellationToken,
    collector: Collector,
    merger: GroupingMerger,
    dispatcher: Dispatcher,
    recovery: RecoveryController,
    dedup: &'a mut Deduplicator,
    checkpoint: &'a mut CheckpointStore,
    ledger: &'a mut ReplicationLedger,
    progress: ProgressSnapshot,
    progress_tx: watch::Sender<ProgressSnapshot>,
}

impl Run<'_> {
    async fn drive(&mut self) -> ReplResult<()> {
        let mut fetched_up_to = self.checkpoint.last_completed_id();
        loop {
            let window = match self.collector.next_window_with_retry(fetched_up_to).await {
                Err(ReplError::MandatoryWait { wait }) => {
                    // Nothing from this read was handed out; read it again.
                    self.recovery.suspend(wait, None, self.checkpoint).await?;
                    continue;
                }
                other => other?,
            };
            let exhausted = window.is_empty();
            if let Some(last) = window.last() {
                fetched_up_to = Some(last.id);
            }
            let units = self.merger.push_window(window);
            self.handle_batch(units, fetched_up_to).await?;
            if exhausted {
                info!(last_completed_id = ?self.checkpoint.last_completed_id(), "source exhausted");
                return Ok(());
            }
        }
    }

    async fn handle_batch(
        &mut self,
        units: Vec<ProcessingUnit>,
        fetched_up_to: Option<ItemId>,
    ) -> ReplResult<()> {
        // suffix_min[i]: lowest id among units[i..].
        let mut suffix_min = vec![ItemId::MAX; units.len() + 1];
        for (i, unit) in units.iter().enumerate().rev() {
            let lowest = unit.items().iter().map(|it| it.id).min().unwrap_or(ItemId::MAX);
            suffix_min[i] = suffix_min[i + 1].min(lowest);
        }

        for (i, mut unit) in units.into_iter().enumerate() {
            if self.cancel.is_cancelled() {
                info!(next = %unit.descriptor(), "stop requested, leaving at unit boundary");
                return Err(ReplError::Cancelled);
            }
            let descriptor = unit.descriptor();
            let fingerprint = Fingerprint::of(&unit);

            if self.dedup.seen(&fingerprint) {
                debug!(%descriptor, %fingerprint, "already replicated, skipping");
                self.progress.record_duplicate(descriptor);
            } else {
                let report = self
                    .recovery
                    .dispatch(&mut self.dispatcher, &mut unit, self.checkpoint)
                    .await?;
                self.ledger.record(&unit, &report);
                self.progress
                    .record(descriptor, unit.len(), report.outcome, report.dropped.len());
            }

            let advance_to = self.watermark(suffix_min[i + 1], fetched_up_to);
            self.dispatcher
                .commit(&unit, advance_to, self.dedup, self.checkpoint)
                .map_err(|e| e.halted(descriptor))?;

            self.progress.last_completed_id = self.checkpoint.last_completed_id();
            self.progress.suspensions = self.recovery.stats().suspensions;
            self.progress_tx.send_replace(self.progress.clone());
        }
        Ok(())
    }

    /// Highest id every item at or below which has been handled.
    fn watermark(&self, rest_of_batch: ItemId, fetched_up_to: Option<ItemId>) -> Option<ItemId> {
        let next_unfetched = fetched_up_to.map_or(0, |id| id.saturating_add(1));
        let lowest_outstanding = [
            rest_of_batch,
            self.merger.lowest_outstanding_id().unwrap_or(ItemId::MAX),
            next_unfetched,
        ]
        .into_iter()
        .min()
        .unwrap_or(ItemId::MAX);
        // Ids below the lowest outstanding one are either absent from the
        // source or belong to units already committed, this one included.
        lowest_outstanding.checked_sub(1)
    }
}
