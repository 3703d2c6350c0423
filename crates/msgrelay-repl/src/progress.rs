//! Progress snapshots and the periodic reporter task.
//!
//! The pipeline publishes an immutable [`ProgressSnapshot`] after every unit
//! on a `watch` channel. The reporter only reads that channel and never
//! touches pipeline state.

use std::time::Duration;

use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::dispatch::SendOutcome;
use crate::item::{ItemId, UnitDescriptor};
use crate::recovery::RecoveryState;

/// Point-in-time view of a run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ProgressSnapshot {
    /// Units handled (delivered, skipped or recorded in dry-run).
    pub units: u64,
    /// Source items covered by those units.
    pub items: u64,
    /// Units delivered in full.
    pub sent: u64,
    /// Units delivered with media left out.
    pub degraded: u64,
    /// Units delivered as text only.
    pub text_only: u64,
    /// Units with nothing to deliver.
    pub skipped: u64,
    /// Units only logged (dry run).
    pub dry_run: u64,
    /// Units recognised as already replicated.
    pub duplicates: u64,
    /// Attachments left out.
    pub dropped_attachments: u64,
    /// Mandatory waits served.
    pub suspensions: u64,
    /// Current resume cursor.
    pub last_completed_id: Option<ItemId>,
    /// Unit most recently handled.
    pub last_unit: Option<UnitDescriptor>,
}

impl ProgressSnapshot {
    /// Count one handled unit.
    pub fn record(&mut self, descriptor: UnitDescriptor, items: usize, outcome: SendOutcome, dropped: usize) {
        self.units += 1;
        self.items += items as u64;
        self.dropped_attachments += dropped as u64;
        self.last_unit = Some(descriptor);
        match outcome {
            SendOutcome::Sent => self.sent += 1,
            SendOutcome::Degraded => self.degraded += 1,
            SendOutcome::TextOnly => self.text_only += 1,
            SendOutcome::Skipped => self.skipped += 1,
            SendOutcome::DryRun => self.dry_run += 1,
        }
    }

    /// Count one unit skipped as a duplicate.
    pub fn record_duplicate(&mut self, descriptor: UnitDescriptor) {
        self.duplicates += 1;
        self.last_unit = Some(descriptor);
    }
}

/// Final report of a run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RunSummary {
    /// Counters at the end of the run.
    pub progress: ProgressSnapshot,
    /// Wall time of the run.
    pub elapsed: Duration,
    /// Time spent waiting on the rate limiter.
    pub rate_wait: Duration,
    /// Time spent in mandatory waits.
    pub suspended_for: Duration,
    /// Stale references refreshed.
    pub refreshes: u64,
    /// Transient failures retried.
    pub retries: u64,
    /// Largest number of items held in memory at once.
    pub peak_resident_items: usize,
    /// Whether the run stopped on cancellation rather than exhaustion.
    pub cancelled: bool,
}

impl RunSummary {
    /// Log the final performance report.
    pub fn log(&self) {
        let secs = self.elapsed.as_secs_f64();
        let per_hour = if secs > 0.0 {
            self.progress.units as f64 * 3600.0 / secs
        } else {
            0.0
        };
        info!(
            units = self.progress.units,
            items = self.progress.items,
            sent = self.progress.sent,
            degraded = self.progress.degraded,
            text_only = self.progress.text_only,
            skipped = self.progress.skipped,
            duplicates = self.progress.duplicates,
            dropped_attachments = self.progress.dropped_attachments,
            suspensions = self.progress.suspensions,
            suspended_secs = self.suspended_for.as_secs(),
            rate_wait_secs = self.rate_wait.as_secs(),
            refreshes = self.refreshes,
            retries = self.retries,
            peak_resident_items = self.peak_resident_items,
            elapsed_secs = self.elapsed.as_secs(),
            units_per_hour = (per_hour * 10.0).round() / 10.0,
            last_completed_id = ?self.progress.last_completed_id,
            cancelled = self.cancelled,
            "replication run finished"
        );
    }
}

/// Periodic logger of the latest snapshot.
pub struct ProgressReporter {
    interval: Duration,
    snapshots: watch::Receiver<ProgressSnapshot>,
    state: Option<watch::Receiver<RecoveryState>>,
    cancel: CancellationToken,
}

impl ProgressReporter {
    /// Create a reporter reading `snapshots` every `interval`.
    pub fn new(
        interval: Duration,
        snapshots: watch::Receiver<ProgressSnapshot>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            interval: interval.max(Duration::from_millis(1)),
            snapshots,
            state: None,
            cancel,
        }
    }

    /// Also report the recovery state.
    pub fn with_recovery_state(mut self, state: watch::Receiver<RecoveryState>) -> Self {
        self.state = Some(state);
        self
    }

    /// Run on the current runtime until cancelled or the pipeline drops its
    /// sender. The task yields the number of reports it logged.
    pub fn spawn(self) -> JoinHandle<u64> {
        tokio::spawn(self.run())
    }

    async fn run(mut self) -> u64 {
        let started = Instant::now();
        let mut ticker = tokio::time::interval_at(started + self.interval, self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut reports = 0u64;
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }
            if self.snapshots.has_changed().is_err() {
                break;
            }
            let snapshot = self.snapshots.borrow_and_update().clone();
            let state = self.state.as_ref().map(|s| *s.borrow());
            let elapsed = started.elapsed();
            info!(
                units = snapshot.units,
                items = snapshot.items,
                duplicates = snapshot.duplicates,
                dropped_attachments = snapshot.dropped_attachments,
                suspensions = snapshot.suspensions,
                last_completed_id = ?snapshot.last_completed_id,
                state = ?state,
                elapsed_secs = elapsed.as_secs(),
                "progress"
            );
            reports += 1;
        }
        reports
    }
}
