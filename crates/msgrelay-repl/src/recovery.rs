//! Recovery state machine around the dispatcher.
//!
//! ```text
//! RUNNING --mandatory wait(d)--> SUSPENDED --d elapsed--> RUNNING (same unit)
//! RUNNING --stale reference--> REFRESHING --refetch ok--> RUNNING (retry once)
//!                                         --refetch failed--> RUNNING (media dropped)
//! RUNNING --unrecoverable--> FAILED
//! ```
//!
//! A mandatory wait applies to the whole connection, so the unit that hit it
//! is retried after the wait however long it is; it is never skipped. The
//! suspension is written to the checkpoint before sleeping so a restart
//! sleeps out the remainder first.
//!
//! Each attachment gets one refresh. A stale reference that matches no
//! attachment still in the unit drops all of its media; if none is left to
//! drop, the unit halts.

use std::collections::HashSet;
use std::time::Duration;

use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::checkpoint::{now_unix_ms, CheckpointStore};
use crate::dispatch::{Dispatcher, DroppedAttachment, SendOutcome, SendReport};
use crate::error::{ReplError, ReplResult};
use crate::item::{ItemId, ProcessingUnit, UnitDescriptor};
use crate::retry::{sleep_or_cancel, RetryConfig};

/// Controller state, published for observers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryState {
    /// Dispatching normally.
    Running,
    /// Sleeping out a mandatory wait.
    Suspended {
        /// Wall-clock end of the wait, Unix milliseconds.
        until_ms: u64,
    },
    /// Re-fetching an item whose media reference expired.
    Refreshing {
        /// Item being refreshed.
        item_id: ItemId,
    },
    /// Stopped on an unrecoverable error.
    Failed,
}

/// Recovery statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecoveryStats {
    /// Mandatory waits served (including one resumed after restart).
    pub suspensions: u64,
    /// Total time spent suspended.
    pub suspended_for: Duration,
    /// Successful item refreshes after a stale reference.
    pub refreshes: u64,
    /// Attachments dropped because they stayed stale or could not be refreshed.
    pub stale_dropped: u64,
    /// Retries of transient remote failures.
    pub remote_retries: u64,
}

/// Drives one unit through the dispatcher until it is delivered or the run
/// must stop.
pub struct RecoveryController {
    retry: RetryConfig,
    cancel: CancellationToken,
    state: watch::Sender<RecoveryState>,
    stats: RecoveryStats,
}

impl RecoveryController {
    /// Create a controller. `retry` bounds transient remote failures per unit.
    pub fn new(retry: RetryConfig, cancel: CancellationToken) -> Self {
        let (state, _) = watch::channel(RecoveryState::Running);
        Self {
            retry,
            cancel,
            state,
            stats: RecoveryStats::default(),
        }
    }

    /// Current state.
    pub fn state(&self) -> RecoveryState {
        *self.state.borrow()
    }

    /// Observe state changes.
    pub fn subscribe(&self) -> watch::Receiver<RecoveryState> {
        self.state.subscribe()
    }

    /// Current statistics.
    pub fn stats(&self) -> &RecoveryStats {
        &self.stats
    }

    fn set_state(&self, state: RecoveryState) {
        self.state.send_replace(state);
    }

    /// Serve any suspension persisted by a previous run before doing anything
    /// else.
    pub async fn resume(&mut self, checkpoint: &mut CheckpointStore) -> ReplResult<()> {
        let record = checkpoint.checkpoint().clone();
        match record.remaining_suspension(now_unix_ms()) {
            Some(remaining) => {
                let until_ms = record.suspended_until_ms.unwrap_or_default();
                info!(
                    remaining_secs = remaining.as_secs(),
                    pending = ?record.pending_unit,
                    "resuming inside a mandatory wait, sleeping out the remainder"
                );
                self.set_state(RecoveryState::Suspended { until_ms });
                self.stats.suspensions += 1;
                sleep_or_cancel(remaining, &self.cancel).await?;
                self.stats.suspended_for += remaining;
                checkpoint.clear_suspension()?;
                self.set_state(RecoveryState::Running);
            }
            None if record.suspended_until_ms.is_some() => checkpoint.clear_suspension()?,
            None => {}
        }
        Ok(())
    }

    /// Dispatch `unit`, recovering from waits, stale references and transient
    /// failures. Media that cannot be refreshed is stripped from `unit`.
    ///
    /// Unrecoverable errors come back as `Halted` with the unit's id range;
    /// cancellation comes back as `Cancelled`.
    pub async fn dispatch(
        &mut self,
        dispatcher: &mut Dispatcher,
        unit: &mut ProcessingUnit,
        checkpoint: &mut CheckpointStore,
    ) -> ReplResult<SendReport> {
        let descriptor = unit.descriptor();
        let with_media: Vec<ItemId> = unit
            .items()
            .iter()
            .filter(|i| i.media.is_some())
            .map(|i| i.id)
            .collect();
        let mut refreshed: HashSet<ItemId> = HashSet::new();
        let mut remote_attempt = 0u32;
        loop {
            if self.cancel.is_cancelled() {
                return Err(ReplError::Cancelled);
            }
            let err = match dispatcher.send(unit).await {
                Ok(mut report) => {
                    self.set_state(RecoveryState::Running);
                    note_stripped(&mut report, unit, &with_media);
                    return Ok(report);
                }
                Err(e) => e,
            };
            match err {
                ReplError::Cancelled => return Err(ReplError::Cancelled),
                ReplError::MandatoryWait { wait } => {
                    self.suspend(wait, Some(descriptor), checkpoint).await?;
                }
                ReplError::StaleReference { item_id }
                    if !unit.items().iter().any(|i| i.id == item_id && i.media.is_some()) =>
                {
                    // Nothing attached matches the rejected reference; only
                    // sending without any media can get past it.
                    let attached: Vec<ItemId> = unit
                        .items()
                        .iter()
                        .filter(|i| i.media.is_some())
                        .map(|i| i.id)
                        .collect();
                    if attached.is_empty() {
                        self.set_state(RecoveryState::Failed);
                        error!(%descriptor, item_id, "stale reference with no media left to drop, halting");
                        return Err(ReplError::StaleReference { item_id }.halted(descriptor));
                    }
                    warn!(
                        %descriptor,
                        item_id,
                        dropped = attached.len(),
                        "stale reference does not match an attachment, sending without media"
                    );
                    self.stats.stale_dropped += attached.len() as u64;
                    for id in attached {
                        unit.strip_media(id);
                    }
                }
                ReplError::StaleReference { item_id } => {
                    if refreshed.insert(item_id) {
                        if !self.refresh(dispatcher, unit, item_id, descriptor, checkpoint).await? {
                            refreshed.remove(&item_id);
                        }
                    } else {
                        warn!(%descriptor, item_id, "media still stale after refresh, sending without it");
                        unit.strip_media(item_id);
                        self.stats.stale_dropped += 1;
                    }
                }
                e if e.is_retryable() && self.retry.allows(remote_attempt + 1) => {
                    remote_attempt += 1;
                    self.stats.remote_retries += 1;
                    let delay = self.retry.backoff(remote_attempt - 1);
                    warn!(
                        %descriptor,
                        error = %e,
                        attempt = remote_attempt,
                        backoff_ms = delay.as_millis() as u64,
                        "send failed, retrying"
                    );
                    sleep_or_cancel(delay, &self.cancel).await?;
                }
                e => {
                    self.set_state(RecoveryState::Failed);
                    error!(%descriptor, error = %e, "unrecoverable error, halting");
                    return Err(e.halted(descriptor));
                }
            }
        }
    }

    /// Persist the suspension, then sleep through it.
    ///
    /// `pending` is the unit whose send hit the wait; waits raised while
    /// reading or resolving the source have none.
    pub async fn suspend(
        &mut self,
        wait: Duration,
        pending: Option<UnitDescriptor>,
        checkpoint: &mut CheckpointStore,
    ) -> ReplResult<()> {
        let halted = |e: ReplError| match pending {
            Some(descriptor) => e.halted(descriptor),
            None => e,
        };
        let until_ms = now_unix_ms().saturating_add(wait.as_millis() as u64);
        checkpoint.suspend(pending, until_ms).map_err(halted)?;
        self.set_state(RecoveryState::Suspended { until_ms });
        self.stats.suspensions += 1;
        warn!(
            pending = ?pending,
            wait_secs = wait.as_secs(),
            "remote imposed a mandatory wait, suspending"
        );
        sleep_or_cancel(wait, &self.cancel).await?;
        self.stats.suspended_for += wait;
        checkpoint.clear_suspension().map_err(halted)?;
        self.set_state(RecoveryState::Running);
        info!(pending = ?pending, "mandatory wait served, resuming");
        Ok(())
    }

    /// Re-fetch `item_id` and swap in its fresh media reference.
    ///
    /// Returns `false` when the refresh itself hit a mandatory wait and should
    /// be attempted again; the wait has been served by then.
    async fn refresh(
        &mut self,
        dispatcher: &Dispatcher,
        unit: &mut ProcessingUnit,
        item_id: ItemId,
        descriptor: UnitDescriptor,
        checkpoint: &mut CheckpointStore,
    ) -> ReplResult<bool> {
        self.set_state(RecoveryState::Refreshing { item_id });
        info!(%descriptor, item_id, "stale media reference, refreshing item");
        match dispatcher.media().refresh_item(item_id).await {
            Ok(Some(fresh)) if fresh.media.is_some() => {
                let current = unit.items().iter().find(|i| i.id == item_id).cloned();
                if let Some(mut updated) = current {
                    updated.media = fresh.media;
                    unit.replace_item(updated);
                }
                self.stats.refreshes += 1;
            }
            Ok(_) => {
                warn!(%descriptor, item_id, "refreshed item has no media, sending without it");
                unit.strip_media(item_id);
                self.stats.stale_dropped += 1;
            }
            Err(ReplError::Cancelled) => return Err(ReplError::Cancelled),
            Err(ReplError::MandatoryWait { wait }) => {
                self.suspend(wait, Some(descriptor), checkpoint).await?;
                return Ok(false);
            }
            Err(e) if e.is_unrecoverable() => {
                self.set_state(RecoveryState::Failed);
                return Err(e.halted(descriptor));
            }
            Err(e) => {
                warn!(%descriptor, item_id, error = %e, "refresh failed, sending without media");
                unit.strip_media(item_id);
                self.stats.stale_dropped += 1;
            }
        }
        self.set_state(RecoveryState::Running);
        Ok(true)
    }
}

/// Report media stripped after stale references as dropped attachments.
fn note_stripped(report: &mut SendReport, unit: &ProcessingUnit, with_media: &[ItemId]) {
    let stripped: Vec<DroppedAttachment> = unit
        .items()
        .iter()
        .filter(|i| i.media.is_none() && with_media.contains(&i.id))
        .map(|i| DroppedAttachment {
            item_id: i.id,
            reason: "media reference stale after refresh".to_string(),
        })
        .collect();
    if stripped.is_empty() {
        return;
    }
    report.dropped.extend(stripped);
    if report.outcome.delivered() {
        report.outcome = if report.attachments == 0 {
            SendOutcome::TextOnly
        } else {
            SendOutcome::Degraded
        };
    }
}
