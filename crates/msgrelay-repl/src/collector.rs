//! Bounded-window reads from the source.
//!
//! The collector never materialises more than one window of items. Windows
//! come back in strictly increasing id order; an empty window means the
//! source is exhausted.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::{ReplError, ReplResult};
use crate::item::{Item, ItemId};
use crate::remote::{EntityHandle, MessageSource};
use crate::retry::{sleep_or_cancel, RetryConfig};

/// Collector configuration.
#[derive(Debug, Clone)]
pub struct CollectorConfig {
    /// Maximum items per window.
    pub window_size: usize,
    /// Maximum wait for one window.
    pub source_timeout: Duration,
    /// Backoff policy for `SourceTimeout` and transient remote errors.
    pub retry: RetryConfig,
}

impl Default for CollectorConfig {
    fn default() -> Self {
        Self {
            window_size: 100,
            source_timeout: Duration::from_secs(60),
            retry: RetryConfig::default(),
        }
    }
}

/// Collector statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CollectorStats {
    /// Windows returned (including the final empty one).
    pub windows: u64,
    /// Items returned.
    pub items: u64,
    /// Failed attempts that were retried.
    pub retries: u64,
    /// Items discarded for violating the ordering contract.
    pub discarded: u64,
}

/// Reads the source one bounded window at a time.
pub struct Collector {
    source: Arc<dyn MessageSource>,
    handle: EntityHandle,
    config: CollectorConfig,
    cancel: CancellationToken,
    stats: CollectorStats,
}

impl Collector {
    /// Create a collector over a resolved source.
    pub fn new(
        source: Arc<dyn MessageSource>,
        handle: EntityHandle,
        config: CollectorConfig,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            source,
            handle,
            config: CollectorConfig {
                window_size: config.window_size.max(1),
                ..config
            },
            cancel,
            stats: CollectorStats::default(),
        }
    }

    /// Configured window size.
    pub fn window_size(&self) -> usize {
        self.config.window_size
    }

    /// Current statistics.
    pub fn stats(&self) -> &CollectorStats {
        &self.stats
    }

    /// Fetch the next window of items after `after_id`, in one attempt.
    pub async fn next_window(&mut self, after_id: Option<ItemId>) -> ReplResult<Vec<Item>> {
        let timeout = self.config.source_timeout;
        let fetch = self
            .source
            .iterate(&self.handle, after_id, self.config.window_size);
        let raw = tokio::select! {
            _ = self.cancel.cancelled() => return Err(ReplError::Cancelled),
            res = tokio::time::timeout(timeout, fetch) => match res {
                Ok(items) => items?,
                Err(_) => {
                    return Err(ReplError::SourceTimeout {
                        after_id,
                        timeout_ms: timeout.as_millis() as u64,
                    })
                }
            },
        };
        let window = self.enforce_order(after_id, raw);
        self.stats.windows += 1;
        self.stats.items += window.len() as u64;
        debug!(
            after_id = ?after_id,
            count = window.len(),
            first_id = ?window.first().map(|i| i.id),
            last_id = ?window.last().map(|i| i.id),
            "collected window"
        );
        Ok(window)
    }

    /// Fetch the next window, retrying timeouts and transient remote errors
    /// with backoff. Gives up after the configured number of retries.
    pub async fn next_window_with_retry(
        &mut self,
        after_id: Option<ItemId>,
    ) -> ReplResult<Vec<Item>> {
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            match self.next_window(after_id).await {
                Ok(window) => return Ok(window),
                Err(e) if e.is_retryable() && self.config.retry.allows(attempt) => {
                    let delay = self.config.retry.backoff(attempt - 1);
                    warn!(
                        error = %e,
                        attempt,
                        backoff_ms = delay.as_millis() as u64,
                        "source read failed, retrying"
                    );
                    self.stats.retries += 1;
                    sleep_or_cancel(delay, &self.cancel).await?;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Keep only items past the cursor in strictly increasing id order.
    fn enforce_order(&mut self, after_id: Option<ItemId>, mut raw: Vec<Item>) -> Vec<Item> {
        let in_order = raw.windows(2).all(|w| w[0].id < w[1].id);
        if !in_order {
            warn!("source returned items out of order, re-sorting window");
            raw.sort_by_key(|i| i.id);
            let before = raw.len();
            raw.dedup_by_key(|i| i.id);
            self.stats.discarded += (before - raw.len()) as u64;
        }
        if let Some(after) = after_id {
            let before = raw.len();
            raw.retain(|i| i.id > after);
            let dropped = before - raw.len();
            if dropped > 0 {
                warn!(after_id = after, dropped, "source returned items at or before cursor");
                self.stats.discarded += dropped as u64;
            }
        }
        if raw.len() > self.config.window_size {
            // Anything past the window is fetched again next call.
            raw.truncate(self.config.window_size);
        }
        raw
    }
}
