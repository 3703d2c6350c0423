//! Exponential backoff for transient failures and cancellable sleeps.

use std::time::Duration;

use rand::Rng;
use tokio_util::sync::CancellationToken;

use crate::error::{ReplError, ReplResult};

/// Configuration for retry behavior.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum number of retry attempts after the first failure (default: 3).
    pub max_retries: u32,
    /// Initial backoff duration (default: 1 second).
    pub initial_backoff: Duration,
    /// Maximum backoff duration (default: 60 seconds).
    pub max_backoff: Duration,
    /// Multiplier for exponential backoff (default: 2.0).
    pub backoff_multiplier: f64,
    /// Whether to add random jitter to backoff (default: true).
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(60),
            backoff_multiplier: 2.0,
            jitter: true,
        }
    }
}

impl RetryConfig {
    /// Config with the given retry count and default timings.
    pub fn with_max_retries(max_retries: u32) -> Self {
        Self {
            max_retries,
            ..Self::default()
        }
    }

    /// Whether a failure on attempt `attempt` (1-based) may be retried.
    pub fn allows(&self, attempt: u32) -> bool {
        attempt <= self.max_retries
    }

    /// Backoff before retry number `retry` (0-based).
    pub fn backoff(&self, retry: u32) -> Duration {
        let base_delay_ms = self.initial_backoff.as_millis() as f64;
        let max_delay_ms = self.max_backoff.as_millis() as f64;
        let computed = base_delay_ms * self.backoff_multiplier.powi(retry as i32);
        let capped = computed.min(max_delay_ms) as u64;

        if self.jitter && capped > 1 {
            let jitter_ms = rand::thread_rng().gen_range(0..capped / 2 + 1);
            Duration::from_millis(capped.saturating_add(jitter_ms))
        } else {
            Duration::from_millis(capped)
        }
    }
}

/// Sleep for `delay`, returning `Cancelled` if `cancel` fires first.
pub async fn sleep_or_cancel(delay: Duration, cancel: &CancellationToken) -> ReplResult<()> {
    tokio::select! {
        _ = cancel.cancelled() => Err(ReplError::Cancelled),
        _ = tokio::time::sleep(delay) => Ok(()),
    }
}
