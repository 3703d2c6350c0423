//! Send-rate throttling.
//!
//! Every remote send (retries included) must first take a slot from the
//! [`RateLimiter`]. The budget enforces two limits at once: at most
//! `max_per_window` sends in any rolling window (one hour by default) and a
//! fixed minimum spacing between consecutive sends. Requests are only ever
//! delayed, never dropped.

use std::collections::VecDeque;
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::error::{ReplError, ReplResult};

/// Rolling window used for the hourly budget.
pub const DEFAULT_WINDOW: Duration = Duration::from_secs(3600);

/// Rate limit configuration.
#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    /// Maximum sends within one rolling window.
    pub max_per_window: u32,
    /// Length of the rolling window.
    pub window: Duration,
    /// Minimum delay between two consecutive sends.
    pub min_interval: Duration,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            max_per_window: 30,
            window: DEFAULT_WINDOW,
            min_interval: Duration::from_secs(3),
        }
    }
}

/// Throttle state. Mutated only through [`RateLimiter`].
#[derive(Debug)]
pub struct RateBudget {
    max_per_window: u32,
    window: Duration,
    min_interval: Duration,
    /// Grant instants inside the current rolling window, oldest first.
    grants: VecDeque<Instant>,
    last_grant: Option<Instant>,
}

impl RateBudget {
    /// Create an untouched budget.
    pub fn new(config: &RateLimitConfig) -> Self {
        Self {
            max_per_window: config.max_per_window.max(1),
            window: config.window,
            min_interval: config.min_interval,
            grants: VecDeque::with_capacity(config.max_per_window as usize),
            last_grant: None,
        }
    }

    /// Maximum sends per window.
    pub fn max_per_window(&self) -> u32 {
        self.max_per_window
    }

    /// Minimum spacing between sends.
    pub fn min_interval(&self) -> Duration {
        self.min_interval
    }

    /// Start of the current rolling window, i.e. the oldest grant still counted.
    pub fn window_start(&self) -> Option<Instant> {
        self.grants.front().copied()
    }

    /// Slots left in the rolling window at `now`.
    pub fn tokens(&mut self, now: Instant) -> u32 {
        self.expire(now);
        self.max_per_window - self.grants.len() as u32
    }

    fn expire(&mut self, now: Instant) {
        while let Some(&oldest) = self.grants.front() {
            if now.saturating_duration_since(oldest) >= self.window {
                self.grants.pop_front();
            } else {
                break;
            }
        }
    }

    /// How long a caller arriving at `now` has to wait for a slot.
    pub fn delay_at(&mut self, now: Instant) -> Duration {
        self.expire(now);
        let window_delay = if self.grants.len() as u32 >= self.max_per_window {
            self.grants
                .front()
                .map(|&oldest| (oldest + self.window).saturating_duration_since(now))
                .unwrap_or_default()
        } else {
            Duration::ZERO
        };
        let spacing_delay = self
            .last_grant
            .map(|last| (last + self.min_interval).saturating_duration_since(now))
            .unwrap_or_default();
        window_delay.max(spacing_delay)
    }

    /// Consume a slot at `now`. Returns false if none is available yet.
    pub fn try_grant(&mut self, now: Instant) -> bool {
        if !self.delay_at(now).is_zero() {
            return false;
        }
        self.grants.push_back(now);
        self.last_grant = Some(now);
        true
    }
}

/// Throttle in front of every remote send.
///
/// The dispatcher is the only caller and never acquires concurrently, so the
/// limiter takes `&mut self` rather than locking.
#[derive(Debug)]
pub struct RateLimiter {
    budget: RateBudget,
    cancel: CancellationToken,
    total_wait: Duration,
}

impl RateLimiter {
    /// Create a limiter that never observes cancellation.
    pub fn new(config: RateLimitConfig) -> Self {
        Self::with_cancellation(config, CancellationToken::new())
    }

    /// Create a limiter whose waits end early when `cancel` fires.
    pub fn with_cancellation(config: RateLimitConfig, cancel: CancellationToken) -> Self {
        Self {
            budget: RateBudget::new(&config),
            cancel,
            total_wait: Duration::ZERO,
        }
    }

    /// Read-only view of the budget.
    pub fn budget(&self) -> &RateBudget {
        &self.budget
    }

    /// Total time spent waiting for slots.
    pub fn total_wait(&self) -> Duration {
        self.total_wait
    }

    /// Suspend until one send slot is available, then take it.
    pub async fn acquire(&mut self) -> ReplResult<()> {
        loop {
            let now = Instant::now();
            let delay = self.budget.delay_at(now);
            if delay.is_zero() {
                self.budget.try_grant(now);
                return Ok(());
            }
            if delay > self.budget.min_interval() {
                info!(
                    wait_secs = delay.as_secs(),
                    max_per_window = self.budget.max_per_window(),
                    "hourly send budget exhausted, waiting"
                );
            } else {
                debug!(wait_ms = delay.as_millis() as u64, "spacing sends");
            }
            tokio::select! {
                _ = self.cancel.cancelled() => return Err(ReplError::Cancelled),
                _ = tokio::time::sleep(delay) => {}
            }
            self.total_wait += delay;
        }
    }
}
