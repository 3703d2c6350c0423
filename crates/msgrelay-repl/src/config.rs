//! Run configuration.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::collector::CollectorConfig;
use crate::error::{ReplError, ReplResult};
use crate::grouping::GroupingConfig;
use crate::media::DEFAULT_MAX_ATTACHMENT_BYTES;
use crate::rate_limit::{RateLimitConfig, DEFAULT_WINDOW};
use crate::retry::RetryConfig;

/// Everything a replication run needs, loadable from TOML or JSON.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReplConfig {
    /// Source identifier handed to the remote binding.
    pub source: String,
    /// Sink identifier handed to the remote binding.
    pub target: String,
    /// Items per collector window.
    pub window_size: usize,
    /// Send budget per rolling hour.
    pub max_ops_per_hour: u32,
    /// Minimum spacing between sends.
    pub min_interval_secs: u64,
    /// Fingerprints retained for deduplication.
    pub dedup_retention: usize,
    /// Maximum wait for one source window.
    pub source_timeout_secs: u64,
    /// Cap on items carried between windows; defaults to `window_size`.
    pub max_pending_carryover: Option<usize>,
    /// Retries of a stalled or failing source read.
    pub source_max_retries: u32,
    /// Retries of a failing send.
    pub remote_max_retries: u32,
    /// Attachments above this size are left out.
    pub max_attachment_bytes: u64,
    /// Directory for checkpoint, dedup state, ledger and lock.
    pub state_dir: PathBuf,
    /// Log units instead of sending them.
    pub dry_run: bool,
    /// Seconds between progress reports; 0 disables them.
    pub progress_interval_secs: u64,
    /// Append a ledger line per unit.
    pub ledger_enabled: bool,
}

impl Default for ReplConfig {
    fn default() -> Self {
        Self {
            source: String::new(),
            target: String::new(),
            window_size: 100,
            max_ops_per_hour: 30,
            min_interval_secs: 3,
            dedup_retention: 10_000,
            source_timeout_secs: 60,
            max_pending_carryover: None,
            source_max_retries: 3,
            remote_max_retries: 3,
            max_attachment_bytes: DEFAULT_MAX_ATTACHMENT_BYTES,
            state_dir: PathBuf::from("msgrelay-state"),
            dry_run: false,
            progress_interval_secs: 60,
            ledger_enabled: true,
        }
    }
}

impl ReplConfig {
    /// Load from a `.toml` or `.json` file, chosen by extension.
    pub fn from_file(path: &Path) -> ReplResult<Self> {
        let contents = std::fs::read_to_string(path)?;
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or_default();

        match ext.to_lowercase().as_str() {
            "toml" => toml::from_str(&contents).map_err(|e| ReplError::Config {
                msg: format!("{}: {e}", path.display()),
            }),
            "json" => Ok(serde_json::from_str(&contents)?),
            _ => Err(ReplError::Config {
                msg: format!("unsupported config file extension: {ext:?}"),
            }),
        }
    }

    /// Reject settings the pipeline cannot run with.
    pub fn validate(&self) -> ReplResult<()> {
        let fail = |msg: &str| {
            Err(ReplError::Config {
                msg: msg.to_string(),
            })
        };
        if self.source.trim().is_empty() {
            return fail("source must be set");
        }
        if self.target.trim().is_empty() {
            return fail("target must be set");
        }
        if self.window_size == 0 {
            return fail("window_size must be at least 1");
        }
        if self.max_ops_per_hour == 0 {
            return fail("max_ops_per_hour must be at least 1");
        }
        if self.dedup_retention == 0 {
            return fail("dedup_retention must be at least 1");
        }
        if self.source_timeout_secs == 0 {
            return fail("source_timeout_secs must be at least 1");
        }
        if self.max_pending_carryover == Some(0) {
            return fail("max_pending_carryover must be at least 1");
        }
        if self.max_attachment_bytes == 0 {
            return fail("max_attachment_bytes must be at least 1");
        }
        Ok(())
    }

    /// Effective carry-over cap.
    pub fn pending_carryover(&self) -> usize {
        self.max_pending_carryover.unwrap_or(self.window_size)
    }

    /// Collector settings.
    pub fn collector(&self) -> CollectorConfig {
        CollectorConfig {
            window_size: self.window_size,
            source_timeout: Duration::from_secs(self.source_timeout_secs),
            retry: RetryConfig::with_max_retries(self.source_max_retries),
        }
    }

    /// Grouping settings.
    pub fn grouping(&self) -> GroupingConfig {
        GroupingConfig {
            max_pending_carryover: self.pending_carryover(),
        }
    }

    /// Rate limiter settings.
    pub fn rate_limit(&self) -> RateLimitConfig {
        RateLimitConfig {
            max_per_window: self.max_ops_per_hour,
            window: DEFAULT_WINDOW,
            min_interval: Duration::from_secs(self.min_interval_secs),
        }
    }

    /// Backoff for failing sends.
    pub fn remote_retry(&self) -> RetryConfig {
        RetryConfig::with_max_retries(self.remote_max_retries)
    }

    /// Reporter interval, if enabled.
    pub fn progress_interval(&self) -> Option<Duration> {
        (self.progress_interval_secs > 0).then(|| Duration::from_secs(self.progress_interval_secs))
    }

    /// Checkpoint file.
    pub fn checkpoint_path(&self) -> PathBuf {
        self.state_dir.join("checkpoint.bin")
    }

    /// Deduplicator file.
    pub fn dedup_path(&self) -> PathBuf {
        self.state_dir.join("dedup.bin")
    }

    /// Ledger file.
    pub fn ledger_path(&self) -> PathBuf {
        self.state_dir.join("ledger.jsonl")
    }
}
