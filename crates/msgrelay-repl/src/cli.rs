//! Command-line interface for the `msgrelay` binary.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;

use crate::archive::{ArchiveSink, ArchiveSource};
use crate::config::ReplConfig;
use crate::pipeline::ReplicationPipeline;

/// Top-level arguments.
#[derive(Debug, Parser)]
#[command(name = "msgrelay")]
#[command(about = "Ordered, rate-limited replication between message archives", long_about = None)]
pub struct Cli {
    /// Configuration file (`.toml` or `.json`).
    #[arg(short, long, global = true, env = "MSGRELAY_CONFIG", default_value = "msgrelay.toml")]
    pub config: PathBuf,

    /// Emit logs as JSON lines.
    #[arg(long, global = true)]
    pub json_logs: bool,

    /// What to do.
    #[command(subcommand)]
    pub command: Command,
}

/// Subcommands.
#[derive(Debug, Subcommand)]
pub enum Command {
    /// Replicate from `source` to `target` until the source is exhausted.
    Run {
        /// Log units instead of sending them; nothing is persisted.
        #[arg(long)]
        dry_run: bool,
        /// Override `window_size`.
        #[arg(long)]
        window_size: Option<usize>,
        /// Override `max_ops_per_hour`.
        #[arg(long)]
        max_ops_per_hour: Option<u32>,
    },
    /// Print checkpoint, dedup and ledger state as JSON.
    Status,
    /// Delete checkpoint and dedup state.
    Reset {
        /// Confirm the reset.
        #[arg(long)]
        yes: bool,
    },
}

impl Cli {
    /// Load the configuration and apply command-line overrides.
    pub fn load_config(&self) -> Result<ReplConfig> {
        let mut config = load_or_default(&self.config)?;
        if let Command::Run {
            dry_run,
            window_size,
            max_ops_per_hour,
        } = &self.command
        {
            config.dry_run |= *dry_run;
            if let Some(window_size) = window_size {
                config.window_size = *window_size;
            }
            if let Some(max_ops_per_hour) = max_ops_per_hour {
                config.max_ops_per_hour = *max_ops_per_hour;
            }
        }
        Ok(config)
    }

    /// Execute the subcommand. `cancel` stops a run at its next suspension
    /// point or unit boundary.
    pub async fn run(self, cancel: CancellationToken) -> Result<()> {
        let config = self.load_config()?;
        match self.command {
            Command::Run { .. } => run(config, cancel).await,
            Command::Status => status(&config),
            Command::Reset { yes } => reset(&config, yes),
        }
    }
}

fn load_or_default(path: &Path) -> Result<ReplConfig> {
    if path.exists() {
        ReplConfig::from_file(path).with_context(|| format!("loading {}", path.display()))
    } else {
        tracing::warn!(path = %path.display(), "config file not found, using defaults");
        Ok(ReplConfig::default())
    }
}

async fn run(config: ReplConfig, cancel: CancellationToken) -> Result<()> {
    let pipeline = ReplicationPipeline::new(
        config,
        Arc::new(ArchiveSource::new()),
        Arc::new(ArchiveSink::new()),
    );
    let summary = pipeline.run(cancel).await?;
    if summary.cancelled {
        tracing::info!("stopped before the source was exhausted; rerun to resume");
    }
    Ok(())
}

fn status(config: &ReplConfig) -> Result<()> {
    let report = ReplicationPipeline::status(config)?;
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

fn reset(config: &ReplConfig, yes: bool) -> Result<()> {
    if !yes {
        anyhow::bail!(
            "reset deletes all progress in {}; pass --yes to confirm",
            config.state_dir.display()
        );
    }
    ReplicationPipeline::reset(config)?;
    println!("state in {} reset", config.state_dir.display());
    Ok(())
}
