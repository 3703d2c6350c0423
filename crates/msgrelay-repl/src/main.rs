#![warn(missing_docs)]

//! `msgrelay` binary.

use anyhow::Result;
use clap::Parser;
use msgrelay_repl::cli::Cli;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    if cli.json_logs {
        tracing_subscriber::registry()
            .with(fmt::layer().json())
            .with(filter)
            .init();
    } else {
        tracing_subscriber::registry()
            .with(fmt::layer())
            .with(filter)
            .init();
    }

    tracing::info!(version = env!("CARGO_PKG_VERSION"), "msgrelay starting");

    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("interrupt received, stopping at the next unit boundary");
            on_signal.cancel();
        }
    });

    cli.run(cancel).await
}
