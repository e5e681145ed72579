//! # Conductor
//!
//! Command-line front end for the task engine: inspect the replication
//! gating table, print the effective configuration, and run cluster-mutation
//! scenarios against in-memory stores and a simulated cluster.
//!
//! Logs go to stderr (filter with `RUST_LOG`); command output goes to stdout.

#![forbid(unsafe_code)]
#![forbid(clippy::unwrap_used)]
#![forbid(clippy::panic)]
#![deny(clippy::expect_used)]

mod cli;
mod commands;

use anyhow::Result;
use clap::Parser;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use crate::cli::Cli;

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let cli = Cli::parse();
    commands::execute_command(cli.command).await
}

/// Initialize the tracing subscriber, defaulting to `info`.
fn init_tracing() {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(fmt::layer().with_writer(std::io::stderr))
        .init();
}
