//! CLI command definitions using clap.

#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![deny(clippy::panic)]

use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};

/// Conductor - task orchestration and cluster locking
#[derive(Parser, Debug)]
#[command(name = "conductor")]
#[command(version)]
#[command(about = "Task orchestration and cluster locking for a database control plane")]
#[command(
    long_about = "Conductor runs cluster-mutation tasks (universe edits, backups, restores, replication) as resumable groups of steps, each under a version-checked universe lock."
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Show which replication tasks each config status admits
    AllowedTasks {
        /// Only show this status (case-insensitive)
        #[arg(short, long)]
        status: Option<String>,
    },

    /// Print the effective configuration
    Config {
        /// TOML or JSON configuration file
        #[arg(short, long)]
        file: Option<PathBuf>,
    },

    /// Run a scenario against in-memory stores and a simulated cluster
    Simulate {
        /// Scenario to run
        #[arg(value_enum)]
        scenario: Scenario,

        /// TOML or JSON configuration file
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Fault label to inject, e.g. `node:provision` or `rpc:setup_replication`
        #[arg(long = "fail")]
        faults: Vec<String>,
    },
}

/// Built-in simulation scenarios.
#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
pub enum Scenario {
    /// Replace a master node of a three-node universe
    EditUniverse,
    /// Take a full backup, then an incremental one
    Backup,
    /// Back up one universe and restore it into another
    Restore,
    /// Set up, edit and delete a replication config
    Replication,
}
