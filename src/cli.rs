//! Command-line arguments for the taskflow binaries.

use clap::Parser;
use std::path::PathBuf;

/// Run a headless sync instance against a local database.
#[derive(Parser, Debug)]
#[command(name = "taskflow-sync", version, about)]
pub struct SyncArgs {
    /// Path to the local database file
    #[arg(long, short = 'd', env = "TASKFLOW_SYNC_DATABASE", default_value = "taskflow.redb")]
    pub database: PathBuf,

    /// JSON configuration file
    #[arg(long, short = 'c')]
    pub config: Option<PathBuf>,

    /// Remote endpoint base URL (overrides the config file)
    #[arg(long, env = "TASKFLOW_SYNC_REMOTE")]
    pub remote: Option<String>,

    /// Bearer token for the remote endpoint
    #[arg(long, env = "TASKFLOW_SYNC_TOKEN", hide_env_values = true)]
    pub token: Option<String>,

    /// Instance identifier (random when omitted)
    #[arg(long)]
    pub instance_id: Option<String>,

    /// Storage scope (overrides the config file)
    #[arg(long)]
    pub scope: Option<String>,

    /// Where to write the status file
    #[arg(long)]
    pub status_file: Option<PathBuf>,

    /// Run one sync cycle as soon as leadership is acquired, then exit
    #[arg(long)]
    pub once: bool,
}

/// Show the status of a running taskflow-sync daemon.
#[derive(Parser, Debug)]
#[command(name = "taskflow-status", version, about)]
pub struct StatusArgs {
    /// Status file written by taskflow-sync
    #[arg(long)]
    pub status_file: Option<PathBuf>,

    /// Print the raw JSON
    #[arg(long)]
    pub json: bool,
}
