//! taskflow-sync: headless sync instance for a taskflow database
//!
//! Opens the database, runs a sync instance for its storage scope and syncs
//! with the configured remote until interrupted. The daemon owns the
//! database for as long as it runs: app instances that share the scope have
//! to run inside this process, and a second daemon on the same database
//! exits with "database in use".
//!
//! Usage:
//!   taskflow-sync --database tasks.redb --remote https://sync.example.com
//!   taskflow-sync --config sync.json --once

use clap::Parser;
use std::path::Path;
use std::sync::Arc;
use taskflow_sync::cli::SyncArgs;
use taskflow_sync::config::RemoteConfig;
use taskflow_sync::remote::HttpRemote;
use taskflow_sync::status_file::DaemonStatus;
use taskflow_sync::store::StoreError;
use taskflow_sync::{InstanceId, LocalStore, SyncConfig, SyncInstance, SyncScope, SyncState};
use tokio::signal;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() {
    let args = SyncArgs::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = match load_config(&args) {
        Ok(c) => c,
        Err(e) => {
            tracing::error!("[sync] Invalid configuration: {}", e);
            std::process::exit(1);
        }
    };

    let Some(remote_config) = config.remote.clone() else {
        tracing::error!("[sync] No remote configured (use --remote or the config file)");
        std::process::exit(1);
    };
    let remote = match HttpRemote::new(&remote_config.url, remote_config.token.clone()) {
        Ok(r) => r,
        Err(e) => {
            tracing::error!("[sync] Failed to create remote client: {}", e);
            std::process::exit(1);
        }
    };

    tracing::info!("[sync] Opening database {:?}", args.database);
    let store = match LocalStore::open(&args.database) {
        Ok(s) => Arc::new(s),
        Err(StoreError::InUse { path }) => {
            tracing::error!(
                "[sync] Database {:?} is in use by another instance; only one process may own it",
                path
            );
            std::process::exit(1);
        }
        Err(e) => {
            tracing::error!("[sync] Failed to open database: {}", e);
            std::process::exit(1);
        }
    };

    let scope = SyncScope::new(store.clone(), Arc::new(remote), config.clone());
    let id = args
        .instance_id
        .clone()
        .map(InstanceId::new)
        .unwrap_or_default();
    tracing::info!(
        "[sync] Instance {} syncing scope '{}' with {}",
        id,
        config.scope,
        remote_config.url
    );

    let instance = SyncInstance::start(&scope, id.clone());
    let status_path = args
        .status_file
        .clone()
        .unwrap_or_else(DaemonStatus::default_path);
    let mut daemon = DaemonStatus::new(id.as_str(), config.scope.as_str());
    let mut reader = instance.subscribe_status();
    instance.request_sync();

    loop {
        tokio::select! {
            _ = signal::ctrl_c() => {
                tracing::info!("[sync] Received Ctrl+C");
                break;
            }
            changed = reader.changed() => {
                let Some(status) = changed else { break };
                tracing::info!("[sync] {}", status.summary());

                daemon.is_leader = instance.is_leader();
                daemon.sync = status.clone();
                match store.summary() {
                    Ok(summary) => daemon.store = summary,
                    Err(e) => tracing::warn!("[sync] Failed to summarize store: {}", e),
                }
                write_status(&daemon, &status_path);

                if args.once && matches!(status.state, SyncState::Synced | SyncState::Error) {
                    break;
                }
            }
        }
    }

    instance.shutdown().await;
    if let Err(e) = DaemonStatus::remove(&status_path) {
        tracing::warn!("[sync] Failed to remove status file: {}", e);
    }
}

fn load_config(args: &SyncArgs) -> Result<SyncConfig, taskflow_sync::config::ConfigError> {
    let mut config = match &args.config {
        Some(path) => SyncConfig::load(path)?,
        None => SyncConfig::default(),
    };
    if let Some(scope) = &args.scope {
        config.scope = scope.clone();
    }
    if let Some(url) = &args.remote {
        config.remote = Some(RemoteConfig {
            url: url.clone(),
            token: None,
        });
    }
    if let (Some(token), Some(remote)) = (&args.token, config.remote.as_mut()) {
        remote.token = Some(token.clone());
    }
    config.validate()?;
    Ok(config)
}

fn write_status(status: &DaemonStatus, path: &Path) {
    if let Err(e) = status.write(path) {
        tracing::warn!("[sync] Failed to write status file {:?}: {}", path, e);
    }
}
