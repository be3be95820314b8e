//! taskflow-status: show what a running taskflow-sync daemon is doing
//!
//! Usage:
//!   taskflow-status
//!   taskflow-status --json

use clap::Parser;
use std::io;
use taskflow_sync::cli::StatusArgs;
use taskflow_sync::status_file::DaemonStatus;

fn main() {
    let args = StatusArgs::parse();
    let path = args.status_file.unwrap_or_else(DaemonStatus::default_path);

    let status = match DaemonStatus::read(&path) {
        Ok(s) => s,
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            eprintln!("taskflow-sync is not running (no status file at {:?})", path);
            std::process::exit(1);
        }
        Err(e) => {
            eprintln!("Failed to read {:?}: {}", path, e);
            std::process::exit(1);
        }
    };

    if args.json {
        match serde_json::to_string_pretty(&status) {
            Ok(json) => println!("{}", json),
            Err(e) => {
                eprintln!("Failed to encode status: {}", e);
                std::process::exit(1);
            }
        }
        return;
    }

    let role = if status.is_leader { "leader" } else { "follower" };
    println!("instance   {} (pid {}, {})", status.instance_id, status.pid, role);
    println!("scope      {}", status.scope);
    println!("sync       {}", status.sync.summary());
    match status.sync.last_synced_at {
        Some(at) => println!("last sync  {}", at.to_rfc3339()),
        None => println!("last sync  never"),
    }
    println!(
        "store      {} entities, {} pending, {} rejected, checkpoint {}",
        status.store.entities, status.store.pending, status.store.rejected, status.store.checkpoint
    );
}
