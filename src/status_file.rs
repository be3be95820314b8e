//! Status file for a running sync daemon.
//!
//! taskflow-sync rewrites a JSON file in the system temp directory whenever
//! its sync status changes; taskflow-status reads it.

use crate::status::SyncStatus;
use crate::store::StoreSummary;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

pub const STATUS_FILE_NAME: &str = "taskflow-sync-status.json";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DaemonStatus {
    pub pid: u32,
    pub instance_id: String,
    pub scope: String,
    /// When the daemon started (Unix timestamp)
    pub started_at: u64,
    pub is_leader: bool,
    pub sync: SyncStatus,
    pub store: StoreSummary,
}

impl DaemonStatus {
    pub fn new(instance_id: impl Into<String>, scope: impl Into<String>) -> Self {
        let started_at = SystemTime::now()
            .duration_since(SystemTime::UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);

        Self {
            pid: std::process::id(),
            instance_id: instance_id.into(),
            scope: scope.into(),
            started_at,
            is_leader: false,
            sync: SyncStatus::default(),
            store: StoreSummary::default(),
        }
    }

    pub fn default_path() -> PathBuf {
        std::env::temp_dir().join(STATUS_FILE_NAME)
    }

    /// Replace the file atomically so readers never see a partial write.
    pub fn write(&self, path: &Path) -> io::Result<()> {
        let json = serde_json::to_string_pretty(self).map_err(io::Error::other)?;
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, json)?;
        fs::rename(&tmp, path)
    }

    pub fn read(path: &Path) -> io::Result<Self> {
        let content = fs::read_to_string(path)?;
        serde_json::from_str(&content).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
    }

    pub fn remove(path: &Path) -> io::Result<()> {
        match fs::remove_file(path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::status::SyncState;

    #[test]
    fn test_write_read_remove() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(STATUS_FILE_NAME);

        let mut status = DaemonStatus::new("instance-1", "default");
        status.is_leader = true;
        status.sync.state = SyncState::Synced;
        status.store.pending = 3;
        status.write(&path).unwrap();

        assert_eq!(DaemonStatus::read(&path).unwrap(), status);

        DaemonStatus::remove(&path).unwrap();
        assert!(!path.exists());
        // Removing twice is fine
        DaemonStatus::remove(&path).unwrap();
    }

    #[test]
    fn test_read_garbage() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(STATUS_FILE_NAME);
        fs::write(&path, "not json").unwrap();
        let err = DaemonStatus::read(&path).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }
}
