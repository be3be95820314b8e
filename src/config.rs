use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Tuning knobs of the sync coordinator. Every field has a default so a
/// config file only needs to name what it changes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Storage scope shared by the local instances that elect one leader
    #[serde(default = "default_scope")]
    pub scope: String,
    /// Quiet period after the last edit before a cycle starts
    #[serde(default = "default_debounce_ms")]
    pub debounce_ms: u64,
    /// Cadence of pull-only cycles while the instance is visible
    #[serde(default = "default_background_interval_ms")]
    pub background_interval_ms: u64,
    #[serde(default = "default_lease_ms")]
    pub lease_ms: u64,
    #[serde(default = "default_timeout_ms")]
    pub pull_timeout_ms: u64,
    #[serde(default = "default_timeout_ms")]
    pub push_timeout_ms: u64,
    #[serde(default)]
    pub retry: RetryPolicy,
    /// Maximum records per push request
    #[serde(default = "default_push_batch_size")]
    pub push_batch_size: usize,
    /// Maximum pull pages fetched in one cycle
    #[serde(default = "default_max_pull_pages")]
    pub max_pull_pages: usize,
    #[serde(default)]
    pub remote: Option<RemoteConfig>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    #[serde(default = "default_backoff")]
    pub backoff_ms: u64,
    #[serde(default = "default_max_backoff")]
    pub max_backoff_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            backoff_ms: default_backoff(),
            max_backoff_ms: default_max_backoff(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteConfig {
    pub url: String,
    /// Bearer token; usually supplied through the environment instead
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
}

fn default_scope() -> String {
    "default".to_string()
}

fn default_debounce_ms() -> u64 {
    1000
}

fn default_background_interval_ms() -> u64 {
    45_000
}

fn default_lease_ms() -> u64 {
    10_000
}

fn default_timeout_ms() -> u64 {
    15_000
}

fn default_backoff() -> u64 {
    500
}

fn default_max_backoff() -> u64 {
    60_000
}

fn default_push_batch_size() -> usize {
    100
}

fn default_max_pull_pages() -> usize {
    50
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            scope: default_scope(),
            debounce_ms: default_debounce_ms(),
            background_interval_ms: default_background_interval_ms(),
            lease_ms: default_lease_ms(),
            pull_timeout_ms: default_timeout_ms(),
            push_timeout_ms: default_timeout_ms(),
            retry: RetryPolicy::default(),
            push_batch_size: default_push_batch_size(),
            max_pull_pages: default_max_pull_pages(),
            remote: None,
        }
    }
}

impl SyncConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::parse(&content)
    }

    pub fn parse(json: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.scope.is_empty() {
            return Err(ConfigError::Invalid("scope must not be empty".into()));
        }
        if self.lease_ms < 2 {
            return Err(ConfigError::Invalid("lease_ms must be at least 2".into()));
        }
        if self.push_batch_size == 0 || self.max_pull_pages == 0 {
            return Err(ConfigError::Invalid(
                "push_batch_size and max_pull_pages must be positive".into(),
            ));
        }
        if self.retry.backoff_ms == 0 || self.retry.backoff_ms > self.retry.max_backoff_ms {
            return Err(ConfigError::Invalid(format!(
                "retry backoff must satisfy 0 < backoff_ms ({}) <= max_backoff_ms ({})",
                self.retry.backoff_ms, self.retry.max_backoff_ms
            )));
        }
        Ok(())
    }

    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }

    pub fn background_interval(&self) -> Duration {
        Duration::from_millis(self.background_interval_ms)
    }

    pub fn lease(&self) -> Duration {
        Duration::from_millis(self.lease_ms)
    }

    /// How often non-leaders try to acquire and leaders renew.
    pub fn lease_poll_interval(&self) -> Duration {
        self.lease() / 2
    }

    pub fn pull_timeout(&self) -> Duration {
        Duration::from_millis(self.pull_timeout_ms)
    }

    pub fn push_timeout(&self) -> Duration {
        Duration::from_millis(self.push_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_minimal_config() {
        let config = SyncConfig::parse("{}").unwrap();
        assert_eq!(config, SyncConfig::default());
        assert_eq!(config.scope, "default");
        assert_eq!(config.debounce(), Duration::from_secs(1));
        assert_eq!(config.lease_poll_interval(), Duration::from_secs(5));
        assert!(config.remote.is_none());
    }

    #[test]
    fn test_parse_full_config() {
        let json = r#"{
            "scope": "workspace-42",
            "debounce_ms": 2500,
            "background_interval_ms": 30000,
            "lease_ms": 8000,
            "pull_timeout_ms": 10000,
            "push_timeout_ms": 12000,
            "retry": { "backoff_ms": 1000, "max_backoff_ms": 30000 },
            "push_batch_size": 25,
            "max_pull_pages": 4,
            "remote": { "url": "https://sync.example.com" }
        }"#;
        let config = SyncConfig::parse(json).unwrap();
        assert_eq!(config.scope, "workspace-42");
        assert_eq!(config.debounce(), Duration::from_millis(2500));
        assert_eq!(config.push_timeout(), Duration::from_secs(12));
        assert_eq!(config.retry.max_backoff_ms, 30000);
        assert_eq!(config.push_batch_size, 25);
        assert_eq!(
            config.remote,
            Some(RemoteConfig {
                url: "https://sync.example.com".into(),
                token: None
            })
        );
    }

    #[test]
    fn test_invalid_backoff_is_rejected() {
        let err = SyncConfig::parse(r#"{"retry": {"backoff_ms": 5000, "max_backoff_ms": 100}}"#)
            .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sync.json");
        std::fs::write(&path, r#"{"debounce_ms": 300}"#).unwrap();
        assert_eq!(SyncConfig::load(&path).unwrap().debounce_ms, 300);

        assert!(matches!(
            SyncConfig::load(dir.path().join("missing.json")),
            Err(ConfigError::Io(_))
        ));
    }
}
