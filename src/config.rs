use crate::lock::LockSettings;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CoreConfig {
    /// Shared directory for lock records. Every process working on the same
    /// remote must point here.
    #[serde(default = "default_lock_dir")]
    pub lock_dir: PathBuf,
    #[serde(default = "default_lock_wait")]
    pub lock_wait_ms: u64,
    #[serde(default = "default_lock_ttl")]
    pub lock_ttl_ms: u64,
    #[serde(default = "default_lock_poll")]
    pub lock_poll_ms: u64,
    #[serde(default = "default_plan_ttl")]
    pub plan_ttl_ms: u64,
    #[serde(default = "default_sweep_interval")]
    pub plan_sweep_interval_ms: u64,
    #[serde(default = "default_search_timeout")]
    pub search_timeout_ms: u64,
    #[serde(default = "default_similarity")]
    pub default_similarity: f64,
    #[serde(default = "default_max_edits")]
    pub max_edits_per_call: usize,
    #[serde(default = "default_diff_limit")]
    pub diff_limit_bytes: usize,
    /// Use hashes from earlier reads and syncs as expected hashes when the
    /// caller passes none.
    #[serde(default)]
    pub implicit_preconditions: bool,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            lock_dir: default_lock_dir(),
            lock_wait_ms: default_lock_wait(),
            lock_ttl_ms: default_lock_ttl(),
            lock_poll_ms: default_lock_poll(),
            plan_ttl_ms: default_plan_ttl(),
            plan_sweep_interval_ms: default_sweep_interval(),
            search_timeout_ms: default_search_timeout(),
            default_similarity: default_similarity(),
            max_edits_per_call: default_max_edits(),
            diff_limit_bytes: default_diff_limit(),
            implicit_preconditions: false,
        }
    }
}

fn default_lock_dir() -> PathBuf {
    std::env::temp_dir().join("mirrorsync-locks")
}

fn default_lock_wait() -> u64 {
    30_000
}

fn default_lock_ttl() -> u64 {
    300_000
}

fn default_lock_poll() -> u64 {
    100
}

fn default_plan_ttl() -> u64 {
    300_000
}

fn default_sweep_interval() -> u64 {
    60_000
}

fn default_search_timeout() -> u64 {
    5_000
}

fn default_similarity() -> f64 {
    0.8
}

fn default_max_edits() -> usize {
    20
}

fn default_diff_limit() -> usize {
    16 * 1024
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("invalid config: {0}")]
    Invalid(String),
}

impl CoreConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config: Self = serde_json::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(self.default_similarity > 0.0 && self.default_similarity <= 1.0) {
            return Err(ConfigError::Invalid(format!(
                "default_similarity {} is outside (0, 1]",
                self.default_similarity
            )));
        }
        if self.max_edits_per_call == 0 {
            return Err(ConfigError::Invalid("max_edits_per_call must be positive".into()));
        }
        if self.lock_poll_ms == 0 || self.plan_sweep_interval_ms == 0 {
            return Err(ConfigError::Invalid(
                "lock_poll_ms and plan_sweep_interval_ms must be positive".into(),
            ));
        }
        Ok(())
    }

    pub fn lock_settings(&self) -> LockSettings {
        LockSettings {
            ttl: Duration::from_millis(self.lock_ttl_ms),
            default_wait: Duration::from_millis(self.lock_wait_ms),
            poll_interval: Duration::from_millis(self.lock_poll_ms),
        }
    }

    pub fn plan_ttl(&self) -> Duration {
        Duration::from_millis(self.plan_ttl_ms)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.plan_sweep_interval_ms)
    }

    pub fn search_timeout(&self) -> Duration {
        Duration::from_millis(self.search_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_config_uses_defaults() {
        let config: CoreConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(config, CoreConfig::default());
        assert_eq!(config.lock_wait_ms, 30_000);
        assert_eq!(config.plan_ttl_ms, 300_000);
        assert_eq!(config.default_similarity, 0.8);
        assert!(!config.implicit_preconditions);
    }

    #[test]
    fn test_parse_full_config() {
        let json = r#"{
            "lock_dir": "/var/lock/mirrorsync",
            "lock_wait_ms": 500,
            "lock_ttl_ms": 60000,
            "plan_ttl_ms": 1000,
            "default_similarity": 0.9,
            "max_edits_per_call": 5,
            "implicit_preconditions": true
        }"#;
        let config: CoreConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.lock_dir, PathBuf::from("/var/lock/mirrorsync"));
        assert_eq!(config.lock_settings().default_wait, Duration::from_millis(500));
        assert_eq!(config.lock_settings().ttl, Duration::from_secs(60));
        assert_eq!(config.plan_ttl(), Duration::from_secs(1));
        assert_eq!(config.max_edits_per_call, 5);
        assert!(config.implicit_preconditions);
    }

    #[test]
    fn test_load_rejects_bad_threshold() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, r#"{"default_similarity": 1.5}"#).unwrap();
        assert!(matches!(CoreConfig::load(&path), Err(ConfigError::Invalid(_))));
    }
}
