use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const CONFIG_FILE: &str = "config.toml";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub id: IdSettings,
    pub sync: SyncSettings,
    pub daemon: DaemonSettings,
    pub query: QuerySettings,
    pub compaction: CompactionSettings,
    pub lock: LockSettings,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IdSettings {
    pub prefix: String,
    pub base_length: usize,
    pub thresholds: Vec<u64>,
    pub max_attempts: u32,
}

impl Default for IdSettings {
    fn default() -> Self {
        Self {
            prefix: "bd".to_string(),
            base_length: 4,
            thresholds: vec![500, 1500],
            max_attempts: 32,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncSettings {
    pub debounce_ms: u64,
    pub max_wait_ms: u64,
    pub auto_import: bool,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            debounce_ms: 5_000,
            max_wait_ms: 30_000,
            auto_import: true,
        }
    }
}

impl SyncSettings {
    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }

    pub fn max_wait(&self) -> Duration {
        Duration::from_millis(self.max_wait_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonSettings {
    pub enabled: bool,
    pub auto_start: bool,
    pub timeout_ms: u64,
    pub idle_shutdown_secs: u64,
    pub event_buffer: usize,
}

impl Default for DaemonSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            auto_start: true,
            timeout_ms: 250,
            idle_shutdown_secs: 1_800,
            event_buffer: 1_024,
        }
    }
}

impl DaemonSettings {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn idle_shutdown(&self) -> Duration {
        Duration::from_secs(self.idle_shutdown_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QuerySettings {
    pub priority_weight: f64,
    pub age_weight: f64,
}

impl Default for QuerySettings {
    fn default() -> Self {
        Self {
            priority_weight: 0.7,
            age_weight: 0.3,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CompactionSettings {
    pub older_than_days: i64,
}

impl Default for CompactionSettings {
    fn default() -> Self {
        Self {
            older_than_days: 30,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LockSettings {
    pub timeout_ms: u64,
    pub stale_after_secs: u64,
}

impl Default for LockSettings {
    fn default() -> Self {
        Self {
            timeout_ms: 5_000,
            stale_after_secs: 60,
        }
    }
}

impl LockSettings {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn stale_after(&self) -> Duration {
        Duration::from_secs(self.stale_after_secs)
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("I/O error reading config: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid config TOML: {0}")]
    Toml(#[from] toml::de::Error),
    #[error("failed to render config TOML: {0}")]
    Render(#[from] toml::ser::Error),
    #[error("invalid config value: {0}")]
    Invalid(String),
}

impl Config {
    /// Loads `<beads_dir>/config.toml`, falling back to defaults when the
    /// file does not exist.
    pub fn load(beads_dir: &Path) -> Result<Self, ConfigError> {
        let path = beads_dir.join(CONFIG_FILE);
        let config = match std::fs::read_to_string(&path) {
            Ok(raw) => Self::parse(&raw)?,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Self::default(),
            Err(err) => return Err(ConfigError::Io(err)),
        };
        Ok(config)
    }

    pub fn parse(raw: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_toml(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let prefix = self.id.prefix.trim();
        if prefix.is_empty()
            || !prefix
                .chars()
                .all(|ch| ch.is_ascii_alphanumeric() || ch == '_')
        {
            return Err(ConfigError::Invalid(format!(
                "id.prefix '{}' must be non-empty ASCII alphanumerics",
                self.id.prefix
            )));
        }
        if self.id.base_length == 0 || self.id.base_length > 32 {
            return Err(ConfigError::Invalid(
                "id.base_length must be between 1 and 32".to_string(),
            ));
        }
        if self.id.thresholds.windows(2).any(|pair| pair[0] >= pair[1]) {
            return Err(ConfigError::Invalid(
                "id.thresholds must be strictly ascending".to_string(),
            ));
        }
        if self.id.max_attempts == 0 {
            return Err(ConfigError::Invalid(
                "id.max_attempts must be at least 1".to_string(),
            ));
        }
        if self.query.priority_weight < 0.0 || self.query.age_weight < 0.0 {
            return Err(ConfigError::Invalid(
                "query weights must not be negative".to_string(),
            ));
        }
        if self.compaction.older_than_days < 0 {
            return Err(ConfigError::Invalid(
                "compaction.older_than_days must not be negative".to_string(),
            ));
        }
        if self.daemon.event_buffer == 0 {
            return Err(ConfigError::Invalid(
                "daemon.event_buffer must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::{Config, ConfigError};

    #[test]
    fn missing_file_yields_defaults() {
        let dir = tempfile::tempdir().expect("tempdir should be creatable");
        let config = Config::load(dir.path()).expect("defaults should load");
        assert_eq!(config, Config::default());
        assert_eq!(config.id.prefix, "bd");
        assert_eq!(config.id.thresholds, vec![500, 1500]);
    }

    #[test]
    fn partial_file_overrides_only_named_fields() {
        let config = Config::parse(
            r#"
[id]
prefix = "proj"

[sync]
debounce_ms = 250
"#,
        )
        .expect("partial config should parse");
        assert_eq!(config.id.prefix, "proj");
        assert_eq!(config.id.base_length, 4);
        assert_eq!(config.sync.debounce_ms, 250);
        assert!(config.daemon.enabled);
    }

    #[test]
    fn rejects_descending_thresholds() {
        let err = Config::parse("[id]\nthresholds = [1500, 500]\n")
            .expect_err("descending thresholds should fail");
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn rejects_malformed_toml() {
        let err = Config::parse("[id\nprefix=").expect_err("broken TOML should fail");
        assert!(matches!(err, ConfigError::Toml(_)));
    }

    #[test]
    fn defaults_round_trip_through_toml() {
        let rendered = Config::default().to_toml().expect("defaults should render");
        let parsed = Config::parse(&rendered).expect("rendered defaults should parse");
        assert_eq!(parsed, Config::default());
    }
}
