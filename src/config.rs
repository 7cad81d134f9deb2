//! Runtime configuration for the store connection and the pipeline.
//!
//! Values come from an optional YAML file (`database.driver`, `database.path`, ...)
//! and are then overridden by environment variables.

use serde::{Deserialize, Serialize};
use std::env;
use std::path::Path;
use thiserror::Error;

pub const DEFAULT_CHANNEL_CAPACITY: usize = 100;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config file: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

fn env_string(key: &str) -> Option<String> {
    env::var(key).ok().filter(|value| !value.trim().is_empty())
}

fn env_usize(key: &str) -> Option<usize> {
    env::var(key).ok().and_then(|value| value.parse::<usize>().ok())
}

fn env_u32(key: &str) -> Option<u32> {
    env::var(key).ok().and_then(|value| value.parse::<u32>().ok())
}

fn default_driver() -> String {
    "sqlite".to_string()
}

fn default_path() -> String {
    "./mailboxes.db".to_string()
}

fn default_max_connections() -> u32 {
    (num_cpus::get() as u32 * 2).max(4)
}

fn default_channel_capacity() -> usize {
    DEFAULT_CHANNEL_CAPACITY
}

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub pipeline: PipelineConfig,
}

/// Where the records live.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// `sqlite`, `sqlite3`, `postgres` or `postgresql`
    #[serde(default = "default_driver")]
    pub driver: String,
    /// Database file path or connection URL
    #[serde(default = "default_path")]
    pub path: String,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            driver: default_driver(),
            path: default_path(),
            max_connections: default_max_connections(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Buffered records per stream before the producer waits on its consumer
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            channel_capacity: default_channel_capacity(),
        }
    }
}

impl Config {
    /// Defaults overridden by the environment.
    pub fn from_env() -> Self {
        let mut config = Config::default();
        config.apply_env_overrides();
        config
    }

    pub fn from_yaml(yaml: &str) -> Result<Self, ConfigError> {
        Ok(serde_yaml::from_str(yaml)?)
    }

    /// Load a YAML file, then apply environment overrides.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        let mut config = Self::from_yaml(&contents)?;
        config.apply_env_overrides();
        Ok(config)
    }

    /// Load `path` when it exists, otherwise fall back to [`Config::from_env`].
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        if path.exists() {
            log::info!("loading configuration from {}", path.display());
            Self::from_file(path)
        } else {
            log::info!(
                "config file {} not found, using environment and defaults",
                path.display()
            );
            Ok(Self::from_env())
        }
    }

    pub fn apply_env_overrides(&mut self) {
        if let Some(driver) = env_string("DATABASE_DRIVER") {
            self.database.driver = driver;
        }
        if let Some(path) = env_string("DATABASE_PATH") {
            self.database.path = path;
        }
        if let Some(max) = env_u32("DATABASE_MAX_CONNECTIONS") {
            self.database.max_connections = max;
        }
        if let Some(capacity) = env_usize("PIPELINE_CHANNEL_CAPACITY") {
            self.pipeline.channel_capacity = capacity;
        }
    }

    /// Command-line values win over both the file and the environment.
    pub fn apply_cli_overrides(&mut self, driver: Option<String>, path: Option<String>) {
        if let Some(driver) = driver {
            self.database.driver = driver;
        }
        if let Some(path) = path {
            self.database.path = path;
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let driver = self.database.driver.trim();
        if driver.is_empty() {
            return Err(ConfigError::Invalid("database.driver must be set".into()));
        }
        if crate::db::Driver::parse(driver).is_none() {
            return Err(ConfigError::Invalid(format!(
                "database.driver '{}' is not supported",
                driver
            )));
        }

        let path = self.database.path.trim();
        if path.is_empty() {
            return Err(ConfigError::Invalid("database.path must be set".into()));
        }
        if path.contains(":memory:") || path.contains("mode=memory") {
            return Err(ConfigError::Invalid(
                "in-memory sqlite databases are not shared between pooled connections".into(),
            ));
        }

        if self.database.max_connections < crate::db::MIN_CONNECTIONS {
            return Err(ConfigError::Invalid(format!(
                "database.max_connections must be at least {}",
                crate::db::MIN_CONNECTIONS
            )));
        }
        if self.pipeline.channel_capacity == 0 {
            return Err(ConfigError::Invalid(
                "pipeline.channel_capacity must be > 0".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    static ENV_LOCK: Mutex<()> = Mutex::new(());

    const ENV_KEYS: [&str; 4] = [
        "DATABASE_DRIVER",
        "DATABASE_PATH",
        "DATABASE_MAX_CONNECTIONS",
        "PIPELINE_CHANNEL_CAPACITY",
    ];

    /// Run `f` with exactly `vars` set among the override keys.
    fn with_env<R>(vars: &[(&str, &str)], f: impl FnOnce() -> R) -> R {
        let _guard = ENV_LOCK.lock();
        // SAFETY: every test touching these variables holds ENV_LOCK.
        unsafe {
            for key in ENV_KEYS {
                env::remove_var(key);
            }
            for (key, value) in vars {
                env::set_var(key, value);
            }
        }
        let result = f();
        unsafe {
            for key in ENV_KEYS {
                env::remove_var(key);
            }
        }
        result
    }

    fn write_config(dir: &tempfile::TempDir, yaml: &str) -> std::path::PathBuf {
        let path = dir.path().join("config.yaml");
        std::fs::write(&path, yaml).unwrap();
        path
    }

    #[test]
    fn test_yaml_database_keys() {
        let config = Config::from_yaml(
            "database:\n  driver: sqlite3\n  path: ./data/mailboxes.db\n",
        )
        .unwrap();

        assert_eq!(config.database.driver, "sqlite3");
        assert_eq!(config.database.path, "./data/mailboxes.db");
        assert_eq!(config.pipeline.channel_capacity, DEFAULT_CHANNEL_CAPACITY);
        assert!(config.database.max_connections >= 4);
        config.validate().unwrap();
    }

    #[test]
    fn test_yaml_pipeline_section() {
        let config = Config::from_yaml(
            "database:\n  driver: postgres\n  path: postgres://localhost/mail\n  max_connections: 8\npipeline:\n  channel_capacity: 16\n",
        )
        .unwrap();

        assert_eq!(config.database.max_connections, 8);
        assert_eq!(config.pipeline.channel_capacity, 16);
    }

    #[test]
    fn test_validate_rejects_unknown_driver() {
        let mut config = Config::default();
        config.database.driver = "oracle".into();
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_validate_rejects_in_memory_sqlite() {
        let mut config = Config::default();
        config.database.path = ":memory:".into();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_zero_capacity() {
        let mut config = Config::default();
        config.pipeline.channel_capacity = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_load_missing_file_falls_back_to_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = with_env(&[], || Config::load(dir.path().join("config.yaml")).unwrap());
        assert_eq!(config.database.driver, "sqlite");
        assert_eq!(config.database.path, "./mailboxes.db");
    }

    #[test]
    fn test_from_file_reads_yaml() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(&dir, "database:\n  driver: sqlite\n  path: /tmp/x.db\n");

        let config = with_env(&[], || Config::from_file(&path).unwrap());
        assert_eq!(config.database.driver, "sqlite");
        assert_eq!(config.database.path, "/tmp/x.db");
    }

    #[test]
    fn test_env_overrides_file_values() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(
            &dir,
            "database:\n  driver: sqlite\n  path: /tmp/file.db\n  max_connections: 3\npipeline:\n  channel_capacity: 7\n",
        );

        let config = with_env(
            &[
                ("DATABASE_DRIVER", "postgres"),
                ("DATABASE_PATH", "postgres://localhost/mail"),
                ("DATABASE_MAX_CONNECTIONS", "12"),
                ("PIPELINE_CHANNEL_CAPACITY", "64"),
            ],
            || Config::load(&path).unwrap(),
        );

        assert_eq!(config.database.driver, "postgres");
        assert_eq!(config.database.path, "postgres://localhost/mail");
        assert_eq!(config.database.max_connections, 12);
        assert_eq!(config.pipeline.channel_capacity, 64);
        config.validate().unwrap();
    }

    #[test]
    fn test_unparseable_env_numbers_keep_file_values() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(
            &dir,
            "database:\n  max_connections: 3\npipeline:\n  channel_capacity: 7\n",
        );

        let config = with_env(
            &[
                ("DATABASE_MAX_CONNECTIONS", "lots"),
                ("PIPELINE_CHANNEL_CAPACITY", "-1"),
                ("DATABASE_PATH", "   "),
            ],
            || Config::from_file(&path).unwrap(),
        );

        assert_eq!(config.database.max_connections, 3);
        assert_eq!(config.pipeline.channel_capacity, 7);
        assert_eq!(config.database.path, "./mailboxes.db");
    }

    #[test]
    fn test_env_applies_without_a_file() {
        let dir = tempfile::tempdir().unwrap();
        let config = with_env(&[("DATABASE_PATH", "/srv/mail.db")], || {
            Config::load(dir.path().join("missing.yaml")).unwrap()
        });
        assert_eq!(config.database.path, "/srv/mail.db");
        assert_eq!(config.database.driver, "sqlite");
    }

    #[test]
    fn test_cli_overrides_env_and_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(&dir, "database:\n  driver: sqlite\n  path: /tmp/file.db\n");

        let mut config = with_env(&[("DATABASE_PATH", "/tmp/env.db")], || {
            Config::load(&path).unwrap()
        });
        assert_eq!(config.database.path, "/tmp/env.db");

        config.apply_cli_overrides(Some("sqlite3".into()), Some("/tmp/cli.db".into()));
        assert_eq!(config.database.driver, "sqlite3");
        assert_eq!(config.database.path, "/tmp/cli.db");

        config.apply_cli_overrides(None, None);
        assert_eq!(config.database.path, "/tmp/cli.db");
    }

    #[test]
    fn test_validate_rejects_single_connection_pool() {
        let mut config = Config::default();
        config.database.max_connections = 1;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));

        config.database.max_connections = crate::db::MIN_CONNECTIONS;
        config.validate().unwrap();
    }

    #[test]
    fn test_malformed_yaml_is_an_error() {
        assert!(matches!(
            Config::from_yaml("database: [unclosed"),
            Err(ConfigError::Yaml(_))
        ));
    }
}
