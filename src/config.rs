//! Configuration management
//!
//! Supports loading configuration from:
//! - Default values
//! - Config file (ingest.toml)
//! - Environment variables (INGEST__*)
//!
//! ## Example config file (ingest.toml):
//! ```toml
//! [scheduler]
//! poll_interval_ms = 1000
//! failure_backoff_secs = 30
//! max_backoff_secs = 3600
//! max_concurrent_jobs = 8
//!
//! [scheduler.cadence]
//! backfill_secs = 60
//! incremental_secs = 900
//!
//! [registry]
//! max_cas_retries = 3
//!
//! [repository]
//! max_page_size = 1000
//!
//! [storage]
//! path = "./data/ingest.json"
//! ```

use config_crate::{Config, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::job::ScheduleMode;

/// Main configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IngestConfig {
    #[serde(default)]
    pub scheduler: SchedulerConfig,

    #[serde(default)]
    pub registry: RegistryConfig,

    #[serde(default)]
    pub repository: RepositoryConfig,

    #[serde(default)]
    pub storage: StorageConfig,
}

/// Re-run cadence per schedule mode
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CadenceConfig {
    /// Delay before the next run while backfilling
    #[serde(default = "default_backfill_secs")]
    pub backfill_secs: u64,

    /// Delay before the next run once caught up
    #[serde(default = "default_incremental_secs")]
    pub incremental_secs: u64,
}

/// Scheduler and driver settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    #[serde(default)]
    pub cadence: CadenceConfig,

    /// How often the driver looks for due jobs
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// Retry delay after the first failure; doubles per consecutive failure
    #[serde(default = "default_failure_backoff_secs")]
    pub failure_backoff_secs: u64,

    /// Upper bound for the failure backoff
    #[serde(default = "default_max_backoff_secs")]
    pub max_backoff_secs: u64,

    /// Stop retrying a job after this many consecutive failures (until reset)
    #[serde(default)]
    pub max_failures: Option<u32>,

    /// Jobs dispatched per poll. 0 = unbounded.
    #[serde(default = "default_max_concurrent_jobs")]
    pub max_concurrent_jobs: usize,
}

/// Schema registry settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistryConfig {
    /// Extra attempts after losing a compare-and-swap race
    #[serde(default = "default_max_cas_retries")]
    pub max_cas_retries: u32,

    /// Reject any descriptor change, compatible or not
    #[serde(default)]
    pub strict: bool,
}

/// Data repository settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RepositoryConfig {
    /// Page sizes above this are clamped
    #[serde(default = "default_max_page_size")]
    pub max_page_size: usize,
}

/// Storage settings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Snapshot file; in-memory only when unset
    #[serde(default)]
    pub path: Option<PathBuf>,
}

// Default value functions
fn default_backfill_secs() -> u64 {
    60
}

fn default_incremental_secs() -> u64 {
    900
}

fn default_poll_interval_ms() -> u64 {
    1000
}

fn default_failure_backoff_secs() -> u64 {
    30
}

fn default_max_backoff_secs() -> u64 {
    3600
}

fn default_max_concurrent_jobs() -> usize {
    8
}

fn default_max_cas_retries() -> u32 {
    3
}

fn default_max_page_size() -> usize {
    1000
}

impl Default for CadenceConfig {
    fn default() -> Self {
        Self {
            backfill_secs: default_backfill_secs(),
            incremental_secs: default_incremental_secs(),
        }
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            cadence: CadenceConfig::default(),
            poll_interval_ms: default_poll_interval_ms(),
            failure_backoff_secs: default_failure_backoff_secs(),
            max_backoff_secs: default_max_backoff_secs(),
            max_failures: None,
            max_concurrent_jobs: default_max_concurrent_jobs(),
        }
    }
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            max_cas_retries: default_max_cas_retries(),
            strict: false,
        }
    }
}

impl Default for RepositoryConfig {
    fn default() -> Self {
        Self {
            max_page_size: default_max_page_size(),
        }
    }
}

impl CadenceConfig {
    /// Delay before the next run in the given mode
    pub fn cadence_for(&self, mode: ScheduleMode) -> Duration {
        match mode {
            ScheduleMode::Backfill => Duration::from_secs(self.backfill_secs),
            ScheduleMode::Incremental => Duration::from_secs(self.incremental_secs),
        }
    }
}

impl SchedulerConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// Retry delay after `fail_count` consecutive failures
    pub fn backoff_for(&self, fail_count: u32) -> Duration {
        let exponent = fail_count.saturating_sub(1).min(31);
        let secs = self
            .failure_backoff_secs
            .saturating_mul(1u64 << exponent)
            .min(self.max_backoff_secs);
        Duration::from_secs(secs)
    }
}

impl IngestConfig {
    /// Load configuration from default locations
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from(None)
    }

    /// Load configuration, layering an explicit file over the defaults
    pub fn load_from(config_path: Option<&str>) -> Result<Self, ConfigError> {
        let mut builder = Config::builder();

        let config_locations = ["ingest.toml", ".ingest.toml", "config/ingest.toml"];

        for location in config_locations {
            builder = builder.add_source(File::with_name(location).required(false));
        }

        // Load from XDG config directory
        if let Some(config_dir) = directories::ProjectDirs::from("dev", "familiar", "schema-ingest") {
            let xdg_config = config_dir.config_dir().join("ingest.toml");
            if xdg_config.exists() {
                builder = builder.add_source(File::from(xdg_config).required(false));
            }
        }

        if let Some(path) = config_path {
            builder = builder.add_source(File::with_name(path).required(true));
        }

        // Load from environment variables (INGEST__SCHEDULER__POLL_INTERVAL_MS=...)
        builder = builder.add_source(
            Environment::with_prefix("INGEST")
                .prefix_separator("__")
                .separator("__")
                .try_parsing(true),
        );

        let config = builder.build()?;
        config.try_deserialize()
    }

    /// Save configuration to a file
    pub fn save(&self, path: &str) -> std::io::Result<()> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        std::fs::write(path, content)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = IngestConfig::default();
        assert_eq!(config.scheduler.cadence.backfill_secs, 60);
        assert_eq!(config.registry.max_cas_retries, 3);
        assert!(config.storage.path.is_none());
    }

    #[test]
    fn test_cadence_table() {
        let cadence = CadenceConfig::default();
        assert_eq!(cadence.cadence_for(ScheduleMode::Backfill), Duration::from_secs(60));
        assert_eq!(cadence.cadence_for(ScheduleMode::Incremental), Duration::from_secs(900));
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let config = SchedulerConfig {
            failure_backoff_secs: 10,
            max_backoff_secs: 100,
            ..SchedulerConfig::default()
        };
        assert_eq!(config.backoff_for(1), Duration::from_secs(10));
        assert_eq!(config.backoff_for(2), Duration::from_secs(20));
        assert_eq!(config.backoff_for(4), Duration::from_secs(80));
        assert_eq!(config.backoff_for(5), Duration::from_secs(100));
        assert_eq!(config.backoff_for(500), Duration::from_secs(100));
    }

    #[test]
    fn test_serialize_config() {
        let config = IngestConfig::default();
        let toml_str = toml::to_string_pretty(&config).unwrap();
        assert!(toml_str.contains("[scheduler]"));
        assert!(toml_str.contains("[scheduler.cadence]"));
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("custom.toml");
        std::fs::write(
            &path,
            "[scheduler.cadence]\nbackfill_secs = 5\n\n[repository]\nmax_page_size = 50\n",
        )
        .unwrap();
        let config = IngestConfig::load_from(Some(path.to_str().unwrap())).unwrap();
        assert_eq!(config.scheduler.cadence.backfill_secs, 5);
        assert_eq!(config.scheduler.cadence.incremental_secs, 900);
        assert_eq!(config.repository.max_page_size, 50);
    }
}
