//! Configuration for the orchestrator daemon.
//!
//! Configuration is loaded with the following precedence (later overrides
//! earlier): built-in defaults, an optional TOML file, environment variables
//! prefixed with `STAMPEDE` using `__` as the nesting separator
//! (e.g. `STAMPEDE__LIFECYCLE__STALE_TEST_TIMEOUT_SECS=300`).

use anyhow::{Context, Result};
use config::{Config as ConfigBuilder, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Environment variable prefix for configuration overrides
pub const ENV_PREFIX: &str = "STAMPEDE";

/// Environment variable separator for nested keys
const ENV_SEPARATOR: &str = "__";

/// Top-level orchestrator configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct MasterConfig {
    /// Listener addresses
    pub server: ServerConfig,
    /// Result bus connection
    pub bus: BusConfig,
    /// Durable store connection
    pub database: DatabaseConfig,
    /// Lifecycle timeouts and sweep cadence
    pub lifecycle: LifecycleConfig,
    /// Scheduling policy knobs
    pub scheduler: SchedulerConfig,
    /// Assignment dispatch knobs
    pub dispatch: DispatchConfig,
}

/// Listener addresses
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Bind address for the worker protocol endpoint
    pub worker_listen: String,
    /// Bind address for the submission/read surface
    pub http_listen: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            worker_listen: "0.0.0.0:7070".to_string(),
            http_listen: "0.0.0.0:8080".to_string(),
        }
    }
}

/// Result bus connection settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BusConfig {
    /// Bus connection URL
    pub url: String,
    /// Topic (stream key) carrying raw results
    pub topic: String,
    /// Consumer-group id used by the aggregator
    pub group: String,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            url: "redis://127.0.0.1:6379".to_string(),
            topic: "stampede.results".to_string(),
            group: "stampede-aggregator".to_string(),
        }
    }
}

/// Durable store settings. An empty URL selects the in-memory store.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    /// PostgreSQL connection URL; empty runs on the in-memory store
    pub url: String,
}

/// Lifecycle coordinator timeouts
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LifecycleConfig {
    /// Seconds a running test may go without progress before it is swept
    pub stale_test_timeout_secs: u64,
    /// Seconds a silent status stream is tolerated before the worker is
    /// considered offline
    pub worker_offline_timeout_secs: u64,
    /// Sweeper cadence in seconds
    pub tick_interval_secs: u64,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            stale_test_timeout_secs: 600,
            worker_offline_timeout_secs: 30,
            tick_interval_secs: 10,
        }
    }
}

impl LifecycleConfig {
    /// Stale-test threshold as a `Duration`
    pub fn stale_test_timeout(&self) -> Duration {
        Duration::from_secs(self.stale_test_timeout_secs)
    }

    /// Tick cadence as a `Duration`
    pub fn tick_interval(&self) -> Duration {
        Duration::from_secs(self.tick_interval_secs)
    }
}

/// Scheduling policy knobs
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Worker count used when a submission passes 0
    pub default_worker_count: u32,
    /// Reject submissions when fewer workers are available than requested,
    /// instead of proceeding with the reduced set
    pub reject_when_short: bool,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            default_worker_count: 1,
            reject_when_short: false,
        }
    }
}

/// Assignment dispatch knobs
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatchConfig {
    /// Per-assignment RPC timeout in seconds
    pub timeout_secs: u64,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self { timeout_secs: 10 }
    }
}

impl MasterConfig {
    /// Load configuration from defaults, an optional file, and environment
    pub fn load(file: Option<&Path>) -> Result<Self> {
        ConfigLoader::new().with_optional_file(file).load()
    }

    /// Validate cross-field constraints after deserialization
    pub fn validate(&self) -> Result<()> {
        if self.server.worker_listen == self.server.http_listen {
            anyhow::bail!("worker_listen and http_listen must differ");
        }
        if self.scheduler.default_worker_count == 0 {
            anyhow::bail!("scheduler.default_worker_count must be at least 1");
        }
        if self.lifecycle.tick_interval_secs == 0 {
            anyhow::bail!("lifecycle.tick_interval_secs must be at least 1");
        }
        if self.bus.topic.is_empty() || self.bus.group.is_empty() {
            anyhow::bail!("bus.topic and bus.group must be non-empty");
        }
        Ok(())
    }
}

/// Configuration loader with builder pattern
#[derive(Debug, Default)]
pub struct ConfigLoader {
    custom_file: Option<PathBuf>,
    skip_env: bool,
}

impl ConfigLoader {
    /// Create a loader with default settings
    pub fn new() -> Self {
        Self::default()
    }

    /// Load overrides from a specific TOML file
    pub fn with_file<P: AsRef<Path>>(mut self, path: P) -> Self {
        self.custom_file = Some(path.as_ref().to_path_buf());
        self
    }

    fn with_optional_file(self, path: Option<&Path>) -> Self {
        match path {
            Some(p) => self.with_file(p),
            None => self,
        }
    }

    /// Skip environment variables; file-only loading for tests
    pub fn skip_env(mut self) -> Self {
        self.skip_env = true;
        self
    }

    /// Load and validate the configuration from all sources
    pub fn load(&self) -> Result<MasterConfig> {
        let mut builder = ConfigBuilder::builder();

        let defaults = MasterConfig::default();
        builder = builder.add_source(ConfigBuilder::try_from(&defaults)?);

        if let Some(ref path) = self.custom_file {
            tracing::debug!("loading config from {}", path.display());
            builder = builder.add_source(
                File::from(path.as_path())
                    .required(true)
                    .format(config::FileFormat::Toml),
            );
        }

        if !self.skip_env {
            builder = builder.add_source(
                Environment::with_prefix(ENV_PREFIX)
                    .separator(ENV_SEPARATOR)
                    .try_parsing(true),
            );
        }

        let merged = builder.build().context("failed to assemble configuration")?;
        let cfg: MasterConfig = merged
            .try_deserialize()
            .context("failed to deserialize configuration")?;

        cfg.validate()?;
        Ok(cfg)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_validate() {
        let cfg = MasterConfig::default();
        assert!(cfg.validate().is_ok());
        assert_eq!(cfg.scheduler.default_worker_count, 1);
        assert_eq!(cfg.lifecycle.worker_offline_timeout_secs, 30);
    }

    #[test]
    fn test_rejects_colliding_listeners() {
        let mut cfg = MasterConfig::default();
        cfg.server.http_listen = cfg.server.worker_listen.clone();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_rejects_zero_default_worker_count() {
        let mut cfg = MasterConfig::default();
        cfg.scheduler.default_worker_count = 0;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_file_overrides() {
        let dir = std::env::temp_dir().join("stampede-config-test");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("master.toml");
        std::fs::write(
            &path,
            r#"
[lifecycle]
stale_test_timeout_secs = 120

[scheduler]
default_worker_count = 4
"#,
        )
        .unwrap();

        let cfg = ConfigLoader::new().with_file(&path).skip_env().load().unwrap();
        assert_eq!(cfg.lifecycle.stale_test_timeout_secs, 120);
        assert_eq!(cfg.scheduler.default_worker_count, 4);
        // Untouched sections keep defaults
        assert_eq!(cfg.bus.topic, "stampede.results");
    }
}
