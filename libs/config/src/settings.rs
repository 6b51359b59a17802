//! Strand Configuration Module
//!
//! Loads operator settings from an optional TOML file with `STRAND__`
//! environment overrides, e.g. `STRAND__RPC__TIMEOUT_MS=5000`.

use crate::defaults;
use anyhow::{bail, Context, Result};
use config_crate::{Config, Environment, File, Map};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info};

/// Prefix for environment overrides
pub const ENV_PREFIX: &str = "STRAND";

/// Main configuration structure
#[derive(Debug, Deserialize, Serialize, Clone, Default, PartialEq)]
#[serde(default)]
pub struct StrandConfig {
    pub process: ProcessConfig,
    pub rpc: RpcConfig,
    pub lock: LockConfig,
    pub location: LocationConfig,
    pub logging: LoggingConfig,
}

/// Identity of this OS process within the deployment
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
#[serde(default)]
pub struct ProcessConfig {
    pub id: u32,
    pub min_id: u32,
    pub max_id: u32,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
#[serde(default)]
pub struct RpcConfig {
    pub timeout_ms: u64,
    pub sweep_interval_ms: u64,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
#[serde(default)]
pub struct LockConfig {
    pub wait_timeout_ms: u64,
    pub level_warn_threshold: u32,
    pub drain_cap_per_tick: usize,
    pub tick_interval_ms: u64,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
#[serde(default)]
pub struct LocationConfig {
    pub lease_ms: u64,
    pub stats_interval_secs: u64,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub json: bool,
}

impl Default for ProcessConfig {
    fn default() -> Self {
        Self {
            id: defaults::process::ID,
            min_id: defaults::process::MIN_ID,
            max_id: defaults::process::MAX_ID,
        }
    }
}

impl Default for RpcConfig {
    fn default() -> Self {
        Self {
            timeout_ms: defaults::rpc::TIMEOUT_MS,
            sweep_interval_ms: defaults::rpc::SWEEP_INTERVAL_MS,
        }
    }
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            wait_timeout_ms: defaults::lock::WAIT_TIMEOUT_MS,
            level_warn_threshold: defaults::lock::LEVEL_WARN_THRESHOLD,
            drain_cap_per_tick: defaults::lock::DRAIN_CAP_PER_TICK,
            tick_interval_ms: defaults::lock::TICK_INTERVAL_MS,
        }
    }
}

impl Default for LocationConfig {
    fn default() -> Self {
        Self {
            lease_ms: defaults::location::LEASE_MS,
            stats_interval_secs: defaults::location::STATS_INTERVAL_SECS,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

impl RpcConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }
}

impl LockConfig {
    pub fn wait_timeout(&self) -> Duration {
        Duration::from_millis(self.wait_timeout_ms)
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }
}

impl LocationConfig {
    pub fn lease(&self) -> Duration {
        Duration::from_millis(self.lease_ms)
    }

    pub fn stats_interval(&self) -> Duration {
        Duration::from_secs(self.stats_interval_secs)
    }
}

impl StrandConfig {
    /// Load configuration from an optional file with environment overrides
    pub fn load(path: Option<&Path>) -> Result<Self> {
        Self::load_with_env(path, None)
    }

    /// Load with an explicit environment map instead of the process environment
    pub fn load_with_env(path: Option<&Path>, env: Option<Map<String, String>>) -> Result<Self> {
        let mut builder = Config::builder();

        if let Some(path) = path {
            info!("Loading configuration file: {:?}", path);
            builder = builder.add_source(File::from(path).required(true));
        }

        builder = builder.add_source(
            Environment::with_prefix(ENV_PREFIX)
                .separator("__")
                .try_parsing(true)
                .source(env),
        );

        let config: StrandConfig = builder
            .build()
            .context("Failed to build configuration")?
            .try_deserialize()
            .context("Failed to deserialize configuration")?;

        config.validate()?;
        debug!(process = config.process.id, "Configuration loaded");
        Ok(config)
    }

    /// Reject settings the runtime cannot honour
    pub fn validate(&self) -> Result<()> {
        let process = &self.process;
        if process.max_id > defaults::process::MAX_ID {
            bail!(
                "process.max_id {} exceeds the address field maximum {}",
                process.max_id,
                defaults::process::MAX_ID
            );
        }
        if process.min_id > process.max_id {
            bail!(
                "process.min_id {} is greater than process.max_id {}",
                process.min_id,
                process.max_id
            );
        }
        if process.id < process.min_id || process.id > process.max_id {
            bail!(
                "process.id {} outside configured range [{}, {}]",
                process.id,
                process.min_id,
                process.max_id
            );
        }
        if self.rpc.timeout_ms == 0 {
            bail!("rpc.timeout_ms must be positive");
        }
        if self.rpc.sweep_interval_ms == 0 {
            bail!("rpc.sweep_interval_ms must be positive");
        }
        if self.lock.wait_timeout_ms == 0 {
            bail!("lock.wait_timeout_ms must be positive");
        }
        if self.lock.drain_cap_per_tick == 0 {
            bail!("lock.drain_cap_per_tick must be positive");
        }
        if self.lock.tick_interval_ms == 0 {
            bail!("lock.tick_interval_ms must be positive");
        }
        if self.location.lease_ms == 0 {
            bail!("location.lease_ms must be positive");
        }
        Ok(())
    }

    /// Effective configuration rendered as TOML
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).context("Failed to render configuration")
    }
}

/// Convenience function: expand `~` and `$VARS` in the path, then load
pub fn load_config(path: Option<&str>) -> Result<StrandConfig> {
    let path = path
        .map(|p| {
            shellexpand::full(p)
                .map(|expanded| PathBuf::from(expanded.as_ref()))
                .with_context(|| format!("Failed to expand config path {}", p))
        })
        .transpose()?;
    StrandConfig::load(path.as_deref())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    fn no_env() -> Option<Map<String, String>> {
        Some(Map::new())
    }

    #[test]
    fn test_defaults_without_file() {
        let config = StrandConfig::load_with_env(None, no_env()).unwrap();
        assert_eq!(config, StrandConfig::default());
        assert_eq!(config.rpc.timeout(), Duration::from_secs(40));
        assert_eq!(config.lock.level_warn_threshold, 100);
        assert_eq!(config.lock.drain_cap_per_tick, 1_000);
    }

    #[test]
    fn test_load_partial_file() {
        let dir = tempdir().unwrap();
        let config_path = dir.path().join("strand.toml");

        let config_content = r#"
[process]
id = 12

[rpc]
timeout_ms = 500

[logging]
level = "debug"
json = true
"#;

        fs::write(&config_path, config_content).unwrap();

        let config = StrandConfig::load_with_env(Some(&config_path), no_env()).unwrap();

        assert_eq!(config.process.id, 12);
        assert_eq!(config.rpc.timeout_ms, 500);
        assert_eq!(config.rpc.sweep_interval_ms, defaults::rpc::SWEEP_INTERVAL_MS);
        assert_eq!(config.logging.level, "debug");
        assert!(config.logging.json);
        assert_eq!(config.location.lease_ms, defaults::location::LEASE_MS);
    }

    #[test]
    fn test_environment_override() {
        let dir = tempdir().unwrap();
        let config_path = dir.path().join("strand.toml");
        fs::write(&config_path, "[location]\nlease_ms = 100\n").unwrap();

        let mut env = Map::new();
        env.insert("STRAND__LOCATION__LEASE_MS".to_string(), "250".to_string());
        env.insert("STRAND__PROCESS__ID".to_string(), "3".to_string());

        let config = StrandConfig::load_with_env(Some(&config_path), Some(env)).unwrap();
        assert_eq!(config.location.lease_ms, 250);
        assert_eq!(config.process.id, 3);
    }

    #[test]
    fn test_missing_file_is_an_error() {
        let dir = tempdir().unwrap();
        let missing = dir.path().join("absent.toml");
        assert!(StrandConfig::load_with_env(Some(&missing), no_env()).is_err());
    }

    #[test]
    fn test_validate_rejects_process_out_of_range() {
        let mut config = StrandConfig::default();
        config.process.min_id = 10;
        config.process.max_id = 20;
        config.process.id = 21;
        assert!(config.validate().is_err());

        config.process.id = 15;
        assert!(config.validate().is_ok());

        config.process.max_id = 70_000;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_zero_limits() {
        let mut config = StrandConfig::default();
        config.lock.drain_cap_per_tick = 0;
        assert!(config.validate().is_err());

        let mut config = StrandConfig::default();
        config.rpc.timeout_ms = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_invalid_file_fails_validation() {
        let dir = tempdir().unwrap();
        let config_path = dir.path().join("strand.toml");
        fs::write(&config_path, "[process]\nid = 0\n").unwrap();
        let err = StrandConfig::load_with_env(Some(&config_path), no_env()).unwrap_err();
        assert!(err.to_string().contains("process.id"));
    }

    #[test]
    fn test_to_toml_reloads_identically() {
        let mut config = StrandConfig::default();
        config.process.id = 44;
        let rendered = config.to_toml().unwrap();

        let dir = tempdir().unwrap();
        let config_path = dir.path().join("rendered.toml");
        fs::write(&config_path, rendered).unwrap();

        let reloaded = StrandConfig::load_with_env(Some(&config_path), no_env()).unwrap();
        assert_eq!(reloaded, config);
    }
}
