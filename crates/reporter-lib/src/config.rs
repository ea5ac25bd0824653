//! Reporter configuration
//!
//! Loaded from a TOML file layered with `DMON_`-prefixed environment
//! variables (`DMON_MASTER__ADDR=collector:4000`). Every section has
//! defaults, so an empty or missing file yields a usable configuration.

use anyhow::{Context, Result};
use serde::{Deserialize, Deserializer, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use tracing::warn;

/// Database file used when `cache.db_path` is empty
pub const DEFAULT_DB_PATH: &str = "./store/data.db";

/// Environment variable prefix for overrides
pub const ENV_PREFIX: &str = "DMON";

/// Offline cache implementation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheProvider {
    #[default]
    InMemory,
    Sqlite,
}

impl CacheProvider {
    pub fn as_str(&self) -> &'static str {
        match self {
            CacheProvider::InMemory => "in_memory",
            CacheProvider::Sqlite => "sqlite",
        }
    }
}

impl fmt::Display for CacheProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CacheProvider {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "in_memory" => Ok(CacheProvider::InMemory),
            "sqlite" => Ok(CacheProvider::Sqlite),
            other => anyhow::bail!("unknown cache provider `{}`", other),
        }
    }
}

/// Unknown providers fall back to the default instead of failing the load
fn lenient_provider<'de, D>(deserializer: D) -> std::result::Result<CacheProvider, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = String::deserialize(deserializer)?;
    Ok(raw.parse().unwrap_or_else(|_| {
        let fallback = CacheProvider::default();
        warn!(
            provider = %raw,
            fallback = %fallback,
            "Unknown cache provider, falling back to default"
        );
        fallback
    }))
}

/// `[cache]` section
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    #[serde(deserialize_with = "lenient_provider")]
    pub provider: CacheProvider,
    /// SQLite database file (empty means [`DEFAULT_DB_PATH`])
    pub db_path: PathBuf,
    /// Records accumulated before one batch write
    pub batch_size: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            provider: CacheProvider::InMemory,
            db_path: PathBuf::new(),
            batch_size: 5,
        }
    }
}

impl CacheConfig {
    pub fn resolved_db_path(&self) -> PathBuf {
        if self.db_path.as_os_str().is_empty() {
            PathBuf::from(DEFAULT_DB_PATH)
        } else {
            self.db_path.clone()
        }
    }
}

/// `[master]` section: the remote collector
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MasterConfig {
    /// Transport, `tcp` or `udp`
    pub protocol: String,
    pub addr: String,
    pub send_timeout_secs: u64,
    pub retry_interval_secs: u64,
}

impl Default for MasterConfig {
    fn default() -> Self {
        Self {
            protocol: "tcp".to_string(),
            addr: "localhost:4000".to_string(),
            send_timeout_secs: 1,
            retry_interval_secs: 2,
        }
    }
}

impl MasterConfig {
    pub fn send_timeout(&self) -> Duration {
        Duration::from_secs(self.send_timeout_secs)
    }

    pub fn retry_interval(&self) -> Duration {
        Duration::from_secs(self.retry_interval_secs)
    }
}

/// `[monitor]` section
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MonitorSettings {
    pub sampling_interval_secs: u64,
    pub stop_timeout_secs: u64,
    pub max_decode_failures: u32,
    pub channel_buffer_size: usize,
}

impl Default for MonitorSettings {
    fn default() -> Self {
        Self {
            sampling_interval_secs: 5,
            stop_timeout_secs: 5,
            max_decode_failures: 3,
            channel_buffer_size: 256,
        }
    }
}

/// `[runtime]` section
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct RuntimeSettings {
    /// Docker endpoint; falls back to `DOCKER_HOST`, then the local socket
    pub docker_host: Option<String>,
}

/// Complete reporter configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ReporterConfig {
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub master: MasterConfig,
    #[serde(default)]
    pub monitor: MonitorSettings,
    #[serde(default)]
    pub runtime: RuntimeSettings,
    /// Port for the health and metrics endpoints
    #[serde(default = "default_api_port")]
    pub api_port: u16,
    #[serde(default = "default_host_name")]
    pub host_name: String,
}

fn default_api_port() -> u16 {
    8080
}

fn default_host_name() -> String {
    std::env::var("HOSTNAME").unwrap_or_else(|_| "unknown".to_string())
}

impl Default for ReporterConfig {
    fn default() -> Self {
        Self {
            cache: CacheConfig::default(),
            master: MasterConfig::default(),
            monitor: MonitorSettings::default(),
            runtime: RuntimeSettings::default(),
            api_port: default_api_port(),
            host_name: default_host_name(),
        }
    }
}

impl ReporterConfig {
    /// Load configuration from a TOML file and the environment.
    ///
    /// A missing file is not an error: defaults (plus environment
    /// overrides) are used.
    pub fn load(path: &Path) -> Result<Self> {
        let mut builder = config::Config::builder();

        if path.exists() {
            builder = builder.add_source(config::File::from(path).format(config::FileFormat::Toml));
        } else {
            warn!(path = %path.display(), "Config file not found, loading defaults");
        }

        let config = builder
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .with_context(|| format!("Failed to read configuration from {}", path.display()))?;

        let parsed: ReporterConfig = config
            .try_deserialize()
            .context("Failed to parse configuration")?;

        parsed.validate()
    }

    /// Parse configuration from TOML text, without environment overrides
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config = config::Config::builder()
            .add_source(config::File::from_str(content, config::FileFormat::Toml))
            .build()
            .context("Failed to read configuration")?;

        let parsed: ReporterConfig = config
            .try_deserialize()
            .context("Failed to parse configuration")?;

        parsed.validate()
    }

    /// Reject values the pipeline cannot run with
    pub fn validate(mut self) -> Result<Self> {
        if self.master.addr.trim().is_empty() {
            anyhow::bail!("master.addr must not be empty");
        }
        if self.master.send_timeout_secs == 0 {
            anyhow::bail!("master.send_timeout_secs must be greater than zero");
        }
        if self.master.retry_interval_secs == 0 {
            anyhow::bail!("master.retry_interval_secs must be greater than zero");
        }
        if self.monitor.sampling_interval_secs == 0 {
            anyhow::bail!("monitor.sampling_interval_secs must be greater than zero");
        }
        if self.cache.batch_size == 0 {
            warn!("cache.batch_size is zero, using 1");
            self.cache.batch_size = 1;
        }
        if self.monitor.channel_buffer_size == 0 {
            self.monitor.channel_buffer_size = 1;
        }

        Ok(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ReporterConfig::from_toml_str("").unwrap();

        assert_eq!(config.cache.provider, CacheProvider::InMemory);
        assert_eq!(config.cache.resolved_db_path(), PathBuf::from(DEFAULT_DB_PATH));
        assert_eq!(config.cache.batch_size, 5);
        assert_eq!(config.master.send_timeout(), Duration::from_secs(1));
        assert_eq!(config.master.retry_interval(), Duration::from_secs(2));
        assert_eq!(config.monitor.sampling_interval_secs, 5);
        assert_eq!(config.api_port, 8080);
    }

    #[test]
    fn test_full_file() {
        let toml = r#"
            api_port = 9100

            [cache]
            provider = "sqlite"
            db_path = "/var/lib/dmon/cache.db"
            batch_size = 10

            [master]
            protocol = "udp"
            addr = "collector:4000"
            send_timeout_secs = 3
            retry_interval_secs = 7
        "#;

        let config = ReporterConfig::from_toml_str(toml).unwrap();
        assert_eq!(config.api_port, 9100);
        assert_eq!(config.cache.provider, CacheProvider::Sqlite);
        assert_eq!(
            config.cache.resolved_db_path(),
            PathBuf::from("/var/lib/dmon/cache.db")
        );
        assert_eq!(config.cache.batch_size, 10);
        assert_eq!(config.master.protocol, "udp");
        assert_eq!(config.master.addr, "collector:4000");
        assert_eq!(config.master.retry_interval(), Duration::from_secs(7));
    }

    #[test]
    fn test_unknown_provider_falls_back() {
        let toml = r#"
            [cache]
            provider = "redis"
        "#;

        let config = ReporterConfig::from_toml_str(toml).unwrap();
        assert_eq!(config.cache.provider, CacheProvider::InMemory);
    }

    #[test]
    fn test_provider_is_case_insensitive() {
        assert_eq!("SQLite".parse::<CacheProvider>().unwrap(), CacheProvider::Sqlite);
        assert!("postgres".parse::<CacheProvider>().is_err());
    }

    #[test]
    fn test_zero_retry_interval_rejected() {
        let toml = r#"
            [master]
            retry_interval_secs = 0
        "#;

        assert!(ReporterConfig::from_toml_str(toml).is_err());
    }

    #[test]
    fn test_zero_batch_size_clamped() {
        let toml = r#"
            [cache]
            batch_size = 0
        "#;

        let config = ReporterConfig::from_toml_str(toml).unwrap();
        assert_eq!(config.cache.batch_size, 1);
    }

    #[test]
    fn test_missing_file_loads_defaults() {
        let dir = tempfile::TempDir::new().unwrap();
        let config = ReporterConfig::load(&dir.path().join("absent.toml")).unwrap();
        assert_eq!(config.master.addr, "localhost:4000");
    }
}
