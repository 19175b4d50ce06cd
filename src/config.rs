//! Daemon configuration: YAML file, environment overrides, defaults.
//!
//! Lookup order for the file: `--config`, `$FEEWATCH_CONFIG`, then
//! `~/.feewatch/config.yaml` if it exists. A missing default file is not an
//! error; every field has a default.

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::orchestrator::FeePolicy;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub upstream: UpstreamConfig,
    pub fee: FeeConfig,
    pub block_height: BlockHeightConfig,
    /// Poll cycles without a success after which a served value is stale.
    pub stale_after_cycles: u32,
    pub socket_path: PathBuf,
    pub store: StoreConfig,
    pub log_format: LogFormat,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UpstreamKind {
    Mempool,
    Unisat,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UpstreamConfig {
    pub kind: UpstreamKind,
    /// Overrides the provider's default base URL.
    pub base_url: Option<String>,
    pub api_key: Option<String>,
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FeeConfig {
    pub policy: FeePolicy,
    pub fallback_rate: u64,
    pub poll_interval_secs: u64,
    pub freshness_secs: u64,
    /// Cached rates older than this are not served.
    pub max_staleness_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BlockHeightConfig {
    pub poll_interval_secs: u64,
    pub freshness_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "backend", rename_all = "lowercase")]
pub enum StoreConfig {
    Memory,
    Sqlite { db_path: PathBuf },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Text,
    Json,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self { kind: UpstreamKind::Mempool, base_url: None, api_key: None, timeout_secs: 10 }
    }
}

impl Default for FeeConfig {
    fn default() -> Self {
        Self {
            policy: FeePolicy::Medium,
            fallback_rate: 5,
            poll_interval_secs: 15,
            freshness_secs: 15,
            max_staleness_secs: 600,
        }
    }
}

impl Default for BlockHeightConfig {
    fn default() -> Self {
        Self { poll_interval_secs: 10, freshness_secs: 10 }
    }
}

impl Default for Config {
    fn default() -> Self {
        let data_dir = data_dir();
        Self {
            upstream: UpstreamConfig::default(),
            fee: FeeConfig::default(),
            block_height: BlockHeightConfig::default(),
            stale_after_cycles: 3,
            socket_path: data_dir.join("feewatch.sock"),
            store: StoreConfig::Sqlite { db_path: data_dir.join("feewatch.db") },
            log_format: LogFormat::Text,
        }
    }
}

/// `~/.feewatch`, or `./.feewatch` when no home directory is known.
pub fn data_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".feewatch")
}

impl Config {
    /// Resolve the config file, apply env overrides, validate.
    pub fn load(explicit: Option<&Path>) -> Result<Self> {
        let path = explicit
            .map(Path::to_path_buf)
            .or_else(|| std::env::var_os("FEEWATCH_CONFIG").map(PathBuf::from));

        let mut config = match path {
            Some(p) => Self::from_file(&p)?,
            None => {
                let default_path = data_dir().join("config.yaml");
                if default_path.exists() {
                    Self::from_file(&default_path)?
                } else {
                    Self::default()
                }
            }
        };

        config.apply_env();
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        Self::from_yaml(&raw).with_context(|| format!("Invalid config file {}", path.display()))
    }

    pub fn from_yaml(raw: &str) -> Result<Self> {
        if raw.trim().is_empty() {
            return Ok(Self::default());
        }
        Ok(serde_yaml::from_str(raw)?)
    }

    fn apply_env(&mut self) {
        if let Ok(url) = std::env::var("FEEWATCH_API_URL") {
            self.upstream.base_url = Some(url);
        }
        if let Ok(key) = std::env::var("FEEWATCH_API_KEY") {
            self.upstream.api_key = Some(key);
        }
        if let Some(socket) = std::env::var_os("FEEWATCH_SOCKET") {
            self.socket_path = PathBuf::from(socket);
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.fee.poll_interval_secs == 0 || self.block_height.poll_interval_secs == 0 {
            bail!("poll intervals must be at least one second");
        }
        if self.fee.fallback_rate == 0 {
            bail!("fee.fallback_rate must be positive");
        }
        if self.upstream.timeout_secs == 0 {
            bail!("upstream.timeout_secs must be at least one second");
        }
        if self.fee.max_staleness_secs < self.fee.freshness_secs {
            bail!("fee.max_staleness_secs must not be shorter than fee.freshness_secs");
        }
        Ok(())
    }

    pub fn fee_interval(&self) -> Duration {
        Duration::from_secs(self.fee.poll_interval_secs)
    }

    pub fn height_interval(&self) -> Duration {
        Duration::from_secs(self.block_height.poll_interval_secs)
    }
}
