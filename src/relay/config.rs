use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::cache::TokenCacheConfig;
use super::channel::Channel;
use super::health::HealthConfig;
use super::quota::QuotaConfig;
use super::registry::DEFAULT_SMOOTHING;
use super::store::{Token, User};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
}

impl From<ConfigError> for crate::RelayError {
    fn from(err: ConfigError) -> Self {
        Self::Config(err.to_string())
    }
}

/// Initial records written to the store at startup.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SeedConfig {
    pub channels: Vec<Channel>,
    pub tokens: Vec<Token>,
    pub users: Vec<User>,
}

#[derive(Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    pub listen: String,
    /// `None` keeps everything in memory.
    pub sqlite_path: Option<PathBuf>,
    /// Serve selections from the in-memory index instead of querying the store each time.
    pub memory_cache_enabled: bool,
    pub sync_interval_secs: u64,
    pub retry_times: usize,
    pub request_timeout_secs: u64,
    pub stream_idle_timeout_secs: u64,
    pub smoothing: u32,
    pub pricing_file: Option<PathBuf>,
    /// Guards `/metrics`; the endpoint answers 404 while unset.
    pub admin_token: Option<String>,
    pub quota: QuotaConfig,
    pub health: HealthConfig,
    pub token_cache: TokenCacheConfig,
    pub seed: SeedConfig,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            listen: "127.0.0.1:3000".to_string(),
            sqlite_path: None,
            memory_cache_enabled: true,
            sync_interval_secs: 60,
            retry_times: 2,
            request_timeout_secs: 300,
            stream_idle_timeout_secs: 60,
            smoothing: DEFAULT_SMOOTHING,
            pricing_file: None,
            admin_token: None,
            quota: QuotaConfig::default(),
            health: HealthConfig::default(),
            token_cache: TokenCacheConfig::default(),
            seed: SeedConfig::default(),
        }
    }
}

impl std::fmt::Debug for RelayConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RelayConfig")
            .field("listen", &self.listen)
            .field("sqlite_path", &self.sqlite_path)
            .field("memory_cache_enabled", &self.memory_cache_enabled)
            .field("sync_interval_secs", &self.sync_interval_secs)
            .field("retry_times", &self.retry_times)
            .field("request_timeout_secs", &self.request_timeout_secs)
            .field("stream_idle_timeout_secs", &self.stream_idle_timeout_secs)
            .field("smoothing", &self.smoothing)
            .field("pricing_file", &self.pricing_file)
            .field("admin_token", &self.admin_token.as_ref().map(|_| "<redacted>"))
            .field("quota", &self.quota)
            .field("health", &self.health)
            .field("token_cache", &self.token_cache)
            .field("seed_channels", &self.seed.channels)
            .field("seed_tokens", &self.seed.tokens)
            .field("seed_users", &self.seed.users.len())
            .finish()
    }
}

impl RelayConfig {
    pub fn from_toml_str(raw: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    pub async fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = tokio::fs::read_to_string(path)
            .await
            .map_err(|source| ConfigError::Read {
                path: path.to_path_buf(),
                source,
            })?;
        Self::from_toml_str(&raw)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.listen.trim().is_empty() {
            return Err(ConfigError::Invalid("listen must not be empty".to_string()));
        }
        if self.request_timeout_secs == 0 {
            return Err(ConfigError::Invalid(
                "request_timeout_secs must be positive".to_string(),
            ));
        }
        if self.stream_idle_timeout_secs == 0 {
            return Err(ConfigError::Invalid(
                "stream_idle_timeout_secs must be positive".to_string(),
            ));
        }
        let mut ids = std::collections::HashSet::new();
        for channel in &self.seed.channels {
            if !ids.insert(channel.id) {
                return Err(ConfigError::Invalid(format!(
                    "duplicate channel id {}",
                    channel.id
                )));
            }
        }
        Ok(())
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn stream_idle_timeout(&self) -> Duration {
        Duration::from_secs(self.stream_idle_timeout_secs)
    }

    pub fn sync_interval(&self) -> Option<Duration> {
        (self.sync_interval_secs > 0).then(|| Duration::from_secs(self.sync_interval_secs))
    }

    pub fn probe_interval(&self) -> Option<Duration> {
        (self.health.auto_enable_channel && self.health.probe_interval_secs > 0)
            .then(|| Duration::from_secs(self.health.probe_interval_secs))
    }
}
