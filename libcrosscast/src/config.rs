//! Configuration management for Crosscast
//!
//! Every section has defaults, so an empty file (or no file at all, via
//! [`Config::default_config`]) yields a working development setup.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{ConfigError, Result};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub worker: WorkerConfig,
    #[serde(default)]
    pub tokens: TokenConfig,
    #[serde(default)]
    pub admin: AdminConfig,
    #[serde(default)]
    pub platforms: PlatformsConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    pub path: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: "~/.local/share/crosscast/crosscast.db".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Number of concurrent publish workers in one daemon
    pub concurrency: usize,
    /// Idle poll interval in milliseconds
    pub poll_interval_ms: u64,
    pub max_attempts: u32,
    /// First retry delay; doubles on every further attempt
    pub base_delay_ms: u64,
    /// A claimed job older than this is considered abandoned
    pub claim_lease_secs: u64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            concurrency: 2,
            poll_interval_ms: 1000,
            max_attempts: 3,
            base_delay_ms: 2000,
            claim_lease_secs: 300,
        }
    }
}

impl WorkerConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn base_delay(&self) -> Duration {
        Duration::from_millis(self.base_delay_ms)
    }

    pub fn claim_lease(&self) -> Duration {
        Duration::from_secs(self.claim_lease_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TokenConfig {
    pub threshold_hours: i64,
    /// How often the refresh scheduler runs, e.g. "24h" or "5m"
    pub refresh_interval: String,
    /// Pause between sequential refresh calls
    pub inter_call_delay_ms: u64,
}

impl Default for TokenConfig {
    fn default() -> Self {
        Self {
            threshold_hours: 24,
            refresh_interval: "24h".to_string(),
            inter_call_delay_ms: 1000,
        }
    }
}

impl TokenConfig {
    pub fn refresh_interval(&self) -> Result<Duration> {
        humantime::parse_duration(&self.refresh_interval).map_err(|e| {
            ConfigError::InvalidValue {
                field: "tokens.refresh_interval".to_string(),
                message: e.to_string(),
            }
            .into()
        })
    }

    pub fn inter_call_delay(&self) -> Duration {
        Duration::from_millis(self.inter_call_delay_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AdminConfig {
    pub bind: String,
}

impl Default for AdminConfig {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1:8787".to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PlatformsConfig {
    pub meta: MetaConfig,
    pub twitter: TwitterConfig,
    pub tiktok: TikTokConfig,
}

/// Facebook and Instagram share one Graph API app
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MetaConfig {
    pub api_base: String,
    pub app_id: String,
    pub app_secret: String,
    pub timeout_secs: u64,
}

impl Default for MetaConfig {
    fn default() -> Self {
        Self {
            api_base: "https://graph.facebook.com/v19.0".to_string(),
            app_id: String::new(),
            app_secret: String::new(),
            timeout_secs: 20,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TwitterConfig {
    pub api_base: String,
    pub client_id: String,
    pub client_secret: String,
    pub timeout_secs: u64,
}

impl Default for TwitterConfig {
    fn default() -> Self {
        Self {
            api_base: "https://api.x.com".to_string(),
            client_id: String::new(),
            client_secret: String::new(),
            timeout_secs: 20,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TikTokConfig {
    pub api_base: String,
    pub client_key: String,
    pub client_secret: String,
    pub timeout_secs: u64,
}

impl Default for TikTokConfig {
    fn default() -> Self {
        Self {
            api_base: "https://open.tiktokapis.com".to_string(),
            client_key: String::new(),
            client_secret: String::new(),
            timeout_secs: 20,
        }
    }
}

impl Config {
    /// Load configuration from the default location
    ///
    /// A missing file is not an error; defaults are used instead.
    pub fn load() -> Result<Self> {
        let config_path = resolve_config_path()?;
        let mut config = if config_path.exists() {
            Self::load_from_path(&config_path)?
        } else {
            tracing::debug!(path = %config_path.display(), "No config file, using defaults");
            Self::default_config()
        };
        config.apply_env_overrides();
        Ok(config)
    }

    /// Load configuration from a specific path
    pub fn load_from_path(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(ConfigError::ReadError)?;
        let config: Config = toml::from_str(&content).map_err(ConfigError::ParseError)?;
        config.validate()?;
        Ok(config)
    }

    /// Create a default configuration
    pub fn default_config() -> Self {
        Self {
            database: DatabaseConfig::default(),
            worker: WorkerConfig::default(),
            tokens: TokenConfig::default(),
            admin: AdminConfig::default(),
            platforms: PlatformsConfig::default(),
        }
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(path) = std::env::var("CROSSCAST_DB_PATH") {
            self.database.path = path;
        }
    }

    fn validate(&self) -> Result<()> {
        if self.worker.max_attempts == 0 {
            return Err(ConfigError::InvalidValue {
                field: "worker.max_attempts".to_string(),
                message: "must be at least 1".to_string(),
            }
            .into());
        }
        if self.worker.concurrency == 0 {
            return Err(ConfigError::InvalidValue {
                field: "worker.concurrency".to_string(),
                message: "must be at least 1".to_string(),
            }
            .into());
        }
        self.tokens.refresh_interval()?;
        Ok(())
    }
}

/// Resolve the configuration file path under the XDG config directory
pub fn resolve_config_path() -> Result<PathBuf> {
    if let Ok(path) = std::env::var("CROSSCAST_CONFIG") {
        return Ok(PathBuf::from(shellexpand::tilde(&path).to_string()));
    }

    let config_dir = dirs::config_dir()
        .ok_or_else(|| ConfigError::MissingField("config directory".to_string()))?;

    Ok(config_dir.join("crosscast").join("config.toml"))
}
