//! Configuration management for Postflow

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{ConfigError, Result};
use crate::types::Platform;

pub const CONFIG_ENV: &str = "POSTFLOW_CONFIG";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub database: DatabaseConfig,
    #[serde(default)]
    pub scheduling: SchedulingConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub http: HttpConfig,
    #[serde(default)]
    pub rate_limits: RateLimitsConfig,
    #[serde(default)]
    pub platforms: PlatformsConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    pub path: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulingConfig {
    /// Seconds between `postflow-send` ticks
    #[serde(default = "default_poll_interval")]
    pub poll_interval: u64,
    /// Failed posts are requeued at most this many times
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Terminal posts older than this many days are deleted
    #[serde(default = "default_retention_days")]
    pub retention_days: u32,
    /// Due posts processed in parallel per tick
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    /// Failed status lookups in a row before a submitted post counts as FAILED
    #[serde(default = "default_max_check_failures")]
    pub max_check_failures: u32,
}

fn default_poll_interval() -> u64 {
    60
}

fn default_max_retries() -> u32 {
    3
}

fn default_retention_days() -> u32 {
    30
}

fn default_concurrency() -> usize {
    1
}

fn default_max_check_failures() -> u32 {
    10
}

impl Default for SchedulingConfig {
    fn default() -> Self {
        Self {
            poll_interval: default_poll_interval(),
            max_retries: default_max_retries(),
            retention_days: default_retention_days(),
            concurrency: default_concurrency(),
            max_check_failures: default_max_check_failures(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_backoff_ms")]
    pub backoff_ms: u64,
}

fn default_max_attempts() -> u32 {
    3
}

fn default_backoff_ms() -> u64 {
    1000
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            backoff_ms: default_backoff_ms(),
        }
    }
}

impl RetryConfig {
    pub fn backoff(&self) -> Duration {
        Duration::from_millis(self.backoff_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpConfig {
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_media_poll_attempts")]
    pub media_poll_attempts: u32,
    #[serde(default = "default_media_poll_delay_ms")]
    pub media_poll_delay_ms: u64,
}

fn default_timeout_secs() -> u64 {
    30
}

fn default_media_poll_attempts() -> u32 {
    10
}

fn default_media_poll_delay_ms() -> u64 {
    1000
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_timeout_secs(),
            media_poll_attempts: default_media_poll_attempts(),
            media_poll_delay_ms: default_media_poll_delay_ms(),
        }
    }
}

impl HttpConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// Per-platform override of the outbound request quota
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct RateLimitSettings {
    pub points: u32,
    pub duration_secs: u64,
    #[serde(default)]
    pub block_duration_secs: Option<u64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RateLimitsConfig {
    pub twitter: Option<RateLimitSettings>,
    pub linkedin: Option<RateLimitSettings>,
    pub instagram: Option<RateLimitSettings>,
    pub tiktok: Option<RateLimitSettings>,
    pub youtube: Option<RateLimitSettings>,
    pub bluesky: Option<RateLimitSettings>,
    pub threads: Option<RateLimitSettings>,
}

impl RateLimitsConfig {
    pub fn get(&self, platform: Platform) -> Option<RateLimitSettings> {
        match platform {
            Platform::Twitter => self.twitter,
            Platform::LinkedIn => self.linkedin,
            Platform::Instagram => self.instagram,
            Platform::TikTok => self.tiktok,
            Platform::YouTube => self.youtube,
            Platform::Bluesky => self.bluesky,
            Platform::Threads => self.threads,
        }
    }
}

/// OAuth application registered with a provider
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OAuthAppConfig {
    pub client_id: String,
    #[serde(default)]
    pub client_secret: Option<String>,
    pub redirect_uri: String,
    /// Overrides the adapter's default scopes
    #[serde(default)]
    pub scopes: Option<Vec<String>>,
}

impl OAuthAppConfig {
    pub fn require_secret(&self, platform: Platform) -> Result<&str> {
        self.client_secret.as_deref().ok_or_else(|| {
            ConfigError::MissingField(format!("platforms.{}.client_secret", platform)).into()
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlueskyConfig {
    /// PDS that accounts authenticate against
    #[serde(default = "default_bluesky_service")]
    pub service: String,
}

fn default_bluesky_service() -> String {
    "https://bsky.social".to_string()
}

impl Default for BlueskyConfig {
    fn default() -> Self {
        Self {
            service: default_bluesky_service(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PlatformsConfig {
    pub twitter: Option<OAuthAppConfig>,
    pub linkedin: Option<OAuthAppConfig>,
    pub instagram: Option<OAuthAppConfig>,
    pub tiktok: Option<OAuthAppConfig>,
    pub youtube: Option<OAuthAppConfig>,
    pub threads: Option<OAuthAppConfig>,
    pub bluesky: Option<BlueskyConfig>,
}

impl PlatformsConfig {
    /// OAuth app settings for every platform except Bluesky
    pub fn oauth(&self, platform: Platform) -> Option<&OAuthAppConfig> {
        match platform {
            Platform::Twitter => self.twitter.as_ref(),
            Platform::LinkedIn => self.linkedin.as_ref(),
            Platform::Instagram => self.instagram.as_ref(),
            Platform::TikTok => self.tiktok.as_ref(),
            Platform::YouTube => self.youtube.as_ref(),
            Platform::Threads => self.threads.as_ref(),
            Platform::Bluesky => None,
        }
    }

    /// Platforms with enough configuration to build an adapter
    pub fn configured(&self) -> Vec<Platform> {
        Platform::ALL
            .into_iter()
            .filter(|p| match p {
                Platform::Bluesky => self.bluesky.is_some(),
                other => self.oauth(*other).is_some(),
            })
            .collect()
    }
}

impl Config {
    /// Load configuration from the default location
    pub fn load() -> Result<Self> {
        let config_path = resolve_config_path()?;
        Self::load_from_path(&config_path)
    }

    /// Load configuration from a specific path
    pub fn load_from_path(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(ConfigError::ReadError)?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self> {
        let config: Config = toml::from_str(content).map_err(ConfigError::ParseError)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject settings that would make the pipeline spin or divide by zero
    pub fn validate(&self) -> Result<()> {
        if self.database.path.trim().is_empty() {
            return Err(ConfigError::MissingField("database.path".to_string()).into());
        }
        if self.scheduling.concurrency == 0 {
            return Err(invalid("scheduling.concurrency", "must be at least 1"));
        }
        if self.scheduling.poll_interval == 0 {
            return Err(invalid("scheduling.poll_interval", "must be at least 1 second"));
        }
        if self.retry.max_attempts == 0 {
            return Err(invalid("retry.max_attempts", "must be at least 1"));
        }
        if self.http.media_poll_attempts == 0 {
            return Err(invalid("http.media_poll_attempts", "must be at least 1"));
        }
        for platform in Platform::ALL {
            if let Some(limit) = self.rate_limits.get(platform) {
                if limit.points == 0 || limit.duration_secs == 0 {
                    return Err(invalid(
                        &format!("rate_limits.{}", platform),
                        "points and duration_secs must be positive",
                    ));
                }
            }
        }
        Ok(())
    }

    /// Create a default configuration
    pub fn default_config() -> Self {
        Self {
            database: DatabaseConfig {
                path: "~/.local/share/postflow/postflow.db".to_string(),
            },
            scheduling: SchedulingConfig::default(),
            retry: RetryConfig::default(),
            http: HttpConfig::default(),
            rate_limits: RateLimitsConfig::default(),
            platforms: PlatformsConfig::default(),
        }
    }
}

fn invalid(field: &str, reason: &str) -> crate::error::PostflowError {
    ConfigError::InvalidValue {
        field: field.to_string(),
        reason: reason.to_string(),
    }
    .into()
}

/// Resolve the configuration file path following the XDG layout
pub fn resolve_config_path() -> Result<PathBuf> {
    if let Ok(path) = std::env::var(CONFIG_ENV) {
        return Ok(PathBuf::from(shellexpand::tilde(&path).to_string()));
    }

    let config_dir = dirs::config_dir()
        .ok_or_else(|| ConfigError::MissingField("config directory".to_string()))?;

    Ok(config_dir.join("postflow").join("config.toml"))
}

/// Resolve the data directory path following the XDG layout
pub fn resolve_data_path() -> Result<PathBuf> {
    let data_dir = dirs::data_dir()
        .ok_or_else(|| ConfigError::MissingField("data directory".to_string()))?;

    Ok(data_dir.join("postflow"))
}

/// Expand `~` in a configured database path, defaulting to the data directory
pub fn resolve_db_path(configured: Option<&str>) -> Result<PathBuf> {
    match configured {
        Some(path) if !path.trim().is_empty() => {
            Ok(PathBuf::from(shellexpand::tilde(path).to_string()))
        }
        _ => Ok(resolve_data_path()?.join("postflow.db")),
    }
}
