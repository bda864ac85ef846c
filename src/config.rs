//! Configuration loader and validator for the YouTube digest bot.
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("YAML parse error: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("Invalid configuration: {0}")]
    Invalid(&'static str),
}

/// Root configuration struct mirroring the YAML schema exactly.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Config {
    pub app: App,
    pub telegram: Telegram,
    pub youtube: YouTube,
    pub digest: Digest,
}

/// App-level settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct App {
    pub data_dir: String,
    /// Scheduler cadence. "Due" is evaluated at every tick.
    pub tick_interval_secs: u64,
    /// Max subscriptions processed in parallel per tick.
    pub worker_concurrency: usize,
    /// Bind address for the health/cron HTTP surface.
    pub bind_addr: String,
    /// Shared secret expected in the X-CRON-KEY header.
    pub cron_key: String,
}

/// Telegram bot settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Telegram {
    pub bot_token: String,
    /// Minimum spacing between outbound Telegram sends.
    pub send_interval_ms: u64,
}

/// YouTube Data API settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct YouTube {
    pub api_key: String,
    /// Minimum spacing between YouTube API calls.
    pub request_interval_ms: u64,
}

/// Digest engine knobs.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Digest {
    pub max_videos_per_digest: usize,
    /// Lookback window for a channel that has never been checked.
    pub first_check_lookback_days: i64,
    pub fetch_max_attempts: u32,
    pub delivery_max_attempts: i64,
    pub backoff_base_secs: u64,
    pub backoff_cap_secs: u64,
}

impl Config {
    /// Ensure required directories exist (creates `app.data_dir` if missing).
    pub fn ensure_dirs(&self) -> Result<(), std::io::Error> {
        if self.app.data_dir.trim().is_empty() {
            return Ok(());
        }
        fs::create_dir_all(&self.app.data_dir)
    }
}

/// Load configuration from a YAML file and validate it.
/// - If `path` is None, uses `config.yaml` in the current working directory.
pub fn load(path: Option<&Path>) -> Result<Config, ConfigError> {
    let path = path.unwrap_or_else(|| Path::new("config.yaml"));
    let content = fs::read_to_string(path)?;
    let cfg: Config = serde_yaml::from_str(&content)?;
    validate(&cfg)?;
    Ok(cfg)
}

/// Validate a configuration instance.
fn validate(cfg: &Config) -> Result<(), ConfigError> {
    if cfg.app.data_dir.trim().is_empty() {
        return Err(ConfigError::Invalid("app.data_dir must be non-empty"));
    }
    if cfg.app.tick_interval_secs == 0 {
        return Err(ConfigError::Invalid("app.tick_interval_secs must be > 0"));
    }
    if cfg.app.worker_concurrency == 0 {
        return Err(ConfigError::Invalid("app.worker_concurrency must be > 0"));
    }
    if cfg.app.bind_addr.trim().is_empty() {
        return Err(ConfigError::Invalid("app.bind_addr must be non-empty"));
    }
    if cfg.app.cron_key.trim().is_empty() {
        return Err(ConfigError::Invalid("app.cron_key must be non-empty"));
    }

    if cfg.telegram.bot_token.trim().is_empty() {
        return Err(ConfigError::Invalid("telegram.bot_token must be non-empty"));
    }

    if cfg.youtube.api_key.trim().is_empty() {
        return Err(ConfigError::Invalid("youtube.api_key must be non-empty"));
    }

    if cfg.digest.max_videos_per_digest == 0 {
        return Err(ConfigError::Invalid(
            "digest.max_videos_per_digest must be > 0",
        ));
    }
    if cfg.digest.first_check_lookback_days <= 0 {
        return Err(ConfigError::Invalid(
            "digest.first_check_lookback_days must be > 0",
        ));
    }
    if cfg.digest.fetch_max_attempts == 0 {
        return Err(ConfigError::Invalid("digest.fetch_max_attempts must be > 0"));
    }
    if cfg.digest.delivery_max_attempts <= 0 {
        return Err(ConfigError::Invalid(
            "digest.delivery_max_attempts must be > 0",
        ));
    }
    if cfg.digest.backoff_base_secs == 0 {
        return Err(ConfigError::Invalid("digest.backoff_base_secs must be > 0"));
    }

    Ok(())
}

/// Example YAML configuration, also used as a test fixture.
pub fn example() -> &'static str {
    r#"app:
  data_dir: "./data"
  tick_interval_secs: 3600
  worker_concurrency: 4
  bind_addr: "0.0.0.0:8000"
  cron_key: "CHANGE_ME"

telegram:
  bot_token: "YOUR_TELEGRAM_BOT_TOKEN"
  send_interval_ms: 1050

youtube:
  api_key: "YOUR_YOUTUBE_API_KEY"
  request_interval_ms: 250

digest:
  max_videos_per_digest: 10
  first_check_lookback_days: 7
  fetch_max_attempts: 3
  delivery_max_attempts: 3
  backoff_base_secs: 5
  backoff_cap_secs: 3600
"#
}
