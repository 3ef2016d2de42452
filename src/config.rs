use std::fs;
use std::io::{BufRead, BufReader};
use std::path::Path;
use std::time::Duration;

use thiserror::Error;
use tracing::{info, warn};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing required environment variable {0}")]
    Missing(&'static str),
    #[error("invalid value for {name}: {value}")]
    Invalid { name: &'static str, value: String },
}

/// Engine-wide configuration, loaded once at startup from `POLLER_*`
/// environment variables. Required variables missing or malformed here are
/// a fatal startup error — nothing downstream is given a chance to run with
/// a half-valid configuration.
#[derive(Debug, Clone)]
pub struct PollerConfig {
    pub encryption_key: String,
    pub db_path: String,
    pub default_webhook_url: Option<String>,
    pub http_timeout: Duration,
    pub min_interval: Duration,
    pub shutdown_grace: Duration,
    pub cb_failure_threshold: u32,
    pub cb_recovery: Duration,
    pub cb_halfopen_successes: u32,
    pub retry_max_attempts: u32,
    pub reconfig_interval: Duration,
    pub http_pool_size: usize,
}

impl PollerConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let encryption_key = require_env("POLLER_ENCRYPTION_KEY")?;

        Ok(Self {
            encryption_key,
            db_path: optional_env("POLLER_DB_PATH").unwrap_or_else(|| "./poller.db".to_string()),
            default_webhook_url: optional_env("POLLER_DEFAULT_WEBHOOK_URL"),
            http_timeout: Duration::from_secs(parse_u64_env("POLLER_HTTP_TIMEOUT_SECONDS", 30)?),
            min_interval: Duration::from_secs(parse_u64_env("POLLER_MIN_INTERVAL_SECONDS", 5)?),
            shutdown_grace: Duration::from_secs(parse_u64_env(
                "POLLER_SHUTDOWN_GRACE_SECONDS",
                60,
            )?),
            cb_failure_threshold: parse_u32_env("POLLER_CB_FAILURE_THRESHOLD", 5)?,
            cb_recovery: Duration::from_secs(parse_u64_env("POLLER_CB_RECOVERY_SECONDS", 120)?),
            cb_halfopen_successes: parse_u32_env("POLLER_CB_HALFOPEN_SUCCESSES", 2)?,
            retry_max_attempts: parse_u32_env("POLLER_RETRY_MAX_ATTEMPTS", 10)?,
            reconfig_interval: Duration::from_secs(parse_u64_env(
                "POLLER_RECONFIG_INTERVAL_SECONDS",
                60,
            )?),
            http_pool_size: parse_u32_env("POLLER_HTTP_POOL_SIZE", 4)? as usize,
        })
    }
}

fn require_env(name: &'static str) -> Result<String, ConfigError> {
    std::env::var(name)
        .ok()
        .filter(|v| !v.trim().is_empty())
        .ok_or(ConfigError::Missing(name))
}

fn optional_env(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.trim().is_empty())
}

fn parse_u64_env(name: &'static str, default: u64) -> Result<u64, ConfigError> {
    match optional_env(name) {
        None => Ok(default),
        Some(raw) => raw.parse().map_err(|_| ConfigError::Invalid { name, value: raw }),
    }
}

fn parse_u32_env(name: &'static str, default: u32) -> Result<u32, ConfigError> {
    match optional_env(name) {
        None => Ok(default),
        Some(raw) => raw.parse().map_err(|_| ConfigError::Invalid { name, value: raw }),
    }
}

/// Load `key=value` lines from a `.env`-style file into the process
/// environment, for local development convenience. Existing environment
/// variables always win; this only fills gaps. Missing file is not an
/// error — operators running under a real process supervisor won't have one.
pub fn load_env_file(path: &Path) {
    let Ok(file) = fs::File::open(path) else {
        return;
    };

    info!("loading environment from {:?}", path);
    let reader = BufReader::new(file);
    for line in reader.lines() {
        let Ok(line) = line else { continue };
        let line = line.trim();

        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        let Some((key, value)) = line.split_once('=') else {
            continue;
        };
        let key = key.trim();
        let value = value.trim();

        if std::env::var(key).is_err() {
            // SAFETY: called once at startup before any other thread exists.
            unsafe {
                std::env::set_var(key, value);
            }
        } else {
            warn!("{} already set in environment, ignoring .env value", key);
        }
    }
}
