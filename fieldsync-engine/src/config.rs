use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::outbox::{Backoff, DEFAULT_MAX_ATTEMPTS, RetryPolicy};

const DEFAULT_SYNC_INTERVAL_SECS: u64 = 30;
const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 30;
const DEFAULT_BACKOFF_BASE_MS: u64 = 500;
const DEFAULT_BACKOFF_MAX_MS: u64 = 4_000;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{0} is not set")]
    Missing(&'static str),
    #[error("XDG data directory is unavailable")]
    MissingDataDir,
}

#[derive(Clone, Debug)]
pub struct EngineConfig {
    pub api_base_url: String,
    pub api_token: Option<String>,
    pub database_path: PathBuf,
    pub sync_interval: Duration,
    pub request_timeout: Duration,
    pub retry: RetryPolicy,
}

impl EngineConfig {
    pub fn new(api_base_url: impl Into<String>, database_path: PathBuf) -> Self {
        Self {
            api_base_url: api_base_url.into(),
            api_token: None,
            database_path,
            sync_interval: Duration::from_secs(DEFAULT_SYNC_INTERVAL_SECS),
            request_timeout: Duration::from_secs(DEFAULT_REQUEST_TIMEOUT_SECS),
            retry: RetryPolicy::default(),
        }
    }

    pub fn from_env() -> Result<Self, ConfigError> {
        let api_base_url = std::env::var("FIELDSYNC_API_URL")
            .ok()
            .filter(|value| !value.trim().is_empty())
            .ok_or(ConfigError::Missing("FIELDSYNC_API_URL"))?;
        let api_token = std::env::var("FIELDSYNC_API_TOKEN")
            .ok()
            .filter(|value| !value.trim().is_empty());
        let database_path = match std::env::var("FIELDSYNC_DB_PATH") {
            Ok(value) if !value.trim().is_empty() => PathBuf::from(value),
            _ => default_db_path()?,
        };
        let sync_interval = Duration::from_secs(read_u64_env(
            "FIELDSYNC_SYNC_INTERVAL_SECS",
            DEFAULT_SYNC_INTERVAL_SECS,
        ));
        let request_timeout = Duration::from_secs(read_u64_env(
            "FIELDSYNC_REQUEST_TIMEOUT_SECS",
            DEFAULT_REQUEST_TIMEOUT_SECS,
        ));
        let max_attempts = u32::try_from(read_u64_env(
            "FIELDSYNC_MAX_ATTEMPTS",
            u64::from(DEFAULT_MAX_ATTEMPTS),
        ))
        .unwrap_or(DEFAULT_MAX_ATTEMPTS);
        let backoff = read_bool_env("FIELDSYNC_BACKOFF", true).then(|| {
            Backoff::new(
                Duration::from_millis(read_u64_env(
                    "FIELDSYNC_BACKOFF_BASE_MS",
                    DEFAULT_BACKOFF_BASE_MS,
                )),
                Duration::from_millis(read_u64_env(
                    "FIELDSYNC_BACKOFF_MAX_MS",
                    DEFAULT_BACKOFF_MAX_MS,
                )),
                true,
            )
        });

        Ok(Self {
            api_base_url,
            api_token,
            database_path,
            sync_interval,
            request_timeout,
            retry: RetryPolicy {
                max_attempts,
                backoff,
            },
        })
    }
}

fn default_db_path() -> Result<PathBuf, ConfigError> {
    let mut path = dirs::data_dir().ok_or(ConfigError::MissingDataDir)?;
    path.push("fieldsync");
    path.push("store.db");
    Ok(path)
}

fn read_u64_env(name: &str, default: u64) -> u64 {
    std::env::var(name)
        .ok()
        .and_then(|value| value.trim().parse::<u64>().ok())
        .filter(|value| *value > 0)
        .unwrap_or(default)
}

fn read_bool_env(name: &str, default: bool) -> bool {
    std::env::var(name)
        .ok()
        .map(|value| match value.trim().to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => true,
            "0" | "false" | "no" | "off" => false,
            _ => default,
        })
        .unwrap_or(default)
}
