//! Configuration loading and representation.
//!
//! Everything comes from environment variables; unset variables fall back to
//! defaults, malformed ones are an error rather than a silent default.

use std::str::FromStr;
use std::time::Duration;

use crate::ingestion::{
    BackoffStrategy, DEFAULT_HANDLER_TIMEOUT, DEFAULT_READINESS_TIMEOUT, DEFAULT_STALE_AFTER,
    ProcessorConfig, QueueConfig, RetryPolicy, WorkerConfig,
};

const STALE_AFTER_VAR: &str = "INGESTION_STALE_AFTER_SECS";

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("{0} must be set")]
    Missing(&'static str),
    #[error("{name}: cannot parse {value:?} ({reason})")]
    Invalid {
        name: &'static str,
        value: String,
        reason: String,
    },
}

/// Runtime settings of the ingestion queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IngestionConfig {
    pub database_url: Option<String>,
    pub db_max_connections: u32,
    pub max_attempts: u32,
    pub backoff_base: Duration,
    pub backoff_max: Duration,
    pub batch_size: u32,
    pub poll_interval: Duration,
    pub handler_timeout: Duration,
    /// `None` disables stale-claim reclaim.
    pub stale_after: Option<Duration>,
    pub readiness_timeout: Duration,
}

impl Default for IngestionConfig {
    fn default() -> Self {
        let retry = RetryPolicy::default();
        Self {
            database_url: None,
            db_max_connections: 5,
            max_attempts: retry.max_attempts,
            backoff_base: retry.base_delay,
            backoff_max: retry.max_delay,
            batch_size: 25,
            poll_interval: Duration::from_secs(1),
            handler_timeout: DEFAULT_HANDLER_TIMEOUT,
            stale_after: Some(DEFAULT_STALE_AFTER),
            readiness_timeout: DEFAULT_READINESS_TIMEOUT,
        }
    }
}

impl IngestionConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Build from an arbitrary variable source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let get = |name: &'static str| lookup(name).filter(|v| !v.trim().is_empty());

        let millis = |name: &'static str, default: Duration| -> Result<Duration, ConfigError> {
            Ok(parse::<u64>(name, get(name))?.map_or(default, Duration::from_millis))
        };
        let count = |name: &'static str, default: u32| -> Result<u32, ConfigError> {
            Ok(parse::<u32>(name, get(name))?.unwrap_or(default))
        };

        let stale_after = match parse::<u64>(STALE_AFTER_VAR, get(STALE_AFTER_VAR))? {
            Some(0) => None,
            Some(secs) => Some(Duration::from_secs(secs)),
            None => defaults.stale_after,
        };

        let config = Self {
            database_url: get("DATABASE_URL"),
            db_max_connections: count("INGESTION_DB_MAX_CONNECTIONS", defaults.db_max_connections)?,
            max_attempts: count("INGESTION_MAX_ATTEMPTS", defaults.max_attempts)?,
            backoff_base: millis("INGESTION_BACKOFF_BASE_MS", defaults.backoff_base)?,
            backoff_max: millis("INGESTION_BACKOFF_MAX_MS", defaults.backoff_max)?,
            batch_size: count("INGESTION_BATCH_SIZE", defaults.batch_size)?,
            poll_interval: millis("INGESTION_POLL_INTERVAL_MS", defaults.poll_interval)?,
            handler_timeout: millis("INGESTION_HANDLER_TIMEOUT_MS", defaults.handler_timeout)?,
            stale_after,
            readiness_timeout: millis(
                "INGESTION_READINESS_TIMEOUT_MS",
                defaults.readiness_timeout,
            )?,
        };

        config.check()?;
        Ok(config)
    }

    fn check(&self) -> Result<(), ConfigError> {
        for (name, value) in [
            ("INGESTION_MAX_ATTEMPTS", self.max_attempts),
            ("INGESTION_BATCH_SIZE", self.batch_size),
            ("INGESTION_DB_MAX_CONNECTIONS", self.db_max_connections),
        ] {
            if value == 0 {
                return Err(ConfigError::Invalid {
                    name,
                    value: value.to_string(),
                    reason: "must be at least 1".to_string(),
                });
            }
        }
        // A claim is refreshed only when its dispatch starts, so a healthy
        // handler must finish before the claim can look stale.
        if let Some(stale_after) = self.stale_after.filter(|s| *s <= self.handler_timeout) {
            return Err(ConfigError::Invalid {
                name: STALE_AFTER_VAR,
                value: stale_after.as_secs().to_string(),
                reason: format!(
                    "must exceed the handler timeout of {}ms",
                    self.handler_timeout.as_millis()
                ),
            });
        }
        Ok(())
    }

    /// `DATABASE_URL`, or `ConfigError::Missing`.
    pub fn require_database_url(&self) -> Result<&str, ConfigError> {
        self.database_url
            .as_deref()
            .ok_or(ConfigError::Missing("DATABASE_URL"))
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_attempts,
            base_delay: self.backoff_base,
            max_delay: self.backoff_max,
            strategy: BackoffStrategy::Exponential,
        }
    }

    pub fn queue_config(&self) -> QueueConfig {
        QueueConfig {
            processor: ProcessorConfig {
                retry_policy: self.retry_policy(),
                handler_timeout: self.handler_timeout,
                stale_after: self.stale_after,
            },
            readiness_timeout: self.readiness_timeout,
        }
    }

    pub fn worker_config(&self) -> WorkerConfig {
        WorkerConfig::default()
            .with_batch_size(self.batch_size)
            .with_poll_interval(self.poll_interval)
    }
}

fn parse<T>(name: &'static str, raw: Option<String>) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    raw.map(|value| {
        value.trim().parse::<T>().map_err(|e| ConfigError::Invalid {
            name,
            reason: e.to_string(),
            value,
        })
    })
    .transpose()
}
