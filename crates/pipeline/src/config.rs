//! Engine configuration loaded from environment variables.

use std::fmt::Display;
use std::str::FromStr;
use std::time::Duration;

use chunkflow_core::progress::{validate_discard_threshold, DEFAULT_DISCARD_THRESHOLD};
use chunkflow_core::retry::RetryPolicy;
use chunkflow_core::settings::{DEFAULT_PROCESSOR_TIMEOUT_SECS, MAX_PROCESSOR_TIMEOUT_SECS};
use chunkflow_db::CommitRetryConfig;

/// Configuration errors. Raised at start-up only.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable {0}")]
    Missing(&'static str),

    #[error("Invalid value {value:?} for {key}: {reason}")]
    Invalid {
        key: &'static str,
        value: String,
        reason: String,
    },
}

/// Parse `key` from `lookup`, falling back to `default` when unset.
pub fn parse_or<T>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &'static str,
    default: T,
) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: Display,
{
    match lookup(key) {
        Some(raw) => raw.trim().parse().map_err(|e: T::Err| ConfigError::Invalid {
            key,
            value: raw.clone(),
            reason: e.to_string(),
        }),
        None => Ok(default),
    }
}

/// Read a required variable from `lookup`.
pub fn required(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &'static str,
) -> Result<String, ConfigError> {
    lookup(key)
        .filter(|v| !v.trim().is_empty())
        .ok_or(ConfigError::Missing(key))
}

/// Process environment lookup.
pub fn env_lookup(key: &str) -> Option<String> {
    std::env::var(key).ok()
}

/// Tunables shared by the coordinator, executor, and worker pool.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub retry: RetryPolicy,
    /// Failed fraction above which a job is aborted.
    pub discard_threshold: f64,
    /// Concurrent claim loops per process.
    pub worker_count: usize,
    /// Idle sleep between empty claims.
    pub poll_interval: Duration,
    /// Visibility lease on a claimed chunk.
    pub lease: Duration,
    /// Period of the retry/lease maintenance sweep.
    pub maintenance_interval: Duration,
    pub chunk_chars: usize,
    pub chunk_overlap_chars: usize,
    /// Default processor timeout for submissions that do not set one.
    pub processor_timeout: Duration,
    pub commit: CommitRetryConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            discard_threshold: DEFAULT_DISCARD_THRESHOLD,
            worker_count: 4,
            poll_interval: Duration::from_millis(500),
            lease: Duration::from_secs(300),
            maintenance_interval: Duration::from_millis(1000),
            chunk_chars: 4000,
            chunk_overlap_chars: 200,
            processor_timeout: Duration::from_secs(DEFAULT_PROCESSOR_TIMEOUT_SECS),
            commit: CommitRetryConfig::default(),
        }
    }
}

impl EngineConfig {
    /// Load configuration from environment variables with defaults.
    ///
    /// | Env Var                    | Default |
    /// |----------------------------|---------|
    /// | `RETRY_MAX_ATTEMPTS`       | `3`     |
    /// | `RETRY_BASE_DELAY_MS`      | `1000`  |
    /// | `RETRY_MAX_DELAY_MS`       | `30000` |
    /// | `RETRY_JITTER_RATIO`       | `0.2`   |
    /// | `DISCARD_THRESHOLD`        | `0.5`   |
    /// | `WORKER_COUNT`             | `4`     |
    /// | `POLL_INTERVAL_MS`         | `500`   |
    /// | `LEASE_SECS`               | `300`   |
    /// | `MAINTENANCE_INTERVAL_MS`  | `1000`  |
    /// | `CHUNK_CHARS`              | `4000`  |
    /// | `CHUNK_OVERLAP_CHARS`      | `200`   |
    /// | `PROCESSOR_TIMEOUT_SECS`   | `120`   |
    /// | `COMMIT_IMMEDIATE_RETRIES` | `2`     |
    /// | `COMMIT_BACKOFF_RETRIES`   | `2`     |
    /// | `COMMIT_BACKOFF_MS`        | `250`   |
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(env_lookup)
    }

    /// Same as [`from_env`](Self::from_env) with an injectable lookup.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let defaults = Self::default();
        let lookup = &lookup;

        let retry = RetryPolicy {
            max_attempts: parse_or(lookup, "RETRY_MAX_ATTEMPTS", defaults.retry.max_attempts)?,
            base_delay: Duration::from_millis(parse_or(
                lookup,
                "RETRY_BASE_DELAY_MS",
                defaults.retry.base_delay.as_millis() as u64,
            )?),
            max_delay: Duration::from_millis(parse_or(
                lookup,
                "RETRY_MAX_DELAY_MS",
                defaults.retry.max_delay.as_millis() as u64,
            )?),
            jitter_ratio: parse_or(lookup, "RETRY_JITTER_RATIO", defaults.retry.jitter_ratio)?,
        };

        let commit = CommitRetryConfig {
            immediate_retries: parse_or(
                lookup,
                "COMMIT_IMMEDIATE_RETRIES",
                defaults.commit.immediate_retries,
            )?,
            backoff_retries: parse_or(lookup, "COMMIT_BACKOFF_RETRIES", defaults.commit.backoff_retries)?,
            backoff: Duration::from_millis(parse_or(
                lookup,
                "COMMIT_BACKOFF_MS",
                defaults.commit.backoff.as_millis() as u64,
            )?),
        };

        let config = Self {
            retry,
            discard_threshold: parse_or(lookup, "DISCARD_THRESHOLD", defaults.discard_threshold)?,
            worker_count: parse_or(lookup, "WORKER_COUNT", defaults.worker_count)?,
            poll_interval: Duration::from_millis(parse_or(
                lookup,
                "POLL_INTERVAL_MS",
                defaults.poll_interval.as_millis() as u64,
            )?),
            lease: Duration::from_secs(parse_or(lookup, "LEASE_SECS", defaults.lease.as_secs())?),
            maintenance_interval: Duration::from_millis(parse_or(
                lookup,
                "MAINTENANCE_INTERVAL_MS",
                defaults.maintenance_interval.as_millis() as u64,
            )?),
            chunk_chars: parse_or(lookup, "CHUNK_CHARS", defaults.chunk_chars)?,
            chunk_overlap_chars: parse_or(lookup, "CHUNK_OVERLAP_CHARS", defaults.chunk_overlap_chars)?,
            processor_timeout: Duration::from_secs(parse_or(
                lookup,
                "PROCESSOR_TIMEOUT_SECS",
                defaults.processor_timeout.as_secs(),
            )?),
            commit,
        };
        config.validate()?;
        Ok(config)
    }

    /// Reject combinations the engine cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.retry.validate().map_err(|e| invalid("RETRY_*", "", e))?;
        validate_discard_threshold(self.discard_threshold)
            .map_err(|e| invalid("DISCARD_THRESHOLD", self.discard_threshold, e))?;
        if self.worker_count == 0 {
            return Err(invalid("WORKER_COUNT", 0, "must be at least 1"));
        }
        if self.chunk_chars == 0 {
            return Err(invalid("CHUNK_CHARS", 0, "must be at least 1"));
        }
        if self.chunk_overlap_chars * 2 >= self.chunk_chars {
            return Err(invalid(
                "CHUNK_OVERLAP_CHARS",
                self.chunk_overlap_chars,
                "must be less than half of CHUNK_CHARS",
            ));
        }
        let timeout_secs = self.processor_timeout.as_secs();
        if timeout_secs == 0 || timeout_secs > MAX_PROCESSOR_TIMEOUT_SECS {
            return Err(invalid(
                "PROCESSOR_TIMEOUT_SECS",
                timeout_secs,
                format!("must be within 1..={MAX_PROCESSOR_TIMEOUT_SECS}"),
            ));
        }
        if self.lease <= self.processor_timeout {
            return Err(invalid(
                "LEASE_SECS",
                self.lease.as_secs(),
                "must be longer than PROCESSOR_TIMEOUT_SECS",
            ));
        }
        Ok(())
    }
}

fn invalid(key: &'static str, value: impl Display, reason: impl Display) -> ConfigError {
    ConfigError::Invalid {
        key,
        value: value.to_string(),
        reason: reason.to_string(),
    }
}
