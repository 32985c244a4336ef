use chunkflow_db::DEFAULT_MAX_CONNECTIONS;
use chunkflow_pipeline::config::{env_lookup, parse_or, required};
use chunkflow_pipeline::{ConfigError, EngineConfig};
use chunkflow_worker::ProcessorConfig;

/// Server configuration loaded from environment variables.
///
/// All fields except `DATABASE_URL` have defaults suitable for local
/// development.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Bind address (default: `0.0.0.0`).
    pub host: String,
    /// Bind port (default: `3000`).
    pub port: u16,
    /// Allowed CORS origins, parsed from comma-separated `CORS_ORIGINS`.
    pub cors_origins: Vec<String>,
    /// HTTP request timeout in seconds (default: `30`).
    pub request_timeout_secs: u64,
    /// How long to wait for background tasks on shutdown (default: `30`).
    pub shutdown_timeout_secs: u64,
    pub database_url: String,
    pub max_connections: u32,
    /// Run a worker pool inside the API process. Requires `PROCESSOR_URL`.
    pub embedded_workers: bool,
    pub processor: Option<ProcessorConfig>,
    pub engine: EngineConfig,
}

impl ServerConfig {
    /// Load configuration from environment variables with defaults.
    ///
    /// | Env Var                 | Default                 |
    /// |-------------------------|-------------------------|
    /// | `HOST`                  | `0.0.0.0`               |
    /// | `PORT`                  | `3000`                  |
    /// | `CORS_ORIGINS`          | `http://localhost:5173` |
    /// | `REQUEST_TIMEOUT_SECS`  | `30`                    |
    /// | `SHUTDOWN_TIMEOUT_SECS` | `30`                    |
    /// | `DATABASE_URL`          | (required)              |
    /// | `DB_MAX_CONNECTIONS`    | `20`                    |
    /// | `EMBEDDED_WORKERS`      | `false`                 |
    /// | `PROCESSOR_URL`         | unset                   |
    /// | `PROCESSOR_API_KEY`     | unset                   |
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(env_lookup)
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let lookup = &lookup;

        let cors_origins = lookup("CORS_ORIGINS")
            .unwrap_or_else(|| "http://localhost:5173".into())
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();

        let embedded_workers = parse_or(lookup, "EMBEDDED_WORKERS", false)?;
        let processor = match lookup("PROCESSOR_URL").filter(|u| !u.trim().is_empty()) {
            Some(url) => Some(ProcessorConfig {
                url,
                api_key: lookup("PROCESSOR_API_KEY").filter(|k| !k.trim().is_empty()),
            }),
            None if embedded_workers => return Err(ConfigError::Missing("PROCESSOR_URL")),
            None => None,
        };

        Ok(Self {
            host: lookup("HOST").unwrap_or_else(|| "0.0.0.0".into()),
            port: parse_or(lookup, "PORT", 3000)?,
            cors_origins,
            request_timeout_secs: parse_or(lookup, "REQUEST_TIMEOUT_SECS", 30)?,
            shutdown_timeout_secs: parse_or(lookup, "SHUTDOWN_TIMEOUT_SECS", 30)?,
            database_url: required(lookup, "DATABASE_URL")?,
            max_connections: parse_or(lookup, "DB_MAX_CONNECTIONS", DEFAULT_MAX_CONNECTIONS)?,
            embedded_workers,
            processor,
            engine: EngineConfig::from_lookup(lookup)?,
        })
    }
}
