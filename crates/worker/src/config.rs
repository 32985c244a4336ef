use chunkflow_db::DEFAULT_MAX_CONNECTIONS;
use chunkflow_pipeline::config::{env_lookup, parse_or, required};
use chunkflow_pipeline::{ConfigError, EngineConfig};

use crate::processor::ProcessorConfig;

/// Worker process configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub database_url: String,
    pub max_connections: u32,
    pub processor: ProcessorConfig,
    pub engine: EngineConfig,
}

impl WorkerConfig {
    /// Load configuration from environment variables.
    ///
    /// | Env Var              | Default    |
    /// |----------------------|------------|
    /// | `DATABASE_URL`       | (required) |
    /// | `DB_MAX_CONNECTIONS` | `20`       |
    /// | `PROCESSOR_URL`      | (required) |
    /// | `PROCESSOR_API_KEY`  | unset      |
    ///
    /// Engine tunables are documented on [`EngineConfig::from_env`].
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(env_lookup)
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let lookup = &lookup;
        Ok(Self {
            database_url: required(lookup, "DATABASE_URL")?,
            max_connections: parse_or(lookup, "DB_MAX_CONNECTIONS", DEFAULT_MAX_CONNECTIONS)?,
            processor: ProcessorConfig {
                url: required(lookup, "PROCESSOR_URL")?,
                api_key: lookup("PROCESSOR_API_KEY").filter(|k| !k.trim().is_empty()),
            },
            engine: EngineConfig::from_lookup(lookup)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use assert_matches::assert_matches;

    use super::*;

    fn lookup(vars: &[(&'static str, &'static str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<&str, &str> = vars.iter().copied().collect();
        move |key| map.get(key).map(|v| v.to_string())
    }

    #[test]
    fn loads_required_and_optional_values() {
        let config = WorkerConfig::from_lookup(lookup(&[
            ("DATABASE_URL", "postgres://localhost/chunkflow"),
            ("PROCESSOR_URL", "http://normalizer:8080/v1/normalize"),
            ("PROCESSOR_API_KEY", ""),
            ("WORKER_COUNT", "2"),
        ]))
        .unwrap();
        assert_eq!(config.max_connections, DEFAULT_MAX_CONNECTIONS);
        assert_eq!(config.processor.api_key, None);
        assert_eq!(config.engine.worker_count, 2);
    }

    #[test]
    fn missing_processor_url_is_reported() {
        let err = WorkerConfig::from_lookup(lookup(&[("DATABASE_URL", "postgres://x")])).unwrap_err();
        assert_matches!(err, ConfigError::Missing("PROCESSOR_URL"));
    }
}
