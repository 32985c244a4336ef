//! Per-job execution settings handed to the chunk processor.
//!
//! Settings are serialized onto the job row at submission time and read
//! back by whichever worker claims a chunk, so a processor never consults
//! process-wide state for configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::CoreError;

/// Default processor timeout when a submission does not specify one.
pub const DEFAULT_PROCESSOR_TIMEOUT_SECS: u64 = 120;

/// Longest processor timeout a submission may ask for.
pub const MAX_PROCESSOR_TIMEOUT_SECS: u64 = 3600;

/// Configuration needed to process one chunk of a job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionSettings {
    /// Upper bound on a single processor invocation.
    #[serde(default = "default_timeout_ms")]
    pub processor_timeout_ms: u64,

    /// Opaque processor parameters (model, language, instructions, ...).
    #[serde(default)]
    pub params: serde_json::Map<String, serde_json::Value>,
}

fn default_timeout_ms() -> u64 {
    DEFAULT_PROCESSOR_TIMEOUT_SECS * 1000
}

impl Default for ExecutionSettings {
    fn default() -> Self {
        Self {
            processor_timeout_ms: default_timeout_ms(),
            params: serde_json::Map::new(),
        }
    }
}

impl ExecutionSettings {
    /// Settings with the given timeout and no parameters.
    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            processor_timeout_ms: timeout.as_millis() as u64,
            params: serde_json::Map::new(),
        }
    }

    /// Attach one opaque parameter.
    pub fn with_param(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.params.insert(key.into(), value);
        self
    }

    pub fn processor_timeout(&self) -> Duration {
        Duration::from_millis(self.processor_timeout_ms)
    }

    /// Look up a string parameter.
    pub fn param_str(&self, key: &str) -> Option<&str> {
        self.params.get(key).and_then(|v| v.as_str())
    }

    pub fn validate(&self) -> Result<(), CoreError> {
        if self.processor_timeout_ms == 0 {
            return Err(CoreError::Validation(
                "processor_timeout_ms must be greater than zero".to_string(),
            ));
        }
        if self.processor_timeout_ms > MAX_PROCESSOR_TIMEOUT_SECS * 1000 {
            return Err(CoreError::Validation(format!(
                "processor_timeout_ms must not exceed {} seconds",
                MAX_PROCESSOR_TIMEOUT_SECS
            )));
        }
        Ok(())
    }

    /// Serialize for storage on the job row.
    pub fn to_value(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or_else(|_| serde_json::Value::Object(Default::default()))
    }

    /// Decode settings stored on a job row.
    pub fn from_value(value: &serde_json::Value) -> Result<Self, CoreError> {
        serde_json::from_value(value.clone())
            .map_err(|source| CoreError::UnreadableStored { column: "execution settings", source })
    }
}
