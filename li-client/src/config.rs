//! # Lookup Configuration
//!
//! Purpose: Collect the knobs shared by the sync and async engines in one
//! serde-friendly struct.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use li_common::{DEFAULT_SERVICE_NAME, MAX_INLINE_DATA, MAX_LOOKUP_ATTEMPTS};

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid config json: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("invalid config: {0}")]
    Invalid(&'static str),
}

/// Configuration for the lookup engines.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LookupConfig {
    /// Name the directory service endpoint is registered under.
    pub service_name: String,
    /// Total attempts per call, first send included.
    pub max_attempts: u32,
    /// Requests above this size go out-of-line (sync) or are refused (async).
    pub max_inline_request: usize,
    /// Only replies from this uid are trusted.
    pub trusted_uid: u32,
}

impl Default for LookupConfig {
    fn default() -> Self {
        LookupConfig {
            service_name: DEFAULT_SERVICE_NAME.to_string(),
            max_attempts: MAX_LOOKUP_ATTEMPTS,
            max_inline_request: MAX_INLINE_DATA,
            trusted_uid: 0,
        }
    }
}

impl LookupConfig {
    /// Parses a JSON document; missing fields keep their defaults.
    pub fn from_json(text: &str) -> Result<Self, ConfigError> {
        let config: LookupConfig = serde_json::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_attempts == 0 {
            return Err(ConfigError::Invalid("max_attempts must be at least 1"));
        }
        if self.max_inline_request == 0 {
            return Err(ConfigError::Invalid("max_inline_request must be positive"));
        }
        if self.service_name.is_empty() {
            return Err(ConfigError::Invalid("service_name must not be empty"));
        }
        Ok(())
    }
}
