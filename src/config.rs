//! Session configuration.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::crypto::identity::{MAX_KEY_BITS, MIN_KEY_BITS};

/// Default bound for one background receive, in milliseconds.
///
/// This is also how long shutdown may take to reach the receiver thread.
pub const DEFAULT_RECEIVE_TIMEOUT_MS: u64 = 1000;

/// Default bound for waiting on a public-key lookup reply, in milliseconds.
pub const DEFAULT_LOOKUP_TIMEOUT_MS: u64 = 30_000;

/// Default RSA modulus size for new identities.
pub const DEFAULT_RSA_BITS: usize = 2048;

/// Configuration errors.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// The file could not be read.
    #[error("Failed to read config: {0}")]
    Io(#[from] std::io::Error),

    /// The file is not valid JSON for this structure.
    #[error("Failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),

    /// A value is out of range.
    #[error("Invalid config value for {field}: {reason}")]
    Invalid {
        /// Offending field.
        field: &'static str,
        /// What is wrong with it.
        reason: String,
    },
}

/// Configuration for a client session.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct SessionConfig {
    /// Bound for one background receive, in milliseconds.
    pub receive_timeout_ms: u64,

    /// Bound for waiting on a lookup reply, in milliseconds.
    pub lookup_timeout_ms: u64,

    /// RSA modulus size for newly generated identities.
    pub rsa_bits: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            receive_timeout_ms: DEFAULT_RECEIVE_TIMEOUT_MS,
            lookup_timeout_ms: DEFAULT_LOOKUP_TIMEOUT_MS,
            rsa_bits: DEFAULT_RSA_BITS,
        }
    }
}

impl SessionConfig {
    /// Parse and validate a JSON config. Missing fields take defaults.
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Load and validate a JSON config file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let json = std::fs::read_to_string(path)?;
        Self::from_json(&json)
    }

    /// Check every field is usable.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.receive_timeout_ms == 0 {
            return Err(ConfigError::Invalid {
                field: "receive_timeout_ms",
                reason: "must be greater than zero".to_string(),
            });
        }
        if self.lookup_timeout_ms == 0 {
            return Err(ConfigError::Invalid {
                field: "lookup_timeout_ms",
                reason: "must be greater than zero".to_string(),
            });
        }
        let bits = self.rsa_bits as u64;
        if !(MIN_KEY_BITS..=MAX_KEY_BITS).contains(&bits) {
            return Err(ConfigError::Invalid {
                field: "rsa_bits",
                reason: format!("must be between {} and {}", MIN_KEY_BITS, MAX_KEY_BITS),
            });
        }
        Ok(())
    }

    /// Background receive bound.
    pub fn receive_timeout(&self) -> Duration {
        Duration::from_millis(self.receive_timeout_ms)
    }

    /// Lookup reply bound.
    pub fn lookup_timeout(&self) -> Duration {
        Duration::from_millis(self.lookup_timeout_ms)
    }
}
