//! Engine configuration
//!
//! Loaded from TOML; every field has a default so an empty file is valid.

use crate::error::LimsError;
use crate::types::DeviationType;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Logging configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// `EnvFilter` directive used when `RUST_LOG` is unset
    pub filter: String,
    /// Emit JSON lines instead of human-readable output
    pub json: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            filter: "info".to_string(),
            json: false,
        }
    }
}

/// Engine configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Upper bound on one credential re-verification call
    pub credential_timeout_ms: u64,
    /// Minimum length of a retest reason
    pub min_retest_reason_len: usize,
    /// Deviation recorded for an OOS result when none is given
    pub default_deviation: DeviationType,
    /// Buffer of the broadcast notifier
    pub notification_capacity: usize,
    /// Logging setup
    pub log: LogConfig,
}

impl EngineConfig {
    /// Create default configuration
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// With credential timeout
    #[inline]
    #[must_use]
    pub fn with_credential_timeout(mut self, timeout: Duration) -> Self {
        self.credential_timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);
        self
    }

    /// With minimum retest reason length
    #[inline]
    #[must_use]
    pub fn with_min_retest_reason_len(mut self, len: usize) -> Self {
        self.min_retest_reason_len = len;
        self
    }

    /// With default deviation classification
    #[inline]
    #[must_use]
    pub fn with_default_deviation(mut self, deviation: DeviationType) -> Self {
        self.default_deviation = deviation;
        self
    }

    /// With log configuration
    #[inline]
    #[must_use]
    pub fn with_log(mut self, log: LogConfig) -> Self {
        self.log = log;
        self
    }

    /// Credential timeout as a `Duration`
    #[inline]
    #[must_use]
    pub fn credential_timeout(&self) -> Duration {
        Duration::from_millis(self.credential_timeout_ms)
    }

    /// Parse from TOML text
    ///
    /// # Errors
    /// [`LimsError::Config`] on malformed input.
    pub fn from_toml_str(input: &str) -> Result<Self, LimsError> {
        toml::from_str(input).map_err(|e| LimsError::Config(e.to_string()))
    }

    /// Load from a TOML file
    ///
    /// # Errors
    /// [`LimsError::Config`] when the file cannot be read or parsed.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, LimsError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| LimsError::Config(format!("{}: {e}", path.display())))?;
        Self::from_toml_str(&text)
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            credential_timeout_ms: 5_000,
            min_retest_reason_len: 5,
            default_deviation: DeviationType::RealOos,
            notification_capacity: 64,
            log: LogConfig::default(),
        }
    }
}
