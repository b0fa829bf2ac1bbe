//! Configuration System
//!
//! Layered configuration: built-in defaults, then the global config file,
//! then workspace config files, then `VOLCAP__*` environment variables.
//! Tests included.

use crate::error::ApiError;
use crate::logging::LoggingConfig;
use serde::{Deserialize, Serialize};

mod facade;
mod merge;
mod sources;

pub use facade::ConfigLoader;

/// Root configuration structure
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolcapConfig {
    /// Capture behavior
    #[serde(default)]
    pub capture: CaptureConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Options consumed by the capture walker
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CaptureConfig {
    /// Streams of at most this many bytes are read into memory while they
    /// are hashed instead of being read back from the volume later. Empty
    /// streams are always held in memory.
    #[serde(default)]
    pub inline_limit: u64,

    /// Bring transcoded names into Unicode NFC
    #[serde(default)]
    pub normalize_names: bool,
}

/// Upper bound for `capture.inline_limit`
pub const MAX_INLINE_LIMIT: u64 = 64 * 1024 * 1024;

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            inline_limit: 0,
            normalize_names: false,
        }
    }
}

impl CaptureConfig {
    pub fn validate(&self) -> Result<(), String> {
        if self.inline_limit > MAX_INLINE_LIMIT {
            return Err(format!(
                "inline_limit {} exceeds the maximum of {} bytes",
                self.inline_limit, MAX_INLINE_LIMIT
            ));
        }
        Ok(())
    }
}

/// Configuration validation errors
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    Capture(String),
    Logging(String),
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ValidationError::Capture(msg) => write!(f, "Capture: {}", msg),
            ValidationError::Logging(msg) => write!(f, "Logging: {}", msg),
        }
    }
}

impl std::error::Error for ValidationError {}

impl VolcapConfig {
    /// Validate the entire configuration
    pub fn validate(&self) -> Result<(), Vec<ValidationError>> {
        let mut errors = Vec::new();

        if let Err(e) = self.capture.validate() {
            errors.push(ValidationError::Capture(e));
        }
        if let Err(e) = self.logging.validate() {
            errors.push(ValidationError::Logging(e));
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }

    /// Validate and fold every problem into one [`ApiError`]
    pub fn validated(self) -> Result<Self, ApiError> {
        self.validate().map_err(|errors| {
            let error_msgs: Vec<String> = errors.iter().map(|e| e.to_string()).collect();
            ApiError::ConfigError(format!(
                "Configuration validation failed:\n{}",
                error_msgs.join("\n")
            ))
        })?;
        Ok(self)
    }

    /// Render as TOML, as `volcap config` prints it
    pub fn to_toml(&self) -> Result<String, ApiError> {
        toml::to_string_pretty(self)
            .map_err(|e| ApiError::ConfigError(format!("Failed to render config: {}", e)))
    }
}
