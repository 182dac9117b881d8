//! Error types for configuration operations.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// Primary error type for configuration operations.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Field contained an invalid value.
    #[error("invalid configuration field")]
    InvalidField {
        /// Section that failed validation.
        section: &'static str,
        /// Field that failed validation.
        field: &'static str,
        /// Offending value when available.
        value: Option<String>,
        /// Machine-readable reason for the failure.
        reason: &'static str,
    },
    /// Environment override could not be parsed.
    #[error("invalid environment override")]
    InvalidEnv {
        /// Variable name.
        name: String,
        /// Raw variable value.
        value: String,
        /// Machine-readable reason for the failure.
        reason: &'static str,
    },
    /// Configuration document was not valid JSON for the schema.
    #[error("failed to parse configuration document")]
    Parse {
        /// Document path.
        path: PathBuf,
        /// Source serde error.
        source: serde_json::Error,
    },
    /// File system operation failed.
    #[error("filesystem operation failed")]
    Io {
        /// Operation identifier.
        operation: &'static str,
        /// Path involved in the failure.
        path: PathBuf,
        /// Source IO error.
        source: io::Error,
    },
}

impl ConfigError {
    /// Field path (`section.field`) for validation failures, if applicable.
    #[must_use]
    pub fn field_path(&self) -> Option<String> {
        match self {
            Self::InvalidField { section, field, .. } => Some(format!("{section}.{field}")),
            _ => None,
        }
    }
}

/// Convenience alias for configuration results.
pub type ConfigResult<T> = Result<T, ConfigError>;
