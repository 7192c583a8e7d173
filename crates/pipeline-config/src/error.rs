//! Configuration errors.

use std::path::PathBuf;
use thiserror::Error;

/// Configuration error
#[derive(Debug, Error)]
pub enum ConfigError {
    /// File could not be read
    #[error("Failed to read config file {path}: {source}")]
    Io {
        /// Path that was read
        path: PathBuf,
        /// Underlying error
        #[source]
        source: std::io::Error,
    },

    /// File content could not be parsed
    #[error("Failed to parse {format} configuration: {message}")]
    Parse {
        /// Format that was attempted
        format: &'static str,
        /// Parser message
        message: String,
    },

    /// Unsupported file extension
    #[error("Unsupported config format: {0}")]
    UnsupportedFormat(String),

    /// An environment override held an unusable value
    #[error("Invalid value for {key}: {message}")]
    Env {
        /// Variable name
        key: String,
        /// What was wrong
        message: String,
    },

    /// Semantic validation failed
    #[error("Invalid configuration: {}", .0.join("; "))]
    Invalid(Vec<String>),
}

/// Result alias for configuration operations
pub type ConfigResult<T> = Result<T, ConfigError>;
