//! Configuration error types

use std::io;
use thiserror::Error;

/// Result type for configuration operations
pub type Result<T> = std::result::Result<T, ConfigError>;

/// Errors that can occur when loading or validating configuration
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Failed to read configuration file
    #[error("failed to read config file '{path}': {source}")]
    IoError {
        /// Path to the file
        path: String,
        /// Underlying IO error
        #[source]
        source: io::Error,
    },

    /// Failed to parse TOML
    #[error("failed to parse config: {0}")]
    ParseError(#[from] toml::de::Error),

    /// Validation error - invalid value
    #[error("[{section}] has invalid {field}: {message}")]
    InvalidValue {
        /// Config section (e.g., "output")
        section: &'static str,
        /// Field name
        field: &'static str,
        /// Error message
        message: String,
    },
}

impl ConfigError {
    /// Create an InvalidValue error
    pub fn invalid_value(
        section: &'static str,
        field: &'static str,
        message: impl Into<String>,
    ) -> Self {
        Self::InvalidValue {
            section,
            field,
            message: message.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_value_error() {
        let err = ConfigError::invalid_value("output", "rotation_interval", "must be greater than zero");
        let msg = err.to_string();
        assert!(msg.contains("[output]"));
        assert!(msg.contains("rotation_interval"));
        assert!(msg.contains("greater than zero"));
    }

    #[test]
    fn test_io_error_names_path() {
        let err = ConfigError::IoError {
            path: "/etc/rowbatch.toml".into(),
            source: io::Error::new(io::ErrorKind::NotFound, "missing"),
        };
        assert!(err.to_string().contains("/etc/rowbatch.toml"));
    }
}
