//! Configuration validation
//!
//! Rejects values the pipeline cannot run with:
//! - Zero intervals and zero size limits
//! - Stream names and extensions that cannot be part of a file name

use crate::Config;
use crate::error::{ConfigError, Result};
use crate::output::OutputConfig;

/// Validate the entire configuration
pub fn validate_config(config: &Config) -> Result<()> {
    validate_output(&config.output)
}

/// Validate the `[output]` section
pub fn validate_output(output: &OutputConfig) -> Result<()> {
    if output.path.is_empty() {
        return Err(ConfigError::invalid_value("output", "path", "must not be empty"));
    }

    if output.rotation_interval.is_zero() {
        return Err(ConfigError::invalid_value(
            "output",
            "rotation_interval",
            "must be greater than zero",
        ));
    }

    if output.flush_interval.is_zero() {
        return Err(ConfigError::invalid_value(
            "output",
            "flush_interval",
            "must be greater than zero",
        ));
    }

    if output.max_bytes_per_sink == Some(0) {
        return Err(ConfigError::invalid_value(
            "output",
            "max_bytes_per_sink",
            "must be greater than zero (omit it for unbounded files)",
        ));
    }

    if output.high_water_mark == 0 {
        return Err(ConfigError::invalid_value(
            "output",
            "high_water_mark",
            "must be greater than zero",
        ));
    }

    if let Some(stream) = &output.stream {
        validate_stream_name(stream)?;
    }

    if output.extension.is_empty() || output.extension.contains(['.', '/', '\\']) {
        return Err(ConfigError::invalid_value(
            "output",
            "extension",
            format!("'{}' cannot be used as a file extension", output.extension),
        ));
    }

    Ok(())
}

/// Stream names become part of file names
pub fn validate_stream_name(stream: &str) -> Result<()> {
    if stream.is_empty() || stream == "." || stream == ".." || stream.contains(['/', '\\', '\0'])
    {
        return Err(ConfigError::invalid_value(
            "output",
            "stream",
            format!("'{stream}' cannot be used in a file name"),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_defaults_are_valid() {
        assert!(validate_config(&Config::default()).is_ok());
    }

    #[test]
    fn test_zero_rotation_interval() {
        let output = OutputConfig {
            rotation_interval: Duration::ZERO,
            ..Default::default()
        };
        let err = validate_output(&output).unwrap_err();
        assert!(err.to_string().contains("rotation_interval"));
    }

    #[test]
    fn test_zero_max_bytes() {
        let output = OutputConfig {
            max_bytes_per_sink: Some(0),
            ..Default::default()
        };
        assert!(validate_output(&output).is_err());
    }

    #[test]
    fn test_zero_high_water_mark() {
        let output = OutputConfig {
            high_water_mark: 0,
            ..Default::default()
        };
        assert!(validate_output(&output).is_err());
    }

    #[test]
    fn test_stream_names() {
        assert!(validate_stream_name("audit_event").is_ok());
        assert!(validate_stream_name("users.v2").is_ok());
        for bad in ["", ".", "..", "a/b", "a\\b"] {
            assert!(validate_stream_name(bad).is_err(), "{bad:?} accepted");
        }
    }

    #[test]
    fn test_bad_extension() {
        let output = OutputConfig {
            extension: "tar.gz".into(),
            ..Default::default()
        };
        assert!(validate_output(&output).is_err());
    }
}
