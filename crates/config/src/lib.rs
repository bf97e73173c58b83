//! Rowbatch Configuration
//!
//! TOML-based configuration loading with sensible defaults.
//! An empty file is a valid config; only specify what you need to change.
//!
//! # Parsing
//!
//! Use the `FromStr` trait to parse configuration:
//!
//! ```
//! use rowbatch_config::Config;
//! use std::str::FromStr;
//!
//! let config = Config::from_str("[output]\nstream = \"audit_event\"").unwrap();
//! assert_eq!(config.output.stream.as_deref(), Some("audit_event"));
//! ```
//!
//! # Example Config
//!
//! ```toml
//! [log]
//! level = "info"
//!
//! [output]
//! path = "/var/spool/rowbatch"
//! stream = "audit_event"
//! rotation_interval = "5s"
//! finalize = "read_only"
//! ```

mod error;
mod logging;
mod output;
mod validation;

use std::fs;
use std::path::Path;
use std::str::FromStr;

pub use error::{ConfigError, Result};
pub use logging::{LogConfig, LogFormat, LogLevel, LogOutput};
pub use output::{FinalizeSetting, OutputConfig};
pub use validation::validate_stream_name;

use serde::Deserialize;

/// Main configuration structure
///
/// All sections are optional with sensible defaults.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Logging configuration
    pub log: LogConfig,

    /// Batch file output
    pub output: OutputConfig,
}

impl Config {
    /// Load configuration from a TOML file
    ///
    /// # Errors
    ///
    /// Returns error if file cannot be read, contains invalid TOML, or holds
    /// values that fail validation.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path).map_err(|e| ConfigError::IoError {
            path: path.display().to_string(),
            source: e,
        })?;

        Self::from_str(&contents)
    }

    /// Parse configuration from a TOML string
    ///
    /// Prefer using the `FromStr` trait implementation.
    fn parse(s: &str) -> Result<Self> {
        let config: Config = toml::from_str(s).map_err(ConfigError::ParseError)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    ///
    /// Call again after overriding fields (e.g. from the command line).
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::InvalidValue` naming the first bad field.
    pub fn validate(&self) -> Result<()> {
        validation::validate_config(self)
    }
}

impl FromStr for Config {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}
