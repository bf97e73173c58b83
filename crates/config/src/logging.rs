//! Logging configuration
//!
//! Controls the diagnostic output of rowbatch. Records never go to the log;
//! stdout is left free, so logs default to stderr.

use std::fmt;
use std::str::FromStr;

use serde::Deserialize;

/// Log level
#[derive(Debug, Clone, Copy, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    /// Very verbose
    Trace,
    /// Per-file details
    Debug,
    /// Lifecycle and rotations (default)
    #[default]
    Info,
    /// Failures that the pipeline recovers from
    Warn,
    /// Errors only
    Error,
}

impl LogLevel {
    /// Convert to tracing level filter string
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Trace => "trace",
            Self::Debug => "debug",
            Self::Info => "info",
            Self::Warn => "warn",
            Self::Error => "error",
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LogLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "trace" => Ok(Self::Trace),
            "debug" => Ok(Self::Debug),
            "info" => Ok(Self::Info),
            "warn" | "warning" => Ok(Self::Warn),
            "error" => Ok(Self::Error),
            other => Err(format!("unknown log level '{other}'")),
        }
    }
}

/// Log output format
#[derive(Debug, Clone, Copy, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Human-readable console output (default)
    #[default]
    Console,
    /// JSON structured logging
    Json,
}

/// Log output destination
#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogOutput {
    /// Write to stdout
    Stdout,
    /// Write to stderr (default)
    #[default]
    Stderr,
    /// Append to a file
    #[serde(untagged)]
    File(String),
}

/// Logging configuration
///
/// # Example
///
/// ```toml
/// [log]
/// level = "debug"
/// format = "json"
/// output = "/var/log/rowbatch.log"
/// ```
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Log level (trace, debug, info, warn, error)
    /// Default: info
    pub level: LogLevel,

    /// Output format (console, json)
    /// Default: console
    pub format: LogFormat,

    /// Output destination (stdout, stderr, or file path)
    /// Default: stderr
    pub output: LogOutput,
}
