//! Batch file output configuration

use std::fmt;
use std::time::Duration;

use serde::Deserialize;

/// Action applied to a batch file once it is retired
///
/// Written as `"read_only"`, `"none"`, or octal permission bits such as
/// `"0440"`.
#[derive(Debug, Clone, Copy, Default, Deserialize, PartialEq, Eq)]
#[serde(try_from = "String")]
pub enum FinalizeSetting {
    /// Mode 0444 (default)
    #[default]
    ReadOnly,
    /// Explicit permission bits
    Mode(u32),
    /// Leave the file as is
    None,
}

impl TryFrom<String> for FinalizeSetting {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        match value.trim().to_lowercase().as_str() {
            "read_only" | "readonly" | "read-only" => Ok(Self::ReadOnly),
            "none" | "off" => Ok(Self::None),
            other => {
                let digits = other.strip_prefix("0o").unwrap_or(other);
                match u32::from_str_radix(digits, 8) {
                    Ok(mode) if !digits.is_empty() && mode <= 0o7777 => Ok(Self::Mode(mode)),
                    _ => Err(format!(
                        "invalid finalize '{value}': expected \"read_only\", \"none\" or octal bits"
                    )),
                }
            }
        }
    }
}

impl fmt::Display for FinalizeSetting {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ReadOnly => f.write_str("read_only"),
            Self::Mode(mode) => write!(f, "{mode:04o}"),
            Self::None => f.write_str("none"),
        }
    }
}

/// Where and how batch files are written
///
/// # Example
///
/// ```toml
/// [output]
/// path = "/var/spool/rowbatch"
/// stream = "audit_event"
/// rotation_interval = "30s"
/// max_bytes_per_sink = 67108864
/// finalize = "0440"
/// ```
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct OutputConfig {
    /// Output directory, created if missing
    /// Default: "."
    pub path: String,

    /// Stream name used in file names and in every line's `table` field
    /// Default: none (must be given here or on the command line)
    pub stream: Option<String>,

    /// Time between rotations
    /// Default: 5s
    #[serde(with = "humantime_serde")]
    pub rotation_interval: Duration,

    /// Size limit per file in bytes
    /// Default: unbounded
    pub max_bytes_per_sink: Option<u64>,

    /// Action applied to retired files
    /// Default: read_only
    pub finalize: FinalizeSetting,

    /// Backlog bytes at which a file reports backpressure
    /// Default: 16KB
    pub high_water_mark: usize,

    /// Periodic flush interval for open files
    /// Default: 100ms
    #[serde(with = "humantime_serde")]
    pub flush_interval: Duration,

    /// Attempts per write before a file is declared failed
    /// Default: 3
    pub max_write_retries: usize,

    /// Delay between write attempts
    /// Default: 10ms
    #[serde(with = "humantime_serde")]
    pub retry_delay: Duration,

    /// File extension (without the dot)
    /// Default: "data"
    pub extension: String,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            path: ".".into(),
            stream: None,
            rotation_interval: Duration::from_secs(5),
            max_bytes_per_sink: None,
            finalize: FinalizeSetting::ReadOnly,
            high_water_mark: 16 * 1024,
            flush_interval: Duration::from_millis(100),
            max_write_retries: 3,
            retry_delay: Duration::from_millis(10),
            extension: "data".into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = OutputConfig::default();
        assert_eq!(config.path, ".");
        assert_eq!(config.stream, None);
        assert_eq!(config.rotation_interval, Duration::from_secs(5));
        assert_eq!(config.max_bytes_per_sink, None);
        assert_eq!(config.finalize, FinalizeSetting::ReadOnly);
        assert_eq!(config.high_water_mark, 16384);
        assert_eq!(config.extension, "data");
    }

    #[test]
    fn test_deserialize_full() {
        let toml = r#"
path = "/var/spool/rowbatch"
stream = "audit_event"
rotation_interval = "1m 30s"
max_bytes_per_sink = 1048576
finalize = "0440"
high_water_mark = 4096
flush_interval = "250ms"
"#;
        let config: OutputConfig = toml::from_str(toml).unwrap();
        assert_eq!(config.path, "/var/spool/rowbatch");
        assert_eq!(config.stream.as_deref(), Some("audit_event"));
        assert_eq!(config.rotation_interval, Duration::from_secs(90));
        assert_eq!(config.max_bytes_per_sink, Some(1_048_576));
        assert_eq!(config.finalize, FinalizeSetting::Mode(0o440));
        assert_eq!(config.high_water_mark, 4096);
        assert_eq!(config.flush_interval, Duration::from_millis(250));
        assert_eq!(config.max_write_retries, 3);
    }

    #[test]
    fn test_finalize_values() {
        for (s, expected) in [
            ("read_only", FinalizeSetting::ReadOnly),
            ("read-only", FinalizeSetting::ReadOnly),
            ("READ_ONLY", FinalizeSetting::ReadOnly),
            ("readonly", FinalizeSetting::ReadOnly),
            ("none", FinalizeSetting::None),
            ("off", FinalizeSetting::None),
            (" None ", FinalizeSetting::None),
            ("0600", FinalizeSetting::Mode(0o600)),
            ("0o444", FinalizeSetting::Mode(0o444)),
            ("0O440", FinalizeSetting::Mode(0o440)),
        ] {
            let config: OutputConfig = toml::from_str(&format!("finalize = \"{s}\"")).unwrap();
            assert_eq!(config.finalize, expected);
        }
    }

    #[test]
    fn test_finalize_invalid() {
        assert!(toml::from_str::<OutputConfig>("finalize = \"0999\"").is_err());
        assert!(toml::from_str::<OutputConfig>("finalize = \"sometimes\"").is_err());
        assert!(toml::from_str::<OutputConfig>("finalize = \"\"").is_err());
        assert!(toml::from_str::<OutputConfig>("finalize = \"0o\"").is_err());
        assert!(toml::from_str::<OutputConfig>("finalize = \"17777\"").is_err());
    }

    #[test]
    fn test_finalize_display() {
        assert_eq!(FinalizeSetting::Mode(0o440).to_string(), "0440");
        assert_eq!(FinalizeSetting::ReadOnly.to_string(), "read_only");
    }

    #[test]
    fn test_invalid_duration() {
        assert!(toml::from_str::<OutputConfig>("rotation_interval = \"soon\"").is_err());
    }
}
