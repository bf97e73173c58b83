//! Command line overrides and the mapping from file config to pipeline config

use std::path::PathBuf;
use std::time::Duration;

use clap::Args;
use rowbatch_config::{Config, FinalizeSetting, LogLevel, OutputConfig};
use rowbatch_sinks::{BatchFileConfig, FinalizeMode};

/// Options that override the config file
#[derive(Args, Debug, Default)]
pub struct Overrides {
    /// Stream name (file name prefix and `table` field of every line)
    #[arg(short, long)]
    pub stream: Option<String>,

    /// Output directory
    #[arg(short, long)]
    pub path: Option<PathBuf>,

    /// Rotation interval (e.g. "5s", "1m")
    #[arg(short, long, value_parser = parse_duration)]
    pub interval: Option<Duration>,

    /// Size limit per file in bytes
    #[arg(long)]
    pub max_bytes: Option<u64>,

    /// Action applied to retired files: read_only, none, or octal bits
    #[arg(long)]
    pub finalize: Option<FinalizeMode>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long)]
    pub log_level: Option<LogLevel>,
}

impl Overrides {
    /// Apply every option that was given
    pub fn apply(self, config: &mut Config) {
        if let Some(stream) = self.stream {
            config.output.stream = Some(stream);
        }
        if let Some(path) = self.path {
            config.output.path = path.display().to_string();
        }
        if let Some(interval) = self.interval {
            config.output.rotation_interval = interval;
        }
        if let Some(max) = self.max_bytes {
            config.output.max_bytes_per_sink = Some(max);
        }
        if let Some(mode) = self.finalize {
            config.output.finalize = match mode {
                FinalizeMode::ReadOnly => FinalizeSetting::ReadOnly,
                FinalizeMode::Mode(bits) => FinalizeSetting::Mode(bits),
                FinalizeMode::None => FinalizeSetting::None,
            };
        }
        if let Some(level) = self.log_level {
            config.log.level = level;
        }
    }
}

fn parse_duration(s: &str) -> Result<Duration, String> {
    humantime_serde::re::humantime::parse_duration(s).map_err(|e| e.to_string())
}

/// Build the pipeline configuration from the `[output]` section
pub fn batch_file_config(output: &OutputConfig) -> BatchFileConfig {
    let finalize_mode = match output.finalize {
        FinalizeSetting::ReadOnly => FinalizeMode::ReadOnly,
        FinalizeSetting::Mode(bits) => FinalizeMode::Mode(bits),
        FinalizeSetting::None => FinalizeMode::None,
    };

    let mut config = BatchFileConfig::default()
        .with_path(&output.path)
        .with_rotation_interval(output.rotation_interval)
        .with_finalize_mode(finalize_mode)
        .with_high_water_mark(output.high_water_mark)
        .with_extension(output.extension.clone());
    if let Some(max) = output.max_bytes_per_sink {
        config = config.with_max_bytes_per_sink(max);
    }
    config.flush_interval = output.flush_interval;
    config.max_write_retries = output.max_write_retries;
    config.retry_delay = output.retry_delay;
    config
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn test_no_overrides_keeps_config() {
        let mut config = Config::from_str("[output]\nstream = \"audit\"\npath = \"out\"").unwrap();
        Overrides::default().apply(&mut config);
        assert_eq!(config.output.stream.as_deref(), Some("audit"));
        assert_eq!(config.output.path, "out");
    }

    #[test]
    fn test_overrides_win() {
        let mut config = Config::from_str("[output]\nstream = \"audit\"").unwrap();
        Overrides {
            stream: Some("orders".into()),
            path: Some(PathBuf::from("/tmp/batches")),
            interval: Some(Duration::from_secs(30)),
            max_bytes: Some(4096),
            finalize: Some(FinalizeMode::Mode(0o440)),
            log_level: Some(LogLevel::Debug),
        }
        .apply(&mut config);

        assert_eq!(config.output.stream.as_deref(), Some("orders"));
        assert_eq!(config.output.path, "/tmp/batches");
        assert_eq!(config.output.rotation_interval, Duration::from_secs(30));
        assert_eq!(config.output.max_bytes_per_sink, Some(4096));
        assert_eq!(config.output.finalize, FinalizeSetting::Mode(0o440));
        assert_eq!(config.log.level, LogLevel::Debug);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_batch_file_config_mapping() {
        let config = Config::from_str(
            r#"
[output]
path = "spool"
rotation_interval = "2s"
max_bytes_per_sink = 100
finalize = "none"
high_water_mark = 512
retry_delay = "50ms"
extension = "jsonl"
"#,
        )
        .unwrap();

        let batch = batch_file_config(&config.output);
        assert_eq!(batch.path, PathBuf::from("spool"));
        assert_eq!(batch.rotation_interval, Duration::from_secs(2));
        assert_eq!(batch.max_bytes_per_sink, Some(100));
        assert_eq!(batch.finalize_mode, FinalizeMode::None);
        assert_eq!(batch.high_water_mark, 512);
        assert_eq!(batch.retry_delay, Duration::from_millis(50));
        assert_eq!(batch.extension, "jsonl");
        assert!(batch.validate().is_ok());
    }

    #[test]
    fn test_finalize_spellings_agree_with_command_line() {
        for s in [
            "read_only", "readonly", "read-only", "READ_ONLY", "none", "off", "0440", "0o600",
            "0999", "", "0o", "sometimes",
        ] {
            let from_toml = FinalizeSetting::try_from(s.to_string()).ok();
            let from_cli = FinalizeMode::from_str(s).ok();
            let mut config = Config::default();
            Overrides {
                finalize: from_cli,
                ..Default::default()
            }
            .apply(&mut config);

            assert_eq!(from_toml.is_some(), from_cli.is_some(), "'{s}'");
            if let Some(setting) = from_toml {
                assert_eq!(config.output.finalize, setting, "'{s}'");
            }
        }
    }

    #[test]
    fn test_parse_duration() {
        assert_eq!(parse_duration("1m 30s").unwrap(), Duration::from_secs(90));
        assert!(parse_duration("soon").is_err());
    }
}
