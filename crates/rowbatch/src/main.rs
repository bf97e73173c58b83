//! rowbatch - Turn a stream of JSON records into rotating batch files
//!
//! Reads one JSON object per line from stdin and writes them to
//! `<path>/<stream>.<millis>.data`, rotating every interval and making
//! retired files read-only.
//!
//! # Usage
//!
//! ```bash
//! producer | rowbatch --stream audit_event --path /var/spool/rowbatch
//! producer | rowbatch --config rowbatch.toml --interval 30s
//! ```

mod settings;

use std::fs::OpenOptions;
use std::path::PathBuf;
use std::sync::Mutex;

use anyhow::{Context, Result};
use clap::Parser;
use rowbatch_config::{Config, LogConfig, LogFormat, LogOutput};
use rowbatch_sinks::{BatchError, BatchEventKind, BatchEventReceiver, BatchFile, BatchFileConfig};
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::task::JoinHandle;
use tracing_subscriber::fmt::writer::BoxMakeWriter;
use tracing_subscriber::{EnvFilter, Layer, fmt, prelude::*};

use settings::Overrides;

/// rowbatch - Turn a stream of JSON records into rotating batch files
#[derive(Parser, Debug)]
#[command(name = "rowbatch")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[command(flatten)]
    overrides: Overrides,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => Config::from_file(path)
            .with_context(|| format!("failed to load {}", path.display()))?,
        None => Config::default(),
    };
    cli.overrides.apply(&mut config);
    config.validate()?;

    init_logging(&config.log)?;

    let stream = config
        .output
        .stream
        .clone()
        .context("no stream name: pass --stream or set `stream` in [output]")?;

    run(stream, settings::batch_file_config(&config.output)).await
}

/// Pump stdin into the pipeline until EOF or Ctrl-C
async fn run(stream: String, config: BatchFileConfig) -> Result<()> {
    tracing::info!(
        stream = %stream,
        path = %config.path.display(),
        rotation_interval = ?config.rotation_interval,
        max_bytes_per_sink = ?config.max_bytes_per_sink,
        finalize = %config.finalize_mode,
        "starting rowbatch"
    );

    let (file, events) = BatchFile::create(stream, config)?;
    let logger = spawn_event_logger(events);

    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut line_number: u64 = 0;
    let mut skipped: u64 = 0;

    loop {
        let line = tokio::select! {
            _ = &mut shutdown => {
                tracing::info!("interrupted, ending pipeline");
                break;
            }
            line = lines.next_line() => line.context("failed to read stdin")?,
        };

        let Some(line) = line else {
            break;
        };
        line_number += 1;

        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }

        let record: Value = match serde_json::from_str(trimmed) {
            Ok(record) => record,
            Err(e) => {
                tracing::warn!(line = line_number, error = %e, "skipping malformed json");
                skipped += 1;
                continue;
            }
        };

        match file.submit(&record) {
            Ok(()) => {}
            Err(BatchError::Encode(e)) => {
                tracing::warn!(line = line_number, error = %e, "skipping record");
                skipped += 1;
            }
            Err(e) => return Err(e.into()),
        }
    }

    let snapshot = file.end().await;
    if let Err(e) = logger.await {
        tracing::error!(error = %e, "event logger failed");
    }

    tracing::info!(
        lines_written = snapshot.lines_written,
        bytes_written = snapshot.bytes_written,
        rotations = snapshot.rotations,
        files_finalized = snapshot.files_finalized,
        records_rejected = snapshot.records_rejected,
        lines_dropped = snapshot.lines_dropped,
        skipped,
        "rowbatch finished"
    );

    Ok(())
}

/// Log pipeline events until `End`
fn spawn_event_logger(mut events: BatchEventReceiver) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            match event.kind {
                BatchEventKind::Finalized { path, bytes } => {
                    tracing::info!(
                        stream = %event.stream,
                        path = %path.display(),
                        bytes,
                        "batch file finalized"
                    );
                }
                BatchEventKind::Error(e) => {
                    tracing::warn!(stream = %event.stream, error = %e, "batch file error");
                }
                BatchEventKind::End => {
                    tracing::debug!(stream = %event.stream, "batch file pipeline ended");
                    break;
                }
            }
        }
    })
}

/// Initialize the tracing subscriber for logging
///
/// `RUST_LOG` takes precedence over the configured level.
fn init_logging(config: &LogConfig) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(config.level.as_str()))
        .map_err(|e| anyhow::anyhow!("invalid log level: {}", e))?;

    let writer = match &config.output {
        LogOutput::Stdout => BoxMakeWriter::new(std::io::stdout),
        LogOutput::Stderr => BoxMakeWriter::new(std::io::stderr),
        LogOutput::File(path) => {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("failed to open log file {path}"))?;
            BoxMakeWriter::new(Mutex::new(file))
        }
    };

    let layer = match config.format {
        LogFormat::Console => fmt::layer()
            .with_target(true)
            .with_thread_ids(false)
            .with_writer(writer)
            .boxed(),
        LogFormat::Json => fmt::layer().json().with_writer(writer).boxed(),
    };

    tracing_subscriber::registry().with(layer).with(filter).init();

    Ok(())
}
