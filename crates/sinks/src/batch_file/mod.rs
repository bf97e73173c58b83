//! Batch file pipeline
//!
//! One [`BatchFile`] per stream. Records are encoded on the caller's side and
//! handed to an actor task that owns the [`WriteCoordinator`] and
//! [`RotatingWriter`]. Retired files are finalized by a separate
//! [`FinalizationStage`] task.
//!
//! # Architecture
//!
//! ```text
//! submit(record) → [RowEncoder] → [command channel] → [actor task]
//!                                                         │
//!                          ┌──────────────────────────────┤ select! (biased)
//!                          │  cancel │ sink events │ deadline │ commands
//!                          ▼
//!                  [WriteCoordinator] → [RotatingWriter] → [LazyFileSink] → <path>/<stream>.<millis>.data
//!                                              │
//!                                              └── RotationNotice → [FinalizationStage] → chmod
//!
//! events: Finalized(path) | Error(BatchError) | End
//! ```
//!
//! `submit` never blocks: the command channel is unbounded and backpressure
//! is absorbed by the coordinator's queue.

mod router;

pub use router::BatchRouter;

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde::Serialize;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::common::BatchError;
use crate::util::clock::{Clock, SystemClock};
use crate::util::finalize::{FinalizationStage, FinalizeMode, FinalizeOutcome, Finalizer};
use crate::util::lazy_sink::{
    DEFAULT_EXTENSION, DEFAULT_HIGH_WATER_MARK, DEFAULT_RETRY_DELAY, DEFAULT_WRITE_RETRIES,
    FileSinkFactory, FileSinkOptions,
};
use crate::util::rotating_writer::{RotatingWriter, TimerOutcome};
use crate::util::rotation_policy::{DEFAULT_ROTATION_INTERVAL, RotationPolicy};
use crate::util::row_encoder::{Line, RowEncoder};
use crate::util::sink::{SinkEvent, SinkEventReceiver, SinkFactory, SinkSignal};
use crate::util::write_coordinator::WriteCoordinator;

/// Configuration for a batch file pipeline
#[derive(Debug, Clone)]
pub struct BatchFileConfig {
    /// Output directory (created if missing)
    pub path: PathBuf,

    /// Time between rotations (default: 5s)
    pub rotation_interval: Duration,

    /// Size limit per file; `None` for unbounded
    pub max_bytes_per_sink: Option<u64>,

    /// Action applied to retired files
    pub finalize_mode: FinalizeMode,

    /// Backlog bytes at which a file reports backpressure (default: 16KB)
    pub high_water_mark: usize,

    /// Periodic flush interval for open files
    pub flush_interval: Duration,

    /// Attempts per write before a file is declared failed
    pub max_write_retries: usize,

    /// Delay between write attempts
    pub retry_delay: Duration,

    /// File extension (without the dot)
    pub extension: String,
}

impl Default for BatchFileConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("."),
            rotation_interval: DEFAULT_ROTATION_INTERVAL,
            max_bytes_per_sink: None,
            finalize_mode: FinalizeMode::ReadOnly,
            high_water_mark: DEFAULT_HIGH_WATER_MARK,
            flush_interval: Duration::from_millis(100),
            max_write_retries: DEFAULT_WRITE_RETRIES,
            retry_delay: DEFAULT_RETRY_DELAY,
            extension: DEFAULT_EXTENSION.into(),
        }
    }
}

impl BatchFileConfig {
    /// Set output directory
    #[must_use]
    pub fn with_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.path = path.into();
        self
    }

    /// Set rotation interval
    #[must_use]
    pub fn with_rotation_interval(mut self, interval: Duration) -> Self {
        self.rotation_interval = interval;
        self
    }

    /// Set size limit per file
    #[must_use]
    pub fn with_max_bytes_per_sink(mut self, max: u64) -> Self {
        self.max_bytes_per_sink = Some(max);
        self
    }

    /// Set finalize action
    #[must_use]
    pub fn with_finalize_mode(mut self, mode: FinalizeMode) -> Self {
        self.finalize_mode = mode;
        self
    }

    /// Set backpressure threshold
    #[must_use]
    pub fn with_high_water_mark(mut self, bytes: usize) -> Self {
        self.high_water_mark = bytes;
        self
    }

    /// Set file extension
    #[must_use]
    pub fn with_extension(mut self, extension: impl Into<String>) -> Self {
        self.extension = extension.into();
        self
    }

    /// Check the configuration
    ///
    /// # Errors
    ///
    /// Returns `BatchError::Config` naming the first invalid field.
    pub fn validate(&self) -> Result<(), BatchError> {
        if self.rotation_interval.is_zero() {
            return Err(BatchError::config("rotation_interval must be greater than zero"));
        }
        if self.max_bytes_per_sink == Some(0) {
            return Err(BatchError::config("max_bytes_per_sink must be greater than zero"));
        }
        if self.high_water_mark == 0 {
            return Err(BatchError::config("high_water_mark must be greater than zero"));
        }
        if self.flush_interval.is_zero() {
            return Err(BatchError::config("flush_interval must be greater than zero"));
        }
        if self.extension.is_empty() || self.extension.contains(['/', '\\', '.']) {
            return Err(BatchError::config(format!(
                "invalid file extension '{}'",
                self.extension
            )));
        }
        Ok(())
    }

    /// Rotation thresholds
    pub fn policy(&self) -> RotationPolicy {
        RotationPolicy::new(self.rotation_interval, self.max_bytes_per_sink)
    }

    /// Per-file buffering and retry settings
    pub fn file_options(&self) -> FileSinkOptions {
        FileSinkOptions {
            high_water_mark: self.high_water_mark,
            flush_interval: self.flush_interval,
            max_write_retries: self.max_write_retries,
            retry_delay: self.retry_delay,
            ..Default::default()
        }
    }
}

/// Something the caller should know about
#[derive(Debug)]
pub struct BatchEvent {
    /// Stream the event belongs to
    pub stream: Arc<str>,
    /// What happened
    pub kind: BatchEventKind,
}

/// Kinds of [`BatchEvent`]
#[derive(Debug)]
pub enum BatchEventKind {
    /// A retired file was finalized
    Finalized {
        /// File path
        path: PathBuf,
        /// Bytes it holds
        bytes: u64,
    },
    /// Non-fatal failure (sink I/O, finalize, lines dropped at shutdown)
    Error(BatchError),
    /// Pipeline shut down; no further events for this stream
    End,
}

/// Channel events are delivered on
pub type BatchEventSender = mpsc::UnboundedSender<BatchEvent>;

/// Receiving end of [`BatchEventSender`]
pub type BatchEventReceiver = mpsc::UnboundedReceiver<BatchEvent>;

/// Metrics for one pipeline
#[derive(Debug, Default)]
pub struct BatchFileMetrics {
    /// Records accepted by `submit`
    pub records_submitted: AtomicU64,

    /// Records rejected by encoding
    pub records_rejected: AtomicU64,

    /// Lines handed to sinks
    pub lines_written: AtomicU64,

    /// Bytes handed to sinks
    pub bytes_written: AtomicU64,

    /// Rotations performed
    pub rotations: AtomicU64,

    /// Files finalized
    pub files_finalized: AtomicU64,

    /// Finalize failures
    pub finalize_errors: AtomicU64,

    /// Sink I/O failures
    pub sink_errors: AtomicU64,

    /// Accepted lines that could not be written before shutdown
    pub lines_dropped: AtomicU64,

    /// Lines currently queued under backpressure
    pub queue_depth: AtomicU64,

    /// Deepest the queue has been
    pub queue_depth_max: AtomicU64,
}

impl BatchFileMetrics {
    /// Create new metrics instance
    pub const fn new() -> Self {
        Self {
            records_submitted: AtomicU64::new(0),
            records_rejected: AtomicU64::new(0),
            lines_written: AtomicU64::new(0),
            bytes_written: AtomicU64::new(0),
            rotations: AtomicU64::new(0),
            files_finalized: AtomicU64::new(0),
            finalize_errors: AtomicU64::new(0),
            sink_errors: AtomicU64::new(0),
            lines_dropped: AtomicU64::new(0),
            queue_depth: AtomicU64::new(0),
            queue_depth_max: AtomicU64::new(0),
        }
    }

    #[inline]
    fn record_submitted(&self) {
        self.records_submitted.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    fn record_rejected(&self) {
        self.records_rejected.fetch_add(1, Ordering::Relaxed);
    }

    /// Get snapshot of metrics
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            records_submitted: self.records_submitted.load(Ordering::Relaxed),
            records_rejected: self.records_rejected.load(Ordering::Relaxed),
            lines_written: self.lines_written.load(Ordering::Relaxed),
            bytes_written: self.bytes_written.load(Ordering::Relaxed),
            rotations: self.rotations.load(Ordering::Relaxed),
            files_finalized: self.files_finalized.load(Ordering::Relaxed),
            finalize_errors: self.finalize_errors.load(Ordering::Relaxed),
            sink_errors: self.sink_errors.load(Ordering::Relaxed),
            lines_dropped: self.lines_dropped.load(Ordering::Relaxed),
            queue_depth: self.queue_depth.load(Ordering::Relaxed),
            queue_depth_max: self.queue_depth_max.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time snapshot of metrics
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub records_submitted: u64,
    pub records_rejected: u64,
    pub lines_written: u64,
    pub bytes_written: u64,
    pub rotations: u64,
    pub files_finalized: u64,
    pub finalize_errors: u64,
    pub sink_errors: u64,
    pub lines_dropped: u64,
    pub queue_depth: u64,
    pub queue_depth_max: u64,
}

/// Handle for reading pipeline metrics
///
/// Holds an Arc to the metrics, so it remains valid after the pipeline ends.
#[derive(Debug, Clone)]
pub struct BatchFileMetricsHandle {
    stream: Arc<str>,
    metrics: Arc<BatchFileMetrics>,
}

impl BatchFileMetricsHandle {
    /// Stream name
    pub fn stream(&self) -> &str {
        &self.stream
    }

    /// Current values
    pub fn snapshot(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }
}

enum Command {
    Write(Line),
    Recover,
    End,
}

/// Handle to one stream's pipeline
///
/// Dropping the handle without calling [`BatchFile::end`] still shuts the
/// pipeline down gracefully in the background.
pub struct BatchFile {
    stream: Arc<str>,
    encoder: RowEncoder,
    commands: mpsc::UnboundedSender<Command>,
    cancel: CancellationToken,
    task: JoinHandle<()>,
    metrics: Arc<BatchFileMetrics>,
}

impl BatchFile {
    /// Start a file-backed pipeline with its own event channel
    ///
    /// # Errors
    ///
    /// Invalid configuration or stream name, or an output directory that
    /// cannot be created.
    pub fn create(
        stream: impl Into<Arc<str>>,
        config: BatchFileConfig,
    ) -> Result<(Self, BatchEventReceiver), BatchError> {
        let (events, receiver) = mpsc::unbounded_channel();
        let file = Self::create_with(stream, config, Arc::new(SystemClock), events)?;
        Ok((file, receiver))
    }

    /// Start a file-backed pipeline reporting to a shared event channel
    ///
    /// # Errors
    ///
    /// See [`BatchFile::create`].
    pub fn create_with(
        stream: impl Into<Arc<str>>,
        config: BatchFileConfig,
        clock: Arc<dyn Clock>,
        events: BatchEventSender,
    ) -> Result<Self, BatchError> {
        config.validate()?;
        let stream = stream.into();
        validate_stream(&stream)?;

        let (sink_events, sink_events_rx) = mpsc::unbounded_channel();
        let factory = FileSinkFactory::new(
            &config.path,
            Arc::clone(&stream),
            clock,
            config.file_options(),
            sink_events,
        )
        .with_extension(config.extension.clone());

        Self::spawn(
            stream,
            Box::new(factory),
            sink_events_rx,
            config.policy(),
            config.finalize_mode.finalizer(),
            events,
        )
    }

    /// Start a pipeline over any sink factory
    ///
    /// `sink_events` must be the receiving end of the channel the factory's
    /// sinks report on.
    ///
    /// # Errors
    ///
    /// Invalid stream name, or the factory cannot produce the first sink.
    pub fn spawn(
        stream: Arc<str>,
        factory: Box<dyn SinkFactory>,
        sink_events: SinkEventReceiver,
        policy: RotationPolicy,
        finalizer: Arc<dyn Finalizer>,
        events: BatchEventSender,
    ) -> Result<Self, BatchError> {
        validate_stream(&stream)?;

        let (notices, notices_rx) = mpsc::unbounded_channel();
        let writer = RotatingWriter::new(factory, policy, notices, Instant::now())?;

        let metrics = Arc::new(BatchFileMetrics::new());
        let finalization = FinalizationStage::new(finalizer, notices_rx)
            .spawn(finalize_reporter(
                Arc::clone(&stream),
                events.clone(),
                Arc::clone(&metrics),
            ));

        let (commands, commands_rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();

        let actor = Actor {
            stream: Arc::clone(&stream),
            coordinator: WriteCoordinator::new(writer),
            commands: commands_rx,
            sink_events,
            events,
            metrics: Arc::clone(&metrics),
            cancel: cancel.clone(),
            finalization,
        };
        let task = tokio::spawn(actor.run());

        tracing::info!(
            stream = %stream,
            interval = ?policy.interval(),
            max_bytes = ?policy.max_bytes_per_sink(),
            "batch file pipeline started"
        );

        Ok(Self {
            encoder: RowEncoder::new(Arc::clone(&stream)),
            stream,
            commands,
            cancel,
            task,
            metrics,
        })
    }

    /// Stream name
    pub fn stream(&self) -> &str {
        &self.stream
    }

    /// Encode and queue one record
    ///
    /// # Errors
    ///
    /// `BatchError::Encode` if the record is not a JSON object (nothing is
    /// written), `BatchError::Closed` if the pipeline has stopped.
    pub fn submit(&self, record: &Value) -> Result<(), BatchError> {
        let line = self.encoder.encode(record).inspect_err(|_| self.metrics.record_rejected())?;
        self.send_line(line)
    }

    /// Serialize, encode and queue one record
    ///
    /// # Errors
    ///
    /// See [`BatchFile::submit`].
    pub fn submit_serialize<T: Serialize + ?Sized>(&self, record: &T) -> Result<(), BatchError> {
        let line = self
            .encoder
            .encode_serialize(record)
            .inspect_err(|_| self.metrics.record_rejected())?;
        self.send_line(line)
    }

    fn send_line(&self, line: Line) -> Result<(), BatchError> {
        self.commands
            .send(Command::Write(line))
            .map_err(|_| BatchError::closed(self.stream.as_ref()))?;
        self.metrics.record_submitted();
        Ok(())
    }

    /// Ask the pipeline to replace a failed sink now instead of at the next
    /// deadline
    ///
    /// # Errors
    ///
    /// `BatchError::Closed` if the pipeline has stopped.
    pub fn recover(&self) -> Result<(), BatchError> {
        self.commands
            .send(Command::Recover)
            .map_err(|_| BatchError::closed(self.stream.as_ref()))
    }

    /// Get a metrics handle
    pub fn metrics_handle(&self) -> BatchFileMetricsHandle {
        BatchFileMetricsHandle {
            stream: Arc::clone(&self.stream),
            metrics: Arc::clone(&self.metrics),
        }
    }

    /// Write everything queued, close and finalize the last file, then emit
    /// `End`
    pub async fn end(self) -> MetricsSnapshot {
        // Already stopped if the send fails; the task still needs joining
        let _ = self.commands.send(Command::End);

        if let Err(e) = self.task.await {
            tracing::error!(stream = %self.stream, error = %e, "batch file task failed");
        }
        self.metrics.snapshot()
    }

    /// Submit one last record, then [`end`](BatchFile::end)
    ///
    /// # Errors
    ///
    /// The submit error, if any. The pipeline is ended either way.
    pub async fn end_with(self, record: &Value) -> Result<MetricsSnapshot, BatchError> {
        let submitted = self.submit(record);
        let snapshot = self.end().await;
        submitted.map(|()| snapshot)
    }

    /// Stop immediately
    ///
    /// Queued lines and the current file's backlog are discarded and the
    /// current file is not finalized. Files retired earlier are still
    /// finalized. No `End` event is emitted.
    pub fn destroy(self) {
        tracing::info!(stream = %self.stream, "batch file pipeline destroyed");
        self.cancel.cancel();
    }
}

/// Stream names end up in file names
fn validate_stream(stream: &str) -> Result<(), BatchError> {
    let invalid = stream.is_empty()
        || stream == "."
        || stream == ".."
        || stream.contains(['/', '\\', '\0']);
    if invalid {
        return Err(BatchError::InvalidStream {
            stream: stream.to_string(),
        });
    }
    Ok(())
}

fn finalize_reporter(
    stream: Arc<str>,
    events: BatchEventSender,
    metrics: Arc<BatchFileMetrics>,
) -> impl FnMut(FinalizeOutcome) + Send + 'static {
    move |outcome| {
        let kind = match outcome {
            FinalizeOutcome::Finalized { path, bytes } => {
                metrics.files_finalized.fetch_add(1, Ordering::Relaxed);
                BatchEventKind::Finalized { path, bytes }
            }
            FinalizeOutcome::Failed { path, error } => {
                metrics.finalize_errors.fetch_add(1, Ordering::Relaxed);
                BatchEventKind::Error(BatchError::finalize(path, error))
            }
            // The sink already reported its own error
            FinalizeOutcome::Skipped { .. } => return,
        };
        let _ = events.send(BatchEvent {
            stream: Arc::clone(&stream),
            kind,
        });
    }
}

struct Actor {
    stream: Arc<str>,
    coordinator: WriteCoordinator,
    commands: mpsc::UnboundedReceiver<Command>,
    sink_events: SinkEventReceiver,
    events: BatchEventSender,
    metrics: Arc<BatchFileMetrics>,
    cancel: CancellationToken,
    finalization: JoinHandle<()>,
}

impl Actor {
    async fn run(mut self) {
        loop {
            let deadline = self.coordinator.writer().next_deadline();

            tokio::select! {
                biased;

                _ = self.cancel.cancelled() => {
                    self.coordinator.destroy();
                    self.sync_metrics();
                    return;
                }

                Some(event) = self.sink_events.recv() => self.on_sink_event(event),

                _ = deadline_elapsed(deadline) => self.on_deadline(),

                command = self.commands.recv() => match command {
                    Some(Command::Write(line)) => self.on_write(line),
                    Some(Command::Recover) => self.on_recover(),
                    // Handle dropped: same as end
                    Some(Command::End) | None => break,
                },
            }

            self.sync_metrics();
        }

        self.shutdown().await;
    }

    fn on_write(&mut self, line: Line) {
        if let Err(e) = self.coordinator.submit(line, Instant::now()) {
            self.report(e.into());
        }
    }

    fn on_recover(&mut self) {
        if let Err(e) = self.coordinator.recover(Instant::now()) {
            self.report(e.into());
        }
    }

    fn on_deadline(&mut self) {
        match self.coordinator.on_timer(Instant::now()) {
            Ok(TimerOutcome::Recovered) => {
                tracing::info!(stream = %self.stream, "writes resumed on a fresh file");
            }
            Ok(_) => {}
            Err(e) => self.report(e.into()),
        }
    }

    fn on_sink_event(&mut self, event: SinkEvent) {
        match event.signal {
            SinkSignal::Drain => {
                if let Err(e) = self.coordinator.on_drain(&event.sink, Instant::now()) {
                    self.report(e.into());
                }
            }
            SinkSignal::Error { error, unwritten } => {
                let returned = unwritten.len();
                if self.coordinator.on_sink_failed(&event.sink, unwritten) {
                    tracing::warn!(
                        stream = %self.stream,
                        path = %event.sink,
                        queued = self.coordinator.pending_len(),
                        "current file failed, queueing until a new one is installed"
                    );
                }
                self.report(error.into());

                // A retired file failed; the current one takes its lines now
                if returned > 0 && self.coordinator.writer().has_sink() {
                    if let Err(e) = self.coordinator.on_capacity(Instant::now()) {
                        self.report(e.into());
                    }
                }
            }
        }
    }

    async fn shutdown(mut self) {
        // Lines handed back by files that already failed go out first
        while let Ok(event) = self.sink_events.try_recv() {
            self.on_sink_event(event);
        }

        if let Err(e) = self.coordinator.flush_and_end(Instant::now()) {
            self.report(e);
        }
        self.sync_metrics();

        // The writer dropped its notice channel; the stage exits once the
        // last file is finalized
        if let Err(e) = (&mut self.finalization).await {
            tracing::error!(stream = %self.stream, error = %e, "finalization task failed");
        }

        // Errors raised while the last files were closing; nothing is left
        // to take their unwritten lines
        while let Ok(event) = self.sink_events.try_recv() {
            if let SinkSignal::Error { error, unwritten } = event.signal {
                if unwritten.is_empty() {
                    self.report(error.into());
                    continue;
                }
                let bytes: u64 = unwritten.iter().map(|l| l.len() as u64).sum();
                self.metrics
                    .lines_written
                    .fetch_sub(unwritten.len() as u64, Ordering::Relaxed);
                self.metrics.bytes_written.fetch_sub(bytes, Ordering::Relaxed);
                self.report(BatchError::Dropped {
                    count: unwritten.len(),
                    source: error,
                });
            }
        }

        let snapshot = self.metrics.snapshot();
        tracing::info!(
            stream = %self.stream,
            records = snapshot.records_submitted,
            lines = snapshot.lines_written,
            bytes = snapshot.bytes_written,
            rotations = snapshot.rotations,
            finalized = snapshot.files_finalized,
            errors = snapshot.sink_errors + snapshot.finalize_errors,
            dropped = snapshot.lines_dropped,
            "batch file pipeline shutting down"
        );

        self.emit(BatchEventKind::End);
    }

    fn report(&self, error: BatchError) {
        match &error {
            BatchError::Sink(_) => {
                self.metrics.sink_errors.fetch_add(1, Ordering::Relaxed);
            }
            BatchError::Dropped { count, .. } => {
                self.metrics.sink_errors.fetch_add(1, Ordering::Relaxed);
                self.metrics
                    .lines_dropped
                    .fetch_add(*count as u64, Ordering::Relaxed);
            }
            _ => {}
        }
        tracing::warn!(stream = %self.stream, error = %error, "batch file error");
        self.emit(BatchEventKind::Error(error));
    }

    fn emit(&self, kind: BatchEventKind) {
        let _ = self.events.send(BatchEvent {
            stream: Arc::clone(&self.stream),
            kind,
        });
    }

    fn sync_metrics(&self) {
        let writer = self.coordinator.writer();
        let m = &self.metrics;
        m.lines_written
            .store(self.coordinator.lines_written(), Ordering::Relaxed);
        m.bytes_written
            .store(writer.state().total_bytes(), Ordering::Relaxed);
        m.rotations.store(writer.rotations(), Ordering::Relaxed);
        m.queue_depth
            .store(self.coordinator.pending_len() as u64, Ordering::Relaxed);
        m.queue_depth_max
            .store(self.coordinator.max_pending() as u64, Ordering::Relaxed);
    }
}

async fn deadline_elapsed(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
