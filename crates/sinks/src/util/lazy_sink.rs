//! Lazily opened file sinks
//!
//! A [`LazyFileSink`] knows its path from the moment it is created but does
//! not touch the file system until the first line arrives. Idle rotation
//! periods therefore leave no empty files behind.
//!
//! # Architecture
//!
//! ```text
//! write(line) → [backlog += len] → [unbounded channel] → [writer task] → [pending lines] → writev → [File]
//!                     │                                                        │
//!                     └── Full when backlog >= high-water ──────────────────────┴── Drain when backlog == 0
//! ```
//!
//! Each opened sink owns one writer task. The task keeps unwritten lines
//! whole until the file has taken every byte of them, so when the file
//! fails for good the lines it never received are handed back in the
//! [`SinkSignal::Error`] event. Failed writes are retried from the first
//! unwritten byte; a partial write is never repeated.
//!
//! Dropping the channel sender is the end-of-stream signal: the task writes
//! the remaining lines, syncs and resolves the sink's [`Closing`].

use std::collections::VecDeque;
use std::fs::{self, File};
use std::io::{self, IoSlice, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::common::{SinkError, SinkId};
use crate::util::clock::Clock;
use crate::util::row_encoder::Line;
use crate::util::sink::{
    Capacity, Closing, Sink, SinkEvent, SinkEventSender, SinkFactory, SinkSignal, WriteFailure,
};

/// Default backlog size at which a sink reports `Full` (16KB)
pub const DEFAULT_HIGH_WATER_MARK: usize = 16 * 1024;

/// Default write retry attempts
pub const DEFAULT_WRITE_RETRIES: usize = 3;

/// Default delay between retries
pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_millis(10);

/// Default batch file extension
pub const DEFAULT_EXTENSION: &str = "data";

/// Lines per vectored write
const MAX_IOVECS: usize = 64;

/// Buffering and retry settings for file sinks
#[derive(Debug, Clone)]
pub struct FileSinkOptions {
    /// Backlog bytes at which writes report `Full`
    pub high_water_mark: usize,

    /// Pending bytes that trigger a write before the next flush tick
    pub buffer_size: usize,

    /// Periodic flush interval
    pub flush_interval: Duration,

    /// Attempts per write before the sink is declared failed
    pub max_write_retries: usize,

    /// Delay between attempts
    pub retry_delay: Duration,
}

impl Default for FileSinkOptions {
    fn default() -> Self {
        Self {
            high_water_mark: DEFAULT_HIGH_WATER_MARK,
            buffer_size: 64 * 1024,
            flush_interval: Duration::from_millis(100),
            max_write_retries: DEFAULT_WRITE_RETRIES,
            retry_delay: DEFAULT_RETRY_DELAY,
        }
    }
}

/// Destination a writer task drains into
trait BatchWrite: Write + Send + 'static {
    /// Make everything written so far durable
    fn sync(&mut self) -> io::Result<()>;
}

impl BatchWrite for File {
    fn sync(&mut self) -> io::Result<()> {
        self.sync_all()
    }
}

/// Bytes handed to the writer task but not yet written
#[derive(Debug, Default)]
struct Backlog {
    bytes: u64,
    needs_drain: bool,
}

struct OpenFile {
    sender: mpsc::UnboundedSender<Bytes>,
    backlog: Arc<Mutex<Backlog>>,
    task: JoinHandle<()>,
    done: oneshot::Receiver<Result<(), SinkError>>,
}

impl OpenFile {
    /// Start the writer task for an opened destination
    fn spawn<W: BatchWrite>(
        sink: SinkId,
        writer: W,
        options: FileSinkOptions,
        events: SinkEventSender,
    ) -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();
        let (done_tx, done_rx) = oneshot::channel();
        let backlog = Arc::new(Mutex::new(Backlog::default()));

        let task = tokio::spawn(run_writer_task(WriterTask {
            sink,
            receiver,
            writer,
            pending: VecDeque::new(),
            pending_bytes: 0,
            offset: 0,
            backlog: Arc::clone(&backlog),
            events,
            options,
            done: done_tx,
        }));

        Self {
            sender,
            backlog,
            task,
            done: done_rx,
        }
    }

    /// Queue bytes for the task and account for them
    fn send(&self, line: Line, high_water_mark: u64) -> Result<Capacity, Line> {
        let len = line.len() as u64;
        let capacity = {
            let mut backlog = self.backlog.lock();
            backlog.bytes += len;
            if backlog.bytes >= high_water_mark {
                backlog.needs_drain = true;
                Capacity::Full
            } else {
                Capacity::Ready
            }
        };

        match self.sender.send(line.into_bytes()) {
            Ok(()) => Ok(capacity),
            Err(mpsc::error::SendError(bytes)) => {
                let mut backlog = self.backlog.lock();
                backlog.bytes = backlog.bytes.saturating_sub(len);
                Err(Line::from_bytes(bytes))
            }
        }
    }
}

/// File sink that opens on first write
pub struct LazyFileSink {
    id: SinkId,
    options: FileSinkOptions,
    events: SinkEventSender,
    file: Option<OpenFile>,
    bytes_written: u64,
}

impl LazyFileSink {
    /// Create a sink for `path`; nothing is opened yet
    pub fn new(path: impl Into<PathBuf>, options: FileSinkOptions, events: SinkEventSender) -> Self {
        Self {
            id: SinkId::new(path),
            options,
            events,
            file: None,
            bytes_written: 0,
        }
    }

    /// Destination path
    pub fn path(&self) -> &Path {
        self.id.path()
    }

    fn open(&mut self) -> Result<&OpenFile, SinkError> {
        if self.file.is_none() {
            let path = self.id.path();
            let file = File::options()
                .create(true)
                .append(true)
                .open(path)
                .map_err(|source| SinkError::Open {
                    path: path.to_path_buf(),
                    source,
                })?;

            tracing::debug!(path = %self.id, "first write, opened batch file");

            self.file = Some(OpenFile::spawn(
                self.id.clone(),
                file,
                self.options.clone(),
                self.events.clone(),
            ));
        }
        self.file
            .as_ref()
            .ok_or_else(|| SinkError::Closed(self.id.clone()))
    }
}

impl Sink for LazyFileSink {
    fn id(&self) -> &SinkId {
        &self.id
    }

    fn bytes_written(&self) -> u64 {
        self.bytes_written
    }

    fn is_open(&self) -> bool {
        self.file.is_some()
    }

    fn write(&mut self, line: Line) -> Result<Capacity, WriteFailure> {
        let high_water_mark = self.options.high_water_mark as u64;
        let len = line.len() as u64;

        let file = match self.open() {
            Ok(file) => file,
            Err(error) => return Err(WriteFailure { line, error }),
        };

        match file.send(line, high_water_mark) {
            Ok(capacity) => {
                self.bytes_written += len;
                Ok(capacity)
            }
            // Writer task is gone; it already reported why
            Err(line) => Err(WriteFailure {
                line,
                error: SinkError::Closed(self.id.clone()),
            }),
        }
    }

    fn end(self: Box<Self>) -> Closing {
        let this = *self;
        match this.file {
            Some(file) => {
                // Dropping the sender lets the task drain and finish
                drop(file.sender);
                Closing::pending(this.id, file.done)
            }
            None => Closing::ready(this.id),
        }
    }

    fn destroy(self: Box<Self>) {
        if let Some(file) = &self.file {
            file.task.abort();
            tracing::debug!(path = %self.id, "batch file abandoned");
        }
    }
}

struct WriterTask<W> {
    sink: SinkId,
    receiver: mpsc::UnboundedReceiver<Bytes>,
    writer: W,
    /// Lines not yet fully written, oldest first
    pending: VecDeque<Bytes>,
    pending_bytes: usize,
    /// Bytes of the front line already in the file
    offset: usize,
    backlog: Arc<Mutex<Backlog>>,
    events: SinkEventSender,
    options: FileSinkOptions,
    done: oneshot::Sender<Result<(), SinkError>>,
}

/// Writes lines for one file until its sender drops or the file fails
async fn run_writer_task<W: BatchWrite>(mut task: WriterTask<W>) {
    let mut flush_ticker = tokio::time::interval(task.options.flush_interval);
    flush_ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    let result = loop {
        tokio::select! {
            request = task.receiver.recv() => {
                match request {
                    Some(buf) => {
                        task.push(buf);
                        if task.should_write() {
                            if let Err(e) = task.write_pending().await {
                                break Err(e);
                            }
                        }
                    }
                    // Sender dropped: end of stream
                    None => break task.finish().await,
                }
            }
            _ = flush_ticker.tick() => {
                if let Err(e) = task.write_pending().await {
                    break Err(e);
                }
            }
        }
    };

    match result {
        Ok(()) => {
            tracing::debug!(path = %task.sink, "writer task finished");
            let _ = task.done.send(Ok(()));
        }
        Err(e) => {
            let unwritten = task.take_unwritten();
            tracing::error!(
                path = %task.sink,
                error = %e,
                unwritten = unwritten.len(),
                "batch file writer failed"
            );
            // Report before resolving `done` so the error is queued by the
            // time anyone waiting on the close wakes up
            let copy = copy_error(&e);
            let _ = task.events.send(SinkEvent {
                sink: task.sink.clone(),
                signal: SinkSignal::Error {
                    error: e,
                    unwritten,
                },
            });
            let _ = task.done.send(Err(copy));
        }
    }
}

impl<W: BatchWrite> WriterTask<W> {
    fn push(&mut self, buf: Bytes) {
        self.pending_bytes += buf.len();
        self.pending.push_back(buf);
    }

    /// Write now instead of waiting for the tick when enough is pending or
    /// a caller is waiting for `Drain`
    fn should_write(&self) -> bool {
        self.pending_bytes >= self.options.buffer_size || self.backlog.lock().needs_drain
    }

    /// Write every pending line, retrying from the first unwritten byte
    async fn write_pending(&mut self) -> Result<(), SinkError> {
        let attempts = self.options.max_write_retries.max(1);
        let mut failures = 0;

        while !self.pending.is_empty() {
            let result = self.write_some().and_then(|n| match n {
                0 => Err(io::Error::from(io::ErrorKind::WriteZero)),
                n => Ok(n),
            });

            match result {
                Ok(n) => {
                    failures = 0;
                    self.advance(n);
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => {
                    failures += 1;
                    if failures >= attempts {
                        return Err(SinkError::Write {
                            path: self.sink.path().to_path_buf(),
                            source: e,
                        });
                    }
                    tracing::warn!(
                        path = %self.sink,
                        attempt = failures,
                        max_attempts = attempts,
                        error = %e,
                        "write failed, retrying"
                    );
                    tokio::time::sleep(self.options.retry_delay).await;
                }
            }
        }

        self.writer.flush().map_err(|source| SinkError::Flush {
            path: self.sink.path().to_path_buf(),
            source,
        })
    }

    fn write_some(&mut self) -> io::Result<usize> {
        let slices: Vec<IoSlice<'_>> = self
            .pending
            .iter()
            .take(MAX_IOVECS)
            .enumerate()
            .map(|(i, buf)| {
                let start = if i == 0 { self.offset } else { 0 };
                IoSlice::new(&buf[start..])
            })
            .collect();
        self.writer.write_vectored(&slices)
    }

    /// Account for `n` written bytes; completed lines leave the queue
    fn advance(&mut self, mut n: usize) {
        let mut released = 0;
        while n > 0 {
            let Some(front) = self.pending.front() else {
                break;
            };
            let remaining = front.len() - self.offset;
            if n < remaining {
                self.offset += n;
                break;
            }
            n -= remaining;
            self.offset = 0;
            if let Some(line) = self.pending.pop_front() {
                self.pending_bytes -= line.len();
                released += line.len() as u64;
            }
        }
        if released > 0 {
            self.release(released);
        }
    }

    /// Subtract written bytes; signal drain once the backlog empties
    fn release(&self, len: u64) {
        let drained = {
            let mut backlog = self.backlog.lock();
            backlog.bytes = backlog.bytes.saturating_sub(len);
            if backlog.needs_drain && backlog.bytes == 0 {
                backlog.needs_drain = false;
                true
            } else {
                false
            }
        };

        if drained {
            let _ = self.events.send(SinkEvent {
                sink: self.sink.clone(),
                signal: SinkSignal::Drain,
            });
        }
    }

    async fn finish(&mut self) -> Result<(), SinkError> {
        self.write_pending().await?;
        self.writer.sync().map_err(|source| SinkError::Flush {
            path: self.sink.path().to_path_buf(),
            source,
        })
    }

    /// Every line the file did not fully receive, oldest first
    ///
    /// Closes the channel first so no line can slip in afterwards; later
    /// writes to the sink fail and hand their line back directly.
    fn take_unwritten(&mut self) -> Vec<Line> {
        self.receiver.close();
        while let Ok(buf) = self.receiver.try_recv() {
            self.push(buf);
        }
        self.offset = 0;
        self.pending_bytes = 0;
        self.pending.drain(..).map(Line::from_bytes).collect()
    }
}

fn copy_error(e: &SinkError) -> SinkError {
    let copy = |source: &io::Error| io::Error::new(source.kind(), source.to_string());
    match e {
        SinkError::Open { path, source } => SinkError::Open {
            path: path.clone(),
            source: copy(source),
        },
        SinkError::Write { path, source } => SinkError::Write {
            path: path.clone(),
            source: copy(source),
        },
        SinkError::Flush { path, source } => SinkError::Flush {
            path: path.clone(),
            source: copy(source),
        },
        SinkError::Closed(id) => SinkError::Closed(id.clone()),
        SinkError::Unavailable => SinkError::Unavailable,
        SinkError::Factory { path, message } => SinkError::factory(path.clone(), message.clone()),
    }
}

/// Creates `<base>/<stream>.<epoch_millis>.<ext>` sinks
///
/// Millisecond stamps are strictly increasing per factory, so two sinks
/// created within the same millisecond still get distinct files.
pub struct FileSinkFactory {
    base_path: PathBuf,
    stream: Arc<str>,
    extension: String,
    clock: Arc<dyn Clock>,
    last_millis: Option<i64>,
    options: FileSinkOptions,
    events: SinkEventSender,
}

impl FileSinkFactory {
    /// Create a factory for one stream
    pub fn new(
        base_path: impl Into<PathBuf>,
        stream: impl Into<Arc<str>>,
        clock: Arc<dyn Clock>,
        options: FileSinkOptions,
        events: SinkEventSender,
    ) -> Self {
        Self {
            base_path: base_path.into(),
            stream: stream.into(),
            extension: DEFAULT_EXTENSION.into(),
            clock,
            last_millis: None,
            options,
            events,
        }
    }

    /// Override the file extension (without the dot)
    #[must_use]
    pub fn with_extension(mut self, extension: impl Into<String>) -> Self {
        self.extension = extension.into();
        self
    }

    /// Directory files are created in
    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    fn next_millis(&mut self) -> i64 {
        let now = self.clock.now_millis();
        let millis = match self.last_millis {
            Some(last) if now <= last => last + 1,
            _ => now,
        };
        self.last_millis = Some(millis);
        millis
    }

    fn ensure_dir(&self) -> Result<(), SinkError> {
        fs::create_dir_all(&self.base_path)
            .map_err(|e| SinkError::factory(&self.base_path, e.to_string()))?;

        let metadata = fs::metadata(&self.base_path)
            .map_err(|e| SinkError::factory(&self.base_path, e.to_string()))?;
        if !metadata.is_dir() {
            return Err(SinkError::factory(&self.base_path, "not a directory"));
        }
        Ok(())
    }
}

impl SinkFactory for FileSinkFactory {
    fn create(&mut self) -> Result<Box<dyn Sink>, SinkError> {
        self.ensure_dir()?;

        let millis = self.next_millis();
        let filename = format!("{}.{}.{}", self.stream, millis, self.extension);
        let path = self.base_path.join(filename);

        Ok(Box::new(LazyFileSink::new(
            path,
            self.options.clone(),
            self.events.clone(),
        )))
    }
}

#[cfg(test)]
#[path = "lazy_sink_test.rs"]
mod lazy_sink_test;
