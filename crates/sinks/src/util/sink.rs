//! Sink abstraction
//!
//! A sink is an append-only byte destination. Writes are synchronous and
//! never block: a sink always takes the line it is handed and reports whether
//! it is now at capacity. Capacity returning, and asynchronous I/O failures,
//! arrive later as [`SinkEvent`]s on a channel shared by all sinks of one
//! pipeline.
//!
//! ```text
//! write(line) ──► Ready | Full          (sync)
//!        ...
//! SinkEvent { sink, Drain }             (async, once backlog empties)
//! SinkEvent { sink, Error { e, lines } } (async, sink is unusable; unwritten
//!                                        lines handed back)
//! end() ──► Closing ──wait()──► Ok      (flushed + synced)
//! ```

use tokio::sync::{mpsc, oneshot};

use crate::common::{SinkError, SinkId};
use crate::util::row_encoder::Line;

/// Sink state after a write
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Capacity {
    /// More writes welcome
    Ready,
    /// Backlog at or above the high-water mark; wait for `Drain`
    Full,
}

/// A write the sink could not take
///
/// The line is handed back so nothing accepted upstream is lost.
#[derive(Debug)]
pub struct WriteFailure {
    /// The rejected line
    pub line: Line,
    /// Why it was rejected
    pub error: SinkError,
}

/// Asynchronous signal from a sink
#[derive(Debug)]
pub enum SinkSignal {
    /// Backlog fully written; capacity is back
    Drain,
    /// Sink failed and will not accept further writes
    Error {
        /// Why it failed
        error: SinkError,
        /// Accepted lines that never reached the destination, in write order
        unwritten: Vec<Line>,
    },
}

/// Signal tagged with its origin
#[derive(Debug)]
pub struct SinkEvent {
    /// Sink that raised the signal
    pub sink: SinkId,
    /// What happened
    pub signal: SinkSignal,
}

/// Channel sinks report through
pub type SinkEventSender = mpsc::UnboundedSender<SinkEvent>;

/// Receiving end of [`SinkEventSender`]
pub type SinkEventReceiver = mpsc::UnboundedReceiver<SinkEvent>;

/// Completion of [`Sink::end`]
///
/// Resolves once every byte has been written and synced, or with the error
/// that stopped the sink.
#[derive(Debug)]
pub struct Closing {
    sink: SinkId,
    done: Option<oneshot::Receiver<Result<(), SinkError>>>,
}

impl Closing {
    /// Already closed (nothing was ever opened)
    pub fn ready(sink: SinkId) -> Self {
        Self { sink, done: None }
    }

    /// Closed when `done` fires
    pub fn pending(sink: SinkId, done: oneshot::Receiver<Result<(), SinkError>>) -> Self {
        Self {
            sink,
            done: Some(done),
        }
    }

    /// Sink being closed
    pub fn sink(&self) -> &SinkId {
        &self.sink
    }

    /// Wait for the close to complete
    ///
    /// # Errors
    ///
    /// The I/O error that stopped the sink, or `Closed` if the sink went away
    /// without reporting.
    pub async fn wait(self) -> Result<(), SinkError> {
        match self.done {
            None => Ok(()),
            Some(done) => match done.await {
                Ok(result) => result,
                Err(_) => Err(SinkError::Closed(self.sink)),
            },
        }
    }
}

/// An append-only destination
pub trait Sink: Send {
    /// Identity of this sink
    fn id(&self) -> &SinkId;

    /// Bytes accepted so far
    fn bytes_written(&self) -> u64;

    /// Whether the underlying destination has been opened
    fn is_open(&self) -> bool;

    /// Append one line
    ///
    /// # Errors
    ///
    /// The line is handed back inside [`WriteFailure`] when the sink cannot
    /// open or has already failed.
    fn write(&mut self, line: Line) -> Result<Capacity, WriteFailure>;

    /// Stop accepting writes and close once the backlog is written
    fn end(self: Box<Self>) -> Closing;

    /// Abandon the sink; unwritten backlog is lost
    fn destroy(self: Box<Self>);
}

/// Produces sinks on demand
pub trait SinkFactory: Send {
    /// Create the next sink
    ///
    /// # Errors
    ///
    /// `SinkError::Factory` when no sink can be produced at all.
    fn create(&mut self) -> Result<Box<dyn Sink>, SinkError>;
}
