//! Rotating writer
//!
//! Owns the current sink and its [`RotationState`]. Both rotation triggers,
//! the deadline tick and the size check in the write path, go through
//! [`RotatingWriter::rotate`], so exactly one rotation runs at a time and
//! every rotation pushes the deadline out again.
//!
//! # State machine
//!
//! ```text
//!            rotate()                 close()
//! [Active] ──────────► [Rotating] ──► [Active] ─────────► [Closed]
//!     │                                                      ▲
//!     └──────────────────── destroy() ──────────────────────┘
//! ```
//!
//! Retired sinks that received bytes are handed to the finalization stage as
//! a [`RotationNotice`]. Sinks that never received a byte are ended quietly.

use tokio::sync::mpsc;
use tokio::time::Instant;

use crate::common::{SinkError, SinkId};
use crate::util::rotation_policy::{RotationPolicy, RotationState, RotationTrigger};
use crate::util::row_encoder::Line;
use crate::util::sink::{Capacity, Closing, Sink, SinkFactory, WriteFailure};

/// Writer lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriterPhase {
    /// Accepting writes
    Active,
    /// Swapping sinks
    Rotating,
    /// Terminal; no further writes
    Closed,
}

/// A sink that will receive no further writes
#[derive(Debug)]
pub struct RetiredSink {
    /// Sink identity
    pub id: SinkId,
    /// Bytes it received
    pub bytes_written: u64,
    /// Resolves once its data is durable
    pub closing: Closing,
}

/// Emitted whenever a sink that received bytes is retired
#[derive(Debug)]
pub struct RotationNotice {
    /// Sink being retired
    pub previous: RetiredSink,
    /// Replacement, or `None` at shutdown (finalize only)
    pub next: Option<SinkId>,
    /// What caused it; `None` at shutdown
    pub trigger: Option<RotationTrigger>,
}

/// Channel rotation notices are sent on
pub type NoticeSender = mpsc::UnboundedSender<RotationNotice>;

/// Receiving end of [`NoticeSender`]
pub type NoticeReceiver = mpsc::UnboundedReceiver<RotationNotice>;

/// Result of a deadline tick
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerOutcome {
    /// Deadline not reached, or writer closed
    Idle,
    /// Current sink retired and replaced
    Rotated,
    /// A fresh sink replaced a discarded one
    Recovered,
}

/// Writes lines into the current sink and rotates it
pub struct RotatingWriter {
    factory: Box<dyn SinkFactory>,
    policy: RotationPolicy,
    current: Option<Box<dyn Sink>>,
    state: RotationState,
    phase: WriterPhase,
    notices: Option<NoticeSender>,
    rotations: u64,
}

impl RotatingWriter {
    /// Create a writer and obtain its first sink
    ///
    /// # Errors
    ///
    /// Returns the factory error if no initial sink can be created.
    pub fn new(
        mut factory: Box<dyn SinkFactory>,
        policy: RotationPolicy,
        notices: NoticeSender,
        now: Instant,
    ) -> Result<Self, SinkError> {
        let sink = factory.create()?;

        tracing::debug!(path = %sink.id(), "initial batch sink created");

        Ok(Self {
            factory,
            policy,
            current: Some(sink),
            state: RotationState::new(policy.next_deadline(now)),
            phase: WriterPhase::Active,
            notices: Some(notices),
            rotations: 0,
        })
    }

    /// Current lifecycle phase
    pub fn phase(&self) -> WriterPhase {
        self.phase
    }

    /// Byte counters and deadline
    pub fn state(&self) -> &RotationState {
        &self.state
    }

    /// Rotation thresholds
    pub fn policy(&self) -> &RotationPolicy {
        &self.policy
    }

    /// Rotations performed so far (including ones that retired empty sinks)
    pub fn rotations(&self) -> u64 {
        self.rotations
    }

    /// Identity of the current sink
    pub fn current_id(&self) -> Option<&SinkId> {
        self.current.as_ref().map(|s| s.id())
    }

    /// Whether `id` is the current sink
    pub fn is_current(&self, id: &SinkId) -> bool {
        self.current_id() == Some(id)
    }

    /// Whether a sink is installed
    pub fn has_sink(&self) -> bool {
        self.current.is_some()
    }

    /// When the deadline next fires; `None` once closed
    pub fn next_deadline(&self) -> Option<Instant> {
        match self.phase {
            WriterPhase::Closed => None,
            _ => Some(self.state.next_deadline()),
        }
    }

    /// Append a line to the current sink
    ///
    /// Rotates first if the deadline has passed or the line would overflow
    /// the size limit, so the line opens the new sink.
    ///
    /// # Errors
    ///
    /// The line is handed back when there is no usable sink. A sink that
    /// fails a write is discarded.
    pub fn write(&mut self, line: Line, now: Instant) -> Result<Capacity, WriteFailure> {
        if self.phase == WriterPhase::Closed || self.current.is_none() {
            return Err(WriteFailure {
                line,
                error: SinkError::Unavailable,
            });
        }

        let len = line.len() as u64;
        if let Some(trigger) = self.policy.should_rotate(&self.state, now, len) {
            if let Err(error) = self.rotate(now, trigger) {
                return Err(WriteFailure { line, error });
            }
        }

        let Some(sink) = self.current.as_mut() else {
            return Err(WriteFailure {
                line,
                error: SinkError::Unavailable,
            });
        };

        match sink.write(line) {
            Ok(capacity) => {
                self.state.record_write(len);
                Ok(capacity)
            }
            Err(failure) => {
                tracing::warn!(
                    path = %sink.id(),
                    error = %failure.error,
                    "batch sink failed, discarding"
                );
                self.discard_current();
                Err(failure)
            }
        }
    }

    /// Deadline tick
    ///
    /// # Errors
    ///
    /// Returns the factory error when no replacement sink can be created.
    /// The deadline is pushed out either way, so a failing factory is retried
    /// (and reported) once per interval.
    pub fn on_timer(&mut self, now: Instant) -> Result<TimerOutcome, SinkError> {
        if self.phase == WriterPhase::Closed || !self.policy.deadline_reached(&self.state, now) {
            return Ok(TimerOutcome::Idle);
        }

        if self.current.is_none() {
            self.recover(now)?;
            return Ok(TimerOutcome::Recovered);
        }

        self.rotate(now, RotationTrigger::Time)?;
        Ok(TimerOutcome::Rotated)
    }

    /// Retire the current sink and install a new one
    ///
    /// # Errors
    ///
    /// Returns the factory error; the writer is then left without a sink.
    pub fn rotate(&mut self, now: Instant, trigger: RotationTrigger) -> Result<(), SinkError> {
        if self.phase == WriterPhase::Closed {
            return Err(SinkError::Unavailable);
        }
        self.phase = WriterPhase::Rotating;
        self.rotations += 1;

        let retired = self.current.take().map(|sink| {
            let id = sink.id().clone();
            (id, sink.end())
        });
        let bytes_written = self.state.bytes_current();

        let created = self.factory.create();
        let next = created.as_ref().ok().map(|s| s.id().clone());

        if let Some((id, closing)) = retired {
            tracing::info!(
                path = %id,
                bytes = bytes_written,
                trigger = trigger.as_str(),
                next = ?next.as_ref().map(SinkId::to_string),
                "batch file rotated"
            );
            self.retire(id, bytes_written, closing, next.clone(), Some(trigger));
        }

        let next_deadline = self.policy.next_deadline(now);
        let result = match created {
            Ok(sink) => {
                self.current = Some(sink);
                self.state.begin_sink(next_deadline);
                Ok(())
            }
            Err(e) => {
                tracing::error!(error = %e, "cannot create replacement batch sink");
                self.state.detach();
                self.state.reschedule(next_deadline);
                Err(e)
            }
        };

        self.phase = WriterPhase::Active;
        result
    }

    /// Install a fresh sink if none is present
    ///
    /// # Errors
    ///
    /// Returns the factory error and pushes the deadline out.
    pub fn recover(&mut self, now: Instant) -> Result<(), SinkError> {
        if self.phase == WriterPhase::Closed {
            return Err(SinkError::Unavailable);
        }
        if self.current.is_some() {
            return Ok(());
        }

        let next_deadline = self.policy.next_deadline(now);
        match self.factory.create() {
            Ok(sink) => {
                tracing::info!(path = %sink.id(), "batch sink recovered");
                self.current = Some(sink);
                self.state.begin_sink(next_deadline);
                Ok(())
            }
            Err(e) => {
                self.state.reschedule(next_deadline);
                Err(e)
            }
        }
    }

    /// Drop the current sink if it is `id`; it is not finalized
    ///
    /// Returns whether anything was discarded.
    pub fn discard(&mut self, id: &SinkId) -> bool {
        if !self.is_current(id) {
            return false;
        }
        self.discard_current();
        true
    }

    /// Forget bytes a failed sink accepted but never wrote
    pub fn retract(&mut self, bytes: u64) {
        self.state.retract(bytes);
    }

    fn discard_current(&mut self) {
        if let Some(sink) = self.current.take() {
            sink.destroy();
        }
        self.state.detach();
    }

    /// Shut down: stop the deadline, end the current sink, emit a final
    /// notice (`next = None`) if it received bytes
    ///
    /// Idempotent. Drops the notice channel, which lets the finalization
    /// stage finish once it has processed everything.
    pub fn close(&mut self) {
        if self.phase == WriterPhase::Closed {
            return;
        }
        self.phase = WriterPhase::Closed;

        if let Some(sink) = self.current.take() {
            let id = sink.id().clone();
            let closing = sink.end();
            let bytes_written = self.state.bytes_current();
            tracing::debug!(path = %id, bytes = bytes_written, "closing final batch sink");
            self.retire(id, bytes_written, closing, None, None);
        }
        self.state.detach();
        self.notices = None;
    }

    /// Abandon the current sink without a notice
    pub fn destroy(&mut self) {
        self.phase = WriterPhase::Closed;
        self.discard_current();
        self.notices = None;
    }

    fn retire(
        &self,
        id: SinkId,
        bytes_written: u64,
        closing: Closing,
        next: Option<SinkId>,
        trigger: Option<RotationTrigger>,
    ) {
        if bytes_written == 0 {
            // Nothing to finalize; the lazy sink never opened a file
            return;
        }

        let notice = RotationNotice {
            previous: RetiredSink {
                id,
                bytes_written,
                closing,
            },
            next,
            trigger,
        };

        match &self.notices {
            Some(notices) => {
                if let Err(mpsc::error::SendError(notice)) = notices.send(notice) {
                    tracing::warn!(
                        path = %notice.previous.id,
                        "finalization stage gone, retired sink will not be finalized"
                    );
                }
            }
            None => tracing::warn!(path = %notice.previous.id, "notice after close dropped"),
        }
    }
}

#[cfg(test)]
#[path = "rotating_writer_test.rs"]
mod rotating_writer_test;
