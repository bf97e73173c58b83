//! Order-preserving admission control in front of [`RotatingWriter`]
//!
//! While the current sink has capacity, lines go straight through. Once it
//! reports [`Capacity::Full`], or fails, lines are held in a FIFO queue until
//! capacity returns. The queue is unbounded: callers never block, and the
//! queue depth is tracked so it can be reported.
//!
//! ```text
//! submit ──► [queueing?] ──no──► writer.write ──► Ready | Full (→ queueing)
//!                 │
//!                yes ──► pending.push_back
//!
//! on_capacity ──► drain pending FIFO until empty (→ normal) or Full again
//! ```

use std::collections::VecDeque;

use tokio::time::Instant;

use crate::common::{BatchError, SinkError, SinkId};
use crate::util::rotating_writer::{RotatingWriter, TimerOutcome};
use crate::util::row_encoder::Line;
use crate::util::sink::Capacity;

/// What happened to a submitted line
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// Handed to the current sink
    Written,
    /// Held in the pending queue
    Queued,
}

/// Queues writes under backpressure and drains them in order
pub struct WriteCoordinator {
    writer: RotatingWriter,
    pending: VecDeque<Line>,
    queueing: bool,
    lines_written: u64,
    max_pending: usize,
}

impl WriteCoordinator {
    /// Wrap a writer
    pub fn new(writer: RotatingWriter) -> Self {
        Self {
            writer,
            pending: VecDeque::new(),
            queueing: false,
            lines_written: 0,
            max_pending: 0,
        }
    }

    /// Underlying writer
    pub fn writer(&self) -> &RotatingWriter {
        &self.writer
    }

    /// Lines waiting for capacity
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Deepest the queue has been
    pub fn max_pending(&self) -> usize {
        self.max_pending
    }

    /// Lines handed to sinks so far
    pub fn lines_written(&self) -> u64 {
        self.lines_written
    }

    /// Whether new lines are being queued
    pub fn is_queueing(&self) -> bool {
        self.queueing
    }

    /// Admit one line
    ///
    /// # Errors
    ///
    /// Returns the sink error when the current sink rejected the line. The
    /// line is not lost: it sits at the front of the queue and is written
    /// once a sink is available again.
    pub fn submit(&mut self, line: Line, now: Instant) -> Result<Admission, SinkError> {
        if self.queueing {
            self.enqueue(line);
            return Ok(Admission::Queued);
        }

        match self.writer.write(line, now) {
            Ok(capacity) => {
                self.lines_written += 1;
                if capacity == Capacity::Full {
                    tracing::debug!("sink at capacity, queueing writes");
                    self.queueing = true;
                }
                Ok(Admission::Written)
            }
            Err(failure) => {
                self.requeue(failure.line);
                Err(failure.error)
            }
        }
    }

    /// Capacity is back: drain the queue in order
    ///
    /// Returns the number of lines written. Stops early, staying in queueing
    /// mode, if the sink fills up again.
    ///
    /// # Errors
    ///
    /// Returns the sink error if a queued line was rejected; it stays at the
    /// front of the queue.
    pub fn on_capacity(&mut self, now: Instant) -> Result<usize, SinkError> {
        let mut written = 0;
        while let Some(line) = self.pending.pop_front() {
            match self.writer.write(line, now) {
                Ok(Capacity::Ready) => {
                    written += 1;
                }
                Ok(Capacity::Full) => {
                    written += 1;
                    self.lines_written += written as u64;
                    return Ok(written);
                }
                Err(failure) => {
                    self.lines_written += written as u64;
                    self.requeue(failure.line);
                    return Err(failure.error);
                }
            }
        }

        self.lines_written += written as u64;
        if self.queueing {
            tracing::debug!(drained = written, "pending queue drained");
        }
        self.queueing = false;
        Ok(written)
    }

    /// A sink reported `Drain`; ignored unless it is the current sink
    ///
    /// # Errors
    ///
    /// See [`WriteCoordinator::on_capacity`].
    pub fn on_drain(&mut self, sink: &SinkId, now: Instant) -> Result<usize, SinkError> {
        if !self.writer.is_current(sink) {
            return Ok(0);
        }
        self.on_capacity(now)
    }

    /// A sink reported an I/O error
    ///
    /// `unwritten` are lines the sink accepted but never wrote. Everything
    /// handed to a sink was submitted before anything still queued, so they
    /// go back to the front of the queue in their original order. The sink
    /// is discarded if it is still current. Returns whether the current sink
    /// was discarded.
    pub fn on_sink_failed(&mut self, sink: &SinkId, unwritten: Vec<Line>) -> bool {
        let discarded = self.writer.discard(sink);
        if discarded {
            self.queueing = true;
        }

        if !unwritten.is_empty() {
            let count = unwritten.len();
            let bytes: u64 = unwritten.iter().map(|l| l.len() as u64).sum();
            tracing::warn!(
                path = %sink,
                lines = count,
                "re-queueing lines the failed file never wrote"
            );
            self.lines_written = self.lines_written.saturating_sub(count as u64);
            self.writer.retract(bytes);
            for line in unwritten.into_iter().rev() {
                self.pending.push_front(line);
            }
            self.max_pending = self.max_pending.max(self.pending.len());
            self.queueing = true;
        }
        discarded
    }

    /// Deadline tick; drains the queue into a freshly installed sink
    ///
    /// # Errors
    ///
    /// Factory failures, or the sink error from draining.
    pub fn on_timer(&mut self, now: Instant) -> Result<TimerOutcome, SinkError> {
        let outcome = self.writer.on_timer(now)?;
        if outcome != TimerOutcome::Idle {
            self.on_capacity(now)?;
        }
        Ok(outcome)
    }

    /// Install a fresh sink if there is none and drain into it
    ///
    /// # Errors
    ///
    /// Factory failures, or the sink error from draining.
    pub fn recover(&mut self, now: Instant) -> Result<usize, SinkError> {
        self.writer.recover(now)?;
        self.on_capacity(now)
    }

    /// Write every queued line ignoring backpressure, then close the writer
    ///
    /// A failing sink gets one recovery attempt.
    ///
    /// # Errors
    ///
    /// `BatchError::Dropped` with the number of lines that could not be
    /// written. The writer is closed either way.
    pub fn flush_and_end(&mut self, now: Instant) -> Result<(), BatchError> {
        let mut recovered = false;
        let mut last_error = None;

        while let Some(line) = self.pending.pop_front() {
            match self.writer.write(line, now) {
                Ok(_) => self.lines_written += 1,
                Err(failure) => {
                    self.pending.push_front(failure.line);
                    if recovered {
                        last_error = Some(failure.error);
                        break;
                    }
                    recovered = true;
                    if let Err(e) = self.writer.recover(now) {
                        last_error = Some(e);
                        break;
                    }
                }
            }
        }

        let dropped = self.pending.len();
        self.pending.clear();
        self.queueing = false;
        self.writer.close();

        match last_error {
            Some(source) if dropped > 0 => {
                tracing::error!(dropped, error = %source, "queued lines lost at shutdown");
                Err(BatchError::Dropped {
                    count: dropped,
                    source,
                })
            }
            _ => Ok(()),
        }
    }

    /// Abandon the writer and the queue
    pub fn destroy(&mut self) {
        if !self.pending.is_empty() {
            tracing::warn!(dropped = self.pending.len(), "discarding queued lines");
        }
        self.pending.clear();
        self.queueing = false;
        self.writer.destroy();
    }

    fn enqueue(&mut self, line: Line) {
        self.pending.push_back(line);
        self.max_pending = self.max_pending.max(self.pending.len());
    }

    fn requeue(&mut self, line: Line) {
        self.pending.push_front(line);
        self.max_pending = self.max_pending.max(self.pending.len());
        self.queueing = true;
    }
}

#[cfg(test)]
#[path = "write_coordinator_test.rs"]
mod write_coordinator_test;
