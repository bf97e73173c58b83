//! Rotation decisions
//!
//! Pure logic: no I/O, no timers. [`RotatingWriter`](super::RotatingWriter)
//! owns the [`RotationState`] and asks the policy whether the current sink
//! should be retired.

use std::time::Duration;

use tokio::time::Instant;

/// Default rotation interval
pub const DEFAULT_ROTATION_INTERVAL: Duration = Duration::from_millis(5000);

/// Why a rotation happened
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RotationTrigger {
    /// Rotation deadline reached
    Time,
    /// Next line would overflow `max_bytes_per_sink`
    Size,
}

impl RotationTrigger {
    /// Name used in logs
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Time => "time",
            Self::Size => "size",
        }
    }
}

/// Counters for the current sink
///
/// `bytes_current` resets to zero exactly when the sink changes, via
/// [`RotationState::begin_sink`].
#[derive(Debug, Clone, Copy)]
pub struct RotationState {
    bytes_current: u64,
    total_bytes: u64,
    next_deadline: Instant,
    sinks_created: u64,
}

impl RotationState {
    /// State for a freshly installed first sink
    pub fn new(next_deadline: Instant) -> Self {
        Self {
            bytes_current: 0,
            total_bytes: 0,
            next_deadline,
            sinks_created: 1,
        }
    }

    /// Bytes written to the current sink
    pub fn bytes_current(&self) -> u64 {
        self.bytes_current
    }

    /// Bytes written across all sinks
    pub fn total_bytes(&self) -> u64 {
        self.total_bytes
    }

    /// When the time policy next fires
    pub fn next_deadline(&self) -> Instant {
        self.next_deadline
    }

    /// Number of sinks installed so far
    pub fn sinks_created(&self) -> u64 {
        self.sinks_created
    }

    /// Account for a line appended to the current sink
    pub fn record_write(&mut self, len: u64) {
        self.bytes_current += len;
        self.total_bytes += len;
    }

    /// A new sink replaced the current one
    pub fn begin_sink(&mut self, next_deadline: Instant) {
        self.bytes_current = 0;
        self.next_deadline = next_deadline;
        self.sinks_created += 1;
    }

    /// Push the deadline out without changing sink
    pub fn reschedule(&mut self, next_deadline: Instant) {
        self.next_deadline = next_deadline;
    }

    /// The current sink went away without a replacement
    pub fn detach(&mut self) {
        self.bytes_current = 0;
    }

    /// Lines counted by [`record_write`](RotationState::record_write) never
    /// reached their sink and will be written again
    pub fn retract(&mut self, len: u64) {
        self.total_bytes = self.total_bytes.saturating_sub(len);
    }
}

/// Time and size rotation thresholds
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RotationPolicy {
    interval: Duration,
    max_bytes_per_sink: Option<u64>,
}

impl Default for RotationPolicy {
    fn default() -> Self {
        Self::new(DEFAULT_ROTATION_INTERVAL, None)
    }
}

impl RotationPolicy {
    /// Create a policy; `None` disables the size check
    pub fn new(interval: Duration, max_bytes_per_sink: Option<u64>) -> Self {
        Self {
            interval,
            max_bytes_per_sink,
        }
    }

    /// Time between rotations
    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Size limit per sink, if any
    pub fn max_bytes_per_sink(&self) -> Option<u64> {
        self.max_bytes_per_sink
    }

    /// Deadline for a sink installed at `now`
    pub fn next_deadline(&self, now: Instant) -> Instant {
        now + self.interval
    }

    /// Time policy: deadline reached
    pub fn deadline_reached(&self, state: &RotationState, now: Instant) -> bool {
        now >= state.next_deadline
    }

    /// Size policy: appending `incoming` bytes would overflow the limit
    ///
    /// An empty sink always takes the line, so an oversized line lands alone
    /// in its own sink instead of rotating forever.
    pub fn exceeds_size(&self, state: &RotationState, incoming: u64) -> bool {
        match self.max_bytes_per_sink {
            Some(max) => state.bytes_current > 0 && state.bytes_current + incoming > max,
            None => false,
        }
    }

    /// Decide whether to rotate before appending `incoming` bytes
    ///
    /// Pass `incoming = 0` from the timer path.
    pub fn should_rotate(
        &self,
        state: &RotationState,
        now: Instant,
        incoming: u64,
    ) -> Option<RotationTrigger> {
        if self.deadline_reached(state, now) {
            Some(RotationTrigger::Time)
        } else if self.exceeds_size(state, incoming) {
            Some(RotationTrigger::Size)
        } else {
            None
        }
    }
}

#[cfg(test)]
#[path = "rotation_policy_test.rs"]
mod rotation_policy_test;
