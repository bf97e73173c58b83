//! Wall-clock abstraction
//!
//! Batch file names carry the epoch milliseconds at sink creation. The clock
//! is injectable so tests can pin file names.

use std::sync::atomic::{AtomicI64, Ordering};

use chrono::Utc;

/// Source of wall-clock time
pub trait Clock: Send + Sync {
    /// Milliseconds since the Unix epoch
    fn now_millis(&self) -> i64;
}

/// System clock
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_millis(&self) -> i64 {
        Utc::now().timestamp_millis()
    }
}

/// Manually driven clock for tests
#[derive(Debug, Default)]
pub struct MockClock {
    millis: AtomicI64,
}

impl MockClock {
    /// Create a mock clock fixed at `millis`
    pub fn new(millis: i64) -> Self {
        Self {
            millis: AtomicI64::new(millis),
        }
    }

    /// Move the clock forward
    pub fn advance(&self, millis: i64) {
        self.millis.fetch_add(millis, Ordering::SeqCst);
    }

    /// Jump to an absolute time
    pub fn set(&self, millis: i64) {
        self.millis.store(millis, Ordering::SeqCst);
    }
}

impl Clock for MockClock {
    fn now_millis(&self) -> i64 {
        self.millis.load(Ordering::SeqCst)
    }
}
