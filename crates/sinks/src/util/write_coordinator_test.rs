//! Tests for backpressure queueing

use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::Instant;

use crate::common::{BatchError, SinkId};
use crate::util::memory_sink::{MemorySinkFactory, MemoryStore};
use crate::util::rotating_writer::{NoticeReceiver, RotatingWriter, TimerOutcome, WriterPhase};
use crate::util::rotation_policy::RotationPolicy;
use crate::util::row_encoder::Line;
use crate::util::write_coordinator::{Admission, WriteCoordinator};

const INTERVAL: Duration = Duration::from_secs(5);

fn line(s: &str) -> Line {
    Line::from_bytes(format!("{s}\n").into_bytes())
}

fn coordinator(store: &MemoryStore, start: Instant) -> (WriteCoordinator, NoticeReceiver) {
    let (events, _events_rx) = mpsc::unbounded_channel();
    let (notices, notices_rx) = mpsc::unbounded_channel();
    let writer = RotatingWriter::new(
        Box::new(MemorySinkFactory::new("t", store.clone(), events)),
        RotationPolicy::new(INTERVAL, None),
        notices,
        start,
    )
    .unwrap();
    (WriteCoordinator::new(writer), notices_rx)
}

fn current(c: &WriteCoordinator) -> SinkId {
    c.writer().current_id().unwrap().clone()
}

// ============================================================================
// Normal mode
// ============================================================================

#[test]
fn test_writes_pass_through_when_ready() {
    let store = MemoryStore::new();
    let now = Instant::now();
    let (mut c, _rx) = coordinator(&store, now);

    for i in 0..10 {
        assert_eq!(c.submit(line(&i.to_string()), now).unwrap(), Admission::Written);
    }

    assert_eq!(c.pending_len(), 0);
    assert_eq!(c.lines_written(), 10);
    assert!(!c.is_queueing());
    assert_eq!(store.written_files().len(), 1);
    assert_eq!(store.all_texts().len(), 10);
}

// ============================================================================
// Backpressure
// ============================================================================

#[test]
fn test_full_switches_to_queueing() {
    let store = MemoryStore::with_capacity(2);
    let now = Instant::now();
    let (mut c, _rx) = coordinator(&store, now);

    assert_eq!(c.submit(line("a"), now).unwrap(), Admission::Written);
    assert_eq!(c.submit(line("b"), now).unwrap(), Admission::Written);
    assert!(c.is_queueing());

    assert_eq!(c.submit(line("c"), now).unwrap(), Admission::Queued);
    assert_eq!(c.pending_len(), 1);
    assert_eq!(store.all_texts(), vec!["a", "b"]);
}

#[test]
fn test_drain_preserves_submission_order() {
    let store = MemoryStore::with_capacity(2);
    let now = Instant::now();
    let (mut c, _rx) = coordinator(&store, now);
    let id = current(&c);

    for s in ["a", "b", "c", "d", "e"] {
        c.submit(line(s), now).unwrap();
    }
    assert_eq!(c.pending_len(), 3);
    assert_eq!(c.max_pending(), 3);

    store.drain();
    assert_eq!(c.on_drain(&id, now).unwrap(), 2);
    assert!(c.is_queueing(), "sink filled up again");
    assert_eq!(c.pending_len(), 1);

    // Still queueing: new submits go behind the backlog
    assert_eq!(c.submit(line("f"), now).unwrap(), Admission::Queued);

    store.drain();
    assert_eq!(c.on_drain(&id, now).unwrap(), 2);
    store.drain();
    assert_eq!(c.on_drain(&id, now).unwrap(), 0);
    assert!(!c.is_queueing());

    assert_eq!(c.submit(line("g"), now).unwrap(), Admission::Written);
    assert_eq!(store.all_texts(), vec!["a", "b", "c", "d", "e", "f", "g"]);
    assert_eq!(c.lines_written(), 7);
}

#[test]
fn test_drain_from_other_sink_ignored() {
    let store = MemoryStore::with_capacity(1);
    let now = Instant::now();
    let (mut c, _rx) = coordinator(&store, now);

    c.submit(line("a"), now).unwrap();
    c.submit(line("b"), now).unwrap();

    assert_eq!(c.on_drain(&SinkId::new("elsewhere"), now).unwrap(), 0);
    assert_eq!(c.pending_len(), 1);
}

#[test]
fn test_rotation_drains_queue_into_new_sink() {
    let store = MemoryStore::with_capacity(1);
    let start = Instant::now();
    let (mut c, mut rx) = coordinator(&store, start);

    c.submit(line("a"), start).unwrap();
    assert_eq!(c.submit(line("b"), start).unwrap(), Admission::Queued);

    assert_eq!(c.on_timer(start + INTERVAL).unwrap(), TimerOutcome::Rotated);
    assert_eq!(c.pending_len(), 0);

    let written = store.written_files();
    assert_eq!(written[0].texts(), vec!["a"]);
    assert_eq!(written[1].texts(), vec!["b"]);
    assert!(rx.try_recv().is_ok());
}

// ============================================================================
// Sink failures
// ============================================================================

#[test]
fn test_rejected_line_goes_back_to_front() {
    let store = MemoryStore::new();
    let start = Instant::now();
    let (mut c, _rx) = coordinator(&store, start);

    c.submit(line("a"), start).unwrap();
    store.fail_latest();

    assert!(c.submit(line("b"), start).is_err());
    assert_eq!(c.submit(line("c"), start).unwrap(), Admission::Queued);
    assert_eq!(c.pending_len(), 2);

    assert_eq!(c.on_timer(start + INTERVAL).unwrap(), TimerOutcome::Recovered);
    assert_eq!(c.pending_len(), 0);

    let written = store.written_files();
    assert_eq!(written.len(), 2);
    assert_eq!(written[0].texts(), vec!["a"]);
    assert_eq!(written[1].texts(), vec!["b", "c"]);
}

#[test]
fn test_error_event_discards_and_recover_drains() {
    let store = MemoryStore::new();
    let now = Instant::now();
    let (mut c, _rx) = coordinator(&store, now);
    let id = current(&c);

    store.fail_latest();
    assert!(c.on_sink_failed(&id, Vec::new()));
    assert!(!c.on_sink_failed(&id, Vec::new()));

    assert_eq!(c.submit(line("x"), now).unwrap(), Admission::Queued);
    assert_eq!(c.recover(now).unwrap(), 1);
    assert_eq!(store.all_texts(), vec!["x"]);
}

#[test]
fn test_unwritten_lines_requeued_ahead_of_later_submits() {
    let store = MemoryStore::new();
    let now = Instant::now();
    let (mut c, _rx) = coordinator(&store, now);
    let id = current(&c);

    for s in ["a", "b", "c"] {
        c.submit(line(s), now).unwrap();
    }
    assert_eq!(c.lines_written(), 3);
    let bytes_before = c.writer().state().total_bytes();

    // The file took "a" but never wrote "b" and "c"
    store.fail_latest();
    assert!(c.submit(line("d"), now).is_err());
    assert_eq!(c.submit(line("e"), now).unwrap(), Admission::Queued);

    assert!(!c.on_sink_failed(&id, vec![line("b"), line("c")]));
    assert_eq!(c.pending_len(), 4);
    assert_eq!(c.lines_written(), 1);
    assert_eq!(c.writer().state().total_bytes(), bytes_before - 4);

    c.recover(now).unwrap();
    assert_eq!(c.pending_len(), 0);
    assert_eq!(c.lines_written(), 5);

    let written = store.written_files();
    assert_eq!(written.len(), 2);
    assert_eq!(written[1].texts(), vec!["b", "c", "d", "e"]);
}

#[test]
fn test_unwritten_lines_from_retired_sink_go_to_current() {
    let store = MemoryStore::new();
    let now = Instant::now();
    let (mut c, _rx) = coordinator(&store, now);
    let retired = current(&c);

    c.submit(line("a"), now).unwrap();
    let later = now + INTERVAL;
    assert_eq!(c.on_timer(later).unwrap(), TimerOutcome::Rotated);
    assert_ne!(current(&c), retired);

    assert!(!c.on_sink_failed(&retired, vec![line("a")]));
    assert!(c.is_queueing());
    assert_eq!(c.on_capacity(later).unwrap(), 1);
    assert!(!c.is_queueing());

    let files = store.files();
    assert_eq!(files[1].texts(), vec!["a"]);
}

// ============================================================================
// Shutdown
// ============================================================================

#[test]
fn test_flush_and_end_ignores_backpressure() {
    let store = MemoryStore::with_capacity(1);
    let now = Instant::now();
    let (mut c, _rx) = coordinator(&store, now);

    for s in ["a", "b", "c"] {
        c.submit(line(s), now).unwrap();
    }
    assert_eq!(c.pending_len(), 2);

    c.flush_and_end(now).unwrap();
    assert_eq!(c.pending_len(), 0);
    assert_eq!(store.all_texts(), vec!["a", "b", "c"]);
    assert_eq!(c.writer().phase(), WriterPhase::Closed);
}

#[test]
fn test_flush_and_end_recovers_once() {
    let store = MemoryStore::new();
    let now = Instant::now();
    let (mut c, _rx) = coordinator(&store, now);

    c.submit(line("a"), now).unwrap();
    store.fail_latest();
    assert!(c.submit(line("b"), now).is_err());

    c.flush_and_end(now).unwrap();
    let written = store.written_files();
    assert_eq!(written[1].texts(), vec!["b"]);
}

#[test]
fn test_flush_and_end_reports_dropped_lines() {
    let store = MemoryStore::new();
    let now = Instant::now();
    let (mut c, _rx) = coordinator(&store, now);

    store.fail_latest();
    store.set_fail_create(true);
    assert!(c.submit(line("a"), now).is_err());
    c.submit(line("b"), now).unwrap();

    let err = c.flush_and_end(now).unwrap_err();
    assert!(matches!(err, BatchError::Dropped { count: 2, .. }));
    assert_eq!(c.writer().phase(), WriterPhase::Closed);
}

#[test]
fn test_destroy_clears_queue() {
    let store = MemoryStore::with_capacity(1);
    let now = Instant::now();
    let (mut c, _rx) = coordinator(&store, now);

    c.submit(line("a"), now).unwrap();
    c.submit(line("b"), now).unwrap();
    c.destroy();

    assert_eq!(c.pending_len(), 0);
    assert!(store.files()[0].destroyed);
}
