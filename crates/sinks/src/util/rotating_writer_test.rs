//! Tests for the rotating writer

use std::time::Duration;

use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TryRecvError;
use tokio::time::Instant;

use crate::common::SinkError;
use crate::util::memory_sink::{MemorySinkFactory, MemoryStore};
use crate::util::rotating_writer::{
    NoticeReceiver, RotatingWriter, TimerOutcome, WriterPhase,
};
use crate::util::rotation_policy::{RotationPolicy, RotationTrigger};
use crate::util::row_encoder::Line;
use crate::util::sink::Capacity;

const INTERVAL: Duration = Duration::from_secs(5);

fn line(s: &str) -> Line {
    Line::from_bytes(format!("{s}\n").into_bytes())
}

fn writer_with(
    store: &MemoryStore,
    max_bytes: Option<u64>,
    start: Instant,
) -> (RotatingWriter, NoticeReceiver) {
    let (events, _events_rx) = mpsc::unbounded_channel();
    let (notices, notices_rx) = mpsc::unbounded_channel();
    let factory = MemorySinkFactory::new("t", store.clone(), events);
    let writer = RotatingWriter::new(
        Box::new(factory),
        RotationPolicy::new(INTERVAL, max_bytes),
        notices,
        start,
    )
    .unwrap();
    (writer, notices_rx)
}

// ============================================================================
// Creation and writes
// ============================================================================

#[test]
fn test_new_installs_first_sink() {
    let store = MemoryStore::new();
    let start = Instant::now();
    let (writer, _rx) = writer_with(&store, None, start);

    assert_eq!(store.files().len(), 1);
    assert_eq!(writer.phase(), WriterPhase::Active);
    assert_eq!(writer.current_id().unwrap().to_string(), "t.0");
    assert_eq!(writer.next_deadline(), Some(start + INTERVAL));
}

#[test]
fn test_new_fails_when_factory_refuses() {
    let store = MemoryStore::new();
    store.set_fail_create(true);
    let (events, _events_rx) = mpsc::unbounded_channel();
    let (notices, _notices_rx) = mpsc::unbounded_channel();

    let result = RotatingWriter::new(
        Box::new(MemorySinkFactory::new("t", store.clone(), events)),
        RotationPolicy::default(),
        notices,
        Instant::now(),
    );
    assert!(matches!(result, Err(SinkError::Factory { .. })));
}

#[test]
fn test_write_counts_bytes() {
    let store = MemoryStore::new();
    let start = Instant::now();
    let (mut writer, _rx) = writer_with(&store, None, start);

    assert_eq!(writer.write(line("abc"), start).unwrap(), Capacity::Ready);
    assert_eq!(writer.write(line("de"), start).unwrap(), Capacity::Ready);

    assert_eq!(writer.state().bytes_current(), 7);
    assert_eq!(writer.state().total_bytes(), 7);
    assert_eq!(store.all_texts(), vec!["abc", "de"]);
}

// ============================================================================
// Time rotation
// ============================================================================

#[test]
fn test_timer_before_deadline_is_idle() {
    let store = MemoryStore::new();
    let start = Instant::now();
    let (mut writer, _rx) = writer_with(&store, None, start);

    let outcome = writer.on_timer(start + Duration::from_secs(1)).unwrap();
    assert_eq!(outcome, TimerOutcome::Idle);
    assert_eq!(writer.rotations(), 0);
}

#[test]
fn test_timer_rotation_emits_notice() {
    let store = MemoryStore::new();
    let start = Instant::now();
    let (mut writer, mut rx) = writer_with(&store, None, start);

    writer.write(line("a"), start).unwrap();
    let at = start + INTERVAL;
    assert_eq!(writer.on_timer(at).unwrap(), TimerOutcome::Rotated);

    let notice = rx.try_recv().unwrap();
    assert_eq!(notice.previous.id.to_string(), "t.0");
    assert_eq!(notice.previous.bytes_written, 2);
    assert_eq!(notice.next.unwrap().to_string(), "t.1");
    assert_eq!(notice.trigger, Some(RotationTrigger::Time));

    assert_eq!(writer.state().bytes_current(), 0);
    assert_eq!(writer.next_deadline(), Some(at + INTERVAL));
    assert!(store.files()[0].ended);
}

#[test]
fn test_idle_rotation_sends_no_notice() {
    let store = MemoryStore::new();
    let start = Instant::now();
    let (mut writer, mut rx) = writer_with(&store, None, start);

    assert_eq!(writer.on_timer(start + INTERVAL).unwrap(), TimerOutcome::Rotated);

    assert!(matches!(rx.try_recv(), Err(TryRecvError::Empty)));
    assert_eq!(writer.rotations(), 1);
    assert_eq!(store.files().len(), 2);
}

#[test]
fn test_late_write_rotates_first() {
    let store = MemoryStore::new();
    let start = Instant::now();
    let (mut writer, mut rx) = writer_with(&store, None, start);

    writer.write(line("a"), start).unwrap();
    writer
        .write(line("b"), start + INTERVAL + Duration::from_millis(1))
        .unwrap();

    let notice = rx.try_recv().unwrap();
    assert_eq!(notice.trigger, Some(RotationTrigger::Time));

    let written = store.written_files();
    assert_eq!(written.len(), 2);
    assert_eq!(written[0].texts(), vec!["a"]);
    assert_eq!(written[1].texts(), vec!["b"]);
}

// ============================================================================
// Size rotation
// ============================================================================

#[test]
fn test_size_rotation_moves_line_to_new_sink() {
    let store = MemoryStore::new();
    let start = Instant::now();
    let (mut writer, mut rx) = writer_with(&store, Some(10), start);

    writer.write(line("aaaa"), start).unwrap();
    writer.write(line("bbbb"), start).unwrap();
    writer.write(line("cc"), start).unwrap();

    let notice = rx.try_recv().unwrap();
    assert_eq!(notice.trigger, Some(RotationTrigger::Size));
    assert_eq!(notice.previous.bytes_written, 10);

    let written = store.written_files();
    assert_eq!(written[0].texts(), vec!["aaaa", "bbbb"]);
    assert_eq!(written[1].texts(), vec!["cc"]);
    assert_eq!(writer.state().bytes_current(), 3);
}

#[test]
fn test_size_rotation_resets_deadline() {
    let store = MemoryStore::new();
    let start = Instant::now();
    let (mut writer, _rx) = writer_with(&store, Some(4), start);

    writer.write(line("aaa"), start).unwrap();
    let later = start + Duration::from_secs(3);
    writer.write(line("bbb"), later).unwrap();

    assert_eq!(writer.next_deadline(), Some(later + INTERVAL));
    assert_eq!(
        writer.on_timer(start + INTERVAL).unwrap(),
        TimerOutcome::Idle
    );
}

#[test]
fn test_oversized_line_lands_alone() {
    let store = MemoryStore::new();
    let start = Instant::now();
    let (mut writer, _rx) = writer_with(&store, Some(4), start);

    writer.write(line("this line is far too long"), start).unwrap();
    writer.write(line("x"), start).unwrap();

    let written = store.written_files();
    assert_eq!(written.len(), 2);
    assert_eq!(written[0].texts(), vec!["this line is far too long"]);
    assert_eq!(written[1].texts(), vec!["x"]);
}

// ============================================================================
// Failures
// ============================================================================

#[test]
fn test_failed_sink_is_discarded_and_line_returned() {
    let store = MemoryStore::new();
    let start = Instant::now();
    let (mut writer, mut rx) = writer_with(&store, None, start);

    writer.write(line("a"), start).unwrap();
    store.fail_latest();

    let failure = writer.write(line("b"), start).unwrap_err();
    assert_eq!(failure.line.as_bytes(), b"b\n");
    assert!(!writer.has_sink());
    assert_eq!(writer.state().bytes_current(), 0);
    assert!(store.files()[0].destroyed);
    assert!(matches!(rx.try_recv(), Err(TryRecvError::Empty)));

    let again = writer.write(line("c"), start).unwrap_err();
    assert!(matches!(again.error, SinkError::Unavailable));
}

#[test]
fn test_timer_recovers_discarded_sink() {
    let store = MemoryStore::new();
    let start = Instant::now();
    let (mut writer, _rx) = writer_with(&store, None, start);

    let id = writer.current_id().unwrap().clone();
    assert!(writer.discard(&id));
    assert!(!writer.discard(&id));

    assert_eq!(
        writer.on_timer(start + INTERVAL).unwrap(),
        TimerOutcome::Recovered
    );
    assert!(writer.has_sink());
    assert_eq!(writer.current_id().unwrap().to_string(), "t.1");
}

#[test]
fn test_factory_failure_on_rotation() {
    let store = MemoryStore::new();
    let start = Instant::now();
    let (mut writer, mut rx) = writer_with(&store, None, start);

    writer.write(line("a"), start).unwrap();
    store.set_fail_create(true);

    let at = start + INTERVAL;
    let err = writer.on_timer(at).unwrap_err();
    assert!(err.is_fatal());
    assert!(!writer.has_sink());
    assert_eq!(writer.next_deadline(), Some(at + INTERVAL));

    // The retired sink still gets finalized
    let notice = rx.try_recv().unwrap();
    assert_eq!(notice.next, None);
    assert_eq!(notice.trigger, Some(RotationTrigger::Time));

    store.set_fail_create(false);
    writer.recover(at).unwrap();
    assert!(writer.has_sink());
    writer.write(line("b"), at).unwrap();
}

// ============================================================================
// Shutdown
// ============================================================================

#[tokio::test]
async fn test_close_emits_final_notice() {
    let store = MemoryStore::new();
    let start = Instant::now();
    let (mut writer, mut rx) = writer_with(&store, None, start);

    writer.write(line("a"), start).unwrap();
    writer.close();

    let notice = rx.recv().await.unwrap();
    assert_eq!(notice.next, None);
    assert_eq!(notice.trigger, None);
    notice.previous.closing.wait().await.unwrap();

    assert!(rx.recv().await.is_none(), "notice channel closes with the writer");
    assert_eq!(writer.phase(), WriterPhase::Closed);
    assert_eq!(writer.next_deadline(), None);

    let failure = writer.write(line("late"), start).unwrap_err();
    assert!(matches!(failure.error, SinkError::Unavailable));

    // Idempotent
    writer.close();
}

#[tokio::test]
async fn test_close_unused_sink_sends_nothing() {
    let store = MemoryStore::new();
    let (mut writer, mut rx) = writer_with(&store, None, Instant::now());

    writer.close();
    assert!(rx.recv().await.is_none());
    assert!(store.files()[0].ended);
}

#[test]
fn test_destroy_abandons_without_notice() {
    let store = MemoryStore::new();
    let start = Instant::now();
    let (mut writer, mut rx) = writer_with(&store, None, start);

    writer.write(line("a"), start).unwrap();
    writer.destroy();

    assert!(matches!(rx.try_recv(), Err(TryRecvError::Disconnected)));
    assert!(store.files()[0].destroyed);
    assert_eq!(writer.on_timer(start + INTERVAL).unwrap(), TimerOutcome::Idle);
}
