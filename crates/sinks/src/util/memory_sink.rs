//! In-memory sinks
//!
//! Lines land in a shared [`MemoryStore`] instead of files. Capacity is
//! driven by hand: a store configured with a line capacity reports `Full`
//! until [`MemoryStore::drain`] is called, which makes slow I/O and
//! backpressure reproducible in tests.

use std::io;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::common::{SinkError, SinkId};
use crate::util::row_encoder::Line;
use crate::util::sink::{
    Capacity, Closing, Sink, SinkEvent, SinkEventSender, SinkFactory, SinkSignal, WriteFailure,
};

/// Snapshot of one in-memory destination
#[derive(Debug, Clone)]
pub struct MemoryFile {
    /// Sink identity
    pub id: SinkId,
    /// Lines in write order
    pub lines: Vec<Line>,
    /// Lines written since the last drain
    pub backlog: usize,
    /// Whether `end` was called
    pub ended: bool,
    /// Whether `destroy` was called
    pub destroyed: bool,
    /// Whether the sink has been failed
    pub failed: bool,
}

impl MemoryFile {
    /// Lines as UTF-8 text without trailing newlines
    pub fn texts(&self) -> Vec<String> {
        self.lines
            .iter()
            .map(|l| String::from_utf8_lossy(l.as_bytes()).trim_end().to_string())
            .collect()
    }

    /// Total bytes held
    pub fn bytes(&self) -> u64 {
        self.lines.iter().map(|l| l.len() as u64).sum()
    }
}

struct Slot {
    file: MemoryFile,
    needs_drain: bool,
    events: SinkEventSender,
}

#[derive(Default)]
struct StoreInner {
    slots: Vec<Slot>,
    capacity: Option<usize>,
    fail_create: bool,
}

/// Shared backing store for [`MemorySink`]s
#[derive(Clone, Default)]
pub struct MemoryStore {
    inner: Arc<Mutex<StoreInner>>,
}

impl MemoryStore {
    /// Store whose sinks never report backpressure
    pub fn new() -> Self {
        Self::default()
    }

    /// Store whose sinks report `Full` once `lines` are pending
    pub fn with_capacity(lines: usize) -> Self {
        let store = Self::default();
        store.inner.lock().capacity = Some(lines);
        store
    }

    /// Snapshot of every sink created so far, in creation order
    pub fn files(&self) -> Vec<MemoryFile> {
        self.inner.lock().slots.iter().map(|s| s.file.clone()).collect()
    }

    /// Snapshot of sinks that received at least one line
    pub fn written_files(&self) -> Vec<MemoryFile> {
        self.files().into_iter().filter(|f| !f.lines.is_empty()).collect()
    }

    /// All lines across all sinks, in creation then write order
    pub fn all_texts(&self) -> Vec<String> {
        self.files().iter().flat_map(MemoryFile::texts).collect()
    }

    /// Mark the backlog of every sink written; emits `Drain` where requested
    pub fn drain(&self) {
        let mut inner = self.inner.lock();
        for slot in inner.slots.iter_mut() {
            slot.file.backlog = 0;
            if slot.needs_drain && !slot.file.failed {
                slot.needs_drain = false;
                let _ = slot.events.send(SinkEvent {
                    sink: slot.file.id.clone(),
                    signal: SinkSignal::Drain,
                });
            }
        }
    }

    /// Fail the most recently created sink, as an I/O error would
    pub fn fail_latest(&self) {
        self.fail_latest_inner(false);
    }

    /// Fail the most recently created sink, losing its backlog
    ///
    /// Lines written since the last [`drain`](MemoryStore::drain) are removed
    /// from the sink and handed back as unwritten, like a file whose buffered
    /// lines never reached the disk.
    pub fn fail_latest_with_backlog(&self) {
        self.fail_latest_inner(true);
    }

    fn fail_latest_inner(&self, lose_backlog: bool) {
        let mut inner = self.inner.lock();
        if let Some(slot) = inner.slots.last_mut() {
            slot.file.failed = true;
            let unwritten = if lose_backlog {
                let keep = slot.file.lines.len().saturating_sub(slot.file.backlog);
                slot.file.backlog = 0;
                slot.file.lines.split_off(keep)
            } else {
                Vec::new()
            };
            let _ = slot.events.send(SinkEvent {
                sink: slot.file.id.clone(),
                signal: SinkSignal::Error {
                    error: SinkError::Write {
                        path: slot.file.id.path().to_path_buf(),
                        source: io::Error::other("simulated failure"),
                    },
                    unwritten,
                },
            });
        }
    }

    /// Make subsequent `create` calls fail (or succeed again)
    pub fn set_fail_create(&self, fail: bool) {
        self.inner.lock().fail_create = fail;
    }

    fn register(&self, id: SinkId, events: SinkEventSender) -> Result<(), SinkError> {
        let mut inner = self.inner.lock();
        if inner.fail_create {
            return Err(SinkError::factory(id.path(), "store refuses new sinks"));
        }
        inner.slots.push(Slot {
            file: MemoryFile {
                id,
                lines: Vec::new(),
                backlog: 0,
                ended: false,
                destroyed: false,
                failed: false,
            },
            needs_drain: false,
            events,
        });
        Ok(())
    }

    fn update(&self, id: &SinkId, f: impl FnOnce(&mut MemoryFile)) {
        let mut inner = self.inner.lock();
        if let Some(slot) = inner.slots.iter_mut().find(|s| &s.file.id == id) {
            f(&mut slot.file);
        }
    }
}

/// Sink writing into a [`MemoryStore`]
pub struct MemorySink {
    id: SinkId,
    store: MemoryStore,
    bytes_written: u64,
}

impl Sink for MemorySink {
    fn id(&self) -> &SinkId {
        &self.id
    }

    fn bytes_written(&self) -> u64 {
        self.bytes_written
    }

    fn is_open(&self) -> bool {
        self.bytes_written > 0
    }

    fn write(&mut self, line: Line) -> Result<Capacity, WriteFailure> {
        let len = line.len() as u64;
        let mut inner = self.store.inner.lock();
        let capacity = inner.capacity;

        let slot = match inner.slots.iter_mut().find(|s| s.file.id == self.id) {
            Some(slot) if !slot.file.failed && !slot.file.ended => slot,
            _ => {
                return Err(WriteFailure {
                    line,
                    error: SinkError::Closed(self.id.clone()),
                });
            }
        };

        slot.file.lines.push(line);
        slot.file.backlog += 1;
        let status = match capacity {
            Some(cap) if slot.file.backlog >= cap => {
                slot.needs_drain = true;
                Capacity::Full
            }
            _ => Capacity::Ready,
        };
        drop(inner);

        self.bytes_written += len;
        Ok(status)
    }

    fn end(self: Box<Self>) -> Closing {
        self.store.update(&self.id, |file| file.ended = true);
        Closing::ready(self.id)
    }

    fn destroy(self: Box<Self>) {
        self.store.update(&self.id, |file| file.destroyed = true);
    }
}

/// Creates numbered [`MemorySink`]s: `<stream>.0`, `<stream>.1`, ...
pub struct MemorySinkFactory {
    stream: String,
    store: MemoryStore,
    events: SinkEventSender,
    created: u64,
}

impl MemorySinkFactory {
    /// Create a factory backed by `store`
    pub fn new(stream: impl Into<String>, store: MemoryStore, events: SinkEventSender) -> Self {
        Self {
            stream: stream.into(),
            store,
            events,
            created: 0,
        }
    }
}

impl SinkFactory for MemorySinkFactory {
    fn create(&mut self) -> Result<Box<dyn Sink>, SinkError> {
        let id = SinkId::new(format!("{}.{}", self.stream, self.created));
        self.store.register(id.clone(), self.events.clone())?;
        self.created += 1;
        Ok(Box::new(MemorySink {
            id,
            store: self.store.clone(),
            bytes_written: 0,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    fn line(s: &str) -> Line {
        Line::from_bytes(format!("{s}\n").into_bytes())
    }

    #[test]
    fn test_memory_sink_records_lines() {
        let store = MemoryStore::new();
        let (events, _rx) = mpsc::unbounded_channel();
        let mut factory = MemorySinkFactory::new("t", store.clone(), events);

        let mut sink = factory.create().unwrap();
        assert_eq!(sink.write(line("a")).unwrap(), Capacity::Ready);
        assert_eq!(sink.write(line("b")).unwrap(), Capacity::Ready);
        assert_eq!(sink.bytes_written(), 4);

        let files = store.files();
        assert_eq!(files.len(), 1);
        assert_eq!(files[0].texts(), vec!["a", "b"]);
        assert_eq!(files[0].id.to_string(), "t.0");
    }

    #[test]
    fn test_memory_sink_capacity_and_drain() {
        let store = MemoryStore::with_capacity(2);
        let (events, mut rx) = mpsc::unbounded_channel();
        let mut factory = MemorySinkFactory::new("t", store.clone(), events);
        let mut sink = factory.create().unwrap();

        assert_eq!(sink.write(line("a")).unwrap(), Capacity::Ready);
        assert_eq!(sink.write(line("b")).unwrap(), Capacity::Full);
        assert!(rx.try_recv().is_err());

        store.drain();
        let event = rx.try_recv().unwrap();
        assert_eq!(&event.sink, sink.id());
        assert!(matches!(event.signal, SinkSignal::Drain));
        assert_eq!(sink.write(line("c")).unwrap(), Capacity::Ready);
    }

    #[test]
    fn test_memory_sink_failure_returns_line() {
        let store = MemoryStore::new();
        let (events, mut rx) = mpsc::unbounded_channel();
        let mut factory = MemorySinkFactory::new("t", store.clone(), events);
        let mut sink = factory.create().unwrap();

        store.fail_latest();
        assert!(matches!(
            rx.try_recv().unwrap().signal,
            SinkSignal::Error {
                error: SinkError::Write { .. },
                ..
            }
        ));

        let failure = sink.write(line("kept")).unwrap_err();
        assert_eq!(failure.line.as_bytes(), b"kept\n");
    }

    #[test]
    fn test_memory_sink_failure_hands_back_backlog() {
        let store = MemoryStore::new();
        let (events, mut rx) = mpsc::unbounded_channel();
        let mut factory = MemorySinkFactory::new("t", store.clone(), events);
        let mut sink = factory.create().unwrap();

        sink.write(line("a")).unwrap();
        store.drain();
        sink.write(line("b")).unwrap();
        sink.write(line("c")).unwrap();
        store.fail_latest_with_backlog();

        let SinkSignal::Error { unwritten, .. } = rx.try_recv().unwrap().signal else {
            panic!("expected error signal");
        };
        let unwritten: Vec<&[u8]> = unwritten.iter().map(Line::as_bytes).collect();
        assert_eq!(unwritten, vec![b"b\n".as_slice(), b"c\n".as_slice()]);
        assert_eq!(store.files()[0].texts(), vec!["a"]);
    }

    #[test]
    fn test_memory_factory_refuses_when_configured() {
        let store = MemoryStore::new();
        let (events, _rx) = mpsc::unbounded_channel();
        let mut factory = MemorySinkFactory::new("t", store.clone(), events);

        store.set_fail_create(true);
        assert!(factory.create().is_err());
        store.set_fail_create(false);
        assert!(factory.create().is_ok());
        assert_eq!(store.files().len(), 1);
    }

    #[test]
    fn test_memory_sink_end_and_destroy_flags() {
        let store = MemoryStore::new();
        let (events, _rx) = mpsc::unbounded_channel();
        let mut factory = MemorySinkFactory::new("t", store.clone(), events);

        factory.create().unwrap().end();
        factory.create().unwrap().destroy();

        let files = store.files();
        assert!(files[0].ended);
        assert!(files[1].destroyed);
    }
}
