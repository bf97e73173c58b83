//! Building blocks of the batch file pipeline
//!
//! Leaves first:
//!
//! - **sink**: the `Sink` / `SinkFactory` traits and the signal channel
//! - **lazy_sink**: file sinks that open on first write, with a writer task each
//! - **memory_sink**: in-memory sinks with manually driven capacity
//! - **row_encoder**: record → `{"table":..,"row":..}\n` line
//! - **rotation_policy**: pure time / size rotation decisions
//! - **rotating_writer**: owns the current sink, swaps it, emits notices
//! - **write_coordinator**: FIFO queueing under backpressure
//! - **finalize**: applies the finalize action to retired files
//!
//! ```text
//! [Line] → [WriteCoordinator] → [RotatingWriter] → [Sink] → [writer task] → [Disk]
//!                                      ↓ (rotation)
//!                               [RotationNotice]
//!                                      ↓
//!                             [FinalizationStage] → chmod
//! ```

pub mod clock;
pub mod finalize;
pub mod lazy_sink;
pub mod memory_sink;
pub mod rotating_writer;
pub mod rotation_policy;
pub mod row_encoder;
pub mod sink;
pub mod write_coordinator;

pub use clock::{Clock, MockClock, SystemClock};
pub use finalize::{
    FinalizationStage, FinalizeMode, FinalizeOutcome, Finalizer, ModeFinalizer, NoopFinalizer,
    READ_ONLY_MODE, ReadOnlyFinalizer,
};
pub use lazy_sink::{
    DEFAULT_EXTENSION, DEFAULT_HIGH_WATER_MARK, DEFAULT_RETRY_DELAY, DEFAULT_WRITE_RETRIES,
    FileSinkFactory, FileSinkOptions, LazyFileSink,
};
pub use memory_sink::{MemoryFile, MemorySink, MemorySinkFactory, MemoryStore};
pub use rotating_writer::{
    NoticeReceiver, NoticeSender, RetiredSink, RotatingWriter, RotationNotice, TimerOutcome,
    WriterPhase,
};
pub use rotation_policy::{
    DEFAULT_ROTATION_INTERVAL, RotationPolicy, RotationState, RotationTrigger,
};
pub use row_encoder::{Line, RowEncoder};
pub use sink::{
    Capacity, Closing, Sink, SinkEvent, SinkEventReceiver, SinkEventSender, SinkFactory,
    SinkSignal, WriteFailure,
};
pub use write_coordinator::{Admission, WriteCoordinator};
