//! Rowbatch - Sinks
//!
//! Rotating batch-file writer. Records are encoded as one JSON line each and
//! appended to a sequence of files that rotate on time or size. Each retired
//! file is finalized (read-only by default) once it will not be written
//! again, so downstream bulk loaders can pick it up.
//!
//! # Architecture
//!
//! ```text
//! [caller] --record--> [BatchFile] --Line--> [actor task] --> [current file]
//!                                                 │
//!                                                 └── rotation --> [finalization task]
//! ```
//!
//! Output files are named `<path>/<stream>.<epoch_millis>.data`.
//!
//! # Example
//!
//! ```ignore
//! use rowbatch_sinks::{BatchEventKind, BatchFile, BatchFileConfig};
//! use serde_json::json;
//!
//! let config = BatchFileConfig::default().with_path("/var/spool/rows");
//! let (file, mut events) = BatchFile::create("audit_event", config)?;
//!
//! file.submit(&json!({ "user": "ada", "action": "login" }))?;
//!
//! tokio::spawn(async move {
//!     while let Some(event) = events.recv().await {
//!         if let BatchEventKind::Finalized { path, .. } = event.kind {
//!             println!("ready: {}", path.display());
//!         }
//!     }
//! });
//!
//! file.end().await;
//! ```

// =============================================================================
// Pipeline
// =============================================================================

/// Per-stream pipeline handle, events, metrics, and the multi-stream router
pub mod batch_file;

// =============================================================================
// Shared utilities
// =============================================================================

/// Pipeline stages and sink implementations
pub mod util;

/// Error taxonomy and sink identity
mod common;

// =============================================================================
// Public re-exports
// =============================================================================

pub use batch_file::{
    BatchEvent, BatchEventKind, BatchEventReceiver, BatchEventSender, BatchFile, BatchFileConfig,
    BatchFileMetrics, BatchFileMetricsHandle, BatchRouter, MetricsSnapshot,
};
pub use common::{BatchError, EncodeError, SinkError, SinkId};
pub use util::finalize::FinalizeMode;
