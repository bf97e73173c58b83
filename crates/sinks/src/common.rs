//! Common types shared by the pipeline stages
//!
//! Error taxonomy and the sink identity type.

use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use thiserror::Error;

/// Identity of one destination (one batch file, or one in-memory buffer)
///
/// Cheap to clone; compared by path.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SinkId(Arc<Path>);

impl SinkId {
    /// Create a sink id from a path
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self(Arc::from(path.into()))
    }

    /// Path of the destination
    pub fn path(&self) -> &Path {
        &self.0
    }
}

impl fmt::Display for SinkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.display())
    }
}

/// Record encoding failures
///
/// These are caller-data problems; the record never enters the pipeline.
#[derive(Debug, Error)]
pub enum EncodeError {
    /// Record is not a JSON object
    #[error("expected object, got {found}")]
    InvalidShape {
        /// Kind of value that was supplied
        found: &'static str,
    },

    /// Record cannot be represented as JSON
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl EncodeError {
    /// Create an invalid shape error
    pub fn invalid_shape(found: &'static str) -> Self {
        Self::InvalidShape { found }
    }
}

/// Sink I/O errors
#[derive(Debug, Error)]
pub enum SinkError {
    /// Destination could not be opened
    #[error("failed to open {path}: {source}")]
    Open {
        /// Destination path
        path: PathBuf,
        /// Underlying I/O error
        #[source]
        source: io::Error,
    },

    /// Append failed (after retries)
    #[error("write to {path} failed: {source}")]
    Write {
        /// Destination path
        path: PathBuf,
        /// Underlying I/O error
        #[source]
        source: io::Error,
    },

    /// Flush or sync failed
    #[error("flush of {path} failed: {source}")]
    Flush {
        /// Destination path
        path: PathBuf,
        /// Underlying I/O error
        #[source]
        source: io::Error,
    },

    /// Sink no longer accepts writes
    #[error("sink {0} is closed")]
    Closed(SinkId),

    /// No current sink (discarded after a failure, or writer closed)
    #[error("no sink available")]
    Unavailable,

    /// Sink factory cannot produce any sink
    #[error("cannot create sink in {path}: {message}")]
    Factory {
        /// Directory the factory writes into
        path: PathBuf,
        /// What went wrong
        message: String,
    },
}

impl SinkError {
    /// Create a factory error
    pub fn factory(path: impl Into<PathBuf>, message: impl Into<String>) -> Self {
        Self::Factory {
            path: path.into(),
            message: message.into(),
        }
    }

    /// Whether this error means no sink can be produced at all
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Factory { .. })
    }
}

/// Errors surfaced to callers of the batch file pipeline
#[derive(Debug, Error)]
pub enum BatchError {
    /// Record rejected before entering the pipeline
    #[error(transparent)]
    Encode(#[from] EncodeError),

    /// Current sink failed
    #[error(transparent)]
    Sink(#[from] SinkError),

    /// Finalize action failed for a retired sink
    #[error("failed to finalize {path}: {source}")]
    Finalize {
        /// Retired file
        path: PathBuf,
        /// Underlying I/O error
        #[source]
        source: io::Error,
    },

    /// Pipeline has been ended or destroyed
    #[error("pipeline for stream '{stream}' is closed")]
    Closed {
        /// Stream name
        stream: String,
    },

    /// Accepted lines that could not be written before shutdown
    #[error("{count} queued lines dropped at shutdown: {source}")]
    Dropped {
        /// Number of lines lost
        count: usize,
        /// Last sink failure
        #[source]
        source: SinkError,
    },

    /// Stream name cannot be used in a file name
    #[error("invalid stream name '{stream}'")]
    InvalidStream {
        /// Offending name
        stream: String,
    },

    /// Configuration rejected
    #[error("configuration error: {0}")]
    Config(String),
}

impl BatchError {
    /// Create a closed error
    pub fn closed(stream: impl Into<String>) -> Self {
        Self::Closed {
            stream: stream.into(),
        }
    }

    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create a finalize error
    pub fn finalize(path: impl Into<PathBuf>, source: io::Error) -> Self {
        Self::Finalize {
            path: path.into(),
            source,
        }
    }
}

#[cfg(test)]
#[path = "common_test.rs"]
mod common_test;
