//! Routes records to per-stream pipelines
//!
//! Pipelines are created lazily on the first record for a stream. All of
//! them share one configuration, one clock and one event channel.

use std::sync::Arc;

use dashmap::DashMap;
use serde_json::Value;

use crate::common::BatchError;
use crate::util::clock::{Clock, SystemClock};

use super::{
    BatchEventReceiver, BatchEventSender, BatchFile, BatchFileConfig, BatchFileMetricsHandle,
    MetricsSnapshot,
};

/// Many streams, one output directory
pub struct BatchRouter {
    config: BatchFileConfig,
    clock: Arc<dyn Clock>,
    events: BatchEventSender,
    files: DashMap<Arc<str>, BatchFile>,
}

impl BatchRouter {
    /// Create a router with its own event channel
    ///
    /// # Errors
    ///
    /// Invalid configuration.
    pub fn new(config: BatchFileConfig) -> Result<(Self, BatchEventReceiver), BatchError> {
        let (events, receiver) = tokio::sync::mpsc::unbounded_channel();
        let router = Self::with_clock(config, Arc::new(SystemClock), events)?;
        Ok((router, receiver))
    }

    /// Create a router reporting to `events`
    ///
    /// # Errors
    ///
    /// Invalid configuration.
    pub fn with_clock(
        config: BatchFileConfig,
        clock: Arc<dyn Clock>,
        events: BatchEventSender,
    ) -> Result<Self, BatchError> {
        config.validate()?;
        Ok(Self {
            config,
            clock,
            events,
            files: DashMap::new(),
        })
    }

    /// Submit a record to `stream`, starting its pipeline if needed
    ///
    /// # Errors
    ///
    /// Invalid stream name, pipeline start failure, or the submit error.
    pub fn submit(&self, stream: &str, record: &Value) -> Result<(), BatchError> {
        if let Some(file) = self.files.get(stream) {
            return file.submit(record);
        }

        let file = self
            .files
            .entry(Arc::from(stream))
            .or_try_insert_with(|| {
                BatchFile::create_with(
                    stream,
                    self.config.clone(),
                    Arc::clone(&self.clock),
                    self.events.clone(),
                )
            })?;
        file.submit(record)
    }

    /// Number of running pipelines
    pub fn stream_count(&self) -> usize {
        self.files.len()
    }

    /// Names of running pipelines
    pub fn streams(&self) -> Vec<Arc<str>> {
        self.files.iter().map(|e| Arc::clone(e.key())).collect()
    }

    /// Metrics handle for one stream
    pub fn metrics_handle(&self, stream: &str) -> Option<BatchFileMetricsHandle> {
        self.files.get(stream).map(|f| f.metrics_handle())
    }

    /// End every pipeline and wait for each to finish
    pub async fn end_all(&self) -> Vec<(Arc<str>, MetricsSnapshot)> {
        let mut results = Vec::new();
        for stream in self.streams() {
            // Removed before awaiting; no map guard is held across the await
            if let Some((stream, file)) = self.files.remove(&stream) {
                let snapshot = file.end().await;
                results.push((stream, snapshot));
            }
        }
        results
    }
}
