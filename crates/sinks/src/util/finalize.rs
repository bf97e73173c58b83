//! Finalization of retired batch files
//!
//! Runs as its own task, fed by [`RotationNotice`]s. For each notice it waits
//! until the retired sink has flushed and synced, then applies the
//! [`Finalizer`] exactly once. Outcomes are reported through a callback; a
//! slow or failing finalize never holds up the write path.

use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::task::JoinHandle;

use crate::common::{BatchError, SinkError, SinkId};
use crate::util::rotating_writer::{NoticeReceiver, RotationNotice};

/// Permission bits applied by [`ReadOnlyFinalizer`]
pub const READ_ONLY_MODE: u32 = 0o444;

/// Side effect applied to a retired file
#[async_trait]
pub trait Finalizer: Send + Sync {
    /// Apply the side effect to `path`
    ///
    /// # Errors
    ///
    /// The underlying I/O error. It is reported, never retried.
    async fn finalize(&self, path: &Path) -> io::Result<()>;

    /// Name for logging
    fn name(&self) -> &'static str;
}

/// Marks files read-only (0444 on unix)
#[derive(Debug, Clone, Copy, Default)]
pub struct ReadOnlyFinalizer;

#[async_trait]
impl Finalizer for ReadOnlyFinalizer {
    async fn finalize(&self, path: &Path) -> io::Result<()> {
        #[cfg(unix)]
        {
            set_mode(path, READ_ONLY_MODE).await
        }
        #[cfg(not(unix))]
        {
            let mut permissions = tokio::fs::metadata(path).await?.permissions();
            permissions.set_readonly(true);
            tokio::fs::set_permissions(path, permissions).await
        }
    }

    fn name(&self) -> &'static str {
        "read_only"
    }
}

/// Applies explicit unix permission bits
#[derive(Debug, Clone, Copy)]
pub struct ModeFinalizer {
    mode: u32,
}

impl ModeFinalizer {
    /// Create a finalizer applying `mode`
    pub fn new(mode: u32) -> Self {
        Self { mode }
    }

    /// Permission bits applied
    pub fn mode(&self) -> u32 {
        self.mode
    }
}

#[async_trait]
impl Finalizer for ModeFinalizer {
    async fn finalize(&self, path: &Path) -> io::Result<()> {
        #[cfg(unix)]
        {
            set_mode(path, self.mode).await
        }
        #[cfg(not(unix))]
        {
            let mut permissions = tokio::fs::metadata(path).await?.permissions();
            permissions.set_readonly(self.mode & 0o222 == 0);
            tokio::fs::set_permissions(path, permissions).await
        }
    }

    fn name(&self) -> &'static str {
        "mode"
    }
}

/// Leaves files untouched
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopFinalizer;

#[async_trait]
impl Finalizer for NoopFinalizer {
    async fn finalize(&self, _path: &Path) -> io::Result<()> {
        Ok(())
    }

    fn name(&self) -> &'static str {
        "none"
    }
}

#[cfg(unix)]
async fn set_mode(path: &Path, mode: u32) -> io::Result<()> {
    use std::os::unix::fs::PermissionsExt;

    tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(mode)).await
}

/// Finalize action selected by configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FinalizeMode {
    /// Read-only (0444)
    #[default]
    ReadOnly,
    /// Explicit permission bits
    Mode(u32),
    /// No-op
    None,
}

impl FinalizeMode {
    /// Build the finalizer for this mode
    pub fn finalizer(&self) -> Arc<dyn Finalizer> {
        match self {
            Self::ReadOnly => Arc::new(ReadOnlyFinalizer),
            Self::Mode(mode) => Arc::new(ModeFinalizer::new(*mode)),
            Self::None => Arc::new(NoopFinalizer),
        }
    }
}

impl fmt::Display for FinalizeMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ReadOnly => write!(f, "read_only"),
            Self::Mode(mode) => write!(f, "{mode:04o}"),
            Self::None => write!(f, "none"),
        }
    }
}

impl FromStr for FinalizeMode {
    type Err = BatchError;

    /// `read_only`, `none`, or octal permission bits such as `0440`
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "read_only" | "readonly" | "read-only" => Ok(Self::ReadOnly),
            "none" | "off" => Ok(Self::None),
            other => {
                let digits = other.strip_prefix("0o").unwrap_or(other);
                match u32::from_str_radix(digits, 8) {
                    Ok(mode) if !digits.is_empty() && mode <= 0o7777 => Ok(Self::Mode(mode)),
                    _ => Err(BatchError::config(format!(
                        "invalid finalize mode '{s}': expected read_only, none, or octal bits"
                    ))),
                }
            }
        }
    }
}

/// Result of handling one rotation notice
#[derive(Debug)]
pub enum FinalizeOutcome {
    /// Finalizer applied
    Finalized {
        /// Retired file
        path: PathBuf,
        /// Bytes it holds
        bytes: u64,
    },
    /// Finalizer failed
    Failed {
        /// Retired file
        path: PathBuf,
        /// Why
        error: io::Error,
    },
    /// Sink did not close cleanly; nothing to finalize
    Skipped {
        /// Retired sink
        sink: SinkId,
        /// Close error (already reported by the sink)
        error: SinkError,
    },
}

/// Consumes rotation notices and finalizes retired files in order
pub struct FinalizationStage {
    finalizer: Arc<dyn Finalizer>,
    notices: NoticeReceiver,
}

impl FinalizationStage {
    /// Create a stage reading from `notices`
    pub fn new(finalizer: Arc<dyn Finalizer>, notices: NoticeReceiver) -> Self {
        Self { finalizer, notices }
    }

    /// Spawn [`FinalizationStage::run`] on the runtime
    pub fn spawn<F>(self, report: F) -> JoinHandle<()>
    where
        F: FnMut(FinalizeOutcome) + Send + 'static,
    {
        tokio::spawn(self.run(report))
    }

    /// Process notices until the channel closes
    pub async fn run<F>(mut self, mut report: F)
    where
        F: FnMut(FinalizeOutcome) + Send,
    {
        tracing::debug!(finalizer = self.finalizer.name(), "finalization stage started");

        while let Some(notice) = self.notices.recv().await {
            report(self.process(notice).await);
        }

        tracing::debug!("finalization stage stopped");
    }

    async fn process(&self, notice: RotationNotice) -> FinalizeOutcome {
        let retired = notice.previous;
        let id = retired.id;

        if let Err(error) = retired.closing.wait().await {
            tracing::warn!(path = %id, error = %error, "retired sink did not close cleanly, not finalizing");
            return FinalizeOutcome::Skipped { sink: id, error };
        }

        let path = id.path().to_path_buf();
        match self.finalizer.finalize(&path).await {
            Ok(()) => {
                tracing::debug!(
                    path = %path.display(),
                    bytes = retired.bytes_written,
                    finalizer = self.finalizer.name(),
                    "batch file finalized"
                );
                FinalizeOutcome::Finalized {
                    path,
                    bytes: retired.bytes_written,
                }
            }
            Err(error) => {
                tracing::error!(path = %path.display(), error = %error, "finalize failed");
                FinalizeOutcome::Failed { path, error }
            }
        }
    }
}

#[cfg(test)]
#[path = "finalize_test.rs"]
mod finalize_test;
