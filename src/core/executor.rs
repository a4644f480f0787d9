//! Collaborator contracts consumed by the download manager
//!
//! The manager never transfers media itself. Each sub-item is handed to a
//! [`SubItemExecutor`], and successful downloads are reported to a
//! [`DownloadRecorder`] so the persistence layer can flag them.

use std::path::Path;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::core::error_handling::ExecutorError;
use crate::core::models::{Item, SubItem};
use crate::core::progress_tracker::ProgressReporter;

/// Per-call context passed to the executor
#[derive(Debug, Clone)]
pub struct ExecutionContext {
    /// Fires when the owning task is cancelled or the manager stops
    pub cancel: CancellationToken,

    /// Progress sink for this sub-item
    pub progress: ProgressReporter,
}

impl ExecutionContext {
    pub fn new(cancel: CancellationToken, progress: ProgressReporter) -> Self {
        Self { cancel, progress }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

/// Downloads one sub-item into `output_dir`.
///
/// Implementations may block for a long time; the manager does not impose a
/// timeout and only observes cancellation after the call returns.
#[async_trait]
pub trait SubItemExecutor: Send + Sync {
    async fn execute_sub_item(
        &self,
        ctx: &ExecutionContext,
        item: &Item,
        sub_item: &SubItem,
        output_dir: &Path,
    ) -> Result<(), ExecutorError>;
}

/// Persists the "downloaded" flag once media is on disk. Failures are logged by
/// the caller and never fail the task.
#[async_trait]
pub trait DownloadRecorder: Send + Sync {
    async fn mark_item_downloaded(&self, item: &Item) -> anyhow::Result<()>;

    async fn mark_sub_item_downloaded(&self, sub_item: &SubItem) -> anyhow::Result<()>;
}

/// Recorder that stores nothing
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopRecorder;

#[async_trait]
impl DownloadRecorder for NoopRecorder {
    async fn mark_item_downloaded(&self, _item: &Item) -> anyhow::Result<()> {
        Ok(())
    }

    async fn mark_sub_item_downloaded(&self, _sub_item: &SubItem) -> anyhow::Result<()> {
        Ok(())
    }
}
