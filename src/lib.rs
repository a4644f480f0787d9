//! Video Archiver - download orchestration engine
//!
//! This library queues item and sub-item downloads, admits them under two
//! independent concurrency ceilings, retries failures and publishes live
//! progress to registered event handlers. Media transfer itself is delegated to
//! a [`SubItemExecutor`] supplied by the embedding application.

pub mod core;
pub mod utils;

// Re-export commonly used types
pub use core::{
    concurrency::{ConcurrencyController, ConcurrencyStats},
    config::{AppConfig, ConcurrentLimit, DownloadConfig, LoggingConfig},
    error_handling::{ExecutorError, RetryPolicy, RetryingExecutor},
    executor::{DownloadRecorder, ExecutionContext, NoopRecorder, SubItemExecutor},
    manager::{DownloadEvent, DownloadManager, EventHandler, EventType},
    models::{
        AppError, AppResult, Item, ManagerStats, SubItem, TaskPriority, TaskStatus, TaskType,
    },
    progress_tracker::{
        DownloadStatus, ItemProgress, ProgressReporter, ProgressTracker, SubItemProgress,
        SubTaskProgress,
    },
    queue::TaskQueue,
    task::{DownloadTask, TaskSnapshot},
};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library name
pub const NAME: &str = env!("CARGO_PKG_NAME");

/// Initialize the library: installs the tracing subscriber
pub fn init() {
    utils::logging::init_tracing();
    tracing::info!("{} v{} initialized", NAME, VERSION);
}
