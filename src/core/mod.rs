//! Core business logic module
//!
//! This module contains the domain models, the task queue and admission
//! control, progress tracking and the download manager that ties them together.

pub mod concurrency;
pub mod config;
pub mod error_handling;
pub mod executor;
pub mod manager;
pub mod models;
pub mod progress_tracker;
pub mod queue;
pub mod task;

#[cfg(test)]
mod config_test;



// Re-export commonly used types
pub use config::AppConfig;
pub use manager::DownloadManager;
