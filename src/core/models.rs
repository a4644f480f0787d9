//! Core data models for the download engine

use serde::{Deserialize, Serialize};

use crate::core::concurrency::ConcurrencyStats;

/// One logical downloadable entity (e.g. one video) and its parts

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Item {
    pub id: u64,

    /// Identifier on the remote platform
    pub external_id: String,

    pub name: String,

    pub cover: Option<String>,

    pub sub_items: Vec<SubItem>,
}

impl Item {
    pub fn new(id: u64, external_id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id,
            external_id: external_id.into(),
            name: name.into(),
            cover: None,
            sub_items: Vec::new(),
        }
    }

    pub fn with_sub_items(mut self, sub_items: Vec<SubItem>) -> Self {
        self.sub_items = sub_items;
        self
    }
}

/// One independently downloaded part of an item

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SubItem {
    pub id: u64,

    pub item_id: u64,

    /// Platform content id of this part
    pub content_id: i64,

    /// 1-based sequence number inside the item
    pub seq: u32,

    pub name: String,
}

impl SubItem {
    pub fn new(id: u64, item_id: u64, seq: u32, name: impl Into<String>) -> Self {
        Self {
            id,
            item_id,
            content_id: 0,
            seq,
            name: name.into(),
        }
    }
}

/// Task type enumeration

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum TaskType {
    /// Every sub-item of one item, sequentially
    Item,

    /// Exactly one sub-item
    SubItem,

    /// Several items, fanned out into item tasks when scheduled
    Batch,
}

/// Task status enumeration

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,

    Queued,

    Running,

    Completed,

    Failed,

    Cancelled,
}

impl TaskStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled
        )
    }
}

/// Scheduling priority, higher values are dequeued first

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "snake_case")]
pub enum TaskPriority {
    Low = 0,

    Normal = 5,

    High = 10,

    Urgent = 15,
}

impl Default for TaskPriority {
    fn default() -> Self {
        TaskPriority::Normal
    }
}

/// Manager statistics, computed on demand

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ManagerStats {
    pub queued_tasks: usize,

    pub running_tasks: usize,

    pub completed_tasks: usize,

    pub failed_tasks: usize,

    pub cancelled_tasks: usize,

    pub total_tasks: usize,

    pub concurrency: ConcurrencyStats,
}

/// Application error types

#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid task: {0}")]
    InvalidTask(String),

    #[error("Task already exists: {0}")]
    DuplicateTask(String),

    #[error("Task not found: {0}")]
    TaskNotFound(String),

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Download manager is already running")]
    AlreadyRunning,

    #[error("Download manager is not running")]
    NotRunning,

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Executor error: {0}")]
    Executor(String),

    #[error("Persistence error: {0}")]
    Persistence(String),
}

/// Result type alias for application operations

pub type AppResult<T> = Result<T, AppError>;
