//! Download task: identity, state machine and cancellation scope

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::core::models::{AppError, AppResult, Item, SubItem, TaskPriority, TaskStatus, TaskType};

/// Retry budget given to tasks that do not specify one
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Mutable part of a task, guarded by one lock
#[derive(Debug, Clone)]
struct TaskState {
    status: TaskStatus,
    priority: TaskPriority,
    output_dir: PathBuf,
    retry_count: u32,
    max_retries: u32,
    error: Option<String>,
    started_at: Option<DateTime<Utc>>,
    completed_at: Option<DateTime<Utc>>,
}

/// A unit of download work.
///
/// Identity (ID, type, targets) is immutable; status, priority, retry
/// bookkeeping and timestamps live behind a lock. Each instance owns its own
/// cancellation token, so a retry is always a fresh instance built by
/// [`DownloadTask::clone_for_retry`].
#[derive(Debug)]
pub struct DownloadTask {
    id: String,
    task_type: TaskType,
    item: Arc<Item>,
    sub_item: Option<SubItem>,
    batch: Vec<Arc<Item>>,
    created_at: DateTime<Utc>,
    cancel_token: CancellationToken,
    state: RwLock<TaskState>,
}

/// Serializable point-in-time view of a task
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TaskSnapshot {
    pub id: String,
    pub task_type: TaskType,
    pub status: TaskStatus,
    pub priority: TaskPriority,
    pub item_id: u64,
    pub item_name: String,
    pub sub_item_seq: Option<u32>,
    pub output_dir: PathBuf,
    pub retry_count: u32,
    pub max_retries: u32,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl DownloadTask {
    /// Task covering every sub-item of `item`
    pub fn new_item(item: Item, output_dir: impl Into<PathBuf>) -> Self {
        let id = item_task_id(item.id);
        Self::build(id, TaskType::Item, Arc::new(item), None, Vec::new(), output_dir.into())
    }

    /// Task covering exactly one sub-item
    pub fn new_sub_item(item: Item, sub_item: SubItem, output_dir: impl Into<PathBuf>) -> Self {
        let id = sub_item_task_id(item.id, sub_item.id);
        Self::build(
            id,
            TaskType::SubItem,
            Arc::new(item),
            Some(sub_item),
            Vec::new(),
            output_dir.into(),
        )
    }

    /// Task that fans out into one item task per member when scheduled
    pub fn new_batch(items: Vec<Item>, output_dir: impl Into<PathBuf>) -> AppResult<Self> {
        let batch: Vec<Arc<Item>> = items.into_iter().map(Arc::new).collect();
        let first = batch
            .first()
            .cloned()
            .ok_or_else(|| AppError::InvalidTask("batch task needs at least one item".into()))?;
        let id = format!("batch-{}-{}", first.id, uuid::Uuid::new_v4().simple());
        Ok(Self::build(id, TaskType::Batch, first, None, batch, output_dir.into()))
    }

    fn build(
        id: String,
        task_type: TaskType,
        item: Arc<Item>,
        sub_item: Option<SubItem>,
        batch: Vec<Arc<Item>>,
        output_dir: PathBuf,
    ) -> Self {
        Self {
            id,
            task_type,
            item,
            sub_item,
            batch,
            created_at: Utc::now(),
            cancel_token: CancellationToken::new(),
            state: RwLock::new(TaskState {
                status: TaskStatus::Pending,
                priority: TaskPriority::Normal,
                output_dir,
                retry_count: 0,
                max_retries: DEFAULT_MAX_RETRIES,
                error: None,
                started_at: None,
                completed_at: None,
            }),
        }
    }

    pub fn with_priority(self, priority: TaskPriority) -> Self {
        self.state.write().priority = priority;
        self
    }

    pub fn with_max_retries(self, max_retries: u32) -> Self {
        self.state.write().max_retries = max_retries;
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn task_type(&self) -> TaskType {
        self.task_type
    }

    pub fn item(&self) -> &Arc<Item> {
        &self.item
    }

    pub fn sub_item(&self) -> Option<&SubItem> {
        self.sub_item.as_ref()
    }

    /// Members of a batch task; empty for other types
    pub fn batch_items(&self) -> &[Arc<Item>] {
        &self.batch
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel_token
    }

    pub fn status(&self) -> TaskStatus {
        self.state.read().status
    }

    /// Record a status transition. The first entry into `Running` stamps the
    /// start time; every entry into a terminal status stamps the completion time.
    pub fn set_status(&self, status: TaskStatus) {
        let mut state = self.state.write();
        state.status = status;
        match status {
            TaskStatus::Running => {
                if state.started_at.is_none() {
                    state.started_at = Some(Utc::now());
                }
            }
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled => {
                state.completed_at = Some(Utc::now());
            }
            TaskStatus::Pending | TaskStatus::Queued => {}
        }
    }

    pub fn priority(&self) -> TaskPriority {
        self.state.read().priority
    }

    /// Only the queue may change the priority of a queued task, since the
    /// heap position depends on it.
    pub(crate) fn set_priority(&self, priority: TaskPriority) {
        self.state.write().priority = priority;
    }

    pub fn output_dir(&self) -> PathBuf {
        self.state.read().output_dir.clone()
    }

    pub(crate) fn set_output_dir(&self, output_dir: &Path) {
        self.state.write().output_dir = output_dir.to_path_buf();
    }

    pub fn retry_count(&self) -> u32 {
        self.state.read().retry_count
    }

    pub fn max_retries(&self) -> u32 {
        self.state.read().max_retries
    }

    pub fn can_retry(&self) -> bool {
        let state = self.state.read();
        state.retry_count < state.max_retries
    }

    pub fn increment_retry(&self) {
        self.state.write().retry_count += 1;
    }

    pub(crate) fn reset_retries(&self) {
        self.state.write().retry_count = 0;
    }

    pub fn error(&self) -> Option<String> {
        self.state.read().error.clone()
    }

    pub fn set_error(&self, error: impl ToString) {
        self.state.write().error = Some(error.to_string());
    }

    /// Fire the cancellation signal. The status is forced to `Cancelled`
    /// regardless of the current state.
    pub fn cancel(&self) {
        let mut state = self.state.write();
        self.cancel_token.cancel();
        state.status = TaskStatus::Cancelled;
        state.completed_at = Some(Utc::now());
    }

    /// Like [`DownloadTask::cancel`], but leaves a task that already reached a
    /// terminal status untouched. Returns whether the signal was fired.
    pub(crate) fn cancel_unless_terminal(&self) -> bool {
        let mut state = self.state.write();
        if state.status.is_terminal() {
            return false;
        }
        self.cancel_token.cancel();
        state.status = TaskStatus::Cancelled;
        state.completed_at = Some(Utc::now());
        true
    }

    /// Record a terminal status, unless the cancellation signal has already
    /// fired, in which case the task ends `Cancelled`. Returns what was recorded.
    pub(crate) fn conclude(&self, status: TaskStatus) -> TaskStatus {
        let mut state = self.state.write();
        let status = if self.cancel_token.is_cancelled() {
            TaskStatus::Cancelled
        } else {
            status
        };
        state.status = status;
        state.completed_at = Some(Utc::now());
        status
    }

    /// Reads the signal, not the status field.
    pub fn is_cancelled(&self) -> bool {
        self.cancel_token.is_cancelled()
    }

    pub fn is_terminal(&self) -> bool {
        self.status().is_terminal()
    }

    pub fn started_at(&self) -> Option<DateTime<Utc>> {
        self.state.read().started_at
    }

    pub fn completed_at(&self) -> Option<DateTime<Utc>> {
        self.state.read().completed_at
    }

    /// Time spent running so far, or start to completion once finished
    pub fn duration(&self) -> Duration {
        let state = self.state.read();
        let Some(started) = state.started_at else {
            return Duration::ZERO;
        };
        let end = state.completed_at.unwrap_or_else(Utc::now);
        (end - started).to_std().unwrap_or_default()
    }

    /// Fresh instance for another attempt: same ID, priority, targets and
    /// retry count, new cancellation scope, status `Pending`.
    pub fn clone_for_retry(&self) -> Self {
        let state = self.state.read();
        Self {
            id: self.id.clone(),
            task_type: self.task_type,
            item: Arc::clone(&self.item),
            sub_item: self.sub_item.clone(),
            batch: self.batch.clone(),
            created_at: Utc::now(),
            cancel_token: CancellationToken::new(),
            state: RwLock::new(TaskState {
                status: TaskStatus::Pending,
                priority: state.priority,
                output_dir: state.output_dir.clone(),
                retry_count: state.retry_count,
                max_retries: state.max_retries,
                error: None,
                started_at: None,
                completed_at: None,
            }),
        }
    }

    pub fn snapshot(&self) -> TaskSnapshot {
        let state = self.state.read();
        TaskSnapshot {
            id: self.id.clone(),
            task_type: self.task_type,
            status: state.status,
            priority: state.priority,
            item_id: self.item.id,
            item_name: self.item.name.clone(),
            sub_item_seq: self.sub_item.as_ref().map(|s| s.seq),
            output_dir: state.output_dir.clone(),
            retry_count: state.retry_count,
            max_retries: state.max_retries,
            error: state.error.clone(),
            created_at: self.created_at,
            started_at: state.started_at,
            completed_at: state.completed_at,
        }
    }
}

pub fn item_task_id(item_id: u64) -> String {
    format!("item-{}", item_id)
}

pub fn sub_item_task_id(item_id: u64, sub_item_id: u64) -> String {
    format!("sub-item-{}-{}", item_id, sub_item_id)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_item() -> Item {
        Item::new(1, "BV1xx411c7mD", "Sample video")
            .with_sub_items(vec![SubItem::new(1, 1, 1, "Part 1")])
    }

    #[test]
    fn test_derived_ids() {
        let item = sample_item();
        let sub = item.sub_items[0].clone();

        assert_eq!(DownloadTask::new_item(item.clone(), "./downloads").id(), "item-1");
        assert_eq!(
            DownloadTask::new_sub_item(item, sub, "./downloads").id(),
            "sub-item-1-1"
        );
    }

    #[test]
    fn test_batch_ids_are_unique() {
        let a = DownloadTask::new_batch(vec![sample_item()], "./downloads").unwrap();
        let b = DownloadTask::new_batch(vec![sample_item()], "./downloads").unwrap();
        assert_ne!(a.id(), b.id());
        assert!(a.id().starts_with("batch-1-"));
        assert_eq!(a.batch_items().len(), 1);
    }

    #[test]
    fn test_empty_batch_rejected() {
        let result = DownloadTask::new_batch(Vec::new(), "./downloads");
        assert!(matches!(result, Err(AppError::InvalidTask(_))));
    }

    #[test]
    fn test_status_timestamps() {
        let task = DownloadTask::new_item(sample_item(), "./downloads");
        assert_eq!(task.status(), TaskStatus::Pending);
        assert!(task.started_at().is_none());

        task.set_status(TaskStatus::Running);
        let started = task.started_at().unwrap();

        // A second entry into Running keeps the first start time
        task.set_status(TaskStatus::Running);
        assert_eq!(task.started_at(), Some(started));

        std::thread::sleep(Duration::from_millis(10));
        task.set_status(TaskStatus::Completed);
        assert!(task.completed_at().is_some());
        assert!(task.duration() > Duration::ZERO);
        assert!(task.is_terminal());
    }

    #[test]
    fn test_retry_budget() {
        let task = DownloadTask::new_item(sample_item(), "./downloads").with_max_retries(3);
        assert!(task.can_retry());

        task.increment_retry();
        task.increment_retry();
        task.increment_retry();
        assert_eq!(task.retry_count(), 3);
        assert!(!task.can_retry());
    }

    #[test]
    fn test_cancel_wins_over_status() {
        let task = DownloadTask::new_item(sample_item(), "./downloads");
        task.set_status(TaskStatus::Running);

        task.cancel();
        assert!(task.is_cancelled());
        assert_eq!(task.status(), TaskStatus::Cancelled);
        assert!(task.completed_at().is_some());
    }

    #[test]
    fn test_conclude_respects_cancellation() {
        let task = DownloadTask::new_item(sample_item(), "./downloads");
        task.set_status(TaskStatus::Running);
        assert_eq!(task.conclude(TaskStatus::Completed), TaskStatus::Completed);

        let task = DownloadTask::new_item(sample_item(), "./downloads");
        task.set_status(TaskStatus::Running);
        task.cancel_token().cancel();
        assert_eq!(task.conclude(TaskStatus::Failed), TaskStatus::Cancelled);
        assert_eq!(task.status(), TaskStatus::Cancelled);
    }

    #[test]
    fn test_cancel_leaves_finished_task_alone() {
        let task = DownloadTask::new_item(sample_item(), "./downloads");
        task.set_status(TaskStatus::Running);
        assert_eq!(task.conclude(TaskStatus::Completed), TaskStatus::Completed);

        assert!(!task.cancel_unless_terminal());
        assert!(!task.is_cancelled());
        assert_eq!(task.status(), TaskStatus::Completed);

        let running = DownloadTask::new_item(sample_item(), "./downloads");
        running.set_status(TaskStatus::Running);
        assert!(running.cancel_unless_terminal());
        assert!(running.is_cancelled());
        assert_eq!(running.status(), TaskStatus::Cancelled);
    }

    #[test]
    fn test_clone_for_retry() {
        let task = DownloadTask::new_item(sample_item(), "./downloads")
            .with_priority(TaskPriority::High)
            .with_max_retries(5);
        task.increment_retry();
        task.increment_retry();
        task.set_error("network down");
        task.cancel();

        let cloned = task.clone_for_retry();
        assert_eq!(cloned.id(), task.id());
        assert_eq!(cloned.priority(), TaskPriority::High);
        assert_eq!(cloned.retry_count(), 2);
        assert_eq!(cloned.max_retries(), 5);
        assert_eq!(cloned.status(), TaskStatus::Pending);
        assert!(cloned.error().is_none());
        assert!(!cloned.is_cancelled());
    }

    #[test]
    fn test_snapshot() {
        let item = sample_item();
        let sub = item.sub_items[0].clone();
        let task = DownloadTask::new_sub_item(item, sub, "./downloads/sample");
        task.set_error("boom");

        let snapshot = task.snapshot();
        assert_eq!(snapshot.id, "sub-item-1-1");
        assert_eq!(snapshot.task_type, TaskType::SubItem);
        assert_eq!(snapshot.sub_item_seq, Some(1));
        assert_eq!(snapshot.error.as_deref(), Some("boom"));
        assert_eq!(snapshot.output_dir, PathBuf::from("./downloads/sample"));
    }
}
