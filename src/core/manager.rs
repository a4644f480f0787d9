//! Download Manager - orchestrates queued downloads
//!
//! The manager owns the priority queue, the two-tier admission controller and
//! the progress tracker. A scheduling loop polls the queue on a fixed tick and
//! admits what capacity allows; every admitted task runs on its own tokio task
//! and hands each sub-item to the configured [`SubItemExecutor`].

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Instant;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use futures::FutureExt;
use parking_lot::RwLock;
use serde::ser::SerializeStruct;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use crate::core::concurrency::{ConcurrencyController, Permit};
use crate::core::config::DownloadConfig;
use crate::core::error_handling::ExecutorError;
use crate::core::executor::{DownloadRecorder, ExecutionContext, NoopRecorder, SubItemExecutor};
use crate::core::models::{
    AppError, AppResult, Item, ManagerStats, SubItem, TaskPriority, TaskStatus, TaskType,
};
use crate::core::progress_tracker::{
    DownloadStatus, ItemProgress, ProgressReporter, ProgressTracker, SubTaskProgress,
};
use crate::core::queue::TaskQueue;
use crate::core::task::{DownloadTask, TaskSnapshot};
use crate::utils::file_utils::sanitize_filename;

/// Kind of a [`DownloadEvent`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    Added,
    Started,
    Progress,
    Completed,
    Failed,
    Cancelled,
    Retrying,
}

/// Lifecycle notification broadcast to every registered handler
#[derive(Debug, Clone)]
pub struct DownloadEvent {
    pub event_type: EventType,
    pub task: Arc<DownloadTask>,
    pub progress: Option<SubTaskProgress>,
    pub message: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl DownloadEvent {
    pub fn task_id(&self) -> &str {
        self.task.id()
    }

    pub fn snapshot(&self) -> TaskSnapshot {
        self.task.snapshot()
    }
}

impl Serialize for DownloadEvent {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut state = serializer.serialize_struct("DownloadEvent", 5)?;
        state.serialize_field("type", &self.event_type)?;
        state.serialize_field("task", &self.task.snapshot())?;
        state.serialize_field("progress", &self.progress)?;
        state.serialize_field("message", &self.message)?;
        state.serialize_field("timestamp", &self.timestamp)?;
        state.end()
    }
}

/// Event callback. Each invocation runs on its own blocking thread.
pub type EventHandler = Arc<dyn Fn(&DownloadEvent) + Send + Sync>;

/// How one execution of a task ended
#[derive(Debug)]
enum Outcome {
    Completed,
    Cancelled,
    Failed(String),
}

struct RunState {
    shutdown: CancellationToken,
    scheduler: JoinHandle<()>,
    workers: TaskTracker,
}

struct ManagerInner {
    config: RwLock<DownloadConfig>,
    queue: TaskQueue,
    concurrency: ConcurrencyController,
    progress: Arc<ProgressTracker>,
    executor: Arc<dyn SubItemExecutor>,
    recorder: Arc<dyn DownloadRecorder>,
    running: DashMap<String, Arc<DownloadTask>>,
    completed: DashMap<String, Arc<DownloadTask>>,
    handlers: RwLock<Vec<EventHandler>>,
    lifecycle: Mutex<Option<RunState>>,
    is_running: AtomicBool,
    /// Held across the duplicate check of a submission, a cancellation and the
    /// dequeue-to-dispatch step, so a task is always visible in one of the
    /// queue or the running set
    admission: parking_lot::Mutex<()>,
    /// (item id, sub-item seq, sub-task name) -> last progress event
    last_progress_emit: DashMap<(u64, u32, String), Instant>,
}

/// Keeps an item registered with the per-item join while a task for it runs
struct ItemTracking {
    inner: Arc<ManagerInner>,
    item_id: u64,
}

impl ItemTracking {
    fn new(inner: &Arc<ManagerInner>, item_id: u64) -> Self {
        inner.concurrency.track_item(item_id);
        Self {
            inner: Arc::clone(inner),
            item_id,
        }
    }
}

impl Drop for ItemTracking {
    fn drop(&mut self) {
        self.inner.concurrency.untrack_item(self.item_id);
    }
}

/// Download orchestration engine. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct DownloadManager {
    inner: Arc<ManagerInner>,
}

impl std::fmt::Debug for DownloadManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DownloadManager")
            .field("is_running", &self.is_running())
            .field("queued", &self.inner.queue.size())
            .field("running", &self.inner.running.len())
            .field("completed", &self.inner.completed.len())
            .finish()
    }
}

impl DownloadManager {
    pub fn new(config: DownloadConfig, executor: Arc<dyn SubItemExecutor>) -> AppResult<Self> {
        Self::with_recorder(config, executor, Arc::new(NoopRecorder))
    }

    pub fn with_recorder(
        config: DownloadConfig,
        executor: Arc<dyn SubItemExecutor>,
        recorder: Arc<dyn DownloadRecorder>,
    ) -> AppResult<Self> {
        config
            .validate()
            .map_err(|e| AppError::Config(format!("{:#}", e)))?;
        let config = config.normalized();

        let inner = Arc::new_cyclic(|weak: &Weak<ManagerInner>| {
            let progress = Arc::new(ProgressTracker::new());
            let weak = weak.clone();
            progress.set_callback(Arc::new(
                move |item_id: u64, seq: u32, name: &str, update: &SubTaskProgress| {
                    if let Some(inner) = weak.upgrade() {
                        inner.on_progress(item_id, seq, name, update);
                    }
                },
            ));

            ManagerInner {
                concurrency: ConcurrencyController::new(
                    config.concurrent_limit.item,
                    config.concurrent_limit.sub_item,
                ),
                config: RwLock::new(config),
                queue: TaskQueue::new(),
                progress,
                executor,
                recorder,
                running: DashMap::new(),
                completed: DashMap::new(),
                handlers: RwLock::new(Vec::new()),
                lifecycle: Mutex::new(None),
                is_running: AtomicBool::new(false),
                admission: parking_lot::Mutex::new(()),
                last_progress_emit: DashMap::new(),
            }
        });

        Ok(Self { inner })
    }

    /// Start the scheduling loop. Fails if it is already running.
    pub async fn start(&self) -> AppResult<()> {
        let mut lifecycle = self.inner.lifecycle.lock().await;
        if lifecycle.is_some() {
            warn!("Download manager is already running");
            return Err(AppError::AlreadyRunning);
        }

        let shutdown = CancellationToken::new();
        let workers = TaskTracker::new();
        let scheduler = tokio::spawn(ManagerInner::run_scheduler(
            Arc::downgrade(&self.inner),
            shutdown.clone(),
            workers.clone(),
        ));

        *lifecycle = Some(RunState {
            shutdown,
            scheduler,
            workers,
        });
        self.inner.is_running.store(true, Ordering::SeqCst);

        let config = self.config();
        info!(
            "🚀 Download manager started (items: {}, sub-items: {}, tick: {}ms)",
            config.concurrent_limit.item,
            config.concurrent_limit.sub_item,
            config.schedule_interval_ms
        );
        Ok(())
    }

    /// Stop the scheduling loop, cancel every running task and wait for all
    /// workers to exit. Queued tasks stay queued.
    pub async fn stop(&self) -> AppResult<()> {
        let mut lifecycle = self.inner.lifecycle.lock().await;
        let Some(state) = lifecycle.take() else {
            return Err(AppError::NotRunning);
        };

        info!("🛑 Stopping download manager");
        state.shutdown.cancel();
        if let Err(e) = state.scheduler.await {
            warn!("Scheduling loop ended abnormally: {}", e);
        }

        let running: Vec<_> = self
            .inner
            .running
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();
        for task in &running {
            task.cancel_unless_terminal();
        }

        state.workers.close();
        state.workers.wait().await;
        self.inner.is_running.store(false, Ordering::SeqCst);

        info!(
            "✅ Download manager stopped, {} running task(s) cancelled",
            running.len()
        );
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        self.inner.is_running.load(Ordering::SeqCst)
    }

    /// Submit a task. Rejected if a task with the same ID is queued or running.
    pub fn add_task(&self, task: DownloadTask) -> AppResult<String> {
        self.inner.submit(Arc::new(task))
    }

    /// Submit a task downloading every sub-item of `item`
    pub fn add_item_task(
        &self,
        item: Item,
        output_dir: impl Into<PathBuf>,
        priority: TaskPriority,
    ) -> AppResult<String> {
        let max_retries = self.inner.config.read().max_retries;
        self.add_task(
            DownloadTask::new_item(item, output_dir)
                .with_priority(priority)
                .with_max_retries(max_retries),
        )
    }

    /// Submit a task downloading exactly one sub-item
    pub fn add_sub_item_task(
        &self,
        item: Item,
        sub_item: SubItem,
        output_dir: impl Into<PathBuf>,
        priority: TaskPriority,
    ) -> AppResult<String> {
        if sub_item.item_id != item.id {
            return Err(AppError::InvalidTask(format!(
                "sub-item {} belongs to item {}, not {}",
                sub_item.id, sub_item.item_id, item.id
            )));
        }
        let max_retries = self.inner.config.read().max_retries;
        self.add_task(
            DownloadTask::new_sub_item(item, sub_item, output_dir)
                .with_priority(priority)
                .with_max_retries(max_retries),
        )
    }

    /// Submit a batch that fans out into one item task per member when scheduled
    pub fn add_batch_task(
        &self,
        items: Vec<Item>,
        output_dir: impl Into<PathBuf>,
        priority: TaskPriority,
    ) -> AppResult<String> {
        let max_retries = self.inner.config.read().max_retries;
        self.add_task(
            DownloadTask::new_batch(items, output_dir)?
                .with_priority(priority)
                .with_max_retries(max_retries),
        )
    }

    /// Create the output folder for `item` under `base_dir` (or the configured
    /// download base) and submit an item task writing into it
    pub async fn prepare_item_task(
        &self,
        item: Item,
        base_dir: Option<&Path>,
        priority: TaskPriority,
    ) -> AppResult<String> {
        let config = self.config();
        let base = base_dir
            .map(Path::to_path_buf)
            .unwrap_or(config.download_base);
        let output_dir = item_output_dir(&base, &item, config.create_item_folder);

        tokio::fs::create_dir_all(&output_dir).await?;
        debug!(item_id = item.id, "Prepared output folder {:?}", output_dir);

        self.add_item_task(item, output_dir, priority)
    }

    /// Cancel a queued or running task.
    ///
    /// A queued task is removed and reported `Cancelled` at once. A running
    /// task is only signalled; it ends once its worker observes the signal.
    /// A task that already finished cannot be cancelled (`InvalidState`).
    pub fn cancel_task(&self, task_id: &str) -> AppResult<()> {
        let _admission = self.inner.admission.lock();
        if let Some(task) = self.inner.queue.remove(task_id) {
            task.cancel();
            self.inner.finish(&task);
            info!(task_id, "⏹️ Queued task cancelled");
            self.inner
                .emit(EventType::Cancelled, &task, None, Some("cancelled while queued".into()));
            return Ok(());
        }

        let running = self
            .inner
            .running
            .get(task_id)
            .map(|entry| Arc::clone(entry.value()));
        if let Some(task) = running {
            // Still in the running set while its result is being persisted
            if !task.cancel_unless_terminal() {
                return Err(AppError::InvalidState(format!(
                    "task {} already finished as {:?}",
                    task_id,
                    task.status()
                )));
            }
            info!(task_id, "⏹️ Cancellation requested for running task");
            return Ok(());
        }

        Err(AppError::TaskNotFound(task_id.to_string()))
    }

    /// Resubmit a failed task as a fresh attempt with its retry count reset
    pub fn retry_task(&self, task_id: &str) -> AppResult<String> {
        let task = self
            .get_task(task_id)
            .ok_or_else(|| AppError::TaskNotFound(task_id.to_string()))?;

        if task.status() != TaskStatus::Failed {
            return Err(AppError::InvalidState(format!(
                "task {} is {:?}, only failed tasks can be retried",
                task_id,
                task.status()
            )));
        }

        let retry = task.clone_for_retry();
        retry.reset_retries();
        info!(task_id, "🔄 Manual retry requested");
        self.add_task(retry)
    }

    /// Change the priority of a queued task
    pub fn update_priority(&self, task_id: &str, priority: TaskPriority) -> AppResult<()> {
        if self.inner.queue.update_priority(task_id, priority) {
            debug!(task_id, ?priority, "Priority updated");
            Ok(())
        } else {
            Err(AppError::TaskNotFound(task_id.to_string()))
        }
    }

    /// Look a task up in the queue, then the running set, then the finished set
    pub fn get_task(&self, task_id: &str) -> Option<Arc<DownloadTask>> {
        self.inner
            .queue
            .get(task_id)
            .or_else(|| {
                self.inner
                    .running
                    .get(task_id)
                    .map(|entry| Arc::clone(entry.value()))
            })
            .or_else(|| {
                self.inner
                    .completed
                    .get(task_id)
                    .map(|entry| Arc::clone(entry.value()))
            })
    }

    /// One entry per task ID, preferring the live instance over a finished one
    pub fn get_all_tasks(&self) -> Vec<Arc<DownloadTask>> {
        let mut seen = std::collections::HashSet::new();
        let mut tasks = Vec::new();
        for task in self
            .get_queued_tasks()
            .into_iter()
            .chain(self.get_running_tasks())
            .chain(self.get_completed_tasks())
        {
            if seen.insert(task.id().to_string()) {
                tasks.push(task);
            }
        }
        tasks
    }

    pub fn get_queued_tasks(&self) -> Vec<Arc<DownloadTask>> {
        self.inner.queue.get_all()
    }

    pub fn get_running_tasks(&self) -> Vec<Arc<DownloadTask>> {
        self.inner
            .running
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect()
    }

    pub fn get_completed_tasks(&self) -> Vec<Arc<DownloadTask>> {
        self.inner
            .completed
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect()
    }

    /// Counts are taken from each store in turn, not atomically across them
    pub fn get_stats(&self) -> ManagerStats {
        let mut stats = ManagerStats {
            queued_tasks: self.inner.queue.size(),
            running_tasks: self.inner.running.len(),
            concurrency: self.inner.concurrency.stats(),
            ..Default::default()
        };

        for entry in self.inner.completed.iter() {
            match entry.value().status() {
                TaskStatus::Completed => stats.completed_tasks += 1,
                TaskStatus::Failed => stats.failed_tasks += 1,
                TaskStatus::Cancelled => stats.cancelled_tasks += 1,
                _ => {}
            }
        }

        stats.total_tasks = stats.queued_tasks
            + stats.running_tasks
            + stats.completed_tasks
            + stats.failed_tasks
            + stats.cancelled_tasks;
        stats
    }

    /// Remove successfully completed tasks from the finished set; failed and
    /// cancelled ones are kept so they can be inspected or retried
    pub fn clear_completed_tasks(&self) -> usize {
        let mut removed = 0;
        self.inner.completed.retain(|_, task| {
            if task.status() == TaskStatus::Completed {
                removed += 1;
                false
            } else {
                true
            }
        });
        debug!("Cleared {} completed task(s)", removed);
        removed
    }

    pub fn config(&self) -> DownloadConfig {
        self.inner.config.read().clone()
    }

    /// Apply a new configuration while running.
    ///
    /// Changed concurrency limits replace the admission semaphores. A changed
    /// download base moves every queued task whose output directory lives under
    /// the old base onto the new one.
    pub fn update_config(&self, config: DownloadConfig) -> AppResult<()> {
        config
            .validate()
            .map_err(|e| AppError::Config(format!("{:#}", e)))?;
        let config = config.normalized();

        let old = std::mem::replace(&mut *self.inner.config.write(), config.clone());

        if old.concurrent_limit != config.concurrent_limit {
            self.inner.concurrency.update_limits(
                config.concurrent_limit.item,
                config.concurrent_limit.sub_item,
            );
        }

        if old.download_base != config.download_base {
            let mut moved = 0;
            for task in self.inner.queue.get_all() {
                let current = task.output_dir();
                if let Ok(rest) = current.strip_prefix(&old.download_base) {
                    task.set_output_dir(&config.download_base.join(rest));
                    moved += 1;
                }
            }
            info!(
                "📁 Download base changed {:?} -> {:?}, {} queued task(s) moved",
                old.download_base, config.download_base, moved
            );
        }

        info!("⚙️ Configuration updated");
        Ok(())
    }

    pub fn add_event_handler<F>(&self, handler: F)
    where
        F: Fn(&DownloadEvent) + Send + Sync + 'static,
    {
        self.inner.handlers.write().push(Arc::new(handler));
    }

    /// Wait until no task for `item_id` is running
    pub async fn wait_item(&self, item_id: u64) {
        self.inner.concurrency.wait_item(item_id).await;
    }

    pub fn progress_tracker(&self) -> &Arc<ProgressTracker> {
        &self.inner.progress
    }

    #[cfg(test)]
    pub(crate) fn throttle_entries(&self) -> usize {
        self.inner.last_progress_emit.len()
    }
}

/// Output folder for `item` under `base`
pub fn item_output_dir(base: &Path, item: &Item, create_item_folder: bool) -> PathBuf {
    if !create_item_folder {
        return base.to_path_buf();
    }
    let name = sanitize_filename(item.name.trim());
    if name.trim().is_empty() {
        base.join(sanitize_filename(&item.external_id))
    } else {
        base.join(name)
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

impl ManagerInner {
    fn submit(&self, task: Arc<DownloadTask>) -> AppResult<String> {
        let _admission = self.admission.lock();
        self.submit_locked(task)
    }

    /// Caller holds `admission`
    fn submit_locked(&self, task: Arc<DownloadTask>) -> AppResult<String> {
        let id = task.id().to_string();

        if task.task_type() == TaskType::Item && task.item().sub_items.is_empty() {
            return Err(AppError::InvalidTask(format!(
                "item {} has no sub-items",
                task.item().id
            )));
        }

        if self.queue.contains(&id) || self.running.contains_key(&id) {
            return Err(AppError::DuplicateTask(id));
        }
        if !self.queue.enqueue(Arc::clone(&task)) {
            return Err(AppError::DuplicateTask(id));
        }

        info!(
            task_id = %id,
            priority = ?task.priority(),
            "📥 Task added to queue"
        );
        self.emit(EventType::Added, &task, None, None);
        Ok(id)
    }

    async fn run_scheduler(weak: Weak<Self>, shutdown: CancellationToken, workers: TaskTracker) {
        let mut period = match weak.upgrade() {
            Some(inner) => inner.config.read().schedule_interval(),
            None => return,
        };
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {}
            }

            let Some(inner) = weak.upgrade() else {
                break;
            };
            inner.schedule_once(&workers);

            let configured = inner.config.read().schedule_interval();
            if configured != period {
                period = configured;
                ticker = tokio::time::interval(period);
                ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            }
        }

        debug!("Scheduling loop exited");
    }

    /// One scheduling step: admit at most one task
    fn schedule_once(self: &Arc<Self>, workers: &TaskTracker) {
        if !self.concurrency.can_start_item() && !self.concurrency.can_start_sub_item() {
            return;
        }
        let _admission = self.admission.lock();

        let Some(task) = self.queue.dequeue() else {
            return;
        };

        if task.is_cancelled() {
            task.cancel();
            self.finish(&task);
            self.emit(EventType::Cancelled, &task, None, Some("cancelled while queued".into()));
            return;
        }

        let permit = match task.task_type() {
            TaskType::Batch => {
                self.expand_batch(&task);
                return;
            }
            TaskType::Item => self.concurrency.try_acquire_item(),
            TaskType::SubItem => self.concurrency.try_acquire_sub_item(),
        };

        match permit {
            Some(permit) => self.dispatch(task, permit, workers),
            None => {
                debug!(task_id = %task.id(), "No capacity, task returned to queue");
                self.queue.enqueue(task);
            }
        }
    }

    fn dispatch(self: &Arc<Self>, task: Arc<DownloadTask>, permit: Permit, workers: &TaskTracker) {
        self.running.insert(task.id().to_string(), Arc::clone(&task));
        let tracking = ItemTracking::new(self, task.item().id);
        let inner = Arc::clone(self);

        workers.spawn(async move {
            let _tracking = tracking;
            let result = AssertUnwindSafe(inner.run_task(Arc::clone(&task), permit))
                .catch_unwind()
                .await;

            if let Err(panic) = result {
                let message = format!("worker panicked: {}", panic_message(panic.as_ref()));
                error!(task_id = %task.id(), "💥 {}", message);
                task.set_error(&message);
                let status = task.conclude(TaskStatus::Failed);
                inner.finish(&task);
                let event_type = if status == TaskStatus::Cancelled {
                    EventType::Cancelled
                } else {
                    EventType::Failed
                };
                inner.emit(event_type, &task, None, Some(message));
            }
        });
    }

    async fn run_task(self: &Arc<Self>, task: Arc<DownloadTask>, permit: Permit) {
        task.set_status(TaskStatus::Running);
        info!(
            task_id = %task.id(),
            attempt = task.retry_count() + 1,
            "▶️ Task started"
        );
        self.emit(EventType::Started, &task, None, None);

        let outcome = match task.task_type() {
            TaskType::Item => self.run_item(&task).await,
            TaskType::SubItem => self.run_sub_item(&task).await,
            TaskType::Batch => Outcome::Failed("batch tasks are not executed directly".into()),
        };

        self.conclude(task, outcome).await;
        drop(permit);
    }

    /// Download every sub-item in order, one sub-item permit at a time
    async fn run_item(self: &Arc<Self>, task: &Arc<DownloadTask>) -> Outcome {
        let item = Arc::clone(task.item());
        let root = self.progress_root(&item);
        root.update_status(DownloadStatus::Downloading);
        // Every attempt reports from a clean slate
        for sub_item in &item.sub_items {
            root.add_sub_item(sub_item.id, sub_item.seq, &sub_item.name);
        }

        let token = task.cancel_token().clone();
        let output_dir = task.output_dir();

        for sub_item in &item.sub_items {
            if token.is_cancelled() {
                return Outcome::Cancelled;
            }

            let permit = match self.concurrency.acquire_sub_item(&token).await {
                Ok(permit) => permit,
                Err(_) => return Outcome::Cancelled,
            };
            let outcome = self
                .execute_sub_item(task, &root, &item, sub_item, &output_dir)
                .await;
            self.concurrency.release_sub_item(permit);

            if !matches!(outcome, Outcome::Completed) {
                return outcome;
            }
        }

        Outcome::Completed
    }

    /// The sub-item permit was taken by the scheduler
    async fn run_sub_item(self: &Arc<Self>, task: &Arc<DownloadTask>) -> Outcome {
        let Some(sub_item) = task.sub_item() else {
            return Outcome::Failed("sub-item task without a sub-item".into());
        };
        if task.is_cancelled() {
            return Outcome::Cancelled;
        }

        let item = Arc::clone(task.item());
        let root = self.progress_root(&item);
        root.add_sub_item(sub_item.id, sub_item.seq, &sub_item.name);
        self.execute_sub_item(task, &root, &item, sub_item, &task.output_dir())
            .await
    }

    async fn execute_sub_item(
        &self,
        task: &DownloadTask,
        root: &ItemProgress,
        item: &Item,
        sub_item: &SubItem,
        output_dir: &Path,
    ) -> Outcome {
        let reporter = ProgressReporter::new(Arc::clone(&self.progress), root, sub_item);
        reporter.set_status(DownloadStatus::Downloading);
        let ctx = ExecutionContext::new(task.cancel_token().clone(), reporter.clone());

        debug!(
            task_id = %task.id(),
            item_id = item.id,
            seq = sub_item.seq,
            "Downloading sub-item {}",
            sub_item.name
        );

        match self
            .executor
            .execute_sub_item(&ctx, item, sub_item, output_dir)
            .await
        {
            Ok(()) => {
                reporter.set_status(DownloadStatus::Succeeded);
                Outcome::Completed
            }
            Err(ExecutorError::Cancelled) => {
                reporter.set_status(DownloadStatus::Ignored);
                Outcome::Cancelled
            }
            Err(_) if ctx.is_cancelled() => {
                reporter.set_status(DownloadStatus::Ignored);
                Outcome::Cancelled
            }
            Err(err) => {
                warn!(
                    task_id = %task.id(),
                    item_id = item.id,
                    seq = sub_item.seq,
                    "❌ Sub-item failed: {}",
                    err
                );
                reporter.set_status(DownloadStatus::Failed);
                Outcome::Failed(err.to_string())
            }
        }
    }

    fn progress_root(&self, item: &Item) -> Arc<ItemProgress> {
        self.progress
            .item_or_insert(item.id, &item.external_id, &item.name, item.sub_items.len())
    }

    async fn conclude(self: &Arc<Self>, task: Arc<DownloadTask>, outcome: Outcome) {
        let is_item_task = task.task_type() == TaskType::Item;
        let root = self.progress.get_item(task.item().id);

        match outcome {
            Outcome::Completed => {
                if task.conclude(TaskStatus::Completed) == TaskStatus::Cancelled {
                    self.finish_cancelled(&task);
                    return;
                }
                if let (true, Some(root)) = (is_item_task, &root) {
                    root.update_status(DownloadStatus::Succeeded);
                }
                self.record_downloaded(&task).await;
                self.finish(&task);
                info!(
                    task_id = %task.id(),
                    "✅ Task completed in {:.1}s",
                    task.duration().as_secs_f64()
                );
                self.emit(EventType::Completed, &task, None, None);
            }
            Outcome::Cancelled => {
                task.cancel();
                self.finish_cancelled(&task);
            }
            Outcome::Failed(message) => {
                task.set_error(&message);
                if task.conclude(TaskStatus::Failed) == TaskStatus::Cancelled {
                    self.finish_cancelled(&task);
                    return;
                }
                if let (true, Some(root)) = (is_item_task, &root) {
                    root.update_status(DownloadStatus::Failed);
                }
                self.handle_failure(task, message);
            }
        }
    }

    fn finish_cancelled(&self, task: &Arc<DownloadTask>) {
        self.finish(task);
        info!(task_id = %task.id(), "⏹️ Task cancelled");
        self.emit(EventType::Cancelled, task, None, None);
    }

    /// Re-queue a fresh attempt while budget remains, otherwise report failure
    fn handle_failure(&self, task: Arc<DownloadTask>, message: String) {
        if task.can_retry() {
            task.increment_retry();
            let retry = Arc::new(task.clone_for_retry());
            let attempt = retry.retry_count();
            let max_retries = retry.max_retries();

            self.queue.enqueue(Arc::clone(&retry));
            self.finish(&task);

            warn!(
                task_id = %task.id(),
                "🔄 Task failed, retry {}/{} queued: {}",
                attempt,
                max_retries,
                message
            );
            self.emit(
                EventType::Retrying,
                &retry,
                None,
                Some(format!("retry {}/{}: {}", attempt, max_retries, message)),
            );
        } else {
            self.finish(&task);
            error!(
                task_id = %task.id(),
                retries = task.retry_count(),
                "❌ Task failed: {}",
                message
            );
            self.emit(EventType::Failed, &task, None, Some(message));
        }
    }

    /// Best-effort persistence of the downloaded flags
    async fn record_downloaded(&self, task: &DownloadTask) {
        let item = task.item();
        match task.task_type() {
            TaskType::Item => {
                if let Err(e) = self.recorder.mark_item_downloaded(item).await {
                    warn!(item_id = item.id, "Failed to record item download: {:#}", e);
                }
                for sub_item in &item.sub_items {
                    if let Err(e) = self.recorder.mark_sub_item_downloaded(sub_item).await {
                        warn!(
                            item_id = item.id,
                            seq = sub_item.seq,
                            "Failed to record sub-item download: {:#}",
                            e
                        );
                    }
                }
            }
            TaskType::SubItem => {
                if let Some(sub_item) = task.sub_item() {
                    if let Err(e) = self.recorder.mark_sub_item_downloaded(sub_item).await {
                        warn!(
                            item_id = item.id,
                            seq = sub_item.seq,
                            "Failed to record sub-item download: {:#}",
                            e
                        );
                    }
                }
            }
            TaskType::Batch => {}
        }
    }

    /// Fan a batch out into item tasks through the normal submission path
    fn expand_batch(&self, batch: &Arc<DownloadTask>) {
        batch.set_status(TaskStatus::Running);
        self.emit(EventType::Started, batch, None, None);

        let config = self.config.read().clone();
        let base = batch.output_dir();
        let mut added = 0;

        for item in batch.batch_items() {
            if item.sub_items.is_empty() {
                debug!(item_id = item.id, "Batch member without sub-items skipped");
                continue;
            }
            let output_dir = item_output_dir(&base, item, config.create_item_folder);
            let child = DownloadTask::new_item(Item::clone(item), output_dir)
                .with_priority(batch.priority())
                .with_max_retries(batch.max_retries());

            match self.submit_locked(Arc::new(child)) {
                Ok(_) => added += 1,
                Err(AppError::DuplicateTask(id)) => {
                    debug!(batch_id = %batch.id(), "Batch member {} already scheduled", id)
                }
                Err(e) => warn!(batch_id = %batch.id(), "Batch member rejected: {}", e),
            }
        }

        let status = batch.conclude(TaskStatus::Completed);
        self.finish(batch);
        info!(
            batch_id = %batch.id(),
            "📦 Batch expanded into {} item task(s)",
            added
        );
        let event_type = if status == TaskStatus::Cancelled {
            EventType::Cancelled
        } else {
            EventType::Completed
        };
        self.emit(
            event_type,
            batch,
            None,
            Some(format!("expanded into {} item task(s)", added)),
        );
    }

    /// Move a task from the running set to the finished set. A newer instance
    /// running under the same ID is left alone.
    fn finish(&self, task: &Arc<DownloadTask>) {
        self.running
            .remove_if(task.id(), |_, current| Arc::ptr_eq(current, task));
        self.completed
            .insert(task.id().to_string(), Arc::clone(task));

        // Sub-tasks that never reported a terminal update
        let item_id = task.item().id;
        let seq = task.sub_item().map(|s| s.seq);
        self.last_progress_emit.retain(|(id, s, _), _| {
            *id != item_id || seq.is_some_and(|seq| seq != *s)
        });
    }

    fn find_running_task(&self, item_id: u64, seq: u32) -> Option<Arc<DownloadTask>> {
        let mut fallback = None;
        for entry in self.running.iter() {
            let task = entry.value();
            if task.item().id != item_id {
                continue;
            }
            match task.sub_item() {
                Some(sub_item) if sub_item.seq == seq => return Some(Arc::clone(task)),
                Some(_) => {}
                None => fallback = Some(Arc::clone(task)),
            }
        }
        fallback
    }

    fn on_progress(&self, item_id: u64, seq: u32, name: &str, update: &SubTaskProgress) {
        let Some(task) = self.find_running_task(item_id, seq) else {
            return;
        };

        let key = (item_id, seq, name.to_string());
        if update.status.is_terminal() {
            self.last_progress_emit.remove(&key);
        } else {
            let throttle = self.config.read().progress_throttle();
            let now = Instant::now();
            let mut due = true;
            self.last_progress_emit
                .entry(key)
                .and_modify(|last| {
                    if now.duration_since(*last) < throttle {
                        due = false;
                    } else {
                        *last = now;
                    }
                })
                .or_insert(now);
            if !due {
                return;
            }
        }

        self.emit(EventType::Progress, &task, Some(update.clone()), None);
    }

    /// Hand the event to every handler on its own blocking thread
    fn emit(
        &self,
        event_type: EventType,
        task: &Arc<DownloadTask>,
        progress: Option<SubTaskProgress>,
        message: Option<String>,
    ) {
        let handlers = self.handlers.read().clone();
        if handlers.is_empty() {
            return;
        }

        let event = Arc::new(DownloadEvent {
            event_type,
            task: Arc::clone(task),
            progress,
            message,
            timestamp: Utc::now(),
        });

        for handler in handlers {
            let event = Arc::clone(&event);
            let job = move || {
                if let Err(panic) =
                    std::panic::catch_unwind(AssertUnwindSafe(|| handler(event.as_ref())))
                {
                    warn!(
                        task_id = %event.task_id(),
                        event_type = ?event.event_type,
                        "Event handler panicked: {}",
                        panic_message(panic.as_ref())
                    );
                }
            };

            match tokio::runtime::Handle::try_current() {
                Ok(handle) => {
                    handle.spawn_blocking(job);
                }
                Err(_) => {
                    if let Err(e) = std::thread::Builder::new()
                        .name("download-event".into())
                        .spawn(job)
                    {
                        warn!("Failed to dispatch event handler: {}", e);
                    }
                }
            }
        }
    }
}
