//! Hierarchical progress tracking
//!
//! Progress is kept as a tree: an item owns its sub-items (keyed by sequence
//! number) and each sub-item owns named sub-tasks such as `video`, `poster`,
//! `subtitle`, `danmaku` or `nfo`. Aggregates are computed on demand from the
//! leaves and are never cached.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::core::models::SubItem;

/// Status of a progress node
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "snake_case")]
pub enum DownloadStatus {
    #[default]
    Pending,
    Downloading,
    Succeeded,
    /// Already present on disk, nothing to do
    Skipped,
    Failed,
    /// Failed in a way that will not go away on retry
    FixedFailed,
    Ignored,
}

impl DownloadStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, DownloadStatus::Pending | DownloadStatus::Downloading)
    }

    pub fn is_success(self) -> bool {
        matches!(self, DownloadStatus::Succeeded | DownloadStatus::Skipped)
    }

    pub fn is_failure(self) -> bool {
        matches!(self, DownloadStatus::Failed | DownloadStatus::FixedFailed)
    }
}

/// Progress of one named facet of a sub-item download
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SubTaskProgress {
    pub name: String,
    pub status: DownloadStatus,
    /// Percentage in 0.0..=100.0
    pub progress: f64,
    /// Bytes per second
    pub speed: f64,
    pub downloaded_size: u64,
    pub total_size: u64,
    /// Seconds remaining, when known
    pub eta: Option<u64>,
    pub error: Option<String>,
    pub retry_count: u32,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
}

impl SubTaskProgress {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            status: DownloadStatus::Pending,
            progress: 0.0,
            speed: 0.0,
            downloaded_size: 0,
            total_size: 0,
            eta: None,
            error: None,
            retry_count: 0,
            start_time: None,
            end_time: None,
        }
    }

    pub fn start(&mut self) {
        self.status = DownloadStatus::Downloading;
        if self.start_time.is_none() {
            self.start_time = Some(Utc::now());
        }
    }

    /// Record transferred bytes and derive percentage and ETA
    pub fn set_bytes(&mut self, downloaded: u64, total: u64, speed: f64) {
        if self.status == DownloadStatus::Pending {
            self.start();
        }
        self.downloaded_size = downloaded;
        self.total_size = total;
        self.speed = speed.max(0.0);
        self.progress = if total > 0 {
            (downloaded as f64 / total as f64 * 100.0).clamp(0.0, 100.0)
        } else {
            0.0
        };
        self.eta = if self.speed > 0.0 && downloaded < total {
            Some(((total - downloaded) as f64 / self.speed) as u64)
        } else {
            None
        };
    }

    pub fn succeed(&mut self) {
        self.finish(DownloadStatus::Succeeded);
        self.progress = 100.0;
        self.eta = None;
        self.error = None;
    }

    pub fn skip(&mut self) {
        self.finish(DownloadStatus::Skipped);
        self.progress = 100.0;
        self.eta = None;
    }

    pub fn fail(&mut self, error: impl Into<String>) {
        self.finish(DownloadStatus::Failed);
        self.error = Some(error.into());
        self.speed = 0.0;
        self.eta = None;
    }

    fn finish(&mut self, status: DownloadStatus) {
        self.status = status;
        self.end_time = Some(Utc::now());
    }
}

fn mean(values: impl Iterator<Item = f64>) -> f64 {
    let (sum, count) = values.fold((0.0, 0usize), |(s, c), v| (s + v, c + 1));
    if count == 0 {
        0.0
    } else {
        sum / count as f64
    }
}

#[derive(Debug)]
struct NodeState<C> {
    status: DownloadStatus,
    children: C,
    start_time: Option<DateTime<Utc>>,
    end_time: Option<DateTime<Utc>>,
}

impl<C: Default> NodeState<C> {
    fn new() -> Self {
        Self {
            status: DownloadStatus::Pending,
            children: C::default(),
            start_time: None,
            end_time: None,
        }
    }

    fn set_status(&mut self, status: DownloadStatus) {
        self.status = status;
        match status {
            DownloadStatus::Downloading => {
                if self.start_time.is_none() {
                    self.start_time = Some(Utc::now());
                }
                self.end_time = None;
            }
            s if s.is_terminal() => self.end_time = Some(Utc::now()),
            _ => {}
        }
    }
}

/// Progress of one sub-item: a map of named sub-tasks
#[derive(Debug)]
pub struct SubItemProgress {
    pub sub_item_id: u64,
    pub seq: u32,
    pub name: String,
    state: RwLock<NodeState<HashMap<String, SubTaskProgress>>>,
}

impl SubItemProgress {
    pub fn new(sub_item_id: u64, seq: u32, name: impl Into<String>) -> Self {
        Self {
            sub_item_id,
            seq,
            name: name.into(),
            state: RwLock::new(NodeState::new()),
        }
    }

    /// Apply `f` to the named sub-task, creating it on first use. Returns a
    /// copy of the sub-task as it was left by `f`.
    pub fn update_sub_task<F>(&self, name: &str, f: F) -> SubTaskProgress
    where
        F: FnOnce(&mut SubTaskProgress),
    {
        let mut state = self.state.write();
        let entry = state
            .children
            .entry(name.to_string())
            .or_insert_with(|| SubTaskProgress::new(name));
        f(entry);
        entry.clone()
    }

    pub fn get_sub_task(&self, name: &str) -> Option<SubTaskProgress> {
        self.state.read().children.get(name).cloned()
    }

    /// All sub-tasks, ordered by name
    pub fn sub_tasks(&self) -> Vec<SubTaskProgress> {
        let mut tasks: Vec<_> = self.state.read().children.values().cloned().collect();
        tasks.sort_by(|a, b| a.name.cmp(&b.name));
        tasks
    }

    pub fn status(&self) -> DownloadStatus {
        self.state.read().status
    }

    pub fn update_status(&self, status: DownloadStatus) {
        self.state.write().set_status(status);
    }

    /// Mean of the sub-task percentages, 0 when there are none
    pub fn overall_progress(&self) -> f64 {
        mean(self.state.read().children.values().map(|t| t.progress))
    }

    pub fn snapshot(&self) -> SubItemProgressSnapshot {
        let (status, start_time, end_time) = {
            let state = self.state.read();
            (state.status, state.start_time, state.end_time)
        };
        let sub_tasks = self.sub_tasks();
        SubItemProgressSnapshot {
            sub_item_id: self.sub_item_id,
            seq: self.seq,
            name: self.name.clone(),
            status,
            progress: mean(sub_tasks.iter().map(|t| t.progress)),
            sub_tasks,
            start_time,
            end_time,
        }
    }
}

/// Progress of one item: a map of sub-items keyed by sequence number
#[derive(Debug)]
pub struct ItemProgress {
    pub item_id: u64,
    pub external_id: String,
    pub title: String,
    pub total_sub_items: usize,
    state: RwLock<NodeState<HashMap<u32, Arc<SubItemProgress>>>>,
}

impl ItemProgress {
    pub fn new(
        item_id: u64,
        external_id: impl Into<String>,
        title: impl Into<String>,
        total_sub_items: usize,
    ) -> Self {
        Self {
            item_id,
            external_id: external_id.into(),
            title: title.into(),
            total_sub_items,
            state: RwLock::new(NodeState::new()),
        }
    }

    /// Insert a fresh sub-item node, replacing any existing one with the same seq
    pub fn add_sub_item(&self, sub_item_id: u64, seq: u32, name: &str) -> Arc<SubItemProgress> {
        let node = Arc::new(SubItemProgress::new(sub_item_id, seq, name));
        self.state.write().children.insert(seq, Arc::clone(&node));
        node
    }

    /// Existing sub-item node for `sub_item.seq`, or a new one
    pub fn sub_item_or_insert(&self, sub_item: &SubItem) -> Arc<SubItemProgress> {
        if let Some(node) = self.get_sub_item(sub_item.seq) {
            return node;
        }
        let mut state = self.state.write();
        Arc::clone(state.children.entry(sub_item.seq).or_insert_with(|| {
            Arc::new(SubItemProgress::new(
                sub_item.id,
                sub_item.seq,
                sub_item.name.as_str(),
            ))
        }))
    }

    pub fn get_sub_item(&self, seq: u32) -> Option<Arc<SubItemProgress>> {
        self.state.read().children.get(&seq).cloned()
    }

    pub fn remove_sub_item(&self, seq: u32) -> Option<Arc<SubItemProgress>> {
        self.state.write().children.remove(&seq)
    }

    /// All sub-item nodes, ordered by seq
    pub fn sub_items(&self) -> Vec<Arc<SubItemProgress>> {
        let mut nodes: Vec<_> = self.state.read().children.values().cloned().collect();
        nodes.sort_by_key(|n| n.seq);
        nodes
    }

    pub fn status(&self) -> DownloadStatus {
        self.state.read().status
    }

    pub fn update_status(&self, status: DownloadStatus) {
        self.state.write().set_status(status);
    }

    /// Mean of the sub-item overall progresses, 0 when there are none
    pub fn overall_progress(&self) -> f64 {
        mean(self.sub_items().iter().map(|n| n.overall_progress()))
    }

    /// True once at least one sub-item exists and every sub-item succeeded or
    /// was skipped
    pub fn is_completed(&self) -> bool {
        let nodes = self.sub_items();
        !nodes.is_empty() && nodes.iter().all(|n| n.status().is_success())
    }

    pub fn has_failures(&self) -> bool {
        self.sub_items().iter().any(|n| n.status().is_failure())
    }

    pub fn snapshot(&self) -> ItemProgressSnapshot {
        let (status, start_time, end_time) = {
            let state = self.state.read();
            (state.status, state.start_time, state.end_time)
        };
        let sub_items: Vec<_> = self.sub_items().iter().map(|n| n.snapshot()).collect();
        ItemProgressSnapshot {
            item_id: self.item_id,
            external_id: self.external_id.clone(),
            title: self.title.clone(),
            total_sub_items: self.total_sub_items,
            status,
            progress: mean(sub_items.iter().map(|s| s.progress)),
            sub_items,
            start_time,
            end_time,
        }
    }
}

/// Serialisable copy of a sub-item node
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubItemProgressSnapshot {
    pub sub_item_id: u64,
    pub seq: u32,
    pub name: String,
    pub status: DownloadStatus,
    pub progress: f64,
    pub sub_tasks: Vec<SubTaskProgress>,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
}

/// Serialisable copy of an item node and everything below it
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ItemProgressSnapshot {
    pub item_id: u64,
    pub external_id: String,
    pub title: String,
    pub total_sub_items: usize,
    pub status: DownloadStatus,
    pub progress: f64,
    pub sub_items: Vec<SubItemProgressSnapshot>,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
}

/// Receives (item id, sub-item seq, sub-task name, sub-task copy). Invoked on
/// the reporting thread, possibly from many threads at once.
pub type ProgressCallback = Arc<dyn Fn(u64, u32, &str, &SubTaskProgress) + Send + Sync>;

/// Registry of item progress trees plus one notification callback
#[derive(Default)]
pub struct ProgressTracker {
    items: RwLock<HashMap<u64, Arc<ItemProgress>>>,
    callback: RwLock<Option<ProgressCallback>>,
}

impl std::fmt::Debug for ProgressTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProgressTracker")
            .field("items", &self.items.read().len())
            .field("has_callback", &self.callback.read().is_some())
            .finish()
    }
}

impl ProgressTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create the root for an item. An existing root is replaced, not merged.
    pub fn add_item(
        &self,
        item_id: u64,
        external_id: &str,
        title: &str,
        total_sub_items: usize,
    ) -> Arc<ItemProgress> {
        let node = Arc::new(ItemProgress::new(item_id, external_id, title, total_sub_items));
        self.items.write().insert(item_id, Arc::clone(&node));
        debug!(item_id, total_sub_items, "Progress root created");
        node
    }

    /// Existing root for `item_id`, or a new one built from the given fields
    pub fn item_or_insert(
        &self,
        item_id: u64,
        external_id: &str,
        title: &str,
        total_sub_items: usize,
    ) -> Arc<ItemProgress> {
        if let Some(node) = self.get_item(item_id) {
            return node;
        }
        let mut items = self.items.write();
        Arc::clone(items.entry(item_id).or_insert_with(|| {
            Arc::new(ItemProgress::new(item_id, external_id, title, total_sub_items))
        }))
    }

    pub fn get_item(&self, item_id: u64) -> Option<Arc<ItemProgress>> {
        self.items.read().get(&item_id).cloned()
    }

    pub fn remove_item(&self, item_id: u64) -> Option<Arc<ItemProgress>> {
        self.items.write().remove(&item_id)
    }

    /// All roots, ordered by item id
    pub fn get_all_items(&self) -> Vec<Arc<ItemProgress>> {
        let mut items: Vec<_> = self.items.read().values().cloned().collect();
        items.sort_by_key(|i| i.item_id);
        items
    }

    pub fn set_callback(&self, callback: ProgressCallback) {
        *self.callback.write() = Some(callback);
    }

    pub fn clear_callback(&self) {
        *self.callback.write() = None;
    }

    /// Invoke the callback, if any, on the calling thread
    pub fn notify_progress(&self, item_id: u64, seq: u32, name: &str, progress: &SubTaskProgress) {
        let callback = self.callback.read().clone();
        if let Some(callback) = callback {
            callback(item_id, seq, name, progress);
        }
    }
}

/// Progress handle for one sub-item, handed to the executor
#[derive(Debug, Clone)]
pub struct ProgressReporter {
    tracker: Arc<ProgressTracker>,
    item_id: u64,
    node: Arc<SubItemProgress>,
}

impl ProgressReporter {
    /// Attach to `sub_item` under `item`, creating the sub-item node if needed
    pub fn new(tracker: Arc<ProgressTracker>, item: &ItemProgress, sub_item: &SubItem) -> Self {
        let node = item.sub_item_or_insert(sub_item);
        Self {
            tracker,
            item_id: item.item_id,
            node,
        }
    }

    pub fn item_id(&self) -> u64 {
        self.item_id
    }

    pub fn seq(&self) -> u32 {
        self.node.seq
    }

    pub fn sub_item(&self) -> &Arc<SubItemProgress> {
        &self.node
    }

    /// Mutate the named sub-task and notify listeners with the result
    pub fn update<F>(&self, name: &str, f: F) -> SubTaskProgress
    where
        F: FnOnce(&mut SubTaskProgress),
    {
        let progress = self.node.update_sub_task(name, f);
        self.tracker
            .notify_progress(self.item_id, self.node.seq, name, &progress);
        progress
    }

    pub fn set_status(&self, status: DownloadStatus) {
        self.node.update_status(status);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn sub_item(seq: u32) -> SubItem {
        SubItem::new(100 + seq as u64, 1, seq, format!("P{}", seq))
    }

    #[test]
    fn test_empty_item_progress_is_zero() {
        let tracker = ProgressTracker::new();
        let item = tracker.add_item(1, "BV1xx", "Some video", 2);
        assert_eq!(item.overall_progress(), 0.0);
        assert!(!item.is_completed());
        assert!(!item.has_failures());

        let node = item.add_sub_item(101, 1, "P1");
        assert_eq!(node.overall_progress(), 0.0);
        assert_eq!(item.overall_progress(), 0.0);
    }

    #[test]
    fn test_all_sub_items_complete_is_exactly_hundred() {
        let tracker = ProgressTracker::new();
        let item = tracker.add_item(1, "BV1xx", "Some video", 3);
        for seq in 1..=3 {
            let node = item.add_sub_item(100 + seq as u64, seq, "part");
            for name in ["video", "poster", "nfo"] {
                node.update_sub_task(name, |t| t.succeed());
            }
        }
        assert_eq!(item.overall_progress(), 100.0);
    }

    #[test]
    fn test_progress_is_mean_of_children() {
        let tracker = ProgressTracker::new();
        let item = tracker.add_item(1, "BV1xx", "Some video", 2);

        let first = item.add_sub_item(101, 1, "P1");
        first.update_sub_task("video", |t| t.set_bytes(50, 100, 10.0));
        first.update_sub_task("poster", |t| t.succeed());
        assert_eq!(first.overall_progress(), 75.0);

        let second = item.add_sub_item(102, 2, "P2");
        second.update_sub_task("video", |t| t.set_bytes(25, 100, 10.0));
        assert_eq!(second.overall_progress(), 25.0);

        assert_eq!(item.overall_progress(), 50.0);
    }

    #[test]
    fn test_add_item_overwrites() {
        let tracker = ProgressTracker::new();
        let item = tracker.add_item(1, "a", "first", 1);
        item.add_sub_item(101, 1, "P1");

        let replaced = tracker.add_item(1, "a", "second", 1);
        assert_eq!(replaced.title, "second");
        assert!(replaced.sub_items().is_empty());
        assert_eq!(tracker.get_item(1).unwrap().title, "second");
    }

    #[test]
    fn test_item_or_insert_keeps_existing() {
        let tracker = ProgressTracker::new();
        tracker.add_item(1, "a", "first", 1).add_sub_item(101, 1, "P1");
        let same = tracker.item_or_insert(1, "a", "other", 1);
        assert_eq!(same.title, "first");
        assert_eq!(same.sub_items().len(), 1);
    }

    #[test]
    fn test_get_sub_task_returns_copy() {
        let node = SubItemProgress::new(1, 1, "P1");
        assert!(node.get_sub_task("video").is_none());

        node.update_sub_task("video", |t| t.set_bytes(10, 100, 5.0));
        let mut copy = node.get_sub_task("video").unwrap();
        copy.progress = 99.0;

        assert_eq!(node.get_sub_task("video").unwrap().progress, 10.0);
    }

    #[test]
    fn test_set_bytes_derives_eta() {
        let mut task = SubTaskProgress::new("video");
        task.set_bytes(200, 1000, 100.0);
        assert_eq!(task.status, DownloadStatus::Downloading);
        assert_eq!(task.progress, 20.0);
        assert_eq!(task.eta, Some(8));
        assert!(task.start_time.is_some());

        task.fail("network reset");
        assert_eq!(task.status, DownloadStatus::Failed);
        assert_eq!(task.error.as_deref(), Some("network reset"));
        assert!(task.end_time.is_some());
    }

    #[test]
    fn test_completion_and_failure_flags() {
        let tracker = ProgressTracker::new();
        let item = tracker.add_item(1, "a", "video", 2);
        let first = item.add_sub_item(101, 1, "P1");
        let second = item.add_sub_item(102, 2, "P2");

        first.update_status(DownloadStatus::Succeeded);
        second.update_status(DownloadStatus::Skipped);
        assert!(item.is_completed());

        second.update_status(DownloadStatus::Failed);
        assert!(!item.is_completed());
        assert!(item.has_failures());
    }

    #[test]
    fn test_status_timestamps() {
        let node = SubItemProgress::new(1, 1, "P1");
        node.update_status(DownloadStatus::Downloading);
        let snap = node.snapshot();
        assert!(snap.start_time.is_some());
        assert!(snap.end_time.is_none());

        node.update_status(DownloadStatus::Succeeded);
        assert!(node.snapshot().end_time.is_some());
    }

    #[test]
    fn test_remove_and_list_items() {
        let tracker = ProgressTracker::new();
        tracker.add_item(3, "c", "c", 1);
        tracker.add_item(1, "a", "a", 1);
        tracker.add_item(2, "b", "b", 1);

        let ids: Vec<_> = tracker.get_all_items().iter().map(|i| i.item_id).collect();
        assert_eq!(ids, vec![1, 2, 3]);

        assert!(tracker.remove_item(2).is_some());
        assert!(tracker.remove_item(2).is_none());
        assert_eq!(tracker.get_all_items().len(), 2);
    }

    #[test]
    fn test_reporter_notifies_callback() {
        let tracker = Arc::new(ProgressTracker::new());
        let calls = Arc::new(AtomicUsize::new(0));
        {
            let calls = Arc::clone(&calls);
            tracker.set_callback(Arc::new(
                move |item_id: u64, seq: u32, name: &str, progress: &SubTaskProgress| {
                    assert_eq!(item_id, 1);
                    assert_eq!(seq, 2);
                    assert_eq!(name, "video");
                    assert!(progress.progress >= 0.0);
                    calls.fetch_add(1, Ordering::SeqCst);
                },
            ));
        }

        let item = tracker.add_item(1, "a", "video", 2);
        let reporter = ProgressReporter::new(Arc::clone(&tracker), &item, &sub_item(2));
        reporter.update("video", |t| t.set_bytes(1, 2, 1.0));
        reporter.update("video", |t| t.succeed());

        assert_eq!(calls.load(Ordering::SeqCst), 2);
        let stored = item.get_sub_item(2).unwrap().get_sub_task("video").unwrap();
        assert_eq!(stored.status, DownloadStatus::Succeeded);

        tracker.clear_callback();
        reporter.update("poster", |t| t.skip());
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_concurrent_sub_task_updates() {
        let tracker = Arc::new(ProgressTracker::new());
        let item = tracker.add_item(1, "a", "video", 1);
        let node = item.add_sub_item(101, 1, "P1");

        let handles: Vec<_> = (0..8)
            .map(|i| {
                let node = Arc::clone(&node);
                std::thread::spawn(move || {
                    for n in 0..100u64 {
                        node.update_sub_task(&format!("task-{}", i), |t| {
                            t.set_bytes(n + 1, 100, 1.0)
                        });
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(node.sub_tasks().len(), 8);
        assert_eq!(node.overall_progress(), 100.0);
    }

    #[test]
    fn test_snapshot_serializes() {
        let tracker = ProgressTracker::new();
        let item = tracker.add_item(1, "BV1", "video", 1);
        item.add_sub_item(101, 1, "P1")
            .update_sub_task("video", |t| t.succeed());

        let json = serde_json::to_value(item.snapshot()).unwrap();
        assert_eq!(json["item_id"], 1);
        assert_eq!(json["sub_items"][0]["sub_tasks"][0]["status"], "succeeded");
        assert_eq!(json["progress"], 100.0);
    }
}
