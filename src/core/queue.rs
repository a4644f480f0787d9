//! Priority task queue
//!
//! A binary max-heap ordered by priority (higher first) and then creation time
//! (older first), with an ID to index side table so that removal and priority
//! changes of an arbitrary queued task stay O(log n).

use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tracing::debug;

use crate::core::models::{TaskPriority, TaskStatus};
use crate::core::task::DownloadTask;

/// Heap slot. The ordering key is copied out of the task so comparisons never
/// take the task's own lock.
#[derive(Debug)]
struct QueueEntry {
    priority: TaskPriority,
    created_at: DateTime<Utc>,
    /// Insertion counter, final tiebreak for equal timestamps
    seq: u64,
    task: Arc<DownloadTask>,
}

impl QueueEntry {
    /// Whether `self` must be dequeued before `other`
    fn outranks(&self, other: &QueueEntry) -> bool {
        let ordering = self
            .priority
            .cmp(&other.priority)
            .then_with(|| other.created_at.cmp(&self.created_at))
            .then_with(|| other.seq.cmp(&self.seq));
        ordering == Ordering::Greater
    }
}

#[derive(Debug, Default)]
struct Heap {
    entries: Vec<QueueEntry>,
    index: HashMap<String, usize>,
    next_seq: u64,
}

impl Heap {
    fn swap(&mut self, i: usize, j: usize) {
        self.entries.swap(i, j);
        self.index.insert(self.entries[i].task.id().to_string(), i);
        self.index.insert(self.entries[j].task.id().to_string(), j);
    }

    fn sift_up(&mut self, mut pos: usize) {
        while pos > 0 {
            let parent = (pos - 1) / 2;
            if !self.entries[pos].outranks(&self.entries[parent]) {
                break;
            }
            self.swap(pos, parent);
            pos = parent;
        }
    }

    /// Returns true if the entry moved
    fn sift_down(&mut self, mut pos: usize) -> bool {
        let start = pos;
        let len = self.entries.len();
        loop {
            let left = 2 * pos + 1;
            let right = left + 1;
            let mut best = pos;
            if left < len && self.entries[left].outranks(&self.entries[best]) {
                best = left;
            }
            if right < len && self.entries[right].outranks(&self.entries[best]) {
                best = right;
            }
            if best == pos {
                break;
            }
            self.swap(pos, best);
            pos = best;
        }
        pos != start
    }

    /// Restore heap order around `pos` after its key changed
    fn fix(&mut self, pos: usize) {
        if !self.sift_down(pos) {
            self.sift_up(pos);
        }
    }

    fn push(&mut self, task: Arc<DownloadTask>) {
        let entry = QueueEntry {
            priority: task.priority(),
            created_at: task.created_at(),
            seq: self.next_seq,
            task,
        };
        self.next_seq += 1;
        let pos = self.entries.len();
        self.index.insert(entry.task.id().to_string(), pos);
        self.entries.push(entry);
        self.sift_up(pos);
    }

    fn remove_at(&mut self, pos: usize) -> Option<Arc<DownloadTask>> {
        let last = self.entries.len().checked_sub(1)?;
        if pos != last {
            self.swap(pos, last);
        }
        let entry = self.entries.pop()?;
        self.index.remove(entry.task.id());
        if pos < self.entries.len() {
            self.fix(pos);
        }
        Some(entry.task)
    }
}

/// Thread-safe priority queue of pending download tasks
#[derive(Debug, Default)]
pub struct TaskQueue {
    heap: Mutex<Heap>,
}

impl TaskQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a task and mark it `Queued`. A task whose ID is already queued
    /// is ignored; returns whether the task was inserted.
    pub fn enqueue(&self, task: Arc<DownloadTask>) -> bool {
        let mut heap = self.heap.lock();
        if heap.index.contains_key(task.id()) {
            debug!(task_id = %task.id(), "Task already queued, ignoring");
            return false;
        }
        task.set_status(TaskStatus::Queued);
        heap.push(task);
        true
    }

    /// Remove and return the highest-ranked task
    pub fn dequeue(&self) -> Option<Arc<DownloadTask>> {
        self.heap.lock().remove_at(0)
    }

    /// The task `dequeue` would return, without removing it
    pub fn peek(&self) -> Option<Arc<DownloadTask>> {
        self.heap.lock().entries.first().map(|e| Arc::clone(&e.task))
    }

    pub fn remove(&self, task_id: &str) -> Option<Arc<DownloadTask>> {
        let mut heap = self.heap.lock();
        let pos = *heap.index.get(task_id)?;
        heap.remove_at(pos)
    }

    pub fn get(&self, task_id: &str) -> Option<Arc<DownloadTask>> {
        let heap = self.heap.lock();
        let pos = *heap.index.get(task_id)?;
        Some(Arc::clone(&heap.entries[pos].task))
    }

    pub fn contains(&self, task_id: &str) -> bool {
        self.heap.lock().index.contains_key(task_id)
    }

    pub fn size(&self) -> usize {
        self.heap.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.size() == 0
    }

    /// Snapshot of every queued task, in heap order (not dequeue order)
    pub fn get_all(&self) -> Vec<Arc<DownloadTask>> {
        self.heap
            .lock()
            .entries
            .iter()
            .map(|e| Arc::clone(&e.task))
            .collect()
    }

    /// Change the priority of a queued task; returns false if it is not queued
    pub fn update_priority(&self, task_id: &str, priority: TaskPriority) -> bool {
        let mut heap = self.heap.lock();
        let Some(&pos) = heap.index.get(task_id) else {
            return false;
        };
        heap.entries[pos].priority = priority;
        heap.entries[pos].task.set_priority(priority);
        heap.fix(pos);
        true
    }

    pub fn clear(&self) {
        let mut heap = self.heap.lock();
        heap.entries.clear();
        heap.index.clear();
    }
}
