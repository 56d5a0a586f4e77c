//! Task queue
//!
//! Ordered FIFO list of tasks with an active-count ceiling. Queued tasks
//! start as slots open; reordering only affects tasks that have not started
//! yet. All operations take the one queue mutex for a short critical
//! section; task callbacks (`start`, `cancel`) run outside it to avoid
//! reentrancy deadlocks.

use crate::task::Task;
use crate::types::{TaskId, TaskInfo, TaskState};
use parking_lot::Mutex;
use std::sync::Arc;

/// Allowed range for the concurrency ceiling
const MAX_CONCURRENT_RANGE: (usize, usize) = (1, 10);

struct QueueInner {
    tasks: Vec<Arc<Task>>,
    active: usize,
    max_concurrent: usize,
    auto_start: bool,
}

impl QueueInner {
    /// Claim the next startable tasks in FIFO order. The claimed tasks are
    /// counted active immediately; the caller starts them after releasing
    /// the lock.
    fn claim_startable(&mut self) -> Vec<Arc<Task>> {
        if !self.auto_start {
            return Vec::new();
        }
        let mut startable = Vec::new();
        for task in &self.tasks {
            if self.active >= self.max_concurrent {
                break;
            }
            if task.state() == TaskState::Queued {
                startable.push(Arc::clone(task));
                self.active += 1;
            }
        }
        startable
    }
}

/// FIFO task list with an active-count ceiling
pub struct TaskQueue {
    inner: Mutex<QueueInner>,
}

impl TaskQueue {
    /// `max_concurrent` is clamped to `[1, 10]`
    pub fn new(max_concurrent: usize) -> Self {
        Self {
            inner: Mutex::new(QueueInner {
                tasks: Vec::new(),
                active: 0,
                max_concurrent: max_concurrent.clamp(MAX_CONCURRENT_RANGE.0, MAX_CONCURRENT_RANGE.1),
                auto_start: true,
            }),
        }
    }

    /// Append a task and start it right away if a slot is free.
    pub fn add(&self, task: Arc<Task>) {
        let startable = {
            let mut inner = self.inner.lock();
            inner.tasks.push(task);
            inner.claim_startable()
        };
        for task in startable {
            task.start();
        }
    }

    /// Remove a task by id, freeing its slot if it was downloading, and
    /// start whatever fits. Returns the removed task; the caller must cancel
    /// it (outside this queue's lock, which is already guaranteed here).
    #[must_use]
    pub fn remove(&self, id: TaskId) -> Option<Arc<Task>> {
        let (removed, startable) = {
            let mut inner = self.inner.lock();
            let idx = inner.tasks.iter().position(|t| t.id() == id)?;
            let task = inner.tasks.remove(idx);
            if task.state() == TaskState::Downloading {
                inner.active = inner.active.saturating_sub(1);
            }
            let startable = inner.claim_startable();
            (task, startable)
        };
        for task in startable {
            task.start();
        }
        Some(removed)
    }

    /// Swap the task one position toward the front. False at the edge or
    /// for unknown ids.
    pub fn move_up(&self, id: TaskId) -> bool {
        let mut inner = self.inner.lock();
        match inner.tasks.iter().position(|t| t.id() == id) {
            Some(idx) if idx > 0 => {
                inner.tasks.swap(idx, idx - 1);
                true
            }
            _ => false,
        }
    }

    /// Swap the task one position toward the back. False at the edge or
    /// for unknown ids.
    pub fn move_down(&self, id: TaskId) -> bool {
        let mut inner = self.inner.lock();
        match inner.tasks.iter().position(|t| t.id() == id) {
            Some(idx) if idx + 1 < inner.tasks.len() => {
                inner.tasks.swap(idx, idx + 1);
                true
            }
            _ => false,
        }
    }

    /// Slot bookkeeping for a task that reached a terminal state. Ids that
    /// were already removed are ignored, guarding against a double
    /// decrement racing with `remove`.
    pub fn on_task_finished(&self, id: TaskId) {
        let startable = {
            let mut inner = self.inner.lock();
            if !inner.tasks.iter().any(|t| t.id() == id) {
                return;
            }
            inner.active = inner.active.saturating_sub(1);
            inner.claim_startable()
        };
        for task in startable {
            task.start();
        }
    }

    /// Change the ceiling (clamped to `[1, 10]`), starting queued tasks if
    /// capacity grew.
    pub fn set_max_concurrent(&self, max: usize) {
        let startable = {
            let mut inner = self.inner.lock();
            inner.max_concurrent = max.clamp(MAX_CONCURRENT_RANGE.0, MAX_CONCURRENT_RANGE.1);
            inner.claim_startable()
        };
        for task in startable {
            task.start();
        }
    }

    pub fn max_concurrent(&self) -> usize {
        self.inner.lock().max_concurrent
    }

    /// Snapshots in queue order
    pub fn all_task_info(&self) -> Vec<TaskInfo> {
        let tasks: Vec<_> = self.inner.lock().tasks.clone();
        tasks.iter().map(|t| t.info()).collect()
    }

    /// Ids in queue order
    pub fn order(&self) -> Vec<TaskId> {
        self.inner.lock().tasks.iter().map(|t| t.id()).collect()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().tasks.is_empty()
    }

    /// Disable automatic starting of queued tasks (tests)
    pub fn set_auto_start(&self, enabled: bool) {
        self.inner.lock().auto_start = enabled;
    }
}
