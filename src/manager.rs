//! Download manager
//!
//! Façade tying the engine together. Owns the worker pool, the global
//! token bucket, the task queue and the classifier; allocates task ids,
//! deduplicates URLs, recovers sidecar records from disk and broadcasts
//! state-change events to front-ends.

use crate::bucket::TokenBucket;
use crate::classify::FileClassifier;
use crate::config::ManagerConfig;
use crate::error::{DownloadError, Result};
use crate::meta::MetaStore;
use crate::pool::WorkerPool;
use crate::queue::TaskQueue;
use crate::task::{StateCallback, Task};
use crate::types::{TaskEvent, TaskId, TaskInfo, TaskState};

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::broadcast;

/// Buffered state-change events before slow subscribers lose some
const EVENT_CHANNEL_CAPACITY: usize = 1024;

/// The main entry point of the crate
pub struct DownloadManager {
    self_ref: Weak<Self>,
    config: Mutex<ManagerConfig>,
    pool: Arc<WorkerPool>,
    limiter: Arc<TokenBucket>,
    queue: Arc<TaskQueue>,
    classifier: Arc<FileClassifier>,
    tasks: Mutex<HashMap<TaskId, Arc<Task>>>,
    next_id: AtomicU64,
    events: broadcast::Sender<TaskEvent>,
}

impl DownloadManager {
    /// Build a manager from a validated configuration. Must be called
    /// within a Tokio runtime (the worker pool spawns immediately).
    pub fn new(config: ManagerConfig) -> Result<Arc<Self>> {
        config.validate()?;

        // Best-effort: the directory may appear later
        if let Err(e) = std::fs::create_dir_all(&config.default_save_dir) {
            tracing::warn!(
                "could not create save dir {:?}: {}",
                config.default_save_dir,
                e
            );
        }

        let classifier = if config.classification_rules.is_empty() {
            Arc::new(FileClassifier::new())
        } else {
            Arc::new(FileClassifier::with_rules(config.classification_rules.clone()))
        };

        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);

        Ok(Arc::new_cyclic(|weak| Self {
            self_ref: weak.clone(),
            pool: Arc::new(WorkerPool::new(config.worker_pool_size)),
            limiter: Arc::new(TokenBucket::new(config.speed_limit)),
            queue: Arc::new(TaskQueue::new(config.max_concurrent_tasks)),
            classifier,
            tasks: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            events,
            config: Mutex::new(config),
        }))
    }

    /// Add a download. An exact-URL match against an existing non-terminal
    /// task returns that task's id instead of creating a duplicate.
    pub fn add(
        &self,
        url: &str,
        save_dir: Option<std::path::PathBuf>,
        referer: Option<&str>,
        cookie: Option<&str>,
    ) -> Result<TaskId> {
        let parsed = url::Url::parse(url)
            .map_err(|e| DownloadError::invalid_input("url", format!("invalid URL: {e}")))?;
        match parsed.scheme() {
            "http" | "https" => {}
            scheme => {
                return Err(DownloadError::invalid_input(
                    "url",
                    format!("unsupported scheme: {scheme}"),
                ));
            }
        }

        // Deduplicate against live tasks
        {
            let tasks = self.tasks.lock();
            for (id, task) in tasks.iter() {
                let info = task.info();
                if info.url == url && !info.state.is_terminal() {
                    tracing::debug!("URL already downloading as task {id}");
                    return Ok(*id);
                }
            }
        }

        let (dir, max_blocks, mut http_config) = {
            let config = self.config.lock();
            (
                save_dir.unwrap_or_else(|| config.default_save_dir.clone()),
                config.max_blocks_per_task,
                config.http.clone(),
            )
        };
        if let Some(referer) = referer {
            http_config.referer = referer.to_string();
        }
        if let Some(cookie) = cookie {
            http_config.cookie = cookie.to_string();
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let task = Task::new(
            id,
            url.to_string(),
            dir,
            max_blocks,
            http_config,
            Arc::clone(&self.pool),
            Arc::clone(&self.limiter),
            Arc::clone(&self.classifier),
            self.state_callback(),
        );

        self.tasks.lock().insert(id, Arc::clone(&task));
        self.queue.add(task);

        tracing::info!("added task {id}: {url}");
        Ok(id)
    }

    /// Pause a downloading task
    pub async fn pause(&self, id: TaskId) {
        if let Some(task) = self.find(id) {
            task.pause().await;
        }
    }

    /// Resume a paused or failed task
    pub fn resume(&self, id: TaskId) {
        if let Some(task) = self.find(id) {
            task.resume();
        }
    }

    /// Cancel a task, removing its file and sidecar
    pub async fn cancel(&self, id: TaskId) {
        if let Some(task) = self.find(id) {
            task.cancel().await;
        }
    }

    /// Remove a task from the queue and the manager entirely. The task
    /// handle stays alive until cancellation has run, so outstanding
    /// workers observe the flags before the task is dropped.
    pub async fn remove(&self, id: TaskId) {
        let queued = self.queue.remove(id);
        let mapped = self.tasks.lock().remove(&id);

        if let Some(task) = mapped.or(queued) {
            task.cancel().await;
        }
    }

    /// Move a task one position toward the front of the queue
    pub fn move_up(&self, id: TaskId) -> bool {
        self.queue.move_up(id)
    }

    /// Move a task one position toward the back of the queue
    pub fn move_down(&self, id: TaskId) -> bool {
        self.queue.move_down(id)
    }

    /// Set the global speed limit (bytes/sec, 0 = unlimited). Applies to
    /// all in-flight blocks immediately.
    pub fn set_speed_limit(&self, bytes_per_sec: i64) {
        let limit = bytes_per_sec.max(0);
        self.limiter.set_rate(limit);
        self.config.lock().speed_limit = limit;
    }

    /// Snapshots of every task, in queue order
    pub fn list(&self) -> Vec<TaskInfo> {
        self.queue.all_task_info()
    }

    /// Snapshot of one task
    pub fn task_info(&self, id: TaskId) -> Option<TaskInfo> {
        self.find(id).map(|t| t.info())
    }

    /// Subscribe to task state-change events
    pub fn subscribe(&self) -> broadcast::Receiver<TaskEvent> {
        self.events.subscribe()
    }

    /// Scan the default save directory for `*.meta` sidecars and re-enqueue
    /// the tasks they describe, Paused, under fresh ids. Corrupt sidecars
    /// are deleted. Returns the number of recovered tasks.
    pub async fn recover(&self) -> usize {
        let (dir, http_config) = {
            let config = self.config.lock();
            (config.default_save_dir.clone(), config.http.clone())
        };

        let mut entries = match tokio::fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) => {
                tracing::warn!("recovery scan of {:?} failed: {}", dir, e);
                return 0;
            }
        };

        let mut recovered = 0;
        while let Ok(Some(entry)) = entries.next_entry().await {
            let path = entry.path();
            if path.extension().map(|e| e != "meta").unwrap_or(true) {
                continue;
            }
            if !entry.file_type().await.map(|t| t.is_file()).unwrap_or(false) {
                continue;
            }

            let id = self.next_id.fetch_add(1, Ordering::Relaxed);
            match Task::from_meta(
                id,
                &path,
                http_config.clone(),
                Arc::clone(&self.pool),
                Arc::clone(&self.limiter),
                Arc::clone(&self.classifier),
                self.state_callback(),
            )
            .await
            {
                Some(task) => {
                    tracing::info!("recovered task {} from {:?}", id, path);
                    self.tasks.lock().insert(id, Arc::clone(&task));
                    self.queue.add(task);
                    recovered += 1;
                }
                None => {
                    tracing::warn!("deleting corrupt meta file {:?}", path);
                    MetaStore::remove(&path).await;
                }
            }
        }

        recovered
    }

    /// Replace the configuration. Fails eagerly on out-of-range values.
    /// The worker pool size is fixed at construction and not resized.
    pub fn update_config(&self, new_config: ManagerConfig) -> Result<()> {
        new_config.validate()?;

        if let Err(e) = std::fs::create_dir_all(&new_config.default_save_dir) {
            tracing::warn!(
                "could not create save dir {:?}: {}",
                new_config.default_save_dir,
                e
            );
        }

        self.limiter.set_rate(new_config.speed_limit);
        self.queue.set_max_concurrent(new_config.max_concurrent_tasks);
        if !new_config.classification_rules.is_empty() {
            self.classifier
                .update_rules(new_config.classification_rules.clone());
        }

        *self.config.lock() = new_config;
        Ok(())
    }

    /// Current configuration, cloned
    pub fn config(&self) -> ManagerConfig {
        self.config.lock().clone()
    }

    /// Cancel the limiter (waking every blocked acquirer) and drain the
    /// worker pool.
    pub async fn shutdown(&self) {
        self.limiter.cancel();
        self.pool.shutdown().await;
    }

    /// The queue, for tests that need auto-start control
    #[doc(hidden)]
    pub fn queue(&self) -> &TaskQueue {
        &self.queue
    }

    fn find(&self, id: TaskId) -> Option<Arc<Task>> {
        self.tasks.lock().get(&id).cloned()
    }

    fn state_callback(&self) -> StateCallback {
        let weak = self.self_ref.clone();
        Arc::new(move |id, state| {
            if let Some(manager) = weak.upgrade() {
                manager.on_task_state_change(id, state);
            }
        })
    }

    fn on_task_state_change(&self, id: TaskId, state: TaskState) {
        // Terminal transitions free a queue slot
        if state.is_terminal() {
            self.queue.on_task_finished(id);
        }
        let _ = self.events.send(TaskEvent::StateChanged { id, state });
    }
}

impl Drop for DownloadManager {
    fn drop(&mut self) {
        // Wake any block still waiting on tokens so workers can wind down
        self.limiter.cancel();
    }
}
