//! Task orchestration
//!
//! A task drives the whole life of one download: probe the server, resolve
//! the filename, pre-allocate the destination, split into blocks, submit
//! them to the worker pool, aggregate progress, and verify completion.
//! Pause/resume/cancel fan out to the blocks; resume revalidates the server
//! resource against the stored ETag/Last-Modified before reusing progress.

use crate::block::{Block, BlockProgressFn};
use crate::bucket::TokenBucket;
use crate::classify::FileClassifier;
use crate::config::{HttpConfig, MAX_BLOCKS_LIMIT};
use crate::error::{DownloadError, Result};
use crate::http::{filename_from_url, parse_content_disposition, HttpEngine};
use crate::meta::{BlockDescriptor, MetaStore, TaskRecord};
use crate::pool::WorkerPool;
use crate::progress::ProgressMonitor;
use crate::splitter::split_blocks;
use crate::types::{TaskId, TaskInfo, TaskState};

use parking_lot::Mutex;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

/// State-change notification. Invoked only on real changes, never under a
/// task lock.
pub type StateCallback = Arc<dyn Fn(TaskId, TaskState) + Send + Sync>;

/// Automatic retries of a failed initialization (retryable failures only)
const MAX_INIT_RETRIES: u32 = 3;

/// Mutable task details behind one short-lived lock
struct Details {
    url: String,
    file_name: String,
    file_path: PathBuf,
    meta_path: PathBuf,
    file_size: i64,
    etag: String,
    last_modified: String,
    accept_ranges: bool,
    error_message: String,
}

/// One download task
pub struct Task {
    self_ref: Weak<Task>,
    id: TaskId,
    save_dir: PathBuf,
    max_blocks: u32,
    http_config: HttpConfig,
    pool: Arc<WorkerPool>,
    limiter: Arc<TokenBucket>,
    classifier: Arc<FileClassifier>,
    on_state_change: StateCallback,
    state: Mutex<TaskState>,
    details: Mutex<Details>,
    blocks: Mutex<Vec<Arc<Block>>>,
    progress: Mutex<Arc<ProgressMonitor>>,
    init_retries: AtomicU32,
    finishing: AtomicBool,
}

impl Task {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        id: TaskId,
        url: String,
        save_dir: PathBuf,
        max_blocks: u32,
        http_config: HttpConfig,
        pool: Arc<WorkerPool>,
        limiter: Arc<TokenBucket>,
        classifier: Arc<FileClassifier>,
        on_state_change: StateCallback,
    ) -> Arc<Self> {
        let max_blocks = max_blocks.clamp(1, MAX_BLOCKS_LIMIT);
        let file_name = filename_from_url(&url).unwrap_or_else(|| "download".to_string());
        let file_path = save_dir.join(&file_name);
        let meta_path = MetaStore::meta_path(&file_path);

        Arc::new_cyclic(|weak| Self {
            self_ref: weak.clone(),
            id,
            save_dir,
            max_blocks,
            http_config,
            pool,
            limiter,
            classifier,
            on_state_change,
            state: Mutex::new(TaskState::Queued),
            details: Mutex::new(Details {
                url,
                file_name,
                file_path,
                meta_path,
                file_size: 0,
                etag: String::new(),
                last_modified: String::new(),
                accept_ranges: false,
                error_message: String::new(),
            }),
            blocks: Mutex::new(Vec::new()),
            progress: Mutex::new(Arc::new(ProgressMonitor::new(0))),
            init_retries: AtomicU32::new(0),
            finishing: AtomicBool::new(false),
        })
    }

    /// Restore a task from its sidecar record. The task comes back Paused
    /// with its cumulative progress; the user resumes it explicitly.
    #[allow(clippy::too_many_arguments)]
    pub async fn from_meta(
        id: TaskId,
        meta_path: &Path,
        http_config: HttpConfig,
        pool: Arc<WorkerPool>,
        limiter: Arc<TokenBucket>,
        classifier: Arc<FileClassifier>,
        on_state_change: StateCallback,
    ) -> Option<Arc<Self>> {
        let record = MetaStore::load(meta_path).await?;

        let file_path = PathBuf::from(&record.file_path);
        let save_dir = file_path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));

        let monitor = ProgressMonitor::new(record.file_size);
        let already = record.downloaded_total();
        if already > 0 {
            monitor.add(already);
        }

        let task = Arc::new_cyclic(|weak| Self {
            self_ref: weak.clone(),
            id,
            save_dir,
            max_blocks: record.max_blocks.clamp(1, MAX_BLOCKS_LIMIT),
            http_config,
            pool,
            limiter,
            classifier,
            on_state_change,
            state: Mutex::new(TaskState::Paused),
            details: Mutex::new(Details {
                url: record.url,
                file_name: record.file_name,
                file_path,
                meta_path: meta_path.to_path_buf(),
                file_size: record.file_size,
                etag: record.etag,
                last_modified: record.last_modified,
                // A persisted block layout implies the server accepted ranges
                accept_ranges: true,
                error_message: String::new(),
            }),
            blocks: Mutex::new(Vec::new()),
            progress: Mutex::new(Arc::new(monitor)),
            init_retries: AtomicU32::new(0),
            finishing: AtomicBool::new(false),
        });

        Some(task)
    }

    pub fn id(&self) -> TaskId {
        self.id
    }

    pub fn state(&self) -> TaskState {
        *self.state.lock()
    }

    /// Snapshot for front-ends
    pub fn info(&self) -> TaskInfo {
        let state = *self.state.lock();
        let progress = Arc::clone(&*self.progress.lock()).snapshot();
        let details = self.details.lock();
        TaskInfo {
            id: self.id,
            url: details.url.clone(),
            file_path: details.file_path.clone(),
            file_name: details.file_name.clone(),
            file_size: details.file_size,
            state,
            progress,
            error_message: details.error_message.clone(),
        }
    }

    // ── lifecycle ───────────────────────────────────────────────

    /// Queued → Downloading. Submits the initialization unit to the pool;
    /// no-op in any other state.
    pub fn start(&self) {
        {
            let mut state = self.state.lock();
            if *state != TaskState::Queued {
                return;
            }
            *state = TaskState::Downloading;
        }
        self.emit(TaskState::Downloading);

        let Some(task) = self.self_ref.upgrade() else {
            return;
        };
        if self.pool.submit(async move { task.run_init().await }).is_err() {
            // Pool is draining; park the task back without a callback to
            // avoid reentering the queue during teardown.
            let mut state = self.state.lock();
            if *state == TaskState::Downloading {
                *state = TaskState::Queued;
            }
            tracing::warn!("task {}: worker pool unavailable", self.id);
        }
    }

    /// Downloading → Paused. Cancels every block's engine and persists the
    /// sidecar so a later resume continues byte-exact.
    pub async fn pause(&self) {
        {
            let mut state = self.state.lock();
            if *state != TaskState::Downloading {
                return;
            }
            *state = TaskState::Paused;
        }

        let blocks: Vec<_> = self.blocks.lock().clone();
        for block in &blocks {
            block.pause();
        }

        self.save_meta().await;
        self.emit(TaskState::Paused);
    }

    /// Paused|Failed → Downloading. Revalidates the server resource before
    /// reusing stored progress.
    pub fn resume(&self) {
        {
            let mut state = self.state.lock();
            if !matches!(*state, TaskState::Paused | TaskState::Failed) {
                return;
            }
            *state = TaskState::Downloading;
        }
        self.emit(TaskState::Downloading);

        let Some(task) = self.self_ref.upgrade() else {
            return;
        };
        if self.pool.submit(async move { task.run_resume().await }).is_err() {
            let mut state = self.state.lock();
            if *state == TaskState::Downloading {
                *state = TaskState::Paused;
            }
            tracing::warn!("task {}: worker pool unavailable", self.id);
        }
    }

    /// Move to Cancelled and clean up the destination and the sidecar.
    /// Completed and already-cancelled tasks are left alone. Block objects
    /// stay alive so outstanding workers can still observe the flags.
    pub async fn cancel(&self) {
        {
            let mut state = self.state.lock();
            if !state.is_cancellable() {
                return;
            }
            *state = TaskState::Cancelled;
        }

        let blocks: Vec<_> = self.blocks.lock().clone();
        for block in &blocks {
            block.pause();
        }

        let (file_path, meta_path) = {
            let details = self.details.lock();
            (details.file_path.clone(), details.meta_path.clone())
        };
        let _ = tokio::fs::remove_file(&file_path).await;
        MetaStore::remove(&meta_path).await;

        self.emit(TaskState::Cancelled);
    }

    // ── initialization ──────────────────────────────────────────

    async fn run_init(self: Arc<Self>) {
        loop {
            match self.initialize().await {
                Ok(()) => return,
                Err(err) => {
                    tracing::error!("task {} initialization failed: {}", self.id, err);
                    let retryable = err.is_retryable();
                    self.details.lock().error_message = err.to_string();

                    if retryable && self.init_retries.load(Ordering::Relaxed) < MAX_INIT_RETRIES {
                        let attempt = self.init_retries.fetch_add(1, Ordering::Relaxed) + 1;
                        tracing::info!(
                            "task {} auto-retry {}/{}",
                            self.id,
                            attempt,
                            MAX_INIT_RETRIES
                        );
                        self.set_state(TaskState::Queued);
                        tokio::time::sleep(Duration::from_secs(2 * attempt as u64)).await;

                        // Re-enter Downloading unless something else moved us
                        {
                            let mut state = self.state.lock();
                            if *state != TaskState::Queued {
                                return;
                            }
                            *state = TaskState::Downloading;
                        }
                        self.emit(TaskState::Downloading);
                        continue;
                    }

                    self.set_state(TaskState::Failed);
                    return;
                }
            }
        }
    }

    async fn initialize(&self) -> Result<()> {
        let url = self.details.lock().url.clone();
        tracing::info!("task {} fetching file info: {}", self.id, url);

        let probe = HttpEngine::new(self.http_config.clone())?;
        let info = probe.fetch_info(&url).await?;
        tracing::info!(
            "task {} probe: size={} ranges={} type={} final_url={}",
            self.id,
            info.content_length,
            info.accept_ranges,
            info.content_type,
            info.final_url
        );

        // The task may have been paused or cancelled while the probe was in
        // flight; creating blocks now would resurrect it.
        if *self.state.lock() != TaskState::Downloading {
            return Ok(());
        }

        let effective_url = {
            let mut details = self.details.lock();
            details.file_size = info.content_length;
            details.accept_ranges = info.accept_ranges;
            details.etag = info.etag.clone();
            details.last_modified = info.last_modified.clone();
            if !info.final_url.is_empty() {
                details.url = info.final_url.clone();
            }
            details.url.clone()
        };

        // Filename priority: Content-Disposition, then the effective URL's
        // last segment, then a last-resort constant.
        let name = parse_content_disposition(&info.content_disposition)
            .or_else(|| filename_from_url(&effective_url))
            .unwrap_or_else(|| "download".to_string());
        let name = resolve_conflict(&self.save_dir, &name).await;

        {
            let mut details = self.details.lock();
            details.file_name = name.clone();
            details.file_path = self.save_dir.join(&name);
            details.meta_path = MetaStore::meta_path(&details.file_path);
        }

        self.prepare_blocks().await?;
        self.save_meta().await;
        self.submit_blocks();
        Ok(())
    }

    /// Allocate the destination, reset the progress monitor and build the
    /// block set from the current details. Shared by first start and the
    /// restart-after-server-change path.
    async fn prepare_blocks(&self) -> Result<()> {
        let (file_size, accept_ranges, file_path) = {
            let mut details = self.details.lock();
            // No disclosed length: stream to EOF in a single block, no
            // pre-allocation, never upgraded mid-transfer.
            if details.file_size <= 0 {
                details.file_size = 0;
                details.accept_ranges = false;
            }
            (
                details.file_size,
                details.accept_ranges,
                details.file_path.clone(),
            )
        };

        if file_size > 0 {
            allocate_file(&file_path, file_size).await?;
        }

        *self.progress.lock() = Arc::new(ProgressMonitor::new(file_size));

        let descriptors = if file_size > 0 {
            split_blocks(file_size, self.max_blocks, accept_ranges)?
        } else {
            vec![BlockDescriptor::unknown_size()]
        };
        self.create_blocks(descriptors)
    }

    // ── resume ──────────────────────────────────────────────────

    async fn run_resume(self: Arc<Self>) {
        if let Err(err) = self.reinitialize().await {
            tracing::error!("task {} resume failed: {}", self.id, err);
            self.details.lock().error_message = err.to_string();
            self.set_state(TaskState::Failed);
        }
    }

    async fn reinitialize(&self) -> Result<()> {
        let (url, etag, last_modified, meta_path) = {
            let details = self.details.lock();
            (
                details.url.clone(),
                details.etag.clone(),
                details.last_modified.clone(),
                details.meta_path.clone(),
            )
        };

        let probe = HttpEngine::new(self.http_config.clone())?;
        let info = probe.fetch_info(&url).await?;

        if *self.state.lock() != TaskState::Downloading {
            return Ok(());
        }

        let changed = (!etag.is_empty() && !info.etag.is_empty() && etag != info.etag)
            || (!last_modified.is_empty()
                && !info.last_modified.is_empty()
                && last_modified != info.last_modified);

        if changed {
            tracing::info!(
                "task {}: server resource changed, discarding progress",
                self.id
            );
            self.blocks.lock().clear();
            {
                let mut details = self.details.lock();
                details.file_size = info.content_length;
                details.accept_ranges = info.accept_ranges;
                details.etag = info.etag.clone();
                details.last_modified = info.last_modified.clone();
            }
            // prepare_blocks re-allocates, truncating bytes from the old
            // generation of the resource.
            self.prepare_blocks().await?;
            self.save_meta().await;
            self.submit_blocks();
            return Ok(());
        }

        let Some(record) = MetaStore::load(&meta_path).await else {
            // Sidecar is gone; treat this as a fresh download.
            return self.initialize().await;
        };

        let monitor = Arc::new(ProgressMonitor::new(record.file_size));
        let already = record.downloaded_total();
        if already > 0 {
            monitor.add(already);
        }
        *self.progress.lock() = monitor;

        // Keep completed blocks in the set (for meta integrity and the
        // all-done check); only incomplete ones are submitted.
        self.create_blocks(record.blocks)?;

        let pending = self
            .blocks
            .lock()
            .iter()
            .filter(|b| !b.is_completed())
            .count();
        if pending == 0 {
            self.finish().await;
            return Ok(());
        }

        self.submit_blocks();
        Ok(())
    }

    // ── block plumbing ──────────────────────────────────────────

    fn create_blocks(&self, descriptors: Vec<BlockDescriptor>) -> Result<()> {
        let (url, file_path) = {
            let details = self.details.lock();
            (details.url.clone(), details.file_path.clone())
        };

        let weak = self.self_ref.clone();
        let on_progress: BlockProgressFn = Arc::new(move |block_id, delta| {
            if let Some(task) = weak.upgrade() {
                task.on_block_progress(block_id, delta);
            }
        });

        let mut blocks = Vec::with_capacity(descriptors.len());
        for descriptor in descriptors {
            // One single-request engine per block
            let engine = Arc::new(HttpEngine::new(self.http_config.clone())?);
            blocks.push(Arc::new(Block::new(
                descriptor,
                file_path.clone(),
                url.clone(),
                engine,
                Arc::clone(&self.limiter),
                Arc::clone(&on_progress),
            )));
        }
        *self.blocks.lock() = blocks;
        Ok(())
    }

    fn submit_blocks(&self) {
        if *self.state.lock() != TaskState::Downloading {
            return;
        }
        let pending: Vec<Arc<Block>> = self
            .blocks
            .lock()
            .iter()
            .filter(|b| !b.is_completed())
            .cloned()
            .collect();

        let Some(task) = self.self_ref.upgrade() else {
            return;
        };
        for block in pending {
            let task = Arc::clone(&task);
            let job = async move {
                let result = block.execute().await;
                task.on_block_finished(&block, result).await;
            };
            if self.pool.submit(job).is_err() {
                tracing::warn!("task {}: worker pool unavailable, block not submitted", self.id);
            }
        }
    }

    fn on_block_progress(&self, _block_id: usize, delta: i64) {
        if *self.state.lock() == TaskState::Cancelled {
            return;
        }
        let monitor = Arc::clone(&*self.progress.lock());
        monitor.add(delta);
    }

    async fn on_block_finished(self: &Arc<Self>, block: &Arc<Block>, result: Result<()>) {
        match result {
            Ok(()) => {
                if *self.state.lock() != TaskState::Downloading {
                    return;
                }
                let all_done = {
                    let blocks = self.blocks.lock();
                    !blocks.is_empty() && blocks.iter().all(|b| b.is_completed())
                };
                if all_done {
                    self.finish().await;
                }
            }
            Err(err) => {
                // A paused or cancelled block aborts its transfer; that is
                // not a failure, and never turns into Cancelled here.
                if matches!(err, DownloadError::Cancelled) || block.is_paused() {
                    return;
                }
                if matches!(*self.state.lock(), TaskState::Paused | TaskState::Cancelled) {
                    return;
                }

                tracing::error!("task {} block {} failed: {}", self.id, block.id(), err);
                self.details.lock().error_message = err.to_string();

                let newly_failed = {
                    let mut state = self.state.lock();
                    if *state == TaskState::Downloading {
                        *state = TaskState::Failed;
                        true
                    } else {
                        false
                    }
                };
                if newly_failed {
                    // Release pool slots and keep the sidecar fresh for resume
                    let blocks: Vec<_> = self.blocks.lock().clone();
                    for b in &blocks {
                        b.pause();
                    }
                    self.save_meta().await;
                    self.emit(TaskState::Failed);
                }
            }
        }
    }

    // ── completion ──────────────────────────────────────────────

    async fn finish(&self) {
        if self.finishing.swap(true, Ordering::AcqRel) {
            return;
        }

        let (file_size, file_path, file_name, meta_path) = {
            let details = self.details.lock();
            (
                details.file_size,
                details.file_path.clone(),
                details.file_name.clone(),
                details.meta_path.clone(),
            )
        };

        if file_size > 0 {
            let size_ok = matches!(
                tokio::fs::metadata(&file_path).await,
                Ok(m) if m.len() as i64 == file_size
            );
            if !size_ok {
                self.details.lock().error_message =
                    format!("size mismatch after download, expected {file_size} bytes");
                self.finishing.store(false, Ordering::Release);
                self.set_state(TaskState::Failed);
                return;
            }
        }

        // Category move is best-effort; completion stands even if it fails.
        match self
            .classifier
            .move_to_category(&file_path, &self.save_dir)
            .await
        {
            Ok(new_path) => self.details.lock().file_path = new_path,
            Err(err) => {
                tracing::warn!("task {}: classification move failed: {}", self.id, err)
            }
        }

        MetaStore::remove(&meta_path).await;
        tracing::info!("task {} completed: {}", self.id, file_name);
        self.set_state(TaskState::Completed);
    }

    // ── persistence & state ─────────────────────────────────────

    async fn save_meta(&self) {
        let blocks: Vec<BlockDescriptor> =
            self.blocks.lock().iter().map(|b| b.descriptor()).collect();
        let (record, meta_path) = {
            let details = self.details.lock();
            (
                TaskRecord {
                    url: details.url.clone(),
                    file_path: details.file_path.to_string_lossy().into_owned(),
                    file_name: details.file_name.clone(),
                    file_size: details.file_size,
                    etag: details.etag.clone(),
                    last_modified: details.last_modified.clone(),
                    max_blocks: self.max_blocks,
                    blocks,
                },
                details.meta_path.clone(),
            )
        };

        if let Err(err) = MetaStore::save(&meta_path, &record).await {
            tracing::warn!("task {}: failed to persist meta: {}", self.id, err);
        }
    }

    /// Transition with the Cancelled barrier: a cancelled task never
    /// changes state again.
    fn set_state(&self, new_state: TaskState) {
        {
            let mut state = self.state.lock();
            if *state == new_state || *state == TaskState::Cancelled {
                return;
            }
            *state = new_state;
        }
        self.emit(new_state);
    }

    fn emit(&self, state: TaskState) {
        (self.on_state_change)(self.id, state);
    }
}

/// Create (truncating) and pre-size the destination file. Positional writes
/// must land anywhere in `[0, size)` afterwards.
async fn allocate_file(path: &Path, size: i64) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| DownloadError::storage(parent, format!("create dir failed: {e}")))?;
        }
    }

    let file = tokio::fs::File::create(path)
        .await
        .map_err(|e| DownloadError::storage(path, format!("create failed: {e}")))?;
    file.set_len(size as u64)
        .await
        .map_err(|e| DownloadError::storage(path, format!("pre-allocate failed: {e}")))?;
    Ok(())
}

/// Resolve an on-disk name collision by appending ` (1)`, ` (2)`, ... before
/// the extension, giving up after 999.
async fn resolve_conflict(dir: &Path, name: &str) -> String {
    let exists = |p: PathBuf| async move { tokio::fs::try_exists(&p).await.unwrap_or(false) };

    if !exists(dir.join(name)).await {
        return name.to_string();
    }

    let path = Path::new(name);
    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| name.to_string());
    let ext = path
        .extension()
        .map(|e| format!(".{}", e.to_string_lossy()))
        .unwrap_or_default();

    for i in 1..1000 {
        let candidate = format!("{stem} ({i}){ext}");
        if !exists(dir.join(&candidate)).await {
            return candidate;
        }
    }
    name.to_string()
}
