//! # splitfetch
//!
//! A multi-connection HTTP(S) download engine: large resources are split
//! into contiguous byte ranges fetched in parallel, with durable resume
//! across restarts, a global bandwidth cap, queued concurrent tasks and
//! per-task pause/resume/cancel.
//!
//! ## Features
//!
//! - **Segmented downloads**: up to 32 parallel range requests per file
//! - **Crash-safe resume**: per-task JSON sidecars record exact block progress
//! - **Global rate limiting**: one token bucket shared by every connection
//! - **Task queueing**: FIFO with a configurable active-count ceiling
//! - **No hidden state**: logging goes through `tracing`; install a
//!   subscriber or the events are dropped
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use splitfetch::{DownloadManager, ManagerConfig, TaskEvent};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let manager = DownloadManager::new(ManagerConfig::default())?;
//!
//!     // Pick up unfinished downloads from a previous run
//!     manager.recover().await;
//!
//!     let id = manager.add("https://example.com/file.zip", None, None, None)?;
//!
//!     let mut events = manager.subscribe();
//!     while let Ok(TaskEvent::StateChanged { id: eid, state }) = events.recv().await {
//!         println!("task {eid}: {state:?}");
//!     }
//!
//!     let _ = id;
//!     Ok(())
//! }
//! ```

pub mod block;
pub mod bucket;
pub mod classify;
pub mod config;
pub mod error;
pub mod http;
pub mod manager;
pub mod meta;
pub mod pool;
pub mod progress;
pub mod queue;
pub mod splitter;
pub mod task;
pub mod types;

// Re-exports for convenience
pub use bucket::TokenBucket;
pub use classify::FileClassifier;
pub use config::{HttpConfig, ManagerConfig};
pub use error::{DownloadError, Result, TransportErrorKind};
pub use http::{DataSink, FileInfo, HttpEngine};
pub use manager::DownloadManager;
pub use meta::{BlockDescriptor, MetaStore, TaskRecord};
pub use pool::{JobHandle, WorkerPool};
pub use progress::ProgressMonitor;
pub use queue::TaskQueue;
pub use splitter::split_blocks;
pub use task::Task;
pub use types::{ProgressInfo, TaskEvent, TaskId, TaskInfo, TaskState};
