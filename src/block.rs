//! Block download unit
//!
//! A block downloads one byte range of the destination file through its own
//! [`HttpEngine`], writing at absolute offsets so blocks never coordinate.
//! Each received chunk flows through the global token bucket before it
//! touches the disk.

use crate::bucket::TokenBucket;
use crate::error::{DownloadError, Result};
use crate::http::{DataSink, HttpEngine};
use crate::meta::BlockDescriptor;

use async_trait::async_trait;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use tokio::fs::OpenOptions;
use tokio::io::{AsyncSeekExt, AsyncWriteExt, SeekFrom};

/// Callback reporting `(block_id, byte_delta)` to the owning task. A zero
/// delta marks the block's terminal event.
pub type BlockProgressFn = Arc<dyn Fn(usize, i64) + Send + Sync>;

/// One byte-range download unit
pub struct Block {
    id: usize,
    range_start: i64,
    range_end: i64,
    downloaded: AtomicI64,
    completed: AtomicBool,
    paused: AtomicBool,
    file_path: PathBuf,
    url: String,
    engine: Arc<HttpEngine>,
    limiter: Arc<TokenBucket>,
    on_progress: BlockProgressFn,
}

impl Block {
    pub fn new(
        descriptor: BlockDescriptor,
        file_path: PathBuf,
        url: String,
        engine: Arc<HttpEngine>,
        limiter: Arc<TokenBucket>,
        on_progress: BlockProgressFn,
    ) -> Self {
        Self {
            id: descriptor.id,
            range_start: descriptor.range_start,
            range_end: descriptor.range_end,
            downloaded: AtomicI64::new(descriptor.downloaded),
            completed: AtomicBool::new(descriptor.completed),
            paused: AtomicBool::new(false),
            file_path,
            url,
            engine,
            limiter,
            on_progress,
        }
    }

    pub fn id(&self) -> usize {
        self.id
    }

    /// Snapshot of the persistable state
    pub fn descriptor(&self) -> BlockDescriptor {
        BlockDescriptor {
            id: self.id,
            range_start: self.range_start,
            range_end: self.range_end,
            downloaded: self.downloaded.load(Ordering::Acquire),
            completed: self.completed.load(Ordering::Acquire),
        }
    }

    pub fn is_completed(&self) -> bool {
        self.completed.load(Ordering::Acquire)
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::Relaxed)
    }

    /// Stop the block: the data loop aborts before the next chunk and the
    /// engine kills the in-flight request. Idempotent, any thread.
    pub fn pause(&self) {
        self.paused.store(true, Ordering::Relaxed);
        self.engine.cancel();
    }

    /// Run the download. Called from a worker-pool job; returns when the
    /// range is complete, the block is paused, or a fatal error occurs.
    pub async fn execute(&self) -> Result<()> {
        if self.is_completed() {
            return Ok(());
        }
        self.paused.store(false, Ordering::Relaxed);

        // The task pre-allocated the file; open shared for positional writes.
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(self.range_start < 0)
            .open(&self.file_path)
            .await
            .map_err(|e| DownloadError::storage(&self.file_path, format!("open failed: {e}")))?;

        let downloaded = self.downloaded.load(Ordering::Acquire);
        let write_offset = self.range_start.max(0) + downloaded;
        file.seek(SeekFrom::Start(write_offset as u64))
            .await
            .map_err(|e| DownloadError::storage(&self.file_path, format!("seek failed: {e}")))?;

        // Resume the HTTP range from the exact byte after prior progress.
        let (req_start, req_end) = if self.range_start < 0 {
            (if downloaded > 0 { downloaded } else { -1 }, -1)
        } else {
            (self.range_start + downloaded, self.range_end)
        };

        let mut sink = BlockSink {
            block: self,
            file,
            write_error: None,
        };

        let result = self
            .engine
            .download(&self.url, req_start, req_end, &mut sink, None)
            .await;

        // Close the handle before propagating anything.
        let write_error = sink.write_error.take();
        let file = sink.file;
        drop(file);

        match result {
            Ok(()) => {
                if !self.is_paused() {
                    self.completed.store(true, Ordering::Release);
                    // Terminal zero-byte event for the aggregator
                    (self.on_progress)(self.id, 0);
                }
                Ok(())
            }
            Err(err) => {
                if let Some(io) = write_error {
                    return Err(DownloadError::storage(
                        &self.file_path,
                        format!("write failed: {io}"),
                    ));
                }
                Err(err)
            }
        }
    }
}

/// Sink bridging engine chunks into rate-limited positional writes
struct BlockSink<'a> {
    block: &'a Block,
    file: tokio::fs::File,
    write_error: Option<std::io::Error>,
}

#[async_trait]
impl DataSink for BlockSink<'_> {
    async fn write(&mut self, chunk: &[u8]) -> usize {
        let mut rest = chunk;
        let mut total = 0;

        while !rest.is_empty() {
            if self.block.is_paused() {
                return total;
            }

            // The limiter may grant less than requested; write the granted
            // prefix and loop for the remainder.
            let granted = self.block.limiter.acquire(rest.len() as i64).await;
            if granted == 0 {
                return total;
            }
            let take = (granted as usize).min(rest.len());

            if let Err(e) = self.file.write_all(&rest[..take]).await {
                self.write_error = Some(e);
                return total;
            }

            self.block.downloaded.fetch_add(take as i64, Ordering::AcqRel);
            total += take;
            (self.block.on_progress)(self.block.id, take as i64);
            rest = &rest[take..];
        }

        total
    }
}
