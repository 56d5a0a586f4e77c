//! Resume metadata persistence
//!
//! Each task keeps a JSON sidecar next to its destination file
//! (`<file>.meta`) describing the block layout and per-block progress, so a
//! download can resume byte-exact after a crash or restart. Only the owning
//! task ever writes the sidecar.

use crate::error::{DownloadError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// One contiguous byte range of a download
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockDescriptor {
    #[serde(rename = "block_id")]
    pub id: usize,
    /// First byte of the range, inclusive. -1 together with `range_end == -1`
    /// is the sentinel for "unknown size, fetch everything".
    pub range_start: i64,
    /// Last byte of the range, inclusive
    pub range_end: i64,
    /// Bytes already written for this block
    pub downloaded: i64,
    pub completed: bool,
}

impl BlockDescriptor {
    /// New pending block covering `[start, end]`
    pub fn new(id: usize, start: i64, end: i64) -> Self {
        Self {
            id,
            range_start: start,
            range_end: end,
            downloaded: 0,
            completed: false,
        }
    }

    /// Sentinel block for servers that do not disclose a length
    pub fn unknown_size() -> Self {
        Self::new(0, -1, -1)
    }

    pub fn is_sentinel(&self) -> bool {
        self.range_start < 0
    }

    /// Total size of the range; meaningless for the sentinel
    pub fn size(&self) -> i64 {
        self.range_end - self.range_start + 1
    }

    pub fn remaining(&self) -> i64 {
        (self.size() - self.downloaded).max(0)
    }
}

/// Persisted state of one task
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskRecord {
    pub url: String,
    pub file_path: String,
    pub file_name: String,
    pub file_size: i64,
    #[serde(default)]
    pub etag: String,
    #[serde(default)]
    pub last_modified: String,
    pub max_blocks: u32,
    pub blocks: Vec<BlockDescriptor>,
}

impl TaskRecord {
    /// Sum of per-block downloaded counters
    pub fn downloaded_total(&self) -> i64 {
        self.blocks.iter().map(|b| b.downloaded).sum()
    }
}

/// Reader/writer for the `.meta` sidecar files
pub struct MetaStore;

impl MetaStore {
    /// Sidecar path for a destination file: `<file_path>.meta`
    pub fn meta_path(file_path: &Path) -> PathBuf {
        let mut os = file_path.as_os_str().to_os_string();
        os.push(".meta");
        PathBuf::from(os)
    }

    /// Write the record as indented JSON. The write is atomic at the
    /// rename level: serialize to a temp file, then rename over the target.
    pub async fn save(meta_path: &Path, record: &TaskRecord) -> Result<()> {
        let json = Self::to_json(record)?;

        let tmp_path = meta_path.with_extension("meta.tmp");
        tokio::fs::write(&tmp_path, json)
            .await
            .map_err(|e| DownloadError::storage(&tmp_path, format!("write failed: {e}")))?;
        tokio::fs::rename(&tmp_path, meta_path)
            .await
            .map_err(|e| DownloadError::storage(meta_path, format!("rename failed: {e}")))?;
        Ok(())
    }

    /// Read a record back. Returns `None` on any I/O error or malformed
    /// JSON; corrupt sidecars are the caller's cleanup problem.
    pub async fn load(meta_path: &Path) -> Option<TaskRecord> {
        let data = tokio::fs::read(meta_path).await.ok()?;
        match serde_json::from_slice(&data) {
            Ok(record) => Some(record),
            Err(e) => {
                tracing::warn!("malformed meta file {:?}: {}", meta_path, e);
                None
            }
        }
    }

    /// Delete the sidecar, best-effort
    pub async fn remove(meta_path: &Path) {
        let _ = tokio::fs::remove_file(meta_path).await;
    }

    fn to_json(record: &TaskRecord) -> Result<Vec<u8>> {
        let mut buf = Vec::new();
        let formatter = serde_json::ser::PrettyFormatter::with_indent(b"    ");
        let mut serializer = serde_json::Serializer::with_formatter(&mut buf, formatter);
        record.serialize(&mut serializer)?;
        Ok(buf)
    }
}
