//! Engine configuration
//!
//! All knobs for the download manager and the per-request HTTP behavior.

use crate::error::{DownloadError, Result};
use crate::pool::DEFAULT_POOL_SIZE;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;

/// Maximum blocks a single task may be split into
pub const MAX_BLOCKS_LIMIT: u32 = 32;

/// Maximum tasks downloading at the same time
pub const MAX_CONCURRENT_LIMIT: usize = 10;

/// Main configuration for the download manager
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManagerConfig {
    /// Directory new downloads are saved to (and scanned on recovery)
    pub default_save_dir: PathBuf,

    /// Blocks per task, 1..=32
    pub max_blocks_per_task: u32,

    /// Simultaneously downloading tasks, 1..=10
    pub max_concurrent_tasks: usize,

    /// Worker pool size; one block in flight occupies one slot
    pub worker_pool_size: usize,

    /// Global download speed limit in bytes/sec, 0 = unlimited
    pub speed_limit: i64,

    /// File classification rules: category -> extensions (".zip", ".tar.gz", ...).
    /// Empty means the built-in rules are used.
    #[serde(default)]
    pub classification_rules: HashMap<String, Vec<String>>,

    /// HTTP behavior shared by all tasks
    pub http: HttpConfig,
}

/// Per-request HTTP configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpConfig {
    /// Connection timeout in seconds
    pub connect_timeout_sec: u64,

    /// Overall transfer timeout in seconds, 0 = unbounded
    pub transfer_timeout_sec: u64,

    /// Abort when the transfer rate stays below this many bytes/sec...
    pub low_speed_limit: u32,

    /// ...for this many seconds
    pub low_speed_time: u64,

    /// Maximum redirects to follow
    pub max_redirects: usize,

    /// Retries after the first failed attempt
    pub max_retries: u32,

    /// Verify TLS certificates
    pub verify_tls: bool,

    /// HTTP basic auth, empty = unset
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,

    /// Referer header, empty = unset
    #[serde(default)]
    pub referer: String,

    /// Cookie header, empty = unset
    #[serde(default)]
    pub cookie: String,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            default_save_dir: dirs::download_dir().unwrap_or_else(|| PathBuf::from(".")),
            max_blocks_per_task: 8,
            max_concurrent_tasks: 3,
            worker_pool_size: DEFAULT_POOL_SIZE,
            speed_limit: 0,
            classification_rules: HashMap::new(),
            http: HttpConfig::default(),
        }
    }
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            connect_timeout_sec: 30,
            transfer_timeout_sec: 0,
            low_speed_limit: 1000,
            low_speed_time: 60,
            max_redirects: 10,
            max_retries: 3,
            verify_tls: true,
            username: String::new(),
            password: String::new(),
            referer: String::new(),
            cookie: String::new(),
        }
    }
}

impl ManagerConfig {
    /// Create a new config with default values
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the default save directory
    pub fn save_dir(mut self, path: impl Into<PathBuf>) -> Self {
        self.default_save_dir = path.into();
        self
    }

    /// Set blocks per task
    pub fn max_blocks_per_task(mut self, max: u32) -> Self {
        self.max_blocks_per_task = max;
        self
    }

    /// Set concurrent task limit
    pub fn max_concurrent_tasks(mut self, max: usize) -> Self {
        self.max_concurrent_tasks = max;
        self
    }

    /// Set worker pool size
    pub fn worker_pool_size(mut self, size: usize) -> Self {
        self.worker_pool_size = size;
        self
    }

    /// Set the global speed limit (bytes/sec, 0 = unlimited)
    pub fn speed_limit(mut self, limit: i64) -> Self {
        self.speed_limit = limit;
        self
    }

    /// Replace the classification rules
    pub fn classification_rules(mut self, rules: HashMap<String, Vec<String>>) -> Self {
        self.classification_rules = rules;
        self
    }

    /// Validate the configuration, failing eagerly on out-of-range values
    pub fn validate(&self) -> Result<()> {
        if self.default_save_dir.as_os_str().is_empty() {
            return Err(DownloadError::invalid_input(
                "default_save_dir",
                "must not be empty",
            ));
        }

        if self.max_blocks_per_task < 1 || self.max_blocks_per_task > MAX_BLOCKS_LIMIT {
            return Err(DownloadError::invalid_input(
                "max_blocks_per_task",
                format!("must be in [1, {MAX_BLOCKS_LIMIT}]"),
            ));
        }

        if self.max_concurrent_tasks < 1 || self.max_concurrent_tasks > MAX_CONCURRENT_LIMIT {
            return Err(DownloadError::invalid_input(
                "max_concurrent_tasks",
                format!("must be in [1, {MAX_CONCURRENT_LIMIT}]"),
            ));
        }

        if self.worker_pool_size < 1 {
            return Err(DownloadError::invalid_input(
                "worker_pool_size",
                "must be at least 1",
            ));
        }

        if self.speed_limit < 0 {
            return Err(DownloadError::invalid_input(
                "speed_limit",
                "must be non-negative",
            ));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        let config = ManagerConfig::default();
        assert_eq!(config.max_blocks_per_task, 8);
        assert_eq!(config.max_concurrent_tasks, 3);
        assert_eq!(config.worker_pool_size, 16);
        assert_eq!(config.speed_limit, 0);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn builder_methods() {
        let config = ManagerConfig::new()
            .save_dir("/tmp/dl")
            .max_blocks_per_task(16)
            .max_concurrent_tasks(5)
            .speed_limit(1024 * 1024);

        assert_eq!(config.default_save_dir, PathBuf::from("/tmp/dl"));
        assert_eq!(config.max_blocks_per_task, 16);
        assert_eq!(config.max_concurrent_tasks, 5);
        assert_eq!(config.speed_limit, 1024 * 1024);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn out_of_range_values_rejected() {
        assert!(ManagerConfig::new().max_blocks_per_task(0).validate().is_err());
        assert!(ManagerConfig::new().max_blocks_per_task(33).validate().is_err());
        assert!(ManagerConfig::new().max_concurrent_tasks(0).validate().is_err());
        assert!(ManagerConfig::new().max_concurrent_tasks(11).validate().is_err());
        assert!(ManagerConfig::new().worker_pool_size(0).validate().is_err());
        assert!(ManagerConfig::new().speed_limit(-1).validate().is_err());
    }

    #[test]
    fn http_defaults() {
        let http = HttpConfig::default();
        assert_eq!(http.connect_timeout_sec, 30);
        assert_eq!(http.transfer_timeout_sec, 0);
        assert_eq!(http.max_retries, 3);
        assert!(http.verify_tls);
    }
}
