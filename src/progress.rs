//! Progress tracking
//!
//! Thread-safe accumulator producing sliding-window speed and ETA
//! snapshots. Samples older than the window are discarded on each snapshot.

use crate::types::ProgressInfo;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::time::{Duration, Instant};

/// Sliding window length for speed calculation
const WINDOW: Duration = Duration::from_secs(5);

struct Inner {
    downloaded_bytes: i64,
    /// (monotonic time, cumulative bytes)
    samples: VecDeque<(Instant, i64)>,
}

/// Per-task progress aggregator
pub struct ProgressMonitor {
    total_bytes: i64,
    inner: Mutex<Inner>,
}

impl ProgressMonitor {
    /// `total_bytes == 0` means the size is unknown
    pub fn new(total_bytes: i64) -> Self {
        Self {
            total_bytes,
            inner: Mutex::new(Inner {
                downloaded_bytes: 0,
                samples: VecDeque::new(),
            }),
        }
    }

    /// Record downloaded bytes. Non-positive deltas are ignored.
    pub fn add(&self, bytes: i64) {
        if bytes <= 0 {
            return;
        }
        let mut inner = self.inner.lock();
        inner.downloaded_bytes += bytes;
        let cumulative = inner.downloaded_bytes;
        inner.samples.push_back((Instant::now(), cumulative));
    }

    /// Current cumulative byte count
    pub fn downloaded(&self) -> i64 {
        self.inner.lock().downloaded_bytes
    }

    /// Produce a snapshot, pruning samples outside the window.
    pub fn snapshot(&self) -> ProgressInfo {
        let mut inner = self.inner.lock();

        let now = Instant::now();
        while let Some(&(t, _)) = inner.samples.front() {
            if now.duration_since(t) > WINDOW {
                inner.samples.pop_front();
            } else {
                break;
            }
        }

        let mut speed = 0.0;
        if inner.samples.len() >= 2 {
            let (oldest_t, oldest_b) = *inner.samples.front().unwrap();
            let (newest_t, newest_b) = *inner.samples.back().unwrap();
            let elapsed = newest_t.duration_since(oldest_t).as_secs_f64();
            if elapsed > 0.0 {
                speed = (newest_b - oldest_b) as f64 / elapsed;
            }
        }

        let progress_percent = if self.total_bytes > 0 {
            inner.downloaded_bytes as f64 / self.total_bytes as f64 * 100.0
        } else {
            0.0
        };

        let remaining_seconds = if speed > 0.0 {
            ((self.total_bytes - inner.downloaded_bytes) as f64 / speed) as i64
        } else {
            -1
        };

        ProgressInfo {
            total_bytes: self.total_bytes,
            downloaded_bytes: inner.downloaded_bytes,
            speed_bytes_per_sec: speed,
            progress_percent,
            remaining_seconds,
        }
    }
}
