//! Global bandwidth limiting
//!
//! A token bucket shared by every block in the process. Capacity equals one
//! second's worth of tokens, so bursts never exceed the configured rate for
//! longer than a second. Waiters block cooperatively and are woken by rate
//! changes and cancellation.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::Notify;

struct BucketState {
    /// Token generation rate (bytes/sec); 0 = unlimited
    rate: i64,
    /// Currently available tokens
    tokens: i64,
    /// Bucket capacity (= rate, one second's worth)
    max_tokens: i64,
    last_refill: Instant,
}

impl BucketState {
    fn refill(&mut self) {
        if self.rate <= 0 {
            return;
        }
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        let new_tokens = (self.rate as f64 * elapsed) as i64;
        if new_tokens > 0 {
            self.tokens = (self.tokens + new_tokens).min(self.max_tokens);
            self.last_refill = now;
        }
    }
}

/// Shared rate limiter. `acquire` blocks until tokens are available or the
/// bucket is cancelled.
pub struct TokenBucket {
    state: Mutex<BucketState>,
    notify: Notify,
    cancelled: AtomicBool,
}

impl TokenBucket {
    /// `rate == 0` disables limiting. The bucket starts full.
    pub fn new(rate_bytes_per_sec: i64) -> Self {
        let rate = rate_bytes_per_sec.max(0);
        Self {
            state: Mutex::new(BucketState {
                rate,
                tokens: rate,
                max_tokens: rate,
                last_refill: Instant::now(),
            }),
            notify: Notify::new(),
            cancelled: AtomicBool::new(false),
        }
    }

    /// Acquire up to `n` tokens, waiting for refills as needed.
    ///
    /// Returns the number of tokens granted: `n` in the common case, the
    /// bucket capacity when `n` exceeds what one second can ever hold, and
    /// 0 if (and only if) the bucket was cancelled. Requests of `n <= 0`
    /// return 0 immediately.
    pub async fn acquire(&self, n: i64) -> i64 {
        if n <= 0 {
            return 0;
        }

        loop {
            if self.cancelled.load(Ordering::Relaxed) {
                return 0;
            }

            let wait = {
                let mut state = self.state.lock();
                if state.rate == 0 {
                    return n;
                }
                state.refill();

                // A request larger than the capacity can never be satisfied
                // in full; grant the capacity instead.
                let want = n.min(state.max_tokens);
                if state.tokens >= want {
                    state.tokens -= want;
                    return want;
                }

                let deficit = want - state.tokens;
                let wait_us = (deficit as f64 / state.rate as f64 * 1_000_000.0) as u64;
                Duration::from_micros(wait_us.max(1_000))
            };

            // Sleep until the deficit refills, but wake early on rate
            // changes or cancellation.
            let notified = self.notify.notified();
            tokio::select! {
                _ = notified => {}
                _ = tokio::time::sleep(wait) => {}
            }
        }
    }

    /// Change the rate. 0 switches to unlimited. Tokens already in the
    /// bucket are refilled under the old rate first, then clamped to the
    /// new capacity. All waiters are woken to re-evaluate.
    pub fn set_rate(&self, rate_bytes_per_sec: i64) {
        let rate = rate_bytes_per_sec.max(0);
        {
            let mut state = self.state.lock();
            state.refill();
            state.rate = rate;
            state.max_tokens = rate;
            if state.max_tokens > 0 && state.tokens > state.max_tokens {
                state.tokens = state.max_tokens;
            }
        }
        self.notify.notify_waiters();
    }

    /// Current rate (bytes/sec, 0 = unlimited)
    pub fn rate(&self) -> i64 {
        self.state.lock().rate
    }

    /// Wake every waiter with a zero grant; subsequent acquires return 0.
    /// Used at manager shutdown.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Relaxed);
        self.notify.notify_waiters();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Relaxed)
    }
}
