//! # Rate Limiter
//! Sliding-window admission control per logical key (one key per target
//! domain, or a single global key). Over any window of `window` seconds at
//! most `capacity` acquisitions succeed per key; excess callers sleep until
//! the window frees up, with a small random pad so refills don't align.

use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use rand::Rng;
use tokio::sync::Mutex;
use tokio::time::{sleep, Instant};

#[derive(Debug)]
pub struct RateLimiter {
    capacity: usize,
    window: Duration,
    buckets: Mutex<HashMap<String, VecDeque<Instant>>>,
}

impl RateLimiter {
    pub fn new(capacity: usize, window: Duration) -> Self {
        Self {
            capacity: capacity.max(1),
            window,
            buckets: Mutex::new(HashMap::new()),
        }
    }

    /// Blocks the calling task until a slot for `key` is admitted.
    pub async fn acquire(&self, key: &str) {
        loop {
            let wait = {
                let mut buckets = self.buckets.lock().await;
                let q = buckets.entry(key.to_string()).or_default();
                let now = Instant::now();
                while let Some(front) = q.front() {
                    if now.duration_since(*front) >= self.window {
                        q.pop_front();
                    } else {
                        break;
                    }
                }
                if q.len() < self.capacity {
                    q.push_back(now);
                    None
                } else if let Some(oldest) = q.front().copied() {
                    let remaining = self
                        .window
                        .saturating_sub(now.duration_since(oldest));
                    let pad =
                        Duration::from_millis(rand::rng().random_range(500..2500));
                    Some(remaining + pad)
                } else {
                    q.push_back(now);
                    None
                }
            };
            match wait {
                None => return,
                Some(d) => {
                    tracing::debug!(key, wait_secs = d.as_secs_f64(), "rate limit reached");
                    sleep(d).await;
                }
            }
        }
    }

    /// Admissions currently counted inside the window for `key`.
    pub async fn in_flight(&self, key: &str) -> usize {
        let buckets = self.buckets.lock().await;
        buckets.get(key).map(|q| q.len()).unwrap_or(0)
    }
}
