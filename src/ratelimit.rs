//! Rate limiting (C1).
//!
//! Grounded on `api/gateway/ratelimit.rs`'s `TokenBucket`/`SlidingWindow`
//! pair and its distributed-backend fallback, generalized to a trait-object
//! `RateLimiter` so gateway-wide, per-user, and per-route limiters share one
//! interface. The trait is async so a distributed backend can genuinely
//! await its store instead of always degrading to the local fallback.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::cache::{KvStore, LocalKvStore};

/// Decision returned by a limiter for a single admission check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Allowed,
    Limited,
}

#[async_trait]
pub trait RateLimiter: Send + Sync {
    async fn check(&self, key: &str) -> Admission;
}

/// Token bucket keyed by an arbitrary string (subject id, route path, or a
/// fixed gateway-wide key). One bucket per key, created lazily.
pub struct LocalTokenBucket {
    capacity: u32,
    refill_per_sec: f64,
    buckets: dashmap::DashMap<String, BucketState>,
}

struct BucketState {
    tokens: f64,
    last_refill: Instant,
}

impl LocalTokenBucket {
    pub fn new(capacity: u32, refill_per_sec: f64) -> Self {
        LocalTokenBucket {
            capacity,
            refill_per_sec,
            buckets: dashmap::DashMap::new(),
        }
    }

    fn check_sync(&self, key: &str) -> Admission {
        let now = Instant::now();
        let mut entry = self.buckets.entry(key.to_string()).or_insert_with(|| BucketState {
            tokens: self.capacity as f64,
            last_refill: now,
        });
        let elapsed = now.duration_since(entry.last_refill).as_secs_f64();
        entry.tokens = (entry.tokens + elapsed * self.refill_per_sec).min(self.capacity as f64);
        entry.last_refill = now;
        if entry.tokens >= 1.0 {
            entry.tokens -= 1.0;
            Admission::Allowed
        } else {
            Admission::Limited
        }
    }
}

#[async_trait]
impl RateLimiter for LocalTokenBucket {
    async fn check(&self, key: &str) -> Admission {
        self.check_sync(key)
    }
}

/// Sliding-window counter, an alternative strategy to the token bucket for
/// routes that need hard per-window caps rather than smoothed throughput.
pub struct LocalSlidingWindow {
    limit: u32,
    window: Duration,
    windows: Mutex<std::collections::HashMap<String, (Instant, u32)>>,
}

impl LocalSlidingWindow {
    pub fn new(limit: u32, window: Duration) -> Self {
        LocalSlidingWindow {
            limit,
            window,
            windows: Mutex::new(std::collections::HashMap::new()),
        }
    }

    fn check_sync(&self, key: &str) -> Admission {
        let now = Instant::now();
        let mut windows = self.windows.lock();
        let entry = windows.entry(key.to_string()).or_insert((now, 0));
        if now.duration_since(entry.0) > self.window {
            *entry = (now, 0);
        }
        if entry.1 < self.limit {
            entry.1 += 1;
            Admission::Allowed
        } else {
            Admission::Limited
        }
    }
}

#[async_trait]
impl RateLimiter for LocalSlidingWindow {
    async fn check(&self, key: &str) -> Admission {
        self.check_sync(key)
    }
}

/// Delegates to a `KvStore` (e.g. Redis-backed) when one is configured;
/// degrades silently to an in-process `LocalTokenBucket` otherwise, logging
/// the degrade once so operators notice limiter state isn't actually shared
/// across instances.
pub struct DistributedTokenBucket {
    store: Option<Arc<dyn KvStore>>,
    fallback: LocalTokenBucket,
    capacity: u32,
    window_secs: u64,
    warned: std::sync::atomic::AtomicBool,
}

impl DistributedTokenBucket {
    pub fn new(store: Option<Arc<dyn KvStore>>, capacity: u32, window_secs: u64) -> Self {
        DistributedTokenBucket {
            store,
            fallback: LocalTokenBucket::new(capacity, capacity as f64 / window_secs.max(1) as f64),
            capacity,
            window_secs,
            warned: std::sync::atomic::AtomicBool::new(false),
        }
    }

    fn note_degrade(&self) {
        if !self.warned.swap(true, std::sync::atomic::Ordering::SeqCst) {
            tracing::warn!("distributed rate limiter unavailable, degrading to local token bucket");
        }
    }
}

#[async_trait]
impl RateLimiter for DistributedTokenBucket {
    async fn check(&self, key: &str) -> Admission {
        if let Some(store) = &self.store {
            match store.incr(key, self.window_secs).await {
                Ok(count) if count <= self.capacity as u64 => return Admission::Allowed,
                Ok(_) => return Admission::Limited,
                Err(_) => self.note_degrade(),
            }
        } else {
            self.note_degrade();
        }
        self.fallback.check_sync(key)
    }
}

impl Default for DistributedTokenBucket {
    fn default() -> Self {
        DistributedTokenBucket::new(Some(Arc::new(LocalKvStore::default())), 100, 60)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn token_bucket_exhausts_then_recovers_conceptually() {
        let bucket = LocalTokenBucket::new(2, 1.0);
        assert_eq!(bucket.check("k").await, Admission::Allowed);
        assert_eq!(bucket.check("k").await, Admission::Allowed);
        assert_eq!(bucket.check("k").await, Admission::Limited);
    }

    #[tokio::test]
    async fn sliding_window_caps_within_window() {
        let window = LocalSlidingWindow::new(1, Duration::from_secs(60));
        assert_eq!(window.check("k").await, Admission::Allowed);
        assert_eq!(window.check("k").await, Admission::Limited);
    }

    #[tokio::test]
    async fn distributed_falls_back_without_store() {
        let bucket = DistributedTokenBucket::new(None, 1, 60);
        assert_eq!(bucket.check("k").await, Admission::Allowed);
        assert_eq!(bucket.check("k").await, Admission::Limited);
    }

    #[tokio::test]
    async fn distributed_consults_the_real_store_when_configured() {
        let store = Arc::new(LocalKvStore::default());
        let bucket = DistributedTokenBucket::new(Some(store), 2, 60);
        assert_eq!(bucket.check("k").await, Admission::Allowed);
        assert_eq!(bucket.check("k").await, Admission::Allowed);
        assert_eq!(bucket.check("k").await, Admission::Limited);
    }
}
