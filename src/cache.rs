//! Generic external key/value collaborator (C1/C5 dependency).
//!
//! The rate limiter's distributed mode and the replay filter's nonce cache
//! both need a shared store outside process memory. Grounded on
//! `api/gateway/ratelimit.rs`'s `DistributedBackend` trait, which keeps the
//! same narrow surface: get/set-if-absent with a TTL, nothing more.

use async_trait::async_trait;

/// Minimal interface a distributed cache (e.g. Redis) must satisfy to back
/// the rate limiter or replay filter. Not implemented against a concrete
/// store here; callers supply their own `KvStore` when they have one
/// wired up, and fall back to the in-process stand-ins otherwise.
#[async_trait]
pub trait KvStore: Send + Sync {
    /// Atomically increments `key` and returns the new count, setting `ttl`
    /// on first creation only.
    async fn incr(&self, key: &str, ttl_secs: u64) -> std::io::Result<u64>;

    /// Sets `key` if absent, with the given TTL; returns `true` if this call
    /// created the key (used by the replay filter: first-seen nonce wins).
    async fn set_if_absent(&self, key: &str, ttl_secs: u64) -> std::io::Result<bool>;
}

/// In-process stand-in used when no distributed store is configured. Not
/// suitable across multiple gateway instances; the rate limiter and replay
/// filter fall back to this silently and log once per process.
pub struct LocalKvStore {
    counters: dashmap::DashMap<String, (u64, std::time::Instant)>,
}

impl Default for LocalKvStore {
    fn default() -> Self {
        LocalKvStore {
            counters: dashmap::DashMap::new(),
        }
    }
}

#[async_trait]
impl KvStore for LocalKvStore {
    async fn incr(&self, key: &str, ttl_secs: u64) -> std::io::Result<u64> {
        let mut entry = self
            .counters
            .entry(key.to_string())
            .or_insert((0, std::time::Instant::now() + std::time::Duration::from_secs(ttl_secs)));
        if std::time::Instant::now() > entry.1 {
            entry.0 = 0;
            entry.1 = std::time::Instant::now() + std::time::Duration::from_secs(ttl_secs);
        }
        entry.0 += 1;
        Ok(entry.0)
    }

    async fn set_if_absent(&self, key: &str, ttl_secs: u64) -> std::io::Result<bool> {
        // `entry` holds the shard lock for the whole closure, so this is an
        // atomic check-and-insert -- a plain `contains_key` then `insert`
        // would race exactly the way §9 warns a distributed GET+SET does.
        let mut created = false;
        self.counters.entry(key.to_string()).or_insert_with(|| {
            created = true;
            (1, std::time::Instant::now() + std::time::Duration::from_secs(ttl_secs))
        });
        Ok(created)
    }
}
