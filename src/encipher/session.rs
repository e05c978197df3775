//! ECDH session-key cache: once a client completes `/api/handshake`, its
//! derived shared secret is kept here, keyed by `MD5(pub)`, so every later
//! request only needs the `pub` header to look the secret back up.
//!
//! Grounded on `api/gateway/ratelimit.rs`'s TTL-bucket pattern (a `DashMap`
//! entry with an expiry `Instant`, swept lazily on lookup) applied to
//! session state instead of request counts.

use std::time::{Duration, Instant};

use dashmap::DashMap;
use zeroize::Zeroizing;

/// One established session: the shared secret and when it expires.
struct SessionEntry {
    shared_secret: Zeroizing<[u8; 32]>,
    expires_at: Instant,
}

/// MD5 is used here purely as a cache-key digest over a public value (the
/// client's X25519 public key) -- never as a security primitive.
pub fn cache_key(client_pub: &[u8]) -> String {
    format!("{:x}", md5::compute(client_pub))
}

pub struct SessionCache {
    entries: DashMap<String, SessionEntry>,
    ttl: Duration,
}

impl SessionCache {
    pub fn new(ttl: Duration) -> Self {
        SessionCache {
            entries: DashMap::new(),
            ttl,
        }
    }

    pub fn insert(&self, key: impl Into<String>, shared_secret: [u8; 32]) {
        self.entries.insert(
            key.into(),
            SessionEntry {
                shared_secret: Zeroizing::new(shared_secret),
                expires_at: Instant::now() + self.ttl,
            },
        );
    }

    /// Returns the shared secret for `key`, or `None` if absent or expired.
    /// A missing entry is the opaque failure case: callers turn this into
    /// an empty response, never an error that leaks state.
    pub fn get(&self, key: &str) -> Option<[u8; 32]> {
        let entry = self.entries.get(key)?;
        if entry.expires_at < Instant::now() {
            drop(entry);
            self.entries.remove(key);
            return None;
        }
        Some(*entry.shared_secret)
    }

    pub fn sweep(&self) -> usize {
        let now = Instant::now();
        let before = self.entries.len();
        self.entries.retain(|_, v| v.expires_at >= now);
        before - self.entries.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stores_and_retrieves() {
        let cache = SessionCache::new(Duration::from_secs(60));
        let key = cache_key(b"client-pub-bytes");
        cache.insert(key.clone(), [7u8; 32]);
        assert_eq!(cache.get(&key), Some([7u8; 32]));
    }

    #[test]
    fn missing_key_is_none() {
        let cache = SessionCache::new(Duration::from_secs(60));
        assert_eq!(cache.get("nonexistent"), None);
    }

    #[test]
    fn expired_entry_is_swept_on_read() {
        let cache = SessionCache::new(Duration::from_millis(0));
        let key = cache_key(b"pub");
        cache.insert(key.clone(), [1u8; 32]);
        std::thread::sleep(Duration::from_millis(5));
        assert_eq!(cache.get(&key), None);
    }
}
