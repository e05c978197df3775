//! Connection registry (C8).
//!
//! Grounded on `websocket/connection.rs`'s `ConnectionPool` (a `DashMap`
//! keyed by connection id plus a per-subject index), restructured into a
//! two-level `DashMap<Subject, DashMap<DeviceKey, ConnectionRecord>>` so
//! subject-level and subject+device-level uniqueness are both just a matter
//! of which level gets checked.

use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::config::RegistryUniqueness;
use crate::error::{GatewayError, Result};
use crate::subject::Subject;

pub type DeviceKey = String;
pub const DEFAULT_DEVICE: &str = "__default__";

/// One live connection's dispatch handle and bookkeeping. The actual socket
/// read/write loops live in `ws::server`; this only holds what the registry
/// needs to route messages to a connection and evict it.
pub struct ConnectionRecord {
    pub outbound: mpsc::UnboundedSender<Vec<u8>>,
    pub cancel: CancellationToken,
    pub last_seen: parking_lot::Mutex<Instant>,
}

impl ConnectionRecord {
    pub fn touch(&self) {
        *self.last_seen.lock() = Instant::now();
    }

    fn is_stale(&self, ttl: Duration) -> bool {
        self.last_seen.lock().elapsed() > ttl
    }
}

pub struct ConnectionRegistry {
    subjects: DashMap<Subject, DashMap<DeviceKey, Arc<ConnectionRecord>>>,
    uniqueness: RegistryUniqueness,
    max_connections: usize,
    idle_ttl: Duration,
    count: std::sync::atomic::AtomicUsize,
}

impl ConnectionRegistry {
    pub fn new(uniqueness: RegistryUniqueness, max_connections: usize, idle_ttl: Duration) -> Self {
        ConnectionRegistry {
            subjects: DashMap::new(),
            uniqueness,
            max_connections,
            idle_ttl,
            count: std::sync::atomic::AtomicUsize::new(0),
        }
    }

    /// Register a connection for `subject`/`device`. Under
    /// `SubjectUnique`, any existing connection for the subject (regardless
    /// of device) is evicted first; under `SubjectDeviceUnique`, only a
    /// same-device connection is evicted.
    pub fn register(&self, subject: Subject, device: DeviceKey, record: Arc<ConnectionRecord>) -> Result<()> {
        if self.count.load(std::sync::atomic::Ordering::Relaxed) >= self.max_connections {
            return Err(GatewayError::RegistryFull);
        }

        let devices = self.subjects.entry(subject).or_insert_with(DashMap::new);

        match self.uniqueness {
            RegistryUniqueness::SubjectUnique => {
                for existing in devices.iter() {
                    existing.value().cancel.cancel();
                }
                devices.clear();
            }
            RegistryUniqueness::SubjectDeviceUnique => {
                if let Some((_, old)) = devices.remove(&device) {
                    old.cancel.cancel();
                    self.count.fetch_sub(1, std::sync::atomic::Ordering::Relaxed);
                }
            }
        }

        devices.insert(device, record);
        self.count.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        Ok(())
    }

    /// Look up a single connection by subject and device, without sending
    /// anything to it. Used by admin/diagnostic callers that need the
    /// record itself rather than just a fan-out target.
    pub fn get(&self, subject: &Subject, device: &str) -> Option<Arc<ConnectionRecord>> {
        self.subjects.get(subject)?.get(device).map(|entry| entry.value().clone())
    }

    pub fn unregister(&self, subject: &Subject, device: &str) {
        if let Some(devices) = self.subjects.get(subject) {
            if devices.remove(device).is_some() {
                self.count.fetch_sub(1, std::sync::atomic::Ordering::Relaxed);
            }
        }
    }

    /// Send to every connection registered for `subject`.
    pub fn unicast(&self, subject: &Subject, payload: Vec<u8>) -> usize {
        let Some(devices) = self.subjects.get(subject) else {
            return 0;
        };
        let mut sent = 0;
        for entry in devices.iter() {
            if entry.value().outbound.send(payload.clone()).is_ok() {
                sent += 1;
            }
        }
        sent
    }

    /// Send to every connection in the registry.
    pub fn broadcast(&self, payload: Vec<u8>) -> usize {
        let mut sent = 0;
        for subject_entry in self.subjects.iter() {
            for device_entry in subject_entry.value().iter() {
                if device_entry.value().outbound.send(payload.clone()).is_ok() {
                    sent += 1;
                }
            }
        }
        sent
    }

    pub fn len(&self) -> usize {
        self.count.load(std::sync::atomic::Ordering::Relaxed)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop connections idle longer than the configured TTL. Intended to be
    /// driven by a periodic task alongside `spawn_sweeper`.
    pub fn sweep(&self) -> usize {
        let mut evicted = 0;
        self.subjects.retain(|_subject, devices| {
            devices.retain(|_device, record| {
                if record.is_stale(self.idle_ttl) {
                    record.cancel.cancel();
                    evicted += 1;
                    false
                } else {
                    true
                }
            });
            !devices.is_empty()
        });
        self.count.fetch_sub(evicted, std::sync::atomic::Ordering::Relaxed);
        evicted
    }

    /// Cancel and drop every connection in the registry. Intended for
    /// process shutdown: the graceful-shutdown path calls this once the
    /// listener stops accepting new connections, so no socket is left
    /// dangling with a task that will never be joined.
    pub fn cleanup_all(&self) -> usize {
        let mut evicted = 0;
        for subject_entry in self.subjects.iter() {
            for device_entry in subject_entry.value().iter() {
                device_entry.value().cancel.cancel();
                evicted += 1;
            }
        }
        self.subjects.clear();
        self.count.store(0, std::sync::atomic::Ordering::Relaxed);
        evicted
    }
}

pub fn spawn_sweeper(registry: Arc<ConnectionRegistry>, interval: Duration) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            let evicted = registry.sweep();
            if evicted > 0 {
                tracing::debug!(evicted, "connection registry sweep evicted idle connections");
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record() -> (Arc<ConnectionRecord>, mpsc::UnboundedReceiver<Vec<u8>>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Arc::new(ConnectionRecord {
                outbound: tx,
                cancel: CancellationToken::new(),
                last_seen: parking_lot::Mutex::new(Instant::now()),
            }),
            rx,
        )
    }

    #[test]
    fn subject_device_unique_evicts_same_device_only() {
        let reg = ConnectionRegistry::new(RegistryUniqueness::SubjectDeviceUnique, 10, Duration::from_secs(60));
        let subject = Subject("u1".to_string());
        let (rec_a, _rx_a) = record();
        let (rec_b, _rx_b) = record();
        reg.register(subject.clone(), "device-1".to_string(), rec_a.clone()).unwrap();
        reg.register(subject.clone(), "device-2".to_string(), rec_b).unwrap();
        assert_eq!(reg.len(), 2);
        assert!(!rec_a.cancel.is_cancelled());
    }

    #[test]
    fn subject_unique_evicts_other_devices() {
        let reg = ConnectionRegistry::new(RegistryUniqueness::SubjectUnique, 10, Duration::from_secs(60));
        let subject = Subject("u1".to_string());
        let (rec_a, _rx_a) = record();
        let (rec_b, _rx_b) = record();
        reg.register(subject.clone(), "device-1".to_string(), rec_a.clone()).unwrap();
        reg.register(subject.clone(), "device-2".to_string(), rec_b).unwrap();
        assert_eq!(reg.len(), 1);
        assert!(rec_a.cancel.is_cancelled());
    }

    #[test]
    fn registry_full_rejects() {
        let reg = ConnectionRegistry::new(RegistryUniqueness::SubjectDeviceUnique, 1, Duration::from_secs(60));
        let (rec_a, _rx_a) = record();
        let (rec_b, _rx_b) = record();
        reg.register(Subject("a".to_string()), "d".to_string(), rec_a).unwrap();
        let err = reg.register(Subject("b".to_string()), "d".to_string(), rec_b).unwrap_err();
        assert!(matches!(err, GatewayError::RegistryFull));
    }

    #[test]
    fn get_returns_the_registered_record() {
        let reg = ConnectionRegistry::new(RegistryUniqueness::SubjectDeviceUnique, 10, Duration::from_secs(60));
        let subject = Subject("u1".to_string());
        let (rec_a, _rx_a) = record();
        reg.register(subject.clone(), "device-1".to_string(), rec_a).unwrap();
        assert!(reg.get(&subject, "device-1").is_some());
        assert!(reg.get(&subject, "device-2").is_none());
        assert!(reg.get(&Subject("nobody".to_string()), "device-1").is_none());
    }

    #[test]
    fn cleanup_all_cancels_and_empties_the_registry() {
        let reg = ConnectionRegistry::new(RegistryUniqueness::SubjectDeviceUnique, 10, Duration::from_secs(60));
        let (rec_a, _rx_a) = record();
        let (rec_b, _rx_b) = record();
        reg.register(Subject("a".to_string()), "d".to_string(), rec_a.clone()).unwrap();
        reg.register(Subject("b".to_string()), "d".to_string(), rec_b.clone()).unwrap();

        let evicted = reg.cleanup_all();
        assert_eq!(evicted, 2);
        assert!(rec_a.cancel.is_cancelled());
        assert!(rec_b.cancel.is_cancelled());
        assert!(reg.is_empty());
    }

    #[test]
    fn sweep_evicts_stale_connections() {
        let reg = ConnectionRegistry::new(RegistryUniqueness::SubjectDeviceUnique, 10, Duration::from_millis(0));
        let (rec_a, _rx_a) = record();
        reg.register(Subject("a".to_string()), "d".to_string(), rec_a.clone()).unwrap();
        std::thread::sleep(Duration::from_millis(5));
        let evicted = reg.sweep();
        assert_eq!(evicted, 1);
        assert_eq!(reg.len(), 0);
        assert!(rec_a.cancel.is_cancelled());
    }
}
