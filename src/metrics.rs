//! Lock-free request/connection counters plus a periodic logger (ambient
//! addition). Grounded on `websocket/metrics.rs`'s atomic counter style,
//! generalized to the gateway's own set of observables.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

pub struct GatewayMetrics {
    pub requests_total: AtomicU64,
    pub requests_failed: AtomicU64,
    pub rate_limited_total: AtomicU64,
    pub replay_rejected_total: AtomicU64,
    pub active_connections: AtomicU64,
    /// Cumulative count of connections ever registered, never decremented;
    /// `active_connections` is the live gauge, this is the counter.
    pub connections_total: AtomicU64,
    /// High-water mark of `active_connections`, updated on every open.
    pub connections_peak: AtomicU64,
    pub messages_total: AtomicU64,
    pub messages_success: AtomicU64,
    pub messages_error: AtomicU64,
    pub heartbeats_total: AtomicU64,
    pub heartbeats_success: AtomicU64,
    pub heartbeats_failed: AtomicU64,
    pub bytes_in_total: AtomicU64,
    pub bytes_out_total: AtomicU64,
    started_at: Instant,
}

impl Default for GatewayMetrics {
    fn default() -> Self {
        GatewayMetrics {
            requests_total: AtomicU64::new(0),
            requests_failed: AtomicU64::new(0),
            rate_limited_total: AtomicU64::new(0),
            replay_rejected_total: AtomicU64::new(0),
            active_connections: AtomicU64::new(0),
            connections_total: AtomicU64::new(0),
            connections_peak: AtomicU64::new(0),
            messages_total: AtomicU64::new(0),
            messages_success: AtomicU64::new(0),
            messages_error: AtomicU64::new(0),
            heartbeats_total: AtomicU64::new(0),
            heartbeats_success: AtomicU64::new(0),
            heartbeats_failed: AtomicU64::new(0),
            bytes_in_total: AtomicU64::new(0),
            bytes_out_total: AtomicU64::new(0),
            started_at: Instant::now(),
        }
    }
}

impl GatewayMetrics {
    pub fn record_request(&self, ok: bool, bytes_in: usize, bytes_out: usize) {
        self.requests_total.fetch_add(1, Ordering::Relaxed);
        if !ok {
            self.requests_failed.fetch_add(1, Ordering::Relaxed);
        }
        self.bytes_in_total.fetch_add(bytes_in as u64, Ordering::Relaxed);
        self.bytes_out_total.fetch_add(bytes_out as u64, Ordering::Relaxed);
    }

    pub fn record_rate_limited(&self) {
        self.rate_limited_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_replay_rejected(&self) {
        self.replay_rejected_total.fetch_add(1, Ordering::Relaxed);
    }

    /// A single inbound WS frame (a dispatched message, not a heartbeat)
    /// was processed, successfully or not.
    pub fn record_message(&self, ok: bool) {
        self.messages_total.fetch_add(1, Ordering::Relaxed);
        if ok {
            self.messages_success.fetch_add(1, Ordering::Relaxed);
        } else {
            self.messages_error.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_heartbeat(&self, ok: bool) {
        self.heartbeats_total.fetch_add(1, Ordering::Relaxed);
        if ok {
            self.heartbeats_success.fetch_add(1, Ordering::Relaxed);
        } else {
            self.heartbeats_failed.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn connection_opened(&self) {
        self.connections_total.fetch_add(1, Ordering::Relaxed);
        let now_active = self.active_connections.fetch_add(1, Ordering::Relaxed) + 1;
        self.connections_peak.fetch_max(now_active, Ordering::Relaxed);
    }

    pub fn connection_closed(&self) {
        self.active_connections.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn uptime(&self) -> Duration {
        self.started_at.elapsed()
    }

    fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            requests_total: self.requests_total.load(Ordering::Relaxed),
            requests_failed: self.requests_failed.load(Ordering::Relaxed),
            rate_limited_total: self.rate_limited_total.load(Ordering::Relaxed),
            replay_rejected_total: self.replay_rejected_total.load(Ordering::Relaxed),
            active_connections: self.active_connections.load(Ordering::Relaxed),
            connections_total: self.connections_total.load(Ordering::Relaxed),
            connections_peak: self.connections_peak.load(Ordering::Relaxed),
            messages_total: self.messages_total.load(Ordering::Relaxed),
            messages_success: self.messages_success.load(Ordering::Relaxed),
            messages_error: self.messages_error.load(Ordering::Relaxed),
            heartbeats_total: self.heartbeats_total.load(Ordering::Relaxed),
            heartbeats_success: self.heartbeats_success.load(Ordering::Relaxed),
            heartbeats_failed: self.heartbeats_failed.load(Ordering::Relaxed),
            bytes_in_total: self.bytes_in_total.load(Ordering::Relaxed),
            bytes_out_total: self.bytes_out_total.load(Ordering::Relaxed),
            uptime_secs: self.uptime().as_secs(),
        }
    }
}

#[derive(Debug)]
struct MetricsSnapshot {
    requests_total: u64,
    requests_failed: u64,
    rate_limited_total: u64,
    replay_rejected_total: u64,
    active_connections: u64,
    connections_total: u64,
    connections_peak: u64,
    messages_total: u64,
    messages_success: u64,
    messages_error: u64,
    heartbeats_total: u64,
    heartbeats_success: u64,
    heartbeats_failed: u64,
    bytes_in_total: u64,
    bytes_out_total: u64,
    uptime_secs: u64,
}

/// Spawns a background task that logs a metrics snapshot on an interval.
/// Returns a handle the caller can abort on shutdown.
pub fn spawn_periodic_logger(metrics: Arc<GatewayMetrics>, interval: Duration) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            let snap = metrics.snapshot();
            tracing::info!(
                requests_total = snap.requests_total,
                requests_failed = snap.requests_failed,
                rate_limited_total = snap.rate_limited_total,
                replay_rejected_total = snap.replay_rejected_total,
                active_connections = snap.active_connections,
                connections_total = snap.connections_total,
                connections_peak = snap.connections_peak,
                messages_total = snap.messages_total,
                messages_success = snap.messages_success,
                messages_error = snap.messages_error,
                heartbeats_total = snap.heartbeats_total,
                heartbeats_success = snap.heartbeats_success,
                heartbeats_failed = snap.heartbeats_failed,
                bytes_in_total = snap.bytes_in_total,
                bytes_out_total = snap.bytes_out_total,
                uptime_secs = snap.uptime_secs,
                "metrics snapshot"
            );
        }
    })
}
