//! TOML-loaded configuration for both binaries (ambient addition).
//!
//! Grounded on the teacher's config pattern in `api/rest/server.rs`
//! (`ServerConfig` with `Default` plus environment overrides), generalized
//! to `serde`-deserialized structs loaded from a `gatehouse.toml`.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{GatewayError, Result};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    pub listen_addr: String,
    pub max_body_bytes: usize,
    pub request_timeout_secs: u64,
    pub connection_registry: ConnectionRegistryConfig,
    pub rate_limit: RateLimitConfig,
    pub encipher_url: Option<String>,
    pub jwt_issuer: String,
    pub log_filter: String,
    /// Enables the nonce-based replay filter. Off by default -- it needs a
    /// shared `KvStore` to mean anything across more than one instance, and
    /// most deployments don't run one, so this stays a config toggle rather
    /// than always-on middleware.
    pub enable_replay_filter: bool,
    /// Hex-encoded SEC1 public keys accepted as ECDSA provenance signers for
    /// the envelope's `e` field (§4.2 step 5). Loaded into
    /// `Vec<VerifyingKey>` once at startup; a request whose `e` matches none
    /// of these is rejected.
    pub trusted_ecdsa_keys: Vec<String>,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        GatewayConfig {
            listen_addr: "0.0.0.0:8080".to_string(),
            max_body_bytes: 1 << 20,
            request_timeout_secs: 30,
            connection_registry: ConnectionRegistryConfig::default(),
            rate_limit: RateLimitConfig::default(),
            encipher_url: None,
            jwt_issuer: "gatehouse".to_string(),
            log_filter: "info".to_string(),
            enable_replay_filter: false,
            trusted_ecdsa_keys: Vec::new(),
        }
    }
}

impl GatewayConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        toml::from_str(&raw).map_err(|e| GatewayError::Internal(format!("invalid config: {e}")))
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RegistryUniqueness {
    SubjectUnique,
    SubjectDeviceUnique,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionRegistryConfig {
    pub max_connections: usize,
    pub idle_ttl_secs: u64,
    pub sweep_interval_secs: u64,
    pub uniqueness: RegistryUniqueness,
}

impl Default for ConnectionRegistryConfig {
    fn default() -> Self {
        ConnectionRegistryConfig {
            max_connections: 100_000,
            idle_ttl_secs: 300,
            sweep_interval_secs: 30,
            uniqueness: RegistryUniqueness::SubjectDeviceUnique,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    pub gateway_capacity: u32,
    pub gateway_refill_per_sec: f64,
    pub user_capacity: u32,
    pub user_window_secs: u64,
    pub distributed_store_url: Option<String>,
    /// Token bucket applied to WebSocket upgrade requests before the
    /// handshake completes (§4.7 "Upgrade"), distinct from the per-route
    /// limiters applied to already-established connections.
    pub ws_upgrade_capacity: u32,
    pub ws_upgrade_refill_per_sec: f64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        RateLimitConfig {
            gateway_capacity: 10_000,
            gateway_refill_per_sec: 2_000.0,
            user_capacity: 60,
            user_window_secs: 60,
            distributed_store_url: None,
            ws_upgrade_capacity: 200,
            ws_upgrade_refill_per_sec: 50.0,
        }
    }
}

/// Configuration for the standalone key-custody service (C9).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EncipherConfig {
    pub listen_addr: String,
    pub keystore_path: String,
    pub session_ttl_secs: u64,
    pub log_filter: String,
}

impl Default for EncipherConfig {
    fn default() -> Self {
        EncipherConfig {
            listen_addr: "0.0.0.0:8443".to_string(),
            keystore_path: "./keystore.enc".to_string(),
            session_ttl_secs: 1800,
            log_filter: "info".to_string(),
        }
    }
}

impl EncipherConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        toml::from_str(&raw).map_err(|e| GatewayError::Internal(format!("invalid config: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let cfg = GatewayConfig::default();
        assert_eq!(cfg.listen_addr, "0.0.0.0:8080");
        assert!(cfg.max_body_bytes > 0);
    }

    #[test]
    fn parses_partial_toml_with_defaults() {
        let toml_str = r#"
            listen_addr = "127.0.0.1:9090"
        "#;
        let cfg: GatewayConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(cfg.listen_addr, "127.0.0.1:9090");
        assert_eq!(cfg.request_timeout_secs, 30);
    }
}
