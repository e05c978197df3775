//! Encipher entry point: the standalone key-custody service (C9, §4.9).
//!
//! Deliberately separate from `gatehouse-server` -- this process is the
//! only one that ever loads [`EncipherKeystore`], and a deployment is
//! expected to run it on its own host/namespace so a compromised gateway
//! process never has direct access to the long-term keys.

use std::sync::Arc;
use std::time::Duration;

use gatehouse::config::EncipherConfig;
use gatehouse::encipher::{self, EncipherKeystore, EncipherState, SessionCache};
use gatehouse::subject::TokenAuthority;

#[tokio::main]
async fn main() -> std::io::Result<()> {
    let config_path = std::env::var("GATEHOUSE_ENCIPHER_CONFIG").unwrap_or_else(|_| "encipher.toml".to_string());
    let config = EncipherConfig::load(&config_path).unwrap_or_else(|e| {
        eprintln!("no usable config at {config_path} ({e}), using defaults");
        EncipherConfig::default()
    });

    tracing_subscriber::fmt()
        .with_env_filter(config.log_filter.clone())
        .with_target(false)
        .init();

    tracing::info!(version = env!("CARGO_PKG_VERSION"), "starting gatehouse-encipher");

    let keystore = EncipherKeystore::load_or_generate(&config.keystore_path).unwrap_or_else(|e| {
        panic!("cannot load or generate keystore at {}: {e}", config.keystore_path);
    });
    let sessions = SessionCache::new(Duration::from_secs(config.session_ttl_secs));
    let token_authority = TokenAuthority::new(token_signing_key().as_slice(), "gatehouse-encipher");

    let state = Arc::new(EncipherState {
        keystore,
        sessions,
        token_authority,
        session_ttl_secs: config.session_ttl_secs,
    });
    spawn_session_sweeper(state.clone(), Duration::from_secs(60));

    let app = encipher::build_router(state);

    let addr: std::net::SocketAddr = config
        .listen_addr
        .parse()
        .unwrap_or_else(|_| ([0, 0, 0, 0], 8443).into());
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(%addr, "encipher listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
}

/// Periodically evicts expired sessions so a long-lived process doesn't
/// retain dead entries indefinitely between reads.
fn spawn_session_sweeper(state: Arc<EncipherState>, interval: Duration) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            let evicted = state.sessions.sweep();
            if evicted > 0 {
                tracing::debug!(evicted, "encipher: swept expired sessions");
            }
        }
    });
}

fn token_signing_key() -> Vec<u8> {
    std::env::var("GATEHOUSE_ENCIPHER_JWT_KEY")
        .map(String::into_bytes)
        .unwrap_or_else(|_| b"gatehouse-encipher-dev-key-change-me".to_vec())
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    tracing::info!("shutdown signal received");
}
