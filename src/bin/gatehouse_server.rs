//! Gateway entry point: wires the router, filter chain, connection
//! registry, and both transports (C6/C7) into one listening process.
//!
//! Grounded on `src/main.rs`'s startup sequence (load config, init
//! logging, print a banner, spawn subsystems), narrowed to what this
//! crate's `GatewayConfig` actually needs.

use std::sync::Arc;
use std::time::Duration;

use gatehouse::config::GatewayConfig;
use gatehouse::context::ContextPool;
use gatehouse::error::GatewayError;
use gatehouse::filter::builtin::{
    GatewayRateLimiter, ParameterFilter, PostHandleFilter, RenderHandleFilter, ReplayFilter, RoleFilter,
    SessionFilter, UserRateLimiter,
};
use gatehouse::filter::FilterChain;
use gatehouse::http::{self, AppState};
use gatehouse::login::LoginHandshake;
use gatehouse::metrics::{self, GatewayMetrics};
use gatehouse::ratelimit::LocalTokenBucket;
use gatehouse::registry::{self, ConnectionRegistry};
use gatehouse::router::{BusinessHandler, Router as GatewayRouter, RouterConfig};
use gatehouse::subject::{Subject, TokenAuthority};
use gatehouse::ws::{self, WsState};
use p256::ecdsa::{SigningKey, VerifyingKey};
use sha2::{Digest, Sha256};

#[tokio::main]
async fn main() -> std::io::Result<()> {
    let config_path = std::env::var("GATEHOUSE_CONFIG").unwrap_or_else(|_| "gatehouse.toml".to_string());
    let config = GatewayConfig::load(&config_path).unwrap_or_else(|e| {
        eprintln!("no usable config at {config_path} ({e}), using defaults");
        GatewayConfig::default()
    });

    tracing_subscriber::fmt()
        .with_env_filter(config.log_filter.clone())
        .with_target(false)
        .init();

    tracing::info!(version = env!("CARGO_PKG_VERSION"), "starting gatehouse");

    let authority = Arc::new(TokenAuthority::new(signing_key().as_slice(), config.jwt_issuer.clone()));
    let metrics = Arc::new(GatewayMetrics::default());
    let standalone_sign_key = standalone_sign_key();
    let login = Arc::new(LoginHandshake::generate());
    let ecdsa_signing_key = ecdsa_signing_key();
    let trusted_ecdsa_keys = parse_trusted_ecdsa_keys(&config.trusted_ecdsa_keys);

    let mut router = GatewayRouter::new();
    register_demo_routes(&mut router, &authority);

    let gateway_limiter = Arc::new(LocalTokenBucket::new(
        config.rate_limit.gateway_capacity,
        config.rate_limit.gateway_refill_per_sec,
    ));
    let route_limiter = Arc::new(LocalTokenBucket::new(
        config.rate_limit.user_capacity,
        config.rate_limit.user_capacity as f64 / config.rate_limit.user_window_secs.max(1) as f64,
    ));
    let subject_limiter = Arc::new(LocalTokenBucket::new(
        config.rate_limit.user_capacity,
        config.rate_limit.user_capacity as f64 / config.rate_limit.user_window_secs.max(1) as f64,
    ));
    let ws_upgrade_limiter: Arc<dyn gatehouse::ratelimit::RateLimiter> = Arc::new(LocalTokenBucket::new(
        config.rate_limit.ws_upgrade_capacity,
        config.rate_limit.ws_upgrade_refill_per_sec,
    ));

    let mut filters: Vec<Arc<dyn gatehouse::filter::Filter>> = vec![
        Arc::new(GatewayRateLimiter::new(gateway_limiter, metrics.clone(), -1000)),
        Arc::new(ParameterFilter::new(-900)),
        Arc::new(SessionFilter::new(authority.clone(), -800)),
        Arc::new(UserRateLimiter::new(route_limiter, subject_limiter, metrics.clone(), -700)),
        Arc::new(RoleFilter::new(-500)),
        Arc::new(PostHandleFilter::new(900)),
        Arc::new(RenderHandleFilter::new(standalone_sign_key.clone(), ecdsa_signing_key.clone())),
    ];
    if config.enable_replay_filter {
        let store = Arc::new(gatehouse::cache::LocalKvStore::default());
        filters.push(Arc::new(ReplayFilter::new(store, 300, metrics.clone(), -600)));
    }
    let chain = FilterChain::build(filters);

    let registry = Arc::new(ConnectionRegistry::new(
        config.connection_registry.uniqueness,
        config.connection_registry.max_connections,
        Duration::from_secs(config.connection_registry.idle_ttl_secs),
    ));
    registry::spawn_sweeper(
        registry.clone(),
        Duration::from_secs(config.connection_registry.sweep_interval_secs),
    );
    metrics::spawn_periodic_logger(metrics.clone(), Duration::from_secs(60));

    let http_state = Arc::new(AppState {
        config: config.clone(),
        router,
        chain,
        pool: ContextPool::new(1024),
        metrics: metrics.clone(),
        authority: authority.clone(),
        standalone_sign_key: standalone_sign_key.clone(),
        login: login.clone(),
        trusted_ecdsa_keys: trusted_ecdsa_keys.clone(),
    });

    let mut ws_router = GatewayRouter::new();
    register_demo_routes(&mut ws_router, &authority);
    let ws_filters: Vec<Arc<dyn gatehouse::filter::Filter>> = vec![
        Arc::new(RoleFilter::new(-500)),
        Arc::new(PostHandleFilter::new(900)),
        Arc::new(RenderHandleFilter::new(standalone_sign_key.clone(), ecdsa_signing_key)),
    ];
    // Kept for the shutdown path below: `WsState` takes ownership of the
    // registry, so a second handle is cloned off before that move.
    let registry_for_shutdown = registry.clone();
    let ws_state = Arc::new(WsState {
        router: ws_router,
        chain: FilterChain::build(ws_filters),
        pool: ContextPool::new(1024),
        registry,
        metrics,
        authority,
        standalone_sign_key,
        login,
        trusted_ecdsa_keys,
        upgrade_limiter: ws_upgrade_limiter,
    });

    let http_app = http::build(http_state);
    let ws_app = axum::Router::new()
        .route("/ws", axum::routing::get(ws::upgrade))
        .with_state(ws_state);
    let app = http_app.merge(ws_app);

    let addr: std::net::SocketAddr = config
        .listen_addr
        .parse()
        .unwrap_or_else(|_| ([0, 0, 0, 0], 8080).into());
    let result = http::serve(addr, app).await;
    let evicted = registry_for_shutdown.cleanup_all();
    tracing::info!(evicted, "connection registry drained on shutdown");
    result
}

/// Demo route table; a real deployment calls `GatewayRouter::add` with its
/// own business handlers before starting the listener -- routes are
/// immutable once the server is serving traffic.
fn register_demo_routes(router: &mut GatewayRouter, authority: &Arc<TokenAuthority>) {
    router.add("/healthz", RouterConfig { guest: true, ..Default::default() }, demo_handler());
    router.add("/api/echo", RouterConfig::default(), demo_handler());
    router.add(
        "/api/login",
        RouterConfig { login: true, ..Default::default() },
        login_handler(authority.clone()),
    );
}

fn demo_handler() -> BusinessHandler {
    Arc::new(|ctx| Ok(ctx.raw_body.clone()))
}

/// Issues a session token for the caller named in the request body. A real
/// deployment would check a password or SSO assertion here; this demo
/// route exists to exercise the plan=2 handshake end to end, not to model
/// a credential check.
fn login_handler(authority: Arc<TokenAuthority>) -> BusinessHandler {
    #[derive(serde::Deserialize)]
    struct LoginRequest {
        username: String,
    }

    Arc::new(move |ctx| {
        let req: LoginRequest = serde_json::from_slice(&ctx.raw_body)
            .map_err(|e| GatewayError::Protocol(format!("invalid login body: {e}")))?;
        let subject = Subject(req.username);
        let (token, secret) = authority.issue(&subject, 3600)?;
        let body = serde_json::json!({
            "token": token,
            "secret": hex::encode(secret.as_bytes()),
        })
        .to_string();
        Ok(body.into_bytes())
    })
}

fn signing_key() -> Vec<u8> {
    std::env::var("GATEHOUSE_JWT_KEY")
        .map(String::into_bytes)
        .unwrap_or_else(|_| b"gatehouse-dev-signing-key-change-me".to_vec())
}

fn standalone_sign_key() -> Vec<u8> {
    std::env::var("GATEHOUSE_STANDALONE_KEY")
        .map(String::into_bytes)
        .unwrap_or_else(|_| b"gatehouse-dev-standalone-key-change-me".to_vec())
}

/// Signs the envelope's `e` provenance field on `Login` responses. Reads a
/// hex-encoded scalar from the environment when set; otherwise falls back
/// to a fixed dev scalar derived from a label via SHA-256 (a non-secret
/// dev key, same spirit as `signing_key`/`standalone_sign_key` above).
fn ecdsa_signing_key() -> SigningKey {
    let scalar = std::env::var("GATEHOUSE_ECDSA_KEY")
        .ok()
        .and_then(|hex_str| hex::decode(hex_str).ok())
        .unwrap_or_else(dev_ecdsa_scalar);
    SigningKey::from_slice(&scalar).unwrap_or_else(|_| {
        SigningKey::from_slice(&dev_ecdsa_scalar()).expect("dev ecdsa scalar is a valid p256 key")
    })
}

fn dev_ecdsa_scalar() -> Vec<u8> {
    Sha256::digest(b"gatehouse-dev-ecdsa-key-change-me").to_vec()
}

/// Parses the configured trusted ECDSA keys (hex-encoded SEC1 points) into
/// verifying keys, skipping and logging any entry that fails to parse
/// rather than refusing to start over one bad config line.
fn parse_trusted_ecdsa_keys(entries: &[String]) -> Vec<VerifyingKey> {
    entries
        .iter()
        .filter_map(|hex_str| match hex::decode(hex_str) {
            Ok(bytes) => match VerifyingKey::from_sec1_bytes(&bytes) {
                Ok(key) => Some(key),
                Err(e) => {
                    tracing::warn!(error = %e, "skipping invalid trusted_ecdsa_keys entry");
                    None
                }
            },
            Err(e) => {
                tracing::warn!(error = %e, "skipping non-hex trusted_ecdsa_keys entry");
                None
            }
        })
        .collect()
}
