//! Drives a full request cycle -- envelope decode, router-policy
//! enforcement, filter chain, envelope encode -- the way `http::handle_envelope`
//! does it, without going through axum. Covers the interaction between the
//! envelope's plan/policy checks and the replay filter that a pure envelope
//! unit test or a pure filter unit test wouldn't catch on its own.
//!
//! `RenderHandleFilter` sits at `order::MIN` and absorbs whatever the rest
//! of the chain returns into `ctx.response_envelope` (§4.4), so `chain.run`
//! itself always comes back `Ok(())` here; the outcome is read off that
//! envelope's `c` field instead of an `Err`.

use std::sync::Arc;

use gatehouse::cache::LocalKvStore;
use gatehouse::context::ContextPool;
use gatehouse::envelope::{self, Plan, PlanKeys, RequestEnvelope, ResponseEnvelope};
use gatehouse::filter::builtin::{ParameterFilter, PostHandleFilter, RenderHandleFilter, ReplayFilter};
use gatehouse::filter::FilterChain;
use gatehouse::metrics::GatewayMetrics;
use gatehouse::router::RouterConfig;
use gatehouse::subject::TokenSecret;

fn keys(secret: &TokenSecret) -> PlanKeys<'_> {
    PlanKeys {
        token_secret: Some(secret),
        handshake_secret: None,
        standalone_sign_key: b"standalone-test-key",
        trusted_ecdsa_keys: &[],
        trusted_rsa_keys: &[],
        guest: false,
    }
}

async fn run_once(
    chain: &FilterChain,
    pool: &ContextPool,
    route_cfg: &RouterConfig,
    secret: &TokenSecret,
    nonce: &str,
) -> ResponseEnvelope {
    let keys = keys(secret);
    let req_env = envelope::encode_response(200, "ok", b"{\"q\":1}", Some(nonce), None, Plan::Plain, &keys, None, None).unwrap();
    let envelope = RequestEnvelope {
        d: req_env.d,
        n: req_env.n,
        t: req_env.t,
        p: req_env.p,
        s: req_env.s,
        r: None,
        e: None,
    };
    let mut ctx = pool.checkout("/query".to_string(), Vec::new());
    ctx.route_config = route_cfg.clone();
    ctx.token_secret = Some(secret.clone());
    ctx.handler = Some(Arc::new(|ctx| Ok(ctx.raw_body.clone())));

    match envelope::decode_request(&envelope, route_cfg, &keys) {
        Ok(decoded) => {
            ctx.raw_body = decoded.plaintext;
            ctx.set_attr("nonce", decoded.nonce);
            chain.run(&mut ctx).await.unwrap();
            ctx.response_envelope.clone().unwrap()
        }
        Err(e) => envelope::plain_error_envelope(e.status_code(), &e.to_string(), None),
    }
}

fn render() -> Arc<RenderHandleFilter> {
    Arc::new(RenderHandleFilter::new(b"standalone-test-key".to_vec(), test_ecdsa_key()))
}

fn test_ecdsa_key() -> p256::ecdsa::SigningKey {
    use sha2::{Digest, Sha256};
    let scalar = Sha256::digest(b"envelope-pipeline-test-ecdsa-key");
    p256::ecdsa::SigningKey::from_slice(&scalar).unwrap()
}

#[tokio::test]
async fn replayed_nonce_is_rejected_on_the_second_request() {
    let store = Arc::new(LocalKvStore::default());
    let metrics = Arc::new(GatewayMetrics::default());
    let chain = FilterChain::build(vec![
        Arc::new(ReplayFilter::new(store, 300, metrics, -600)),
        Arc::new(ParameterFilter::new(-900)),
        Arc::new(PostHandleFilter::new(900)),
        render(),
    ]);
    let pool = ContextPool::new(4);
    let secret = TokenSecret::from_raw(b"shared-session-secret".to_vec());
    let route_cfg = RouterConfig { guest: true, ..Default::default() };

    let first = run_once(&chain, &pool, &route_cfg, &secret, "first-nonce-1").await;
    assert_eq!(first.c, 200);

    let second = run_once(&chain, &pool, &route_cfg, &secret, "first-nonce-1").await;
    assert_eq!(second.c, 403);
}

#[tokio::test]
async fn distinct_nonces_both_succeed() {
    let store = Arc::new(LocalKvStore::default());
    let metrics = Arc::new(GatewayMetrics::default());
    let chain = FilterChain::build(vec![
        Arc::new(ReplayFilter::new(store, 300, metrics, -600)),
        Arc::new(PostHandleFilter::new(900)),
        render(),
    ]);
    let pool = ContextPool::new(4);
    let secret = TokenSecret::from_raw(b"shared-session-secret".to_vec());
    let route_cfg = RouterConfig { guest: true, ..Default::default() };

    assert_eq!(run_once(&chain, &pool, &route_cfg, &secret, "nonce-alpha-1").await.c, 200);
    assert_eq!(run_once(&chain, &pool, &route_cfg, &secret, "nonce-beta-12").await.c, 200);
}

#[tokio::test]
async fn aes_request_only_route_rejects_a_plain_plan_envelope() {
    let keys = keys(&TokenSecret::from_raw(b"secret".to_vec()));
    let req_env = envelope::encode_response(200, "ok", b"hi", Some("abcdefgh"), None, Plan::Plain, &keys, None, None).unwrap();
    let envelope = RequestEnvelope {
        d: req_env.d,
        n: req_env.n,
        t: req_env.t,
        p: req_env.p,
        s: req_env.s,
        r: None,
        e: None,
    };
    let route_cfg = RouterConfig { aes_request: true, ..Default::default() };
    let err = envelope::decode_request(&envelope, &route_cfg, &keys).unwrap_err();
    assert!(matches!(err, gatehouse::error::GatewayError::Protocol(_)));
}
