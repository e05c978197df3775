//! WebSocket entry point (C7): upgrade handling, read loop, heartbeat and
//! write path, wired into the connection registry (C8).
//!
//! Grounded on `websocket/connection.rs`'s `handle_socket` task structure:
//! a read task and a write task joined by an mpsc channel standing in for
//! the teacher's `sendMu`-guarded single writer, plus a heartbeat interval
//! that closes the socket if no pong arrives in time. Every inbound frame
//! gets exactly one rendered response frame back -- success or error --
//! the same onion-rendered envelope the HTTP side reads off
//! `ctx.response_envelope` (§4.4), so a chain rejection no longer drops the
//! frame silently.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use futures_util::{SinkExt, StreamExt};
use p256::ecdsa::VerifyingKey;
use serde::Deserialize;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use zeroize::Zeroizing;

use crate::context::ContextPool;
use crate::envelope::{self, PlanKeys, RequestEnvelope};
use crate::filter::FilterChain;
use crate::login::LoginHandshake;
use crate::metrics::GatewayMetrics;
use crate::ratelimit::{Admission, RateLimiter};
use crate::registry::{ConnectionRecord, ConnectionRegistry, DEFAULT_DEVICE};
use crate::router::Router as GatewayRouter;
use crate::subject::{Subject, TokenAuthority, TokenSecret};

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(20);
const HEARTBEAT_TIMEOUT: Duration = Duration::from_secs(60);
/// Message-level router value that marks a heartbeat frame (§4.7 "Read
/// loop"). Heartbeats only rearm `Last`; they are never dispatched to a
/// business handler.
const PING_ROUTER: &str = "/ws/ping";

pub struct WsState {
    pub router: GatewayRouter,
    pub chain: FilterChain,
    pub pool: ContextPool,
    pub registry: Arc<ConnectionRegistry>,
    pub metrics: Arc<GatewayMetrics>,
    pub authority: Arc<TokenAuthority>,
    pub standalone_sign_key: Vec<u8>,
    pub login: Arc<LoginHandshake>,
    pub trusted_ecdsa_keys: Vec<VerifyingKey>,
    /// Per-second token bucket applied to upgrade requests before the
    /// handshake completes (§4.7 "Upgrade"), separate from the registry's
    /// post-upgrade capacity check.
    pub upgrade_limiter: Arc<dyn RateLimiter>,
}

#[derive(Debug, Deserialize)]
pub struct UpgradeParams {
    pub token: String,
    #[serde(default)]
    pub device: Option<String>,
    /// Caller's ephemeral X25519 public key (hex), present only when the
    /// connection intends to drive a `Login` route over this socket. Named
    /// `pub` on the wire to match the HTTP side's `X-Client-Pub` header.
    #[serde(default, rename = "pub")]
    pub client_pub: Option<String>,
}

pub async fn upgrade(
    ws: WebSocketUpgrade,
    State(state): State<Arc<WsState>>,
    Query(params): Query<UpgradeParams>,
) -> Response {
    // Rejecting here, before `on_upgrade`, means a denied caller never sees
    // the 101 Switching Protocols handshake at all -- it gets a plain 503.
    if state.upgrade_limiter.check("ws-upgrade").await == Admission::Limited {
        return StatusCode::SERVICE_UNAVAILABLE.into_response();
    }
    ws.on_upgrade(move |socket| handle_socket(socket, state, params))
}

async fn handle_socket(socket: WebSocket, state: Arc<WsState>, params: UpgradeParams) {
    let verified = match state.authority.verify(&params.token) {
        Ok(v) => v,
        Err(_) => {
            let _ = socket;
            return;
        }
    };
    let subject = verified.subject;
    let token_secret = verified.secret;
    let roles = verified.roles;
    let device = params.device.unwrap_or_else(|| DEFAULT_DEVICE.to_string());

    // A true "obtain your first token over WS" login flow is a contradiction
    // (the upgrade above already required a valid token), but a caller that
    // already holds a token can still use `client_pub` to bootstrap a plan=2
    // secret for login-style routes reached over this same connection.
    let handshake_secret: Option<Zeroizing<Vec<u8>>> = match &params.client_pub {
        Some(hex_pub) => match state.login.derive_secret_hex(hex_pub) {
            Ok(secret) => Some(Zeroizing::new(secret.to_vec())),
            Err(e) => {
                tracing::debug!(error = %e, "rejecting ws upgrade with malformed client_pub");
                let _ = socket;
                return;
            }
        },
        None => None,
    };

    let (mut sink, mut stream) = socket.split();
    let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<Vec<u8>>();
    let cancel = CancellationToken::new();

    let record = Arc::new(ConnectionRecord {
        outbound: outbound_tx,
        cancel: cancel.clone(),
        last_seen: parking_lot::Mutex::new(std::time::Instant::now()),
    });

    if state.registry.register(subject.clone(), device.clone(), record.clone()).is_err() {
        let _ = sink.close().await;
        return;
    }
    state.metrics.connection_opened();

    let writer_cancel = cancel.clone();
    let writer = tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = writer_cancel.cancelled() => break,
                maybe = outbound_rx.recv() => {
                    match maybe {
                        Some(payload) => {
                            if sink.send(Message::Binary(payload.into())).await.is_err() {
                                break;
                            }
                        }
                        None => break,
                    }
                }
            }
        }
        let _ = sink.close().await;
    });

    let read_cancel = cancel.clone();
    let heartbeat_cancel = cancel.clone();
    let heartbeat_record = record.clone();
    let heartbeat_metrics = state.metrics.clone();
    let heartbeat = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(HEARTBEAT_INTERVAL);
        loop {
            tokio::select! {
                _ = heartbeat_cancel.cancelled() => break,
                _ = ticker.tick() => {
                    if heartbeat_record.last_seen.lock().elapsed() > HEARTBEAT_TIMEOUT {
                        heartbeat_metrics.record_heartbeat(false);
                        heartbeat_cancel.cancel();
                        break;
                    }
                    heartbeat_metrics.record_heartbeat(true);
                }
            }
        }
    });

    loop {
        tokio::select! {
            _ = read_cancel.cancelled() => break,
            maybe_msg = stream.next() => {
                match maybe_msg {
                    Some(Ok(Message::Binary(bytes))) => {
                        record.touch();
                        process_message(&state, &subject, &token_secret, handshake_secret.as_ref(), &roles, &bytes, &record).await;
                    }
                    Some(Ok(Message::Text(text))) => {
                        record.touch();
                        process_message(&state, &subject, &token_secret, handshake_secret.as_ref(), &roles, text.as_bytes(), &record).await;
                    }
                    Some(Ok(Message::Ping(_))) | Some(Ok(Message::Pong(_))) => {
                        record.touch();
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(_)) => break,
                }
            }
        }
    }

    cancel.cancel();
    let _ = writer.await;
    let _ = heartbeat.await;
    state.registry.unregister(&subject, &device);
    state.metrics.connection_closed();
}

/// Decodes, routes, and drives one inbound frame through the shared filter
/// chain, then sends back exactly one rendered response frame. Returns
/// nothing -- failures (malformed JSON, an unroutable `r`, a chain
/// rejection) all still produce a response; only a heartbeat frame
/// short-circuits before anything is sent.
async fn process_message(
    state: &Arc<WsState>,
    subject: &Subject,
    token_secret: &TokenSecret,
    handshake_secret: Option<&Zeroizing<Vec<u8>>>,
    roles: &[String],
    bytes: &[u8],
    record: &Arc<ConnectionRecord>,
) {
    let envelope: RequestEnvelope = match serde_json::from_slice(bytes) {
        Ok(e) => e,
        Err(e) => {
            tracing::debug!(error = %e, "dropping malformed ws frame");
            send_ws_error(record, &crate::error::GatewayError::Protocol(format!("invalid envelope json: {e}")), None);
            return;
        }
    };

    if envelope.r.as_deref() == Some(PING_ROUTER) {
        record.touch();
        return;
    }

    let route = state.router.route(envelope.r.as_deref().unwrap_or("/"));
    let route_cfg = route.map(|r| r.config.clone()).unwrap_or_default();

    let keys = PlanKeys {
        token_secret: Some(token_secret),
        handshake_secret: handshake_secret.map(|s| s.as_slice()),
        standalone_sign_key: &state.standalone_sign_key,
        trusted_ecdsa_keys: &state.trusted_ecdsa_keys,
        trusted_rsa_keys: &[],
        guest: route_cfg.guest,
    };

    let decoded = match envelope::decode_request(&envelope, &route_cfg, &keys) {
        Ok(d) => d,
        Err(e) => {
            tracing::debug!(error = %e, "ws envelope rejected");
            state.metrics.record_message(false);
            send_ws_error(record, &e, None);
            return;
        }
    };

    let mut ctx = state.pool.checkout(envelope.r.clone().unwrap_or_default(), decoded.plaintext);
    ctx.subject = Some(subject.clone());
    ctx.token_secret = Some(token_secret.clone());
    ctx.handshake_secret = handshake_secret.cloned();
    ctx.handler = route.map(|r| r.handler.clone());
    ctx.route_config = route_cfg;
    if !roles.is_empty() {
        ctx.set_attr("roles", roles.join(","));
    }
    ctx.set_attr("nonce", decoded.nonce);

    let chain_result = state.chain.run(&mut ctx).await;
    let response_envelope = match ctx.response_envelope.take() {
        Some(env) => env,
        None => {
            let err = chain_result
                .err()
                .unwrap_or_else(|| crate::error::GatewayError::Internal("render filter did not run".to_string()));
            envelope::plain_error_envelope(err.status_code(), &err.to_string(), None)
        }
    };

    let ok = response_envelope.c < 400;
    state.metrics.record_message(ok);
    send_ws_envelope(record, &response_envelope);
}

fn send_ws_envelope(record: &Arc<ConnectionRecord>, envelope: &envelope::ResponseEnvelope) {
    if let Ok(payload) = serde_json::to_vec(envelope) {
        let _ = record.outbound.send(payload);
    }
}

fn send_ws_error(record: &Arc<ConnectionRecord>, err: &crate::error::GatewayError, nonce: Option<&str>) {
    let envelope = envelope::plain_error_envelope(err.status_code(), &err.to_string(), nonce);
    send_ws_envelope(record, &envelope);
}
