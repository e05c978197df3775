//! HTTP surface of the encipher service.
//!
//! Every POST endpoint below shares the same shape: a `pub` header names
//! the caller's established session (via [`session::cache_key`]), the body
//! is a sealed blob under that session's shared secret, and the response is
//! sealed the same way with a `sign` header carrying
//! `HMAC_SHA256(response_bytes, shared_secret)`. A caller with no session on
//! file, or a body that fails to open, gets a bare empty `200` -- opaque to
//! the client -- rather than an error that would tell an attacker which
//! half of the handshake failed.

use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::Router;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use serde::{Deserialize, Serialize};

use crate::encipher::crypto;
use crate::encipher::keystore::EncipherKeystore;
use crate::encipher::session::{cache_key, SessionCache};
use crate::subject::{Subject, TokenAuthority};

pub struct EncipherState {
    pub keystore: EncipherKeystore,
    pub sessions: SessionCache,
    pub token_authority: TokenAuthority,
    pub session_ttl_secs: u64,
}

pub fn build_router(state: Arc<EncipherState>) -> Router {
    Router::new()
        .route("/api/keystore", get(get_keystore))
        .route("/api/handshake", post(handshake))
        .route("/api/signature", post(signature))
        .route("/api/signatureVerify", post(signature_verify))
        .route("/api/tokenSignature", post(token_signature))
        .route("/api/tokenSignatureVerify", post(token_signature_verify))
        .route("/api/aesEncrypt", post(aes_encrypt))
        .route("/api/aesDecrypt", post(aes_decrypt))
        .route("/api/eccEncrypt", post(ecc_encrypt))
        .route("/api/eccDecrypt", post(ecc_decrypt))
        .route("/api/tokenEncrypt", post(token_encrypt))
        .route("/api/tokenDecrypt", post(token_decrypt))
        .route("/api/tokenCreate", post(token_create))
        .route("/api/tokenVerify", post(token_verify))
        .route("/api/config", post(get_config))
        .with_state(state)
}

async fn get_keystore(State(state): State<Arc<EncipherState>>) -> impl IntoResponse {
    BASE64.encode(state.keystore.x25519_public())
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name)?.to_str().ok()
}

fn empty_opaque() -> Response {
    (StatusCode::OK, String::new()).into_response()
}

fn sealed_response(shared: &[u8], plaintext: &[u8]) -> Response {
    match crypto::seal(shared, plaintext) {
        Ok(sealed) => {
            let sign = crypto::hmac_hex(shared, sealed.as_bytes()).unwrap_or_default();
            let mut headers = HeaderMap::new();
            if let Ok(v) = sign.parse() {
                headers.insert("sign", v);
            }
            (StatusCode::OK, headers, sealed).into_response()
        }
        Err(e) => {
            tracing::warn!(error = %e, "encipher: failed to seal response");
            empty_opaque()
        }
    }
}

/// Resolve the caller's session from the `pub` header. Returns `None` if
/// the header is absent, malformed, or no session is cached for it -- all
/// three collapse to the same opaque failure.
fn lookup_session(state: &EncipherState, headers: &HeaderMap) -> Option<(Vec<u8>, [u8; 32])> {
    let pub_b64 = header_str(headers, "pub")?;
    let client_pub = BASE64.decode(pub_b64).ok()?;
    let shared = state.sessions.get(&cache_key(&client_pub))?;
    Some((client_pub, shared))
}

async fn handshake(
    State(state): State<Arc<EncipherState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let Some(pub_b64) = header_str(&headers, "pub") else {
        return empty_opaque();
    };
    let Ok(client_pub) = BASE64.decode(pub_b64) else {
        return empty_opaque();
    };
    if client_pub.len() != 32 {
        return empty_opaque();
    }
    let mut client_pub_arr = [0u8; 32];
    client_pub_arr.copy_from_slice(&client_pub);
    let shared = crypto::x25519_shared(state.keystore.x25519_scalar(), &client_pub_arr);

    let body_str = match std::str::from_utf8(&body) {
        Ok(s) => s,
        Err(_) => return empty_opaque(),
    };
    let nonce = match crypto::open(&shared, body_str) {
        Ok(n) => n,
        Err(e) => {
            tracing::debug!(error = %e, "encipher: handshake nonce decrypt failed");
            return empty_opaque();
        }
    };

    state.sessions.insert(cache_key(&client_pub), shared);
    sealed_response(&shared, &nonce)
}

/// Decrypt a request body under the caller's session secret, or bail out
/// to the opaque empty response. Shared by every endpoint below except
/// `/api/keystore` and `/api/handshake`.
async fn open_session_body(state: &EncipherState, headers: &HeaderMap, body: Bytes) -> Option<(Vec<u8>, [u8; 32])> {
    let (_client_pub, shared) = lookup_session(state, headers)?;
    let body_str = std::str::from_utf8(&body).ok()?;
    match crypto::open(&shared, body_str) {
        Ok(plaintext) => Some((plaintext, shared)),
        Err(e) => {
            tracing::debug!(error = %e, "encipher: request body decrypt failed");
            None
        }
    }
}

async fn signature(State(state): State<Arc<EncipherState>>, headers: HeaderMap, body: Bytes) -> Response {
    let Some((plaintext, shared)) = open_session_body(&state, &headers, body).await else {
        return empty_opaque();
    };
    let Ok(sig) = crypto::hmac_hex(state.keystore.sign_key(), &plaintext) else {
        return empty_opaque();
    };
    sealed_response(&shared, sig.as_bytes())
}

async fn signature_verify(State(state): State<Arc<EncipherState>>, headers: HeaderMap, body: Bytes) -> Response {
    let Some(sign_hex) = header_str(&headers, "sign").map(str::to_string) else {
        return empty_opaque();
    };
    let Some((plaintext, shared)) = open_session_body(&state, &headers, body).await else {
        return empty_opaque();
    };
    let ok = crypto::verify_hmac_hex(state.keystore.sign_key(), &plaintext, &sign_hex).is_ok();
    sealed_response(&shared, ok.to_string().as_bytes())
}

async fn token_signature(State(state): State<Arc<EncipherState>>, headers: HeaderMap, body: Bytes) -> Response {
    let Some(token) = header_str(&headers, "token").map(str::to_string) else {
        return empty_opaque();
    };
    let Some((plaintext, shared)) = open_session_body(&state, &headers, body).await else {
        return empty_opaque();
    };
    let token_secret = state.keystore.derive_token_secret(&token);
    let Ok(sig) = crypto::hmac_hex(&token_secret, &plaintext) else {
        return empty_opaque();
    };
    sealed_response(&shared, sig.as_bytes())
}

async fn token_signature_verify(
    State(state): State<Arc<EncipherState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let (Some(token), Some(sign_hex)) = (
        header_str(&headers, "token").map(str::to_string),
        header_str(&headers, "sign").map(str::to_string),
    ) else {
        return empty_opaque();
    };
    let Some((plaintext, shared)) = open_session_body(&state, &headers, body).await else {
        return empty_opaque();
    };
    let token_secret = state.keystore.derive_token_secret(&token);
    let ok = crypto::verify_hmac_hex(&token_secret, &plaintext, &sign_hex).is_ok();
    sealed_response(&shared, ok.to_string().as_bytes())
}

async fn aes_encrypt(State(state): State<Arc<EncipherState>>, headers: HeaderMap, body: Bytes) -> Response {
    let Some((plaintext, shared)) = open_session_body(&state, &headers, body).await else {
        return empty_opaque();
    };
    let Ok(ciphertext) = crypto::seal(state.keystore.encrypt_key(), &plaintext) else {
        return empty_opaque();
    };
    sealed_response(&shared, ciphertext.as_bytes())
}

async fn aes_decrypt(State(state): State<Arc<EncipherState>>, headers: HeaderMap, body: Bytes) -> Response {
    let Some((plaintext, shared)) = open_session_body(&state, &headers, body).await else {
        return empty_opaque();
    };
    let Ok(ciphertext_str) = std::str::from_utf8(&plaintext) else {
        return empty_opaque();
    };
    let Ok(recovered) = crypto::open(state.keystore.encrypt_key(), ciphertext_str) else {
        return empty_opaque();
    };
    sealed_response(&shared, &recovered)
}

#[derive(Deserialize)]
struct EccPayload {
    peer_pub: String,
    data: String,
}

#[derive(Serialize)]
struct EccResult {
    data: String,
}

async fn ecc_encrypt(State(state): State<Arc<EncipherState>>, headers: HeaderMap, body: Bytes) -> Response {
    let Some((plaintext, shared)) = open_session_body(&state, &headers, body).await else {
        return empty_opaque();
    };
    let Ok(payload) = serde_json::from_slice::<EccPayload>(&plaintext) else {
        return empty_opaque();
    };
    let Some(peer_shared) = derive_peer_shared(&state, &payload.peer_pub) else {
        return empty_opaque();
    };
    let Ok(data) = BASE64.decode(&payload.data) else {
        return empty_opaque();
    };
    let Ok(sealed) = crypto::seal(&peer_shared, &data) else {
        return empty_opaque();
    };
    let out = serde_json::to_vec(&EccResult { data: sealed }).unwrap_or_default();
    sealed_response(&shared, &out)
}

async fn ecc_decrypt(State(state): State<Arc<EncipherState>>, headers: HeaderMap, body: Bytes) -> Response {
    let Some((plaintext, shared)) = open_session_body(&state, &headers, body).await else {
        return empty_opaque();
    };
    let Ok(payload) = serde_json::from_slice::<EccPayload>(&plaintext) else {
        return empty_opaque();
    };
    let Some(peer_shared) = derive_peer_shared(&state, &payload.peer_pub) else {
        return empty_opaque();
    };
    let Ok(recovered) = crypto::open(&peer_shared, &payload.data) else {
        return empty_opaque();
    };
    sealed_response(&shared, &recovered)
}

fn derive_peer_shared(state: &EncipherState, peer_pub_b64: &str) -> Option<[u8; 32]> {
    let peer_pub = BASE64.decode(peer_pub_b64).ok()?;
    if peer_pub.len() != 32 {
        return None;
    }
    let mut arr = [0u8; 32];
    arr.copy_from_slice(&peer_pub);
    Some(crypto::x25519_shared(state.keystore.x25519_scalar(), &arr))
}

async fn token_encrypt(State(state): State<Arc<EncipherState>>, headers: HeaderMap, body: Bytes) -> Response {
    let Some(token) = header_str(&headers, "token").map(str::to_string) else {
        return empty_opaque();
    };
    let Some((plaintext, shared)) = open_session_body(&state, &headers, body).await else {
        return empty_opaque();
    };
    let token_secret = state.keystore.derive_token_secret(&token);
    let Ok(sealed) = crypto::seal(&token_secret, &plaintext) else {
        return empty_opaque();
    };
    sealed_response(&shared, sealed.as_bytes())
}

async fn token_decrypt(State(state): State<Arc<EncipherState>>, headers: HeaderMap, body: Bytes) -> Response {
    let Some(token) = header_str(&headers, "token").map(str::to_string) else {
        return empty_opaque();
    };
    let Some((plaintext, shared)) = open_session_body(&state, &headers, body).await else {
        return empty_opaque();
    };
    let Ok(sealed_str) = std::str::from_utf8(&plaintext) else {
        return empty_opaque();
    };
    let token_secret = state.keystore.derive_token_secret(&token);
    let Ok(recovered) = crypto::open(&token_secret, sealed_str) else {
        return empty_opaque();
    };
    sealed_response(&shared, &recovered)
}

#[derive(Deserialize, Serialize)]
struct TokenCreateRequest {
    sub: String,
    #[serde(default = "default_ttl")]
    ttl_secs: i64,
}

fn default_ttl() -> i64 {
    3600
}

async fn token_create(State(state): State<Arc<EncipherState>>, headers: HeaderMap, body: Bytes) -> Response {
    let Some((plaintext, shared)) = open_session_body(&state, &headers, body).await else {
        return empty_opaque();
    };
    let Ok(req) = serde_json::from_slice::<TokenCreateRequest>(&plaintext) else {
        return empty_opaque();
    };
    let subject = Subject(req.sub);
    let Ok((token, secret)) = state.token_authority.issue(&subject, req.ttl_secs) else {
        return empty_opaque();
    };
    let exp = now_secs() + req.ttl_secs;
    let payload = format!("{token};{};{exp}", hex::encode(secret.as_bytes()));
    sealed_response(&shared, payload.as_bytes())
}

async fn token_verify(State(state): State<Arc<EncipherState>>, headers: HeaderMap, body: Bytes) -> Response {
    let Some((plaintext, shared)) = open_session_body(&state, &headers, body).await else {
        return empty_opaque();
    };
    let Ok(token) = std::str::from_utf8(&plaintext) else {
        return empty_opaque();
    };
    let Ok(verified) = state.token_authority.verify(token) else {
        return empty_opaque();
    };
    sealed_response(&shared, verified.subject.as_str().as_bytes())
}

#[derive(Serialize)]
struct PublicConfig {
    session_ttl_secs: u64,
}

async fn get_config(State(state): State<Arc<EncipherState>>, headers: HeaderMap, body: Bytes) -> Response {
    let Some((_plaintext, shared)) = open_session_body(&state, &headers, body).await else {
        return empty_opaque();
    };
    let cfg = PublicConfig {
        session_ttl_secs: state.session_ttl_secs,
    };
    let out = serde_json::to_vec(&cfg).unwrap_or_default();
    sealed_response(&shared, &out)
}

fn now_secs() -> i64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_secs() as i64
}
