//! Cryptographic request/response envelope (C2).
//!
//! Wire shape: `{d,n,t,p,s,r,e}` on ingress, `{c,m,d,n,t,p,s,e}` on egress.
//! Grounded on `security/encryption_engine.rs`'s AES-256-GCM usage and
//! `api/gateway/auth.rs`'s HMAC/RSA handling, generalized to the envelope's
//! four plans and its nonce/time replay-window invariants.

use std::time::{SystemTime, UNIX_EPOCH};

use aes_gcm::aead::Aead;
use aes_gcm::{Aes256Gcm, KeyInit, Nonce};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use hmac::{Hmac, Mac};
use p256::ecdsa::signature::Verifier;
use p256::ecdsa::{Signature, VerifyingKey};
use rsa::{Pkcs1v15Sign, RsaPrivateKey, RsaPublicKey};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use zeroize::Zeroizing;

use crate::error::{GatewayError, Result};
use crate::router::RouterConfig;
use crate::subject::TokenSecret;

type HmacSha256 = Hmac<Sha256>;

/// Plan 0 is plain base64, 1 is AES-GCM with the token secret, 2 is the
/// ECDH/RSA handshake plan (`Login` routes), 3 is standalone-sign (no
/// encryption, HMAC only, keyed by a server-wide standalone sign key).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Plan {
    Plain = 0,
    AesGcm = 1,
    Handshake = 2,
    StandaloneSign = 3,
}

impl Plan {
    fn from_u8(v: u8) -> Result<Self> {
        match v {
            0 => Ok(Plan::Plain),
            1 => Ok(Plan::AesGcm),
            2 => Ok(Plan::Handshake),
            3 => Ok(Plan::StandaloneSign),
            other => Err(GatewayError::Protocol(format!("invalid plan {other}"))),
        }
    }
}

/// Request envelope as received on the wire.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestEnvelope {
    pub d: String,
    pub n: String,
    pub t: i64,
    pub p: u8,
    pub s: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub r: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub e: Option<String>,
}

/// Response envelope, same shape plus `c`/`m`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponseEnvelope {
    pub c: u16,
    pub m: String,
    pub d: String,
    pub n: String,
    pub t: i64,
    pub p: u8,
    pub s: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub e: Option<String>,
}

const REPLAY_WINDOW_SECS: i64 = 300;
const MIN_NONCE_LEN: usize = 8;
const MAX_NONCE_LEN: usize = 32;

/// Keys available to derive/check a plan's signing and encryption secret.
/// None of these are stored anywhere; the caller constructs one per request
/// and it is dropped (and the derived bytes zeroised) at the end of the call.
pub struct PlanKeys<'a> {
    /// Per-session secret derived from the caller's verified token (plans 0/1).
    pub token_secret: Option<&'a TokenSecret>,
    /// Server-held handshake secret used for plan 2 (ECDH/RSA).
    pub handshake_secret: Option<&'a [u8]>,
    /// Process-wide standalone-sign key used for plan 3.
    pub standalone_sign_key: &'a [u8],
    /// Trusted ECDSA verifying keys accepted for the `e` field.
    pub trusted_ecdsa_keys: &'a [VerifyingKey],
    /// Trusted RSA verifying keys accepted for the `e` field on routes with
    /// `use_rsa` set (the `UseRSA` alternative to the default ECDSA
    /// provenance signature).
    pub trusted_rsa_keys: &'a [RsaPublicKey],
    /// Route is a `Guest` route: a plan=0 request/response is allowed to
    /// sign with the fixed [`GUEST_SIGNING_KEY`] when no caller token secret
    /// exists, rather than failing plan-secret derivation outright. Has no
    /// effect on plans 1-3, which always need a real secret.
    pub guest: bool,
}

/// Fixed, publicly-known HMAC key for `Guest` routes with no caller secret.
/// The envelope's `s` field stays structurally present for these, but it
/// authenticates nothing -- guest content is the "public endpoint" exception
/// the signature requirement otherwise carves out (§3 "s is mandatory except
/// where policy explicitly declares a public endpoint").
const GUEST_SIGNING_KEY: &[u8] = b"gatehouse-guest-plan-signing-key";

/// Result of a successful ingress decode.
pub struct DecodedRequest {
    pub plaintext: Vec<u8>,
    pub nonce: String,
    pub router: Option<String>,
    /// Index into `trusted_ecdsa_keys` that verified `e`, if present.
    pub matched_key: Option<usize>,
}

/// Decode and verify an inbound envelope: timestamp/nonce/signature checks,
/// router-policy enforcement, HMAC verification, optional ECDSA provenance
/// check, then plaintext recovery.
pub fn decode_request(
    env: &RequestEnvelope,
    router_cfg: &RouterConfig,
    keys: &PlanKeys<'_>,
) -> Result<DecodedRequest> {
    let now = now_secs();
    if (now - env.t).abs() > REPLAY_WINDOW_SECS {
        return Err(GatewayError::Protocol("timestamp outside replay window".to_string()));
    }
    if !(MIN_NONCE_LEN..=MAX_NONCE_LEN).contains(&env.n.len()) {
        return Err(GatewayError::Protocol("nonce length out of range".to_string()));
    }
    if env.d.is_empty() {
        return Err(GatewayError::Protocol("empty data field".to_string()));
    }
    let sig_len = decode_sig_bytes(&env.s)?.len();
    if sig_len != 32 && sig_len != 64 {
        return Err(GatewayError::Protocol("signature length invalid".to_string()));
    }

    let plan = Plan::from_u8(env.p)?;

    // Step 3: enforce router policy.
    if router_cfg.aes_request && plan != Plan::AesGcm {
        return Err(GatewayError::Protocol("router requires plan=1".to_string()));
    }
    if router_cfg.login && plan != Plan::Handshake {
        return Err(GatewayError::Protocol("login route requires plan=2".to_string()));
    }
    if !router_cfg.login && !router_cfg.aes_request && !matches!(plan, Plan::Plain | Plan::AesGcm) {
        return Err(GatewayError::Protocol("route does not accept this plan".to_string()));
    }
    if matches!(plan, Plan::Plain | Plan::AesGcm) && !router_cfg.guest && keys.token_secret.is_none() {
        return Err(GatewayError::Unauthenticated);
    }

    let secret = plan_secret(plan, keys)?;

    // Step 4: verify HMAC over router||d||n||t||p.
    let expected = compute_hmac(&secret, env.r.as_deref(), &env.d, &env.n, env.t, env.p)?;
    let provided = decode_sig_bytes(&env.s)?;
    verify_hmac_constant_time(&expected, &provided)?;

    // Step 5: optionally verify the provenance signature. `use_rsa` swaps
    // the scheme from ECDSA/P-256 to RSA PKCS#1 v1.5 (the `UseRSA`
    // alternative); the handshake's key-exchange mechanism (ECDH) is
    // unaffected by this flag.
    let matched_key = match &env.e {
        Some(e) if router_cfg.use_rsa => Some(verify_rsa_provenance(&expected, e, keys.trusted_rsa_keys)?),
        Some(e) => Some(verify_ecdsa_provenance(&expected, e, keys.trusted_ecdsa_keys)?),
        None => None,
    };

    // Step 6: recover plaintext.
    let plaintext = match plan {
        Plan::Plain => BASE64
            .decode(&env.d)
            .map_err(|e| GatewayError::Protocol(format!("invalid base64: {e}")))?,
        Plan::AesGcm => aes_gcm_decrypt(&secret, &env.d, env.t, &env.n, env.p, env.r.as_deref())?,
        Plan::Handshake => aes_gcm_decrypt(&secret, &env.d, env.t, &env.n, env.p, env.r.as_deref())?,
        Plan::StandaloneSign => BASE64
            .decode(&env.d)
            .map_err(|e| GatewayError::Protocol(format!("invalid base64: {e}")))?,
    };

    Ok(DecodedRequest {
        plaintext,
        nonce: env.n.clone(),
        router: env.r.clone(),
        matched_key,
    })
}

/// Build an outbound envelope: encrypt/encode the body for the given plan,
/// then sign it.
#[allow(clippy::too_many_arguments)]
pub fn encode_response(
    status: u16,
    message: &str,
    plaintext: &[u8],
    echo_nonce: Option<&str>,
    router: Option<&str>,
    plan: Plan,
    keys: &PlanKeys<'_>,
    sign_ecdsa: Option<&p256::ecdsa::SigningKey>,
    sign_rsa: Option<&RsaPrivateKey>,
) -> Result<ResponseEnvelope> {
    let now = now_secs();
    let nonce = echo_nonce.map(str::to_string).unwrap_or_else(fresh_nonce);
    let secret = plan_secret(plan, keys)?;

    let d = match plan {
        Plan::Plain | Plan::StandaloneSign => BASE64.encode(plaintext),
        Plan::AesGcm | Plan::Handshake => aes_gcm_encrypt(&secret, plaintext, now, &nonce, plan as u8, router)?,
    };

    let p = plan as u8;
    let hmac_value = compute_hmac(&secret, router, &d, &nonce, now, p)?;
    let s = encode_sig_bytes(&hmac_value);

    // PKCS#1 v1.5 signing is deterministic and needs no RNG, so the `UseRSA`
    // path costs nothing beyond picking which key material to sign with.
    let e = if let Some(sk) = sign_rsa {
        sk.sign(Pkcs1v15Sign::new::<Sha256>(), &hmac_value)
            .ok()
            .map(|sig| BASE64.encode(sig))
    } else {
        sign_ecdsa.map(|sk| {
            use p256::ecdsa::signature::Signer;
            let sig: Signature = sk.sign(&hmac_value);
            BASE64.encode(sig.to_bytes())
        })
    };

    Ok(ResponseEnvelope {
        c: status,
        m: message.to_string(),
        d,
        n: nonce,
        t: now,
        p,
        s,
        e,
    })
}

fn plan_secret(plan: Plan, keys: &PlanKeys<'_>) -> Result<Zeroizing<Vec<u8>>> {
    match plan {
        Plan::Plain if keys.token_secret.is_none() && keys.guest => Ok(Zeroizing::new(GUEST_SIGNING_KEY.to_vec())),
        Plan::Plain | Plan::AesGcm => keys
            .token_secret
            .map(|ts| Zeroizing::new(ts.as_bytes().to_vec()))
            .ok_or(GatewayError::Unauthenticated),
        Plan::Handshake => keys
            .handshake_secret
            .map(|s| Zeroizing::new(s.to_vec()))
            .ok_or_else(|| GatewayError::Protocol("no handshake secret available".to_string())),
        Plan::StandaloneSign => Ok(Zeroizing::new(keys.standalone_sign_key.to_vec())),
    }
}

fn compute_hmac(secret: &[u8], router: Option<&str>, d: &str, n: &str, t: i64, p: u8) -> Result<Vec<u8>> {
    let mut mac = HmacSha256::new_from_slice(secret).map_err(|e| GatewayError::Crypto(e.to_string()))?;
    if let Some(r) = router {
        mac.update(r.as_bytes());
    }
    mac.update(d.as_bytes());
    mac.update(n.as_bytes());
    mac.update(t.to_string().as_bytes());
    mac.update(&[p]);
    Ok(mac.finalize().into_bytes().to_vec())
}

fn verify_hmac_constant_time(expected: &[u8], provided: &[u8]) -> Result<()> {
    // `expected` is already the computed tag, not a key, so compare via a
    // fixed-time XOR fold rather than going through `Mac::verify_slice`.
    if expected.len() != provided.len() {
        return Err(GatewayError::SignatureInvalid);
    }
    let diff = expected
        .iter()
        .zip(provided.iter())
        .fold(0u8, |acc, (a, b)| acc | (a ^ b));
    if diff == 0 {
        Ok(())
    } else {
        Err(GatewayError::SignatureInvalid)
    }
}

fn verify_ecdsa_provenance(hmac_value: &[u8], e_field: &str, trusted: &[VerifyingKey]) -> Result<usize> {
    let sig_bytes = BASE64
        .decode(e_field)
        .map_err(|err| GatewayError::Protocol(format!("invalid ecdsa b64: {err}")))?;
    let sig = Signature::from_slice(&sig_bytes).map_err(|err| GatewayError::Protocol(format!("invalid ecdsa sig: {err}")))?;
    for (idx, key) in trusted.iter().enumerate() {
        if key.verify(hmac_value, &sig).is_ok() {
            return Ok(idx);
        }
    }
    Err(GatewayError::SignatureInvalid)
}

fn verify_rsa_provenance(hmac_value: &[u8], e_field: &str, trusted: &[RsaPublicKey]) -> Result<usize> {
    let sig_bytes = BASE64
        .decode(e_field)
        .map_err(|err| GatewayError::Protocol(format!("invalid rsa sig b64: {err}")))?;
    for (idx, key) in trusted.iter().enumerate() {
        if key.verify(Pkcs1v15Sign::new::<Sha256>(), hmac_value, &sig_bytes).is_ok() {
            return Ok(idx);
        }
    }
    Err(GatewayError::SignatureInvalid)
}

/// AES-GCM nonce is derived from `t||n||p||r`; the composition is longer
/// than AES-GCM's 96-bit nonce so it is digested with SHA-256 and
/// truncated, rather than used raw (see DESIGN.md for the reasoning).
fn derive_gcm_nonce(t: i64, n: &str, p: u8, r: Option<&str>) -> [u8; 12] {
    let mut hasher = Sha256::new();
    hasher.update(t.to_string().as_bytes());
    hasher.update(n.as_bytes());
    hasher.update([p]);
    if let Some(r) = r {
        hasher.update(r.as_bytes());
    }
    let digest = hasher.finalize();
    let mut nonce = [0u8; 12];
    nonce.copy_from_slice(&digest[..12]);
    nonce
}

fn aes_gcm_encrypt(secret: &[u8], plaintext: &[u8], t: i64, n: &str, p: u8, r: Option<&str>) -> Result<String> {
    let key = derive_aes_key(secret);
    let cipher = Aes256Gcm::new((&*key).into());
    let nonce_bytes = derive_gcm_nonce(t, n, p, r);
    let nonce = Nonce::from_slice(&nonce_bytes);
    let ciphertext = cipher.encrypt(nonce, plaintext)?;
    Ok(BASE64.encode(ciphertext))
}

fn aes_gcm_decrypt(secret: &[u8], d: &str, t: i64, n: &str, p: u8, r: Option<&str>) -> Result<Vec<u8>> {
    let key = derive_aes_key(secret);
    let cipher = Aes256Gcm::new((&*key).into());
    let nonce_bytes = derive_gcm_nonce(t, n, p, r);
    let nonce = Nonce::from_slice(&nonce_bytes);
    let ciphertext = BASE64
        .decode(d)
        .map_err(|e| GatewayError::Protocol(format!("invalid base64: {e}")))?;
    Ok(cipher.decrypt(nonce, ciphertext.as_slice())?)
}

/// Derive a 32-byte AES key from an arbitrary-length secret via SHA-256,
/// zeroised on drop.
fn derive_aes_key(secret: &[u8]) -> Zeroizing<[u8; 32]> {
    let mut hasher = Sha256::new();
    hasher.update(secret);
    let digest = hasher.finalize();
    let mut key = [0u8; 32];
    key.copy_from_slice(&digest);
    Zeroizing::new(key)
}

/// Signatures arrive base64- or hex-encoded; a hex-encoded 32/64-byte tag
/// is itself valid base64 alphabet, so charset/length decide which to try
/// first rather than always preferring base64 (a 64-char hex string decodes
/// as base64 to 48 bytes, which is neither valid signature length).
fn decode_sig_bytes(s: &str) -> Result<Vec<u8>> {
    let looks_like_hex = matches!(s.len(), 64 | 128) && s.bytes().all(|b| b.is_ascii_hexdigit());
    if looks_like_hex {
        if let Ok(bytes) = hex::decode(s) {
            return Ok(bytes);
        }
    }
    BASE64
        .decode(s)
        .or_else(|_| hex::decode(s))
        .map_err(|e| GatewayError::Protocol(format!("invalid signature encoding: {e}")))
}

fn encode_sig_bytes(bytes: &[u8]) -> String {
    BASE64.encode(bytes)
}

/// Builds an unsigned envelope carrying no body, for failures that occur
/// before any per-session secret is available (pre-auth protocol errors) or
/// when signing the real error envelope itself fails. Never used for a
/// successful response.
pub fn plain_error_envelope(status: u16, message: &str, nonce: Option<&str>) -> ResponseEnvelope {
    ResponseEnvelope {
        c: status,
        m: message.to_string(),
        d: String::new(),
        n: nonce.unwrap_or_default().to_string(),
        t: now_secs(),
        p: 0,
        s: String::new(),
        e: None,
    }
}

fn now_secs() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64
}

fn fresh_nonce() -> String {
    use rand::RngCore;
    let mut bytes = [0u8; 16];
    rand::rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::subject::TokenSecret;

    fn plain_router() -> RouterConfig {
        RouterConfig::default()
    }

    #[test]
    fn round_trip_plan0() {
        let token_secret = TokenSecret::from_raw(b"session-secret".to_vec());
        let keys = PlanKeys {
            token_secret: Some(&token_secret),
            handshake_secret: None,
            standalone_sign_key: b"standalone",
            trusted_ecdsa_keys: &[],
            trusted_rsa_keys: &[],
            guest: false,
        };
        let resp = encode_response(200, "ok", b"hello", Some("abcdefgh"), None, Plan::Plain, &keys, None, None).unwrap();
        let req = RequestEnvelope {
            d: resp.d.clone(),
            n: resp.n.clone(),
            t: resp.t,
            p: resp.p,
            s: resp.s.clone(),
            r: None,
            e: None,
        };
        let decoded = decode_request(&req, &plain_router(), &keys).unwrap();
        assert_eq!(decoded.plaintext, b"hello");
    }

    #[test]
    fn rejects_stale_timestamp() {
        let token_secret = TokenSecret::from_raw(b"session-secret".to_vec());
        let keys = PlanKeys {
            token_secret: Some(&token_secret),
            handshake_secret: None,
            standalone_sign_key: b"standalone",
            trusted_ecdsa_keys: &[],
            trusted_rsa_keys: &[],
            guest: false,
        };
        let req = RequestEnvelope {
            d: BASE64.encode(b"hi"),
            n: "abcdefgh".to_string(),
            t: now_secs() - 1000,
            p: 0,
            s: BASE64.encode([0u8; 32]),
            r: None,
            e: None,
        };
        let err = decode_request(&req, &plain_router(), &keys).unwrap_err();
        assert!(matches!(err, GatewayError::Protocol(_)));
    }

    #[test]
    fn rejects_short_nonce() {
        let token_secret = TokenSecret::from_raw(b"session-secret".to_vec());
        let keys = PlanKeys {
            token_secret: Some(&token_secret),
            handshake_secret: None,
            standalone_sign_key: b"standalone",
            trusted_ecdsa_keys: &[],
            trusted_rsa_keys: &[],
            guest: false,
        };
        let req = RequestEnvelope {
            d: BASE64.encode(b"hi"),
            n: "short".to_string(),
            t: now_secs(),
            p: 0,
            s: BASE64.encode([0u8; 32]),
            r: None,
            e: None,
        };
        let err = decode_request(&req, &plain_router(), &keys).unwrap_err();
        assert!(matches!(err, GatewayError::Protocol(_)));
    }

    #[test]
    fn aes_gcm_round_trip() {
        let token_secret = TokenSecret::from_raw(b"another-session-secret".to_vec());
        let mut cfg = RouterConfig::default();
        cfg.aes_request = true;
        cfg.aes_response = true;
        let keys = PlanKeys {
            token_secret: Some(&token_secret),
            handshake_secret: None,
            standalone_sign_key: b"standalone",
            trusted_ecdsa_keys: &[],
            trusted_rsa_keys: &[],
            guest: false,
        };
        let resp = encode_response(200, "ok", b"secret body", Some("nonceval"), Some("/r"), Plan::AesGcm, &keys, None, None).unwrap();
        let req = RequestEnvelope {
            d: resp.d.clone(),
            n: resp.n.clone(),
            t: resp.t,
            p: resp.p,
            s: resp.s.clone(),
            r: Some("/r".to_string()),
            e: None,
        };
        let decoded = decode_request(&req, &cfg, &keys).unwrap();
        assert_eq!(decoded.plaintext, b"secret body");
    }
}
