//! Subject identity and per-session secret derivation (part of C2/C3).
//!
//! Grounded on `api/gateway/auth.rs`'s JWT claim handling, narrowed to the
//! fields the envelope and filter chain actually need: a stable subject id
//! and a per-session secret used as the HMAC/AES key for plans 0/1.

use hmac::{Hmac, Mac};
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use sha2::{Sha256, Sha512};
use zeroize::Zeroizing;

use crate::error::{GatewayError, Result};

/// Identifies the caller a request or connection belongs to.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Subject(pub String);

impl Subject {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for Subject {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Claims carried by the token issued to a logged-in caller. The token
/// carries no secret of its own: the per-session secret is derived from the
/// token's own bytes plus the server's sign key (see
/// `TokenAuthority::derive_token_secret`), so the claims never expose key
/// material a holder of the token could read directly.
/// `rol` mirrors the envelope data model's optional role claim (§3); it is
/// a comma-joined list rather than a `Vec` so the claim stays a plain JWT
/// string field.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenClaims {
    pub sub: String,
    pub exp: i64,
    pub iat: i64,
    pub iss: String,
    #[serde(default)]
    pub device: Option<String>,
    #[serde(default)]
    pub rol: Option<String>,
}

/// Result of a successful token verification: the caller's identity, its
/// per-session secret, and whatever roles were embedded in the token at
/// issuance (empty when the subject was issued with none).
pub struct VerifiedToken {
    pub subject: Subject,
    pub secret: TokenSecret,
    pub roles: Vec<String>,
}

/// A per-session secret, held only as long as a request is being processed.
#[derive(Clone)]
pub struct TokenSecret(Zeroizing<Vec<u8>>);

impl TokenSecret {
    pub fn from_raw(bytes: Vec<u8>) -> Self {
        TokenSecret(Zeroizing::new(bytes))
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

/// Verifies and issues tokens for a single signing key. One instance is
/// shared across a `Router`'s JWT-protected routes.
pub struct TokenAuthority {
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
    issuer: String,
    /// Same key used to sign/verify the JWT, kept as raw bytes too so
    /// `derive_token_secret` can feed it into HMAC directly.
    sign_key: Zeroizing<Vec<u8>>,
}

impl TokenAuthority {
    pub fn new(signing_key: &[u8], issuer: impl Into<String>) -> Self {
        TokenAuthority {
            encoding_key: EncodingKey::from_secret(signing_key),
            decoding_key: DecodingKey::from_secret(signing_key),
            issuer: issuer.into(),
            sign_key: Zeroizing::new(signing_key.to_vec()),
        }
    }

    pub fn issue(&self, subject: &Subject, ttl_secs: i64) -> Result<(String, TokenSecret)> {
        self.issue_with_roles(subject, ttl_secs, &[])
    }

    pub fn issue_with_roles(
        &self,
        subject: &Subject,
        ttl_secs: i64,
        roles: &[String],
    ) -> Result<(String, TokenSecret)> {
        let now = now_secs();
        let claims = TokenClaims {
            sub: subject.0.clone(),
            iat: now,
            exp: now + ttl_secs,
            iss: self.issuer.clone(),
            device: None,
            rol: if roles.is_empty() { None } else { Some(roles.join(",")) },
        };
        let mut header = Header::new(Algorithm::HS256);
        header.typ = Some("JWT".to_string());
        let token = encode(&header, &claims, &self.encoding_key).map_err(GatewayError::from)?;
        let secret = self.derive_token_secret(&token);
        Ok((token, secret))
    }

    pub fn verify(&self, token: &str) -> Result<VerifiedToken> {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.set_issuer(&[&self.issuer]);
        let data = decode::<TokenClaims>(token, &self.decoding_key, &validation).map_err(GatewayError::from)?;
        let roles = data
            .claims
            .rol
            .map(|r| r.split(',').map(str::to_string).collect())
            .unwrap_or_default();
        Ok(VerifiedToken {
            subject: Subject(data.claims.sub),
            secret: self.derive_token_secret(token),
            roles,
        })
    }

    /// Per-token secret derived from the token bytes and the server's sign
    /// key: `HMAC_SHA256(token||signKey, signKey) || HMAC_SHA512(...)`.
    /// Deterministic and never embedded in the token itself, so any holder
    /// of the token cannot read it but the server can always re-derive it.
    pub fn derive_token_secret(&self, token: &str) -> TokenSecret {
        let mut input = token.as_bytes().to_vec();
        input.extend_from_slice(&self.sign_key);

        let mut mac256 = Hmac::<Sha256>::new_from_slice(&self.sign_key).expect("hmac accepts any key length");
        mac256.update(&input);
        let part_a = mac256.finalize().into_bytes();

        let mut mac512 = Hmac::<Sha512>::new_from_slice(&self.sign_key).expect("hmac accepts any key length");
        mac512.update(&input);
        let part_b = mac512.finalize().into_bytes();

        let mut combined = Vec::with_capacity(part_a.len() + part_b.len());
        combined.extend_from_slice(&part_a);
        combined.extend_from_slice(&part_b);
        TokenSecret::from_raw(combined)
    }
}

fn now_secs() -> i64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_secs() as i64
}
