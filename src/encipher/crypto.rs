//! Sealed-box primitives shared by every encipher endpoint.
//!
//! Grounded on `security/encryption_engine.rs`'s AES-256-GCM usage, but
//! wire-encoded as a single base64 blob (`nonce || ciphertext || tag`)
//! rather than that module's `Ciphertext{iv,tag,data}` struct: the encipher
//! wire format is a bare string, not a structured record, so the nonce has
//! to travel inline with the ciphertext instead of alongside it.

use aes_gcm::aead::Aead;
use aes_gcm::{Aes256Gcm, KeyInit, Nonce};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use hmac::{Hmac, Mac};
use rand::RngCore;
use sha2::Sha256;
use zeroize::Zeroizing;

use crate::error::{GatewayError, Result};

const NONCE_LEN: usize = 12;

/// Encrypt `plaintext` under `key` (any length; hashed down to 32 bytes),
/// returning `base64(nonce || ciphertext)`.
pub fn seal(key: &[u8], plaintext: &[u8]) -> Result<String> {
    let key32 = derive_key(key);
    let cipher = Aes256Gcm::new((&*key32).into());
    let mut nonce_bytes = [0u8; NONCE_LEN];
    rand::rng().fill_bytes(&mut nonce_bytes);
    let nonce = Nonce::from_slice(&nonce_bytes);
    let ciphertext = cipher.encrypt(nonce, plaintext)?;
    let mut out = Vec::with_capacity(NONCE_LEN + ciphertext.len());
    out.extend_from_slice(&nonce_bytes);
    out.extend_from_slice(&ciphertext);
    Ok(BASE64.encode(out))
}

/// Inverse of [`seal`].
pub fn open(key: &[u8], sealed_b64: &str) -> Result<Vec<u8>> {
    let key32 = derive_key(key);
    let raw = BASE64
        .decode(sealed_b64)
        .map_err(|e| GatewayError::Protocol(format!("invalid base64: {e}")))?;
    if raw.len() < NONCE_LEN {
        return Err(GatewayError::Protocol("sealed payload too short".to_string()));
    }
    let (nonce_bytes, ciphertext) = raw.split_at(NONCE_LEN);
    let cipher = Aes256Gcm::new((&*key32).into());
    let nonce = Nonce::from_slice(nonce_bytes);
    Ok(cipher.decrypt(nonce, ciphertext)?)
}

fn derive_key(secret: &[u8]) -> Zeroizing<[u8; 32]> {
    use sha2::Digest;
    let mut hasher = Sha256::new();
    hasher.update(secret);
    let digest = hasher.finalize();
    let mut key = [0u8; 32];
    key.copy_from_slice(&digest);
    Zeroizing::new(key)
}

type HmacSha256 = Hmac<Sha256>;

/// `HMAC_SHA256(data, key)`, hex-encoded, for the `sign` response header.
pub fn hmac_hex(key: &[u8], data: &[u8]) -> Result<String> {
    let mut mac = HmacSha256::new_from_slice(key).map_err(|e| GatewayError::Crypto(e.to_string()))?;
    mac.update(data);
    Ok(hex::encode(mac.finalize().into_bytes()))
}

/// Constant-time verification of a hex `sign` header against `data`.
pub fn verify_hmac_hex(key: &[u8], data: &[u8], sign_hex: &str) -> Result<()> {
    let expected = hmac_hex(key, data)?;
    let a = expected.as_bytes();
    let b = sign_hex.as_bytes();
    if a.len() != b.len() {
        return Err(GatewayError::SignatureInvalid);
    }
    let diff = a.iter().zip(b.iter()).fold(0u8, |acc, (x, y)| acc | (x ^ y));
    if diff == 0 {
        Ok(())
    } else {
        Err(GatewayError::SignatureInvalid)
    }
}

/// Raw X25519 Diffie-Hellman, used directly rather than through the
/// higher-level `StaticSecret`/`EphemeralSecret` wrappers so the server's
/// long-lived keypair can be persisted and reloaded as plain 32-byte
/// scalars. It's the keystore's AES layer that protects these bytes at
/// rest, not this function -- they're never written out unencrypted.
pub fn x25519_public(scalar: &[u8; 32]) -> [u8; 32] {
    x25519_dalek::x25519(*scalar, x25519_dalek::X25519_BASEPOINT_BYTES)
}

pub fn x25519_shared(my_scalar: &[u8; 32], their_public: &[u8; 32]) -> [u8; 32] {
    x25519_dalek::x25519(*my_scalar, *their_public)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seal_open_round_trips() {
        let key = b"a-shared-secret";
        let sealed = seal(key, b"hello world").unwrap();
        let opened = open(key, &sealed).unwrap();
        assert_eq!(opened, b"hello world");
    }

    #[test]
    fn tampered_seal_fails() {
        let key = b"a-shared-secret";
        let mut sealed = seal(key, b"hello world").unwrap();
        sealed.push('A');
        assert!(open(key, &sealed).is_err());
    }

    #[test]
    fn hmac_hex_round_trips() {
        let key = b"sign-key";
        let sig = hmac_hex(key, b"payload").unwrap();
        assert!(verify_hmac_hex(key, b"payload", &sig).is_ok());
        assert!(verify_hmac_hex(key, b"tampered", &sig).is_err());
    }

    #[test]
    fn x25519_agrees_both_directions() {
        let a = [1u8; 32];
        let b = [2u8; 32];
        let pub_a = x25519_public(&a);
        let pub_b = x25519_public(&b);
        assert_eq!(x25519_shared(&a, &pub_b), x25519_shared(&b, &pub_a));
    }
}
