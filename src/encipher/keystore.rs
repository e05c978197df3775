//! Key custody: the long-term material the encipher service holds so
//! application processes never have to. Grounded on
//! `security_vault/keystore.rs`'s envelope-encrypted persistence (a root
//! key wraps everything written to disk) but narrowed to a flat set of
//! keys -- sign key, AES encrypt key, ECDSA signing key, JWT token key, and
//! an X25519 keypair for the ECDH handshake -- rather than a full MEK/DEK
//! hierarchy built for tablespace-scoped rotation this service doesn't need.

use std::path::Path;

use aes_gcm::aead::Aead;
use aes_gcm::{Aes256Gcm, KeyInit, Nonce};
use hkdf::Hkdf;
use p256::ecdsa::SigningKey;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use zeroize::Zeroizing;

use crate::error::{GatewayError, Result};

/// Material persisted to the encrypted keystore file. Deliberately plain
/// bytes/Vec<u8> -- no `Zeroizing` in the serialized form, since it is only
/// ever written/read as ciphertext; the decrypted copy is wrapped on load.
#[derive(Serialize, Deserialize)]
struct KeystoreFile {
    sign_key: Vec<u8>,
    encrypt_key: Vec<u8>,
    token_key: Vec<u8>,
    standalone_sign_key: Vec<u8>,
    ecdsa_scalar: Vec<u8>,
    x25519_scalar: [u8; 32],
}

/// The keys the encipher service holds on behalf of every application
/// process. Never exposed whole to a client -- only signatures, ciphertext,
/// and derived tokens leave this type.
pub struct EncipherKeystore {
    sign_key: Zeroizing<Vec<u8>>,
    encrypt_key: Zeroizing<Vec<u8>>,
    token_key: Zeroizing<Vec<u8>>,
    standalone_sign_key: Zeroizing<Vec<u8>>,
    ecdsa_signing_key: SigningKey,
    x25519_scalar: [u8; 32],
    x25519_public: [u8; 32],
}

impl EncipherKeystore {
    /// Load the keystore at `path`, generating and persisting a fresh one
    /// if it does not exist yet. The file on disk is always AES-256-GCM
    /// ciphertext keyed by a secret derived from machine-local material
    /// (§4.9 "never writes unencrypted key material to disk").
    pub fn load_or_generate(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if path.exists() {
            Self::load(path)
        } else {
            let keystore = Self::generate()?;
            keystore.persist(path)?;
            Ok(keystore)
        }
    }

    fn generate() -> Result<Self> {
        let mut rng = rand::rng();
        let mut gen_bytes = |n: usize| {
            let mut buf = vec![0u8; n];
            rng.fill_bytes(&mut buf);
            buf
        };
        let ecdsa_scalar_bytes = gen_bytes(32);
        let ecdsa_signing_key = SigningKey::from_slice(&ecdsa_scalar_bytes)
            .map_err(|e| GatewayError::Crypto(format!("invalid ecdsa scalar: {e}")))?;
        let mut x25519_scalar = [0u8; 32];
        rng.fill_bytes(&mut x25519_scalar);
        let x25519_public = crate::encipher::crypto::x25519_public(&x25519_scalar);

        Ok(EncipherKeystore {
            sign_key: Zeroizing::new(gen_bytes(32)),
            encrypt_key: Zeroizing::new(gen_bytes(32)),
            token_key: Zeroizing::new(gen_bytes(32)),
            standalone_sign_key: Zeroizing::new(gen_bytes(32)),
            ecdsa_signing_key,
            x25519_scalar,
            x25519_public,
        })
    }

    fn load(path: &Path) -> Result<Self> {
        let ciphertext = std::fs::read(path)?;
        let local_key = machine_local_key(path);
        let plaintext = decrypt_at_rest(&local_key, &ciphertext)?;
        let file: KeystoreFile = serde_json::from_slice(&plaintext)?;
        let ecdsa_signing_key = SigningKey::from_slice(&file.ecdsa_scalar)
            .map_err(|e| GatewayError::Crypto(format!("invalid ecdsa scalar: {e}")))?;
        let x25519_public = crate::encipher::crypto::x25519_public(&file.x25519_scalar);
        Ok(EncipherKeystore {
            sign_key: Zeroizing::new(file.sign_key),
            encrypt_key: Zeroizing::new(file.encrypt_key),
            token_key: Zeroizing::new(file.token_key),
            standalone_sign_key: Zeroizing::new(file.standalone_sign_key),
            ecdsa_signing_key,
            x25519_scalar: file.x25519_scalar,
            x25519_public,
        })
    }

    fn persist(&self, path: &Path) -> Result<()> {
        let file = KeystoreFile {
            sign_key: self.sign_key.to_vec(),
            encrypt_key: self.encrypt_key.to_vec(),
            token_key: self.token_key.to_vec(),
            standalone_sign_key: self.standalone_sign_key.to_vec(),
            ecdsa_scalar: self.ecdsa_signing_key.to_bytes().to_vec(),
            x25519_scalar: self.x25519_scalar,
        };
        let plaintext = serde_json::to_vec(&file)?;
        let local_key = machine_local_key(path);
        let ciphertext = encrypt_at_rest(&local_key, &plaintext)?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, ciphertext)?;
        Ok(())
    }

    pub fn sign_key(&self) -> &[u8] {
        &self.sign_key
    }

    pub fn encrypt_key(&self) -> &[u8] {
        &self.encrypt_key
    }

    pub fn token_key(&self) -> &[u8] {
        &self.token_key
    }

    pub fn standalone_sign_key(&self) -> &[u8] {
        &self.standalone_sign_key
    }

    pub fn ecdsa_signing_key(&self) -> &SigningKey {
        &self.ecdsa_signing_key
    }

    pub fn x25519_scalar(&self) -> &[u8; 32] {
        &self.x25519_scalar
    }

    pub fn x25519_public(&self) -> &[u8; 32] {
        &self.x25519_public
    }

    /// Derive the session secret's per-token component the same way
    /// `subject::TokenSecret` derivation works:
    /// `HMAC_SHA256(token||local-secret, signKey) || HMAC_SHA512(...)`.
    pub fn derive_token_secret(&self, token: &str) -> Zeroizing<Vec<u8>> {
        use hmac::{Hmac, Mac};
        use sha2::Sha512;
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
        Zeroizing::new(combined)
    }
}

/// Derives a local-only key from machine material (hostname) via HKDF.
/// Not a strong secret on its own -- it only protects the keystore file
/// against being copied to a different host and read there.
fn machine_local_key(path: &Path) -> [u8; 32] {
    let hostname = std::env::var("HOSTNAME")
        .or_else(|_| std::env::var("COMPUTERNAME"))
        .unwrap_or_else(|_| "gatehouse-encipher".to_string());
    let salt = path.to_string_lossy().into_owned();
    let hk = Hkdf::<Sha256>::new(Some(salt.as_bytes()), hostname.as_bytes());
    let mut out = [0u8; 32];
    // `PRK` is always long enough for a single 32-byte expand; the only
    // failure mode is output length, which is fixed here.
    hk.expand(b"gatehouse-encipher-local-key", &mut out)
        .expect("32-byte okm is within HKDF-SHA256's output limit");
    out
}

fn encrypt_at_rest(key: &[u8; 32], plaintext: &[u8]) -> Result<Vec<u8>> {
    let cipher = Aes256Gcm::new(key.into());
    let mut nonce_bytes = [0u8; 12];
    rand::rng().fill_bytes(&mut nonce_bytes);
    let nonce = Nonce::from_slice(&nonce_bytes);
    let ciphertext = cipher.encrypt(nonce, plaintext)?;
    let mut out = Vec::with_capacity(12 + ciphertext.len());
    out.extend_from_slice(&nonce_bytes);
    out.extend_from_slice(&ciphertext);
    Ok(out)
}

fn decrypt_at_rest(key: &[u8; 32], data: &[u8]) -> Result<Vec<u8>> {
    if data.len() < 12 {
        return Err(GatewayError::Protocol("keystore file truncated".to_string()));
    }
    let (nonce_bytes, ciphertext) = data.split_at(12);
    let cipher = Aes256Gcm::new(key.into());
    let nonce = Nonce::from_slice(nonce_bytes);
    Ok(cipher.decrypt(nonce, ciphertext)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn generate_then_persist_then_reload() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("keystore.enc");
        let first = EncipherKeystore::load_or_generate(&path).unwrap();
        let second = EncipherKeystore::load_or_generate(&path).unwrap();
        assert_eq!(first.sign_key(), second.sign_key());
        assert_eq!(first.x25519_public(), second.x25519_public());
    }

    #[test]
    fn token_secret_derivation_is_deterministic() {
        let dir = tempdir().unwrap();
        let keystore = EncipherKeystore::load_or_generate(dir.path().join("keystore.enc")).unwrap();
        let a = keystore.derive_token_secret("token-123");
        let b = keystore.derive_token_secret("token-123");
        assert_eq!(*a, *b);
        let c = keystore.derive_token_secret("token-456");
        assert_ne!(*a, *c);
    }
}
