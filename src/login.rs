//! In-process Login handshake keypair (plan=2 bootstrap, §4.5 item 3's
//! `Login` route family).
//!
//! Distinct from [`crate::encipher`]'s out-of-process key custody: the
//! encipher service holds long-term material for a separate sealed-box
//! surface, while this is the gateway's own ephemeral ECDH keypair, used
//! only to derive the per-handshake secret a `Login` route needs to verify
//! and sign its plan=2 envelopes. Generated fresh at process startup and
//! held in memory only -- a restart means every in-flight handshake has to
//! start over, which is the same cost a client already pays for a dropped
//! connection.
//!
//! Grounded on `encipher::crypto`'s raw X25519 helpers, reused directly
//! rather than reimplemented.

use rand::RngCore;
use zeroize::Zeroizing;

use crate::encipher::crypto::{x25519_public, x25519_shared};
use crate::error::{GatewayError, Result};

/// Holds the gateway's long-lived (process-lifetime) X25519 keypair used to
/// derive plan=2 handshake secrets from a client's ephemeral public key.
pub struct LoginHandshake {
    scalar: Zeroizing<[u8; 32]>,
    public: [u8; 32],
}

impl LoginHandshake {
    pub fn generate() -> Self {
        let mut scalar = [0u8; 32];
        rand::rng().fill_bytes(&mut scalar);
        let public = x25519_public(&scalar);
        LoginHandshake {
            scalar: Zeroizing::new(scalar),
            public,
        }
    }

    /// The server's public key, published over `/api/login/pubkey` so a
    /// client can compute the same shared secret on its side.
    pub fn public_key(&self) -> [u8; 32] {
        self.public
    }

    /// Derives the plan=2 handshake secret shared with a caller whose
    /// ephemeral public key is `client_pub`. Both sides land on the same
    /// bytes via X25519 without either ever transmitting a private scalar.
    pub fn derive_secret(&self, client_pub: &[u8; 32]) -> Zeroizing<[u8; 32]> {
        Zeroizing::new(x25519_shared(&self.scalar, client_pub))
    }

    /// Parses a hex-encoded client public key and derives the handshake
    /// secret in one step, the shape both transports need from a header or
    /// query-param value.
    pub fn derive_secret_hex(&self, client_pub_hex: &str) -> Result<Zeroizing<[u8; 32]>> {
        let bytes = hex::decode(client_pub_hex)
            .map_err(|e| GatewayError::Protocol(format!("invalid client public key: {e}")))?;
        let arr: [u8; 32] = bytes
            .try_into()
            .map_err(|_| GatewayError::Protocol("client public key must be 32 bytes".to_string()))?;
        Ok(self.derive_secret(&arr))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_and_server_derive_the_same_secret() {
        let server = LoginHandshake::generate();

        let mut client_scalar = [0u8; 32];
        rand::rng().fill_bytes(&mut client_scalar);
        let client_pub = x25519_public(&client_scalar);

        let server_secret = server.derive_secret(&client_pub);
        let client_secret = x25519_shared(&client_scalar, &server.public_key());
        assert_eq!(server_secret.as_slice(), &client_secret[..]);
    }

    #[test]
    fn derive_secret_hex_round_trips() {
        let server = LoginHandshake::generate();
        let mut client_scalar = [0u8; 32];
        rand::rng().fill_bytes(&mut client_scalar);
        let client_pub = x25519_public(&client_scalar);

        let via_hex = server.derive_secret_hex(&hex::encode(client_pub)).unwrap();
        let direct = server.derive_secret(&client_pub);
        assert_eq!(via_hex.as_slice(), direct.as_slice());
    }

    #[test]
    fn rejects_malformed_client_key() {
        let server = LoginHandshake::generate();
        assert!(server.derive_secret_hex("not-hex").is_err());
        assert!(server.derive_secret_hex("aabb").is_err());
    }
}
