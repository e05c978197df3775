//! Out-of-process key-custody service (C9, §4.9).
//!
//! A small, separately-deployable `axum` service that holds the long-term
//! sign/encrypt/ECDSA/JWT key material so application processes never have
//! to. Consumed by the `gatehouse-encipher` binary; the main gateway never
//! links against [`keystore`] directly.

pub mod api;
pub mod crypto;
pub mod keystore;
pub mod session;

pub use api::{build_router, EncipherState};
pub use keystore::EncipherKeystore;
pub use session::SessionCache;
