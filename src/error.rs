use thiserror::Error;

/// Crate-wide error type. Each variant maps to one of the error categories
/// in the pipeline's error taxonomy (protocol / auth / authorization /
/// admission / timeout / business / render / transport).
#[derive(Error, Debug)]
pub enum GatewayError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("malformed envelope: {0}")]
    Protocol(String),

    #[error("request body too large: {0} bytes (max {1})")]
    BodyTooLarge(usize, usize),

    #[error("signature verify invalid")]
    SignatureInvalid,

    #[error("token invalid or expired")]
    TokenInvalid,

    #[error("authentication required")]
    Unauthenticated,

    /// Role/RBAC mismatch. Per the error taxonomy this is a 401, not a 403:
    /// the spec groups "Authorization — role mismatch" alongside the Auth
    /// category rather than treating it as a distinct forbidden-resource case.
    #[error("authorization denied: {0}")]
    Forbidden(String),

    #[error("rate limit exceeded")]
    RateLimited,

    #[error("replay detected")]
    Replay,

    #[error("request timed out")]
    Timeout,

    #[error("route not found: {0}")]
    NotFound(String),

    #[error("encryption error: {0}")]
    Crypto(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("connection registry full")]
    RegistryFull,

    #[error("connection closed")]
    ConnectionClosed,

    #[error("business error {code}: {message}")]
    Business { code: String, message: String },

    #[error("internal error: {0}")]
    Internal(String),
}

impl From<aes_gcm::Error> for GatewayError {
    fn from(_: aes_gcm::Error) -> Self {
        GatewayError::Crypto("AEAD operation failed".to_string())
    }
}

impl From<rsa::Error> for GatewayError {
    fn from(e: rsa::Error) -> Self {
        GatewayError::Crypto(format!("RSA operation failed: {e}"))
    }
}

impl From<jsonwebtoken::errors::Error> for GatewayError {
    fn from(e: jsonwebtoken::errors::Error) -> Self {
        GatewayError::TokenInvalid.with_source(e)
    }
}

impl GatewayError {
    /// Attach a source error for logging without changing the public variant.
    fn with_source(self, source: impl std::fmt::Display) -> Self {
        tracing::debug!(error = %source, "token validation failed");
        self
    }

    /// HTTP status code for this error, per the error taxonomy.
    pub fn status_code(&self) -> u16 {
        match self {
            GatewayError::Protocol(_) => 400,
            GatewayError::BodyTooLarge(..) => 413,
            GatewayError::SignatureInvalid | GatewayError::TokenInvalid | GatewayError::Unauthenticated | GatewayError::Forbidden(_) => 401,
            GatewayError::Replay => 403,
            GatewayError::RateLimited => 429,
            GatewayError::Timeout => 408,
            GatewayError::NotFound(_) => 404,
            GatewayError::Crypto(_) | GatewayError::Serialization(_) | GatewayError::Internal(_) => 500,
            GatewayError::RegistryFull => 503,
            GatewayError::ConnectionClosed => 499,
            GatewayError::Business { .. } => 400,
        }
    }

    /// WebSocket close code for this error, used by the socket transport.
    pub fn ws_close_code(&self) -> u16 {
        match self {
            GatewayError::SignatureInvalid | GatewayError::TokenInvalid | GatewayError::Unauthenticated | GatewayError::Forbidden(_) => 4401,
            GatewayError::Replay => 4403,
            GatewayError::RateLimited => 4429,
            GatewayError::RegistryFull => 4503,
            _ => 1011, // internal error
        }
    }
}

pub type Result<T> = std::result::Result<T, GatewayError>;
