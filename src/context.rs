//! Per-request context and its pool (C3).
//!
//! Grounded on `websocket/connection.rs`'s reuse of scratch buffers per
//! connection and `api/gateway/types.rs`'s `GatewayContext`, generalized
//! into a cursor-driven struct the filter chain walks and a bounded
//! `crossbeam::queue::ArrayQueue` pool so the hot path avoids an allocation
//! per request under load.

use std::collections::HashMap;
use std::sync::Arc;

use crossbeam::queue::ArrayQueue;

use crate::router::{BusinessHandler, RouterConfig};
use crate::subject::{Subject, TokenSecret};

/// Per-request state threaded through the filter chain. Filters read and
/// write `attributes` to pass data to filters later in the chain (e.g. the
/// auth filter stores the resolved `Subject`, the role filter reads it).
pub struct RequestContext {
    /// Correlation id for log lines spanning this request, minted fresh on
    /// each checkout (§6: request tracing, not part of the wire envelope).
    pub request_id: uuid::Uuid,
    pub path: String,
    /// The matched route's config flags, set by the transport layer
    /// alongside `handler` before the chain runs. Filters consult this
    /// instead of a fixed construction-time toggle so one shared chain
    /// enforces each route's own `login`/`guest`/`use_rsa`/`use_hax`
    /// policy (§4.5 item 3).
    pub route_config: RouterConfig,
    pub subject: Option<Subject>,
    /// Per-session secret resolved by the session filter, consumed by the
    /// envelope encode/decode step. Kept off `attributes` since it is
    /// sensitive and zeroised on drop.
    pub token_secret: Option<TokenSecret>,
    /// Plan=2 handshake secret derived from the caller's ephemeral ECDH
    /// public key on `Login` routes, set by the transport layer before the
    /// chain runs. `None` off a `Login` route.
    pub handshake_secret: Option<zeroize::Zeroizing<Vec<u8>>>,
    pub attributes: HashMap<String, String>,
    pub raw_body: Vec<u8>,
    pub response_body: Vec<u8>,
    /// Set by `RenderHandleFilter` once it has rendered either a success or
    /// an error envelope for this request. The transport layer sends this
    /// verbatim instead of building a response itself.
    pub response_envelope: Option<crate::envelope::ResponseEnvelope>,
    /// The matched route's business handler, set by the transport layer
    /// once it resolves which route the request belongs to. `PostHandle`
    /// (§4.5 item 7) invokes this rather than holding its own fixed
    /// handler, so one filter chain correctly dispatches to many routes.
    pub handler: Option<BusinessHandler>,
    /// Set by a filter that wants to stop the chain without failing the
    /// request (e.g. a cache hit that already wrote the response).
    pub short_circuit: bool,
    pub(crate) cursor: usize,
}

impl RequestContext {
    fn reset(&mut self, path: String, raw_body: Vec<u8>) {
        self.request_id = uuid::Uuid::new_v4();
        self.path = path;
        self.route_config = RouterConfig::default();
        self.subject = None;
        self.token_secret = None;
        self.handshake_secret = None;
        self.attributes.clear();
        self.raw_body = raw_body;
        self.response_body.clear();
        self.response_envelope = None;
        self.handler = None;
        self.short_circuit = false;
        self.cursor = 0;
    }

    pub fn attr(&self, key: &str) -> Option<&str> {
        self.attributes.get(key).map(String::as_str)
    }

    pub fn set_attr(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.attributes.insert(key.into(), value.into());
    }
}

impl Default for RequestContext {
    fn default() -> Self {
        RequestContext {
            request_id: uuid::Uuid::new_v4(),
            path: String::new(),
            route_config: RouterConfig::default(),
            subject: None,
            token_secret: None,
            handshake_secret: None,
            attributes: HashMap::new(),
            raw_body: Vec::new(),
            response_body: Vec::new(),
            response_envelope: None,
            handler: None,
            short_circuit: false,
            cursor: 0,
        }
    }
}

/// Bounded pool of `RequestContext`s. Checked out at the start of a request
/// and returned (via `Drop`) once the response is rendered; when the pool is
/// full or empty a fresh context is allocated rather than blocking.
pub struct ContextPool {
    slots: Arc<ArrayQueue<Box<RequestContext>>>,
}

impl ContextPool {
    pub fn new(capacity: usize) -> Self {
        ContextPool {
            slots: Arc::new(ArrayQueue::new(capacity.max(1))),
        }
    }

    pub fn checkout(&self, path: String, raw_body: Vec<u8>) -> PooledContext {
        let mut ctx = self.slots.pop().unwrap_or_default();
        ctx.reset(path, raw_body);
        PooledContext {
            ctx: Some(ctx),
            pool: self.slots.clone(),
        }
    }
}

/// RAII handle returned to the pool on drop.
pub struct PooledContext {
    ctx: Option<Box<RequestContext>>,
    pool: Arc<ArrayQueue<Box<RequestContext>>>,
}

impl std::ops::Deref for PooledContext {
    type Target = RequestContext;
    fn deref(&self) -> &RequestContext {
        self.ctx.as_ref().expect("context taken")
    }
}

impl std::ops::DerefMut for PooledContext {
    fn deref_mut(&mut self) -> &mut RequestContext {
        self.ctx.as_mut().expect("context taken")
    }
}

impl Drop for PooledContext {
    fn drop(&mut self) {
        if let Some(ctx) = self.ctx.take() {
            let _ = self.pool.push(ctx);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn checkout_resets_state() {
        let pool = ContextPool::new(4);
        {
            let mut ctx = pool.checkout("/a".to_string(), vec![1, 2, 3]);
            ctx.set_attr("k", "v");
            ctx.short_circuit = true;
        }
        let ctx = pool.checkout("/b".to_string(), vec![]);
        assert_eq!(ctx.path, "/b");
        assert!(ctx.attr("k").is_none());
        assert!(!ctx.short_circuit);
    }

    #[test]
    fn pool_overflow_allocates_fresh() {
        let pool = ContextPool::new(1);
        let a = pool.checkout("/a".to_string(), vec![]);
        let b = pool.checkout("/b".to_string(), vec![]);
        assert_eq!(a.path, "/a");
        assert_eq!(b.path, "/b");
    }
}
