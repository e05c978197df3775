//! Resolves the caller's `Subject` and session secret from a bearer token.
//! Grounded on `api/gateway/auth.rs`'s JWT-extraction middleware.
//!
//! Per §4.5 item 3: "if router is Login|Guest|UseRSA|UseHAX, skip; else
//! token must be present and verify". The route whose handler a request
//! resolved to is stashed on `ctx.route_config` by the transport layer
//! (`http::handle_envelope` / `ws::process_message`) before the chain
//! runs, so this filter reads the *current request's* route policy rather
//! than a single toggle fixed when the filter was constructed -- the same
//! chain instance is shared by every route.

use async_trait::async_trait;

use crate::context::RequestContext;
use crate::error::{GatewayError, Result};
use crate::filter::{Filter, FilterChain};
use crate::subject::TokenAuthority;

pub struct SessionFilter {
    authority: std::sync::Arc<TokenAuthority>,
    order: i32,
}

impl SessionFilter {
    pub fn new(authority: std::sync::Arc<TokenAuthority>, order: i32) -> Self {
        SessionFilter { authority, order }
    }

    fn skips_auth(cfg: &crate::router::RouterConfig) -> bool {
        cfg.login || cfg.guest || cfg.use_rsa || cfg.use_hax
    }
}

#[async_trait]
impl Filter for SessionFilter {
    fn name(&self) -> &str {
        "session"
    }

    fn order(&self) -> i32 {
        self.order
    }

    async fn invoke(&self, ctx: &mut RequestContext, chain: &FilterChain, cursor: usize) -> Result<()> {
        if Self::skips_auth(&ctx.route_config) {
            return chain.next(ctx, cursor).await;
        }
        match ctx.attr("bearer_token").map(str::to_string) {
            Some(token) => {
                let verified = self.authority.verify(&token)?;
                ctx.subject = Some(verified.subject);
                ctx.token_secret = Some(verified.secret);
                if !verified.roles.is_empty() {
                    ctx.set_attr("roles", verified.roles.join(","));
                }
                chain.next(ctx, cursor).await
            }
            None => Err(GatewayError::Unauthenticated),
        }
    }
}
