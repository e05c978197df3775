//! Caller-scoped rate limiting, runs after the session filter so a
//! resolved `Subject` (when there is one) is available to key the second
//! check on.
//!
//! Two tiers, per §4.5 item 4: a route-keyed check runs for every caller
//! regardless of authentication (so an anonymous flood against one path
//! can't starve other callers of that same path), then -- only once a
//! caller is authenticated -- a subject-keyed check runs on top, so one
//! subject can't exceed its own budget by spreading requests across routes.

use std::sync::Arc;

use async_trait::async_trait;

use crate::context::RequestContext;
use crate::error::{GatewayError, Result};
use crate::filter::{Filter, FilterChain};
use crate::metrics::GatewayMetrics;
use crate::ratelimit::{Admission, RateLimiter};

pub struct UserRateLimiter {
    route_limiter: Arc<dyn RateLimiter>,
    subject_limiter: Arc<dyn RateLimiter>,
    metrics: Arc<GatewayMetrics>,
    order: i32,
}

impl UserRateLimiter {
    pub fn new(
        route_limiter: Arc<dyn RateLimiter>,
        subject_limiter: Arc<dyn RateLimiter>,
        metrics: Arc<GatewayMetrics>,
        order: i32,
    ) -> Self {
        UserRateLimiter { route_limiter, subject_limiter, metrics, order }
    }
}

#[async_trait]
impl Filter for UserRateLimiter {
    fn name(&self) -> &str {
        "user_rate_limiter"
    }

    fn order(&self) -> i32 {
        self.order
    }

    async fn invoke(&self, ctx: &mut RequestContext, chain: &FilterChain, cursor: usize) -> Result<()> {
        let route_key = format!("route:{}", ctx.path);
        if self.route_limiter.check(&route_key).await == Admission::Limited {
            self.metrics.record_rate_limited();
            return Err(GatewayError::RateLimited);
        }

        if let Some(subject) = &ctx.subject {
            let subject_key = format!("subject:{}", subject.as_str());
            if self.subject_limiter.check(&subject_key).await == Admission::Limited {
                self.metrics.record_rate_limited();
                return Err(GatewayError::RateLimited);
            }
        }

        chain.next(ctx, cursor).await
    }
}
