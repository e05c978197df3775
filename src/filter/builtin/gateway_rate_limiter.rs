//! Gateway-wide admission filter, runs early so an over-limit gateway
//! rejects work before spending cycles on auth or business logic.

use std::sync::Arc;

use async_trait::async_trait;

use crate::context::RequestContext;
use crate::error::{GatewayError, Result};
use crate::filter::{Filter, FilterChain};
use crate::metrics::GatewayMetrics;
use crate::ratelimit::{Admission, RateLimiter};

pub struct GatewayRateLimiter {
    limiter: Arc<dyn RateLimiter>,
    metrics: Arc<GatewayMetrics>,
    order: i32,
}

impl GatewayRateLimiter {
    pub fn new(limiter: Arc<dyn RateLimiter>, metrics: Arc<GatewayMetrics>, order: i32) -> Self {
        GatewayRateLimiter { limiter, metrics, order }
    }
}

#[async_trait]
impl Filter for GatewayRateLimiter {
    fn name(&self) -> &str {
        "gateway_rate_limiter"
    }

    fn order(&self) -> i32 {
        self.order
    }

    async fn invoke(&self, ctx: &mut RequestContext, chain: &FilterChain, cursor: usize) -> Result<()> {
        match self.limiter.check("gateway").await {
            Admission::Allowed => chain.next(ctx, cursor).await,
            Admission::Limited => {
                self.metrics.record_rate_limited();
                Err(GatewayError::RateLimited)
            }
        }
    }
}
