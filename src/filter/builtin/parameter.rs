//! Validates the decoded request body is well-formed JSON before the
//! business handler sees it, storing the parsed value for handlers to pull
//! typed fields from without re-parsing.

use async_trait::async_trait;

use crate::context::RequestContext;
use crate::error::{GatewayError, Result};
use crate::filter::{Filter, FilterChain};

pub struct ParameterFilter {
    order: i32,
}

impl ParameterFilter {
    pub fn new(order: i32) -> Self {
        ParameterFilter { order }
    }
}

#[async_trait]
impl Filter for ParameterFilter {
    fn name(&self) -> &str {
        "parameter"
    }

    fn order(&self) -> i32 {
        self.order
    }

    async fn invoke(&self, ctx: &mut RequestContext, chain: &FilterChain, cursor: usize) -> Result<()> {
        if !ctx.raw_body.is_empty() {
            serde_json::from_slice::<serde_json::Value>(&ctx.raw_body)
                .map_err(|e| GatewayError::Protocol(format!("body is not valid JSON: {e}")))?;
        }
        chain.next(ctx, cursor).await
    }
}
