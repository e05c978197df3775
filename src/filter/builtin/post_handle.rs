//! Invokes the matched route's business handler, storing its output on the
//! context for the render filter. Sits near the end of the chain, ahead of
//! only the render filter.
//!
//! The handler itself is not owned by this filter: a single `FilterChain`
//! is shared by every route on a transport (§4.4 "the filter array is
//! shared"), so the handler to call is resolved per request by the
//! transport layer (`http::handle_envelope`, `ws::process_message`) from
//! its route lookup and stashed on `ctx.handler` before the chain runs.

use async_trait::async_trait;

use crate::context::RequestContext;
use crate::error::{GatewayError, Result};
use crate::filter::{Filter, FilterChain};

pub struct PostHandleFilter {
    order: i32,
}

impl PostHandleFilter {
    pub fn new(order: i32) -> Self {
        PostHandleFilter { order }
    }
}

#[async_trait]
impl Filter for PostHandleFilter {
    fn name(&self) -> &str {
        "post_handle"
    }

    fn order(&self) -> i32 {
        self.order
    }

    async fn invoke(&self, ctx: &mut RequestContext, chain: &FilterChain, cursor: usize) -> Result<()> {
        let handler = ctx
            .handler
            .clone()
            .ok_or_else(|| GatewayError::NotFound(ctx.path.clone()))?;
        ctx.response_body = handler(ctx)?;
        chain.next(ctx, cursor).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filter::order;
    use std::sync::Arc;

    #[tokio::test]
    async fn dispatches_to_the_context_bound_handler() {
        let chain = FilterChain::build(vec![Arc::new(PostHandleFilter::new(0))]);
        let mut ctx = RequestContext::default();
        ctx.handler = Some(Arc::new(|ctx: &mut RequestContext| Ok(ctx.raw_body.clone())));
        ctx.raw_body = b"hello".to_vec();
        chain.run(&mut ctx).await.unwrap();
        assert_eq!(ctx.response_body, b"hello");
    }

    #[tokio::test]
    async fn missing_handler_is_not_found() {
        let chain = FilterChain::build(vec![Arc::new(PostHandleFilter::new(order::MAX - 1))]);
        let mut ctx = RequestContext::default();
        let err = chain.run(&mut ctx).await.unwrap_err();
        assert!(matches!(err, GatewayError::NotFound(_)));
    }
}
