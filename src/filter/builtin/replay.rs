//! Replay filter: rejects a request whose envelope nonce has already been
//! seen within the replay window. Off by default (`GatewayConfig::enable_replay_filter`)
//! since it requires a shared `KvStore` to be meaningful across more than
//! one gateway instance; see DESIGN.md.

use std::sync::Arc;

use async_trait::async_trait;

use crate::cache::KvStore;
use crate::context::RequestContext;
use crate::error::{GatewayError, Result};
use crate::filter::{Filter, FilterChain};
use crate::metrics::GatewayMetrics;

pub struct ReplayFilter {
    store: Arc<dyn KvStore>,
    window_secs: u64,
    metrics: Arc<GatewayMetrics>,
    order: i32,
}

impl ReplayFilter {
    pub fn new(store: Arc<dyn KvStore>, window_secs: u64, metrics: Arc<GatewayMetrics>, order: i32) -> Self {
        ReplayFilter { store, window_secs, metrics, order }
    }
}

#[async_trait]
impl Filter for ReplayFilter {
    fn name(&self) -> &str {
        "replay"
    }

    fn order(&self) -> i32 {
        self.order
    }

    async fn invoke(&self, ctx: &mut RequestContext, chain: &FilterChain, cursor: usize) -> Result<()> {
        let nonce = ctx.attr("nonce").unwrap_or_default().to_string();
        let key = format!("replay:{nonce}");
        let first_seen = self
            .store
            .set_if_absent(&key, self.window_secs)
            .await
            .map_err(|e| GatewayError::Internal(format!("replay store error: {e}")))?;
        if first_seen {
            chain.next(ctx, cursor).await
        } else {
            self.metrics.record_replay_rejected();
            Err(GatewayError::Replay)
        }
    }
}
