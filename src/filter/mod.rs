//! Interceptor/filter chain (C4).
//!
//! Grounded on `websocket/connection.rs`'s middleware-style message
//! interceptors and `api/gateway/core.rs`'s handler pipeline, redesigned as
//! a single cursor-driven chain -- the separate interceptor-chain and
//! filter-chain concepts are merged into one pipeline here; see DESIGN.md.

pub mod builtin;

use std::sync::Arc;

use async_trait::async_trait;

use crate::context::RequestContext;
use crate::error::Result;

/// Sort anchors for filters that must run first/last regardless of other
/// registrations (the render filter uses `Order::MAX`).
pub mod order {
    pub const MIN: i32 = i32::MIN;
    pub const MAX: i32 = i32::MAX;
}

/// A single stage in the request pipeline. Filters are sorted by `order()`
/// ascending and invoked in that sequence; a filter calls `chain.next(ctx)`
/// to continue, or returns without calling it to short-circuit.
#[async_trait]
pub trait Filter: Send + Sync {
    /// Stable, unique name used for duplicate detection and diagnostics.
    fn name(&self) -> &str;

    /// Position in the sorted chain; lower runs first.
    fn order(&self) -> i32;

    /// URL pattern this filter applies to; an empty pattern (the default)
    /// matches every path. A trailing `*` matches as a prefix, otherwise the
    /// pattern must equal `ctx.path` exactly.
    fn match_pattern(&self) -> &str {
        ""
    }

    async fn invoke(&self, ctx: &mut RequestContext, chain: &FilterChain, cursor: usize) -> Result<()>;
}

/// Whether `pattern` selects `path`, per `Filter::match_pattern`'s rules.
fn pattern_matches(pattern: &str, path: &str) -> bool {
    if pattern.is_empty() {
        return true;
    }
    match pattern.strip_suffix('*') {
        Some(prefix) => path.starts_with(prefix),
        None => pattern == path,
    }
}

/// Immutable, order-sorted sequence of filters built once per `Router` and
/// shared across requests via `Arc`.
pub struct FilterChain {
    filters: Vec<Arc<dyn Filter>>,
}

impl FilterChain {
    /// Build a chain from an unordered filter set, sorting by `order()` and
    /// panicking on duplicate names since that indicates a misconfigured
    /// router assembled at startup, not a runtime condition to recover from.
    pub fn build(mut filters: Vec<Arc<dyn Filter>>) -> Self {
        filters.sort_by_key(|f| f.order());
        let mut seen = std::collections::HashSet::new();
        for f in &filters {
            if !seen.insert(f.name().to_string()) {
                panic!("duplicate filter name registered: {}", f.name());
            }
        }
        FilterChain { filters }
    }

    pub fn len(&self) -> usize {
        self.filters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.filters.is_empty()
    }

    /// Drive the chain from the start.
    pub async fn run(&self, ctx: &mut RequestContext) -> Result<()> {
        self.next(ctx, 0).await
    }

    /// Invoke the next filter whose `match_pattern` selects `ctx.path`,
    /// skipping past any that don't, or return immediately if the chain is
    /// exhausted. Filters call this (via `chain.next`) to advance.
    pub async fn next(&self, ctx: &mut RequestContext, cursor: usize) -> Result<()> {
        if ctx.short_circuit {
            return Ok(());
        }
        let mut pos = cursor;
        while let Some(filter) = self.filters.get(pos) {
            if pattern_matches(filter.match_pattern(), &ctx.path) {
                return filter.invoke(ctx, self, pos + 1).await;
            }
            pos += 1;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Counting {
        name: &'static str,
        order: i32,
        calls: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl Filter for Counting {
        fn name(&self) -> &str {
            self.name
        }
        fn order(&self) -> i32 {
            self.order
        }
        async fn invoke(&self, ctx: &mut RequestContext, chain: &FilterChain, cursor: usize) -> Result<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            ctx.set_attr("last", self.name);
            chain.next(ctx, cursor).await
        }
    }

    #[tokio::test]
    async fn runs_in_order() {
        let calls = Arc::new(AtomicUsize::new(0));
        let chain = FilterChain::build(vec![
            Arc::new(Counting { name: "b", order: 10, calls: calls.clone() }),
            Arc::new(Counting { name: "a", order: -5, calls: calls.clone() }),
        ]);
        let mut ctx = RequestContext::default();
        chain.run(&mut ctx).await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(ctx.attr("last"), Some("b"));
    }

    #[test]
    #[should_panic(expected = "duplicate filter name")]
    fn rejects_duplicate_names() {
        let calls = Arc::new(AtomicUsize::new(0));
        FilterChain::build(vec![
            Arc::new(Counting { name: "dup", order: 0, calls: calls.clone() }),
            Arc::new(Counting { name: "dup", order: 1, calls }),
        ]);
    }

    #[tokio::test]
    async fn short_circuit_stops_chain() {
        let calls = Arc::new(AtomicUsize::new(0));
        struct Stopper;
        #[async_trait]
        impl Filter for Stopper {
            fn name(&self) -> &str {
                "stopper"
            }
            fn order(&self) -> i32 {
                0
            }
            async fn invoke(&self, ctx: &mut RequestContext, _chain: &FilterChain, _cursor: usize) -> Result<()> {
                ctx.short_circuit = true;
                Ok(())
            }
        }
        let chain = FilterChain::build(vec![
            Arc::new(Stopper),
            Arc::new(Counting { name: "after", order: 1, calls: calls.clone() }),
        ]);
        let mut ctx = RequestContext::default();
        chain.run(&mut ctx).await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }
}
