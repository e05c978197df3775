//! Role/RBAC gate. Grounded on `api/gateway/authz.rs`'s role-set matching,
//! narrowed to two modes: match-any and match-all.
//!
//! Reads its required roles from `ctx.route_config` rather than being
//! constructed with a fixed role list, so one instance can sit in the
//! shared production chain and enforce each route's own `required_roles`
//! (§4.5 item 4) instead of needing a per-route filter chain.

use async_trait::async_trait;

use crate::context::RequestContext;
use crate::error::{GatewayError, Result};
use crate::filter::{Filter, FilterChain};
use crate::router::RoleMatch;

pub struct RoleFilter {
    order: i32,
}

impl RoleFilter {
    pub fn new(order: i32) -> Self {
        RoleFilter { order }
    }

    fn satisfied(required: &[String], mode: RoleMatch, held: &[&str]) -> bool {
        match mode {
            RoleMatch::Any => required.iter().any(|r| held.contains(&r.as_str())),
            RoleMatch::All => required.iter().all(|r| held.contains(&r.as_str())),
        }
    }
}

#[async_trait]
impl Filter for RoleFilter {
    fn name(&self) -> &str {
        "role"
    }

    fn order(&self) -> i32 {
        self.order
    }

    async fn invoke(&self, ctx: &mut RequestContext, chain: &FilterChain, cursor: usize) -> Result<()> {
        let required = &ctx.route_config.required_roles;
        if required.is_empty() {
            return chain.next(ctx, cursor).await;
        }
        // Unauthenticated callers have nothing to resolve roles against --
        // Guest routes reach here with no subject, and the Session filter
        // already rejected anything else that lacks one.
        if ctx.subject.is_none() {
            return chain.next(ctx, cursor).await;
        }
        let held: Vec<&str> = ctx.attr("roles").map(|s| s.split(',').collect()).unwrap_or_default();
        if Self::satisfied(required, ctx.route_config.role_match, &held) {
            chain.next(ctx, cursor).await
        } else {
            Err(GatewayError::Forbidden(format!("missing required role(s): {:?}", required)))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filter::FilterChain;
    use crate::router::RouterConfig;
    use std::sync::Arc;

    #[test]
    fn any_mode_needs_one() {
        let required = vec!["admin".to_string(), "ops".to_string()];
        assert!(RoleFilter::satisfied(&required, RoleMatch::Any, &["ops"]));
        assert!(!RoleFilter::satisfied(&required, RoleMatch::Any, &["guest"]));
    }

    #[test]
    fn all_mode_needs_every_role() {
        let required = vec!["admin".to_string(), "ops".to_string()];
        assert!(RoleFilter::satisfied(&required, RoleMatch::All, &["admin", "ops"]));
        assert!(!RoleFilter::satisfied(&required, RoleMatch::All, &["admin"]));
    }

    #[tokio::test]
    async fn unauthenticated_caller_skips_the_check() {
        let chain = FilterChain::build(vec![Arc::new(RoleFilter::new(0))]);
        let mut ctx = RequestContext::default();
        ctx.route_config = RouterConfig { required_roles: vec!["admin".to_string()], ..Default::default() };
        assert!(ctx.subject.is_none());
        chain.run(&mut ctx).await.unwrap();
    }

    #[tokio::test]
    async fn missing_role_is_rejected_as_401() {
        let chain = FilterChain::build(vec![Arc::new(RoleFilter::new(0))]);
        let mut ctx = RequestContext::default();
        ctx.route_config = RouterConfig { required_roles: vec!["admin".to_string()], ..Default::default() };
        ctx.subject = Some(crate::subject::Subject("user-1".to_string()));
        ctx.set_attr("roles", "guest");
        let err = chain.run(&mut ctx).await.unwrap_err();
        assert_eq!(err.status_code(), 401);
    }

    #[tokio::test]
    async fn no_required_roles_lets_everyone_through() {
        let chain = FilterChain::build(vec![Arc::new(RoleFilter::new(0))]);
        let mut ctx = RequestContext::default();
        ctx.subject = Some(crate::subject::Subject("user-1".to_string()));
        chain.run(&mut ctx).await.unwrap();
    }
}
