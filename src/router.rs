//! Router registration and per-route configuration.
//!
//! Grounded on `api/rest/server.rs`'s route-table construction and
//! `api/gateway/core.rs`'s handler registration, generalized from a fixed
//! REST surface to a flag-driven per-route config model.

use std::collections::HashMap;
use std::sync::Arc;

use crate::context::RequestContext;
use crate::error::Result;
use crate::filter::Filter;

/// Match mode for a route's `required_roles` (§4.5 item 4): a caller needs
/// to hold at least one of them (`Any`) or every one of them (`All`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoleMatch {
    Any,
    All,
}

/// Flags controlling how a route's envelope is validated and which
/// middleware runs ahead of the business handler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouterConfig {
    /// Route issues/accepts the plan=2 handshake (login/bootstrap routes).
    pub login: bool,
    /// Route accepts unauthenticated callers (no token secret required).
    pub guest: bool,
    /// Route requires the request body to be AES-GCM (plan=1).
    pub aes_request: bool,
    /// Route encrypts its response body with AES-GCM.
    pub aes_response: bool,
    /// Route accepts RSA-wrapped handshake material instead of ECDH.
    pub use_rsa: bool,
    /// Route participates in the teacher-inherited "HAX" compatibility mode
    /// (accepts legacy unsigned plan=0 bodies from pre-envelope clients).
    pub use_hax: bool,
    /// Roles a caller must hold to reach this route's handler. Empty means
    /// `RoleFilter` lets every authenticated (or guest) caller through.
    pub required_roles: Vec<String>,
    pub role_match: RoleMatch,
}

impl Default for RouterConfig {
    fn default() -> Self {
        RouterConfig {
            login: false,
            guest: false,
            aes_request: false,
            aes_response: false,
            use_rsa: false,
            use_hax: false,
            required_roles: Vec::new(),
            role_match: RoleMatch::Any,
        }
    }
}

pub type BusinessHandler = Arc<dyn Fn(&mut RequestContext) -> Result<Vec<u8>> + Send + Sync>;

/// One registered route: its path, config flags, and business handler.
#[derive(Clone)]
pub struct Route {
    pub path: String,
    pub config: RouterConfig,
    pub handler: BusinessHandler,
}

/// The route table a `Router` resolves incoming requests against. Routes
/// are looked up by exact path -- no path templating.
#[derive(Default)]
pub struct Router {
    routes: HashMap<String, Route>,
    filters: Vec<Arc<dyn Filter>>,
}

impl Router {
    pub fn new() -> Self {
        Router::default()
    }

    /// Register a business handler under `path` with the given config.
    pub fn add(&mut self, path: impl Into<String>, config: RouterConfig, handler: BusinessHandler) {
        let path = path.into();
        self.routes.insert(
            path.clone(),
            Route {
                path,
                config,
                handler,
            },
        );
    }

    /// Register a filter into this router's chain. Duplicate filter names
    /// are rejected by `FilterChain::build`, not here.
    pub fn add_filter(&mut self, filter: Arc<dyn Filter>) {
        self.filters.push(filter);
    }

    pub fn filters(&self) -> &[Arc<dyn Filter>] {
        &self.filters
    }

    pub fn route(&self, path: &str) -> Option<&Route> {
        self.routes.get(path)
    }

    pub fn routes(&self) -> impl Iterator<Item = &Route> {
        self.routes.values()
    }
}
