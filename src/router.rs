//! Route groups.
//!
//! A [`Router`] is a node in a tree of path prefixes. Each node carries the
//! middleware its routes run through: everything inherited from the parent
//! when the group was created, followed by its own. Registering a route
//! freezes the node's current middleware, the route's own middleware and the
//! handler into one chain and hands it to the server's mux.
//!
//! ```rust,no_run
//! use plum::{Context, HandlerFunc, Server, StatusCode};
//!
//! fn auth(ctx: &mut Context) {
//!     if ctx.header("authorization").is_none() {
//!         ctx.abort_with_status(StatusCode::UNAUTHORIZED);
//!     }
//! }
//!
//! let server = Server::default();
//! let api = server.group_with("/api", [HandlerFunc::from(auth)]);
//! api.get("/users/{id}", |ctx: &mut Context| {
//!     let id = ctx.param("id").unwrap_or_default().to_owned();
//!     ctx.string(StatusCode::OK, id);
//! });
//! ```
//!
//! Routers are cheap to clone and snapshot their middleware: calling
//! [`use_middleware`](Router::use_middleware) later never changes routes or
//! groups that already exist.

use std::sync::Arc;

use http::Method;
use tracing::debug;

use crate::handler::{self, Chain, HandlerFunc};
use crate::mux::clean_path;
use crate::server::Engine;

/// A route group: a path prefix plus the middleware its routes run through.
#[derive(Clone)]
pub struct Router {
    scope: String,
    base_path: String,
    engine: Arc<Engine>,
    middleware: Chain,
}

impl Router {
    pub(crate) fn root(engine: Arc<Engine>) -> Self {
        Self {
            scope: String::new(),
            base_path: "/".to_owned(),
            engine,
            middleware: Arc::from(Vec::new()),
        }
    }

    /// Prefix prepended verbatim to every pattern registered here.
    pub fn scope(&self) -> &str { &self.scope }

    /// The group's prefix as a cleaned path.
    pub fn base_path(&self) -> &str { &self.base_path }

    /// A child group under `relative` that inherits this group's middleware.
    pub fn group(&self, relative: &str) -> Router {
        self.group_with(relative, std::iter::empty())
    }

    /// A child group under `relative` whose routes run this group's
    /// middleware, then `middleware` in the order given.
    pub fn group_with(&self, relative: &str, middleware: impl IntoIterator<Item = HandlerFunc>) -> Router {
        Router {
            scope: format!("{}{relative}", self.scope),
            base_path: join_paths(&self.base_path, relative),
            engine: Arc::clone(&self.engine),
            middleware: handler::extend(&self.middleware, middleware),
        }
    }

    /// Appends middleware for routes and groups created from now on.
    pub fn use_middleware(&mut self, middleware: impl IntoIterator<Item = HandlerFunc>) -> &mut Self {
        self.middleware = handler::extend(&self.middleware, middleware);
        self
    }

    /// Registers `handler` for `method` on `path`.
    ///
    /// A `path` ending in `/` matches only itself, not the paths below it.
    ///
    /// # Panics
    ///
    /// Panics if the resulting pattern is malformed or already registered.
    pub fn handle(&self, method: Method, path: &str, handler: impl Into<HandlerFunc>) -> &Self {
        self.handle_with(method, path, std::iter::empty(), handler)
    }

    /// Like [`handle`](Self::handle), with middleware that runs only for this
    /// route, after the group's.
    pub fn handle_with(
        &self,
        method: Method,
        path: &str,
        middleware: impl IntoIterator<Item = HandlerFunc>,
        handler: impl Into<HandlerFunc>,
    ) -> &Self {
        let pattern = format!("{method} {}", self.full_path(path));
        self.register(pattern, middleware, handler.into())
    }

    /// Registers `handler` for every method on `path`.
    pub fn any(&self, path: &str, handler: impl Into<HandlerFunc>) -> &Self {
        self.register(self.full_path(path), std::iter::empty(), handler.into())
    }

    pub fn get(&self, path: &str, handler: impl Into<HandlerFunc>) -> &Self {
        self.handle(Method::GET, path, handler)
    }

    pub fn post(&self, path: &str, handler: impl Into<HandlerFunc>) -> &Self {
        self.handle(Method::POST, path, handler)
    }

    pub fn put(&self, path: &str, handler: impl Into<HandlerFunc>) -> &Self {
        self.handle(Method::PUT, path, handler)
    }

    pub fn patch(&self, path: &str, handler: impl Into<HandlerFunc>) -> &Self {
        self.handle(Method::PATCH, path, handler)
    }

    pub fn delete(&self, path: &str, handler: impl Into<HandlerFunc>) -> &Self {
        self.handle(Method::DELETE, path, handler)
    }

    pub fn head(&self, path: &str, handler: impl Into<HandlerFunc>) -> &Self {
        self.handle(Method::HEAD, path, handler)
    }

    pub fn options(&self, path: &str, handler: impl Into<HandlerFunc>) -> &Self {
        self.handle(Method::OPTIONS, path, handler)
    }

    fn full_path(&self, path: &str) -> String {
        let mut full = format!("{}{path}", self.scope);
        if full.ends_with('/') {
            full.push_str("{$}");
        }
        full
    }

    fn register(&self, pattern: String, middleware: impl IntoIterator<Item = HandlerFunc>, handler: HandlerFunc) -> &Self {
        let local: Vec<HandlerFunc> = middleware.into_iter().chain(std::iter::once(handler)).collect();
        let chain = handler::extend(&self.middleware, local);
        debug!(%pattern, handlers = chain.len(), "route registered");
        self.engine.mux.write().register(&pattern, chain);
        self
    }
}

impl std::fmt::Debug for Router {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Router")
            .field("scope", &self.scope)
            .field("base_path", &self.base_path)
            .field("middleware", &self.middleware.len())
            .finish_non_exhaustive()
    }
}

/// Joins `relative` onto `base` like a filesystem path, keeping a trailing
/// slash that `relative` asks for.
fn join_paths(base: &str, relative: &str) -> String {
    if relative.is_empty() {
        return base.to_owned();
    }
    clean_path(&format!("{base}/{relative}"))
}
