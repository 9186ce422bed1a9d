//! # plum
//!
//! A minimal HTTP framework: pooled request contexts, route groups, and
//! middleware chains you can abort.
//!
//! ## The model
//!
//! Every route owns a flat chain of handlers: the middleware of every group
//! it was registered under, its own middleware, then the handler itself. A
//! request borrows a [`Context`] from a pool and walks that chain:
//!
//! - [`Context::next`] runs the rest of the chain and returns when it is done,
//!   so middleware gets code both before and after the handler.
//! - [`Context::abort`] stops handlers further down from starting.
//!
//! Handlers are plain synchronous functions. They run on tokio's blocking
//! thread pool, so blocking I/O inside one only blocks that request.
//!
//! What every server gets out of the box:
//!
//! - Pattern routing: `{name}` segments, `{rest...}` tails, exact-slash
//!   patterns, percent-decoded captures, `405` with `Allow`, clean-path
//!   redirects. Lookup is O(path length) via [`matchit`].
//! - Panic recovery: a panicking handler becomes a logged `500`.
//! - HTTP/1.1 and HTTP/2, optional TLS, graceful [`Server::shutdown`].
//! - Runtime diagnostics under `/debug/pprof`.
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use plum::{Context, HandlerFunc, Server, StatusCode};
//! use serde::{Deserialize, Serialize};
//!
//! #[derive(Deserialize, Serialize)]
//! struct User { id: u64, name: String }
//!
//! #[tokio::main]
//! async fn main() -> Result<(), plum::Error> {
//!     let server = Server::default();
//!
//!     let api = server.group_with("/api", [HandlerFunc::from(plum::middleware::trace)]);
//!     api.get("/users/{id}", get_user);
//!     api.post("/users", create_user);
//!
//!     server.run("0.0.0.0:3000").await
//! }
//!
//! fn get_user(ctx: &mut Context) {
//!     let Ok(id) = ctx.param("id").unwrap_or_default().parse() else {
//!         ctx.abort_with_status(StatusCode::BAD_REQUEST);
//!         return;
//!     };
//!     ctx.json(StatusCode::OK, User { id, name: "alice".into() });
//! }
//!
//! fn create_user(ctx: &mut Context) {
//!     let Ok(user) = ctx.must_bind_with::<User, _>(&plum::binding::Json) else { return };
//!     ctx.set_header("location", &format!("/api/users/{}", user.id));
//!     ctx.json(StatusCode::CREATED, user);
//! }
//! ```

mod context;
mod diagnostics;
mod error;
mod handler;
mod multipart;
mod mux;
mod options;
mod pool;
mod request;
mod response;
mod router;
mod server;

pub mod binding;
pub mod middleware;
pub mod render;

pub use context::{Context, Cookie, Param, Params, RequestScope, SameSite};
pub use error::{BindError, Error, MultipartError, RenderError, ScopeError};
pub use handler::HandlerFunc;
pub use http::{Method, StatusCode};
pub use multipart::{FileHeader, MultipartForm};
pub use options::{
    DEFAULT_DIAGNOSTICS_PREFIX, DEFAULT_MAX_BODY_SIZE, DEFAULT_MULTIPART_MEMORY, DEFAULT_READ_HEADER_TIMEOUT, Logger,
    Options, TracingLogger,
};
pub use request::Request;
pub use response::{ContentType, ResponseWriter};
pub use router::Router;
pub use server::{ServeConfig, Server};
