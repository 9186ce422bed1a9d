//! Built-in middleware.
//!
//! Middleware is an ordinary handler that calls [`Context::next`] to run the
//! rest of the chain:
//!
//! ```rust
//! use plum::{Context, StatusCode};
//!
//! fn require_token(ctx: &mut Context) {
//!     if ctx.header("x-token") != Some("secret") {
//!         ctx.abort_with_status(StatusCode::UNAUTHORIZED);
//!         return;
//!     }
//!     ctx.next();
//! }
//! ```
//!
//! Returning early is not enough to reject a request: a middleware that
//! writes `403` and returns without calling [`Context::abort`] still lets the
//! handler after it run. Stop the chain with `abort` or one of the
//! `abort_with_*` helpers.
//!
//! | middleware | installed | does |
//! |---|---|---|
//! | [`recovery`] | always, outermost | turns a panicking handler into a `500` |
//! | [`trace`] | opt-in | one `tracing` event per request: method, path, status, latency |
//!
//! [`Context::next`]: crate::Context::next
//! [`Context::abort`]: crate::Context::abort

mod recovery;
mod trace;

pub use recovery::recovery;
pub use trace::trace;
