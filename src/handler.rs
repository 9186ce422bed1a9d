//! Handler type erasure.
//!
//! # How handlers are stored
//!
//! A route's chain mixes middleware and the final handler, each of a
//! different concrete closure type. Rust collections hold one type, so every
//! handler is erased behind `Arc<dyn Fn(&mut Context)>` and the chain is a
//! shared slice of them:
//!
//! ```text
//! fn hello(ctx: &mut Context) { … }          ← user writes this
//!        ↓ router.get("/", hello)
//! HandlerFunc::from(hello)                    ← From<F> blanket impl
//!        ↓
//! Arc<[recovery, auth, hello]>                ← Chain, built once per route
//!        ↓ stored in the mux
//! ctx.next()  at request time                 ← walks the chain by index
//! ```
//!
//! Middleware is just a handler that calls [`Context::next`] somewhere in its
//! body. Code before the call runs on the way in, code after it on the way
//! out. A handler that returns without calling `next` does not stop the
//! chain: the next handler starts as soon as it returns. Only
//! [`Context::abort`] (or one of the `abort_with_*` helpers) keeps later
//! handlers from running.

use std::fmt;
use std::sync::Arc;

use crate::context::Context;

/// A type-erased, shareable handler or middleware.
///
/// Any `Fn(&mut Context) + Send + Sync + 'static` converts into one with
/// `.into()`, so lists of middleware can be written as
/// `[HandlerFunc::from(auth), logger.into()]`.
#[derive(Clone)]
pub struct HandlerFunc(Arc<dyn Fn(&mut Context) + Send + Sync + 'static>);

impl HandlerFunc {
    pub fn new<F>(f: F) -> Self
    where
        F: Fn(&mut Context) + Send + Sync + 'static,
    {
        Self(Arc::new(f))
    }

    pub(crate) fn call(&self, ctx: &mut Context) {
        (self.0)(ctx)
    }
}

impl<F> From<F> for HandlerFunc
where
    F: Fn(&mut Context) + Send + Sync + 'static,
{
    fn from(f: F) -> Self {
        Self::new(f)
    }
}

impl fmt::Debug for HandlerFunc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("HandlerFunc")
    }
}

/// An immutable, shared handler sequence in execution order.
///
/// Routers and routes each hold their own `Chain`; extending one always
/// allocates a new slice, so nothing that already holds a chain ever sees
/// later additions.
pub(crate) type Chain = Arc<[HandlerFunc]>;

/// `base` followed by `extra`, as a new chain.
pub(crate) fn extend(base: &[HandlerFunc], extra: impl IntoIterator<Item = HandlerFunc>) -> Chain {
    base.iter().cloned().chain(extra).collect()
}
