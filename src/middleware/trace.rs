use std::time::Instant;

use http::StatusCode;
use tracing::{info, info_span};

use crate::context::Context;

/// Per-request span with method and path, closed by an `info` event carrying
/// the status and latency.
///
/// ```rust,no_run
/// use plum::{HandlerFunc, Server, middleware};
///
/// let mut server = Server::default();
/// server.use_middleware([HandlerFunc::from(middleware::trace)]);
/// ```
pub fn trace(ctx: &mut Context) {
    let span = info_span!(
        target: "plum::access",
        "request",
        method = %ctx.request().method(),
        path = ctx.request().path(),
    );
    let _entered = span.enter();
    let start = Instant::now();

    ctx.next();

    let status = ctx.writer().status().unwrap_or(StatusCode::OK);
    info!(
        target: "plum::access",
        status = status.as_u16(),
        latency_us = u64::try_from(start.elapsed().as_micros()).unwrap_or(u64::MAX),
        aborted = ctx.is_aborted(),
        "request completed",
    );
}
