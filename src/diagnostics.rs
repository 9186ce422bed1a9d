//! Runtime diagnostic routes.
//!
//! Registered at construction under [`Options::diagnostics_prefix`]
//! (`/debug/pprof` unless changed or disabled):
//!
//! | path | answer |
//! |---|---|
//! | `/` | index of the routes below |
//! | `/cmdline` | process arguments, NUL-separated |
//! | `/goroutine` | async runtime counters: workers, alive tasks, global queue depth |
//! | `/profile`, `/symbol`, `/trace`, `/allocs`, `/block`, `/heap`, `/mutex`, `/threadcreate` | `501 Not Implemented` |
//!
//! The unimplemented paths are still routed so that profiling tools probing
//! them get a clear answer instead of a `404`.
//!
//! [`Options::diagnostics_prefix`]: crate::Options::diagnostics_prefix

use std::fmt::Write as _;

use http::{Method, StatusCode};

use crate::context::Context;
use crate::response::ContentType;
use crate::router::Router;

const UNSUPPORTED: [&str; 8] = ["allocs", "block", "heap", "mutex", "profile", "symbol", "threadcreate", "trace"];

pub(crate) fn register(router: &Router) {
    let base = router.base_path().trim_end_matches('/').to_owned();
    router.get("/", move |ctx: &mut Context| index(ctx, &base));
    router.get("/cmdline", cmdline);
    router.get("/goroutine", goroutine);
    for name in UNSUPPORTED {
        router.get(&format!("/{name}"), move |ctx: &mut Context| unsupported(ctx, name));
    }
    router.handle(Method::POST, "/symbol", |ctx: &mut Context| unsupported(ctx, "symbol"));
}

fn index(ctx: &mut Context, base: &str) {
    let mut body = String::from("plum runtime diagnostics\n\n");
    let _ = writeln!(body, "{base}/cmdline\tprocess command line");
    let _ = writeln!(body, "{base}/goroutine\tasync runtime task counters");
    for name in UNSUPPORTED {
        let _ = writeln!(body, "{base}/{name}\tnot available");
    }
    ctx.string(StatusCode::OK, body);
}

fn cmdline(ctx: &mut Context) {
    let args: Vec<String> = std::env::args().collect();
    ctx.data(StatusCode::OK, ContentType::Text.as_str(), args.join("\0"));
}

fn goroutine(ctx: &mut Context) {
    let Ok(handle) = tokio::runtime::Handle::try_current() else {
        ctx.string(StatusCode::SERVICE_UNAVAILABLE, "no async runtime\n");
        return;
    };
    let metrics = handle.metrics();
    let mut body = String::new();
    let _ = writeln!(body, "workers: {}", metrics.num_workers());
    let _ = writeln!(body, "alive_tasks: {}", metrics.num_alive_tasks());
    let _ = writeln!(body, "global_queue_depth: {}", metrics.global_queue_depth());
    ctx.string(StatusCode::OK, body);
}

fn unsupported(ctx: &mut Context, name: &str) {
    ctx.string(StatusCode::NOT_IMPLEMENTED, format!("profile {name:?} is not available in this runtime\n"));
}
