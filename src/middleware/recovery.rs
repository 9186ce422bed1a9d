//! Panic recovery.
//!
//! A panic inside a handler must not take the connection, or the worker
//! thread, down with it. [`recovery`] runs the rest of the chain under
//! `catch_unwind` and, if it unwinds, logs what happened and answers `500`.
//!
//! The stack trace has to be captured at the panic site, before unwinding
//! throws it away, so the first call installs a process-wide panic hook. The
//! hook only records a backtrace while the current thread is inside a
//! recovery scope; every other panic goes to the hook that was there before.

use std::any::Any;
use std::backtrace::Backtrace;
use std::cell::{Cell, RefCell};
use std::panic::{self, AssertUnwindSafe};
use std::sync::Once;

use http::StatusCode;
use tracing::Level;

use crate::context::Context;

/// Longest stack trace kept in a recovery log entry.
const MAX_STACK: usize = 64 << 10;

thread_local! {
    static DEPTH: Cell<usize> = const { Cell::new(0) };
    static STACK: RefCell<Option<String>> = const { RefCell::new(None) };
}

static HOOK: Once = Once::new();

fn install_hook() {
    HOOK.call_once(|| {
        let previous = panic::take_hook();
        panic::set_hook(Box::new(move |info| {
            if DEPTH.with(Cell::get) == 0 {
                previous(info);
                return;
            }
            let mut stack = Backtrace::force_capture().to_string();
            truncate(&mut stack, MAX_STACK);
            STACK.with(|s| *s.borrow_mut() = Some(stack));
        }));
    });
}

/// Recovers from panics in the rest of the chain.
///
/// The panic message, the request line and headers (never the body) and the
/// stack are sent to the configured [`Logger`](crate::Logger) at `ERROR`.
/// Anything the chain already wrote is discarded and the response becomes a
/// bare `500 Internal Server Error`.
pub fn recovery(ctx: &mut Context) {
    install_hook();

    DEPTH.with(|d| d.set(d.get() + 1));
    let result = panic::catch_unwind(AssertUnwindSafe(|| ctx.next()));
    DEPTH.with(|d| d.set(d.get() - 1));

    let Err(payload) = result else { return };
    let stack = STACK.with(|s| s.borrow_mut().take()).unwrap_or_default();
    let message = format!(
        "[Recovery] panic recovered:\n{}{}\n{stack}",
        ctx.request().dump(),
        panic_message(payload.as_ref()),
    );
    ctx.logger().log(Level::ERROR, &message);

    ctx.writer_mut().clear();
    ctx.abort_with_status(StatusCode::INTERNAL_SERVER_ERROR);
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(s) = payload.downcast_ref::<&'static str>() {
        s
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s
    } else {
        "Box<dyn Any>"
    }
}

/// Cuts `s` to at most `max` bytes on a char boundary.
fn truncate(s: &mut String, max: usize) {
    if s.len() <= max {
        return;
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    s.truncate(end);
}
