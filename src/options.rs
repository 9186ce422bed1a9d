//! Construction-time server configuration.
//!
//! ```rust
//! use std::time::Duration;
//! use plum::{Options, Server};
//!
//! let server = Server::new(
//!     Options::default()
//!         .read_header_timeout(Duration::from_secs(10))
//!         .max_multipart_memory(8 << 20)
//!         .without_diagnostics(),
//! );
//! ```

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tracing::Level;

use crate::render::HtmlRender;

/// Default cap on a parsed multipart form (32 MiB).
pub const DEFAULT_MULTIPART_MEMORY: u64 = 32 << 20;

/// Default cap on request bodies buffered before the chain runs (32 MiB).
pub const DEFAULT_MAX_BODY_SIZE: u64 = 32 << 20;

/// Default time allowed for a client to send request headers.
pub const DEFAULT_READ_HEADER_TIMEOUT: Duration = Duration::from_secs(45);

/// Default path prefix for the diagnostic routes.
pub const DEFAULT_DIAGNOSTICS_PREFIX: &str = "/debug/pprof";

const DEFAULT_POOL_CAPACITY: usize = 1024;

// ── Logger ────────────────────────────────────────────────────────────────────

/// Sink for the messages the framework emits on behalf of the application:
/// recovered panics and render failures.
pub trait Logger: Send + Sync + 'static {
    fn log(&self, level: Level, message: &str);
}

/// Forwards every message to `tracing` under the `plum` target.
#[derive(Clone, Copy, Debug, Default)]
pub struct TracingLogger;

impl Logger for TracingLogger {
    fn log(&self, level: Level, message: &str) {
        match level {
            Level::ERROR => tracing::error!(target: "plum", "{message}"),
            Level::WARN  => tracing::warn!(target: "plum", "{message}"),
            Level::INFO  => tracing::info!(target: "plum", "{message}"),
            Level::DEBUG => tracing::debug!(target: "plum", "{message}"),
            _            => tracing::trace!(target: "plum", "{message}"),
        }
    }
}

// ── Options ───────────────────────────────────────────────────────────────────

/// Server settings. Every setting is optional and independent.
#[derive(Clone)]
pub struct Options {
    pub(crate) logger: Arc<dyn Logger>,
    pub(crate) max_multipart_memory: u64,
    pub(crate) max_body_size: u64,
    pub(crate) read_header_timeout: Duration,
    pub(crate) html_render: Option<Arc<dyn HtmlRender>>,
    pub(crate) diagnostics_prefix: Option<String>,
    pub(crate) pool_capacity: usize,
    pub(crate) request_deadline: Option<Duration>,
    pub(crate) handle_signals: bool,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            logger: Arc::new(TracingLogger),
            max_multipart_memory: DEFAULT_MULTIPART_MEMORY,
            max_body_size: DEFAULT_MAX_BODY_SIZE,
            read_header_timeout: DEFAULT_READ_HEADER_TIMEOUT,
            html_render: None,
            diagnostics_prefix: Some(DEFAULT_DIAGNOSTICS_PREFIX.to_owned()),
            pool_capacity: DEFAULT_POOL_CAPACITY,
            request_deadline: None,
            handle_signals: false,
        }
    }
}

impl Options {
    pub fn logger(mut self, logger: impl Logger) -> Self {
        self.logger = Arc::new(logger);
        self
    }

    /// Largest multipart form, in bytes, that
    /// [`Context::multipart_form`](crate::Context::multipart_form) will parse.
    pub fn max_multipart_memory(mut self, bytes: u64) -> Self {
        self.max_multipart_memory = bytes;
        self
    }

    /// Largest request body, in bytes, buffered before the chain runs.
    /// Bigger bodies are answered with `413 Content Too Large`.
    pub fn max_body_size(mut self, bytes: u64) -> Self {
        self.max_body_size = bytes;
        self
    }

    pub fn read_header_timeout(mut self, timeout: Duration) -> Self {
        self.read_header_timeout = timeout;
        self
    }

    /// Template engine used by [`Context::html`](crate::Context::html).
    pub fn html_render(mut self, render: impl HtmlRender + 'static) -> Self {
        self.html_render = Some(Arc::new(render));
        self
    }

    pub fn diagnostics_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.diagnostics_prefix = Some(prefix.into());
        self
    }

    /// Do not register the diagnostic routes.
    pub fn without_diagnostics(mut self) -> Self {
        self.diagnostics_prefix = None;
        self
    }

    /// How many idle contexts the pool keeps around.
    pub fn pool_capacity(mut self, capacity: usize) -> Self {
        self.pool_capacity = capacity.max(1);
        self
    }

    /// Cancels each request's scope this long after it was dispatched.
    /// Handlers observe it through [`Context::scope`](crate::Context::scope);
    /// nothing is interrupted.
    pub fn request_deadline(mut self, deadline: Duration) -> Self {
        self.request_deadline = Some(deadline);
        self
    }

    /// Stop serving gracefully on SIGTERM or Ctrl-C.
    pub fn handle_signals(mut self, enabled: bool) -> Self {
        self.handle_signals = enabled;
        self
    }
}

impl fmt::Debug for Options {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Options")
            .field("max_multipart_memory", &self.max_multipart_memory)
            .field("max_body_size", &self.max_body_size)
            .field("read_header_timeout", &self.read_header_timeout)
            .field("html_render", &self.html_render.is_some())
            .field("diagnostics_prefix", &self.diagnostics_prefix)
            .field("pool_capacity", &self.pool_capacity)
            .field("request_deadline", &self.request_deadline)
            .field("handle_signals", &self.handle_signals)
            .finish_non_exhaustive()
    }
}
