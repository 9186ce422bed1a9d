//! HTTP server, request dispatch and graceful shutdown.
//!
//! # Lifecycle
//!
//! [`Server::run`] (or [`run_tls`](Server::run_tls) /
//! [`run_with_listener`](Server::run_with_listener)) accepts connections
//! until [`Server::shutdown`] is called or, with
//! [`Options::handle_signals`], until the process gets SIGTERM or Ctrl-C.
//! Shutting down:
//! 1. Immediately stops `listener.accept()`; no new connections are made.
//! 2. Asks every open connection to finish its in-flight request and close.
//! 3. Returns from `run` once the last connection is gone.
//!
//! `shutdown` waits for step 3 up to the deadline it is given. Connections
//! still open after that are dropped.
//!
//! # Dispatch
//!
//! Every request, whether it came off the network or through
//! [`Server::serve`], goes through the same steps: sanity checks on the
//! target, mux resolution, body buffering, then the route's handler chain on
//! the blocking thread pool with a pooled [`Context`].

use std::convert::Infallible;
use std::fs::File;
use std::io::BufReader;
use std::net::SocketAddr;
use std::ops::{Deref, DerefMut};
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use http::header::{ALLOW, CONNECTION, HeaderValue, LOCATION};
use http::{Method, StatusCode, Version};
use http_body_util::{BodyExt, Full, LengthLimitError, Limited};
use hyper::body::{Body, Incoming};
use hyper::service::service_fn;
use hyper_util::rt::{TokioExecutor, TokioIo, TokioTimer};
use hyper_util::server::conn::auto::Builder as ConnBuilder;
use parking_lot::{Mutex, RwLock};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, ToSocketAddrs};
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio_rustls::TlsAcceptor;
use tokio_rustls::rustls;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::context::{Context, RequestScope};
use crate::diagnostics;
use crate::error::Error;
use crate::handler::HandlerFunc;
use crate::middleware;
use crate::mux::{Mux, Resolved, clean_path};
use crate::options::Options;
use crate::pool::ContextPool;
use crate::request::Request;
use crate::response::plain;
use crate::router::Router;

type Response = http::Response<Full<Bytes>>;

// ── Engine ────────────────────────────────────────────────────────────────────

/// State shared by the server, every router and every connection task.
pub(crate) struct Engine {
    options: Arc<Options>,
    pool: ContextPool,
    pub(crate) mux: RwLock<Mux>,
}

impl Engine {
    async fn dispatch<B>(&self, req: http::Request<B>, remote_addr: Option<SocketAddr>) -> Response
    where
        B: Body,
        B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        if req.uri().path() == "*" {
            let mut res = Response::new(Full::default());
            *res.status_mut() = StatusCode::BAD_REQUEST;
            if req.version() == Version::HTTP_11 {
                res.headers_mut().insert(CONNECTION, HeaderValue::from_static("close"));
            }
            return res;
        }

        let method = req.method().clone();
        let path = req.uri().path();
        if method != Method::CONNECT {
            let cleaned = clean_path(path);
            if cleaned != path {
                return moved_permanently(cleaned, req.uri().query());
            }
        }

        let resolved = self.mux.read().resolve(&method, path);
        let (chain, params) = match resolved {
            Resolved::Found { chain, params } => (chain, params),
            Resolved::MethodNotAllowed(allowed) => {
                let mut res = plain(StatusCode::METHOD_NOT_ALLOWED, "Method Not Allowed\n");
                let allow = allowed.iter().map(Method::as_str).collect::<Vec<_>>().join(", ");
                if let Ok(value) = HeaderValue::from_str(&allow) {
                    res.headers_mut().insert(ALLOW, value);
                }
                return res;
            }
            Resolved::NotFound => return plain(StatusCode::NOT_FOUND, "404 page not found\n"),
        };

        let (parts, body) = req.into_parts();
        let limit = usize::try_from(self.options.max_body_size).unwrap_or(usize::MAX);
        let body = match Limited::new(body, limit).collect().await {
            Ok(collected) => collected.to_bytes(),
            Err(e) if e.is::<LengthLimitError>() => {
                return plain(StatusCode::PAYLOAD_TOO_LARGE, "request body too large\n");
            }
            Err(e) => {
                debug!("reading request body: {e}");
                return plain(StatusCode::BAD_REQUEST, "malformed request body\n");
            }
        };

        let deadline = self.options.request_deadline;
        let scope = RequestScope::new(deadline.map(|d| Instant::now() + d));
        // Cancels the scope when this future completes or is dropped because
        // the client went away.
        let _cancel = scope.token().clone().drop_guard();
        if let Some(after) = deadline {
            let token = scope.token().clone();
            tokio::spawn(async move {
                tokio::select! {
                    () = tokio::time::sleep(after) => token.cancel(),
                    () = token.cancelled() => {}
                }
            });
        }

        let mut ctx = self.pool.acquire();
        ctx.attach(Arc::new(Request::new(parts, body, remote_addr)), scope);
        ctx.reset();
        ctx.set_chain(chain);
        for p in &params {
            ctx.add_param(p.key.as_str(), p.value.as_str());
        }

        match tokio::task::spawn_blocking(move || run_chain(ctx)).await {
            Ok(ctx) => self.pool.release(ctx).into_response(),
            Err(e) => {
                error!(%method, "handler chain failed: {e}");
                plain(StatusCode::INTERNAL_SERVER_ERROR, "Internal Server Error\n")
            }
        }
    }
}

fn run_chain(mut ctx: Box<Context>) -> Box<Context> {
    ctx.next();
    ctx
}

fn moved_permanently(mut location: String, query: Option<&str>) -> Response {
    if let Some(q) = query {
        location.push('?');
        location.push_str(q);
    }
    let mut res = Response::new(Full::default());
    *res.status_mut() = StatusCode::MOVED_PERMANENTLY;
    if let Ok(value) = HeaderValue::from_str(&location) {
        res.headers_mut().insert(LOCATION, value);
    }
    res
}

// ── ServeConfig ───────────────────────────────────────────────────────────────

/// Per-listener settings for [`Server::run_with_listener`].
#[derive(Clone, Debug, Default)]
pub struct ServeConfig {
    read_header_timeout: Option<Duration>,
    tls: Option<Arc<rustls::ServerConfig>>,
}

impl ServeConfig {
    /// Overrides [`Options::read_header_timeout`] for this listener.
    pub fn read_header_timeout(mut self, timeout: Duration) -> Self {
        self.read_header_timeout = Some(timeout);
        self
    }

    /// Terminates TLS on this listener. Set `alpn_protocols` on the config to
    /// offer HTTP/2.
    pub fn tls(mut self, config: Arc<rustls::ServerConfig>) -> Self {
        self.tls = Some(config);
        self
    }
}

// ── Server ────────────────────────────────────────────────────────────────────

struct Running {
    stop: CancellationToken,
    force: CancellationToken,
    done: watch::Receiver<bool>,
}

/// The HTTP server.
///
/// A `Server` is also the root [`Router`]: routes and groups are registered
/// on it directly.
///
/// ```rust,no_run
/// use plum::{Context, Server, StatusCode};
///
/// #[tokio::main]
/// async fn main() -> Result<(), plum::Error> {
///     let server = Server::default();
///     server.get("/hello", |ctx: &mut Context| ctx.string(StatusCode::OK, "hello"));
///     server.run("0.0.0.0:3000").await
/// }
/// ```
pub struct Server {
    engine: Arc<Engine>,
    root: Router,
    running: Mutex<Option<Running>>,
}

impl Server {
    /// Builds a server. Panic recovery is installed on every route, and the
    /// diagnostic routes are registered unless disabled in `options`.
    pub fn new(options: Options) -> Self {
        let options = Arc::new(options);
        let engine = Arc::new(Engine {
            pool: ContextPool::new(Arc::clone(&options)),
            mux: RwLock::new(Mux::default()),
            options: Arc::clone(&options),
        });

        let mut root = Router::root(Arc::clone(&engine));
        root.use_middleware([HandlerFunc::from(middleware::recovery)]);
        if let Some(prefix) = &options.diagnostics_prefix {
            diagnostics::register(&root.group(prefix));
        }

        Self { engine, root, running: Mutex::new(None) }
    }

    /// Handles one request in-process, exactly as if it had arrived over the
    /// network without a peer address.
    pub async fn serve<B>(&self, req: http::Request<B>) -> Response
    where
        B: Body,
        B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        self.engine.dispatch(req, None).await
    }

    /// Binds `addr` and serves plain HTTP until shut down.
    pub async fn run(&self, addr: impl ToSocketAddrs) -> Result<(), Error> {
        let listener = TcpListener::bind(addr).await?;
        self.run_with_listener(listener, ServeConfig::default()).await
    }

    /// Binds `addr` and serves HTTPS with the PEM certificate chain and
    /// private key at the given paths. HTTP/2 is offered through ALPN.
    pub async fn run_tls(
        &self,
        addr: impl ToSocketAddrs,
        cert_path: impl AsRef<Path>,
        key_path: impl AsRef<Path>,
    ) -> Result<(), Error> {
        let tls = load_tls(cert_path.as_ref(), key_path.as_ref())?;
        let listener = TcpListener::bind(addr).await?;
        self.run_with_listener(listener, ServeConfig::default().tls(tls)).await
    }

    /// Serves on an already-bound listener.
    ///
    /// Returns `Ok(())` after a graceful shutdown, or
    /// [`Error::AlreadyRunning`] if this server is already serving.
    pub async fn run_with_listener(&self, listener: TcpListener, config: ServeConfig) -> Result<(), Error> {
        let addr = listener.local_addr()?;
        let stop = CancellationToken::new();
        let force = CancellationToken::new();
        let (done_tx, done_rx) = watch::channel(false);
        {
            let mut running = self.running.lock();
            if running.is_some() {
                return Err(Error::AlreadyRunning);
            }
            *running = Some(Running { stop: stop.clone(), force: force.clone(), done: done_rx });
        }
        let clear = ClearOnDrop(&self.running);

        if self.engine.options.handle_signals {
            let stop = stop.clone();
            tokio::spawn(async move {
                tokio::select! {
                    () = shutdown_signal() => {
                        info!("shutdown signal received");
                        stop.cancel();
                    }
                    () = stop.cancelled() => {}
                }
            });
        }

        let accept = Accept {
            engine: Arc::clone(&self.engine),
            tls: config.tls.map(TlsAcceptor::from),
            header_timeout: config.read_header_timeout.unwrap_or(self.engine.options.read_header_timeout),
            stop,
            force,
        };
        info!(%addr, tls = accept.tls.is_some(), "plum listening");
        accept.run(listener).await;

        info!(%addr, "plum stopped");
        drop(clear);
        let _ = done_tx.send(true);
        Ok(())
    }

    /// Stops accepting connections and waits up to `deadline` for open ones
    /// to finish.
    ///
    /// Fails with [`Error::NotRunning`] if no `run` is in progress and with
    /// [`Error::ShutdownTimeout`] if connections were still open at the
    /// deadline; those are then dropped.
    pub async fn shutdown(&self, deadline: Duration) -> Result<(), Error> {
        let (stop, force, mut done) = {
            let running = self.running.lock();
            let running = running.as_ref().ok_or(Error::NotRunning)?;
            (running.stop.clone(), running.force.clone(), running.done.clone())
        };

        stop.cancel();
        match tokio::time::timeout(deadline, done.wait_for(|stopped| *stopped)).await {
            Ok(_) => Ok(()),
            Err(_) => {
                force.cancel();
                Err(Error::ShutdownTimeout(deadline))
            }
        }
    }
}

impl Default for Server {
    fn default() -> Self { Self::new(Options::default()) }
}

impl Deref for Server {
    type Target = Router;
    fn deref(&self) -> &Router { &self.root }
}

impl DerefMut for Server {
    fn deref_mut(&mut self) -> &mut Router { &mut self.root }
}

struct ClearOnDrop<'a>(&'a Mutex<Option<Running>>);

impl Drop for ClearOnDrop<'_> {
    fn drop(&mut self) {
        *self.0.lock() = None;
    }
}

// ── Accept loop ───────────────────────────────────────────────────────────────

struct Accept {
    engine: Arc<Engine>,
    tls: Option<TlsAcceptor>,
    header_timeout: Duration,
    stop: CancellationToken,
    force: CancellationToken,
}

impl Accept {
    async fn run(self, listener: TcpListener) {
        // Every connection task lives here so shutdown can wait for, or
        // abort, all of them.
        let mut tasks = JoinSet::new();

        loop {
            tokio::select! {
                // Check shutdown first so a stop request wins over queued
                // connections.
                biased;

                () = self.stop.cancelled() => {
                    info!(in_flight = tasks.len(), "shutting down, draining connections");
                    break;
                }

                res = listener.accept() => {
                    let (stream, remote_addr) = match res {
                        Ok(v) => v,
                        Err(e) => {
                            error!("accept error: {e}");
                            continue;
                        }
                    };

                    let engine = Arc::clone(&self.engine);
                    let tls = self.tls.clone();
                    let stop = self.stop.clone();
                    let header_timeout = self.header_timeout;
                    tasks.spawn(async move {
                        match tls {
                            Some(acceptor) => match acceptor.accept(stream).await {
                                Ok(stream) => {
                                    serve_connection(engine, TokioIo::new(stream), remote_addr, header_timeout, stop).await;
                                }
                                Err(e) => debug!(peer = %remote_addr, "tls handshake failed: {e}"),
                            },
                            None => {
                                serve_connection(engine, TokioIo::new(stream), remote_addr, header_timeout, stop).await;
                            }
                        }
                    });
                }

                // Reap finished tasks so the set does not grow without bound.
                Some(_) = tasks.join_next(), if !tasks.is_empty() => {}
            }
        }
        drop(listener);

        while !tasks.is_empty() {
            tokio::select! {
                biased;
                () = self.force.cancelled() => break,
                _ = tasks.join_next() => {}
            }
        }
        if !tasks.is_empty() {
            warn!(remaining = tasks.len(), "shutdown deadline passed, dropping connections");
            tasks.abort_all();
            while tasks.join_next().await.is_some() {}
        }
    }
}

async fn serve_connection<I>(
    engine: Arc<Engine>,
    io: TokioIo<I>,
    remote_addr: SocketAddr,
    header_timeout: Duration,
    stop: CancellationToken,
) where
    I: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    // Called once per request on the connection.
    let svc = service_fn(move |req: http::Request<Incoming>| {
        let engine = Arc::clone(&engine);
        async move { Ok::<_, Infallible>(engine.dispatch(req, Some(remote_addr)).await) }
    });

    // HTTP/1.1 or HTTP/2, whatever the client speaks.
    let mut builder = ConnBuilder::new(TokioExecutor::new());
    builder.http1().timer(TokioTimer::new()).header_read_timeout(header_timeout);
    builder.http2().timer(TokioTimer::new());

    let conn = builder.serve_connection(io, svc);
    tokio::pin!(conn);

    let result = tokio::select! {
        res = conn.as_mut() => res,
        () = stop.cancelled() => {
            conn.as_mut().graceful_shutdown();
            conn.await
        }
    };
    if let Err(e) = result {
        debug!(peer = %remote_addr, "connection error: {e}");
    }
}

// ── TLS ───────────────────────────────────────────────────────────────────────

fn load_tls(cert_path: &Path, key_path: &Path) -> Result<Arc<rustls::ServerConfig>, Error> {
    let certs = rustls_pemfile::certs(&mut BufReader::new(File::open(cert_path)?))
        .collect::<Result<Vec<_>, _>>()?;
    if certs.is_empty() {
        return Err(Error::Tls(format!("no certificates in {}", cert_path.display())));
    }
    let key = rustls_pemfile::private_key(&mut BufReader::new(File::open(key_path)?))?
        .ok_or_else(|| Error::Tls(format!("no private key in {}", key_path.display())))?;

    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let mut config = rustls::ServerConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()?
        .with_no_client_auth()
        .with_single_cert(certs, key)?;
    config.alpn_protocols = vec![b"h2".to_vec(), b"http/1.1".to_vec()];
    Ok(Arc::new(config))
}

// ── Shutdown signal ───────────────────────────────────────────────────────────

/// Resolves on the first SIGTERM or Ctrl-C. If a handler cannot be
/// installed that signal is ignored.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("cannot listen for Ctrl-C: {e}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let sigterm = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                warn!("cannot listen for SIGTERM: {e}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let sigterm = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c  => {}
        () = sigterm => {}
    }
}
