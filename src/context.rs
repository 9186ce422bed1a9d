//! Per-request context.
//!
//! A [`Context`] carries everything one request needs while its handler
//! chain runs: the buffered [`Request`], the [`ResponseWriter`], path
//! parameters, a key/value bag shared between middleware, and the chain
//! cursor that [`Context::next`] and [`Context::abort`] drive.
//!
//! Contexts are pooled. Once the chain returns the server recycles the
//! context for an unrelated request, so a handler must not hold on to it.
//! Use [`Context::copy`] to hand request data to background work.

use std::any::Any;
use std::collections::HashMap;
use std::fmt::{self, Display, Write as _};
use std::io;
use std::net::IpAddr;
use std::path::Path;
use std::sync::{Arc, LazyLock};
use std::time::Instant;

use bytes::Bytes;
use http::StatusCode;
use http::header::{CONNECTION, CONTENT_TYPE, COOKIE, HeaderValue, SET_COOKIE, UPGRADE};
use parking_lot::RwLock;
use percent_encoding::percent_decode_str;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio_util::sync::CancellationToken;
use tracing::Level;

use crate::binding::{self, Binding, BindingBody, BindingUri, MIME_MULTIPART_POST_FORM, MIME_POST_FORM};
use crate::error::{BindError, MultipartError, ScopeError};
use crate::handler::Chain;
use crate::multipart::{self, FileHeader, MultipartForm};
use crate::mux::clean_path;
use crate::options::{Logger, Options};
use crate::render::{self, Render};
use crate::request::Request;
use crate::response::{ResponseWriter, body_allowed_for_status};

/// Index value meaning "aborted". Larger than any real chain position.
pub(crate) const ABORT_INDEX: isize = isize::MAX >> 1;

type Value = Arc<dyn Any + Send + Sync>;

static DETACHED_REQUEST: LazyLock<Arc<Request>> = LazyLock::new(|| Arc::new(Request::default()));

// ── Params ────────────────────────────────────────────────────────────────────

/// A single path parameter.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct Param {
    pub key: String,
    pub value: String,
}

/// Path parameters in the order they appear in the route pattern.
#[derive(Clone, Debug, Default)]
pub struct Params(Vec<Param>);

impl Params {
    /// Value of the first parameter named `key`.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.iter().find(|p| p.key == key).map(|p| p.value.as_str())
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Param> { self.0.iter() }
    pub fn len(&self) -> usize { self.0.len() }
    pub fn is_empty(&self) -> bool { self.0.is_empty() }

    pub(crate) fn push(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.0.push(Param { key: key.into(), value: value.into() });
    }

    /// Empties the list but keeps its allocation.
    pub(crate) fn clear(&mut self) { self.0.clear() }
}

impl<'a> IntoIterator for &'a Params {
    type Item = &'a Param;
    type IntoIter = std::slice::Iter<'a, Param>;
    fn into_iter(self) -> Self::IntoIter { self.0.iter() }
}

// ── RequestScope ──────────────────────────────────────────────────────────────

/// Read-only view of a request's lifetime: its deadline and whether it is
/// over.
///
/// The scope is cancelled when the request finishes, when the client goes
/// away mid-request, or when the configured request deadline passes. The
/// framework never interrupts a handler; long-running work checks
/// [`is_done`](Self::is_done) or awaits [`done`](Self::done).
#[derive(Clone, Debug)]
pub struct RequestScope {
    token: CancellationToken,
    deadline: Option<Instant>,
}

impl RequestScope {
    pub(crate) fn new(deadline: Option<Instant>) -> Self {
        Self { token: CancellationToken::new(), deadline }
    }

    pub(crate) fn token(&self) -> &CancellationToken { &self.token }

    pub fn deadline(&self) -> Option<Instant> { self.deadline }

    pub fn is_done(&self) -> bool { self.token.is_cancelled() }

    /// Resolves once the scope is cancelled.
    pub async fn done(&self) { self.token.cancelled().await }

    /// `None` while the request is live.
    pub fn err(&self) -> Option<ScopeError> {
        if !self.is_done() {
            return None;
        }
        match self.deadline {
            Some(d) if Instant::now() >= d => Some(ScopeError::DeadlineExceeded),
            _ => Some(ScopeError::Canceled),
        }
    }
}

// ── Cookies ───────────────────────────────────────────────────────────────────

/// The `SameSite` cookie attribute.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SameSite {
    Lax,
    Strict,
    None,
}

/// Attributes for [`Context::set_cookie`]. An empty `path` means `/`.
#[derive(Clone, Debug, Default)]
pub struct Cookie<'a> {
    pub name: &'a str,
    pub value: &'a str,
    /// `> 0` sets `Max-Age`, `< 0` deletes the cookie, `0` leaves it unset.
    pub max_age: i64,
    pub path: &'a str,
    pub domain: &'a str,
    pub secure: bool,
    pub http_only: bool,
}

// ── Context ───────────────────────────────────────────────────────────────────

/// Per-request state passed to every handler in the chain.
pub struct Context {
    request: Arc<Request>,
    writer: ResponseWriter,
    params: Params,
    handlers: Option<Chain>,
    index: isize,

    // `None` until the first write, so an untouched bag costs nothing and is
    // distinguishable from an emptied one.
    keys: RwLock<Option<HashMap<String, Value>>>,

    multipart: Option<Arc<MultipartForm>>,
    same_site: Option<SameSite>,
    scope: RequestScope,
    options: Arc<Options>,
}

impl Context {
    pub(crate) fn new(options: Arc<Options>) -> Self {
        Self {
            request: Arc::clone(&DETACHED_REQUEST),
            writer: ResponseWriter::default(),
            params: Params::default(),
            handlers: None,
            index: -1,
            keys: RwLock::new(None),
            multipart: None,
            same_site: None,
            scope: RequestScope::new(None),
            options,
        }
    }

    /// Points the context at a new request and a fresh response.
    pub(crate) fn attach(&mut self, request: Arc<Request>, scope: RequestScope) {
        self.request = request;
        self.writer = ResponseWriter::default();
        self.scope = scope;
    }

    /// Clears all per-request state.
    pub(crate) fn reset(&mut self) {
        self.params.clear();
        self.handlers = None;
        self.index = -1;
        *self.keys.get_mut() = None;
        self.multipart = None;
        self.same_site = None;
    }

    pub(crate) fn set_chain(&mut self, chain: Chain) {
        self.handlers = Some(chain);
    }

    /// Hands back the response and drops every reference to the request so
    /// an idle pooled context pins nothing.
    pub(crate) fn detach(&mut self) -> ResponseWriter {
        self.request = Arc::clone(&DETACHED_REQUEST);
        self.handlers = None;
        *self.keys.get_mut() = None;
        self.multipart = None;
        std::mem::take(&mut self.writer)
    }

    /// An independent snapshot that can outlive the request.
    ///
    /// The copy shares the request and scope, gets its own clone of the
    /// params and key/value bag, writes to a detached response, and is
    /// already aborted so it cannot run handlers.
    pub fn copy(&self) -> Context {
        let keys = self.keys.read().clone().unwrap_or_default();
        Context {
            request: Arc::clone(&self.request),
            writer: ResponseWriter::default(),
            params: self.params.clone(),
            handlers: None,
            index: ABORT_INDEX,
            keys: RwLock::new(Some(keys)),
            multipart: self.multipart.clone(),
            same_site: self.same_site,
            scope: self.scope.clone(),
            options: Arc::clone(&self.options),
        }
    }

    // ── Flow control ──────────────────────────────────────────────────────────

    /// Runs the rest of the chain. Call it from middleware; code after the
    /// call runs once every later handler has returned.
    pub fn next(&mut self) {
        let Some(chain) = self.handlers.clone() else { return };
        self.index += 1;
        while let Some(handler) = usize::try_from(self.index).ok().and_then(|i| chain.get(i)) {
            handler.call(self);
            self.index += 1;
        }
    }

    /// Prevents the remaining handlers from running. The current handler is
    /// not interrupted.
    pub fn abort(&mut self) {
        self.index = ABORT_INDEX;
    }

    pub fn is_aborted(&self) -> bool {
        self.index >= ABORT_INDEX
    }

    pub fn abort_with_status(&mut self, code: StatusCode) {
        self.status(code);
        self.abort();
    }

    /// Aborts, then writes `value` as a JSON body with `code`.
    pub fn abort_with_status_json(&mut self, code: StatusCode, value: impl Serialize) {
        self.abort();
        self.json(code, value);
    }

    // ── Key/value bag ─────────────────────────────────────────────────────────

    /// Stores a value for the rest of this request.
    pub fn set<T: Any + Send + Sync>(&self, key: impl Into<String>, value: T) {
        self.keys
            .write()
            .get_or_insert_with(HashMap::new)
            .insert(key.into(), Arc::new(value));
    }

    /// A clone of the value stored under `key`, if it has type `T`.
    pub fn get<T: Any + Clone>(&self, key: &str) -> Option<T> {
        self.value(key).and_then(|v| v.downcast_ref::<T>().cloned())
    }

    /// Untyped lookup by string key.
    pub fn value(&self, key: &str) -> Option<Value> {
        self.keys.read().as_ref().and_then(|m| m.get(key)).cloned()
    }

    /// Stored key names, or `None` if nothing was ever stored.
    pub fn keys(&self) -> Option<Vec<String>> {
        self.keys.read().as_ref().map(|m| m.keys().cloned().collect())
    }

    // ── Input ─────────────────────────────────────────────────────────────────

    pub fn request(&self) -> &Request { &self.request }
    pub fn params(&self) -> &Params { &self.params }

    /// A path parameter. For `/users/{id}`, `ctx.param("id")` on `/users/42`
    /// is `Some("42")`.
    pub fn param(&self, key: &str) -> Option<&str> {
        self.params.get(key)
    }

    /// Appends a path parameter, mostly for tests that drive handlers directly.
    pub fn add_param(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.params.push(key, value);
    }

    pub fn query(&self, key: &str) -> Option<String> {
        first(&self.query_pairs(), key)
    }

    pub fn default_query(&self, key: &str, default: &str) -> String {
        self.query(key).unwrap_or_else(|| default.to_owned())
    }

    pub fn query_array(&self, key: &str) -> Vec<String> {
        all(&self.query_pairs(), key)
    }

    /// Collects `key[name]=value` query entries into `{name: value}`.
    pub fn query_map(&self, key: &str) -> Option<HashMap<String, String>> {
        bracket_map(&self.query_pairs(), key)
    }

    /// First value of an `application/x-www-form-urlencoded` body field.
    pub fn post_form(&self, key: &str) -> Option<String> {
        first(&self.form_pairs(), key)
    }

    pub fn post_form_map(&self, key: &str) -> Option<HashMap<String, String>> {
        bracket_map(&self.form_pairs(), key)
    }

    /// The parsed `multipart/form-data` body. Parsed on first use, at most
    /// [`Options::max_multipart_memory`](crate::Options::max_multipart_memory)
    /// bytes, then cached for the rest of the request.
    pub fn multipart_form(&mut self) -> Result<Arc<MultipartForm>, MultipartError> {
        if let Some(form) = &self.multipart {
            return Ok(Arc::clone(form));
        }
        if self.content_type() != MIME_MULTIPART_POST_FORM {
            return Err(MultipartError::NotMultipart);
        }
        let raw = self.request.header(CONTENT_TYPE.as_str()).unwrap_or("");
        let form = multipart::parse(raw, self.request.body().clone(), self.options.max_multipart_memory)?;
        let form = Arc::new(form);
        self.multipart = Some(Arc::clone(&form));
        Ok(form)
    }

    /// The first file uploaded under `name`.
    pub fn form_file(&mut self, name: &str) -> Result<FileHeader, MultipartError> {
        let form = self.multipart_form()?;
        form.file(name).cloned().ok_or_else(|| MultipartError::MissingFile(name.to_owned()))
    }

    /// Writes an uploaded file to `dst`, creating parent directories.
    pub fn save_uploaded_file(&self, file: &FileHeader, dst: impl AsRef<Path>) -> Result<(), MultipartError> {
        file.save(dst.as_ref())?;
        Ok(())
    }

    fn query_pairs(&self) -> Vec<(String, String)> {
        parse_pairs(self.request.query_string().as_bytes())
    }

    fn form_pairs(&self) -> Vec<(String, String)> {
        if self.content_type() != MIME_POST_FORM {
            return Vec::new();
        }
        parse_pairs(self.request.body())
    }

    /// A request header.
    pub fn header(&self, key: &str) -> Option<&str> {
        self.request.header(key)
    }

    /// The request's media type with parameters such as `charset` removed.
    pub fn content_type(&self) -> &str {
        let raw = self.request.header(CONTENT_TYPE.as_str()).unwrap_or("");
        raw.split([' ', ';']).next().unwrap_or("")
    }

    /// Whether the client is asking for a websocket upgrade.
    pub fn is_websocket(&self) -> bool {
        let connection = self.request.header(CONNECTION.as_str()).unwrap_or("");
        let upgrade = self.request.header(UPGRADE.as_str()).unwrap_or("");
        connection.to_ascii_lowercase().contains("upgrade") && upgrade.eq_ignore_ascii_case("websocket")
    }

    /// Peer IP address, without the port.
    pub fn remote_ip(&self) -> Option<IpAddr> {
        self.request.remote_addr().map(|a| a.ip())
    }

    /// The buffered request body.
    pub fn get_raw_data(&self) -> Bytes {
        self.request.body().clone()
    }

    /// A request cookie, percent-decoded.
    pub fn cookie(&self, name: &str) -> Option<String> {
        self.request
            .headers()
            .get_all(COOKIE)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .flat_map(|v| v.split(';'))
            .filter_map(|pair| pair.trim().split_once('='))
            .find(|(k, _)| *k == name)
            .map(|(_, v)| unescape(v.trim_matches('"')))
    }

    // ── Binding ───────────────────────────────────────────────────────────────

    pub fn should_bind_with<T, B>(&self, binding: &B) -> Result<T, BindError>
    where
        T: DeserializeOwned,
        B: Binding,
    {
        binding.bind(&self.request)
    }

    /// Like [`should_bind_with`](Self::should_bind_with), but on failure also
    /// aborts with `400` and a `{"error": …}` body.
    pub fn must_bind_with<T, B>(&mut self, binding: &B) -> Result<T, BindError>
    where
        T: DeserializeOwned,
        B: Binding,
    {
        self.should_bind_with(binding).inspect_err(|e| {
            self.abort_with_status_json(
                StatusCode::BAD_REQUEST,
                serde_json::json!({ "error": e.to_string() }),
            );
        })
    }

    pub fn should_bind_json<T: DeserializeOwned>(&self) -> Result<T, BindError> {
        self.should_bind_with(&binding::Json)
    }

    pub fn should_bind_uri<T: DeserializeOwned>(&self) -> Result<T, BindError> {
        binding::Uri.bind_uri(&self.params)
    }

    /// Binds from the raw body cached in the key/value bag under `body_key`,
    /// caching it there first if needed, so several bindings can decode the
    /// same body.
    pub fn should_bind_body_with<T, B>(&self, body_key: &str, binding: &B) -> Result<T, BindError>
    where
        T: DeserializeOwned,
        B: BindingBody,
    {
        let body = match self.get::<Bytes>(body_key) {
            Some(body) => body,
            None => {
                let body = self.get_raw_data();
                self.set(body_key, body.clone());
                body
            }
        };
        binding.bind_body(&body)
    }

    // ── Output ────────────────────────────────────────────────────────────────

    pub fn writer(&self) -> &ResponseWriter { &self.writer }
    pub fn writer_mut(&mut self) -> &mut ResponseWriter { &mut self.writer }
    pub fn logger(&self) -> &dyn Logger { self.options.logger.as_ref() }
    pub fn scope(&self) -> &RequestScope { &self.scope }

    pub fn status(&mut self, code: StatusCode) {
        self.writer.write_header(code);
    }

    /// Sets a response header; an empty value removes it.
    pub fn set_header(&mut self, key: &str, value: &str) {
        self.writer.set_header(key, value);
    }

    pub fn set_same_site(&mut self, same_site: SameSite) {
        self.same_site = Some(same_site);
    }

    /// Adds a `set-cookie` header. Cookies with invalid names are dropped.
    pub fn set_cookie(&mut self, cookie: Cookie<'_>) {
        if !is_token(cookie.name) {
            return;
        }
        let mut line = format!("{}={}", cookie.name, escape(cookie.value));
        let path = if cookie.path.is_empty() { "/" } else { cookie.path };
        let _ = write!(line, "; Path={path}");
        if !cookie.domain.is_empty() {
            let _ = write!(line, "; Domain={}", cookie.domain);
        }
        match cookie.max_age {
            age if age > 0 => { let _ = write!(line, "; Max-Age={age}"); }
            age if age < 0 => line.push_str("; Max-Age=0"),
            _ => {}
        }
        if cookie.http_only {
            line.push_str("; HttpOnly");
        }
        if cookie.secure {
            line.push_str("; Secure");
        }
        match self.same_site {
            Some(SameSite::Lax) => line.push_str("; SameSite=Lax"),
            Some(SameSite::Strict) => line.push_str("; SameSite=Strict"),
            Some(SameSite::None) => line.push_str("; SameSite=None"),
            None => {}
        }
        if let Ok(value) = HeaderValue::from_str(&line) {
            self.writer.headers_mut().append(SET_COOKIE, value);
        }
    }

    /// Writes `code` and renders `r` as the body. Render failures are logged
    /// and abort the chain.
    pub fn render(&mut self, code: StatusCode, r: impl Render) {
        self.render_dyn(Some(code), &r);
    }

    fn render_dyn(&mut self, code: Option<StatusCode>, r: &dyn Render) {
        if let Some(code) = code {
            self.status(code);
            if !body_allowed_for_status(code) {
                r.write_content_type(&mut self.writer);
                return;
            }
        }
        if let Err(e) = r.render(&mut self.writer) {
            self.options.logger.log(Level::ERROR, &format!("render error: {e}"));
            self.abort();
        }
    }

    pub fn json(&mut self, code: StatusCode, value: impl Serialize) {
        self.render(code, render::Json(value));
    }

    /// JSON, wrapped in the `?callback=` function when one is given.
    pub fn jsonp(&mut self, code: StatusCode, value: impl Serialize) {
        match self.query("callback").filter(|c| !c.is_empty()) {
            Some(callback) => self.render(code, render::Jsonp { callback, data: value }),
            None => self.render(code, render::Json(value)),
        }
    }

    pub fn string(&mut self, code: StatusCode, value: impl Display) {
        self.render(code, render::Text(value.to_string()));
    }

    pub fn redirect(&mut self, code: StatusCode, location: &str) {
        let r = render::Redirect {
            code,
            location: location.to_owned(),
            method: self.request.method().clone(),
        };
        self.render_dyn(None, &r);
    }

    pub fn data(&mut self, code: StatusCode, content_type: &str, data: impl Into<Bytes>) {
        self.render(code, render::Data { content_type: content_type.to_owned(), data: data.into() });
    }

    /// Serves the file at `path`, typed by its extension. A directory serves
    /// its `index.html`. Missing files answer `404`, unreadable ones `403`.
    pub fn file(&mut self, path: impl AsRef<Path>) {
        match render::File::load(path.as_ref()) {
            Ok(file) => self.render(StatusCode::OK, file),
            Err(e) => self.file_error(&e),
        }
    }

    /// Serves `path` from under `root`. The path is cleaned as if it were
    /// rooted at `/` first, so `..` can never climb out of `root`.
    pub fn file_from_fs(&mut self, path: &str, root: impl AsRef<Path>) {
        let cleaned = clean_path(&format!("/{path}"));
        self.file(root.as_ref().join(cleaned.trim_start_matches('/')));
    }

    fn file_error(&mut self, e: &io::Error) {
        let (code, body) = match e.kind() {
            io::ErrorKind::NotFound => (StatusCode::NOT_FOUND, "404 page not found\n"),
            io::ErrorKind::PermissionDenied => (StatusCode::FORBIDDEN, "403 Forbidden\n"),
            _ => {
                self.options.logger.log(Level::ERROR, &format!("serving file: {e}"));
                (StatusCode::INTERNAL_SERVER_ERROR, "500 Internal Server Error\n")
            }
        };
        self.string(code, body);
    }

    /// Renders template `name` with the configured
    /// [`HtmlRender`](crate::render::HtmlRender).
    pub fn html(&mut self, code: StatusCode, name: &str, data: impl Serialize) {
        let Some(engine) = self.options.html_render.clone() else {
            self.options.logger.log(Level::ERROR, "html render requested but no template engine is configured");
            self.abort_with_status(StatusCode::INTERNAL_SERVER_ERROR);
            return;
        };
        match serde_json::to_value(data) {
            Ok(data) => {
                let instance = engine.instance(name, data);
                self.render_dyn(Some(code), instance.as_ref());
            }
            Err(e) => {
                self.options.logger.log(Level::ERROR, &format!("render error: {e}"));
                self.abort();
            }
        }
    }
}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Context")
            .field("method", self.request.method())
            .field("path", &self.request.path())
            .field("params", &self.params)
            .field("index", &self.index)
            .finish_non_exhaustive()
    }
}

// ── Helpers ───────────────────────────────────────────────────────────────────

fn parse_pairs(input: &[u8]) -> Vec<(String, String)> {
    url::form_urlencoded::parse(input).into_owned().collect()
}

fn first(pairs: &[(String, String)], key: &str) -> Option<String> {
    pairs.iter().find(|(k, _)| k == key).map(|(_, v)| v.clone())
}

fn all(pairs: &[(String, String)], key: &str) -> Vec<String> {
    pairs.iter().filter(|(k, _)| k == key).map(|(_, v)| v.clone()).collect()
}

fn bracket_map(pairs: &[(String, String)], key: &str) -> Option<HashMap<String, String>> {
    let mut map = HashMap::new();
    for (k, v) in pairs {
        let Some(open) = k.find('[') else { continue };
        if open == 0 || &k[..open] != key {
            continue;
        }
        let rest = &k[open + 1..];
        if let Some(close) = rest.find(']').filter(|&c| c > 0) {
            map.entry(rest[..close].to_owned()).or_insert_with(|| v.clone());
        }
    }
    (!map.is_empty()).then_some(map)
}

fn is_token(name: &str) -> bool {
    !name.is_empty()
        && name
            .bytes()
            .all(|b| b.is_ascii_graphic() && !b"()<>@,;:\\\"/[]?={}".contains(&b))
}

fn escape(value: &str) -> String {
    url::form_urlencoded::byte_serialize(value.as_bytes()).collect()
}

fn unescape(value: &str) -> String {
    percent_decode_str(&value.replace('+', " ")).decode_utf8_lossy().into_owned()
}

#[cfg(test)]
pub(crate) mod tests {
    use std::sync::Mutex;

    use super::*;
    use crate::handler::HandlerFunc;

    pub(crate) fn context_for(builder: http::request::Builder, body: &'static [u8]) -> Context {
        let (parts, ()) = builder.body(()).unwrap().into_parts();
        let mut ctx = Context::new(Arc::new(Options::default()));
        ctx.attach(Arc::new(Request::new(parts, Bytes::from_static(body), None)), RequestScope::new(None));
        ctx.reset();
        ctx
    }

    type Trace = Arc<Mutex<Vec<String>>>;

    fn step(trace: &Trace, name: &'static str) -> HandlerFunc {
        let trace = Arc::clone(trace);
        HandlerFunc::from(move |ctx: &mut Context| {
            trace.lock().unwrap().push(format!("{name}:in"));
            ctx.next();
            trace.lock().unwrap().push(format!("{name}:out"));
        })
    }

    #[test]
    fn next_runs_chain_in_order_and_unwinds() {
        let trace = Trace::default();
        let t = Arc::clone(&trace);
        let handler = HandlerFunc::from(move |_: &mut Context| t.lock().unwrap().push("handler".into()));

        let mut ctx = context_for(http::Request::builder(), b"");
        ctx.set_chain(Arc::from(vec![step(&trace, "a"), step(&trace, "b"), handler]));
        ctx.next();

        assert_eq!(*trace.lock().unwrap(), ["a:in", "b:in", "handler", "b:out", "a:out"]);
    }

    #[test]
    fn handlers_that_never_call_next_still_advance() {
        let trace = Trace::default();
        let (t1, t2) = (Arc::clone(&trace), Arc::clone(&trace));
        let mut ctx = context_for(http::Request::builder(), b"");
        ctx.set_chain(Arc::from(vec![
            HandlerFunc::from(move |_: &mut Context| t1.lock().unwrap().push("first".into())),
            HandlerFunc::from(move |_: &mut Context| t2.lock().unwrap().push("second".into())),
        ]));
        ctx.next();
        assert_eq!(*trace.lock().unwrap(), ["first", "second"]);
    }

    #[test]
    fn abort_stops_later_handlers_but_not_the_current_one() {
        let trace = Trace::default();
        let t = Arc::clone(&trace);
        let gate = HandlerFunc::from(move |ctx: &mut Context| {
            ctx.abort_with_status(StatusCode::UNAUTHORIZED);
            t.lock().unwrap().push("gate:after-abort".into());
            ctx.next();
            t.lock().unwrap().push("gate:after-next".into());
        });
        let t = Arc::clone(&trace);
        let handler = HandlerFunc::from(move |_: &mut Context| t.lock().unwrap().push("handler".into()));

        let mut ctx = context_for(http::Request::builder(), b"");
        ctx.set_chain(Arc::from(vec![step(&trace, "outer"), gate, handler]));
        ctx.next();

        assert!(ctx.is_aborted());
        assert_eq!(ctx.writer().status(), Some(StatusCode::UNAUTHORIZED));
        assert!(ctx.writer().body().is_empty());
        assert_eq!(
            *trace.lock().unwrap(),
            ["outer:in", "gate:after-abort", "gate:after-next", "outer:out"],
        );
    }

    #[test]
    fn index_starts_before_the_chain() {
        let ctx = context_for(http::Request::builder(), b"");
        assert_eq!(ctx.index, -1);
        assert!(!ctx.is_aborted());
    }

    #[test]
    fn key_bag_is_lazy_and_reset_clears_it() {
        let mut ctx = context_for(http::Request::builder(), b"");
        assert_eq!(ctx.keys(), None);
        ctx.set("user", "alice".to_owned());
        assert_eq!(ctx.get::<String>("user").as_deref(), Some("alice"));
        assert_eq!(ctx.get::<u32>("user"), None);

        ctx.add_param("id", "1");
        ctx.set_same_site(SameSite::Strict);
        ctx.abort();
        ctx.reset();

        assert_eq!(ctx.keys(), None);
        assert!(ctx.params().is_empty());
        assert_eq!(ctx.index, -1);
        assert_eq!(ctx.same_site, None);
    }

    #[test]
    fn copy_is_independent_and_aborted() {
        let mut ctx = context_for(http::Request::builder().uri("/x"), b"");
        ctx.add_param("id", "7");
        ctx.set("k", 1_u32);

        let copy = ctx.copy();
        assert!(copy.is_aborted());
        assert_eq!(copy.param("id"), Some("7"));
        assert_eq!(copy.request().path(), "/x");

        copy.set("k", 2_u32);
        copy.set("only-copy", true);
        assert_eq!(ctx.get::<u32>("k"), Some(1));
        assert_eq!(ctx.get::<bool>("only-copy"), None);

        ctx.reset();
        assert_eq!(copy.get::<u32>("k"), Some(2));
        assert_eq!(copy.param("id"), Some("7"));
    }

    #[test]
    fn copy_of_untouched_bag_is_initialised() {
        let ctx = context_for(http::Request::builder(), b"");
        assert_eq!(ctx.copy().keys(), Some(vec![]));
    }

    #[test]
    fn query_helpers() {
        let ctx = context_for(
            http::Request::builder().uri("/s?q=rust&tag=a&tag=b&ids[x]=1&ids[y]=2&empty="),
            b"",
        );
        assert_eq!(ctx.query("q").as_deref(), Some("rust"));
        assert_eq!(ctx.query("empty").as_deref(), Some(""));
        assert_eq!(ctx.query("nope"), None);
        assert_eq!(ctx.default_query("nope", "dflt"), "dflt");
        assert_eq!(ctx.query_array("tag"), ["a", "b"]);

        let ids = ctx.query_map("ids").unwrap();
        assert_eq!(ids.get("x").map(String::as_str), Some("1"));
        assert_eq!(ids.get("y").map(String::as_str), Some("2"));
        assert!(ctx.query_map("tag").is_none());
    }

    #[test]
    fn post_form_reads_urlencoded_bodies_only() {
        let ctx = context_for(
            http::Request::builder()
                .method("POST")
                .header("content-type", "application/x-www-form-urlencoded; charset=utf-8"),
            b"name=bob+smith&meta[role]=admin",
        );
        assert_eq!(ctx.content_type(), "application/x-www-form-urlencoded");
        assert_eq!(ctx.post_form("name").as_deref(), Some("bob smith"));
        assert_eq!(ctx.post_form_map("meta").unwrap()["role"], "admin");

        let json = context_for(
            http::Request::builder().header("content-type", "application/json"),
            b"name=x",
        );
        assert_eq!(json.post_form("name"), None);
    }

    #[test]
    fn websocket_detection() {
        let ctx = context_for(
            http::Request::builder()
                .header("connection", "keep-alive, Upgrade")
                .header("upgrade", "WebSocket"),
            b"",
        );
        assert!(ctx.is_websocket());
        assert!(!context_for(http::Request::builder(), b"").is_websocket());
    }

    #[test]
    fn cookies_round_trip_through_escaping() {
        let mut ctx = context_for(
            http::Request::builder().header("cookie", "a=1; session=hello+world%21"),
            b"",
        );
        assert_eq!(ctx.cookie("session").as_deref(), Some("hello world!"));
        assert_eq!(ctx.cookie("missing"), None);

        ctx.set_same_site(SameSite::Lax);
        ctx.set_cookie(Cookie { name: "token", value: "a b", max_age: 60, http_only: true, ..Default::default() });
        ctx.set_cookie(Cookie { name: "bad name", value: "x", ..Default::default() });

        let cookies: Vec<_> = ctx.writer().headers().get_all(SET_COOKIE).iter().collect();
        assert_eq!(cookies.len(), 1);
        assert_eq!(cookies[0], "token=a+b; Path=/; Max-Age=60; HttpOnly; SameSite=Lax");
    }

    #[test]
    fn must_bind_aborts_with_400_json() {
        #[derive(Debug, serde::Deserialize)]
        struct Login {
            #[allow(dead_code)]
            user: String,
        }

        let mut ctx = context_for(http::Request::builder().method("POST"), b"{not json");
        let res: Result<Login, _> = ctx.must_bind_with(&binding::Json);
        assert!(res.is_err());
        assert!(ctx.is_aborted());
        assert_eq!(ctx.writer().status(), Some(StatusCode::BAD_REQUEST));
        let body: serde_json::Value = serde_json::from_slice(ctx.writer().body()).unwrap();
        assert!(body["error"].as_str().unwrap().starts_with("json:"));
    }

    #[test]
    fn bind_body_caches_raw_body_under_key() {
        let ctx = context_for(http::Request::builder().method("POST"), br#"{"n":3}"#);
        let a: serde_json::Value = ctx.should_bind_body_with("body", &binding::Json).unwrap();
        let b: HashMap<String, u8> = ctx.should_bind_body_with("body", &binding::Json).unwrap();
        assert_eq!(a["n"], 3);
        assert_eq!(b["n"], 3);
        assert_eq!(ctx.get::<Bytes>("body").unwrap(), Bytes::from_static(br#"{"n":3}"#));
    }

    #[test]
    fn status_without_body_skips_rendering() {
        let mut ctx = context_for(http::Request::builder(), b"");
        ctx.json(StatusCode::NO_CONTENT, serde_json::json!({"ignored": true}));
        assert_eq!(ctx.writer().status(), Some(StatusCode::NO_CONTENT));
        assert!(ctx.writer().body().is_empty());
        assert_eq!(ctx.writer().headers()[CONTENT_TYPE], "application/json; charset=utf-8");
    }

    #[test]
    fn jsonp_uses_callback_query() {
        let mut ctx = context_for(http::Request::builder().uri("/?callback=cb"), b"");
        ctx.jsonp(StatusCode::OK, [1, 2]);
        assert_eq!(ctx.writer().body(), b"cb([1,2]);");

        let mut plain = context_for(http::Request::builder().uri("/"), b"");
        plain.jsonp(StatusCode::OK, [1, 2]);
        assert_eq!(plain.writer().body(), b"[1,2]");
    }

    #[test]
    fn html_without_engine_is_a_500() {
        let mut ctx = context_for(http::Request::builder(), b"");
        ctx.html(StatusCode::OK, "index.html", ());
        assert!(ctx.is_aborted());
        assert_eq!(ctx.writer().status(), Some(StatusCode::INTERNAL_SERVER_ERROR));
    }

    #[test]
    fn scope_reports_cancellation() {
        let ctx = context_for(http::Request::builder(), b"");
        assert_eq!(ctx.scope().err(), None);
        ctx.scope().token().cancel();
        assert!(ctx.scope().is_done());
        assert_eq!(ctx.scope().err(), Some(ScopeError::Canceled));
    }

    #[test]
    fn multipart_form_reads_fields_and_files() {
        use crate::multipart::tests::{CONTENT_TYPE as MULTIPART, UPLOAD};

        let req = http::Request::post("/upload").header("content-type", MULTIPART);
        let mut ctx = context_for(req, UPLOAD);
        let form = ctx.multipart_form().unwrap();
        assert_eq!(form.value("title"), Some("holiday"));

        let photo = ctx.form_file("photo").unwrap();
        assert_eq!(photo.filename, "beach.txt");
        assert!(matches!(ctx.form_file("avatar"), Err(MultipartError::MissingFile(name)) if name == "avatar"));

        let dir = tempfile::tempdir().unwrap();
        let dst = dir.path().join("uploads/beach.txt");
        ctx.save_uploaded_file(&photo, &dst).unwrap();
        assert_eq!(std::fs::read(&dst).unwrap(), b"sand and sea");

        ctx.reset();
        assert!(ctx.multipart.is_none());
    }

    #[test]
    fn multipart_form_requires_a_multipart_body() {
        let req = http::Request::post("/").header("content-type", MIME_POST_FORM);
        let mut ctx = context_for(req, b"a=1");
        assert!(matches!(ctx.multipart_form(), Err(MultipartError::NotMultipart)));
    }

    #[test]
    fn file_serves_hits_and_404s_misses() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("notes.txt");
        std::fs::write(&path, "remember").unwrap();

        let mut ctx = context_for(http::Request::builder(), b"");
        ctx.file(&path);
        assert_eq!(ctx.writer().status(), Some(StatusCode::OK));
        assert_eq!(ctx.writer().headers()[CONTENT_TYPE], "text/plain");
        assert_eq!(ctx.writer().body(), b"remember");

        let mut ctx = context_for(http::Request::builder(), b"");
        ctx.file(dir.path().join("gone.txt"));
        assert_eq!(ctx.writer().status(), Some(StatusCode::NOT_FOUND));
        assert_eq!(ctx.writer().body(), b"404 page not found\n");
    }

    #[test]
    fn file_from_fs_stays_under_its_root() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("public");
        std::fs::create_dir(&root).unwrap();
        std::fs::write(root.join("app.js"), "run()").unwrap();
        std::fs::write(dir.path().join("secret.txt"), "hunter2").unwrap();

        let mut ctx = context_for(http::Request::builder(), b"");
        ctx.file_from_fs("/app.js", &root);
        assert_eq!(ctx.writer().body(), b"run()");

        for escape in ["../secret.txt", "/../../secret.txt", "a/../../secret.txt"] {
            let mut ctx = context_for(http::Request::builder(), b"");
            ctx.file_from_fs(escape, &root);
            assert_eq!(ctx.writer().status(), Some(StatusCode::NOT_FOUND), "{escape}");
            assert!(!ctx.writer().body().starts_with(b"hunter2"));
        }
    }
}
