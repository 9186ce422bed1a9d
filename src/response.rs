//! Buffered response writer.
//!
//! Handlers never talk to the socket. Everything they write lands in a
//! [`ResponseWriter`] owned by the [`Context`](crate::Context); once the
//! handler chain returns, the server turns the buffer into one hyper
//! response. That is what lets the recovery middleware replace a half-written
//! response with a clean `500`.

use bytes::{Bytes, BytesMut};
use http::header::{CONTENT_TYPE, HeaderName, HeaderValue};
use http::{HeaderMap, StatusCode};
use http_body_util::Full;
use tracing::warn;

// ── ContentType ───────────────────────────────────────────────────────────────

/// Content-type values used by the built-in renderers.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ContentType {
    Csv,         // text/csv
    FormData,    // application/x-www-form-urlencoded
    Html,        // text/html; charset=utf-8
    Javascript,  // application/javascript; charset=utf-8  (JSONP)
    Json,        // application/json; charset=utf-8
    OctetStream, // application/octet-stream
    Text,        // text/plain; charset=utf-8
    Xml,         // application/xml; charset=utf-8
}

impl ContentType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Csv         => "text/csv",
            Self::FormData    => "application/x-www-form-urlencoded",
            Self::Html        => "text/html; charset=utf-8",
            Self::Javascript  => "application/javascript; charset=utf-8",
            Self::Json        => "application/json; charset=utf-8",
            Self::OctetStream => "application/octet-stream",
            Self::Text        => "text/plain; charset=utf-8",
            Self::Xml         => "application/xml; charset=utf-8",
        }
    }
}

// ── ResponseWriter ────────────────────────────────────────────────────────────

/// The response a handler chain is building.
///
/// The status is written at most once; a body write without an explicit
/// status implies `200 OK`. Headers stay mutable until the response is sent.
#[derive(Debug, Default)]
pub struct ResponseWriter {
    status: Option<StatusCode>,
    headers: HeaderMap,
    body: BytesMut,
}

impl ResponseWriter {
    /// Records the status code. Later calls are ignored and logged.
    pub fn write_header(&mut self, code: StatusCode) {
        match self.status {
            None => self.status = Some(code),
            Some(prev) if prev != code => {
                warn!(previous = prev.as_u16(), ignored = code.as_u16(), "superfluous status write");
            }
            Some(_) => {}
        }
    }

    /// Appends to the body, implying `200 OK` if no status was written yet.
    pub fn write(&mut self, data: &[u8]) {
        if self.status.is_none() {
            self.status = Some(StatusCode::OK);
        }
        self.body.extend_from_slice(data);
    }

    pub fn headers(&self) -> &HeaderMap { &self.headers }
    pub fn headers_mut(&mut self) -> &mut HeaderMap { &mut self.headers }

    /// The status written so far, if any.
    pub fn status(&self) -> Option<StatusCode> { self.status }

    /// `true` once a status or any body bytes have been written.
    pub fn written(&self) -> bool { self.status.is_some() }

    pub fn body(&self) -> &[u8] { &self.body }

    /// Sets `content-type` unless the handler already chose one.
    pub fn write_content_type(&mut self, content_type: ContentType) {
        if !self.headers.contains_key(CONTENT_TYPE) {
            self.headers.insert(CONTENT_TYPE, HeaderValue::from_static(content_type.as_str()));
        }
    }

    /// Sets a header, or removes it when `value` is empty. Invalid names or
    /// values are dropped.
    pub fn set_header(&mut self, name: &str, value: &str) {
        let Ok(name) = HeaderName::from_bytes(name.as_bytes()) else { return };
        if value.is_empty() {
            self.headers.remove(name);
        } else if let Ok(value) = HeaderValue::from_str(value) {
            self.headers.insert(name, value);
        }
    }

    /// Discards everything written so far.
    pub(crate) fn clear(&mut self) {
        self.status = None;
        self.headers.clear();
        self.body.clear();
    }

    pub(crate) fn into_response(self) -> http::Response<Full<Bytes>> {
        let mut res = http::Response::new(Full::new(self.body.freeze()));
        *res.status_mut() = self.status.unwrap_or(StatusCode::OK);
        *res.headers_mut() = self.headers;
        res
    }
}

/// Whether `status` permits a response body (RFC 9110 §6.4.1).
pub(crate) fn body_allowed_for_status(status: StatusCode) -> bool {
    !(status.is_informational()
        || status == StatusCode::NO_CONTENT
        || status == StatusCode::NOT_MODIFIED)
}

/// A response with a plain-text body, used for framework-generated answers.
pub(crate) fn plain(status: StatusCode, body: &'static str) -> http::Response<Full<Bytes>> {
    let mut w = ResponseWriter::default();
    w.write_header(status);
    w.write_content_type(ContentType::Text);
    w.headers_mut().insert("x-content-type-options", HeaderValue::from_static("nosniff"));
    w.write(body.as_bytes());
    w.into_response()
}
