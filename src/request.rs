//! Incoming HTTP request type.

use std::fmt::Write as _;
use std::net::SocketAddr;

use bytes::Bytes;
use http::{HeaderMap, Method, Uri, Version};

/// An incoming HTTP request with its body fully buffered.
///
/// The body is collected before the handler chain starts, so handlers can
/// read it any number of times without touching the socket.
#[derive(Debug, Default)]
pub struct Request {
    method: Method,
    uri: Uri,
    version: Version,
    headers: HeaderMap,
    body: Bytes,
    remote_addr: Option<SocketAddr>,
}

impl Request {
    pub(crate) fn new(parts: http::request::Parts, body: Bytes, remote_addr: Option<SocketAddr>) -> Self {
        Self {
            method: parts.method,
            uri: parts.uri,
            version: parts.version,
            headers: parts.headers,
            body,
            remote_addr,
        }
    }

    pub fn method(&self) -> &Method { &self.method }
    pub fn uri(&self) -> &Uri { &self.uri }
    pub fn path(&self) -> &str { self.uri.path() }
    pub fn query_string(&self) -> &str { self.uri.query().unwrap_or("") }
    pub fn version(&self) -> Version { self.version }
    pub fn headers(&self) -> &HeaderMap { &self.headers }
    pub fn body(&self) -> &Bytes { &self.body }

    /// Peer address, when the request arrived over a socket.
    pub fn remote_addr(&self) -> Option<SocketAddr> { self.remote_addr }

    /// Case-insensitive header lookup. Non-UTF-8 values are treated as absent.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    /// Request line and headers in wire format, without the body.
    pub fn dump(&self) -> String {
        let mut out = String::new();
        let target = self.uri.path_and_query().map_or("/", |pq| pq.as_str());
        let _ = write!(out, "{} {} {:?}\r\n", self.method, target, self.version);
        if let Some(host) = self.uri.host() {
            if !self.headers.contains_key(http::header::HOST) {
                let _ = write!(out, "host: {host}\r\n");
            }
        }
        for (name, value) in &self.headers {
            let _ = write!(out, "{name}: {}\r\n", String::from_utf8_lossy(value.as_bytes()));
        }
        out.push_str("\r\n");
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(builder: http::request::Builder, body: &'static [u8]) -> Request {
        let (parts, ()) = builder.body(()).unwrap().into_parts();
        Request::new(parts, Bytes::from_static(body), None)
    }

    #[test]
    fn header_lookup_ignores_case() {
        let req = request(
            http::Request::builder().uri("/a?x=1").header("X-Token", "abc"),
            b"",
        );
        assert_eq!(req.header("x-token"), Some("abc"));
        assert_eq!(req.header("missing"), None);
        assert_eq!(req.query_string(), "x=1");
    }

    #[test]
    fn dump_has_request_line_and_headers_but_no_body() {
        let req = request(
            http::Request::builder()
                .method("POST")
                .uri("/users?id=7")
                .header("content-type", "application/json"),
            b"{\"secret\":true}",
        );
        let dump = req.dump();
        assert!(dump.starts_with("POST /users?id=7 HTTP/1.1\r\n"));
        assert!(dump.contains("content-type: application/json\r\n"));
        assert!(!dump.contains("secret"));
    }
}
