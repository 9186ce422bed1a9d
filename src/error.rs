//! Unified error types.

use std::time::Duration;

use thiserror::Error;

/// The error type returned by plum's server lifecycle operations.
///
/// Application-level errors (404, 422, etc.) are expressed as HTTP responses
/// written through the [`Context`](crate::Context), not as `Error`s. This type
/// surfaces infrastructure failures: binding a port, loading TLS material,
/// and misuse of `run` / `shutdown`.
#[derive(Debug, Error)]
pub enum Error {
    #[error("io: {0}")]
    Io(#[from] std::io::Error),

    #[error("tls: {0}")]
    Tls(String),

    #[error("server is already running")]
    AlreadyRunning,

    #[error("server is not running")]
    NotRunning,

    #[error("connections still open after shutdown deadline of {0:?}")]
    ShutdownTimeout(Duration),
}

impl From<tokio_rustls::rustls::Error> for Error {
    fn from(e: tokio_rustls::rustls::Error) -> Self {
        Self::Tls(e.to_string())
    }
}

/// Failure to decode request input into a typed value.
#[derive(Debug, Error)]
pub enum BindError {
    #[error("json: {0}")]
    Json(#[from] serde_json::Error),

    #[error("form: {0}")]
    Form(#[from] serde_urlencoded::de::Error),

    #[error("request has no body")]
    MissingBody,
}

/// Failure to render a response body.
#[derive(Debug, Error)]
pub enum RenderError {
    #[error("json: {0}")]
    Json(#[from] serde_json::Error),

    #[error("cannot redirect with status code {0}")]
    InvalidRedirect(u16),

    #[error("template: {0}")]
    Template(String),
}

/// Why a request scope is done.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Error)]
pub enum ScopeError {
    #[error("request canceled")]
    Canceled,

    #[error("request deadline exceeded")]
    DeadlineExceeded,
}

/// Failure to read a `multipart/form-data` request.
#[derive(Debug, Error)]
pub enum MultipartError {
    #[error("request Content-Type isn't multipart/form-data")]
    NotMultipart,

    #[error("multipart: {0}")]
    Parse(#[from] multer::Error),

    #[error("no file uploaded under `{0}`")]
    MissingFile(String),

    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}
