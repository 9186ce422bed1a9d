//! Request binding: decoding request input into typed values.
//!
//! A [`Binding`] reads from the whole request; a [`BindingBody`] can also
//! decode a body that was already read and cached, and a [`BindingUri`]
//! decodes path parameters. All of them go through serde, so any
//! `DeserializeOwned` type is a valid target.
//!
//! ```rust,no_run
//! use plum::{Context, binding};
//! use serde::Deserialize;
//!
//! #[derive(Deserialize)]
//! struct Login { user: String, password: String }
//!
//! fn login(ctx: &mut Context) {
//!     let Ok(form) = ctx.must_bind_with::<Login, _>(&binding::Form) else { return };
//!     // must_bind_with already answered 400 on failure
//!     # let _ = form.user; let _ = form.password;
//! }
//! ```

use serde::de::DeserializeOwned;

use crate::context::Params;
use crate::error::BindError;
use crate::request::Request;

// Content-Type MIME of the most common data formats.
pub const MIME_JSON: &str = "application/json";
pub const MIME_HTML: &str = "text/html";
pub const MIME_XML: &str = "application/xml";
pub const MIME_XML2: &str = "text/xml";
pub const MIME_PLAIN: &str = "text/plain";
pub const MIME_POST_FORM: &str = "application/x-www-form-urlencoded";
pub const MIME_MULTIPART_POST_FORM: &str = "multipart/form-data";

/// Decodes a value from a request.
pub trait Binding {
    fn name(&self) -> &'static str;
    fn bind<T: DeserializeOwned>(&self, req: &Request) -> Result<T, BindError>;
}

/// A [`Binding`] that can also decode from already-read body bytes.
pub trait BindingBody: Binding {
    fn bind_body<T: DeserializeOwned>(&self, body: &[u8]) -> Result<T, BindError>;
}

/// Decodes a value from path parameters.
pub trait BindingUri {
    fn name(&self) -> &'static str;
    fn bind_uri<T: DeserializeOwned>(&self, params: &Params) -> Result<T, BindError>;
}

/// JSON request bodies.
#[derive(Clone, Copy, Debug, Default)]
pub struct Json;

impl Binding for Json {
    fn name(&self) -> &'static str { "json" }

    fn bind<T: DeserializeOwned>(&self, req: &Request) -> Result<T, BindError> {
        if req.body().is_empty() {
            return Err(BindError::MissingBody);
        }
        self.bind_body(req.body())
    }
}

impl BindingBody for Json {
    fn bind_body<T: DeserializeOwned>(&self, body: &[u8]) -> Result<T, BindError> {
        Ok(serde_json::from_slice(body)?)
    }
}

/// `application/x-www-form-urlencoded` request bodies.
#[derive(Clone, Copy, Debug, Default)]
pub struct Form;

impl Binding for Form {
    fn name(&self) -> &'static str { "form" }

    fn bind<T: DeserializeOwned>(&self, req: &Request) -> Result<T, BindError> {
        self.bind_body(req.body())
    }
}

impl BindingBody for Form {
    fn bind_body<T: DeserializeOwned>(&self, body: &[u8]) -> Result<T, BindError> {
        Ok(serde_urlencoded::from_bytes(body)?)
    }
}

/// The URL query string.
#[derive(Clone, Copy, Debug, Default)]
pub struct Query;

impl Binding for Query {
    fn name(&self) -> &'static str { "query" }

    fn bind<T: DeserializeOwned>(&self, req: &Request) -> Result<T, BindError> {
        Ok(serde_urlencoded::from_str(req.query_string())?)
    }
}

/// Path parameters captured by the route pattern.
#[derive(Clone, Copy, Debug, Default)]
pub struct Uri;

impl BindingUri for Uri {
    fn name(&self) -> &'static str { "uri" }

    fn bind_uri<T: DeserializeOwned>(&self, params: &Params) -> Result<T, BindError> {
        let encoded = url::form_urlencoded::Serializer::new(String::new())
            .extend_pairs(params.iter().map(|p| (p.key.as_str(), p.value.as_str())))
            .finish();
        Ok(serde_urlencoded::from_str(&encoded)?)
    }
}
