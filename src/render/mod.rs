//! Response rendering.
//!
//! A [`Render`] knows its content type and how to write itself into a
//! [`ResponseWriter`]. [`Context`](crate::Context) wraps each variant in a
//! shortcut (`json`, `jsonp`, `string`, `redirect`, `data`, `file`, `html`); use
//! [`Context::render`](crate::Context::render) directly for your own types.

use std::io;
use std::path::Path;

use bytes::Bytes;
use http::header::{HeaderValue, LOCATION};
use http::{Method, StatusCode};
use serde::Serialize;

use crate::error::RenderError;
use crate::response::{ContentType, ResponseWriter};

/// A response body format.
pub trait Render {
    fn write_content_type(&self, w: &mut ResponseWriter);
    fn render(&self, w: &mut ResponseWriter) -> Result<(), RenderError>;
}

/// Produces renderable template instances for [`Context::html`](crate::Context::html).
pub trait HtmlRender: Send + Sync {
    fn instance(&self, name: &str, data: serde_json::Value) -> Box<dyn Render>;
}

/// A serializable value written as JSON.
#[derive(Clone, Debug)]
pub struct Json<T>(pub T);

impl<T: Serialize> Render for Json<T> {
    fn write_content_type(&self, w: &mut ResponseWriter) {
        w.write_content_type(ContentType::Json);
    }

    fn render(&self, w: &mut ResponseWriter) -> Result<(), RenderError> {
        write_json(w, &self.0)
    }
}

/// An untyped JSON object.
#[derive(Clone, Debug, Default)]
pub struct MapJson(pub serde_json::Map<String, serde_json::Value>);

impl Render for MapJson {
    fn write_content_type(&self, w: &mut ResponseWriter) {
        w.write_content_type(ContentType::Json);
    }

    fn render(&self, w: &mut ResponseWriter) -> Result<(), RenderError> {
        write_json(w, &self.0)
    }
}

fn write_json(w: &mut ResponseWriter, value: &impl Serialize) -> Result<(), RenderError> {
    w.write_content_type(ContentType::Json);
    let bytes = serde_json::to_vec(value)?;
    w.write(&bytes);
    Ok(())
}

/// JSON wrapped in a JavaScript function call: `callback(data);`.
#[derive(Clone, Debug)]
pub struct Jsonp<T> {
    pub callback: String,
    pub data: T,
}

impl<T: Serialize> Render for Jsonp<T> {
    fn write_content_type(&self, w: &mut ResponseWriter) {
        w.write_content_type(ContentType::Javascript);
    }

    fn render(&self, w: &mut ResponseWriter) -> Result<(), RenderError> {
        self.write_content_type(w);
        let body = serde_json::to_vec(&self.data)?;
        if self.callback.is_empty() {
            w.write(&body);
            return Ok(());
        }
        w.write(js_escape(&self.callback).as_bytes());
        w.write(b"(");
        w.write(&body);
        w.write(b");");
        Ok(())
    }
}

/// Escapes characters that could break out of a JavaScript identifier
/// position.
fn js_escape(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '\'' => out.push_str("\\'"),
            '"' => out.push_str("\\\""),
            '<' => out.push_str("\\u003C"),
            '>' => out.push_str("\\u003E"),
            '&' => out.push_str("\\u0026"),
            '=' => out.push_str("\\u003D"),
            c if (c as u32) < 0x20 => out.push_str(&format!("\\u{:04X}", c as u32)),
            c => out.push(c),
        }
    }
    out
}

/// Plain text.
#[derive(Clone, Debug)]
pub struct Text(pub String);

impl Render for Text {
    fn write_content_type(&self, w: &mut ResponseWriter) {
        w.write_content_type(ContentType::Text);
    }

    fn render(&self, w: &mut ResponseWriter) -> Result<(), RenderError> {
        self.write_content_type(w);
        w.write(self.0.as_bytes());
        Ok(())
    }
}

/// An HTTP redirect. Writes its own status.
#[derive(Clone, Debug)]
pub struct Redirect {
    pub code: StatusCode,
    pub location: String,
    /// Method of the request being redirected; `GET` and `HEAD` get a short
    /// HTML body.
    pub method: Method,
}

impl Render for Redirect {
    fn write_content_type(&self, _: &mut ResponseWriter) {}

    fn render(&self, w: &mut ResponseWriter) -> Result<(), RenderError> {
        let code = self.code.as_u16();
        if !(300..=308).contains(&code) && code != 201 {
            return Err(RenderError::InvalidRedirect(code));
        }
        let location = HeaderValue::from_str(&self.location)
            .map_err(|_| RenderError::InvalidRedirect(code))?;
        w.headers_mut().insert(LOCATION, location);
        w.write_header(self.code);
        if self.method == Method::GET || self.method == Method::HEAD {
            w.write_content_type(ContentType::Html);
            let reason = self.code.canonical_reason().unwrap_or("Redirect");
            w.write(format!("<a href=\"{}\">{reason}</a>.\n", html_escape(&self.location)).as_bytes());
        }
        Ok(())
    }
}

fn html_escape(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&#34;")
        .replace('\'', "&#39;")
}

/// Raw bytes with an explicit content type.
#[derive(Clone, Debug)]
pub struct Data {
    pub content_type: String,
    pub data: Bytes,
}

impl Render for Data {
    fn write_content_type(&self, w: &mut ResponseWriter) {
        if !self.content_type.is_empty() {
            w.set_header("content-type", &self.content_type);
        }
    }

    fn render(&self, w: &mut ResponseWriter) -> Result<(), RenderError> {
        self.write_content_type(w);
        w.write(&self.data);
        Ok(())
    }
}

/// A file read from disk, with a content type guessed from its extension.
#[derive(Clone, Debug)]
pub struct File {
    pub content_type: String,
    pub data: Bytes,
}

impl File {
    /// Reads `path`, or `path/index.html` when `path` is a directory.
    pub fn load(path: &Path) -> io::Result<Self> {
        let index;
        let path = if std::fs::metadata(path)?.is_dir() {
            index = path.join("index.html");
            index.as_path()
        } else {
            path
        };
        let data = std::fs::read(path)?;
        let content_type = mime_guess::from_path(path).first_or_octet_stream().to_string();
        Ok(Self { content_type, data: Bytes::from(data) })
    }
}

impl Render for File {
    fn write_content_type(&self, w: &mut ResponseWriter) {
        w.set_header("content-type", &self.content_type);
    }

    fn render(&self, w: &mut ResponseWriter) -> Result<(), RenderError> {
        self.write_content_type(w);
        w.write(&self.data);
        Ok(())
    }
}
