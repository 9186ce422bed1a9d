//! `multipart/form-data` forms.
//!
//! Bodies are already buffered by the time a handler runs, so parsing is a
//! single pass over memory. [`Context::multipart_form`](crate::Context::multipart_form)
//! parses once per request and caches the result.

use std::collections::HashMap;
use std::io;
use std::path::Path;

use bytes::Bytes;
use futures::executor::block_on;
use futures::stream;
use multer::{Constraints, Multipart, SizeLimit};

use crate::error::MultipartError;

/// A parsed multipart form: text fields and uploaded files, keyed by field
/// name, in the order they appeared.
#[derive(Clone, Debug, Default)]
pub struct MultipartForm {
    pub values: HashMap<String, Vec<String>>,
    pub files: HashMap<String, Vec<FileHeader>>,
}

impl MultipartForm {
    /// First text value for `name`.
    pub fn value(&self, name: &str) -> Option<&str> {
        self.values.get(name)?.first().map(String::as_str)
    }

    /// First file uploaded under `name`.
    pub fn file(&self, name: &str) -> Option<&FileHeader> {
        self.files.get(name)?.first()
    }
}

/// One uploaded file.
#[derive(Clone, Debug)]
pub struct FileHeader {
    pub filename: String,
    pub content_type: Option<String>,
    pub content: Bytes,
}

impl FileHeader {
    pub fn size(&self) -> usize {
        self.content.len()
    }

    /// Writes the file to `dst`, creating missing parent directories.
    pub fn save(&self, dst: &Path) -> io::Result<()> {
        if let Some(parent) = dst.parent().filter(|p| !p.as_os_str().is_empty()) {
            let mut dirs = std::fs::DirBuilder::new();
            dirs.recursive(true);
            #[cfg(unix)]
            {
                use std::os::unix::fs::DirBuilderExt;
                dirs.mode(0o750);
            }
            dirs.create(parent)?;
        }
        std::fs::write(dst, &self.content)
    }
}

/// Parses `body` using the boundary from the raw `content_type` header.
/// Forms larger than `limit` bytes are rejected.
pub(crate) fn parse(content_type: &str, body: Bytes, limit: u64) -> Result<MultipartForm, MultipartError> {
    let boundary = multer::parse_boundary(content_type)?;
    let constraints = Constraints::new().size_limit(SizeLimit::new().whole_stream(limit));
    let body = stream::once(async move { Ok::<_, io::Error>(body) });
    let mut multipart = Multipart::with_constraints(body, boundary, constraints);

    block_on(async move {
        let mut form = MultipartForm::default();
        while let Some(field) = multipart.next_field().await? {
            let name = field.name().unwrap_or_default().to_owned();
            match field.file_name().map(str::to_owned) {
                Some(filename) => {
                    let content_type = field.content_type().map(ToString::to_string);
                    let content = field.bytes().await?;
                    form.files.entry(name).or_default().push(FileHeader { filename, content_type, content });
                }
                None => {
                    let text = field.text().await?;
                    form.values.entry(name).or_default().push(text);
                }
            }
        }
        Ok::<_, MultipartError>(form)
    })
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) const CONTENT_TYPE: &str = "multipart/form-data; boundary=XBOUNDARY";

    pub(crate) const UPLOAD: &[u8] = b"--XBOUNDARY\r\n\
        Content-Disposition: form-data; name=\"title\"\r\n\r\n\
        holiday\r\n\
        --XBOUNDARY\r\n\
        Content-Disposition: form-data; name=\"photo\"; filename=\"beach.txt\"\r\n\
        Content-Type: text/plain\r\n\r\n\
        sand and sea\r\n\
        --XBOUNDARY--\r\n";

    #[test]
    fn parses_fields_and_files() {
        let form = parse(CONTENT_TYPE, Bytes::from_static(UPLOAD), 1 << 20).unwrap();
        assert_eq!(form.value("title"), Some("holiday"));
        assert!(form.value("photo").is_none());

        let photo = form.file("photo").unwrap();
        assert_eq!(photo.filename, "beach.txt");
        assert_eq!(photo.content_type.as_deref(), Some("text/plain"));
        assert_eq!(photo.content, "sand and sea");
        assert_eq!(photo.size(), 12);
    }

    #[test]
    fn forms_over_the_limit_are_rejected() {
        let err = parse(CONTENT_TYPE, Bytes::from_static(UPLOAD), 16).unwrap_err();
        assert!(matches!(err, MultipartError::Parse(_)));
    }

    #[test]
    fn missing_boundary_is_an_error() {
        let err = parse("multipart/form-data", Bytes::from_static(UPLOAD), 1 << 20).unwrap_err();
        assert!(matches!(err, MultipartError::Parse(_)));
    }

    #[test]
    fn save_creates_parent_directories() {
        let dir = tempfile::tempdir().unwrap();
        let file = FileHeader {
            filename: "a.txt".into(),
            content_type: None,
            content: Bytes::from_static(b"hello"),
        };
        let dst = dir.path().join("nested/deeper/a.txt");
        file.save(&dst).unwrap();
        assert_eq!(std::fs::read(&dst).unwrap(), b"hello");
    }
}
