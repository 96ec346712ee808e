//! Multipart upload extraction.
//!
//! # Responsibilities
//! - Decode a buffered `multipart/form-data` body
//! - Select file parts by field name precedence
//! - Enforce the per-file size ceiling
//! - Persist accepted files through the [`FileStore`]
//!
//! # Field precedence
//! `file[]` (all parts), else `files` (all parts), else `file` (first part
//! only), else every file part of any field in arrival order. Only the
//! first matching rule is used.

use std::sync::Arc;

use axum::body::Body;
use axum::extract::{DefaultBodyLimit, FromRequest, Multipart};
use axum::http::{header, Request};
use bytes::Bytes;
use serde_json::{Map, Value};
use tower::{service_fn, Layer, ServiceExt};

use crate::error::{AppError, AppErrorCode};
use crate::storage::{FileStore, StoreError, UploadedFile};

/// Default per-file ceiling (10 MiB).
pub const MAX_UPLOAD_SIZE: u64 = 10 * 1024 * 1024;

/// Failure while extracting uploads.
#[derive(Debug, thiserror::Error)]
pub enum UploadError {
    #[error("failed to parse multipart form: {0}")]
    Parse(String),
    #[error("failed to process file {filename}: {error}")]
    TooLarge { filename: String, error: AppError },
    #[error("failed to process file {filename}: {source}")]
    Store {
        filename: String,
        #[source]
        source: StoreError,
    },
}

/// A file part held in memory before storage.
#[derive(Debug, Clone)]
struct FilePart {
    filename: String,
    content_type: Option<String>,
    data: Bytes,
}

/// Result of decoding a multipart body.
#[derive(Debug, Default)]
pub struct MultipartForm {
    pub files: Vec<UploadedFile>,
    /// Text fields, first value per name.
    pub fields: Map<String, Value>,
}

/// Extracts uploaded files into a [`FileStore`].
pub struct UploadHandler {
    store: Arc<dyn FileStore>,
    max_file_size: u64,
}

impl UploadHandler {
    /// A `max_file_size` of zero selects [`MAX_UPLOAD_SIZE`].
    pub fn new(store: Arc<dyn FileStore>, max_file_size: u64) -> Self {
        let max_file_size = if max_file_size == 0 {
            MAX_UPLOAD_SIZE
        } else {
            max_file_size
        };
        Self {
            store,
            max_file_size,
        }
    }

    pub fn max_file_size(&self) -> u64 {
        self.max_file_size
    }

    /// Decode `body` and store the selected file parts.
    ///
    /// On failure every file stored so far is deleted again. A form without
    /// file parts yields an empty file list.
    pub async fn handle_multipart(
        &self,
        content_type: &str,
        body: Bytes,
    ) -> Result<MultipartForm, UploadError> {
        let (file_fields, fields) = decode(content_type, body).await?;
        let selected = select_parts(file_fields);

        let mut stored: Vec<UploadedFile> = Vec::with_capacity(selected.len());
        for part in selected {
            match self.store_part(part).await {
                Ok(file) => stored.push(file),
                Err(e) => {
                    self.discard(&stored);
                    return Err(e);
                }
            }
        }

        Ok(MultipartForm {
            files: stored,
            fields,
        })
    }

    /// Best-effort deletion of stored uploads.
    pub fn discard(&self, files: &[UploadedFile]) {
        for file in files {
            if let Err(e) = self.store.delete(&file.id) {
                tracing::warn!(file = %file.id, error = %e, "Failed to clean up uploaded file");
            }
        }
    }

    async fn store_part(&self, part: FilePart) -> Result<UploadedFile, UploadError> {
        let size = part.data.len() as u64;
        if size > self.max_file_size {
            let error = AppError::new(
                AppErrorCode::RequestTooLarge,
                format!("File too large: {} bytes (max: {})", size, self.max_file_size),
            )
            .with_details("filename", part.filename.clone())
            .with_details("size", size)
            .with_details("maxSize", self.max_file_size);
            return Err(UploadError::TooLarge {
                filename: part.filename,
                error,
            });
        }

        let content_type = match part.content_type.as_deref() {
            Some(declared) if !declared.is_empty() && declared != "application/octet-stream" => {
                declared.to_string()
            }
            _ => detect_content_type(&part.data).to_string(),
        };

        let store = Arc::clone(&self.store);
        let filename = part.filename.clone();
        let result = tokio::task::spawn_blocking(move || {
            store.store(&part.filename, &part.data, &content_type)
        })
        .await;

        match result {
            Ok(Ok(file)) => Ok(file),
            Ok(Err(source)) => Err(UploadError::Store { filename, source }),
            Err(join) => Err(UploadError::Store {
                filename,
                source: StoreError::Write(std::io::Error::other(join.to_string())),
            }),
        }
    }
}

type FileFields = Vec<(String, Vec<FilePart>)>;

async fn decode(content_type: &str, body: Bytes) -> Result<(FileFields, Map<String, Value>), UploadError> {
    let req = Request::builder()
        .header(header::CONTENT_TYPE, content_type)
        .body(Body::from(body))
        .map_err(|e| UploadError::Parse(e.to_string()))?;

    // The body is already buffered under its own ceiling.
    let extract = DefaultBodyLimit::disable().layer(service_fn(|req: Request<Body>| async move {
        Multipart::from_request(req, &()).await
    }));
    let mut multipart = extract
        .oneshot(req)
        .await
        .map_err(|rejection| UploadError::Parse(rejection.body_text()))?;

    let mut files: FileFields = Vec::new();
    let mut fields = Map::new();
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| UploadError::Parse(e.body_text()))?
    {
        let name = field.name().unwrap_or_default().to_string();
        let filename = field.file_name().map(str::to_string);
        let content_type = field.content_type().map(str::to_string);
        let data = field
            .bytes()
            .await
            .map_err(|e| UploadError::Parse(e.body_text()))?;

        match filename {
            Some(filename) => {
                let part = FilePart {
                    filename,
                    content_type,
                    data,
                };
                match files.iter_mut().find(|(field_name, _)| *field_name == name) {
                    Some((_, parts)) => parts.push(part),
                    None => files.push((name, vec![part])),
                }
            }
            None => {
                if !fields.contains_key(&name) {
                    let text = String::from_utf8_lossy(&data).into_owned();
                    fields.insert(name, Value::String(text));
                }
            }
        }
    }
    Ok((files, fields))
}

fn select_parts(mut files: FileFields) -> Vec<FilePart> {
    let take = |files: &mut FileFields, name: &str| {
        files
            .iter()
            .position(|(field, _)| field == name)
            .map(|idx| files.remove(idx).1)
    };

    if let Some(parts) = take(&mut files, "file[]") {
        return parts;
    }
    if let Some(parts) = take(&mut files, "files") {
        return parts;
    }
    if let Some(parts) = take(&mut files, "file") {
        return parts.into_iter().take(1).collect();
    }
    files.into_iter().flat_map(|(_, parts)| parts).collect()
}

/// Sniff a MIME type from leading bytes.
pub fn detect_content_type(data: &[u8]) -> &'static str {
    if let Some(kind) = infer::get(data) {
        return kind.mime_type();
    }
    if std::str::from_utf8(data).is_ok() {
        return "text/plain; charset=utf-8";
    }
    "application/octet-stream"
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::TemporaryFileStore;

    const BOUNDARY: &str = "XBOUNDARYX";

    fn content_type() -> String {
        format!("multipart/form-data; boundary={}", BOUNDARY)
    }

    /// `(field, Some(filename), content)` for files, `None` for text fields.
    fn body(parts: &[(&str, Option<&str>, &str)]) -> Bytes {
        let mut out = String::new();
        for (field, filename, content) in parts {
            out.push_str(&format!("--{}\r\n", BOUNDARY));
            match filename {
                Some(filename) => out.push_str(&format!(
                    "Content-Disposition: form-data; name=\"{}\"; filename=\"{}\"\r\n\r\n",
                    field, filename
                )),
                None => out.push_str(&format!(
                    "Content-Disposition: form-data; name=\"{}\"\r\n\r\n",
                    field
                )),
            }
            out.push_str(content);
            out.push_str("\r\n");
        }
        out.push_str(&format!("--{}--\r\n", BOUNDARY));
        Bytes::from(out)
    }

    fn handler(max: u64) -> (tempfile::TempDir, Arc<TemporaryFileStore>, UploadHandler) {
        let dir = tempfile::tempdir().unwrap();
        let store = TemporaryFileStore::new(dir.path().join("uploads")).unwrap();
        let handler = UploadHandler::new(store.clone(), max);
        (dir, store, handler)
    }

    fn names(form: &MultipartForm) -> Vec<&str> {
        form.files.iter().map(|f| f.filename.as_str()).collect()
    }

    #[tokio::test]
    async fn file_array_field_wins() {
        let (_dir, _store, handler) = handler(0);
        let body = body(&[
            ("file", Some("single.txt"), "s"),
            ("file[]", Some("a.txt"), "a"),
            ("files", Some("other.txt"), "o"),
            ("file[]", Some("b.txt"), "b"),
        ]);
        let form = handler.handle_multipart(&content_type(), body).await.unwrap();
        assert_eq!(names(&form), vec!["a.txt", "b.txt"]);
    }

    #[tokio::test]
    async fn single_file_field_takes_first_only() {
        let (_dir, _store, handler) = handler(0);
        let body = body(&[
            ("file", Some("first.txt"), "1"),
            ("file", Some("second.txt"), "2"),
            ("note", None, "hello"),
        ]);
        let form = handler.handle_multipart(&content_type(), body).await.unwrap();
        assert_eq!(names(&form), vec!["first.txt"]);
        assert_eq!(form.fields["note"], "hello");
    }

    #[tokio::test]
    async fn any_field_fallback_and_sanitized_names() {
        let (_dir, store, handler) = handler(0);
        let body = body(&[
            ("avatar", Some("../../../etc/passwd"), "root:x"),
            ("doc", Some("report.pdf"), "%PDF-1.4"),
        ]);
        let form = handler.handle_multipart(&content_type(), body).await.unwrap();
        assert_eq!(names(&form), vec!["passwd", "report.pdf"]);
        assert_eq!(form.files[1].content_type, "application/pdf");
        assert!(form.files[0].path.starts_with(store.base_dir()));
        assert_eq!(store.len(), 2);
    }

    #[tokio::test]
    async fn text_only_form_has_no_files() {
        let (_dir, _store, handler) = handler(0);
        let body = body(&[("name", None, "Ada"), ("name", None, "ignored")]);
        let form = handler.handle_multipart(&content_type(), body).await.unwrap();
        assert!(form.files.is_empty());
        assert_eq!(form.fields["name"], "Ada");
    }

    #[tokio::test]
    async fn oversized_file_rolls_back_stored_files() {
        let (_dir, store, handler) = handler(4);
        let body = body(&[
            ("files", Some("ok.txt"), "tiny"),
            ("files", Some("big.txt"), "far too large"),
        ]);
        let err = handler
            .handle_multipart(&content_type(), body)
            .await
            .unwrap_err();
        match &err {
            UploadError::TooLarge { filename, error } => {
                assert_eq!(filename, "big.txt");
                assert_eq!(error.code, AppErrorCode::RequestTooLarge);
                assert_eq!(error.message, "File too large: 13 bytes (max: 4)");
                assert_eq!(error.details["maxSize"], 4);
            }
            other => panic!("unexpected error: {other}"),
        }
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn malformed_body_is_parse_error() {
        let (_dir, _store, handler) = handler(0);
        let err = handler
            .handle_multipart("multipart/form-data", Bytes::from_static(b"junk"))
            .await
            .unwrap_err();
        assert!(matches!(err, UploadError::Parse(_)));
        assert!(err.to_string().starts_with("failed to parse multipart form"));
    }

    #[test]
    fn sniffs_common_types() {
        assert_eq!(detect_content_type(b"\x89PNG\r\n\x1a\nrest"), "image/png");
        assert_eq!(detect_content_type(b"GIF89a..."), "image/gif");
        assert_eq!(detect_content_type(b"RIFF\0\0\0\0WEBPVP8 "), "image/webp");
        assert_eq!(detect_content_type(b"plain words"), "text/plain; charset=utf-8");
        assert_eq!(detect_content_type(&[0xff, 0x00, 0xfe, 0x01]), "application/octet-stream");
        assert_eq!(detect_content_type(b""), "text/plain; charset=utf-8");
        assert_eq!(detect_content_type(b"%PDF-1.7\n"), "application/pdf");
    }
}
