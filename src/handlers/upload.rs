//! Buffered multipart form reading with per-file, per-request and file-count
//! limits enforced while the body streams in.

use std::collections::HashMap;

use actix_multipart::Multipart;
use futures::TryStreamExt;

use crate::config::Settings;
use crate::error::{ApiError, Result};
use crate::ingest::sanitize_filename;

const MAX_TEXT_FIELD_BYTES: usize = 64 * 1024;
const MAX_TEXT_FIELDS: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UploadLimits {
    pub max_file_bytes: usize,
    pub max_files: usize,
    /// Everything buffered for one request, text fields included.
    pub max_total_bytes: usize,
}

impl UploadLimits {
    pub fn from_settings(settings: &Settings) -> Self {
        UploadLimits {
            max_file_bytes: settings.max_upload_bytes,
            max_files: settings.max_upload_files,
            max_total_bytes: settings.max_request_bytes,
        }
    }

    /// A form carrying exactly one file.
    pub fn single_file(self) -> Self {
        UploadLimits {
            max_files: 1,
            ..self
        }
    }
}

#[derive(Debug)]
pub struct UploadedFile {
    pub field: String,
    pub filename: String,
    pub bytes: Vec<u8>,
}

#[derive(Debug, Default)]
pub struct UploadForm {
    fields: HashMap<String, String>,
    pub files: Vec<UploadedFile>,
}

impl UploadForm {
    /// A trimmed, non-empty text field.
    pub fn text(&self, name: &str) -> Option<&str> {
        self.fields
            .get(name)
            .map(|v| v.trim())
            .filter(|v| !v.is_empty())
    }

    pub fn take_files(&mut self, field: &str) -> Vec<UploadedFile> {
        let (matching, rest): (Vec<_>, Vec<_>) = std::mem::take(&mut self.files)
            .into_iter()
            .partition(|f| f.field == field);
        self.files = rest;
        matching
    }
}

fn request_too_large(limits: &UploadLimits) -> ApiError {
    ApiError::PayloadTooLarge(format!(
        "Upload exceeds the {} byte request limit",
        limits.max_total_bytes
    ))
}

/// Reads the whole form. Parts with a filename are files; other parts are
/// short text fields. Any limit crossed ends the read with 413.
pub async fn read_form(mut payload: Multipart, limits: UploadLimits) -> Result<UploadForm> {
    let mut form = UploadForm::default();
    let mut total = 0usize;

    while let Some(mut field) = payload.try_next().await? {
        let Some(disposition) = field.content_disposition().cloned() else {
            continue;
        };
        let name = disposition.get_name().unwrap_or_default().to_string();

        match disposition.get_filename() {
            Some(raw_filename) => {
                if form.files.len() >= limits.max_files {
                    return Err(ApiError::PayloadTooLarge(format!(
                        "At most {} file(s) may be uploaded per request",
                        limits.max_files
                    )));
                }
                let filename = sanitize_filename(raw_filename);
                let mut bytes = Vec::new();
                while let Some(chunk) = field.try_next().await? {
                    if bytes.len() + chunk.len() > limits.max_file_bytes {
                        return Err(ApiError::PayloadTooLarge(format!(
                            "File '{filename}' exceeds the {} byte upload limit",
                            limits.max_file_bytes
                        )));
                    }
                    total += chunk.len();
                    if total > limits.max_total_bytes {
                        return Err(request_too_large(&limits));
                    }
                    bytes.extend_from_slice(&chunk);
                }
                form.files.push(UploadedFile {
                    field: name,
                    filename,
                    bytes,
                });
            }
            None => {
                if form.fields.len() >= MAX_TEXT_FIELDS {
                    return Err(ApiError::Validation("Too many form fields".into()));
                }
                let mut bytes = Vec::new();
                while let Some(chunk) = field.try_next().await? {
                    if bytes.len() + chunk.len() > MAX_TEXT_FIELD_BYTES {
                        return Err(ApiError::Validation(format!("Form field '{name}' is too long")));
                    }
                    total += chunk.len();
                    if total > limits.max_total_bytes {
                        return Err(request_too_large(&limits));
                    }
                    bytes.extend_from_slice(&chunk);
                }
                let value = String::from_utf8(bytes)
                    .map_err(|_| ApiError::Validation(format!("Form field '{name}' is not valid UTF-8")))?;
                form.fields.insert(name, value);
            }
        }
    }

    Ok(form)
}

#[cfg(test)]
mod tests {
    use super::*;
    use actix_web::error::PayloadError;
    use actix_web::http::header::{self, HeaderMap, HeaderValue};
    use actix_web::http::StatusCode;
    use actix_web::web::Bytes;
    use actix_web::ResponseError;

    const BOUNDARY: &str = "medivault-form-boundary";

    fn limits() -> UploadLimits {
        UploadLimits {
            max_file_bytes: 16,
            max_files: 2,
            max_total_bytes: 40,
        }
    }

    fn multipart(parts: &[(&str, Option<&str>, &str)]) -> Multipart {
        let mut body = String::new();
        for (name, filename, content) in parts {
            body.push_str(&format!("--{BOUNDARY}\r\n"));
            match filename {
                Some(filename) => body.push_str(&format!(
                    "Content-Disposition: form-data; name=\"{name}\"; filename=\"{filename}\"\r\n\
                     Content-Type: application/octet-stream\r\n\r\n"
                )),
                None => body.push_str(&format!(
                    "Content-Disposition: form-data; name=\"{name}\"\r\n\r\n"
                )),
            }
            body.push_str(content);
            body.push_str("\r\n");
        }
        body.push_str(&format!("--{BOUNDARY}--\r\n"));

        let mut headers = HeaderMap::new();
        headers.insert(
            header::CONTENT_TYPE,
            HeaderValue::from_str(&format!("multipart/form-data; boundary={BOUNDARY}")).unwrap(),
        );
        let stream = futures::stream::iter(vec![Ok::<_, PayloadError>(Bytes::from(body))]);
        Multipart::new(&headers, stream)
    }

    #[actix_web::test]
    async fn reads_fields_and_files() {
        let payload = multipart(&[
            ("title", None, " Labs "),
            ("files", Some("../a.txt"), "hello"),
            ("files", Some("b.txt"), "world"),
        ]);
        let mut form = read_form(payload, limits()).await.unwrap();
        assert_eq!(form.text("title"), Some("Labs"));
        let files = form.take_files("files");
        assert_eq!(files.len(), 2);
        assert_eq!(files[0].filename, "a.txt");
        assert_eq!(files[1].bytes, b"world");
    }

    #[actix_web::test]
    async fn too_many_files_is_413() {
        let payload = multipart(&[
            ("files", Some("a.txt"), "1"),
            ("files", Some("b.txt"), "2"),
            ("files", Some("c.txt"), "3"),
        ]);
        let err = read_form(payload, limits()).await.unwrap_err();
        assert_eq!(err.status_code(), StatusCode::PAYLOAD_TOO_LARGE);
    }

    #[actix_web::test]
    async fn request_budget_covers_all_parts() {
        let payload = multipart(&[
            ("note", None, "n".repeat(20).as_str()),
            ("files", Some("a.txt"), "a".repeat(15).as_str()),
            ("files", Some("b.txt"), "b".repeat(15).as_str()),
        ]);
        let err = read_form(payload, limits()).await.unwrap_err();
        assert_eq!(err.status_code(), StatusCode::PAYLOAD_TOO_LARGE);
        assert!(err.to_string().contains("request limit"));
    }

    #[actix_web::test]
    async fn oversized_file_is_413() {
        let payload = multipart(&[("files", Some("a.txt"), "a".repeat(17).as_str())]);
        let err = read_form(payload, limits()).await.unwrap_err();
        assert!(err.to_string().contains("upload limit"));
    }

    #[actix_web::test]
    async fn single_file_forms_reject_a_second_file() {
        let payload = multipart(&[
            ("file", Some("a.pdf"), "%PDF-1"),
            ("file", Some("b.pdf"), "%PDF-1"),
        ]);
        let err = read_form(payload, limits().single_file()).await.unwrap_err();
        assert_eq!(err.status_code(), StatusCode::PAYLOAD_TOO_LARGE);
    }
}
