//! Upload ingestion: file classification and validation, FHIR extraction
//! and EHR table conversion.

pub mod ehr;
pub mod fhir;
pub mod rtf;

use std::path::Path;

use strict_path::{PathBoundary, StrictPath, StrictPathError};
use thiserror::Error;

use fhir::FhirFormat;

pub const PDF_MAGIC: &[u8] = b"%PDF-";

#[derive(Debug, Error)]
pub enum IngestError {
    #[error("{0}")]
    Validation(String),

    #[error("File '{0}' is empty")]
    Empty(String),

    #[error("Unsupported file type for '{0}'. Allowed: pdf, json, xml, txt, md, tsv, rtf")]
    UnsupportedType(String),

    #[error("File '{filename}' exceeds the {limit} byte upload limit")]
    TooLarge { filename: String, limit: usize },

    #[error("Invalid FHIR resource: {0}")]
    InvalidFhir(String),

    #[error("Path must be inside the configured EHR import root: {0}")]
    OutsideRoot(#[from] StrictPathError),

    #[error("EHR import root is unavailable: {0}")]
    ImportRoot(#[source] StrictPathError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileKind {
    Pdf,
    Json,
    Xml,
    Text,
    Markdown,
    Tsv,
    Rtf,
}

impl FileKind {
    pub fn from_filename(filename: &str) -> Option<Self> {
        let extension = Path::new(filename).extension()?.to_str()?.to_ascii_lowercase();
        match extension.as_str() {
            "pdf" => Some(FileKind::Pdf),
            "json" => Some(FileKind::Json),
            "xml" => Some(FileKind::Xml),
            "txt" => Some(FileKind::Text),
            "md" | "markdown" => Some(FileKind::Markdown),
            "tsv" => Some(FileKind::Tsv),
            "rtf" => Some(FileKind::Rtf),
            _ => None,
        }
    }

    pub fn mime_type(&self) -> &'static str {
        match self {
            FileKind::Pdf => "application/pdf",
            FileKind::Json => "application/fhir+json",
            FileKind::Xml => "application/fhir+xml",
            FileKind::Text => "text/plain",
            FileKind::Markdown => "text/markdown",
            FileKind::Tsv => "text/tab-separated-values",
            FileKind::Rtf => "application/rtf",
        }
    }

    pub fn fhir_format(&self) -> Option<FhirFormat> {
        match self {
            FileKind::Json => Some(FhirFormat::Json),
            FileKind::Xml => Some(FhirFormat::Xml),
            _ => None,
        }
    }

    /// Kinds whose decoded text becomes the record's searchable content.
    pub fn has_text(&self) -> bool {
        !matches!(self, FileKind::Pdf)
    }
}

pub fn is_pdf(bytes: &[u8]) -> bool {
    bytes.starts_with(PDF_MAGIC)
}

/// Checks one uploaded file and returns its kind.
pub fn validate_upload(filename: &str, bytes: &[u8], max_bytes: usize) -> Result<FileKind, IngestError> {
    let kind = FileKind::from_filename(filename)
        .ok_or_else(|| IngestError::UnsupportedType(filename.to_string()))?;

    if bytes.is_empty() {
        return Err(IngestError::Empty(filename.to_string()));
    }
    if bytes.len() > max_bytes {
        return Err(IngestError::TooLarge {
            filename: filename.to_string(),
            limit: max_bytes,
        });
    }
    if kind == FileKind::Pdf && !is_pdf(bytes) {
        return Err(IngestError::Validation(format!(
            "File '{filename}' is not a valid PDF"
        )));
    }
    if kind == FileKind::Rtf && !rtf::is_rtf(bytes) {
        return Err(IngestError::Validation(format!(
            "File '{filename}' is not a valid RTF document"
        )));
    }
    Ok(kind)
}

/// Text to store as record content. TSV tables are rendered as Markdown and
/// RTF is reduced to plain text.
pub fn extract_text(kind: FileKind, filename: &str, bytes: &[u8]) -> Option<String> {
    if !kind.has_text() {
        return None;
    }
    let text = ehr::decode_text(bytes);
    match kind {
        FileKind::Tsv => ehr::tsv_to_markdown(&text, filename, None).or(Some(text)),
        FileKind::Rtf => Some(rtf::rtf_to_text(&text)),
        _ => Some(text),
    }
}

/// Keeps only the final path component of a client-supplied filename.
pub fn sanitize_filename(filename: &str) -> String {
    let name = filename
        .rsplit(['/', '\\'])
        .next()
        .unwrap_or("")
        .trim()
        .chars()
        .filter(|c| !c.is_control())
        .collect::<String>();
    if name.is_empty() || name == "." || name == ".." {
        "upload".to_string()
    } else {
        name
    }
}

/// Marker for paths confined to the EHR import root.
#[derive(Debug, Clone, Copy)]
pub struct ImportRoot;

pub type ImportBoundary = PathBoundary<ImportRoot>;
pub type ImportPath = StrictPath<ImportRoot>;

/// Opens the configured import root. It must be an existing directory.
pub fn import_boundary(root: &Path) -> Result<ImportBoundary, IngestError> {
    PathBoundary::try_new(root).map_err(IngestError::ImportRoot)
}

/// Joins a client-supplied path onto the import root. Relative paths are
/// taken from the root; absolute ones must already point inside it.
pub fn confine(boundary: &ImportBoundary, raw: &str) -> Result<ImportPath, IngestError> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Err(IngestError::Validation("path must not be empty".into()));
    }
    Ok(boundary.strict_join(raw)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_by_extension() {
        assert_eq!(FileKind::from_filename("scan.PDF"), Some(FileKind::Pdf));
        assert_eq!(FileKind::from_filename("bundle.json"), Some(FileKind::Json));
        assert_eq!(FileKind::from_filename("notes.md"), Some(FileKind::Markdown));
        assert_eq!(FileKind::from_filename("table.tsv"), Some(FileKind::Tsv));
        assert_eq!(FileKind::from_filename("photo.png"), None);
        assert_eq!(FileKind::from_filename("README"), None);
    }

    #[test]
    fn upload_validation() {
        assert!(matches!(
            validate_upload("x.exe", b"MZ", 10),
            Err(IngestError::UnsupportedType(_))
        ));
        assert!(matches!(validate_upload("x.txt", b"", 10), Err(IngestError::Empty(_))));
        assert!(matches!(
            validate_upload("x.txt", b"0123456789A", 10),
            Err(IngestError::TooLarge { limit: 10, .. })
        ));
        assert!(matches!(
            validate_upload("x.pdf", b"not a pdf", 100),
            Err(IngestError::Validation(_))
        ));
        assert_eq!(validate_upload("x.pdf", b"%PDF-1.7\n", 100).unwrap(), FileKind::Pdf);
    }

    #[test]
    fn tsv_content_becomes_markdown() {
        let text = extract_text(FileKind::Tsv, "labs.tsv", b"A\tB\n1\t2\n").unwrap();
        assert!(text.contains("| 1 | 2 |"));
        assert!(extract_text(FileKind::Pdf, "x.pdf", b"%PDF-").is_none());
        assert_eq!(extract_text(FileKind::Text, "a.txt", b"hello").unwrap(), "hello");
    }

    #[test]
    fn filenames_lose_directories() {
        assert_eq!(sanitize_filename("../../etc/passwd"), "passwd");
        assert_eq!(sanitize_filename("C:\\docs\\scan.pdf"), "scan.pdf");
        assert_eq!(sanitize_filename(".."), "upload");
        assert_eq!(sanitize_filename(""), "upload");
    }

    #[test]
    fn rtf_uploads_are_checked_and_flattened() {
        assert_eq!(FileKind::from_filename("note.RTF"), Some(FileKind::Rtf));
        assert!(matches!(
            validate_upload("note.rtf", b"plain text", 100),
            Err(IngestError::Validation(_))
        ));
        let rtf = br"{\rtf1\ansi{\fonttbl{\f0 Arial;}}\f0 Follow up in 2 weeks.\par}";
        assert_eq!(validate_upload("note.rtf", rtf, 100).unwrap(), FileKind::Rtf);
        assert_eq!(
            extract_text(FileKind::Rtf, "note.rtf", rtf).unwrap(),
            "Follow up in 2 weeks."
        );
    }

    fn temp_root() -> std::path::PathBuf {
        let root = std::env::temp_dir().join(format!("medivault-root-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(root.join("export")).unwrap();
        root
    }

    #[test]
    fn paths_are_confined_to_root() {
        let root = temp_root();
        let boundary = import_boundary(&root).unwrap();

        assert!(confine(&boundary, "export").unwrap().is_dir());
        assert!(confine(&boundary, root.join("export").to_str().unwrap()).is_ok());
        assert!(confine(&boundary, "export_Markdown").is_ok());
        assert!(matches!(
            confine(&boundary, "export/../.."),
            Err(IngestError::OutsideRoot(_))
        ));
        assert!(matches!(
            confine(&boundary, "/etc/passwd"),
            Err(IngestError::OutsideRoot(_))
        ));
        assert!(matches!(confine(&boundary, "  "), Err(IngestError::Validation(_))));
    }

    #[test]
    fn missing_import_root_is_reported() {
        let root = std::env::temp_dir().join(format!("medivault-missing-{}", uuid::Uuid::new_v4()));
        assert!(matches!(import_boundary(&root), Err(IngestError::ImportRoot(_))));
    }
}
