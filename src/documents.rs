//! Raw document storage and format detection
//!
//! Retrieved shareholder lists are stored as opaque blobs addressed by
//! company key. Writes go through a temporary file that is fsynced and
//! renamed, so a crash never leaves a half-written document behind a handle.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::io::{Cursor, Read, Write};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use thiserror::Error;
use tracing::debug;

use crate::company::CompanyKey;

/// Minimum number of non-whitespace characters for a PDF to count as having a text layer
pub const MIN_TEXT_LAYER_CHARS: usize = 20;

/// Largest PDF unpacked from an archive
const MAX_ARCHIVED_PDF_BYTES: u64 = 64 * 1024 * 1024;

#[derive(Error, Debug)]
pub enum DocumentError {
    #[error("document I/O failed for {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("document {0} no longer exists")]
    Missing(String),

    #[error("unreadable PDF: {0}")]
    Pdf(String),

    #[error("unreadable archive: {0}")]
    Archive(String),
}

/// Detected content type of a retrieved document
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DocumentFormat {
    Pdf,
    Text,
    Image,
    Archive,
    Unknown,
}

impl DocumentFormat {
    /// Detect the format from the leading bytes
    pub fn sniff(bytes: &[u8]) -> Self {
        let head = &bytes[..bytes.len().min(1024)];
        let trimmed = trim_leading_whitespace(head);

        if trimmed.starts_with(b"%PDF-") {
            DocumentFormat::Pdf
        } else if head.starts_with(b"II*\0")
            || head.starts_with(b"MM\0*")
            || head.starts_with(b"\x89PNG\r\n\x1a\n")
            || head.starts_with(&[0xFF, 0xD8, 0xFF])
        {
            DocumentFormat::Image
        } else if head.starts_with(b"PK\x03\x04") {
            DocumentFormat::Archive
        } else if looks_like_text(bytes) {
            DocumentFormat::Text
        } else {
            DocumentFormat::Unknown
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            DocumentFormat::Pdf => "pdf",
            DocumentFormat::Text => "text",
            DocumentFormat::Image => "image",
            DocumentFormat::Archive => "archive",
            DocumentFormat::Unknown => "unknown",
        }
    }

    pub fn extension(&self) -> &'static str {
        match self {
            DocumentFormat::Pdf => "pdf",
            DocumentFormat::Text => "txt",
            DocumentFormat::Image => "img",
            DocumentFormat::Archive => "zip",
            DocumentFormat::Unknown => "bin",
        }
    }
}

impl fmt::Display for DocumentFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DocumentFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pdf" => Ok(DocumentFormat::Pdf),
            "text" => Ok(DocumentFormat::Text),
            "image" => Ok(DocumentFormat::Image),
            "archive" => Ok(DocumentFormat::Archive),
            "unknown" => Ok(DocumentFormat::Unknown),
            other => Err(format!("unknown document format '{}'", other)),
        }
    }
}

/// UTF-8, or single-byte text without NULs and with few control characters
fn looks_like_text(bytes: &[u8]) -> bool {
    if bytes.is_empty() {
        return false;
    }
    if std::str::from_utf8(bytes).is_ok() {
        return true;
    }
    if bytes.contains(&0) {
        return false;
    }
    let control = bytes
        .iter()
        .filter(|&&b| b < 0x20 && !matches!(b, b'\t' | b'\n' | b'\r' | 0x0C))
        .count();
    control * 20 < bytes.len()
}

fn trim_leading_whitespace(bytes: &[u8]) -> &[u8] {
    let start = bytes
        .iter()
        .position(|b| !b.is_ascii_whitespace())
        .unwrap_or(bytes.len());
    &bytes[start..]
}

/// Reference to a stored document. Never mutated; a re-fetch yields a new handle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentHandle {
    /// Location inside the document store (file name for [`FsDocumentStore`])
    pub location: String,
    pub format: DocumentFormat,
    pub size: u64,
    pub fetched_at: DateTime<Utc>,
}

/// Blob storage for retrieved documents
pub trait DocumentStore: Send + Sync {
    fn put(&self, key: &CompanyKey, bytes: &[u8], format: DocumentFormat) -> Result<DocumentHandle, DocumentError>;

    fn get(&self, handle: &DocumentHandle) -> Result<Vec<u8>, DocumentError>;

    /// Remove a stored document; removing an absent document is not an error
    fn remove(&self, handle: &DocumentHandle) -> Result<(), DocumentError>;
}

/// Documents as files below one directory
#[derive(Debug, Clone)]
pub struct FsDocumentStore {
    root: PathBuf,
}

impl FsDocumentStore {
    /// Open (and create if needed) a document directory
    pub fn open(root: impl Into<PathBuf>) -> Result<Self, DocumentError> {
        let root = root.into();
        fs::create_dir_all(&root).map_err(|source| DocumentError::Io {
            path: root.clone(),
            source,
        })?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn path_of(&self, handle: &DocumentHandle) -> PathBuf {
        self.root.join(&handle.location)
    }
}

impl DocumentStore for FsDocumentStore {
    fn put(&self, key: &CompanyKey, bytes: &[u8], format: DocumentFormat) -> Result<DocumentHandle, DocumentError> {
        let fetched_at = Utc::now();
        let location = format!(
            "{}-{}.{}",
            key.file_stem(),
            fetched_at.format("%Y%m%dT%H%M%S%6f"),
            format.extension()
        );
        let path = self.root.join(&location);
        let temp_path = self.root.join(format!(".{}.tmp", location));

        let io_err = |source: std::io::Error| DocumentError::Io {
            path: path.clone(),
            source,
        };

        {
            let mut file = fs::File::create(&temp_path).map_err(io_err)?;
            file.write_all(bytes).map_err(io_err)?;
            file.sync_all().map_err(io_err)?;
        }
        fs::rename(&temp_path, &path).map_err(io_err)?;

        debug!("Stored {} bytes for {} at {}", bytes.len(), key, path.display());

        Ok(DocumentHandle {
            location,
            format,
            size: bytes.len() as u64,
            fetched_at,
        })
    }

    fn get(&self, handle: &DocumentHandle) -> Result<Vec<u8>, DocumentError> {
        let path = self.path_of(handle);
        fs::read(&path).map_err(|source| {
            if source.kind() == std::io::ErrorKind::NotFound {
                DocumentError::Missing(handle.location.clone())
            } else {
                DocumentError::Io { path, source }
            }
        })
    }

    fn remove(&self, handle: &DocumentHandle) -> Result<(), DocumentError> {
        let path = self.path_of(handle);
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(source) if source.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(source) => Err(DocumentError::Io { path, source }),
        }
    }
}

/// Plain text of a document.
///
/// PDFs are read through their text layer; text documents are decoded as
/// UTF-8, falling back to Latin-1 for legacy exports.
pub fn document_text(bytes: &[u8], format: DocumentFormat) -> Result<String, DocumentError> {
    match format {
        DocumentFormat::Pdf => pdf_text(bytes),
        _ => Ok(match std::str::from_utf8(bytes) {
            Ok(text) => text.to_string(),
            Err(_) => bytes.iter().map(|&b| b as char).collect(),
        }),
    }
}

fn pdf_text(bytes: &[u8]) -> Result<String, DocumentError> {
    let document = lopdf::Document::load_mem(bytes).map_err(|e| DocumentError::Pdf(e.to_string()))?;
    let pages: Vec<u32> = document.get_pages().keys().copied().collect();
    if pages.is_empty() {
        return Ok(String::new());
    }
    document
        .extract_text(&pages)
        .map_err(|e| DocumentError::Pdf(e.to_string()))
}

/// First `*.pdf` entry of a ZIP archive, if there is one
pub fn archived_pdf(bytes: &[u8]) -> Result<Option<Vec<u8>>, DocumentError> {
    let archive_err = |e: zip::result::ZipError| DocumentError::Archive(e.to_string());
    let mut archive = zip::ZipArchive::new(Cursor::new(bytes)).map_err(archive_err)?;

    for index in 0..archive.len() {
        let entry = archive.by_index(index).map_err(archive_err)?;
        if !entry.is_file() || !entry.name().to_ascii_lowercase().ends_with(".pdf") {
            continue;
        }
        if entry.size() > MAX_ARCHIVED_PDF_BYTES {
            return Err(DocumentError::Archive(format!(
                "{} unpacks to {} bytes",
                entry.name(),
                entry.size()
            )));
        }

        let name = entry.name().to_string();
        let mut pdf = Vec::with_capacity(entry.size() as usize);
        entry
            .take(MAX_ARCHIVED_PDF_BYTES)
            .read_to_end(&mut pdf)
            .map_err(|e| DocumentError::Archive(format!("{}: {}", name, e)))?;
        debug!("Unpacked {} ({} bytes) from archive", name, pdf.len());
        return Ok(Some(pdf));
    }
    Ok(None)
}

/// Whether extracted text carries enough content to be worth parsing
pub fn has_text_layer(text: &str) -> bool {
    text.chars().filter(|c| !c.is_whitespace()).count() >= MIN_TEXT_LAYER_CHARS
}
