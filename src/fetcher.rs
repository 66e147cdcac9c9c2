//! Document retrieval
//!
//! A [`Fetcher`] performs exactly one retrieval attempt per call: it takes a
//! grant from the rate governor (unless the caller already holds one), asks
//! its [`DocumentSource`] for the raw bytes, classifies what came back and
//! stores acceptable documents.

use reqwest::header::{CONTENT_TYPE, RETRY_AFTER};
use reqwest::{Client, StatusCode};
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::company::CompanyRecord;
use crate::config::{FetchBackend, FetchConfig};
use crate::documents::{
    archived_pdf, document_text, has_text_layer, DocumentError, DocumentFormat, DocumentHandle, DocumentStore,
};
use crate::rate_limit::{RateGovernor, RateStateStore};
use crate::store::Outcome;

/// Phrases of register pages served instead of a document when throttled
const BLOCK_MARKERS: &[&str] = &[
    "too many requests",
    "zu viele anfragen",
    "captcha",
    "zugriff verweigert",
    "access denied",
    "temporarily blocked",
    "vorübergehend gesperrt",
];

/// Only the head of an HTML body is searched for block markers
const BLOCK_SCAN_BYTES: usize = 64 * 1024;

/// File extensions tried by [`DirectorySource`], in order
const DIRECTORY_EXTENSIONS: &[&str] = &["pdf", "txt", "tif", "tiff", "png", "jpg", "jpeg", "zip"];

/// Raw answer of a document source, before format checks
#[derive(Debug, Clone, PartialEq)]
pub enum Retrieval {
    Document {
        bytes: Vec<u8>,
        content_type: Option<String>,
    },
    NotFound(String),
    Throttled {
        reason: String,
        retry_after: Option<Duration>,
    },
    Failed(String),
}

/// Transport that can produce the shareholder-list document for a company
pub trait DocumentSource: Send + Sync {
    fn name(&self) -> &str;

    fn retrieve(&self, company: &CompanyRecord) -> impl Future<Output = Retrieval> + Send;
}

/// Document gateway reached over HTTP
#[derive(Debug, Clone)]
pub struct HttpSource {
    client: Client,
    url_template: String,
}

impl HttpSource {
    pub fn new(config: &FetchConfig) -> Result<Self, reqwest::Error> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .user_agent(&config.user_agent)
            .build()?;

        Ok(Self {
            client,
            url_template: config.url_template.clone(),
        })
    }

    /// Substitute the template placeholders, percent-encoding each value
    pub fn render_url(&self, company: &CompanyRecord) -> Result<url::Url, String> {
        let encode = |value: &str| url::form_urlencoded::byte_serialize(value.as_bytes()).collect::<String>();

        let rendered = self
            .url_template
            .replace("{key}", &encode(company.key.as_str()))
            .replace("{register}", &encode(&company.register))
            .replace("{court}", &encode(company.court.as_deref().unwrap_or("")))
            .replace("{name}", &encode(&company.name));

        url::Url::parse(&rendered).map_err(|e| format!("invalid document URL {}: {}", rendered, e))
    }
}

impl DocumentSource for HttpSource {
    fn name(&self) -> &str {
        "http"
    }

    async fn retrieve(&self, company: &CompanyRecord) -> Retrieval {
        let url = match self.render_url(company) {
            Ok(url) => url,
            Err(reason) => return Retrieval::Failed(reason),
        };

        debug!("GET {} for {}", url, company.key);
        let response = match self.client.get(url).send().await {
            Ok(response) => response,
            Err(e) if e.is_timeout() => return Retrieval::Failed(format!("request timed out: {}", e)),
            Err(e) => return Retrieval::Failed(format!("request failed: {}", e)),
        };

        let status = response.status();
        let retry_after = response
            .headers()
            .get(RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse::<u64>().ok())
            .map(Duration::from_secs);

        match status {
            StatusCode::NOT_FOUND | StatusCode::GONE => {
                return Retrieval::NotFound(format!("register answered HTTP {}", status));
            }
            StatusCode::TOO_MANY_REQUESTS | StatusCode::FORBIDDEN => {
                return Retrieval::Throttled {
                    reason: format!("register answered HTTP {}", status),
                    retry_after,
                };
            }
            s if !s.is_success() => return Retrieval::Failed(format!("register answered HTTP {}", status)),
            _ => {}
        }

        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);

        let bytes = match response.bytes().await {
            Ok(bytes) => bytes.to_vec(),
            Err(e) => return Retrieval::Failed(format!("reading response body failed: {}", e)),
        };

        if let Some(marker) = block_marker(&bytes, content_type.as_deref()) {
            return Retrieval::Throttled {
                reason: format!("block page served ({})", marker),
                retry_after,
            };
        }

        Retrieval::Document { bytes, content_type }
    }
}

/// Block marker found in an HTML answer, if any
fn block_marker(bytes: &[u8], content_type: Option<&str>) -> Option<&'static str> {
    let is_html = content_type.is_some_and(|ct| ct.to_ascii_lowercase().contains("html"))
        || bytes.iter().find(|b| !b.is_ascii_whitespace()) == Some(&b'<');
    if !is_html {
        return None;
    }

    let head = &bytes[..bytes.len().min(BLOCK_SCAN_BYTES)];
    let text = String::from_utf8_lossy(head).to_lowercase();
    BLOCK_MARKERS.iter().copied().find(|marker| text.contains(marker))
}

/// Pre-downloaded documents named after the company key
#[derive(Debug, Clone)]
pub struct DirectorySource {
    dir: PathBuf,
}

impl DirectorySource {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }
}

impl DocumentSource for DirectorySource {
    fn name(&self) -> &str {
        "directory"
    }

    async fn retrieve(&self, company: &CompanyRecord) -> Retrieval {
        let stem = company.key.file_stem();

        for ext in DIRECTORY_EXTENSIONS {
            let path = self.dir.join(format!("{}.{}", stem, ext));
            match tokio::fs::read(&path).await {
                Ok(bytes) => {
                    debug!("Read {} bytes from {}", bytes.len(), path.display());
                    return Retrieval::Document {
                        bytes,
                        content_type: None,
                    };
                }
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => return Retrieval::Failed(format!("reading {} failed: {}", path.display(), e)),
            }
        }

        Retrieval::NotFound(format!("no file named {}.* in {}", stem, self.dir.display()))
    }
}

/// Source selected by `[fetch] backend`
#[derive(Debug, Clone)]
pub enum ConfiguredSource {
    Http(HttpSource),
    Directory(DirectorySource),
}

impl ConfiguredSource {
    pub fn from_config(config: &FetchConfig) -> Result<Self, reqwest::Error> {
        Ok(match config.backend {
            FetchBackend::Http => Self::Http(HttpSource::new(config)?),
            FetchBackend::Directory => Self::Directory(DirectorySource::new(&config.source_dir)),
        })
    }
}

impl DocumentSource for ConfiguredSource {
    fn name(&self) -> &str {
        match self {
            Self::Http(source) => source.name(),
            Self::Directory(source) => source.name(),
        }
    }

    async fn retrieve(&self, company: &CompanyRecord) -> Retrieval {
        match self {
            Self::Http(source) => source.retrieve(company).await,
            Self::Directory(source) => source.retrieve(company).await,
        }
    }
}

#[derive(Error, Debug)]
pub enum FetchFailure {
    #[error("no document: {0}")]
    NotFound(String),

    #[error("transient failure: {0}")]
    Transient(String),

    #[error("register throttled: {0}")]
    RateBlocked(String),

    #[error("unsupported document: {reason}")]
    UnsupportedFormat {
        reason: String,
        document: Option<DocumentHandle>,
    },

    #[error("interrupted before retrieval")]
    Cancelled,

    #[error("document store failed: {0}")]
    Storage(#[from] DocumentError),
}

impl FetchFailure {
    /// Work-store outcome for this failure; `None` when the lease should simply be released
    pub fn into_outcome(self) -> Option<Outcome> {
        match self {
            FetchFailure::NotFound(reason) => Some(Outcome::NotFound(reason)),
            FetchFailure::Transient(reason) => Some(Outcome::FetchFailed(reason)),
            FetchFailure::RateBlocked(reason) => Some(Outcome::FetchFailed(format!("rate blocked: {}", reason))),
            FetchFailure::UnsupportedFormat { reason, document } => Some(Outcome::Unsupported { document, reason }),
            FetchFailure::Cancelled | FetchFailure::Storage(_) => None,
        }
    }
}

/// Rate-governed retrieval plus format classification
pub struct Fetcher<S, R> {
    source: S,
    governor: RateGovernor<R>,
    documents: Arc<dyn DocumentStore>,
}

impl<S: DocumentSource, R: RateStateStore> Fetcher<S, R> {
    pub fn new(source: S, governor: RateGovernor<R>, documents: Arc<dyn DocumentStore>) -> Self {
        info!("Fetching documents via {} source", source.name());
        Self {
            source,
            governor,
            documents,
        }
    }

    pub fn governor(&self) -> &RateGovernor<R> {
        &self.governor
    }

    pub fn documents(&self) -> &Arc<dyn DocumentStore> {
        &self.documents
    }

    /// One governed retrieval attempt for `company`
    pub async fn fetch(&self, company: &CompanyRecord) -> Result<DocumentHandle, FetchFailure> {
        if self.governor.acquire().await.is_none() {
            return Err(FetchFailure::Cancelled);
        }
        self.fetch_granted(company).await
    }

    /// Retrieval attempt for a caller that already holds a governor grant
    pub async fn fetch_granted(&self, company: &CompanyRecord) -> Result<DocumentHandle, FetchFailure> {
        match self.source.retrieve(company).await {
            Retrieval::Document { bytes, content_type } => self.accept(company, bytes, content_type.as_deref()),
            Retrieval::NotFound(reason) => Err(FetchFailure::NotFound(reason)),
            Retrieval::Failed(reason) => Err(FetchFailure::Transient(reason)),
            Retrieval::Throttled { reason, retry_after } => {
                let configured = self.governor.config().rate_blocked_pause();
                let pause = retry_after.map_or(configured, |r| r.max(configured));
                match self.governor.pause_for(pause) {
                    Ok(until) => warn!("{}: register throttled ({}), pausing lookups until {}", company.key, reason, until),
                    Err(e) => error!("{}: could not persist rate block: {}", company.key, e),
                }
                Err(FetchFailure::RateBlocked(reason))
            }
        }
    }

    fn accept(
        &self,
        company: &CompanyRecord,
        bytes: Vec<u8>,
        content_type: Option<&str>,
    ) -> Result<DocumentHandle, FetchFailure> {
        if bytes.is_empty() {
            return Err(FetchFailure::Transient("empty document".to_string()));
        }

        let format = DocumentFormat::sniff(&bytes);
        match format {
            DocumentFormat::Pdf => self.accept_pdf(company, &bytes),
            DocumentFormat::Text => Ok(self.documents.put(&company.key, &bytes, format)?),
            DocumentFormat::Image => Err(self.unsupported(company, &bytes, format, "scanned image")),
            DocumentFormat::Archive => match archived_pdf(&bytes) {
                Ok(Some(pdf)) => {
                    debug!("{}: archive holds a PDF of {} bytes", company.key, pdf.len());
                    self.accept_pdf(company, &pdf)
                }
                Ok(None) => Err(self.unsupported(company, &bytes, format, "archive without PDF")),
                Err(e) => Err(self.unsupported(company, &bytes, format, &e.to_string())),
            },
            DocumentFormat::Unknown => {
                let reason = format!("unrecognised content ({})", content_type.unwrap_or("no content type"));
                Err(self.unsupported(company, &bytes, format, &reason))
            }
        }
    }

    /// Store a PDF with a text layer; image-only PDFs go to review.
    ///
    /// A PDF that does not load is stored as well and fails in the parse phase.
    fn accept_pdf(&self, company: &CompanyRecord, bytes: &[u8]) -> Result<DocumentHandle, FetchFailure> {
        match document_text(bytes, DocumentFormat::Pdf) {
            Ok(text) if has_text_layer(&text) => Ok(self.documents.put(&company.key, bytes, DocumentFormat::Pdf)?),
            Ok(_) => Err(self.unsupported(company, bytes, DocumentFormat::Pdf, "PDF has no text layer")),
            Err(e) => {
                warn!("{}: stored PDF does not load, leaving it to the parse phase: {}", company.key, e);
                Ok(self.documents.put(&company.key, bytes, DocumentFormat::Pdf)?)
            }
        }
    }

    /// Keep the document for manual review even though it cannot be parsed
    fn unsupported(&self, company: &CompanyRecord, bytes: &[u8], format: DocumentFormat, reason: &str) -> FetchFailure {
        let document = match self.documents.put(&company.key, bytes, format) {
            Ok(handle) => Some(handle),
            Err(e) => {
                warn!("{}: could not keep unsupported document: {}", company.key, e);
                None
            }
        };
        FetchFailure::UnsupportedFormat {
            reason: reason.to_string(),
            document,
        }
    }
}
