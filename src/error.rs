//! Error types for the invoice-extract library.
//!
//! Three error types reflect three distinct failure scopes:
//!
//! * [`ExtractError`] — **Fatal for the run**: the batch cannot proceed at
//!   all (bad configuration, unreadable schema, provider not configured,
//!   report cannot be written). Returned as `Err(ExtractError)` from the
//!   top-level `run_batch*` functions.
//!
//! * [`DocumentError`] — **Fatal for one document**: a file could not be
//!   read or rendered, or a model call failed part-way through the page
//!   sequence. Recorded in the document's [`crate::report::DocumentEntry`]
//!   so the batch continues with the next file.
//!
//! * [`ModelError`] — a single model or analysis-service call failed. The
//!   invocation adapters use [`ModelError::is_transient`] to decide whether
//!   a retry is worthwhile before the failure becomes a [`DocumentError`].

use std::path::PathBuf;
use thiserror::Error;

/// All fatal errors returned by the invoice-extract library.
///
/// Document-level failures use [`DocumentError`] and are stored in the
/// batch report rather than propagated here.
#[derive(Debug, Error)]
pub enum ExtractError {
    // ── Input errors ──────────────────────────────────────────────────────
    /// The configured source folder does not exist or cannot be listed.
    #[error("Cannot read source folder '{path}': {source}")]
    SourceFolderUnreadable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    // ── Schema errors ─────────────────────────────────────────────────────
    /// The extraction schema file could not be read.
    #[error("Failed to read extraction schema '{path}': {source}")]
    SchemaUnreadable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The extraction schema file is not a usable JSON Schema document.
    #[error("Invalid extraction schema '{path}': {detail}")]
    InvalidSchema { path: PathBuf, detail: String },

    // ── Model errors ──────────────────────────────────────────────────────
    /// The configured model or analysis service is not initialised.
    #[error("Model provider '{provider}' is not configured.\n{hint}")]
    ProviderNotConfigured { provider: String, hint: String },

    // ── Pdfium binding errors ─────────────────────────────────────────────
    /// Could not bind to a pdfium library.
    #[error(
        "Failed to bind to pdfium library: {0}\n\
Set PDFIUM_LIB_PATH to the directory containing libpdfium, \
or install pdfium system-wide."
    )]
    PdfiumBindingFailed(String),

    // ── I/O errors ────────────────────────────────────────────────────────
    /// Could not create or write the output report file.
    #[error("Failed to write output file '{path}': {source}")]
    OutputWriteFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Could not read or parse an analysis result file for reformatting.
    #[error("Failed to read result file '{path}': {detail}")]
    ResultFileUnreadable { path: PathBuf, detail: String },

    // ── Config errors ─────────────────────────────────────────────────────
    /// Builder validation failed.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    // ── Catch-all ─────────────────────────────────────────────────────────
    /// Unexpected internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

/// A failure that aborts one document while the batch continues.
///
/// Partial extraction state is discarded when one of these is raised; the
/// message is kept in the report entry for the failed file.
#[derive(Debug, Clone, Error, serde::Serialize, serde::Deserialize)]
pub enum DocumentError {
    /// The source document could not be read from disk.
    #[error("Failed to read '{path}': {detail}")]
    ReadFailed { path: PathBuf, detail: String },

    /// The file was read but is not a PDF.
    #[error("File is not a valid PDF: '{path}' (first bytes: {magic:?})")]
    NotAPdf { path: PathBuf, magic: [u8; 4] },

    /// pdfium could not open the document.
    #[error("PDF is corrupt or encrypted: {detail}")]
    CorruptPdf { detail: String },

    /// A page could not be rasterised or encoded.
    #[error("Rasterisation failed for page {page}: {detail}")]
    RasterisationFailed { page: usize, detail: String },

    /// The page source produced no pages.
    #[error("Document has no pages")]
    EmptyDocument,

    /// The model call for a page failed after any adapter-level retries.
    #[error("Page {page}: model call failed: {detail}")]
    ModelFailed { page: usize, detail: String },

    /// The model reply for a page is not a JSON object.
    #[error("Page {page}: reply violates the extraction schema: {detail}")]
    SchemaViolation { page: usize, detail: String },

    /// The document-analysis service rejected or failed the document.
    #[error("Document analysis failed: {detail}")]
    AnalysisFailed { detail: String },

    /// Internal task failure (e.g. the render task panicked).
    #[error("Internal error: {0}")]
    Internal(String),
}

/// A failed call to a model or analysis endpoint.
#[derive(Debug, Clone, Error)]
pub enum ModelError {
    /// HTTP 401/403: the key is wrong or lacks access.
    #[error("Authentication error from '{provider}': {detail}")]
    Auth { provider: String, detail: String },

    /// HTTP 429: the caller should back off.
    #[error("Rate limit exceeded for '{provider}'")]
    RateLimited {
        provider: String,
        retry_after_secs: Option<u64>,
    },

    /// The request did not complete in time.
    #[error("Request to '{provider}' timed out")]
    Timeout { provider: String },

    /// Any other non-success HTTP status.
    #[error("'{provider}' returned HTTP {status}: {body}")]
    Http {
        provider: String,
        status: u16,
        body: String,
    },

    /// Connection-level failure before a status was received.
    #[error("Network error talking to '{provider}': {detail}")]
    Network { provider: String, detail: String },

    /// The response body did not have the expected shape.
    #[error("Malformed response from '{provider}': {detail}")]
    MalformedResponse { provider: String, detail: String },

    /// The model declined to answer or its output was filtered.
    #[error("'{provider}' refused the request: {detail}")]
    Refused { provider: String, detail: String },

    /// A long-running operation was still unfinished after the last poll.
    #[error("'{provider}' operation still running after {polls} polls")]
    PollingExhausted { provider: String, polls: u32 },

    /// Error surfaced by the edgequake-llm provider layer.
    #[error("LLM provider error: {0}")]
    Provider(String),
}

impl ModelError {
    /// Classify a non-success HTTP status.
    pub fn from_status(
        provider: &str,
        status: u16,
        retry_after_secs: Option<u64>,
        body: String,
    ) -> Self {
        let provider = provider.to_string();
        match status {
            401 | 403 => ModelError::Auth {
                provider,
                detail: body,
            },
            429 => ModelError::RateLimited {
                provider,
                retry_after_secs,
            },
            408 | 504 => ModelError::Timeout { provider },
            _ => ModelError::Http {
                provider,
                status,
                body,
            },
        }
    }

    /// Classify a transport-level reqwest failure.
    pub fn from_transport(provider: &str, err: &reqwest::Error) -> Self {
        if err.is_timeout() {
            ModelError::Timeout {
                provider: provider.to_string(),
            }
        } else {
            ModelError::Network {
                provider: provider.to_string(),
                detail: err.to_string(),
            }
        }
    }

    /// Classify an error reported by an edgequake-llm provider.
    ///
    /// Provider errors only reach us as text, so an HTTP status found in
    /// the message or a well-known phrase decides the class. Anything
    /// unrecognised stays [`ModelError::Provider`].
    pub fn from_provider_message(provider: &str, message: &str) -> Self {
        let lower = message.to_lowercase();
        let has = |needles: &[&str]| needles.iter().any(|n| lower.contains(n));
        let status = lower
            .split(|c: char| !c.is_ascii_digit())
            .filter(|token| token.len() == 3)
            .filter_map(|token| token.parse::<u16>().ok())
            .find(|code| (400..600).contains(code));
        let provider = provider.to_string();

        if matches!(status, Some(401 | 403))
            || has(&[
                "unauthorized",
                "authentication",
                "api key",
                "api_key",
                "permission denied",
                "forbidden",
            ])
        {
            return ModelError::Auth {
                provider,
                detail: message.to_string(),
            };
        }
        if status == Some(429) || has(&["rate limit", "rate_limit", "too many requests"]) {
            return ModelError::RateLimited {
                provider,
                retry_after_secs: None,
            };
        }
        if matches!(status, Some(408 | 504)) || has(&["timed out", "timeout"]) {
            return ModelError::Timeout { provider };
        }
        if let Some(status) = status {
            return ModelError::Http {
                provider,
                status,
                body: message.to_string(),
            };
        }
        if has(&["bad request", "invalid request", "invalid_request"]) {
            return ModelError::Http {
                provider,
                status: 400,
                body: message.to_string(),
            };
        }
        ModelError::Provider(message.to_string())
    }

    /// Whether retrying the same request may succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            ModelError::RateLimited { .. } | ModelError::Timeout { .. } => true,
            ModelError::Network { .. } => true,
            ModelError::Http { status, .. } => *status >= 500,
            ModelError::Provider(_) => true,
            ModelError::Auth { .. }
            | ModelError::MalformedResponse { .. }
            | ModelError::Refused { .. }
            | ModelError::PollingExhausted { .. } => false,
        }
    }

    /// Server-requested delay before retrying, if any.
    pub fn retry_after_secs(&self) -> Option<u64> {
        match self {
            ModelError::RateLimited {
                retry_after_secs, ..
            } => *retry_after_secs,
            _ => None,
        }
    }
}
