//! Error types for the edgequake-pdf2html library.
//!
//! Two distinct error types reflect two distinct failure modes:
//!
//! * [`Pdf2HtmlError`]: **Fatal**: the task cannot proceed at all (bad
//!   input file, corrupt PDF, provider not configured). A task that hits one
//!   of these during extraction ends in `Failed` with no combined document.
//!
//! * [`PageError`]: **Page-scoped**: a single page's generation, render or
//!   scoring step failed. Stored inside [`crate::output::PageResult`] and in
//!   the task's error list so the rest of the document still assembles.
//!
//! ## Why two types?
//!
//! The orchestrator pattern-matches on these instead of unwinding: only a
//! `Pdf2HtmlError` out of extraction ends a task, everything a
//! `PageError` touches degrades to a fallback page.

use std::path::PathBuf;
use thiserror::Error;

use crate::task::{TaskId, TaskStatus};

/// All fatal errors returned by the edgequake-pdf2html library.
#[derive(Debug, Error)]
pub enum Pdf2HtmlError {
    // ── Input errors ──────────────────────────────────────────────────────
    /// Input file was not found at the given path.
    #[error("PDF file not found: '{path}'\nCheck the path exists and is readable.")]
    FileNotFound { path: PathBuf },

    /// Process does not have read permission on the file.
    #[error("Permission denied reading '{path}'\nTry: chmod +r {path:?}")]
    PermissionDenied { path: PathBuf },

    /// The input string is not a valid file path or URL.
    #[error("Invalid input '{input}': not a file path or a valid HTTP/HTTPS URL")]
    InvalidInput { input: String },

    /// HTTP URL was syntactically valid but download failed.
    #[error("Failed to download '{url}': {reason}\nCheck your internet connection.")]
    DownloadFailed { url: String, reason: String },

    /// Download exceeded the configured timeout.
    #[error("Download timed out after {secs}s for '{url}'\nIncrease --download-timeout.")]
    DownloadTimeout { url: String, secs: u64 },

    /// The bytes were read, but they are not a PDF.
    #[error("Input is not a valid PDF: '{path}'\nFirst bytes: {magic:?}")]
    NotAPdf { path: PathBuf, magic: [u8; 4] },

    /// Uploaded payload exceeds the configured size limit.
    #[error("Upload of {size} bytes exceeds the {limit} byte limit")]
    PayloadTooLarge { size: usize, limit: usize },

    // ── Extraction errors ─────────────────────────────────────────────────
    /// PDF header/trailer/xref is corrupt and cannot be parsed.
    #[error(
        "PDF '{path}' is corrupt: {detail}\n\
         Try repairing with: qpdf --decrypt input.pdf output.pdf"
    )]
    CorruptPdf { path: PathBuf, detail: String },

    /// PDF requires a password but none was provided.
    #[error(
        "PDF '{path}' is encrypted and requires a password.\n\
         Provide it with --password <PASSWORD>."
    )]
    PasswordRequired { path: PathBuf },

    /// A password was provided but it is wrong.
    #[error("Wrong password for PDF '{path}'")]
    WrongPassword { path: PathBuf },

    /// The document opened but has nothing to convert.
    #[error("PDF '{path}' has no pages to convert")]
    EmptyDocument { path: PathBuf },

    /// pdfium-render returned an error for a specific page.
    #[error("Rasterisation failed for page {page}: {detail}")]
    RasterisationFailed { page: usize, detail: String },

    /// Could not bind to a pdfium library.
    #[error(
        "Failed to bind to pdfium library: {0}\n\
Set PDFIUM_LIB_PATH=/path/to/libpdfium or install pdfium system-wide."
    )]
    PdfiumBindingFailed(String),

    // ── Collaborator setup ────────────────────────────────────────────────
    /// The configured provider is not initialised (missing API key etc.).
    #[error("LLM provider '{provider}' is not configured.\n{hint}")]
    ProviderNotConfigured { provider: String, hint: String },

    /// No usable headless browser for screenshot capture.
    #[error("Renderer unavailable: {0}\nInstall Chrome/Chromium or pass --browser <PATH>.")]
    RendererUnavailable(String),

    // ── Task lifecycle ────────────────────────────────────────────────────
    /// No task with this id is registered (never created, or cleaned up).
    #[error("Task {0} not found")]
    TaskNotFound(TaskId),

    /// A status change would move a task backwards or skip a stage.
    #[error("Task {task_id}: invalid status transition {from:?} → {to:?}")]
    InvalidTransition {
        task_id: TaskId,
        from: TaskStatus,
        to: TaskStatus,
    },

    /// The task's cancellation token fired before extraction finished.
    #[error("Task {0} was cancelled")]
    Cancelled(TaskId),

    // ── I/O errors ────────────────────────────────────────────────────────
    /// Could not create or write the output HTML file.
    #[error("Failed to write output file '{path}': {source}")]
    OutputWriteFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    // ── Config errors ─────────────────────────────────────────────────────
    /// Builder validation failed.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    // ── Catch-all ─────────────────────────────────────────────────────────
    /// Unexpected internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Pdf2HtmlError {
    /// Short machine-readable code carried by `Error` progress events and
    /// HTTP error bodies.
    pub fn code(&self) -> &'static str {
        match self {
            Self::FileNotFound { .. } | Self::PermissionDenied { .. } => "input_unreadable",
            Self::InvalidInput { .. } | Self::NotAPdf { .. } => "invalid_input",
            Self::PayloadTooLarge { .. } => "payload_too_large",
            Self::DownloadFailed { .. } | Self::DownloadTimeout { .. } => "download_failed",
            Self::CorruptPdf { .. }
            | Self::PasswordRequired { .. }
            | Self::WrongPassword { .. }
            | Self::EmptyDocument { .. }
            | Self::RasterisationFailed { .. }
            | Self::PdfiumBindingFailed(_) => "extraction_failed",
            Self::ProviderNotConfigured { .. } | Self::RendererUnavailable(_) => {
                "collaborator_unavailable"
            }
            Self::TaskNotFound(_) => "task_not_found",
            Self::InvalidTransition { .. } => "invalid_transition",
            Self::Cancelled(_) => "cancelled",
            Self::OutputWriteFailed { .. } => "output_write_failed",
            Self::InvalidConfig(_) => "invalid_config",
            Self::Internal(_) => "internal",
        }
    }
}

/// A non-fatal error for a single page.
///
/// Recorded in [`crate::output::PageResult::error`] and, as a string, in the
/// owning task's error list. The task keeps going.
#[derive(Debug, Clone, PartialEq, Error, serde::Serialize, serde::Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PageError {
    /// Initial generation or a refinement call failed.
    #[error("Page {page}: generation failed: {detail}")]
    GenerationFailed { page: usize, detail: String },

    /// The renderer could not produce a screenshot.
    #[error("Page {page}: render failed: {detail}")]
    RenderFailed { page: usize, detail: String },

    /// Similarity scoring failed. The runner substitutes a default score.
    #[error("Page {page}: similarity scoring failed: {detail}")]
    ScoringFailed { page: usize, detail: String },

    /// A collaborator call exceeded the per-call timeout.
    #[error("Page {page}: {operation} timed out after {secs}s")]
    Timeout {
        page: usize,
        operation: String,
        secs: u64,
    },

    /// The task was cancelled before or while this page ran.
    #[error("Page {page}: cancelled")]
    Cancelled { page: usize },
}

impl PageError {
    /// Short machine-readable code for this error.
    pub fn kind(&self) -> &'static str {
        match self {
            PageError::GenerationFailed { .. } => "generation_failed",
            PageError::RenderFailed { .. } => "render_failed",
            PageError::ScoringFailed { .. } => "scoring_failed",
            PageError::Timeout { .. } => "timeout",
            PageError::Cancelled { .. } => "cancelled",
        }
    }

    /// Page number the error belongs to.
    pub fn page(&self) -> usize {
        match self {
            PageError::GenerationFailed { page, .. }
            | PageError::RenderFailed { page, .. }
            | PageError::ScoringFailed { page, .. }
            | PageError::Timeout { page, .. }
            | PageError::Cancelled { page } => *page,
        }
    }
}
