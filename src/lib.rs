//! # edgequake-pdf2html
//!
//! Convert PDF documents to HTML with a Vision Language Model, refining each
//! page against a browser screenshot of its own output.
//!
//! ## Why iterate?
//!
//! A VLM's first attempt at a page usually gets the text right and the
//! layout roughly right. Showing it the reference page next to a screenshot
//! of what its HTML actually renders to lets it fix spacing, columns, fonts
//! and colours it cannot judge from the reference alone. The loop is
//! bounded by `max_iterations`; there is no "good enough" early exit.
//!
//! ## Pipeline Overview
//!
//! ```text
//! PDF
//!  │
//!  ├─ 1. Input     local file, URL download or uploaded bytes
//!  ├─ 2. Extract   rasterise pages via pdfium (spawn_blocking)
//!  ├─ 3. Generate  page image → HTML draft (VLM, rate-gated)
//!  ├─ 4. Refine    draft → screenshot (headless Chrome) → better draft, × N
//!  ├─ 5. Assemble  page bodies in page order, one container each
//!  └─ 6. Stream    progress events to any number of subscribers
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use edgequake_pdf2html::{
//!     resolve_input, ConversionConfig, ProgressBroadcaster, TaskOrchestrator, TaskRegistry,
//! };
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     // Provider auto-detected from OPENAI_API_KEY / ANTHROPIC_API_KEY / GEMINI_API_KEY
//!     let config = ConversionConfig::default();
//!     let registry = Arc::new(TaskRegistry::new(Arc::new(ProgressBroadcaster::default())));
//!     let orchestrator = TaskOrchestrator::from_config(&config, registry)?;
//!
//!     let input = resolve_input("document.pdf", config.download_timeout_secs).await?;
//!     let result = orchestrator.run(input).await;
//!     if let Some(doc) = result.combined_document {
//!         std::fs::write("document.html", doc.html)?;
//!     }
//!     Ok(())
//! }
//! ```
//!
//! ## Feature Flags
//!
//! | Feature  | Default | Description |
//! |----------|---------|-------------|
//! | `cli`    | on      | `pdf2html` binary (clap, anyhow, tracing-subscriber, indicatif) |
//! | `server` | on      | HTTP, WebSocket and NDJSON surface (axum) |
//!
//! Disable both when using only the library:
//! ```toml
//! edgequake-pdf2html = { version = "0.1", default-features = false }
//! ```

// ── Modules ──────────────────────────────────────────────────────────────

pub mod assemble;
pub mod broadcast;
pub mod config;
pub mod error;
pub mod orchestrator;
pub mod output;
pub mod pipeline;
pub mod progress;
pub mod prompts;
pub mod ratelimit;
pub mod registry;
pub mod runner;
#[cfg(feature = "server")]
pub mod server;
pub mod task;

// ── Re-exports ───────────────────────────────────────────────────────────

pub use assemble::ResultAssembler;
pub use broadcast::{ProgressBroadcaster, Subscription};
pub use config::{ConversionConfig, ConversionConfigBuilder, PageSelection};
pub use error::{PageError, Pdf2HtmlError};
pub use orchestrator::TaskOrchestrator;
pub use output::{
    write_atomic, CombinedDocument, ConversionResult, Dimensions, DocumentMetadata, PageResult,
    ResultStatus,
};
pub use pipeline::input::{resolve_input, ResolvedInput};
pub use pipeline::{
    Extraction, Generator, PageContext, RasterPage, Rasterizer, RenderSession, Renderer,
    Screenshot, SimilarityReport, Viewport,
};
pub use progress::ProgressEvent;
pub use ratelimit::RateGate;
pub use registry::TaskRegistry;
pub use runner::{PageJob, PageJobRunner, RunnerSettings};
pub use task::{ConversionTask, TaskId, TaskSnapshot, TaskStatus};
