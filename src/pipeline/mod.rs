//! Collaborators consumed by the orchestrator, and their default implementations.
//!
//! The orchestrator only ever talks to three traits:
//!
//! * [`Rasterizer`]: PDF → one PNG plus geometry per page, plus metadata.
//!   Failure is fatal to the task.
//! * [`Generator`]: page image → HTML, HTML + screenshot → better HTML, and
//!   a best-effort similarity score. Rate-limited and allowed to fail.
//! * [`Renderer`] / [`RenderSession`]: HTML → screenshot, through a session
//!   that is started once per page and always stopped.
//!
//! Keeping them behind `dyn` traits lets tests drive the orchestrator with
//! in-memory fakes and lets the binary swap implementations without
//! touching control flow.
//!
//! ## Data Flow
//!
//! ```text
//! input ──▶ rasterize ──▶ encode ──▶ generate ◀──▶ screenshot
//! (path/URL/bytes) (pdfium)  (base64)  (VLM)        (headless Chrome)
//!                                        │
//!                                   postprocess
//! ```

pub mod encode;
pub mod generate;
pub mod input;
pub mod postprocess;
pub mod rasterize;
pub mod screenshot;

use crate::error::{PageError, Pdf2HtmlError};
use crate::output::{Dimensions, DocumentMetadata};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tempfile::TempDir;

// ── Rasterizer ───────────────────────────────────────────────────────────

/// One rasterised page.
#[derive(Debug, Clone)]
pub struct RasterPage {
    /// 1-indexed page number in the source document.
    pub page_number: usize,
    /// PNG on disk, owned by the [`Extraction`] that produced it.
    pub image_path: PathBuf,
    /// Page size in PDF points.
    pub geometry: Dimensions,
    /// PNG size in pixels.
    pub pixel_geometry: Dimensions,
}

/// Everything extraction produced for a task.
///
/// Page images live in `workspace`; dropping the extraction deletes them.
#[derive(Debug)]
pub struct Extraction {
    pub pages: Vec<RasterPage>,
    pub metadata: DocumentMetadata,
    workspace: Option<TempDir>,
}

impl Extraction {
    pub fn new(
        pages: Vec<RasterPage>,
        metadata: DocumentMetadata,
        workspace: Option<TempDir>,
    ) -> Self {
        Self {
            pages,
            metadata,
            workspace,
        }
    }

    pub fn workspace(&self) -> Option<&Path> {
        self.workspace.as_ref().map(TempDir::path)
    }
}

#[async_trait]
pub trait Rasterizer: Send + Sync {
    /// Rasterise the document at `source`. Every error is task-fatal.
    async fn rasterize(&self, source: &Path) -> Result<Extraction, Pdf2HtmlError>;
}

// ── Generator ────────────────────────────────────────────────────────────

/// What the generator is told about the page it is working on.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PageContext {
    pub page_number: usize,
    pub geometry: Dimensions,
    pub pixel_geometry: Dimensions,
}

/// Parsed similarity judgement between the reference page and a screenshot.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct SimilarityReport {
    /// 1–10, 10 being a perfect match.
    pub overall_score: f32,
    #[serde(default)]
    pub text_accuracy: Option<f32>,
    #[serde(default)]
    pub layout_similarity: Option<f32>,
    #[serde(default)]
    pub color_accuracy: Option<f32>,
    #[serde(default)]
    pub typography_match: Option<f32>,
    #[serde(default)]
    pub major_differences: Vec<String>,
    #[serde(default)]
    pub recommendations: Vec<String>,
}

#[async_trait]
pub trait Generator: Send + Sync {
    /// First HTML draft for a page.
    async fn generate_initial(&self, image: &Path, page: &PageContext) -> Result<String, PageError>;

    /// Improved draft given the current HTML and a screenshot of it.
    async fn refine(
        &self,
        original: &Path,
        current_markup: &str,
        screenshot: &Screenshot,
        page: &PageContext,
        iteration: u32,
    ) -> Result<String, PageError>;

    /// Compare the reference page with a screenshot.
    async fn score_similarity(
        &self,
        original: &Path,
        screenshot: &Screenshot,
        page: &PageContext,
    ) -> Result<SimilarityReport, PageError>;
}

// ── Renderer ─────────────────────────────────────────────────────────────

/// Browser viewport for a capture.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Viewport {
    pub width: u32,
    pub height: u32,
}

impl Viewport {
    /// The page's pixel size, capped to `max_width` × `max_height`.
    pub fn capped(pixels: Dimensions, max_width: u32, max_height: u32) -> Self {
        let clamp = |v: f32, max: u32| (v.round().max(1.0) as u32).min(max).max(1);
        Self {
            width: clamp(pixels.width, max_width),
            height: clamp(pixels.height, max_height),
        }
    }
}

/// A captured screenshot on disk.
#[derive(Debug)]
pub struct Screenshot {
    pub path: PathBuf,
    pub width: u32,
    pub height: u32,
}

impl Screenshot {
    /// Delete the image. Missing files are ignored.
    pub async fn release(self) {
        if let Err(e) = tokio::fs::remove_file(&self.path).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                tracing::debug!(
                    path = %self.path.display(),
                    error = %e,
                    "screenshot cleanup failed"
                );
            }
        }
    }
}

#[async_trait]
pub trait Renderer: Send + Sync {
    /// Acquire an exclusive session for one page.
    async fn start(&self, page: &PageContext) -> Result<Box<dyn RenderSession>, PageError>;
}

#[async_trait]
pub trait RenderSession: Send {
    async fn capture(&mut self, markup: &str, viewport: Viewport) -> Result<Screenshot, PageError>;

    /// Release everything the session holds.
    async fn stop(self: Box<Self>);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn viewport_is_capped() {
        let v = Viewport::capped(Dimensions::new(2550.0, 3300.0), 1920, 1080);
        assert_eq!(v, Viewport { width: 1920, height: 1080 });
        let v = Viewport::capped(Dimensions::new(800.4, 600.6), 1920, 1080);
        assert_eq!(v, Viewport { width: 800, height: 601 });
        let v = Viewport::capped(Dimensions::new(0.0, 0.0), 1920, 1080);
        assert_eq!(v, Viewport { width: 1, height: 1 });
    }

    #[test]
    fn similarity_report_tolerates_missing_fields() {
        let r: SimilarityReport = serde_json::from_str(r#"{"overall_score": 8.5}"#).unwrap();
        assert_eq!(r.overall_score, 8.5);
        assert!(r.major_differences.is_empty());
        assert!(r.text_accuracy.is_none());
    }

    #[tokio::test]
    async fn releasing_missing_screenshot_is_fine() {
        Screenshot {
            path: PathBuf::from("/nonexistent/shot.png"),
            width: 1,
            height: 1,
        }
        .release()
        .await;
    }
}
