//! Output types produced by a conversion task.
//!
//! [`PageResult`] is what one page's refinement loop yields,
//! [`CombinedDocument`] is the assembled HTML plus source metadata, and
//! [`ConversionResult`] is what [`crate::TaskOrchestrator::run`] hands back.

use crate::error::{PageError, Pdf2HtmlError};
use crate::task::TaskId;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Width/height pair. Points for source geometry, pixels for rasters.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Dimensions {
    pub width: f32,
    pub height: f32,
}

impl Dimensions {
    pub fn new(width: f32, height: f32) -> Self {
        Self { width, height }
    }
}

/// Source document metadata. Missing fields are empty strings.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DocumentMetadata {
    pub title: String,
    pub author: String,
    pub subject: String,
    pub creator: String,
    pub producer: String,
    pub creation_date: String,
    pub modification_date: String,
    pub page_count: usize,
    pub pdf_version: String,
}

/// Outcome of one page's refinement loop.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PageResult {
    /// 1-indexed page number.
    pub page_number: usize,
    /// Final HTML for this page (a standalone document as generated).
    pub markup: String,
    /// Refinement passes started, including one that failed part-way.
    pub iterations_performed: u32,
    /// Max of `quality_history`, the configured default if it is empty,
    /// or `0.0` for a fallback page.
    pub final_score: f32,
    /// One similarity score per successful refinement pass.
    pub quality_history: Vec<f32>,
    /// Wall-clock time spent on this page.
    pub duration_secs: f64,
    /// Page size in PDF points.
    pub geometry: Dimensions,
    /// Reference raster size in pixels.
    pub pixel_geometry: Dimensions,
    /// Set when the page degraded to a fallback or stopped early.
    pub error: Option<PageError>,
    /// `true` when `markup` is a placeholder rather than generated HTML.
    #[serde(default)]
    pub fallback: bool,
}

impl PageResult {
    /// A placeholder result for a page that could not be generated.
    ///
    /// Carries the page number and original geometry so the assembled
    /// document keeps one container per page.
    pub fn fallback(
        page_number: usize,
        geometry: Dimensions,
        pixel_geometry: Dimensions,
        error: PageError,
    ) -> Self {
        Self {
            page_number,
            markup: fallback_markup(page_number, geometry),
            iterations_performed: 0,
            final_score: 0.0,
            quality_history: Vec::new(),
            duration_secs: 0.0,
            geometry,
            pixel_geometry,
            error: Some(error),
            fallback: true,
        }
    }

    /// `true` when this page is a placeholder rather than generated markup.
    pub fn is_fallback(&self) -> bool {
        self.fallback
    }
}

fn fallback_markup(page_number: usize, geometry: Dimensions) -> String {
    format!(
        "<!DOCTYPE html>\n<html>\n\
<head><meta charset=\"UTF-8\"><title>Page {page_number}</title></head>\n\
<body>\n<div class=\"pdf-page-fallback\" style=\"width: {w:.0}pt; min-height: {h:.0}pt; \
border: 1px dashed #999; display: flex; align-items: center; justify-content: center;\">\n\
<p>Page {page_number} could not be converted ({w:.0}pt × {h:.0}pt)</p>\n</div>\n</body>\n</html>\n",
        w = geometry.width,
        h = geometry.height,
    )
}

/// The assembled output document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CombinedDocument {
    /// One well-formed HTML document containing every page container.
    pub html: String,
    pub metadata: DocumentMetadata,
    /// Number of page containers in `html`.
    pub page_count: usize,
}

/// Whether a task produced a document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResultStatus {
    Success,
    Error,
}

/// What a conversion run returns.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversionResult {
    pub task_id: TaskId,
    pub status: ResultStatus,
    pub pages: Vec<PageResult>,
    pub combined_document: Option<CombinedDocument>,
    pub errors: Vec<String>,
    pub duration_secs: f64,
}

impl ConversionResult {
    pub fn is_success(&self) -> bool {
        self.status == ResultStatus::Success
    }

    /// Pages that degraded to a placeholder.
    pub fn fallback_pages(&self) -> impl Iterator<Item = &PageResult> {
        self.pages.iter().filter(|p| p.is_fallback())
    }
}

/// Write `contents` to `path` atomically: temp file in the same directory,
/// then rename, so readers never see a partial document.
pub async fn write_atomic(path: &Path, contents: &str) -> Result<(), Pdf2HtmlError> {
    let failed = |source: std::io::Error| Pdf2HtmlError::OutputWriteFailed {
        path: path.to_path_buf(),
        source,
    };

    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent).await.map_err(failed)?;
    }

    let tmp_path = path.with_extension("html.tmp");
    tokio::fs::write(&tmp_path, contents).await.map_err(failed)?;
    if let Err(e) = tokio::fs::rename(&tmp_path, path).await {
        let _ = tokio::fs::remove_file(&tmp_path).await;
        return Err(failed(e));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fallback_page_carries_number_and_geometry() {
        let p = PageResult::fallback(
            4,
            Dimensions::new(612.0, 792.0),
            Dimensions::new(2550.0, 3300.0),
            PageError::GenerationFailed {
                page: 4,
                detail: "503".into(),
            },
        );
        assert_eq!(p.iterations_performed, 0);
        assert_eq!(p.final_score, 0.0);
        assert!(p.is_fallback());
        assert!(p.markup.contains("Page 4"));
        assert!(p.markup.contains("612pt"));
        assert!(p.markup.contains("792pt"));
        assert!(p.markup.contains("<body>"));
    }

    #[test]
    fn metadata_defaults_to_empty_strings() {
        let m = DocumentMetadata::default();
        assert!(m.title.is_empty());
        assert!(m.author.is_empty());
        let json = serde_json::to_value(&m).unwrap();
        assert_eq!(json["title"], "");
    }

    #[tokio::test]
    async fn write_atomic_creates_parents_and_leaves_no_temp() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out/doc.html");
        write_atomic(&path, "<html></html>").await.unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "<html></html>");
        assert!(!path.with_extension("html.tmp").exists());
    }

    #[tokio::test]
    async fn write_atomic_reports_path() {
        let dir = tempfile::tempdir().unwrap();
        // A directory where the file should go makes the rename fail.
        let path = dir.path().join("taken");
        std::fs::create_dir_all(path.join("inner")).unwrap();
        let err = write_atomic(&path, "x").await.unwrap_err();
        assert_eq!(err.code(), "output_write_failed");
    }
}
