//! PDF rasterisation via pdfium: one PNG per selected page, written into a
//! per-task temp directory.
//!
//! ## Why spawn_blocking?
//!
//! `pdfium-render` wraps the pdfium C++ library, which keeps thread-local
//! state and blocks for the whole render. `tokio::task::spawn_blocking`
//! moves that work onto the blocking pool so Tokio workers keep serving
//! other tasks (and their WebSocket observers) meanwhile.
//!
//! ## Why write PNGs to disk?
//!
//! A 300-DPI letter page is ~25 MB as raw RGBA. Keeping every page decoded
//! in memory for a long document is wasteful when each image is only needed
//! once per generator call; the files are deleted with the [`Extraction`].

use crate::config::{ConversionConfig, PageSelection};
use crate::error::Pdf2HtmlError;
use crate::output::{Dimensions, DocumentMetadata};
use crate::pipeline::{Extraction, RasterPage, Rasterizer};
use async_trait::async_trait;
use pdfium_render::prelude::*;
use std::path::{Path, PathBuf};
use tempfile::TempDir;
use tracing::{debug, info};

/// Environment variable naming an explicit pdfium library to load.
pub const PDFIUM_LIB_PATH_ENV: &str = "PDFIUM_LIB_PATH";

/// [`Rasterizer`] backed by pdfium.
#[derive(Debug, Clone)]
pub struct PdfiumRasterizer {
    dpi: u32,
    max_pixels: u32,
    password: Option<String>,
    pages: PageSelection,
}

impl PdfiumRasterizer {
    pub fn from_config(config: &ConversionConfig) -> Self {
        Self {
            dpi: config.dpi,
            max_pixels: config.max_rendered_pixels,
            password: config.password.clone(),
            pages: config.pages.clone(),
        }
    }

    /// Read document metadata without rendering anything.
    pub async fn inspect(&self, pdf_path: &Path) -> Result<DocumentMetadata, Pdf2HtmlError> {
        let path = pdf_path.to_path_buf();
        let password = self.password.clone();
        tokio::task::spawn_blocking(move || {
            let pdfium = bind_pdfium()?;
            let document = open_document(&pdfium, &path, password.as_deref())?;
            Ok(read_metadata(&document))
        })
        .await
        .map_err(|e| Pdf2HtmlError::Internal(format!("Metadata task panicked: {}", e)))?
    }
}

#[async_trait]
impl Rasterizer for PdfiumRasterizer {
    async fn rasterize(&self, source: &Path) -> Result<Extraction, Pdf2HtmlError> {
        let path = source.to_path_buf();
        let this = self.clone();

        tokio::task::spawn_blocking(move || this.rasterize_blocking(&path))
            .await
            .map_err(|e| Pdf2HtmlError::Internal(format!("Render task panicked: {}", e)))?
    }
}

impl PdfiumRasterizer {
    fn rasterize_blocking(&self, pdf_path: &Path) -> Result<Extraction, Pdf2HtmlError> {
        let pdfium = bind_pdfium()?;
        let document = open_document(&pdfium, pdf_path, self.password.as_deref())?;

        let pages = document.pages();
        let total_pages = pages.len() as usize;
        let indices = self.pages.to_indices(total_pages);
        if indices.is_empty() {
            return Err(Pdf2HtmlError::EmptyDocument {
                path: pdf_path.to_path_buf(),
            });
        }
        info!(
            "PDF loaded: {} pages, rasterising {} at {} DPI",
            total_pages,
            indices.len(),
            self.dpi
        );

        let workspace = tempfile::Builder::new()
            .prefix("pdf2html-pages-")
            .tempdir()
            .map_err(|e| Pdf2HtmlError::Internal(format!("Failed to create temp dir: {}", e)))?;

        let render_config = PdfRenderConfig::new()
            .scale_page_by_factor(self.dpi as f32 / 72.0)
            .set_maximum_width(self.max_pixels as i32)
            .set_maximum_height(self.max_pixels as i32);

        let mut raster_pages = Vec::with_capacity(indices.len());
        for idx in indices {
            let page_number = idx + 1;
            let failed = |detail: String| Pdf2HtmlError::RasterisationFailed {
                page: page_number,
                detail,
            };

            let page = pages.get(idx as u16).map_err(|e| failed(format!("{:?}", e)))?;
            let geometry = Dimensions::new(page.width().value, page.height().value);

            let bitmap = page
                .render_with_config(&render_config)
                .map_err(|e| failed(format!("{:?}", e)))?;
            let image = bitmap.as_image();

            let image_path = page_image_path(&workspace, page_number);
            image
                .save_with_format(&image_path, image::ImageFormat::Png)
                .map_err(|e| failed(format!("PNG write: {}", e)))?;

            debug!(
                "Rendered page {} ({:.0}×{:.0} pt) → {}x{} px",
                page_number,
                geometry.width,
                geometry.height,
                image.width(),
                image.height()
            );

            raster_pages.push(RasterPage {
                page_number,
                image_path,
                geometry,
                pixel_geometry: Dimensions::new(image.width() as f32, image.height() as f32),
            });
        }

        Ok(Extraction::new(
            raster_pages,
            read_metadata(&document),
            Some(workspace),
        ))
    }
}

fn page_image_path(workspace: &TempDir, page_number: usize) -> PathBuf {
    workspace.path().join(format!("page_{:04}.png", page_number))
}

/// Bind to pdfium: `PDFIUM_LIB_PATH` if set, then the working directory,
/// then the system library search path.
fn bind_pdfium() -> Result<Pdfium, Pdf2HtmlError> {
    let bindings = match std::env::var(PDFIUM_LIB_PATH_ENV) {
        Ok(path) if !path.is_empty() => Pdfium::bind_to_library(&path),
        _ => Pdfium::bind_to_library(Pdfium::pdfium_platform_library_name_at_path("./"))
            .or_else(|_| Pdfium::bind_to_system_library()),
    }
    .map_err(|e| Pdf2HtmlError::PdfiumBindingFailed(format!("{:?}", e)))?;
    Ok(Pdfium::new(bindings))
}

fn open_document<'a>(
    pdfium: &'a Pdfium,
    pdf_path: &Path,
    password: Option<&'a str>,
) -> Result<PdfDocument<'a>, Pdf2HtmlError> {
    pdfium.load_pdf_from_file(pdf_path, password).map_err(|e| {
        let err_str = format!("{:?}", e);
        if err_str.contains("Password") || err_str.contains("password") {
            if password.is_some() {
                Pdf2HtmlError::WrongPassword {
                    path: pdf_path.to_path_buf(),
                }
            } else {
                Pdf2HtmlError::PasswordRequired {
                    path: pdf_path.to_path_buf(),
                }
            }
        } else {
            Pdf2HtmlError::CorruptPdf {
                path: pdf_path.to_path_buf(),
                detail: err_str,
            }
        }
    })
}

fn read_metadata(document: &PdfDocument<'_>) -> DocumentMetadata {
    let metadata = document.metadata();
    let tag = |kind: PdfDocumentMetadataTagType| -> String {
        metadata
            .get(kind)
            .map(|t| t.value().trim().to_string())
            .unwrap_or_default()
    };

    DocumentMetadata {
        title: tag(PdfDocumentMetadataTagType::Title),
        author: tag(PdfDocumentMetadataTagType::Author),
        subject: tag(PdfDocumentMetadataTagType::Subject),
        creator: tag(PdfDocumentMetadataTagType::Creator),
        producer: tag(PdfDocumentMetadataTagType::Producer),
        creation_date: tag(PdfDocumentMetadataTagType::CreationDate),
        modification_date: tag(PdfDocumentMetadataTagType::ModificationDate),
        page_count: document.pages().len() as usize,
        pdf_version: format!("{:?}", document.version()),
    }
}
