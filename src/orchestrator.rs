//! Task orchestration: extraction, sequential page processing, assembly.
//!
//! ## Stages
//!
//! ```text
//! Created ─▶ Extracting ──(error / cancel)──▶ Failed      one Error event
//!                │
//!                ▼
//!          ProcessingPages   page 1 … page N, in ascending order, one at a time
//!                │           a failed page becomes a fallback page
//!                ▼
//!           Assembling ─▶ Completed                       one task_completed event
//! ```
//!
//! Pages run strictly one after another. The generator sits behind a
//! process-wide rate gate and each page holds its own render session, so
//! nothing would be gained by overlapping them; separate tasks do run
//! concurrently.
//!
//! Temporary artefacts (downloaded or uploaded input, page rasters) are
//! owned by values that delete them on drop. Both are dropped before the
//! terminal event is published, on every path.

use crate::assemble::ResultAssembler;
use crate::config::ConversionConfig;
use crate::error::Pdf2HtmlError;
use crate::output::{ConversionResult, PageResult, ResultStatus};
use crate::pipeline::generate::VlmGenerator;
use crate::pipeline::input::ResolvedInput;
use crate::pipeline::rasterize::PdfiumRasterizer;
use crate::pipeline::screenshot::ChromeRenderer;
use crate::pipeline::{Extraction, Generator, RasterPage, Rasterizer, Renderer};
use crate::progress::ProgressEvent;
use crate::ratelimit::RateGate;
use crate::registry::TaskRegistry;
use crate::runner::{Notify, PageJob, PageJobRunner, RunnerSettings};
use crate::task::{ConversionTask, TaskId, TaskStatus};
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument};

/// Drives conversion tasks from input to combined document.
///
/// Cheap to clone; clones share the registry and collaborators.
#[derive(Clone)]
pub struct TaskOrchestrator {
    registry: Arc<TaskRegistry>,
    rasterizer: Arc<dyn Rasterizer>,
    runner: Arc<PageJobRunner>,
    assembler: Arc<ResultAssembler>,
}

impl TaskOrchestrator {
    pub fn new(
        registry: Arc<TaskRegistry>,
        rasterizer: Arc<dyn Rasterizer>,
        generator: Arc<dyn Generator>,
        renderer: Arc<dyn Renderer>,
        config: &ConversionConfig,
    ) -> Self {
        Self {
            registry,
            rasterizer,
            runner: Arc::new(PageJobRunner::new(
                generator,
                renderer,
                RunnerSettings::from(config),
            )),
            assembler: Arc::new(ResultAssembler::default()),
        }
    }

    /// Wire up the default collaborators: pdfium, the configured VLM behind a
    /// fresh rate gate, and headless Chrome.
    pub fn from_config(
        config: &ConversionConfig,
        registry: Arc<TaskRegistry>,
    ) -> Result<Self, Pdf2HtmlError> {
        let gate = Arc::new(RateGate::new(config.rate_limit_interval()));
        let generator = VlmGenerator::from_config(config, gate)?;
        let renderer = ChromeRenderer::from_config(config)?;
        Ok(Self::new(
            registry,
            Arc::new(PdfiumRasterizer::from_config(config)),
            Arc::new(generator),
            Arc::new(renderer),
            config,
        ))
    }

    /// Replace the default assembler, e.g. to change the fallback title.
    pub fn with_assembler(mut self, assembler: ResultAssembler) -> Self {
        self.assembler = Arc::new(assembler);
        self
    }

    pub fn registry(&self) -> &Arc<TaskRegistry> {
        &self.registry
    }

    /// Register a task and run it in the background. Returns immediately.
    ///
    /// The cancellation token is taken before spawning, so removing the task
    /// before the background run starts still stops it.
    pub fn submit(&self, input: ResolvedInput) -> TaskId {
        let id = self.registry.create(input.label());
        let Some(cancel) = self.registry.cancellation_token(id) else {
            debug!(task_id = %id, "task removed before it could start");
            return id;
        };
        let this = self.clone();
        tokio::spawn(async move {
            this.execute(id, input, cancel)
                .instrument(info_span!("task", task_id = %id))
                .await;
        });
        id
    }

    /// Register a task and run it to completion.
    pub async fn run(&self, input: ResolvedInput) -> ConversionResult {
        let id = self.registry.create(input.label());
        self.run_task(id, input).await
    }

    /// Run an already registered task. A task that is no longer registered
    /// is not run at all.
    pub async fn run_task(&self, id: TaskId, input: ResolvedInput) -> ConversionResult {
        let Some(cancel) = self.registry.cancellation_token(id) else {
            let e = Pdf2HtmlError::TaskNotFound(id);
            warn!(task_id = %id, error = %e, "refusing to run unregistered task");
            return error_result(id, e.to_string(), Instant::now());
        };
        self.execute(id, input, cancel)
            .instrument(info_span!("task", task_id = %id))
            .await
    }

    /// Request cancellation. Pages not yet finished become fallback pages.
    pub fn cancel(&self, id: TaskId) -> bool {
        self.registry.cancel(id)
    }

    async fn execute(
        &self,
        id: TaskId,
        input: ResolvedInput,
        cancel: CancellationToken,
    ) -> ConversionResult {
        let started = Instant::now();
        let broadcaster = Arc::clone(self.registry.broadcaster());
        info!(source = %input.label(), "conversion started");

        // ── Extraction ───────────────────────────────────────────────────
        self.transition(id, |t| t.advance(TaskStatus::Extracting));
        broadcaster.publish(ProgressEvent::message(id, "Extracting pages from PDF"));

        let extracted = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(Pdf2HtmlError::Cancelled(id)),
            result = self.rasterizer.rasterize(input.path()) => result,
        };
        let extraction = match extracted {
            Ok(extraction) => extraction,
            Err(e) => {
                drop(input);
                error!(error = %e, "extraction failed");
                let message = e.to_string();
                self.transition(id, |t| t.fail(message.clone()));
                broadcaster.publish(ProgressEvent::error(id, message.clone(), Some(e.code())));
                return error_result(id, message, started);
            }
        };

        // ── Pages ────────────────────────────────────────────────────────
        let total = extraction.pages.len();
        info!(pages = total, "extraction finished");
        self.transition(id, |t| {
            t.set_page_count(total);
            t.advance(TaskStatus::ProcessingPages)
        });
        broadcaster.publish(ProgressEvent::page_progress(
            id,
            format!("Extracted {total} pages"),
            0,
            total,
            0,
            None,
        ));

        let (results, errors) = self.process_pages(id, &extraction, &cancel).await;

        // ── Assembly ─────────────────────────────────────────────────────
        self.transition(id, |t| t.advance(TaskStatus::Assembling));
        broadcaster.publish(ProgressEvent::message(id, "Assembling document"));
        let document = self.assembler.combine(&results, &extraction.metadata);
        drop(extraction);
        drop(input);

        let html = document.html.clone();
        let stored = document.clone();
        self.transition(id, move |t| t.complete(stored));
        let duration_secs = started.elapsed().as_secs_f64();
        broadcaster.publish(ProgressEvent::completed(
            id,
            ResultStatus::Success,
            Some(html),
            total,
            duration_secs,
            errors.clone(),
        ));
        info!(
            pages = total,
            failed = errors.len(),
            "conversion finished in {:.1}s",
            duration_secs
        );

        ConversionResult {
            task_id: id,
            status: ResultStatus::Success,
            pages: results,
            combined_document: Some(document),
            errors,
            duration_secs,
        }
    }

    /// Run every page in ascending order. Returns page results and the
    /// messages of pages that fell back.
    async fn process_pages(
        &self,
        id: TaskId,
        extraction: &Extraction,
        cancel: &CancellationToken,
    ) -> (Vec<PageResult>, Vec<String>) {
        let broadcaster = self.registry.broadcaster();
        let mut ordered: Vec<&RasterPage> = extraction.pages.iter().collect();
        ordered.sort_by_key(|p| p.page_number);
        let total = ordered.len();

        let mut results = Vec::with_capacity(total);
        let mut errors = Vec::new();

        for (idx, raster) in ordered.into_iter().enumerate() {
            let n = raster.page_number;
            let position = idx + 1;
            broadcaster.publish(ProgressEvent::page_progress(
                id,
                format!("Processing page {position} of {total}"),
                position,
                total,
                idx,
                None,
            ));

            let notify: Notify<'_> = &|message, markup| {
                broadcaster.publish(ProgressEvent::page_progress(
                    id, message, position, total, idx, markup,
                ));
            };
            let result = match self.runner.process(PageJob::new(raster), cancel, notify).await {
                Ok(result) => result,
                Err(e) => {
                    warn!(page = n, error = %e, "page failed, using fallback");
                    let message = e.to_string();
                    errors.push(message.clone());
                    self.with_task(id, |t| t.push_error(message));
                    PageResult::fallback(n, raster.geometry, raster.pixel_geometry, e)
                }
            };

            self.with_task(id, ConversionTask::record_page_done);
            broadcaster.publish(ProgressEvent::page_completed(
                id,
                n,
                result.markup.clone(),
                position,
                total,
            ));
            results.push(result);
        }
        (results, errors)
    }

    /// Apply a status change. A rejected change is a bug worth a warning;
    /// a task removed mid-run is not.
    fn transition(
        &self,
        id: TaskId,
        change: impl FnOnce(&mut ConversionTask) -> Result<(), Pdf2HtmlError>,
    ) {
        match self.registry.update(id, change) {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(error = %e, "status change rejected"),
            Err(e) => debug!(error = %e, "task no longer registered"),
        }
    }

    fn with_task(&self, id: TaskId, change: impl FnOnce(&mut ConversionTask)) {
        if let Err(e) = self.registry.update(id, change) {
            debug!(error = %e, "task no longer registered");
        }
    }
}

fn error_result(id: TaskId, message: String, started: Instant) -> ConversionResult {
    ConversionResult {
        task_id: id,
        status: ResultStatus::Error,
        pages: Vec::new(),
        combined_document: None,
        errors: vec![message],
        duration_secs: started.elapsed().as_secs_f64(),
    }
}
