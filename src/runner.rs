//! Per-page refinement loop.
//!
//! ```text
//! generate_initial ──▶ start session ──▶ ┌─ capture(current) ─▶ refine ─▶ score ─┐
//!                                        └──────────── × max_iterations ◀────────┘
//!                                                     stop session
//! ```
//!
//! Failure handling is split by where it happens:
//!
//! | step               | on error                                   |
//! |--------------------|--------------------------------------------|
//! | initial generation | page failure (caller substitutes fallback) |
//! | session start      | page failure                               |
//! | capture            | page failure (`Cancelled` stops softly)    |
//! | refine             | loop stops, last markup kept               |
//! | score              | default score recorded                     |
//!
//! The session is stopped on every path out of the loop.

use crate::config::ConversionConfig;
use crate::error::PageError;
use crate::output::{Dimensions, PageResult};
use crate::pipeline::{Generator, PageContext, RasterPage, RenderSession, Renderer, Viewport};
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Callback for human-readable progress lines. The second argument is the
/// markup the line refers to, when there is one.
pub type Notify<'a> = &'a (dyn Fn(&str, Option<&str>) + Send + Sync);

/// One page's refinement state. Owned by a single [`PageJobRunner::process`] call.
#[derive(Debug, Clone)]
pub struct PageJob {
    pub page_number: usize,
    pub source_image: PathBuf,
    pub geometry: Dimensions,
    pub pixel_geometry: Dimensions,
    pub current_markup: String,
    /// Refinement passes started so far.
    pub iteration: u32,
    pub quality_history: Vec<f32>,
    pub final_score: f32,
    pub processing_duration: Duration,
}

impl PageJob {
    pub fn new(page: &RasterPage) -> Self {
        Self {
            page_number: page.page_number,
            source_image: page.image_path.clone(),
            geometry: page.geometry,
            pixel_geometry: page.pixel_geometry,
            current_markup: String::new(),
            iteration: 0,
            quality_history: Vec::new(),
            final_score: 0.0,
            processing_duration: Duration::ZERO,
        }
    }

    pub fn context(&self) -> PageContext {
        PageContext {
            page_number: self.page_number,
            geometry: self.geometry,
            pixel_geometry: self.pixel_geometry,
        }
    }

    fn into_result(self, error: Option<PageError>) -> PageResult {
        PageResult {
            page_number: self.page_number,
            markup: self.current_markup,
            iterations_performed: self.iteration,
            final_score: self.final_score,
            quality_history: self.quality_history,
            duration_secs: self.processing_duration.as_secs_f64(),
            geometry: self.geometry,
            pixel_geometry: self.pixel_geometry,
            error,
            fallback: false,
        }
    }
}

/// Loop limits taken from [`ConversionConfig`].
#[derive(Debug, Clone, Copy)]
pub struct RunnerSettings {
    pub max_iterations: u32,
    pub default_score: f32,
    pub max_viewport_width: u32,
    pub max_viewport_height: u32,
    /// Hard limit on each collaborator call; `None` waits forever.
    pub call_timeout: Option<Duration>,
}

impl From<&ConversionConfig> for RunnerSettings {
    fn from(config: &ConversionConfig) -> Self {
        Self {
            max_iterations: config.max_iterations,
            default_score: config.default_score,
            max_viewport_width: config.max_viewport_width,
            max_viewport_height: config.max_viewport_height,
            call_timeout: config.api_timeout(),
        }
    }
}

/// Runs the generate → render → refine loop for one page at a time.
pub struct PageJobRunner {
    generator: Arc<dyn Generator>,
    renderer: Arc<dyn Renderer>,
    settings: RunnerSettings,
}

impl PageJobRunner {
    pub fn new(
        generator: Arc<dyn Generator>,
        renderer: Arc<dyn Renderer>,
        settings: RunnerSettings,
    ) -> Self {
        Self {
            generator,
            renderer,
            settings,
        }
    }

    pub fn settings(&self) -> &RunnerSettings {
        &self.settings
    }

    /// Refine one page.
    ///
    /// `Err` means the page produced no usable markup and the caller should
    /// substitute a fallback. An early stop that still has markup is `Ok`
    /// with [`PageResult::error`] set.
    pub async fn process(
        &self,
        mut job: PageJob,
        cancel: &CancellationToken,
        notify: Notify<'_>,
    ) -> Result<PageResult, PageError> {
        let started = Instant::now();
        let page = job.page_number;
        let ctx = job.context();

        if cancel.is_cancelled() {
            return Err(PageError::Cancelled { page });
        }

        notify(&format!("Generating initial HTML for page {page}"), None);
        let initial = self.generator.generate_initial(&job.source_image, &ctx);
        job.current_markup = self.call(page, "generate", cancel, initial).await?;
        debug!(page, bytes = job.current_markup.len(), "initial draft ready");
        notify(&format!("Initial HTML ready for page {page}"), Some(job.current_markup.as_str()));

        let mut soft_error = None;
        if self.settings.max_iterations > 0 {
            let mut session = self
                .call(page, "render_start", cancel, self.renderer.start(&ctx))
                .await?;
            let outcome = self.refine_loop(&mut job, session.as_mut(), cancel, notify).await;
            session.stop().await;
            soft_error = outcome?;
        }

        job.final_score = job
            .quality_history
            .iter()
            .copied()
            .reduce(f32::max)
            .unwrap_or(self.settings.default_score);
        job.processing_duration = started.elapsed();

        info!(
            page,
            iterations = job.iteration,
            score = job.final_score,
            "page finished in {:.1}s",
            job.processing_duration.as_secs_f64()
        );
        Ok(job.into_result(soft_error))
    }

    /// Returns the error that stopped the loop early, if any. `Err` only for
    /// capture failures, which leave nothing to refine against.
    async fn refine_loop(
        &self,
        job: &mut PageJob,
        session: &mut dyn RenderSession,
        cancel: &CancellationToken,
        notify: Notify<'_>,
    ) -> Result<Option<PageError>, PageError> {
        let page = job.page_number;
        let ctx = job.context();
        let max = self.settings.max_iterations;
        let viewport = Viewport::capped(
            job.pixel_geometry,
            self.settings.max_viewport_width,
            self.settings.max_viewport_height,
        );

        for iteration in 1..=max {
            if cancel.is_cancelled() {
                return Ok(Some(PageError::Cancelled { page }));
            }
            job.iteration = iteration;
            notify(&format!("Refining page {page} ({iteration}/{max})"), None);

            let screenshot = match self
                .call(page, "capture", cancel, session.capture(&job.current_markup, viewport))
                .await
            {
                Ok(shot) => shot,
                Err(e @ PageError::Cancelled { .. }) => return Ok(Some(e)),
                Err(e) => return Err(e),
            };

            let refined = self
                .call(
                    page,
                    "refine",
                    cancel,
                    self.generator.refine(
                        &job.source_image,
                        &job.current_markup,
                        &screenshot,
                        &ctx,
                        iteration,
                    ),
                )
                .await;
            let refined = match refined {
                Ok(markup) => markup,
                Err(e) => {
                    warn!(page, iteration, error = %e, "refinement failed, keeping previous draft");
                    screenshot.release().await;
                    return Ok(Some(e));
                }
            };

            let scored = self
                .call(
                    page,
                    "score",
                    cancel,
                    self.generator.score_similarity(&job.source_image, &screenshot, &ctx),
                )
                .await;
            screenshot.release().await;
            job.current_markup = refined;

            match scored {
                Ok(report) => {
                    debug!(page, iteration, score = report.overall_score, "similarity scored");
                    job.quality_history.push(report.overall_score);
                }
                Err(e @ PageError::Cancelled { .. }) => return Ok(Some(e)),
                Err(e) => {
                    debug!(page, iteration, error = %e, "scoring unavailable, using default");
                    job.quality_history.push(self.settings.default_score);
                }
            }
            notify(
                &format!("Refinement {iteration}/{max} done for page {page}"),
                Some(job.current_markup.as_str()),
            );
        }
        Ok(None)
    }

    /// Await a collaborator call, bounded by the call timeout and `cancel`.
    async fn call<T, F>(
        &self,
        page: usize,
        operation: &str,
        cancel: &CancellationToken,
        fut: F,
    ) -> Result<T, PageError>
    where
        F: Future<Output = Result<T, PageError>>,
    {
        let bounded = async {
            match self.settings.call_timeout {
                Some(limit) => match tokio::time::timeout(limit, fut).await {
                    Ok(result) => result,
                    Err(_) => Err(PageError::Timeout {
                        page,
                        operation: operation.to_string(),
                        secs: limit.as_secs(),
                    }),
                },
                None => fut.await,
            }
        };
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(PageError::Cancelled { page }),
            result = bounded => result,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::{Screenshot, SimilarityReport};
    use async_trait::async_trait;
    use std::path::Path;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Scripted generator: `refine_fails_at` makes that iteration's refine fail.
    struct ScriptedGenerator {
        initial_fails: bool,
        refine_fails_at: Option<u32>,
        scores: Vec<Option<f32>>,
        score_calls: AtomicU32,
    }

    impl ScriptedGenerator {
        fn ok() -> Self {
            Self {
                initial_fails: false,
                refine_fails_at: None,
                scores: Vec::new(),
                score_calls: AtomicU32::new(0),
            }
        }
    }

    #[async_trait]
    impl Generator for ScriptedGenerator {
        async fn generate_initial(
            &self,
            _: &Path,
            page: &PageContext,
        ) -> Result<String, PageError> {
            if self.initial_fails {
                return Err(PageError::GenerationFailed {
                    page: page.page_number,
                    detail: "503".into(),
                });
            }
            Ok("<p>v0</p>".into())
        }

        async fn refine(
            &self,
            _: &Path,
            _: &str,
            _: &Screenshot,
            page: &PageContext,
            iteration: u32,
        ) -> Result<String, PageError> {
            if self.refine_fails_at == Some(iteration) {
                return Err(PageError::GenerationFailed {
                    page: page.page_number,
                    detail: "refine".into(),
                });
            }
            Ok(format!("<p>v{iteration}</p>"))
        }

        async fn score_similarity(
            &self,
            _: &Path,
            _: &Screenshot,
            page: &PageContext,
        ) -> Result<SimilarityReport, PageError> {
            let n = self.score_calls.fetch_add(1, Ordering::SeqCst) as usize;
            match self.scores.get(n).copied().flatten() {
                Some(overall_score) => Ok(SimilarityReport {
                    overall_score,
                    ..Default::default()
                }),
                None => Err(PageError::ScoringFailed {
                    page: page.page_number,
                    detail: "no score".into(),
                }),
            }
        }
    }

    #[derive(Default)]
    struct CountingRenderer {
        fail_capture: bool,
        /// Cancelled when a session starts.
        cancel_on_start: Option<CancellationToken>,
        starts: AtomicU32,
        stops: Arc<AtomicU32>,
    }

    struct CountingSession {
        fail_capture: bool,
        stops: Arc<AtomicU32>,
    }

    #[async_trait]
    impl Renderer for CountingRenderer {
        async fn start(&self, _: &PageContext) -> Result<Box<dyn RenderSession>, PageError> {
            self.starts.fetch_add(1, Ordering::SeqCst);
            if let Some(cancel) = &self.cancel_on_start {
                cancel.cancel();
            }
            Ok(Box::new(CountingSession {
                fail_capture: self.fail_capture,
                stops: Arc::clone(&self.stops),
            }))
        }
    }

    #[async_trait]
    impl RenderSession for CountingSession {
        async fn capture(&mut self, _: &str, viewport: Viewport) -> Result<Screenshot, PageError> {
            if self.fail_capture {
                return Err(PageError::RenderFailed {
                    page: 1,
                    detail: "crashed".into(),
                });
            }
            Ok(Screenshot {
                path: PathBuf::from("/nonexistent/shot.png"),
                width: viewport.width,
                height: viewport.height,
            })
        }

        async fn stop(self: Box<Self>) {
            self.stops.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn settings(max_iterations: u32) -> RunnerSettings {
        RunnerSettings {
            max_iterations,
            default_score: 7.0,
            max_viewport_width: 1920,
            max_viewport_height: 1080,
            call_timeout: None,
        }
    }

    fn job() -> PageJob {
        PageJob::new(&RasterPage {
            page_number: 1,
            image_path: PathBuf::from("/nonexistent/page_0001.png"),
            geometry: Dimensions::new(612.0, 792.0),
            pixel_geometry: Dimensions::new(2550.0, 3300.0),
        })
    }

    fn quiet(_: &str, _: Option<&str>) {}

    #[tokio::test]
    async fn keeps_last_draft_not_best() {
        let generator = ScriptedGenerator {
            scores: vec![Some(9.0), Some(4.0)],
            ..ScriptedGenerator::ok()
        };
        let renderer = Arc::new(CountingRenderer::default());
        let runner = PageJobRunner::new(Arc::new(generator), renderer.clone(), settings(2));
        let r = runner
            .process(job(), &CancellationToken::new(), &quiet)
            .await
            .unwrap();
        assert_eq!(r.markup, "<p>v2</p>");
        assert_eq!(r.quality_history, [9.0, 4.0]);
        assert_eq!(r.final_score, 9.0);
        assert_eq!(r.iterations_performed, 2);
        assert!(r.error.is_none());
        assert_eq!(renderer.stops.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn scoring_failure_records_default() {
        let renderer = Arc::new(CountingRenderer::default());
        let runner = PageJobRunner::new(Arc::new(ScriptedGenerator::ok()), renderer, settings(2));
        let r = runner
            .process(job(), &CancellationToken::new(), &quiet)
            .await
            .unwrap();
        assert_eq!(r.quality_history, [7.0, 7.0]);
        assert_eq!(r.final_score, 7.0);
    }

    #[tokio::test]
    async fn refine_failure_stops_early_with_previous_markup() {
        let generator = ScriptedGenerator {
            refine_fails_at: Some(1),
            ..ScriptedGenerator::ok()
        };
        let renderer = Arc::new(CountingRenderer::default());
        let runner = PageJobRunner::new(Arc::new(generator), renderer.clone(), settings(3));
        let r = runner
            .process(job(), &CancellationToken::new(), &quiet)
            .await
            .unwrap();
        assert_eq!(r.iterations_performed, 1);
        assert_eq!(r.markup, "<p>v0</p>");
        assert!(r.quality_history.is_empty());
        assert_eq!(r.final_score, 7.0);
        assert_eq!(r.error.as_ref().map(PageError::kind), Some("generation_failed"));
        assert_eq!(renderer.stops.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn zero_iterations_skips_renderer() {
        let renderer = Arc::new(CountingRenderer::default());
        let runner =
            PageJobRunner::new(Arc::new(ScriptedGenerator::ok()), renderer.clone(), settings(0));
        let r = runner
            .process(job(), &CancellationToken::new(), &quiet)
            .await
            .unwrap();
        assert_eq!(r.iterations_performed, 0);
        assert!(r.quality_history.is_empty());
        assert_eq!(r.markup, "<p>v0</p>");
        assert_eq!(renderer.starts.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn initial_failure_is_page_failure() {
        let generator = ScriptedGenerator {
            initial_fails: true,
            ..ScriptedGenerator::ok()
        };
        let renderer = Arc::new(CountingRenderer::default());
        let runner = PageJobRunner::new(Arc::new(generator), renderer.clone(), settings(2));
        let err = runner
            .process(job(), &CancellationToken::new(), &quiet)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "generation_failed");
        assert_eq!(renderer.starts.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn capture_failure_is_page_failure_and_session_stops() {
        let renderer = Arc::new(CountingRenderer {
            fail_capture: true,
            ..Default::default()
        });
        let runner =
            PageJobRunner::new(Arc::new(ScriptedGenerator::ok()), renderer.clone(), settings(2));
        let err = runner
            .process(job(), &CancellationToken::new(), &quiet)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "render_failed");
        assert_eq!(renderer.stops.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn cancelled_before_start() {
        let renderer = Arc::new(CountingRenderer::default());
        let runner = PageJobRunner::new(Arc::new(ScriptedGenerator::ok()), renderer, settings(2));
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = runner.process(job(), &cancel, &quiet).await.unwrap_err();
        assert!(matches!(err, PageError::Cancelled { page: 1 }));
    }

    #[tokio::test]
    async fn cancelled_before_first_refinement_keeps_draft() {
        let cancel = CancellationToken::new();
        let renderer = Arc::new(CountingRenderer {
            cancel_on_start: Some(cancel.clone()),
            ..Default::default()
        });
        let runner = PageJobRunner::new(
            Arc::new(ScriptedGenerator::ok()),
            renderer.clone(),
            RunnerSettings {
                default_score: 0.0,
                ..settings(2)
            },
        );
        let r = runner.process(job(), &cancel, &quiet).await.unwrap();

        assert_eq!(r.iterations_performed, 0);
        assert_eq!(r.final_score, 0.0);
        assert!(matches!(r.error, Some(PageError::Cancelled { page: 1 })));
        assert_eq!(r.markup, "<p>v0</p>");
        assert!(!r.is_fallback());
        assert_eq!(renderer.stops.load(Ordering::SeqCst), 1);
    }

    struct StalledGenerator;

    #[async_trait]
    impl Generator for StalledGenerator {
        async fn generate_initial(&self, _: &Path, _: &PageContext) -> Result<String, PageError> {
            std::future::pending().await
        }
        async fn refine(
            &self,
            _: &Path,
            _: &str,
            _: &Screenshot,
            _: &PageContext,
            _: u32,
        ) -> Result<String, PageError> {
            std::future::pending().await
        }
        async fn score_similarity(
            &self,
            _: &Path,
            _: &Screenshot,
            _: &PageContext,
        ) -> Result<SimilarityReport, PageError> {
            std::future::pending().await
        }
    }

    #[tokio::test(start_paused = true)]
    async fn stalled_call_times_out() {
        let runner = PageJobRunner::new(
            Arc::new(StalledGenerator),
            Arc::new(CountingRenderer::default()),
            RunnerSettings {
                call_timeout: Some(Duration::from_secs(30)),
                ..settings(1)
            },
        );
        let err = runner
            .process(job(), &CancellationToken::new(), &quiet)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            PageError::Timeout { secs: 30, ref operation, .. } if operation == "generate"
        ));
    }

    #[tokio::test]
    async fn iteration_never_exceeds_budget() {
        for max in 0..4 {
            let runner = PageJobRunner::new(
                Arc::new(ScriptedGenerator::ok()),
                Arc::new(CountingRenderer::default()),
                settings(max),
            );
            let r = runner
                .process(job(), &CancellationToken::new(), &quiet)
                .await
                .unwrap();
            assert!(r.iterations_performed <= max);
            assert_eq!(r.quality_history.len() as u32, max);
        }
    }
}
