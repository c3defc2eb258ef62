//! Headless Chrome [`Renderer`]: HTML → PNG screenshot.
//!
//! Each page gets one [`ChromeSession`], which owns a scratch directory for
//! the HTML it is asked to render and the screenshots it produces. Every
//! capture is a short-lived `chrome --headless --screenshot` child process:
//!
//! ```text
//! chrome --headless=new --disable-gpu --hide-scrollbars \
//!        --window-size=W,H --virtual-time-budget=SETTLE_MS \
//!        --screenshot=<dir>/shot_N.png file://<dir>/page_N.html
//! ```
//!
//! `--virtual-time-budget` lets web fonts and layout settle before the
//! capture without a wall-clock sleep. `--no-sandbox` is added only when
//! [`ConversionConfig::no_sandbox`] is set, typically for root inside a
//! container. Children are spawned with
//! `kill_on_drop(true)`, so a capture abandoned by a timeout or cancellation
//! does not leave a browser running.

use crate::config::ConversionConfig;
use crate::error::{PageError, Pdf2HtmlError};
use crate::pipeline::{PageContext, RenderSession, Renderer, Screenshot, Viewport};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tempfile::TempDir;
use tokio::process::Command;
use tracing::{debug, warn};

/// Binary names probed on `PATH` when no browser is configured.
const BROWSER_CANDIDATES: &[&str] = &[
    "google-chrome",
    "google-chrome-stable",
    "chromium",
    "chromium-browser",
    "chrome",
];

/// Longest stderr excerpt kept in a render error.
const STDERR_EXCERPT: usize = 400;

/// [`Renderer`] that shells out to a headless Chrome/Chromium.
#[derive(Debug, Clone)]
pub struct ChromeRenderer {
    browser: PathBuf,
    settle_ms: u64,
    no_sandbox: bool,
}

impl ChromeRenderer {
    pub fn new(browser: impl Into<PathBuf>, settle_ms: u64) -> Self {
        Self {
            browser: browser.into(),
            settle_ms,
            no_sandbox: false,
        }
    }

    /// Launch the browser with its sandbox disabled.
    pub fn with_no_sandbox(mut self, no_sandbox: bool) -> Self {
        self.no_sandbox = no_sandbox;
        self
    }

    /// Use `config.browser_path`, or the first known browser found on `PATH`.
    pub fn from_config(config: &ConversionConfig) -> Result<Self, Pdf2HtmlError> {
        let browser = match &config.browser_path {
            Some(path) if path.is_file() => path.clone(),
            Some(path) => {
                return Err(Pdf2HtmlError::RendererUnavailable(format!(
                    "browser '{}' does not exist",
                    path.display()
                )))
            }
            None => locate_browser().ok_or_else(|| {
                Pdf2HtmlError::RendererUnavailable(format!(
                    "none of {} found on PATH",
                    BROWSER_CANDIDATES.join(", ")
                ))
            })?,
        };
        debug!("Using browser: {}", browser.display());
        if config.no_sandbox {
            warn!("browser sandbox disabled");
        }
        Ok(Self::new(browser, config.render_settle_ms).with_no_sandbox(config.no_sandbox))
    }

    pub fn browser(&self) -> &Path {
        &self.browser
    }
}

/// First [`BROWSER_CANDIDATES`] entry present in a `PATH` directory.
pub fn locate_browser() -> Option<PathBuf> {
    let path = std::env::var_os("PATH")?;
    std::env::split_paths(&path).find_map(|dir| {
        BROWSER_CANDIDATES
            .iter()
            .map(|name| dir.join(name))
            .find(|candidate| candidate.is_file())
    })
}

#[async_trait]
impl Renderer for ChromeRenderer {
    async fn start(&self, page: &PageContext) -> Result<Box<dyn RenderSession>, PageError> {
        let workdir = tempfile::Builder::new()
            .prefix(&format!("pdf2html-render-p{}-", page.page_number))
            .tempdir()
            .map_err(|e| PageError::RenderFailed {
                page: page.page_number,
                detail: format!("cannot create session directory: {e}"),
            })?;
        debug!(
            page = page.page_number,
            dir = %workdir.path().display(),
            "render session started"
        );
        Ok(Box::new(ChromeSession {
            browser: self.browser.clone(),
            settle_ms: self.settle_ms,
            no_sandbox: self.no_sandbox,
            page: page.page_number,
            workdir: Some(workdir),
            captures: 0,
        }))
    }
}

/// One page's render session. Dropping it without [`RenderSession::stop`]
/// still removes the scratch directory.
pub struct ChromeSession {
    browser: PathBuf,
    settle_ms: u64,
    no_sandbox: bool,
    page: usize,
    workdir: Option<TempDir>,
    captures: u32,
}

impl ChromeSession {
    fn failed(&self, detail: impl Into<String>) -> PageError {
        PageError::RenderFailed {
            page: self.page,
            detail: detail.into(),
        }
    }

    fn browser_args(&self, viewport: Viewport, shot: &Path, html: &Path) -> Vec<String> {
        let mut args = vec!["--headless=new".to_string(), "--disable-gpu".to_string()];
        if self.no_sandbox {
            args.push("--no-sandbox".to_string());
        }
        args.extend([
            "--hide-scrollbars".to_string(),
            "--no-first-run".to_string(),
            format!("--window-size={},{}", viewport.width, viewport.height),
            format!("--virtual-time-budget={}", self.settle_ms),
            format!("--screenshot={}", shot.display()),
            format!("file://{}", html.display()),
        ]);
        args
    }
}

#[async_trait]
impl RenderSession for ChromeSession {
    async fn capture(&mut self, markup: &str, viewport: Viewport) -> Result<Screenshot, PageError> {
        let dir = match &self.workdir {
            Some(dir) => dir.path().to_path_buf(),
            None => return Err(self.failed("session already stopped")),
        };
        self.captures += 1;
        let html_path = dir.join(format!("page_{}.html", self.captures));
        let shot_path = dir.join(format!("shot_{}.png", self.captures));

        tokio::fs::write(&html_path, markup)
            .await
            .map_err(|e| self.failed(format!("cannot write HTML: {e}")))?;

        let output = Command::new(&self.browser)
            .args(self.browser_args(viewport, &shot_path, &html_path))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| self.failed(format!("cannot launch '{}': {e}", self.browser.display())))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let excerpt: String = stderr.chars().take(STDERR_EXCERPT).collect();
            return Err(self.failed(format!(
                "browser exited with {}: {}",
                output.status,
                excerpt.trim()
            )));
        }

        let (width, height) = image::image_dimensions(&shot_path)
            .map_err(|e| self.failed(format!("no usable screenshot: {e}")))?;
        debug!(page = self.page, width, height, "screenshot captured");

        Ok(Screenshot {
            path: shot_path,
            width,
            height,
        })
    }

    async fn stop(mut self: Box<Self>) {
        if let Some(dir) = self.workdir.take() {
            let path = dir.path().to_path_buf();
            if let Err(e) = dir.close() {
                warn!(
                    page = self.page,
                    dir = %path.display(),
                    error = %e,
                    "render session cleanup failed"
                );
            }
        }
        debug!(page = self.page, captures = self.captures, "render session stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::output::Dimensions;

    fn ctx() -> PageContext {
        PageContext {
            page_number: 1,
            geometry: Dimensions::new(612.0, 792.0),
            pixel_geometry: Dimensions::new(1275.0, 1650.0),
        }
    }

    #[test]
    fn missing_configured_browser_is_unavailable() {
        let config = ConversionConfig::builder()
            .browser_path("/nonexistent/chrome")
            .build()
            .unwrap();
        let err = ChromeRenderer::from_config(&config).unwrap_err();
        assert!(matches!(err, Pdf2HtmlError::RendererUnavailable(_)));
    }

    fn args(no_sandbox: bool) -> Vec<String> {
        let session = ChromeSession {
            browser: PathBuf::from("/usr/bin/chromium"),
            settle_ms: 1500,
            no_sandbox,
            page: 1,
            workdir: None,
            captures: 0,
        };
        let viewport = Viewport { width: 800, height: 600 };
        session.browser_args(viewport, Path::new("/tmp/s.png"), Path::new("/tmp/p.html"))
    }

    #[test]
    fn sandbox_stays_on_unless_disabled() {
        let args = args(false);
        assert!(!args.iter().any(|a| a == "--no-sandbox"));
        assert_eq!(args[0], "--headless=new");
        assert!(args.contains(&"--window-size=800,600".to_string()));
        assert!(args.contains(&"--virtual-time-budget=1500".to_string()));
        assert_eq!(args.last().map(String::as_str), Some("file:///tmp/p.html"));

        assert!(self::args(true).iter().any(|a| a == "--no-sandbox"));
    }

    #[test]
    fn config_flag_reaches_renderer() {
        let browser = tempfile::NamedTempFile::new().unwrap();
        let config = ConversionConfig::builder()
            .browser_path(browser.path())
            .no_sandbox(true)
            .build()
            .unwrap();
        assert!(ChromeRenderer::from_config(&config).unwrap().no_sandbox);

        let config = ConversionConfig::builder()
            .browser_path(browser.path())
            .build()
            .unwrap();
        assert!(!ChromeRenderer::from_config(&config).unwrap().no_sandbox);
    }

    #[tokio::test]
    async fn session_starts_and_stops_without_captures() {
        let renderer = ChromeRenderer::new("/nonexistent/chrome", 0);
        let session = renderer.start(&ctx()).await.unwrap();
        session.stop().await;
    }

    #[tokio::test]
    async fn capture_with_missing_browser_is_render_error() {
        let renderer = ChromeRenderer::new("/nonexistent/chrome", 0);
        let mut session = renderer.start(&ctx()).await.unwrap();
        let err = session
            .capture("<p>x</p>", Viewport { width: 100, height: 100 })
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "render_failed");
        session.stop().await;
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn capture_reads_browser_screenshot() {
        use std::os::unix::fs::PermissionsExt;

        // A stand-in browser that writes a PNG wherever --screenshot points.
        let bin_dir = tempfile::tempdir().unwrap();
        let png = bin_dir.path().join("fixture.png");
        image::RgbaImage::from_pixel(40, 30, image::Rgba([255, 255, 255, 255]))
            .save(&png)
            .unwrap();
        let script = bin_dir.path().join("fake-chrome");
        std::fs::write(
            &script,
            format!(
                "#!/bin/sh\nfor a in \"$@\"; do case \"$a\" in \
                 --screenshot=*) cp '{}' \"${{a#--screenshot=}}\";; esac; done\n",
                png.display()
            ),
        )
        .unwrap();
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();

        let renderer = ChromeRenderer::new(&script, 0);
        let mut session = renderer.start(&ctx()).await.unwrap();
        let shot = session
            .capture("<p>x</p>", Viewport { width: 40, height: 30 })
            .await
            .unwrap();
        assert_eq!((shot.width, shot.height), (40, 30));
        assert!(shot.path.exists());
        let shot_path = shot.path.clone();
        shot.release().await;
        assert!(!shot_path.exists());
        session.stop().await;
    }
}
