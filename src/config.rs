//! Configuration types for PDF-to-HTML conversion.
//!
//! Every knob of a conversion run lives in [`ConversionConfig`], built via
//! its [`ConversionConfigBuilder`]. One struct can be shared across tasks,
//! logged with `{:?}`, and compared between runs.
//!
//! # Design choice: builder over constructor
//! The config has more than twenty fields. The builder lets callers set only
//! what they care about and rely on documented defaults for the rest.

use crate::error::Pdf2HtmlError;
use edgequake_llm::LLMProvider;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

/// Configuration for a PDF-to-HTML conversion.
///
/// # Example
/// ```rust
/// use edgequake_pdf2html::ConversionConfig;
///
/// let config = ConversionConfig::builder()
///     .max_iterations(3)
///     .rate_limit_interval_ms(2_000)
///     .model("gemini-2.0-flash")
///     .build()
///     .unwrap();
/// assert_eq!(config.max_iterations, 3);
/// ```
#[derive(Clone)]
pub struct ConversionConfig {
    /// Rasterisation DPI. Range: 72–600. Default: 300.
    ///
    /// The reference image is what the generator copies and what the
    /// similarity check compares against, so it is rendered sharper than a
    /// transcription pipeline would need.
    pub dpi: u32,

    /// Cap on either raster dimension in pixels. Default: 4000.
    pub max_rendered_pixels: u32,

    /// Refinement passes per page after the initial generation. Default: 2.
    ///
    /// `0` means generate once and never refine.
    pub max_iterations: u32,

    /// Score recorded when similarity scoring fails, and the final score of a
    /// page with no recorded scores. Default: 7.0.
    pub default_score: f32,

    /// Minimum interval between any two generator calls, process-wide.
    /// Default: 5000 ms.
    pub rate_limit_interval_ms: u64,

    /// Hard timeout applied to every collaborator call. `0` disables it.
    /// Default: 180 s.
    pub api_timeout_secs: u64,

    /// Viewport cap used when capturing screenshots. Default: 1920 × 1080.
    pub max_viewport_width: u32,
    pub max_viewport_height: u32,

    /// How long the renderer lets the page settle before capturing. Default: 2000 ms.
    pub render_settle_ms: u64,

    /// Headless Chrome/Chromium binary. If None, well-known names are probed on `PATH`.
    pub browser_path: Option<PathBuf>,

    /// Launch the browser with `--no-sandbox`. Default: false.
    ///
    /// Chrome refuses to start its sandbox as root, so containers running
    /// as root need this.
    pub no_sandbox: bool,

    /// LLM model identifier, e.g. "gemini-2.0-flash", "gpt-4.1".
    pub model: Option<String>,

    /// LLM provider name (e.g. "gemini", "openai", "anthropic").
    /// If None along with `provider`, the provider is resolved from the environment.
    pub provider_name: Option<String>,

    /// Pre-constructed LLM provider. Takes precedence over `provider_name`.
    pub provider: Option<Arc<dyn LLMProvider>>,

    /// Sampling temperature. Default: 0.1.
    pub temperature: f32,

    /// Maximum tokens per generator response. Default: 16384.
    ///
    /// A standalone HTML page with inline CSS is far longer than the text it
    /// carries.
    pub max_tokens: usize,

    /// PDF user password for encrypted documents.
    pub password: Option<String>,

    /// Page selection. Default: all pages.
    pub pages: PageSelection,

    /// Rolling per-task event history kept by the broadcaster. Default: 50.
    pub history_capacity: usize,

    /// Time after completion or failure at which a task is evicted from the
    /// registry. Running tasks are never evicted. Default: 24 h.
    pub task_retention_secs: u64,

    /// Download timeout for URL inputs in seconds. Default: 120.
    pub download_timeout_secs: u64,

    /// Largest accepted upload body. Default: 50 MiB.
    pub max_upload_bytes: usize,
}

impl Default for ConversionConfig {
    fn default() -> Self {
        Self {
            dpi: 300,
            max_rendered_pixels: 4000,
            max_iterations: 2,
            default_score: 7.0,
            rate_limit_interval_ms: 5000,
            api_timeout_secs: 180,
            max_viewport_width: 1920,
            max_viewport_height: 1080,
            render_settle_ms: 2000,
            browser_path: None,
            no_sandbox: false,
            model: None,
            provider_name: None,
            provider: None,
            temperature: 0.1,
            max_tokens: 16384,
            password: None,
            pages: PageSelection::default(),
            history_capacity: 50,
            task_retention_secs: 24 * 60 * 60,
            download_timeout_secs: 120,
            max_upload_bytes: 50 * 1024 * 1024,
        }
    }
}

impl fmt::Debug for ConversionConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConversionConfig")
            .field("dpi", &self.dpi)
            .field("max_rendered_pixels", &self.max_rendered_pixels)
            .field("max_iterations", &self.max_iterations)
            .field("default_score", &self.default_score)
            .field("rate_limit_interval_ms", &self.rate_limit_interval_ms)
            .field("api_timeout_secs", &self.api_timeout_secs)
            .field(
                "max_viewport",
                &(self.max_viewport_width, self.max_viewport_height),
            )
            .field("browser_path", &self.browser_path)
            .field("no_sandbox", &self.no_sandbox)
            .field("model", &self.model)
            .field("provider_name", &self.provider_name)
            .field("provider", &self.provider.as_ref().map(|_| "<dyn LLMProvider>"))
            .field("temperature", &self.temperature)
            .field("max_tokens", &self.max_tokens)
            .field("pages", &self.pages)
            .field("history_capacity", &self.history_capacity)
            .field("task_retention_secs", &self.task_retention_secs)
            .finish()
    }
}

impl ConversionConfig {
    /// Create a new builder for `ConversionConfig`.
    pub fn builder() -> ConversionConfigBuilder {
        ConversionConfigBuilder {
            config: Self::default(),
        }
    }

    /// Per-call timeout, or `None` when disabled.
    pub fn api_timeout(&self) -> Option<Duration> {
        (self.api_timeout_secs > 0).then(|| Duration::from_secs(self.api_timeout_secs))
    }

    pub fn rate_limit_interval(&self) -> Duration {
        Duration::from_millis(self.rate_limit_interval_ms)
    }

    pub fn task_retention(&self) -> Duration {
        Duration::from_secs(self.task_retention_secs)
    }
}

/// Builder for [`ConversionConfig`].
#[derive(Debug)]
pub struct ConversionConfigBuilder {
    config: ConversionConfig,
}

impl ConversionConfigBuilder {
    pub fn dpi(mut self, dpi: u32) -> Self {
        self.config.dpi = dpi.clamp(72, 600);
        self
    }

    pub fn max_rendered_pixels(mut self, px: u32) -> Self {
        self.config.max_rendered_pixels = px.max(100);
        self
    }

    pub fn max_iterations(mut self, n: u32) -> Self {
        self.config.max_iterations = n;
        self
    }

    pub fn default_score(mut self, score: f32) -> Self {
        self.config.default_score = score.clamp(0.0, 10.0);
        self
    }

    pub fn rate_limit_interval_ms(mut self, ms: u64) -> Self {
        self.config.rate_limit_interval_ms = ms;
        self
    }

    pub fn api_timeout_secs(mut self, secs: u64) -> Self {
        self.config.api_timeout_secs = secs;
        self
    }

    pub fn max_viewport(mut self, width: u32, height: u32) -> Self {
        self.config.max_viewport_width = width;
        self.config.max_viewport_height = height;
        self
    }

    pub fn render_settle_ms(mut self, ms: u64) -> Self {
        self.config.render_settle_ms = ms;
        self
    }

    pub fn browser_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.browser_path = Some(path.into());
        self
    }

    pub fn no_sandbox(mut self, enabled: bool) -> Self {
        self.config.no_sandbox = enabled;
        self
    }

    pub fn model(mut self, model: impl Into<String>) -> Self {
        self.config.model = Some(model.into());
        self
    }

    pub fn provider_name(mut self, name: impl Into<String>) -> Self {
        self.config.provider_name = Some(name.into());
        self
    }

    pub fn provider(mut self, provider: Arc<dyn LLMProvider>) -> Self {
        self.config.provider = Some(provider);
        self
    }

    pub fn temperature(mut self, t: f32) -> Self {
        self.config.temperature = t.clamp(0.0, 2.0);
        self
    }

    pub fn max_tokens(mut self, n: usize) -> Self {
        self.config.max_tokens = n;
        self
    }

    pub fn password(mut self, pwd: impl Into<String>) -> Self {
        self.config.password = Some(pwd.into());
        self
    }

    pub fn pages(mut self, selection: PageSelection) -> Self {
        self.config.pages = selection;
        self
    }

    pub fn history_capacity(mut self, n: usize) -> Self {
        self.config.history_capacity = n;
        self
    }

    pub fn task_retention_secs(mut self, secs: u64) -> Self {
        self.config.task_retention_secs = secs;
        self
    }

    pub fn download_timeout_secs(mut self, secs: u64) -> Self {
        self.config.download_timeout_secs = secs;
        self
    }

    pub fn max_upload_bytes(mut self, n: usize) -> Self {
        self.config.max_upload_bytes = n;
        self
    }

    /// Build the configuration, validating constraints.
    pub fn build(self) -> Result<ConversionConfig, Pdf2HtmlError> {
        let c = &self.config;
        if c.dpi < 72 || c.dpi > 600 {
            return Err(Pdf2HtmlError::InvalidConfig(format!(
                "DPI must be 72–600, got {}",
                c.dpi
            )));
        }
        if c.max_viewport_width == 0 || c.max_viewport_height == 0 {
            return Err(Pdf2HtmlError::InvalidConfig(
                "Viewport cap must be non-zero in both dimensions".into(),
            ));
        }
        if c.history_capacity == 0 {
            return Err(Pdf2HtmlError::InvalidConfig(
                "Event history capacity must be ≥ 1".into(),
            ));
        }
        if c.max_tokens == 0 {
            return Err(Pdf2HtmlError::InvalidConfig("max_tokens must be ≥ 1".into()));
        }
        Ok(self.config)
    }
}

// ── Page selection ───────────────────────────────────────────────────────

/// Specifies which pages of the PDF to convert.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum PageSelection {
    /// Convert all pages (default).
    #[default]
    All,
    /// Convert a single page (1-indexed).
    Single(usize),
    /// Convert a contiguous range of pages (1-indexed, inclusive).
    Range(usize, usize),
    /// Convert specific pages (1-indexed, deduplicated).
    Set(Vec<usize>),
}

impl PageSelection {
    /// Expand the selection into a sorted, deduplicated list of 0-indexed page numbers.
    pub fn to_indices(&self, total_pages: usize) -> Vec<usize> {
        let mut indices: Vec<usize> = match self {
            PageSelection::All => (0..total_pages).collect(),
            PageSelection::Single(p) => {
                if *p >= 1 && *p <= total_pages {
                    vec![p - 1]
                } else {
                    vec![]
                }
            }
            PageSelection::Range(start, end) => {
                let s = (*start).max(1) - 1;
                let e = (*end).min(total_pages);
                (s..e).collect()
            }
            PageSelection::Set(pages) => pages
                .iter()
                .filter(|&&p| p >= 1 && p <= total_pages)
                .map(|p| p - 1)
                .collect(),
        };
        indices.sort_unstable();
        indices.dedup();
        indices
    }
}

impl std::str::FromStr for PageSelection {
    type Err = Pdf2HtmlError;

    /// Parse `all`, `5`, `3-15` or `1,3,5`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim().to_lowercase();
        let bad = |detail: String| Pdf2HtmlError::InvalidConfig(format!("pages: {detail}"));
        let page = |p: &str| -> Result<usize, Pdf2HtmlError> {
            match p.trim().parse::<usize>() {
                Ok(0) => Err(bad("pages are 1-indexed, minimum is 1".into())),
                Ok(n) => Ok(n),
                Err(_) => Err(bad(format!("invalid page number '{}'", p.trim()))),
            }
        };

        if s == "all" {
            return Ok(PageSelection::All);
        }
        if let Some((start, end)) = s.split_once('-') {
            let (start, end) = (page(start)?, page(end)?);
            if start > end {
                return Err(bad(format!("range {start}-{end}: start must be <= end")));
            }
            return Ok(PageSelection::Range(start, end));
        }
        if s.contains(',') {
            let pages = s.split(',').map(page).collect::<Result<Vec<_>, _>>()?;
            return Ok(PageSelection::Set(pages));
        }
        Ok(PageSelection::Single(page(&s)?))
    }
}
