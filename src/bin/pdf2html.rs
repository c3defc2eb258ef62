//! CLI binary for edgequake-pdf2html.
//!
//! A thin shim over the library crate: maps flags to `ConversionConfig`,
//! drives a progress bar from the task's event stream and writes results.

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use edgequake_pdf2html::pipeline::rasterize::PdfiumRasterizer;
use edgequake_pdf2html::{
    resolve_input, write_atomic, ConversionConfig, ConversionResult, PageSelection,
    ProgressBroadcaster, ProgressEvent, Subscription, TaskOrchestrator, TaskRegistry,
};
use indicatif::{ProgressBar, ProgressStyle};
use std::io::{self, Write};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

// ── ANSI colour helpers (no extra deps) ──────────────────────────────────────

fn green(s: &str) -> String {
    format!("\x1b[32m{s}\x1b[0m")
}
fn red(s: &str) -> String {
    format!("\x1b[31m{s}\x1b[0m")
}
fn dim(s: &str) -> String {
    format!("\x1b[2m{s}\x1b[0m")
}
fn bold(s: &str) -> String {
    format!("\x1b[1m{s}\x1b[0m")
}
fn cyan(s: &str) -> String {
    format!("\x1b[36m{s}\x1b[0m")
}

const TICKS: &[&str] = &["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏", "⠿"];

const AFTER_HELP: &str = r#"EXAMPLES:
  # Convert to a file
  pdf2html convert document.pdf -o document.html

  # Three refinement passes, first five pages only
  pdf2html convert --iterations 3 --pages 1-5 paper.pdf -o paper.html

  # Generate once, never refine (no browser needed)
  pdf2html convert --iterations 0 document.pdf > document.html

  # Convert from URL with a specific model
  pdf2html convert --provider anthropic --model claude-sonnet-4-20250514 \
      https://arxiv.org/pdf/1706.03762 -o attention.html

  # Inspect PDF metadata (no API key needed)
  pdf2html inspect document.pdf

  # Run the HTTP/WebSocket service
  pdf2html serve --bind 0.0.0.0:8000

ENVIRONMENT VARIABLES:
  OPENAI_API_KEY          OpenAI API key
  ANTHROPIC_API_KEY       Anthropic API key
  GEMINI_API_KEY          Google Gemini API key
  EDGEQUAKE_LLM_PROVIDER  Override provider (openai, anthropic, gemini, ollama)
  EDGEQUAKE_MODEL         Override model ID
  PDFIUM_LIB_PATH         Path to libpdfium if it is not installed system-wide
  PDF2HTML_BROWSER        Chrome/Chromium binary used for screenshots
"#;

/// Convert PDF files and URLs to HTML using Vision LLMs.
#[derive(Parser, Debug)]
#[command(
    name = "pdf2html",
    version,
    about = "Convert PDF files and URLs to HTML using Vision LLMs",
    long_about = "Convert PDF documents to standalone HTML. Each page is drafted by a Vision \
Language Model, rendered in headless Chrome, and refined by showing the model its own \
screenshot next to the original page.",
    arg_required_else_help = true,
    color = clap::ColorChoice::Auto,
    after_long_help = AFTER_HELP
)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Enable DEBUG-level tracing logs.
    #[arg(short, long, global = true, env = "PDF2HTML_VERBOSE")]
    verbose: bool,

    /// Suppress all output except errors.
    #[arg(short, long, global = true, env = "PDF2HTML_QUIET")]
    quiet: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Convert a PDF to HTML.
    Convert(ConvertArgs),
    /// Print PDF metadata without converting.
    Inspect(InspectArgs),
    /// Serve the HTTP, WebSocket and NDJSON API.
    #[cfg(feature = "server")]
    Serve(ServeArgs),
}

#[derive(Args, Debug)]
struct ConvertArgs {
    /// Local PDF file path or HTTP/HTTPS URL.
    input: String,

    /// Write HTML to this file instead of stdout.
    #[arg(short, long, env = "PDF2HTML_OUTPUT")]
    output: Option<PathBuf>,

    /// Output the full ConversionResult as JSON instead of HTML.
    #[arg(long, env = "PDF2HTML_JSON")]
    json: bool,

    /// Disable progress bar.
    #[arg(long, env = "PDF2HTML_NO_PROGRESS")]
    no_progress: bool,

    /// Page selection: all, 5, 3-15, or 1,3,5,7.
    #[arg(long, env = "PDF2HTML_PAGES", default_value = "all")]
    pages: String,

    /// PDF user password for encrypted documents.
    #[arg(long, env = "PDF2HTML_PASSWORD")]
    password: Option<String>,

    #[command(flatten)]
    engine: EngineArgs,
}

#[derive(Args, Debug)]
struct InspectArgs {
    /// Local PDF file path or HTTP/HTTPS URL.
    input: String,

    /// Print metadata as JSON.
    #[arg(long)]
    json: bool,

    /// PDF user password for encrypted documents.
    #[arg(long, env = "PDF2HTML_PASSWORD")]
    password: Option<String>,
}

#[cfg(feature = "server")]
#[derive(Args, Debug)]
struct ServeArgs {
    /// Address to listen on.
    #[arg(long, env = "PDF2HTML_BIND", default_value = "127.0.0.1:8000")]
    bind: std::net::SocketAddr,

    /// Hours a task stays listed and downloadable.
    #[arg(long, env = "PDF2HTML_RETENTION_HOURS", default_value_t = 24)]
    retention_hours: u64,

    /// Largest accepted upload in MiB.
    #[arg(long, env = "PDF2HTML_MAX_UPLOAD_MB", default_value_t = 50)]
    max_upload_mb: usize,

    #[command(flatten)]
    engine: EngineArgs,
}

/// Settings shared by `convert` and `serve`.
#[derive(Args, Debug)]
struct EngineArgs {
    /// LLM model ID (e.g. gemini-2.0-flash, gpt-4.1, claude-sonnet-4-20250514).
    #[arg(long, env = "EDGEQUAKE_MODEL")]
    model: Option<String>,

    /// LLM provider: openai, anthropic, gemini, ollama, azure.
    #[arg(long, env = "EDGEQUAKE_PROVIDER")]
    provider: Option<String>,

    /// Rendering DPI (72–600).
    #[arg(long, env = "PDF2HTML_DPI", default_value_t = 300,
          value_parser = clap::value_parser!(u32).range(72..=600))]
    dpi: u32,

    /// Refinement passes per page (0 = generate once).
    #[arg(long, env = "PDF2HTML_ITERATIONS", default_value_t = 2)]
    iterations: u32,

    /// Minimum milliseconds between two VLM calls, across all tasks.
    #[arg(long, env = "PDF2HTML_RATE_LIMIT_MS", default_value_t = 5000)]
    rate_limit_ms: u64,

    /// Per-call timeout in seconds for VLM and browser calls (0 = none).
    #[arg(long, env = "PDF2HTML_API_TIMEOUT", default_value_t = 180)]
    api_timeout: u64,

    /// Chrome/Chromium binary used for screenshots.
    #[arg(long, env = "PDF2HTML_BROWSER")]
    browser: Option<PathBuf>,

    /// Start the browser without its sandbox (needed when running as root).
    #[arg(long, env = "PDF2HTML_NO_SANDBOX")]
    no_sandbox: bool,

    /// Max LLM output tokens per call.
    #[arg(long, env = "PDF2HTML_MAX_TOKENS", default_value_t = 16384)]
    max_tokens: usize,

    /// LLM temperature (0.0–2.0).
    #[arg(long, env = "PDF2HTML_TEMPERATURE", default_value_t = 0.1)]
    temperature: f32,

    /// HTTP download timeout in seconds.
    #[arg(long, env = "PDF2HTML_DOWNLOAD_TIMEOUT", default_value_t = 120)]
    download_timeout: u64,
}

impl EngineArgs {
    fn builder(&self) -> edgequake_pdf2html::ConversionConfigBuilder {
        let mut builder = ConversionConfig::builder()
            .dpi(self.dpi)
            .max_iterations(self.iterations)
            .rate_limit_interval_ms(self.rate_limit_ms)
            .api_timeout_secs(self.api_timeout)
            .max_tokens(self.max_tokens)
            .temperature(self.temperature)
            .no_sandbox(self.no_sandbox)
            .download_timeout_secs(self.download_timeout);
        if let Some(ref model) = self.model {
            builder = builder.model(model.clone());
        }
        if let Some(ref provider) = self.provider {
            builder = builder.provider_name(provider.clone());
        }
        if let Some(ref browser) = self.browser {
            builder = builder.browser_path(browser.clone());
        }
        builder
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // ── Logging setup ────────────────────────────────────────────────────
    // Suppress INFO-level library logs while the progress bar is active;
    // the bar provides all the feedback that matters to the user.
    let show_progress = match &cli.command {
        Command::Convert(args) => !cli.quiet && !args.no_progress && !args.json,
        _ => false,
    };
    let filter = if cli.verbose {
        "debug"
    } else if cli.quiet || show_progress {
        "error"
    } else {
        "info"
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)),
        )
        .with_writer(io::stderr)
        .init();

    match cli.command {
        Command::Convert(ref args) => run_convert(args, cli.quiet, show_progress).await,
        Command::Inspect(ref args) => run_inspect(args).await,
        #[cfg(feature = "server")]
        Command::Serve(ref args) => run_serve(args).await,
    }
}

// ── convert ──────────────────────────────────────────────────────────────────

async fn run_convert(args: &ConvertArgs, quiet: bool, show_progress: bool) -> Result<()> {
    let pages: PageSelection = args.pages.parse().context("Invalid --pages")?;
    let mut builder = args.engine.builder().pages(pages);
    if let Some(ref password) = args.password {
        builder = builder.password(password.clone());
    }
    let config = builder.build().context("Invalid configuration")?;

    let input = resolve_input(&args.input, config.download_timeout_secs)
        .await
        .context("Failed to open input")?;

    let broadcaster = Arc::new(ProgressBroadcaster::new(config.history_capacity));
    let registry = Arc::new(TaskRegistry::new(Arc::clone(&broadcaster)));
    let orchestrator = TaskOrchestrator::from_config(&config, Arc::clone(&registry))
        .context("Failed to set up conversion")?;

    let task_id = registry.create(input.label());
    let progress = if show_progress {
        let subscription = broadcaster.subscribe(task_id)?;
        Some(tokio::spawn(drive_progress_bar(subscription)))
    } else {
        None
    };

    // Ctrl-C cancels the task; pages already done are still written out.
    let cancel_handle = orchestrator.clone();
    let ctrl_c = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            cancel_handle.cancel(task_id);
        }
    });

    let result = orchestrator.run_task(task_id, input).await;
    ctrl_c.abort();
    if let Some(handle) = progress {
        let _ = handle.await;
    }

    if !result.is_success() {
        let reason = result.errors.first().cloned().unwrap_or_else(|| "unknown error".into());
        anyhow::bail!("Conversion failed: {reason}");
    }

    if args.json {
        let json = serde_json::to_string_pretty(&result).context("Failed to serialise result")?;
        match args.output {
            Some(ref path) => write_atomic(path, &json).await?,
            None => println!("{json}"),
        }
        return Ok(());
    }

    let html = result
        .combined_document
        .as_ref()
        .map(|d| d.html.as_str())
        .unwrap_or_default();
    match args.output {
        Some(ref path) => {
            write_atomic(path, html).await?;
            if !quiet {
                print_summary(&result);
                eprintln!("   →  {}", bold(&path.display().to_string()));
            }
        }
        None => {
            let stdout = io::stdout();
            let mut handle = stdout.lock();
            handle
                .write_all(html.as_bytes())
                .context("Failed to write to stdout")?;
            if !quiet {
                print_summary(&result);
            }
        }
    }
    Ok(())
}

/// Render the task's event stream as a spinner, then a page bar.
async fn drive_progress_bar(mut subscription: Subscription) {
    let bar = ProgressBar::new(0);
    bar.set_style(
        ProgressStyle::with_template("{spinner:.cyan} {prefix:.bold}  {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_spinner())
            .tick_strings(TICKS),
    );
    bar.set_prefix("Preparing");
    bar.set_message("Opening PDF…");
    bar.enable_steady_tick(Duration::from_millis(80));

    let activate = |total: usize| {
        bar.set_style(
            ProgressStyle::with_template(
                "{spinner:.cyan} {prefix:.bold}  \
                 [{bar:42.green/238}] {pos:>3}/{len} pages  \
                 ⏱ {elapsed_precise}  {msg}",
            )
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("█▉▊▋▌▍▎▏  ")
            .tick_strings(TICKS),
        );
        bar.set_length(total as u64);
        bar.set_prefix("Converting");
        bar.println(format!(
            "{} {}",
            cyan("◆"),
            bold(&format!("Starting conversion of {total} pages…"))
        ));
    };

    while let Some(event) = subscription.recv().await {
        match event {
            ProgressEvent::Progress {
                message,
                total_pages,
                ..
            } => {
                if let Some(total) = total_pages {
                    if bar.length() != Some(total as u64) {
                        activate(total);
                    }
                }
                bar.set_message(message);
            }
            ProgressEvent::PageCompleted {
                page_number,
                markup,
                current_page,
                total_pages,
                ..
            } => {
                bar.println(format!(
                    "  {} Page {:>3}/{:<3}  {}",
                    green("✓"),
                    page_number,
                    total_pages,
                    dim(&format!("{:>6} chars", markup.len())),
                ));
                bar.set_position(current_page as u64);
            }
            ProgressEvent::Completed { .. } | ProgressEvent::Error { .. } => {
                bar.finish_and_clear();
            }
            ProgressEvent::Connected { .. } => {}
        }
    }
}

fn print_summary(result: &ConversionResult) {
    for page in &result.pages {
        match page.error {
            Some(ref e) if page.is_fallback() => {
                let msg = e.to_string();
                let msg = if msg.chars().count() > 80 {
                    format!("{}\u{2026}", msg.chars().take(79).collect::<String>())
                } else {
                    msg
                };
                eprintln!("  {} Page {:>3}  {}", red("✗"), page.page_number, red(&msg));
            }
            _ => eprintln!(
                "  {} Page {:>3}  {}  {}",
                green("✓"),
                page.page_number,
                dim(&format!(
                    "{} passes, score {:.1}",
                    page.iterations_performed, page.final_score
                )),
                dim(&format!("{:.1}s", page.duration_secs)),
            ),
        }
    }

    let total = result.pages.len();
    let failed = result.fallback_pages().count();
    if failed == 0 {
        eprintln!(
            "{} {} pages converted in {:.1}s",
            green("✔"),
            bold(&total.to_string()),
            result.duration_secs
        );
    } else {
        eprintln!(
            "{} {}/{} pages converted  ({} fell back)",
            if failed == total { red("✘") } else { cyan("⚠") },
            bold(&(total - failed).to_string()),
            total,
            red(&failed.to_string()),
        );
    }
}

// ── inspect ──────────────────────────────────────────────────────────────────

async fn run_inspect(args: &InspectArgs) -> Result<()> {
    let mut builder = ConversionConfig::builder();
    if let Some(ref password) = args.password {
        builder = builder.password(password.clone());
    }
    let config = builder.build().context("Invalid configuration")?;
    let input = resolve_input(&args.input, config.download_timeout_secs)
        .await
        .context("Failed to open input")?;
    let meta = PdfiumRasterizer::from_config(&config)
        .inspect(input.path())
        .await
        .context("Failed to inspect PDF")?;

    if args.json {
        println!(
            "{}",
            serde_json::to_string_pretty(&meta).context("Failed to serialize metadata")?
        );
        return Ok(());
    }

    println!("File:         {}", args.input);
    for (label, value) in [
        ("Title:       ", &meta.title),
        ("Author:      ", &meta.author),
        ("Subject:     ", &meta.subject),
    ] {
        if !value.is_empty() {
            println!("{label} {value}");
        }
    }
    println!("Pages:        {}", meta.page_count);
    println!("PDF Version:  {}", meta.pdf_version);
    for (label, value) in [
        ("Producer:    ", &meta.producer),
        ("Creator:     ", &meta.creator),
        ("Created:     ", &meta.creation_date),
        ("Modified:    ", &meta.modification_date),
    ] {
        if !value.is_empty() {
            println!("{label} {value}");
        }
    }
    Ok(())
}

// ── serve ────────────────────────────────────────────────────────────────────

#[cfg(feature = "server")]
async fn run_serve(args: &ServeArgs) -> Result<()> {
    let config = args
        .engine
        .builder()
        .task_retention_secs(args.retention_hours.saturating_mul(3600))
        .max_upload_bytes(args.max_upload_mb.saturating_mul(1024 * 1024))
        .build()
        .context("Invalid configuration")?;

    let broadcaster = Arc::new(ProgressBroadcaster::new(config.history_capacity));
    let registry = Arc::new(TaskRegistry::new(broadcaster));
    let orchestrator =
        TaskOrchestrator::from_config(&config, registry).context("Failed to set up conversion")?;

    edgequake_pdf2html::server::serve(args.bind, orchestrator, &config)
        .await
        .context("Server stopped with an error")
}
