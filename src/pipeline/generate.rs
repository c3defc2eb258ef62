//! VLM-backed [`Generator`]: builds vision messages and calls the provider.
//!
//! Prompt wording lives in [`crate::prompts`]; this module owns message
//! layout, the shared rate gate, and turning raw replies into HTML or a
//! [`SimilarityReport`].
//!
//! ## No retries here
//!
//! Unlike a one-shot transcription pipeline, a failed call here already has
//! a defined fallback: a failed first draft becomes a placeholder page, a
//! failed refinement keeps the previous draft, and a failed score becomes the
//! default score. Retrying inside the generator would only multiply waits on
//! the rate gate.

use crate::config::ConversionConfig;
use crate::error::{PageError, Pdf2HtmlError};
use crate::pipeline::encode::encode_file;
use crate::pipeline::postprocess::{clean_html, extract_json};
use crate::pipeline::{Generator, PageContext, Screenshot, SimilarityReport};
use crate::prompts::{
    initial_prompt, refine_prompt, similarity_prompt, HTML_SYSTEM_PROMPT, SIMILARITY_SYSTEM_PROMPT,
};
use crate::ratelimit::RateGate;
use async_trait::async_trait;
use edgequake_llm::{ChatMessage, CompletionOptions, ImageData, LLMProvider, ProviderFactory};
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;
use tracing::debug;

/// [`Generator`] that talks to a vision LLM through `edgequake-llm`.
pub struct VlmGenerator {
    provider: Arc<dyn LLMProvider>,
    gate: Arc<RateGate>,
    temperature: f32,
    max_tokens: usize,
}

impl VlmGenerator {
    pub fn new(
        provider: Arc<dyn LLMProvider>,
        gate: Arc<RateGate>,
        config: &ConversionConfig,
    ) -> Self {
        Self {
            provider,
            gate,
            temperature: config.temperature,
            max_tokens: config.max_tokens,
        }
    }

    /// Resolve the provider from `config` (see [`resolve_provider`]) and wrap it.
    pub fn from_config(
        config: &ConversionConfig,
        gate: Arc<RateGate>,
    ) -> Result<Self, Pdf2HtmlError> {
        let provider = resolve_provider(config)?;
        Ok(Self::new(provider, gate, config))
    }

    fn options(&self) -> CompletionOptions {
        CompletionOptions {
            temperature: Some(self.temperature),
            max_tokens: Some(self.max_tokens),
            ..Default::default()
        }
    }

    /// One rate-gated chat call; returns the raw reply text.
    async fn chat(
        &self,
        messages: Vec<ChatMessage>,
        page: usize,
        op: &str,
    ) -> Result<String, String> {
        self.gate.acquire().await;
        let start = Instant::now();
        let response = self
            .provider
            .chat(&messages, Some(&self.options()))
            .await
            .map_err(|e| e.to_string())?;
        debug!(
            page,
            op,
            input_tokens = response.prompt_tokens,
            output_tokens = response.completion_tokens,
            "VLM call finished in {:?}",
            start.elapsed()
        );
        Ok(response.content)
    }

    async fn html_call(
        &self,
        messages: Vec<ChatMessage>,
        page: usize,
        op: &str,
    ) -> Result<String, PageError> {
        let failed = |detail: String| PageError::GenerationFailed { page, detail };
        let raw = self.chat(messages, page, op).await.map_err(failed)?;
        clean_html(&raw).ok_or_else(|| failed(format!("{op}: model returned no HTML")))
    }
}

async fn load_image(path: &Path, page: usize) -> Result<ImageData, PageError> {
    encode_file(path).await.map_err(|e| PageError::GenerationFailed {
        page,
        detail: format!("cannot read image '{}': {}", path.display(), e),
    })
}

#[async_trait]
impl Generator for VlmGenerator {
    async fn generate_initial(
        &self,
        image: &Path,
        page: &PageContext,
    ) -> Result<String, PageError> {
        let image = load_image(image, page.page_number).await?;
        let messages = vec![
            ChatMessage::system(HTML_SYSTEM_PROMPT),
            ChatMessage::user_with_images(&initial_prompt(page), vec![image]),
        ];
        self.html_call(messages, page.page_number, "generate").await
    }

    async fn refine(
        &self,
        original: &Path,
        current_markup: &str,
        screenshot: &Screenshot,
        page: &PageContext,
        iteration: u32,
    ) -> Result<String, PageError> {
        let reference = load_image(original, page.page_number).await?;
        let rendered = load_image(&screenshot.path, page.page_number).await?;
        let messages = vec![
            ChatMessage::system(HTML_SYSTEM_PROMPT),
            ChatMessage::user_with_images(
                &refine_prompt(page, current_markup, iteration),
                vec![reference, rendered],
            ),
        ];
        self.html_call(messages, page.page_number, "refine").await
    }

    async fn score_similarity(
        &self,
        original: &Path,
        screenshot: &Screenshot,
        page: &PageContext,
    ) -> Result<SimilarityReport, PageError> {
        let failed = |detail: String| PageError::ScoringFailed {
            page: page.page_number,
            detail,
        };
        let reference = encode_file(original).await.map_err(|e| failed(e.to_string()))?;
        let rendered = encode_file(&screenshot.path)
            .await
            .map_err(|e| failed(e.to_string()))?;
        let messages = vec![
            ChatMessage::system(SIMILARITY_SYSTEM_PROMPT),
            ChatMessage::user_with_images(&similarity_prompt(page), vec![reference, rendered]),
        ];
        let raw = self
            .chat(messages, page.page_number, "score")
            .await
            .map_err(failed)?;
        parse_similarity(&raw).map_err(failed)
    }
}

/// Parse a similarity reply. Scores are clamped to 0–10.
pub fn parse_similarity(raw: &str) -> Result<SimilarityReport, String> {
    let json = extract_json(raw).ok_or_else(|| "reply contains no JSON object".to_string())?;
    let mut report: SimilarityReport =
        serde_json::from_str(json).map_err(|e| format!("invalid similarity JSON: {e}"))?;
    if !report.overall_score.is_finite() {
        return Err("overall_score is not a number".into());
    }
    report.overall_score = report.overall_score.clamp(0.0, 10.0);
    Ok(report)
}

// ── Provider resolution ──────────────────────────────────────────────────

/// Vision model used when a provider is named without a model.
pub fn default_model_for(provider: &str) -> &'static str {
    match provider {
        "gemini" | "google" | "vertex" => "gemini-2.0-flash",
        "anthropic" => "claude-sonnet-4-20250514",
        "ollama" => "llama3.2-vision",
        _ => "gpt-4.1",
    }
}

fn create_vision_provider(
    provider_name: &str,
    model: &str,
) -> Result<Arc<dyn LLMProvider>, Pdf2HtmlError> {
    ProviderFactory::create_llm_provider(provider_name, model).map_err(|e| {
        Pdf2HtmlError::ProviderNotConfigured {
            provider: provider_name.to_string(),
            hint: format!("{e}"),
        }
    })
}

/// Resolve the LLM provider, from most-specific to least-specific.
///
/// 1. **Pre-built provider** (`config.provider`).
/// 2. **Named provider** (`config.provider_name` + `config.model`, or the
///    provider's default vision model).
/// 3. **Environment pair** (`EDGEQUAKE_LLM_PROVIDER` + `EDGEQUAKE_MODEL`).
/// 4. **Full auto-detection** (`ProviderFactory::from_env`) from whichever
///    API key is set.
pub fn resolve_provider(config: &ConversionConfig) -> Result<Arc<dyn LLMProvider>, Pdf2HtmlError> {
    if let Some(ref provider) = config.provider {
        return Ok(Arc::clone(provider));
    }

    if let Some(ref name) = config.provider_name {
        let model = config.model.as_deref().unwrap_or_else(|| default_model_for(name));
        return create_vision_provider(name, model);
    }

    if let (Ok(prov), Ok(model)) = (
        std::env::var("EDGEQUAKE_LLM_PROVIDER"),
        std::env::var("EDGEQUAKE_MODEL"),
    ) {
        if !prov.is_empty() && !model.is_empty() {
            return create_vision_provider(&prov, &model);
        }
    }

    let (llm_provider, _embedding) =
        ProviderFactory::from_env().map_err(|e| Pdf2HtmlError::ProviderNotConfigured {
            provider: "auto".to_string(),
            hint: format!(
                "No LLM provider could be auto-detected from environment.\n\
                Set GEMINI_API_KEY, OPENAI_API_KEY or ANTHROPIC_API_KEY, or pass --provider.\n\
                Error: {}",
                e
            ),
        })?;

    Ok(llm_provider)
}
