//! Post-processing: deterministic cleanup of VLM-generated HTML and JSON.
//!
//! ## Why is post-processing necessary?
//!
//! Even well-prompted VLMs wrap their answer in artefacts that are harmless
//! to a human reader but break a browser or a JSON parser:
//!
//! - ` ```html ... ``` ` fences despite the prompt saying not to
//! - a chatty preamble ("Here is the HTML:") or a closing remark after `</html>`
//! - Windows `\r\n` line endings and zero-width characters
//!
//! These rules fix the wrapping without touching the document itself, so the
//! prompts can stay focused on *what to produce*.

use once_cell::sync::Lazy;
use regex::Regex;

/// Apply every HTML cleanup rule, in order:
///
/// 1. Strip an outer code fence (` ```html `, ` ```HTML `, bare ` ``` `)
/// 2. Normalise line endings (CRLF → LF)
/// 3. Strip invisible Unicode (zero-width spaces, BOM, word joiners)
/// 4. Drop prose before `<!DOCTYPE`/`<html` and after `</html>`
/// 5. Ensure the output ends with exactly one newline
///
/// Returns `None` when nothing but whitespace is left.
pub fn clean_html(input: &str) -> Option<String> {
    let s = strip_code_fences(input);
    let s = normalise_line_endings(&s);
    let s = remove_invisible_chars(&s);
    let s = trim_to_document(&s);
    let s = ensure_final_newline(&s);
    if s.trim().is_empty() {
        None
    } else {
        Some(s)
    }
}

/// Pull the JSON object out of a model reply, tolerating fences and prose.
pub fn extract_json(input: &str) -> Option<&str> {
    let start = input.find('{')?;
    let end = input.rfind('}')?;
    (end > start).then(|| &input[start..=end])
}

// ── Rule 1: Strip outer code fences ──────────────────────────────────────────

static RE_OUTER_FENCES: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?is)^```[a-z0-9]*[ \t]*\r?\n(.*?)\r?\n```\s*$").unwrap());

fn strip_code_fences(input: &str) -> String {
    if let Some(caps) = RE_OUTER_FENCES.captures(input.trim()) {
        caps[1].to_string()
    } else {
        input.to_string()
    }
}

// ── Rule 2: Normalise line endings ───────────────────────────────────────────

fn normalise_line_endings(input: &str) -> String {
    input.replace("\r\n", "\n").replace('\r', "\n")
}

// ── Rule 3: Remove invisible Unicode characters ─────────────────────────────

fn remove_invisible_chars(input: &str) -> String {
    input.replace(['\u{200B}', '\u{FEFF}', '\u{200C}', '\u{200D}', '\u{2060}'], "")
}

// ── Rule 4: Trim to the document ─────────────────────────────────────────────
//
// Only trims when a document boundary is actually present; a bare fragment
// (`<div>…</div>`) passes through untouched.

static RE_DOC_START: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)<!doctype\s+html|<html[\s>]").unwrap());
static RE_DOC_END: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)</html\s*>").unwrap());

fn trim_to_document(input: &str) -> String {
    let start = RE_DOC_START.find(input).map(|m| m.start()).unwrap_or(0);
    let end = RE_DOC_END
        .find_iter(input)
        .last()
        .map(|m| m.end())
        .filter(|&e| e > start)
        .unwrap_or(input.len());
    input[start..end].trim().to_string()
}

// ── Rule 5: Final newline ────────────────────────────────────────────────────

fn ensure_final_newline(input: &str) -> String {
    let trimmed = input.trim_end();
    if trimmed.is_empty() {
        String::new()
    } else {
        format!("{}\n", trimmed)
    }
}

// ── Tests ────────────────────────────────────────────────────────────────────
