//! Merge per-page HTML into one document.
//!
//! Each page's markup is a standalone HTML document as the generator wrote
//! it. Assembly keeps only the `<body>` content, sorts pages by number and
//! wraps each in a numbered container:
//!
//! ```text
//! <div class="pdf-page" id="page-2" data-page-number="2">
//!   <div class="page-header">Page 2 of 3</div>
//!   <div class="page-content"> …body of page 2… </div>
//! </div>
//! ```
//!
//! Page CSS stays inside the page content as whatever `<style>` tags the
//! body carried; head-level styles are dropped along with the rest of the
//! head. The envelope is written by this module alone, so it is well-formed
//! whatever the fragments contain.

use crate::output::{CombinedDocument, DocumentMetadata, PageResult};
use once_cell::sync::Lazy;
use regex::Regex;
use std::fmt::Write;
use tracing::{debug, warn};

/// Title used when the source document has none.
pub const DEFAULT_TITLE: &str = "Converted PDF Document";

const ENVELOPE_CSS: &str = r#"
    body { margin: 0; padding: 20px; background: #f0f0f0; font-family: Arial, sans-serif; }
    .pdf-page {
      background: #fff; margin: 0 auto 20px; box-shadow: 0 2px 8px rgba(0,0,0,0.15);
      max-width: 100%; overflow: hidden;
    }
    .page-header {
      background: #f8f9fa; border-bottom: 1px solid #dee2e6; padding: 8px 16px;
      font-size: 12px; color: #6c757d;
    }
    .page-content { position: relative; }
    @media print {
      body { background: #fff; padding: 0; }
      .pdf-page { box-shadow: none; margin: 0; page-break-after: always; }
      .page-header { display: none; }
    }
"#;

/// Why a page's body could not be pulled out of its markup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExtractError {
    Empty,
    /// `<body` with no closing `>` or a `</body>` before the body starts.
    MalformedBody,
}

#[derive(Debug, Clone)]
pub struct ResultAssembler {
    default_title: String,
}

impl Default for ResultAssembler {
    fn default() -> Self {
        Self::new(DEFAULT_TITLE)
    }
}

impl ResultAssembler {
    pub fn new(default_title: impl Into<String>) -> Self {
        Self {
            default_title: default_title.into(),
        }
    }

    /// Build the combined document. Input order does not matter.
    pub fn combine(&self, pages: &[PageResult], metadata: &DocumentMetadata) -> CombinedDocument {
        let mut ordered: Vec<&PageResult> = pages.iter().collect();
        ordered.sort_by_key(|p| p.page_number);
        let total = ordered.len();

        let title = if metadata.title.trim().is_empty() {
            self.default_title.as_str()
        } else {
            metadata.title.trim()
        };

        let capacity = pages.iter().map(|p| p.markup.len()).sum::<usize>() + 2048;
        let mut html = String::with_capacity(capacity);
        html.push_str("<!DOCTYPE html>\n<html lang=\"en\">\n<head>\n");
        html.push_str("  <meta charset=\"UTF-8\">\n");
        html.push_str(
            "  <meta name=\"viewport\" content=\"width=device-width, initial-scale=1.0\">\n",
        );
        let _ = writeln!(html, "  <title>{}</title>", escape_html(title));
        for (name, value) in [
            ("author", &metadata.author),
            ("description", &metadata.subject),
            ("generator", &metadata.producer),
        ] {
            if !value.trim().is_empty() {
                let _ = writeln!(
                    html,
                    "  <meta name=\"{name}\" content=\"{}\">",
                    escape_html(value.trim())
                );
            }
        }
        let _ = writeln!(html, "  <style>{ENVELOPE_CSS}  </style>\n</head>\n<body>");

        for page in &ordered {
            let n = page.page_number;
            let content = match extract_body(&page.markup) {
                Ok(body) => seal_fragment(&strip_document_tags(&body)),
                Err(e) => {
                    warn!(page = n, error = ?e, "could not extract page body, using placeholder");
                    format!("<p>Error rendering page {n}</p>")
                }
            };
            let _ = writeln!(
                html,
                "<div class=\"pdf-page\" id=\"page-{n}\" data-page-number=\"{n}\">\n\
                 <div class=\"page-header\">Page {n} of {total}</div>\n\
                 <div class=\"page-content\">\n{}\n</div>\n</div>",
                content.trim()
            );
        }
        html.push_str("</body>\n</html>\n");

        debug!(pages = total, bytes = html.len(), "document assembled");
        CombinedDocument {
            html,
            metadata: metadata.clone(),
            page_count: total,
        }
    }
}

static RE_BODY_OPEN: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)<body\b").unwrap());
static RE_BODY_CLOSE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)</body\s*>").unwrap());

/// Content between `<body …>` and the last `</body>`, or the whole fragment
/// when there is no body tag.
pub fn extract_body(markup: &str) -> Result<String, ExtractError> {
    if markup.trim().is_empty() {
        return Err(ExtractError::Empty);
    }
    let Some(open) = RE_BODY_OPEN.find(markup) else {
        return Ok(markup.to_string());
    };
    let content_start = markup[open.end()..]
        .find('>')
        .map(|i| open.end() + i + 1)
        .ok_or(ExtractError::MalformedBody)?;
    let content_end = match RE_BODY_CLOSE.find_iter(markup).last() {
        Some(close) if close.start() >= content_start => close.start(),
        Some(_) => return Err(ExtractError::MalformedBody),
        // Unterminated body: take everything after the opening tag.
        None => markup.len(),
    };
    Ok(markup[content_start..content_end].to_string())
}

static RE_DOCUMENT_TAGS: Lazy<Regex> = Lazy::new(|| {
    Regex::new(concat!(
        r"(?is)<!doctype[^>]*>|</?html\b[^>]*>",
        r"|<head\b[^>]*>.*?</head\s*>|</?head\b[^>]*>|</?body\b[^>]*>",
    ))
    .unwrap()
});

/// Remove document-level tags a fragment should not carry inside a page container.
fn strip_document_tags(fragment: &str) -> String {
    RE_DOCUMENT_TAGS.replace_all(fragment, "").into_owned()
}

static RE_DIV_TAG: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)<(/?)div\b[^>]*>").unwrap());
static RE_PROTECTED_OPEN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)<!--|<(script|style|textarea|title)\b[^>]*>").unwrap());
static RE_RAW_TEXT_CLOSE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)</(script|style|textarea|title)\s*>").unwrap());

/// Make a fragment safe to embed between envelope tags.
///
/// Unterminated comments and raw-text elements (`script`, `style`,
/// `textarea`, `title`) would swallow everything after them, so they are
/// closed. A tag cut off at the end of the fragment is dropped. `<div>`
/// tags outside those regions are balanced: stray `</div>`s are removed and
/// open ones closed. Text inside comments and raw-text elements is copied
/// untouched.
fn seal_fragment(fragment: &str) -> String {
    let mut out = String::with_capacity(fragment.len() + 32);
    let mut depth = 0usize;
    let mut rest = fragment;

    while let Some(open) = RE_PROTECTED_OPEN.captures(rest) {
        let Some(m) = open.get(0) else { break };
        push_balanced(&mut out, &rest[..m.start()], &mut depth);
        out.push_str(m.as_str());
        let inner = &rest[m.end()..];

        let (end, closer) = match open.get(1) {
            None => (inner.find("-->").map(|i| i + 3), "-->".to_string()),
            Some(name) => {
                let end = RE_RAW_TEXT_CLOSE
                    .captures_iter(inner)
                    .find(|c| {
                        c.get(1)
                            .is_some_and(|n| n.as_str().eq_ignore_ascii_case(name.as_str()))
                    })
                    .and_then(|c| c.get(0))
                    .map(|c| c.end());
                (end, format!("</{}>", name.as_str().to_ascii_lowercase()))
            }
        };
        match end {
            Some(end) => {
                out.push_str(&inner[..end]);
                rest = &inner[end..];
            }
            None => {
                out.push_str(inner);
                out.push_str(&closer);
                rest = "";
            }
        }
    }
    push_balanced(&mut out, drop_truncated_tag(rest), &mut depth);

    for _ in 0..depth {
        out.push_str("</div>");
    }
    out
}

/// Cut a trailing `<tag…` that never reaches its `>`.
fn drop_truncated_tag(fragment: &str) -> &str {
    match fragment.rfind('<') {
        Some(i) if !fragment[i..].contains('>') => {
            let starts_tag = fragment[i + 1..]
                .chars()
                .next()
                .is_some_and(|c| c.is_ascii_alphabetic() || c == '/' || c == '!');
            if starts_tag {
                &fragment[..i]
            } else {
                fragment
            }
        }
        _ => fragment,
    }
}

/// Copy `segment`, dropping `</div>` tags that would close the envelope.
fn push_balanced(out: &mut String, segment: &str, depth: &mut usize) {
    let mut last = 0;
    for caps in RE_DIV_TAG.captures_iter(segment) {
        let Some(m) = caps.get(0) else { continue };
        let closing = caps.get(1).is_some_and(|c| !c.as_str().is_empty());
        out.push_str(&segment[last..m.start()]);
        last = m.end();
        if closing {
            if *depth == 0 {
                continue;
            }
            *depth -= 1;
        } else if !m.as_str().ends_with("/>") {
            *depth += 1;
        }
        out.push_str(m.as_str());
    }
    out.push_str(&segment[last..]);
}

fn escape_html(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            _ => out.push(c),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::PageError;
    use crate::output::Dimensions;

    fn page(n: usize, markup: &str) -> PageResult {
        PageResult {
            page_number: n,
            markup: markup.into(),
            iterations_performed: 1,
            final_score: 8.0,
            quality_history: vec![8.0],
            duration_secs: 1.0,
            geometry: Dimensions::new(612.0, 792.0),
            pixel_geometry: Dimensions::new(2550.0, 3300.0),
            error: None,
            fallback: false,
        }
    }

    fn doc(body: &str) -> String {
        format!(
            "<!DOCTYPE html><html><head><style>p{{color:red}}</style></head>\
             <body class=\"x\">{body}</body></html>"
        )
    }

    #[test]
    fn pages_are_sorted_and_numbered() {
        let pages = [
            page(3, &doc("<p>three</p>")),
            page(1, &doc("<p>one</p>")),
            page(2, &doc("<p>two</p>")),
        ];
        let out = ResultAssembler::default().combine(&pages, &DocumentMetadata::default());
        assert_eq!(out.page_count, 3);
        let one = out.html.find("<p>one</p>").unwrap();
        let two = out.html.find("<p>two</p>").unwrap();
        let three = out.html.find("<p>three</p>").unwrap();
        assert!(one < two && two < three);
        assert!(out.html.contains("id=\"page-2\""));
        assert!(out.html.contains("Page 3 of 3"));
        assert_eq!(out.html.matches("class=\"pdf-page\"").count(), 3);
        assert_eq!(out.html.matches("<body").count(), 1);
        assert!(!out.html.contains("color:red"));
    }

    #[test]
    fn title_from_metadata_is_escaped() {
        let meta = DocumentMetadata {
            title: "Q&A <draft>".into(),
            author: "Ada".into(),
            ..Default::default()
        };
        let out = ResultAssembler::default().combine(&[page(1, "<p>x</p>")], &meta);
        assert!(out.html.contains("<title>Q&amp;A &lt;draft&gt;</title>"));
        assert!(out.html.contains("<meta name=\"author\" content=\"Ada\">"));

        let out = ResultAssembler::default()
            .combine(&[page(1, "<p>x</p>")], &DocumentMetadata::default());
        assert!(out.html.contains("<title>Converted PDF Document</title>"));
    }

    #[test]
    fn extract_body_variants() {
        assert_eq!(extract_body(&doc("<p>a</p>")).unwrap(), "<p>a</p>");
        assert_eq!(extract_body("<p>fragment</p>").unwrap(), "<p>fragment</p>");
        assert_eq!(extract_body("<BODY>\n<p>a</p>").unwrap(), "\n<p>a</p>");
        assert_eq!(extract_body("   "), Err(ExtractError::Empty));
        assert_eq!(extract_body("<p>x</p><body"), Err(ExtractError::MalformedBody));
        assert_eq!(extract_body("</body><body><p>x</p>"), Err(ExtractError::MalformedBody));
    }

    #[test]
    fn bad_fragment_gets_placeholder_without_aborting() {
        let pages = [page(1, ""), page(2, &doc("<p>fine</p>"))];
        let out = ResultAssembler::default().combine(&pages, &DocumentMetadata::default());
        assert!(out.html.contains("<p>Error rendering page 1</p>"));
        assert!(out.html.contains("<p>fine</p>"));
        assert_eq!(out.page_count, 2);
    }

    #[test]
    fn stray_closing_divs_cannot_break_envelope() {
        let out = ResultAssembler::default().combine(
            &[page(1, "<div><p>a</p></div></div></div>"), page(2, "<div class=\"open\"><p>b</p>")],
            &DocumentMetadata::default(),
        );
        assert_eq!(out.html.matches("<div").count(), out.html.matches("</div>").count());
        assert!(out.html.trim_end().ends_with("</body>\n</html>"));
    }

    #[test]
    fn fallback_pages_keep_their_container() {
        let fallback = PageResult::fallback(
            2,
            Dimensions::new(612.0, 792.0),
            Dimensions::new(2550.0, 3300.0),
            PageError::Cancelled { page: 2 },
        );
        let out = ResultAssembler::default()
            .combine(&[page(1, &doc("<p>one</p>")), fallback], &DocumentMetadata::default());
        assert!(out.html.contains("Page 2 could not be converted"));
        assert!(out.html.contains("data-page-number=\"2\""));
    }

    #[test]
    fn balance_counts_only_div_tags() {
        assert_eq!(seal_fragment("<divider></div>"), "<divider>");
        assert_eq!(seal_fragment("<div><div>x</div>"), "<div><div>x</div></div>");
    }

    #[test]
    fn unterminated_comment_and_raw_text_are_closed() {
        let pages = [
            page(1, "<p>a</p><!-- note"),
            page(2, "<style>p{color:red}"),
            page(3, &doc("<p>three</p>")),
        ];
        let out = ResultAssembler::default().combine(&pages, &DocumentMetadata::default());
        let html = &out.html;

        let comment = html.find("<!-- note").unwrap();
        let comment_end = comment + html[comment..].find("-->").unwrap();
        assert!(comment_end < html.find("id=\"page-2\"").unwrap());

        let style = html.find("<style>p{color:red}").unwrap();
        let style_end = style + html[style..].find("</style>").unwrap();
        assert!(style_end < html.find("id=\"page-3\"").unwrap());

        assert!(html.contains("<p>three</p>"));
        assert!(html.trim_end().ends_with("</body>\n</html>"));
    }

    #[test]
    fn closed_raw_text_is_left_alone() {
        assert_eq!(
            seal_fragment("<SCRIPT>var s = '</div><div>';</SCRIPT><p>x</p>"),
            "<SCRIPT>var s = '</div><div>';</SCRIPT><p>x</p>"
        );
        assert_eq!(seal_fragment("<!-- a --><p>b</p></div>"), "<!-- a --><p>b</p>");
        assert_eq!(seal_fragment("<textarea>x"), "<textarea>x</textarea>");
    }

    #[test]
    fn truncated_trailing_tag_is_dropped() {
        assert_eq!(seal_fragment("<p>x</p><img src=\"a"), "<p>x</p>");
        assert_eq!(seal_fragment("<p>1 < 2</p>"), "<p>1 < 2</p>");
        assert_eq!(seal_fragment("<p>1 <2"), "<p>1 <2");
    }
}
