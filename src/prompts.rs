//! Prompts for HTML generation, refinement and similarity scoring.
//!
//! Centralising every prompt here serves two purposes:
//!
//! 1. **Single source of truth**: tightening a rule (say, how fonts are
//!    matched) means editing exactly one place.
//!
//! 2. **Testability**: unit tests inspect the prompt text directly, so a
//!    regression like losing the page geometry is caught without a live model.

use crate::pipeline::PageContext;

/// System prompt shared by initial generation and refinement.
pub const HTML_SYSTEM_PROMPT: &str = r#"You are an expert frontend engineer who rebuilds
document pages as standalone HTML5 + CSS.

Follow these rules precisely:

1. CONTENT
   - Reproduce ALL visible text exactly, in reading order
   - Keep headings, paragraphs, lists and tables as semantic HTML elements

2. LAYOUT
   - Match the page's positioning, margins, columns and spacing as closely as possible
   - Size the page container to the page dimensions you are given
   - Use CSS grid or flexbox for multi-column regions
   - Avoid absolute positioning unless nothing else works

3. STYLE
   - Match font families (web-safe equivalents), sizes, weights, colours and backgrounds
   - Reproduce borders, rules and shaded boxes with CSS
   - Represent figures and photos with a neutral placeholder box of the same size
   - Never link external images

4. OUTPUT FORMAT
   - Output ONE complete document: <!DOCTYPE html>, <html>, <head> with a <style> block, <body>
   - Put all CSS in the <style> block; no external stylesheets or scripts
   - Do NOT wrap the answer in ``` fences
   - Do NOT add explanations before or after the document"#;

/// System prompt for similarity scoring.
pub const SIMILARITY_SYSTEM_PROMPT: &str = r#"You are a visual quality inspector. You compare
a reference document page (first image) with a browser rendering of its HTML
reconstruction (second image).

Rate each aspect from 1 to 10 (10 = indistinguishable):
- overall_score
- text_accuracy: text content is complete and correct
- layout_similarity: positions, alignment, spacing
- color_accuracy: text, background and rule colours
- typography_match: font family, size, weight

Reply with ONLY a JSON object of this shape:
{
  "overall_score": 0,
  "text_accuracy": 0,
  "layout_similarity": 0,
  "color_accuracy": 0,
  "typography_match": 0,
  "major_differences": ["..."],
  "recommendations": ["..."]
}"#;

/// User message for the first draft of a page.
pub fn initial_prompt(page: &PageContext) -> String {
    format!(
        "Convert this document page (page {}) into HTML.\n\
         Page size: {:.0} × {:.0} pt. Reference image: {:.0} × {:.0} px.\n\
         The rendered page should have the same aspect ratio as the reference image.",
        page.page_number,
        page.geometry.width,
        page.geometry.height,
        page.pixel_geometry.width,
        page.pixel_geometry.height,
    )
}

/// User message for a refinement pass. The first attached image is the
/// reference page, the second is the screenshot of `current_markup`.
pub fn refine_prompt(page: &PageContext, current_markup: &str, iteration: u32) -> String {
    format!(
        "Refinement pass {iteration} for page {page_number}.\n\
         Image 1 is the reference page. Image 2 is a browser screenshot of the HTML below.\n\
         Find every visible difference (missing or wrong text, misplaced blocks, spacing, \
         font size and weight, colours, borders) and return the corrected, \
         complete HTML document.\n\
         Keep everything that already matches. Page size: {w:.0} × {h:.0} pt.\n\n\
         CURRENT HTML:\n{current_markup}",
        page_number = page.page_number,
        w = page.geometry.width,
        h = page.geometry.height,
    )
}

/// User message for similarity scoring.
pub fn similarity_prompt(page: &PageContext) -> String {
    format!(
        "Image 1: reference page {}. Image 2: rendering of the reconstruction. \
         Score their similarity.",
        page.page_number
    )
}
