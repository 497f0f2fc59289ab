//! Ordered parser pipelines for generator output.
//!
//! Each artifact declares the wrappers it accepts, tried in order. The first
//! wrapper that yields non-empty content wins; when none do the caller gets
//! an [`ForgeError::Extraction`] to drive a re-prompt.

use serde_json::Value;

use crate::core::classifier::EXIT_CODE_MARKER;
use crate::core::types::TestPatch;
use crate::error::ForgeError;

/// One way an artifact may be wrapped in generator output.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Wrapper {
    /// `<tag> ... </tag>`
    Tag(&'static str),
    /// A fenced block whose info string starts with the given language.
    Fence(&'static str),
}

pub const DOCKERFILE_WRAPPERS: &[Wrapper] = &[Wrapper::Tag("dockerfile"), Wrapper::Fence("dockerfile")];
pub const SCRIPT_WRAPPERS: &[Wrapper] = &[
    Wrapper::Tag("script"),
    Wrapper::Fence("script"),
    Wrapper::Fence("bash"),
];
pub const TEST_PATCH_WRAPPERS: &[Wrapper] = &[Wrapper::Tag("test_patch"), Wrapper::Fence("diff")];
pub const ANALYSIS_WRAPPERS: &[Wrapper] = &[Wrapper::Tag("analysis")];

/// Run `wrappers` over `text` in order.
pub fn extract_wrapped(text: &str, wrappers: &[Wrapper]) -> Option<String> {
    wrappers.iter().find_map(|wrapper| {
        let found = match wrapper {
            Wrapper::Tag(tag) => tagged_blocks(text, tag),
            Wrapper::Fence(lang) => fenced_blocks(text, Some(lang)),
        };
        found
            .into_iter()
            .map(|block| strip_outer_fence(&block))
            .find(|block| !block.trim().is_empty())
    })
}

fn tagged_blocks(text: &str, tag: &str) -> Vec<String> {
    let open = format!("<{tag}>");
    let close = format!("</{tag}>");
    let mut blocks = Vec::new();
    let mut rest = text;
    while let Some(start) = rest.find(&open) {
        let after = &rest[start + open.len()..];
        let Some(end) = after.find(&close) else {
            break;
        };
        blocks.push(after[..end].to_string());
        rest = &after[end + close.len()..];
    }
    blocks
}

/// Fenced blocks, optionally filtered by a case-insensitive language prefix.
fn fenced_blocks(text: &str, lang: Option<&str>) -> Vec<String> {
    let mut blocks = Vec::new();
    let mut rest = text;
    while let Some(start) = rest.find("```") {
        let after = &rest[start + 3..];
        let (info, body_start) = match after.find('\n') {
            Some(nl) => (&after[..nl], nl + 1),
            None => break,
        };
        let body = &after[body_start..];
        let Some(end) = body.find("```") else {
            break;
        };
        let matches = match lang {
            Some(lang) => info
                .trim()
                .to_ascii_lowercase()
                .starts_with(&lang.to_ascii_lowercase()),
            None => true,
        };
        if matches {
            blocks.push(body[..end].to_string());
        }
        rest = &body[end + 3..];
    }
    blocks
}

/// Drop a fence that wraps the whole block (`<script>```bash ...```</script>`).
fn strip_outer_fence(block: &str) -> String {
    let trimmed = block.trim();
    let lines: Vec<&str> = trimmed.lines().collect();
    if lines.len() >= 2
        && lines[0].trim_start().starts_with("```")
        && lines[lines.len() - 1].trim() == "```"
    {
        return lines[1..lines.len() - 1].join("\n");
    }
    trimmed.to_string()
}

pub fn extract_dockerfile(text: &str) -> Result<String, ForgeError> {
    extract_wrapped(text, DOCKERFILE_WRAPPERS)
        .map(|body| ensure_trailing_newline(body.trim()))
        .ok_or_else(|| ForgeError::extraction("dockerfile"))
}

/// Extract an eval script, appending the exit code marker when it is missing.
pub fn extract_eval_script(text: &str) -> Result<String, ForgeError> {
    let script = extract_wrapped(text, SCRIPT_WRAPPERS)
        .ok_or_else(|| ForgeError::extraction("eval script"))?;
    let mut script = ensure_trailing_newline(script.trim_end());
    if !script.contains(EXIT_CODE_MARKER) {
        script.push_str(&format!("\nrc=$?\necho \"{EXIT_CODE_MARKER}=$rc\"\n"));
    }
    Ok(script)
}

/// Extract a test patch. It must contain a `diff --git` header and is
/// trimmed to start there.
pub fn extract_test_patch(text: &str) -> Result<TestPatch, ForgeError> {
    let body = extract_wrapped(text, TEST_PATCH_WRAPPERS)
        .ok_or_else(|| ForgeError::extraction("test patch"))?;
    let start = body
        .find("diff --git")
        .ok_or_else(|| ForgeError::extraction("test patch"))?;
    let patch = ensure_trailing_newline(body[start..].trim_end());
    let files = patch
        .lines()
        .filter_map(|line| line.strip_prefix("+++ b/"))
        .map(|path| path.trim_end().to_string())
        .collect();
    Ok(TestPatch { text: patch, files })
}

/// Best-effort JSON: a ```json fence, then any fence that parses, then the
/// raw text, then the outermost `{...}` span.
pub fn extract_json(text: &str) -> Result<Value, ForgeError> {
    let candidates = fenced_blocks(text, Some("json"))
        .into_iter()
        .chain(fenced_blocks(text, None))
        .chain(std::iter::once(text.to_string()))
        .chain(outer_object(text));
    for candidate in candidates {
        if let Ok(value @ Value::Object(_)) = serde_json::from_str::<Value>(candidate.trim()) {
            return Ok(value);
        }
    }
    Err(ForgeError::extraction("json object"))
}

fn outer_object(text: &str) -> Option<String> {
    let start = text.find('{')?;
    let end = text.rfind('}')?;
    (start < end).then(|| text[start..=end].to_string())
}

fn ensure_trailing_newline(text: &str) -> String {
    let mut out = text.to_string();
    out.push('\n');
    out
}
