//! Unified diff inspection and repair.
//!
//! Generated patches routinely carry wrong hunk counts and new-file headers
//! that `git apply` refuses. Everything here is a pure text transform.

use std::sync::LazyLock;

use regex::Regex;

static HUNK_HEADER_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^@@ -(\d+)(?:,\d+)? \+(\d+)(?:,\d+)? @@(.*)$").expect("hunk header regex")
});

/// Fewer referenced test files than this triggers test generation.
pub const MIN_TEST_FILES: usize = 3;

/// Paths a patch touches, in patch order: `--- a/<path>` for modified or
/// deleted files, `+++ b/<path>` following `--- /dev/null` for created ones.
pub fn test_file_paths(patch: &str) -> Vec<String> {
    let lines: Vec<&str> = patch.lines().collect();
    let mut paths = Vec::new();
    for (idx, line) in lines.iter().enumerate() {
        if let Some(path) = line.strip_prefix("--- a/") {
            paths.push(clean_path(path));
        } else if line.trim_end() == "--- /dev/null"
            && let Some(path) = lines.get(idx + 1).and_then(|next| next.strip_prefix("+++ b/"))
        {
            paths.push(clean_path(path));
        }
    }
    paths
}

/// Paths the patch creates (old side is `/dev/null`).
pub fn created_file_paths(patch: &str) -> Vec<String> {
    let lines: Vec<&str> = patch.lines().collect();
    lines
        .iter()
        .enumerate()
        .filter(|(_, line)| line.trim_end() == "--- /dev/null")
        .filter_map(|(idx, _)| lines.get(idx + 1)?.strip_prefix("+++ b/"))
        .map(clean_path)
        .collect()
}

/// Whether the run must generate its own tests.
pub fn needs_test_generation(test_patch: &str) -> bool {
    test_patch.trim().is_empty() || test_file_paths(test_patch).len() < MIN_TEST_FILES
}

fn clean_path(raw: &str) -> String {
    // `git diff` may append a tab and timestamp after the path.
    raw.split('\t').next().unwrap_or(raw).trim_end().to_string()
}

/// Rewrite `diff --git a/dev/null b/<path>` into the absolute `a//dev/null`
/// form and make sure the chunk carries a `new file mode` marker.
pub fn normalize_new_file_header(patch: &str) -> String {
    let lines: Vec<&str> = patch.lines().collect();
    let mut out = Vec::with_capacity(lines.len() + 1);
    for (idx, line) in lines.iter().enumerate() {
        let new_side = line
            .strip_prefix("diff --git a/dev/null ")
            .or_else(|| line.strip_prefix("diff --git a//dev/null "));
        if let Some(new_side) = new_side {
            out.push(format!("diff --git a//dev/null {new_side}"));
            if !header_has_new_file_mode(&lines[idx + 1..]) {
                out.push("new file mode 100644".to_string());
            }
        } else if line.trim_end() == "--- a/dev/null" {
            out.push("--- /dev/null".to_string());
        } else {
            out.push((*line).to_string());
        }
    }
    join_like(patch, &out)
}

fn header_has_new_file_mode(rest: &[&str]) -> bool {
    rest.iter()
        .take_while(|line| !line.starts_with("@@") && !line.starts_with("diff "))
        .any(|line| line.starts_with("new file mode"))
}

/// Recount every hunk header from its body. Start lines and section headings
/// are kept; trailing blank lines before the next header are not counted.
pub fn recompute_hunk_counts(patch: &str) -> String {
    let lines: Vec<&str> = patch.lines().collect();
    let mut out = Vec::with_capacity(lines.len());
    let mut idx = 0;
    while idx < lines.len() {
        let Some(caps) = HUNK_HEADER_RE.captures(lines[idx]) else {
            out.push(lines[idx].to_string());
            idx += 1;
            continue;
        };
        let body_start = idx + 1;
        let mut end = body_start;
        while end < lines.len() && is_hunk_body(&lines, end) {
            end += 1;
        }
        let mut counted_end = end;
        while counted_end > body_start && lines[counted_end - 1].is_empty() {
            counted_end -= 1;
        }
        let (old, new) = count_hunk_body(&lines[body_start..counted_end]);
        out.push(format!(
            "@@ -{},{old} +{},{new} @@{}",
            &caps[1], &caps[2], &caps[3]
        ));
        out.extend(lines[body_start..end].iter().map(|line| (*line).to_string()));
        idx = end;
    }
    join_like(patch, &out)
}

fn is_hunk_body(lines: &[&str], idx: usize) -> bool {
    let line = lines[idx];
    if line.starts_with("diff ") || HUNK_HEADER_RE.is_match(line) {
        return false;
    }
    if line.starts_with("--- ") && lines.get(idx + 1).is_some_and(|next| next.starts_with("+++ ")) {
        return false;
    }
    matches!(line.chars().next(), None | Some(' ' | '+' | '-' | '\\'))
}

fn count_hunk_body(body: &[&str]) -> (usize, usize) {
    let mut old = 0;
    let mut new = 0;
    for line in body {
        match line.chars().next() {
            Some('+') => new += 1,
            Some('-') => old += 1,
            Some('\\') => {}
            _ => {
                old += 1;
                new += 1;
            }
        }
    }
    (old, new)
}

/// Full repair applied before a patch is embedded in an eval script.
pub fn repair_patch(patch: &str) -> String {
    recompute_hunk_counts(&normalize_new_file_header(patch))
}

/// One `diff --git` section of a patch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiffChunk {
    /// New-side path from the `diff --git` header.
    pub path: String,
    pub text: String,
    pub binary: bool,
}

/// Split a patch into per-file chunks. Text before the first header is dropped.
pub fn split_chunks(patch: &str) -> Vec<DiffChunk> {
    let mut chunks: Vec<DiffChunk> = Vec::new();
    for line in patch.split_inclusive('\n') {
        if line.starts_with("diff --git ") {
            chunks.push(DiffChunk {
                path: header_new_path(line.trim_end()),
                text: String::new(),
                binary: false,
            });
        }
        let Some(chunk) = chunks.last_mut() else {
            continue;
        };
        let trimmed = line.trim_end();
        if trimmed == "GIT binary patch"
            || (trimmed.starts_with("Binary files ") && trimmed.ends_with(" differ"))
        {
            chunk.binary = true;
        }
        chunk.text.push_str(line);
    }
    chunks
}

fn header_new_path(header: &str) -> String {
    header
        .rsplit_once(" b/")
        .map(|(_, path)| path.to_string())
        .unwrap_or_default()
}

/// Shrink a patch for prompting: per-file headers, hunk headers and up to
/// `lines_per_hunk` changed lines per hunk. Small chunks are kept whole.
pub fn summarize_large_patch(patch: &str, max_chars: usize, lines_per_hunk: usize) -> String {
    if patch.len() <= max_chars {
        return patch.to_string();
    }
    let mut out = String::new();
    for chunk in split_chunks(patch) {
        if chunk.text.len() <= 2000 {
            out.push_str(&chunk.text);
        } else {
            out.push_str(&summarize_chunk(&chunk.text, lines_per_hunk));
        }
        if out.len() > max_chars {
            break;
        }
    }
    out
}

fn summarize_chunk(chunk: &str, lines_per_hunk: usize) -> String {
    let mut out = String::new();
    let mut in_hunk = false;
    let mut kept = 0usize;
    for line in chunk.split_inclusive('\n') {
        if line.starts_with("diff --git") || line.starts_with("---") || line.starts_with("+++") {
            out.push_str(line);
            in_hunk = false;
        } else if line.starts_with("@@") {
            out.push_str(line);
            in_hunk = true;
            kept = 0;
        } else if in_hunk && (line.starts_with('+') || line.starts_with('-')) {
            if kept < lines_per_hunk {
                out.push_str(line);
            } else if kept == lines_per_hunk {
                out.push_str("... (truncated)\n");
            }
            kept += 1;
        }
    }
    out
}

fn join_like(original: &str, lines: &[String]) -> String {
    let mut joined = lines.join("\n");
    if original.ends_with('\n') {
        joined.push('\n');
    }
    joined
}
