//! Line-budgeted views over long logs.

use std::sync::LazyLock;

use regex::Regex;

/// Default line budget for logs handed to the analyzer.
pub const MAX_LOG_LINES: usize = 600;

static ANSI_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\x1b\[[0-9;?]*[ -/]*[@-~]").expect("ansi regex"));

pub fn strip_ansi(text: &str) -> String {
    ANSI_RE.replace_all(text, "").into_owned()
}

/// Keep the first and last `max_lines / 2` lines with a
/// `...skipped N lines...` marker between them.
pub fn head_tail_window(lines: &[String], max_lines: usize) -> String {
    if lines.len() <= max_lines {
        return lines.join("\n");
    }
    let half = max_lines / 2;
    let skipped = lines.len() - 2 * half;
    let mut out: Vec<String> = Vec::with_capacity(2 * half + 1);
    out.extend_from_slice(&lines[..half]);
    out.push(format!("...skipped {skipped} lines..."));
    out.extend_from_slice(&lines[lines.len() - half..]);
    out.join("\n")
}

/// Build log view: ANSI stripped and captured from the first build step.
pub fn window_build_log(raw_lines: &[String], max_lines: usize) -> String {
    let cleaned: Vec<String> = raw_lines
        .iter()
        .map(|line| strip_ansi(line).trim_end().to_string())
        .filter(|line| !line.is_empty())
        .collect();
    let start = cleaned
        .iter()
        .position(|line| line.starts_with("Step ") || line.starts_with("#1 "))
        .unwrap_or(0);
    head_tail_window(&cleaned[start..], max_lines)
}

/// Test log view: 1-based line numbers, windowed with an
/// `[..., N lines omitted ...]` marker.
pub fn number_and_window(text: &str, max_lines: usize) -> String {
    let lines: Vec<&str> = text.lines().collect();
    let numbered = |idx: usize| format!("{:>6}  {}", idx + 1, lines[idx]);
    if lines.len() <= max_lines {
        return (0..lines.len()).map(numbered).collect::<Vec<_>>().join("\n");
    }
    let half = max_lines / 2;
    let omitted = lines.len() - 2 * half;
    let mut out: Vec<String> = (0..half).map(numbered).collect();
    out.push(format!("[..., {omitted} lines omitted ...]"));
    out.extend((lines.len() - half..lines.len()).map(numbered));
    out.join("\n")
}
