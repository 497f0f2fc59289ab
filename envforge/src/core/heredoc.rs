//! Eval script skeletons and test patch embedding.
//!
//! Eval scripts apply the test patch through a quoted heredoc with a fixed
//! delimiter. The generator only ever sees the placeholder; the real patch
//! is spliced in afterwards.

use std::collections::BTreeSet;

use crate::core::diff::repair_patch;

pub const HEREDOC_DELIMITER: &str = "EOF_114329324912";
pub const PATCH_PLACEHOLDER: &str = "[CONTENT OF TEST PATCH]";

/// Heredoc block that applies the test patch, with the patch left as a placeholder.
pub fn apply_test_patch_block() -> String {
    format!("git apply -v - <<'{HEREDOC_DELIMITER}'\n{PATCH_PLACEHOLDER}\n{HEREDOC_DELIMITER}")
}

/// Inputs for the initial eval script skeleton.
#[derive(Debug, Clone, Default)]
pub struct SkeletonInputs<'a> {
    pub base_commit: &'a str,
    /// Every path referenced by the merged test patch.
    pub test_files: &'a [String],
    /// Paths the test writer created; removed again after the run.
    pub generated_files: &'a [String],
    pub has_test_patch: bool,
}

/// Build the starting eval script the eval-script writer refines.
///
/// Pre-existing test files are checked out at the base commit before and
/// after the patch is applied; generated ones get their directories created
/// first and are deleted at the end.
pub fn build_eval_skeleton(inputs: &SkeletonInputs<'_>) -> String {
    let generated: BTreeSet<&str> = inputs.generated_files.iter().map(String::as_str).collect();
    let (generated_files, existing_files): (Vec<&str>, Vec<&str>) = inputs
        .test_files
        .iter()
        .map(String::as_str)
        .partition(|path| generated.contains(path));
    let generated_dirs: BTreeSet<&str> = generated_files
        .iter()
        .filter_map(|path| path.rsplit_once('/').map(|(dir, _)| dir))
        .filter(|dir| !dir.is_empty())
        .collect();

    let mut lines = vec![
        "#!/bin/bash".to_string(),
        "set -uxo pipefail".to_string(),
        "cd /testbed".to_string(),
    ];
    let checkout = (!existing_files.is_empty())
        .then(|| format!("git checkout {} {}", inputs.base_commit, quote_all(&existing_files)));
    if let Some(checkout) = &checkout {
        lines.push(checkout.clone());
    }
    if !generated_dirs.is_empty() {
        let dirs: Vec<&str> = generated_dirs.into_iter().collect();
        lines.push(format!("mkdir -p {}", quote_all(&dirs)));
    }
    if inputs.has_test_patch {
        lines.push(apply_test_patch_block());
    }
    if let Some(checkout) = checkout {
        lines.push(checkout);
    }
    if !generated_files.is_empty() {
        lines.push(format!("rm -f {}", quote_all(&generated_files)));
    }
    let mut script = lines.join("\n");
    script.push('\n');
    script
}

fn quote_all(paths: &[&str]) -> String {
    paths
        .iter()
        .map(|path| format!("\"{path}\""))
        .collect::<Vec<_>>()
        .join(" ")
}

/// Whether a script contains a test patch heredoc, and every such heredoc is
/// closed by a delimiter line.
pub fn has_patch_heredoc(script: &str) -> bool {
    let mut opened = 0usize;
    let mut in_heredoc = false;
    for line in script.lines() {
        if in_heredoc {
            in_heredoc = line.trim() != HEREDOC_DELIMITER;
        } else if is_heredoc_opener(line) {
            opened += 1;
            in_heredoc = true;
        }
    }
    opened > 0 && !in_heredoc
}

fn is_heredoc_opener(line: &str) -> bool {
    line.contains(&format!("<<'{HEREDOC_DELIMITER}'"))
        || line.contains(&format!("<<\"{HEREDOC_DELIMITER}\""))
        || line.contains(&format!("<< '{HEREDOC_DELIMITER}'"))
}

/// Replace every test patch heredoc body with the repaired `patch` and force
/// `--no-index` onto the `git apply` that reads it.
///
/// Returns `None` when the script has no such heredoc or one is never closed.
pub fn inject_patch_into_heredoc(script: &str, patch: &str) -> Option<String> {
    if !has_patch_heredoc(script) {
        return None;
    }
    let repaired = repair_patch(patch);
    let mut out: Vec<String> = Vec::new();
    let mut in_heredoc = false;
    for line in script.lines() {
        if in_heredoc {
            if line.trim() == HEREDOC_DELIMITER {
                out.push(line.to_string());
                in_heredoc = false;
            }
            continue;
        }
        if is_heredoc_opener(line) {
            out.push(force_no_index(line));
            out.extend(repaired.lines().map(str::to_string));
            in_heredoc = true;
            continue;
        }
        out.push(line.to_string());
    }
    let mut joined = out.join("\n");
    joined.push('\n');
    Some(joined)
}

fn force_no_index(line: &str) -> String {
    if line.contains("git apply") && !line.contains("--no-index") {
        line.replacen("git apply", "git apply --no-index", 1)
    } else {
        line.to_string()
    }
}

/// Insert out-of-band commands right before the first test patch heredoc,
/// or append them when there is none.
pub fn insert_before_heredoc(script: &str, commands: &[String]) -> String {
    if commands.is_empty() {
        return script.to_string();
    }
    let mut out: Vec<String> = Vec::new();
    let mut inserted = false;
    for line in script.lines() {
        if !inserted && is_heredoc_opener(line) {
            out.extend(commands.iter().cloned());
            inserted = true;
        }
        out.push(line.to_string());
    }
    if !inserted {
        out.extend(commands.iter().cloned());
    }
    let mut joined = out.join("\n");
    joined.push('\n');
    joined
}
