//! Executes context-collector exploration calls against a local checkout.

use std::fs;
use std::path::{Component, Path, PathBuf};

use anyhow::{Result, anyhow};
use tracing::debug;
use walkdir::{DirEntry, WalkDir};

use crate::core::api_call::ApiCall;

const IGNORED_DIRS: &[&str] = &[".git", "node_modules", "target", "__pycache__", ".venv", ".tox"];
const MAX_OUTPUT_BYTES: usize = 20_000;
const MAX_SEARCH_HITS: usize = 200;
const MAX_SEARCH_FILE_BYTES: u64 = 1_000_000;

/// Read-only view of the repository checkout.
#[derive(Debug, Clone)]
pub struct RepoBrowser {
    root: PathBuf,
}

fn is_ignored(entry: &DirEntry) -> bool {
    entry.depth() > 0
        && entry.file_type().is_dir()
        && entry
            .file_name()
            .to_str()
            .is_some_and(|name| IGNORED_DIRS.contains(&name))
}

impl RepoBrowser {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Run one call and return the text fed back to the generator. Errors
    /// describe a bad call and are also meant to be fed back.
    pub fn execute(&self, call: &ApiCall) -> Result<String> {
        debug!(?call, "executing api call");
        let output = match call {
            ApiCall::BrowseFolder { path, depth } => self.browse_folder(path, *depth)?,
            ApiCall::BrowseFile { file_path, query } => self.browse_file(file_path, query)?,
            ApiCall::SearchKeyword { keyword } => self.search(keyword)?,
        };
        Ok(bound(output))
    }

    fn resolve(&self, relative: &str) -> Result<PathBuf> {
        let relative = relative.trim().trim_start_matches("./");
        let rel = Path::new(relative);
        if rel.is_absolute() || rel.components().any(|c| matches!(c, Component::ParentDir)) {
            return Err(anyhow!("path `{relative}` escapes the repository"));
        }
        let full = self.root.join(rel);
        if !full.exists() {
            return Err(anyhow!("path `{relative}` does not exist"));
        }
        Ok(full)
    }

    fn display(&self, path: &Path) -> String {
        path.strip_prefix(&self.root)
            .unwrap_or(path)
            .to_string_lossy()
            .into_owned()
    }

    fn browse_folder(&self, path: &str, depth: usize) -> Result<String> {
        let dir = self.resolve(path)?;
        if !dir.is_dir() {
            return Err(anyhow!("`{path}` is not a directory"));
        }
        let mut lines = Vec::new();
        for entry in WalkDir::new(&dir)
            .min_depth(1)
            .max_depth(depth.max(1))
            .sort_by_file_name()
            .into_iter()
            .filter_entry(|e| !is_ignored(e))
            .filter_map(|e| e.ok())
        {
            let indent = "  ".repeat(entry.depth() - 1);
            let name = entry.file_name().to_string_lossy();
            let suffix = if entry.file_type().is_dir() { "/" } else { "" };
            lines.push(format!("{indent}{name}{suffix}"));
        }
        Ok(format!("Contents of {path} (depth {depth}):\n{}", lines.join("\n")))
    }

    fn browse_file(&self, file_path: &str, query: &str) -> Result<String> {
        let file = self.resolve(file_path)?;
        if !file.is_file() {
            return Err(anyhow!("`{file_path}` is not a file"));
        }
        let bytes = fs::read(&file).map_err(|e| anyhow!("read `{file_path}`: {e}"))?;
        let text = String::from_utf8_lossy(&bytes);
        Ok(format!(
            "File {file_path} (looking for: {query}):\n{}",
            text.trim_end()
        ))
    }

    fn search(&self, keyword: &str) -> Result<String> {
        if keyword.trim().is_empty() {
            return Err(anyhow!("search keyword must not be empty"));
        }
        let mut hits = Vec::new();
        for entry in WalkDir::new(&self.root)
            .sort_by_file_name()
            .into_iter()
            .filter_entry(|e| !is_ignored(e))
            .filter_map(|e| e.ok())
        {
            if hits.len() >= MAX_SEARCH_HITS {
                break;
            }
            if !entry.file_type().is_file() {
                continue;
            }
            let rel = self.display(entry.path());
            if rel.contains(keyword) {
                hits.push(rel);
                continue;
            }
            let too_big = entry
                .metadata()
                .map(|meta| meta.len() > MAX_SEARCH_FILE_BYTES)
                .unwrap_or(true);
            if too_big {
                continue;
            }
            if let Ok(contents) = fs::read_to_string(entry.path())
                && contents.contains(keyword)
            {
                hits.push(rel);
            }
        }
        if hits.is_empty() {
            return Ok(format!("No files match `{keyword}`."));
        }
        Ok(format!("Files matching `{keyword}`:\n{}", hits.join("\n")))
    }
}

fn bound(mut text: String) -> String {
    if text.len() <= MAX_OUTPUT_BYTES {
        return text;
    }
    let mut cut = MAX_OUTPUT_BYTES;
    while !text.is_char_boundary(cut) {
        cut -= 1;
    }
    let dropped = text.len() - cut;
    text.truncate(cut);
    text.push_str(&format!("\n[... {dropped} bytes truncated ...]"));
    text
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fixture() -> tempfile::TempDir {
        let temp = tempfile::tempdir().expect("tempdir");
        let root = temp.path();
        fs::create_dir_all(root.join("src/pkg")).expect("mkdir");
        fs::create_dir_all(root.join(".git")).expect("mkdir");
        fs::write(root.join("setup.py"), "install_requires=['numpy>=1.20']\n").expect("write");
        fs::write(root.join("src/pkg/core.py"), "import numpy\n").expect("write");
        fs::write(root.join(".git/config"), "numpy\n").expect("write");
        temp
    }

    #[test]
    fn browse_folder_respects_depth_and_skips_git() {
        let temp = fixture();
        let browser = RepoBrowser::new(temp.path());
        let out = browser
            .execute(&ApiCall::BrowseFolder { path: ".".to_string(), depth: 1 })
            .expect("browse");
        assert!(out.contains("setup.py"));
        assert!(out.contains("src/"));
        assert!(!out.contains(".git"));
        assert!(!out.contains("pkg"));
    }

    #[test]
    fn search_finds_names_and_contents() {
        let temp = fixture();
        let browser = RepoBrowser::new(temp.path());
        let out = browser
            .execute(&ApiCall::SearchKeyword { keyword: "numpy".to_string() })
            .expect("search");
        assert!(out.contains("setup.py"));
        assert!(out.contains("src/pkg/core.py"));
        assert!(!out.contains(".git/config"));
    }

    #[test]
    fn refuses_paths_outside_the_checkout() {
        let temp = fixture();
        let browser = RepoBrowser::new(temp.path());
        let err = browser
            .execute(&ApiCall::BrowseFile {
                file_path: "../etc/passwd".to_string(),
                query: "users".to_string(),
            })
            .unwrap_err();
        assert!(err.to_string().contains("escapes"));
    }

    #[test]
    fn bound_truncates_on_char_boundary() {
        let text = "é".repeat(MAX_OUTPUT_BYTES);
        let bounded = bound(text);
        assert!(bounded.contains("bytes truncated"));
    }
}
