//! Local checkout of the task repository for context collection.
//!
//! The container builds its own checkout; this one only feeds the context
//! collector's exploration calls.

use std::path::{Path, PathBuf};
use std::process::{Command, Output};

use anyhow::{Context, Result, anyhow};
use tracing::{debug, info, instrument};

/// Wrapper for executing git commands in a working directory.
#[derive(Debug, Clone)]
pub struct Git {
    workdir: PathBuf,
}

impl Git {
    pub fn new(workdir: impl Into<PathBuf>) -> Self {
        Self {
            workdir: workdir.into(),
        }
    }

    pub fn workdir(&self) -> &Path {
        &self.workdir
    }

    pub fn is_repo(&self) -> bool {
        self.workdir.join(".git").exists()
    }

    /// Clone `url` into the working directory.
    #[instrument(skip_all, fields(url = %url))]
    pub fn clone_from(&self, url: &str) -> Result<()> {
        let parent = self
            .workdir
            .parent()
            .ok_or_else(|| anyhow!("checkout path missing parent {}", self.workdir.display()))?;
        std::fs::create_dir_all(parent)
            .with_context(|| format!("create directory {}", parent.display()))?;
        info!(dest = %self.workdir.display(), "cloning repository");
        let output = Command::new("git")
            .args(["clone", "--quiet", url])
            .arg(&self.workdir)
            .output()
            .with_context(|| format!("spawn git clone {url}"))?;
        check(&["clone", url], output)?;
        Ok(())
    }

    /// Detach HEAD at `commit` and drop local modifications and untracked files.
    #[instrument(skip_all, fields(commit = %commit))]
    pub fn checkout_clean(&self, commit: &str) -> Result<()> {
        debug!(commit, "checking out base commit");
        self.run_checked(&["checkout", "--quiet", "--force", "--detach", commit])?;
        self.run_checked(&["reset", "--hard", "--quiet", commit])?;
        self.run_checked(&["clean", "-fdxq"])?;
        Ok(())
    }

    pub fn head_sha(&self) -> Result<String> {
        let out = self.run_checked(&["rev-parse", "HEAD"])?;
        Ok(String::from_utf8_lossy(&out.stdout).trim().to_string())
    }

    fn run_checked(&self, args: &[&str]) -> Result<Output> {
        let output = Command::new("git")
            .args(args)
            .current_dir(&self.workdir)
            .output()
            .with_context(|| format!("spawn git {}", args.join(" ")))?;
        check(args, output)
    }
}

fn check(args: &[&str], output: Output) -> Result<Output> {
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(anyhow!("git {} failed: {}", args.join(" "), stderr.trim()));
    }
    Ok(output)
}

/// Ensure a checkout of `repo` (`owner/name`) at `commit` exists at `dest`,
/// cloning from GitHub when it is missing.
pub fn prepare_checkout(repo: &str, commit: &str, dest: &Path) -> Result<Git> {
    let git = Git::new(dest);
    if !git.is_repo() {
        git.clone_from(&format!("https://github.com/{repo}.git"))?;
    }
    git.checkout_clean(commit)
        .with_context(|| format!("checkout {commit} in {}", dest.display()))?;
    Ok(git)
}
