//! Binary test resources the test patch cannot carry.
//!
//! A text patch cannot recreate binary files, so the eval script fetches them
//! from the pull request head instead. Files missing upstream are deleted.

use std::time::Duration;

use anyhow::{Context, Result};
use tracing::{debug, info, instrument};

use crate::core::diff::split_chunks;

const RAW_BASE: &str = "https://raw.githubusercontent.com";
const PROBE_TIMEOUT: Duration = Duration::from_secs(30);

/// Checks whether a file exists on the remote at a git ref.
pub trait ResourceProbe {
    fn exists(&self, repo: &str, git_ref: &str, path: &str) -> Result<bool>;
}

/// Probe against `raw.githubusercontent.com`.
pub struct GithubProbe {
    client: reqwest::blocking::Client,
    token: Option<String>,
}

impl GithubProbe {
    pub fn new(token: Option<String>) -> Result<Self> {
        let client = reqwest::blocking::Client::builder()
            .timeout(PROBE_TIMEOUT)
            .user_agent(concat!("envforge/", env!("CARGO_PKG_VERSION")))
            .build()
            .context("Failed to create HTTP client")?;
        Ok(Self { client, token })
    }
}

impl ResourceProbe for GithubProbe {
    fn exists(&self, repo: &str, git_ref: &str, path: &str) -> Result<bool> {
        let url = raw_url(repo, git_ref, path);
        let mut request = self.client.head(&url);
        if let Some(token) = &self.token {
            request = request.bearer_auth(token);
        }
        let response = request.send().with_context(|| format!("HEAD {url}"))?;
        debug!(%url, status = %response.status(), "probed resource");
        Ok(response.status().is_success())
    }
}

pub fn pull_ref(pull_number: u64) -> String {
    format!("refs/pull/{pull_number}/head")
}

pub fn raw_url(repo: &str, git_ref: &str, path: &str) -> String {
    format!("{RAW_BASE}/{repo}/{git_ref}/{path}")
}

/// Shell commands that materialize each binary chunk of `test_patch`, and
/// the patch with those chunks removed.
#[instrument(skip_all, fields(repo = %repo, pull_number = pull_number))]
pub fn resolve_binary_resource_commands(
    test_patch: &str,
    repo: &str,
    pull_number: u64,
    probe: &dyn ResourceProbe,
) -> Result<(Vec<String>, String)> {
    let git_ref = pull_ref(pull_number);
    let mut commands = Vec::new();
    let mut text_only = String::new();
    for chunk in split_chunks(test_patch) {
        if !chunk.binary {
            text_only.push_str(&chunk.text);
            continue;
        }
        if chunk.path.is_empty() {
            continue;
        }
        let path = chunk.path.as_str();
        if probe.exists(repo, &git_ref, path)? {
            if let Some((dir, _)) = path.rsplit_once('/')
                && !dir.is_empty()
            {
                commands.push(format!("mkdir -p \"{dir}\""));
            }
            commands.push(format!(
                "curl -fsSL -o \"{path}\" \"{}\"",
                raw_url(repo, &git_ref, path)
            ));
            commands.push(format!("chmod 644 \"{path}\""));
        } else {
            commands.push(format!("rm -f \"{path}\""));
        }
    }
    info!(commands = commands.len(), "resolved binary resources");
    Ok((commands, text_only))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;

    struct StaticProbe(BTreeSet<&'static str>);

    impl ResourceProbe for StaticProbe {
        fn exists(&self, _repo: &str, git_ref: &str, path: &str) -> Result<bool> {
            assert_eq!(git_ref, "refs/pull/42/head");
            Ok(self.0.contains(path))
        }
    }

    const PATCH: &str = "\
diff --git a/tests/test_io.py b/tests/test_io.py
--- a/tests/test_io.py
+++ b/tests/test_io.py
@@ -1 +1 @@
-old
+new
diff --git a/tests/data/img.png b/tests/data/img.png
new file mode 100644
Binary files /dev/null and b/tests/data/img.png differ
diff --git a/tests/data/gone.bin b/tests/data/gone.bin
GIT binary patch
literal 0
";

    #[test]
    fn downloads_present_and_removes_missing_binaries() {
        let probe = StaticProbe(BTreeSet::from(["tests/data/img.png"]));
        let (commands, text) =
            resolve_binary_resource_commands(PATCH, "acme/widget", 42, &probe).expect("resolve");
        assert_eq!(
            commands,
            vec![
                "mkdir -p \"tests/data\"".to_string(),
                "curl -fsSL -o \"tests/data/img.png\" \"https://raw.githubusercontent.com/acme/widget/refs/pull/42/head/tests/data/img.png\"".to_string(),
                "chmod 644 \"tests/data/img.png\"".to_string(),
                "rm -f \"tests/data/gone.bin\"".to_string(),
            ]
        );
        assert!(text.contains("tests/test_io.py"));
        assert!(!text.contains("Binary files"));
        assert!(!text.contains("GIT binary patch"));
    }

    #[test]
    fn text_only_patch_is_unchanged() {
        let probe = StaticProbe(BTreeSet::new());
        let patch = PATCH.split("diff --git a/tests/data/img.png").next().expect("prefix");
        let (commands, text) =
            resolve_binary_resource_commands(patch, "acme/widget", 42, &probe).expect("resolve");
        assert!(commands.is_empty());
        assert_eq!(text, patch);
    }
}
