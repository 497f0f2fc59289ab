//! Containerized dual-run evaluation.
//!
//! [`EvaluationHarness::build_image`] builds (or reuses) the task image;
//! [`EvaluationHarness::run_f2p`] runs the eval script once on the pristine
//! checkout and once with the reference patch applied, then classifies the
//! pair of exit codes.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use rand::Rng;
use rand::distributions::Alphanumeric;
use sha2::{Digest, Sha256};
use tracing::{debug, info, instrument, warn};

use crate::core::classifier::{classify, extract_exit_code};
use crate::core::dockerfile::{TOKEN_ARG, prepare_for_build, references_github_clone};
use crate::core::log_window::window_build_log;
use crate::core::types::TestRunRecord;
use crate::error::ForgeError;
use crate::io::container::{BuildEvent, BuildRequest, ContainerRuntime, ExecOutput};

pub const TESTBED: &str = "/testbed";
pub const PRE_PATCH_LOG: &str = "test_output_prev_apply.txt";
pub const POST_PATCH_LOG: &str = "test_output.txt";
pub const BUILD_LOG: &str = "build_image.log";
const CONTAINER_SCRIPT: &str = "/eval.sh";
const CONTAINER_PATCH: &str = "/tmp/patch.diff";

/// Image built from a specific Dockerfile text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildCacheEntry {
    pub dockerfile_hash: String,
    pub dockerfile: String,
    pub image: String,
}

/// The task's single active image.
#[derive(Debug, Default)]
pub struct BuildCache {
    active: Option<BuildCacheEntry>,
}

impl BuildCache {
    pub fn active(&self) -> Option<&BuildCacheEntry> {
        self.active.as_ref()
    }

    pub fn is_active(&self, image: &str) -> bool {
        self.active.as_ref().is_some_and(|entry| entry.image == image)
    }

    fn lookup(&self, dockerfile: &str) -> Option<&BuildCacheEntry> {
        self.active
            .as_ref()
            .filter(|entry| entry.dockerfile == dockerfile)
    }

    /// Install `entry`, returning the entry it replaced.
    fn install(&mut self, entry: BuildCacheEntry) -> Option<BuildCacheEntry> {
        self.active.replace(entry)
    }
}

#[derive(Debug, Clone)]
pub struct HarnessSettings {
    pub eval_timeout: Duration,
    pub build_timeout: Duration,
    pub log_max_lines: usize,
    /// Credential for private clones; only ever passed as a build argument.
    pub github_token: Option<String>,
}

pub struct EvaluationHarness<'a> {
    runtime: &'a dyn ContainerRuntime,
    task_id: String,
    settings: HarnessSettings,
    cache: BuildCache,
    builds: u32,
}

/// Removes the container on every exit path, and the image too unless it is
/// the active cached one at the moment of removal.
struct ContainerGuard<'a> {
    runtime: &'a dyn ContainerRuntime,
    cache: &'a BuildCache,
    container: String,
    image: String,
}

impl Drop for ContainerGuard<'_> {
    fn drop(&mut self) {
        if let Err(err) = self.runtime.remove_container(&self.container) {
            warn!(container = %self.container, err = %err, "failed to remove container");
        }
        if self.cache.is_active(&self.image) {
            debug!(image = %self.image, "keeping cached image");
            return;
        }
        if let Err(err) = self.runtime.remove_image(&self.image) {
            warn!(image = %self.image, err = %err, "failed to remove image");
        }
    }
}

/// Short stable fingerprint of a Dockerfile text.
pub fn content_hash(text: &str) -> String {
    let digest = Sha256::digest(text.as_bytes());
    hex::encode(&digest[..8])
}

impl<'a> EvaluationHarness<'a> {
    pub fn new(runtime: &'a dyn ContainerRuntime, task_id: &str, settings: HarnessSettings) -> Self {
        Self {
            runtime,
            task_id: task_id.to_ascii_lowercase(),
            settings,
            cache: BuildCache::default(),
            builds: 0,
        }
    }

    pub fn cache(&self) -> &BuildCache {
        &self.cache
    }

    /// Build an image for `dockerfile`, reusing the cached image when the
    /// text is unchanged. Returns the image reference.
    #[instrument(skip_all, fields(task_id = %self.task_id))]
    pub fn build_image(&mut self, dockerfile: &str, attempt_dir: &Path) -> Result<String> {
        if let Some(entry) = self.cache.lookup(dockerfile) {
            info!(image = %entry.image, "dockerfile unchanged, reusing image");
            return Ok(entry.image.clone());
        }

        let with_credentials =
            self.settings.github_token.is_some() && references_github_clone(dockerfile);
        let context_dir = attempt_dir.join("build_context");
        fs::create_dir_all(&context_dir)
            .with_context(|| format!("create build context {}", context_dir.display()))?;
        let context_dockerfile = context_dir.join("Dockerfile");
        fs::write(&context_dockerfile, prepare_for_build(dockerfile, with_credentials))
            .with_context(|| format!("write {}", context_dockerfile.display()))?;

        let number = self.builds + 1;
        let image = format!("{}-dockerfile{number}:latest", self.task_id);
        let build_args = match (&self.settings.github_token, with_credentials) {
            (Some(token), true) => vec![(TOKEN_ARG.to_string(), token.clone())],
            _ => Vec::new(),
        };
        let request = BuildRequest {
            context_dir,
            tag: image.clone(),
            build_args,
            log_path: attempt_dir.join(BUILD_LOG),
            timeout: self.settings.build_timeout,
        };
        let events = self.runtime.build_image(&request)?;

        let mut lines = Vec::with_capacity(events.len());
        let mut failure = None;
        for event in events {
            match event {
                BuildEvent::Log(line) => lines.push(line),
                BuildEvent::Error(message) => {
                    lines.push(format!("ERROR: {message}"));
                    failure = Some(message);
                }
            }
        }
        if let Some(message) = failure {
            warn!(image = %image, error = %message, "build failed");
            // Docker may leave the tag behind; the next build reuses the number.
            if let Err(err) = self.runtime.remove_image(&image) {
                debug!(image = %image, err = %err, "no partial image to remove");
            }
            return Err(ForgeError::Build {
                log: window_build_log(&lines, self.settings.log_max_lines),
            }
            .into());
        }

        self.builds = number;
        info!(image = %image, "image built");
        let superseded = self.cache.install(BuildCacheEntry {
            dockerfile_hash: content_hash(dockerfile),
            dockerfile: dockerfile.to_string(),
            image: image.clone(),
        });
        if let Some(old) = superseded {
            self.remove_image_if_inactive(&old.image);
        }
        Ok(image)
    }

    fn remove_image_if_inactive(&self, image: &str) {
        if self.cache.is_active(image) {
            return;
        }
        if let Err(err) = self.runtime.remove_image(image) {
            warn!(image, err = %err, "failed to remove superseded image");
        }
    }

    /// Run the eval script before and after the reference patch.
    ///
    /// The pre-patch run is best-effort. A patch that neither `git apply` nor
    /// `patch` accepts is an [`ForgeError::Evaluation`]; a post-patch run over
    /// budget is an [`ForgeError::Timeout`].
    #[instrument(skip_all, fields(task_id = %self.task_id, image = %image))]
    pub fn run_f2p(
        &self,
        image: &str,
        eval_script: &str,
        code_patch: &str,
        base_commit: &str,
        attempt_dir: &Path,
    ) -> Result<TestRunRecord> {
        fs::create_dir_all(attempt_dir)
            .with_context(|| format!("create {}", attempt_dir.display()))?;
        let script_path = attempt_dir.join("eval.sh");
        fs::write(&script_path, eval_script)
            .with_context(|| format!("write {}", script_path.display()))?;
        let patch_path = attempt_dir.join("patch.diff");
        fs::write(&patch_path, code_patch)
            .with_context(|| format!("write {}", patch_path.display()))?;

        let name = format!("{}-test-{}", self.task_id, random_suffix());
        let container = self.runtime.create_container(image, &name)?;
        let _guard = ContainerGuard {
            runtime: self.runtime,
            cache: &self.cache,
            container: container.clone(),
            image: image.to_string(),
        };
        self.runtime.start_container(&container)?;
        info!(container = %container, "container started");

        let pre_log = attempt_dir.join(PRE_PATCH_LOG);
        let pre_exit_code = match self.run_eval(&container, &script_path, &pre_log) {
            Ok(output) => extract_exit_code(&output.output),
            Err(err) => {
                warn!(err = %err, "pre-patch run failed, continuing");
                None
            }
        };

        let reset = format!("git reset --hard {base_commit} && git clean -fdx");
        let output = self.exec(&container, &reset, Duration::from_secs(300))?;
        if !output.success() {
            return Err(ForgeError::evaluation(format!(
                "reset to {base_commit} failed: {}",
                tail(&output.output, 20)
            ))
            .into());
        }

        self.apply_patch(&container, &patch_path)?;
        let diff_after_apply = self.git_diff(&container)?;

        let post_log = attempt_dir.join(POST_PATCH_LOG);
        let output = self.run_eval(&container, &script_path, &post_log)?;
        if output.timed_out {
            return Err(ForgeError::timeout("post-patch eval script", self.settings.eval_timeout).into());
        }
        let post_exit_code = extract_exit_code(&output.output);

        let diff_after_eval = self.git_diff(&container)?;
        let source_mutated = diff_after_apply != diff_after_eval;
        if source_mutated {
            warn!("eval script modified the working tree");
        }

        let classification = classify(pre_exit_code, post_exit_code);
        info!(?pre_exit_code, ?post_exit_code, %classification, "f2p run classified");
        Ok(TestRunRecord {
            pre_exit_code,
            post_exit_code,
            classification,
            pre_log: Some(pre_log),
            post_log: Some(post_log),
            source_mutated,
        })
    }

    fn exec(&self, container: &str, command: &str, timeout: Duration) -> Result<ExecOutput> {
        self.runtime.exec(container, command, TESTBED, timeout)
    }

    /// Copy the script in (earlier runs may have removed it) and run it,
    /// saving its output to `log_path`.
    fn run_eval(&self, container: &str, script: &Path, log_path: &Path) -> Result<ExecOutput> {
        self.runtime.copy_into(container, script, CONTAINER_SCRIPT)?;
        let output = self.exec(
            container,
            &format!("/bin/bash {CONTAINER_SCRIPT}"),
            self.settings.eval_timeout,
        )?;
        let mut log = output.output.clone();
        if output.timed_out {
            log.push_str(&format!(
                "\n[eval script timed out after {}s]\n",
                self.settings.eval_timeout.as_secs()
            ));
        }
        fs::write(log_path, log).with_context(|| format!("write {}", log_path.display()))?;
        Ok(output)
    }

    fn apply_patch(&self, container: &str, patch_path: &Path) -> Result<()> {
        self.runtime.copy_into(container, patch_path, CONTAINER_PATCH)?;
        let timeout = Duration::from_secs(300);
        let primary = self.exec(container, &format!("git apply -p1 -v {CONTAINER_PATCH}"), timeout)?;
        if primary.success() {
            return Ok(());
        }
        warn!("git apply failed, retrying with fuzzy patch");
        let fuzzy = self.exec(
            container,
            &format!("patch --batch --fuzz=5 -p1 -i {CONTAINER_PATCH}"),
            timeout,
        )?;
        if fuzzy.success() {
            return Ok(());
        }
        Err(ForgeError::evaluation(format!(
            "reference patch did not apply.\ngit apply:\n{}\npatch:\n{}",
            tail(&primary.output, 30),
            tail(&fuzzy.output, 30)
        ))
        .into())
    }

    fn git_diff(&self, container: &str) -> Result<String> {
        let output = self.exec(container, "git diff", Duration::from_secs(120))?;
        Ok(output.output)
    }
}

fn random_suffix() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(6)
        .map(char::from)
        .collect::<String>()
        .to_ascii_lowercase()
}

fn tail(text: &str, lines: usize) -> String {
    let all: Vec<&str> = text.lines().collect();
    all[all.len().saturating_sub(lines)..].join("\n")
}

/// Paths a harness run writes under an attempt directory.
pub fn run_logs(attempt_dir: &Path) -> (PathBuf, PathBuf) {
    (attempt_dir.join(PRE_PATCH_LOG), attempt_dir.join(POST_PATCH_LOG))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::F2pClass;
    use crate::test_support::{FakeRuntime, RuntimeCall};

    fn settings() -> HarnessSettings {
        HarnessSettings {
            eval_timeout: Duration::from_secs(60),
            build_timeout: Duration::from_secs(60),
            log_max_lines: 600,
            github_token: None,
        }
    }

    #[test]
    fn unchanged_dockerfile_reuses_cached_image() {
        let temp = tempfile::tempdir().expect("tempdir");
        let runtime = FakeRuntime::default();
        let mut harness = EvaluationHarness::new(&runtime, "Acme__Widget-1", settings());

        let first = harness.build_image("FROM alpine\n", temp.path()).expect("build");
        let second = harness.build_image("FROM alpine\n", temp.path()).expect("reuse");
        assert_eq!(first, "acme__widget-1-dockerfile1:latest");
        assert_eq!(first, second);
        assert_eq!(runtime.builds().len(), 1);

        let context = fs::read_to_string(temp.path().join("build_context/Dockerfile")).expect("read");
        assert!(context.contains("apt-get install -y --no-install-recommends curl git"));
    }

    #[test]
    fn rebuild_removes_superseded_image() {
        let temp = tempfile::tempdir().expect("tempdir");
        let runtime = FakeRuntime::default();
        let mut harness = EvaluationHarness::new(&runtime, "t", settings());
        harness.build_image("FROM alpine\n", temp.path()).expect("first");
        let second = harness.build_image("FROM debian\n", temp.path()).expect("second");
        assert_eq!(second, "t-dockerfile2:latest");
        assert!(harness.cache().is_active(&second));
        assert!(runtime.calls().contains(&RuntimeCall::RemoveImage("t-dockerfile1:latest".to_string())));
    }

    #[test]
    fn build_failure_keeps_previous_cache_and_windows_log() {
        let temp = tempfile::tempdir().expect("tempdir");
        let runtime = FakeRuntime::default();
        let mut harness = EvaluationHarness::new(&runtime, "t", settings());
        harness.build_image("FROM alpine\n", temp.path()).expect("first");
        runtime.fail_next_build((0..1000).map(|n| format!("Step {n}")).collect(), "no such package");

        let err = harness.build_image("FROM broken\n", temp.path()).unwrap_err();
        let Some(ForgeError::Build { log }) = err.downcast_ref::<ForgeError>() else {
            panic!("expected build failure, got {err:#}");
        };
        assert!(log.contains("...skipped"));
        assert!(log.contains("ERROR: no such package"));
        assert!(harness.cache().is_active("t-dockerfile1:latest"));
    }

    #[test]
    fn failed_build_removes_its_tag_and_does_not_advance_numbering() {
        let temp = tempfile::tempdir().expect("tempdir");
        let runtime = FakeRuntime::default();
        let mut harness = EvaluationHarness::new(&runtime, "t", settings());
        runtime.fail_next_build(vec!["Step 1/2 : FROM broken".to_string()], "pull access denied");
        harness.build_image("FROM broken\n", temp.path()).unwrap_err();
        assert!(runtime.calls().contains(&RuntimeCall::RemoveImage("t-dockerfile1:latest".to_string())));
        assert!(harness.cache().active().is_none());

        let image = harness.build_image("FROM alpine\n", temp.path()).expect("build");
        assert_eq!(image, "t-dockerfile1:latest");
        assert!(harness.cache().is_active(&image));
    }

    #[test]
    fn credentials_are_build_args_not_file_contents() {
        let temp = tempfile::tempdir().expect("tempdir");
        let runtime = FakeRuntime::default();
        let mut config = settings();
        config.github_token = Some("s3cret".to_string());
        let mut harness = EvaluationHarness::new(&runtime, "t", config);
        let dockerfile = "FROM alpine\nRUN git clone https://github.com/acme/private.git\n";
        harness.build_image(dockerfile, temp.path()).expect("build");

        let context = fs::read_to_string(temp.path().join("build_context/Dockerfile")).expect("read");
        assert!(!context.contains("s3cret"));
        assert!(context.contains("${GITHUB_TOKEN}@github.com"));
        let builds = runtime.builds();
        assert_eq!(builds[0].build_args, vec![("GITHUB_TOKEN".to_string(), "s3cret".to_string())]);
    }

    #[test]
    fn fail_then_pass_is_fail2pass_and_cleans_up_container() {
        let temp = tempfile::tempdir().expect("tempdir");
        let runtime = FakeRuntime::default();
        runtime.script_eval_outputs(vec![
            "1 failed\nOMNIGRIL_EXIT_CODE=1\n".to_string(),
            "1 passed\nOMNIGRIL_EXIT_CODE=0\n".to_string(),
        ]);
        let mut harness = EvaluationHarness::new(&runtime, "t", settings());
        let image = harness.build_image("FROM alpine\n", temp.path()).expect("build");

        let record = harness
            .run_f2p(&image, "#!/bin/bash\n", "diff --git a/x b/x\n", "abc123", temp.path())
            .expect("run");
        assert_eq!(record.classification, F2pClass::Fail2Pass);
        assert_eq!(record.pre_exit_code, Some(1));
        assert_eq!(record.post_exit_code, Some(0));
        assert!(!record.source_mutated);

        let calls = runtime.calls();
        assert!(calls.iter().any(|c| matches!(c, RuntimeCall::RemoveContainer(_))));
        assert!(!calls.contains(&RuntimeCall::RemoveImage(image.clone())));
        let post = fs::read_to_string(temp.path().join(POST_PATCH_LOG)).expect("post log");
        assert!(post.contains("1 passed"));
    }

    #[test]
    fn eval_script_that_edits_sources_is_flagged() {
        let temp = tempfile::tempdir().expect("tempdir");
        let runtime = FakeRuntime::default();
        runtime.script_eval_outputs(vec![
            "OMNIGRIL_EXIT_CODE=1\n".to_string(),
            "OMNIGRIL_EXIT_CODE=0\n".to_string(),
        ]);
        runtime.script_diff_outputs(vec![
            "diff --git a/src/widget.py b/src/widget.py\n".to_string(),
            "diff --git a/src/widget.py b/src/widget.py\ndiff --git a/setup.cfg b/setup.cfg\n".to_string(),
        ]);
        let harness = EvaluationHarness::new(&runtime, "t", settings());
        let record = harness
            .run_f2p("img", "#!/bin/bash\n", "p", "abc", temp.path())
            .expect("run");
        assert!(record.source_mutated);
        assert_eq!(record.classification, F2pClass::Fail2Pass);
    }

    #[test]
    fn patch_falls_back_to_fuzzy_then_fails() {
        let temp = tempfile::tempdir().expect("tempdir");
        let runtime = FakeRuntime::default();
        runtime.fail_commands_containing("git apply -p1");
        let harness = EvaluationHarness::new(&runtime, "t", settings());
        harness
            .run_f2p("img", "#!/bin/bash\n", "patch", "abc", temp.path())
            .expect("fuzzy patch applies");
        assert!(runtime.exec_commands().iter().any(|c| c.starts_with("patch --batch --fuzz=5")));

        runtime.fail_commands_containing("patch --batch");
        let err = harness
            .run_f2p("img", "#!/bin/bash\n", "patch", "abc", temp.path())
            .unwrap_err();
        assert!(matches!(err.downcast_ref::<ForgeError>(), Some(ForgeError::Evaluation { .. })));
        // Uncached image and container are both removed on the error path.
        let calls = runtime.calls();
        assert!(calls.contains(&RuntimeCall::RemoveImage("img".to_string())));
    }

    #[test]
    fn missing_pre_patch_marker_is_error_class() {
        let temp = tempfile::tempdir().expect("tempdir");
        let runtime = FakeRuntime::default();
        runtime.script_eval_outputs(vec![
            "crashed\n".to_string(),
            "OMNIGRIL_EXIT_CODE=0\n".to_string(),
        ]);
        let harness = EvaluationHarness::new(&runtime, "t", settings());
        let record = harness
            .run_f2p("img", "#!/bin/bash\n", "p", "abc", temp.path())
            .expect("run");
        assert_eq!(record.classification, F2pClass::Error);
    }

    #[test]
    fn content_hash_is_sixteen_hex_chars() {
        let hash = content_hash("FROM alpine\n");
        assert_eq!(hash.len(), 16);
        assert_ne!(hash, content_hash("FROM debian\n"));
    }
}
