//! Per-task product output under `<output>/`.
//!
//! Layout:
//! - `<stage>_<n>/`: one directory per stage attempt, holding the extracted
//!   artifact, raw generator replies (`<stage>_raw_<i>`) and the transcript.
//! - `Dockerfile`, `eval.sh`: final artifacts.
//! - `status.json`, `run_meta.json`: run summary.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::core::types::{RunOutcome, StageRole, StatusRecord};

pub const DOCKERFILE: &str = "Dockerfile";
pub const EVAL_SCRIPT: &str = "eval.sh";
pub const STATUS: &str = "status.json";
pub const RUN_META: &str = "run_meta.json";
pub const TEST_RUN: &str = "test_run.json";
pub const TRANSCRIPT: &str = "conversation.md";

/// Timing and identity of one run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunMeta {
    pub task_id: String,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    pub elapsed_secs: f64,
    pub iterations: u32,
    pub outcome: RunOutcome,
}

impl RunMeta {
    pub fn new(
        task_id: &str,
        started_at: DateTime<Utc>,
        ended_at: DateTime<Utc>,
        iterations: u32,
        outcome: RunOutcome,
    ) -> Self {
        let elapsed_secs = (ended_at - started_at).num_milliseconds() as f64 / 1000.0;
        Self {
            task_id: task_id.to_string(),
            started_at,
            ended_at,
            elapsed_secs,
            iterations,
            outcome,
        }
    }
}

#[derive(Debug, Clone)]
pub struct TaskOutput {
    root: PathBuf,
}

impl TaskOutput {
    pub fn create(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root).with_context(|| format!("create output dir {}", root.display()))?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Create and return `<stage>_<attempt>/`.
    pub fn attempt_dir(&self, role: StageRole, attempt: u32) -> Result<PathBuf> {
        let dir = self.root.join(format!("{}_{attempt}", role.as_str()));
        fs::create_dir_all(&dir).with_context(|| format!("create attempt dir {}", dir.display()))?;
        Ok(dir)
    }

    /// Save one raw generator reply as `<stage>_raw_<try>`.
    pub fn write_raw(&self, attempt_dir: &Path, role: StageRole, try_index: u32, reply: &str) -> Result<()> {
        write_text(&attempt_dir.join(format!("{}_raw_{try_index}", role.as_str())), reply)
    }

    pub fn write_status(&self, status: &StatusRecord) -> Result<()> {
        write_json(&self.root.join(STATUS), status)
    }

    pub fn write_run_meta(&self, meta: &RunMeta) -> Result<()> {
        write_json(&self.root.join(RUN_META), meta)
    }

    /// Final Dockerfile and eval script, written together.
    pub fn write_final_artifacts(&self, dockerfile: &str, eval_script: &str) -> Result<()> {
        write_text(&self.root.join(DOCKERFILE), dockerfile)?;
        write_text(&self.root.join(EVAL_SCRIPT), eval_script)
    }
}

pub fn write_text(path: &Path, contents: &str) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).with_context(|| format!("create directory {}", parent.display()))?;
    }
    fs::write(path, contents).with_context(|| format!("write {}", path.display()))
}

/// Pretty JSON with a trailing newline.
pub fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let mut buf = serde_json::to_string_pretty(value).context("serialize json")?;
    buf.push('\n');
    write_text(path, &buf)
}

pub fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T> {
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    serde_json::from_str(&contents).with_context(|| format!("parse {}", path.display()))
}

/// Read a file if it exists, returning `None` for missing files.
pub fn read_optional(path: &Path) -> Result<Option<String>> {
    if !path.exists() {
        return Ok(None);
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    Ok(Some(contents))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::F2pClass;

    #[test]
    fn attempt_dirs_are_named_by_stage_and_number() {
        let temp = tempfile::tempdir().expect("tempdir");
        let output = TaskOutput::create(temp.path().join("task-1")).expect("create");
        let dir = output.attempt_dir(StageRole::EvalScriptWriter, 2).expect("dir");
        assert!(dir.ends_with("eval_script_writer_2"));
        output
            .write_raw(&dir, StageRole::EvalScriptWriter, 0, "reply")
            .expect("raw");
        assert!(dir.join("eval_script_writer_raw_0").exists());
    }

    #[test]
    fn status_omits_missing_classification() {
        let temp = tempfile::tempdir().expect("tempdir");
        let output = TaskOutput::create(temp.path()).expect("create");
        output
            .write_status(&StatusRecord {
                is_finish: false,
                f2p_classification: None,
                outcome: RunOutcome::Exhausted,
                error: None,
            })
            .expect("write");
        let raw = fs::read_to_string(temp.path().join(STATUS)).expect("read");
        assert!(raw.ends_with("}\n"));
        assert!(!raw.contains("f2p_classification"));
        assert!(raw.contains("\"exhausted\""));

        output
            .write_status(&StatusRecord {
                is_finish: true,
                f2p_classification: Some(F2pClass::Fail2Pass),
                outcome: RunOutcome::Finished,
                error: None,
            })
            .expect("write");
        let status: StatusRecord = read_json(&temp.path().join(STATUS)).expect("read");
        assert_eq!(status.f2p_classification, Some(F2pClass::Fail2Pass));
    }

    #[test]
    fn run_meta_records_elapsed_seconds() {
        let start = Utc::now();
        let end = start + chrono::Duration::milliseconds(2500);
        let meta = RunMeta::new("t", start, end, 3, RunOutcome::Finished);
        assert!((meta.elapsed_secs - 2.5).abs() < f64::EPSILON);
    }
}
