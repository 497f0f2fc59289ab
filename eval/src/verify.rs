//! Standalone re-verification of generated environments.
//!
//! Every task directory holding `Dockerfile`, `eval.sh` and `meta.json` (the
//! task) is rebuilt and run through the dual-run protocol again. The result
//! is written next to the artifacts as `f2p_result.json`.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use envforge::core::types::{F2pClass, TaskSpec};
use envforge::io::config::ForgeConfig;
use envforge::io::container::ContainerRuntime;
use envforge::io::harness::{EvaluationHarness, HarnessSettings};
use envforge::io::task_output::{DOCKERFILE, EVAL_SCRIPT, read_json, write_json};
use serde::{Deserialize, Serialize};
use tracing::{info, instrument, warn};

use crate::task_dirs::{dir_name, load_task_dirs};

pub const TASK_META: &str = "meta.json";
pub const F2P_RESULT: &str = "f2p_result.json";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct F2pResult {
    pub task_id: String,
    pub classification: F2pClass,
    pub pre_exit_code: Option<i32>,
    pub post_exit_code: Option<i32>,
    pub source_mutated: bool,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub error: Option<String>,
    pub verified_at: DateTime<Utc>,
}

/// Whether `dir` holds everything a verification needs.
pub fn is_verifiable(dir: &Path) -> bool {
    [DOCKERFILE, EVAL_SCRIPT, TASK_META]
        .iter()
        .all(|name| dir.join(name).is_file())
}

/// Verify one task directory. Harness failures are recorded in the result,
/// not returned.
#[instrument(skip_all, fields(dir = %dir.display()))]
pub fn verify_dir(runtime: &dyn ContainerRuntime, config: &ForgeConfig, dir: &Path) -> Result<F2pResult> {
    let task: TaskSpec = read_json(&dir.join(TASK_META))?;
    let dockerfile_path = dir.join(DOCKERFILE);
    let dockerfile = fs::read_to_string(&dockerfile_path)
        .with_context(|| format!("read {}", dockerfile_path.display()))?;
    let script_path = dir.join(EVAL_SCRIPT);
    let eval_script = fs::read_to_string(&script_path)
        .with_context(|| format!("read {}", script_path.display()))?;

    let mut harness = EvaluationHarness::new(
        runtime,
        &task.id,
        HarnessSettings {
            eval_timeout: config.eval_timeout(),
            build_timeout: config.build_timeout(),
            log_max_lines: config.log_max_lines,
            github_token: std::env::var("GITHUB_TOKEN").ok().filter(|token| !token.is_empty()),
        },
    );
    let run = harness
        .build_image(&dockerfile, dir)
        .and_then(|image| harness.run_f2p(&image, &eval_script, &task.patch, &task.base_commit, dir));

    let result = match run {
        Ok(run) => F2pResult {
            task_id: task.id.clone(),
            classification: run.classification,
            pre_exit_code: run.pre_exit_code,
            post_exit_code: run.post_exit_code,
            source_mutated: run.source_mutated,
            error: None,
            verified_at: Utc::now(),
        },
        Err(err) => {
            warn!(task_id = %task.id, err = %format!("{err:#}"), "verification failed");
            F2pResult {
                task_id: task.id.clone(),
                classification: F2pClass::Error,
                pre_exit_code: None,
                post_exit_code: None,
                source_mutated: false,
                error: Some(format!("{err:#}")),
                verified_at: Utc::now(),
            }
        }
    };
    write_json(&dir.join(F2P_RESULT), &result)?;
    info!(task_id = %result.task_id, classification = %result.classification, "verified");
    Ok(result)
}

/// Verify every eligible subdirectory of `root`; others are skipped.
pub fn verify_all(runtime: &dyn ContainerRuntime, config: &ForgeConfig, root: &Path) -> Result<Vec<F2pResult>> {
    let mut results = Vec::new();
    for dir in load_task_dirs(root)? {
        if !is_verifiable(&dir) {
            warn!(task = %dir_name(&dir), "missing Dockerfile, eval.sh or meta.json, skipping");
            continue;
        }
        results.push(verify_dir(runtime, config, &dir)?);
    }
    Ok(results)
}
