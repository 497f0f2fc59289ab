//! Workflow-level tests for full environment construction runs.
//!
//! These drive `Workflow::run` with a scripted generator, a fake container
//! runtime and an in-memory result store, then check the task output
//! directory and the memory the way a caller would.

use std::fs;
use std::path::Path;

use envforge::core::heredoc::{HEREDOC_DELIMITER, PATCH_PLACEHOLDER};
use envforge::core::types::{F2pClass, RunOutcome, StatusRecord, TaskSpec};
use envforge::io::config::ForgeConfig;
use envforge::test_support::{
    FakeRuntime, InMemoryStore, ScriptedGenerator, memory_record, task, test_patch_reply,
    wide_test_patch,
};
use envforge::workflow::{Collaborators, Workflow, WorkflowReport};

const CONTEXT: &str = "<analysis>Python 3.9 project, tests run with pytest.</analysis>";
const DOCKERFILE: &str = "<dockerfile>\nFROM python:3.9\nRUN pip install pytest\n</dockerfile>";
const FINISH: &str = r#"{"is_finish": true}"#;

fn eval_reply() -> String {
    format!(
        "<script>\n#!/bin/bash\ncd /testbed\ngit apply -v - <<'{HEREDOC_DELIMITER}'\n{PATCH_PLACEHOLDER}\n{HEREDOC_DELIMITER}\npytest tests\n</script>"
    )
}

fn guide(stage: &str, text: &str) -> String {
    format!(r#"{{"is_finish": false, "guidance_for_{stage}": "{text}"}}"#)
}

fn fail_then_pass(runtime: &FakeRuntime) {
    runtime.script_eval_outputs(vec![
        "1 failed\nOMNIGRIL_EXIT_CODE=1\n".to_string(),
        "1 passed\nOMNIGRIL_EXIT_CODE=0\n".to_string(),
    ]);
}

struct Run {
    report: WorkflowReport,
    generator: ScriptedGenerator,
}

fn run_task(
    task: TaskSpec,
    config: ForgeConfig,
    replies: Vec<String>,
    runtime: &FakeRuntime,
    memory: &InMemoryStore,
    output: &Path,
) -> Run {
    let generator = ScriptedGenerator::new(replies);
    let deps = Collaborators {
        generator: &generator,
        memory,
        runtime,
        probe: None,
        browser: None,
    };
    let report = Workflow::new(task, config, deps, output, None)
        .expect("workflow")
        .run()
        .expect("run");
    Run { report, generator }
}

fn read_status(output: &Path) -> StatusRecord {
    let raw = fs::read_to_string(output.join("status.json")).expect("status.json");
    serde_json::from_str(&raw).expect("parse status")
}

#[test]
fn wide_test_patch_skips_generation_and_finishes() {
    let temp = tempfile::tempdir().expect("tempdir");
    let mut task = task("acme__widget-1");
    task.test_patch = wide_test_patch(4);
    let runtime = FakeRuntime::default();
    fail_then_pass(&runtime);
    let memory = InMemoryStore::default();

    let run = run_task(
        task,
        ForgeConfig::default(),
        vec![CONTEXT.into(), DOCKERFILE.into(), eval_reply(), FINISH.into()],
        &runtime,
        &memory,
        temp.path(),
    );

    assert_eq!(run.report.status.outcome, RunOutcome::Finished);
    assert_eq!(run.report.iterations, 1);
    assert_eq!(run.generator.remaining(), 0);
    let status = read_status(temp.path());
    assert!(status.is_finish);
    assert_eq!(status.f2p_classification, Some(F2pClass::Fail2Pass));
    assert!(!temp.path().join("test_writer_1").exists());

    let eval = fs::read_to_string(temp.path().join("eval.sh")).expect("eval.sh");
    assert!(eval.contains("+++ b/tests/test_3.py"));
    assert!(!eval.contains(PATCH_PLACEHOLDER));
    assert!(temp.path().join("Dockerfile").exists());
    assert!(temp.path().join("run_meta.json").exists());
    assert!(temp.path().join("analyzer_1/test_run.json").exists());

    let records = memory.records();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].dockerfile, "FROM python:3.9\nRUN pip install pytest\n");
    assert!(records[0].eval_script_skeleton.contains(PATCH_PLACEHOLDER));
}

#[test]
fn empty_test_patch_generates_tests_and_merges_them() {
    let temp = tempfile::tempdir().expect("tempdir");
    let mut task = task("acme__widget-2");
    task.test_patch = String::new();
    let runtime = FakeRuntime::default();
    fail_then_pass(&runtime);
    let memory = InMemoryStore::default();

    let run = run_task(
        task,
        ForgeConfig::default(),
        vec![
            CONTEXT.into(),
            test_patch_reply(&["tests/test_a.py", "tests/test_b.py"]),
            "Covers the fix. TESTS_APPROVED".into(),
            DOCKERFILE.into(),
            eval_reply(),
            FINISH.into(),
        ],
        &runtime,
        &memory,
        temp.path(),
    );

    assert_eq!(run.report.status.outcome, RunOutcome::Finished);
    let prompts = run.generator.prompts();
    let eval_prompt = &prompts[4];
    assert!(eval_prompt.contains("rm -f \"tests/test_a.py\" \"tests/test_b.py\""));
    assert!(!eval_prompt.contains("tests/test_widget.py"));
    // The test writer is seeded with the collected context.
    assert!(prompts[1].contains("tests run with pytest"));

    let records = memory.records();
    assert!(records[0].task.test_patch.contains("+++ b/tests/test_b.py"));
    assert!(temp.path().join("test_writer_1/test_patch.diff").exists());
}

#[test]
fn exact_version_reference_seeds_the_dockerfile_writer() {
    let temp = tempfile::tempdir().expect("tempdir");
    let mut task = task("acme__widget-3");
    task.test_patch = wide_test_patch(3);
    let runtime = FakeRuntime::default();
    let memory = InMemoryStore::with_records(vec![
        memory_record("acme/widget", "2.3.1", "FROM exact-match"),
        memory_record("acme/widget", "2.0.0", "FROM older-release"),
    ]);
    let config = ForgeConfig {
        disable_run_test: true,
        ..ForgeConfig::default()
    };

    let run = run_task(
        task,
        config,
        vec![CONTEXT.into(), DOCKERFILE.into(), eval_reply(), FINISH.into()],
        &runtime,
        &memory,
        temp.path(),
    );

    assert_eq!(run.report.status.outcome, RunOutcome::Finished);
    assert_eq!(run.report.status.f2p_classification, None);
    let dockerfile_prompt = &run.generator.prompts()[1];
    assert!(dockerfile_prompt.contains("FROM exact-match"));
    assert!(!dockerfile_prompt.contains("FROM older-release"));
    assert!(runtime.builds().is_empty());
    assert_eq!(memory.records().len(), 3);
}

#[test]
fn guidance_reruns_only_the_named_stage_until_budget_is_spent() {
    let temp = tempfile::tempdir().expect("tempdir");
    let mut task = task("acme__widget-4");
    task.test_patch = wide_test_patch(3);
    let runtime = FakeRuntime::default();
    let memory = InMemoryStore::default();
    let config = ForgeConfig {
        max_iterations: 2,
        ..ForgeConfig::default()
    };

    let run = run_task(
        task,
        config,
        vec![
            CONTEXT.into(),
            DOCKERFILE.into(),
            eval_reply(),
            guide("dockerfile_writer", "install libxml2-dev"),
            "<dockerfile>\nFROM python:3.10\n</dockerfile>".into(),
            guide("dockerfile_writer", "pin numpy"),
        ],
        &runtime,
        &memory,
        temp.path(),
    );

    assert_eq!(run.report.status.outcome, RunOutcome::Exhausted);
    assert_eq!(run.report.iterations, 2);
    assert_eq!(run.generator.remaining(), 0);
    let status = read_status(temp.path());
    assert!(!status.is_finish);
    assert_eq!(status.f2p_classification, Some(F2pClass::Pass2Pass));
    assert!(run.generator.prompts()[4].contains("install libxml2-dev"));
    assert!(!temp.path().join("eval_script_writer_2").exists());
    assert_eq!(runtime.builds().len(), 2);
    let dockerfile = fs::read_to_string(temp.path().join("Dockerfile")).expect("Dockerfile");
    assert_eq!(dockerfile, "FROM python:3.10\n");
    assert!(memory.records().is_empty());
}

#[test]
fn test_writer_guidance_creates_the_stage_on_demand() {
    let temp = tempfile::tempdir().expect("tempdir");
    let mut task = task("acme__widget-5");
    task.test_patch = wide_test_patch(3);
    let runtime = FakeRuntime::default();
    runtime.script_eval_outputs(vec![
        "OMNIGRIL_EXIT_CODE=0\n".to_string(),
        "OMNIGRIL_EXIT_CODE=0\n".to_string(),
        "OMNIGRIL_EXIT_CODE=1\n".to_string(),
        "OMNIGRIL_EXIT_CODE=0\n".to_string(),
    ]);
    let memory = InMemoryStore::default();

    let run = run_task(
        task,
        ForgeConfig::default(),
        vec![
            CONTEXT.into(),
            DOCKERFILE.into(),
            eval_reply(),
            guide("test_writer", "the existing tests never call size()"),
            test_patch_reply(&["tests/test_size.py"]),
            "TESTS_APPROVED".into(),
            eval_reply(),
            FINISH.into(),
        ],
        &runtime,
        &memory,
        temp.path(),
    );

    assert_eq!(run.report.status.outcome, RunOutcome::Finished);
    assert_eq!(run.report.iterations, 2);
    assert!(temp.path().join("test_writer_1").exists());
    assert!(temp.path().join("eval_script_writer_2").exists());
    let eval = fs::read_to_string(temp.path().join("eval.sh")).expect("eval.sh");
    assert!(eval.contains("+++ b/tests/test_size.py"));
    assert!(eval.contains("+++ b/tests/test_0.py"));
}

#[test]
fn runtime_failure_aborts_without_recording_success() {
    let temp = tempfile::tempdir().expect("tempdir");
    let mut task = task("acme__widget-6");
    task.test_patch = wide_test_patch(3);
    let runtime = FakeRuntime::default();
    runtime.fail_container_creation("Cannot connect to the Docker daemon");
    let memory = InMemoryStore::default();

    let run = run_task(
        task,
        ForgeConfig::default(),
        vec![CONTEXT.into(), DOCKERFILE.into(), eval_reply()],
        &runtime,
        &memory,
        temp.path(),
    );

    assert_eq!(run.report.status.outcome, RunOutcome::Aborted);
    let status = read_status(temp.path());
    assert_eq!(status.outcome, RunOutcome::Aborted);
    assert!(status.error.as_deref().is_some_and(|err| err.contains("Docker daemon")));
    assert!(memory.records().is_empty());
    // Artifacts produced before the abort are still written.
    assert!(temp.path().join("Dockerfile").exists());
}

#[test]
fn stage_that_never_extracts_exhausts_the_run() {
    let temp = tempfile::tempdir().expect("tempdir");
    let mut task = task("acme__widget-7");
    task.test_patch = wide_test_patch(3);
    let runtime = FakeRuntime::default();
    let memory = InMemoryStore::default();
    let config = ForgeConfig {
        max_iterations: 1,
        ..ForgeConfig::default()
    };

    let run = run_task(
        task,
        config,
        vec![CONTEXT.into(), "sorry".into(), "still prose".into(), "nothing".into()],
        &runtime,
        &memory,
        temp.path(),
    );

    assert_eq!(run.report.status.outcome, RunOutcome::Exhausted);
    assert!(!temp.path().join("Dockerfile").exists());
    assert!(temp.path().join("dockerfile_writer_1/dockerfile_writer_raw_2").exists());
    assert!(runtime.calls().is_empty());
}
