//! Eval script writer.
//!
//! The generator refines a skeleton that carries the test patch only as a
//! placeholder heredoc. The merged test patch and any binary resource
//! download commands are spliced in after extraction, so the runnable script
//! and the skeleton the analyzer reads are kept side by side.

use std::path::Path;

use anyhow::Result;
use tracing::{info, instrument, warn};

use crate::core::diff::{created_file_paths, normalize_new_file_header, test_file_paths};
use crate::core::extract::extract_eval_script;
use crate::core::heredoc::{
    SkeletonInputs, build_eval_skeleton, has_patch_heredoc, inject_patch_into_heredoc,
    insert_before_heredoc,
};
use crate::core::types::TestPatch;
use crate::error::ForgeError;
use crate::io::prompt::EvalScriptPrompt;
use crate::io::task_output::{EVAL_SCRIPT, write_text};

use super::{AgentState, StageContext, generate_with_retry};

pub const SKELETON_SCRIPT: &str = "eval_skeleton.sh";

/// One extracted eval script in both of its forms.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EvalScript {
    /// What runs in the container.
    pub script: String,
    /// The same script with the patch left as a placeholder.
    pub skeleton: String,
}

pub struct EvalScriptWriter {
    pub state: AgentState,
    pub context: Option<String>,
    pub reference: Option<String>,
    /// Latest Dockerfile, handed in before every run.
    pub dockerfile: String,
    base_commit: String,
    base_patch: String,
    generated: Option<TestPatch>,
    binary_commands: Vec<String>,
    skeleton: String,
    latest: Option<EvalScript>,
}

impl EvalScriptWriter {
    pub fn new(state: AgentState, base_commit: &str, test_patch: &str) -> Self {
        let mut writer = Self {
            state,
            context: None,
            reference: None,
            dockerfile: String::new(),
            base_commit: base_commit.to_string(),
            base_patch: test_patch.to_string(),
            generated: None,
            binary_commands: Vec::new(),
            skeleton: String::new(),
            latest: None,
        };
        writer.rebuild_skeleton();
        writer
    }

    /// Replace the task's test patch with its binary-free form and remember
    /// the commands that fetch the binaries instead.
    pub fn set_binary_resources(&mut self, commands: Vec<String>, stripped_patch: String) {
        self.binary_commands = commands;
        self.base_patch = stripped_patch;
        self.rebuild_skeleton();
    }

    /// Merge a generated test patch after the task's own. A later call
    /// replaces the earlier generated patch.
    pub fn set_generated_tests(&mut self, patch: &TestPatch) {
        self.generated = Some(TestPatch {
            text: normalize_new_file_header(&patch.text),
            files: patch.files.clone(),
        });
        self.rebuild_skeleton();
    }

    pub fn merged_patch(&self) -> String {
        let mut merged = self.base_patch.clone();
        if let Some(generated) = &self.generated {
            if !merged.is_empty() && !merged.ends_with('\n') {
                merged.push('\n');
            }
            merged.push_str(&generated.text);
        }
        merged
    }

    pub fn test_files(&self) -> Vec<String> {
        test_file_paths(&self.merged_patch())
    }

    pub fn skeleton(&self) -> &str {
        &self.skeleton
    }

    pub fn latest(&self) -> Option<&EvalScript> {
        self.latest.as_ref()
    }

    fn rebuild_skeleton(&mut self) {
        let merged = self.merged_patch();
        let test_files = test_file_paths(&merged);
        let created = created_file_paths(&merged);
        self.skeleton = build_eval_skeleton(&SkeletonInputs {
            base_commit: &self.base_commit,
            test_files: &test_files,
            generated_files: &created,
            has_test_patch: !merged.trim().is_empty(),
        });
    }

    #[instrument(skip_all, fields(attempt = self.state.iteration + 1))]
    pub fn run(&mut self, ctx: &StageContext<'_>) -> Result<EvalScript> {
        let dir = self.state.begin_attempt(ctx.output)?;
        let guidance = self.state.take_guidance();
        let merged = self.merged_patch();
        let test_files = test_file_paths(&merged);
        let previous = self.latest.as_ref().map(|latest| latest.skeleton.clone());
        let prompt = ctx.prompts.eval_script_writer(&EvalScriptPrompt {
            skeleton: &self.skeleton,
            dockerfile: &self.dockerfile,
            test_files: &test_files,
            context: self.context.as_deref(),
            reference: self.reference.as_deref(),
            previous: previous.as_deref(),
            guidance: guidance.as_deref(),
        })?;

        let needs_heredoc = !merged.trim().is_empty();
        let result = generate_with_retry(
            ctx,
            &mut self.state,
            &dir,
            prompt,
            extract_eval_script,
            |script: &String| {
                if needs_heredoc && !has_patch_heredoc(script) {
                    return Err(ForgeError::extraction("eval script with the test patch heredoc"));
                }
                Ok(())
            },
        )
        .and_then(|skeleton| self.assemble(skeleton, &merged));
        self.state.save_transcript(&dir)?;

        match result {
            Ok(eval) => {
                write_eval(&dir, &eval)?;
                info!(bytes = eval.script.len(), binaries = self.binary_commands.len(), "eval script written");
                self.latest = Some(eval.clone());
                Ok(eval)
            }
            Err(err) => {
                if let Some(previous) = &self.latest {
                    warn!("keeping previous eval script");
                    write_eval(&dir, previous)?;
                }
                Err(err)
            }
        }
    }

    fn assemble(&self, skeleton: String, merged: &str) -> Result<EvalScript> {
        let with_patch = if merged.trim().is_empty() {
            skeleton.clone()
        } else {
            inject_patch_into_heredoc(&skeleton, merged)
                .ok_or_else(|| ForgeError::extraction("eval script with the test patch heredoc"))?
        };
        Ok(EvalScript {
            script: insert_before_heredoc(&with_patch, &self.binary_commands),
            skeleton,
        })
    }
}

fn write_eval(dir: &Path, eval: &EvalScript) -> Result<()> {
    write_text(&dir.join(EVAL_SCRIPT), &eval.script)?;
    write_text(&dir.join(SKELETON_SCRIPT), &eval.skeleton)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::heredoc::{HEREDOC_DELIMITER, PATCH_PLACEHOLDER};
    use crate::core::types::StageRole;
    use crate::io::config::ForgeConfig;
    use crate::io::prompt::PromptEngine;
    use crate::io::task_output::TaskOutput;
    use crate::test_support::{ScriptedGenerator, task, test_patch_reply};

    fn script_reply(body: &str) -> String {
        format!("<script>\n#!/bin/bash\ncd /testbed\n{body}\npytest tests\n</script>")
    }

    fn heredoc_body() -> String {
        format!("git apply -v - <<'{HEREDOC_DELIMITER}'\n{PATCH_PLACEHOLDER}\n{HEREDOC_DELIMITER}")
    }

    fn writer() -> EvalScriptWriter {
        let task = task("t");
        EvalScriptWriter::new(
            AgentState::new(StageRole::EvalScriptWriter, "sys".into()),
            &task.base_commit,
            &task.test_patch,
        )
    }

    fn run_with(writer: &mut EvalScriptWriter, replies: Vec<String>) -> (Result<EvalScript>, ScriptedGenerator) {
        let temp = tempfile::tempdir().expect("tempdir");
        let output = TaskOutput::create(temp.path()).expect("output");
        let generator = ScriptedGenerator::new(replies);
        let config = ForgeConfig::default();
        let prompts = PromptEngine::new();
        let task = task("t");
        let ctx = StageContext {
            task: &task,
            config: &config,
            generator: &generator,
            prompts: &prompts,
            output: &output,
        };
        let result = writer.run(&ctx);
        (result, generator)
    }

    #[test]
    fn generated_tests_are_merged_into_the_skeleton() {
        let mut writer = writer();
        let existing = writer.test_files();
        let generated = crate::core::extract::extract_test_patch(&test_patch_reply(&[
            "tests/generated/test_one.py",
            "tests/generated/test_two.py",
        ]))
        .expect("patch");
        writer.set_generated_tests(&generated);

        let files = writer.test_files();
        assert_eq!(files.len(), existing.len() + 2);
        assert!(files.ends_with(&[
            "tests/generated/test_one.py".to_string(),
            "tests/generated/test_two.py".to_string(),
        ]));
        let skeleton = writer.skeleton();
        assert!(skeleton.contains("mkdir -p \"tests/generated\""));
        assert!(skeleton.contains("rm -f \"tests/generated/test_one.py\" \"tests/generated/test_two.py\""));
        for path in &existing {
            assert!(skeleton.contains(&format!("\"{path}\"")));
        }
    }

    #[test]
    fn regenerated_tests_replace_the_previous_merge() {
        let mut writer = writer();
        let first = crate::core::extract::extract_test_patch(&test_patch_reply(&["tests/test_a.py"]))
            .expect("patch");
        let second = crate::core::extract::extract_test_patch(&test_patch_reply(&["tests/test_b.py"]))
            .expect("patch");
        writer.set_generated_tests(&first);
        writer.set_generated_tests(&second);
        let files = writer.test_files();
        assert!(files.contains(&"tests/test_b.py".to_string()));
        assert!(!files.contains(&"tests/test_a.py".to_string()));
    }

    #[test]
    fn run_splices_patch_and_keeps_placeholder_skeleton() {
        let mut writer = writer();
        let (result, _) = run_with(&mut writer, vec![script_reply(&heredoc_body())]);
        let eval = result.expect("eval script");
        assert!(!eval.script.contains(PATCH_PLACEHOLDER));
        assert!(eval.script.contains("git apply --no-index -v -"));
        assert!(eval.script.contains(writer.merged_patch().lines().next().expect("first line")));
        assert!(eval.skeleton.contains(PATCH_PLACEHOLDER));
        assert!(eval.script.contains("OMNIGRIL_EXIT_CODE=$rc"));
    }

    #[test]
    fn script_without_heredoc_is_re_prompted() {
        let mut writer = writer();
        let (result, generator) = run_with(
            &mut writer,
            vec![script_reply("git apply test.patch"), script_reply(&heredoc_body())],
        );
        assert!(result.is_ok());
        assert_eq!(generator.prompts().len(), 2);
        assert!(generator.prompts()[1].contains("Failed to extract eval script with the test patch heredoc"));
    }

    #[test]
    fn binary_commands_run_before_the_patch() {
        let mut writer = writer();
        let stripped = writer.merged_patch();
        writer.set_binary_resources(vec!["mkdir -p 'tests/data'".to_string()], stripped);
        let (result, _) = run_with(&mut writer, vec![script_reply(&heredoc_body())]);
        let script = result.expect("eval script").script;
        let mkdir = script.find("mkdir -p 'tests/data'").expect("mkdir");
        let apply = script.find("git apply --no-index").expect("apply");
        assert!(mkdir < apply);
    }
}
