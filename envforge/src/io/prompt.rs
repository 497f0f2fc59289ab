//! Stage prompt rendering.

use anyhow::Result;
use minijinja::{Environment, context};
use serde::Serialize;

use crate::core::api_call::{ApiSpec, CONTEXT_APIS};
use crate::core::types::{StageRole, TaskSpec};

const SYSTEM_TEMPLATE: &str = include_str!("prompts/system.md");
const CONTEXT_COLLECTOR_TEMPLATE: &str = include_str!("prompts/context_collector.md");
const DOCKERFILE_WRITER_TEMPLATE: &str = include_str!("prompts/dockerfile_writer.md");
const TEST_WRITER_TEMPLATE: &str = include_str!("prompts/test_writer.md");
const TEST_WRITER_REVIEW_TEMPLATE: &str = include_str!("prompts/test_writer_review.md");
const EVAL_SCRIPT_WRITER_TEMPLATE: &str = include_str!("prompts/eval_script_writer.md");
const ANALYZER_TEMPLATE: &str = include_str!("prompts/analyzer.md");

#[derive(Debug, Clone, Serialize)]
struct ApiContext {
    name: &'static str,
    params: &'static [&'static str],
}

impl From<&ApiSpec> for ApiContext {
    fn from(spec: &ApiSpec) -> Self {
        Self {
            name: spec.name,
            params: spec.params,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct DockerfilePrompt<'a> {
    pub context: Option<&'a str>,
    /// Dockerfile from the closest prior success.
    pub reference: Option<&'a str>,
    pub previous: Option<&'a str>,
    pub guidance: Option<&'a str>,
}

#[derive(Debug, Clone, Default)]
pub struct TestWriterPrompt<'a> {
    /// Possibly summarized reference fix.
    pub patch: &'a str,
    pub existing_files: &'a [String],
    pub context: Option<&'a str>,
    pub previous: Option<&'a str>,
    pub critique: Option<&'a str>,
    pub guidance: Option<&'a str>,
}

#[derive(Debug, Clone, Default)]
pub struct EvalScriptPrompt<'a> {
    pub skeleton: &'a str,
    pub dockerfile: &'a str,
    pub test_files: &'a [String],
    pub context: Option<&'a str>,
    pub reference: Option<&'a str>,
    pub previous: Option<&'a str>,
    pub guidance: Option<&'a str>,
}

#[derive(Debug, Clone, Default)]
pub struct AnalyzerPrompt<'a> {
    pub live: bool,
    pub dockerfile: &'a str,
    pub skeleton: &'a str,
    pub test_files: &'a [String],
    pub build_log: Option<&'a str>,
    pub harness_error: Option<&'a str>,
    /// Explanation of the fail-to-pass classification.
    pub classification: Option<&'a str>,
    pub source_mutated: bool,
    pub pre_log: Option<&'a str>,
    pub post_log: Option<&'a str>,
}

/// Template engine wrapper around minijinja.
pub struct PromptEngine {
    env: Environment<'static>,
}

impl Default for PromptEngine {
    fn default() -> Self {
        Self::new()
    }
}

fn non_blank(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|s| !s.is_empty())
}

impl PromptEngine {
    pub fn new() -> Self {
        let mut env = Environment::new();
        for (name, source) in [
            ("system", SYSTEM_TEMPLATE),
            ("context_collector", CONTEXT_COLLECTOR_TEMPLATE),
            ("dockerfile_writer", DOCKERFILE_WRITER_TEMPLATE),
            ("test_writer", TEST_WRITER_TEMPLATE),
            ("test_writer_review", TEST_WRITER_REVIEW_TEMPLATE),
            ("eval_script_writer", EVAL_SCRIPT_WRITER_TEMPLATE),
            ("analyzer", ANALYZER_TEMPLATE),
        ] {
            env.add_template(name, source)
                .expect("prompt template should be valid");
        }
        Self { env }
    }

    pub fn system(&self, role: StageRole, task: &TaskSpec) -> Result<String> {
        let template = self.env.get_template("system")?;
        Ok(template.render(context! {
            role => role.as_str(),
            repo => &task.repo,
            base_commit => &task.base_commit,
        })?)
    }

    pub fn context_collector(
        &self,
        task: &TaskSpec,
        rounds_left: u32,
        guidance: Option<&str>,
    ) -> Result<String> {
        let apis: Vec<ApiContext> = CONTEXT_APIS.iter().map(ApiContext::from).collect();
        let template = self.env.get_template("context_collector")?;
        Ok(template.render(context! {
            repo => &task.repo,
            version => &task.version,
            language => non_blank(Some(task.language.as_str())),
            problem_statement => non_blank(Some(task.problem_statement.as_str())),
            apis => apis,
            rounds_left => rounds_left,
            guidance => non_blank(guidance),
        })?)
    }

    pub fn dockerfile_writer(&self, task: &TaskSpec, input: &DockerfilePrompt<'_>) -> Result<String> {
        let template = self.env.get_template("dockerfile_writer")?;
        Ok(template.render(context! {
            repo => &task.repo,
            base_commit => &task.base_commit,
            version => non_blank(Some(task.version.as_str())),
            base_image => non_blank(task.base_image.as_deref()),
            context => non_blank(input.context),
            reference => non_blank(input.reference),
            previous => non_blank(input.previous),
            guidance => non_blank(input.guidance),
        })?)
    }

    pub fn test_writer(&self, task: &TaskSpec, input: &TestWriterPrompt<'_>) -> Result<String> {
        let template = self.env.get_template("test_writer")?;
        Ok(template.render(context! {
            repo => &task.repo,
            base_commit => &task.base_commit,
            problem_statement => non_blank(Some(task.problem_statement.as_str())),
            patch => input.patch.trim_end(),
            existing_files => input.existing_files,
            context => non_blank(input.context),
            previous => non_blank(input.previous),
            critique => non_blank(input.critique),
            guidance => non_blank(input.guidance),
        })?)
    }

    pub fn test_writer_review(&self, patch: &str) -> Result<String> {
        let template = self.env.get_template("test_writer_review")?;
        Ok(template.render(context! { patch => patch.trim_end() })?)
    }

    pub fn eval_script_writer(&self, input: &EvalScriptPrompt<'_>) -> Result<String> {
        let template = self.env.get_template("eval_script_writer")?;
        Ok(template.render(context! {
            skeleton => input.skeleton.trim_end(),
            dockerfile => input.dockerfile.trim_end(),
            test_files => input.test_files,
            context => non_blank(input.context),
            reference => non_blank(input.reference),
            previous => non_blank(input.previous),
            guidance => non_blank(input.guidance),
        })?)
    }

    pub fn analyzer(&self, input: &AnalyzerPrompt<'_>) -> Result<String> {
        let template = self.env.get_template("analyzer")?;
        Ok(template.render(context! {
            live => input.live,
            dockerfile => input.dockerfile.trim_end(),
            skeleton => input.skeleton.trim_end(),
            test_files => input.test_files,
            build_log => non_blank(input.build_log),
            harness_error => non_blank(input.harness_error),
            classification => non_blank(input.classification),
            source_mutated => input.source_mutated,
            pre_log => non_blank(input.pre_log),
            post_log => non_blank(input.post_log),
        })?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::task;

    #[test]
    fn system_prompt_names_the_role() {
        let engine = PromptEngine::new();
        let text = engine
            .system(StageRole::DockerfileWriter, &task("acme__widget-1"))
            .expect("render");
        assert!(text.contains("Your role: write the Dockerfile."));
        assert!(text.contains("acme/widget"));
    }

    #[test]
    fn context_prompt_lists_every_allowed_call() {
        let engine = PromptEngine::new();
        let text = engine
            .context_collector(&task("t"), 4, None)
            .expect("render");
        for api in CONTEXT_APIS {
            assert!(text.contains(api.name), "missing {}", api.name);
        }
        assert!(text.contains("browse_folder(path, depth)"));
        assert!(text.contains("4 exploration round(s) remain"));
        assert!(!text.contains("Guidance from the analyzer"));
    }

    #[test]
    fn dockerfile_prompt_includes_optional_sections_only_when_present() {
        let engine = PromptEngine::new();
        let bare = engine
            .dockerfile_writer(&task("t"), &DockerfilePrompt::default())
            .expect("render");
        assert!(!bare.contains("nearby version"));
        assert!(!bare.contains("Guidance to address"));

        let full = engine
            .dockerfile_writer(
                &task("t"),
                &DockerfilePrompt {
                    reference: Some("FROM python:3.9"),
                    guidance: Some("pin numpy<2"),
                    ..DockerfilePrompt::default()
                },
            )
            .expect("render");
        assert!(full.contains("FROM python:3.9"));
        assert!(full.contains("pin numpy<2"));
        assert!(full.contains("<dockerfile>"));
    }

    #[test]
    fn analyzer_prompt_switches_on_live_execution() {
        let engine = PromptEngine::new();
        let files = vec!["tests/test_a.py".to_string()];
        let live = engine
            .analyzer(&AnalyzerPrompt {
                live: true,
                dockerfile: "FROM x",
                skeleton: "#!/bin/bash",
                test_files: &files,
                classification: Some("FAIL2PASS: pre 1, post 0"),
                post_log: Some("1 passed"),
                ..AnalyzerPrompt::default()
            })
            .expect("render");
        assert!(live.contains("run before and after"));
        assert!(live.contains("FAIL2PASS: pre 1, post 0"));
        assert!(live.contains("tests/test_a.py"));

        let offline = engine
            .analyzer(&AnalyzerPrompt {
                dockerfile: "FROM x",
                skeleton: "#!/bin/bash",
                ..AnalyzerPrompt::default()
            })
            .expect("render");
        assert!(offline.contains("Nothing was executed"));
        assert!(!offline.contains("Test log with the fix applied"));
    }
}
