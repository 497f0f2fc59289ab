//! Workflow orchestrator for one task.
//!
//! Drives the stages through a bounded number of iterations. Each iteration
//! runs whatever stages are incomplete and unblocked, then the analyzer, and
//! routes the analyzer's guidance back to the stages it names.

use std::path::Path;

use anyhow::Result;
use chrono::Utc;
use tracing::{error, info, instrument, warn};

use crate::agents::analyzer::{Analyzer, AnalyzerInput};
use crate::agents::context::ContextCollector;
use crate::agents::dockerfile::DockerfileWriter;
use crate::agents::eval_script::EvalScriptWriter;
use crate::agents::test_writer::TestWriter;
use crate::agents::{AgentState, StageContext};
use crate::core::diff::needs_test_generation;
use crate::core::types::{
    AnalysisVerdict, MemoryRecord, RunOutcome, StageRole, StatusRecord, TaskSpec, TestRunRecord,
};
use crate::io::config::ForgeConfig;
use crate::io::container::ContainerRuntime;
use crate::io::generator::Generator;
use crate::io::harness::{EvaluationHarness, HarnessSettings};
use crate::io::memory::MemoryStore;
use crate::io::prompt::PromptEngine;
use crate::io::remote::{ResourceProbe, resolve_binary_resource_commands};
use crate::io::repo_browser::RepoBrowser;
use crate::io::task_output::{RunMeta, TaskOutput};

/// External collaborators, constructed once per run.
pub struct Collaborators<'a> {
    pub generator: &'a dyn Generator,
    pub memory: &'a dyn MemoryStore,
    pub runtime: &'a dyn ContainerRuntime,
    /// Remote lookup for binary test resources; `None` skips them.
    pub probe: Option<&'a dyn ResourceProbe>,
    /// Local checkout the context collector may browse.
    pub browser: Option<&'a RepoBrowser>,
}

/// How a run ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkflowReport {
    pub status: StatusRecord,
    pub iterations: u32,
}

/// Read-only run state shared by every stage.
struct RunEnv<'a> {
    task: TaskSpec,
    config: ForgeConfig,
    generator: &'a dyn Generator,
    prompts: PromptEngine,
    output: TaskOutput,
}

impl RunEnv<'_> {
    fn ctx(&self) -> StageContext<'_> {
        StageContext {
            task: &self.task,
            config: &self.config,
            generator: self.generator,
            prompts: &self.prompts,
            output: &self.output,
        }
    }

    fn agent_state(&self, role: StageRole) -> Result<AgentState> {
        Ok(AgentState::new(role, self.prompts.system(role, &self.task)?))
    }
}

struct Stages {
    context: ContextCollector,
    dockerfile: DockerfileWriter,
    /// Present only when tests must be generated.
    test_writer: Option<TestWriter>,
    eval_script: EvalScriptWriter,
    analyzer: Analyzer,
}

pub struct Workflow<'a> {
    env: RunEnv<'a>,
    stages: Stages,
    memory: &'a dyn MemoryStore,
    probe: Option<&'a dyn ResourceProbe>,
    browser: Option<&'a RepoBrowser>,
    harness: Option<EvaluationHarness<'a>>,
    needs_test_generation: bool,
    last_run: Option<TestRunRecord>,
}

impl<'a> Workflow<'a> {
    pub fn new(
        task: TaskSpec,
        config: ForgeConfig,
        deps: Collaborators<'a>,
        output_dir: &Path,
        github_token: Option<String>,
    ) -> Result<Self> {
        config.validate()?;
        let env = RunEnv {
            output: TaskOutput::create(output_dir)?,
            prompts: PromptEngine::new(),
            generator: deps.generator,
            task,
            config,
        };
        let needs_tests = needs_test_generation(&env.task.test_patch);
        let stages = Stages {
            context: ContextCollector::new(env.agent_state(StageRole::ContextCollector)?),
            dockerfile: DockerfileWriter::new(env.agent_state(StageRole::DockerfileWriter)?),
            test_writer: if needs_tests {
                Some(TestWriter::new(env.agent_state(StageRole::TestWriter)?))
            } else {
                None
            },
            eval_script: EvalScriptWriter::new(
                env.agent_state(StageRole::EvalScriptWriter)?,
                &env.task.base_commit,
                &env.task.test_patch,
            ),
            analyzer: Analyzer::new(env.agent_state(StageRole::Analyzer)?),
        };
        let harness = env.config.live_execution().then(|| {
            EvaluationHarness::new(
                deps.runtime,
                &env.task.id,
                HarnessSettings {
                    eval_timeout: env.config.eval_timeout(),
                    build_timeout: env.config.build_timeout(),
                    log_max_lines: env.config.log_max_lines,
                    github_token,
                },
            )
        });
        Ok(Self {
            env,
            stages,
            memory: deps.memory,
            probe: deps.probe,
            browser: deps.browser,
            harness,
            needs_test_generation: needs_tests,
            last_run: None,
        })
    }

    pub fn needs_test_generation(&self) -> bool {
        self.needs_test_generation
    }

    /// Run to completion. Every outcome, including an abort, is recorded in
    /// `status.json`; only a hard error while writing it is returned.
    #[instrument(skip_all, fields(task_id = %self.env.task.id))]
    pub fn run(mut self) -> Result<WorkflowReport> {
        let started_at = Utc::now();
        let mut iterations = 0;
        let result = self.prepare().and_then(|()| self.drive(&mut iterations));
        let (outcome, error) = match result {
            Ok(true) => (RunOutcome::Finished, None),
            Ok(false) => {
                warn!(iterations, "iteration budget spent without a finishing verdict");
                (RunOutcome::Exhausted, None)
            }
            Err(err) => {
                error!(err = %format!("{err:#}"), "run aborted");
                (RunOutcome::Aborted, Some(format!("{err:#}")))
            }
        };
        let status = self.finalize(outcome, error)?;
        self.env.output.write_run_meta(&RunMeta::new(
            &self.env.task.id,
            started_at,
            Utc::now(),
            iterations,
            status.outcome,
        ))?;
        info!(outcome = ?status.outcome, iterations, "run complete");
        Ok(WorkflowReport { status, iterations })
    }

    fn prepare(&mut self) -> Result<()> {
        self.memory.ensure()?;
        if self.env.config.disable_download_test_resources {
            return Ok(());
        }
        let (Some(pull_number), Some(probe)) = (self.env.task.pull_number, self.probe) else {
            return Ok(());
        };
        match resolve_binary_resource_commands(&self.env.task.test_patch, &self.env.task.repo, pull_number, probe) {
            Ok((commands, stripped)) if !commands.is_empty() => {
                info!(commands = commands.len(), "binary test resources will be downloaded");
                self.stages.eval_script.set_binary_resources(commands, stripped);
            }
            Ok(_) => {}
            Err(err) => warn!(err = %format!("{err:#}"), "could not resolve binary test resources"),
        }
        Ok(())
    }

    /// Returns whether the analyzer accepted the environment.
    fn drive(&mut self, iterations: &mut u32) -> Result<bool> {
        for iteration in 1..=self.env.config.max_iterations {
            *iterations = iteration;
            info!(iteration, "iteration started");
            if self.iterate()? {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// One pass over the stages. Stage failures leave the stage incomplete
    /// for the next pass; only analyzer infrastructure errors are returned.
    fn iterate(&mut self) -> Result<bool> {
        let ctx = self.env.ctx();
        let stages = &mut self.stages;

        if !stages.context.state.completed {
            match stages.context.run(&ctx, self.browser) {
                Ok(report) => {
                    stages.context.state.completed = true;
                    stages.broadcast_context(&report);
                }
                Err(err) => stage_failed(StageRole::ContextCollector, &err),
            }
        }
        let context_done = stages.context.state.completed;

        if self.needs_test_generation
            && context_done
            && let Some(writer) = stages.test_writer.as_mut()
            && !writer.state.completed
        {
            match writer.run(&ctx) {
                Ok(patch) => {
                    writer.state.completed = true;
                    stages.eval_script.set_generated_tests(&patch);
                    stages.eval_script.state.completed = false;
                }
                Err(err) => stage_failed(StageRole::TestWriter, &err),
            }
        }
        let tests_ready = !self.needs_test_generation
            || stages.test_writer.as_ref().is_some_and(|writer| writer.state.completed);

        if !self.env.config.disable_memory_pool {
            match self.memory.closest(&ctx.task.repo, &ctx.task.version) {
                Ok(Some(record)) => {
                    info!(version = %record.task.version, "attaching closest prior environment");
                    stages.dockerfile.reference = Some(record.dockerfile);
                    stages.eval_script.reference = Some(record.eval_script);
                }
                Ok(None) => {}
                Err(err) => warn!(err = %format!("{err:#}"), "memory lookup failed"),
            }
        }

        if context_done && !stages.dockerfile.state.completed {
            match stages.dockerfile.run(&ctx) {
                Ok(_) => stages.dockerfile.state.completed = true,
                Err(err) => stage_failed(StageRole::DockerfileWriter, &err),
            }
        }
        let dockerfile_done = stages.dockerfile.state.completed;

        if context_done && dockerfile_done && tests_ready && !stages.eval_script.state.completed {
            stages.eval_script.dockerfile = stages.dockerfile.latest().unwrap_or_default().to_string();
            match stages.eval_script.run(&ctx) {
                Ok(_) => stages.eval_script.state.completed = true,
                Err(err) => stage_failed(StageRole::EvalScriptWriter, &err),
            }
        }

        if !(context_done && dockerfile_done && stages.eval_script.state.completed) {
            return Ok(false);
        }
        let (Some(dockerfile), Some(eval)) = (stages.dockerfile.latest(), stages.eval_script.latest()) else {
            return Ok(false);
        };
        let test_files = stages.eval_script.test_files();
        let input = AnalyzerInput {
            dockerfile,
            eval,
            test_files: &test_files,
        };
        let outcome = stages.analyzer.run(&ctx, self.harness.as_mut(), &input)?;
        if let Some(run) = outcome.run {
            self.last_run = Some(run);
        }
        if outcome.verdict.is_finish {
            info!("analyzer accepted the environment");
            return Ok(true);
        }
        let enable_tests = stages.route_guidance(&self.env, &outcome.verdict)?;
        if enable_tests {
            self.needs_test_generation = true;
        }
        Ok(false)
    }

    fn finalize(&self, outcome: RunOutcome, mut error: Option<String>) -> Result<StatusRecord> {
        let dockerfile = self.stages.dockerfile.latest();
        let eval = self.stages.eval_script.latest();
        if let (Some(dockerfile), Some(eval)) = (dockerfile, eval) {
            self.env.output.write_final_artifacts(dockerfile, &eval.script)?;
        }

        let is_finish = outcome == RunOutcome::Finished;
        if is_finish
            && let (Some(dockerfile), Some(eval)) = (dockerfile, eval)
        {
            let mut task = self.env.task.clone();
            task.test_patch = self.stages.eval_script.merged_patch();
            let record = MemoryRecord {
                task,
                dockerfile: dockerfile.to_string(),
                eval_script: eval.script.clone(),
                eval_script_skeleton: eval.skeleton.clone(),
            };
            if let Err(err) = self.memory.append(record) {
                error!(err = %format!("{err:#}"), "failed to record success in memory");
                error = Some(format!("memory append failed: {err:#}"));
            }
        }

        let status = StatusRecord {
            is_finish,
            f2p_classification: self.last_run.as_ref().map(|run| run.classification),
            outcome,
            error,
        };
        self.env.output.write_status(&status)?;
        Ok(status)
    }
}

impl Stages {
    fn broadcast_context(&mut self, report: &str) {
        self.dockerfile.context = Some(report.to_string());
        self.eval_script.context = Some(report.to_string());
        if let Some(writer) = self.test_writer.as_mut() {
            writer.context = Some(report.to_string());
        }
    }

    /// Queue every non-empty guidance entry on its stage. Returns whether
    /// test generation was switched on by guidance for a missing test writer.
    fn route_guidance(&mut self, env: &RunEnv<'_>, verdict: &AnalysisVerdict) -> Result<bool> {
        let mut enable_tests = false;
        for role in StageRole::GUIDABLE {
            let Some(text) = verdict.guidance_for(role) else {
                continue;
            };
            info!(stage = %role, "routing guidance");
            match role {
                StageRole::ContextCollector => self.context.state.add_guidance(text),
                StageRole::DockerfileWriter => self.dockerfile.state.add_guidance(text),
                StageRole::TestWriter => {
                    if self.test_writer.is_none() {
                        let mut writer = TestWriter::new(env.agent_state(StageRole::TestWriter)?);
                        writer.context = self.context.report.clone();
                        self.test_writer = Some(writer);
                        enable_tests = true;
                    }
                    if let Some(writer) = self.test_writer.as_mut() {
                        writer.state.add_guidance(text);
                    }
                    self.eval_script.state.completed = false;
                }
                StageRole::EvalScriptWriter => self.eval_script.state.add_guidance(text),
                StageRole::Analyzer => {}
            }
        }
        Ok(enable_tests)
    }
}

fn stage_failed(role: StageRole, err: &anyhow::Error) {
    warn!(stage = %role, err = %format!("{err:#}"), "stage failed, will retry next iteration");
}
