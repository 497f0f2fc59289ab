//! Analyzer: runs the artifacts through the harness and turns the evidence
//! into a verdict.
//!
//! Build failures, patch failures and timeouts become evidence in the
//! prompt. Any other harness error is returned to the caller, which aborts.

use std::path::Path;

use anyhow::Result;
use tracing::{info, instrument, warn};

use crate::core::classifier::describe;
use crate::core::log_window::number_and_window;
use crate::core::types::{AnalysisVerdict, Conversation, TestRunRecord};
use crate::core::verdict::{parse_verdict, validate_finish};
use crate::error::{ForgeError, find_forge_error};
use crate::io::harness::EvaluationHarness;
use crate::io::prompt::AnalyzerPrompt;
use crate::io::task_output::{TEST_RUN, read_optional, write_json};

use super::eval_script::EvalScript;
use super::{AgentState, StageContext, generate_with_retry};

pub const VERDICT_FILE: &str = "verdict.json";

/// Artifacts under analysis.
#[derive(Debug, Clone, Copy)]
pub struct AnalyzerInput<'a> {
    pub dockerfile: &'a str,
    pub eval: &'a EvalScript,
    pub test_files: &'a [String],
}

#[derive(Debug, Clone)]
pub struct AnalysisOutcome {
    pub verdict: AnalysisVerdict,
    pub run: Option<TestRunRecord>,
}

#[derive(Debug, Default)]
struct Evidence {
    run: Option<TestRunRecord>,
    build_log: Option<String>,
    harness_error: Option<String>,
    pre_log: Option<String>,
    post_log: Option<String>,
}

pub struct Analyzer {
    pub state: AgentState,
    system_prompt: String,
}

impl Analyzer {
    pub fn new(state: AgentState) -> Self {
        let system_prompt = state
            .conversation
            .messages
            .first()
            .map(|message| message.content.clone())
            .unwrap_or_default();
        Self {
            state,
            system_prompt,
        }
    }

    /// Analyze one set of artifacts. `harness` is `None` when live execution
    /// is disabled; the verdict is then produced from the artifacts alone.
    #[instrument(skip_all, fields(attempt = self.state.iteration + 1, live = harness.is_some()))]
    pub fn run(
        &mut self,
        ctx: &StageContext<'_>,
        harness: Option<&mut EvaluationHarness<'_>>,
        input: &AnalyzerInput<'_>,
    ) -> Result<AnalysisOutcome> {
        let dir = self.state.begin_attempt(ctx.output)?;
        let live = harness.is_some();
        let evidence = match harness {
            Some(harness) => gather_evidence(ctx, harness, input, &dir)?,
            None => Evidence::default(),
        };

        let classification = evidence.run.as_ref().map(|run| {
            describe(run.classification, run.pre_exit_code, run.post_exit_code)
        });
        let prompt = ctx.prompts.analyzer(&AnalyzerPrompt {
            live,
            dockerfile: input.dockerfile,
            skeleton: &input.eval.skeleton,
            test_files: input.test_files,
            build_log: evidence.build_log.as_deref(),
            harness_error: evidence.harness_error.as_deref(),
            classification: classification.as_deref(),
            source_mutated: evidence.run.as_ref().is_some_and(|run| run.source_mutated),
            pre_log: evidence.pre_log.as_deref(),
            post_log: evidence.post_log.as_deref(),
        })?;

        // Each analysis judges one run; earlier runs would only mislead it.
        self.state.conversation = Conversation::with_system(self.system_prompt.clone());
        let class = evidence.run.as_ref().map(|run| run.classification);
        let verdict = match generate_with_retry(ctx, &mut self.state, &dir, prompt, parse_verdict, |verdict| {
            validate_finish(verdict, class, live)
        }) {
            Ok(verdict) => verdict,
            Err(err) => {
                warn!(err = %err, "no usable verdict, treating as inconclusive");
                AnalysisVerdict::inconclusive()
            }
        };
        self.state.save_transcript(&dir)?;
        write_json(&dir.join(VERDICT_FILE), &verdict)?;
        info!(is_finish = verdict.is_finish, guided = verdict.guidance.len(), "analysis done");
        Ok(AnalysisOutcome {
            verdict,
            run: evidence.run,
        })
    }
}

fn gather_evidence(
    ctx: &StageContext<'_>,
    harness: &mut EvaluationHarness<'_>,
    input: &AnalyzerInput<'_>,
    dir: &Path,
) -> Result<Evidence> {
    let image = match harness.build_image(input.dockerfile, dir) {
        Ok(image) => image,
        Err(err) => return harness_feedback(err),
    };
    let run = match harness.run_f2p(
        &image,
        &input.eval.script,
        &ctx.task.patch,
        &ctx.task.base_commit,
        dir,
    ) {
        Ok(run) => run,
        Err(err) => return harness_feedback(err),
    };
    write_json(&dir.join(TEST_RUN), &run)?;

    let window = |path: Option<&Path>| -> Result<Option<String>> {
        let Some(path) = path else { return Ok(None) };
        Ok(read_optional(path)?.map(|text| number_and_window(&text, ctx.config.log_max_lines)))
    };
    Ok(Evidence {
        pre_log: window(run.pre_log.as_deref())?,
        post_log: window(run.post_log.as_deref())?,
        run: Some(run),
        ..Evidence::default()
    })
}

/// Turn a recoverable harness failure into prompt evidence; pass anything
/// else through.
fn harness_feedback(err: anyhow::Error) -> Result<Evidence> {
    match find_forge_error(&err) {
        Some(ForgeError::Build { log }) => {
            warn!("image build failed, reporting to analyzer");
            Ok(Evidence {
                build_log: Some(log.clone()),
                ..Evidence::default()
            })
        }
        Some(forge) if forge.is_harness_feedback() => {
            warn!(err = %forge, "test run failed, reporting to analyzer");
            Ok(Evidence {
                harness_error: Some(forge.to_string()),
                ..Evidence::default()
            })
        }
        _ => Err(err),
    }
}
