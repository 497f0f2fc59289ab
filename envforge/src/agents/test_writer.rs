//! Test writer: generates fail-to-pass tests when the task ships too few.
//!
//! After a patch is extracted it goes through up to
//! `config.test_reflexion_rounds` critique/refine rounds. A critique
//! containing [`APPROVED_MARKER`] ends the loop early.

use std::path::Path;

use anyhow::Result;
use tracing::{debug, info, instrument, warn};

use crate::core::diff::{summarize_large_patch, test_file_paths};
use crate::core::extract::extract_test_patch;
use crate::core::types::TestPatch;
use crate::io::prompt::TestWriterPrompt;
use crate::io::task_output::write_text;

use super::{AgentState, StageContext, accept, generate_with_retry};

pub const APPROVED_MARKER: &str = "TESTS_APPROVED";
pub const TEST_PATCH_FILE: &str = "test_patch.diff";
const PATCH_SUMMARY_CHARS: usize = 15_000;
const PATCH_SUMMARY_LINES_PER_HUNK: usize = 30;

pub struct TestWriter {
    pub state: AgentState,
    pub context: Option<String>,
    latest: Option<TestPatch>,
}

impl TestWriter {
    pub fn new(state: AgentState) -> Self {
        Self {
            state,
            context: None,
            latest: None,
        }
    }

    pub fn latest(&self) -> Option<&TestPatch> {
        self.latest.as_ref()
    }

    #[instrument(skip_all, fields(attempt = self.state.iteration + 1))]
    pub fn run(&mut self, ctx: &StageContext<'_>) -> Result<TestPatch> {
        let dir = self.state.begin_attempt(ctx.output)?;
        let guidance = self.state.take_guidance();
        let fix = summarize_large_patch(&ctx.task.patch, PATCH_SUMMARY_CHARS, PATCH_SUMMARY_LINES_PER_HUNK);
        let existing_files = test_file_paths(&ctx.task.test_patch);
        let previous = self.latest.as_ref().map(|patch| patch.text.clone());
        let prompt = ctx.prompts.test_writer(
            ctx.task,
            &TestWriterPrompt {
                patch: &fix,
                existing_files: &existing_files,
                context: self.context.as_deref(),
                previous: previous.as_deref(),
                critique: None,
                guidance: guidance.as_deref(),
            },
        )?;

        let result = generate_with_retry(ctx, &mut self.state, &dir, prompt, extract_test_patch, accept)
            .map(|patch| self.reflect(ctx, &dir, &fix, &existing_files, patch));
        self.state.save_transcript(&dir)?;
        match result {
            Ok(patch) => {
                write_text(&dir.join(TEST_PATCH_FILE), &patch.text)?;
                info!(files = patch.files.len(), "test patch written");
                self.latest = Some(patch.clone());
                Ok(patch)
            }
            Err(err) => {
                if let Some(previous) = &self.latest {
                    warn!("keeping previous test patch");
                    write_text(&dir.join(TEST_PATCH_FILE), &previous.text)?;
                }
                Err(err)
            }
        }
    }

    /// Critique/refine rounds. Any failure inside keeps the best patch so far.
    fn reflect(
        &mut self,
        ctx: &StageContext<'_>,
        dir: &Path,
        fix: &str,
        existing_files: &[String],
        mut patch: TestPatch,
    ) -> TestPatch {
        for round in 0..ctx.config.test_reflexion_rounds {
            let critique = match ctx.prompts.test_writer_review(&patch.text).and_then(|review| {
                self.state.conversation.user(review);
                ctx.generator.generate(&self.state.conversation)
            }) {
                Ok(critique) => critique,
                Err(err) => {
                    warn!(round, err = %err, "critique failed");
                    break;
                }
            };
            if let Err(err) = self.state.save_raw(ctx.output, dir, &critique) {
                warn!(round, err = %err, "failed to save critique");
            }
            self.state.conversation.assistant(critique.as_str());
            if critique.contains(APPROVED_MARKER) {
                debug!(round, "test patch approved");
                break;
            }
            let refine = ctx.prompts.test_writer(
                ctx.task,
                &TestWriterPrompt {
                    patch: fix,
                    existing_files,
                    context: self.context.as_deref(),
                    previous: Some(patch.text.as_str()),
                    critique: Some(critique.as_str()),
                    guidance: None,
                },
            );
            let refined = refine.and_then(|prompt| {
                generate_with_retry(ctx, &mut self.state, dir, prompt, extract_test_patch, accept)
            });
            match refined {
                Ok(next) => patch = next,
                Err(err) => {
                    warn!(round, err = %err, "refine failed, keeping previous patch");
                    break;
                }
            }
        }
        patch
    }
}
