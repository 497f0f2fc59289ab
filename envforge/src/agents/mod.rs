//! Generation stages driven by the workflow.
//!
//! Every stage owns an [`AgentState`] and produces its artifact through
//! [`generate_with_retry`], which re-prompts with a format reminder until the
//! reply can be parsed or the retry budget is spent.

use std::path::{Path, PathBuf};

use anyhow::Result;
use tracing::{debug, warn};

use crate::core::retry::retry_bounded;
use crate::core::types::{Conversation, StageRole, TaskSpec};
use crate::error::ForgeError;
use crate::io::config::ForgeConfig;
use crate::io::generator::Generator;
use crate::io::prompt::PromptEngine;
use crate::io::task_output::{TRANSCRIPT, TaskOutput, write_text};

pub mod analyzer;
pub mod context;
pub mod dockerfile;
pub mod eval_script;
pub mod test_writer;

/// Run-wide collaborators every stage reads from.
pub struct StageContext<'a> {
    pub task: &'a TaskSpec,
    pub config: &'a ForgeConfig,
    pub generator: &'a dyn Generator,
    pub prompts: &'a PromptEngine,
    pub output: &'a TaskOutput,
}

/// Per-stage bookkeeping.
#[derive(Debug, Clone)]
pub struct AgentState {
    pub role: StageRole,
    pub completed: bool,
    /// Attempts started so far; names the `<stage>_<n>` directories.
    pub iteration: u32,
    pending_guidance: Vec<String>,
    pub conversation: Conversation,
    replies: u32,
}

impl AgentState {
    pub fn new(role: StageRole, system_prompt: String) -> Self {
        Self {
            role,
            completed: false,
            iteration: 0,
            pending_guidance: Vec::new(),
            conversation: Conversation::with_system(system_prompt),
            replies: 0,
        }
    }

    /// Queue analyzer feedback and mark the stage for another run.
    pub fn add_guidance(&mut self, text: &str) {
        self.completed = false;
        self.pending_guidance.push(text.trim().to_string());
    }

    pub fn pending_guidance(&self) -> &[String] {
        &self.pending_guidance
    }

    /// All queued guidance, oldest first. Cleared once taken.
    pub fn take_guidance(&mut self) -> Option<String> {
        if self.pending_guidance.is_empty() {
            return None;
        }
        Some(std::mem::take(&mut self.pending_guidance).join("\n\n"))
    }

    /// Start a new attempt and create its output directory.
    pub fn begin_attempt(&mut self, output: &TaskOutput) -> Result<PathBuf> {
        self.iteration += 1;
        self.replies = 0;
        output.attempt_dir(self.role, self.iteration)
    }

    /// Save a reply obtained outside [`generate_with_retry`] as the next
    /// `<stage>_raw_<i>` file.
    pub fn save_raw(&mut self, output: &TaskOutput, attempt_dir: &Path, reply: &str) -> Result<()> {
        output.write_raw(attempt_dir, self.role, self.replies, reply)?;
        self.replies += 1;
        Ok(())
    }

    pub fn save_transcript(&self, attempt_dir: &Path) -> Result<()> {
        write_text(&attempt_dir.join(TRANSCRIPT), &self.conversation.render())
    }
}

/// Format reminder fed back after a rejected reply.
fn feedback_for(err: &anyhow::Error) -> Option<String> {
    match err.downcast_ref::<ForgeError>()? {
        ForgeError::Extraction { artifact } => Some(format!(
            "Failed to extract {artifact}. Please return result in defined format."
        )),
        ForgeError::VerdictParse { reason } => Some(format!(
            "Your analysis was rejected: {reason}. Please return result in defined format."
        )),
        _ => None,
    }
}

/// Send `prompt`, then parse the reply, re-prompting up to
/// `config.stage_retries` times. Every raw reply is saved under `attempt_dir`.
pub fn generate_with_retry<T>(
    ctx: &StageContext<'_>,
    state: &mut AgentState,
    attempt_dir: &Path,
    prompt: String,
    mut parse: impl FnMut(&str) -> Result<T, ForgeError>,
    mut validate: impl FnMut(&T) -> Result<(), ForgeError>,
) -> Result<T> {
    let role = state.role;
    state.conversation.user(prompt);
    let conversation = &mut state.conversation;
    let replies = &mut state.replies;
    retry_bounded(
        ctx.config.stage_retries,
        |attempt, prev: Option<&anyhow::Error>| {
            if let Some(err) = prev {
                warn!(stage = %role, attempt, err = %err, "retrying generation");
                if let Some(feedback) = feedback_for(err) {
                    conversation.user(feedback);
                }
            }
            let reply = ctx.generator.generate(conversation)?;
            ctx.output.write_raw(attempt_dir, role, *replies, &reply)?;
            *replies += 1;
            conversation.assistant(reply.as_str());
            let parsed = parse(&reply)?;
            debug!(stage = %role, attempt, "reply parsed");
            Ok(parsed)
        },
        |value| validate(value).map_err(anyhow::Error::from),
    )
}

/// Validation that accepts everything.
pub fn accept<T>(_: &T) -> Result<(), ForgeError> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::extract::extract_dockerfile;
    use crate::test_support::{ScriptedGenerator, task};

    #[test]
    fn guidance_accumulates_until_taken() {
        let mut state = AgentState::new(StageRole::DockerfileWriter, "sys".to_string());
        state.completed = true;
        state.add_guidance("pin numpy");
        state.add_guidance(" use python 3.9 ");
        assert!(!state.completed);
        assert_eq!(
            state.take_guidance().as_deref(),
            Some("pin numpy\n\nuse python 3.9")
        );
        assert_eq!(state.take_guidance(), None);
    }

    #[test]
    fn reprompts_with_format_reminder_and_saves_raw_replies() {
        let temp = tempfile::tempdir().expect("tempdir");
        let output = TaskOutput::create(temp.path()).expect("output");
        let generator = ScriptedGenerator::new(vec![
            "I forgot the tags".to_string(),
            "<dockerfile>\nFROM python:3.9\n</dockerfile>".to_string(),
        ]);
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
        let mut state = AgentState::new(StageRole::DockerfileWriter, "sys".to_string());
        let dir = state.begin_attempt(&output).expect("attempt");

        let dockerfile = generate_with_retry(
            &ctx,
            &mut state,
            &dir,
            "write it".to_string(),
            extract_dockerfile,
            accept,
        )
        .expect("dockerfile");
        assert_eq!(dockerfile, "FROM python:3.9\n");
        assert!(dir.join("dockerfile_writer_raw_0").exists());
        assert!(dir.join("dockerfile_writer_raw_1").exists());
        let second_prompt = generator.prompts()[1].clone();
        assert!(second_prompt.contains("Failed to extract dockerfile. Please return result in defined format."));
    }

    #[test]
    fn exhausted_retries_return_last_error() {
        let temp = tempfile::tempdir().expect("tempdir");
        let output = TaskOutput::create(temp.path()).expect("output");
        let generator = ScriptedGenerator::new(vec!["nope".to_string(); 3]);
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
        let mut state = AgentState::new(StageRole::DockerfileWriter, "sys".to_string());
        let dir = state.begin_attempt(&output).expect("attempt");
        let err = generate_with_retry(&ctx, &mut state, &dir, "go".to_string(), extract_dockerfile, accept)
            .unwrap_err();
        assert!(matches!(err.downcast_ref::<ForgeError>(), Some(ForgeError::Extraction { .. })));
        assert_eq!(generator.prompts().len(), 3);
    }
}
