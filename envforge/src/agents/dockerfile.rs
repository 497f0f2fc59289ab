//! Dockerfile writer.

use std::path::Path;

use anyhow::Result;
use tracing::{info, instrument, warn};

use crate::core::extract::extract_dockerfile;
use crate::io::prompt::DockerfilePrompt;
use crate::io::task_output::{DOCKERFILE, write_text};

use super::{AgentState, StageContext, accept, generate_with_retry};

pub struct DockerfileWriter {
    pub state: AgentState,
    pub context: Option<String>,
    /// Dockerfile of the closest prior success; advisory only.
    pub reference: Option<String>,
    latest: Option<String>,
}

impl DockerfileWriter {
    pub fn new(state: AgentState) -> Self {
        Self {
            state,
            context: None,
            reference: None,
            latest: None,
        }
    }

    pub fn latest(&self) -> Option<&str> {
        self.latest.as_deref()
    }

    #[instrument(skip_all, fields(attempt = self.state.iteration + 1))]
    pub fn run(&mut self, ctx: &StageContext<'_>) -> Result<String> {
        let dir = self.state.begin_attempt(ctx.output)?;
        let guidance = self.state.take_guidance();
        let prompt = ctx.prompts.dockerfile_writer(
            ctx.task,
            &DockerfilePrompt {
                context: self.context.as_deref(),
                reference: self.reference.as_deref(),
                previous: self.latest.as_deref(),
                guidance: guidance.as_deref(),
            },
        )?;
        let result = generate_with_retry(ctx, &mut self.state, &dir, prompt, extract_dockerfile, accept);
        self.state.save_transcript(&dir)?;
        match result {
            Ok(dockerfile) => {
                write_text(&dir.join(DOCKERFILE), &dockerfile)?;
                info!(bytes = dockerfile.len(), "dockerfile written");
                self.latest = Some(dockerfile.clone());
                Ok(dockerfile)
            }
            Err(err) => {
                self.carry_forward(&dir)?;
                Err(err)
            }
        }
    }

    fn carry_forward(&self, dir: &Path) -> Result<()> {
        if let Some(previous) = &self.latest {
            warn!("keeping previous dockerfile");
            write_text(&dir.join(DOCKERFILE), previous)?;
        }
        Ok(())
    }
}
