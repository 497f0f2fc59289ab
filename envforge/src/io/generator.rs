//! Text generation backend.
//!
//! The [`Generator`] trait decouples stages from the model backend. The
//! shipped [`CommandGenerator`] pipes the rendered conversation into an external
//! command (for example `codex exec -`) and returns its stdout. Tests use
//! scripted generators that return predetermined replies.

use std::process::Command;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use tracing::{debug, info, instrument, warn};

use crate::core::types::Conversation;
use crate::error::ForgeError;
use crate::io::process::run_command_with_timeout;

pub trait Generator {
    /// Produce the next assistant reply for `conversation`.
    fn generate(&self, conversation: &Conversation) -> Result<String>;
}

#[derive(Debug, Clone)]
pub struct CommandGenerator {
    program: String,
    args: Vec<String>,
    timeout: Duration,
    output_limit_bytes: usize,
}

impl CommandGenerator {
    pub fn new(command: &[String], timeout: Duration, output_limit_bytes: usize) -> Result<Self> {
        let (program, args) = command
            .split_first()
            .ok_or_else(|| anyhow!("generator command is empty"))?;
        Ok(Self {
            program: program.clone(),
            args: args.to_vec(),
            timeout,
            output_limit_bytes,
        })
    }
}

impl Generator for CommandGenerator {
    #[instrument(skip_all, fields(program = %self.program, messages = conversation.messages.len()))]
    fn generate(&self, conversation: &Conversation) -> Result<String> {
        let prompt = conversation.render();
        info!(prompt_bytes = prompt.len(), "invoking generator");
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args);
        let output = run_command_with_timeout(
            cmd,
            Some(prompt.as_bytes()),
            self.timeout,
            self.output_limit_bytes,
        )
        .with_context(|| format!("run generator {}", self.program))?;

        if output.timed_out {
            warn!(timeout_secs = self.timeout.as_secs(), "generator timed out");
            return Err(ForgeError::timeout(format!("generator {}", self.program), self.timeout).into());
        }
        if !output.status.success() {
            warn!(exit_code = ?output.status.code(), "generator failed");
            return Err(anyhow!(
                "generator {} failed with status {:?}: {}",
                self.program,
                output.status.code(),
                String::from_utf8_lossy(&output.stderr).trim()
            ));
        }
        let reply = output.stdout_lossy();
        debug!(reply_bytes = reply.len(), "generator replied");
        Ok(reply)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sh(script: &str) -> Vec<String> {
        vec!["sh".to_string(), "-c".to_string(), script.to_string()]
    }

    #[test]
    fn pipes_rendered_conversation_to_stdin() {
        let generator = CommandGenerator::new(&sh("cat"), Duration::from_secs(10), 10_000).expect("new");
        let mut conversation = Conversation::with_system("be terse");
        conversation.user("write a Dockerfile");
        let reply = generator.generate(&conversation).expect("generate");
        assert!(reply.contains("### SYSTEM\nbe terse"));
        assert!(reply.contains("### USER\nwrite a Dockerfile"));
    }

    #[test]
    fn non_zero_exit_is_an_error() {
        let generator =
            CommandGenerator::new(&sh("cat >/dev/null; echo boom >&2; exit 2"), Duration::from_secs(10), 1000)
                .expect("new");
        let err = generator.generate(&Conversation::default()).unwrap_err();
        assert!(err.to_string().contains("boom"));
    }

    #[test]
    fn timeout_maps_to_forge_error() {
        let generator = CommandGenerator::new(&sh("exec sleep 5"), Duration::from_millis(100), 1000)
            .expect("new");
        let err = generator.generate(&Conversation::default()).unwrap_err();
        assert!(matches!(err.downcast_ref::<ForgeError>(), Some(ForgeError::Timeout { .. })));
    }

    #[test]
    fn empty_command_is_rejected() {
        assert!(CommandGenerator::new(&[], Duration::from_secs(1), 10).is_err());
    }
}
