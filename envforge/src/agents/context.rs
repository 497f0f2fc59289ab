//! Context collector: explores the checkout and reports how to build and
//! test the repository.

use anyhow::{Result, anyhow};
use serde::Deserialize;
use tracing::{info, instrument, warn};

use crate::core::api_call::parse_api_call;
use crate::core::extract::{ANALYSIS_WRAPPERS, extract_json, extract_wrapped};
use crate::error::ForgeError;
use crate::io::repo_browser::RepoBrowser;
use crate::io::task_output::write_text;

use super::{AgentState, StageContext, accept, generate_with_retry};

pub const CONTEXT_REPORT: &str = "context.md";

/// One collector reply.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct CollectorReply {
    #[serde(rename = "API_calls", alias = "api_calls", default)]
    pub api_calls: Vec<String>,
    #[serde(default)]
    pub collected_information: String,
    #[serde(default)]
    pub terminate: bool,
}

/// Collector replies are JSON; a bare `<analysis>` report is taken as final.
pub fn parse_collector_reply(text: &str) -> Result<CollectorReply, ForgeError> {
    if let Ok(value) = extract_json(text) {
        return serde_json::from_value(value)
            .map_err(|_| ForgeError::extraction("context collector JSON"));
    }
    extract_wrapped(text, ANALYSIS_WRAPPERS)
        .map(|report| CollectorReply {
            api_calls: Vec::new(),
            collected_information: report.trim().to_string(),
            terminate: true,
        })
        .ok_or_else(|| ForgeError::extraction("context collector JSON"))
}

pub struct ContextCollector {
    pub state: AgentState,
    pub report: Option<String>,
}

impl ContextCollector {
    pub fn new(state: AgentState) -> Self {
        Self {
            state,
            report: None,
        }
    }

    /// Run the exploration loop for up to `config.context_rounds` rounds.
    #[instrument(skip_all, fields(attempt = self.state.iteration + 1))]
    pub fn run(&mut self, ctx: &StageContext<'_>, browser: Option<&RepoBrowser>) -> Result<String> {
        let dir = self.state.begin_attempt(ctx.output)?;
        let rounds = ctx.config.context_rounds.max(1);
        let guidance = self.state.take_guidance();
        let mut prompt = ctx
            .prompts
            .context_collector(ctx.task, rounds, guidance.as_deref())?;
        let mut collected = String::new();

        let result = (|| -> Result<String> {
            for round in 0..rounds {
                let reply = generate_with_retry(
                    ctx,
                    &mut self.state,
                    &dir,
                    std::mem::take(&mut prompt),
                    parse_collector_reply,
                    accept,
                )?;
                if !reply.collected_information.trim().is_empty() {
                    collected = reply.collected_information.trim().to_string();
                }
                let rounds_left = rounds - round - 1;
                if reply.terminate || reply.api_calls.is_empty() || rounds_left == 0 {
                    break;
                }
                prompt = run_calls(browser, &reply.api_calls, rounds_left);
            }
            if collected.is_empty() {
                return Err(ForgeError::extraction("collected_information").into());
            }
            Ok(collected.clone())
        })();

        self.state.save_transcript(&dir)?;
        let report = result?;
        write_text(&dir.join(CONTEXT_REPORT), &report)?;
        info!(bytes = report.len(), "context collected");
        self.report = Some(report.clone());
        Ok(report)
    }
}

fn run_calls(browser: Option<&RepoBrowser>, calls: &[String], rounds_left: u32) -> String {
    let mut out = String::new();
    for raw in calls {
        let result = parse_api_call(raw)
            .map_err(|msg| anyhow!(msg))
            .and_then(|call| match browser {
                Some(browser) => browser.execute(&call),
                None => Err(anyhow!("no repository checkout is available")),
            });
        match result {
            Ok(text) => out.push_str(&format!("Result of `{raw}`:\n{text}\n\n")),
            Err(err) => {
                warn!(call = %raw, err = %err, "api call rejected");
                out.push_str(&format!("Call `{raw}` failed: {err}\n\n"));
            }
        }
    }
    out.push_str(&format!(
        "{rounds_left} exploration round(s) remain. Reply with the same JSON format."
    ));
    out
}
