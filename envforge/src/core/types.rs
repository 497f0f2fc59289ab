//! Shared deterministic types for environment construction.
//!
//! These types define stable contracts between the workflow, the harness and
//! the result memory. They carry no I/O handles and serialize to the on-disk
//! records written under a task's output directory.

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One code change to build an environment for. Immutable for a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskSpec {
    #[serde(alias = "instance_id")]
    pub id: String,
    pub repo: String,
    #[serde(alias = "commit")]
    pub base_commit: String,
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub language: String,
    /// Reference fix applied in the post-patch phase.
    #[serde(default)]
    pub patch: String,
    #[serde(default)]
    pub test_patch: String,
    #[serde(default)]
    pub problem_statement: String,
    #[serde(default)]
    pub base_image: Option<String>,
    #[serde(default)]
    pub pull_number: Option<u64>,
    /// Unrecognized task metadata, kept so memory records stay complete.
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

/// Closed set of generation stages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageRole {
    ContextCollector,
    DockerfileWriter,
    TestWriter,
    EvalScriptWriter,
    Analyzer,
}

impl StageRole {
    /// Stages the analyzer may send guidance to, in routing order.
    pub const GUIDABLE: [StageRole; 4] = [
        StageRole::ContextCollector,
        StageRole::DockerfileWriter,
        StageRole::TestWriter,
        StageRole::EvalScriptWriter,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            StageRole::ContextCollector => "context_collector",
            StageRole::DockerfileWriter => "dockerfile_writer",
            StageRole::TestWriter => "test_writer",
            StageRole::EvalScriptWriter => "eval_script_writer",
            StageRole::Analyzer => "analyzer",
        }
    }

    /// Key carrying guidance for this stage in the analyzer's JSON verdict.
    pub fn guidance_key(self) -> String {
        format!("guidance_for_{}", self.as_str())
    }
}

impl fmt::Display for StageRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Fail-to-pass classification of a dual test run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum F2pClass {
    #[serde(rename = "FAIL2PASS")]
    Fail2Pass,
    #[serde(rename = "PASS2PASS")]
    Pass2Pass,
    #[serde(rename = "FAIL2FAIL")]
    Fail2Fail,
    #[serde(rename = "PASS2FAIL")]
    Pass2Fail,
    #[serde(rename = "ERROR")]
    Error,
}

impl F2pClass {
    pub fn as_str(self) -> &'static str {
        match self {
            F2pClass::Fail2Pass => "FAIL2PASS",
            F2pClass::Pass2Pass => "PASS2PASS",
            F2pClass::Fail2Fail => "FAIL2FAIL",
            F2pClass::Pass2Fail => "PASS2FAIL",
            F2pClass::Error => "ERROR",
        }
    }
}

impl fmt::Display for F2pClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of one harness invocation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestRunRecord {
    pub pre_exit_code: Option<i32>,
    pub post_exit_code: Option<i32>,
    pub classification: F2pClass,
    pub pre_log: Option<PathBuf>,
    pub post_log: Option<PathBuf>,
    /// The eval script changed the working tree after the patch was applied.
    pub source_mutated: bool,
}

/// Structured decision produced by the analyzer stage.
///
/// When `is_finish` is false at least one guidance entry is non-empty, except
/// for the inconclusive verdict used after a parse failure.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnalysisVerdict {
    pub is_finish: bool,
    pub guidance: BTreeMap<StageRole, String>,
}

impl AnalysisVerdict {
    pub fn inconclusive() -> Self {
        Self::default()
    }

    pub fn guidance_for(&self, role: StageRole) -> Option<&str> {
        self.guidance
            .get(&role)
            .map(String::as_str)
            .filter(|text| !text.trim().is_empty())
    }
}

/// How a run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunOutcome {
    Finished,
    /// Iteration budget spent without a finishing verdict.
    Exhausted,
    /// Hard infrastructure error.
    Aborted,
}

/// `status.json` written for every run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusRecord {
    pub is_finish: bool,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub f2p_classification: Option<F2pClass>,
    pub outcome: RunOutcome,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub error: Option<String>,
}

/// Successful task artifacts kept for seeding later runs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryRecord {
    pub task: TaskSpec,
    pub dockerfile: String,
    pub eval_script: String,
    pub eval_script_skeleton: String,
}

/// A test patch and the paths it touches.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TestPatch {
    pub text: String,
    pub files: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    System,
    User,
    Assistant,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub role: MessageRole,
    pub content: String,
}

/// Ordered message history handed to a generator.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Conversation {
    pub messages: Vec<Message>,
}

impl Conversation {
    pub fn with_system(content: impl Into<String>) -> Self {
        let mut conversation = Self::default();
        conversation.push(MessageRole::System, content);
        conversation
    }

    pub fn push(&mut self, role: MessageRole, content: impl Into<String>) {
        self.messages.push(Message {
            role,
            content: content.into(),
        });
    }

    pub fn user(&mut self, content: impl Into<String>) {
        self.push(MessageRole::User, content);
    }

    pub fn assistant(&mut self, content: impl Into<String>) {
        self.push(MessageRole::Assistant, content);
    }

    pub fn last_user(&self) -> Option<&str> {
        self.messages
            .iter()
            .rev()
            .find(|message| message.role == MessageRole::User)
            .map(|message| message.content.as_str())
    }

    /// Flatten into a single prompt for text-in/text-out generators.
    pub fn render(&self) -> String {
        let mut out = String::new();
        for message in &self.messages {
            let label = match message.role {
                MessageRole::System => "SYSTEM",
                MessageRole::User => "USER",
                MessageRole::Assistant => "ASSISTANT",
            };
            out.push_str("### ");
            out.push_str(label);
            out.push('\n');
            out.push_str(message.content.trim_end());
            out.push_str("\n\n");
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn task_spec_accepts_dataset_aliases_and_keeps_extras() {
        let raw = r#"{
            "instance_id": "acme__widget-12",
            "repo": "acme/widget",
            "commit": "abc123",
            "version": "2.3",
            "created_at": "2024-01-01"
        }"#;
        let task: TaskSpec = serde_json::from_str(raw).expect("parse task");
        assert_eq!(task.id, "acme__widget-12");
        assert_eq!(task.base_commit, "abc123");
        assert!(task.test_patch.is_empty());
        assert_eq!(
            task.extra.get("created_at"),
            Some(&Value::String("2024-01-01".to_string()))
        );
    }

    #[test]
    fn classification_serializes_in_upper_case() {
        let json = serde_json::to_string(&F2pClass::Fail2Pass).expect("json");
        assert_eq!(json, "\"FAIL2PASS\"");
    }

    #[test]
    fn guidance_for_ignores_blank_entries() {
        let mut verdict = AnalysisVerdict::default();
        verdict
            .guidance
            .insert(StageRole::DockerfileWriter, "  ".to_string());
        assert_eq!(verdict.guidance_for(StageRole::DockerfileWriter), None);
    }

    #[test]
    fn conversation_renders_roles_in_order() {
        let mut conversation = Conversation::with_system("be brief");
        conversation.user("hello");
        conversation.assistant("hi");
        let rendered = conversation.render();
        let system = rendered.find("### SYSTEM").expect("system");
        let user = rendered.find("### USER").expect("user");
        let assistant = rendered.find("### ASSISTANT").expect("assistant");
        assert!(system < user && user < assistant);
    }
}
