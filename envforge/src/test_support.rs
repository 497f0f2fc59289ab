//! Test-only fakes for the generator, container runtime and memory store,
//! plus deterministic task fixtures.

use std::cell::RefCell;
use std::collections::{BTreeMap, VecDeque};
use std::path::Path;
use std::time::Duration;

use anyhow::{Result, anyhow, bail};

use crate::core::types::{Conversation, MemoryRecord, TaskSpec};
use crate::core::version::closest_record;
use crate::io::container::{BuildEvent, BuildRequest, ContainerRuntime, ExecOutput};
use crate::io::generator::Generator;
use crate::io::memory::MemoryStore;

/// Generator that replays canned replies in order and records every prompt.
#[derive(Debug, Default)]
pub struct ScriptedGenerator {
    replies: RefCell<VecDeque<String>>,
    prompts: RefCell<Vec<String>>,
}

impl ScriptedGenerator {
    pub fn new(replies: Vec<String>) -> Self {
        Self {
            replies: RefCell::new(replies.into()),
            prompts: RefCell::new(Vec::new()),
        }
    }

    /// Rendered conversation of every call so far.
    pub fn prompts(&self) -> Vec<String> {
        self.prompts.borrow().clone()
    }

    pub fn remaining(&self) -> usize {
        self.replies.borrow().len()
    }
}

impl Generator for ScriptedGenerator {
    fn generate(&self, conversation: &Conversation) -> Result<String> {
        self.prompts.borrow_mut().push(conversation.render());
        self.replies
            .borrow_mut()
            .pop_front()
            .ok_or_else(|| anyhow!("scripted generator has no replies left"))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RuntimeCall {
    Build(String),
    RemoveImage(String),
    CreateContainer { image: String, name: String },
    StartContainer(String),
    StopContainer(String),
    RemoveContainer(String),
    Exec(String),
    CopyInto(String),
}

#[derive(Debug, Default)]
struct RuntimeState {
    calls: Vec<RuntimeCall>,
    builds: Vec<BuildRequest>,
    build_failure: Option<(Vec<String>, String)>,
    eval_outputs: VecDeque<String>,
    diff_outputs: VecDeque<String>,
    failing_commands: Vec<String>,
    create_failure: Option<String>,
}

/// In-memory container runtime.
///
/// Builds succeed unless a failure is queued. Eval script runs replay the
/// scripted outputs, then report exit code 0; `git diff` does the same with
/// its own queue, then reports a fixed diff. Every other command succeeds
/// unless it contains a substring registered as failing.
#[derive(Debug, Default)]
pub struct FakeRuntime {
    state: RefCell<RuntimeState>,
}

const EVAL_COMMAND_PREFIX: &str = "/bin/bash ";
const FAKE_DIFF: &str = "diff --git a/src/widget.py b/src/widget.py\n";

impl FakeRuntime {
    pub fn calls(&self) -> Vec<RuntimeCall> {
        self.state.borrow().calls.clone()
    }

    pub fn builds(&self) -> Vec<BuildRequest> {
        self.state.borrow().builds.clone()
    }

    pub fn exec_commands(&self) -> Vec<String> {
        self.state
            .borrow()
            .calls
            .iter()
            .filter_map(|call| match call {
                RuntimeCall::Exec(command) => Some(command.clone()),
                _ => None,
            })
            .collect()
    }

    /// Make the next build emit `lines` followed by a terminal error.
    pub fn fail_next_build(&self, lines: Vec<String>, message: &str) {
        self.state.borrow_mut().build_failure = Some((lines, message.to_string()));
    }

    /// Outputs for successive eval script runs.
    pub fn script_eval_outputs(&self, outputs: Vec<String>) {
        self.state.borrow_mut().eval_outputs.extend(outputs);
    }

    /// Outputs for successive `git diff` calls.
    pub fn script_diff_outputs(&self, outputs: Vec<String>) {
        self.state.borrow_mut().diff_outputs.extend(outputs);
    }

    /// Every later exec whose command contains `needle` exits with 1.
    pub fn fail_commands_containing(&self, needle: &str) {
        self.state.borrow_mut().failing_commands.push(needle.to_string());
    }

    /// Container creation fails as if the runtime were unreachable.
    pub fn fail_container_creation(&self, message: &str) {
        self.state.borrow_mut().create_failure = Some(message.to_string());
    }
}

impl ContainerRuntime for FakeRuntime {
    fn build_image(&self, request: &BuildRequest) -> Result<Vec<BuildEvent>> {
        let mut state = self.state.borrow_mut();
        state.calls.push(RuntimeCall::Build(request.tag.clone()));
        state.builds.push(request.clone());
        if let Some((lines, message)) = state.build_failure.take() {
            let mut events: Vec<BuildEvent> = lines.into_iter().map(BuildEvent::Log).collect();
            events.push(BuildEvent::Error(message));
            return Ok(events);
        }
        Ok(vec![
            BuildEvent::Log("Step 1/1 : FROM scratch".to_string()),
            BuildEvent::Log(format!("Successfully tagged {}", request.tag)),
        ])
    }

    fn remove_image(&self, image: &str) -> Result<()> {
        self.state
            .borrow_mut()
            .calls
            .push(RuntimeCall::RemoveImage(image.to_string()));
        Ok(())
    }

    fn create_container(&self, image: &str, name: &str) -> Result<String> {
        let mut state = self.state.borrow_mut();
        if let Some(message) = &state.create_failure {
            bail!("{message}");
        }
        state.calls.push(RuntimeCall::CreateContainer {
            image: image.to_string(),
            name: name.to_string(),
        });
        Ok(name.to_string())
    }

    fn start_container(&self, container: &str) -> Result<()> {
        self.state
            .borrow_mut()
            .calls
            .push(RuntimeCall::StartContainer(container.to_string()));
        Ok(())
    }

    fn stop_container(&self, container: &str) -> Result<()> {
        self.state
            .borrow_mut()
            .calls
            .push(RuntimeCall::StopContainer(container.to_string()));
        Ok(())
    }

    fn remove_container(&self, container: &str) -> Result<()> {
        self.state
            .borrow_mut()
            .calls
            .push(RuntimeCall::RemoveContainer(container.to_string()));
        Ok(())
    }

    fn exec(&self, _container: &str, command: &str, _workdir: &str, _timeout: Duration) -> Result<ExecOutput> {
        let mut state = self.state.borrow_mut();
        state.calls.push(RuntimeCall::Exec(command.to_string()));
        if state.failing_commands.iter().any(|needle| command.contains(needle.as_str())) {
            return Ok(ExecOutput {
                exit_code: Some(1),
                output: format!("error: `{command}` failed\n"),
                timed_out: false,
            });
        }
        let output = if command.starts_with(EVAL_COMMAND_PREFIX) {
            state
                .eval_outputs
                .pop_front()
                .unwrap_or_else(|| "OMNIGRIL_EXIT_CODE=0\n".to_string())
        } else if command == "git diff" {
            state
                .diff_outputs
                .pop_front()
                .unwrap_or_else(|| FAKE_DIFF.to_string())
        } else {
            String::new()
        };
        Ok(ExecOutput {
            exit_code: Some(0),
            output,
            timed_out: false,
        })
    }

    fn copy_into(&self, _container: &str, _local: &Path, dest: &str) -> Result<()> {
        self.state
            .borrow_mut()
            .calls
            .push(RuntimeCall::CopyInto(dest.to_string()));
        Ok(())
    }
}

/// Memory store backed by a vector.
#[derive(Debug, Default)]
pub struct InMemoryStore {
    records: RefCell<Vec<MemoryRecord>>,
}

impl InMemoryStore {
    pub fn with_records(records: Vec<MemoryRecord>) -> Self {
        Self {
            records: RefCell::new(records),
        }
    }

    pub fn records(&self) -> Vec<MemoryRecord> {
        self.records.borrow().clone()
    }
}

impl MemoryStore for InMemoryStore {
    fn ensure(&self) -> Result<()> {
        Ok(())
    }

    fn closest(&self, repo: &str, version: &str) -> Result<Option<MemoryRecord>> {
        Ok(closest_record(&self.records.borrow(), repo, version).cloned())
    }

    fn append(&self, record: MemoryRecord) -> Result<()> {
        self.records.borrow_mut().push(record);
        Ok(())
    }
}

/// Task for `acme/widget` at 2.3.1 with a one-file test patch.
pub fn task(id: &str) -> TaskSpec {
    TaskSpec {
        id: id.to_string(),
        repo: "acme/widget".to_string(),
        base_commit: "abc123".to_string(),
        version: "2.3.1".to_string(),
        language: "python".to_string(),
        patch: "\
diff --git a/src/widget.py b/src/widget.py
--- a/src/widget.py
+++ b/src/widget.py
@@ -1,2 +1,2 @@
 def size():
-    return 0
+    return 1
"
        .to_string(),
        test_patch: "\
diff --git a/tests/test_widget.py b/tests/test_widget.py
--- a/tests/test_widget.py
+++ b/tests/test_widget.py
@@ -1,2 +1,4 @@
 from widget import size

+def test_size():
+    assert size() == 1
"
        .to_string(),
        problem_statement: "size() returns 0 for a one-item widget".to_string(),
        base_image: None,
        pull_number: None,
        extra: BTreeMap::new(),
    }
}

/// Test patch modifying `count` files, enough to skip test generation.
pub fn wide_test_patch(count: usize) -> String {
    (0..count)
        .map(|n| {
            format!(
                "diff --git a/tests/test_{n}.py b/tests/test_{n}.py\n--- a/tests/test_{n}.py\n+++ b/tests/test_{n}.py\n@@ -1,1 +1,2 @@\n import widget\n+assert widget\n"
            )
        })
        .collect()
}

pub fn memory_record(repo: &str, version: &str, dockerfile: &str) -> MemoryRecord {
    let mut task = task(&format!("{}-{version}", repo.replace('/', "__")));
    task.repo = repo.to_string();
    task.version = version.to_string();
    MemoryRecord {
        task,
        dockerfile: dockerfile.to_string(),
        eval_script: "#!/bin/bash\npytest\n".to_string(),
        eval_script_skeleton: "#!/bin/bash\npytest\n".to_string(),
    }
}

/// A `<test_patch>` reply creating one test file per path.
pub fn test_patch_reply(files: &[&str]) -> String {
    let mut reply = String::from("<test_patch>\n");
    for file in files {
        reply.push_str(&format!(
            "diff --git a/{file} b/{file}\nnew file mode 100644\n--- /dev/null\n+++ b/{file}\n@@ -0,0 +1,2 @@\n+def test_generated():\n+    assert False\n"
        ));
    }
    reply.push_str("</test_patch>");
    reply
}
