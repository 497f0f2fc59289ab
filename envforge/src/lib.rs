//! Fail-to-pass environment construction.
//!
//! Given a task (repository, base commit, reference fix and test patch) the
//! crate generates a Dockerfile and an eval script, then proves them by
//! running the tests before and after the fix inside a container. The layout
//! keeps a strict separation:
//!
//! - **[`core`]**: Pure, deterministic logic (classification, diff repair,
//!   extraction, verdicts). No I/O, fully testable in isolation.
//! - **[`io`]**: Side-effecting operations (processes, containers, files,
//!   network). Isolated behind traits so tests can substitute fakes.
//!
//! [`agents`] holds the generation stages; [`workflow`] drives them.

pub mod agents;
pub mod core;
pub mod error;
pub mod exit_codes;
pub mod io;
pub mod logging;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
pub mod workflow;
