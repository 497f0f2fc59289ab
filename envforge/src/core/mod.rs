//! Deterministic, pure logic for environment construction.
//!
//! Core modules must be free of I/O side effects. They operate on text and
//! in-memory records and return deterministic outputs suitable for tests.

pub mod api_call;
pub mod classifier;
pub mod diff;
pub mod dockerfile;
pub mod extract;
pub mod heredoc;
pub mod log_window;
pub mod retry;
pub mod types;
pub mod verdict;
pub mod version;
