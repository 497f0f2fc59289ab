//! Side-effecting collaborators: processes, containers, files and network.

pub mod config;
pub mod container;
pub mod generator;
pub mod git;
pub mod harness;
pub mod memory;
pub mod process;
pub mod prompt;
pub mod remote;
pub mod repo_browser;
pub mod task_output;
