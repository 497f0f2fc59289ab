//! Stable exit codes for the `envforge` CLI.

/// The analyzer accepted the environment.
pub const OK: i32 = 0;
/// Invalid arguments, config or task file, or any other setup error.
pub const INVALID: i32 = 1;
/// The iteration budget ran out without a finishing verdict.
pub const EXHAUSTED: i32 = 2;
/// A hard infrastructure error stopped the run.
pub const ABORTED: i32 = 3;
