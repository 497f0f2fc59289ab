//! Development-time tracing.
//!
//! # Separation of Concerns
//!
//! - **Tracing (this module)**: Dev diagnostics via `RUST_LOG`, output to stderr.
//!   Not persisted, not part of the task output.
//!
//! - **Attempt artifacts (`io/task_output`)**: build logs, test logs, raw
//!   generator replies and transcripts under the task output directory.
//!   Always written, unaffected by `RUST_LOG`.

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Filter used when `RUST_LOG` is unset.
pub fn default_directive(verbose: bool) -> &'static str {
    if verbose { "warn,envforge=info" } else { "warn" }
}

/// Initialize the stderr subscriber.
///
/// `RUST_LOG` wins over `verbose` when set.
///
/// # Example
/// ```bash
/// RUST_LOG=envforge=debug envforge run --task task.json --output out/
/// ```
pub fn init(verbose: bool) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directive(verbose)));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr).compact().with_target(false))
        .init();
}
