//! Typed failures the workflow reacts to.
//!
//! These travel inside `anyhow::Error` and are recovered with
//! `downcast_ref::<ForgeError>()` where a caller needs to tell a recoverable
//! stage failure apart from a hard infrastructure error.

use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ForgeError {
    /// Image build failed; `log` is already windowed.
    #[error("image build failed:\n{log}")]
    Build { log: String },

    #[error("evaluation failed: {reason}")]
    Evaluation { reason: String },

    #[error("{what} timed out after {}s", timeout.as_secs())]
    Timeout { what: String, timeout: Duration },

    #[error("failed to extract {artifact} from generator output")]
    Extraction { artifact: String },

    #[error("analysis verdict rejected: {reason}")]
    VerdictParse { reason: String },
}

impl ForgeError {
    pub fn extraction(artifact: impl Into<String>) -> Self {
        Self::Extraction {
            artifact: artifact.into(),
        }
    }

    pub fn verdict(reason: impl Into<String>) -> Self {
        Self::VerdictParse {
            reason: reason.into(),
        }
    }

    pub fn evaluation(reason: impl Into<String>) -> Self {
        Self::Evaluation {
            reason: reason.into(),
        }
    }

    pub fn timeout(what: impl Into<String>, timeout: Duration) -> Self {
        Self::Timeout {
            what: what.into(),
            timeout,
        }
    }

    /// Failures the harness reports back to the analyzer instead of aborting.
    pub fn is_harness_feedback(&self) -> bool {
        matches!(
            self,
            Self::Build { .. } | Self::Evaluation { .. } | Self::Timeout { .. }
        )
    }
}

/// Find a [`ForgeError`] anywhere in an `anyhow` chain.
pub fn find_forge_error(err: &anyhow::Error) -> Option<&ForgeError> {
    err.chain().find_map(|cause| cause.downcast_ref::<ForgeError>())
}
