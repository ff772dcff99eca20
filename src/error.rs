//! Failure taxonomy for pipeline steps.
//!
//! Plumbing errors travel as `anyhow::Error`; the variants here mark which
//! class of step failed so the CLI can decide what is fatal and which exit
//! code to report.

use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StepError {
    #[error("target '{target}': cannot resolve dependency {path}: {reason}")]
    Dependency {
        target: String,
        path: PathBuf,
        reason: String,
    },

    #[error("target '{target}' failed (exit code {code}):\n{diagnostics}")]
    Build {
        target: String,
        code: i32,
        diagnostics: String,
    },

    #[error("cannot provision disk image {path}: {reason}")]
    Provisioning { path: PathBuf, reason: String },

    #[error("staging '{target}' into the image tree failed: {reason}")]
    Staging { target: String, reason: String },

    #[error("cannot launch emulator: {reason}")]
    Launch { reason: String },

    #[error("emulator exited with status {code}")]
    VmExit { code: i32 },

    #[error("{failed} target(s) failed, {blocked} blocked by failed upstream targets")]
    Pipeline { failed: usize, blocked: usize },
}

impl StepError {
    /// Process exit code the CLI reports for this failure.
    pub fn exit_code(&self) -> i32 {
        match self {
            StepError::VmExit { code } => *code,
            _ => 1,
        }
    }
}

/// Exit code for an arbitrary pipeline error.
pub fn exit_code_for(err: &anyhow::Error) -> i32 {
    err.chain()
        .find_map(|cause| cause.downcast_ref::<StepError>())
        .map(StepError::exit_code)
        .unwrap_or(1)
}
