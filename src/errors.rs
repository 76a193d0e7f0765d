//! Typed error hierarchy for the pipeline engine.
//!
//! Three top-level enums cover the three subsystems:
//! - `PipelineError` — planning and run-level failures
//! - `StageRunError` — failures while driving a single stage's runtime
//! - `GitError` — repository and worktree failures
//!
//! Cooperative cancellation is its own type (`AbortedError`) so callers can
//! distinguish "the user stopped the run" from "the run broke".

use thiserror::Error;

/// Errors from planning and running a pipeline.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("Invalid pipeline: {}", .errors.join("; "))]
    InvalidPipeline { errors: Vec<String> },

    #[error("Unknown runtime type '{requested}'. Registered runtimes: {}", .registered.join(", "))]
    UnknownRuntime {
        requested: String,
        registered: Vec<String>,
    },

    #[error("Failed to load pipeline config at {path}: {message}")]
    ConfigLoad {
        path: std::path::PathBuf,
        message: String,
    },

    #[error(transparent)]
    Git(#[from] GitError),

    #[error(transparent)]
    Aborted(#[from] AbortedError),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Errors from a single stage's runtime execution.
#[derive(Debug, Error)]
pub enum StageRunError {
    #[error("Failed to spawn agent runtime '{command}': {source}")]
    SpawnFailed {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to read agent prompt at {path}: {source}")]
    PromptReadFailed {
        path: std::path::PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Stage timed out after {timeout_secs}s")]
    Timeout { timeout_secs: u64 },

    #[error("Agent runtime exited with non-zero code {exit_code}")]
    NonZeroExit { exit_code: i32 },

    #[error("Agent runtime reported an error: {message}")]
    RuntimeReported { message: String },
}

/// Errors from git repository and worktree operations.
#[derive(Debug, Error)]
pub enum GitError {
    #[error("Failed to open git repository at {path}: {message}")]
    Open {
        path: std::path::PathBuf,
        message: String,
    },

    #[error("Unknown revision '{sha}': {message}")]
    UnknownRevision { sha: String, message: String },

    #[error("Failed to set up pipeline worktree: {0}")]
    WorktreeSetup(String),

    #[error("git command failed: {0}")]
    Command(String),

    #[error(transparent)]
    Raw(#[from] git2::Error),
}

/// The run was cooperatively aborted.
///
/// Propagates from any awaitable boundary once the abort controller fires;
/// the runner catches it, finalises state as `aborted`, and stops.
#[derive(Debug, Clone, Copy, Error)]
#[error("Pipeline aborted")]
pub struct AbortedError;

/// Attach a human suggestion to an error message where one is known.
///
/// The suggestion ends up in `StageExecution.error.suggestion` so the
/// summary can print something actionable next to the failure.
pub fn suggestion_for(message: &str) -> Option<String> {
    let lower = message.to_lowercase();
    if lower.contains("enoent") || lower.contains("no such file") {
        Some("Check that the agent file path exists relative to the repository root".to_string())
    } else if lower.contains("401") || lower.contains("unauthorized") || lower.contains("403") {
        Some("Check ANTHROPIC_API_KEY / CLAUDE_API_KEY in your environment".to_string())
    } else if lower.contains("timed out") || lower.contains("timeout") {
        Some("Increase the stage timeout or reduce the scope of the agent prompt".to_string())
    } else if lower.contains("yaml") || lower.contains("parse error") {
        Some("Validate the pipeline file with `agent-pipeline validate`".to_string())
    } else {
        None
    }
}
