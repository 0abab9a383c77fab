use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::core::TaskId;

/// Failures while turning a request into a task plan. Always fatal to the run.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PlanningError {
    #[error("request decomposed into zero tasks")]
    EmptyPlan,

    #[error("task plan has a dependency cycle at task '{task}'")]
    CyclicPlan { task: String },

    #[error("repository '{repo}' is not resolvable: {reason}")]
    InvalidRepo { repo: String, reason: String },

    #[error("malformed plan: {0}")]
    MalformedPlan(String),
}

/// Failure of a single agent attempt.
///
/// The supervisor absorbs these through its retry and skip logic; callers only
/// see them inside task statuses and `AgentResult`s.
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum AgentError {
    #[error("agent timed out after {0:?}")]
    Timeout(Duration),

    #[error("agent execution failed: {0}")]
    ExecutionFailure(String),
}

/// Failures while turning succeeded patches into a pull request.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum IntegrationError {
    #[error("no succeeded task produced changes to integrate")]
    NothingToIntegrate,

    #[error("patch from task {task_id} does not apply: {detail}")]
    PatchConflict { task_id: TaskId, detail: String },

    #[error("hosting API {operation} failed: {detail}")]
    HostingApiFailure { operation: String, detail: String },

    #[error("branch '{branch}' already exists with a different patch set")]
    BranchExists { branch: String },

    #[error("local mirror could not build the change on {base}: {detail}")]
    MirrorFailure { base: String, detail: String },
}

/// Pipeline stage an error belongs to, for diagnosis without re-running.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Planning,
    Execution,
    Integration,
    Infrastructure,
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Stage::Planning => write!(f, "planning"),
            Stage::Execution => write!(f, "execution"),
            Stage::Integration => write!(f, "integration"),
            Stage::Infrastructure => write!(f, "infrastructure"),
        }
    }
}

#[derive(Error, Debug)]
pub enum Error {
    #[error("Planning error: {0}")]
    Planning(#[from] PlanningError),

    #[error("Agent error: {0}")]
    Agent(#[from] AgentError),

    #[error("Integration error: {0}")]
    Integration(#[from] IntegrationError),

    #[error("Run cancelled")]
    Cancelled,

    #[error("Run failed: no task succeeded (failed: {})", failed.join(", "))]
    RunFailed { failed: Vec<String> },

    #[error(
        "Partial run rejected in strict mode (failed: {}; skipped: {})",
        failed.join(", "),
        skipped.join(", ")
    )]
    PartialRun {
        failed: Vec<String>,
        skipped: Vec<String>,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Git error: {0}")]
    Git(#[from] git2::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("TOML serialize error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Hosting API returned {status}: {message}")]
    Hosting { status: u16, message: String },

    #[error("Inference error: {0}")]
    Inference(String),

    #[error("Inference service unavailable: {0}")]
    InferenceUnavailable(String),

    #[error("Claude binary not found in PATH")]
    ClaudeBinaryNotFound,

    #[error("No home directory")]
    NoHomeDir,

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Operation timed out after {0:?}")]
    Timeout(Duration),

    #[error("Task join error: {0}")]
    TaskJoin(String),
}

impl Error {
    /// The stage this error surfaced from.
    pub fn stage(&self) -> Stage {
        match self {
            Error::Planning(_) => Stage::Planning,
            Error::Agent(_) | Error::Cancelled | Error::RunFailed { .. } | Error::PartialRun { .. } => {
                Stage::Execution
            }
            Error::Integration(_) => Stage::Integration,
            _ => Stage::Infrastructure,
        }
    }

    /// The task an error is attributed to, if any.
    pub fn task_id(&self) -> Option<TaskId> {
        match self {
            Error::Integration(IntegrationError::PatchConflict { task_id, .. }) => Some(*task_id),
            _ => None,
        }
    }

    /// Whether retrying the same call later could succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            Error::InferenceUnavailable(_) | Error::Timeout(_) => true,
            Error::Hosting { status, .. } => *status == 429 || *status >= 500,
            Error::Http(e) => e.is_timeout() || e.is_connect(),
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
