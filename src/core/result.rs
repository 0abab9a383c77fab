//! Agent attempt outcomes and the patches they carry.

use serde::{Deserialize, Serialize};

use crate::core::task::TaskId;
use crate::error::AgentError;

/// A unified git diff produced by one task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Patch {
    /// The task whose agent produced this diff.
    pub task_id: TaskId,
    /// Unified diff text, as printed by `git diff`.
    pub diff: String,
}

impl Patch {
    pub fn new(task_id: TaskId, diff: impl Into<String>) -> Self {
        Self {
            task_id,
            diff: diff.into(),
        }
    }

    /// A patch with no hunks changes nothing and is left out of integration.
    pub fn is_empty(&self) -> bool {
        self.diff.trim().is_empty()
    }

    /// Paths touched by this patch, from its `+++ b/` and `--- a/` headers.
    pub fn touched_paths(&self) -> Vec<String> {
        let mut paths: Vec<String> = Vec::new();
        for line in self.diff.lines() {
            let path = line
                .strip_prefix("+++ b/")
                .or_else(|| line.strip_prefix("--- a/"));
            if let Some(path) = path {
                let path = path.trim().to_string();
                if !paths.contains(&path) {
                    paths.push(path);
                }
            }
        }
        paths
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentOutcome {
    Success,
    Failure,
}

/// Result of a single agent context invocation. Immutable once produced.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentResult {
    pub task_id: TaskId,
    /// 1-based attempt number this result belongs to.
    pub attempt: u32,
    pub outcome: AgentOutcome,
    pub patch: Option<Patch>,
    pub error_detail: Option<AgentError>,
}

impl AgentResult {
    pub fn success(task_id: TaskId, attempt: u32, patch: Patch) -> Self {
        Self {
            task_id,
            attempt,
            outcome: AgentOutcome::Success,
            patch: Some(patch),
            error_detail: None,
        }
    }

    pub fn failure(task_id: TaskId, attempt: u32, error: AgentError) -> Self {
        Self {
            task_id,
            attempt,
            outcome: AgentOutcome::Failure,
            patch: None,
            error_detail: Some(error),
        }
    }

    pub fn is_success(&self) -> bool {
        self.outcome == AgentOutcome::Success
    }

    /// Human-readable failure detail, fed back into the next attempt.
    pub fn failure_detail(&self) -> Option<String> {
        self.error_detail.as_ref().map(|e| e.to_string())
    }
}
