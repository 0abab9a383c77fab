//! Tasks: the units of work the planner emits and agent contexts execute.
//!
//! Tasks are the atomic units of work handed to agent contexts. Each task
//! tracks its status, attempt count, and the patch its successful attempt
//! produced.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::core::result::Patch;

/// Run-unique task identifier (random UUID).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(pub Uuid);

impl TaskId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Leading 8 hex digits, for log lines.
    pub fn short(&self) -> String {
        self.0.to_string()[..8].to_string()
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for TaskId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

/// What kind of work a task performs.
///
/// The kind decides which capabilities the agent context receives: research
/// and security review only read, documentation writes but never runs shell
/// commands, implementation gets everything.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    Research,
    Architecture,
    #[default]
    Implementation,
    Security,
    Documentation,
}

const RESEARCH_WORDS: &[&str] = &["research", "investigate", "evaluate", "compare", "survey"];
const SECURITY_WORDS: &[&str] = &[
    "security", "auth", "password", "token", "secret", "encrypt", "hipaa", "gdpr",
];
const DOC_WORDS: &[&str] = &["document", "readme", "docs", "changelog", "docstring"];
const ARCHITECTURE_WORDS: &[&str] = &["design", "architecture", "schema", "interface"];

impl TaskKind {
    /// Guess the kind of a task from its name and description.
    ///
    /// Used when the planner's output omits the kind. Only description-level
    /// keywords are considered; anything unmatched is implementation work.
    pub fn infer(text: &str) -> Self {
        let text = text.to_lowercase();
        let has_any = |words: &[&str]| words.iter().any(|w| text.contains(w));

        if has_any(DOC_WORDS) {
            TaskKind::Documentation
        } else if has_any(RESEARCH_WORDS) {
            TaskKind::Research
        } else if has_any(SECURITY_WORDS) && text.contains("review") {
            TaskKind::Security
        } else if has_any(ARCHITECTURE_WORDS) && !text.contains("implement") {
            TaskKind::Architecture
        } else {
            TaskKind::Implementation
        }
    }

    /// Whether tasks of this kind are expected to modify files.
    pub fn writes_files(&self) -> bool {
        matches!(
            self,
            TaskKind::Implementation | TaskKind::Documentation | TaskKind::Architecture
        )
    }
}

impl std::fmt::Display for TaskKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskKind::Research => write!(f, "research"),
            TaskKind::Architecture => write!(f, "architecture"),
            TaskKind::Implementation => write!(f, "implementation"),
            TaskKind::Security => write!(f, "security"),
            TaskKind::Documentation => write!(f, "documentation"),
        }
    }
}

impl std::str::FromStr for TaskKind {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "research" | "researcher" => Ok(TaskKind::Research),
            "architecture" | "architect" | "design" => Ok(TaskKind::Architecture),
            "implementation" | "implement" | "code" => Ok(TaskKind::Implementation),
            "security" => Ok(TaskKind::Security),
            "documentation" | "documenter" | "docs" => Ok(TaskKind::Documentation),
            other => Err(format!("unknown task kind: {}", other)),
        }
    }
}

/// Where a task is in its lifecycle.
///
/// `pending -> running -> {succeeded | failed}`; `skipped` is reached without
/// ever running, when a dependency failed or the run was cancelled.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case", tag = "state")]
pub enum TaskStatus {
    /// Waiting for dependencies or for a free slot.
    #[default]
    Pending,
    /// An agent attempt is in flight.
    Running,
    /// An attempt succeeded.
    Succeeded,
    /// Every allowed attempt failed.
    Failed {
        /// Detail of the last failed attempt.
        error: String,
    },
    /// Never attempted.
    Skipped {
        /// Why the task was not attempted.
        reason: String,
    },
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskStatus::Pending => write!(f, "pending"),
            TaskStatus::Running => write!(f, "running"),
            TaskStatus::Succeeded => write!(f, "succeeded"),
            TaskStatus::Failed { error } => write!(f, "failed: {}", error),
            TaskStatus::Skipped { reason } => write!(f, "skipped: {}", reason),
        }
    }
}

/// One node of a `TaskPlan`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    /// Short label; also how agents and logs refer to the task.
    pub name: String,
    /// Self-contained description of what the task should accomplish.
    pub description: String,
    /// Kind of work, which determines the agent's capabilities.
    pub kind: TaskKind,
    pub status: TaskStatus,
    /// Number of agent attempts started so far.
    pub attempt_count: u32,
    /// Patch produced by the successful attempt.
    pub result_patch: Option<Patch>,
    /// Failure details from previous attempts, oldest first.
    pub failures: Vec<String>,
    pub created_at: DateTime<Utc>,
    /// When the first attempt started.
    pub started_at: Option<DateTime<Utc>>,
    /// When the task reached a terminal state.
    pub completed_at: Option<DateTime<Utc>>,
}

impl Task {
    /// A pending implementation task with no attempts yet.
    pub fn new(name: &str, description: &str) -> Self {
        Self {
            id: TaskId::new(),
            name: name.to_string(),
            description: description.to_string(),
            kind: TaskKind::default(),
            status: TaskStatus::Pending,
            attempt_count: 0,
            result_patch: None,
            failures: Vec::new(),
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
        }
    }

    /// Set the task kind.
    pub fn with_kind(mut self, kind: TaskKind) -> Self {
        self.kind = kind;
        self
    }

    /// Begin a new attempt.
    ///
    /// Transitions status to Running, bumps the attempt counter and records
    /// the start time of the first attempt.
    pub fn start(&mut self) {
        self.status = TaskStatus::Running;
        self.attempt_count += 1;
        if self.started_at.is_none() {
            self.started_at = Some(Utc::now());
        }
    }

    /// Mark the task as succeeded with the patch its attempt produced.
    pub fn succeed(&mut self, patch: Patch) {
        self.status = TaskStatus::Succeeded;
        self.result_patch = Some(patch);
        self.completed_at = Some(Utc::now());
    }

    /// Record a failed attempt and return the task to Pending for a retry.
    pub fn record_failure(&mut self, error: &str) {
        self.failures.push(error.to_string());
        self.status = TaskStatus::Pending;
    }

    /// Mark the task as permanently failed.
    pub fn fail(&mut self, error: &str) {
        if self.failures.last().map(String::as_str) != Some(error) {
            self.failures.push(error.to_string());
        }
        self.status = TaskStatus::Failed {
            error: error.to_string(),
        };
        self.completed_at = Some(Utc::now());
    }

    /// Mark the task as skipped without running it.
    pub fn skip(&mut self, reason: &str) {
        self.status = TaskStatus::Skipped {
            reason: reason.to_string(),
        };
        self.completed_at = Some(Utc::now());
    }

    /// Check if the task is in a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self.status,
            TaskStatus::Succeeded | TaskStatus::Failed { .. } | TaskStatus::Skipped { .. }
        )
    }

    pub fn is_succeeded(&self) -> bool {
        self.status == TaskStatus::Succeeded
    }

    pub fn is_failed(&self) -> bool {
        matches!(self.status, TaskStatus::Failed { .. })
    }

    pub fn is_skipped(&self) -> bool {
        matches!(self.status, TaskStatus::Skipped { .. })
    }

    /// Check if the task can be started.
    pub fn can_start(&self) -> bool {
        self.status == TaskStatus::Pending
    }
}
