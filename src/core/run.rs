//! Request and run-level types.
//!
//! An `OrchestrationRun` is the unit of observability: it is created when a
//! request is accepted, filled in as the stages progress, and finalized once.

use std::collections::{BTreeMap, HashMap};
use std::sync::LazyLock;

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::core::dag::TaskPlan;
use crate::core::result::AgentResult;
use crate::core::task::{Task, TaskId};
use crate::error::PlanningError;

/// Runs of characters that cannot appear in a slug.
static NON_SLUG_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"[^a-z0-9]+").unwrap());

/// A change request as accepted by `handle_request`. Immutable.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Request {
    text: String,
    target_repo: String,
    requester_context: BTreeMap<String, String>,
}

impl Request {
    /// Accept a request.
    ///
    /// # Errors
    /// `EmptyPlan` for blank text, `InvalidRepo` if `target_repo` is not of
    /// the form `owner/name`. Existence of the repository is probed later by
    /// the planner.
    pub fn new(
        text: &str,
        target_repo: &str,
        requester_context: BTreeMap<String, String>,
    ) -> std::result::Result<Self, PlanningError> {
        let text = text.trim();
        if text.is_empty() {
            return Err(PlanningError::EmptyPlan);
        }
        let target_repo = target_repo.trim();
        if !is_repo_identifier(target_repo) {
            return Err(PlanningError::InvalidRepo {
                repo: target_repo.to_string(),
                reason: "expected <owner>/<name>".to_string(),
            });
        }
        Ok(Self {
            text: text.to_string(),
            target_repo: target_repo.to_string(),
            requester_context,
        })
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn target_repo(&self) -> &str {
        &self.target_repo
    }

    pub fn requester_context(&self) -> &BTreeMap<String, String> {
        &self.requester_context
    }
}

fn is_repo_identifier(repo: &str) -> bool {
    let mut parts = repo.split('/');
    let valid = |s: Option<&str>| {
        s.is_some_and(|s| {
            !s.is_empty()
                && s != "."
                && s != ".."
                && s
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
        })
    };
    valid(parts.next()) && valid(parts.next()) && parts.next().is_none()
}

/// Unique identifier for an orchestration run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RunId(pub Uuid);

impl RunId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Return first 8 characters of the UUID for display.
    pub fn short(&self) -> String {
        self.0.to_string()[..8].to_string()
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for RunId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Product-level summary of the request produced alongside the plan.
///
/// Feeds the branch name, the commit message, and the pull request body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct UserStory {
    pub title: String,
    pub summary: String,
    #[serde(default)]
    pub acceptance_criteria: Vec<String>,
    #[serde(default)]
    pub technical_notes: String,
}

impl UserStory {
    /// Branch-safe slug of the title, at most 48 characters.
    pub fn slug(&self) -> String {
        slugify(&self.title, 48)
    }
}

/// Lowercase `text`, collapse non-alphanumerics into single dashes.
pub fn slugify(text: &str, max_len: usize) -> String {
    let lowered = text.to_lowercase();
    let slug = NON_SLUG_RE.replace_all(&lowered, "-");
    let slug = slug.trim_matches('-');
    let mut out: String = slug.chars().take(max_len).collect();
    while out.ends_with('-') {
        out.pop();
    }
    if out.is_empty() {
        "change".to_string()
    } else {
        out
    }
}

/// Overall status of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    #[default]
    Running,
    /// Every task succeeded.
    Success,
    /// Some tasks succeeded, others failed or were skipped.
    Partial,
    /// No task succeeded.
    Failure,
    /// Stopped by an external cancellation signal.
    Cancelled,
}

impl RunStatus {
    /// Derive the status from terminal task states.
    pub fn from_tasks<'a>(tasks: impl IntoIterator<Item = &'a Task>) -> Self {
        let (mut total, mut succeeded) = (0usize, 0usize);
        for task in tasks {
            total += 1;
            if task.is_succeeded() {
                succeeded += 1;
            }
        }
        if total > 0 && succeeded == total {
            RunStatus::Success
        } else if succeeded > 0 {
            RunStatus::Partial
        } else {
            RunStatus::Failure
        }
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RunStatus::Running => write!(f, "running"),
            RunStatus::Success => write!(f, "success"),
            RunStatus::Partial => write!(f, "partial"),
            RunStatus::Failure => write!(f, "failure"),
            RunStatus::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// Top-level aggregate of one `handle_request` call.
#[derive(Debug, Clone)]
pub struct OrchestrationRun {
    pub id: RunId,
    pub request: Request,
    pub story: UserStory,
    pub plan: TaskPlan,
    pub results: HashMap<TaskId, AgentResult>,
    pub pr_url: Option<String>,
    pub final_status: RunStatus,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl OrchestrationRun {
    pub fn new(request: Request, story: UserStory, plan: TaskPlan) -> Self {
        Self {
            id: RunId::new(),
            request,
            story,
            plan,
            results: HashMap::new(),
            pr_url: None,
            final_status: RunStatus::Running,
            started_at: Utc::now(),
            finished_at: None,
        }
    }

    /// Status derived from the current task states.
    pub fn execution_status(&self) -> RunStatus {
        RunStatus::from_tasks(self.plan.all_tasks())
    }

    /// Names of failed tasks, in topological order.
    pub fn failed_tasks(&self) -> Vec<String> {
        self.task_names(Task::is_failed)
    }

    /// Names of skipped tasks, in topological order.
    pub fn skipped_tasks(&self) -> Vec<String> {
        self.task_names(Task::is_skipped)
    }

    fn task_names(&self, pred: impl Fn(&Task) -> bool) -> Vec<String> {
        self.plan
            .topological_order()
            .into_iter()
            .filter(|t| pred(t))
            .map(|t| t.name.clone())
            .collect()
    }

    /// Record the final status. Only the first call has an effect.
    pub fn finalize(&mut self, status: RunStatus, pr_url: Option<String>) {
        if self.finished_at.is_some() {
            return;
        }
        self.final_status = status;
        self.pr_url = pr_url;
        self.finished_at = Some(Utc::now());
    }

    pub fn is_finalized(&self) -> bool {
        self.finished_at.is_some()
    }
}

/// Stage-transition events emitted during a run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunEvent {
    PlanCreated {
        run_id: RunId,
        task_count: usize,
    },
    TaskStarted {
        task_id: TaskId,
        attempt: u32,
    },
    TaskFinished {
        task_id: TaskId,
        attempt: u32,
        succeeded: bool,
        /// Whether another attempt will follow.
        retrying: bool,
    },
    TaskSkipped {
        task_id: TaskId,
        reason: String,
    },
    IntegrationStarted {
        run_id: RunId,
        branch: String,
    },
    IntegrationFinished {
        run_id: RunId,
        pr_url: String,
    },
    RunFinished {
        run_id: RunId,
        status: RunStatus,
    },
}
