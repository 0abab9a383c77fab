//! Task planner: turns a change request into a validated task DAG.
//!
//! The planner asks the inference service for a user story and a list of
//! tasks with dependencies, then builds a `TaskPlan` from the answer. The
//! plan is checked for emptiness, unknown or duplicate ids and cycles before
//! anything runs.

use std::collections::HashMap;
use std::fmt::Write as _;
use std::sync::Arc;

use serde::Deserialize;
use tracing::{debug, info, trace};

use crate::core::{Request, Task, TaskId, TaskKind, TaskPlan, UserStory};
use crate::error::PlanningError;
use crate::hosting::{BranchRef, HostingApi};
use crate::inference::{extract_json_object, CompletionRequest, InferenceService};
use crate::util::Backoff;
use crate::Result;

const PLANNER_SYSTEM_PROMPT: &str = r#"You are a senior product manager and tech lead.
Turn the change request into a user story and a small set of tasks that
autonomous coding agents can execute independently.

Respond with a single JSON object and nothing else:
{
  "title": "Short feature title",
  "summary": "As a <role>, I want <action>, so that <benefit>",
  "acceptance_criteria": ["criterion 1", "criterion 2"],
  "technical_notes": "Relevant technical notes",
  "tasks": [
    {
      "id": "t1",
      "name": "Short task name",
      "description": "Everything an engineer needs to do this task without further context",
      "kind": "research | architecture | implementation | security | documentation",
      "depends_on": ["ids of tasks whose output this task needs"]
    }
  ]
}

Only add a dependency when a task really needs another task's changes.
Tasks without dependencies run in parallel."#;

/// The planner's output.
#[derive(Debug, Clone)]
pub struct PlannedWork {
    pub story: UserStory,
    pub plan: TaskPlan,
    /// Default branch of the target repository at planning time.
    pub base: BranchRef,
}

#[derive(Debug, Deserialize)]
struct RawPlan {
    #[serde(default)]
    title: String,
    #[serde(default)]
    summary: String,
    #[serde(default)]
    acceptance_criteria: Vec<String>,
    #[serde(default)]
    technical_notes: String,
    #[serde(default)]
    tasks: Vec<RawTask>,
}

#[derive(Debug, Deserialize)]
struct RawTask {
    id: RawId,
    #[serde(default)]
    name: String,
    #[serde(default)]
    description: String,
    #[serde(default)]
    kind: Option<String>,
    #[serde(default)]
    depends_on: Vec<RawId>,
}

/// Models emit ids as strings or bare numbers.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RawId {
    Text(String),
    Number(i64),
}

impl RawId {
    fn key(&self) -> String {
        match self {
            RawId::Text(s) => s.trim().to_string(),
            RawId::Number(n) => n.to_string(),
        }
    }
}

pub struct Planner {
    inference: Arc<dyn InferenceService>,
    hosting: Arc<dyn HostingApi>,
    backoff: Backoff,
}

impl Planner {
    pub fn new(inference: Arc<dyn InferenceService>, hosting: Arc<dyn HostingApi>) -> Self {
        Self {
            inference,
            hosting,
            backoff: Backoff::default(),
        }
    }

    pub fn with_backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    /// Decompose `request` into a user story and a validated task plan.
    ///
    /// Only reads: one repository probe and one inference call (plus
    /// retries on transient errors).
    ///
    /// # Errors
    /// - `InvalidRepo` if the repository cannot be resolved
    /// - `MalformedPlan` if the completion is not a usable plan
    /// - `EmptyPlan` if the plan has no tasks
    /// - `CyclicPlan` if task dependencies form a cycle
    pub async fn plan(&self, request: &Request) -> Result<PlannedWork> {
        if request.text().trim().is_empty() {
            return Err(PlanningError::EmptyPlan.into());
        }
        let base = self.probe_repo(request.target_repo()).await?;

        let completion_request =
            CompletionRequest::new(build_prompt(request)).with_system(PLANNER_SYSTEM_PROMPT);
        let inference = &self.inference;
        let req = &completion_request;
        let completion = self
            .backoff
            .retry("planning inference", move || inference.complete(req))
            .await?;
        trace!(completion = %completion, "planner completion");

        let (story, plan) = parse_plan(&completion)?;
        info!(
            title = %story.title,
            tasks = plan.task_count(),
            dependencies = plan.dependency_count(),
            "plan created"
        );
        Ok(PlannedWork { story, plan, base })
    }

    async fn probe_repo(&self, repo: &str) -> Result<BranchRef> {
        let hosting = &self.hosting;
        self.backoff
            .retry("repository probe", move || hosting.get_default_branch(repo))
            .await
            .map_err(|e| {
                crate::Error::from(PlanningError::InvalidRepo {
                    repo: repo.to_string(),
                    reason: e.to_string(),
                })
            })
            .inspect(|base| debug!(repo, branch = %base.name, sha = %base.sha, "repository resolved"))
    }
}

fn build_prompt(request: &Request) -> String {
    let mut prompt = format!(
        "Repository: {}\n\nChange request:\n{}\n",
        request.target_repo(),
        request.text()
    );
    if !request.requester_context().is_empty() {
        prompt.push_str("\nRequester context:\n");
        for (key, value) in request.requester_context() {
            let _ = writeln!(prompt, "- {}: {}", key, value);
        }
    }
    prompt
}

/// Parse a planner completion into a story and a validated plan.
pub fn parse_plan(completion: &str) -> std::result::Result<(UserStory, TaskPlan), PlanningError> {
    let json = extract_json_object(completion)
        .ok_or_else(|| PlanningError::MalformedPlan("no JSON object in completion".to_string()))?;
    let raw: RawPlan = serde_json::from_str(json)
        .map_err(|e| PlanningError::MalformedPlan(format!("invalid plan JSON: {}", e)))?;

    if raw.tasks.is_empty() {
        return Err(PlanningError::EmptyPlan);
    }

    let story = UserStory {
        title: if raw.title.trim().is_empty() {
            "Automated change".to_string()
        } else {
            raw.title.trim().to_string()
        },
        summary: raw.summary.trim().to_string(),
        acceptance_criteria: raw.acceptance_criteria,
        technical_notes: raw.technical_notes.trim().to_string(),
    };

    let mut ids: HashMap<String, TaskId> = HashMap::new();
    let mut tasks = Vec::with_capacity(raw.tasks.len());
    for raw_task in &raw.tasks {
        let key = raw_task.id.key();
        if key.is_empty() {
            return Err(PlanningError::MalformedPlan("task with empty id".to_string()));
        }
        let name = if raw_task.name.trim().is_empty() {
            key.clone()
        } else {
            raw_task.name.trim().to_string()
        };
        let kind = raw_task
            .kind
            .as_deref()
            .and_then(|k| k.parse::<TaskKind>().ok())
            .unwrap_or_else(|| TaskKind::infer(&format!("{} {}", name, raw_task.description)));
        let task = Task::new(&name, &self_contained_description(&raw_task.description, &story))
            .with_kind(kind);
        if ids.insert(key.clone(), task.id).is_some() {
            return Err(PlanningError::MalformedPlan(format!(
                "duplicate task id '{}'",
                key
            )));
        }
        tasks.push(task);
    }

    let mut edges = Vec::new();
    for raw_task in &raw.tasks {
        let to = ids[&raw_task.id.key()];
        for dep in &raw_task.depends_on {
            let dep_key = dep.key();
            let from = ids.get(&dep_key).copied().ok_or_else(|| {
                PlanningError::MalformedPlan(format!(
                    "task '{}' depends on unknown task '{}'",
                    raw_task.id.key(),
                    dep_key
                ))
            })?;
            if from == to {
                let name = tasks
                    .iter()
                    .find(|t| t.id == to)
                    .map(|t| t.name.clone())
                    .unwrap_or(dep_key);
                return Err(PlanningError::CyclicPlan { task: name });
            }
            edges.push((from, to));
        }
    }

    let plan = TaskPlan::from_parts(tasks, edges)?;
    Ok((story, plan))
}

/// Append the story context so an agent can work from the description alone.
fn self_contained_description(description: &str, story: &UserStory) -> String {
    let mut text = description.trim().to_string();
    let _ = write!(text, "\n\nThis task is part of: {}", story.title);
    if !story.summary.is_empty() {
        let _ = write!(text, "\n{}", story.summary);
    }
    if !story.acceptance_criteria.is_empty() {
        text.push_str("\n\nAcceptance criteria:");
        for criterion in &story.acceptance_criteria {
            let _ = write!(text, "\n- {}", criterion);
        }
    }
    if !story.technical_notes.is_empty() {
        let _ = write!(text, "\n\nTechnical notes: {}", story.technical_notes);
    }
    text
}
