//! Execution supervisor for the task DAG.
//!
//! The supervisor dispatches ready tasks to agent contexts while respecting
//! dependencies and the concurrency limit, retries failed attempts with the
//! failure details fed back into the instructions, and skips everything
//! downstream of a task that failed for good.
//!
//! All scheduling happens on the caller's task: attempts are polled through a
//! `FuturesUnordered`, so plan state is only touched between polls.

use std::collections::HashMap;
use std::fmt::Write as _;
use std::sync::Arc;
use std::time::Duration;

use futures::stream::{FuturesUnordered, StreamExt};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::agent::{AgentInvocation, AgentRuntime, CapabilitySet, RepoSnapshot};
use crate::config::{Config, DEFAULT_MAX_CONCURRENCY, DEFAULT_MAX_RETRIES, DEFAULT_TASK_TIMEOUT_SECS};
use crate::core::{AgentResult, Patch, RunEvent, Task, TaskId, TaskPlan};
use crate::error::AgentError;

/// Reason recorded on tasks that never started because the run was cancelled.
pub const CANCELLED_REASON: &str = "cancelled";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SupervisorConfig {
    /// Attempts allowed in flight at once.
    pub max_concurrency: usize,
    /// Extra attempts after the first failure.
    pub max_retries: u32,
    /// Wall-clock limit per attempt.
    pub task_timeout: Duration,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            max_concurrency: DEFAULT_MAX_CONCURRENCY,
            max_retries: DEFAULT_MAX_RETRIES,
            task_timeout: Duration::from_secs(DEFAULT_TASK_TIMEOUT_SECS),
        }
    }
}

impl From<&Config> for SupervisorConfig {
    fn from(config: &Config) -> Self {
        Self {
            max_concurrency: config.max_concurrency,
            max_retries: config.max_retries,
            task_timeout: config.task_timeout(),
        }
    }
}

/// What `execute` produced. Task statuses live in the plan itself.
#[derive(Debug, Clone, Default)]
pub struct ExecutionReport {
    /// Result of the last attempt of every task that ran.
    pub results: HashMap<TaskId, AgentResult>,
    /// Whether cancellation stopped the walk early.
    pub cancelled: bool,
}

pub struct Supervisor {
    runtime: Arc<dyn AgentRuntime>,
    config: SupervisorConfig,
    event_tx: Option<mpsc::Sender<RunEvent>>,
}

impl Supervisor {
    pub fn new(runtime: Arc<dyn AgentRuntime>, config: SupervisorConfig) -> Self {
        Self {
            runtime,
            config,
            event_tx: None,
        }
    }

    /// Send stage events to `tx` as well as to the log.
    pub fn with_events(mut self, tx: mpsc::Sender<RunEvent>) -> Self {
        self.event_tx = Some(tx);
        self
    }

    pub fn config(&self) -> &SupervisorConfig {
        &self.config
    }

    fn emit(&self, event: RunEvent) {
        if let Some(tx) = &self.event_tx {
            let _ = tx.try_send(event);
        }
    }

    /// Walk `plan` to completion.
    ///
    /// On return every task is succeeded, failed, or skipped. Once `cancel`
    /// fires no further attempt is started; attempts already in flight run to
    /// completion (bounded by the task timeout) and never-started tasks are
    /// skipped with reason `cancelled`.
    pub async fn execute(
        &self,
        plan: &mut TaskPlan,
        base: &RepoSnapshot,
        cancel: &CancellationToken,
    ) -> ExecutionReport {
        let limit = self.config.max_concurrency.max(1);
        let mut report = ExecutionReport::default();
        let mut in_flight = FuturesUnordered::new();

        info!(
            tasks = plan.task_count(),
            pending = plan.pending_count(),
            max_concurrency = limit,
            max_retries = self.config.max_retries,
            "executing plan"
        );

        loop {
            if cancel.is_cancelled() {
                report.cancelled = true;
            }

            if !report.cancelled {
                for task_id in plan.ready_tasks() {
                    if in_flight.len() >= limit {
                        break;
                    }
                    if let Some(invocation) = self.prepare(plan, task_id, base) {
                        in_flight.push(self.run_attempt(invocation));
                    }
                }
            }

            if in_flight.is_empty() {
                break;
            }

            tokio::select! {
                Some(result) = in_flight.next() => {
                    self.handle_result(plan, &mut report, result);
                }
                _ = cancel.cancelled(), if !report.cancelled => {
                    warn!(in_flight = in_flight.len(), "cancellation requested, draining in-flight attempts");
                    report.cancelled = true;
                }
            }
        }

        let reason = if report.cancelled {
            CANCELLED_REASON
        } else {
            "dependencies never completed"
        };
        for task_id in plan.topological_order().iter().map(|t| t.id).collect::<Vec<_>>() {
            self.skip_if_open(plan, &task_id, reason);
        }
        debug_assert!(plan.all_terminal());

        info!(
            succeeded = plan.all_tasks().iter().filter(|t| t.is_succeeded()).count(),
            failed = plan.all_tasks().iter().filter(|t| t.is_failed()).count(),
            skipped = plan.all_tasks().iter().filter(|t| t.is_skipped()).count(),
            cancelled = report.cancelled,
            "plan execution finished"
        );
        report
    }

    /// Start the next attempt of `task_id` and build its invocation.
    fn prepare(
        &self,
        plan: &mut TaskPlan,
        task_id: TaskId,
        base: &RepoSnapshot,
    ) -> Option<AgentInvocation> {
        let patches: Vec<Patch> = plan
            .transitive_dependencies(&task_id)
            .iter()
            .filter_map(|dep| plan.get_task(dep).and_then(|t| t.result_patch.clone()))
            .filter(|p| !p.is_empty())
            .collect();

        let task = plan.get_task_mut(&task_id)?;
        task.start();
        let attempt = task.attempt_count;
        debug!(
            task = %task.name,
            attempt,
            dependency_patches = patches.len(),
            "dispatching task"
        );
        self.emit(RunEvent::TaskStarted { task_id, attempt });

        Some(AgentInvocation {
            task_id,
            attempt,
            instructions: build_instructions(task),
            snapshot: base.with_patches(patches),
            capabilities: CapabilitySet::for_kind(task.kind),
            timeout: self.config.task_timeout,
        })
    }

    /// One attempt, with runtime errors and timeouts folded into a failure.
    async fn run_attempt(&self, invocation: AgentInvocation) -> AgentResult {
        let (task_id, attempt) = (invocation.task_id, invocation.attempt);
        let timeout = self.config.task_timeout;
        match tokio::time::timeout(timeout, self.runtime.spawn(&invocation)).await {
            Ok(Ok(mut result)) => {
                result.task_id = task_id;
                result.attempt = attempt;
                result
            }
            Ok(Err(e)) => AgentResult::failure(
                task_id,
                attempt,
                AgentError::ExecutionFailure(format!("agent runtime error: {}", e)),
            ),
            Err(_) => AgentResult::failure(task_id, attempt, AgentError::Timeout(timeout)),
        }
    }

    fn handle_result(&self, plan: &mut TaskPlan, report: &mut ExecutionReport, result: AgentResult) {
        let task_id = result.task_id;
        let attempt = result.attempt;
        let Some(task) = plan.get_task_mut(&task_id) else {
            return;
        };

        if result.is_success() {
            let patch = result
                .patch
                .clone()
                .unwrap_or_else(|| Patch::new(task_id, ""));
            info!(task = %task.name, attempt, empty = patch.is_empty(), "task succeeded");
            task.succeed(patch);
            self.emit(RunEvent::TaskFinished {
                task_id,
                attempt,
                succeeded: true,
                retrying: false,
            });
        } else {
            let detail = result
                .failure_detail()
                .unwrap_or_else(|| "agent reported failure without detail".to_string());
            let retrying = task.attempt_count <= self.config.max_retries;
            if retrying {
                warn!(task = %task.name, attempt, error = %detail, "attempt failed, will retry");
                task.record_failure(&detail);
            } else {
                error!(task = %task.name, attempt, error = %detail, "task failed after all attempts");
                task.fail(&detail);
            }
            self.emit(RunEvent::TaskFinished {
                task_id,
                attempt,
                succeeded: false,
                retrying,
            });
            if !retrying {
                let reason = format!("dependency '{}' failed", task.name);
                for dependent in plan.transitive_dependents(&task_id) {
                    self.skip_if_open(plan, &dependent, &reason);
                }
            }
        }

        report.results.insert(task_id, result);
    }

    fn skip_if_open(&self, plan: &mut TaskPlan, task_id: &TaskId, reason: &str) {
        if let Some(task) = plan.get_task_mut(task_id) {
            if !task.is_terminal() {
                debug!(task = %task.name, reason, "skipping task");
                task.skip(reason);
                self.emit(RunEvent::TaskSkipped {
                    task_id: *task_id,
                    reason: reason.to_string(),
                });
            }
        }
    }
}

/// Agent instructions for the task's next attempt, including every earlier
/// failure.
pub fn build_instructions(task: &Task) -> String {
    let mut text = format!("# Task: {}\n\n{}\n", task.name, task.description);
    if !task.failures.is_empty() {
        text.push_str("\n## Previous attempts\n");
        for (i, failure) in task.failures.iter().enumerate() {
            let _ = writeln!(text, "- Attempt {} failed: {}", i + 1, failure);
        }
        text.push_str("\nAvoid repeating these failures.\n");
    }
    text
}
