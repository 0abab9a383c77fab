//! Request-level entry point.
//!
//! `Orchestrator::handle_request` drives one run from raw request text to a
//! pull request URL: plan, execute, integrate. Strict mode and cancellation
//! are decided here; the stages below only report what happened.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use super::claude::ClaudeHeadless;
use super::integrator::Integrator;
use super::planner::Planner;
use super::supervisor::{Supervisor, SupervisorConfig};
use crate::agent::{AgentRuntime, ClaudeAgentRuntime, RepoSnapshot};
use crate::config::Config;
use crate::core::{OrchestrationRun, Request, RunEvent, RunStatus};
use crate::git::Workspaces;
use crate::hosting::{BranchRef, GitHubClient, HostingApi};
use crate::inference::InferenceService;
use crate::util::blocking;
use crate::{Error, Result};

/// Per-request overrides.
#[derive(Debug, Clone, Default)]
pub struct RequestOptions {
    /// Overrides `Config::strict_mode` when set.
    pub strict_mode: Option<bool>,
    /// Free-form context passed to the planner.
    pub requester_context: BTreeMap<String, String>,
    /// Stops the run when fired. A fresh token is used when absent.
    pub cancel: Option<CancellationToken>,
}

impl RequestOptions {
    pub fn strict(mut self, strict: bool) -> Self {
        self.strict_mode = Some(strict);
        self
    }

    pub fn with_context(mut self, key: &str, value: &str) -> Self {
        self.requester_context
            .insert(key.to_string(), value.to_string());
        self
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = Some(cancel);
        self
    }
}

pub struct Orchestrator {
    config: Config,
    inference: Arc<dyn InferenceService>,
    hosting: Arc<dyn HostingApi>,
    runtime: Arc<dyn AgentRuntime>,
    workspaces: Workspaces,
    event_tx: Option<mpsc::Sender<RunEvent>>,
    last_run: Mutex<Option<OrchestrationRun>>,
}

impl Orchestrator {
    pub fn new(
        config: Config,
        inference: Arc<dyn InferenceService>,
        hosting: Arc<dyn HostingApi>,
        runtime: Arc<dyn AgentRuntime>,
        workspaces: Workspaces,
    ) -> Self {
        Self {
            config,
            inference,
            hosting,
            runtime,
            workspaces,
            event_tx: None,
            last_run: Mutex::new(None),
        }
    }

    /// Wire the production adapters: Claude Code for inference and agents,
    /// GitHub for hosting.
    ///
    /// # Errors
    /// Invalid config, missing `claude` binary, missing GitHub token, or no
    /// home directory to put workspaces in.
    pub fn from_config(config: Config) -> Result<Self> {
        config.validate()?;
        config.ensure_dirs()?;
        let claude = ClaudeHeadless::locate(config.effective_inference_command())?;
        let hosting = GitHubClient::from_config(&config)?;
        let workspaces = Workspaces::from_config(&config)?;
        let runtime = ClaudeAgentRuntime::new(claude.clone(), workspaces.scratch_root());
        Ok(Self::new(
            config,
            Arc::new(claude),
            Arc::new(hosting),
            Arc::new(runtime),
            workspaces,
        ))
    }

    /// Also deliver stage events to `tx`. Delivery is best effort: a full
    /// channel drops events rather than stalling the run.
    pub fn with_events(mut self, tx: mpsc::Sender<RunEvent>) -> Self {
        self.event_tx = Some(tx);
        self
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// The most recent finalized run, if any run got past planning.
    pub fn last_run(&self) -> Option<OrchestrationRun> {
        self.last_run
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    fn emit(&self, event: RunEvent) {
        if let Some(tx) = &self.event_tx {
            let _ = tx.try_send(event);
        }
    }

    /// Turn `user_input` into a pull request against `repo` (`owner/name`)
    /// and return its URL.
    pub async fn handle_request(&self, user_input: &str, repo: &str) -> Result<String> {
        self.handle_request_with(user_input, repo, RequestOptions::default())
            .await
    }

    /// # Errors
    /// - a `PlanningError` when the request cannot be planned; nothing is
    ///   spawned and no run is recorded
    /// - `Cancelled` when the token fired before the pull request branch was
    ///   created; if it fired during planning no run is recorded
    /// - `RunFailed` when no task succeeded
    /// - `PartialRun` when strict mode rejects a partial run
    /// - an `IntegrationError` when the pull request could not be opened
    pub async fn handle_request_with(
        &self,
        user_input: &str,
        repo: &str,
        options: RequestOptions,
    ) -> Result<String> {
        let strict = options.strict_mode.unwrap_or(self.config.strict_mode);
        let cancel = options.cancel.unwrap_or_default();
        let request = Request::new(user_input, repo, options.requester_context)?;
        info!(repo = request.target_repo(), strict, "handling request");

        if cancel.is_cancelled() {
            warn!(repo = request.target_repo(), "cancelled before planning");
            return Err(Error::Cancelled);
        }
        let planner = Planner::new(Arc::clone(&self.inference), Arc::clone(&self.hosting))
            .with_backoff(self.config.backoff);
        let work = tokio::select! {
            planned = planner.plan(&request) => planned.map_err(|e| {
                error!(repo = request.target_repo(), %e, "planning failed");
                e
            })?,
            _ = cancel.cancelled() => {
                warn!(repo = request.target_repo(), "cancelled during planning");
                return Err(Error::Cancelled);
            }
        };

        let mut run = OrchestrationRun::new(request, work.story, work.plan);
        info!(
            run = %run.id,
            title = %run.story.title,
            tasks = run.plan.task_count(),
            "plan created"
        );
        self.emit(RunEvent::PlanCreated {
            run_id: run.id,
            task_count: run.plan.task_count(),
        });

        let outcome = self.drive(&mut run, &work.base, &cancel, strict).await;

        let status = match &outcome {
            Err(Error::Cancelled) => RunStatus::Cancelled,
            _ => run.execution_status(),
        };
        run.finalize(status, outcome.as_ref().ok().cloned());
        match &outcome {
            Ok(url) => info!(run = %run.id, %status, %url, "run finished"),
            Err(e) => warn!(run = %run.id, %status, stage = ?e.stage(), %e, "run finished without a pull request"),
        }
        self.emit(RunEvent::RunFinished {
            run_id: run.id,
            status,
        });
        *self
            .last_run
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(run);

        outcome
    }

    async fn drive(
        &self,
        run: &mut OrchestrationRun,
        base: &BranchRef,
        cancel: &CancellationToken,
        strict: bool,
    ) -> Result<String> {
        let workspace = {
            let workspaces = self.workspaces.clone();
            let repo = run.request.target_repo().to_string();
            let sha = base.sha.clone();
            blocking(move || workspaces.prepare(&repo, &sha)).await?
        };
        let snapshot = RepoSnapshot::new(
            run.request.target_repo(),
            workspace.repo_path().to_path_buf(),
            &base.sha,
        );

        let mut supervisor =
            Supervisor::new(Arc::clone(&self.runtime), SupervisorConfig::from(&self.config));
        if let Some(tx) = &self.event_tx {
            supervisor = supervisor.with_events(tx.clone());
        }
        let report = supervisor.execute(&mut run.plan, &snapshot, cancel).await;
        run.results = report.results;

        if report.cancelled {
            return Err(Error::Cancelled);
        }
        match run.execution_status() {
            RunStatus::Failure => {
                return Err(Error::RunFailed {
                    failed: run.failed_tasks(),
                })
            }
            RunStatus::Partial if strict => {
                return Err(Error::PartialRun {
                    failed: run.failed_tasks(),
                    skipped: run.skipped_tasks(),
                })
            }
            _ => {}
        }
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }

        let mut integrator = Integrator::new(Arc::clone(&self.hosting), Arc::new(workspace))
            .with_cancel(cancel.clone());
        if let Some(tx) = &self.event_tx {
            integrator = integrator.with_events(tx.clone());
        }
        integrator.integrate(run).await
    }
}
