//! Change integrator: turns succeeded patches into one pull request.
//!
//! Patches are applied in topological order onto the default branch tip of
//! the local mirror, entirely in memory. Only when every patch applies does
//! anything reach the remote: branch, commit, pull request. A failure after
//! the branch exists deletes it again, so the remote never keeps a half-built
//! change.
//!
//! Integration is idempotent per patch set: the pull request body and the
//! commit message carry a fingerprint of the patches. Re-integrating the same
//! run returns the existing pull request instead of opening a second one, or
//! opens it if an earlier attempt stopped after committing.

use std::fmt::Write as _;
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::core::{OrchestrationRun, Patch, RunEvent, TaskStatus};
use crate::error::IntegrationError;
use crate::git::{patch_set_fingerprint, Workspace};
use crate::hosting::{FileChange, HostingApi};
use crate::util::blocking;
use crate::{Error, Result};

const FINGERPRINT_PREFIX: &str = "<!-- autopr-patch-set: ";
const FINGERPRINT_SUFFIX: &str = " -->";
const FINGERPRINT_TRAILER: &str = "Autopr-Patch-Set: ";

/// Everything needed to publish one run's changes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IntegrationUnit {
    /// Patches in application order.
    pub patches: Vec<Patch>,
    pub branch: String,
    pub title: String,
    pub commit_message: String,
    pub body: String,
    pub fingerprint: String,
    /// Names of tasks whose patches are included.
    pub included: Vec<String>,
    /// Names and reasons of tasks left out.
    pub excluded: Vec<(String, String)>,
}

impl IntegrationUnit {
    /// Build the unit for `run`.
    ///
    /// # Errors
    /// `NothingToIntegrate` if no succeeded task produced a non-empty patch.
    pub fn from_run(run: &OrchestrationRun) -> Result<Self> {
        let mut patches = Vec::new();
        let mut included = Vec::new();
        let mut excluded = Vec::new();

        for task in run.plan.topological_order() {
            match (&task.status, &task.result_patch) {
                (TaskStatus::Succeeded, Some(patch)) if !patch.is_empty() => {
                    patches.push(patch.clone());
                    included.push(task.name.clone());
                }
                (TaskStatus::Succeeded, _) => {}
                _ => excluded.push((task.name.clone(), task.status.to_string())),
            }
        }

        if patches.is_empty() {
            return Err(IntegrationError::NothingToIntegrate.into());
        }

        let fingerprint = patch_set_fingerprint(&patches)?;
        let branch = branch_name(run);
        let title = run.story.title.clone();
        let commit_message = commit_message(run, &included, &excluded, &fingerprint);
        let body = pr_body(run, &included, &excluded, &fingerprint);

        Ok(Self {
            patches,
            branch,
            title,
            commit_message,
            body,
            fingerprint,
            included,
            excluded,
        })
    }
}

/// `autopr/<slug of story title>-<short run id>`.
pub fn branch_name(run: &OrchestrationRun) -> String {
    format!("autopr/{}-{}", run.story.slug(), run.id.short())
}

/// Marker embedded in the pull request body.
pub fn fingerprint_marker(fingerprint: &str) -> String {
    format!("{}{}{}", FINGERPRINT_PREFIX, fingerprint, FINGERPRINT_SUFFIX)
}

/// The fingerprint carried by a pull request body, if any.
pub fn parse_fingerprint(body: &str) -> Option<&str> {
    let start = body.find(FINGERPRINT_PREFIX)? + FINGERPRINT_PREFIX.len();
    let len = body[start..].find(FINGERPRINT_SUFFIX)?;
    Some(body[start..start + len].trim())
}

/// The fingerprint trailer of a commit message, if any.
pub fn parse_commit_fingerprint(message: &str) -> Option<&str> {
    message
        .lines()
        .find_map(|line| line.strip_prefix(FINGERPRINT_TRAILER))
        .map(str::trim)
        .filter(|fp| !fp.is_empty())
}

fn commit_message(
    run: &OrchestrationRun,
    included: &[String],
    excluded: &[(String, String)],
    fingerprint: &str,
) -> String {
    let mut msg = format!("{}\n", run.story.title);
    if !run.story.summary.is_empty() {
        let _ = write!(msg, "\n{}\n", run.story.summary);
    }
    msg.push_str("\nIncluded tasks:\n");
    for name in included {
        let _ = writeln!(msg, "- {}", name);
    }
    if !excluded.is_empty() {
        msg.push_str("\nExcluded tasks:\n");
        for (name, reason) in excluded {
            let _ = writeln!(msg, "- {} ({})", name, reason);
        }
    }
    let _ = write!(
        msg,
        "\nAutopr-Run: {}\n{}{}\n",
        run.id, FINGERPRINT_TRAILER, fingerprint
    );
    msg
}

fn pr_body(
    run: &OrchestrationRun,
    included: &[String],
    excluded: &[(String, String)],
    fingerprint: &str,
) -> String {
    let mut body = String::new();
    if !run.story.summary.is_empty() {
        let _ = writeln!(body, "{}\n", run.story.summary);
    }
    let _ = writeln!(body, "**Request:** {}\n", run.request.text());
    if !run.story.acceptance_criteria.is_empty() {
        body.push_str("## Acceptance criteria\n\n");
        for criterion in &run.story.acceptance_criteria {
            let _ = writeln!(body, "- [ ] {}", criterion);
        }
        body.push('\n');
    }
    if !run.story.technical_notes.is_empty() {
        let _ = writeln!(body, "## Technical notes\n\n{}\n", run.story.technical_notes);
    }
    body.push_str("## Included tasks\n\n");
    for name in included {
        let _ = writeln!(body, "- {}", name);
    }
    body.push('\n');
    if !excluded.is_empty() {
        body.push_str("## Excluded tasks\n\n");
        for (name, reason) in excluded {
            let _ = writeln!(body, "- {}: {}", name, reason);
        }
        body.push('\n');
    }
    let _ = writeln!(body, "Run `{}`", run.id);
    body.push('\n');
    body.push_str(&fingerprint_marker(fingerprint));
    body.push('\n');
    body
}

pub struct Integrator {
    hosting: Arc<dyn HostingApi>,
    workspace: Arc<Workspace>,
    event_tx: Option<mpsc::Sender<RunEvent>>,
    cancel: Option<CancellationToken>,
}

impl Integrator {
    pub fn new(hosting: Arc<dyn HostingApi>, workspace: Arc<Workspace>) -> Self {
        Self {
            hosting,
            workspace,
            event_tx: None,
            cancel: None,
        }
    }

    /// Stop before anything is created on the remote once `cancel` fires.
    /// After the branch exists the integration runs to completion or rollback.
    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = Some(cancel);
        self
    }

    fn check_cancelled(&self) -> Result<()> {
        match &self.cancel {
            Some(cancel) if cancel.is_cancelled() => {
                warn!("cancelled before the remote was touched");
                Err(Error::Cancelled)
            }
            _ => Ok(()),
        }
    }

    pub fn with_events(mut self, tx: mpsc::Sender<RunEvent>) -> Self {
        self.event_tx = Some(tx);
        self
    }

    fn emit(&self, event: RunEvent) {
        if let Some(tx) = &self.event_tx {
            let _ = tx.try_send(event);
        }
    }

    /// Publish the run's succeeded patches as one pull request and return
    /// its URL.
    ///
    /// # Errors
    /// - `NothingToIntegrate` when there is no non-empty patch; nothing is
    ///   created on the remote
    /// - `Cancelled` when the cancel token fired before the branch was created
    /// - `BranchExists` when the branch exists and carries another patch set
    /// - `PatchConflict` when a patch does not apply; the branch is deleted
    /// - `MirrorFailure` when the local mirror cannot reach the current base;
    ///   the branch is deleted
    /// - `HostingApiFailure` when a remote call fails after the branch was
    ///   created; the branch is deleted
    pub async fn integrate(&self, run: &OrchestrationRun) -> Result<String> {
        self.check_cancelled()?;
        let unit = IntegrationUnit::from_run(run)?;
        let repo = run.request.target_repo();
        info!(
            repo,
            branch = %unit.branch,
            patches = unit.patches.len(),
            excluded = unit.excluded.len(),
            "integrating"
        );
        self.emit(RunEvent::IntegrationStarted {
            run_id: run.id,
            branch: unit.branch.clone(),
        });

        let exists = self
            .hosting
            .branch_exists(repo, &unit.branch)
            .await
            .map_err(|e| hosting_failure("branch_exists", e))?;
        if exists {
            let url = self.resume(repo, &unit).await?;
            self.emit(RunEvent::IntegrationFinished {
                run_id: run.id,
                pr_url: url.clone(),
            });
            return Ok(url);
        }

        let base = self
            .hosting
            .get_default_branch(repo)
            .await
            .map_err(|e| hosting_failure("get_default_branch", e))?;
        self.check_cancelled()?;
        self.hosting
            .create_branch(repo, &base.sha, &unit.branch)
            .await
            .map_err(|e| hosting_failure("create_branch", e))?;

        match self.publish(repo, &base.sha, &base.name, &unit).await {
            Ok(url) => {
                info!(repo, %url, "pull request opened");
                self.emit(RunEvent::IntegrationFinished {
                    run_id: run.id,
                    pr_url: url.clone(),
                });
                Ok(url)
            }
            Err(e) => {
                error!(repo, branch = %unit.branch, %e, "integration failed, rolling back branch");
                if let Err(rollback) = self.hosting.delete_branch(repo, &unit.branch).await {
                    warn!(repo, branch = %unit.branch, %rollback, "failed to delete branch during rollback");
                }
                Err(e)
            }
        }
    }

    /// Everything after branch creation. Any error here triggers rollback.
    async fn publish(
        &self,
        repo: &str,
        base_sha: &str,
        base_branch: &str,
        unit: &IntegrationUnit,
    ) -> Result<String> {
        let files = self.apply(base_sha, &unit.patches).await?;
        debug!(files = files.len(), "patch set applied");

        self.hosting
            .commit(repo, &unit.branch, &files, &unit.commit_message)
            .await
            .map_err(|e| hosting_failure("commit", e))?;
        let pr = self
            .hosting
            .open_pull_request(repo, &unit.branch, base_branch, &unit.title, &unit.body)
            .await
            .map_err(|e| hosting_failure("open_pull_request", e))?;
        Ok(pr.url)
    }

    /// Apply the patch set on `base_sha`, refreshing the mirror first if the
    /// base moved after it was fetched.
    async fn apply(&self, base_sha: &str, patches: &[Patch]) -> Result<Vec<FileChange>> {
        let workspace = Arc::clone(&self.workspace);
        let base = base_sha.to_string();
        let patches = patches.to_vec();
        blocking(move || {
            workspace.ensure_commit(&base)?;
            workspace.apply_patches(&base, &patches)
        })
        .await
        .map_err(|e| match e {
            Error::Integration(_) => e,
            other => IntegrationError::MirrorFailure {
                base: base_sha.to_string(),
                detail: other.to_string(),
            }
            .into(),
        })
    }

    /// The branch already exists. Return its pull request if it carries the
    /// same patch set; open one if the branch holds this patch set's commit
    /// but no pull request was opened for it.
    async fn resume(&self, repo: &str, unit: &IntegrationUnit) -> Result<String> {
        let pr = self
            .hosting
            .find_pull_request(repo, &unit.branch)
            .await
            .map_err(|e| hosting_failure("find_pull_request", e))?;
        let fingerprint = unit.fingerprint.as_str();
        match pr {
            Some(pr) if parse_fingerprint(&pr.body) == Some(fingerprint) => {
                info!(repo, url = %pr.url, "pull request already exists for this patch set");
                Ok(pr.url)
            }
            Some(_) => Err(self.branch_taken(repo, unit)),
            None => {
                let message = self
                    .hosting
                    .head_commit_message(repo, &unit.branch)
                    .await
                    .map_err(|e| hosting_failure("head_commit_message", e))?;
                if parse_commit_fingerprint(&message) != Some(fingerprint) {
                    return Err(self.branch_taken(repo, unit));
                }
                self.check_cancelled()?;
                info!(repo, branch = %unit.branch, "branch holds this patch set, opening missing pull request");
                let base = self
                    .hosting
                    .get_default_branch(repo)
                    .await
                    .map_err(|e| hosting_failure("get_default_branch", e))?;
                let pr = self
                    .hosting
                    .open_pull_request(repo, &unit.branch, &base.name, &unit.title, &unit.body)
                    .await
                    .map_err(|e| hosting_failure("open_pull_request", e))?;
                Ok(pr.url)
            }
        }
    }

    fn branch_taken(&self, repo: &str, unit: &IntegrationUnit) -> Error {
        warn!(repo, branch = %unit.branch, "branch exists with a different patch set");
        IntegrationError::BranchExists {
            branch: unit.branch.clone(),
        }
        .into()
    }
}

fn hosting_failure(operation: &str, e: Error) -> Error {
    IntegrationError::HostingApiFailure {
        operation: operation.to_string(),
        detail: e.to_string(),
    }
    .into()
}
