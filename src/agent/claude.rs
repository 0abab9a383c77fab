//! Agent runtime backed by Claude Code in headless mode.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tracing::{debug, info, warn};

use super::{AgentInvocation, AgentRuntime};
use crate::core::{AgentResult, Patch};
use crate::error::AgentError;
use crate::git::Workspace;
use crate::orchestration::{ClaudeHeadless, ClaudeOutcome};
use crate::util::blocking;
use crate::{Error, Result};

const AGENT_SYSTEM_PROMPT: &str = "You are working in a scratch checkout of the repository. \
Make the requested change by editing files in the current directory. \
Do not commit, push, or create branches; your uncommitted edits are collected automatically.";

/// A materialized attempt worktree.
///
/// `release` removes it at the end of an attempt. An attempt whose future is
/// dropped (supervisor timeout, cancellation) never gets there, so `Drop`
/// hands the removal to the blocking pool, or does it inline outside a
/// runtime.
struct ScratchWorktree {
    repo_path: PathBuf,
    name: String,
    path: PathBuf,
}

impl ScratchWorktree {
    fn path(&self) -> &Path {
        &self.path
    }

    fn take(&mut self) -> (PathBuf, String, PathBuf) {
        (
            std::mem::take(&mut self.repo_path),
            std::mem::take(&mut self.name),
            std::mem::take(&mut self.path),
        )
    }

    async fn release(mut self) {
        let (repo_path, name, path) = self.take();
        let task = name.clone();
        let removed = blocking(move || Workspace::open(&repo_path)?.remove_worktree(&name, &path)).await;
        if let Err(e) = removed {
            warn!(name = %task, %e, "failed to remove agent worktree");
        }
    }

    fn remove(repo_path: &Path, name: &str, path: &Path) {
        let removed = Workspace::open(repo_path).and_then(|ws| ws.remove_worktree(name, path));
        if let Err(e) = removed {
            warn!(name, %e, "failed to remove agent worktree");
        }
    }
}

impl Drop for ScratchWorktree {
    fn drop(&mut self) {
        if self.name.is_empty() {
            return;
        }
        let (repo_path, name, path) = self.take();
        debug!(name = %name, "attempt abandoned, removing its worktree");
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn_blocking(move || Self::remove(&repo_path, &name, &path));
            }
            Err(_) => Self::remove(&repo_path, &name, &path),
        }
    }
}

/// Runs each attempt in its own git worktree and reports the resulting diff.
pub struct ClaudeAgentRuntime {
    claude: ClaudeHeadless,
    scratch_root: PathBuf,
}

impl ClaudeAgentRuntime {
    /// `scratch_root` holds the per-attempt worktrees; they are removed after
    /// each attempt.
    pub fn new(claude: ClaudeHeadless, scratch_root: PathBuf) -> Self {
        Self {
            claude,
            scratch_root,
        }
    }

    fn worktree_name(invocation: &AgentInvocation) -> String {
        format!(
            "autopr-{}-a{}",
            invocation.task_id.short(),
            invocation.attempt
        )
    }
}

#[async_trait]
impl AgentRuntime for ClaudeAgentRuntime {
    async fn spawn(&self, invocation: &AgentInvocation) -> Result<AgentResult> {
        let name = Self::worktree_name(invocation);
        let path = self.scratch_root.join(&name);
        let repo_path = invocation.snapshot.local_path.clone();
        info!(
            task = %invocation.task_id.short(),
            attempt = invocation.attempt,
            patches = invocation.snapshot.patches.len(),
            "spawning agent"
        );

        {
            let snapshot = invocation.snapshot.clone();
            let (name, path) = (name.clone(), path.clone());
            blocking(move || Workspace::open(&snapshot.local_path)?.materialize(&snapshot, &name, &path))
                .await?;
        }
        let worktree = ScratchWorktree {
            repo_path,
            name,
            path,
        };

        let tools = invocation.capabilities.allowed_tools();
        let outcome = self
            .claude
            .clone()
            .with_timeout(invocation.timeout)
            .run(&invocation.instructions, Some(AGENT_SYSTEM_PROMPT), worktree.path(), &tools)
            .await;

        let result = match outcome {
            Ok(run) => match run.outcome {
                ClaudeOutcome::Completed { .. } => {
                    let diff_path = worktree.path().to_path_buf();
                    blocking(move || Workspace::diff_workdir(&diff_path))
                        .await
                        .map(|diff| {
                            debug!(
                                task = %invocation.task_id.short(),
                                bytes = diff.len(),
                                turns = ?run.num_turns,
                                cost_usd = ?run.cost_usd,
                                "agent finished"
                            );
                            AgentResult::success(
                                invocation.task_id,
                                invocation.attempt,
                                Patch::new(invocation.task_id, diff),
                            )
                        })
                }
                ClaudeOutcome::Failed { reason } => Ok(AgentResult::failure(
                    invocation.task_id,
                    invocation.attempt,
                    AgentError::ExecutionFailure(reason),
                )),
            },
            Err(Error::Timeout(duration)) => Ok(AgentResult::failure(
                invocation.task_id,
                invocation.attempt,
                AgentError::Timeout(duration),
            )),
            Err(e) => Err(e),
        };

        worktree.release().await;
        result
    }
}
