//! Agent execution contexts.
//!
//! An agent performs one task against an isolated copy of the repository and
//! reports a patch. It never sees other agents' in-flight work: everything it
//! may read arrives in its `RepoSnapshot`, and everything it may do is listed
//! in its `CapabilitySet`.

mod claude;

pub use claude::ClaudeAgentRuntime;

use std::collections::BTreeSet;
use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::core::{AgentResult, Patch, TaskId, TaskKind};
use crate::Result;

/// A single permission granted to an agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    ReadFiles,
    WriteFiles,
    ShellExec,
    WebSearch,
    Inference,
}

impl Capability {
    /// Claude Code tool names this capability unlocks.
    pub fn tools(&self) -> &'static [&'static str] {
        match self {
            Capability::ReadFiles => &["Read", "Glob", "Grep"],
            Capability::WriteFiles => &["Edit", "Write"],
            Capability::ShellExec => &["Bash"],
            Capability::WebSearch => &["WebSearch", "WebFetch"],
            Capability::Inference => &[],
        }
    }
}

/// The explicit set of capabilities an agent runs with.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct CapabilitySet(BTreeSet<Capability>);

impl CapabilitySet {
    pub fn new(capabilities: impl IntoIterator<Item = Capability>) -> Self {
        Self(capabilities.into_iter().collect())
    }

    /// Capabilities granted to each kind of task.
    ///
    /// Research and security tasks never write files; only implementation
    /// and security tasks may run commands.
    pub fn for_kind(kind: TaskKind) -> Self {
        use Capability::*;
        let mut set = BTreeSet::from([ReadFiles, Inference]);
        if kind.writes_files() {
            set.insert(WriteFiles);
        }
        match kind {
            TaskKind::Research => {
                set.insert(WebSearch);
            }
            TaskKind::Implementation | TaskKind::Security => {
                set.insert(ShellExec);
            }
            TaskKind::Architecture | TaskKind::Documentation => {}
        }
        Self(set)
    }

    pub fn contains(&self, capability: Capability) -> bool {
        self.0.contains(&capability)
    }

    pub fn iter(&self) -> impl Iterator<Item = Capability> + '_ {
        self.0.iter().copied()
    }

    /// Deduplicated tool names for the whole set.
    pub fn allowed_tools(&self) -> Vec<String> {
        let tools: BTreeSet<&str> = self.iter().flat_map(|c| c.tools().iter().copied()).collect();
        tools.into_iter().map(String::from).collect()
    }
}

/// Read-only view of the repository handed to an agent.
///
/// The base commit plus the patches of every transitive dependency, in
/// topological order. Each agent materializes its own copy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepoSnapshot {
    /// Repository identifier (`owner/name`).
    pub repo: String,
    /// Local mirror the snapshot is materialized from.
    pub local_path: PathBuf,
    pub base_commit: String,
    pub patches: Vec<Patch>,
}

impl RepoSnapshot {
    pub fn new(repo: &str, local_path: PathBuf, base_commit: &str) -> Self {
        Self {
            repo: repo.to_string(),
            local_path,
            base_commit: base_commit.to_string(),
            patches: Vec::new(),
        }
    }

    /// A copy of this snapshot with `patches` layered on top.
    pub fn with_patches(&self, patches: Vec<Patch>) -> Self {
        let mut snapshot = self.clone();
        snapshot.patches.extend(patches);
        snapshot
    }
}

/// Everything an agent needs for one attempt at one task.
#[derive(Debug, Clone)]
pub struct AgentInvocation {
    pub task_id: TaskId,
    /// 1-based attempt number.
    pub attempt: u32,
    pub instructions: String,
    pub snapshot: RepoSnapshot,
    pub capabilities: CapabilitySet,
    pub timeout: Duration,
}

/// Spawns isolated agent contexts.
///
/// `Err` means the runtime itself broke (could not create the workspace,
/// binary missing); an agent that ran and failed returns `Ok` with a failure
/// result. The supervisor retries both.
#[async_trait]
pub trait AgentRuntime: Send + Sync {
    async fn spawn(&self, invocation: &AgentInvocation) -> Result<AgentResult>;
}
