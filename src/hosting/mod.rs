//! Code hosting seam: branches, commits and pull requests on the remote.
//!
//! Only the integrator mutates the remote. Everything else reads through
//! `get_default_branch`.

mod github;

pub use github::GitHubClient;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::Result;

/// A branch name and the commit it points at.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BranchRef {
    pub name: String,
    pub sha: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PullRequest {
    pub number: u64,
    pub url: String,
    pub title: String,
    #[serde(default)]
    pub body: String,
    pub head: String,
    pub base: String,
}

/// Tree entry mode of a written file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileMode {
    #[default]
    Regular,
    Executable,
    /// Content is the link target.
    Symlink,
}

impl FileMode {
    /// Octal mode string as git trees spell it.
    pub fn as_git_mode(&self) -> &'static str {
        match self {
            FileMode::Regular => "100644",
            FileMode::Executable => "100755",
            FileMode::Symlink => "120000",
        }
    }
}

/// Final content of one file in a commit. `None` deletes the file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileChange {
    pub path: String,
    pub content: Option<String>,
    #[serde(default)]
    pub mode: FileMode,
}

impl FileChange {
    pub fn write(path: &str, content: &str) -> Self {
        Self {
            path: path.to_string(),
            content: Some(content.to_string()),
            mode: FileMode::Regular,
        }
    }

    pub fn delete(path: &str) -> Self {
        Self {
            path: path.to_string(),
            content: None,
            mode: FileMode::Regular,
        }
    }

    pub fn with_mode(mut self, mode: FileMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn is_delete(&self) -> bool {
        self.content.is_none()
    }
}

/// Remote repository operations, keyed by `owner/name`.
#[async_trait]
pub trait HostingApi: Send + Sync {
    async fn get_default_branch(&self, repo: &str) -> Result<BranchRef>;

    async fn branch_exists(&self, repo: &str, name: &str) -> Result<bool>;

    /// Create `name` pointing at `base_sha`.
    async fn create_branch(&self, repo: &str, base_sha: &str, name: &str) -> Result<()>;

    /// Delete `name`. Deleting a missing branch succeeds.
    async fn delete_branch(&self, repo: &str, name: &str) -> Result<()>;

    /// Commit `files` on top of the branch tip and advance the branch.
    /// Returns the new commit sha.
    async fn commit(
        &self,
        repo: &str,
        branch: &str,
        files: &[FileChange],
        message: &str,
    ) -> Result<String>;

    async fn open_pull_request(
        &self,
        repo: &str,
        head: &str,
        base: &str,
        title: &str,
        body: &str,
    ) -> Result<PullRequest>;

    /// The open pull request whose head is `head`, if any.
    async fn find_pull_request(&self, repo: &str, head: &str) -> Result<Option<PullRequest>>;

    /// Message of the commit `branch` points at.
    async fn head_commit_message(&self, repo: &str, branch: &str) -> Result<String>;
}
