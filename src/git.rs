//! Local repository mirrors.
//!
//! A `Workspace` wraps a clone of the target repository. Agents get scratch
//! worktrees materialized from a `RepoSnapshot`; the integrator applies the
//! final patch set in memory and reads back the resulting file contents.

use std::path::{Path, PathBuf};

use git2::build::RepoBuilder;
use git2::{
    ApplyLocation, BranchType, Cred, Delta, Diff, DiffFormat, DiffOptions, ErrorCode,
    FetchOptions, IndexAddOption, ObjectType, Oid, RemoteCallbacks, Repository, Signature,
    WorktreeAddOptions, WorktreePruneOptions,
};
use tracing::{debug, warn};

use crate::agent::RepoSnapshot;
use crate::config::Config;
use crate::core::Patch;
use crate::error::IntegrationError;
use crate::hosting::{FileChange, FileMode};
use crate::{Error, Result};

/// Prefix of the throwaway branches backing agent worktrees.
const SCRATCH_PREFIX: &str = "autopr-scratch";

#[derive(Debug, Clone)]
pub struct Workspace {
    repo_path: PathBuf,
    /// Credential for later fetches from origin.
    token: Option<String>,
}

impl Workspace {
    pub fn open(repo_path: &Path) -> Result<Self> {
        debug!(path = %repo_path.display(), "opening workspace");
        let _ = Repository::discover(repo_path)?;
        Ok(Self {
            repo_path: repo_path.to_path_buf(),
            token: None,
        })
    }

    /// Clone `url` into `path`, or fetch if a clone is already there.
    pub fn clone_or_fetch(url: &str, path: &Path, token: Option<&str>) -> Result<Self> {
        if Repository::open(path).is_ok() {
            let mut workspace = Self::open(path)?;
            workspace.token = token.map(String::from);
            workspace.fetch(token)?;
            return Ok(workspace);
        }
        debug!(url, path = %path.display(), "cloning");
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        RepoBuilder::new()
            .fetch_options(fetch_options(token))
            .clone(url, path)?;
        Ok(Self {
            repo_path: path.to_path_buf(),
            token: token.map(String::from),
        })
    }

    fn repo(&self) -> Result<Repository> {
        Ok(Repository::discover(&self.repo_path)?)
    }

    pub fn repo_path(&self) -> &Path {
        &self.repo_path
    }

    pub fn fetch(&self, token: Option<&str>) -> Result<()> {
        debug!(path = %self.repo_path.display(), "fetching origin");
        let repo = self.repo()?;
        let mut remote = repo.find_remote("origin")?;
        remote.fetch(
            &["+refs/heads/*:refs/remotes/origin/*"],
            Some(&mut fetch_options(token)),
            None,
        )?;
        Ok(())
    }

    pub fn head_commit(&self) -> Result<String> {
        let repo = self.repo()?;
        let commit = repo.head()?.peel_to_commit()?;
        Ok(commit.id().to_string())
    }

    pub fn has_commit(&self, sha: &str) -> bool {
        let Ok(repo) = self.repo() else {
            return false;
        };
        let found = Oid::from_str(sha)
            .and_then(|oid| repo.find_commit(oid))
            .is_ok();
        found
    }

    /// Make sure `sha` is present, fetching origin once if it is not.
    ///
    /// The default branch can move while agents run; the mirror only knows
    /// what it saw at the last fetch.
    pub fn ensure_commit(&self, sha: &str) -> Result<()> {
        if self.has_commit(sha) {
            return Ok(());
        }
        debug!(sha, "commit not in mirror, refetching");
        self.fetch(self.token.as_deref())?;
        if self.has_commit(sha) {
            Ok(())
        } else {
            Err(Error::Validation(format!(
                "commit {} is not reachable from origin",
                sha
            )))
        }
    }

    /// Create a worktree at `worktree_path` on a scratch branch at `base_sha`.
    pub fn create_worktree(&self, name: &str, base_sha: &str, worktree_path: &Path) -> Result<()> {
        debug!(name, base = base_sha, path = %worktree_path.display(), "creating worktree");
        let repo = self.repo()?;
        let commit = repo.find_commit(Oid::from_str(base_sha)?)?;
        let branch = repo.branch(&scratch_branch(name), &commit, true)?;
        let branch_ref = branch.into_reference();
        let mut opts = WorktreeAddOptions::new();
        opts.reference(Some(&branch_ref));
        if let Some(parent) = worktree_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        repo.worktree(name, worktree_path, Some(&opts))?;
        Ok(())
    }

    /// Remove a worktree and its scratch branch.
    ///
    /// The branch can only be deleted once the worktree is pruned, otherwise
    /// git reports it as checked out.
    pub fn remove_worktree(&self, name: &str, worktree_path: &Path) -> Result<()> {
        debug!(name, path = %worktree_path.display(), "removing worktree");
        let repo = self.repo()?;
        if worktree_path.exists() {
            std::fs::remove_dir_all(worktree_path)?;
        }
        if let Ok(worktree) = repo.find_worktree(name) {
            let _ = worktree.unlock();
            if let Err(e) = worktree.prune(Some(
                WorktreePruneOptions::new()
                    .valid(true)
                    .working_tree(true)
                    .locked(true),
            )) {
                warn!(name, %e, "failed to prune worktree");
            }
        }
        self.delete_branch(&scratch_branch(name))
    }

    /// Delete a local branch. Missing branches are fine.
    pub fn delete_branch(&self, branch: &str) -> Result<()> {
        let repo = self.repo()?;
        match repo.find_branch(branch, BranchType::Local) {
            Ok(mut branch_ref) => {
                if let Err(e) = branch_ref.delete() {
                    warn!(branch, %e, "failed to delete branch");
                }
            }
            Err(e) if e.code() == ErrorCode::NotFound => {}
            Err(e) => warn!(branch, %e, "error looking up branch"),
        }
        Ok(())
    }

    /// Check out `snapshot` into a fresh worktree.
    ///
    /// Dependency patches are applied and committed so that a later
    /// `diff_workdir` reports only the agent's own edits.
    pub fn materialize(
        &self,
        snapshot: &RepoSnapshot,
        name: &str,
        worktree_path: &Path,
    ) -> Result<()> {
        self.create_worktree(name, &snapshot.base_commit, worktree_path)?;
        let populated = self.layer_patches(snapshot, worktree_path);
        if populated.is_err() {
            let _ = self.remove_worktree(name, worktree_path);
        }
        populated
    }

    fn layer_patches(&self, snapshot: &RepoSnapshot, worktree_path: &Path) -> Result<()> {
        let patches: Vec<&Patch> = snapshot.patches.iter().filter(|p| !p.is_empty()).collect();
        if patches.is_empty() {
            return Ok(());
        }
        let repo = Repository::open(worktree_path)?;
        for patch in &patches {
            let diff = Diff::from_buffer(patch.diff.as_bytes())?;
            repo.apply(&diff, ApplyLocation::Both, None).map_err(|e| {
                Error::Validation(format!(
                    "dependency patch from task {} does not apply: {}",
                    patch.task_id,
                    e.message()
                ))
            })?;
        }
        commit_all(
            worktree_path,
            &format!("autopr snapshot: {} dependency patches", patches.len()),
        )
    }

    /// Unified diff of the worktree against its HEAD, untracked files included.
    pub fn diff_workdir(worktree_path: &Path) -> Result<String> {
        let repo = Repository::open(worktree_path)?;
        let head_tree = repo.head()?.peel_to_tree()?;
        let mut opts = DiffOptions::new();
        opts.include_untracked(true)
            .recurse_untracked_dirs(true)
            .show_untracked_content(true);
        let diff = repo.diff_tree_to_workdir_with_index(Some(&head_tree), Some(&mut opts))?;

        let mut out = Vec::new();
        diff.print(DiffFormat::Patch, |_delta, _hunk, line| {
            if matches!(line.origin(), '+' | '-' | ' ') {
                out.push(line.origin() as u8);
            }
            out.extend_from_slice(line.content());
            true
        })?;
        Ok(String::from_utf8_lossy(&out).into_owned())
    }

    /// Apply `patches` in order on top of `base_sha` without touching any
    /// checkout, and return the resulting file changes relative to the base.
    ///
    /// # Errors
    /// `PatchConflict` naming the first patch that does not apply.
    pub fn apply_patches(&self, base_sha: &str, patches: &[Patch]) -> Result<Vec<FileChange>> {
        let repo = self.repo()?;
        let base = repo.find_commit(Oid::from_str(base_sha)?)?;
        let base_tree = base.tree()?;
        let mut tree = base.tree()?;

        for patch in patches {
            let conflict = |e: git2::Error| -> Error {
                IntegrationError::PatchConflict {
                    task_id: patch.task_id,
                    detail: e.message().to_string(),
                }
                .into()
            };
            let diff = Diff::from_buffer(patch.diff.as_bytes()).map_err(conflict)?;
            let mut index = repo.apply_to_tree(&tree, &diff, None).map_err(conflict)?;
            let oid = index.write_tree_to(&repo)?;
            tree = repo.find_tree(oid)?;
            debug!(
                task = %patch.task_id.short(),
                tree = %oid,
                paths = ?patch.touched_paths(),
                "patch applied"
            );
        }

        let diff = repo.diff_tree_to_tree(Some(&base_tree), Some(&tree), None)?;
        let mut files = Vec::new();
        for delta in diff.deltas() {
            match delta.status() {
                Delta::Deleted => {
                    if let Some(path) = delta.old_file().path() {
                        files.push(FileChange::delete(&path.to_string_lossy()));
                    }
                }
                _ => {
                    let Some(path) = delta.new_file().path() else {
                        continue;
                    };
                    let path = path.to_string_lossy();
                    let blob = repo.find_blob(delta.new_file().id())?;
                    let content = std::str::from_utf8(blob.content()).map_err(|_| {
                        Error::Validation(format!("{} is not valid UTF-8 text", path))
                    })?;
                    let mode = file_mode(delta.new_file().mode());
                    files.push(FileChange::write(&path, content).with_mode(mode));
                }
            }
        }
        Ok(files)
    }
}

/// Content hash of an ordered patch set, stable across runs.
pub fn patch_set_fingerprint(patches: &[Patch]) -> Result<String> {
    let mut buf = Vec::new();
    for patch in patches {
        buf.extend_from_slice(patch.diff.as_bytes());
        buf.push(0);
    }
    Ok(Oid::hash_object(ObjectType::Blob, &buf)?.to_string())
}

fn file_mode(mode: git2::FileMode) -> FileMode {
    match mode {
        git2::FileMode::BlobExecutable => FileMode::Executable,
        git2::FileMode::Link => FileMode::Symlink,
        _ => FileMode::Regular,
    }
}

fn scratch_branch(name: &str) -> String {
    format!("{}/{}", SCRATCH_PREFIX, name)
}

fn fetch_options(token: Option<&str>) -> FetchOptions<'static> {
    let mut callbacks = RemoteCallbacks::new();
    if let Some(token) = token {
        let token = token.to_string();
        callbacks.credentials(move |_url, _user, _allowed| {
            Cred::userpass_plaintext("x-access-token", &token)
        });
    }
    let mut opts = FetchOptions::new();
    opts.remote_callbacks(callbacks);
    opts
}

fn commit_all(worktree_path: &Path, message: &str) -> Result<()> {
    let repo = Repository::open(worktree_path)?;
    let mut index = repo.index()?;
    index.add_all(["."].iter(), IndexAddOption::DEFAULT, None)?;
    index.write()?;

    let tree = repo.find_tree(index.write_tree()?)?;
    let sig = repo
        .signature()
        .or_else(|_| Signature::now("autopr", "autopr@localhost"))?;
    let parent = repo.head()?.peel_to_commit()?;
    let commit_id = repo.commit(Some("HEAD"), &sig, &sig, message, &tree, &[&parent])?;
    debug!(%commit_id, "snapshot committed");
    Ok(())
}

/// Where local mirrors live and where they are cloned from.
#[derive(Debug, Clone)]
pub struct Workspaces {
    root: PathBuf,
    remote_base: String,
    token: Option<String>,
}

impl Workspaces {
    /// `remote_base` is prefixed to `owner/name.git` to form clone URLs; it may
    /// be a URL or a local directory.
    pub fn new(root: PathBuf, remote_base: &str) -> Self {
        Self {
            root,
            remote_base: remote_base.trim_end_matches('/').to_string(),
            token: None,
        }
    }

    pub fn with_token(mut self, token: Option<String>) -> Self {
        self.token = token;
        self
    }

    pub fn from_config(config: &Config) -> Result<Self> {
        Ok(Self::new(config.workspaces_dir()?, config.effective_git_remote_base())
            .with_token(config.github_token().ok()))
    }

    pub fn local_path(&self, repo: &str) -> PathBuf {
        self.root.join(repo)
    }

    pub fn remote_url(&self, repo: &str) -> String {
        format!("{}/{}.git", self.remote_base, repo)
    }

    /// Scratch area for agent worktrees.
    pub fn scratch_root(&self) -> PathBuf {
        self.root.join(".scratch")
    }

    /// Bring the mirror of `repo` up to date and check it has `base_sha`.
    pub fn prepare(&self, repo: &str, base_sha: &str) -> Result<Workspace> {
        let workspace = Workspace::clone_or_fetch(
            &self.remote_url(repo),
            &self.local_path(repo),
            self.token.as_deref(),
        )?;
        if !workspace.has_commit(base_sha) {
            return Err(Error::Validation(format!(
                "mirror of {} does not contain commit {}",
                repo, base_sha
            )));
        }
        Ok(workspace)
    }
}
