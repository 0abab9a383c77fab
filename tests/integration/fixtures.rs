//! Test fixtures for integration tests.
//!
//! Provides helpers for:
//! - A temporary "remote" git repository the workspaces clone from
//! - An in-memory hosting API that records every call
//! - A canned inference service
//! - A scripted agent runtime that edits real worktrees

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use git2::{Repository, Signature};
use serde_json::json;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

use autopr::agent::{AgentInvocation, AgentRuntime};
use autopr::config::Config;
use autopr::core::{AgentResult, Patch};
use autopr::error::AgentError;
use autopr::git::{Workspace, Workspaces};
use autopr::hosting::{BranchRef, FileChange, HostingApi, PullRequest};
use autopr::inference::{CompletionRequest, InferenceService};
use autopr::util::Backoff;
use autopr::{Error, Orchestrator, Result};

/// Repository identifier used throughout the suite.
pub const REPO: &str = "acme/widgets";

// ========== Remote repository ==========

/// A repository on disk standing in for the hosted one.
///
/// Lives at `<dir>/acme/widgets.git` so that `Workspaces` can clone it with
/// `dir` as the remote base.
pub struct TestRemote {
    pub dir: TempDir,
    pub path: PathBuf,
    pub head: String,
}

impl TestRemote {
    pub fn new() -> Self {
        Self::with_files(&[
            ("README.md", "# Widgets\n"),
            ("src/lib.rs", "pub fn widget() -> u32 {\n    1\n}\n"),
        ])
    }

    pub fn with_files(files: &[(&str, &str)]) -> Self {
        let dir = TempDir::new().expect("Failed to create temp directory");
        let path = dir.path().join(format!("{}.git", REPO));
        std::fs::create_dir_all(&path).expect("Failed to create remote dir");

        let repo = Repository::init(&path).expect("Failed to init git");
        for (file, content) in files {
            let full = path.join(file);
            if let Some(parent) = full.parent() {
                std::fs::create_dir_all(parent).unwrap();
            }
            std::fs::write(full, content).unwrap();
        }
        let mut index = repo.index().unwrap();
        index
            .add_all(["."].iter(), git2::IndexAddOption::DEFAULT, None)
            .unwrap();
        index.write().unwrap();
        let tree = repo.find_tree(index.write_tree().unwrap()).unwrap();
        let sig = Signature::now("Test User", "test@test.com").unwrap();
        let head = repo
            .commit(Some("HEAD"), &sig, &sig, "Initial commit", &tree, &[])
            .unwrap()
            .to_string();

        Self { dir, path, head }
    }

    pub fn base_url(&self) -> String {
        self.dir.path().to_string_lossy().into_owned()
    }

    /// Commit `file` on the remote's default branch, as another developer
    /// pushing would. Returns the new head.
    pub fn push_file(&self, file: &str, content: &str) -> String {
        push_file(&self.path, file, content)
    }
}

/// Commit `file` on top of HEAD of the repository at `path`.
pub fn push_file(path: &Path, file: &str, content: &str) -> String {
    let repo = Repository::open(path).expect("remote should open");
    std::fs::write(path.join(file), content).unwrap();
    let mut index = repo.index().unwrap();
    index.add_path(Path::new(file)).unwrap();
    index.write().unwrap();
    let tree = repo.find_tree(index.write_tree().unwrap()).unwrap();
    let sig = Signature::now("Other Dev", "other@test.com").unwrap();
    let parent = repo.head().unwrap().peel_to_commit().unwrap();
    repo.commit(Some("HEAD"), &sig, &sig, &format!("Add {}", file), &tree, &[&parent])
        .unwrap()
        .to_string()
}

/// Workspaces rooted in a fresh temp dir, cloning from `remote`.
pub fn workspaces(remote: &TestRemote, root: &Path) -> Workspaces {
    Workspaces::new(root.to_path_buf(), &remote.base_url())
}

// ========== Hosting ==========

#[derive(Debug, Clone, PartialEq)]
pub struct RecordedCommit {
    pub branch: String,
    pub files: Vec<FileChange>,
    pub message: String,
}

#[derive(Default)]
struct HostingState {
    branches: HashMap<String, String>,
    commits: Vec<RecordedCommit>,
    pulls: Vec<PullRequest>,
    calls: Vec<String>,
}

const DEFAULT_BRANCH: &str = "main";

/// In-memory hosting API for one repository.
///
/// The default branch tracks HEAD of the on-disk remote, so pushes made with
/// `TestRemote::push_file` move it.
pub struct FakeHosting {
    remote: PathBuf,
    state: Mutex<HostingState>,
    /// Operation names that fail with a server error.
    failing: Mutex<Vec<String>>,
    /// Tokens fired when the named operation is called.
    cancels: Mutex<Vec<(String, CancellationToken)>>,
}

impl FakeHosting {
    pub fn new(remote: &Path) -> Self {
        let mut state = HostingState::default();
        state
            .branches
            .insert(DEFAULT_BRANCH.to_string(), remote_head(remote));
        Self {
            remote: remote.to_path_buf(),
            state: Mutex::new(state),
            failing: Mutex::new(Vec::new()),
            cancels: Mutex::new(Vec::new()),
        }
    }

    /// Make every call to `operation` fail with HTTP 500.
    pub fn fail_on(&self, operation: &str) {
        self.failing.lock().unwrap().push(operation.to_string());
    }

    /// Let `operation` succeed again.
    pub fn recover(&self, operation: &str) {
        self.failing.lock().unwrap().retain(|op| op != operation);
    }

    /// Fire `token` whenever `operation` is called.
    pub fn cancel_on(&self, operation: &str, token: CancellationToken) {
        self.cancels
            .lock()
            .unwrap()
            .push((operation.to_string(), token));
    }

    pub fn has_branch(&self, name: &str) -> bool {
        self.state.lock().unwrap().branches.contains_key(name)
    }

    /// Branches other than the default one.
    pub fn created_branches(&self) -> Vec<String> {
        let state = self.state.lock().unwrap();
        let mut names: Vec<String> = state
            .branches
            .keys()
            .filter(|b| b.as_str() != DEFAULT_BRANCH)
            .cloned()
            .collect();
        names.sort();
        names
    }

    pub fn commits(&self) -> Vec<RecordedCommit> {
        self.state.lock().unwrap().commits.clone()
    }

    pub fn pulls(&self) -> Vec<PullRequest> {
        self.state.lock().unwrap().pulls.clone()
    }

    pub fn calls(&self) -> Vec<String> {
        self.state.lock().unwrap().calls.clone()
    }

    fn record(&self, operation: &str) -> Result<()> {
        self.state.lock().unwrap().calls.push(operation.to_string());
        for (op, token) in self.cancels.lock().unwrap().iter() {
            if op == operation {
                token.cancel();
            }
        }
        if self.failing.lock().unwrap().iter().any(|op| op == operation) {
            return Err(Error::Hosting {
                status: 500,
                message: format!("{} exploded", operation),
            });
        }
        Ok(())
    }

    fn check_repo(repo: &str) -> Result<()> {
        if repo == REPO {
            Ok(())
        } else {
            Err(Error::Hosting {
                status: 404,
                message: "Not Found".to_string(),
            })
        }
    }
}

#[async_trait]
impl HostingApi for FakeHosting {
    async fn get_default_branch(&self, repo: &str) -> Result<BranchRef> {
        self.record("get_default_branch")?;
        Self::check_repo(repo)?;
        let sha = remote_head(&self.remote);
        self.state
            .lock()
            .unwrap()
            .branches
            .insert(DEFAULT_BRANCH.to_string(), sha.clone());
        Ok(BranchRef {
            name: DEFAULT_BRANCH.to_string(),
            sha,
        })
    }

    async fn branch_exists(&self, repo: &str, name: &str) -> Result<bool> {
        self.record("branch_exists")?;
        Self::check_repo(repo)?;
        Ok(self.has_branch(name))
    }

    async fn create_branch(&self, repo: &str, base_sha: &str, name: &str) -> Result<()> {
        self.record("create_branch")?;
        Self::check_repo(repo)?;
        let mut state = self.state.lock().unwrap();
        if state.branches.contains_key(name) {
            return Err(Error::Hosting {
                status: 422,
                message: "Reference already exists".to_string(),
            });
        }
        state.branches.insert(name.to_string(), base_sha.to_string());
        Ok(())
    }

    async fn delete_branch(&self, repo: &str, name: &str) -> Result<()> {
        self.record("delete_branch")?;
        Self::check_repo(repo)?;
        self.state.lock().unwrap().branches.remove(name);
        Ok(())
    }

    async fn commit(
        &self,
        repo: &str,
        branch: &str,
        files: &[FileChange],
        message: &str,
    ) -> Result<String> {
        self.record("commit")?;
        Self::check_repo(repo)?;
        let mut state = self.state.lock().unwrap();
        let sha = format!("{:040x}", state.commits.len() + 1);
        state.branches.insert(branch.to_string(), sha.clone());
        state.commits.push(RecordedCommit {
            branch: branch.to_string(),
            files: files.to_vec(),
            message: message.to_string(),
        });
        Ok(sha)
    }

    async fn open_pull_request(
        &self,
        repo: &str,
        head: &str,
        base: &str,
        title: &str,
        body: &str,
    ) -> Result<PullRequest> {
        self.record("open_pull_request")?;
        Self::check_repo(repo)?;
        let mut state = self.state.lock().unwrap();
        let number = state.pulls.len() as u64 + 1;
        let pr = PullRequest {
            number,
            url: format!("https://github.com/{}/pull/{}", repo, number),
            title: title.to_string(),
            body: body.to_string(),
            head: head.to_string(),
            base: base.to_string(),
        };
        state.pulls.push(pr.clone());
        Ok(pr)
    }

    async fn find_pull_request(&self, repo: &str, head: &str) -> Result<Option<PullRequest>> {
        self.record("find_pull_request")?;
        Self::check_repo(repo)?;
        let state = self.state.lock().unwrap();
        Ok(state.pulls.iter().find(|pr| pr.head == head).cloned())
    }

    async fn head_commit_message(&self, repo: &str, branch: &str) -> Result<String> {
        self.record("head_commit_message")?;
        Self::check_repo(repo)?;
        let state = self.state.lock().unwrap();
        if !state.branches.contains_key(branch) {
            return Err(Error::Hosting {
                status: 404,
                message: "Not Found".to_string(),
            });
        }
        Ok(state
            .commits
            .iter()
            .rev()
            .find(|c| c.branch == branch)
            .map(|c| c.message.clone())
            .unwrap_or_else(|| "Initial commit".to_string()))
    }
}

fn remote_head(path: &Path) -> String {
    let repo = Repository::open(path).expect("remote should open");
    let head = repo.head().unwrap().peel_to_commit().unwrap().id().to_string();
    head
}

// ========== Inference ==========

/// Returns the same completion for every request.
pub struct FakeInference {
    completion: String,
    calls: AtomicUsize,
}

impl FakeInference {
    pub fn new(completion: impl Into<String>) -> Self {
        Self {
            completion: completion.into(),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl InferenceService for FakeInference {
    async fn complete(&self, _request: &CompletionRequest) -> Result<String> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.completion.clone())
    }
}

/// A planner completion with one task per `(id, name, depends_on)` entry,
/// wrapped in prose the way models tend to answer.
pub fn plan_completion(title: &str, tasks: &[(&str, &str, &[&str])]) -> String {
    let tasks: Vec<serde_json::Value> = tasks
        .iter()
        .map(|(id, name, deps)| {
            json!({
                "id": id,
                "name": name,
                "description": format!("Carry out {}", name),
                "kind": "implementation",
                "depends_on": deps,
            })
        })
        .collect();
    let plan = json!({
        "title": title,
        "summary": format!("As a maintainer I want: {}", title),
        "acceptance_criteria": ["the change is covered by tests"],
        "technical_notes": "keep the public API stable",
        "tasks": tasks,
    });
    format!("Here is the plan:\n```json\n{}\n```\n", plan)
}

// ========== Agent runtime ==========

/// Side effect run when an attempt starts.
pub type Hook = Arc<dyn Fn() + Send + Sync>;

/// What the fake agent does for one task, keyed by task name.
#[derive(Clone, Default)]
pub struct Script {
    /// Files written on a successful attempt.
    pub files: Vec<(String, String)>,
    /// Attempts (from the first) that report failure.
    pub fail_times: u32,
    /// Attempts (from the first) that never return.
    pub hang_times: u32,
    /// Files that must already exist in the snapshot.
    pub expect_files: Vec<String>,
    /// Fired as soon as the attempt starts.
    pub cancel: Option<CancellationToken>,
    /// Runs as soon as the attempt starts.
    pub hook: Option<Hook>,
}

impl Script {
    pub fn writes(path: &str, content: &str) -> Self {
        Self::default().and_writes(path, content)
    }

    pub fn and_writes(mut self, path: &str, content: &str) -> Self {
        self.files.push((path.to_string(), content.to_string()));
        self
    }

    pub fn failing(mut self, times: u32) -> Self {
        self.fail_times = times;
        self
    }

    pub fn hanging(mut self, times: u32) -> Self {
        self.hang_times = times;
        self
    }

    pub fn expecting(mut self, path: &str) -> Self {
        self.expect_files.push(path.to_string());
        self
    }

    pub fn cancelling(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }

    pub fn running(mut self, hook: impl Fn() + Send + Sync + 'static) -> Self {
        self.hook = Some(Arc::new(hook));
        self
    }
}

/// Agent runtime that follows a `Script` per task in a real worktree.
pub struct ScriptedRuntime {
    scripts: HashMap<String, Script>,
    scratch: TempDir,
    spawned: Mutex<Vec<(String, u32)>>,
    instructions: Mutex<Vec<String>>,
}

impl ScriptedRuntime {
    pub fn new(scripts: impl IntoIterator<Item = (&'static str, Script)>) -> Self {
        Self {
            scripts: scripts
                .into_iter()
                .map(|(name, script)| (name.to_string(), script))
                .collect(),
            scratch: TempDir::new().expect("Failed to create scratch dir"),
            spawned: Mutex::new(Vec::new()),
            instructions: Mutex::new(Vec::new()),
        }
    }

    /// `(task name, attempt)` of every spawn, in order.
    pub fn spawned(&self) -> Vec<(String, u32)> {
        self.spawned.lock().unwrap().clone()
    }

    pub fn spawn_count(&self) -> usize {
        self.spawned.lock().unwrap().len()
    }

    pub fn attempts_of(&self, task: &str) -> u32 {
        self.spawned
            .lock()
            .unwrap()
            .iter()
            .filter(|(name, _)| name == task)
            .count() as u32
    }

    pub fn instructions(&self) -> Vec<String> {
        self.instructions.lock().unwrap().clone()
    }

    fn task_name(instructions: &str) -> String {
        instructions
            .lines()
            .next()
            .and_then(|line| line.strip_prefix("# Task: "))
            .unwrap_or_default()
            .to_string()
    }

    fn edit(&self, invocation: &AgentInvocation, script: &Script) -> Result<std::result::Result<String, String>> {
        let name = format!("fake-{}-a{}", invocation.task_id.short(), invocation.attempt);
        let path = self.scratch.path().join(&name);
        let workspace = Workspace::open(&invocation.snapshot.local_path)?;
        workspace.materialize(&invocation.snapshot, &name, &path)?;

        let missing: Vec<&String> = script
            .expect_files
            .iter()
            .filter(|f| !path.join(f).exists())
            .collect();
        let outcome = if missing.is_empty() {
            for (file, content) in &script.files {
                let full = path.join(file);
                if let Some(parent) = full.parent() {
                    std::fs::create_dir_all(parent)?;
                }
                std::fs::write(full, content)?;
            }
            Ok(Workspace::diff_workdir(&path)?)
        } else {
            Err(format!("snapshot is missing {:?}", missing))
        };

        workspace.remove_worktree(&name, &path)?;
        Ok(outcome)
    }
}

#[async_trait]
impl AgentRuntime for ScriptedRuntime {
    async fn spawn(&self, invocation: &AgentInvocation) -> Result<AgentResult> {
        let name = Self::task_name(&invocation.instructions);
        let script = self.scripts.get(&name).cloned().unwrap_or_default();
        self.spawned
            .lock()
            .unwrap()
            .push((name.clone(), invocation.attempt));
        self.instructions
            .lock()
            .unwrap()
            .push(invocation.instructions.clone());

        if let Some(token) = &script.cancel {
            token.cancel();
        }
        if let Some(hook) = &script.hook {
            hook();
        }
        if invocation.attempt <= script.hang_times {
            tokio::time::sleep(Duration::from_secs(3600)).await;
        }
        if invocation.attempt <= script.fail_times {
            return Ok(AgentResult::failure(
                invocation.task_id,
                invocation.attempt,
                AgentError::ExecutionFailure(format!(
                    "{} broke on attempt {}",
                    name, invocation.attempt
                )),
            ));
        }

        match self.edit(invocation, &script)? {
            Ok(diff) => Ok(AgentResult::success(
                invocation.task_id,
                invocation.attempt,
                Patch::new(invocation.task_id, diff),
            )),
            Err(detail) => Ok(AgentResult::failure(
                invocation.task_id,
                invocation.attempt,
                AgentError::ExecutionFailure(detail),
            )),
        }
    }
}

// ========== Harness ==========

/// Everything one orchestrator test needs, with handles on the fakes.
pub struct Harness {
    pub remote: TestRemote,
    pub workspace_root: TempDir,
    pub hosting: Arc<FakeHosting>,
    pub inference: Arc<FakeInference>,
    pub runtime: Arc<ScriptedRuntime>,
    pub orchestrator: Orchestrator,
}

impl Harness {
    pub fn new(completion: String, runtime: ScriptedRuntime) -> Self {
        Self::with_config(completion, runtime, test_config())
    }

    pub fn with_config(completion: String, runtime: ScriptedRuntime, config: Config) -> Self {
        Self::build(TestRemote::new(), completion, runtime, config)
    }

    /// Harness over a remote the test already holds paths into.
    pub fn on_remote(remote: TestRemote, completion: String, runtime: ScriptedRuntime) -> Self {
        Self::build(remote, completion, runtime, test_config())
    }

    fn build(remote: TestRemote, completion: String, runtime: ScriptedRuntime, config: Config) -> Self {
        let workspace_root = TempDir::new().expect("Failed to create workspace root");
        let hosting = Arc::new(FakeHosting::new(&remote.path));
        let inference = Arc::new(FakeInference::new(completion));
        let runtime = Arc::new(runtime);
        let orchestrator = Orchestrator::new(
            config,
            inference.clone(),
            hosting.clone(),
            runtime.clone(),
            workspaces(&remote, workspace_root.path()),
        );
        Self {
            remote,
            workspace_root,
            hosting,
            inference,
            runtime,
            orchestrator,
        }
    }

    /// Local mirror the orchestrator cloned for `REPO`.
    pub fn mirror(&self) -> Workspace {
        Workspace::open(&self.workspace_root.path().join(REPO)).expect("mirror should exist")
    }
}

/// Config with fast retries and a short task timeout.
pub fn test_config() -> Config {
    Config {
        max_concurrency: 2,
        max_retries: 2,
        task_timeout_secs: 5,
        backoff: Backoff::immediate(2),
        ..Config::default()
    }
}

/// Content of `path` in a recorded commit.
pub fn file_content<'a>(commit: &'a RecordedCommit, path: &str) -> Option<&'a str> {
    commit
        .files
        .iter()
        .find(|f| f.path == path)
        .and_then(|f| f.content.as_deref())
}
