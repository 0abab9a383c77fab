//! GitHub REST adapter.

use async_trait::async_trait;
use reqwest::{Method, RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, info, warn};

use super::{BranchRef, FileChange, HostingApi, PullRequest};
use crate::config::Config;
use crate::util::Backoff;
use crate::{Error, Result};

const USER_AGENT: &str = concat!("autopr/", env!("CARGO_PKG_VERSION"));
const API_VERSION: &str = "2022-11-28";

pub struct GitHubClient {
    http: reqwest::Client,
    base_url: String,
    token: Option<String>,
    backoff: Backoff,
}

#[derive(Debug, Deserialize)]
struct RepoInfo {
    default_branch: String,
}

#[derive(Debug, Deserialize)]
struct GitRef {
    object: GitObject,
}

#[derive(Debug, Deserialize)]
struct GitObject {
    sha: String,
}

#[derive(Debug, Deserialize)]
struct GitCommit {
    sha: String,
    tree: GitObject,
    #[serde(default)]
    message: String,
}

#[derive(Debug, Deserialize)]
struct RawPullRequest {
    number: u64,
    html_url: String,
    title: String,
    body: Option<String>,
    head: RawPrRef,
    base: RawPrRef,
}

#[derive(Debug, Deserialize)]
struct RawPrRef {
    #[serde(rename = "ref")]
    ref_field: String,
}

impl From<RawPullRequest> for PullRequest {
    fn from(pr: RawPullRequest) -> Self {
        Self {
            number: pr.number,
            url: pr.html_url,
            title: pr.title,
            body: pr.body.unwrap_or_default(),
            head: pr.head.ref_field,
            base: pr.base.ref_field,
        }
    }
}

impl GitHubClient {
    pub fn new(base_url: &str, token: Option<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            token,
            backoff: Backoff::default(),
        }
    }

    pub fn from_config(config: &Config) -> Result<Self> {
        Ok(Self::new(config.effective_github_api_url(), Some(config.github_token()?))
            .with_backoff(config.backoff))
    }

    /// Backoff applied to read requests.
    pub fn with_backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        let url = format!("{}{}", self.base_url, path);
        let mut req = self
            .http
            .request(method, url)
            .header("Accept", "application/vnd.github+json")
            .header("User-Agent", USER_AGENT)
            .header("X-GitHub-Api-Version", API_VERSION);
        if let Some(token) = &self.token {
            req = req.bearer_auth(token);
        }
        req
    }

    async fn check(response: Response) -> Result<Response> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        let message = serde_json::from_str::<Value>(&body)
            .ok()
            .and_then(|v| v.get("message").and_then(Value::as_str).map(String::from))
            .unwrap_or(body);
        Err(Error::Hosting {
            status: status.as_u16(),
            message,
        })
    }

    async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        self.backoff
            .retry(path, || async move {
                debug!(path, "GET");
                let response = self.request(Method::GET, path).send().await?;
                Ok(Self::check(response).await?.json::<T>().await?)
            })
            .await
    }

    async fn send_json<T: DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        body: &Value,
    ) -> Result<T> {
        debug!(%method, path, "sending");
        let response = self.request(method, path).json(body).send().await?;
        Ok(Self::check(response).await?.json::<T>().await?)
    }

    async fn branch_sha(&self, repo: &str, branch: &str) -> Result<String> {
        let git_ref: GitRef = self
            .get(&format!("/repos/{}/git/ref/heads/{}", repo, branch))
            .await?;
        Ok(git_ref.object.sha)
    }
}

fn is_not_found(e: &Error) -> bool {
    matches!(e, Error::Hosting { status: 404, .. })
}

#[async_trait]
impl HostingApi for GitHubClient {
    async fn get_default_branch(&self, repo: &str) -> Result<BranchRef> {
        let info: RepoInfo = self.get(&format!("/repos/{}", repo)).await?;
        let sha = self.branch_sha(repo, &info.default_branch).await?;
        debug!(repo, branch = %info.default_branch, %sha, "resolved default branch");
        Ok(BranchRef {
            name: info.default_branch,
            sha,
        })
    }

    async fn branch_exists(&self, repo: &str, name: &str) -> Result<bool> {
        match self.branch_sha(repo, name).await {
            Ok(_) => Ok(true),
            Err(e) if is_not_found(&e) => Ok(false),
            Err(e) => Err(e),
        }
    }

    async fn create_branch(&self, repo: &str, base_sha: &str, name: &str) -> Result<()> {
        info!(repo, branch = name, base = base_sha, "creating branch");
        let _: Value = self
            .send_json(
                Method::POST,
                &format!("/repos/{}/git/refs", repo),
                &json!({ "ref": format!("refs/heads/{}", name), "sha": base_sha }),
            )
            .await?;
        Ok(())
    }

    async fn delete_branch(&self, repo: &str, name: &str) -> Result<()> {
        info!(repo, branch = name, "deleting branch");
        let response = self
            .request(
                Method::DELETE,
                &format!("/repos/{}/git/refs/heads/{}", repo, name),
            )
            .send()
            .await?;
        // GitHub answers 422 "Reference does not exist" for missing refs
        if matches!(
            response.status(),
            StatusCode::NOT_FOUND | StatusCode::UNPROCESSABLE_ENTITY
        ) {
            warn!(repo, branch = name, "branch already gone");
            return Ok(());
        }
        Self::check(response).await?;
        Ok(())
    }

    async fn commit(
        &self,
        repo: &str,
        branch: &str,
        files: &[FileChange],
        message: &str,
    ) -> Result<String> {
        let parent_sha = self.branch_sha(repo, branch).await?;
        let parent: GitCommit = self
            .get(&format!("/repos/{}/git/commits/{}", repo, parent_sha))
            .await?;

        let entries: Vec<Value> = files
            .iter()
            .map(|f| match &f.content {
                Some(content) => json!({
                    "path": f.path,
                    "mode": f.mode.as_git_mode(),
                    "type": "blob",
                    "content": content,
                }),
                None => json!({
                    "path": f.path,
                    "mode": f.mode.as_git_mode(),
                    "type": "blob",
                    "sha": Value::Null,
                }),
            })
            .collect();

        let tree: GitObject = self
            .send_json(
                Method::POST,
                &format!("/repos/{}/git/trees", repo),
                &json!({ "base_tree": parent.tree.sha, "tree": entries }),
            )
            .await?;

        let commit: GitCommit = self
            .send_json(
                Method::POST,
                &format!("/repos/{}/git/commits", repo),
                &json!({ "message": message, "tree": tree.sha, "parents": [parent.sha] }),
            )
            .await?;

        let _: Value = self
            .send_json(
                Method::PATCH,
                &format!("/repos/{}/git/refs/heads/{}", repo, branch),
                &json!({ "sha": commit.sha, "force": false }),
            )
            .await?;

        info!(repo, branch, sha = %commit.sha, files = files.len(), "committed");
        Ok(commit.sha)
    }

    async fn open_pull_request(
        &self,
        repo: &str,
        head: &str,
        base: &str,
        title: &str,
        body: &str,
    ) -> Result<PullRequest> {
        info!(repo, head, base, title, "opening pull request");
        let pr: RawPullRequest = self
            .send_json(
                Method::POST,
                &format!("/repos/{}/pulls", repo),
                &json!({ "title": title, "head": head, "base": base, "body": body }),
            )
            .await?;
        Ok(pr.into())
    }

    async fn find_pull_request(&self, repo: &str, head: &str) -> Result<Option<PullRequest>> {
        let owner = repo.split('/').next().unwrap_or(repo);
        let prs: Vec<RawPullRequest> = self
            .get(&format!(
                "/repos/{}/pulls?state=open&head={}:{}",
                repo, owner, head
            ))
            .await?;
        Ok(prs.into_iter().next().map(PullRequest::from))
    }

    async fn head_commit_message(&self, repo: &str, branch: &str) -> Result<String> {
        let sha = self.branch_sha(repo, branch).await?;
        let commit: GitCommit = self
            .get(&format!("/repos/{}/git/commits/{}", repo, sha))
            .await?;
        Ok(commit.message)
    }
}
