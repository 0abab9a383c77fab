use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use tracing::debug;

use crate::util::Backoff;
use crate::{Error, Result};

pub const DEFAULT_MAX_CONCURRENCY: usize = 2;
pub const DEFAULT_MAX_RETRIES: u32 = 2;
pub const DEFAULT_TASK_TIMEOUT_SECS: u64 = 600;
pub const DEFAULT_GITHUB_API_URL: &str = "https://api.github.com";
pub const DEFAULT_GIT_REMOTE_BASE: &str = "https://github.com";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// Agent contexts allowed to run at once.
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,
    /// Extra attempts after a task's first failed attempt.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_task_timeout_secs")]
    pub task_timeout_secs: u64,
    /// Refuse to open a pull request for a partial run.
    #[serde(default)]
    pub strict_mode: bool,
    /// Path or name of the Claude Code binary.
    pub inference_command: Option<String>,
    pub github_api_url: Option<String>,
    /// Clone URLs are `<git_remote_base>/<owner>/<name>.git`.
    pub git_remote_base: Option<String>,
    /// Environment variable holding the GitHub token.
    pub github_token_env: Option<String>,
    /// Where local mirrors of target repositories live.
    pub workspace_dir: Option<String>,
    /// Backoff for transient inference and hosting errors.
    #[serde(default)]
    pub backoff: Backoff,
}

fn default_max_concurrency() -> usize {
    DEFAULT_MAX_CONCURRENCY
}

fn default_max_retries() -> u32 {
    DEFAULT_MAX_RETRIES
}

fn default_task_timeout_secs() -> u64 {
    DEFAULT_TASK_TIMEOUT_SECS
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_concurrency: DEFAULT_MAX_CONCURRENCY,
            max_retries: DEFAULT_MAX_RETRIES,
            task_timeout_secs: DEFAULT_TASK_TIMEOUT_SECS,
            strict_mode: false,
            inference_command: None,
            github_api_url: None,
            git_remote_base: None,
            github_token_env: None,
            workspace_dir: None,
            backoff: Backoff::default(),
        }
    }
}

impl Config {
    pub fn autopr_dir() -> Result<PathBuf> {
        Ok(dirs::home_dir().ok_or(Error::NoHomeDir)?.join(".autopr"))
    }

    pub fn config_path() -> Result<PathBuf> {
        Ok(Self::autopr_dir()?.join("autopr.toml"))
    }

    pub fn log_path() -> Result<PathBuf> {
        Ok(Self::autopr_dir()?.join("autopr.log"))
    }

    pub fn workspaces_dir(&self) -> Result<PathBuf> {
        match &self.workspace_dir {
            Some(dir) => Ok(expand_tilde(dir)),
            None => Ok(Self::autopr_dir()?.join("workspaces")),
        }
    }

    pub fn task_timeout(&self) -> Duration {
        Duration::from_secs(self.task_timeout_secs)
    }

    pub fn effective_inference_command(&self) -> &str {
        self.inference_command.as_deref().unwrap_or("claude")
    }

    pub fn effective_github_api_url(&self) -> &str {
        self.github_api_url
            .as_deref()
            .unwrap_or(DEFAULT_GITHUB_API_URL)
    }

    pub fn effective_git_remote_base(&self) -> &str {
        self.git_remote_base
            .as_deref()
            .unwrap_or(DEFAULT_GIT_REMOTE_BASE)
    }

    pub fn github_token(&self) -> Result<String> {
        let var = self.github_token_env.as_deref().unwrap_or("GITHUB_TOKEN");
        std::env::var(var).map_err(|_| Error::Validation(format!("{} is not set", var)))
    }

    pub fn load() -> Result<Self> {
        Self::load_from(&Self::config_path()?)
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        debug!(path = %path.display(), "loading config");
        if !path.exists() {
            debug!("config file not found, using defaults");
            return Ok(Self::default());
        }
        let config: Self = toml::from_str(&fs::read_to_string(path)?)?;
        config.validate()?;
        debug!(
            max_concurrency = config.max_concurrency,
            max_retries = config.max_retries,
            task_timeout_secs = config.task_timeout_secs,
            strict_mode = config.strict_mode,
            "config loaded"
        );
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_concurrency == 0 {
            return Err(Error::Validation(
                "max_concurrency must be at least 1".to_string(),
            ));
        }
        if self.task_timeout_secs == 0 {
            return Err(Error::Validation(
                "task_timeout_secs must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    pub fn save(&self) -> Result<()> {
        let dir = Self::autopr_dir()?;
        if !dir.exists() {
            fs::create_dir_all(&dir)?;
        }
        let path = Self::config_path()?;
        fs::write(&path, toml::to_string_pretty(self)?)?;
        debug!(path = %path.display(), "config saved");
        Ok(())
    }

    pub fn ensure_dirs(&self) -> Result<()> {
        for dir in [Self::autopr_dir()?, self.workspaces_dir()?] {
            if !dir.exists() {
                debug!(dir = %dir.display(), "creating directory");
                fs::create_dir_all(&dir)?;
            }
        }
        Ok(())
    }
}

fn expand_tilde(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(path)
}
