//! Claude Code headless executor.
//!
//! `ClaudeHeadless` runs Claude Code in non-interactive mode (`-p`) with JSON
//! output and parses the result. It backs both the inference service used by
//! the planner and the agent runtime that edits code.

use std::path::{Path, PathBuf};
use std::process::ExitStatus;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tokio::process::Command;
use tracing::{debug, trace};

use crate::error::{Error, Result};
use crate::inference::{CompletionRequest, InferenceService};

/// Per-invocation limit unless overridden with `with_timeout`.
pub const DEFAULT_TIMEOUT_SECS: u64 = 600;

/// Fragments of error text that mean "try again later".
const TRANSIENT_MARKERS: &[&str] = &["rate limit", "overloaded", "529", "503", "timed out"];

/// How a headless run ended.
#[derive(Debug, Clone, PartialEq)]
pub enum ClaudeOutcome {
    /// The final assistant message.
    Completed { text: String },
    Failed { reason: String },
}

/// What one headless run reported.
#[derive(Debug, Clone, PartialEq)]
pub struct ClaudeRun {
    pub outcome: ClaudeOutcome,
    pub num_turns: Option<u32>,
    pub cost_usd: Option<f64>,
}

impl ClaudeRun {
    fn bare(outcome: ClaudeOutcome) -> Self {
        Self {
            outcome,
            num_turns: None,
            cost_usd: None,
        }
    }

    /// The completion text, or the failure mapped onto the inference errors.
    pub fn into_text(self) -> Result<String> {
        match self.outcome {
            ClaudeOutcome::Completed { text } => Ok(text),
            ClaudeOutcome::Failed { reason } => Err(classify_failure(&reason)),
        }
    }
}

/// The `--output-format json` result object.
#[derive(Debug, Deserialize)]
struct ResultEnvelope {
    subtype: Option<String>,
    #[serde(default)]
    is_error: bool,
    result: Option<String>,
    error: Option<String>,
    num_turns: Option<u32>,
    total_cost_usd: Option<f64>,
}

impl ResultEnvelope {
    fn into_run(self) -> ClaudeRun {
        let outcome = match (self.subtype.as_deref(), self.is_error) {
            (Some("success"), false) | (None, false) if self.error.is_none() => {
                match self.result {
                    Some(text) => ClaudeOutcome::Completed { text },
                    None if self.subtype.is_some() => ClaudeOutcome::Completed {
                        text: String::new(),
                    },
                    None => ClaudeOutcome::Failed {
                        reason: "result object carries neither result nor error".to_string(),
                    },
                }
            }
            _ => ClaudeOutcome::Failed {
                reason: self
                    .error
                    .or(self.result)
                    .unwrap_or_else(|| "claude reported an error".to_string()),
            },
        };
        ClaudeRun {
            outcome,
            num_turns: self.num_turns,
            cost_usd: self.total_cost_usd,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ClaudeHeadless {
    binary: PathBuf,
    timeout: Duration,
}

impl ClaudeHeadless {
    /// Locate `claude` on the PATH.
    ///
    /// # Errors
    /// `ClaudeBinaryNotFound` if it is not installed.
    pub fn new() -> Result<Self> {
        Self::locate("claude")
    }

    /// Locate a binary by name or path.
    pub fn locate(command: &str) -> Result<Self> {
        let binary = which::which(command).map_err(|_| Error::ClaudeBinaryNotFound)?;
        Ok(Self::with_binary(binary))
    }

    /// Use `binary` as is, without checking that it exists.
    pub fn with_binary(binary: PathBuf) -> Self {
        Self {
            binary,
            timeout: Duration::from_secs(DEFAULT_TIMEOUT_SECS),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn binary(&self) -> &Path {
        &self.binary
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Command-line arguments for one headless invocation.
    pub fn build_args(prompt: &str, system: Option<&str>, allowed_tools: &[String]) -> Vec<String> {
        let mut args = vec![
            "-p".to_string(),
            prompt.to_string(),
            "--output-format".to_string(),
            "json".to_string(),
        ];
        if let Some(system) = system {
            args.push("--append-system-prompt".to_string());
            args.push(system.to_string());
        }
        if !allowed_tools.is_empty() {
            args.push("--allowedTools".to_string());
            args.push(allowed_tools.join(","));
        }
        args
    }

    /// Run `prompt` in `cwd` with only `allowed_tools` enabled.
    ///
    /// # Errors
    /// `Timeout` when the run exceeds the configured limit (the child is
    /// killed), `Io` when the binary cannot be spawned. A run that starts but
    /// fails is an `Ok` with `ClaudeOutcome::Failed`.
    pub async fn run(
        &self,
        prompt: &str,
        system: Option<&str>,
        cwd: &Path,
        allowed_tools: &[String],
    ) -> Result<ClaudeRun> {
        debug!(cwd = %cwd.display(), tools = ?allowed_tools, "running claude headless");
        trace!(prompt, "claude prompt");

        let output = tokio::time::timeout(
            self.timeout,
            Command::new(&self.binary)
                .args(Self::build_args(prompt, system, allowed_tools))
                .current_dir(cwd)
                .kill_on_drop(true)
                .output(),
        )
        .await
        .map_err(|_| Error::Timeout(self.timeout))??;

        Ok(interpret_output(
            output.status,
            &String::from_utf8_lossy(&output.stdout),
            &String::from_utf8_lossy(&output.stderr),
        ))
    }
}

/// Turn a finished process into a run report.
///
/// A parsable result object wins over the exit status; otherwise a non-zero
/// exit is a failure described by stderr.
fn interpret_output(status: ExitStatus, stdout: &str, stderr: &str) -> ClaudeRun {
    if let Ok(envelope) = serde_json::from_str::<ResultEnvelope>(stdout.trim()) {
        return envelope.into_run();
    }
    if !status.success() {
        let reason = match stderr.trim() {
            "" => format!("claude exited with {}", status),
            text => text.to_string(),
        };
        return ClaudeRun::bare(ClaudeOutcome::Failed { reason });
    }
    ClaudeRun::bare(ClaudeOutcome::Completed {
        text: stdout.trim().to_string(),
    })
}

fn classify_failure(reason: &str) -> Error {
    let lowered = reason.to_lowercase();
    if TRANSIENT_MARKERS.iter().any(|m| lowered.contains(m)) {
        Error::InferenceUnavailable(reason.to_string())
    } else {
        Error::Inference(reason.to_string())
    }
}

#[async_trait]
impl InferenceService for ClaudeHeadless {
    async fn complete(&self, request: &CompletionRequest) -> Result<String> {
        let cwd = std::env::temp_dir();
        self.run(&request.prompt, request.system.as_deref(), &cwd, &request.tools)
            .await?
            .into_text()
    }
}
