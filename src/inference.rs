//! Inference service seam.
//!
//! The language model is a black box: a prompt goes in, text comes out.
//! Implementations report rate limiting and overload as
//! `Error::InferenceUnavailable` so callers can back off and retry.

use std::sync::LazyLock;

use async_trait::async_trait;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::Result;

static JSON_OBJECT_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?s)\{.*\}").unwrap());

/// A single completion call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct CompletionRequest {
    pub prompt: String,
    /// Extra system instructions.
    pub system: Option<String>,
    /// Tool names the model may use while answering. Empty means none.
    #[serde(default)]
    pub tools: Vec<String>,
}

impl CompletionRequest {
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            ..Self::default()
        }
    }

    pub fn with_system(mut self, system: impl Into<String>) -> Self {
        self.system = Some(system.into());
        self
    }
}

#[async_trait]
pub trait InferenceService: Send + Sync {
    async fn complete(&self, request: &CompletionRequest) -> Result<String>;
}

/// The outermost `{ ... }` span of a completion.
///
/// Models often wrap JSON in prose or code fences; this takes everything from
/// the first `{` to the last `}`.
pub fn extract_json_object(text: &str) -> Option<&str> {
    JSON_OBJECT_RE.find(text).map(|m| m.as_str())
}
