pub mod cli;
pub mod registry;

use std::time::Duration;

use crate::diff::DiffChunk;
use crate::parsers::{FinalResult, UsageStats};

/// Staged changes as handed to a backend.
#[derive(Debug, Clone)]
pub enum DiffInput {
    Full(String),
    /// Per-directory chunks, ordered by directory.
    Chunked(Vec<DiffChunk>),
}

impl DiffInput {
    pub fn is_empty(&self) -> bool {
        match self {
            Self::Full(diff) => diff.trim().is_empty(),
            Self::Chunked(chunks) => chunks.is_empty(),
        }
    }

    /// The whole diff as one text, for backends that take a single prompt.
    pub fn as_text(&self) -> String {
        match self {
            Self::Full(diff) => diff.clone(),
            Self::Chunked(chunks) => chunks.iter().map(|c| c.diff.as_str()).collect(),
        }
    }

    /// The diff as chunks, for backends that take one turn per directory.
    pub fn as_chunks(&self) -> Vec<DiffChunk> {
        match self {
            Self::Full(diff) => vec![DiffChunk {
                dir: ".".to_string(),
                diff: diff.clone(),
            }],
            Self::Chunked(chunks) => chunks.clone(),
        }
    }
}

/// Everything one generation needs. Built once by the caller.
#[derive(Debug, Clone)]
pub struct GenerationRequest {
    pub diff: DiffInput,
    /// Rules and extra instructions for the prompt.
    pub skill_text: String,
    pub extra_note: String,
    pub model: Option<String>,
    /// Backend session to resume, where supported.
    pub session_id: Option<String>,
    /// Spending cap in USD, where supported.
    pub budget_usd: Option<f64>,
    pub show_progress: bool,
    /// Plain commit style instead of Conventional Commits.
    pub no_cc: bool,
}

/// A fully assembled backend command line.
#[derive(Debug, Clone)]
pub struct Invocation {
    /// Backend name used in logs and errors.
    pub backend: String,
    pub executable: String,
    pub args: Vec<String>,
    /// Written to the child's stdin, then stdin is closed.
    pub stdin: Vec<u8>,
    /// Model shown on the progress line and in the trailer.
    pub model: Option<String>,
}

/// What the runner collected from a successful run.
#[derive(Debug, Default)]
pub struct StreamCapture {
    /// Every stdout line, newline-terminated, in emission order.
    pub raw: String,
    /// Concatenated assistant deltas.
    pub deltas: String,
    pub last_message: Option<String>,
    pub final_result: Option<FinalResult>,
    pub usage: UsageStats,
    pub session_id: Option<String>,
    pub stderr: String,
    pub elapsed: Duration,
}

/// Outcome of a generation, before rendering.
#[derive(Debug, Clone, PartialEq)]
pub struct GenerationResult {
    pub text: String,
    pub usage: UsageStats,
    pub elapsed: Duration,
    pub model: Option<String>,
    pub session_id: Option<String>,
}

impl GenerationResult {
    /// The commit message: wrapped body plus usage trailer.
    pub fn render(&self) -> String {
        let wrapped = crate::message::wrap_message(&self.text, crate::message::BODY_LINE_WIDTH);
        crate::message::append_usage_comment(
            &wrapped,
            &self.usage,
            self.elapsed,
            self.model.as_deref(),
            self.session_id.as_deref(),
        )
    }
}
