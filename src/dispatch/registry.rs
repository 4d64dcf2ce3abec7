use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use crate::dispatch::{GenerationRequest, Invocation};
use crate::error::CommitError;
use crate::parsers::EventDecoder;
use crate::parsers::claude::{self, ClaudeParser};
use crate::parsers::codex::CodexParser;
use crate::parsers::gemini::GeminiParser;
use crate::prompt::{PromptOptions, build_chunk_turns, build_prompt, build_system_prompt};

/// Spend cap passed to claude when none is configured.
pub const DEFAULT_CLAUDE_BUDGET_USD: f64 = 1.0;

const CLAUDE_MODELS: &[&str] = &[
    "claude-haiku-4-5-20251001",
    "claude-sonnet-4-6",
    "claude-opus-4-6",
];

// https://developers.openai.com/codex/models/
const CODEX_MODELS: &[&str] = &[
    "gpt-5.1-codex-max",
    "gpt-5.1-codex-mini",
    "gpt-5.2-codex",
    "gpt-5.3-codex",
];

const GEMINI_MODELS: &[&str] = &["gemini-2.5-pro", "gemini-2.5-flash"];

const CLAUDE_SIGNATURE_RULE: &str = "Dont sign commit messages with claude code!";

/// How the staged diff is fetched for a backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiffMode {
    Full,
    /// One turn per directory.
    Chunked,
}

/// Where a backend's answer lives in its output.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Extraction {
    /// The final `result` event, falling back to the last message.
    FinalEvent,
    /// The concatenated assistant deltas.
    Deltas,
    /// The last message, then a JSON field scan, then the raw output.
    Messages,
}

/// Supported generation backends. Each variant is a small descriptor the
/// generic runner is parameterized by.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BackendKind {
    Claude,
    Codex,
    Gemini,
}

impl BackendKind {
    /// Detection preference when nothing is configured.
    pub const DETECTION_ORDER: [BackendKind; 3] = [Self::Claude, Self::Gemini, Self::Codex];

    pub fn name(self) -> &'static str {
        match self {
            Self::Claude => "claude",
            Self::Codex => "codex",
            Self::Gemini => "gemini",
        }
    }

    pub fn executable(self) -> &'static str {
        self.name()
    }

    pub fn models(self) -> &'static [&'static str] {
        match self {
            Self::Claude => CLAUDE_MODELS,
            Self::Codex => CODEX_MODELS,
            Self::Gemini => GEMINI_MODELS,
        }
    }

    pub fn default_model(self) -> Option<&'static str> {
        match self {
            Self::Claude => Some("claude-haiku-4-5-20251001"),
            Self::Codex => None,
            Self::Gemini => Some("gemini-2.5-flash"),
        }
    }

    pub fn supports_model(self, model: &str) -> bool {
        self.models().contains(&model.trim())
    }

    /// Requested model if this backend knows it, else its default (codex has
    /// none and lets the CLI choose).
    pub fn resolve_model(self, requested: Option<&str>) -> Option<String> {
        requested
            .map(str::trim)
            .filter(|m| self.supports_model(m))
            .or_else(|| self.default_model())
            .map(str::to_string)
    }

    /// Effective spend cap, for backends that enforce one.
    pub fn budget(self, requested: Option<f64>) -> Option<f64> {
        match self {
            Self::Claude => Some(
                requested
                    .filter(|b| b.is_finite() && *b > 0.0)
                    .unwrap_or(DEFAULT_CLAUDE_BUDGET_USD),
            ),
            Self::Codex | Self::Gemini => None,
        }
    }

    pub fn diff_mode(self) -> DiffMode {
        match self {
            Self::Claude => DiffMode::Chunked,
            Self::Codex | Self::Gemini => DiffMode::Full,
        }
    }

    pub fn extraction(self) -> Extraction {
        match self {
            Self::Claude => Extraction::FinalEvent,
            Self::Codex => Extraction::Messages,
            Self::Gemini => Extraction::Deltas,
        }
    }

    pub fn decoder(self) -> Arc<dyn EventDecoder> {
        match self {
            Self::Claude => Arc::new(ClaudeParser),
            Self::Codex => Arc::new(CodexParser),
            Self::Gemini => Arc::new(GeminiParser),
        }
    }

    /// Assemble the command line and stdin payload for `req`.
    ///
    /// Prompts always travel over stdin; a 512 KiB diff would not survive
    /// the kernel's per-argument limit.
    pub fn invocation(self, req: &GenerationRequest) -> Result<Invocation, CommitError> {
        let model = self.resolve_model(req.model.as_deref());
        let session = req
            .session_id
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty());

        let (args, stdin) = match self {
            Self::Claude => {
                let skill = format!("{}\n\n{CLAUDE_SIGNATURE_RULE}", req.skill_text);
                let system_prompt = build_system_prompt(&skill, req.no_cc);
                let turns = build_chunk_turns(&req.diff.as_chunks(), &req.extra_note);
                let budget = self.budget(req.budget_usd).unwrap_or(DEFAULT_CLAUDE_BUDGET_USD);

                let mut args = Vec::new();
                if let Some(session) = session {
                    args.push(format!("--resume={session}"));
                    args.push("--fork-session".to_string());
                }
                args.push("--print".to_string());
                if let Some(model) = &model {
                    args.extend(["--model".to_string(), model.clone()]);
                }
                args.extend([
                    "--system-prompt".to_string(),
                    system_prompt,
                    "--input-format=stream-json".to_string(),
                    "--output-format=stream-json".to_string(),
                    "--verbose".to_string(),
                    "--include-partial-messages".to_string(),
                    "--no-session-persistence".to_string(),
                    "--max-budget-usd".to_string(),
                    budget.to_string(),
                ]);
                (args, claude::encode_turns(&turns)?)
            }
            Self::Codex => {
                let mut args = vec!["exec".to_string()];
                if let Some(model) = &model {
                    args.extend(["-m".to_string(), model.clone()]);
                }
                args.push("--json".to_string());
                (args, self.single_prompt(req).into_bytes())
            }
            Self::Gemini => {
                let mut args = vec!["--output-format".to_string(), "stream-json".to_string()];
                if let Some(model) = &model {
                    args.extend(["--model".to_string(), model.clone()]);
                }
                if let Some(session) = session {
                    args.extend(["--resume".to_string(), session.to_string()]);
                }
                (args, self.single_prompt(req).into_bytes())
            }
        };

        Ok(Invocation {
            backend: self.name().to_string(),
            executable: self.executable().to_string(),
            args,
            stdin,
            model,
        })
    }

    fn single_prompt(self, req: &GenerationRequest) -> String {
        let diff = req.diff.as_text();
        build_prompt(&PromptOptions {
            skill_text: &req.skill_text,
            diff: &diff,
            extra_note: &req.extra_note,
            no_cc: req.no_cc,
        })
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for BackendKind {
    type Err = CommitError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "claude" => Ok(Self::Claude),
            "codex" => Ok(Self::Codex),
            "gemini" => Ok(Self::Gemini),
            other => Err(CommitError::Config(format!(
                "invalid GIT_AI_BACKEND value {other:?} (available: claude, codex, gemini)"
            ))),
        }
    }
}
