use std::path::Path;

use crate::dispatch::registry::BackendKind;
use crate::error::CommitError;

/// Per-repository settings file, read from the working directory.
pub const AGENTRC_FILE: &str = ".agentrc";

/// Values found in an `.agentrc` file. Lines look like
/// `export GIT_AI_MODEL=claude-sonnet-4-6`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AgentRc {
    pub session_id: Option<String>,
    pub backend: Option<String>,
    pub model: Option<String>,
    pub no_cc: bool,
    pub no_session: bool,
    pub budget_usd: Option<f64>,
}

impl AgentRc {
    /// Parse `path`. A missing file yields the defaults; malformed lines are
    /// skipped with a warning.
    pub fn load(path: &Path) -> Self {
        let iter = match dotenvy::from_path_iter(path) {
            Ok(iter) => iter,
            Err(e) => {
                if path.exists() {
                    tracing::warn!(path = %path.display(), "ignoring unreadable agentrc: {e}");
                }
                return Self::default();
            }
        };
        let pairs = iter.filter_map(|item| {
            item.inspect_err(|e| tracing::warn!(path = %path.display(), "skipping agentrc line: {e}"))
                .ok()
        });
        Self::from_pairs(pairs)
    }

    pub fn from_pairs(pairs: impl IntoIterator<Item = (String, String)>) -> Self {
        let mut rc = Self::default();
        for (key, value) in pairs {
            let value = value.trim();
            match key.as_str() {
                "CLAUDE_SESSION_ID" => rc.session_id = non_empty(value),
                "GIT_AI_BACKEND" => rc.backend = non_empty(value),
                "GIT_AI_MODEL" => rc.model = non_empty(value),
                "GIT_AI_NO_CC" => rc.no_cc = is_true(value),
                "GIT_AI_NO_SESSION" => rc.no_session = is_true(value),
                "GIT_AI_BUDGET" => rc.budget_usd = parse_budget(value),
                _ => {}
            }
        }
        rc
    }
}

/// Effective settings: environment first, then `.agentrc`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Settings {
    /// `None` means detect from PATH.
    pub backend: Option<BackendKind>,
    /// Soft preference; dropped later if the backend does not know it.
    pub model: Option<String>,
    pub no_cc: bool,
    pub no_session: bool,
    pub budget_usd: Option<f64>,
    /// Session to resume, unless `no_session` is set.
    pub session_id: Option<String>,
}

impl Settings {
    pub fn from_env(rc: &AgentRc) -> Result<Self, CommitError> {
        Self::resolve(rc, |key| std::env::var(key).ok())
    }

    pub fn resolve(
        rc: &AgentRc,
        env: impl Fn(&str) -> Option<String>,
    ) -> Result<Self, CommitError> {
        let env_value = |key: &str| env(key).and_then(|v| non_empty(v.trim()));

        let backend = env_value("GIT_AI_BACKEND")
            .or_else(|| rc.backend.clone())
            .map(|name| name.parse::<BackendKind>())
            .transpose()?;

        let no_cc = env_value("GIT_AI_NO_CC").is_some_and(|v| is_true(&v)) || rc.no_cc;
        let no_session =
            env_value("GIT_AI_NO_SESSION").is_some_and(|v| is_true(&v)) || rc.no_session;

        Ok(Self {
            backend,
            model: env_value("GIT_AI_MODEL").or_else(|| rc.model.clone()),
            no_cc,
            no_session,
            budget_usd: env_value("GIT_AI_BUDGET")
                .and_then(|v| parse_budget(&v))
                .or(rc.budget_usd),
            session_id: if no_session {
                None
            } else {
                rc.session_id.clone()
            },
        })
    }
}

/// Pick the model for `kind`.
///
/// A model given on the command line must be one the backend lists; a
/// configured one that does not match is dropped so the backend default
/// applies.
pub fn choose_model(
    kind: BackendKind,
    flag_model: Option<&str>,
    configured: Option<&str>,
) -> Result<Option<String>, CommitError> {
    if let Some(model) = flag_model.map(str::trim).filter(|m| !m.is_empty()) {
        if !kind.supports_model(model) {
            return Err(CommitError::Config(format!(
                "invalid model {model:?} (use -m for interactive pick, or one of: {})",
                kind.models().join(", ")
            )));
        }
        return Ok(Some(model.to_string()));
    }
    let configured = configured.map(str::trim).filter(|m| !m.is_empty());
    Ok(match configured {
        Some(model) if kind.supports_model(model) => Some(model.to_string()),
        Some(model) => {
            tracing::debug!(model, backend = %kind, "configured model not offered, using default");
            None
        }
        None => None,
    })
}

/// First backend in detection order whose executable `exists`.
pub fn detect_backend_with(exists: impl Fn(&str) -> bool) -> Option<BackendKind> {
    BackendKind::DETECTION_ORDER
        .into_iter()
        .find(|kind| exists(kind.executable()))
}

pub fn detect_backend() -> Result<BackendKind, CommitError> {
    detect_backend_with(which_exists).ok_or_else(|| {
        CommitError::Config(
            "no supported backend found in PATH (install claude, gemini or codex)".to_string(),
        )
    })
}

/// Check if an executable exists in PATH.
fn which_exists(name: &str) -> bool {
    std::process::Command::new("which")
        .arg(name)
        .stdout(std::process::Stdio::null())
        .stderr(std::process::Stdio::null())
        .status()
        .is_ok_and(|s| s.success())
}

fn non_empty(value: &str) -> Option<String> {
    (!value.is_empty()).then(|| value.to_string())
}

fn is_true(value: &str) -> bool {
    value.trim().eq_ignore_ascii_case("true")
}

fn parse_budget(value: &str) -> Option<f64> {
    value
        .trim()
        .parse::<f64>()
        .ok()
        .filter(|v| v.is_finite() && *v > 0.0)
}
