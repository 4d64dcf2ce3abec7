use thiserror::Error;

/// How much of a backend's stderr is kept in an error message. CLI tools
/// print banners first; the actual cause is at the end.
const DIAGNOSTIC_TAIL_CHARS: usize = 2000;

#[derive(Debug, Error)]
pub enum CommitError {
    #[error("not a git directory")]
    NotARepository,

    #[error("no staged diff content found")]
    NoStagedChanges,

    #[error("git {command} failed: {message}")]
    Git { command: String, message: String },

    #[error("failed to launch {executable}: {source}")]
    Launch {
        executable: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to read {backend} output: {source}")]
    StreamRead {
        backend: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{backend} output exceeded {limit} bytes")]
    OutputTooLarge { backend: String, limit: usize },

    #[error("{backend} invocation failed ({}){}", describe_code(.code), describe_stderr(.stderr))]
    BackendExit {
        backend: String,
        code: Option<i32>,
        stderr: String,
    },

    #[error("{backend}: {message}")]
    BackendReported { backend: String, message: String },

    #[error("{backend} invocation interrupted")]
    Interrupted {
        backend: String,
        session_id: Option<String>,
    },

    #[error("failed to encode backend input: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("{0}")]
    Config(String),
}

impl CommitError {
    pub fn is_interrupted(&self) -> bool {
        matches!(self, Self::Interrupted { .. })
    }

    /// Session id captured before an interruption, if the backend reported one.
    pub fn resumable_session(&self) -> Option<&str> {
        match self {
            Self::Interrupted { session_id, .. } => session_id.as_deref(),
            _ => None,
        }
    }
}

fn describe_code(code: &Option<i32>) -> String {
    match code {
        Some(code) => format!("exit code {code}"),
        None => "terminated by signal".to_string(),
    }
}

fn describe_stderr(stderr: &str) -> String {
    let trimmed = stderr.trim();
    if trimmed.is_empty() {
        return String::new();
    }
    let count = trimmed.chars().count();
    if count <= DIAGNOSTIC_TAIL_CHARS {
        return format!("\n{trimmed}");
    }
    let tail: String = trimmed.chars().skip(count - DIAGNOSTIC_TAIL_CHARS).collect();
    format!("\n...{tail}")
}
