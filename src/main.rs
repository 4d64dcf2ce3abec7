use std::fs::OpenOptions;
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::Parser;
use tokio_util::sync::CancellationToken;

use git_cc_ai::config::{self, AGENTRC_FILE, AgentRc, Settings};
use git_cc_ai::diff;
use git_cc_ai::dispatch::registry::{BackendKind, DiffMode};
use git_cc_ai::dispatch::{DiffInput, GenerationRequest};
use git_cc_ai::error::CommitError;
use git_cc_ai::generate::generate;
use git_cc_ai::process::{ProcessRegistry, Signal};
use git_cc_ai::rules;

/// Value `-m` takes when given without a model.
const MODEL_MENU: &str = "menu";

const ENVIRONMENT_HELP: &str = "\
Backends:
  claude   Anthropic Claude CLI (preferred when found in PATH)
  gemini   Google Gemini CLI
  codex    OpenAI Codex CLI

Environment (also read from ./.agentrc as `export KEY=value`):
  GIT_AI_BACKEND     backend provider (auto-detected from PATH if unset)
  GIT_AI_MODEL       model name (overridden by -m / --model)
  GIT_AI_NO_CC       \"true\" for standard commit style instead of Conventional Commits
  GIT_AI_NO_SESSION  \"true\" to skip resuming CLAUDE_SESSION_ID
  GIT_AI_BUDGET      maximum spend in USD per run (default: 1.0)
  GIT_CC_AI_LOG      log filter for diagnostics on stderr (default: warn)";

/// Generate a commit message from the staged changes and print it to stdout.
#[derive(Debug, Parser)]
#[command(name = "git-cc-ai", version, after_help = ENVIRONMENT_HELP)]
struct Cli {
    /// Path to SKILL.md with extra prompt instructions
    #[arg(long, value_name = "PATH")]
    skill_path: Option<PathBuf>,

    /// Disable the spinner while the backend runs
    #[arg(long)]
    no_spinner: bool,

    /// Model name (overrides -m)
    #[arg(long, value_name = "MODEL")]
    model: Option<String>,

    /// Model name, or no value for interactive selection
    #[arg(
        short = 'm',
        value_name = "MODEL",
        num_args = 0..=1,
        default_missing_value = MODEL_MENU
    )]
    pick: Option<String>,

    /// Extra context passed to the backend
    #[arg(trailing_var_arg = true, value_name = "NOTE")]
    note: Vec<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_env("GIT_CC_AI_LOG")
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .init();

    let cli = Cli::parse();

    // stdout carries only the message; git reads it as the commit template.
    let mut stdout = std::io::stdout();
    match run(cli).await {
        Ok(message) if message.trim().is_empty() => {
            writeln!(stdout, "\n\n# something went wrong")?;
        }
        Ok(message) => write!(stdout, "{}", message.trim())?,
        Err(e) => {
            writeln!(stdout, "\n\n\n# something went wrong {e}")?;
            stdout.flush()?;
            eprintln!("{e}");
            std::process::exit(1);
        }
    }
    stdout.flush()?;
    Ok(())
}

async fn run(cli: Cli) -> anyhow::Result<String> {
    let rc = AgentRc::load(Path::new(AGENTRC_FILE));
    let settings = Settings::from_env(&rc)?;
    let kind = match settings.backend {
        Some(kind) => kind,
        None => config::detect_backend()?,
    };
    tracing::debug!(backend = %kind, "backend selected");

    let flag_model = match (cli.model, cli.pick) {
        (Some(model), _) if !model.trim().is_empty() => Some(model),
        (_, Some(pick)) if pick == MODEL_MENU => Some(pick_model(kind)?),
        (_, pick) => pick,
    };
    let model = config::choose_model(kind, flag_model.as_deref(), settings.model.as_deref())?;

    let registry = Arc::new(ProcessRegistry::new());
    let cancel = CancellationToken::new();
    let forwarder = spawn_signal_forwarder(Arc::clone(&registry), cancel.clone());

    let repo = Path::new(".");
    let diff = match kind.diff_mode() {
        DiffMode::Full => DiffInput::Full(diff::fetch_diff(repo).await?),
        DiffMode::Chunked => DiffInput::Chunked(diff::fetch_diff_chunks(repo).await?),
    };
    if diff.is_empty() {
        return Err(CommitError::NoStagedChanges.into());
    }

    let req = GenerationRequest {
        diff,
        skill_text: rules::skill_text(settings.no_cc, cli.skill_path.as_deref()),
        extra_note: cli.note.join(" "),
        model,
        session_id: settings.session_id,
        budget_usd: settings.budget_usd,
        show_progress: !cli.no_spinner,
        no_cc: settings.no_cc,
    };

    let result = generate(kind, &req, &registry, Some(&cancel)).await;
    forwarder.abort();
    Ok(result?)
}

/// Forward SIGINT/SIGTERM to the running backend's process group, stop the
/// spinner and cancel the run.
fn spawn_signal_forwarder(
    registry: Arc<ProcessRegistry>,
    cancel: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        #[cfg(unix)]
        {
            use tokio::signal::unix::{SignalKind, signal};

            let (Ok(mut interrupt), Ok(mut terminate)) =
                (signal(SignalKind::interrupt()), signal(SignalKind::terminate()))
            else {
                tracing::warn!("signal handlers unavailable, interrupts will not be forwarded");
                return;
            };
            loop {
                let received = tokio::select! {
                    Some(()) = interrupt.recv() => Signal::Interrupt,
                    Some(()) = terminate.recv() => Signal::Terminate,
                    else => break,
                };
                registry.forward_signal(received);
                registry.stop_progress_if_set();
                cancel.cancel();
            }
        }
        #[cfg(not(unix))]
        {
            while tokio::signal::ctrl_c().await.is_ok() {
                registry.forward_signal(Signal::Interrupt);
                registry.stop_progress_if_set();
                cancel.cancel();
            }
        }
    })
}

/// Numbered model menu on the controlling terminal. Accepts a number or a
/// model name.
fn pick_model(kind: BackendKind) -> Result<String, CommitError> {
    let picker_error = |e: std::io::Error| CommitError::Config(format!("model picker: {e}"));
    let models = kind.models();

    let tty = OpenOptions::new()
        .read(true)
        .write(true)
        .open("/dev/tty")
        .map_err(picker_error)?;
    let mut out = tty.try_clone().map_err(picker_error)?;

    writeln!(out, "Select a {kind} model:").map_err(picker_error)?;
    for (i, model) in models.iter().enumerate() {
        writeln!(out, "  {}) {model}", i + 1).map_err(picker_error)?;
    }
    write!(out, "> ").map_err(picker_error)?;
    out.flush().map_err(picker_error)?;

    let mut answer = String::new();
    BufReader::new(tty)
        .read_line(&mut answer)
        .map_err(picker_error)?;
    let answer = answer.trim();

    let chosen = match answer.parse::<usize>() {
        Ok(n) if (1..=models.len()).contains(&n) => Some(models[n - 1]),
        _ => models.iter().copied().find(|m| *m == answer),
    };
    chosen
        .map(str::to_string)
        .ok_or_else(|| CommitError::Config("no model selected".to_string()))
}
