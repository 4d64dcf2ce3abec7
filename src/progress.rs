//! Best-effort terminal status line shown while a backend runs.
//!
//! The runner pushes preview text through a small bounded channel with
//! `try_send`; when the render thread falls behind, updates are dropped
//! rather than stalling the parse loop.

use std::io::{IsTerminal, Write};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use rand::seq::SliceRandom;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Capacity of the preview channel.
pub const PROGRESS_QUEUE: usize = 8;

const FRAME_INTERVAL: Duration = Duration::from_millis(100);
const PREVIEW_CHARS: usize = 80;
const FRAMES: [&str; 10] = ["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏"];

const MESSAGES: [&str; 6] = [
    "Generating commit message...",
    "Summarizing staged changes...",
    "Drafting Conventional Commit...",
    "Analyzing diff hunks...",
    "Composing commit summary...",
    "Reading the diff twice...",
];

/// Receives status updates from a running backend.
pub trait ProgressSink: Send + Sync {
    /// Replace the preview text. Must not block.
    fn update(&self, text: &str);
    /// Stop displaying. Idempotent; may block until the display is cleared.
    fn done(&self);
}

/// Pick a status message, varying between runs.
pub fn random_message() -> &'static str {
    MESSAGES
        .choose(&mut rand::thread_rng())
        .copied()
        .unwrap_or(MESSAGES[0])
}

/// Spinner line rendered by a dedicated thread on the controlling terminal.
pub struct ProgressIndicator {
    tx: mpsc::Sender<String>,
    stop: CancellationToken,
    render: Mutex<Option<JoinHandle<()>>>,
}

impl ProgressIndicator {
    /// Start rendering. Output goes to `/dev/tty` so stdout stays clean; with
    /// no terminal the indicator runs silently.
    pub fn start(message: &str, backend_label: &str) -> Arc<Self> {
        let (tx, rx) = mpsc::channel(PROGRESS_QUEUE);
        let stop = CancellationToken::new();
        let out = terminal_output();
        let header = if backend_label.is_empty() {
            message.to_string()
        } else {
            format!("{message} (using {backend_label})")
        };

        let token = stop.clone();
        let handle = std::thread::Builder::new()
            .name("progress".to_string())
            .spawn(move || render_loop(out, header, rx, token))
            .inspect_err(|e| tracing::warn!("progress indicator unavailable: {e}"))
            .ok();

        Arc::new(Self {
            tx,
            stop,
            render: Mutex::new(handle),
        })
    }
}

impl ProgressSink for ProgressIndicator {
    fn update(&self, text: &str) {
        if text.trim().is_empty() {
            return;
        }
        // Full or closed: the update is stale by the time it would render.
        let _ = self.tx.try_send(text.to_string());
    }

    fn done(&self) {
        self.stop.cancel();
        let handle = self
            .render
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle
            && handle.join().is_err()
        {
            tracing::debug!("progress render thread panicked");
        }
    }
}

impl Drop for ProgressIndicator {
    fn drop(&mut self) {
        self.done();
    }
}

#[cfg(unix)]
fn open_tty() -> Option<std::fs::File> {
    std::fs::OpenOptions::new().write(true).open("/dev/tty").ok()
}

#[cfg(not(unix))]
fn open_tty() -> Option<std::fs::File> {
    None
}

fn terminal_output() -> Option<Box<dyn Write + Send>> {
    if let Some(tty) = open_tty() {
        return Some(Box::new(tty));
    }
    let stderr = std::io::stderr();
    if stderr.is_terminal() {
        return Some(Box::new(stderr));
    }
    None
}

fn render_loop(
    mut out: Option<Box<dyn Write + Send>>,
    header: String,
    mut rx: mpsc::Receiver<String>,
    stop: CancellationToken,
) {
    let start = Instant::now();
    let mut preview = String::new();
    let mut frame = 0usize;

    while !stop.is_cancelled() {
        while let Ok(text) = rx.try_recv() {
            preview = preview_line(&text);
        }
        if let Some(out) = out.as_mut() {
            let elapsed = start.elapsed().as_secs_f64();
            let line = if preview.is_empty() {
                format!("\r\x1b[2K  {} {header} ({elapsed:.1}s)", FRAMES[frame])
            } else {
                format!("\r\x1b[2K  {} {header} ({elapsed:.1}s) {preview}", FRAMES[frame])
            };
            let _ = out.write_all(line.as_bytes());
            let _ = out.flush();
        }
        frame = (frame + 1) % FRAMES.len();
        std::thread::sleep(FRAME_INTERVAL);
    }

    if let Some(out) = out.as_mut() {
        let _ = out.write_all(b"\r\x1b[2K");
        let _ = out.flush();
    }
}

/// Last non-blank line of the preview, shortened to fit one terminal row.
fn preview_line(text: &str) -> String {
    let line = text
        .lines()
        .rev()
        .map(str::trim)
        .find(|l| !l.is_empty())
        .unwrap_or("");
    if line.chars().count() <= PREVIEW_CHARS {
        return line.to_string();
    }
    let cut: String = line.chars().take(PREVIEW_CHARS - 3).collect();
    format!("{cut}...")
}
