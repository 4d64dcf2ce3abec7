use std::process::Stdio;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;

use crate::dispatch::{Invocation, StreamCapture};
use crate::error::CommitError;
use crate::parsers::{EventDecoder, StreamEvent};
use crate::process::{ProcessRegistry, kill_group};
use crate::progress::ProgressSink;

pub const MAX_OUTPUT_BYTES: usize = 2 * 1024 * 1024; // 2MB

/// Diagnostics kept from stderr; older lines are dropped first.
const STDERR_TAIL_BYTES: usize = 64 * 1024;

/// How long stderr may stay open after the child exits. Grandchildren can
/// inherit the pipe and keep it open indefinitely.
const STDERR_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

/// How long a cancelled backend gets to exit on its own before the group is
/// killed.
const CANCEL_GRACE: Duration = Duration::from_secs(3);

type SessionSlot = Arc<Mutex<Option<String>>>;

/// First non-blank id wins, whichever stream reports it.
fn offer_session(slot: &SessionSlot, id: &str) {
    let id = id.trim();
    if id.is_empty() {
        return;
    }
    let mut slot = slot.lock().unwrap_or_else(PoisonError::into_inner);
    if slot.is_none() {
        *slot = Some(id.to_string());
    }
}

/// Stops progress and clears the registry on every exit path.
struct RunGuard<'a> {
    registry: &'a ProcessRegistry,
    progress: Option<Arc<dyn ProgressSink>>,
}

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        self.registry.stop_progress_if_set();
        self.registry.unregister();
        if let Some(progress) = &self.progress {
            progress.done();
        }
    }
}

pub struct CliDispatch;

impl Default for CliDispatch {
    fn default() -> Self {
        Self
    }
}

impl CliDispatch {
    pub fn new() -> Self {
        Self
    }

    /// Run one backend invocation to completion and collect its stream.
    ///
    /// - No shell: `Command::new` + args, prompt on stdin
    /// - Own process group, so signals and kills reach grandchildren
    /// - kill_on_drop(true) prevents zombie processes
    /// - stdout capped at [`MAX_OUTPUT_BYTES`]
    pub async fn run(
        &self,
        inv: &Invocation,
        decoder: Arc<dyn EventDecoder>,
        registry: &ProcessRegistry,
        cancel: Option<&CancellationToken>,
        progress: Option<Arc<dyn ProgressSink>>,
    ) -> Result<StreamCapture, CommitError> {
        let backend = inv.backend.as_str();

        if cancel.is_some_and(CancellationToken::is_cancelled) {
            return Err(CommitError::Interrupted {
                backend: backend.to_string(),
                session_id: None,
            });
        }

        let start = Instant::now();
        let launch_error = |source: std::io::Error| CommitError::Launch {
            executable: inv.executable.clone(),
            source,
        };
        let missing_pipe = |name: &str| {
            launch_error(std::io::Error::other(format!("{name} was not piped")))
        };

        let mut cmd = Command::new(&inv.executable);
        cmd.args(&inv.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        #[cfg(unix)]
        cmd.process_group(0);

        let mut child = cmd.spawn().map_err(&launch_error)?;
        let pid = child.id().ok_or_else(|| {
            launch_error(std::io::Error::other("process exited before it could be tracked"))
        })?;
        tracing::debug!(backend, pid, args = ?inv.args, "backend started");

        // Written from a task: a prompt larger than the pipe buffer would
        // otherwise deadlock against a child blocked on unread stdout.
        let mut stdin = child.stdin.take().ok_or_else(|| missing_pipe("stdin"))?;
        let payload = inv.stdin.clone();
        tokio::spawn(async move {
            if let Err(e) = stdin.write_all(&payload).await {
                tracing::debug!("stdin write ended early: {e}");
            }
            // drop closes the pipe, the child sees EOF
        });

        let stdout = child.stdout.take().ok_or_else(|| missing_pipe("stdout"))?;
        let stderr = child.stderr.take().ok_or_else(|| missing_pipe("stderr"))?;

        let stop_progress = progress.clone().map(|sink| {
            Box::new(move || sink.done()) as crate::process::StopCallback
        });
        registry.register(pid, stop_progress);
        let _guard = RunGuard {
            registry,
            progress: progress.clone(),
        };

        let session: SessionSlot = Arc::default();
        let stderr_handle = tokio::spawn(read_stderr(
            stderr,
            Arc::clone(&decoder),
            Arc::clone(&session),
        ));

        let mut capture = StreamCapture::default();
        let mut preview = String::new();
        let mut reported_error: Option<String> = None;
        let mut reader = BufReader::new(stdout);
        let mut line = Vec::new();
        let mut grace: Option<tokio::time::Instant> = None;

        loop {
            // Never buffer more than one byte past the cap, even for output
            // with no newlines.
            let room = (MAX_OUTPUT_BYTES + 1).saturating_sub(capture.raw.len() + line.len());
            let mut limited = (&mut reader).take(room.max(1) as u64);
            let next = limited.read_until(b'\n', &mut line);

            let read = match (grace, cancel) {
                (Some(deadline), _) => match tokio::time::timeout_at(deadline, next).await {
                    Ok(read) => read,
                    Err(_) => {
                        tracing::debug!(backend, pid, "backend ignored cancellation, killing");
                        kill_group(pid);
                        break;
                    }
                },
                (None, Some(token)) => tokio::select! {
                    read = next => read,
                    () = token.cancelled() => {
                        // Partial bytes stay in `line`; the next read resumes.
                        grace = Some(tokio::time::Instant::now() + CANCEL_GRACE);
                        continue;
                    }
                },
                (None, None) => next.await,
            };

            let n = match read {
                Ok(n) => n,
                Err(source) => {
                    kill_group(pid);
                    return Err(CommitError::StreamRead {
                        backend: backend.to_string(),
                        source,
                    });
                }
            };
            if n == 0 {
                break;
            }

            if capture.raw.len() + line.len() > MAX_OUTPUT_BYTES {
                tracing::warn!(backend, limit = MAX_OUTPUT_BYTES, "backend output cap reached");
                kill_group(pid);
                return Err(CommitError::OutputTooLarge {
                    backend: backend.to_string(),
                    limit: MAX_OUTPUT_BYTES,
                });
            }

            let text = String::from_utf8_lossy(&line);
            let text = text.trim_end_matches(['\n', '\r']);
            capture.raw.push_str(text);
            capture.raw.push('\n');

            match decoder.decode(text) {
                StreamEvent::AssistantDelta(delta) => {
                    capture.deltas.push_str(&delta);
                    preview.push_str(&delta);
                    update_progress(progress.as_deref(), &preview);
                }
                StreamEvent::Reasoning(text) => {
                    preview = text;
                    update_progress(progress.as_deref(), &preview);
                }
                StreamEvent::Message(text) => {
                    preview.clone_from(&text);
                    update_progress(progress.as_deref(), &preview);
                    if !text.trim().is_empty() {
                        capture.last_message = Some(text);
                    }
                }
                StreamEvent::Result(result) => {
                    offer_session(&session, &result.session_id);
                    capture.final_result = Some(result);
                }
                StreamEvent::Usage(usage) => capture.usage = usage,
                StreamEvent::ThreadStarted(id) => offer_session(&session, &id),
                StreamEvent::Error(message) => {
                    tracing::debug!(backend, %message, "backend reported an error event");
                    reported_error.get_or_insert(message);
                }
                StreamEvent::Unrecognized => {}
            }
            line.clear();
        }

        let status = child.wait().await.map_err(|source| CommitError::StreamRead {
            backend: backend.to_string(),
            source,
        })?;

        capture.stderr = match tokio::time::timeout(STDERR_DRAIN_TIMEOUT, stderr_handle).await {
            Ok(Ok(text)) => text,
            Ok(Err(e)) => {
                tracing::debug!(backend, "stderr reader failed: {e}");
                String::new()
            }
            Err(_) => {
                tracing::debug!(backend, "stderr still open after exit, giving up on it");
                String::new()
            }
        };
        capture.session_id = session
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        capture.elapsed = start.elapsed();

        if registry.was_interrupted() || cancel.is_some_and(CancellationToken::is_cancelled) {
            if let Some(id) = &capture.session_id {
                eprintln!("{backend} session id: {id}");
            }
            return Err(CommitError::Interrupted {
                backend: backend.to_string(),
                session_id: capture.session_id,
            });
        }

        if !status.success() {
            tracing::warn!(backend, code = ?status.code(), "backend process failed");
            return Err(CommitError::BackendExit {
                backend: backend.to_string(),
                code: status.code(),
                stderr: capture.stderr,
            });
        }

        if let Some(message) = reported_error {
            return Err(CommitError::BackendReported {
                backend: backend.to_string(),
                message,
            });
        }

        if !capture.stderr.trim().is_empty() {
            tracing::debug!(backend, stderr = %capture.stderr, "backend stderr output");
        }
        tracing::debug!(
            backend,
            bytes = capture.raw.len(),
            elapsed_ms = capture.elapsed.as_millis() as u64,
            "backend finished"
        );
        Ok(capture)
    }
}

fn update_progress(progress: Option<&dyn ProgressSink>, text: &str) {
    if let Some(progress) = progress {
        progress.update(text);
    }
}

/// Collect stderr diagnostics, keeping the newest [`STDERR_TAIL_BYTES`].
/// Some backends log their session id here, as an event or as plain text.
async fn read_stderr(
    stderr: tokio::process::ChildStderr,
    decoder: Arc<dyn EventDecoder>,
    session: SessionSlot,
) -> String {
    let mut reader = BufReader::new(stderr);
    let mut tail = String::new();
    let mut line = Vec::new();
    loop {
        line.clear();
        let mut limited = (&mut reader).take(STDERR_TAIL_BYTES as u64);
        match limited.read_until(b'\n', &mut line).await {
            Ok(0) => break,
            Ok(_) => {}
            Err(e) => {
                tracing::debug!("stderr pipe read error: {e}");
                break;
            }
        }
        let text = String::from_utf8_lossy(&line);
        if let StreamEvent::ThreadStarted(id) = decoder.decode(&text) {
            offer_session(&session, &id);
        } else if let Some(id) = session_hint(&text) {
            offer_session(&session, id);
        }
        tail.push_str(&text);
        if tail.len() > STDERR_TAIL_BYTES {
            let mut cut = tail.len() - STDERR_TAIL_BYTES;
            while !tail.is_char_boundary(cut) {
                cut += 1;
            }
            tail.drain(..cut);
        }
    }
    tail
}

/// `session id: X` style lines some CLIs print on stderr.
fn session_hint(line: &str) -> Option<&str> {
    let line = line.trim();
    let lower = line.to_ascii_lowercase();
    let idx = lower
        .find("session id:")
        .map(|i| i + "session id:".len())
        .or_else(|| lower.find("session_id=").map(|i| i + "session_id=".len()))?;
    line.get(idx..)
        .and_then(|rest| rest.split_whitespace().next())
        .filter(|id| !id.is_empty())
}
