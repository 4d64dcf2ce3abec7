//! End-to-end runs of the generic runner against fake backends driven
//! through `sh -c`.

use std::sync::Arc;
use std::time::{Duration, Instant};

use git_cc_ai::dispatch::cli::{CliDispatch, MAX_OUTPUT_BYTES};
use git_cc_ai::dispatch::registry::BackendKind;
use git_cc_ai::dispatch::{DiffInput, GenerationRequest, Invocation};
use git_cc_ai::error::CommitError;
use git_cc_ai::generate::generate_with;
use git_cc_ai::parsers::codex::CodexParser;
use git_cc_ai::process::{ProcessRegistry, Signal};
use git_cc_ai::progress::ProgressSink;
use tokio_util::sync::CancellationToken;

fn request() -> GenerationRequest {
    GenerationRequest {
        diff: DiffInput::Full("diff --git a/x b/x\n+hello\n".to_string()),
        skill_text: "rules".to_string(),
        extra_note: String::new(),
        model: None,
        session_id: None,
        budget_usd: None,
        show_progress: false,
        no_cc: false,
    }
}

fn sh(backend: &str, script: &str) -> Invocation {
    Invocation {
        backend: backend.to_string(),
        executable: "sh".to_string(),
        args: vec!["-c".to_string(), script.to_string()],
        stdin: Vec::new(),
        model: None,
    }
}

// ---------------------------------------------------------------------------
// Successful runs
// ---------------------------------------------------------------------------

#[tokio::test]
async fn codex_last_agent_message_wins() {
    let script = r#"printf '%s\n' \
        '{"type":"thread.started","thread_id":"t-1"}' \
        '{"type":"agent_message","text":"feat: add x"}' \
        '{"type":"agent_message","text":"feat: add x and y"}'"#;
    let registry = ProcessRegistry::new();
    let message = generate_with(BackendKind::Codex, sh("codex", script), &request(), &registry, None)
        .await
        .unwrap();
    assert_eq!(message, "feat: add x and y");
}

#[tokio::test]
async fn codex_usage_becomes_token_trailer() {
    let script = r#"printf '%s\n' \
        '{"type":"item.completed","item":{"type":"agent_message","text":"chore: bump deps"}}' \
        '{"type":"turn.completed","usage":{"input_tokens":120,"cached_input_tokens":20,"output_tokens":7}}'"#;
    let registry = ProcessRegistry::new();
    let message = generate_with(BackendKind::Codex, sh("codex", script), &request(), &registry, None)
        .await
        .unwrap();

    let (body, trailer) = message.split_once("\n\n").unwrap();
    assert_eq!(body, "chore: bump deps");
    assert!(
        trailer.starts_with("# tokens: input=120 cached=20 output=7 elapsed="),
        "unexpected trailer: {trailer}"
    );
}

#[tokio::test]
async fn gemini_deltas_are_concatenated() {
    let script = r#"printf '%s\n' \
        '{"type":"init","session_id":"g-1"}' \
        'Loaded cached credentials.' \
        '{"type":"message","role":"assistant","content":"feat(api): ","delta":true}' \
        '{"type":"message","role":"assistant","content":"add pagination","delta":true}' \
        '{"type":"result","status":"success","stats":{"input_tokens":50,"output_tokens":9,"cached":0}}'"#;
    let registry = ProcessRegistry::new();
    let message = generate_with(BackendKind::Gemini, sh("gemini", script), &request(), &registry, None)
        .await
        .unwrap();

    assert!(message.starts_with("feat(api): add pagination\n\n# tokens: input=50 cached=0 output=9"));
    assert!(message.contains("\n# session=g-1"));
}

#[tokio::test]
async fn claude_result_event_carries_cost() {
    let script = r#"printf '%s\n' \
        '{"type":"system","subtype":"init","session_id":"c-1"}' \
        '{"type":"stream_event","event":{"type":"content_block_delta","delta":{"type":"text_delta","text":"docs: fix"}}}' \
        '{"type":"result","subtype":"success","is_error":false,"result":"docs: fix typo in README","total_cost_usd":0.0123,"duration_ms":900,"session_id":"c-1"}'"#;
    let registry = ProcessRegistry::new();
    let message = generate_with(BackendKind::Claude, sh("claude", script), &request(), &registry, None)
        .await
        .unwrap();

    assert!(message.starts_with("docs: fix typo in README\n\n# cost=$0.0123 elapsed="));
    assert!(message.ends_with("\n# session=c-1"));
}

#[tokio::test]
async fn stdin_payload_reaches_backend() {
    // cat echoes the prompt back; it is not JSON, so the raw text is the answer.
    let mut invocation = sh("codex", "cat");
    invocation.stdin = b"feat: echoed through stdin".to_vec();
    let registry = ProcessRegistry::new();
    let message = generate_with(BackendKind::Codex, invocation, &request(), &registry, None)
        .await
        .unwrap();
    assert_eq!(message, "feat: echoed through stdin");
}

#[tokio::test]
async fn large_stdin_does_not_deadlock() {
    // The child drains all of its input before answering; 1 MiB is far
    // beyond any pipe buffer.
    let mut invocation = sh("codex", "cat > /dev/null; echo 'fix: done'");
    invocation.stdin = vec![b'x'; 1024 * 1024];
    let registry = ProcessRegistry::new();
    let start = Instant::now();
    let message = generate_with(BackendKind::Codex, invocation, &request(), &registry, None)
        .await
        .unwrap();
    assert_eq!(message, "fix: done");
    assert!(start.elapsed() < Duration::from_secs(10));
}

// ---------------------------------------------------------------------------
// Empty results and failures
// ---------------------------------------------------------------------------

#[tokio::test]
async fn stderr_only_output_is_empty_result() {
    let script = "echo 'warming up' >&2; echo 'still nothing' >&2";
    let registry = ProcessRegistry::new();
    let message = generate_with(BackendKind::Codex, sh("codex", script), &request(), &registry, None)
        .await
        .unwrap();
    assert_eq!(message, "");
}

#[tokio::test]
async fn non_zero_exit_reports_stderr() {
    let script = "echo 'rate limited' >&2; exit 1";
    let registry = ProcessRegistry::new();
    let err = generate_with(BackendKind::Codex, sh("codex", script), &request(), &registry, None)
        .await
        .unwrap_err();

    assert!(matches!(err, CommitError::BackendExit { code: Some(1), .. }), "got {err:?}");
    let text = err.to_string();
    assert!(text.contains("codex invocation failed"), "got {text}");
    assert!(text.contains("rate limited"), "got {text}");
}

#[tokio::test]
async fn error_event_is_reported() {
    let script = r#"printf '%s\n' '{"type":"error","message":"{\"detail\":\"model overloaded\"}"}'"#;
    let registry = ProcessRegistry::new();
    let err = generate_with(BackendKind::Codex, sh("codex", script), &request(), &registry, None)
        .await
        .unwrap_err();
    match err {
        CommitError::BackendReported { backend, message } => {
            assert_eq!(backend, "codex");
            assert_eq!(message, "model overloaded");
        }
        other => panic!("expected BackendReported, got {other:?}"),
    }
}

#[tokio::test]
async fn missing_executable_is_launch_error() {
    let invocation = Invocation {
        backend: "codex".to_string(),
        executable: "/nonexistent/git-cc-ai-backend".to_string(),
        args: Vec::new(),
        stdin: Vec::new(),
        model: None,
    };
    let registry = ProcessRegistry::new();
    let err = generate_with(BackendKind::Codex, invocation, &request(), &registry, None)
        .await
        .unwrap_err();
    assert!(matches!(err, CommitError::Launch { .. }), "got {err:?}");
    assert_eq!(registry.registered_pid(), None);
}

#[tokio::test]
async fn oversized_output_kills_process_group() {
    // dd floods stdout without newlines while sleep keeps the group alive.
    let script = "dd if=/dev/zero bs=1024 count=4096 2>/dev/null & sleep 3600";
    let registry = ProcessRegistry::new();
    let start = Instant::now();
    let err = generate_with(BackendKind::Codex, sh("codex", script), &request(), &registry, None)
        .await
        .unwrap_err();

    assert!(
        matches!(err, CommitError::OutputTooLarge { limit, .. } if limit == MAX_OUTPUT_BYTES),
        "got {err:?}"
    );
    assert!(start.elapsed() < Duration::from_secs(5), "took {:?}", start.elapsed());
}

// ---------------------------------------------------------------------------
// Interruption
// ---------------------------------------------------------------------------

#[tokio::test]
async fn forwarded_interrupt_ends_run_as_interrupted() {
    let script = r#"printf '%s\n' '{"type":"thread.started","thread_id":"resume-me"}'; exec sleep 30"#;
    let registry = Arc::new(ProcessRegistry::new());

    let signaller = {
        let registry = Arc::clone(&registry);
        tokio::spawn(async move {
            for _ in 0..100 {
                if registry.registered_pid().is_some() {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
            tokio::time::sleep(Duration::from_millis(200)).await;
            registry.forward_signal(Signal::Interrupt);
        })
    };

    let start = Instant::now();
    let err = generate_with(BackendKind::Codex, sh("codex", script), &request(), &registry, None)
        .await
        .unwrap_err();
    signaller.await.unwrap();

    assert!(err.is_interrupted(), "got {err:?}");
    assert_eq!(err.resumable_session(), Some("resume-me"));
    assert!(start.elapsed() < Duration::from_secs(10));
    assert_eq!(registry.registered_pid(), None);
}

#[tokio::test]
async fn interrupt_latched_before_launch_is_forwarded_on_register() {
    let registry = ProcessRegistry::new();
    registry.forward_signal(Signal::Interrupt);

    let start = Instant::now();
    let err = generate_with(BackendKind::Codex, sh("codex", "exec sleep 30"), &request(), &registry, None)
        .await
        .unwrap_err();

    assert!(err.is_interrupted(), "got {err:?}");
    assert!(!matches!(err, CommitError::BackendExit { .. }));
    assert!(start.elapsed() < Duration::from_secs(10));
}

#[tokio::test]
async fn interrupted_non_zero_exit_is_not_a_plain_failure() {
    let registry = ProcessRegistry::new();
    registry.forward_signal(Signal::Interrupt);
    let err = generate_with(BackendKind::Codex, sh("codex", "exit 130"), &request(), &registry, None)
        .await
        .unwrap_err();
    assert!(err.is_interrupted(), "got {err:?}");
}

#[tokio::test]
async fn cancelled_token_skips_launch() {
    let cancel = CancellationToken::new();
    cancel.cancel();
    let registry = ProcessRegistry::new();
    let err = generate_with(
        BackendKind::Codex,
        sh("codex", "echo 'fix: never'"),
        &request(),
        &registry,
        Some(&cancel),
    )
    .await
    .unwrap_err();
    assert!(err.is_interrupted());
    assert_eq!(err.resumable_session(), None);
}

#[tokio::test]
async fn cancellation_mid_run_kills_stubborn_backend() {
    // The backend ignores SIGINT; cancellation alone must still end the run.
    let script = "trap '' INT; sleep 30";
    let cancel = CancellationToken::new();
    let registry = ProcessRegistry::new();

    let trigger = {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(200)).await;
            cancel.cancel();
        })
    };

    let start = Instant::now();
    let err = CliDispatch::new()
        .run(&sh("codex", script), Arc::new(CodexParser), &registry, Some(&cancel), None)
        .await
        .unwrap_err();
    trigger.await.unwrap();

    assert!(err.is_interrupted(), "got {err:?}");
    assert!(start.elapsed() < Duration::from_secs(10));
}

// ---------------------------------------------------------------------------
// Progress
// ---------------------------------------------------------------------------

#[derive(Default)]
struct RecordingSink {
    updates: std::sync::Mutex<Vec<String>>,
    done: std::sync::atomic::AtomicUsize,
}

impl ProgressSink for RecordingSink {
    fn update(&self, text: &str) {
        self.updates.lock().unwrap().push(text.to_string());
    }

    fn done(&self) {
        self.done.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
    }
}

#[tokio::test]
async fn progress_sees_reasoning_and_is_stopped() {
    let script = r#"printf '%s\n' \
        '{"type":"item.started","item":{"type":"command_execution","command":"git log -1"}}' \
        '{"type":"agent_message","text":"refactor: split runner"}'"#;
    let sink = Arc::new(RecordingSink::default());
    let registry = ProcessRegistry::new();

    let capture = CliDispatch::new()
        .run(
            &sh("codex", script),
            Arc::new(CodexParser),
            &registry,
            None,
            Some(sink.clone() as Arc<dyn ProgressSink>),
        )
        .await
        .unwrap();

    assert_eq!(capture.last_message.as_deref(), Some("refactor: split runner"));
    let updates = sink.updates.lock().unwrap().clone();
    assert_eq!(updates, vec!["git log -1", "refactor: split runner"]);
    assert!(sink.done.load(std::sync::atomic::Ordering::SeqCst) >= 1);
    assert_eq!(registry.registered_pid(), None);
}

// ---------------------------------------------------------------------------
// Claude result errors and trailer
// ---------------------------------------------------------------------------

#[tokio::test]
async fn claude_error_result_is_reported() {
    let script = r#"printf '%s\n' \
        '{"type":"assistant","message":{"content":[{"type":"text","text":"feat: half done"}]}}' \
        '{"type":"result","subtype":"success","is_error":true,"result":"API Error: 529 overloaded","total_cost_usd":0.001,"session_id":"c-9"}'"#;
    let registry = ProcessRegistry::new();
    let err = generate_with(BackendKind::Claude, sh("claude", script), &request(), &registry, None)
        .await
        .unwrap_err();
    match err {
        CommitError::BackendReported { backend, message } => {
            assert_eq!(backend, "claude");
            assert_eq!(message, "API Error: 529 overloaded");
        }
        other => panic!("expected BackendReported, got {other:?}"),
    }
}

#[tokio::test]
async fn claude_session_without_cost_still_gets_trailer() {
    let script = r#"printf '%s\n' \
        '{"type":"result","subtype":"success","is_error":false,"result":"fix: tidy","session_id":"c-2"}'"#;
    let registry = ProcessRegistry::new();
    let message = generate_with(BackendKind::Claude, sh("claude", script), &request(), &registry, None)
        .await
        .unwrap();

    assert!(message.starts_with("fix: tidy\n\n# cost=$0.0000 elapsed="), "{message}");
    assert!(message.ends_with("\n# session=c-2"), "{message}");
}

#[tokio::test]
async fn claude_without_session_or_cost_has_no_trailer() {
    let script = r#"printf '%s\n' \
        '{"type":"result","subtype":"success","is_error":false,"result":"fix: tidy"}'"#;
    let registry = ProcessRegistry::new();
    let message = generate_with(BackendKind::Claude, sh("claude", script), &request(), &registry, None)
        .await
        .unwrap();
    assert_eq!(message, "fix: tidy");
}

// ---------------------------------------------------------------------------
// Session ids on stderr
// ---------------------------------------------------------------------------

#[tokio::test]
async fn stderr_thread_started_wins_over_later_stdout() {
    let script = r#"printf '%s\n' '{"type":"thread.started","thread_id":"from-stderr"}' >&2
        sleep 0.3
        printf '%s\n' \
            '{"type":"thread.started","thread_id":"from-stdout"}' \
            '{"type":"agent_message","text":"fix: x"}'"#;
    let registry = ProcessRegistry::new();
    let capture = CliDispatch::new()
        .run(&sh("codex", script), Arc::new(CodexParser), &registry, None, None)
        .await
        .unwrap();

    assert_eq!(capture.session_id.as_deref(), Some("from-stderr"));
    assert_eq!(capture.last_message.as_deref(), Some("fix: x"));
}

#[tokio::test]
async fn stdout_session_wins_over_later_stderr_hint() {
    let script = r#"printf '%s\n' '{"type":"thread.started","thread_id":"from-stdout"}'
        sleep 0.3
        echo 'session id: from-stderr' >&2
        printf '%s\n' '{"type":"agent_message","text":"fix: y"}'"#;
    let registry = ProcessRegistry::new();
    let capture = CliDispatch::new()
        .run(&sh("codex", script), Arc::new(CodexParser), &registry, None, None)
        .await
        .unwrap();
    assert_eq!(capture.session_id.as_deref(), Some("from-stdout"));
}

#[tokio::test]
async fn stderr_text_hint_provides_session() {
    let script = r#"echo 'Resume later with session id: abc-7' >&2
        printf '%s\n' '{"type":"agent_message","text":"fix: z"}'"#;
    let registry = ProcessRegistry::new();
    let capture = CliDispatch::new()
        .run(&sh("codex", script), Arc::new(CodexParser), &registry, None, None)
        .await
        .unwrap();
    assert_eq!(capture.session_id.as_deref(), Some("abc-7"));
    assert!(capture.stderr.contains("session id: abc-7"));
}
