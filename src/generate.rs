use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::dispatch::cli::CliDispatch;
use crate::dispatch::registry::{BackendKind, Extraction};
use crate::dispatch::{GenerationRequest, GenerationResult, Invocation, StreamCapture};
use crate::error::CommitError;
use crate::message::strip_code_fence;
use crate::parsers::{EventDecoder, FALLBACK_KEYS, UsageStats, extract_json_field, last_message};
use crate::process::ProcessRegistry;
use crate::progress::{ProgressIndicator, ProgressSink, random_message};

const BUDGET_EXCEEDED_NOTE: &str = "max_budget_exceeded";

/// Generate a commit message with `kind`. `Ok("")` means the backend ran
/// but produced nothing usable.
pub async fn generate(
    kind: BackendKind,
    req: &GenerationRequest,
    registry: &ProcessRegistry,
    cancel: Option<&CancellationToken>,
) -> Result<String, CommitError> {
    let invocation = kind.invocation(req)?;
    generate_with(kind, invocation, req, registry, cancel).await
}

/// [`generate`] with an explicit command line, e.g. an alternate
/// executable. Output is still decoded the way `kind` speaks.
pub async fn generate_with(
    kind: BackendKind,
    invocation: Invocation,
    req: &GenerationRequest,
    registry: &ProcessRegistry,
    cancel: Option<&CancellationToken>,
) -> Result<String, CommitError> {
    let progress = req
        .show_progress
        .then(|| start_progress(kind, &invocation, req));

    let decoder = kind.decoder();
    let capture = CliDispatch::new()
        .run(&invocation, Arc::clone(&decoder), registry, cancel, progress)
        .await?;

    let Some(text) = extract(kind.extraction(), &capture, decoder.as_ref(), &invocation.backend)?
    else {
        tracing::info!(backend = %invocation.backend, "backend returned no usable message");
        return Ok(String::new());
    };

    let mut usage = collect_usage(&capture, kind.budget(req.budget_usd));
    // The cost trailer always names the session to resume, even at zero cost.
    if kind.extraction() == Extraction::FinalEvent
        && usage.cost_usd.is_none()
        && capture.session_id.is_some()
    {
        usage.cost_usd = Some(0.0);
    }

    let result = GenerationResult {
        text,
        usage,
        elapsed: capture.elapsed,
        model: invocation.model.clone(),
        session_id: capture.session_id.clone(),
    };
    Ok(result.render())
}

fn start_progress(
    kind: BackendKind,
    invocation: &Invocation,
    req: &GenerationRequest,
) -> Arc<dyn ProgressSink> {
    let label = match &invocation.model {
        Some(model) => format!("{kind}: {model}"),
        None => kind.to_string(),
    };
    let indicator = ProgressIndicator::start(random_message(), &label);
    if kind == BackendKind::Claude
        && let Some(session) = req.session_id.as_deref().filter(|s| !s.trim().is_empty())
    {
        indicator.update(&format!("Resuming session {session}"));
    }
    indicator
}

/// Pull the answer out of a finished run according to `strategy`.
/// `Ok(None)` when there is nothing usable.
pub fn extract(
    strategy: Extraction,
    capture: &StreamCapture,
    decoder: &dyn EventDecoder,
    backend: &str,
) -> Result<Option<String>, CommitError> {
    let text = match strategy {
        Extraction::FinalEvent => match &capture.final_result {
            Some(result) => {
                let mut text = result.text.clone();
                if result.is_error && !text.trim().is_empty() {
                    return Err(CommitError::BackendReported {
                        backend: backend.to_string(),
                        message: text.trim().to_string(),
                    });
                }
                if text.trim().is_empty() && result.subtype.starts_with("error_") {
                    tracing::warn!(backend, subtype = %result.subtype, "result carried no text, using last message");
                    text = capture.last_message.clone().unwrap_or_default();
                }
                if text.trim().is_empty() && !result.subtype.is_empty() && result.subtype != "success"
                {
                    return Err(CommitError::BackendReported {
                        backend: backend.to_string(),
                        message: format!("run ended with {}", result.subtype),
                    });
                }
                text
            }
            None => capture.last_message.clone().unwrap_or_default(),
        },
        Extraction::Deltas => capture.deltas.clone(),
        Extraction::Messages => last_message(&capture.raw, decoder)
            .or_else(|| {
                if capture.raw.trim_start().starts_with('{') {
                    extract_json_field(&capture.raw, &FALLBACK_KEYS)
                } else {
                    None
                }
            })
            .unwrap_or_else(|| capture.raw.trim().to_string()),
    };

    let text = strip_code_fence(&text).trim().to_string();
    Ok((!text.is_empty()).then_some(text))
}

/// Usage for the trailer: the final event's figures when it has any,
/// annotated with a budget breach or an error subtype.
fn collect_usage(capture: &StreamCapture, budget: Option<f64>) -> UsageStats {
    let Some(result) = &capture.final_result else {
        return capture.usage.clone();
    };
    let mut usage = if result.usage.is_empty() {
        capture.usage.clone()
    } else {
        result.usage.clone()
    };

    if let (Some(cost), Some(budget)) = (usage.cost_usd, budget)
        && cost > budget
    {
        usage.error_note = Some(BUDGET_EXCEEDED_NOTE.to_string());
    } else if result.is_error && !result.subtype.is_empty() {
        usage.error_note = Some(result.subtype.clone());
    }
    usage
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parsers::FinalResult;
    use crate::parsers::codex::CodexParser;

    fn capture_with_raw(raw: &str) -> StreamCapture {
        StreamCapture {
            raw: raw.to_string(),
            ..StreamCapture::default()
        }
    }

    #[test]
    fn messages_fall_back_to_json_field() {
        let capture = capture_with_raw("{\"output\": \"fix: handle \\\"quoted\\\" paths\"}\n");
        let text = extract(Extraction::Messages, &capture, &CodexParser, "codex").unwrap();
        assert_eq!(text.as_deref(), Some("fix: handle \"quoted\" paths"));
    }

    #[test]
    fn messages_fall_back_to_raw_text() {
        let capture = capture_with_raw("feat: plain text answer\n");
        let text = extract(Extraction::Messages, &capture, &CodexParser, "codex").unwrap();
        assert_eq!(text.as_deref(), Some("feat: plain text answer"));
    }

    #[test]
    fn final_event_error_subtype_uses_last_message() {
        let capture = StreamCapture {
            last_message: Some("fix: partial answer".to_string()),
            final_result: Some(FinalResult {
                subtype: "error_max_turns".to_string(),
                is_error: true,
                ..FinalResult::default()
            }),
            ..StreamCapture::default()
        };
        let text = extract(Extraction::FinalEvent, &capture, &CodexParser, "claude").unwrap();
        assert_eq!(text.as_deref(), Some("fix: partial answer"));
    }

    #[test]
    fn final_event_blank_error_is_reported() {
        let capture = StreamCapture {
            final_result: Some(FinalResult {
                subtype: "error_during_execution".to_string(),
                is_error: true,
                ..FinalResult::default()
            }),
            ..StreamCapture::default()
        };
        let err = extract(Extraction::FinalEvent, &capture, &CodexParser, "claude").unwrap_err();
        assert!(err.to_string().contains("error_during_execution"));
    }

    #[test]
    fn final_event_error_text_is_reported() {
        let capture = StreamCapture {
            last_message: Some("fix: not this".to_string()),
            final_result: Some(FinalResult {
                text: "API Error: 529 overloaded".to_string(),
                subtype: "success".to_string(),
                is_error: true,
                ..FinalResult::default()
            }),
            ..StreamCapture::default()
        };
        match extract(Extraction::FinalEvent, &capture, &CodexParser, "claude") {
            Err(CommitError::BackendReported { backend, message }) => {
                assert_eq!(backend, "claude");
                assert_eq!(message, "API Error: 529 overloaded");
            }
            other => panic!("expected BackendReported, got {other:?}"),
        }
    }

    #[test]
    fn fenced_deltas_are_unwrapped() {
        let capture = StreamCapture {
            deltas: "```text\nfix: strip fences\n```".to_string(),
            ..StreamCapture::default()
        };
        let text = extract(Extraction::Deltas, &capture, &CodexParser, "gemini").unwrap();
        assert_eq!(text.as_deref(), Some("fix: strip fences"));
    }

    #[test]
    fn blank_output_is_none() {
        let capture = capture_with_raw("  \n");
        let text = extract(Extraction::Messages, &capture, &CodexParser, "codex").unwrap();
        assert_eq!(text, None);
    }

    #[test]
    fn budget_breach_is_noted() {
        let capture = StreamCapture {
            final_result: Some(FinalResult {
                text: "fix: x".to_string(),
                subtype: "success".to_string(),
                usage: UsageStats {
                    cost_usd: Some(1.5),
                    ..UsageStats::default()
                },
                ..FinalResult::default()
            }),
            ..StreamCapture::default()
        };
        let usage = collect_usage(&capture, Some(1.0));
        assert_eq!(usage.error_note.as_deref(), Some(BUDGET_EXCEEDED_NOTE));
        assert_eq!(collect_usage(&capture, Some(2.0)).error_note, None);
    }
}
