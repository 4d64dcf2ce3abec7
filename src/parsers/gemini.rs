use serde::Deserialize;

use crate::parsers::{EventDecoder, StreamEvent, UsageStats, decode_json, error_message, non_blank};

/// Decodes Gemini CLI `--output-format stream-json` output.
/// The answer arrives as assistant `message` chunks; `result` closes the
/// stream with status and stats.
pub struct GeminiParser;

#[derive(Deserialize)]
struct GeminiEvent {
    #[serde(rename = "type")]
    event_type: Option<String>,
    session_id: Option<String>,
    role: Option<String>,
    content: Option<String>,
    status: Option<String>,
    severity: Option<String>,
    message: Option<String>,
    tool_name: Option<String>,
    stats: Option<GeminiStats>,
    error: Option<GeminiError>,
}

#[derive(Deserialize)]
struct GeminiStats {
    #[serde(default)]
    input_tokens: u64,
    #[serde(default)]
    output_tokens: u64,
    #[serde(default)]
    cached: u64,
}

#[derive(Deserialize)]
struct GeminiError {
    message: Option<String>,
}

impl EventDecoder for GeminiParser {
    fn decode(&self, line: &str) -> StreamEvent {
        let Some(event) = decode_json::<GeminiEvent>(line) else {
            return StreamEvent::Unrecognized;
        };

        match event.event_type.as_deref() {
            Some("init") => non_blank(event.session_id)
                .map(StreamEvent::ThreadStarted)
                .unwrap_or(StreamEvent::Unrecognized),
            Some("message") if event.role.as_deref() == Some("assistant") => event
                .content
                .filter(|c| !c.is_empty())
                .map(StreamEvent::AssistantDelta)
                .unwrap_or(StreamEvent::Unrecognized),
            Some("tool_use") => non_blank(event.tool_name)
                .map(StreamEvent::Reasoning)
                .unwrap_or(StreamEvent::Unrecognized),
            Some("result") if event.status.as_deref() == Some("error") => {
                let message = event
                    .error
                    .and_then(|e| non_blank(e.message))
                    .map(|m| error_message(&m))
                    .unwrap_or_else(|| "gemini returned an error".to_string());
                StreamEvent::Error(message)
            }
            Some("result") => match event.stats {
                Some(stats) => StreamEvent::Usage(UsageStats {
                    input_tokens: stats.input_tokens,
                    cached_input_tokens: stats.cached,
                    output_tokens: stats.output_tokens,
                    ..UsageStats::default()
                }),
                None => StreamEvent::Unrecognized,
            },
            Some("error") => {
                let message = non_blank(event.message).map(|m| error_message(&m));
                match (event.severity.as_deref(), message) {
                    (Some("warning"), Some(m)) => {
                        tracing::warn!(message = %m, "gemini warning");
                        StreamEvent::Unrecognized
                    }
                    (_, Some(m)) => StreamEvent::Error(m),
                    (_, None) => StreamEvent::Unrecognized,
                }
            }
            _ => StreamEvent::Unrecognized,
        }
    }
}
