use serde::Deserialize;

use crate::parsers::{
    EventDecoder, StreamEvent, UsageStats, decode_json, error_message, non_blank,
};

/// Decodes the Codex CLI `exec --json` JSONL event stream.
pub struct CodexParser;

#[derive(Deserialize)]
struct CodexEvent {
    #[serde(rename = "type")]
    event_type: Option<String>,
    text: Option<String>,
    thread_id: Option<String>,
    message: Option<String>,
    item: Option<CodexItem>,
    usage: Option<CodexUsage>,
    error: Option<CodexError>,
}

#[derive(Deserialize)]
struct CodexItem {
    #[serde(rename = "type")]
    item_type: Option<String>,
    text: Option<String>,
    command: Option<String>,
    content: Option<Vec<CodexContent>>,
}

#[derive(Deserialize)]
struct CodexContent {
    #[serde(rename = "type")]
    content_type: Option<String>,
    text: Option<String>,
}

#[derive(Deserialize)]
struct CodexUsage {
    #[serde(default)]
    input_tokens: u64,
    #[serde(default)]
    cached_input_tokens: u64,
    #[serde(default)]
    output_tokens: u64,
}

#[derive(Deserialize)]
struct CodexError {
    message: Option<String>,
}

impl EventDecoder for CodexParser {
    fn decode(&self, line: &str) -> StreamEvent {
        let Some(event) = decode_json::<CodexEvent>(line) else {
            return StreamEvent::Unrecognized;
        };
        let Some(event_type) = event.event_type.as_deref() else {
            return StreamEvent::Unrecognized;
        };

        match event_type {
            "thread.started" => non_blank(event.thread_id)
                .map(|id| StreamEvent::ThreadStarted(id.trim().to_string()))
                .unwrap_or(StreamEvent::Unrecognized),
            "turn.completed" => match event.usage {
                Some(u) => StreamEvent::Usage(UsageStats {
                    input_tokens: u.input_tokens,
                    cached_input_tokens: u.cached_input_tokens,
                    output_tokens: u.output_tokens,
                    ..UsageStats::default()
                }),
                None => StreamEvent::Unrecognized,
            },
            "agent_message" => non_blank(event.text)
                .map(StreamEvent::Message)
                .unwrap_or(StreamEvent::Unrecognized),
            "reasoning" => non_blank(event.text)
                .map(StreamEvent::Reasoning)
                .unwrap_or(StreamEvent::Unrecognized),
            "item.started" | "item.completed" => {
                decode_item(event_type, event.item).unwrap_or(StreamEvent::Unrecognized)
            }
            "response.completed" => event
                .item
                .and_then(response_message)
                .map(StreamEvent::Message)
                .unwrap_or(StreamEvent::Unrecognized),
            "error" => non_blank(event.message)
                .map(|m| StreamEvent::Error(error_message(&m)))
                .unwrap_or(StreamEvent::Unrecognized),
            "turn.failed" => {
                let message = event
                    .error
                    .and_then(|e| non_blank(e.message))
                    .map(|m| error_message(&m))
                    .unwrap_or_else(|| "turn failed".to_string());
                StreamEvent::Error(message)
            }
            _ => StreamEvent::Unrecognized,
        }
    }
}

fn decode_item(event_type: &str, item: Option<CodexItem>) -> Option<StreamEvent> {
    let item = item?;
    match (event_type, item.item_type.as_deref()?) {
        ("item.completed", "agent_message") => non_blank(item.text).map(StreamEvent::Message),
        ("item.completed", "reasoning") => non_blank(item.text).map(StreamEvent::Reasoning),
        ("item.started", "command_execution") => {
            non_blank(item.command).map(StreamEvent::Reasoning)
        }
        _ => None,
    }
}

/// Older Codex builds report the answer as a `response.completed` event
/// whose item is a message with `output_text` parts.
fn response_message(item: CodexItem) -> Option<String> {
    if item.item_type.as_deref() != Some("message") {
        return None;
    }
    let parts: Vec<String> = item
        .content?
        .into_iter()
        .filter(|c| c.content_type.as_deref() == Some("output_text"))
        .filter_map(|c| non_blank(c.text))
        .collect();
    if parts.is_empty() {
        None
    } else {
        Some(parts.join("\n"))
    }
}
