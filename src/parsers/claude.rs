use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::parsers::{
    EventDecoder, FinalResult, ModelUsage, StreamEvent, UsageStats, decode_json, non_blank,
};

/// Decodes Claude Code `--output-format=stream-json` output.
pub struct ClaudeParser;

#[derive(Deserialize)]
struct ClaudeEvent {
    #[serde(rename = "type")]
    event_type: Option<String>,
    subtype: Option<String>,
    session_id: Option<String>,
    event: Option<InnerEvent>,
    message: Option<AssistantMessage>,
}

#[derive(Deserialize)]
struct InnerEvent {
    #[serde(rename = "type")]
    event_type: Option<String>,
    delta: Option<Delta>,
}

#[derive(Deserialize)]
struct Delta {
    #[serde(rename = "type")]
    delta_type: Option<String>,
    text: Option<String>,
}

#[derive(Deserialize)]
struct AssistantMessage {
    #[serde(default)]
    content: Vec<ContentBlock>,
}

#[derive(Deserialize)]
struct ContentBlock {
    #[serde(rename = "type")]
    block_type: Option<String>,
    text: Option<String>,
    input: Option<ToolInput>,
}

#[derive(Deserialize)]
struct ToolInput {
    description: Option<String>,
    command: Option<String>,
}

#[derive(Deserialize)]
struct ResultEvent {
    #[serde(default)]
    subtype: String,
    #[serde(default)]
    result: String,
    #[serde(default)]
    total_cost_usd: f64,
    #[serde(default)]
    duration_ms: u64,
    #[serde(default)]
    is_error: bool,
    #[serde(default)]
    session_id: String,
    #[serde(default, rename = "modelUsage")]
    model_usage: BTreeMap<String, ModelUsage>,
}

impl EventDecoder for ClaudeParser {
    fn decode(&self, line: &str) -> StreamEvent {
        // The result event carries the answer; decode it with its own schema
        // so the generic envelope's field types cannot reject it.
        if line.contains("\"result\"")
            && let Some(result) = decode_json::<ResultEvent>(line)
            && is_type(line, "result")
        {
            return StreamEvent::Result(final_result(result));
        }

        let Some(event) = decode_json::<ClaudeEvent>(line) else {
            return StreamEvent::Unrecognized;
        };

        match event.event_type.as_deref() {
            Some("system") if event.subtype.as_deref() == Some("init") => {
                non_blank(event.session_id)
                    .map(StreamEvent::ThreadStarted)
                    .unwrap_or(StreamEvent::Unrecognized)
            }
            Some("stream_event") => event
                .event
                .and_then(text_delta)
                .map(StreamEvent::AssistantDelta)
                .unwrap_or(StreamEvent::Unrecognized),
            Some("assistant") => event
                .message
                .and_then(assistant_event)
                .unwrap_or(StreamEvent::Unrecognized),
            _ => StreamEvent::Unrecognized,
        }
    }
}

fn is_type(line: &str, expected: &str) -> bool {
    #[derive(Deserialize)]
    struct Tag {
        #[serde(rename = "type")]
        event_type: Option<String>,
    }
    decode_json::<Tag>(line).is_some_and(|t| t.event_type.as_deref() == Some(expected))
}

fn text_delta(event: InnerEvent) -> Option<String> {
    if event.event_type.as_deref() != Some("content_block_delta") {
        return None;
    }
    let delta = event.delta?;
    if delta.delta_type.as_deref() != Some("text_delta") {
        return None;
    }
    delta.text.filter(|t| !t.is_empty())
}

/// Tool invocations become narration (`description: command`); otherwise
/// the leading text block is a completed message.
fn assistant_event(message: AssistantMessage) -> Option<StreamEvent> {
    let mut tool_text = None;
    for block in &message.content {
        if block.block_type.as_deref() != Some("tool_use") {
            continue;
        }
        let Some(input) = &block.input else {
            continue;
        };
        let description = input.description.as_deref().unwrap_or("").trim();
        let command = input.command.as_deref().unwrap_or("").trim();
        let text = match (description.is_empty(), command.is_empty()) {
            (false, false) => format!("{description}: {command}"),
            (false, true) => description.to_string(),
            (true, false) => command.to_string(),
            (true, true) => continue,
        };
        tool_text = Some(text);
    }
    if let Some(text) = tool_text {
        return Some(StreamEvent::Reasoning(text));
    }

    let first = message.content.into_iter().next()?;
    if first.block_type.as_deref() != Some("text") {
        return None;
    }
    non_blank(first.text).map(StreamEvent::Message)
}

fn final_result(event: ResultEvent) -> FinalResult {
    let has_cost = event.total_cost_usd > 0.0 || !event.model_usage.is_empty();
    FinalResult {
        text: event.result,
        subtype: event.subtype,
        is_error: event.is_error,
        session_id: event.session_id,
        duration_ms: event.duration_ms,
        usage: UsageStats {
            cost_usd: has_cost.then_some(event.total_cost_usd),
            models: event.model_usage,
            ..UsageStats::default()
        },
    }
}

#[derive(Serialize)]
struct InputContent<'a> {
    #[serde(rename = "type")]
    content_type: &'static str,
    text: &'a str,
}

#[derive(Serialize)]
struct InputMessage<'a> {
    #[serde(rename = "type")]
    message_type: &'static str,
    role: &'static str,
    content: [InputContent<'a>; 1],
}

#[derive(Serialize)]
struct InputEnvelope<'a> {
    #[serde(rename = "type")]
    envelope_type: &'static str,
    message: InputMessage<'a>,
}

/// Encode user turns for `--input-format=stream-json`: one JSON object per
/// line. Claude answers each turn; only the final result matters.
pub fn encode_turns<S: AsRef<str>>(turns: &[S]) -> Result<Vec<u8>, serde_json::Error> {
    let mut buf = Vec::new();
    for turn in turns {
        let envelope = InputEnvelope {
            envelope_type: "user",
            message: InputMessage {
                message_type: "message",
                role: "user",
                content: [InputContent {
                    content_type: "text",
                    text: turn.as_ref(),
                }],
            },
        };
        serde_json::to_writer(&mut buf, &envelope)?;
        buf.push(b'\n');
    }
    Ok(buf)
}
