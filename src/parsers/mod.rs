pub mod claude;
pub mod codex;
pub mod gemini;

use std::collections::BTreeMap;

use serde::Deserialize;
use serde::de::DeserializeOwned;

/// Keys tried, in order, when a backend printed one JSON object instead of
/// an event stream.
pub const FALLBACK_KEYS: [&str; 4] = ["output", "stdout", "result", "message"];

/// One classified line of backend output.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    /// Incremental assistant text.
    AssistantDelta(String),
    /// Reasoning or tool-use narration, shown on the progress line only.
    Reasoning(String),
    /// A completed assistant message. Later ones supersede earlier ones.
    Message(String),
    /// The authoritative final event.
    Result(FinalResult),
    /// Token counts for the turn.
    Usage(UsageStats),
    /// Resumable session or thread id.
    ThreadStarted(String),
    /// Error reported inside the stream.
    Error(String),
    Unrecognized,
}

/// Contents of a backend's final `result` event.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FinalResult {
    pub text: String,
    pub subtype: String,
    pub is_error: bool,
    pub session_id: String,
    pub duration_ms: u64,
    pub usage: UsageStats,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct ModelUsage {
    #[serde(default, rename = "inputTokens")]
    pub input_tokens: u64,
    #[serde(default, rename = "outputTokens")]
    pub output_tokens: u64,
    #[serde(default, rename = "cacheReadInputTokens")]
    pub cache_read_input_tokens: u64,
    #[serde(default, rename = "cacheCreationInputTokens")]
    pub cache_creation_input_tokens: u64,
    #[serde(default, rename = "webSearchRequests")]
    pub web_search_requests: u64,
    #[serde(default, rename = "costUSD")]
    pub cost_usd: f64,
}

/// Usage figures for the trailer comment. Token backends fill the counters,
/// cost backends fill `cost_usd` and `models`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct UsageStats {
    pub input_tokens: u64,
    pub cached_input_tokens: u64,
    pub output_tokens: u64,
    pub cost_usd: Option<f64>,
    pub models: BTreeMap<String, ModelUsage>,
    /// Annotation such as `max_budget_exceeded`.
    pub error_note: Option<String>,
}

impl UsageStats {
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

/// Classifies single lines of one backend's output format.
pub trait EventDecoder: Send + Sync {
    /// Decode one line. Anything that is not a recognized JSON event,
    /// including plain log text, is `Unrecognized`.
    fn decode(&self, line: &str) -> StreamEvent;
}

/// Parse a trimmed line as `T`, or `None` for blank and non-object lines.
pub(crate) fn decode_json<T: DeserializeOwned>(line: &str) -> Option<T> {
    let line = line.trim();
    if !line.starts_with('{') {
        return None;
    }
    serde_json::from_str(line).ok()
}

pub(crate) fn non_blank(text: Option<String>) -> Option<String> {
    text.filter(|t| !t.trim().is_empty())
}

/// Error text from an error event. Some backends wrap the real cause in a
/// JSON envelope inside the message; its `detail` field wins when present.
pub fn error_message(message: &str) -> String {
    #[derive(Deserialize)]
    struct Envelope {
        detail: Option<String>,
    }

    decode_json::<Envelope>(message)
        .and_then(|e| non_blank(e.detail))
        .unwrap_or_else(|| message.trim().to_string())
}

/// The last completed message in a captured output, in emission order.
pub fn last_message(raw: &str, decoder: &dyn EventDecoder) -> Option<String> {
    raw.lines().rev().find_map(|line| match decoder.decode(line) {
        StreamEvent::Message(text) if !text.trim().is_empty() => Some(text),
        _ => None,
    })
}

/// Value of the first present string key in a raw JSON object.
///
/// A full JSON decode is tried first. If the text is not valid JSON (e.g.
/// truncated), a scanner looks for `"key":` and decodes the string that
/// follows, escapes included.
pub fn extract_json_field(raw: &str, keys: &[&str]) -> Option<String> {
    if let Ok(serde_json::Value::Object(map)) = serde_json::from_str(raw.trim()) {
        return keys.iter().find_map(|key| match map.get(*key) {
            Some(serde_json::Value::String(s)) if !s.is_empty() => Some(s.clone()),
            _ => None,
        });
    }

    for key in keys {
        let needle = format!("\"{key}\":");
        let Some(idx) = raw.find(&needle) else {
            continue;
        };
        let rest = raw[idx + needle.len()..].trim_start();
        if let Some(body) = rest.strip_prefix('"')
            && let Some(value) = scan_json_string(body)
        {
            return Some(value);
        }
    }
    None
}

/// Decode a JSON string body (opening quote already consumed) up to its
/// closing quote. `None` if the string never terminates.
fn scan_json_string(body: &str) -> Option<String> {
    let mut out = String::new();
    let mut chars = body.chars();
    while let Some(c) = chars.next() {
        match c {
            '"' => return Some(out),
            '\\' => match chars.next()? {
                'n' => out.push('\n'),
                't' => out.push('\t'),
                'r' => out.push('\r'),
                'b' => out.push('\u{8}'),
                'f' => out.push('\u{c}'),
                'u' => {
                    let high = read_hex4(&mut chars)?;
                    let code = if (0xD800..0xDC00).contains(&high) {
                        let rest = chars.as_str();
                        let low = rest
                            .strip_prefix("\\u")
                            .and_then(|r| r.get(..4))
                            .and_then(|h| u32::from_str_radix(h, 16).ok())
                            .filter(|low| (0xDC00..0xE000).contains(low));
                        match low {
                            Some(low) => {
                                chars = rest[6..].chars();
                                0x10000 + ((high - 0xD800) << 10) + (low - 0xDC00)
                            }
                            None => 0xFFFD,
                        }
                    } else {
                        high
                    };
                    out.push(char::from_u32(code).unwrap_or('\u{FFFD}'));
                }
                other => out.push(other),
            },
            _ => out.push(c),
        }
    }
    None
}

fn read_hex4(chars: &mut std::str::Chars<'_>) -> Option<u32> {
    let hex: String = chars.by_ref().take(4).collect();
    if hex.len() != 4 {
        return None;
    }
    u32::from_str_radix(&hex, 16).ok()
}
