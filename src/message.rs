//! Turning backend text into the final commit message: fence stripping,
//! 72-column reflow and the `#` usage trailer git drops on commit.

use std::time::Duration;

use crate::parsers::UsageStats;

/// Body line width of a conventional git commit message.
pub const BODY_LINE_WIDTH: usize = 72;

const FENCE: &str = "```";

/// Remove a surrounding markdown code fence (with optional language tag).
/// Text without both a leading and trailing fence is returned unchanged.
pub fn strip_code_fence(text: &str) -> String {
    let trimmed = text.trim();
    if trimmed.len() < 2 * FENCE.len() || !trimmed.starts_with(FENCE) || !trimmed.ends_with(FENCE)
    {
        return text.to_string();
    }
    let inner = &trimmed[FENCE.len()..trimmed.len() - FENCE.len()];
    let inner = match inner.split_once('\n') {
        Some((_tag, body)) => body,
        None => inner,
    };
    inner.trim().to_string()
}

/// Reflow `text` to `width` columns.
///
/// Paragraphs are separated by blank lines and reflowed independently. An
/// overflowing line breaks after the last sentence end that fits, else at
/// the last space; a single word wider than `width` stays whole. Runs of
/// blank lines become one blank line, and blank lines before the first or
/// after the last paragraph are dropped, so a subject followed only by
/// filler collapses to the subject.
///
/// The output only depends on the word sequence of each paragraph, so
/// wrapping twice gives the same result.
pub fn wrap_message(text: &str, width: usize) -> String {
    let mut out: Vec<String> = Vec::new();
    for paragraph in text.split("\n\n") {
        let paragraph = paragraph.trim();
        if paragraph.is_empty() {
            continue;
        }
        if !out.is_empty() {
            out.push(String::new());
        }
        wrap_paragraph(paragraph, width, &mut out);
    }
    out.join("\n")
}

fn wrap_paragraph(paragraph: &str, width: usize, out: &mut Vec<String>) {
    let mut line: Vec<&str> = Vec::new();
    for word in paragraph.split_whitespace() {
        line.push(word);
        while line.len() > 1 && joined_len(&line) > width {
            let keep = break_point(&line, width);
            out.push(line[..keep].join(" "));
            line.drain(..keep);
        }
    }
    if !line.is_empty() {
        out.push(line.join(" "));
    }
}

/// Number of leading words to emit from an overflowing line.
fn break_point(words: &[&str], width: usize) -> usize {
    let mut len = 0;
    let mut last_fit = 0;
    let mut last_sentence = 0;
    for (i, word) in words.iter().enumerate() {
        len += word.chars().count() + usize::from(i > 0);
        if len > width {
            break;
        }
        last_fit = i + 1;
        if ends_sentence(word) {
            last_sentence = i + 1;
        }
    }
    if last_sentence > 0 {
        last_sentence
    } else if last_fit > 0 {
        last_fit
    } else {
        1
    }
}

fn ends_sentence(word: &str) -> bool {
    let mut rev = word.chars().rev();
    matches!(rev.next(), Some('.' | '?' | '!')) && rev.next().is_some_and(|c| c != '.')
}

fn joined_len(words: &[&str]) -> usize {
    words.iter().map(|w| w.chars().count()).sum::<usize>() + words.len().saturating_sub(1)
}

/// Append the `#` usage trailer. Returns `message` unchanged when no usage
/// was captured.
pub fn append_usage_comment(
    message: &str,
    usage: &UsageStats,
    elapsed: Duration,
    model: Option<&str>,
    session_id: Option<&str>,
) -> String {
    if usage.is_empty() {
        return message.to_string();
    }

    let elapsed = format_elapsed(elapsed);
    let model_tag = model
        .map(str::trim)
        .filter(|m| !m.is_empty())
        .map(|m| format!(" model={m}"))
        .unwrap_or_default();

    let mut out = String::from(message);
    out.push_str("\n\n");
    match usage.cost_usd {
        Some(cost) => {
            out.push_str(&format!("# cost=${cost:.4} elapsed={elapsed}{model_tag}"));
        }
        None => {
            out.push_str(&format!(
                "# tokens: input={} cached={} output={} elapsed={elapsed}{model_tag}",
                usage.input_tokens, usage.cached_input_tokens, usage.output_tokens
            ));
        }
    }
    if let Some(session) = session_id.filter(|s| !s.trim().is_empty()) {
        out.push_str(&format!("\n# session={session}"));
    }
    for (name, m) in &usage.models {
        out.push_str(&format!(
            "\n# model={name} input={} output={} cache_read={} cache_create={}",
            m.input_tokens, m.output_tokens, m.cache_read_input_tokens, m.cache_creation_input_tokens
        ));
        if m.web_search_requests > 0 {
            out.push_str(&format!(" web_searches={}", m.web_search_requests));
        }
    }
    if let Some(note) = &usage.error_note {
        out.push_str(&format!("\n# error: {note}"));
    }
    out
}

/// Wall-clock time rounded to 100ms: `0s`, `300ms`, `4.2s`, `1m3.5s`.
pub fn format_elapsed(elapsed: Duration) -> String {
    let tenths = (elapsed.as_millis() + 50) / 100;
    if tenths == 0 {
        return "0s".to_string();
    }
    if tenths < 10 {
        return format!("{}ms", tenths * 100);
    }
    let minutes = tenths / 600;
    let rest = tenths % 600;
    let seconds = if rest % 10 == 0 {
        format!("{}s", rest / 10)
    } else {
        format!("{}.{}s", rest / 10, rest % 10)
    };
    if minutes > 0 {
        format!("{minutes}m{seconds}")
    } else {
        seconds
    }
}
