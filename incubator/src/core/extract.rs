//! JSON extraction from free-form model output.
//!
//! Models wrap JSON in markdown fences, prefix it with chain-of-thought text,
//! or trail it with commentary. Extraction drops `<think>` reasoning blocks,
//! strips fences, then scans for the outermost balanced `{...}` or `[...]`,
//! honoring string literals and escapes.

use std::fmt;
use std::sync::LazyLock;

use regex::Regex;
use serde_json::Value;

static FENCE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?s)```(?:json)?\s*\n?(.*?)\n?\s*```").expect("fence pattern should be valid")
});

const SNIPPET_CHARS: usize = 200;
const THINK_CLOSE: &str = "</think>";

/// Reasons a response did not yield a JSON value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExtractionError {
    /// The response was empty or whitespace.
    Empty,
    /// No `{` or `[` was found.
    NoStructure { snippet: String },
    /// A candidate was found but did not parse.
    Invalid { message: String, snippet: String },
}

impl fmt::Display for ExtractionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExtractionError::Empty => write!(f, "empty response"),
            ExtractionError::NoStructure { snippet } => {
                write!(f, "no JSON object or array in response: {snippet}")
            }
            ExtractionError::Invalid { message, snippet } => {
                write!(f, "invalid JSON in response: {message}. Snippet: {snippet}")
            }
        }
    }
}

impl std::error::Error for ExtractionError {}

/// Extract and parse the outermost JSON value from `text`.
pub fn extract_json(text: &str) -> Result<Value, ExtractionError> {
    if text.trim().is_empty() {
        return Err(ExtractionError::Empty);
    }
    let candidate = extract_json_text(text).ok_or_else(|| ExtractionError::NoStructure {
        snippet: snippet(text),
    })?;
    serde_json::from_str(candidate).map_err(|err| ExtractionError::Invalid {
        message: err.to_string(),
        snippet: snippet(text),
    })
}

/// Locate the JSON candidate within `text` without parsing it.
///
/// Returns `None` when no opening bracket exists. When brackets never
/// balance, falls back to the span ending at the last matching close char.
pub fn extract_json_text(text: &str) -> Option<&str> {
    let text = after_reasoning(text);
    let body = match FENCE.captures(text).and_then(|caps| caps.get(1)) {
        Some(inner) => inner.as_str().trim(),
        None => text,
    };

    let obj_start = body.find('{');
    let arr_start = body.find('[');
    let (start, open, close) = match (obj_start, arr_start) {
        (None, None) => return None,
        (Some(obj), None) => (obj, '{', '}'),
        (None, Some(arr)) => (arr, '[', ']'),
        (Some(obj), Some(arr)) if obj <= arr => (obj, '{', '}'),
        (Some(_), Some(arr)) => (arr, '[', ']'),
    };

    let mut depth = 0usize;
    let mut in_string = false;
    let mut escape_next = false;
    for (offset, c) in body[start..].char_indices() {
        if escape_next {
            escape_next = false;
            continue;
        }
        match c {
            '\\' if in_string => escape_next = true,
            '"' => in_string = !in_string,
            _ if in_string => {}
            c if c == open => depth += 1,
            c if c == close => {
                depth = depth.saturating_sub(1);
                if depth == 0 {
                    let end = start + offset + c.len_utf8();
                    return Some(&body[start..end]);
                }
            }
            _ => {}
        }
    }

    match body.rfind(close) {
        Some(last) if last > start => Some(&body[start..=last]),
        _ => Some(&body[start..]),
    }
}

/// Text after the last closed `<think>` block.
fn after_reasoning(text: &str) -> &str {
    match text.rfind(THINK_CLOSE) {
        Some(end) => &text[end + THINK_CLOSE.len()..],
        None => text,
    }
}

fn snippet(text: &str) -> String {
    text.chars()
        .take(SNIPPET_CHARS)
        .map(|c| if c == '\n' { ' ' } else { c })
        .collect()
}
