use std::sync::LazyLock;

use regex::Regex;
use serde_json::Value;

static RUNS_OF_WHITESPACE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\s+").unwrap());
static AFTER_COMMA: LazyLock<Regex> = LazyLock::new(|| Regex::new(r",\s+").unwrap());
static AFTER_COLON: LazyLock<Regex> = LazyLock::new(|| Regex::new(r":\s+").unwrap());
static AFTER_OPEN_BRACE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\{\s+").unwrap());
static BEFORE_CLOSE_BRACE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\s+\}").unwrap());
static AFTER_OPEN_BRACKET: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\[\s+").unwrap());
static BEFORE_CLOSE_BRACKET: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\s+\]").unwrap());

/// Clean pasted prompt text.
///
/// Unicode space variants become plain spaces, zero-width characters are
/// dropped and line endings become `\n`. Text that is a bracket-delimited JSON
/// value comes back in compact canonical form; anything else comes back with
/// runs of spaces and tabs collapsed. Never fails.
pub fn normalize(text: &str) -> String {
    let cleaned = clean_invisible(text);
    let trimmed = cleaned.trim();

    if is_bracketed(trimmed) {
        if let Ok(value) = serde_json::from_str::<Value>(trimmed) {
            return compact(&value, trimmed);
        }
        // Second and final attempt: tighten whitespace around delimiters.
        let relaxed = relax_delimiters(trimmed);
        if let Ok(value) = serde_json::from_str::<Value>(&relaxed) {
            return compact(&value, trimmed);
        }
        tracing::debug!("bracketed prompt is not valid JSON, keeping as text");
    }

    collapse_horizontal(&cleaned)
}

/// True when `text` (trimmed) is a bracket-delimited value that parses as JSON.
pub fn is_structured(text: &str) -> bool {
    parse_structured(text).is_some()
}

/// Parse `text` as a structured value, only when it is `{...}` or `[...]`.
pub fn parse_structured(text: &str) -> Option<Value> {
    let trimmed = text.trim();
    if !is_bracketed(trimmed) {
        return None;
    }
    serde_json::from_str(trimmed).ok()
}

fn is_bracketed(trimmed: &str) -> bool {
    (trimmed.starts_with('{') && trimmed.ends_with('}'))
        || (trimmed.starts_with('[') && trimmed.ends_with(']'))
}

fn compact(value: &Value, fallback: &str) -> String {
    serde_json::to_string(value).unwrap_or_else(|_| fallback.to_string())
}

fn clean_invisible(text: &str) -> String {
    let text = text.replace("\r\n", "\n");
    text.chars()
        .filter_map(|c| match c {
            '\r' => Some('\n'),
            '\u{00A0}'
            | '\u{2000}'..='\u{200B}'
            | '\u{2028}'
            | '\u{2029}'
            | '\u{202F}'
            | '\u{205F}'
            | '\u{3000}' => Some(' '),
            '\u{200C}' | '\u{200D}' | '\u{FEFF}' => None,
            other => Some(other),
        })
        .collect()
}

fn relax_delimiters(text: &str) -> String {
    let text = RUNS_OF_WHITESPACE.replace_all(text, " ");
    let text = AFTER_COMMA.replace_all(&text, ", ");
    let text = AFTER_COLON.replace_all(&text, ": ");
    let text = AFTER_OPEN_BRACE.replace_all(&text, "{");
    let text = BEFORE_CLOSE_BRACE.replace_all(&text, "}");
    let text = AFTER_OPEN_BRACKET.replace_all(&text, "[");
    BEFORE_CLOSE_BRACKET.replace_all(&text, "]").into_owned()
}

/// Collapse runs of spaces and tabs into one space. Newlines are kept.
fn collapse_horizontal(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut in_run = false;
    for c in text.chars() {
        if c == ' ' || c == '\t' {
            if !in_run {
                out.push(' ');
            }
            in_run = true;
        } else {
            out.push(c);
            in_run = false;
        }
    }
    out
}
