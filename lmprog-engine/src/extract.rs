//! Pull a script out of a model reply

use crate::error::{Error, Result};
use once_cell::sync::Lazy;
use regex::Regex;

static TAGGED_FENCE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?s)```(?i:rhai)[ \t]*\r?\n(.*?)```").expect("valid regex"));

static ANY_FENCE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?s)```[^\n`]*\r?\n(.*?)```").expect("valid regex"));

/// Extract source text from a reply.
///
/// The first ```rhai block wins (tag matched case-insensitively), then the
/// first fenced block of any tag, then the whole reply. Blank lines are dropped.
pub fn extract(reply: &str) -> Result<String> {
    let body = if reply.contains("```") {
        TAGGED_FENCE
            .captures(reply)
            .or_else(|| ANY_FENCE.captures(reply))
            .and_then(|caps| caps.get(1))
            .map(|m| m.as_str())
            .ok_or_else(|| Error::extraction_failed(reply).with_operation("extract::extract"))?
    } else {
        reply.trim()
    };

    Ok(drop_blank_lines(body))
}

fn drop_blank_lines(text: &str) -> String {
    text.lines()
        .filter(|line| !line.trim().is_empty())
        .collect::<Vec<_>>()
        .join("\n")
}
