// src/utils/text.rs

//! Text normalization for full-text fields.

use std::sync::LazyLock;

use regex::Regex;

static WHITESPACE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\s+").unwrap_or_else(|e| unreachable!("invalid whitespace pattern: {e}"))
});

/// Replace every whitespace character with a space and collapse runs of spaces.
pub fn remove_extra_spaces(text: &str) -> String {
    WHITESPACE.replace_all(text, " ").into_owned()
}

/// Shorten `text` to at most `size` chars without splitting a word.
///
/// Cuts at the last space within the first `size + 1` chars. Returns an
/// empty string when no such space exists.
pub fn shorten_text(text: &str, size: usize) -> &str {
    if text.chars().count() <= size {
        return text;
    }
    let end = text
        .char_indices()
        .nth(size + 1)
        .map(|(i, _)| i)
        .unwrap_or(text.len());
    match text[..end].rfind(' ') {
        Some(pos) => &text[..pos],
        None => "",
    }
}
