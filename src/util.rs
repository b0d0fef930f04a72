//! Text utility helpers for Grantline.
//!
//! Inbound text arrives in a mix of full-width and half-width Japanese
//! forms, so every comparison surface (search, moderation, topic
//! detection) goes through the same NFKC + casefold normalization. The
//! helpers here are pure and shared across modules.

use unicode_normalization::UnicodeNormalization;

/// NFKC-normalize and casefold a string. Full-width ASCII and half-width
/// kana are folded to their base forms, which keeps substring checks
/// stable regardless of how the user typed the text.
pub fn normalize(text: &str) -> String {
    text.nfkc().collect::<String>().to_lowercase()
}

/// Like [`normalize`] but additionally strips all whitespace. Used by the
/// abuse filter so that "死 ね" and "死ね" compare equal.
pub fn normalize_compact(text: &str) -> String {
    text.nfkc()
        .filter(|c| !c.is_whitespace())
        .collect::<String>()
        .to_lowercase()
}

/// Characters treated as token delimiters in addition to whitespace.
/// Covers common ASCII punctuation plus the Japanese marks we see in
/// chat messages.
fn is_delimiter(c: char) -> bool {
    matches!(
        c,
        ',' | '.' | ';' | ':' | '!' | '?' | '(' | ')' | '[' | ']' | '"' | '\''
            | '、' | '。' | '・' | '，' | '．' | '！' | '？' | '（' | '）'
            | '「' | '」' | '『' | '』' | '：' | '；' | '／' | '/'
    )
}

/// Split already-normalized text into non-empty tokens on whitespace and
/// punctuation. An input that yields no tokens is a valid (empty) result,
/// not an error.
pub fn tokenize(text: &str) -> Vec<&str> {
    text.split(|c: char| c.is_whitespace() || is_delimiter(c))
        .filter(|t| !t.is_empty())
        .collect()
}

/// Truncate a string to at most `max_chars` characters, respecting char
/// boundaries. Byte-based slicing would panic mid-codepoint on Japanese
/// text.
pub fn truncate_chars(text: &str, max_chars: usize) -> &str {
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}
