//! Abuse filter.
//!
//! Deliberately narrow: only unambiguous hostile phrases are matched so
//! that typos, slang and keyboard mashing never trip it. Detection is a
//! pure containment check over normalized text.

use aho_corasick::{AhoCorasick, AhoCorasickBuilder};
use once_cell::sync::Lazy;

use crate::util::normalize_compact;

// Unambiguously hostile Japanese phrases. Expanding this list widens the
// filter; keep entries exact rather than fuzzy.
static STRONG_ABUSE: &[&str] = &[
    "死ね",
    "殺す",
    "殺してやる",
    "ぶっ殺",
    "殺害",
    "消えろ",
    "殺すぞ",
    "滅びろ",
];

static ABUSE_AC: Lazy<AhoCorasick> = Lazy::new(|| {
    AhoCorasickBuilder::new()
        .build(STRONG_ABUSE)
        .expect("abuse phrase automaton")
});

/// Reply sent once when a user trips the filter; the user is denied from
/// that point on for the process lifetime.
pub const ABUSE_REPLY_MESSAGE: &str =
    "お客様のメッセージにスパムまたは不適切な表現（暴言など）が検知されたため、\
     AIによる応答を一時的に停止させていただきます。\n\
     ご迷惑をおかけし大変申し訳ございませんが、ご理解いただけますようお願い申し上げます。";

/// Returns true if the text contains any hostile phrase after NFKC
/// normalization, whitespace stripping and casefolding.
pub fn is_abusive(text: &str) -> bool {
    ABUSE_AC.is_match(&normalize_compact(text))
}
