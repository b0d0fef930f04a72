//! Static metadata for the six grant-program topics (A–F).
//!
//! Each topic optionally references one knowledge document and carries a
//! set of alias keywords used to guess the topic from free text. Topic F
//! has no backing document and is answered by the model alone. The table
//! is defined at process start and never mutated.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;

use crate::util::normalize;

/// Rich-menu button keys. Serialized form matches the postback payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum GrantKey {
    A,
    B,
    C,
    D,
    E,
    F,
}

impl GrantKey {
    pub fn from_char(c: char) -> Option<Self> {
        match c.to_ascii_uppercase() {
            'A' => Some(Self::A),
            'B' => Some(Self::B),
            'C' => Some(Self::C),
            'D' => Some(Self::D),
            'E' => Some(Self::E),
            'F' => Some(Self::F),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::A => "A",
            Self::B => "B",
            Self::C => "C",
            Self::D => "D",
            Self::E => "E",
            Self::F => "F",
        }
    }
}

/// One grant program as shown to the user. `file` names the knowledge
/// document backing the topic; `ai_only` topics have none and bypass
/// retrieval entirely.
#[derive(Debug, Clone)]
pub struct GrantTopic {
    pub key: GrantKey,
    pub file: Option<&'static str>,
    pub display: &'static str,
    pub url: Option<&'static str>,
    pub ai_only: bool,
    pub aliases: &'static [&'static str],
    pub ask_text: &'static str,
}

pub static TOPICS: [GrantTopic; 6] = [
    GrantTopic {
        key: GrantKey::A,
        file: Some("jizokuka-2025.json"),
        display: "小規模事業者持続化補助金",
        url: Some("https://r6.jizokukahojokin.info/"),
        ai_only: false,
        aliases: &["小規模事業者持続化", "持続化補助金", "小規模", "持続化"],
        ask_text: "小規模事業者持続化補助金について質問事項を送信してください。",
    },
    GrantTopic {
        key: GrantKey::B,
        file: Some("it-dounyu-2025.json"),
        display: "IT導入補助金",
        url: Some("https://it-shien.smrj.go.jp/"),
        ai_only: false,
        aliases: &["it導入", "it", "デジタル化"],
        ask_text: "IT導入補助金について質問事項を送信してください。",
    },
    GrantTopic {
        key: GrantKey::C,
        file: Some("monozukuri-2025.json"),
        display: "ものづくり補助金",
        url: Some("https://portal.monodukuri-hojo.jp/"),
        ai_only: false,
        aliases: &["ものづくり", "モノづくり", "製造"],
        ask_text: "ものづくり補助金について質問事項を送信してください。",
    },
    GrantTopic {
        key: GrantKey::D,
        file: Some("shinjigyo-2025.json"),
        display: "新事業進出補助金",
        url: Some("https://shinjigyou-shinshutsu.smrj.go.jp/"),
        ai_only: false,
        aliases: &["新事業進出", "進出", "新事業"],
        ask_text: "新事業進出補助金について質問事項を送信してください。",
    },
    GrantTopic {
        key: GrantKey::E,
        file: Some("seichou_kasokuka-2025.json"),
        display: "成長加速化補助金（100億）",
        url: Some("https://growth-100-oku.smrj.go.jp/"),
        ai_only: false,
        aliases: &["成長加速化", "成長", "100億"],
        ask_text: "成長加速化補助金について質問事項を送信してください。",
    },
    GrantTopic {
        key: GrantKey::F,
        file: None,
        display: "その他の補助金",
        url: Some("https://wgconsulting.net/contact/"),
        ai_only: true,
        aliases: &["その他", "他の補助金", "汎用"],
        ask_text: "その他の補助金について質問事項を送信してください。",
    },
];

pub fn topic(key: GrantKey) -> &'static GrantTopic {
    match key {
        GrantKey::A => &TOPICS[0],
        GrantKey::B => &TOPICS[1],
        GrantKey::C => &TOPICS[2],
        GrantKey::D => &TOPICS[3],
        GrantKey::E => &TOPICS[4],
        GrantKey::F => &TOPICS[5],
    }
}

/// Guess a topic from free text by alias containment. First topic in
/// table order wins. Used both to establish a scope when none exists and
/// to suggest a reselect when the text drifts off-scope.
pub fn detect_from_text(text: &str) -> Option<GrantKey> {
    let t = normalize(text);
    for topic in TOPICS.iter() {
        if topic.aliases.iter().any(|a| t.contains(&normalize(a))) {
            return Some(topic.key);
        }
    }
    None
}

static POSTBACK_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)grant=([A-F])").unwrap());

/// Parse a rich-menu postback payload of the form `grant=A`.
pub fn parse_postback(data: &str) -> Option<GrantKey> {
    let caps = POSTBACK_RE.captures(data)?;
    caps.get(1)?.as_str().chars().next().and_then(GrantKey::from_char)
}
