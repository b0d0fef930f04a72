//! LINE transport plumbing: webhook signature verification, the reply
//! client, and a markdown-to-plain sanitizer applied before delivery.

use base64::Engine;
use hmac::{Hmac, Mac};
use once_cell::sync::Lazy;
use regex::Regex;
use sha2::Sha256;

pub const DEFAULT_REPLY_ENDPOINT: &str = "https://api.line.me/v2/bot/message/reply";

/// Base64 HMAC-SHA256 of the raw request body, as the platform computes
/// it for the `x-line-signature` header.
pub fn signature_for(channel_secret: &str, body: &[u8]) -> String {
    let mut mac = Hmac::<Sha256>::new_from_slice(channel_secret.as_bytes())
        .expect("hmac accepts any key length");
    mac.update(body);
    base64::engine::general_purpose::STANDARD.encode(mac.finalize().into_bytes())
}

/// Verify an inbound signature header against the raw body. Comparison is
/// constant-time over the encoded form.
pub fn verify_signature(channel_secret: &str, body: &[u8], signature: &str) -> bool {
    let computed = signature_for(channel_secret, body);
    constant_time_eq(computed.as_bytes(), signature.as_bytes())
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter()
        .zip(b.iter())
        .fold(0u8, |acc, (x, y)| acc | (x ^ y))
        == 0
}

#[derive(Debug, thiserror::Error)]
pub enum DeliveryError {
    #[error("LINE_CHANNEL_ACCESS_TOKEN is not configured")]
    MissingCredential,
    #[error("reply request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("reply rejected with status {status}: {body}")]
    Rejected { status: u16, body: String },
}

/// Client for the platform's reply endpoint. The endpoint is configurable
/// so tests can capture outbound replies with a stub server.
pub struct LineClient {
    client: reqwest::Client,
    endpoint: String,
    token: Option<String>,
}

impl LineClient {
    pub fn new(token: Option<String>, endpoint: String, timeout: std::time::Duration) -> Self {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .expect("failed to build reqwest client");
        Self {
            client,
            endpoint,
            token,
        }
    }

    /// Send one text reply for a reply token. Single attempt, no retry;
    /// the caller decides what a failure means.
    pub async fn reply(&self, reply_token: &str, text: &str) -> Result<(), DeliveryError> {
        let token = self
            .token
            .as_deref()
            .ok_or(DeliveryError::MissingCredential)?;
        let body = serde_json::json!({
            "replyToken": reply_token,
            "messages": [{ "type": "text", "text": text }]
        });
        let resp = self
            .client
            .post(&self.endpoint)
            .bearer_auth(token)
            .json(&body)
            .send()
            .await?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(DeliveryError::Rejected {
                status: status.as_u16(),
                body,
            });
        }
        Ok(())
    }
}

static BOLD_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?s)\*\*(.*?)\*\*").unwrap());
static BULLET_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?m)^\s*[-•*]\s+").unwrap());
static CODE_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"`([^`]*)`").unwrap());
static HEADER_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?m)^#+\s*").unwrap());
static BLANK_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\n{3,}").unwrap());

/// Flatten markdown-ish model output into the plain conversational form
/// the chat platform renders: bold and code markers removed, list markers
/// replaced with 「・」, headers stripped, blank runs collapsed.
pub fn to_plain_text(text: &str) -> String {
    let text = BOLD_RE.replace_all(text, "$1");
    let text = BULLET_RE.replace_all(&text, "・");
    let text = CODE_RE.replace_all(&text, "$1");
    let text = HEADER_RE.replace_all(&text, "");
    let text = BLANK_RE.replace_all(&text, "\n\n");
    text.trim().to_string()
}
