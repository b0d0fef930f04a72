//! Answer composition and the generative backend seam.
//!
//! The backend is an external collaborator hidden behind the [`Generator`]
//! trait; production uses an OpenAI-compatible chat-completions endpoint.
//! The composer operations are total: any backend failure (missing
//! credential, network error, bad status, unexpected shape) maps to a
//! static user-safe fallback string and is never surfaced to the caller
//! as an error.

use serde::Deserialize;

#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    #[error("OPENAI_API_KEY is not configured")]
    MissingCredential,
    #[error("backend request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("backend returned status {0}")]
    BadStatus(u16),
    #[error("backend response had no message content")]
    MalformedResponse,
}

/// Minimal text-generation capability required by the composer.
#[async_trait::async_trait]
pub trait Generator: Send + Sync {
    async fn generate(
        &self,
        system: &str,
        user: &str,
        max_tokens: u32,
    ) -> Result<String, BackendError>;
}

/// Chat-completions client. The base URL is configurable so tests can
/// point it at a stub server.
pub struct OpenAiClient {
    client: reqwest::Client,
    api_key: Option<String>,
    base_url: String,
    model: String,
}

#[derive(Debug, Deserialize)]
struct ChatCompletion {
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

#[derive(Debug, Deserialize)]
struct ChatMessage {
    content: Option<String>,
}

impl OpenAiClient {
    pub fn new(
        api_key: Option<String>,
        base_url: String,
        model: String,
        timeout: std::time::Duration,
    ) -> Self {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .expect("failed to build reqwest client");
        Self {
            client,
            api_key,
            base_url,
            model,
        }
    }
}

#[async_trait::async_trait]
impl Generator for OpenAiClient {
    async fn generate(
        &self,
        system: &str,
        user: &str,
        max_tokens: u32,
    ) -> Result<String, BackendError> {
        let key = self
            .api_key
            .as_deref()
            .ok_or(BackendError::MissingCredential)?;
        let url = format!("{}/chat/completions", self.base_url.trim_end_matches('/'));
        let body = serde_json::json!({
            "model": self.model,
            "messages": [
                { "role": "system", "content": system },
                { "role": "user", "content": user }
            ],
            "temperature": 0.2,
            "max_tokens": max_tokens
        });
        let resp = self
            .client
            .post(&url)
            .bearer_auth(key)
            .json(&body)
            .send()
            .await?;
        let status = resp.status();
        if !status.is_success() {
            return Err(BackendError::BadStatus(status.as_u16()));
        }
        let completion: ChatCompletion = resp.json().await?;
        let text = completion
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .map(|c| c.trim().to_string())
            .filter(|c| !c.is_empty())
            .ok_or(BackendError::MalformedResponse)?;
        Ok(text)
    }
}

/// One retrieved snippet handed to the model as grounding material.
#[derive(Debug, Clone)]
pub struct Evidence {
    /// User-facing source label (topic display name).
    pub source: String,
    /// Optional topic label.
    pub topic: Option<String>,
    /// Optional origin label (internal file name; prompt-only, never
    /// exposed over HTTP).
    pub origin: Option<String>,
    pub content: String,
}

const PLAIN_SYSTEM: &str = "あなたは日本の中小企業向け補助金に詳しいアシスタントです。\
根拠が不確かな場合はその旨を正直に伝え、推測は控えめに。箇条書きで簡潔に回答してください。";

const CONTEXT_SYSTEM: &str = "あなたは日本の中小企業向け補助金に詳しいアシスタントです。\
以下の【知識】を一次根拠にし、矛盾があれば『不明』や『要確認』と明示し、\
日本語で簡潔に（箇条書き中心で）回答してください。ユーザーの誤解があれば正します。";

/// Shown when the backend credential is absent; the request itself still
/// succeeds.
pub const MISSING_KEY_NOTICE: &str =
    "（システム設定：OPENAI_API_KEY が未設定のためGPT回答は無効です）";

/// Shown on any other backend failure. Kept static so internal error
/// detail never reaches the end user.
pub const BACKEND_FAILURE_NOTICE: &str =
    "（現在AIによる回答を生成できません。お手数ですが、時間をおいて再度お試しください）";

const PLAIN_MAX_TOKENS: u32 = 700;
const CONTEXT_MAX_TOKENS: u32 = 900;

/// Map a backend error to the canned text delivered in its place.
pub fn fallback_for(err: &BackendError) -> &'static str {
    match err {
        BackendError::MissingCredential => MISSING_KEY_NOTICE,
        _ => BACKEND_FAILURE_NOTICE,
    }
}

pub(crate) fn build_context_prompt(question: &str, evidence: &[Evidence]) -> String {
    let knowledge = evidence
        .iter()
        .enumerate()
        .map(|(i, e)| {
            let mut labels = format!("[source:{}]", e.source);
            if let Some(topic) = &e.topic {
                labels.push_str(&format!(" [topic:{}]", topic));
            }
            if let Some(origin) = &e.origin {
                labels.push_str(&format!(" [file:{}]", origin));
            }
            format!("#{}\n{}\n{}", i + 1, labels, e.content)
        })
        .collect::<Vec<_>>()
        .join("\n\n");

    format!(
        "【質問】\n{question}\n\n【知識】\n{knowledge}\n\n【出力要件】\n\
         - まず結論\n\
         - 次に根拠（どのsourceの要約か軽く触れる）\n\
         - 不確実な点は『要確認』と明示\n\
         - 箇条書き中心で簡潔に"
    )
}

/// Answer without retrieved context. Total: failures degrade to a
/// fallback string.
pub async fn answer_plain(generator: &dyn Generator, question: &str) -> String {
    match generator
        .generate(PLAIN_SYSTEM, question, PLAIN_MAX_TOKENS)
        .await
    {
        Ok(text) => text,
        Err(err) => {
            tracing::error!(error = %err, "plain generation failed");
            fallback_for(&err).to_string()
        }
    }
}

/// Answer grounded in retrieved evidence. Total, same fallback discipline
/// as [`answer_plain`].
pub async fn answer_with_context(
    generator: &dyn Generator,
    question: &str,
    evidence: &[Evidence],
) -> String {
    let prompt = build_context_prompt(question, evidence);
    match generator
        .generate(CONTEXT_SYSTEM, &prompt, CONTEXT_MAX_TOKENS)
        .await
    {
        Ok(text) => text,
        Err(err) => {
            tracing::error!(error = %err, "contextual generation failed");
            fallback_for(&err).to_string()
        }
    }
}
