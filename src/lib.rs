//! Core library for Grantline. This module wires together the webhook
//! orchestrator, the knowledge/search components and the HTTP handlers.
//! Handlers stay thin; the per-event pipeline lives in `handle_event`
//! and its helpers so the flow reads top to bottom.

mod config;
pub mod grants;
pub mod knowledge;
pub mod line;
pub mod llm;
pub mod moderation;
pub mod search;
pub mod session;
pub mod util;

pub use config::AppConfig;

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tokio::task::JoinSet;

use crate::grants::{detect_from_text, parse_postback, topic, GrantKey, TOPICS};
use crate::knowledge::KnowledgeStore;
use crate::line::{to_plain_text, verify_signature, LineClient};
use crate::llm::{answer_plain, answer_with_context, Evidence, Generator, OpenAiClient};
use crate::moderation::{is_abusive, ABUSE_REPLY_MESSAGE};
use crate::session::SessionStore;
use crate::util::truncate_chars;

/// Structures representing the webhook payload delivered by the chat
/// platform. Only fields necessary for routing are captured; unknown
/// fields and event shapes are ignored.

#[derive(Debug, Deserialize, Serialize, Default, Clone)]
pub struct WebhookBody {
    #[serde(default)]
    pub events: Vec<WebhookEvent>,
}

#[derive(Debug, Deserialize, Serialize, Default, Clone)]
#[serde(rename_all = "camelCase")]
pub struct WebhookEvent {
    #[serde(rename = "type")]
    pub event_type: Option<String>,
    pub reply_token: Option<String>,
    pub source: Option<EventSource>,
    pub message: Option<EventMessage>,
    pub postback: Option<EventPostback>,
}

#[derive(Debug, Deserialize, Serialize, Default, Clone)]
#[serde(rename_all = "camelCase")]
pub struct EventSource {
    pub user_id: Option<String>,
}

#[derive(Debug, Deserialize, Serialize, Default, Clone)]
pub struct EventMessage {
    #[serde(rename = "type")]
    pub kind: Option<String>,
    pub text: Option<String>,
}

#[derive(Debug, Deserialize, Serialize, Default, Clone)]
pub struct EventPostback {
    pub data: Option<String>,
}

/// Greeting for `follow` events (user added the bot).
pub const WELCOME_MESSAGE: &str = "友だち追加ありがとうございます！質問をどうぞ。";

/// Best-effort apology sent when per-event processing fails.
pub const APOLOGY_MESSAGE: &str = "（一時メッセージ）返信でエラーが発生しました。";

/// Characters of evidence content handed to the model per document.
const EVIDENCE_MAX_CHARS: usize = 1200;

/// Characters of preview content exposed on the query endpoint.
const PREVIEW_MAX_CHARS: usize = 500;

/// Internal application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    pub knowledge: Arc<KnowledgeStore>,
    pub sessions: Arc<SessionStore>,
    pub generator: Arc<dyn Generator>,
    pub line: Arc<LineClient>,
    /// Webhook signature secret. None rejects every signed request.
    pub channel_secret: Option<String>,
    pub search_top_k: usize,
    /// Whether the generation backend has a credential; the query
    /// endpoint uses this to pick the `nohit` attribution.
    pub generator_configured: bool,
}

/// Build state from environment variables and warm the corpus cache.
/// Missing credentials are warned about but never fatal: signature
/// verification and generation degrade per the error design.
pub async fn build_state_from_env() -> anyhow::Result<AppState> {
    let config = AppConfig::from_env()?;
    build_state(config).await
}

pub async fn build_state(config: AppConfig) -> anyhow::Result<AppState> {
    if config.channel_secret.is_none() {
        tracing::warn!("LINE_CHANNEL_SECRET not set; all webhook posts will be rejected");
    }
    if config.channel_token.is_none() {
        tracing::warn!("LINE_CHANNEL_ACCESS_TOKEN not set; replies cannot be delivered");
    }
    if config.openai_api_key.is_none() {
        tracing::warn!("OPENAI_API_KEY not set; answers degrade to a static notice");
    }

    let knowledge = Arc::new(KnowledgeStore::new(config.knowledge_dir.clone()));
    if let Err(e) = knowledge.load(false).await {
        tracing::warn!(error = %e, "knowledge corpus unavailable at startup");
    }

    let sessions = Arc::new(SessionStore::new(Duration::from_secs(config.scope_ttl_secs)));
    let timeout = Duration::from_millis(config.openai_timeout_ms);
    let generator_configured = config.openai_api_key.is_some();
    let generator: Arc<dyn Generator> = Arc::new(OpenAiClient::new(
        config.openai_api_key,
        config.openai_base_url,
        config.openai_model,
        timeout,
    ));
    let line = Arc::new(LineClient::new(
        config.channel_token,
        config.reply_endpoint,
        timeout,
    ));

    Ok(AppState {
        knowledge,
        sessions,
        generator,
        line,
        channel_secret: config.channel_secret,
        search_top_k: config.search_top_k,
        generator_configured,
    })
}

/// Build the Axum router and attach handlers.
pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/webhook", post(webhook_handler).get(webhook_ping_handler))
        .route("/search", get(search_handler))
        .route("/healthz", get(healthz_handler))
        .with_state(state)
}

/// Webhook entry point. The signature covers the raw body, so the body is
/// taken as bytes and parsed only after verification.
async fn webhook_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: axum::body::Bytes,
) -> axum::response::Response {
    let signature = headers
        .get("x-line-signature")
        .and_then(|v| v.to_str().ok());
    let verified = match (state.channel_secret.as_deref(), signature) {
        (Some(secret), Some(sig)) => verify_signature(secret, &body, sig),
        _ => false,
    };
    if !verified {
        tracing::warn!("webhook rejected: bad or missing signature");
        return (
            StatusCode::FORBIDDEN,
            Json(serde_json::json!({ "ok": false, "reason": "bad signature" })),
        )
            .into_response();
    }

    let parsed: WebhookBody = match serde_json::from_slice(&body) {
        Ok(b) => b,
        Err(e) => {
            tracing::error!(error = %e, "webhook body was not valid JSON");
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(serde_json::json!({ "ok": false, "error": e.to_string() })),
            )
                .into_response();
        }
    };

    tracing::debug!(count = parsed.events.len(), "received webhook events");

    // Events are independent: each runs in its own task so one failing or
    // slow event never blocks its siblings.
    let mut tasks = JoinSet::new();
    for event in parsed.events {
        let state = state.clone();
        tasks.spawn(async move { handle_event(state, event).await });
    }
    while tasks.join_next().await.is_some() {}

    (StatusCode::OK, Json(serde_json::json!({ "ok": true }))).into_response()
}

/// Debug ping so deployments can confirm the route is reachable.
async fn webhook_ping_handler() -> axum::response::Response {
    let json = serde_json::json!({
        "ok": true,
        "path": "/webhook",
        "ts": chrono::Utc::now().timestamp_millis(),
    });
    (StatusCode::OK, Json(json)).into_response()
}

/// Per-event wrapper: any processing error is converted into a
/// best-effort apology reply and never propagates.
async fn handle_event(state: AppState, event: WebhookEvent) {
    let reply_token = event.reply_token.clone();
    if let Err(e) = process_event(&state, event).await {
        tracing::error!(error = %e, "event processing failed");
        if let Some(token) = reply_token {
            if let Err(e2) = state.line.reply(&token, APOLOGY_MESSAGE).await {
                tracing::error!(error = %e2, "fallback reply failed");
            }
        }
    }
}

async fn process_event(state: &AppState, event: WebhookEvent) -> anyhow::Result<()> {
    let (Some(reply_token), Some(user_id)) = (
        event.reply_token.as_deref(),
        event
            .source
            .as_ref()
            .and_then(|s| s.user_id.as_deref()),
    ) else {
        tracing::debug!(event_type = ?event.event_type, "skipping event without reply token or user");
        return Ok(());
    };

    if state.sessions.is_denied(user_id) {
        tracing::info!(user = %user_id, "dropping event from denied user");
        return Ok(());
    }

    match event.event_type.as_deref() {
        Some("postback") => {
            let data = event
                .postback
                .as_ref()
                .and_then(|p| p.data.as_deref())
                .unwrap_or("");
            if let Some(key) = parse_postback(data) {
                state.sessions.set_scope(user_id, key);
                tracing::info!(user = %user_id, grant = key.as_str(), "scope selected via postback");
                state.line.reply(reply_token, topic(key).ask_text).await?;
            } else {
                tracing::debug!(data = %data, "ignoring unrecognized postback");
            }
        }
        Some("message") => {
            let text = event
                .message
                .as_ref()
                .filter(|m| m.kind.as_deref() == Some("text"))
                .and_then(|m| m.text.as_deref());
            if let Some(text) = text {
                handle_text(state, reply_token, user_id, text).await?;
            } else {
                tracing::debug!("skipping non-text message event");
            }
        }
        Some("follow") => {
            state.line.reply(reply_token, WELCOME_MESSAGE).await?;
        }
        other => {
            tracing::debug!(event_type = ?other, "skipping unsupported event type");
        }
    }
    Ok(())
}

/// Text-message pipeline: abuse check, scope resolution, retrieval,
/// composition, delivery.
async fn handle_text(
    state: &AppState,
    reply_token: &str,
    user_id: &str,
    text: &str,
) -> anyhow::Result<()> {
    if is_abusive(text) {
        state.sessions.deny(user_id);
        tracing::warn!(user = %user_id, "abusive message; user denied");
        state.line.reply(reply_token, ABUSE_REPLY_MESSAGE).await?;
        return Ok(());
    }

    // Scope resolution: stored scope wins; inference only establishes a
    // scope when none exists and never overwrites an explicit selection.
    let mut scope = state.sessions.scope(user_id);
    if scope.is_none() {
        if let Some(guess) = detect_from_text(text) {
            state.sessions.set_scope(user_id, guess);
            tracing::info!(user = %user_id, grant = guess.as_str(), "scope inferred from text");
            scope = Some(guess);
        }
    }

    let key = match scope {
        Some(key) if !topic(key).ai_only => key,
        // Open-ended topic or no scope at all: model-only answer.
        _ => {
            let answer = answer_plain(state.generator.as_ref(), text).await;
            state
                .line
                .reply(reply_token, &to_plain_text(&answer))
                .await?;
            return Ok(());
        }
    };
    let meta = topic(key);

    // Mismatch hint: always re-detect against all topics; a differing
    // detection only appends a suggestion, never changes the scope.
    let mismatch_note = detect_from_text(text)
        .filter(|detected| *detected != key)
        .map(|detected| {
            format!(
                "\n\n（もしかして「{}」のご質問でしょうか？ リッチメニューから補助金名を選び直してください）",
                topic(detected).display
            )
        })
        .unwrap_or_default();

    let docs = state.knowledge.load(false).await?;
    // ai_only was excluded above, so a backing file exists.
    let preferred = meta.file.unwrap_or_default();
    let restrict: HashSet<&str> = std::iter::once(preferred).collect();
    let mut hits = search::search(&docs, text, state.search_top_k, Some(&restrict));
    if hits.is_empty() {
        hits = search::search(&docs, text, state.search_top_k, None);
    }
    let hits = search::prioritize(hits, preferred);

    let mut header = format!("【対象：{}】", meta.display);
    if let Some(url) = meta.url {
        header.push_str(&format!("\n参考: {}", url));
    }

    let answer = if hits.is_empty() {
        answer_plain(state.generator.as_ref(), text).await
    } else {
        let evidence: Vec<Evidence> = hits
            .iter()
            .map(|d| Evidence {
                source: meta.display.to_string(),
                topic: None,
                origin: Some(d.source.clone()),
                content: truncate_chars(&d.content, EVIDENCE_MAX_CHARS).to_string(),
            })
            .collect();
        answer_with_context(state.generator.as_ref(), text, &evidence).await
    };

    let body = format!("{header}\n\n{answer}{mismatch_note}");
    state
        .line
        .reply(reply_token, &to_plain_text(&body))
        .await?;
    Ok(())
}

#[derive(Debug, Deserialize)]
struct SearchQuery {
    q: Option<String>,
    grant: Option<String>,
}

static WS_RUN_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\s+").unwrap());

/// Whitespace-collapsed snippet with a truncation marker. Internal file
/// names never appear here.
fn preview(content: &str) -> String {
    let truncated = truncate_chars(content, PREVIEW_MAX_CHARS);
    let mut out = WS_RUN_RE.replace_all(truncated, " ").trim().to_string();
    if content.chars().count() > PREVIEW_MAX_CHARS {
        out.push_str("...");
    }
    out
}

fn resolve_grant_param(param: &str) -> Option<GrantKey> {
    let trimmed = param.trim();
    let mut chars = trimmed.chars();
    if let (Some(c), None) = (chars.next(), chars.next()) {
        if let Some(key) = GrantKey::from_char(c) {
            return Some(key);
        }
    }
    detect_from_text(trimmed)
}

/// Topic display name for a document, when the file backs a topic.
fn display_for_source(source: &str) -> Option<&'static str> {
    TOPICS
        .iter()
        .find(|t| t.file == Some(source))
        .map(|t| t.display)
}

/// Debug/alternate query surface over the same retrieval pipeline.
async fn search_handler(
    State(state): State<AppState>,
    axum::extract::Query(params): axum::extract::Query<SearchQuery>,
) -> axum::response::Response {
    let q = params.q.as_deref().map(str::trim).unwrap_or("");
    if q.is_empty() {
        return (
            StatusCode::BAD_REQUEST,
            Json(serde_json::json!({ "error": "q is required" })),
        )
            .into_response();
    }

    let grant = params.grant.as_deref().and_then(resolve_grant_param);
    if let Some(key) = grant {
        if topic(key).ai_only {
            let answer = answer_plain(state.generator.as_ref(), q).await;
            let json = serde_json::json!({ "query": q, "from": "gpt", "answer": answer });
            return (StatusCode::OK, Json(json)).into_response();
        }
    }

    let docs = match state.knowledge.load(false).await {
        Ok(docs) => docs,
        Err(e) => {
            tracing::error!(error = %e, "knowledge load failed");
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(serde_json::json!({
                    "error": "internal_error",
                    "message": e.to_string(),
                })),
            )
                .into_response();
        }
    };

    let restrict: Option<HashSet<&str>> = grant
        .and_then(|key| topic(key).file)
        .map(|file| std::iter::once(file).collect());
    let mut from = "knowledge";
    let mut hits = search::search(&docs, q, state.search_top_k, restrict.as_ref());
    if hits.is_empty() && restrict.is_some() {
        // Scoped search found nothing; surface global evidence but tag it
        // so callers can tell it fell outside the requested topic.
        hits = search::search(&docs, q, state.search_top_k, None);
        from = "combined";
    }

    if hits.is_empty() {
        if state.generator_configured {
            let answer = answer_plain(state.generator.as_ref(), q).await;
            let json = serde_json::json!({ "query": q, "from": "gpt", "answer": answer });
            return (StatusCode::OK, Json(json)).into_response();
        }
        let json = serde_json::json!({
            "query": q,
            "from": "nohit",
            "answer": llm::MISSING_KEY_NOTICE,
        });
        return (StatusCode::OK, Json(json)).into_response();
    }

    let hits_json: Vec<serde_json::Value> = hits
        .iter()
        .map(|d| {
            let mut entry = serde_json::json!({ "preview": preview(&d.content) });
            if let Some(display) = display_for_source(&d.source) {
                entry["source"] = serde_json::Value::String(display.to_string());
            }
            entry
        })
        .collect();
    let json = serde_json::json!({ "query": q, "from": from, "hits": hits_json });
    (StatusCode::OK, Json(json)).into_response()
}

/// Simple health endpoint for container readiness / liveness checks.
async fn healthz_handler(State(state): State<AppState>) -> axum::response::Response {
    let docs = state.knowledge.cached_count().await.unwrap_or(0);
    let json = serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "docs": docs,
        "topics": TOPICS.len(),
    });
    (StatusCode::OK, Json(json)).into_response()
}
