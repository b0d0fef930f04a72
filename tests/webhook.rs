use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::post;
use axum::{Json, Router};
use tempfile::TempDir;
use tokio::net::TcpListener;

use grantline::grants::GrantKey;
use grantline::knowledge::KnowledgeStore;
use grantline::line::{signature_for, LineClient};
use grantline::llm::{BackendError, Generator};
use grantline::moderation::ABUSE_REPLY_MESSAGE;
use grantline::session::SessionStore;
use grantline::{app, AppState, APOLOGY_MESSAGE, WELCOME_MESSAGE};

const CHANNEL_SECRET: &str = "test-channel-secret";
const STUB_ANSWER: &str = "これはテスト回答です";

// ---- stub reply endpoint --------------------------------------------------

#[derive(Clone)]
struct ReplySink {
    log: Arc<Mutex<Vec<serde_json::Value>>>,
    status: StatusCode,
}

async fn reply_sink_handler(
    State(sink): State<ReplySink>,
    Json(body): Json<serde_json::Value>,
) -> (StatusCode, Json<serde_json::Value>) {
    sink.log.lock().unwrap().push(body);
    (sink.status, Json(serde_json::json!({})))
}

async fn spawn_reply_sink(status: StatusCode) -> (String, Arc<Mutex<Vec<serde_json::Value>>>) {
    let sink = ReplySink {
        log: Arc::new(Mutex::new(Vec::new())),
        status,
    };
    let log = sink.log.clone();
    let router = Router::new()
        .route("/reply", post(reply_sink_handler))
        .with_state(sink);
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
    (format!("http://{}/reply", addr), log)
}

// ---- stub generator -------------------------------------------------------

struct StubGenerator {
    calls: Arc<AtomicUsize>,
}

#[async_trait::async_trait]
impl Generator for StubGenerator {
    async fn generate(&self, _: &str, _: &str, _: u32) -> Result<String, BackendError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(STUB_ANSWER.to_string())
    }
}

// ---- app under test -------------------------------------------------------

struct TestApp {
    addr: String,
    replies: Arc<Mutex<Vec<serde_json::Value>>>,
    state: AppState,
    generate_calls: Arc<AtomicUsize>,
    _tmp: TempDir,
}

impl TestApp {
    fn reply_texts(&self) -> Vec<String> {
        self.replies
            .lock()
            .unwrap()
            .iter()
            .filter_map(|r| {
                r.pointer("/messages/0/text")
                    .and_then(|t| t.as_str())
                    .map(str::to_string)
            })
            .collect()
    }
}

async fn write_corpus(dir: &std::path::Path) {
    let index = serde_json::json!({
        "files": ["jizokuka-2025.json", "it-dounyu-2025.json"]
    });
    tokio::fs::write(dir.join("index.json"), index.to_string())
        .await
        .unwrap();
    let jizokuka = serde_json::json!({
        "制度名": "小規模事業者持続化補助金",
        "概要": "小規模事業者の販路開拓を支援する持続化補助金。上限額は50万円。"
    });
    tokio::fs::write(dir.join("jizokuka-2025.json"), jizokuka.to_string())
        .await
        .unwrap();
    let it = serde_json::json!({
        "制度名": "IT導入補助金",
        "概要": "ソフトウェア導入費を支援。デジタル化を推進する。"
    });
    tokio::fs::write(dir.join("it-dounyu-2025.json"), it.to_string())
        .await
        .unwrap();
}

async fn spawn_app_with_reply_status(status: StatusCode) -> TestApp {
    let tmp = TempDir::new().unwrap();
    write_corpus(tmp.path()).await;

    let (reply_url, replies) = spawn_reply_sink(status).await;
    let generate_calls = Arc::new(AtomicUsize::new(0));

    let state = AppState {
        knowledge: Arc::new(KnowledgeStore::new(tmp.path())),
        sessions: Arc::new(SessionStore::default()),
        generator: Arc::new(StubGenerator {
            calls: generate_calls.clone(),
        }),
        line: Arc::new(LineClient::new(
            Some("test-token".into()),
            reply_url,
            Duration::from_secs(5),
        )),
        channel_secret: Some(CHANNEL_SECRET.into()),
        search_top_k: 6,
        generator_configured: true,
    };

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let router = app(state.clone());
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });

    TestApp {
        addr: format!("http://{}", addr),
        replies,
        state,
        generate_calls,
        _tmp: tmp,
    }
}

async fn spawn_app() -> TestApp {
    spawn_app_with_reply_status(StatusCode::OK).await
}

async fn post_signed(addr: &str, raw: &str) -> reqwest::Response {
    let sig = signature_for(CHANNEL_SECRET, raw.as_bytes());
    reqwest::Client::new()
        .post(format!("{}/webhook", addr))
        .header("x-line-signature", sig)
        .header("content-type", "application/json")
        .body(raw.to_string())
        .send()
        .await
        .unwrap()
}

fn text_event(user: &str, text: &str) -> serde_json::Value {
    serde_json::json!({
        "events": [{
            "type": "message",
            "replyToken": "rt-1",
            "source": { "userId": user },
            "message": { "type": "text", "text": text }
        }]
    })
}

// ---- tests ------------------------------------------------------------------

#[tokio::test]
async fn bad_signature_is_rejected_without_side_effects() {
    let app = spawn_app().await;
    let body = text_event("u-sig", "持続化補助金について").to_string();
    let resp = reqwest::Client::new()
        .post(format!("{}/webhook", app.addr))
        .header("x-line-signature", "not-a-signature")
        .header("content-type", "application/json")
        .body(body)
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 403);
    assert!(app.replies.lock().unwrap().is_empty());
    assert_eq!(app.state.sessions.scope("u-sig"), None);
    assert_eq!(app.generate_calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn missing_signature_is_rejected() {
    let app = spawn_app().await;
    let resp = reqwest::Client::new()
        .post(format!("{}/webhook", app.addr))
        .header("content-type", "application/json")
        .body(text_event("u", "こんにちは").to_string())
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 403);
}

#[tokio::test]
async fn malformed_json_returns_server_error() {
    let app = spawn_app().await;
    let resp = post_signed(&app.addr, "{not json").await;
    assert_eq!(resp.status(), 500);
    let json: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(json.get("ok").unwrap(), &serde_json::json!(false));
    assert!(json.get("error").is_some());
}

#[tokio::test]
async fn postback_selects_scope_and_replies_with_ask_text() {
    let app = spawn_app().await;
    let body = serde_json::json!({
        "events": [{
            "type": "postback",
            "replyToken": "rt-pb",
            "source": { "userId": "u-postback" },
            "postback": { "data": "grant=A" }
        }]
    });
    let resp = post_signed(&app.addr, &body.to_string()).await;
    assert_eq!(resp.status(), 200);
    assert_eq!(app.state.sessions.scope("u-postback"), Some(GrantKey::A));
    assert_eq!(
        app.reply_texts(),
        vec!["小規模事業者持続化補助金について質問事項を送信してください。".to_string()]
    );
}

#[tokio::test]
async fn denied_user_produces_no_reply_or_state_change() {
    let app = spawn_app().await;
    app.state.sessions.deny("u-denied");
    let resp = post_signed(&app.addr, &text_event("u-denied", "持続化補助金は？").to_string()).await;
    assert_eq!(resp.status(), 200);
    assert!(app.replies.lock().unwrap().is_empty());
    assert_eq!(app.state.sessions.scope("u-denied"), None);
    assert_eq!(app.generate_calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn abusive_text_denies_user_without_generation() {
    let app = spawn_app().await;
    let resp = post_signed(&app.addr, &text_event("u-abuse", "死ね").to_string()).await;
    assert_eq!(resp.status(), 200);
    assert!(app.state.sessions.is_denied("u-abuse"));
    assert_eq!(app.reply_texts(), vec![ABUSE_REPLY_MESSAGE.to_string()]);
    assert_eq!(app.generate_calls.load(Ordering::SeqCst), 0);

    // Follow-up messages from the denied user are dropped.
    post_signed(&app.addr, &text_event("u-abuse", "ごめんなさい").to_string()).await;
    assert_eq!(app.replies.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn scoped_question_answers_under_topic_header() {
    let app = spawn_app().await;
    app.state.sessions.set_scope("u-scoped", GrantKey::A);
    let resp = post_signed(
        &app.addr,
        &text_event("u-scoped", "持続化補助金の上限額を教えて").to_string(),
    )
    .await;
    assert_eq!(resp.status(), 200);
    let texts = app.reply_texts();
    assert_eq!(texts.len(), 1);
    assert!(texts[0].contains("【対象：小規模事業者持続化補助金】"));
    assert!(texts[0].contains(STUB_ANSWER));
    assert_eq!(app.generate_calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn scope_is_inferred_once_then_sticks() {
    let app = spawn_app().await;
    let resp = post_signed(
        &app.addr,
        &text_event("u-infer", "ものづくりの対象経費は？").to_string(),
    )
    .await;
    assert_eq!(resp.status(), 200);
    assert_eq!(app.state.sessions.scope("u-infer"), Some(GrantKey::C));

    // A later message mentioning another topic must not overwrite it.
    post_signed(
        &app.addr,
        &text_event("u-infer", "持続化補助金も気になる").to_string(),
    )
    .await;
    assert_eq!(app.state.sessions.scope("u-infer"), Some(GrantKey::C));
}

#[tokio::test]
async fn off_scope_question_appends_reselect_hint() {
    let app = spawn_app().await;
    app.state.sessions.set_scope("u-mismatch", GrantKey::B);
    let resp = post_signed(
        &app.addr,
        &text_event("u-mismatch", "持続化補助金の締切は？").to_string(),
    )
    .await;
    assert_eq!(resp.status(), 200);
    let texts = app.reply_texts();
    assert_eq!(texts.len(), 1);
    assert!(texts[0].contains("【対象：IT導入補助金】"));
    assert!(texts[0].contains("もしかして「小規模事業者持続化補助金」"));
    // Scope itself is untouched.
    assert_eq!(app.state.sessions.scope("u-mismatch"), Some(GrantKey::B));
}

#[tokio::test]
async fn unscoped_question_without_alias_gets_model_only_answer() {
    let app = spawn_app().await;
    let resp = post_signed(
        &app.addr,
        &text_event("u-plain", "こんにちは、質問があります").to_string(),
    )
    .await;
    assert_eq!(resp.status(), 200);
    assert_eq!(app.reply_texts(), vec![STUB_ANSWER.to_string()]);
    assert_eq!(app.state.sessions.scope("u-plain"), None);
}

#[tokio::test]
async fn ai_only_scope_skips_retrieval() {
    let app = spawn_app().await;
    app.state.sessions.set_scope("u-f", GrantKey::F);
    let resp = post_signed(
        &app.addr,
        &text_event("u-f", "他に使える補助金はありますか").to_string(),
    )
    .await;
    assert_eq!(resp.status(), 200);
    let texts = app.reply_texts();
    assert_eq!(texts, vec![STUB_ANSWER.to_string()]);
}

#[tokio::test]
async fn follow_event_is_greeted() {
    let app = spawn_app().await;
    let body = serde_json::json!({
        "events": [{
            "type": "follow",
            "replyToken": "rt-follow",
            "source": { "userId": "u-new" }
        }]
    });
    post_signed(&app.addr, &body.to_string()).await;
    assert_eq!(app.reply_texts(), vec![WELCOME_MESSAGE.to_string()]);
}

#[tokio::test]
async fn events_missing_identity_are_skipped() {
    let app = spawn_app().await;
    let body = serde_json::json!({
        "events": [
            { "type": "message", "message": { "type": "text", "text": "誰？" } },
            { "type": "unknown-kind", "replyToken": "rt", "source": { "userId": "u" } }
        ]
    });
    let resp = post_signed(&app.addr, &body.to_string()).await;
    assert_eq!(resp.status(), 200);
    assert!(app.replies.lock().unwrap().is_empty());
}

#[tokio::test]
async fn one_failing_event_does_not_block_siblings() {
    let app = spawn_app().await;
    app.state.sessions.set_scope("u-ok", GrantKey::A);
    let body = serde_json::json!({
        "events": [
            // No user id: skipped quietly.
            { "type": "message", "message": { "type": "text", "text": "無効" } },
            {
                "type": "message",
                "replyToken": "rt-ok",
                "source": { "userId": "u-ok" },
                "message": { "type": "text", "text": "持続化補助金の上限額は？" }
            }
        ]
    });
    let resp = post_signed(&app.addr, &body.to_string()).await;
    assert_eq!(resp.status(), 200);
    let texts = app.reply_texts();
    assert_eq!(texts.len(), 1);
    assert!(texts[0].contains(STUB_ANSWER));
}

#[tokio::test]
async fn delivery_failure_triggers_one_fallback_attempt() {
    // Reply endpoint rejects everything; the event handler should log,
    // attempt the apology once, and still return 200 for the batch.
    let app = spawn_app_with_reply_status(StatusCode::INTERNAL_SERVER_ERROR).await;
    let resp = post_signed(&app.addr, &text_event("u-fail", "こんにちは").to_string()).await;
    assert_eq!(resp.status(), 200);
    let texts = app.reply_texts();
    assert_eq!(texts.len(), 2);
    assert_eq!(texts[1], APOLOGY_MESSAGE);
}

#[tokio::test]
async fn webhook_get_ping_responds_ok() {
    let app = spawn_app().await;
    let resp = reqwest::get(format!("{}/webhook", app.addr)).await.unwrap();
    assert_eq!(resp.status(), 200);
    let json: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(json.get("ok").unwrap(), &serde_json::json!(true));
    assert_eq!(json.get("path").unwrap(), &serde_json::json!("/webhook"));
}

#[tokio::test]
async fn healthz_reports_corpus_size() {
    let app = spawn_app().await;
    // Warm the cache through the store directly.
    app.state.knowledge.load(false).await.unwrap();
    let resp = reqwest::get(format!("{}/healthz", app.addr)).await.unwrap();
    assert_eq!(resp.status(), 200);
    let json: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(json.get("status").unwrap(), &serde_json::json!("ok"));
    assert_eq!(json.get("docs").unwrap(), &serde_json::json!(2));
    assert_eq!(json.get("topics").unwrap(), &serde_json::json!(6));
}
