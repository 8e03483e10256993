//! End-to-end checks against the real CLI tools.
//!
//! All tests are `#[ignore]`: they need the tools installed and authenticated,
//! and they cost real API tokens. A test for a tool that is not installed
//! returns early.
//!
//! Run with:
//! ```bash
//! cargo test --test cli_verify -- --ignored --nocapture --test-threads=1
//! ```

use std::sync::Arc;
use std::time::Duration;

use axum::body::{to_bytes, Body};
use axum::http::{Request, StatusCode};
use cligate_lib::backends::{
    Backend, BackendKind, BackendRegistry, ChatChunk, ChatMessage, SpawnRequest,
};
use cligate_lib::config::{BackendConfig, GatewayConfig};
use cligate_lib::server::{router, AppState, SESSION_HEADER};
use cligate_lib::sessions::SessionStore;
use futures::StreamExt;
use serde_json::{json, Value};
use tower::ServiceExt;

const TURN_TIMEOUT: Duration = Duration::from_secs(180);

// ============================================================================
// Harness
// ============================================================================

/// Builds the backend for `kind` if its CLI is on PATH.
async fn installed(kind: BackendKind) -> Option<Arc<dyn Backend>> {
    let backend = BackendRegistry::build_backend(kind, &BackendConfig::default());
    let status = backend.check_installed().await;
    if !status.installed {
        eprintln!("  [harness] {} not installed, skipping", kind);
        return None;
    }
    eprintln!(
        "  [harness] {} at {} ({})",
        kind,
        status.path.as_deref().unwrap_or("?"),
        status.version.as_deref().unwrap_or("unknown version")
    );
    Some(backend)
}

/// Runs one turn and returns (concatenated text, terminal chunk).
async fn run_turn(backend: &dyn Backend, request: SpawnRequest) -> (String, ChatChunk) {
    let events = backend.run(request).events;
    let chunks: Vec<ChatChunk> = tokio::time::timeout(TURN_TIMEOUT, events.collect())
        .await
        .expect("turn timed out");

    let mut text = String::new();
    let mut terminal = None;
    for chunk in chunks {
        eprintln!("  [chunk] {:?}", chunk);
        match chunk {
            ChatChunk::Content { text: piece } => {
                assert!(terminal.is_none(), "content after terminal chunk");
                text.push_str(&piece);
            }
            other => {
                assert!(terminal.is_none(), "more than one terminal chunk");
                terminal = Some(other);
            }
        }
    }
    (text, terminal.expect("sequence ended without a terminal chunk"))
}

fn arithmetic_request(kind: BackendKind, session_id: &str) -> SpawnRequest {
    let model = BackendRegistry::build_backend(kind, &BackendConfig::default()).default_model();
    let mut request = SpawnRequest::new(
        model,
        vec![ChatMessage::new(
            "user",
            "What is 2+2? Reply with just the number.",
        )],
        session_id,
    );
    request.system_prompt = Some("You are a terse calculator.".to_string());
    request
}

async fn check_arithmetic(kind: BackendKind) {
    let Some(backend) = installed(kind).await else {
        return;
    };
    let session = uuid::Uuid::new_v4().to_string();
    let (text, terminal) = run_turn(backend.as_ref(), arithmetic_request(kind, &session)).await;

    assert!(
        matches!(terminal, ChatChunk::Done { .. }),
        "expected done, got {terminal:?}"
    );
    assert!(text.contains('4'), "unexpected answer: {text:?}");
}

// ============================================================================
// Per-tool turns
// ============================================================================

#[tokio::test]
#[ignore]
async fn claude_answers_arithmetic() {
    check_arithmetic(BackendKind::Claude).await;
}

#[tokio::test]
#[ignore]
async fn codex_answers_arithmetic() {
    check_arithmetic(BackendKind::Codex).await;
}

#[tokio::test]
#[ignore]
async fn gemini_answers_arithmetic() {
    check_arithmetic(BackendKind::Gemini).await;
}

#[tokio::test]
#[ignore]
async fn claude_resumes_its_own_session() {
    let Some(backend) = installed(BackendKind::Claude).await else {
        return;
    };
    let session = uuid::Uuid::new_v4().to_string();

    let mut first = SpawnRequest::new(
        "haiku",
        vec![ChatMessage::new("user", "Remember the word 'pelican'. Reply OK.")],
        session.as_str(),
    );
    first.is_new_conversation = true;
    let (_, terminal) = run_turn(backend.as_ref(), first).await;
    let ChatChunk::Done {
        native_session_id, ..
    } = &terminal
    else {
        panic!("first turn failed: {terminal:?}");
    };
    assert!(native_session_id.is_some());

    let mut second = SpawnRequest::new(
        "haiku",
        vec![
            ChatMessage::new("user", "Remember the word 'pelican'. Reply OK."),
            ChatMessage::new("assistant", "OK"),
            ChatMessage::new("user", "Which word did I ask you to remember? One word."),
        ],
        session.as_str(),
    );
    second.is_new_conversation = false;
    let (text, terminal) = run_turn(backend.as_ref(), second).await;
    assert!(matches!(terminal, ChatChunk::Done { .. }), "{terminal:?}");
    assert!(text.to_lowercase().contains("pelican"), "{text:?}");
}

#[tokio::test]
#[ignore]
async fn cancellation_stops_a_real_turn() {
    let Some(backend) = installed(BackendKind::Claude).await else {
        return;
    };
    let request = SpawnRequest::new(
        "haiku",
        vec![ChatMessage::new("user", "Count slowly from 1 to 200, one number per line.")],
        uuid::Uuid::new_v4().to_string(),
    );
    let cancel = request.cancel.clone();
    let mut events = backend.run(request).events;

    let first = tokio::time::timeout(TURN_TIMEOUT, events.next())
        .await
        .expect("no output");
    eprintln!("  [chunk] {:?}", first);
    cancel.cancel();

    let rest: Vec<ChatChunk> = tokio::time::timeout(Duration::from_secs(10), events.collect())
        .await
        .expect("sequence did not end after cancellation");
    assert!(rest.iter().all(|c| !c.is_terminal()), "{rest:?}");
}

// ============================================================================
// Through the HTTP layer
// ============================================================================

#[tokio::test]
#[ignore]
async fn http_non_streaming_completion() {
    let registry = BackendRegistry::detect(&GatewayConfig::default()).await;
    let Some(kind) = registry.available_backends().first().copied() else {
        eprintln!("  [harness] no CLI installed, skipping");
        return;
    };
    let state = AppState {
        registry: Arc::new(registry),
        sessions: Arc::new(SessionStore::new(Duration::from_secs(600))),
    };

    let body = json!({
        "model": kind.as_str(),
        "stream": false,
        "messages": [{"role": "user", "content": "2+2?"}]
    });
    let req = Request::builder()
        .method("POST")
        .uri("/v1/chat/completions")
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .expect("request");

    let resp = tokio::time::timeout(TURN_TIMEOUT, router(state).oneshot(req))
        .await
        .expect("request timed out")
        .expect("response");
    assert_eq!(resp.status(), StatusCode::OK);
    assert!(resp.headers().contains_key(SESSION_HEADER));

    let bytes = to_bytes(resp.into_body(), usize::MAX).await.expect("body");
    let payload: Value = serde_json::from_slice(&bytes).expect("json");
    eprintln!("  [response] {}", payload);
    assert_eq!(payload["choices"][0]["finish_reason"], "stop");
    let content = payload["choices"][0]["message"]["content"]
        .as_str()
        .expect("content");
    assert!(content.chars().any(|c| c.is_ascii_digit()), "{content:?}");
}
