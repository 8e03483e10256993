//! HTTP layer: OpenAI-compatible routes over the backend registry.

use std::convert::Infallible;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::body::Body;
use axum::extract::rejection::JsonRejection;
use axum::extract::State;
use axum::http::header::{self, HeaderMap, HeaderName, HeaderValue};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use futures::StreamExt;
use serde_json::json;
use thiserror::Error;

use crate::backends::{
    collect_system_prompt, first_user_message, BackendKind, BackendRegistry, ChatChunk,
    ChunkStream, RouteError, SpawnRequest,
};
use crate::openai::{
    collect_completion, sse_stream, ChatCompletionRequest, CompletionError, ErrorBody, ModelList,
    StreamEncoder,
};
use crate::sessions::{resolve_session_id, SessionError, SessionStore};

pub const SESSION_HEADER: &str = "x-session-id";

#[derive(Error, Debug)]
pub enum ServerError {
    #[error("Failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        source: std::io::Error,
    },
    #[error("Server error: {0}")]
    Serve(#[from] std::io::Error),
}

#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<BackendRegistry>,
    pub sessions: Arc<SessionStore>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/v1/models", get(list_models))
        .route("/v1/chat/completions", post(chat_completions))
        .with_state(state)
}

/// Serves until `shutdown` resolves.
pub async fn serve(
    addr: SocketAddr,
    state: AppState,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> Result<(), ServerError> {
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|source| ServerError::Bind { addr, source })?;
    log::info!("Listening on http://{}", addr);
    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown)
        .await?;
    Ok(())
}

fn error_response(status: StatusCode, body: ErrorBody) -> Response {
    (status, Json(body)).into_response()
}

fn invalid_request(message: impl Into<String>) -> Response {
    error_response(
        StatusCode::BAD_REQUEST,
        ErrorBody::new(message, "invalid_request_error"),
    )
}

impl IntoResponse for RouteError {
    fn into_response(self) -> Response {
        match &self {
            RouteError::UnknownModel(_) => error_response(
                StatusCode::NOT_FOUND,
                ErrorBody::new(self.to_string(), "invalid_request_error").with_code("model_not_found"),
            ),
            RouteError::Unavailable(_) => error_response(
                StatusCode::SERVICE_UNAVAILABLE,
                ErrorBody::new(self.to_string(), "backend_unavailable"),
            ),
        }
    }
}

async fn health(State(state): State<AppState>) -> Json<serde_json::Value> {
    let backends: Vec<&str> = state
        .registry
        .available_backends()
        .into_iter()
        .map(|kind| kind.as_str())
        .collect();
    Json(json!({
        "status": "ok",
        "backends": backends,
        "sessions": state.sessions.len(),
    }))
}

async fn list_models(State(state): State<AppState>) -> Json<ModelList> {
    Json(ModelList::from_models(
        state.registry.list_models(),
        chrono::Utc::now().timestamp(),
    ))
}

fn explicit_session_id<'a>(headers: &'a HeaderMap, body: &'a ChatCompletionRequest) -> Option<&'a str> {
    headers
        .get(SESSION_HEADER)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|id| !id.is_empty())
        .or_else(|| body.session_id.as_deref().filter(|id| !id.is_empty()))
}

/// Records the session once its turn completes.
fn track_on_done(
    events: ChunkStream,
    sessions: Arc<SessionStore>,
    session_id: String,
    backend: BackendKind,
    message_count: usize,
) -> ChunkStream {
    events
        .inspect(move |chunk| {
            if let ChatChunk::Done {
                native_session_id, ..
            } = chunk
            {
                if let Err(e) = sessions.track_session(&session_id, backend, message_count) {
                    log::warn!("Session {} not tracked: {}", session_id, e);
                }
                log::debug!(
                    "session {} done on {} (native {:?})",
                    session_id,
                    backend,
                    native_session_id
                );
            }
        })
        .boxed()
}

async fn chat_completions(
    State(state): State<AppState>,
    headers: HeaderMap,
    payload: Result<Json<ChatCompletionRequest>, JsonRejection>,
) -> Response {
    let Json(body) = match payload {
        Ok(body) => body,
        Err(rejection) => return invalid_request(rejection.body_text()),
    };

    let messages = body.chat_messages();
    let Some(first_user) = first_user_message(&messages).map(str::to_string) else {
        return invalid_request("messages must contain at least one user message");
    };

    let (backend, model) = match state.registry.resolve(&body.model) {
        Ok(route) => route,
        Err(e) => return e.into_response(),
    };
    let kind = backend.kind();
    let response_model = if body.model.trim().is_empty() {
        format!("{}/{}", kind, model)
    } else {
        body.model.clone()
    };

    let system_prompt = collect_system_prompt(&messages);
    let session_id = resolve_session_id(
        explicit_session_id(&headers, &body),
        system_prompt.as_deref(),
        &first_user,
    );

    if let Err(e) = state.sessions.check_backend(&session_id, kind) {
        let status = match e {
            SessionError::BackendMismatch { .. } => StatusCode::CONFLICT,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        return error_response(status, ErrorBody::new(e.to_string(), "invalid_request_error"));
    }

    let message_count = messages.len() + 1;
    let mut request = SpawnRequest::new(model, messages, session_id.clone());
    request.system_prompt = system_prompt;
    request.temperature = body.temperature;
    request.max_tokens = body.max_tokens();
    request.is_new_conversation = state.sessions.is_new_conversation(&session_id);
    request.tools_enabled = state.registry.tools_enabled(kind);

    log::info!(
        "chat: backend={} model={} session={} new={} stream={}",
        kind,
        request.model,
        session_id,
        request.is_new_conversation,
        body.stream
    );

    // Dropping the guard (client gone, body dropped) kills the subprocess.
    let guard = request.cancel.clone().drop_guard();
    let events = track_on_done(
        backend.run(request).events,
        Arc::clone(&state.sessions),
        session_id.clone(),
        kind,
        message_count,
    );

    let session_header = HeaderValue::from_str(&session_id).ok();

    if body.stream {
        let frames = sse_stream(events, StreamEncoder::new(response_model)).map(move |frame| {
            let _alive = &guard;
            Ok::<_, Infallible>(frame)
        });
        let mut response = Response::new(Body::from_stream(frames));
        let headers = response.headers_mut();
        headers.insert(header::CONTENT_TYPE, HeaderValue::from_static("text/event-stream"));
        headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-cache"));
        if let Some(value) = session_header {
            headers.insert(HeaderName::from_static(SESSION_HEADER), value);
        }
        return response;
    }

    let result = collect_completion(events, &response_model).await;
    drop(guard);
    let mut response = match result {
        Ok(completion) => Json(completion).into_response(),
        Err(CompletionError::Backend(message)) => {
            error_response(StatusCode::BAD_GATEWAY, ErrorBody::new(message, "backend_error"))
        }
        Err(e @ CompletionError::Incomplete) => {
            error_response(StatusCode::BAD_GATEWAY, ErrorBody::new(e.to_string(), "backend_error"))
        }
    };
    if let Some(value) = session_header {
        response
            .headers_mut()
            .insert(HeaderName::from_static(SESSION_HEADER), value);
    }
    response
}
