//! HTTP routes for the chat gateway.
//!
//! Sessions are created explicitly through `/api/get_session_id`; every other
//! session-scoped endpoint rejects identifiers that were never issued.

use axum::{
    extract::{Query, State},
    http::HeaderMap,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use colloquy_store::{Message, SessionId, Turn};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::error::ChatError;
use crate::orchestrator::Orchestrator;
use crate::stream::ndjson_response;

/// Header a client may use to name its session instead of, or alongside, the body.
pub const SESSION_ID_HEADER: &str = "x-session-id";

/// Shared handler state.
#[derive(Clone)]
pub struct AppState {
    pub orchestrator: Arc<Orchestrator>,
}

impl AppState {
    pub fn new(orchestrator: Orchestrator) -> Self {
        Self {
            orchestrator: Arc::new(orchestrator),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Request/Response Types
// ─────────────────────────────────────────────────────────────────────────────

/// New session response.
#[derive(Debug, Serialize, Deserialize)]
pub struct SessionResponse {
    pub session_id: String,
}

/// Body or query naming a session.
#[derive(Debug, Default, Deserialize)]
pub struct SessionRequest {
    #[serde(default)]
    pub session_id: Option<String>,
}

/// Stored messages of a session.
#[derive(Debug, Serialize, Deserialize)]
pub struct HistoryResponse {
    pub messages: Vec<Message>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub info: Option<String>,
}

/// Send message request.
#[derive(Debug, Default, Deserialize)]
pub struct SendMessageRequest {
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub session_id: Option<String>,
}

/// Assistant answer.
#[derive(Debug, Serialize, Deserialize)]
pub struct SendMessageResponse {
    pub message: String,
}

/// Stream message request.
#[derive(Debug, Default, Deserialize)]
pub struct StreamMessageRequest {
    #[serde(default)]
    pub prompt: Option<String>,
    #[serde(default)]
    pub session_id: Option<String>,
}

/// Turn-paired history.
#[derive(Debug, Serialize)]
pub struct TurnsResponse {
    pub turns: Vec<Turn>,
}

/// Health check response.
#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub service: String,
}

// ─────────────────────────────────────────────────────────────────────────────
// Router
// ─────────────────────────────────────────────────────────────────────────────

/// Build the chat API routes.
pub fn chat_routes(state: AppState) -> Router {
    Router::new()
        .route("/api/get_session_id", get(create_session_handler))
        .route(
            "/api/get_message_history",
            get(history_query_handler).post(history_body_handler),
        )
        .route("/api/send_message", post(send_message_handler))
        .route("/api/stream_message", post(stream_message_handler))
        .route("/api/get_turns", post(turns_handler))
        .with_state(state)
}

/// Build health check routes.
pub fn health_routes() -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/api/health", get(health_handler))
}

// ─────────────────────────────────────────────────────────────────────────────
// Helpers
// ─────────────────────────────────────────────────────────────────────────────

/// A present, well-formed session identifier.
fn require_session_id(raw: Option<&str>) -> Result<SessionId, ChatError> {
    let raw = raw
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .ok_or(ChatError::MissingField("session_id"))?;
    Ok(SessionId::parse(raw)?)
}

/// The session named by the body or the `X-Session-Id` header.
///
/// When both are present they must name the same session.
fn session_from_request(headers: &HeaderMap, body_id: Option<&str>) -> Result<SessionId, ChatError> {
    let body_id = body_id.map(str::trim).filter(|s| !s.is_empty());
    let header_id = headers
        .get(SESSION_ID_HEADER)
        .map(|h| h.to_str().unwrap_or_default().trim());

    match (body_id, header_id) {
        (Some(body), Some(header)) => {
            let session = SessionId::parse(body)?;
            if SessionId::parse(header).ok() != Some(session) {
                return Err(ChatError::SessionMismatch);
            }
            Ok(session)
        }
        (Some(body), None) => Ok(SessionId::parse(body)?),
        (None, header) => require_session_id(header),
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Handlers
// ─────────────────────────────────────────────────────────────────────────────

async fn create_session_handler(State(state): State<AppState>) -> Result<Json<SessionResponse>, ChatError> {
    let session = state.orchestrator.create_session().await?;
    Ok(Json(SessionResponse {
        session_id: session.to_string(),
    }))
}

async fn history_query_handler(
    State(state): State<AppState>,
    query: Option<Query<SessionRequest>>,
) -> Result<Json<HistoryResponse>, ChatError> {
    let request = query.map(|Query(q)| q).unwrap_or_default();
    history(&state, request).await
}

async fn history_body_handler(
    State(state): State<AppState>,
    body: Option<Json<SessionRequest>>,
) -> Result<Json<HistoryResponse>, ChatError> {
    let request = body.map(|Json(b)| b).unwrap_or_default();
    history(&state, request).await
}

async fn history(state: &AppState, request: SessionRequest) -> Result<Json<HistoryResponse>, ChatError> {
    let session = require_session_id(request.session_id.as_deref())?;
    let messages = state.orchestrator.history(&session).await?;
    let info = messages.is_empty().then(|| "No messages found".to_string());
    Ok(Json(HistoryResponse { messages, info }))
}

async fn send_message_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Option<Json<SendMessageRequest>>,
) -> Result<Json<SendMessageResponse>, ChatError> {
    let request = body.map(|Json(b)| b).unwrap_or_default();
    let message = request.message.ok_or(ChatError::MissingField("message"))?;
    let session = session_from_request(&headers, request.session_id.as_deref())?;

    let outcome = state.orchestrator.converse(session, message).await?;
    Ok(Json(SendMessageResponse {
        message: outcome.assistant.content,
    }))
}

async fn stream_message_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Option<Json<StreamMessageRequest>>,
) -> Result<Response, ChatError> {
    let request = body.map(|Json(b)| b).unwrap_or_default();
    let prompt = request.prompt.ok_or(ChatError::MissingField("prompt"))?;

    let fragments = if request.session_id.is_some() || headers.contains_key(SESSION_ID_HEADER) {
        let session = session_from_request(&headers, request.session_id.as_deref())?;
        state.orchestrator.converse_stream(session, prompt).await?
    } else {
        state.orchestrator.stream_stateless(prompt).await?
    };
    Ok(ndjson_response(fragments))
}

async fn turns_handler(
    State(state): State<AppState>,
    body: Option<Json<SessionRequest>>,
) -> Result<Json<TurnsResponse>, ChatError> {
    let request = body.map(|Json(b)| b).unwrap_or_default();
    let session = require_session_id(request.session_id.as_deref())?;
    let turns = state.orchestrator.turns(&session).await?;
    Ok(Json(TurnsResponse { turns }))
}

async fn health_handler() -> impl IntoResponse {
    Json(HealthResponse {
        status: "ok".into(),
        version: env!("CARGO_PKG_VERSION").into(),
        service: "colloquy-gateway".into(),
    })
}
