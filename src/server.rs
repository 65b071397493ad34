//! HTTP surface: a thin axum layer over `ChatAgent`.
//!
//! Chat endpoints always answer with the `ApiResponse` envelope, including on
//! failure; the caller never sees a bare 500 for a chat turn. Identity
//! travels in `x-user-id` / `x-user-name` headers.

use std::convert::Infallible;
use std::sync::Arc;

use axum::body::Body;
use axum::extract::{Path, Query, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use futures_util::StreamExt;
use serde::{Deserialize, Serialize};

use crate::agent::finalizer::AlertLevel;
use crate::agent::{ChatAgent, ChatResult, HistoryPage, TurnError};
use crate::database::SessionRecord;

#[derive(Debug, Clone, Serialize)]
pub struct ApiResponse<T> {
    pub success: bool,
    pub message: String,
    pub data: Option<T>,
}

impl<T> ApiResponse<T> {
    pub fn ok(message: impl Into<String>, data: T) -> Self {
        Self {
            success: true,
            message: message.into(),
            data: Some(data),
        }
    }

    pub fn err(message: impl Into<String>) -> Self {
        Self {
            success: false,
            message: message.into(),
            data: None,
        }
    }
}

#[derive(Clone)]
pub struct ServerState {
    pub agent: Arc<ChatAgent>,
}

#[derive(Debug, Deserialize)]
pub struct ChatRequest {
    pub message: String,
    #[serde(default)]
    pub session_id: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct HistoryQuery {
    #[serde(default = "default_page")]
    pub page: usize,
    #[serde(default = "default_per_page")]
    pub per_page: usize,
}

fn default_page() -> usize {
    1
}

fn default_per_page() -> usize {
    20
}

#[derive(Debug, Serialize)]
pub struct SessionOpened {
    pub session_id: String,
}

fn identity_from(headers: &HeaderMap) -> Option<(String, String)> {
    let user_id = headers
        .get("x-user-id")
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())?;
    let user_name = headers
        .get("x-user-name")
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .unwrap_or("there");
    Some((user_id.to_string(), user_name.to_string()))
}

pub fn build_router(state: ServerState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/chat", post(chat))
        .route("/chat/stream", post(chat_stream))
        .route("/sessions", post(open_session).get(list_sessions))
        .route("/sessions/:session_id/history", get(session_history))
        .with_state(state)
}

pub async fn serve(agent: Arc<ChatAgent>, bind_addr: &str) -> anyhow::Result<()> {
    let router = build_router(ServerState { agent });
    let listener = tokio::net::TcpListener::bind(bind_addr).await?;
    tracing::info!("Listening on {}", bind_addr);
    axum::serve(listener, router).await?;
    Ok(())
}

async fn health() -> Json<ApiResponse<()>> {
    Json(ApiResponse {
        success: true,
        message: "Mental health support service active".to_string(),
        data: None,
    })
}

async fn chat(
    State(state): State<ServerState>,
    headers: HeaderMap,
    Json(request): Json<ChatRequest>,
) -> Json<ApiResponse<ChatResult>> {
    let Some((user_id, user_name)) = identity_from(&headers) else {
        return Json(ApiResponse::err("x-user-id header required"));
    };

    match state
        .agent
        .chat(request.session_id.as_deref(), &user_id, &user_name, &request.message)
        .await
    {
        Ok(result) => {
            if result.response.safety_alert.level >= AlertLevel::Warning {
                tracing::warn!(
                    "Safety alert for user {}: {:?}",
                    user_id,
                    result.response.safety_alert
                );
            }
            Json(ApiResponse::ok("Response generated successfully", result))
        }
        Err(e) => {
            tracing::error!("Chat failed for user {}: {}", user_id, e);
            Json(ApiResponse::err(
                "Unable to process request. Please try again or contact support.",
            ))
        }
    }
}

async fn chat_stream(
    State(state): State<ServerState>,
    headers: HeaderMap,
    Json(request): Json<ChatRequest>,
) -> Response {
    let Some((user_id, user_name)) = identity_from(&headers) else {
        return Json(ApiResponse::<()>::err("x-user-id header required")).into_response();
    };

    match state
        .agent
        .clone()
        .chat_stream(request.session_id.as_deref(), &user_id, &user_name, &request.message)
        .await
    {
        Ok((session_id, rx)) => {
            let stream = rx.into_stream().map(Ok::<_, Infallible>);
            (
                [
                    (header::CONTENT_TYPE, "text/plain; charset=utf-8".to_string()),
                    (
                        header::HeaderName::from_static("x-session-id"),
                        session_id,
                    ),
                ],
                Body::from_stream(stream),
            )
                .into_response()
        }
        Err(e) => {
            tracing::error!("Streaming chat failed for user {}: {}", user_id, e);
            (
                [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
                "I apologize, but I'm having trouble processing your request right now. \
                 Please try again or reach out to support.",
            )
                .into_response()
        }
    }
}

async fn open_session(
    State(state): State<ServerState>,
    headers: HeaderMap,
) -> Json<ApiResponse<SessionOpened>> {
    let Some((user_id, user_name)) = identity_from(&headers) else {
        return Json(ApiResponse::err("x-user-id header required"));
    };

    match state.agent.open_session(&user_id, &user_name) {
        Ok(session_id) => Json(ApiResponse::ok("Session created", SessionOpened { session_id })),
        Err(e) => {
            tracing::error!("Session open failed for user {}: {}", user_id, e);
            Json(ApiResponse::err("Unable to create session"))
        }
    }
}

async fn list_sessions(
    State(state): State<ServerState>,
    headers: HeaderMap,
) -> Json<ApiResponse<Vec<SessionRecord>>> {
    let Some((user_id, _)) = identity_from(&headers) else {
        return Json(ApiResponse::err("x-user-id header required"));
    };

    match state.agent.get_user_sessions(&user_id) {
        Ok(sessions) => Json(ApiResponse::ok("Sessions listed", sessions)),
        Err(e) => {
            tracing::error!("Session list failed for user {}: {}", user_id, e);
            Json(ApiResponse::err("Unable to list sessions"))
        }
    }
}

async fn session_history(
    State(state): State<ServerState>,
    Path(session_id): Path<String>,
    Query(query): Query<HistoryQuery>,
) -> Result<Json<ApiResponse<HistoryPage>>, (StatusCode, Json<ApiResponse<HistoryPage>>)> {
    match state.agent.get_history(&session_id, query.page, query.per_page) {
        Ok(page) => Ok(Json(ApiResponse::ok("History loaded", page))),
        Err(TurnError::UnknownSession(id)) => Err((
            StatusCode::NOT_FOUND,
            Json(ApiResponse::err(format!("Unknown session: {}", id))),
        )),
        Err(e) => {
            tracing::error!("History load failed for {}: {}", session_id, e);
            Err((
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(ApiResponse::err("Unable to load history")),
            ))
        }
    }
}
