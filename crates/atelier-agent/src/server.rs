//! Thin HTTP surface over the core services.
//!
//! Routing is deliberately minimal: every handler parses the request,
//! calls one service method, and wraps the result in the response
//! envelope. Validation errors map to 400, everything else to 500.

use std::convert::Infallible;
use std::sync::Arc;

use axum::Router;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::sse::{Event, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post, put};
use futures_util::{Stream, StreamExt};
use serde::Deserialize;
use serde_json::Value;
use tower_http::cors::CorsLayer;

use crate::api::envelope::Envelope;
use crate::api::chat_service::ChatService;
use crate::container::AppContainer;
use crate::error::AgentError;
use crate::sse::frames_with_heartbeat;

#[derive(Clone)]
pub struct AppState {
    pub container: Arc<AppContainer>,
}

fn respond<T: serde::Serialize>(result: Result<T, AgentError>) -> Response {
    match result {
        Ok(data) => (StatusCode::OK, axum::Json(Envelope::ok(data))).into_response(),
        Err(err) if matches!(err, AgentError::Cancelled) => (
            StatusCode::OK,
            axum::Json(Envelope::<Value>::ok(Value::Null)),
        )
            .into_response(),
        Err(err) => {
            let status = if err.is_validation() {
                StatusCode::BAD_REQUEST
            } else {
                log::error!("unhandled error in chat route: {}", err);
                StatusCode::INTERNAL_SERVER_ERROR
            };
            (status, axum::Json(Envelope::<Value>::err(err.to_string()))).into_response()
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SendMessageRequest {
    content: String,
    #[serde(default)]
    mode: Option<String>,
    #[serde(default)]
    active_plan_id: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct EditMessageRequest {
    content: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ApproveRequest {
    tool_call_id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RejectRequest {
    tool_call_id: String,
    #[serde(default)]
    reason: Option<String>,
}

pub fn router(container: Arc<AppContainer>) -> Router {
    let state = AppState { container };
    Router::new()
        .route("/api/chat/{id}/history", get(get_history))
        .route("/api/chat/{id}/messages", post(send_message))
        .route("/api/chat/{id}/continue", post(continue_agent))
        .route("/api/chat/{id}/messages/{mid}", put(edit_message))
        .route("/api/chat/{id}/cancel", post(cancel_agent))
        .route("/api/chat/{id}/approve", post(approve))
        .route("/api/chat/{id}/reject", post(reject))
        .route("/api/chat/{id}/revert/{cp_id}", post(revert_checkpoint))
        .route("/api/chat/{id}/revert-file/{fe_id}", post(revert_file))
        .route("/api/chat/{id}/summarize", post(summarize))
        .route("/api/chat/{id}/events", get(stream_events))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

async fn get_history(State(state): State<AppState>, Path(chat_id): Path<String>) -> Response {
    respond(ChatService::new(state.container).get_chat_history(&chat_id).await)
}

async fn send_message(
    State(state): State<AppState>,
    Path(chat_id): Path<String>,
    axum::Json(request): axum::Json<SendMessageRequest>,
) -> Response {
    respond(
        ChatService::new(state.container)
            .send_message(
                &chat_id,
                &request.content,
                request.mode.as_deref().unwrap_or("default"),
                request.active_plan_id,
            )
            .await,
    )
}

async fn continue_agent(State(state): State<AppState>, Path(chat_id): Path<String>) -> Response {
    respond(ChatService::new(state.container).continue_agent(&chat_id).await)
}

async fn edit_message(
    State(state): State<AppState>,
    Path((chat_id, message_id)): Path<(String, String)>,
    axum::Json(request): axum::Json<EditMessageRequest>,
) -> Response {
    respond(
        ChatService::new(state.container)
            .edit_message(&chat_id, &message_id, &request.content)
            .await,
    )
}

async fn cancel_agent(State(state): State<AppState>, Path(chat_id): Path<String>) -> Response {
    let result = ChatService::new(state.container)
        .cancel_agent(&chat_id)
        .await
        .map(|cancelled| serde_json::json!({"cancelled": cancelled}));
    respond(result)
}

async fn approve(
    State(state): State<AppState>,
    Path(chat_id): Path<String>,
    axum::Json(request): axum::Json<ApproveRequest>,
) -> Response {
    respond(
        ChatService::new(state.container)
            .approve(&chat_id, &request.tool_call_id)
            .await,
    )
}

async fn reject(
    State(state): State<AppState>,
    Path(chat_id): Path<String>,
    axum::Json(request): axum::Json<RejectRequest>,
) -> Response {
    let result = ChatService::new(state.container)
        .reject(&chat_id, &request.tool_call_id, request.reason.as_deref())
        .await
        .map(|tool_call| serde_json::json!({"toolCallId": tool_call.id, "status": "rejected"}));
    respond(result)
}

async fn revert_checkpoint(
    State(state): State<AppState>,
    Path((chat_id, checkpoint_id)): Path<(String, String)>,
) -> Response {
    respond(
        ChatService::new(state.container)
            .revert_to_checkpoint(&chat_id, &checkpoint_id)
            .await,
    )
}

async fn revert_file(
    State(state): State<AppState>,
    Path((chat_id, file_edit_id)): Path<(String, String)>,
) -> Response {
    respond(
        ChatService::new(state.container)
            .revert_file(&chat_id, &file_edit_id)
            .await,
    )
}

async fn summarize(State(state): State<AppState>, Path(chat_id): Path<String>) -> Response {
    respond(ChatService::new(state.container).summarize(&chat_id).await)
}

/// SSE stream of the chat's event bus with 1s heartbeats. The subscription
/// is dropped when the client disconnects; the next publish prunes it.
async fn stream_events(
    State(state): State<AppState>,
    Path(chat_id): Path<String>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let subscription = state.container.event_bus.subscribe(&chat_id);
    let frames = frames_with_heartbeat(chat_id, subscription.receiver);
    let stream = frames.map(|frame| {
        // Frames already carry the `data: ...\n\n` framing; strip it back
        // down for axum's Event, which re-frames.
        let payload = frame
            .trim_start_matches("data: ")
            .trim_end_matches('\n')
            .to_string();
        Ok(Event::default().data(payload))
    });
    Sse::new(stream)
}
