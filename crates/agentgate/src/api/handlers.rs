//! HTTP handlers.

use std::convert::Infallible;

use axum::{
    Json,
    extract::{State, rejection::JsonRejection},
    response::{
        IntoResponse, Response,
        sse::{Event, KeepAlive, Sse},
    },
};
use futures::{Stream, StreamExt, stream};
use serde::Serialize;
use tracing::debug;

use super::error::{ApiError, ApiResult};
use super::state::AppState;
use crate::models::model_list;
use crate::openai::{ChatCompletionChunk, ChatCompletionRequest, ModelList, SSE_DONE};

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
}

/// Liveness check. Never authenticated.
pub async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

pub async fn list_models() -> Json<ModelList> {
    Json(model_list())
}

/// `POST /v1/chat/completions`.
pub async fn chat_completions(
    State(state): State<AppState>,
    body: Result<Json<ChatCompletionRequest>, JsonRejection>,
) -> ApiResult<Response> {
    let Json(request) = body.map_err(|rejection| ApiError::bad_request(rejection.body_text()))?;
    if request.messages.is_empty() {
        return Err(ApiError::bad_request("messages must not be empty"));
    }

    let streaming = request.is_stream();
    let model = request.model.as_deref();
    debug!(messages = request.messages.len(), stream = streaming, "Chat completion request");

    if streaming {
        let chunks = state.chat.stream(model, request.messages).await?;
        Ok(sse_response(chunks).into_response())
    } else {
        let response = state.chat.complete(model, request.messages).await?;
        Ok(Json(response).into_response())
    }
}

/// Unknown routes.
pub async fn not_found() -> ApiError {
    ApiError::not_found("unknown endpoint")
}

/// Render chunks as SSE `data:` frames followed by the `[DONE]` sentinel.
fn sse_response<S>(chunks: S) -> Sse<impl Stream<Item = Result<Event, Infallible>>>
where
    S: Stream<Item = ChatCompletionChunk> + Send + 'static,
{
    let frames = chunks
        .filter_map(|chunk| async move {
            match serde_json::to_string(&chunk) {
                Ok(data) => Some(data),
                Err(e) => {
                    tracing::warn!(error = %e, "Dropping unserializable chunk");
                    None
                }
            }
        })
        .chain(stream::once(async { SSE_DONE.to_string() }))
        .map(|data| Ok(Event::default().data(data)));

    Sse::new(frames).keep_alive(KeepAlive::default())
}
