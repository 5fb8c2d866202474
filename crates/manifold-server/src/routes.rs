//! HTTP handlers for the OpenAI-compatible surface

use axum::extract::rejection::JsonRejection;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::{Json, Router, routing};
use manifold_dispatch::{DispatchError, Dispatcher};
use manifold_translate::{ChatMessage, ChatParams, ChatRequest};
use serde::Deserialize;

/// Wire form of `POST /v1/chat/completions`
///
/// Unknown fields are accepted and ignored so standard OpenAI clients
/// keep working. `stream` is parsed but has no effect: upstream
/// responses are collected before returning.
#[derive(Debug, Deserialize)]
pub struct WireChatRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,
    #[serde(default)]
    pub temperature: Option<f64>,
    #[serde(default)]
    pub top_p: Option<f64>,
    #[serde(default)]
    pub stop: Option<serde_json::Value>,
    #[serde(default)]
    pub max_tokens: Option<u32>,
    #[serde(default)]
    pub max_completion_tokens: Option<u32>,
    #[serde(default)]
    pub tools: Option<serde_json::Value>,
    #[serde(default)]
    pub tool_choice: Option<serde_json::Value>,
    #[serde(default)]
    pub stream: Option<bool>,
}

impl WireChatRequest {
    fn into_parts(self) -> (String, ChatRequest) {
        let params = ChatParams {
            temperature: self.temperature,
            top_p: self.top_p,
            stop: self.stop,
            max_tokens: self.max_tokens,
            max_completion_tokens: self.max_completion_tokens,
            tools: self.tools,
            tool_choice: self.tool_choice,
        };
        (
            self.model,
            ChatRequest {
                messages: self.messages,
                params,
            },
        )
    }
}

/// Build the API router
pub fn api_router(dispatcher: Dispatcher) -> Router {
    Router::new()
        .route("/v1/chat/completions", routing::post(chat_completions))
        .route("/v1/models", routing::get(list_models))
        .route("/v1/providers/stats", routing::get(provider_stats))
        .route("/health", routing::get(health))
        .with_state(dispatcher)
}

/// Handle `POST /v1/chat/completions`
async fn chat_completions(
    State(dispatcher): State<Dispatcher>,
    body: Result<Json<WireChatRequest>, JsonRejection>,
) -> Response {
    // Any malformed body is a 400, including type mismatches that axum
    // would otherwise report as 422
    let Json(wire) = match body {
        Ok(json) => json,
        Err(rejection) => {
            let body = serde_json::json!({
                "error": {"message": rejection.body_text(), "type": "invalid_request_error"}
            });
            return (StatusCode::BAD_REQUEST, Json(body)).into_response();
        }
    };
    let (model, request) = wire.into_parts();

    // The dispatch runs in its own task: a client disconnect drops this
    // handler future, but post-flight accounting still commits
    let handle = tokio::spawn(async move { dispatcher.dispatch(&model, &request).await });

    match handle.await {
        Ok(Ok(body)) => Json(body).into_response(),
        Ok(Err(error)) => dispatch_error_response(&error),
        Err(join_error) => {
            tracing::error!(error = %join_error, "dispatch task failed");
            let body = serde_json::json!({
                "error": {"message": "internal error", "type": "internal_error"}
            });
            (StatusCode::INTERNAL_SERVER_ERROR, Json(body)).into_response()
        }
    }
}

/// Handle `GET /v1/models`
async fn list_models(State(dispatcher): State<Dispatcher>) -> Response {
    let data = dispatcher.registry().model_cards();
    Json(serde_json::json!({
        "object": "list",
        "data": data,
    }))
    .into_response()
}

/// Handle `GET /v1/providers/stats`
async fn provider_stats(State(dispatcher): State<Dispatcher>) -> Response {
    Json(dispatcher.registry().stats()).into_response()
}

/// Handle `GET /health`
async fn health() -> Response {
    Json(serde_json::json!({"status": "ok"})).into_response()
}

/// Map a dispatch error to an OpenAI-style JSON error response
fn dispatch_error_response(error: &DispatchError) -> Response {
    let status = error.status_code();
    let body = serde_json::json!({
        "error": {
            "message": error.to_string(),
            "type": error.error_type(),
        }
    });
    (status, Json(body)).into_response()
}
