//! Mock OpenAI-compatible upstream for end-to-end tests
//!
//! Returns canned responses with fixed usage numbers. Failures can be
//! scripted per bearer token (`fail_for_key`) or for the first N
//! requests overall (`fail_first`). Request counts are tracked per key
//! so tests can assert exactly which credentials were used.

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::{Json, Router, routing};
use serde::Deserialize;
use tokio_util::sync::CancellationToken;

/// Mock upstream that returns predictable responses
pub struct MockUpstream {
    addr: SocketAddr,
    shutdown: CancellationToken,
    state: Arc<MockState>,
}

struct MockState {
    completion_count: AtomicU32,
    fail_first: AtomicU32,
    fail_keys: HashSet<String>,
    per_key: Mutex<HashMap<String, u32>>,
    response_content: String,
}

/// Builder for scripted mock behavior
#[derive(Default)]
pub struct MockBuilder {
    fail_first: u32,
    fail_keys: HashSet<String>,
    response_content: Option<String>,
}

impl MockBuilder {
    /// Fail the first `n` requests with a 500 before succeeding
    #[allow(dead_code)]
    pub fn fail_first(mut self, n: u32) -> Self {
        self.fail_first = n;
        self
    }

    /// Always fail requests authenticated with `key`
    pub fn fail_for_key(mut self, key: &str) -> Self {
        self.fail_keys.insert(key.to_owned());
        self
    }

    /// Use a custom assistant reply
    pub fn response(mut self, content: &str) -> Self {
        self.response_content = Some(content.to_owned());
        self
    }

    pub async fn start(self) -> anyhow::Result<MockUpstream> {
        let state = Arc::new(MockState {
            completion_count: AtomicU32::new(0),
            fail_first: AtomicU32::new(self.fail_first),
            fail_keys: self.fail_keys,
            per_key: Mutex::new(HashMap::new()),
            response_content: self
                .response_content
                .unwrap_or_else(|| "Hello from mock upstream".to_owned()),
        });

        let app = Router::new()
            .route("/v1/chat/completions", routing::post(handle_chat_completions))
            .with_state(Arc::clone(&state));

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let shutdown = CancellationToken::new();
        let shutdown_clone = shutdown.clone();

        tokio::spawn(async move {
            axum::serve(listener, app)
                .with_graceful_shutdown(async move {
                    shutdown_clone.cancelled().await;
                })
                .await
                .ok();
        });

        Ok(MockUpstream { addr, shutdown, state })
    }
}

impl MockUpstream {
    /// Start a mock that always succeeds
    pub async fn start() -> anyhow::Result<Self> {
        MockBuilder::default().start().await
    }

    pub fn builder() -> MockBuilder {
        MockBuilder::default()
    }

    /// Base URL for configuring the mock as a provider
    ///
    /// Includes `/v1` since the openai translator appends
    /// `/chat/completions`.
    pub fn base_url(&self) -> String {
        format!("http://{}/v1", self.addr)
    }

    /// Number of completion requests received
    pub fn completion_count(&self) -> u32 {
        self.state.completion_count.load(Ordering::SeqCst)
    }

    /// Number of completion requests authenticated with `key`
    pub fn count_for_key(&self, key: &str) -> u32 {
        self.state.per_key.lock().unwrap().get(key).copied().unwrap_or(0)
    }
}

impl Drop for MockUpstream {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

#[derive(Debug, Deserialize)]
struct ChatCompletionRequest {
    model: String,
    #[allow(dead_code)]
    messages: Vec<serde_json::Value>,
}

async fn handle_chat_completions(
    State(state): State<Arc<MockState>>,
    headers: HeaderMap,
    Json(request): Json<ChatCompletionRequest>,
) -> impl IntoResponse {
    state.completion_count.fetch_add(1, Ordering::SeqCst);

    let bearer = headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .unwrap_or_default()
        .to_owned();
    *state.per_key.lock().unwrap().entry(bearer.clone()).or_default() += 1;

    let scripted_failure = state.fail_keys.contains(&bearer)
        || state
            .fail_first
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();

    if scripted_failure {
        let body = serde_json::json!({
            "error": {"message": "mock upstream unavailable", "type": "server_error"}
        });
        return (StatusCode::INTERNAL_SERVER_ERROR, Json(body));
    }

    let body = serde_json::json!({
        "id": "chatcmpl-mock",
        "object": "chat.completion",
        "created": 1_700_000_000,
        "model": request.model,
        "choices": [{
            "index": 0,
            "message": {"role": "assistant", "content": state.response_content},
            "finish_reason": "stop"
        }],
        "usage": {"prompt_tokens": 9, "completion_tokens": 12, "total_tokens": 21}
    });
    (StatusCode::OK, Json(body))
}
