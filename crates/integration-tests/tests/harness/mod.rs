pub mod mock_llm;
pub mod server;

/// A minimal chat-completion request body
pub fn completion_body(model: &str) -> serde_json::Value {
    serde_json::json!({
        "model": model,
        "messages": [{"role": "user", "content": "Hello"}]
    })
}
