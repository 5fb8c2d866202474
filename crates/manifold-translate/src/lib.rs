//! Translator capability: per-vendor request/response adaptation
//!
//! A [`Translator`] formats a canonical chat request for one upstream
//! vendor, performs the authenticated HTTP call, and normalizes the raw
//! response back to the OpenAI-compatible shape the gateway returns.
//! Concrete translators are registered in a name-keyed
//! [`TranslatorRegistry`] at startup and constructed once per provider.

#![allow(clippy::must_use_candidate, clippy::missing_errors_doc)]

pub mod openai;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use manifold_config::ProviderConfig;
use secrecy::SecretString;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// A chat message forwarded verbatim
///
/// `content` stays a raw JSON value: upstreams accept both plain strings
/// and structured content parts, and the gateway does not inspect either.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: serde_json::Value,
}

/// Generation parameters forwarded to the upstream when present
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChatParams {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stop: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_completion_tokens: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tools: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_choice: Option<serde_json::Value>,
}

/// The canonical request the dispatch engine hands to an instance
#[derive(Debug, Clone)]
pub struct ChatRequest {
    pub messages: Vec<ChatMessage>,
    pub params: ChatParams,
}

/// Token usage reported by an upstream, zero-defaulted when absent
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct Usage {
    #[serde(default)]
    pub prompt_tokens: u64,
    #[serde(default)]
    pub completion_tokens: u64,
    #[serde(default)]
    pub total_tokens: u64,
}

impl Usage {
    /// Parse the `usage` object out of a raw upstream response
    pub fn from_raw(raw: &serde_json::Value) -> Self {
        let mut usage: Self = raw
            .get("usage")
            .and_then(|u| serde_json::from_value(u.clone()).ok())
            .unwrap_or_default();
        if usage.total_tokens == 0 {
            usage.total_tokens = usage.prompt_tokens + usage.completion_tokens;
        }
        usage
    }
}

/// A vendor-formatted request ready to send
#[derive(Debug, Clone)]
pub struct TranslatedRequest {
    pub body: serde_json::Value,
    pub upstream_model: String,
}

/// A normalized response plus the usage extracted from it
#[derive(Debug, Clone)]
pub struct NormalizedResponse {
    pub body: serde_json::Value,
    pub usage: Usage,
}

/// Errors crossing the translator seam
#[derive(Debug, Error)]
pub enum TranslateError {
    /// The adapter could not format the request
    #[error("failed to format request: {0}")]
    Request(String),
    /// The upstream returned a non-success status
    #[error("upstream returned {status}: {body}")]
    UpstreamStatus { status: u16, body: String },
    /// The HTTP call itself failed (timeout, connection reset, DNS)
    #[error("upstream request failed: {0}")]
    Transport(String),
    /// The upstream body could not be normalized
    #[error("malformed upstream response: {0}")]
    Response(String),
}

/// Per-vendor adapter: format, call, normalize
#[async_trait]
pub trait Translator: Send + Sync {
    /// Format a canonical request for this vendor
    fn translate_request(
        &self,
        messages: &[ChatMessage],
        upstream_model: &str,
        params: &ChatParams,
    ) -> Result<TranslatedRequest, TranslateError>;

    /// Perform the authenticated HTTP call with the given credential
    async fn execute(
        &self,
        request: &TranslatedRequest,
        api_key: &SecretString,
    ) -> Result<serde_json::Value, TranslateError>;

    /// Normalize a raw upstream response to the canonical shape,
    /// rewriting `model` to the public id and injecting `provider`
    fn normalize(
        &self,
        raw: serde_json::Value,
        public_model: &str,
        instance_name: &str,
    ) -> Result<NormalizedResponse, TranslateError>;
}

/// Constructor for a translator bound to one provider's endpoint
pub type TranslatorFactory =
    fn(provider_name: &str, config: &ProviderConfig) -> Result<Arc<dyn Translator>, TranslateError>;

/// Name-keyed map of translator factories supplied by the host program
#[derive(Default)]
pub struct TranslatorRegistry {
    factories: HashMap<String, TranslatorFactory>,
}

impl TranslatorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the built-in adapters registered
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register("openai", openai::OpenAiTranslator::factory);
        registry
    }

    /// Register a factory under a `type` name
    pub fn register(&mut self, name: impl Into<String>, factory: TranslatorFactory) {
        self.factories.insert(name.into(), factory);
    }

    /// Construct a translator for a provider from its configuration
    ///
    /// # Errors
    ///
    /// Returns `TranslateError::Request` if the provider's `type` names no
    /// registered factory, or whatever the factory itself reports.
    pub fn build(&self, provider_name: &str, config: &ProviderConfig) -> Result<Arc<dyn Translator>, TranslateError> {
        let factory = self
            .factories
            .get(&config.provider_type)
            .ok_or_else(|| TranslateError::Request(format!("unknown provider type: {}", config.provider_type)))?;
        factory(provider_name, config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn usage_defaults_absent_fields_to_zero() {
        let raw = serde_json::json!({"usage": {"prompt_tokens": 7}});
        let usage = Usage::from_raw(&raw);
        assert_eq!(usage.prompt_tokens, 7);
        assert_eq!(usage.completion_tokens, 0);
        assert_eq!(usage.total_tokens, 7);
    }

    #[test]
    fn usage_missing_object_is_zero() {
        let usage = Usage::from_raw(&serde_json::json!({}));
        assert_eq!(usage.prompt_tokens, 0);
        assert_eq!(usage.completion_tokens, 0);
        assert_eq!(usage.total_tokens, 0);
    }

    #[test]
    fn usage_total_preserved_when_reported() {
        let raw = serde_json::json!({"usage": {"prompt_tokens": 3, "completion_tokens": 4, "total_tokens": 9}});
        let usage = Usage::from_raw(&raw);
        assert_eq!(usage.total_tokens, 9);
    }

    #[test]
    fn registry_rejects_unknown_type() {
        let registry = TranslatorRegistry::with_defaults();
        let yaml = r#"
providers:
  upstream:
    type: teletype
    base_url: "https://api.example.com/v1"
    api_key: "sk-test"
models:
  m:
    providers:
      upstream: {}
"#;
        let config = manifold_config::Config::parse(yaml).unwrap();
        let err = registry.build("upstream", &config.providers["upstream"]).err().unwrap();
        assert!(err.to_string().contains("teletype"));
    }
}
