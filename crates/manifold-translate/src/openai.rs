//! OpenAI-compatible adapter
//!
//! Works against the OpenAI API and the many services that mirror it.
//! The request is the canonical shape plus the upstream model id; the
//! response is re-stamped with a fresh id, the public model id, and the
//! serving instance name.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use manifold_config::ProviderConfig;
use reqwest::Client;
use secrecy::{ExposeSecret, SecretString};
use url::Url;

use crate::{
    ChatMessage, ChatParams, NormalizedResponse, TranslateError, TranslatedRequest, Translator, Usage,
};

/// Default path appended to the provider base URL
const DEFAULT_COMPLETIONS_PATH: &str = "/chat/completions";

/// OpenAI-compatible translator bound to one provider endpoint
pub struct OpenAiTranslator {
    provider: String,
    client: Client,
    base_url: Url,
    completions_path: String,
}

impl OpenAiTranslator {
    /// Factory registered under the `openai` type name
    pub fn factory(provider_name: &str, config: &ProviderConfig) -> Result<Arc<dyn Translator>, TranslateError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout))
            .build()
            .map_err(|e| TranslateError::Request(format!("failed to build HTTP client: {e}")))?;

        let completions_path = config
            .chat_completions_path
            .clone()
            .unwrap_or_else(|| DEFAULT_COMPLETIONS_PATH.to_owned());

        Ok(Arc::new(Self {
            provider: provider_name.to_owned(),
            client,
            base_url: config.base_url.clone(),
            completions_path,
        }))
    }

    fn completions_url(&self) -> String {
        let base = self.base_url.as_str().trim_end_matches('/');
        let path = self.completions_path.trim_start_matches('/');
        format!("{base}/{path}")
    }
}

#[async_trait]
impl Translator for OpenAiTranslator {
    fn translate_request(
        &self,
        messages: &[ChatMessage],
        upstream_model: &str,
        params: &ChatParams,
    ) -> Result<TranslatedRequest, TranslateError> {
        let mut body = serde_json::json!({
            "model": upstream_model,
            "messages": messages,
        });

        // Optional parameters pass through only when set
        let extra = serde_json::to_value(params)
            .map_err(|e| TranslateError::Request(format!("failed to serialize parameters: {e}")))?;
        if let (Some(body_map), Some(extra_map)) = (body.as_object_mut(), extra.as_object()) {
            for (key, value) in extra_map {
                body_map.insert(key.clone(), value.clone());
            }
        }

        Ok(TranslatedRequest {
            body,
            upstream_model: upstream_model.to_owned(),
        })
    }

    async fn execute(
        &self,
        request: &TranslatedRequest,
        api_key: &SecretString,
    ) -> Result<serde_json::Value, TranslateError> {
        let response = self
            .client
            .post(self.completions_url())
            .bearer_auth(api_key.expose_secret())
            .json(&request.body)
            .send()
            .await
            .map_err(|e| {
                tracing::warn!(provider = %self.provider, error = %e, "upstream request failed");
                if e.is_timeout() {
                    TranslateError::Transport(format!("request timed out: {e}"))
                } else {
                    TranslateError::Transport(e.to_string())
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            tracing::warn!(
                provider = %self.provider,
                status = %status,
                "upstream returned error"
            );
            return Err(TranslateError::UpstreamStatus {
                status: status.as_u16(),
                body,
            });
        }

        response
            .json()
            .await
            .map_err(|e| TranslateError::Response(format!("failed to parse response body: {e}")))
    }

    fn normalize(
        &self,
        raw: serde_json::Value,
        public_model: &str,
        instance_name: &str,
    ) -> Result<NormalizedResponse, TranslateError> {
        if !raw.is_object() {
            return Err(TranslateError::Response("expected a JSON object".to_owned()));
        }

        let usage = Usage::from_raw(&raw);
        let choices = raw.get("choices").cloned().unwrap_or_else(|| serde_json::json!([]));

        let body = serde_json::json!({
            "id": format!("chatcmpl-{}", uuid::Uuid::new_v4()),
            "object": "chat.completion",
            "created": Utc::now().timestamp(),
            "model": public_model,
            "choices": choices,
            "usage": {
                "prompt_tokens": usage.prompt_tokens,
                "completion_tokens": usage.completion_tokens,
                "total_tokens": usage.total_tokens,
            },
            "provider": instance_name,
        });

        Ok(NormalizedResponse { body, usage })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn translator() -> OpenAiTranslator {
        OpenAiTranslator {
            provider: "upstream".to_owned(),
            client: Client::new(),
            base_url: Url::parse("https://api.example.com/v1").unwrap(),
            completions_path: DEFAULT_COMPLETIONS_PATH.to_owned(),
        }
    }

    fn messages() -> Vec<ChatMessage> {
        vec![ChatMessage {
            role: "user".to_owned(),
            content: serde_json::json!("Hello"),
        }]
    }

    #[test]
    fn completions_url_joins_without_double_slash() {
        assert_eq!(
            translator().completions_url(),
            "https://api.example.com/v1/chat/completions"
        );
    }

    #[test]
    fn request_includes_only_set_parameters() {
        let params = ChatParams {
            temperature: Some(0.7),
            max_tokens: Some(128),
            ..ChatParams::default()
        };
        let translated = translator().translate_request(&messages(), "gpt-up", &params).unwrap();

        assert_eq!(translated.body["model"], "gpt-up");
        assert_eq!(translated.body["temperature"], 0.7);
        assert_eq!(translated.body["max_tokens"], 128);
        assert!(translated.body.get("top_p").is_none());
        assert!(translated.body.get("stop").is_none());
    }

    #[test]
    fn normalize_rewrites_model_and_injects_provider() {
        let raw = serde_json::json!({
            "id": "upstream-id",
            "model": "gpt-up",
            "choices": [{"index": 0, "message": {"role": "assistant", "content": "hi"}, "finish_reason": "stop"}],
            "usage": {"prompt_tokens": 5, "completion_tokens": 7}
        });
        let normalized = translator().normalize(raw, "gpt-public", "upstream").unwrap();

        assert_eq!(normalized.body["model"], "gpt-public");
        assert_eq!(normalized.body["provider"], "upstream");
        assert_eq!(normalized.body["usage"]["total_tokens"], 12);
        assert_eq!(normalized.body["choices"][0]["finish_reason"], "stop");
        assert!(
            normalized.body["id"]
                .as_str()
                .is_some_and(|id| id.starts_with("chatcmpl-"))
        );
        assert_eq!(normalized.usage.prompt_tokens, 5);
        assert_eq!(normalized.usage.completion_tokens, 7);
    }

    #[test]
    fn normalize_rejects_non_object() {
        let err = translator()
            .normalize(serde_json::json!("nope"), "m", "p")
            .unwrap_err();
        assert!(matches!(err, TranslateError::Response(_)));
    }
}
