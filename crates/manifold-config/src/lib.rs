//! Configuration tree for the Manifold gateway
//!
//! The root [`Config`] maps provider and model sections from YAML onto
//! validated structs. Environment placeholders are expanded before
//! deserialization, and per-binding budget specs are derived at load time
//! so the request path never chases config references.

#![allow(clippy::must_use_candidate, clippy::missing_errors_doc)]

pub mod budget;
mod env;
mod loader;

use indexmap::IndexMap;
use secrecy::SecretString;
use serde::Deserialize;
use url::Url;

pub use budget::{
    BudgetError, BudgetSpec, CreditAccrual, CreditPricing, EffectiveBudget, Metric, Multipliers, Window,
};
pub use env::expand_env;

/// Root configuration: upstream providers and the public models they serve
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Upstream provider endpoints keyed by name
    pub providers: IndexMap<String, ProviderConfig>,
    /// Public models keyed by the id clients send
    pub models: IndexMap<String, ModelConfig>,
}

/// One upstream endpoint with its credential pool and default budgets
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ProviderConfig {
    /// Translator type handling this endpoint (e.g. "openai")
    #[serde(rename = "type")]
    pub provider_type: String,
    /// Base URL of the upstream API
    pub base_url: Url,
    /// Single credential (alternative to `api_keys`)
    #[serde(default)]
    pub api_key: Option<SecretString>,
    /// Credential pool, rotated round-robin
    #[serde(default)]
    pub api_keys: Vec<SecretString>,
    /// Request timeout in seconds
    #[serde(default = "default_timeout")]
    pub timeout: u64,
    /// Path appended to `base_url` for chat completions
    ///
    /// Some OpenAI-compatible hosts serve `/chat` instead of
    /// `/chat/completions`.
    #[serde(default)]
    pub chat_completions_path: Option<String>,
    /// Default per-key budget limits, `<metric>_per_<window>` keys
    #[serde(default)]
    pub rate_limits: IndexMap<String, f64>,
    #[serde(default)]
    pub credits_gain_per_minute: Option<f64>,
    #[serde(default)]
    pub credits_gain_per_hour: Option<f64>,
    #[serde(default)]
    pub credits_gain_per_day: Option<f64>,
    #[serde(default)]
    pub credits_gain_per_month: Option<f64>,
    #[serde(default)]
    pub credits_max_per_minute: Option<f64>,
    #[serde(default)]
    pub credits_max_per_hour: Option<f64>,
    #[serde(default)]
    pub credits_max_per_day: Option<f64>,
    #[serde(default)]
    pub credits_max_per_month: Option<f64>,
}

impl ProviderConfig {
    /// The effective credential list: `api_keys` if present, else `api_key`
    pub fn keys(&self) -> Vec<SecretString> {
        if self.api_keys.is_empty() {
            self.api_key.iter().cloned().collect()
        } else {
            self.api_keys.clone()
        }
    }

    /// Credit accrual windows configured on this provider
    pub fn credit_accrual(&self) -> CreditAccrual {
        let mut accrual = CreditAccrual::default();
        let gains = [
            (Window::Minute, self.credits_gain_per_minute, self.credits_max_per_minute),
            (Window::Hour, self.credits_gain_per_hour, self.credits_max_per_hour),
            (Window::Day, self.credits_gain_per_day, self.credits_max_per_day),
            (Window::Month, self.credits_gain_per_month, self.credits_max_per_month),
        ];
        for (window, gain, max) in gains {
            if let Some(gain) = gain {
                // max_balance defaults to the per-period gain
                accrual.set(window, gain, max.unwrap_or(gain));
            }
        }
        accrual
    }
}

/// A public model and the provider bindings that can serve it
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ModelConfig {
    /// Creation timestamp reported by `/v1/models`
    #[serde(default = "default_created")]
    pub created: u64,
    /// Owner reported by `/v1/models`
    #[serde(default = "default_owned_by")]
    pub owned_by: String,
    /// Provider bindings keyed by provider name
    pub providers: IndexMap<String, BindingConfig>,
}

/// Upstream model id: a single id or an ordered list rotated per request
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum ModelIdSpec {
    Single(String),
    Multiple(Vec<String>),
}

impl ModelIdSpec {
    /// Flatten to the ordered id list
    pub fn ids(&self) -> Vec<String> {
        match self {
            Self::Single(id) => vec![id.clone()],
            Self::Multiple(ids) => ids.clone(),
        }
    }
}

/// A (model, provider) binding: upstream ids, budgets, pricing, retries
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BindingConfig {
    /// Upstream model id(s); defaults to the public model id
    #[serde(default)]
    pub model_id: Option<ModelIdSpec>,
    /// Selection priority, lower is preferred
    #[serde(default)]
    pub priority: u32,
    /// Credential override (alternative to `api_keys`)
    #[serde(default)]
    pub api_key: Option<SecretString>,
    /// Credential pool override
    #[serde(default)]
    pub api_keys: Vec<SecretString>,
    /// Budget limit overrides, replacing matching provider defaults
    #[serde(default)]
    pub rate_limits: IndexMap<String, f64>,
    /// General multiplier: one real unit consumes this many budget units
    #[serde(default = "default_multiplier")]
    pub multiplier: f64,
    /// Token-specific multiplier, composed with `multiplier`
    #[serde(default = "default_multiplier")]
    pub token_multiplier: f64,
    /// Request-specific multiplier, composed with `multiplier`
    #[serde(default = "default_multiplier")]
    pub request_multiplier: f64,
    /// Credit price per token (prompt and completion)
    #[serde(default)]
    pub credits_per_token: f64,
    /// Credit price per million total tokens
    #[serde(default)]
    pub credits_per_million_tokens: f64,
    /// Flat credit price per request
    #[serde(default)]
    pub credits_per_request: f64,
    /// Key attempts per request on this binding
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
}

impl BindingConfig {
    /// Credential override list, or empty when the provider pool applies
    pub fn key_override(&self) -> Vec<SecretString> {
        if self.api_keys.is_empty() {
            self.api_key.iter().cloned().collect()
        } else {
            self.api_keys.clone()
        }
    }

    /// Multipliers configured on this binding
    pub fn multipliers(&self) -> Multipliers {
        Multipliers {
            general: self.multiplier,
            token: self.token_multiplier,
            request: self.request_multiplier,
        }
    }

    /// Credit pricing configured on this binding
    pub fn credit_pricing(&self) -> CreditPricing {
        CreditPricing {
            per_token: self.credits_per_token,
            per_million_tokens: self.credits_per_million_tokens,
            per_request: self.credits_per_request,
        }
    }
}

const fn default_timeout() -> u64 {
    60
}

const fn default_created() -> u64 {
    1_234_567_890
}

fn default_owned_by() -> String {
    "system".to_owned()
}

const fn default_multiplier() -> f64 {
    1.0
}

const fn default_max_retries() -> u32 {
    3
}
