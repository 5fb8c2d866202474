//! Provider instance: one (model, endpoint, credential pool) binding
//!
//! The instance is the unit at which the breaker, backoff, and metrics
//! are scoped. `attempt` runs the full per-attempt sequence: breaker
//! permit, key selection with pre-flight reservation, translation,
//! upstream call, post-flight commit, and outcome recording.

use std::sync::atomic::{AtomicU32, AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::time::Duration;

use manifold_config::{CreditPricing, EffectiveBudget, Metric};
use manifold_translate::{ChatRequest, NormalizedResponse, TranslateError, Translator};
use serde::Serialize;
use std::sync::Arc;

use crate::backoff::ExponentialBackoff;
use crate::breaker::{BreakerState, CircuitBreaker};
use crate::clock::SharedClock;
use crate::metrics::{InstanceSnapshot, MetricsSlot};
use crate::rotator::{KeyRotator, KeyStatus};

/// Why an instance declined to attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// The circuit breaker rejected the attempt
    BreakerOpen,
    /// Every key is disabled or budget-denied
    NoKey,
}

impl SkipReason {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::BreakerOpen => "circuit breaker open",
            Self::NoKey => "no usable api key",
        }
    }
}

/// Result of a single attempt
#[derive(Debug)]
pub enum Outcome {
    Ok(NormalizedResponse),
    Skip(SkipReason),
    Fail(TranslateError),
}

/// Lock-free gauges read on the registry's ranking path
struct HealthGauges {
    breaker_state: AtomicU8,
    consecutive_failures: AtomicU32,
    avg_response_micros: AtomicU64,
}

const STATE_CLOSED: u8 = 0;
const STATE_OPEN: u8 = 1;
const STATE_HALF_OPEN: u8 = 2;

impl HealthGauges {
    fn new() -> Self {
        Self {
            breaker_state: AtomicU8::new(STATE_CLOSED),
            consecutive_failures: AtomicU32::new(0),
            avg_response_micros: AtomicU64::new(0),
        }
    }
}

/// Wire shape of per-instance stats
#[derive(Serialize)]
pub struct InstanceStats {
    pub enabled: bool,
    pub priority: u32,
    pub model_id: Vec<String>,
    pub consecutive_failures: u32,
    pub circuit_breaker: &'static str,
    pub health_score: f64,
    pub avg_response_time: f64,
    pub p95_response_time: f64,
    pub requests: u64,
    pub errors: u64,
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub credits_spent: f64,
    pub keys: Vec<KeyStatus>,
}

/// One provider binding serving one public model
pub struct ProviderInstance {
    name: String,
    public_model: String,
    priority: u32,
    max_retries: u32,
    translator: Arc<dyn Translator>,
    budget: EffectiveBudget,
    pricing: CreditPricing,
    rotator: KeyRotator,
    breaker: CircuitBreaker,
    backoff: ExponentialBackoff,
    upstream_models: Vec<String>,
    model_cursor: AtomicUsize,
    metrics: MetricsSlot,
    gauges: HealthGauges,
    clock: SharedClock,
}

impl ProviderInstance {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        name: String,
        public_model: String,
        priority: u32,
        max_retries: u32,
        translator: Arc<dyn Translator>,
        budget: EffectiveBudget,
        pricing: CreditPricing,
        rotator: KeyRotator,
        upstream_models: Vec<String>,
        clock: SharedClock,
    ) -> Self {
        Self {
            name,
            public_model,
            priority,
            max_retries,
            translator,
            budget,
            pricing,
            rotator,
            breaker: CircuitBreaker::new(Arc::clone(&clock)),
            backoff: ExponentialBackoff::default(),
            upstream_models,
            model_cursor: AtomicUsize::new(0),
            metrics: MetricsSlot::default(),
            gauges: HealthGauges::new(),
            clock,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn public_model(&self) -> &str {
        &self.public_model
    }

    pub const fn priority(&self) -> u32 {
        self.priority
    }

    pub const fn max_retries(&self) -> u32 {
        self.max_retries
    }

    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        self.backoff.delay(attempt)
    }

    /// Run one attempt against this instance
    pub async fn attempt(&self, request: &ChatRequest) -> Outcome {
        let Some(permit) = self.breaker.permit() else {
            self.refresh_gauges();
            return Outcome::Skip(SkipReason::BreakerOpen);
        };

        let Some(selected) = self.rotator.next(&self.budget, &self.pricing) else {
            drop(permit);
            return Outcome::Skip(SkipReason::NoKey);
        };

        // The upstream-model cursor advances exactly once per outcome,
        // so retries naturally cycle through the alias list
        let cursor = self.model_cursor.fetch_add(1, Ordering::Relaxed);
        let upstream_model = &self.upstream_models[cursor % self.upstream_models.len()];

        let translated = match self
            .translator
            .translate_request(&request.messages, upstream_model, &request.params)
        {
            Ok(translated) => translated,
            Err(e) => {
                self.record_failure(selected.index, &e);
                drop(permit);
                return Outcome::Fail(e);
            }
        };

        let started = self.clock.mono();
        let raw = match self.translator.execute(&translated, &selected.key).await {
            Ok(raw) => raw,
            Err(e) => {
                self.record_failure(selected.index, &e);
                drop(permit);
                return Outcome::Fail(e);
            }
        };

        let normalized = match self.translator.normalize(raw, &self.public_model, &self.name) {
            Ok(normalized) => normalized,
            Err(e) => {
                self.record_failure(selected.index, &e);
                drop(permit);
                return Outcome::Fail(e);
            }
        };
        let elapsed = self.clock.mono().saturating_sub(started);

        let usage = normalized.usage;
        let token_credits = selected.tracker.commit_completion(&self.budget, &self.pricing, &usage);
        let total_credits =
            token_credits + self.pricing.per_request * self.budget.multipliers.for_metric(Metric::Credits);

        self.rotator.record_success(selected.index);
        self.breaker.record_success();
        self.metrics
            .record_success(elapsed, usage.prompt_tokens, usage.completion_tokens, total_credits);
        self.refresh_gauges();
        drop(permit);

        tracing::debug!(
            provider = %self.name,
            model = %self.public_model,
            upstream_model = %upstream_model,
            elapsed_ms = elapsed.as_millis() as u64,
            prompt_tokens = usage.prompt_tokens,
            completion_tokens = usage.completion_tokens,
            "attempt succeeded"
        );

        Outcome::Ok(normalized)
    }

    fn record_failure(&self, key_index: usize, error: &TranslateError) {
        tracing::warn!(
            provider = %self.name,
            model = %self.public_model,
            error = %error,
            "attempt failed"
        );
        self.rotator.record_failure(key_index);
        self.breaker.record_failure();
        self.metrics.record_failure(self.clock.wall_secs());
        self.refresh_gauges();
    }

    fn refresh_gauges(&self) {
        let state = match self.breaker.state() {
            BreakerState::Closed => STATE_CLOSED,
            BreakerState::Open => STATE_OPEN,
            BreakerState::HalfOpen => STATE_HALF_OPEN,
        };
        self.gauges.breaker_state.store(state, Ordering::Relaxed);
        self.gauges
            .consecutive_failures
            .store(self.breaker.consecutive_failures(), Ordering::Relaxed);
        let avg_micros = (self.metrics.avg_response_seconds() * 1_000_000.0) as u64;
        self.gauges.avg_response_micros.store(avg_micros, Ordering::Relaxed);
    }

    /// Health score in [0, 100], computed from gauges without locking
    pub fn health_score(&self) -> f64 {
        let mut score = 100.0;

        match self.gauges.breaker_state.load(Ordering::Relaxed) {
            STATE_OPEN => score -= 100.0,
            STATE_HALF_OPEN => score -= 50.0,
            _ => {}
        }

        let failures = f64::from(self.gauges.consecutive_failures.load(Ordering::Relaxed));
        score -= (failures * 10.0).min(40.0);

        let avg_seconds = self.gauges.avg_response_micros.load(Ordering::Relaxed) as f64 / 1_000_000.0;
        score -= (avg_seconds * 10.0).min(30.0);

        let priority_factor = (1.0 - 0.10 * f64::from(self.priority)).max(0.0);
        score.max(0.0) * priority_factor
    }

    pub fn stats(&self) -> InstanceStats {
        let (prompt_tokens, completion_tokens) = self.metrics.token_totals();
        InstanceStats {
            enabled: self.breaker.state() != BreakerState::Open,
            priority: self.priority,
            model_id: self.upstream_models.clone(),
            consecutive_failures: self.breaker.consecutive_failures(),
            circuit_breaker: self.breaker.state().as_str(),
            health_score: self.health_score(),
            avg_response_time: self.metrics.avg_response_seconds(),
            p95_response_time: self.metrics.p95_response_seconds(),
            requests: self.metrics.request_count(),
            errors: self.metrics.error_count(),
            prompt_tokens,
            completion_tokens,
            credits_spent: self.metrics.credits_spent(),
            keys: self.rotator.status(&self.budget),
        }
    }

    /// Persistable metrics for the durable snapshot
    pub fn snapshot(&self) -> InstanceSnapshot {
        InstanceSnapshot {
            consecutive_failures: self.breaker.consecutive_failures(),
            last_failure_at: self.metrics.last_failure_at(),
            circuit_state: self.breaker.state(),
            avg_response_seconds: self.metrics.avg_response_seconds(),
            p95_response_seconds: self.metrics.p95_response_seconds(),
        }
    }

    /// Restore persisted metrics into a freshly built instance
    pub fn restore(&self, snapshot: &InstanceSnapshot) {
        self.breaker.restore(snapshot.circuit_state, snapshot.consecutive_failures);
        self.metrics.restore(
            snapshot.avg_response_seconds,
            snapshot.p95_response_seconds,
            snapshot.last_failure_at,
        );
        self.refresh_gauges();
    }
}
