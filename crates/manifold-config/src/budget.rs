//! Budget specs and the effective-budget derivation
//!
//! Limits arrive as `<metric>_per_<window>` keys (e.g.
//! `requests_per_minute: 3500`, `tokens_per_day: 90000`). A binding's
//! effective budget is derived once at load time: provider defaults,
//! overridden by binding limits, with the binding's multipliers attached.
//! Multipliers scale committed usage — one real unit consumes M budget
//! units — so limits are stored exactly as configured.

use std::collections::BTreeMap;

use serde::Serialize;
use thiserror::Error;

/// A budgetable quantity
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Metric {
    Requests,
    Tokens,
    PromptTokens,
    CompletionTokens,
    Credits,
}

impl Metric {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Requests => "requests",
            Self::Tokens => "tokens",
            Self::PromptTokens => "prompt_tokens",
            Self::CompletionTokens => "completion_tokens",
            Self::Credits => "credits",
        }
    }

    /// Whether this metric counts tokens (and takes the token multiplier)
    pub const fn is_token_metric(self) -> bool {
        matches!(self, Self::Tokens | Self::PromptTokens | Self::CompletionTokens)
    }

    fn parse(s: &str) -> Option<Self> {
        match s {
            "requests" => Some(Self::Requests),
            "tokens" => Some(Self::Tokens),
            "prompt_tokens" => Some(Self::PromptTokens),
            "completion_tokens" => Some(Self::CompletionTokens),
            "credits" => Some(Self::Credits),
            _ => None,
        }
    }
}

/// A budgeting period
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Window {
    Minute,
    Hour,
    Day,
    Month,
}

impl Window {
    pub const ALL: [Self; 4] = [Self::Minute, Self::Hour, Self::Day, Self::Month];

    /// Sliding-window width in seconds (month is a fixed 30 days)
    pub const fn seconds(self) -> u64 {
        match self {
            Self::Minute => 60,
            Self::Hour => 3_600,
            Self::Day => 86_400,
            Self::Month => 2_592_000,
        }
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Minute => "minute",
            Self::Hour => "hour",
            Self::Day => "day",
            Self::Month => "month",
        }
    }

    fn parse(s: &str) -> Option<Self> {
        match s {
            "minute" => Some(Self::Minute),
            "hour" => Some(Self::Hour),
            "day" => Some(Self::Day),
            "month" => Some(Self::Month),
            _ => None,
        }
    }
}

/// Errors raised while parsing budget limit keys
#[derive(Debug, Error)]
pub enum BudgetError {
    #[error("unrecognized rate limit key `{key}` (expected `<metric>_per_<window>`)")]
    UnknownKey { key: String },
    #[error("rate limit `{key}` must be a positive number, got {value}")]
    NonPositiveLimit { key: String, value: f64 },
}

/// Parse a `<metric>_per_<window>` key into its parts
pub fn parse_limit_key(key: &str) -> Option<(Metric, Window)> {
    let (metric, window) = key.split_once("_per_")?;
    Some((Metric::parse(metric)?, Window::parse(window)?))
}

/// A set of configured limits keyed by (metric, window)
#[derive(Debug, Clone, Default)]
pub struct BudgetSpec {
    pub limits: BTreeMap<(Metric, Window), f64>,
}

impl BudgetSpec {
    /// Parse a raw `rate_limits` mapping, rejecting unknown keys and
    /// non-positive limits
    pub fn from_raw<'a, I>(raw: I) -> Result<Self, BudgetError>
    where
        I: IntoIterator<Item = (&'a String, &'a f64)>,
    {
        let mut limits = BTreeMap::new();
        for (key, &value) in raw {
            let Some(pair) = parse_limit_key(key) else {
                return Err(BudgetError::UnknownKey { key: key.clone() });
            };
            if value <= 0.0 {
                return Err(BudgetError::NonPositiveLimit {
                    key: key.clone(),
                    value,
                });
            }
            limits.insert(pair, value);
        }
        Ok(Self { limits })
    }
}

/// How much each real unit counts against the budget
#[derive(Debug, Clone, Copy)]
pub struct Multipliers {
    /// Applies to every metric
    pub general: f64,
    /// Composed with `general` for token metrics
    pub token: f64,
    /// Composed with `general` for the request metric
    pub request: f64,
}

impl Default for Multipliers {
    fn default() -> Self {
        Self {
            general: 1.0,
            token: 1.0,
            request: 1.0,
        }
    }
}

impl Multipliers {
    /// The effective multiplier for a metric
    pub fn for_metric(&self, metric: Metric) -> f64 {
        if metric.is_token_metric() {
            self.general * self.token
        } else if metric == Metric::Requests {
            self.general * self.request
        } else {
            self.general
        }
    }
}

/// The budget a binding enforces, derived once at load time
#[derive(Debug, Clone, Default)]
pub struct EffectiveBudget {
    /// Limits in configured budget units
    pub limits: BTreeMap<(Metric, Window), f64>,
    /// Usage scaling applied at accounting time
    pub multipliers: Multipliers,
}

impl EffectiveBudget {
    /// Three-step derivation: provider defaults, binding overrides
    /// replacing matching keys, binding multipliers attached
    pub fn derive(defaults: &BudgetSpec, overrides: &BudgetSpec, multipliers: Multipliers) -> Self {
        let mut limits = defaults.limits.clone();
        for (key, value) in &overrides.limits {
            limits.insert(*key, *value);
        }
        Self { limits, multipliers }
    }

    /// The limit expressed in real units (limit divided by the effective
    /// multiplier) — the operator-facing capacity view
    pub fn effective_capacity(&self, metric: Metric, window: Window) -> Option<f64> {
        let limit = self.limits.get(&(metric, window))?;
        let multiplier = self.multipliers.for_metric(metric);
        if multiplier > 0.0 {
            Some(limit / multiplier)
        } else {
            Some(*limit)
        }
    }

    /// Credit caps configured through `rate_limits` (`credits_per_<window>`)
    pub fn credit_limits(&self) -> impl Iterator<Item = (Window, f64)> + '_ {
        self.limits
            .iter()
            .filter(|((metric, _), _)| *metric == Metric::Credits)
            .map(|((_, window), limit)| (*window, *limit))
    }
}

/// Credit pricing attached to a binding
#[derive(Debug, Clone, Copy, Default)]
pub struct CreditPricing {
    pub per_token: f64,
    pub per_million_tokens: f64,
    pub per_request: f64,
}

impl CreditPricing {
    pub fn is_configured(&self) -> bool {
        self.per_token != 0.0 || self.per_million_tokens != 0.0 || self.per_request != 0.0
    }
}

/// Credit accrual: per-window refill rate and balance cap
#[derive(Debug, Clone, Default)]
pub struct CreditAccrual {
    windows: BTreeMap<Window, (f64, f64)>,
}

impl CreditAccrual {
    /// Set the (gain, max_balance) pair for a window
    pub fn set(&mut self, window: Window, gain: f64, max_balance: f64) {
        self.windows.insert(window, (gain, max_balance));
    }

    pub fn get(&self, window: Window) -> Option<(f64, f64)> {
        self.windows.get(&window).copied()
    }

    pub fn iter(&self) -> impl Iterator<Item = (Window, f64, f64)> + '_ {
        self.windows.iter().map(|(w, (gain, max))| (*w, *gain, *max))
    }

    pub fn is_empty(&self) -> bool {
        self.windows.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raw(pairs: &[(&str, f64)]) -> Vec<(String, f64)> {
        pairs.iter().map(|(k, v)| ((*k).to_owned(), *v)).collect()
    }

    fn spec(pairs: &[(&str, f64)]) -> BudgetSpec {
        let raw = raw(pairs);
        BudgetSpec::from_raw(raw.iter().map(|(k, v)| (k, v))).unwrap()
    }

    #[test]
    fn parses_known_limit_keys() {
        let spec = spec(&[
            ("requests_per_minute", 3500.0),
            ("tokens_per_day", 90_000.0),
            ("prompt_tokens_per_hour", 1000.0),
            ("credits_per_month", 50.0),
        ]);
        assert_eq!(spec.limits.len(), 4);
        assert_eq!(spec.limits[&(Metric::Requests, Window::Minute)], 3500.0);
        assert_eq!(spec.limits[&(Metric::Tokens, Window::Day)], 90_000.0);
    }

    #[test]
    fn rejects_unknown_key() {
        let raw = raw(&[("sockets_per_minute", 5.0)]);
        let err = BudgetSpec::from_raw(raw.iter().map(|(k, v)| (k, v))).unwrap_err();
        assert!(matches!(err, BudgetError::UnknownKey { .. }));
    }

    #[test]
    fn rejects_non_positive_limit() {
        let raw = raw(&[("requests_per_minute", 0.0)]);
        let err = BudgetSpec::from_raw(raw.iter().map(|(k, v)| (k, v))).unwrap_err();
        assert!(matches!(err, BudgetError::NonPositiveLimit { .. }));
    }

    #[test]
    fn derivation_overrides_replace_defaults() {
        let defaults = spec(&[("requests_per_minute", 100.0), ("tokens_per_day", 50_000.0)]);
        let overrides = spec(&[("requests_per_minute", 10.0)]);
        let effective = EffectiveBudget::derive(&defaults, &overrides, Multipliers::default());

        assert_eq!(effective.limits[&(Metric::Requests, Window::Minute)], 10.0);
        assert_eq!(effective.limits[&(Metric::Tokens, Window::Day)], 50_000.0);
    }

    #[test]
    fn multipliers_compose_per_metric() {
        let m = Multipliers {
            general: 2.0,
            token: 3.0,
            request: 5.0,
        };
        assert_eq!(m.for_metric(Metric::Tokens), 6.0);
        assert_eq!(m.for_metric(Metric::PromptTokens), 6.0);
        assert_eq!(m.for_metric(Metric::Requests), 10.0);
        assert_eq!(m.for_metric(Metric::Credits), 2.0);
    }

    #[test]
    fn effective_capacity_divides_by_multiplier() {
        let defaults = spec(&[("tokens_per_day", 100_000.0)]);
        let multipliers = Multipliers {
            general: 1.0,
            token: 2.0,
            request: 1.0,
        };
        let effective = EffectiveBudget::derive(&defaults, &BudgetSpec::default(), multipliers);

        assert_eq!(effective.effective_capacity(Metric::Tokens, Window::Day), Some(50_000.0));
    }

    #[test]
    fn window_seconds() {
        assert_eq!(Window::Minute.seconds(), 60);
        assert_eq!(Window::Hour.seconds(), 3_600);
        assert_eq!(Window::Day.seconds(), 86_400);
        assert_eq!(Window::Month.seconds(), 2_592_000);
    }
}
