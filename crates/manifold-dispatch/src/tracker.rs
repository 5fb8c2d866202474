//! Per-credential budget tracking
//!
//! One [`BudgetTracker`] exists per (provider, credential) pair and is
//! shared by every binding that uses that credential under that
//! provider. All check-and-commit sequences run under the tracker's
//! mutex: a pre-flight that passes reserves its request charge before
//! the lock is released, so two concurrent pre-flights can never both
//! pass a limit they would jointly violate.
//!
//! Sliding windows cover `requests`, `tokens`, `prompt_tokens`, and
//! `completion_tokens`; calendar windows cover credits. Post-flight
//! commits are never rejected — the upstream cost is already paid — so
//! usage and credit balances may transiently overshoot until pre-flight
//! checks push back.

use std::collections::BTreeMap;
use std::sync::Mutex;

use manifold_config::{CreditPricing, EffectiveBudget, Metric, Window};
use manifold_translate::Usage;
use serde::{Deserialize, Serialize};

use crate::clock::SharedClock;
use crate::credits::{token_credit_cost, CreditWindow, CreditWindowSnapshot};
use crate::window::SlidingWindow;

/// Outcome of a budget check
#[derive(Debug, Clone, PartialEq)]
pub enum BudgetDecision {
    Allowed,
    Denied {
        metric: Metric,
        window: Window,
        retry_after_seconds: f64,
    },
}

impl BudgetDecision {
    pub const fn is_allowed(&self) -> bool {
        matches!(self, Self::Allowed)
    }
}

/// `{used, limit}` pair for the stats endpoint
#[derive(Debug, Clone, Copy, Serialize)]
pub struct UsageStat {
    pub used: f64,
    pub limit: f64,
}

/// Persistable credit state; sliding-window samples are ephemeral
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TrackerSnapshot {
    pub credit_windows: BTreeMap<String, CreditWindowSnapshot>,
}

struct TrackerState {
    sliding: BTreeMap<Metric, SlidingWindow>,
    credit_windows: Vec<CreditWindow>,
}

/// Shared usage log for one credential under one provider
pub struct BudgetTracker {
    clock: SharedClock,
    state: Mutex<TrackerState>,
}

const SLIDING_METRICS: [Metric; 4] = [
    Metric::Requests,
    Metric::Tokens,
    Metric::PromptTokens,
    Metric::CompletionTokens,
];

impl BudgetTracker {
    /// Tracker retaining samples up to the widest window (30 days) for
    /// every metric
    pub fn new(clock: SharedClock, credit_windows: Vec<CreditWindow>) -> Self {
        let horizons = SLIDING_METRICS
            .into_iter()
            .map(|metric| (metric, Window::Month.seconds()))
            .collect();
        Self::with_horizons(clock, credit_windows, horizons)
    }

    /// Tracker whose per-metric sample horizon matches the widest
    /// window actually budgeted for that metric
    pub fn with_horizons(
        clock: SharedClock,
        credit_windows: Vec<CreditWindow>,
        horizons: BTreeMap<Metric, u64>,
    ) -> Self {
        let sliding = SLIDING_METRICS
            .into_iter()
            .map(|metric| {
                let horizon = horizons.get(&metric).copied().unwrap_or(0);
                (metric, SlidingWindow::new(horizon))
            })
            .collect();

        Self {
            clock,
            state: Mutex::new(TrackerState {
                sliding,
                credit_windows,
            }),
        }
    }

    /// Atomically check and reserve the pre-flight charge: one request
    /// (scaled by the request multiplier) plus the flat per-request
    /// credit price. Token costs are unknown until the upstream reports
    /// usage and are committed post-flight.
    pub fn preflight(&self, budget: &EffectiveBudget, pricing: &CreditPricing) -> BudgetDecision {
        let now_mono = self.clock.mono();
        let now_wall = self.clock.wall_secs();
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());

        for window in state.sliding.values_mut() {
            window.expire(now_mono);
        }
        for credit in &mut state.credit_windows {
            credit.advance(now_wall);
        }

        let request_charge = budget.multipliers.for_metric(Metric::Requests);
        let credit_charge = pricing.per_request * budget.multipliers.for_metric(Metric::Credits);

        // Collect every failing limit; the soonest-resolving denial wins
        let mut denial: Option<(Metric, Window, f64)> = None;
        let mut consider = |metric: Metric, window: Window, retry_after: f64| {
            if denial.as_ref().is_none_or(|(_, _, best)| retry_after < *best) {
                denial = Some((metric, window, retry_after));
            }
        };

        for ((metric, window), limit) in &budget.limits {
            let charge = match metric {
                Metric::Requests => request_charge,
                // Credits are checked against calendar windows below
                Metric::Credits => continue,
                // Token charges are zero pre-flight; a prior overshoot
                // can still deny here
                _ => 0.0,
            };

            let sliding = state.sliding.get(metric).expect("all metrics pre-created");
            let used = sliding.sum_within(now_mono, window.seconds());
            if used + charge > *limit {
                let retry_after = sliding
                    .retry_after(now_mono, window.seconds())
                    .unwrap_or_else(|| window.seconds() as f64);
                consider(*metric, *window, retry_after);
            }
        }

        for credit in &state.credit_windows {
            if !credit.permits(credit_charge) {
                consider(Metric::Credits, credit.window(), credit.retry_after(now_wall));
            }
        }

        if let Some((metric, window, retry_after_seconds)) = denial {
            return BudgetDecision::Denied {
                metric,
                window,
                retry_after_seconds,
            };
        }

        // Reserve the charge before releasing the lock
        state
            .sliding
            .get_mut(&Metric::Requests)
            .expect("all metrics pre-created")
            .record(now_mono, request_charge);
        if credit_charge != 0.0 {
            for credit in &mut state.credit_windows {
                credit.commit(credit_charge);
            }
        }

        BudgetDecision::Allowed
    }

    /// Commit post-flight usage: token samples and the token-derived
    /// credit cost. Always succeeds — the upstream already served the
    /// request — and returns the credit amount deducted.
    pub fn commit_completion(&self, budget: &EffectiveBudget, pricing: &CreditPricing, usage: &Usage) -> f64 {
        let now_mono = self.clock.mono();
        let now_wall = self.clock.wall_secs();
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());

        let token_multiplier = budget.multipliers.for_metric(Metric::Tokens);
        let prompt = usage.prompt_tokens as f64 * token_multiplier;
        let completion = usage.completion_tokens as f64 * token_multiplier;

        state
            .sliding
            .get_mut(&Metric::Tokens)
            .expect("all metrics pre-created")
            .record(now_mono, prompt + completion);
        state
            .sliding
            .get_mut(&Metric::PromptTokens)
            .expect("all metrics pre-created")
            .record(now_mono, prompt);
        state
            .sliding
            .get_mut(&Metric::CompletionTokens)
            .expect("all metrics pre-created")
            .record(now_mono, completion);

        let credit_charge =
            token_credit_cost(pricing, prompt, completion) * budget.multipliers.for_metric(Metric::Credits);
        if credit_charge != 0.0 {
            for credit in &mut state.credit_windows {
                credit.advance(now_wall);
                credit.commit(credit_charge);
            }
        }

        credit_charge
    }

    /// Whether any configured limit is currently exhausted
    pub fn is_rate_limited(&self, budget: &EffectiveBudget) -> bool {
        let now_mono = self.clock.mono();
        let now_wall = self.clock.wall_secs();
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());

        for credit in &mut state.credit_windows {
            credit.advance(now_wall);
        }

        for ((metric, window), limit) in &budget.limits {
            if *metric == Metric::Credits {
                continue;
            }
            let sliding = state.sliding.get(metric).expect("all metrics pre-created");
            if sliding.sum_within(now_mono, window.seconds()) >= *limit {
                return true;
            }
        }

        state.credit_windows.iter().any(|credit| credit.balance() <= 0.0)
    }

    /// `{used, limit}` per configured limit, plus one entry per credit
    /// window, for the stats endpoint
    pub fn usage_stats(&self, budget: &EffectiveBudget) -> BTreeMap<String, UsageStat> {
        let now_mono = self.clock.mono();
        let now_wall = self.clock.wall_secs();
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());

        for credit in &mut state.credit_windows {
            credit.advance(now_wall);
        }

        let mut stats = BTreeMap::new();

        for ((metric, window), limit) in &budget.limits {
            if *metric == Metric::Credits {
                continue;
            }
            let key = format!("{}_per_{}", metric.as_str(), window.as_str());
            let used = state
                .sliding
                .get(metric)
                .expect("all metrics pre-created")
                .sum_within(now_mono, window.seconds());
            stats.insert(key, UsageStat { used, limit: *limit });
        }

        for credit in &state.credit_windows {
            let key = format!("credits_per_{}", credit.window().as_str());
            stats.insert(
                key,
                UsageStat {
                    used: (credit.max_balance() - credit.balance()).max(0.0),
                    limit: credit.max_balance(),
                },
            );
        }

        stats
    }

    pub fn snapshot(&self) -> TrackerSnapshot {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        TrackerSnapshot {
            credit_windows: state
                .credit_windows
                .iter()
                .map(|w| (w.window().as_str().to_owned(), w.snapshot()))
                .collect(),
        }
    }

    /// Best-effort restore of persisted credit state
    pub fn restore(&self, snapshot: &TrackerSnapshot) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        for credit in &mut state.credit_windows {
            if let Some(saved) = snapshot.credit_windows.get(credit.window().as_str()) {
                credit.restore(saved);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use manifold_config::{BudgetSpec, Multipliers};

    use super::*;
    use crate::clock::ManualClock;
    use crate::credits::align_to_boundary;

    // 2024-03-15 12:00:00 UTC, minute-aligned
    const T: f64 = 1_710_504_000.0;

    fn budget(pairs: &[(&str, f64)], multipliers: Multipliers) -> EffectiveBudget {
        let raw: Vec<(String, f64)> = pairs.iter().map(|(k, v)| ((*k).to_owned(), *v)).collect();
        let spec = BudgetSpec::from_raw(raw.iter().map(|(k, v)| (k, v))).unwrap();
        EffectiveBudget::derive(&spec, &BudgetSpec::default(), multipliers)
    }

    fn usage(prompt: u64, completion: u64) -> Usage {
        Usage {
            prompt_tokens: prompt,
            completion_tokens: completion,
            total_tokens: prompt + completion,
        }
    }

    #[test]
    fn preflight_reserves_request_charge() {
        let clock = ManualClock::shared(T);
        let tracker = BudgetTracker::new(clock.clone(), Vec::new());
        let budget = budget(&[("requests_per_minute", 2.0)], Multipliers::default());
        let pricing = CreditPricing::default();

        assert!(tracker.preflight(&budget, &pricing).is_allowed());
        assert!(tracker.preflight(&budget, &pricing).is_allowed());

        // Third request in the same minute is denied
        let decision = tracker.preflight(&budget, &pricing);
        let BudgetDecision::Denied {
            metric,
            window,
            retry_after_seconds,
        } = decision
        else {
            panic!("expected denial, got {decision:?}");
        };
        assert_eq!(metric, Metric::Requests);
        assert_eq!(window, Window::Minute);
        assert!(retry_after_seconds > 0.0 && retry_after_seconds <= 60.0);

        // Once the window slides past, requests flow again
        clock.advance(Duration::from_secs(61));
        assert!(tracker.preflight(&budget, &pricing).is_allowed());
    }

    #[test]
    fn token_overshoot_denies_next_preflight() {
        // tokens_per_day 100_000 with token_multiplier 2.0: a 51k-token
        // response commits 102k counted tokens, over the limit
        let clock = ManualClock::shared(T);
        let tracker = BudgetTracker::new(clock, Vec::new());
        let multipliers = Multipliers {
            general: 1.0,
            token: 2.0,
            request: 1.0,
        };
        let budget = budget(&[("tokens_per_day", 100_000.0)], multipliers);
        let pricing = CreditPricing::default();

        assert!(tracker.preflight(&budget, &pricing).is_allowed());
        tracker.commit_completion(&budget, &pricing, &usage(30_000, 21_000));

        let stats = tracker.usage_stats(&budget);
        assert_eq!(stats["tokens_per_day"].used, 102_000.0);
        assert_eq!(stats["tokens_per_day"].limit, 100_000.0);

        let decision = tracker.preflight(&budget, &pricing);
        assert!(matches!(
            decision,
            BudgetDecision::Denied {
                metric: Metric::Tokens,
                window: Window::Day,
                ..
            }
        ));
    }

    #[test]
    fn credit_window_denies_until_refill() {
        // Scenario: gain 10/minute, max 10, 4 credits per request
        let clock = ManualClock::shared(T);
        let windows = vec![CreditWindow::new(Window::Minute, 10.0, 10.0, T)];
        let tracker = BudgetTracker::new(clock.clone(), windows);
        let budget = budget(&[], Multipliers::default());
        let pricing = CreditPricing {
            per_request: 4.0,
            ..CreditPricing::default()
        };

        assert!(tracker.preflight(&budget, &pricing).is_allowed());
        assert!(tracker.preflight(&budget, &pricing).is_allowed());

        // Balance is 2; a third request needs 4
        clock.advance(Duration::from_secs(10));
        let decision = tracker.preflight(&budget, &pricing);
        let BudgetDecision::Denied {
            metric,
            retry_after_seconds,
            ..
        } = decision
        else {
            panic!("expected denial, got {decision:?}");
        };
        assert_eq!(metric, Metric::Credits);
        assert_eq!(retry_after_seconds, 50.0);

        // At the minute boundary the balance resets to 10
        clock.advance(Duration::from_secs(50));
        assert!(tracker.preflight(&budget, &pricing).is_allowed());
    }

    #[test]
    fn soonest_resolving_denial_wins() {
        let clock = ManualClock::shared(T);
        let tracker = BudgetTracker::new(clock.clone(), Vec::new());
        let budget = budget(
            &[("requests_per_minute", 1.0), ("requests_per_hour", 1.0)],
            Multipliers::default(),
        );
        let pricing = CreditPricing::default();

        assert!(tracker.preflight(&budget, &pricing).is_allowed());
        clock.advance(Duration::from_secs(30));

        let decision = tracker.preflight(&budget, &pricing);
        let BudgetDecision::Denied {
            window,
            retry_after_seconds,
            ..
        } = decision
        else {
            panic!("expected denial, got {decision:?}");
        };
        // The minute limit resolves in 30 s, the hour limit much later
        assert_eq!(window, Window::Minute);
        assert_eq!(retry_after_seconds, 30.0);
    }

    #[test]
    fn request_multiplier_scales_committed_charge() {
        let clock = ManualClock::shared(T);
        let tracker = BudgetTracker::new(clock, Vec::new());
        let multipliers = Multipliers {
            general: 1.0,
            token: 1.0,
            request: 2.0,
        };
        let budget = budget(&[("requests_per_minute", 3.0)], multipliers);
        let pricing = CreditPricing::default();

        // Each request counts as 2 budget units: the second would reach 4 > 3
        assert!(tracker.preflight(&budget, &pricing).is_allowed());
        assert!(!tracker.preflight(&budget, &pricing).is_allowed());
    }

    #[test]
    fn post_flight_commit_never_rejected() {
        let clock = ManualClock::shared(T);
        let windows = vec![CreditWindow::new(Window::Minute, 5.0, 5.0, T)];
        let tracker = BudgetTracker::new(clock, windows);
        let budget = budget(&[], Multipliers::default());
        let pricing = CreditPricing {
            per_token: 0.01,
            ..CreditPricing::default()
        };

        assert!(tracker.preflight(&budget, &pricing).is_allowed());
        // 1000 tokens at 0.01/token = 10 credits against a balance of 5
        let committed = tracker.commit_completion(&budget, &pricing, &usage(600, 400));
        assert!((committed - 10.0).abs() < 1e-9);

        let snap = tracker.snapshot();
        assert_eq!(snap.credit_windows["minute"].balance, -5.0);

        // Pre-flight now denies until refills recover the balance
        assert!(!tracker.preflight(&budget, &pricing).is_allowed());
    }

    #[test]
    fn snapshot_restores_credit_balances() {
        let clock = ManualClock::shared(T);
        let windows = vec![
            CreditWindow::new(Window::Minute, 10.0, 10.0, T),
            CreditWindow::new(Window::Day, 500.0, 500.0, T),
        ];
        let tracker = BudgetTracker::new(clock.clone(), windows);
        let budget = budget(&[], Multipliers::default());
        let pricing = CreditPricing {
            per_request: 3.0,
            ..CreditPricing::default()
        };
        assert!(tracker.preflight(&budget, &pricing).is_allowed());
        let snap = tracker.snapshot();

        let fresh = BudgetTracker::new(
            clock,
            vec![
                CreditWindow::new(Window::Minute, 10.0, 10.0, T),
                CreditWindow::new(Window::Day, 500.0, 500.0, T),
            ],
        );
        fresh.restore(&snap);
        let restored = fresh.snapshot();
        assert_eq!(restored.credit_windows["minute"].balance, 7.0);
        assert_eq!(restored.credit_windows["day"].balance, 497.0);
    }

    #[test]
    fn rate_limited_reflects_exhaustion() {
        let clock = ManualClock::shared(T);
        let tracker = BudgetTracker::new(clock, Vec::new());
        let budget = budget(&[("requests_per_minute", 1.0)], Multipliers::default());
        let pricing = CreditPricing::default();

        assert!(!tracker.is_rate_limited(&budget));
        assert!(tracker.preflight(&budget, &pricing).is_allowed());
        assert!(tracker.is_rate_limited(&budget));
    }

    #[test]
    fn boundary_alignment_is_stable() {
        let aligned = align_to_boundary(Window::Minute, T);
        assert_eq!(aligned as f64, T);
    }
}
