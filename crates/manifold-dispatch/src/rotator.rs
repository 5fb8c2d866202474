//! Round-robin credential rotation with failure cooldowns
//!
//! Keys disabled by consecutive upstream failures re-enable after the
//! cooldown elapses. A key denied by its budget tracker is skipped
//! without being marked failed — budget exhaustion is not a fault.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use manifold_config::{CreditPricing, EffectiveBudget};
use secrecy::SecretString;

use crate::clock::SharedClock;
use crate::tracker::BudgetTracker;

/// Consecutive failures before a key is placed on cooldown
const DISABLE_THRESHOLD: u32 = 3;

/// How long a disabled key stays out of rotation
pub const KEY_COOLDOWN: Duration = Duration::from_secs(600);

/// A credential and its rotation state
struct KeyState {
    key: SecretString,
    tracker: Arc<BudgetTracker>,
    consecutive_failures: u32,
    disabled_until: Option<Duration>,
    last_used: Option<Duration>,
}

/// A key handed out by [`KeyRotator::next`]
pub struct SelectedKey {
    pub index: usize,
    pub key: SecretString,
    pub tracker: Arc<BudgetTracker>,
}

/// Per-key stats for the stats endpoint
#[derive(serde::Serialize)]
pub struct KeyStatus {
    pub index: usize,
    pub failures: u32,
    pub enabled: bool,
    pub rate_limited: bool,
    pub usage: std::collections::BTreeMap<String, crate::tracker::UsageStat>,
}

struct RotatorState {
    keys: Vec<KeyState>,
    cursor: usize,
}

/// Round-robin selector over a credential pool
pub struct KeyRotator {
    clock: SharedClock,
    state: Mutex<RotatorState>,
    cooldown: Duration,
}

impl KeyRotator {
    pub fn new(clock: SharedClock, keys: Vec<(SecretString, Arc<BudgetTracker>)>) -> Self {
        let keys = keys
            .into_iter()
            .map(|(key, tracker)| KeyState {
                key,
                tracker,
                consecutive_failures: 0,
                disabled_until: None,
                last_used: None,
            })
            .collect();

        Self {
            clock,
            state: Mutex::new(RotatorState { keys, cursor: 0 }),
            cooldown: KEY_COOLDOWN,
        }
    }

    /// Select the next usable key, reserving its pre-flight charge
    ///
    /// Scans at most one full cycle from the cursor; the first key that
    /// is enabled and whose tracker admits the charge is returned, and
    /// the cursor advances past it. `None` means every key is disabled
    /// or budget-denied — the caller treats the instance as unusable.
    pub fn next(&self, budget: &EffectiveBudget, pricing: &CreditPricing) -> Option<SelectedKey> {
        let now = self.clock.mono();
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());

        // Cooldowns that have elapsed re-enable the key with a clean slate
        for key in &mut state.keys {
            if let Some(until) = key.disabled_until
                && now >= until
            {
                key.disabled_until = None;
                key.consecutive_failures = 0;
            }
        }

        let len = state.keys.len();
        for offset in 0..len {
            let index = (state.cursor + offset) % len;
            let key = &state.keys[index];

            if key.disabled_until.is_some() {
                continue;
            }
            if !key.tracker.preflight(budget, pricing).is_allowed() {
                continue;
            }

            let key = &mut state.keys[index];
            key.last_used = Some(now);
            state.cursor = (index + 1) % len;
            let key = &state.keys[index];
            return Some(SelectedKey {
                index,
                key: key.key.clone(),
                tracker: Arc::clone(&key.tracker),
            });
        }

        None
    }

    /// Record an upstream failure for a key; the third consecutive
    /// failure puts it on cooldown
    pub fn record_failure(&self, index: usize) {
        let now = self.clock.mono();
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let Some(key) = state.keys.get_mut(index) else {
            return;
        };
        key.consecutive_failures += 1;
        if key.consecutive_failures >= DISABLE_THRESHOLD {
            key.disabled_until = Some(now + self.cooldown);
            tracing::warn!(
                key_index = index,
                failures = key.consecutive_failures,
                cooldown_seconds = self.cooldown.as_secs(),
                "api key disabled after consecutive failures"
            );
        }
    }

    /// Record a success: the failure tally and any cooldown clear
    pub fn record_success(&self, index: usize) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(key) = state.keys.get_mut(index) {
            key.consecutive_failures = 0;
            key.disabled_until = None;
        }
    }

    /// Trackers in pool order (shared, for snapshot assembly)
    pub fn trackers(&self) -> Vec<Arc<BudgetTracker>> {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.keys.iter().map(|k| Arc::clone(&k.tracker)).collect()
    }

    /// Per-key status for the stats endpoint (never exposes key material)
    pub fn status(&self, budget: &EffectiveBudget) -> Vec<KeyStatus> {
        let now = self.clock.mono();
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state
            .keys
            .iter()
            .enumerate()
            .map(|(index, key)| KeyStatus {
                index,
                failures: key.consecutive_failures,
                enabled: key.disabled_until.is_none_or(|until| now >= until),
                rate_limited: key.tracker.is_rate_limited(budget),
                usage: key.tracker.usage_stats(budget),
            })
            .collect()
    }
}
