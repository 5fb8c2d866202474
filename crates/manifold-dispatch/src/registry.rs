//! Model registry: public model id → ranked provider instances
//!
//! Built once from validated configuration. Budget derivation, tracker
//! sharing, and translator construction all happen here at startup;
//! lookups afterwards read lock-free health gauges and never take an
//! instance lock.

use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::Arc;

use indexmap::IndexMap;
use manifold_config::{BudgetSpec, Config, EffectiveBudget, Metric, Window};
use manifold_translate::{Translator, TranslatorRegistry};
use secrecy::{ExposeSecret, SecretString};
use serde::Serialize;

use crate::clock::SharedClock;
use crate::credits::CreditWindow;
use crate::instance::ProviderInstance;
use crate::metrics::{MetricsSnapshot, MetricsStore};
use crate::rotator::KeyRotator;
use crate::tracker::BudgetTracker;

/// A registered public model
struct RegistryModel {
    created: u64,
    owned_by: String,
    instances: Vec<Arc<ProviderInstance>>,
}

/// Wire entry for `GET /v1/models`
#[derive(Debug, Clone, Serialize)]
pub struct ModelCard {
    pub id: String,
    pub object: &'static str,
    pub created: u64,
    pub owned_by: String,
}

/// Registry of models, instances, and shared per-credential trackers
pub struct ModelRegistry {
    models: IndexMap<String, RegistryModel>,
    /// Trackers keyed by (provider name, provider-scoped key index)
    trackers: HashMap<(String, usize), Arc<BudgetTracker>>,
    store: MetricsStore,
}

impl ModelRegistry {
    /// Build the registry from configuration
    ///
    /// # Errors
    ///
    /// Returns an error if a translator cannot be constructed or a
    /// budget spec fails to parse (the latter is normally caught by
    /// `Config::validate`).
    pub fn build(
        config: &Config,
        translators: &TranslatorRegistry,
        clock: SharedClock,
        metrics_path: impl Into<PathBuf>,
    ) -> anyhow::Result<Self> {
        // One translator and one default budget spec per provider
        let mut provider_translators: HashMap<String, Arc<dyn Translator>> = HashMap::new();
        let mut provider_defaults: HashMap<String, BudgetSpec> = HashMap::new();
        for (name, provider) in &config.providers {
            let translator = translators
                .build(name, provider)
                .map_err(|e| anyhow::anyhow!("provider '{name}': {e}"))?;
            provider_translators.insert(name.clone(), translator);
            provider_defaults.insert(name.clone(), BudgetSpec::from_raw(&provider.rate_limits)?);
        }

        // Credit window specs per provider: the provider's accrual,
        // plus caps contributed by `credits_per_<window>` rate limits
        // on bindings (gain = max = limit when the accrual is silent).
        // Sample horizons per provider: the widest window any binding
        // budgets for each sliding metric.
        let mut credit_specs: HashMap<String, BTreeMap<Window, (f64, f64)>> = HashMap::new();
        let mut horizon_specs: HashMap<String, BTreeMap<Metric, u64>> = HashMap::new();
        for (name, provider) in &config.providers {
            let spec = credit_specs.entry(name.clone()).or_default();
            for (window, gain, max) in provider.credit_accrual().iter() {
                spec.insert(window, (gain, max));
            }
        }
        for model in config.models.values() {
            for (provider_name, binding) in &model.providers {
                let overrides = BudgetSpec::from_raw(&binding.rate_limits)?;
                let budget = EffectiveBudget::derive(
                    provider_defaults
                        .get(provider_name)
                        .ok_or_else(|| anyhow::anyhow!("unknown provider '{provider_name}'"))?,
                    &overrides,
                    binding.multipliers(),
                );
                let spec = credit_specs.entry(provider_name.clone()).or_default();
                for (window, limit) in budget.credit_limits() {
                    spec.entry(window).or_insert((limit, limit));
                }
                let horizons = horizon_specs.entry(provider_name.clone()).or_default();
                for (metric, window) in budget.limits.keys() {
                    if *metric != Metric::Credits {
                        let horizon = horizons.entry(*metric).or_insert(0);
                        *horizon = (*horizon).max(window.seconds());
                    }
                }
            }
        }

        // Trackers are shared per (provider, credential): distinct
        // models using the same key under the same provider account
        // against one usage log, while cross-provider usage stays apart
        let mut key_order: HashMap<String, Vec<String>> = HashMap::new();
        let mut trackers: HashMap<(String, usize), Arc<BudgetTracker>> = HashMap::new();
        let mut tracker_for = |provider: &str, key: &SecretString| -> Arc<BudgetTracker> {
            let order = key_order.entry(provider.to_owned()).or_default();
            let secret = key.expose_secret();
            let index = order.iter().position(|k| k == secret).unwrap_or_else(|| {
                order.push(secret.to_owned());
                order.len() - 1
            });
            Arc::clone(
                trackers
                    .entry((provider.to_owned(), index))
                    .or_insert_with(|| {
                        let windows = credit_specs
                            .get(provider)
                            .into_iter()
                            .flatten()
                            .map(|(window, &(gain, max))| CreditWindow::new(*window, gain, max, clock.wall_secs()))
                            .collect();
                        let horizons = horizon_specs.get(provider).cloned().unwrap_or_default();
                        Arc::new(BudgetTracker::with_horizons(Arc::clone(&clock), windows, horizons))
                    }),
            )
        };

        let mut models = IndexMap::new();
        for (model_id, model) in &config.models {
            let mut instances = Vec::new();

            for (provider_name, binding) in &model.providers {
                let provider = config
                    .providers
                    .get(provider_name)
                    .ok_or_else(|| anyhow::anyhow!("model '{model_id}' references unknown provider '{provider_name}'"))?;

                let overrides = BudgetSpec::from_raw(&binding.rate_limits)?;
                let budget = EffectiveBudget::derive(
                    &provider_defaults[provider_name],
                    &overrides,
                    binding.multipliers(),
                );

                let keys = if binding.key_override().is_empty() {
                    provider.keys()
                } else {
                    binding.key_override()
                };
                let rotator_keys = keys
                    .iter()
                    .map(|key| (key.clone(), tracker_for(provider_name, key)))
                    .collect();
                let rotator = KeyRotator::new(Arc::clone(&clock), rotator_keys);

                let upstream_models = binding
                    .model_id
                    .as_ref()
                    .map_or_else(|| vec![model_id.clone()], manifold_config::ModelIdSpec::ids);

                instances.push(Arc::new(ProviderInstance::new(
                    provider_name.clone(),
                    model_id.clone(),
                    binding.priority,
                    binding.max_retries,
                    Arc::clone(&provider_translators[provider_name]),
                    budget,
                    binding.credit_pricing(),
                    rotator,
                    upstream_models,
                    Arc::clone(&clock),
                )));
            }

            instances.sort_by_key(|instance| instance.priority());

            models.insert(
                model_id.clone(),
                RegistryModel {
                    created: model.created,
                    owned_by: model.owned_by.clone(),
                    instances,
                },
            );
        }

        Ok(Self {
            models,
            trackers,
            store: MetricsStore::new(metrics_path),
        })
    }

    /// Instances for a model, best health score first
    ///
    /// Scores are snapshotted before sorting; ties fall back to the
    /// configured priority.
    pub fn lookup(&self, model_id: &str) -> Option<Vec<Arc<ProviderInstance>>> {
        let model = self.models.get(model_id)?;
        let mut scored: Vec<(f64, Arc<ProviderInstance>)> = model
            .instances
            .iter()
            .map(|instance| (instance.health_score(), Arc::clone(instance)))
            .collect();
        scored.sort_by(|(score_a, a), (score_b, b)| {
            score_b
                .partial_cmp(score_a)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.priority().cmp(&b.priority()))
        });
        Some(scored.into_iter().map(|(_, instance)| instance).collect())
    }

    /// Model cards for `GET /v1/models`, in configuration order
    pub fn model_cards(&self) -> Vec<ModelCard> {
        self.models
            .iter()
            .map(|(id, model)| ModelCard {
                id: id.clone(),
                object: "model",
                created: model.created,
                owned_by: model.owned_by.clone(),
            })
            .collect()
    }

    /// Per-model, per-instance stats for `GET /v1/providers/stats`
    pub fn stats(&self) -> serde_json::Value {
        let mut models = serde_json::Map::new();
        for (model_id, model) in &self.models {
            let mut instances = serde_json::Map::new();
            for instance in &model.instances {
                let stats = serde_json::to_value(instance.stats()).unwrap_or_default();
                instances.insert(instance.name().to_owned(), stats);
            }
            models.insert(model_id.clone(), serde_json::Value::Object(instances));
        }
        serde_json::Value::Object(models)
    }

    /// Assemble a point-in-time snapshot (copy-then-serialize)
    pub fn snapshot(&self) -> MetricsSnapshot {
        let mut snapshot = MetricsSnapshot::default();
        for (model_id, model) in &self.models {
            for instance in &model.instances {
                snapshot
                    .instances
                    .insert(format!("{model_id}::{}", instance.name()), instance.snapshot());
            }
        }
        for ((provider, key_index), tracker) in &self.trackers {
            snapshot
                .credits
                .insert(format!("{provider}::{key_index}"), tracker.snapshot());
        }
        snapshot
    }

    /// Best-effort restore from a loaded snapshot
    pub fn restore(&self, snapshot: &MetricsSnapshot) {
        for (model_id, model) in &self.models {
            for instance in &model.instances {
                let key = format!("{model_id}::{}", instance.name());
                if let Some(saved) = snapshot.instances.get(&key) {
                    instance.restore(saved);
                }
            }
        }
        for ((provider, key_index), tracker) in &self.trackers {
            let key = format!("{provider}::{key_index}");
            if let Some(saved) = snapshot.credits.get(&key) {
                tracker.restore(saved);
            }
        }
    }

    /// Write the current snapshot to disk
    pub fn save_metrics(&self) {
        let snapshot = self.snapshot();
        self.store.save(&snapshot);
    }

    /// Load and apply the last snapshot; missing file is a cold start
    pub fn load_metrics(&self) {
        let snapshot = self.store.load();
        if !snapshot.instances.is_empty() || !snapshot.credits.is_empty() {
            tracing::info!(
                path = %self.store.path().display(),
                instances = snapshot.instances.len(),
                "restored metrics snapshot"
            );
        }
        self.restore(&snapshot);
    }
}
