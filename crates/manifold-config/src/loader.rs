use std::path::Path;

use crate::budget::BudgetSpec;
use crate::Config;

impl Config {
    /// Load configuration from a YAML file
    ///
    /// Reads the file, expands `${VAR}` placeholders, then deserializes
    /// and validates the result.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, environment variable
    /// expansion fails, YAML parsing fails, or validation fails
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("failed to read config file {}: {e}", path.display()))?;

        Self::parse(&raw)
    }

    /// Parse and validate configuration from a raw YAML string
    pub fn parse(raw: &str) -> anyhow::Result<Self> {
        let expanded =
            crate::env::expand_env(raw).map_err(|e| anyhow::anyhow!("config variable expansion failed: {e}"))?;

        let config: Self =
            serde_yaml::from_str(&expanded).map_err(|e| anyhow::anyhow!("failed to parse config: {e}"))?;

        config.validate()?;

        Ok(config)
    }

    /// Validate that the configuration is internally consistent
    ///
    /// # Errors
    ///
    /// Returns an error if a model references an unknown provider, a
    /// binding resolves to an empty credential pool, a budget key is
    /// unrecognized, or a multiplier is non-positive
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.providers.is_empty() {
            anyhow::bail!("at least one provider must be configured");
        }
        if self.models.is_empty() {
            anyhow::bail!("at least one model must be configured");
        }

        for (name, provider) in &self.providers {
            if provider.timeout == 0 {
                anyhow::bail!("provider '{name}' timeout must be greater than 0");
            }
            BudgetSpec::from_raw(&provider.rate_limits)
                .map_err(|e| anyhow::anyhow!("provider '{name}': {e}"))?;

            for (window, gain, max) in provider.credit_accrual().iter() {
                if gain <= 0.0 {
                    anyhow::bail!("provider '{name}' credits_gain_per_{} must be positive", window.as_str());
                }
                if max < gain {
                    anyhow::bail!(
                        "provider '{name}' credits_max_per_{} must not be below the gain",
                        window.as_str()
                    );
                }
            }
        }

        for (model_id, model) in &self.models {
            if model.providers.is_empty() {
                anyhow::bail!("model '{model_id}' must bind at least one provider");
            }

            for (provider_name, binding) in &model.providers {
                let Some(provider) = self.providers.get(provider_name) else {
                    anyhow::bail!("model '{model_id}' references unknown provider '{provider_name}'");
                };

                let keys = if binding.key_override().is_empty() {
                    provider.keys()
                } else {
                    binding.key_override()
                };
                if keys.is_empty() {
                    anyhow::bail!(
                        "model '{model_id}' provider '{provider_name}' has no API keys (set api_key or api_keys)"
                    );
                }

                BudgetSpec::from_raw(&binding.rate_limits)
                    .map_err(|e| anyhow::anyhow!("model '{model_id}' provider '{provider_name}': {e}"))?;

                if binding.multiplier <= 0.0 || binding.token_multiplier <= 0.0 || binding.request_multiplier <= 0.0 {
                    anyhow::bail!("model '{model_id}' provider '{provider_name}': multipliers must be positive");
                }
                if binding.max_retries == 0 {
                    anyhow::bail!("model '{model_id}' provider '{provider_name}': max_retries must be at least 1");
                }
                if let Some(spec) = &binding.model_id
                    && spec.ids().is_empty()
                {
                    anyhow::bail!("model '{model_id}' provider '{provider_name}': model_id list must not be empty");
                }
            }
        }

        Ok(())
    }
}
