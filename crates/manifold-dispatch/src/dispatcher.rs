//! The request loop
//!
//! Rank instances by health, visit at most [`RANKED_FANOUT`] of them,
//! and give each up to its configured retry budget. A skip (breaker
//! open, no usable key) moves straight to the next instance without
//! counting as a retry; failures back off exponentially before the next
//! attempt on the same instance.

use std::sync::Arc;

use manifold_translate::ChatRequest;

use crate::error::DispatchError;
use crate::instance::{Outcome, SkipReason};
use crate::registry::ModelRegistry;

/// Distinct provider instances visited per client request
pub const RANKED_FANOUT: usize = 2;

/// Executes requests against the registry
#[derive(Clone)]
pub struct Dispatcher {
    registry: Arc<ModelRegistry>,
}

impl Dispatcher {
    pub fn new(registry: Arc<ModelRegistry>) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &Arc<ModelRegistry> {
        &self.registry
    }

    /// Dispatch one chat-completion request
    ///
    /// # Errors
    ///
    /// `UnknownModel` when the id is not registered; `NoCapacity` when
    /// every visited instance skipped; `Exhausted` with the last
    /// upstream error when all attempts failed.
    pub async fn dispatch(&self, model: &str, request: &ChatRequest) -> Result<serde_json::Value, DispatchError> {
        let ranked = self
            .registry
            .lookup(model)
            .ok_or_else(|| DispatchError::UnknownModel {
                model: model.to_owned(),
            })?;

        let mut last_error: Option<String> = None;
        let mut last_skip = SkipReason::NoKey;

        for instance in ranked.iter().take(RANKED_FANOUT) {
            let mut attempt_idx: u32 = 0;

            while attempt_idx < instance.max_retries() {
                if attempt_idx > 0 {
                    tokio::time::sleep(instance.backoff_delay(attempt_idx - 1)).await;
                }

                match instance.attempt(request).await {
                    Outcome::Ok(response) => return Ok(response.body),
                    Outcome::Skip(reason) => {
                        tracing::debug!(
                            provider = %instance.name(),
                            model,
                            reason = reason.as_str(),
                            "instance skipped"
                        );
                        last_skip = reason;
                        break;
                    }
                    Outcome::Fail(error) => {
                        last_error = Some(error.to_string());
                        attempt_idx += 1;
                    }
                }
            }
        }

        match last_error {
            Some(last_error) => Err(DispatchError::Exhausted { last_error }),
            None => Err(DispatchError::NoCapacity {
                reason: last_skip.as_str().to_owned(),
            }),
        }
    }
}
