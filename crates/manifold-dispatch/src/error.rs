//! Errors that escape the dispatch loop
//!
//! Transient per-attempt failures stay inside the loop; only unknown
//! models and total capacity exhaustion surface to the caller, carrying
//! the last observed reason for the 503 payload.

use http::StatusCode;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DispatchError {
    /// No registered model matches the requested id
    #[error("model not found: {model}")]
    UnknownModel { model: String },

    /// Every ranked instance skipped (breaker open or no usable key)
    #[error("no capacity available: {reason}")]
    NoCapacity { reason: String },

    /// Every attempt failed upstream
    #[error("all providers failed: {last_error}")]
    Exhausted { last_error: String },
}

impl DispatchError {
    pub const fn status_code(&self) -> StatusCode {
        match self {
            Self::UnknownModel { .. } => StatusCode::NOT_FOUND,
            Self::NoCapacity { .. } | Self::Exhausted { .. } => StatusCode::SERVICE_UNAVAILABLE,
        }
    }

    /// OpenAI-style `error.type` value
    pub const fn error_type(&self) -> &'static str {
        match self {
            Self::UnknownModel { .. } => "not_found_error",
            Self::NoCapacity { .. } | Self::Exhausted { .. } => "service_unavailable_error",
        }
    }
}
