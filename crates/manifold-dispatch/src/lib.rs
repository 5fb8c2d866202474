//! Dispatch engine for the Manifold gateway
//!
//! Fans chat-completion requests across configured upstream instances:
//! per-credential sliding-window and calendar-window budgets, round-robin
//! key rotation with cooldowns, circuit breaking with exponential
//! backoff, health-scored instance ranking, and a durable metrics
//! snapshot.

#![allow(clippy::must_use_candidate, clippy::missing_errors_doc)]

pub mod backoff;
pub mod breaker;
pub mod clock;
pub mod credits;
pub mod dispatcher;
pub mod error;
pub mod instance;
pub mod metrics;
pub mod registry;
pub mod rotator;
pub mod tracker;
pub mod window;

pub use clock::{Clock, ManualClock, SharedClock, SystemClock};
pub use dispatcher::{Dispatcher, RANKED_FANOUT};
pub use error::DispatchError;
pub use instance::{Outcome, ProviderInstance, SkipReason};
pub use registry::{ModelCard, ModelRegistry};
pub use tracker::{BudgetDecision, BudgetTracker};
