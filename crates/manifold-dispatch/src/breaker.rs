//! Per-instance circuit breaker
//!
//! Closed admits everything; open rejects until the open duration
//! elapses (observed at the next permit call); half-open admits exactly
//! one probe at a time, gated by a one-permit semaphore released when
//! the probe's outcome is recorded.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::clock::SharedClock;

/// Consecutive failures that trip the breaker
const FAILURE_THRESHOLD: u32 = 5;

/// Half-open successes required to close
const SUCCESS_THRESHOLD: u32 = 2;

/// How long the breaker stays open before probing
pub const OPEN_DURATION: Duration = Duration::from_secs(60);

/// Breaker state, also the wire form in the metrics snapshot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

impl BreakerState {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Closed => "closed",
            Self::Open => "open",
            Self::HalfOpen => "half_open",
        }
    }
}

/// An admitted attempt; probes hold the half-open slot until dropped
#[derive(Debug)]
pub enum BreakerPermit {
    Through,
    Probe(#[allow(dead_code)] OwnedSemaphorePermit),
}

struct BreakerInner {
    state: BreakerState,
    consecutive_failures: u32,
    half_open_successes: u32,
    opened_at: Option<Duration>,
}

/// Three-state breaker guarding one provider instance
pub struct CircuitBreaker {
    clock: SharedClock,
    inner: Mutex<BreakerInner>,
    probe_slot: Arc<Semaphore>,
}

impl CircuitBreaker {
    pub fn new(clock: SharedClock) -> Self {
        Self {
            clock,
            inner: Mutex::new(BreakerInner {
                state: BreakerState::Closed,
                consecutive_failures: 0,
                half_open_successes: 0,
                opened_at: None,
            }),
            probe_slot: Arc::new(Semaphore::new(1)),
        }
    }

    /// Whether this attempt may proceed
    ///
    /// Open transitions to half-open here once the open duration has
    /// elapsed. In half-open, only the caller holding the probe permit
    /// proceeds; everyone else is rejected until the outcome lands.
    pub fn permit(&self) -> Option<BreakerPermit> {
        let now = self.clock.mono();
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());

        match inner.state {
            BreakerState::Closed => Some(BreakerPermit::Through),
            BreakerState::Open => {
                let elapsed = inner.opened_at.is_some_and(|at| now >= at + OPEN_DURATION);
                if !elapsed {
                    return None;
                }
                inner.state = BreakerState::HalfOpen;
                inner.half_open_successes = 0;
                self.try_probe()
            }
            BreakerState::HalfOpen => self.try_probe(),
        }
    }

    fn try_probe(&self) -> Option<BreakerPermit> {
        Arc::clone(&self.probe_slot)
            .try_acquire_owned()
            .ok()
            .map(BreakerPermit::Probe)
    }

    /// Record a successful attempt
    pub fn record_success(&self) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.consecutive_failures = 0;
        match inner.state {
            BreakerState::HalfOpen => {
                inner.half_open_successes += 1;
                if inner.half_open_successes >= SUCCESS_THRESHOLD {
                    inner.state = BreakerState::Closed;
                    inner.half_open_successes = 0;
                    inner.opened_at = None;
                }
            }
            BreakerState::Closed | BreakerState::Open => {}
        }
    }

    /// Record a failed attempt
    pub fn record_failure(&self) {
        let now = self.clock.mono();
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.consecutive_failures += 1;

        match inner.state {
            BreakerState::Closed => {
                if inner.consecutive_failures >= FAILURE_THRESHOLD {
                    inner.state = BreakerState::Open;
                    inner.opened_at = Some(now);
                }
            }
            BreakerState::HalfOpen => {
                inner.state = BreakerState::Open;
                inner.opened_at = Some(now);
                inner.half_open_successes = 0;
            }
            BreakerState::Open => {}
        }
    }

    pub fn state(&self) -> BreakerState {
        self.inner.lock().unwrap_or_else(|e| e.into_inner()).state
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.inner
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .consecutive_failures
    }

    /// Restore persisted breaker state
    ///
    /// A restored `open` breaker is stamped as opened now, so a full
    /// open duration elapses before the first probe.
    pub fn restore(&self, state: BreakerState, consecutive_failures: u32) {
        let now = self.clock.mono();
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.state = state;
        inner.consecutive_failures = consecutive_failures;
        inner.half_open_successes = 0;
        inner.opened_at = match state {
            BreakerState::Open => Some(now),
            _ => None,
        };
    }
}
