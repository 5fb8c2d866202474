//! Injectable time source
//!
//! Calendar boundaries use wall-clock UTC; sliding windows, cooldowns,
//! and breaker timers use monotonic time. Both come from one [`Clock`]
//! so tests can advance them together.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

/// A paired monotonic + wall-clock time source
pub trait Clock: Send + Sync {
    /// Seconds since the Unix epoch (UTC)
    fn wall_secs(&self) -> f64;

    /// Monotonic time since an arbitrary fixed origin
    fn mono(&self) -> Duration;
}

pub type SharedClock = Arc<dyn Clock>;

/// The process clock
pub struct SystemClock {
    origin: Instant,
}

impl SystemClock {
    pub fn new() -> Self {
        Self { origin: Instant::now() }
    }

    pub fn shared() -> SharedClock {
        Arc::new(Self::new())
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SystemClock {
    fn wall_secs(&self) -> f64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs_f64())
            .unwrap_or(0.0)
    }

    fn mono(&self) -> Duration {
        self.origin.elapsed()
    }
}

/// A clock driven by tests
///
/// `advance` moves both time bases in lockstep; `set_wall` repositions
/// the wall clock alone (e.g. to sit just before a calendar boundary).
pub struct ManualClock {
    state: Mutex<ManualState>,
}

struct ManualState {
    wall_secs: f64,
    mono: Duration,
}

impl ManualClock {
    pub fn new(wall_secs: f64) -> Self {
        Self {
            state: Mutex::new(ManualState {
                wall_secs,
                mono: Duration::ZERO,
            }),
        }
    }

    pub fn shared(wall_secs: f64) -> Arc<Self> {
        Arc::new(Self::new(wall_secs))
    }

    /// Move both time bases forward
    pub fn advance(&self, by: Duration) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.wall_secs += by.as_secs_f64();
        state.mono += by;
    }

    /// Reposition the wall clock without touching monotonic time
    pub fn set_wall(&self, wall_secs: f64) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.wall_secs = wall_secs;
    }
}

impl Clock for ManualClock {
    fn wall_secs(&self) -> f64 {
        self.state.lock().unwrap_or_else(|e| e.into_inner()).wall_secs
    }

    fn mono(&self) -> Duration {
        self.state.lock().unwrap_or_else(|e| e.into_inner()).mono
    }
}
