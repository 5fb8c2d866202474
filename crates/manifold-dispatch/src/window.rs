//! Sliding-window usage accounting
//!
//! One [`SlidingWindow`] holds the sample log for a single metric.
//! Samples expire once they age past the widest window configured for
//! that metric, and per-window sums are computed on demand. The log
//! keeps at most [`SAMPLE_CAP`] entries; when the cap engages the
//! oldest samples are dropped and usage becomes an undercount — an
//! intentional memory/accuracy trade-off for very high request rates.

use std::collections::VecDeque;
use std::time::Duration;

/// Maximum retained samples per metric
pub const SAMPLE_CAP: usize = 4_000;

/// Time-ordered (timestamp, amount) sample log for one metric
#[derive(Debug)]
pub struct SlidingWindow {
    samples: VecDeque<(Duration, f64)>,
    horizon: Duration,
}

impl SlidingWindow {
    /// A window whose samples expire after `horizon_secs`
    ///
    /// The horizon is the widest window any budget configures for this
    /// metric; a zero horizon retains nothing.
    pub fn new(horizon_secs: u64) -> Self {
        Self {
            samples: VecDeque::new(),
            horizon: Duration::from_secs(horizon_secs),
        }
    }

    /// Record a sample at monotonic time `now`
    pub fn record(&mut self, now: Duration, amount: f64) {
        if amount == 0.0 || self.horizon.is_zero() {
            return;
        }
        self.expire(now);
        self.samples.push_back((now, amount));
        while self.samples.len() > SAMPLE_CAP {
            self.samples.pop_front();
        }
    }

    /// Drop samples older than the metric's widest configured window
    pub fn expire(&mut self, now: Duration) {
        while let Some(&(ts, _)) = self.samples.front() {
            if ts + self.horizon <= now {
                self.samples.pop_front();
            } else {
                break;
            }
        }
    }

    /// Sum of amounts within the trailing `window_secs`
    ///
    /// A sample is live while `timestamp + window > now`.
    pub fn sum_within(&self, now: Duration, window_secs: u64) -> f64 {
        let window = Duration::from_secs(window_secs);
        self.samples
            .iter()
            .rev()
            .take_while(|(ts, _)| *ts + window > now)
            .map(|(_, amount)| amount)
            .sum()
    }

    /// Seconds until the oldest in-window sample ages out
    ///
    /// `None` when no sample lies within the window (the denial can only
    /// come from the pending charge itself).
    pub fn retry_after(&self, now: Duration, window_secs: u64) -> Option<f64> {
        let window = Duration::from_secs(window_secs);
        let (oldest, _) = self.samples.iter().find(|(ts, _)| *ts + window > now)?;
        Some((*oldest + window).saturating_sub(now).as_secs_f64())
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.samples.len()
    }
}
