//! Exponential backoff between retries on one provider instance

use std::time::Duration;

const BASE_DELAY: Duration = Duration::from_secs(1);
const MAX_DELAY: Duration = Duration::from_secs(300);

/// `min(base * 2^attempt, cap)` delay schedule
///
/// The attempt index restarts at zero for every client request, so a
/// successful attempt implicitly resets the schedule.
#[derive(Debug, Clone, Copy)]
pub struct ExponentialBackoff {
    base: Duration,
    cap: Duration,
}

impl Default for ExponentialBackoff {
    fn default() -> Self {
        Self {
            base: BASE_DELAY,
            cap: MAX_DELAY,
        }
    }
}

impl ExponentialBackoff {
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
        self.base.saturating_mul(factor).min(self.cap)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn doubles_per_attempt() {
        let backoff = ExponentialBackoff::default();
        assert_eq!(backoff.delay(0), Duration::from_secs(1));
        assert_eq!(backoff.delay(1), Duration::from_secs(2));
        assert_eq!(backoff.delay(2), Duration::from_secs(4));
        assert_eq!(backoff.delay(5), Duration::from_secs(32));
    }

    #[test]
    fn caps_at_max_delay() {
        let backoff = ExponentialBackoff::default();
        assert_eq!(backoff.delay(9), Duration::from_secs(300));
        assert_eq!(backoff.delay(40), Duration::from_secs(300));
    }

    #[test]
    fn delays_are_monotonic_up_to_the_cap() {
        let backoff = ExponentialBackoff::default();
        for attempt in 0..20 {
            assert!(backoff.delay(attempt + 1) >= backoff.delay(attempt));
        }
    }
}
