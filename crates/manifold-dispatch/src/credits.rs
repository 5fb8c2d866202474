//! Calendar-window credit accounting
//!
//! Each [`CreditWindow`] is a capped token bucket whose refills land
//! exactly on UTC boundaries: the top of the minute/hour, 00:00:00 for
//! days, and the 1st at 00:00:00 for months. Balances may go negative
//! transiently (post-flight commits are never rejected); refills then
//! work the balance back up toward the cap.

use chrono::{DateTime, Datelike, Months, TimeZone, Utc};
use manifold_config::{CreditPricing, Window};
use serde::{Deserialize, Serialize};

/// Floor a wall timestamp to the start of its window period (UTC)
pub fn align_to_boundary(window: Window, wall_secs: f64) -> i64 {
    let secs = wall_secs.floor() as i64;
    match window {
        Window::Minute => secs - secs.rem_euclid(60),
        Window::Hour => secs - secs.rem_euclid(3_600),
        Window::Day => secs - secs.rem_euclid(86_400),
        Window::Month => {
            let dt = utc(secs);
            let start = Utc
                .with_ymd_and_hms(dt.year(), dt.month(), 1, 0, 0, 0)
                .single()
                .unwrap_or(dt);
            start.timestamp()
        }
    }
}

/// The boundary following `boundary_secs` (which must itself be aligned)
pub fn next_boundary(window: Window, boundary_secs: i64) -> i64 {
    match window {
        Window::Minute => boundary_secs + 60,
        Window::Hour => boundary_secs + 3_600,
        Window::Day => boundary_secs + 86_400,
        Window::Month => {
            let dt = utc(boundary_secs);
            (dt + Months::new(1)).timestamp()
        }
    }
}

fn utc(secs: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(secs, 0)
        .single()
        .unwrap_or_else(|| Utc.timestamp_opt(0, 0).single().expect("epoch is valid"))
}

/// Persistable state of one credit window
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct CreditWindowSnapshot {
    pub balance: f64,
    pub last_reset_at: i64,
}

/// One calendar-aligned credit bucket
#[derive(Debug, Clone)]
pub struct CreditWindow {
    window: Window,
    balance: f64,
    last_reset_at: i64,
    gain_per_period: f64,
    max_balance: f64,
}

impl CreditWindow {
    /// A window starting full at the boundary containing `wall_secs`
    pub fn new(window: Window, gain_per_period: f64, max_balance: f64, wall_secs: f64) -> Self {
        Self {
            window,
            balance: max_balance,
            last_reset_at: align_to_boundary(window, wall_secs),
            gain_per_period,
            max_balance,
        }
    }

    pub const fn window(&self) -> Window {
        self.window
    }

    pub const fn balance(&self) -> f64 {
        self.balance
    }

    pub const fn max_balance(&self) -> f64 {
        self.max_balance
    }

    /// Advance through every boundary elapsed by `wall_secs`, applying
    /// the capped refill at each
    ///
    /// Per-boundary application of `min(balance + gain, max)` collapses
    /// to a single clamped add, so catching up after idle periods is
    /// O(1) for fixed-width windows and O(months) for month windows.
    pub fn advance(&mut self, wall_secs: f64) {
        let now = wall_secs.floor() as i64;
        match self.window {
            Window::Month => {
                let mut boundary = next_boundary(self.window, self.last_reset_at);
                while boundary <= now {
                    self.balance = (self.balance + self.gain_per_period).min(self.max_balance);
                    self.last_reset_at = boundary;
                    boundary = next_boundary(self.window, boundary);
                }
            }
            _ => {
                let width = self.window.seconds() as i64;
                let current = align_to_boundary(self.window, wall_secs);
                let periods = (current - self.last_reset_at) / width;
                if periods > 0 {
                    self.balance = (self.balance + periods as f64 * self.gain_per_period).min(self.max_balance);
                    self.last_reset_at = current;
                }
            }
        }
    }

    /// Whether the balance covers `charge`
    pub fn permits(&self, charge: f64) -> bool {
        self.balance >= charge
    }

    /// Deduct `charge`; the balance may go negative
    pub fn commit(&mut self, charge: f64) {
        self.balance -= charge;
    }

    /// Seconds until the next refill boundary
    pub fn retry_after(&self, wall_secs: f64) -> f64 {
        let next = next_boundary(self.window, align_to_boundary(self.window, wall_secs));
        (next as f64 - wall_secs).max(0.0)
    }

    pub fn snapshot(&self) -> CreditWindowSnapshot {
        CreditWindowSnapshot {
            balance: self.balance,
            last_reset_at: self.last_reset_at,
        }
    }

    /// Restore persisted balance and reset position
    pub fn restore(&mut self, snapshot: &CreditWindowSnapshot) {
        self.balance = snapshot.balance.min(self.max_balance);
        self.last_reset_at = align_to_boundary(self.window, snapshot.last_reset_at as f64);
    }
}

/// Token-derived credit cost of a completed request
///
/// The flat per-request price is charged pre-flight and is not part of
/// this sum.
pub fn token_credit_cost(pricing: &CreditPricing, prompt_tokens: f64, completion_tokens: f64) -> f64 {
    let tokens = prompt_tokens + completion_tokens;
    prompt_tokens * pricing.per_token
        + completion_tokens * pricing.per_token
        + (tokens / 1_000_000.0) * pricing.per_million_tokens
}
