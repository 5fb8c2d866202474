//! Response-time tracking and the durable metrics snapshot
//!
//! Each instance owns a [`MetricsSlot`]: a rolling window of the last
//! 100 response durations plus monotonic counters. The
//! [`MetricsStore`] serializes a point-in-time copy of every slot to
//! `metrics/provider_metrics.json`; the request path never blocks on
//! the writer.

use std::collections::{BTreeMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::breaker::BreakerState;
use crate::tracker::TrackerSnapshot;

/// Response durations retained per instance
const RESPONSE_WINDOW: usize = 100;

/// Rolling window of response times with avg and p95 on demand
///
/// A restored snapshot seeds avg/p95 until the first live sample; the
/// sample buffer itself is never persisted.
#[derive(Debug, Default)]
pub struct ResponseWindow {
    samples: VecDeque<f64>,
    restored: Option<(f64, f64)>,
}

impl ResponseWindow {
    pub fn record(&mut self, seconds: f64) {
        self.restored = None;
        self.samples.push_back(seconds);
        while self.samples.len() > RESPONSE_WINDOW {
            self.samples.pop_front();
        }
    }

    pub fn avg(&self) -> f64 {
        if self.samples.is_empty() {
            return self.restored.map_or(0.0, |(avg, _)| avg);
        }
        self.samples.iter().sum::<f64>() / self.samples.len() as f64
    }

    pub fn p95(&self) -> f64 {
        if self.samples.is_empty() {
            return self.restored.map_or(0.0, |(_, p95)| p95);
        }
        let mut sorted: Vec<f64> = self.samples.iter().copied().collect();
        sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
        let idx = (sorted.len() as f64 * 0.95) as usize;
        sorted.get(idx).copied().unwrap_or_else(|| sorted[sorted.len() - 1])
    }

    pub fn seed(&mut self, avg: f64, p95: f64) {
        if self.samples.is_empty() {
            self.restored = Some((avg, p95));
        }
    }
}

/// Per-instance response window, failure timestamp, and counters
#[derive(Debug, Default)]
pub struct MetricsSlot {
    inner: Mutex<SlotInner>,
    requests: AtomicU64,
    errors: AtomicU64,
    prompt_tokens: AtomicU64,
    completion_tokens: AtomicU64,
}

#[derive(Debug, Default)]
struct SlotInner {
    window: ResponseWindow,
    credits_spent: f64,
    last_failure_at: Option<f64>,
}

impl MetricsSlot {
    pub fn record_success(&self, duration: Duration, prompt_tokens: u64, completion_tokens: u64, credits: f64) {
        self.requests.fetch_add(1, Ordering::Relaxed);
        self.prompt_tokens.fetch_add(prompt_tokens, Ordering::Relaxed);
        self.completion_tokens.fetch_add(completion_tokens, Ordering::Relaxed);

        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.window.record(duration.as_secs_f64());
        inner.credits_spent += credits;
    }

    pub fn record_failure(&self, wall_secs: f64) {
        self.requests.fetch_add(1, Ordering::Relaxed);
        self.errors.fetch_add(1, Ordering::Relaxed);
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.last_failure_at = Some(wall_secs);
    }

    pub fn avg_response_seconds(&self) -> f64 {
        self.inner.lock().unwrap_or_else(|e| e.into_inner()).window.avg()
    }

    pub fn p95_response_seconds(&self) -> f64 {
        self.inner.lock().unwrap_or_else(|e| e.into_inner()).window.p95()
    }

    pub fn last_failure_at(&self) -> Option<f64> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner()).last_failure_at
    }

    pub fn request_count(&self) -> u64 {
        self.requests.load(Ordering::Relaxed)
    }

    pub fn error_count(&self) -> u64 {
        self.errors.load(Ordering::Relaxed)
    }

    pub fn token_totals(&self) -> (u64, u64) {
        (
            self.prompt_tokens.load(Ordering::Relaxed),
            self.completion_tokens.load(Ordering::Relaxed),
        )
    }

    pub fn credits_spent(&self) -> f64 {
        self.inner.lock().unwrap_or_else(|e| e.into_inner()).credits_spent
    }

    /// Seed restored latency figures and failure timestamp
    pub fn restore(&self, avg: f64, p95: f64, last_failure_at: Option<f64>) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.window.seed(avg, p95);
        inner.last_failure_at = last_failure_at;
    }
}

/// Persisted per-instance metrics, keyed `"{model_id}::{instance_name}"`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstanceSnapshot {
    pub consecutive_failures: u32,
    pub last_failure_at: Option<f64>,
    pub circuit_state: BreakerState,
    pub avg_response_seconds: f64,
    pub p95_response_seconds: f64,
}

/// The durable snapshot: instance metrics plus per-key credit state
/// keyed `"{instance_name}::{key_index}"`
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    #[serde(default)]
    pub instances: BTreeMap<String, InstanceSnapshot>,
    #[serde(default)]
    pub credits: BTreeMap<String, TrackerSnapshot>,
}

/// Reads and writes the snapshot file
pub struct MetricsStore {
    path: PathBuf,
    io: Mutex<()>,
}

impl MetricsStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            io: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the last snapshot; missing or malformed files are a cold start
    pub fn load(&self) -> MetricsSnapshot {
        let _io = self.io.lock().unwrap_or_else(|e| e.into_inner());
        let raw = match std::fs::read_to_string(&self.path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return MetricsSnapshot::default(),
            Err(e) => {
                tracing::warn!(path = %self.path.display(), error = %e, "failed to read metrics snapshot");
                return MetricsSnapshot::default();
            }
        };

        match serde_json::from_str(&raw) {
            Ok(snapshot) => snapshot,
            Err(e) => {
                tracing::warn!(
                    path = %self.path.display(),
                    error = %e,
                    "malformed metrics snapshot, starting cold"
                );
                MetricsSnapshot::default()
            }
        }
    }

    /// Write a snapshot; callers assemble the copy first so no request
    /// state lock is held during serialization
    pub fn save(&self, snapshot: &MetricsSnapshot) {
        let _io = self.io.lock().unwrap_or_else(|e| e.into_inner());

        if let Some(parent) = self.path.parent()
            && !parent.as_os_str().is_empty()
            && let Err(e) = std::fs::create_dir_all(parent)
        {
            tracing::error!(path = %parent.display(), error = %e, "failed to create metrics directory");
            return;
        }

        let serialized = match serde_json::to_string_pretty(snapshot) {
            Ok(s) => s,
            Err(e) => {
                tracing::error!(error = %e, "failed to serialize metrics snapshot");
                return;
            }
        };

        if let Err(e) = std::fs::write(&self.path, serialized) {
            tracing::error!(path = %self.path.display(), error = %e, "failed to write metrics snapshot");
        }
    }
}
