//! Per-method dispatch metrics.
//!
//! Counters are plain atomics; latency samples go into a bounded ring
//! buffer per method, from which `system.metrics` derives percentiles.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use dashmap::DashMap;
use serde_json::json;

/// Ring buffer capacity for latency samples, per method.
const LATENCY_RING_CAP: usize = 512;

#[derive(Debug, Default)]
pub struct MethodMetrics {
    pub invocations: AtomicU64,
    pub errors: AtomicU64,
    pub cache_hits: AtomicU64,
    pub rate_limited: AtomicU64,
    latency_us: Mutex<VecDeque<u64>>,
}

impl MethodMetrics {
    pub fn record_latency(&self, elapsed: Duration) {
        let mut ring = self
            .latency_us
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        ring.push_back(elapsed.as_micros() as u64);
        while ring.len() > LATENCY_RING_CAP {
            ring.pop_front();
        }
    }

    /// Percentile (0..=100) over the current ring, in microseconds.
    pub fn latency_percentile(&self, pct: f64) -> Option<u64> {
        let ring = self
            .latency_us
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        if ring.is_empty() {
            return None;
        }
        let mut sorted: Vec<u64> = ring.iter().copied().collect();
        sorted.sort_unstable();
        let rank = ((pct / 100.0) * (sorted.len() - 1) as f64).round() as usize;
        Some(sorted[rank.min(sorted.len() - 1)])
    }

    pub fn sample_count(&self) -> usize {
        self.latency_us
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .len()
    }
}

/// Metrics for every registered method.
#[derive(Clone, Default)]
pub struct MetricsRegistry {
    methods: Arc<DashMap<String, Arc<MethodMetrics>>>,
}

impl MetricsRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn method(&self, name: &str) -> Arc<MethodMetrics> {
        self.methods
            .entry(name.to_string())
            .or_default()
            .clone()
    }

    /// JSON snapshot for `system.metrics`.
    pub fn snapshot(&self) -> serde_json::Value {
        let mut out = serde_json::Map::new();
        for entry in self.methods.iter() {
            let m = entry.value();
            out.insert(
                entry.key().clone(),
                json!({
                    "invocations": m.invocations.load(Ordering::Relaxed),
                    "errors": m.errors.load(Ordering::Relaxed),
                    "cache_hits": m.cache_hits.load(Ordering::Relaxed),
                    "rate_limited": m.rate_limited.load(Ordering::Relaxed),
                    "latency_us": {
                        "p50": m.latency_percentile(50.0),
                        "p95": m.latency_percentile(95.0),
                        "p99": m.latency_percentile(99.0),
                        "samples": m.sample_count(),
                    },
                }),
            );
        }
        serde_json::Value::Object(out)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
