use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

use parking_lot::Mutex;
use serde::Serialize;
use utoipa::ToSchema;

/// Bucket upper bounds, milliseconds. The final implicit bucket is +inf.
const LATENCY_BUCKETS_MS: [u64; 11] = [5, 10, 25, 50, 100, 250, 500, 1000, 2500, 5000, 10000];

#[derive(Debug, Default)]
struct HistogramInner {
    buckets: [u64; LATENCY_BUCKETS_MS.len() + 1],
    count: u64,
    sum_ms: u64,
}

/// Fixed-bucket latency histogram.
#[derive(Debug, Default)]
pub struct Histogram {
    inner: Mutex<HistogramInner>,
}

impl Histogram {
    pub fn observe_ms(&self, value_ms: u64) {
        let mut inner = self.inner.lock();
        let idx = LATENCY_BUCKETS_MS
            .iter()
            .position(|&bound| value_ms <= bound)
            .unwrap_or(LATENCY_BUCKETS_MS.len());
        inner.buckets[idx] += 1;
        inner.count += 1;
        inner.sum_ms += value_ms;
    }

    fn snapshot(&self) -> HistogramSnapshot {
        let inner = self.inner.lock();
        HistogramSnapshot {
            buckets_ms: LATENCY_BUCKETS_MS
                .iter()
                .copied()
                .zip(inner.buckets.iter().copied())
                .map(|(le, count)| BucketSnapshot { le, count })
                .collect(),
            overflow: inner.buckets[LATENCY_BUCKETS_MS.len()],
            count: inner.count,
            sum_ms: inner.sum_ms,
            avg_ms: if inner.count > 0 {
                inner.sum_ms as f64 / inner.count as f64
            } else {
                0.0
            },
        }
    }
}

#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct BucketSnapshot {
    pub le: u64,
    pub count: u64,
}

#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct HistogramSnapshot {
    pub buckets_ms: Vec<BucketSnapshot>,
    pub overflow: u64,
    pub count: u64,
    pub sum_ms: u64,
    pub avg_ms: f64,
}

/// In-process metrics registry. Cheap to clone and share; snapshots feed
/// `/metrics` and the admin stats endpoint.
#[derive(Clone, Default)]
pub struct Metrics {
    inner: Arc<MetricsInner>,
}

#[derive(Default)]
struct MetricsInner {
    requests_total: AtomicU64,
    requests_by_status: Mutex<HashMap<String, u64>>,
    requests_by_tool: Mutex<HashMap<String, u64>>,
    cache_hits: AtomicU64,
    cache_misses: AtomicU64,
    breaker_transitions: AtomicU64,
    queue_wait: Histogram,
    upstream_latency: Histogram,
    queue_depth: AtomicI64,
    active_sessions: AtomicI64,
    cache_entries: AtomicI64,
    breaker_states: Mutex<HashMap<String, String>>,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_request(&self, tool: &str, status: &str) {
        self.inner.requests_total.fetch_add(1, Ordering::Relaxed);
        *self
            .inner
            .requests_by_status
            .lock()
            .entry(status.to_string())
            .or_insert(0) += 1;
        *self
            .inner
            .requests_by_tool
            .lock()
            .entry(tool.to_string())
            .or_insert(0) += 1;
    }

    pub fn record_cache_hit(&self) {
        self.inner.cache_hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_cache_miss(&self) {
        self.inner.cache_misses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_breaker_transition(&self, upstream: &str, state: &str) {
        self.inner.breaker_transitions.fetch_add(1, Ordering::Relaxed);
        self.inner
            .breaker_states
            .lock()
            .insert(upstream.to_string(), state.to_string());
    }

    pub fn observe_queue_wait_ms(&self, ms: u64) {
        self.inner.queue_wait.observe_ms(ms);
    }

    pub fn observe_upstream_latency_ms(&self, ms: u64) {
        self.inner.upstream_latency.observe_ms(ms);
    }

    pub fn set_queue_depth(&self, depth: i64) {
        self.inner.queue_depth.store(depth, Ordering::Relaxed);
    }

    pub fn set_active_sessions(&self, count: i64) {
        self.inner.active_sessions.store(count, Ordering::Relaxed);
    }

    pub fn set_cache_entries(&self, count: i64) {
        self.inner.cache_entries.store(count, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let hits = self.inner.cache_hits.load(Ordering::Relaxed);
        let misses = self.inner.cache_misses.load(Ordering::Relaxed);
        let lookups = hits + misses;

        MetricsSnapshot {
            requests_total: self.inner.requests_total.load(Ordering::Relaxed),
            requests_by_status: self.inner.requests_by_status.lock().clone(),
            requests_by_tool: self.inner.requests_by_tool.lock().clone(),
            cache_hits: hits,
            cache_misses: misses,
            cache_hit_rate: if lookups > 0 {
                hits as f64 / lookups as f64
            } else {
                0.0
            },
            breaker_transitions: self.inner.breaker_transitions.load(Ordering::Relaxed),
            breaker_states: self.inner.breaker_states.lock().clone(),
            queue_wait: self.inner.queue_wait.snapshot(),
            upstream_latency: self.inner.upstream_latency.snapshot(),
            queue_depth: self.inner.queue_depth.load(Ordering::Relaxed),
            active_sessions: self.inner.active_sessions.load(Ordering::Relaxed),
            cache_entries: self.inner.cache_entries.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct MetricsSnapshot {
    pub requests_total: u64,
    pub requests_by_status: HashMap<String, u64>,
    pub requests_by_tool: HashMap<String, u64>,
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub cache_hit_rate: f64,
    pub breaker_transitions: u64,
    pub breaker_states: HashMap<String, String>,
    pub queue_wait: HistogramSnapshot,
    pub upstream_latency: HistogramSnapshot,
    pub queue_depth: i64,
    pub active_sessions: i64,
    pub cache_entries: i64,
}
