//! Counters for the observability sink
//!
//! All counters are relaxed atomics owned by one `Coalescer`; the surrounding
//! service reads them through [`CoalescerMetrics::snapshot`].

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::time::Instant;

/// Upper bounds (inclusive, ms) of the generation latency buckets; the last
/// bucket is open-ended.
pub const LATENCY_BUCKETS_MS: [u64; 8] = [100, 250, 500, 1_000, 2_500, 5_000, 10_000, 30_000];

/// Fixed-bucket latency distribution
#[derive(Debug, Default)]
pub struct LatencyHistogram {
    buckets: [AtomicU64; LATENCY_BUCKETS_MS.len() + 1],
    count: AtomicU64,
    total_ms: AtomicU64,
    max_ms: AtomicU64,
}

impl LatencyHistogram {
    pub fn record(&self, latency: Duration) {
        let ms = latency.as_millis() as u64;
        let idx = LATENCY_BUCKETS_MS
            .iter()
            .position(|bound| ms <= *bound)
            .unwrap_or(LATENCY_BUCKETS_MS.len());
        self.buckets[idx].fetch_add(1, Ordering::Relaxed);
        self.count.fetch_add(1, Ordering::Relaxed);
        self.total_ms.fetch_add(ms, Ordering::Relaxed);
        self.max_ms.fetch_max(ms, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> LatencySnapshot {
        let count = self.count.load(Ordering::Relaxed);
        let total_ms = self.total_ms.load(Ordering::Relaxed);
        LatencySnapshot {
            bucket_bounds_ms: LATENCY_BUCKETS_MS.to_vec(),
            bucket_counts: self
                .buckets
                .iter()
                .map(|b| b.load(Ordering::Relaxed))
                .collect(),
            count,
            avg_ms: if count == 0 { 0 } else { total_ms / count },
            max_ms: self.max_ms.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LatencySnapshot {
    pub bucket_bounds_ms: Vec<u64>,
    /// One more entry than `bucket_bounds_ms`; the last one counts overflow
    pub bucket_counts: Vec<u64>,
    pub count: u64,
    pub avg_ms: u64,
    pub max_ms: u64,
}

/// Coalescing layer metrics
#[derive(Debug, Default)]
pub struct CoalescerMetrics {
    /// Resolves answered straight from the result cache
    pub cache_hits: AtomicU64,
    pub cache_misses: AtomicU64,
    /// Callers that created a record and ran the backend
    pub leaders: AtomicU64,
    /// Callers that attached to an existing record
    pub followers: AtomicU64,
    /// Sum of `request_count - 1` over completed records
    pub coalesced_calls_avoided: AtomicU64,
    pub executor_successes: AtomicU64,
    pub executor_failures: AtomicU64,
    pub waiter_timeouts: AtomicU64,
    pub rejected_requests: AtomicU64,
    pub invariant_violations: AtomicU64,
    pub generation_latency: LatencyHistogram,
}

impl CoalescerMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_cache_hit(&self) {
        self.cache_hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_cache_miss(&self) {
        self.cache_misses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_attach(&self, is_leader: bool) {
        if is_leader {
            self.leaders.fetch_add(1, Ordering::Relaxed);
        } else {
            self.followers.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Record a completed generation and the callers it served
    pub fn record_generation_completed(&self, latency: Duration, request_count: u64) {
        self.executor_successes.fetch_add(1, Ordering::Relaxed);
        self.coalesced_calls_avoided
            .fetch_add(request_count.saturating_sub(1), Ordering::Relaxed);
        self.generation_latency.record(latency);
    }

    pub fn record_generation_failed(&self, latency: Duration) {
        self.executor_failures.fetch_add(1, Ordering::Relaxed);
        self.generation_latency.record(latency);
    }

    pub fn record_waiter_timeout(&self) {
        self.waiter_timeouts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_rejected(&self) {
        self.rejected_requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_invariant_violation(&self) {
        self.invariant_violations.fetch_add(1, Ordering::Relaxed);
    }

    /// Get current metrics snapshot
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            cache_hits: self.cache_hits.load(Ordering::Relaxed),
            cache_misses: self.cache_misses.load(Ordering::Relaxed),
            leaders: self.leaders.load(Ordering::Relaxed),
            followers: self.followers.load(Ordering::Relaxed),
            coalesced_calls_avoided: self.coalesced_calls_avoided.load(Ordering::Relaxed),
            executor_successes: self.executor_successes.load(Ordering::Relaxed),
            executor_failures: self.executor_failures.load(Ordering::Relaxed),
            waiter_timeouts: self.waiter_timeouts.load(Ordering::Relaxed),
            rejected_requests: self.rejected_requests.load(Ordering::Relaxed),
            invariant_violations: self.invariant_violations.load(Ordering::Relaxed),
            generation_latency: self.generation_latency.snapshot(),
        }
    }
}

/// Snapshot of metrics at a point in time
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MetricsSnapshot {
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub leaders: u64,
    pub followers: u64,
    pub coalesced_calls_avoided: u64,
    pub executor_successes: u64,
    pub executor_failures: u64,
    pub waiter_timeouts: u64,
    pub rejected_requests: u64,
    pub invariant_violations: u64,
    pub generation_latency: LatencySnapshot,
}

impl MetricsSnapshot {
    /// Calculate cache hit ratio (0.0 to 1.0)
    pub fn hit_ratio(&self) -> f64 {
        let total = self.cache_hits + self.cache_misses;
        if total == 0 {
            0.0
        } else {
            self.cache_hits as f64 / total as f64
        }
    }

    /// Calculate executor failure rate (0.0 to 1.0)
    pub fn failure_rate(&self) -> f64 {
        let total = self.executor_successes + self.executor_failures;
        if total == 0 {
            0.0
        } else {
            self.executor_failures as f64 / total as f64
        }
    }

    pub fn to_json(&self) -> serde_json::Value {
        // MetricsSnapshot only holds integers and vectors of integers
        serde_json::to_value(self).unwrap_or(serde_json::Value::Null)
    }
}

/// Timer for measuring execution duration; follows tokio's clock so paused
/// test time is measured too
pub struct ExecutionTimer {
    start: Instant,
}

impl ExecutionTimer {
    /// Start a new timer
    pub fn start() -> Self {
        Self {
            start: Instant::now(),
        }
    }

    /// Get elapsed duration since timer started
    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }

    /// Stop timer and return duration
    pub fn stop(self) -> Duration {
        self.elapsed()
    }
}
