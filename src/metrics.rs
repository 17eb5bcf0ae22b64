// src/metrics.rs
//! Request resolution metrics
//!
//! Simple atomic counters for dispatch and caching statistics, shared by
//! every repository registered with a [`crate::RepositoryManager`].

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Resolution metrics collector
#[derive(Default)]
pub struct ServerMetrics {
    /// Requests entering through the registry
    requests_total: AtomicU64,
    /// Group dispatches answered by a member
    group_hits: AtomicU64,
    /// Group dispatches where no member succeeded
    group_misses: AtomicU64,
    /// Requests answered from a negative cache
    negative_hits: AtomicU64,
    /// Not-found statuses stored in a negative cache
    negative_stores: AtomicU64,
    /// Proxy requests served from fresh cached content
    proxy_cache_hits: AtomicU64,
    /// Fetches from a remote upstream
    upstream_fetches: AtomicU64,
    /// Upstream fetch errors
    upstream_errors: AtomicU64,
    /// Stale content served because the upstream failed
    stale_served: AtomicU64,
    /// Bytes served
    bytes_served: AtomicU64,
    /// Collector start time
    start_time: std::sync::OnceLock<Instant>,
}

impl ServerMetrics {
    /// Collector with its uptime clock started
    pub fn new() -> Self {
        let metrics = Self::default();
        let _ = metrics.start_time.set(Instant::now());
        metrics
    }

    pub fn record_request(&self) {
        self.requests_total.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a group dispatch that found content
    pub fn record_group_hit(&self) {
        self.group_hits.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a group dispatch that exhausted its members
    pub fn record_group_miss(&self) {
        self.group_misses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_negative_hit(&self) {
        self.negative_hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_negative_store(&self) {
        self.negative_stores.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_proxy_cache_hit(&self) {
        self.proxy_cache_hits.fetch_add(1, Ordering::Relaxed);
    }

    /// Record an upstream fetch attempt
    pub fn record_upstream_fetch(&self) {
        self.upstream_fetches.fetch_add(1, Ordering::Relaxed);
    }

    /// Record an upstream fetch error
    pub fn record_upstream_error(&self) {
        self.upstream_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_stale_served(&self) {
        self.stale_served.fetch_add(1, Ordering::Relaxed);
    }

    /// Add to the payload byte total
    pub fn record_bytes_served(&self, bytes: u64) {
        self.bytes_served.fetch_add(bytes, Ordering::Relaxed);
    }

    /// Point-in-time copy of every counter
    pub fn snapshot(&self) -> MetricsSnapshot {
        let uptime = self
            .start_time
            .get()
            .map(|t| t.elapsed())
            .unwrap_or(Duration::ZERO);

        let group_hits = self.group_hits.load(Ordering::Relaxed);
        let group_misses = self.group_misses.load(Ordering::Relaxed);
        let total = group_hits + group_misses;
        let group_hit_rate = if total > 0 {
            (group_hits as f64 / total as f64) * 100.0
        } else {
            0.0
        };
        let bytes_served = self.bytes_served.load(Ordering::Relaxed);

        MetricsSnapshot {
            requests_total: self.requests_total.load(Ordering::Relaxed),
            group_hits,
            group_misses,
            group_hit_rate,
            negative_hits: self.negative_hits.load(Ordering::Relaxed),
            negative_stores: self.negative_stores.load(Ordering::Relaxed),
            proxy_cache_hits: self.proxy_cache_hits.load(Ordering::Relaxed),
            upstream_fetches: self.upstream_fetches.load(Ordering::Relaxed),
            upstream_errors: self.upstream_errors.load(Ordering::Relaxed),
            stale_served: self.stale_served.load(Ordering::Relaxed),
            bytes_served,
            bytes_served_human: human_bytes(bytes_served),
            uptime_secs: uptime.as_secs(),
        }
    }
}

/// Serializable view of [`ServerMetrics`]
#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub requests_total: u64,
    pub group_hits: u64,
    pub group_misses: u64,
    /// Group hit rate percentage
    pub group_hit_rate: f64,
    pub negative_hits: u64,
    pub negative_stores: u64,
    pub proxy_cache_hits: u64,
    pub upstream_fetches: u64,
    pub upstream_errors: u64,
    pub stale_served: u64,
    pub bytes_served: u64,
    /// Human-readable bytes served
    pub bytes_served_human: String,
    pub uptime_secs: u64,
}

/// Render a byte count with a binary unit suffix, e.g. "2.00 KB"
fn human_bytes(bytes: u64) -> String {
    const UNITS: [&str; 3] = ["KB", "MB", "GB"];

    if bytes < 1024 {
        return format!("{bytes} B");
    }
    let mut value = bytes as f64 / 1024.0;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    format!("{value:.2} {}", UNITS[unit])
}
