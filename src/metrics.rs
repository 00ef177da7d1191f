//! Observability read points.
//!
//! The gateway counts what happens per lane and exposes the counters as a
//! serializable snapshot. Formatting, scraping and shipping belong to
//! whatever sits outside the core.

use crate::admission::LaneLoad;
use crate::breaker::BreakerSnapshot;
use crate::cache::CacheStats;
use crate::lane::{Lane, PerLane};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Something worth counting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetricEvent {
    /// Request classified into the lane
    Request,
    /// Served from cache
    CacheHit,
    /// Not in cache
    CacheMiss,
    /// Rejected by the rate limiter
    RateLimited,
    /// Shed by admission (queue full)
    Shed,
    /// Gave up waiting in the queue
    QueueTimeout,
    /// Attached to an identical in-flight request
    SingleflightFollower,
    /// Rejected by an open breaker
    BreakerRejected,
    /// Backend invoked
    BackendCall,
    /// Backend returned an error
    BackendFailure,
    /// Backend exceeded the local timeout
    BackendTimeout,
    /// Watermark could not be applied
    WatermarkFailure,
    /// Request returned audio
    Completed,
    /// Request returned an error
    Failed,
}

#[derive(Default)]
struct LaneCounters {
    requests: AtomicU64,
    cache_hits: AtomicU64,
    cache_misses: AtomicU64,
    rate_limited: AtomicU64,
    shed: AtomicU64,
    queue_timeouts: AtomicU64,
    singleflight_followers: AtomicU64,
    breaker_rejected: AtomicU64,
    backend_calls: AtomicU64,
    backend_failures: AtomicU64,
    backend_timeouts: AtomicU64,
    watermark_failures: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
    latency_micros_sum: AtomicU64,
    latency_count: AtomicU64,
}

impl LaneCounters {
    fn counter(&self, event: MetricEvent) -> &AtomicU64 {
        match event {
            MetricEvent::Request => &self.requests,
            MetricEvent::CacheHit => &self.cache_hits,
            MetricEvent::CacheMiss => &self.cache_misses,
            MetricEvent::RateLimited => &self.rate_limited,
            MetricEvent::Shed => &self.shed,
            MetricEvent::QueueTimeout => &self.queue_timeouts,
            MetricEvent::SingleflightFollower => &self.singleflight_followers,
            MetricEvent::BreakerRejected => &self.breaker_rejected,
            MetricEvent::BackendCall => &self.backend_calls,
            MetricEvent::BackendFailure => &self.backend_failures,
            MetricEvent::BackendTimeout => &self.backend_timeouts,
            MetricEvent::WatermarkFailure => &self.watermark_failures,
            MetricEvent::Completed => &self.completed,
            MetricEvent::Failed => &self.failed,
        }
    }
}

/// Per-lane counters snapshot.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct LaneCountersSnapshot {
    pub requests: u64,
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub rate_limited: u64,
    pub shed: u64,
    pub queue_timeouts: u64,
    pub singleflight_followers: u64,
    pub breaker_rejected: u64,
    pub backend_calls: u64,
    pub backend_failures: u64,
    pub backend_timeouts: u64,
    pub watermark_failures: u64,
    pub completed: u64,
    pub failed: u64,
    /// Mean end-to-end latency in milliseconds, 0 before any request
    pub mean_latency_ms: f64,
}

/// Everything the gateway exposes for one lane.
#[derive(Debug, Clone, Serialize)]
pub struct LaneSnapshot {
    /// Event counters
    pub counters: LaneCountersSnapshot,
    /// Slot and queue gauges
    pub load: LaneLoad,
    /// Breaker state
    pub breaker: BreakerSnapshot,
}

/// Whole-gateway snapshot.
#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    /// Per-lane view
    pub lanes: BTreeMap<Lane, LaneSnapshot>,
    /// Shared cache counters
    pub cache: CacheStats,
    /// Cache hit rate over all reads
    pub cache_hit_rate: f64,
    /// Keys currently being computed
    pub singleflight_in_flight: usize,
    /// Live rate-limit buckets
    pub rate_limit_buckets: usize,
}

/// Lock-free per-lane counters.
#[derive(Default)]
pub struct GatewayMetrics {
    lanes: PerLane<LaneCounters>,
}

impl GatewayMetrics {
    /// Fresh, zeroed counters.
    pub fn new() -> Self {
        Self::default()
    }

    /// Count one `event` on `lane`.
    pub fn record(&self, lane: Lane, event: MetricEvent) {
        self.lanes
            .get(lane)
            .counter(event)
            .fetch_add(1, Ordering::Relaxed);
    }

    /// Record one end-to-end latency sample.
    pub fn observe_latency(&self, lane: Lane, elapsed: Duration) {
        let counters = self.lanes.get(lane);
        counters
            .latency_micros_sum
            .fetch_add(elapsed.as_micros() as u64, Ordering::Relaxed);
        counters.latency_count.fetch_add(1, Ordering::Relaxed);
    }

    /// Current value of one counter.
    pub fn get(&self, lane: Lane, event: MetricEvent) -> u64 {
        self.lanes.get(lane).counter(event).load(Ordering::Relaxed)
    }

    /// Snapshot of `lane`'s counters.
    pub fn lane_snapshot(&self, lane: Lane) -> LaneCountersSnapshot {
        let c = self.lanes.get(lane);
        let load = |counter: &AtomicU64| counter.load(Ordering::Relaxed);

        let count = load(&c.latency_count);
        let mean_latency_ms = if count == 0 {
            0.0
        } else {
            load(&c.latency_micros_sum) as f64 / count as f64 / 1_000.0
        };

        LaneCountersSnapshot {
            requests: load(&c.requests),
            cache_hits: load(&c.cache_hits),
            cache_misses: load(&c.cache_misses),
            rate_limited: load(&c.rate_limited),
            shed: load(&c.shed),
            queue_timeouts: load(&c.queue_timeouts),
            singleflight_followers: load(&c.singleflight_followers),
            breaker_rejected: load(&c.breaker_rejected),
            backend_calls: load(&c.backend_calls),
            backend_failures: load(&c.backend_failures),
            backend_timeouts: load(&c.backend_timeouts),
            watermark_failures: load(&c.watermark_failures),
            completed: load(&c.completed),
            failed: load(&c.failed),
            mean_latency_ms,
        }
    }
}
