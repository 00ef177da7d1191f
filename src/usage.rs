//! Per-request usage records.
//!
//! One [`UsageRecord`] is emitted for every request that reached a lane,
//! whatever its outcome. Where it goes (billing, analytics, a log) is up to
//! the [`UsageSink`].

use crate::lane::Lane;
use chrono::{DateTime, Utc};
use serde::Serialize;
use sha2::{Digest, Sha256};
use uuid::Uuid;

/// Short, non-reversible identifier for an API key, safe to log.
pub fn fingerprint(api_key_id: &str) -> String {
    let digest = Sha256::digest(api_key_id.as_bytes());
    hex::encode(&digest[..6])
}

/// Usage of one request.
#[derive(Debug, Clone, Serialize)]
pub struct UsageRecord {
    /// Request correlation id
    pub request_id: Uuid,
    /// Fingerprint of the API key (never the raw id)
    pub api_key_fingerprint: String,
    /// Lane the request ran in
    pub lane: Lane,
    /// Characters of input text
    pub chars: usize,
    /// End-to-end gateway time
    pub duration_ms: u64,
    /// Served from cache
    pub cache_hit: bool,
    /// `"ok"` or the error kind
    pub outcome: &'static str,
    /// Wall-clock completion time
    pub recorded_at: DateTime<Utc>,
}

/// Destination for usage records. Must not block.
pub trait UsageSink: Send + Sync {
    /// Accept one record.
    fn record(&self, record: &UsageRecord);
}

/// Emits usage records as structured `tracing` events.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingUsageSink;

impl UsageSink for TracingUsageSink {
    fn record(&self, record: &UsageRecord) {
        tracing::info!(
            target: "lanegate::usage",
            request_id = %record.request_id,
            api_key = %record.api_key_fingerprint,
            lane = %record.lane,
            chars = record.chars,
            duration_ms = record.duration_ms,
            cache_hit = record.cache_hit,
            outcome = record.outcome,
            "usage"
        );
    }
}
