//! Error taxonomy for the admission and synthesis gateway.
//!
//! Every rejection the gateway can produce is a [`GatewayError`]. Retryable
//! kinds carry an explicit retry hint; the gateway never retries backend work
//! internally, it hands the hint back to the caller.
//!
//! # Status mapping
//!
//! | Variant              | Status | Retryable |
//! |----------------------|--------|-----------|
//! | `RateLimited`        | 429    | yes       |
//! | `Backpressure`       | 503    | yes       |
//! | `QueueTimeout`       | 503    | yes       |
//! | `BackendUnavailable` | 503    | yes       |
//! | `SynthesisFailed`    | 502    | yes       |
//! | `BackendTimeout`     | 504    | yes       |
//! | `WatermarkFailed`    | 500    | no        |
//! | `UnknownLane`        | 403    | no        |
//! | `InvalidRequest`     | 400    | no        |
//! | `Cancelled`          | 499    | no        |

use std::time::Duration;
use thiserror::Error;

/// Result alias used across the crate.
pub type GatewayResult<T> = Result<T, GatewayError>;

/// Errors returned by [`crate::gateway::Gateway::synthesize`].
///
/// `Clone` because a singleflight leader's outcome is delivered to every
/// follower attached to the same cache key.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum GatewayError {
    /// Per-identity token bucket is empty.
    #[error("Rate limit exceeded, retry after {retry_after_secs}s")]
    RateLimited {
        /// Seconds until one token is available again
        retry_after_secs: u64,
    },

    /// All slots busy and the lane's wait queue is full.
    #[error("Lane at capacity, retry after {retry_after_secs}s")]
    Backpressure {
        /// Estimated seconds until the queue drains
        retry_after_secs: u64,
    },

    /// Request waited in the lane queue longer than the configured bound.
    #[error("Queued for {waited:?} without obtaining a slot")]
    QueueTimeout {
        /// How long the request waited
        waited: Duration,
        /// Estimated seconds until the queue drains
        retry_after_secs: u64,
    },

    /// Circuit breaker is open for this lane's backend.
    #[error("Synthesis backend unavailable, retry after {retry_after_secs}s")]
    BackendUnavailable {
        /// Seconds until the breaker admits a trial call
        retry_after_secs: u64,
    },

    /// Backend reported an error for this call.
    #[error("Synthesis failed: {reason}")]
    SynthesisFailed {
        /// Backend-provided reason (safe for logging)
        reason: String,
        /// Breaker cool-down left, or the lane's drain estimate
        retry_after_secs: u64,
    },

    /// Backend call exceeded the lane's local timeout.
    #[error("Synthesis backend timed out after {elapsed:?}")]
    BackendTimeout {
        /// Time spent waiting on the backend
        elapsed: Duration,
        /// Breaker cool-down left, or the lane's drain estimate
        retry_after_secs: u64,
    },

    /// Output could not be watermarked on a lane that requires it.
    #[error("Watermark enforcement failed: {reason}")]
    WatermarkFailed {
        /// Failure details
        reason: String,
    },

    /// Upstream identity resolution produced a plan tag with no lane.
    #[error("Unknown plan '{plan}', no lane configured")]
    UnknownLane {
        /// The unrecognized plan tag
        plan: String,
    },

    /// Request failed validation before admission.
    #[error("Invalid request: {reason}")]
    InvalidRequest {
        /// What was wrong with the request
        reason: String,
    },

    /// Caller went away before a result was produced.
    #[error("Request cancelled by caller")]
    Cancelled,
}

impl GatewayError {
    /// HTTP-style status code for this error.
    pub fn status_code(&self) -> u16 {
        match self {
            GatewayError::RateLimited { .. } => 429,
            GatewayError::Backpressure { .. } => 503,
            GatewayError::QueueTimeout { .. } => 503,
            GatewayError::BackendUnavailable { .. } => 503,
            GatewayError::SynthesisFailed { .. } => 502,
            GatewayError::BackendTimeout { .. } => 504,
            GatewayError::WatermarkFailed { .. } => 500,
            GatewayError::UnknownLane { .. } => 403,
            GatewayError::InvalidRequest { .. } => 400,
            GatewayError::Cancelled => 499,
        }
    }

    /// Value for a `Retry-After` header, when the error carries one.
    pub fn retry_after_secs(&self) -> Option<u64> {
        match self {
            GatewayError::RateLimited { retry_after_secs }
            | GatewayError::Backpressure { retry_after_secs }
            | GatewayError::QueueTimeout {
                retry_after_secs, ..
            }
            | GatewayError::BackendUnavailable { retry_after_secs }
            | GatewayError::SynthesisFailed {
                retry_after_secs, ..
            }
            | GatewayError::BackendTimeout {
                retry_after_secs, ..
            } => Some(*retry_after_secs),
            _ => None,
        }
    }

    /// Returns `true` if the caller may retry the same request later.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            GatewayError::RateLimited { .. }
                | GatewayError::Backpressure { .. }
                | GatewayError::QueueTimeout { .. }
                | GatewayError::BackendUnavailable { .. }
                | GatewayError::SynthesisFailed { .. }
                | GatewayError::BackendTimeout { .. }
        )
    }

    /// Stable short name for logs and metrics labels.
    pub fn kind(&self) -> &'static str {
        match self {
            GatewayError::RateLimited { .. } => "rate_limited",
            GatewayError::Backpressure { .. } => "backpressure",
            GatewayError::QueueTimeout { .. } => "queue_timeout",
            GatewayError::BackendUnavailable { .. } => "backend_unavailable",
            GatewayError::SynthesisFailed { .. } => "synthesis_failed",
            GatewayError::BackendTimeout { .. } => "backend_timeout",
            GatewayError::WatermarkFailed { .. } => "watermark_failed",
            GatewayError::UnknownLane { .. } => "unknown_lane",
            GatewayError::InvalidRequest { .. } => "invalid_request",
            GatewayError::Cancelled => "cancelled",
        }
    }

    /// Create an invalid-request error with the given reason.
    pub fn invalid(reason: impl Into<String>) -> Self {
        Self::InvalidRequest {
            reason: reason.into(),
        }
    }
}

/// Round a wait estimate up to whole seconds, never below one.
///
/// A `Retry-After: 0` would invite an immediate retry storm.
pub fn retry_after_from(wait: Duration) -> u64 {
    let secs = wait.as_secs_f64().ceil() as u64;
    secs.max(1)
}
