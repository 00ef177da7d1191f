//! Deadlines and cancellation for the request path.
//!
//! A request has two bounded waits: time queued for a slot and time waiting
//! on the backend. Both also end early when the caller's
//! [`CancellationToken`] fires (client disconnect, upstream timeout).

use crate::config::LaneConfig;
use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Timeout configuration for one lane.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeoutConfig {
    /// Longest wait for an admission slot
    pub queue_wait: Duration,
    /// Longest wait on one backend call
    pub backend_call: Duration,
}

impl TimeoutConfig {
    /// Create a new timeout configuration.
    pub fn new(queue_wait: Duration, backend_call: Duration) -> Self {
        Self {
            queue_wait,
            backend_call,
        }
    }
}

impl From<&LaneConfig> for TimeoutConfig {
    fn from(lane: &LaneConfig) -> Self {
        Self::new(lane.max_queue_wait, lane.backend_timeout)
    }
}

/// Why a bounded wait ended without a value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Interrupted {
    /// Caller cancelled
    Cancelled,
    /// Deadline passed
    TimedOut {
        /// Time spent waiting
        elapsed: Duration,
    },
}

/// Await `future` until it completes, `limit` elapses, or `cancel` fires.
///
/// Cancellation wins ties so a disconnected caller never gets billed for a
/// late result.
pub async fn bounded<F: Future>(
    future: F,
    limit: Duration,
    cancel: &CancellationToken,
) -> Result<F::Output, Interrupted> {
    let started = Instant::now();
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(Interrupted::Cancelled),
        result = tokio::time::timeout(limit, future) => result.map_err(|_| Interrupted::TimedOut {
            elapsed: started.elapsed(),
        }),
    }
}
