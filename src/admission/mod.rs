//! Per-lane admission control.
//!
//! Each lane owns a counting semaphore of `max_concurrent` slots and a
//! bounded FIFO wait queue of `queue_depth_limit` entries:
//!
//! 1. A free slot is taken immediately.
//! 2. Otherwise the request queues, if the queue has room.
//! 3. Otherwise it is shed with a retry estimate of
//!    `queue_depth * average_service_time / max_concurrent`.
//!
//! Queueing is the only suspension point in the gateway. It waits on the
//! semaphore itself (FIFO, cancel-safe), so no lock is held while waiting and
//! a waiter that gives up leaves the queue without consuming a slot.
//!
//! Lanes share nothing here; saturating one lane's queue cannot take slots
//! from the other.

pub mod singleflight;

pub use singleflight::{Follower, FollowerOutcome, LeaderGuard, Role, Singleflight};

use crate::config::LaneTable;
use crate::lane::{Lane, PerLane};
use serde::Serialize;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore, TryAcquireError};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Weight of the newest sample in the service-time average.
const EWMA_ALPHA: f64 = 0.2;

// ============================================================================
// Errors
// ============================================================================

/// Why a slot was not obtained.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AdmissionError {
    /// All slots busy and the queue is full.
    Shed {
        /// Estimated time until the queue drains
        retry_after: Duration,
    },
    /// Waited longer than the allowed bound.
    TimedOut {
        /// Time spent queued
        waited: Duration,
        /// Estimated time until the queue drains
        retry_after: Duration,
    },
    /// Caller cancelled while queued.
    Cancelled,
    /// The lane is shutting down.
    Closed,
}

/// Outcome of a non-blocking admission attempt.
pub enum AcquireAttempt {
    /// A slot was free.
    Slot(Slot),
    /// All slots busy; a queue position was reserved.
    Queued(QueueTicket),
    /// All slots busy and the queue is full.
    Shed {
        /// Estimated time until the queue drains
        retry_after: Duration,
    },
}

// ============================================================================
// Lane admission
// ============================================================================

/// Slots, queue and service-time estimate for one lane.
pub struct LaneAdmission {
    lane: Lane,
    semaphore: Arc<Semaphore>,
    max_concurrent: usize,
    queue_depth_limit: usize,
    waiting: AtomicUsize,
    /// Exponentially weighted mean service time, microseconds
    avg_service_micros: AtomicU64,
}

/// Read-only lane gauges.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct LaneLoad {
    /// Backend calls currently holding a slot
    pub in_flight: usize,
    /// Requests waiting for a slot
    pub queued: usize,
    /// Slot budget
    pub max_concurrent: usize,
    /// Queue budget
    pub queue_depth_limit: usize,
    /// Current service-time estimate, milliseconds
    pub avg_service_ms: u64,
}

impl LaneAdmission {
    /// Create admission state for one lane.
    pub fn new(
        lane: Lane,
        max_concurrent: usize,
        queue_depth_limit: usize,
        initial_service_time: Duration,
    ) -> Self {
        Self {
            lane,
            semaphore: Arc::new(Semaphore::new(max_concurrent)),
            max_concurrent,
            queue_depth_limit,
            waiting: AtomicUsize::new(0),
            avg_service_micros: AtomicU64::new(initial_service_time.as_micros() as u64),
        }
    }

    /// Take a free slot, reserve a queue position, or shed.
    pub fn try_acquire(self: &Arc<Self>) -> AcquireAttempt {
        match Arc::clone(&self.semaphore).try_acquire_owned() {
            Ok(permit) => return AcquireAttempt::Slot(Slot::new(self, permit)),
            Err(TryAcquireError::NoPermits) => {}
            Err(TryAcquireError::Closed) => {
                return AcquireAttempt::Shed {
                    retry_after: self.retry_estimate(),
                };
            }
        }

        let reserved = self
            .waiting
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |depth| {
                (depth < self.queue_depth_limit).then_some(depth + 1)
            });

        match reserved {
            Ok(depth) => {
                debug!(lane = %self.lane, position = depth + 1, "Request queued for a slot");
                AcquireAttempt::Queued(QueueTicket {
                    lane: Arc::clone(self),
                    enqueued_at: Instant::now(),
                })
            }
            Err(_) => AcquireAttempt::Shed {
                retry_after: self.retry_estimate(),
            },
        }
    }

    /// Take a slot, queueing for at most `max_wait`.
    pub async fn acquire(
        self: &Arc<Self>,
        max_wait: Duration,
        cancel: &CancellationToken,
    ) -> Result<Slot, AdmissionError> {
        match self.try_acquire() {
            AcquireAttempt::Slot(slot) => Ok(slot),
            AcquireAttempt::Queued(ticket) => ticket.wait(max_wait, cancel).await,
            AcquireAttempt::Shed { retry_after } => Err(AdmissionError::Shed { retry_after }),
        }
    }

    /// `queue_depth * avg_service_time / max_concurrent`, with the depth
    /// counted as at least one.
    pub fn retry_estimate(&self) -> Duration {
        let depth = self.waiting.load(Ordering::Acquire).max(1) as f64;
        let avg = self.avg_service_micros.load(Ordering::Relaxed) as f64;
        let micros = depth * avg / self.max_concurrent.max(1) as f64;
        Duration::from_micros(micros as u64)
    }

    /// Current gauges.
    pub fn load(&self) -> LaneLoad {
        LaneLoad {
            in_flight: self
                .max_concurrent
                .saturating_sub(self.semaphore.available_permits()),
            queued: self.waiting.load(Ordering::Acquire),
            max_concurrent: self.max_concurrent,
            queue_depth_limit: self.queue_depth_limit,
            avg_service_ms: self.avg_service_micros.load(Ordering::Relaxed) / 1_000,
        }
    }

    /// Stop admitting; queued waiters fail with [`AdmissionError::Closed`].
    pub fn close(&self) {
        self.semaphore.close();
    }

    fn record_service_time(&self, elapsed: Duration) {
        let sample = elapsed.as_micros() as f64;
        let _ = self
            .avg_service_micros
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |current| {
                Some((EWMA_ALPHA * sample + (1.0 - EWMA_ALPHA) * current as f64) as u64)
            });
    }
}

// ============================================================================
// Queue ticket
// ============================================================================

/// A reserved queue position. Dropping it gives the position back.
pub struct QueueTicket {
    lane: Arc<LaneAdmission>,
    enqueued_at: Instant,
}

impl QueueTicket {
    /// Wait in FIFO order for a slot, for at most `max_wait`.
    pub async fn wait(
        self,
        max_wait: Duration,
        cancel: &CancellationToken,
    ) -> Result<Slot, AdmissionError> {
        let semaphore = Arc::clone(&self.lane.semaphore);

        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(AdmissionError::Cancelled),
            acquired = tokio::time::timeout(max_wait, semaphore.acquire_owned()) => match acquired {
                Ok(Ok(permit)) => Ok(permit),
                Ok(Err(_closed)) => Err(AdmissionError::Closed),
                Err(_elapsed) => Err(AdmissionError::TimedOut {
                    waited: self.waited(),
                    retry_after: self.lane.retry_estimate(),
                }),
            },
        };

        // Leave the queue before the slot counts as in flight.
        let lane = Arc::clone(&self.lane);
        let waited = self.waited();
        drop(self);

        let permit = outcome?;
        debug!(lane = %lane.lane, ?waited, "Queued request obtained a slot");
        Ok(Slot::new(&lane, permit))
    }

    /// Time spent in the queue so far.
    pub fn waited(&self) -> Duration {
        self.enqueued_at.elapsed()
    }
}

impl Drop for QueueTicket {
    fn drop(&mut self) {
        self.lane.waiting.fetch_sub(1, Ordering::AcqRel);
    }
}

// ============================================================================
// Slot
// ============================================================================

/// One in-flight backend call within a lane's budget.
///
/// Released exactly once, on drop, whatever the exit path.
pub struct Slot {
    lane: Arc<LaneAdmission>,
    started_at: Instant,
    _permit: OwnedSemaphorePermit,
}

impl Slot {
    fn new(lane: &Arc<LaneAdmission>, permit: OwnedSemaphorePermit) -> Self {
        Self {
            lane: Arc::clone(lane),
            started_at: Instant::now(),
            _permit: permit,
        }
    }
}

impl Drop for Slot {
    fn drop(&mut self) {
        self.lane.record_service_time(self.started_at.elapsed());
    }
}

// ============================================================================
// Controller
// ============================================================================

/// Admission for both lanes plus the shared singleflight registry.
pub struct AdmissionController {
    lanes: PerLane<Arc<LaneAdmission>>,
    singleflight: Arc<Singleflight>,
}

impl AdmissionController {
    /// Size every lane from `table`.
    pub fn new(table: &LaneTable) -> Self {
        Self {
            lanes: PerLane::from_fn(|lane| {
                let config = table.get(lane);
                Arc::new(LaneAdmission::new(
                    lane,
                    config.max_concurrent,
                    config.queue_depth_limit,
                    config.initial_service_time,
                ))
            }),
            singleflight: Arc::new(Singleflight::new()),
        }
    }

    /// Admission state for `lane`.
    pub fn lane(&self, lane: Lane) -> &Arc<LaneAdmission> {
        self.lanes.get(lane)
    }

    /// Non-blocking attempt on `lane`.
    pub fn try_acquire(&self, lane: Lane) -> AcquireAttempt {
        self.lanes.get(lane).try_acquire()
    }

    /// Take a slot on `lane`, queueing for at most `max_wait`.
    pub async fn acquire(
        &self,
        lane: Lane,
        max_wait: Duration,
        cancel: &CancellationToken,
    ) -> Result<Slot, AdmissionError> {
        self.lanes.get(lane).acquire(max_wait, cancel).await
    }

    /// The in-flight de-duplication registry.
    pub fn singleflight(&self) -> &Arc<Singleflight> {
        &self.singleflight
    }

    /// Gauges for `lane`.
    pub fn load(&self, lane: Lane) -> LaneLoad {
        self.lanes.get(lane).load()
    }

    /// Close every lane.
    pub fn close(&self) {
        for lane in Lane::ALL {
            self.lanes.get(lane).close();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lane(max_concurrent: usize, queue: usize) -> Arc<LaneAdmission> {
        Arc::new(LaneAdmission::new(
            Lane::Priority,
            max_concurrent,
            queue,
            Duration::from_secs(2),
        ))
    }

    #[tokio::test]
    async fn test_two_run_two_queue_one_shed() {
        let lane = lane(2, 2);

        let running: Vec<Slot> = (0..2)
            .map(|_| match lane.try_acquire() {
                AcquireAttempt::Slot(slot) => slot,
                _ => panic!("slot should be free"),
            })
            .collect();
        let tickets: Vec<QueueTicket> = (0..2)
            .map(|_| match lane.try_acquire() {
                AcquireAttempt::Queued(ticket) => ticket,
                _ => panic!("queue should have room"),
            })
            .collect();

        let AcquireAttempt::Shed { retry_after } = lane.try_acquire() else {
            panic!("fifth request should be shed");
        };
        // 2 queued * 2s / 2 slots
        assert_eq!(retry_after, Duration::from_secs(2));

        let load = lane.load();
        assert_eq!(load.in_flight, 2);
        assert_eq!(load.queued, 2);

        drop(tickets);
        drop(running);
        assert_eq!(lane.load().in_flight, 0);
        assert_eq!(lane.load().queued, 0);
    }

    #[tokio::test]
    async fn test_zero_queue_sheds_immediately() {
        let lane = lane(1, 0);
        let _slot = lane.acquire(Duration::from_secs(1), &CancellationToken::new()).await.unwrap();

        let err = lane
            .acquire(Duration::from_secs(1), &CancellationToken::new())
            .await
            .err()
            .unwrap();
        assert!(matches!(err, AdmissionError::Shed { retry_after } if retry_after > Duration::ZERO));
    }

    #[tokio::test]
    async fn test_queued_waiters_served_fifo() {
        let lane = lane(1, 8);
        let first = lane.acquire(Duration::from_secs(5), &CancellationToken::new()).await.unwrap();

        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let mut waiters = Vec::new();
        for i in 0..4 {
            let AcquireAttempt::Queued(ticket) = lane.try_acquire() else {
                panic!("should queue");
            };
            let tx = tx.clone();
            waiters.push(tokio::spawn(async move {
                let slot = ticket.wait(Duration::from_secs(5), &CancellationToken::new()).await.unwrap();
                tx.send(i).unwrap();
                tokio::task::yield_now().await;
                drop(slot);
            }));
        }
        drop(tx);

        // Let every waiter enqueue on the semaphore before the slot frees up.
        tokio::task::yield_now().await;
        drop(first);
        for waiter in waiters {
            waiter.await.unwrap();
        }

        let mut order = Vec::new();
        while let Some(i) = rx.recv().await {
            order.push(i);
        }
        assert_eq!(order, vec![0, 1, 2, 3]);
    }

    #[tokio::test]
    async fn test_cancelled_waiter_leaves_without_consuming() {
        let lane = lane(1, 4);
        let held = lane.acquire(Duration::from_secs(5), &CancellationToken::new()).await.unwrap();

        let cancel = CancellationToken::new();
        let waiter = {
            let lane = Arc::clone(&lane);
            let cancel = cancel.clone();
            tokio::spawn(async move { lane.acquire(Duration::from_secs(60), &cancel).await })
        };
        tokio::task::yield_now().await;
        assert_eq!(lane.load().queued, 1);

        cancel.cancel();
        assert!(matches!(waiter.await.unwrap(), Err(AdmissionError::Cancelled)));
        assert_eq!(lane.load().queued, 0);

        drop(held);
        // The slot came back; nobody stole it.
        assert!(matches!(lane.try_acquire(), AcquireAttempt::Slot(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_queue_wait_bound() {
        let lane = lane(1, 4);
        let _held = lane.acquire(Duration::from_secs(5), &CancellationToken::new()).await.unwrap();

        let err = lane
            .acquire(Duration::from_secs(3), &CancellationToken::new())
            .await
            .err()
            .unwrap();
        match err {
            AdmissionError::TimedOut { waited, retry_after } => {
                assert!(waited >= Duration::from_secs(3));
                assert!(retry_after > Duration::ZERO);
            }
            other => panic!("unexpected: {other:?}"),
        }
        assert_eq!(lane.load().queued, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_service_time_estimate_follows_samples() {
        let lane = lane(1, 1);
        let slot = lane.acquire(Duration::from_secs(1), &CancellationToken::new()).await.unwrap();
        tokio::time::advance(Duration::from_secs(12)).await;
        drop(slot);

        // 0.2 * 12s + 0.8 * 2s = 4s
        assert!((3_999..=4_000).contains(&lane.load().avg_service_ms));
    }

    #[tokio::test]
    async fn test_lanes_do_not_share_slots() {
        let controller = AdmissionController::new(&LaneTable::default());
        let free_limit = LaneTable::default().free.max_concurrent;

        let _free: Vec<Slot> = (0..free_limit)
            .map(|_| match controller.try_acquire(Lane::Free) {
                AcquireAttempt::Slot(slot) => slot,
                _ => panic!("free slot expected"),
            })
            .collect();
        assert!(!matches!(controller.try_acquire(Lane::Free), AcquireAttempt::Slot(_)));
        assert!(matches!(controller.try_acquire(Lane::Priority), AcquireAttempt::Slot(_)));
    }

    #[tokio::test]
    async fn test_close_fails_waiters() {
        let lane = lane(1, 2);
        let _held = lane.acquire(Duration::from_secs(5), &CancellationToken::new()).await.unwrap();
        let waiter = {
            let lane = Arc::clone(&lane);
            tokio::spawn(async move {
                lane.acquire(Duration::from_secs(60), &CancellationToken::new()).await
            })
        };
        tokio::task::yield_now().await;

        lane.close();
        assert!(matches!(waiter.await.unwrap(), Err(AdmissionError::Closed)));
    }
}
