//! Circuit breaker guarding the synthesis backend.
//!
//! # State machine
//!
//! ```text
//!            failures >= threshold
//!            or window failure rate > ratio
//!   Closed ───────────────────────────────► Open
//!     ▲                                      │ cool-down elapsed
//!     │ trial succeeds                       ▼
//!     └────────────────────────────────── HalfOpen
//!                 trial fails: back to Open, cool-down doubles (bounded)
//! ```
//!
//! Exactly one trial call is admitted while half-open. A trial whose caller
//! disappears without reporting an outcome frees the trial slot so the next
//! caller can probe.

use crate::config::LaneConfig;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{info, warn};

/// Retry hint while another caller holds the half-open trial.
const TRIAL_BUSY_RETRY: Duration = Duration::from_secs(1);

// ============================================================================
// Types
// ============================================================================

/// Breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Calls pass through.
    Closed,
    /// Calls fail fast.
    Open,
    /// One trial call is allowed.
    HalfOpen,
}

/// Thresholds for one breaker.
#[derive(Debug, Clone, PartialEq)]
pub struct BreakerSettings {
    /// Consecutive failures that open the breaker
    pub failure_threshold: u32,
    /// Initial open-state cool-down
    pub cooldown: Duration,
    /// Cap for the doubling cool-down
    pub max_cooldown: Duration,
    /// Calls remembered for the failure-rate rule
    pub window: usize,
    /// Failure fraction over a full window that opens the breaker
    pub failure_ratio: f64,
}

impl From<&LaneConfig> for BreakerSettings {
    fn from(lane: &LaneConfig) -> Self {
        Self {
            failure_threshold: lane.breaker_failure_threshold,
            cooldown: lane.breaker_cooldown,
            max_cooldown: lane.breaker_max_cooldown,
            window: lane.breaker_window,
            failure_ratio: lane.breaker_failure_ratio,
        }
    }
}

/// Read-only view for observability.
#[derive(Debug, Clone, Serialize)]
pub struct BreakerSnapshot {
    /// Current state
    pub state: CircuitState,
    /// Failures since the last success
    pub consecutive_failures: u32,
    /// Cool-down that applies to the next (or current) open period
    #[serde(with = "crate::config::duration_str")]
    pub cooldown: Duration,
    /// Total state transitions since start
    pub transitions: u64,
}

struct BreakerInner {
    state: CircuitState,
    consecutive_failures: u32,
    /// Recent outcomes, `true` = failure
    recent: VecDeque<bool>,
    current_cooldown: Duration,
    opened_at: Instant,
    trial_in_flight: bool,
}

// ============================================================================
// Circuit Breaker
// ============================================================================

/// Backend-health gate. One per lane, or one shared by both lanes.
pub struct CircuitBreaker {
    name: String,
    settings: BreakerSettings,
    inner: Mutex<BreakerInner>,
    transitions: AtomicU64,
}

impl CircuitBreaker {
    /// Create a closed breaker.
    pub fn new(name: impl Into<String>, settings: BreakerSettings) -> Self {
        let now = Instant::now();
        Self {
            name: name.into(),
            inner: Mutex::new(BreakerInner {
                state: CircuitState::Closed,
                consecutive_failures: 0,
                recent: VecDeque::with_capacity(settings.window),
                current_cooldown: settings.cooldown,
                opened_at: now,
                trial_in_flight: false,
            }),
            settings,
            transitions: AtomicU64::new(0),
        }
    }

    /// Ask to call the backend.
    ///
    /// # Errors
    ///
    /// Returns the time until a call may be attempted when the breaker is
    /// open, or when half-open with the trial already taken.
    pub fn try_acquire(self: &Arc<Self>) -> Result<BreakerPermit, Duration> {
        let now = Instant::now();
        let mut inner = self.inner.lock();

        if inner.state == CircuitState::Open {
            let open_for = now.saturating_duration_since(inner.opened_at);
            if open_for < inner.current_cooldown {
                return Err(inner.current_cooldown - open_for);
            }
            self.transition(&mut inner, CircuitState::HalfOpen);
        }

        match inner.state {
            CircuitState::Closed => Ok(BreakerPermit::new(self, false)),
            CircuitState::HalfOpen if !inner.trial_in_flight => {
                inner.trial_in_flight = true;
                Ok(BreakerPermit::new(self, true))
            }
            _ => Err(TRIAL_BUSY_RETRY),
        }
    }

    /// Current state, applying an elapsed cool-down lazily.
    pub fn state(&self) -> CircuitState {
        let inner = self.inner.lock();
        if inner.state == CircuitState::Open
            && Instant::now().saturating_duration_since(inner.opened_at) >= inner.current_cooldown
        {
            return CircuitState::HalfOpen;
        }
        inner.state
    }

    /// Observability snapshot.
    pub fn snapshot(&self) -> BreakerSnapshot {
        let state = self.state();
        let inner = self.inner.lock();
        BreakerSnapshot {
            state,
            consecutive_failures: inner.consecutive_failures,
            cooldown: inner.current_cooldown,
            transitions: self.transitions.load(Ordering::Relaxed),
        }
    }

    /// Cool-down left before an open breaker admits a trial call. `None`
    /// unless the breaker is open.
    pub fn remaining_cooldown(&self) -> Option<Duration> {
        let inner = self.inner.lock();
        if inner.state != CircuitState::Open {
            return None;
        }
        let open_for = Instant::now().saturating_duration_since(inner.opened_at);
        inner
            .current_cooldown
            .checked_sub(open_for)
            .filter(|left| !left.is_zero())
    }

    fn on_success(&self, trial: bool) {
        let mut inner = self.inner.lock();

        match (inner.state, trial) {
            (CircuitState::HalfOpen, true) => {
                inner.trial_in_flight = false;
                inner.consecutive_failures = 0;
                inner.recent.clear();
                inner.current_cooldown = self.settings.cooldown;
                self.transition(&mut inner, CircuitState::Closed);
            }
            (CircuitState::Closed, false) => {
                inner.consecutive_failures = 0;
                self.push_outcome(&mut inner, false);
            }
            // Late completion of a call admitted under a previous state.
            _ => {}
        }
    }

    fn on_failure(&self, trial: bool) {
        let now = Instant::now();
        let mut inner = self.inner.lock();

        match (inner.state, trial) {
            (CircuitState::HalfOpen, true) => {
                inner.trial_in_flight = false;
                let doubled = inner.current_cooldown.saturating_mul(2);
                inner.current_cooldown = doubled.min(self.settings.max_cooldown);
                inner.opened_at = now;
                self.transition(&mut inner, CircuitState::Open);
            }
            (CircuitState::Closed, false) => {
                inner.consecutive_failures += 1;
                self.push_outcome(&mut inner, true);

                if self.should_trip(&inner) {
                    inner.opened_at = now;
                    self.transition(&mut inner, CircuitState::Open);
                }
            }
            _ => {}
        }
    }

    fn on_abandoned(&self, trial: bool) {
        if trial {
            self.inner.lock().trial_in_flight = false;
        }
    }

    fn push_outcome(&self, inner: &mut BreakerInner, failed: bool) {
        if inner.recent.len() == self.settings.window {
            inner.recent.pop_front();
        }
        inner.recent.push_back(failed);
    }

    fn should_trip(&self, inner: &BreakerInner) -> bool {
        if inner.consecutive_failures >= self.settings.failure_threshold {
            return true;
        }
        if inner.recent.len() < self.settings.window {
            return false;
        }
        let failures = inner.recent.iter().filter(|failed| **failed).count();
        failures as f64 / inner.recent.len() as f64 > self.settings.failure_ratio
    }

    fn transition(&self, inner: &mut BreakerInner, to: CircuitState) {
        let from = inner.state;
        if from == to {
            return;
        }
        inner.state = to;
        self.transitions.fetch_add(1, Ordering::Relaxed);

        match to {
            CircuitState::Open => warn!(
                breaker = %self.name,
                ?from,
                consecutive_failures = inner.consecutive_failures,
                cooldown = ?inner.current_cooldown,
                "Circuit breaker opened"
            ),
            CircuitState::HalfOpen => info!(breaker = %self.name, "Circuit breaker half-open, admitting trial"),
            CircuitState::Closed => info!(breaker = %self.name, "Circuit breaker closed"),
        }
    }
}

// ============================================================================
// Permit
// ============================================================================

/// Right to make one backend call. Report the outcome with
/// [`BreakerPermit::success`] or [`BreakerPermit::failure`]; dropping it
/// unreported counts as neither.
pub struct BreakerPermit {
    breaker: Arc<CircuitBreaker>,
    trial: bool,
    settled: bool,
}

impl BreakerPermit {
    fn new(breaker: &Arc<CircuitBreaker>, trial: bool) -> Self {
        Self {
            breaker: Arc::clone(breaker),
            trial,
            settled: false,
        }
    }

    /// Returns `true` if this is the half-open trial call.
    pub fn is_trial(&self) -> bool {
        self.trial
    }

    /// Record a successful backend call.
    pub fn success(mut self) {
        self.settled = true;
        self.breaker.on_success(self.trial);
    }

    /// Record a failed backend call.
    pub fn failure(mut self) {
        self.settled = true;
        self.breaker.on_failure(self.trial);
    }
}

impl Drop for BreakerPermit {
    fn drop(&mut self) {
        if !self.settled {
            self.breaker.on_abandoned(self.trial);
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn settings() -> BreakerSettings {
        BreakerSettings {
            failure_threshold: 5,
            cooldown: Duration::from_secs(30),
            max_cooldown: Duration::from_secs(100),
            window: 20,
            failure_ratio: 0.5,
        }
    }

    fn breaker() -> Arc<CircuitBreaker> {
        Arc::new(CircuitBreaker::new("test", settings()))
    }

    fn fail_n(breaker: &Arc<CircuitBreaker>, n: u32) {
        for _ in 0..n {
            breaker.try_acquire().unwrap().failure();
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_opens_after_threshold_consecutive_failures() {
        let breaker = breaker();

        fail_n(&breaker, 4);
        assert_eq!(breaker.state(), CircuitState::Closed);

        fail_n(&breaker, 1);
        assert_eq!(breaker.state(), CircuitState::Open);

        let retry = breaker.try_acquire().err().unwrap();
        assert_eq!(retry, Duration::from_secs(30));
    }

    #[tokio::test(start_paused = true)]
    async fn test_remaining_cooldown_counts_down_while_open() {
        let breaker = breaker();
        assert_eq!(breaker.remaining_cooldown(), None);

        fail_n(&breaker, 5);
        assert_eq!(breaker.remaining_cooldown(), Some(Duration::from_secs(30)));

        tokio::time::advance(Duration::from_secs(20)).await;
        assert_eq!(breaker.remaining_cooldown(), Some(Duration::from_secs(10)));

        tokio::time::advance(Duration::from_secs(10)).await;
        assert_eq!(breaker.remaining_cooldown(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_resets_consecutive_count() {
        let breaker = breaker();

        fail_n(&breaker, 4);
        breaker.try_acquire().unwrap().success();
        fail_n(&breaker, 4);

        assert_eq!(breaker.state(), CircuitState::Closed);
        assert_eq!(breaker.snapshot().consecutive_failures, 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failure_rate_over_window_opens() {
        let breaker = breaker();

        // Alternate 2 failures, 1 success: never 5 in a row, but 2/3 > 50%.
        for _ in 0..7 {
            fail_n(&breaker, 2);
            if breaker.state() == CircuitState::Open {
                break;
            }
            breaker.try_acquire().unwrap().success();
        }
        assert_eq!(breaker.state(), CircuitState::Open);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exactly_one_half_open_trial() {
        let breaker = breaker();
        fail_n(&breaker, 5);

        tokio::time::advance(Duration::from_secs(30)).await;
        assert_eq!(breaker.state(), CircuitState::HalfOpen);

        let trial = breaker.try_acquire().unwrap();
        assert!(trial.is_trial());
        assert_eq!(breaker.try_acquire().err(), Some(TRIAL_BUSY_RETRY));

        trial.success();
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert!(!breaker.try_acquire().unwrap().is_trial());
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_trial_doubles_cooldown_bounded() {
        let breaker = breaker();
        fail_n(&breaker, 5);

        // 30s -> 60s -> 100s (cap) -> 100s
        for expected in [60, 100, 100] {
            let current = breaker.snapshot().cooldown;
            tokio::time::advance(current).await;
            breaker.try_acquire().unwrap().failure();
            assert_eq!(breaker.state(), CircuitState::Open);
            assert_eq!(breaker.snapshot().cooldown, Duration::from_secs(expected));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_recovery_resets_cooldown() {
        let breaker = breaker();
        fail_n(&breaker, 5);
        tokio::time::advance(Duration::from_secs(30)).await;
        breaker.try_acquire().unwrap().failure();
        tokio::time::advance(Duration::from_secs(60)).await;
        breaker.try_acquire().unwrap().success();

        assert_eq!(breaker.snapshot().cooldown, Duration::from_secs(30));
    }

    #[tokio::test(start_paused = true)]
    async fn test_abandoned_trial_frees_slot() {
        let breaker = breaker();
        fail_n(&breaker, 5);
        tokio::time::advance(Duration::from_secs(30)).await;

        drop(breaker.try_acquire().unwrap());
        assert_eq!(breaker.state(), CircuitState::HalfOpen);
        assert!(breaker.try_acquire().unwrap().is_trial());
    }

    #[tokio::test(start_paused = true)]
    async fn test_late_results_while_open_are_ignored() {
        let breaker = breaker();
        let straggler = breaker.try_acquire().unwrap();
        fail_n(&breaker, 5);

        straggler.success();
        assert_eq!(breaker.state(), CircuitState::Open);
    }

    #[tokio::test(start_paused = true)]
    async fn test_transitions_counted() {
        let breaker = breaker();
        fail_n(&breaker, 5);
        tokio::time::advance(Duration::from_secs(30)).await;
        breaker.try_acquire().unwrap().success();

        // Closed -> Open -> HalfOpen -> Closed
        assert_eq!(breaker.snapshot().transitions, 3);
    }
}
