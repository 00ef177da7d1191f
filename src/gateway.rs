//! Request orchestration.
//!
//! [`Gateway`] is the only entry point other code calls. For every request it
//! runs, in order:
//!
//! 1. Lane classification (unknown plan tags are rejected, never defaulted).
//! 2. Parameter validation and defaulting.
//! 3. The per-identity rate limit (reject, never wait).
//! 4. Cache lookup, re-applying the lane's watermark policy to hits.
//! 5. Singleflight: identical in-flight requests attach to one leader.
//! 6. Admission: take a lane slot, queue for one, or shed.
//! 7. The circuit breaker gate.
//! 8. The backend call, bounded by the lane timeout. A call that runs over
//!    is cancelled and counts as a breaker failure; its slot is released only
//!    once the call has stopped.
//!
//! Retryable failures are returned with a hint; the gateway never retries
//! backend work on its own.

use crate::admission::{
    AdmissionController, AdmissionError, FollowerOutcome, LaneAdmission, Role, Slot,
};
use crate::backend::{BackendError, BackendRequest, SynthesisBackend};
use crate::breaker::{BreakerPermit, BreakerSettings, CircuitBreaker, CircuitState};
use crate::cache::{CacheKey, CacheStore, effective_ttl};
use crate::config::{BreakerScope, ConfigError, ConfigHandle, GatewayConfig, LaneConfig};
use crate::error::{GatewayError, GatewayResult, retry_after_from};
use crate::lane::{Lane, LaneRouter, PerLane, RequestIdentity};
use crate::metrics::{GatewayMetrics, LaneSnapshot, MetricEvent, MetricsSnapshot};
use crate::params::{SynthesisParams, SynthesisRequest};
use crate::rate_limiter::{RateDecision, RateLimiter};
use crate::timeout::{Interrupted, TimeoutConfig, bounded};
use crate::usage::{TracingUsageSink, UsageRecord, UsageSink, fingerprint};
use crate::watermark::{WatermarkEnforcer, Watermarker};
use bytes::Bytes;
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, Span, debug, error, field, info, info_span, warn};
use uuid::Uuid;

// ============================================================================
// Builder
// ============================================================================

/// Assembles a [`Gateway`] from configuration and its two collaborators.
pub struct GatewayBuilder {
    config: GatewayConfig,
    backend: Option<Arc<dyn SynthesisBackend>>,
    watermarker: Option<Arc<dyn Watermarker>>,
    usage: Arc<dyn UsageSink>,
}

impl GatewayBuilder {
    /// Start from `config`.
    pub fn new(config: GatewayConfig) -> Self {
        Self {
            config,
            backend: None,
            watermarker: None,
            usage: Arc::new(TracingUsageSink),
        }
    }

    /// Synthesis backend (required).
    pub fn backend(mut self, backend: Arc<dyn SynthesisBackend>) -> Self {
        self.backend = Some(backend);
        self
    }

    /// Watermark implementation (required).
    pub fn watermarker(mut self, watermarker: Arc<dyn Watermarker>) -> Self {
        self.watermarker = Some(watermarker);
        self
    }

    /// Usage destination. Defaults to [`TracingUsageSink`].
    pub fn usage_sink(mut self, usage: Arc<dyn UsageSink>) -> Self {
        self.usage = usage;
        self
    }

    /// Validate the configuration and size every per-lane structure.
    ///
    /// # Errors
    ///
    /// [`ConfigError::Invalid`] for an invalid configuration or a missing
    /// collaborator.
    pub fn build(self) -> Result<Gateway, ConfigError> {
        self.config.validate()?;
        let backend = self
            .backend
            .ok_or_else(|| ConfigError::invalid("backend", "no synthesis backend configured"))?;
        let watermarker = self
            .watermarker
            .ok_or_else(|| ConfigError::invalid("watermarker", "no watermarker configured"))?;

        let config = self.config;
        let breakers = match config.breaker_scope {
            BreakerScope::PerLane => PerLane::from_fn(|lane| {
                Arc::new(CircuitBreaker::new(
                    format!("backend:{lane}"),
                    BreakerSettings::from(config.lanes.get(lane)),
                ))
            }),
            BreakerScope::Shared => {
                let shared = Arc::new(CircuitBreaker::new(
                    "backend:shared",
                    BreakerSettings::from(config.lanes.get(Lane::Priority)),
                ));
                PerLane::from_fn(|_| Arc::clone(&shared))
            }
        };

        info!(
            breaker_scope = ?config.breaker_scope,
            cache_capacity = config.cache_capacity,
            priority_slots = config.lanes.priority.max_concurrent,
            free_slots = config.lanes.free.max_concurrent,
            "Gateway initialized"
        );

        let handle = Arc::new(ConfigHandle::new(config.clone()));
        Ok(Gateway {
            inner: Arc::new(Inner {
                router: LaneRouter::new(Arc::clone(&handle)),
                config: handle,
                rate_limiter: RateLimiter::new(config.rate_limit_idle_ttl),
                cache: Arc::new(CacheStore::new(config.cache_capacity)),
                admission: AdmissionController::new(&config.lanes),
                breakers,
                enforcer: Arc::new(WatermarkEnforcer::new(watermarker)),
                backend,
                metrics: Arc::new(GatewayMetrics::new()),
                usage: self.usage,
            }),
        })
    }
}

// ============================================================================
// Gateway
// ============================================================================

/// The admission and synthesis gateway. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct Gateway {
    inner: Arc<Inner>,
}

struct Inner {
    config: Arc<ConfigHandle>,
    router: LaneRouter,
    rate_limiter: RateLimiter,
    cache: Arc<CacheStore>,
    admission: AdmissionController,
    breakers: PerLane<Arc<CircuitBreaker>>,
    enforcer: Arc<WatermarkEnforcer>,
    backend: Arc<dyn SynthesisBackend>,
    metrics: Arc<GatewayMetrics>,
    usage: Arc<dyn UsageSink>,
}

/// An artifact and where it came from.
struct Served {
    artifact: Bytes,
    cache_hit: bool,
}

impl Served {
    fn fresh(artifact: Bytes) -> Self {
        Self {
            artifact,
            cache_hit: false,
        }
    }

    fn cached(artifact: Bytes) -> Self {
        Self {
            artifact,
            cache_hit: true,
        }
    }
}

/// What one maintenance pass removed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MaintenanceReport {
    /// Idle rate-limit buckets dropped
    pub buckets_swept: usize,
    /// Expired cache entries dropped
    pub cache_entries_purged: usize,
}

impl Gateway {
    /// Start building a gateway.
    pub fn builder(config: GatewayConfig) -> GatewayBuilder {
        GatewayBuilder::new(config)
    }

    /// Synthesize `request` on behalf of `identity`.
    ///
    /// `cancel` represents the caller: when it fires, a queued request leaves
    /// the queue without taking a slot, and a running backend call is asked
    /// to stop.
    ///
    /// # Errors
    ///
    /// Any [`GatewayError`]; see its documentation for status codes and
    /// retry semantics.
    pub async fn synthesize(
        &self,
        identity: &RequestIdentity,
        request: &SynthesisRequest,
        cancel: &CancellationToken,
    ) -> GatewayResult<Bytes> {
        let request_id = Uuid::new_v4();
        let span = info_span!(
            "synthesize",
            %request_id,
            lane = field::Empty,
            api_key = %fingerprint(&identity.api_key_id),
        );
        self.handle(request_id, identity, request, cancel)
            .instrument(span)
            .await
    }

    async fn handle(
        &self,
        request_id: Uuid,
        identity: &RequestIdentity,
        request: &SynthesisRequest,
        cancel: &CancellationToken,
    ) -> GatewayResult<Bytes> {
        let started = Instant::now();
        let inner = &self.inner;

        let (lane, lane_config) = inner.router.classify(identity).inspect_err(|e| {
            warn!(plan = %identity.plan, error = %e, "Rejected unknown plan");
        })?;
        Span::current().record("lane", lane.as_str());
        inner.metrics.record(lane, MetricEvent::Request);

        let outcome = self.serve(identity, request, lane, &lane_config, cancel).await;

        let elapsed = started.elapsed();
        inner.metrics.observe_latency(lane, elapsed);
        let (cache_hit, kind) = match &outcome {
            Ok(served) => {
                inner.metrics.record(lane, MetricEvent::Completed);
                (served.cache_hit, "ok")
            }
            Err(e) => {
                inner.metrics.record(lane, MetricEvent::Failed);
                debug!(error = %e, kind = e.kind(), "Request failed");
                (false, e.kind())
            }
        };

        inner.usage.record(&UsageRecord {
            request_id,
            api_key_fingerprint: fingerprint(&identity.api_key_id),
            lane,
            chars: request.text.trim().chars().count(),
            duration_ms: elapsed.as_millis() as u64,
            cache_hit,
            outcome: kind,
            recorded_at: Utc::now(),
        });

        outcome.map(|served| served.artifact)
    }

    async fn serve(
        &self,
        identity: &RequestIdentity,
        request: &SynthesisRequest,
        lane: Lane,
        lane_config: &LaneConfig,
        cancel: &CancellationToken,
    ) -> GatewayResult<Served> {
        let inner = &self.inner;
        let config = inner.config.snapshot();

        // Malformed input must not cost the caller a token.
        let params = SynthesisParams::resolve(request, lane_config, &config)?;

        if let RateDecision::Denied { retry_after } = inner.rate_limiter.check(
            &identity.api_key_id,
            lane,
            lane_config.rate_limit_per_minute,
        ) {
            inner.metrics.record(lane, MetricEvent::RateLimited);
            warn!(retry_after_ms = retry_after.as_millis() as u64, "Rate limit exceeded");
            return Err(GatewayError::RateLimited {
                retry_after_secs: retry_after_from(retry_after),
            });
        }

        let key = CacheKey::derive(&params, lane);
        if let Some(artifact) = inner.cache.get(&key) {
            inner.metrics.record(lane, MetricEvent::CacheHit);
            debug!(key = %key, "Cache hit");
            return self.enforce(lane, artifact, params.watermark).map(Served::cached);
        }
        inner.metrics.record(lane, MetricEvent::CacheMiss);

        let ttl = effective_ttl(
            lane_config.cache_ttl,
            params.char_len(),
            config.long_text_threshold_chars,
            config.long_text_max_ttl,
        );

        loop {
            match inner.admission.singleflight().join(&key) {
                Role::Follower(follower) => {
                    inner.metrics.record(lane, MetricEvent::SingleflightFollower);
                    debug!(key = %key, "Attached to in-flight request");
                    match follower.wait(cancel).await {
                        FollowerOutcome::Shared(result) => return result.map(Served::fresh),
                        FollowerOutcome::Abandoned => {
                            debug!(key = %key, "Leader abandoned, rejoining");
                            continue;
                        }
                    }
                }
                Role::Leader(guard) => {
                    // A previous leader may have filled the cache between our
                    // lookup and the join.
                    if let Some(artifact) = self.peek_live(&key) {
                        let result = self.enforce(lane, artifact, params.watermark);
                        guard.publish(&result);
                        return result.map(Served::cached);
                    }

                    let result = self
                        .lead(lane, lane_config, &params, key.clone(), ttl, cancel)
                        .await;
                    if result != Err(GatewayError::Cancelled) {
                        guard.publish(&result);
                    }
                    // A cancelled leader drops the guard unpublished so its
                    // followers elect a new leader instead of failing too.
                    return result.map(Served::fresh);
                }
            }
        }
    }

    /// Admission, breaker and backend call for a singleflight leader.
    async fn lead(
        &self,
        lane: Lane,
        lane_config: &LaneConfig,
        params: &SynthesisParams,
        key: CacheKey,
        ttl: Duration,
        cancel: &CancellationToken,
    ) -> GatewayResult<Bytes> {
        let inner = &self.inner;
        let timeouts = TimeoutConfig::from(lane_config);

        let slot = inner
            .admission
            .acquire(lane, timeouts.queue_wait, cancel)
            .await
            .map_err(|e| self.admission_error(lane, e))?;

        let permit = match inner.breakers.get(lane).try_acquire() {
            Ok(permit) => permit,
            Err(remaining) => {
                inner.metrics.record(lane, MetricEvent::BreakerRejected);
                warn!(
                    retry_after_ms = remaining.as_millis() as u64,
                    "Circuit breaker open, failing fast"
                );
                return Err(GatewayError::BackendUnavailable {
                    retry_after_secs: retry_after_from(remaining),
                });
            }
        };

        inner.metrics.record(lane, MetricEvent::BackendCall);
        let call = BackendCall {
            lane,
            backend: Arc::clone(&inner.backend),
            enforcer: Arc::clone(&inner.enforcer),
            cache: Arc::clone(&inner.cache),
            metrics: Arc::clone(&inner.metrics),
            admission: Arc::clone(inner.admission.lane(lane)),
            breaker: Arc::clone(inner.breakers.get(lane)),
            request: BackendRequest::from(params),
            watermark: params.watermark,
            key,
            ttl,
            deadline: timeouts.backend_call,
            slot,
            permit,
        };
        call.run(cancel).await
    }

    fn admission_error(&self, lane: Lane, error: AdmissionError) -> GatewayError {
        let metrics = &self.inner.metrics;
        match error {
            AdmissionError::Shed { retry_after } => {
                metrics.record(lane, MetricEvent::Shed);
                warn!(
                    retry_after_ms = retry_after.as_millis() as u64,
                    "Lane queue full, shedding request"
                );
                GatewayError::Backpressure {
                    retry_after_secs: retry_after_from(retry_after),
                }
            }
            AdmissionError::TimedOut {
                waited,
                retry_after,
            } => {
                metrics.record(lane, MetricEvent::QueueTimeout);
                warn!(waited_ms = waited.as_millis() as u64, "Gave up waiting for a slot");
                GatewayError::QueueTimeout {
                    waited,
                    retry_after_secs: retry_after_from(retry_after),
                }
            }
            AdmissionError::Cancelled => GatewayError::Cancelled,
            AdmissionError::Closed => GatewayError::Backpressure {
                retry_after_secs: 1,
            },
        }
    }

    /// Re-apply the watermark policy to an artifact read from the cache.
    fn enforce(&self, lane: Lane, artifact: Bytes, required: bool) -> GatewayResult<Bytes> {
        if required && !self.inner.enforcer.is_marked(&artifact) {
            warn!("Cached artifact missing its watermark, re-stamping");
        }
        self.inner.enforcer.apply(artifact, required).map_err(|e| {
            self.inner.metrics.record(lane, MetricEvent::WatermarkFailure);
            error!(error = %e, "Watermark enforcement failed");
            GatewayError::WatermarkFailed {
                reason: e.to_string(),
            }
        })
    }

    fn peek_live(&self, key: &CacheKey) -> Option<Bytes> {
        self.inner
            .cache
            .peek(key)
            .filter(|entry| !entry.is_expired(Instant::now()))
            .map(|entry| entry.artifact)
    }

    // ------------------------------------------------------------------------
    // Operations
    // ------------------------------------------------------------------------

    /// Cache key `request` would use for `identity`, if it is valid.
    pub fn cache_key(
        &self,
        identity: &RequestIdentity,
        request: &SynthesisRequest,
    ) -> GatewayResult<CacheKey> {
        let (lane, lane_config) = self.inner.router.classify(identity)?;
        let params = SynthesisParams::resolve(request, &lane_config, &self.inner.config.snapshot())?;
        Ok(CacheKey::derive(&params, lane))
    }

    /// Drop one cached artifact. Returns `true` if it was present.
    pub fn invalidate(&self, key: &CacheKey) -> bool {
        self.inner.cache.invalidate(key)
    }

    /// Drop every cached artifact.
    pub fn flush_cache(&self) {
        self.inner.cache.flush();
    }

    /// Current breaker state for `lane`.
    pub fn breaker_state(&self, lane: Lane) -> CircuitState {
        self.inner.breakers.get(lane).state()
    }

    /// Shared configuration handle, for reloads.
    pub fn config_handle(&self) -> &Arc<ConfigHandle> {
        &self.inner.config
    }

    /// Every read point in one serializable value.
    pub fn metrics_snapshot(&self) -> MetricsSnapshot {
        let inner = &self.inner;
        let cache = inner.cache.stats();
        MetricsSnapshot {
            lanes: Lane::ALL
                .into_iter()
                .map(|lane| {
                    let snapshot = LaneSnapshot {
                        counters: inner.metrics.lane_snapshot(lane),
                        load: inner.admission.load(lane),
                        breaker: inner.breakers.get(lane).snapshot(),
                    };
                    (lane, snapshot)
                })
                .collect(),
            cache_hit_rate: cache.hit_rate(),
            cache,
            singleflight_in_flight: inner.admission.singleflight().in_flight(),
            rate_limit_buckets: inner.rate_limiter.bucket_count(),
        }
    }

    /// Sweep idle rate-limit buckets and expired cache entries once.
    pub fn run_maintenance(&self) -> MaintenanceReport {
        let report = MaintenanceReport {
            buckets_swept: self.inner.rate_limiter.sweep_idle(),
            cache_entries_purged: self.inner.cache.purge_expired(),
        };
        debug!(
            buckets_swept = report.buckets_swept,
            cache_entries_purged = report.cache_entries_purged,
            "Maintenance pass complete"
        );
        report
    }

    /// Run [`Gateway::run_maintenance`] every `maintenance_interval` until
    /// `shutdown` fires.
    pub fn spawn_maintenance(&self, shutdown: CancellationToken) -> JoinHandle<()> {
        let gateway = self.clone();
        let period = self.inner.config.snapshot().maintenance_interval;

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    biased;
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        gateway.run_maintenance();
                    }
                }
            }
            debug!("Maintenance task stopped");
        })
    }

    /// Stop admitting work. Queued requests are released with an error;
    /// running backend calls finish normally.
    pub fn shutdown(&self) {
        self.inner.admission.close();
        info!("Gateway admission closed");
    }
}

// ============================================================================
// Backend call
// ============================================================================

/// One backend call made under an admission slot and a breaker permit.
///
/// The slot is held for exactly as long as the backend future is alive, so a
/// timed-out or cancelled call stops before its slot is handed to the next
/// request.
struct BackendCall {
    lane: Lane,
    backend: Arc<dyn SynthesisBackend>,
    enforcer: Arc<WatermarkEnforcer>,
    cache: Arc<CacheStore>,
    metrics: Arc<GatewayMetrics>,
    admission: Arc<LaneAdmission>,
    breaker: Arc<CircuitBreaker>,
    request: BackendRequest,
    watermark: bool,
    key: CacheKey,
    ttl: Duration,
    deadline: Duration,
    slot: Slot,
    permit: BreakerPermit,
}

impl BackendCall {
    async fn run(self, cancel: &CancellationToken) -> GatewayResult<Bytes> {
        let BackendCall {
            lane,
            backend,
            enforcer,
            cache,
            metrics,
            admission,
            breaker,
            request,
            watermark,
            key,
            ttl,
            deadline,
            slot,
            permit,
        } = self;

        // The backend is told to stop as soon as we stop waiting on it, on
        // every exit path including this future being dropped.
        let call_cancel = cancel.child_token();
        let stop_on_drop = call_cancel.clone().drop_guard();

        let outcome = bounded(backend.synthesize(&request, call_cancel), deadline, cancel).await;
        drop(stop_on_drop);
        drop(slot);

        let result = match outcome {
            Ok(Ok(audio)) if audio.is_empty() => Err(BackendError::Failed {
                reason: "backend returned no audio".to_string(),
            }),
            Ok(result) => result,
            Err(Interrupted::Cancelled) => Err(BackendError::Cancelled),
            Err(Interrupted::TimedOut { elapsed }) => {
                permit.failure();
                metrics.record(lane, MetricEvent::BackendTimeout);
                warn!(
                    elapsed_ms = elapsed.as_millis() as u64,
                    "Backend call exceeded lane timeout, cancelled"
                );
                return Err(GatewayError::BackendTimeout {
                    elapsed,
                    retry_after_secs: backend_retry_after(&breaker, &admission),
                });
            }
        };

        match result {
            Ok(audio) => {
                // The backend did its job; a stamping failure is ours.
                permit.success();
                match enforcer.apply(audio, watermark) {
                    Ok(artifact) => {
                        cache.put(key, artifact.clone(), ttl);
                        Ok(artifact)
                    }
                    Err(e) => {
                        metrics.record(lane, MetricEvent::WatermarkFailure);
                        error!(error = %e, "Watermark enforcement failed, discarding artifact");
                        Err(GatewayError::WatermarkFailed {
                            reason: e.to_string(),
                        })
                    }
                }
            }
            Err(e) if !e.counts_against_health() => {
                drop(permit);
                Err(GatewayError::Cancelled)
            }
            Err(e) => {
                permit.failure();
                metrics.record(lane, MetricEvent::BackendFailure);
                warn!(error = %e, "Backend call failed");
                Err(GatewayError::SynthesisFailed {
                    reason: e.to_string(),
                    retry_after_secs: backend_retry_after(&breaker, &admission),
                })
            }
        }
    }
}

/// Retry hint after a failed backend call: the breaker's remaining
/// cool-down when the failure opened it, otherwise the lane's drain
/// estimate.
fn backend_retry_after(breaker: &CircuitBreaker, admission: &LaneAdmission) -> u64 {
    retry_after_from(
        breaker
            .remaining_cooldown()
            .unwrap_or_else(|| admission.retry_estimate()),
    )
}
