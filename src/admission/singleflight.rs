//! In-flight de-duplication keyed by [`CacheKey`].
//!
//! The first request for a key becomes the leader and does the work; later
//! requests for the same key attach as followers and receive the leader's
//! outcome without consuming a backend slot of their own. If a leader goes
//! away without publishing (caller cancelled), followers are told the flight
//! was abandoned and race to become the next leader.

use crate::cache::CacheKey;
use crate::error::{GatewayError, GatewayResult};
use bytes::Bytes;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use std::sync::Arc;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

type Outcome = Option<GatewayResult<Bytes>>;

/// Registry of in-flight computations.
#[derive(Default)]
pub struct Singleflight {
    flights: DashMap<CacheKey, watch::Receiver<Outcome>>,
}

/// Result of [`Singleflight::join`].
pub enum Role {
    /// Caller must compute the result and publish it.
    Leader(LeaderGuard),
    /// Caller should wait for the current leader.
    Follower(Follower),
}

impl Singleflight {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Become leader for `key`, or attach to the existing leader.
    pub fn join(self: &Arc<Self>, key: &CacheKey) -> Role {
        match self.flights.entry(key.clone()) {
            Entry::Occupied(flight) => Role::Follower(Follower {
                rx: flight.get().clone(),
            }),
            Entry::Vacant(slot) => {
                let (tx, rx) = watch::channel(None);
                slot.insert(rx);
                Role::Leader(LeaderGuard {
                    registry: Arc::clone(self),
                    key: key.clone(),
                    tx: Some(tx),
                })
            }
        }
    }

    /// Number of keys currently being computed.
    pub fn in_flight(&self) -> usize {
        self.flights.len()
    }
}

// ============================================================================
// Leader
// ============================================================================

/// Held by the request computing a key. Dropping it without calling
/// [`LeaderGuard::publish`] abandons the flight.
pub struct LeaderGuard {
    registry: Arc<Singleflight>,
    key: CacheKey,
    tx: Option<watch::Sender<Outcome>>,
}

impl LeaderGuard {
    /// Deliver `result` to every follower and retire the flight.
    ///
    /// The flight is unregistered before the value is sent, so a request
    /// arriving afterwards goes through the cache instead of attaching.
    pub fn publish(mut self, result: &GatewayResult<Bytes>) {
        self.registry.flights.remove(&self.key);
        if let Some(tx) = self.tx.take() {
            // No receivers left is fine; nobody was waiting.
            let _ = tx.send(Some(result.clone()));
        }
    }
}

impl Drop for LeaderGuard {
    fn drop(&mut self) {
        if self.tx.is_some() {
            self.registry.flights.remove(&self.key);
        }
    }
}

// ============================================================================
// Follower
// ============================================================================

/// What a follower observed.
#[derive(Debug)]
pub enum FollowerOutcome {
    /// The leader's result.
    Shared(GatewayResult<Bytes>),
    /// The leader left without a result; join again.
    Abandoned,
}

/// Handle for waiting on a leader.
pub struct Follower {
    rx: watch::Receiver<Outcome>,
}

impl Follower {
    /// Wait for the leader's outcome or caller cancellation.
    pub async fn wait(mut self, cancel: &CancellationToken) -> FollowerOutcome {
        loop {
            if let Some(result) = self.rx.borrow_and_update().clone() {
                return FollowerOutcome::Shared(result);
            }

            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    return FollowerOutcome::Shared(Err(GatewayError::Cancelled));
                }
                changed = self.rx.changed() => {
                    if changed.is_err() {
                        // Sender gone: take a final value if one was sent.
                        return match self.rx.borrow().clone() {
                            Some(result) => FollowerOutcome::Shared(result),
                            None => FollowerOutcome::Abandoned,
                        };
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lane::Lane;
    use crate::params::SynthesisParams;

    fn key(text: &str) -> CacheKey {
        let params = SynthesisParams {
            text: text.to_string(),
            voice_id: None,
            model_revision: "main".to_string(),
            quality: "standard".to_string(),
            sampler: "default".to_string(),
            watermark: true,
            format_version: 1,
        };
        CacheKey::derive(&params, Lane::Free)
    }

    #[tokio::test]
    async fn test_first_joiner_leads_second_follows() {
        let registry = Arc::new(Singleflight::new());

        let Role::Leader(leader) = registry.join(&key("hello")) else {
            panic!("first join should lead");
        };
        let Role::Follower(follower) = registry.join(&key("hello")) else {
            panic!("second join should follow");
        };
        assert!(matches!(registry.join(&key("other")), Role::Leader(_)));

        let waiter = tokio::spawn(async move { follower.wait(&CancellationToken::new()).await });
        leader.publish(&Ok(Bytes::from_static(b"audio")));

        match waiter.await.unwrap() {
            FollowerOutcome::Shared(Ok(bytes)) => assert_eq!(bytes, Bytes::from_static(b"audio")),
            other => panic!("unexpected outcome: {other:?}"),
        }
        assert_eq!(registry.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_errors_are_shared_too() {
        let registry = Arc::new(Singleflight::new());
        let Role::Leader(leader) = registry.join(&key("x")) else {
            panic!("should lead");
        };
        let Role::Follower(follower) = registry.join(&key("x")) else {
            panic!("should follow");
        };

        let err = GatewayError::SynthesisFailed {
            reason: "cuda oom".into(),
            retry_after_secs: 1,
        };
        leader.publish(&Err(err.clone()));

        match follower.wait(&CancellationToken::new()).await {
            FollowerOutcome::Shared(Err(shared)) => assert_eq!(shared, err),
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_dropped_leader_abandons_flight() {
        let registry = Arc::new(Singleflight::new());
        let Role::Leader(leader) = registry.join(&key("x")) else {
            panic!("should lead");
        };
        let Role::Follower(follower) = registry.join(&key("x")) else {
            panic!("should follow");
        };

        drop(leader);
        assert!(matches!(
            follower.wait(&CancellationToken::new()).await,
            FollowerOutcome::Abandoned
        ));
        // Next joiner takes over.
        assert!(matches!(registry.join(&key("x")), Role::Leader(_)));
    }

    #[tokio::test]
    async fn test_follower_cancellation() {
        let registry = Arc::new(Singleflight::new());
        let _leader = registry.join(&key("x"));
        let Role::Follower(follower) = registry.join(&key("x")) else {
            panic!("should follow");
        };

        let cancel = CancellationToken::new();
        cancel.cancel();
        assert!(matches!(
            follower.wait(&cancel).await,
            FollowerOutcome::Shared(Err(GatewayError::Cancelled))
        ));
    }
}
