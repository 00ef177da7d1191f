//! Circuit breaker behaviour seen through the gateway.

mod common;

use common::{ScriptedBackend, gateway};
use lanegate::breaker::CircuitState;
use lanegate::config::GatewayConfig;
use lanegate::gateway::Gateway;
use lanegate::{GatewayError, GatewayResult, Lane, RequestIdentity, SynthesisRequest};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

async fn call(gateway: &Gateway, text: &str) -> GatewayResult<bytes::Bytes> {
    gateway
        .synthesize(
            &RequestIdentity::new("sk-pro", "pro"),
            &SynthesisRequest::text(text),
            &CancellationToken::new(),
        )
        .await
}

fn cooldown(gateway: &Gateway) -> Duration {
    gateway.metrics_snapshot().lanes[&Lane::Priority]
        .breaker
        .cooldown
}

#[tokio::test(start_paused = true)]
async fn breaker_opens_probes_once_and_recovers() {
    let mut config = GatewayConfig::default();
    config.lanes.priority.breaker_failure_threshold = 2;
    config.lanes.priority.breaker_cooldown = Duration::from_secs(30);
    config.lanes.priority.breaker_max_cooldown = Duration::from_secs(120);
    let backend = ScriptedBackend::new(Duration::from_millis(100));
    backend.set_failing(true);
    let gateway = gateway(config, backend.clone());

    for text in ["a", "b"] {
        assert!(matches!(
            call(&gateway, text).await,
            Err(GatewayError::SynthesisFailed { .. })
        ));
    }
    assert_eq!(gateway.breaker_state(Lane::Priority), CircuitState::Open);

    // Open: fail fast without touching the backend.
    match call(&gateway, "c").await {
        Err(GatewayError::BackendUnavailable { retry_after_secs }) => {
            assert!((1..=30).contains(&retry_after_secs));
        }
        other => panic!("unexpected: {other:?}"),
    }
    assert_eq!(backend.calls(), 2);

    // After the cool-down exactly one trial goes through.
    tokio::time::sleep(Duration::from_secs(30)).await;
    let trial = {
        let gateway = gateway.clone();
        tokio::spawn(async move { call(&gateway, "trial").await })
    };
    let rejected = {
        let gateway = gateway.clone();
        tokio::spawn(async move { call(&gateway, "second").await })
    };
    assert!(matches!(
        rejected.await.unwrap(),
        Err(GatewayError::BackendUnavailable { .. })
    ));
    assert!(matches!(
        trial.await.unwrap(),
        Err(GatewayError::SynthesisFailed { .. })
    ));
    assert_eq!(backend.calls(), 3);

    // A failed trial doubles the cool-down.
    assert_eq!(cooldown(&gateway), Duration::from_secs(60));
    tokio::time::sleep(Duration::from_secs(30)).await;
    assert!(matches!(
        call(&gateway, "d").await,
        Err(GatewayError::BackendUnavailable { .. })
    ));
    assert_eq!(backend.calls(), 3);

    // Healthy again: the next trial closes the breaker.
    tokio::time::sleep(Duration::from_secs(31)).await;
    backend.set_failing(false);
    call(&gateway, "e").await.unwrap();
    assert_eq!(gateway.breaker_state(Lane::Priority), CircuitState::Closed);
    assert_eq!(cooldown(&gateway), Duration::from_secs(30));

    call(&gateway, "f").await.unwrap();
    assert_eq!(backend.calls(), 5);
}

#[tokio::test(start_paused = true)]
async fn per_lane_breakers_are_independent() {
    let mut config = GatewayConfig::default();
    config.lanes.free.breaker_failure_threshold = 1;
    let backend = ScriptedBackend::new(Duration::from_millis(10));
    backend.set_failing(true);
    let gateway = gateway(config, backend.clone());

    let free = gateway
        .synthesize(
            &RequestIdentity::new("sk-free", "free"),
            &SynthesisRequest::text("x"),
            &CancellationToken::new(),
        )
        .await;
    assert!(matches!(free, Err(GatewayError::SynthesisFailed { .. })));
    assert_eq!(gateway.breaker_state(Lane::Free), CircuitState::Open);
    assert_eq!(gateway.breaker_state(Lane::Priority), CircuitState::Closed);

    backend.set_failing(false);
    call(&gateway, "x").await.unwrap();
}
