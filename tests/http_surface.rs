//! End-to-end checks of the HTTP routes over a real socket.

mod common;

use common::{ScriptedBackend, gateway, is_watermarked};
use lanegate::config::GatewayConfig;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;

async fn serve(config: GatewayConfig) -> SocketAddr {
    serve_with(config, ScriptedBackend::new(Duration::from_millis(5))).await
}

async fn serve_with(config: GatewayConfig, backend: Arc<ScriptedBackend>) -> SocketAddr {
    let app = lanegate::http::router(gateway(config, backend));
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    addr
}

#[tokio::test]
async fn tts_round_trip_and_error_mapping() {
    let mut config = GatewayConfig::default();
    config.lanes.free.rate_limit_per_minute = 1;
    let addr = serve(config).await;
    let client = reqwest::Client::new();
    let url = format!("http://{addr}/tts");

    let ok = client
        .post(&url)
        .header("X-API-Key", "sk-free")
        .header("X-Plan", "free")
        .json(&serde_json::json!({ "text": "hello" }))
        .send()
        .await
        .unwrap();
    assert_eq!(ok.status(), 200);
    assert_eq!(ok.headers()["content-type"], "audio/wav");
    assert!(is_watermarked(&ok.bytes().await.unwrap()));

    let limited = client
        .post(&url)
        .header("X-API-Key", "sk-free")
        .header("X-Plan", "free")
        .json(&serde_json::json!({ "text": "again" }))
        .send()
        .await
        .unwrap();
    assert_eq!(limited.status(), 429);
    let retry_after: u64 = limited.headers()["retry-after"]
        .to_str()
        .unwrap()
        .parse()
        .unwrap();
    assert!(retry_after >= 1);
    let body: serde_json::Value = limited.json().await.unwrap();
    assert_eq!(body["error"], "rate_limited");

    let unknown = client
        .post(&url)
        .header("X-API-Key", "sk-x")
        .header("X-Plan", "platinum")
        .json(&serde_json::json!({ "text": "hello" }))
        .send()
        .await
        .unwrap();
    assert_eq!(unknown.status(), 403);

    let anonymous = client
        .post(&url)
        .json(&serde_json::json!({ "text": "hello" }))
        .send()
        .await
        .unwrap();
    assert_eq!(anonymous.status(), 401);

    let too_long = client
        .post(&url)
        .header("X-API-Key", "sk-pro")
        .header("X-Plan", "pro")
        .json(&serde_json::json!({ "text": "x".repeat(801) }))
        .send()
        .await
        .unwrap();
    assert_eq!(too_long.status(), 400);
}

#[tokio::test]
async fn health_and_metrics_are_json() {
    let addr = serve(GatewayConfig::default()).await;
    let client = reqwest::Client::new();

    let health: serde_json::Value = client
        .get(format!("http://{addr}/health"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(health["status"], "healthy");

    client
        .post(format!("http://{addr}/tts"))
        .header("X-API-Key", "sk-pro")
        .header("X-Plan", "PRO")
        .json(&serde_json::json!({ "text": "metrics please" }))
        .send()
        .await
        .unwrap();

    let metrics: serde_json::Value = client
        .get(format!("http://{addr}/metrics"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(metrics["lanes"]["priority"]["counters"]["requests"], 1);
    assert_eq!(metrics["lanes"]["priority"]["breaker"]["state"], "closed");
    assert_eq!(metrics["lanes"]["free"]["load"]["max_concurrent"], 1);
}

#[tokio::test]
async fn backend_timeout_is_504_with_retry_after_and_stops_the_call() {
    let mut config = GatewayConfig::default();
    config.lanes.priority.backend_timeout = Duration::from_millis(200);
    let backend = ScriptedBackend::new(Duration::from_secs(30));
    let addr = serve_with(config, backend.clone()).await;

    let response = reqwest::Client::new()
        .post(format!("http://{addr}/tts"))
        .header("X-API-Key", "sk-pro")
        .header("X-Plan", "pro")
        .json(&serde_json::json!({ "text": "too slow" }))
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), 504);
    assert!(response.headers().contains_key("retry-after"));
    let body: serde_json::Value = response.json().await.unwrap();
    assert_eq!(body["error"], "backend_timeout");
    assert_eq!(backend.calls(), 1);
    assert_eq!(backend.in_flight(), 0);
}
