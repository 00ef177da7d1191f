//! Stand-in synthesis backend for local runs.
//!
//! Answers `POST /synthesize` with fake PCM after a fixed delay, optionally
//! failing every Nth call with 503 to exercise the circuit breaker.

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::post;
use axum::{Json, Router};
use clap::Parser;
use lanegate::backend::BackendRequest;
use sha2::{Digest, Sha256};
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::time::sleep;

#[derive(Debug, Parser)]
#[command(name = "mock_backend", about = "Fake synthesis backend")]
struct Args {
    /// Listen address
    #[arg(long, default_value = "127.0.0.1:8090")]
    addr: SocketAddr,

    /// Simulated inference time in milliseconds
    #[arg(long, env = "MOCK_DELAY_MS", default_value_t = 500)]
    delay_ms: u64,

    /// Fail every Nth request with 503 (0 disables)
    #[arg(long, env = "MOCK_FAIL_EVERY", default_value_t = 0)]
    fail_every: u64,
}

struct MockState {
    delay: Duration,
    fail_every: u64,
    calls: AtomicU64,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();
    let args = Args::parse();

    let state = Arc::new(MockState {
        delay: Duration::from_millis(args.delay_ms),
        fail_every: args.fail_every,
        calls: AtomicU64::new(0),
    });
    let app = Router::new()
        .route("/synthesize", post(synthesize))
        .with_state(state);

    tracing::info!(addr = %args.addr, "Mock synthesis backend listening");

    let listener = tokio::net::TcpListener::bind(args.addr).await.map_err(|e| {
        tracing::error!("Failed to bind to {}: {}", args.addr, e);
        e
    })?;

    axum::serve(listener, app).await.map_err(|e| {
        tracing::error!("Server error: {}", e);
        e
    })?;

    Ok(())
}

async fn synthesize(
    State(state): State<Arc<MockState>>,
    Json(request): Json<BackendRequest>,
) -> impl IntoResponse {
    let call = state.calls.fetch_add(1, Ordering::Relaxed) + 1;
    tracing::info!(call, chars = request.text.chars().count(), "Synthesizing");

    sleep(state.delay).await;

    if state.fail_every > 0 && call % state.fail_every == 0 {
        return (StatusCode::SERVICE_UNAVAILABLE, b"CUDA out of memory".to_vec());
    }
    (StatusCode::OK, fake_pcm(&request))
}

/// Deterministic 16-bit samples derived from the request, one per character.
fn fake_pcm(request: &BackendRequest) -> Vec<u8> {
    let seed = Sha256::digest(
        format!(
            "{}|{:?}|{}|{}|{}",
            request.text, request.voice_id, request.model_revision, request.quality, request.sampler
        )
        .as_bytes(),
    );
    request
        .text
        .chars()
        .enumerate()
        .flat_map(|(i, c)| {
            let sample = (c as u16).wrapping_mul(seed[i % seed.len()] as u16 + 1);
            sample.to_le_bytes()
        })
        .collect()
}
