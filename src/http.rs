//! Thin HTTP surface over the [`Gateway`].
//!
//! | Route          | Purpose                                        |
//! |----------------|------------------------------------------------|
//! | `POST /tts`    | Synthesize; identity from `X-API-Key`/`X-Plan` |
//! | `GET /health`  | Liveness and uptime                            |
//! | `GET /metrics` | JSON [`crate::metrics::MetricsSnapshot`]       |
//!
//! Authentication happens upstream; this layer only lifts the identity out
//! of headers and maps [`GatewayError`] to status codes and `Retry-After`.

use crate::error::GatewayError;
use crate::gateway::Gateway;
use crate::lane::RequestIdentity;
use crate::params::SynthesisRequest;
use axum::extract::State;
use axum::http::{HeaderMap, HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Serialize;
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;

/// Header carrying the caller's API key id.
pub const API_KEY_HEADER: &str = "x-api-key";
/// Header carrying the caller's plan tag.
pub const PLAN_HEADER: &str = "x-plan";

struct AppState {
    gateway: Gateway,
    started: Instant,
}

/// Build the router.
pub fn router(gateway: Gateway) -> Router {
    let state = Arc::new(AppState {
        gateway,
        started: Instant::now(),
    });

    Router::new()
        .route("/tts", post(tts_handler))
        .route("/health", get(health_handler))
        .route("/metrics", get(metrics_handler))
        .with_state(state)
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
    uptime_secs: u64,
}

#[derive(Serialize)]
struct ErrorBody {
    error: &'static str,
    message: String,
}

/// Error response: status, JSON body, and `Retry-After` when applicable.
#[derive(Debug)]
pub struct ApiError(pub GatewayError);

impl From<GatewayError> for ApiError {
    fn from(error: GatewayError) -> Self {
        Self(error)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status =
            StatusCode::from_u16(self.0.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        let body = ErrorBody {
            error: self.0.kind(),
            message: self.0.to_string(),
        };

        let mut response = (status, Json(body)).into_response();
        if let Some(secs) = self.0.retry_after_secs() {
            response
                .headers_mut()
                .insert(header::RETRY_AFTER, HeaderValue::from(secs));
        }
        response
    }
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty())
}

async fn tts_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(request): Json<SynthesisRequest>,
) -> Response {
    let Some(api_key) = header_str(&headers, API_KEY_HEADER) else {
        let body = ErrorBody {
            error: "unauthenticated",
            message: "missing X-API-Key header".to_string(),
        };
        return (StatusCode::UNAUTHORIZED, Json(body)).into_response();
    };
    let plan = header_str(&headers, PLAN_HEADER).unwrap_or_default();
    let identity = RequestIdentity::new(api_key, plan);

    // Axum drops this future when the client disconnects; the guard turns
    // that into cancellation of queued waits and the backend call.
    let cancel = CancellationToken::new();
    let _guard = cancel.clone().drop_guard();

    match state.gateway.synthesize(&identity, &request, &cancel).await {
        Ok(audio) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, HeaderValue::from_static("audio/wav"))],
            audio,
        )
            .into_response(),
        Err(e) => ApiError(e).into_response(),
    }
}

async fn health_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(HealthResponse {
        status: "healthy",
        version: env!("CARGO_PKG_VERSION"),
        uptime_secs: state.started.elapsed().as_secs(),
    })
}

async fn metrics_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.gateway.metrics_snapshot())
}
