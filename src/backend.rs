//! Synthesis backend seam.
//!
//! The inference engine is opaque to the gateway: it is a single
//! [`SynthesisBackend::synthesize`] call that either returns audio bytes or
//! fails. Implementations should stop work when the supplied
//! [`CancellationToken`] fires; those that cannot are left to finish on
//! their own while the gateway releases the caller.

use crate::params::SynthesisParams;
use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

/// Parameters sent to the backend. There is no watermark field:
/// watermarking happens at the gateway boundary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackendRequest {
    /// Text to speak
    pub text: String,
    /// Voice profile, `None` for the base voice
    pub voice_id: Option<String>,
    /// Pinned model revision
    pub model_revision: String,
    /// Quality preset
    pub quality: String,
    /// Sampling method
    pub sampler: String,
}

impl From<&SynthesisParams> for BackendRequest {
    fn from(params: &SynthesisParams) -> Self {
        Self {
            text: params.text.clone(),
            voice_id: params.voice_id.clone(),
            model_revision: params.model_revision.clone(),
            quality: params.quality.clone(),
            sampler: params.sampler.clone(),
        }
    }
}

/// Backend call failures.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum BackendError {
    /// Backend rejected or failed the synthesis
    #[error("Backend error: {reason}")]
    Failed {
        /// Backend-provided reason
        reason: String,
    },

    /// Backend reported resource exhaustion (GPU OOM, busy)
    #[error("Backend overloaded: {reason}")]
    Overloaded {
        /// Backend-provided reason
        reason: String,
    },

    /// Backend could not be reached
    #[error("Backend transport error: {details}")]
    Transport {
        /// Transport error text
        details: String,
    },

    /// Work stopped because the caller cancelled
    #[error("Backend call cancelled")]
    Cancelled,
}

impl BackendError {
    /// Whether this outcome says something about backend health.
    ///
    /// Cancellation is the caller's doing and must not trip the breaker.
    pub fn counts_against_health(&self) -> bool {
        !matches!(self, BackendError::Cancelled)
    }
}

/// The external synthesis capability.
#[async_trait]
pub trait SynthesisBackend: Send + Sync + 'static {
    /// Synthesize one request. Blocking from the caller's point of view and
    /// GPU-bound on the other side.
    async fn synthesize(
        &self,
        request: &BackendRequest,
        cancel: CancellationToken,
    ) -> Result<Bytes, BackendError>;
}

// ============================================================================
// HTTP backend
// ============================================================================

/// Backend reached over HTTP: `POST <endpoint>` with a JSON
/// [`BackendRequest`], audio bytes in the response body.
pub struct HttpBackend {
    client: reqwest::Client,
    endpoint: url::Url,
}

impl HttpBackend {
    /// Create a client for `endpoint`.
    ///
    /// `timeout` bounds a single HTTP exchange; the gateway applies its own
    /// per-lane timeout on top.
    pub fn new(endpoint: &str, timeout: Duration) -> Result<Self, BackendError> {
        let endpoint = url::Url::parse(endpoint).map_err(|e| BackendError::Transport {
            details: format!("invalid backend url {endpoint:?}: {e}"),
        })?;
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| BackendError::Transport {
                details: e.to_string(),
            })?;
        Ok(Self { client, endpoint })
    }

    async fn call(&self, request: &BackendRequest) -> Result<Bytes, BackendError> {
        let response = self
            .client
            .post(self.endpoint.clone())
            .json(request)
            .send()
            .await
            .map_err(|e| BackendError::Transport {
                details: e.to_string(),
            })?;

        let status = response.status();
        if status.is_success() {
            return response.bytes().await.map_err(|e| BackendError::Transport {
                details: e.to_string(),
            });
        }

        let body = response.text().await.unwrap_or_default();
        let reason = format!("HTTP {status}: {}", body.chars().take(200).collect::<String>());
        if status == reqwest::StatusCode::SERVICE_UNAVAILABLE
            || status == reqwest::StatusCode::TOO_MANY_REQUESTS
        {
            Err(BackendError::Overloaded { reason })
        } else {
            Err(BackendError::Failed { reason })
        }
    }
}

#[async_trait]
impl SynthesisBackend for HttpBackend {
    async fn synthesize(
        &self,
        request: &BackendRequest,
        cancel: CancellationToken,
    ) -> Result<Bytes, BackendError> {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(BackendError::Cancelled),
            result = self.call(request) => result,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backend_request_drops_watermark_flag() {
        let params = SynthesisParams {
            text: "hello".into(),
            voice_id: Some("v1".into()),
            model_revision: "main".into(),
            quality: "standard".into(),
            sampler: "default".into(),
            watermark: true,
            format_version: 1,
        };
        let request = BackendRequest::from(&params);
        let json = serde_json::to_value(&request).unwrap();

        assert_eq!(json["text"], "hello");
        assert_eq!(json["voice_id"], "v1");
        assert!(json.get("watermark").is_none());
    }

    #[test]
    fn test_cancellation_does_not_count_against_health() {
        assert!(!BackendError::Cancelled.counts_against_health());
        assert!(
            BackendError::Overloaded {
                reason: "oom".into()
            }
            .counts_against_health()
        );
    }

    #[test]
    fn test_http_backend_rejects_bad_url() {
        assert!(HttpBackend::new("::not-a-url", Duration::from_secs(1)).is_err());
    }

    #[tokio::test]
    async fn test_http_backend_honours_cancellation() {
        // Port 9 (discard) is never contacted: the token is already cancelled.
        let backend = HttpBackend::new("http://127.0.0.1:9/synthesize", Duration::from_secs(1)).unwrap();
        let cancel = CancellationToken::new();
        cancel.cancel();

        let request = BackendRequest {
            text: "x".into(),
            voice_id: None,
            model_revision: "main".into(),
            quality: "standard".into(),
            sampler: "default".into(),
        };
        assert_eq!(
            backend.synthesize(&request, cancel).await,
            Err(BackendError::Cancelled)
        );
    }
}
