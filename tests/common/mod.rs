//! Shared fixtures for gateway integration tests.
#![allow(dead_code)]

use async_trait::async_trait;
use bytes::Bytes;
use lanegate::backend::{BackendError, BackendRequest, SynthesisBackend};
use lanegate::config::GatewayConfig;
use lanegate::gateway::Gateway;
use lanegate::watermark::{TrailerWatermarker, Watermarker};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

pub const SECRET: &[u8] = b"integration-secret";

/// Backend that sleeps for a fixed time and records how many calls overlap.
pub struct ScriptedBackend {
    delay: Duration,
    calls: AtomicUsize,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    failing: AtomicBool,
}

struct InFlight<'a>(&'a ScriptedBackend);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

impl ScriptedBackend {
    pub fn new(delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            delay,
            calls: AtomicUsize::new(0),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
            failing: AtomicBool::new(false),
        })
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }
}

#[async_trait]
impl SynthesisBackend for ScriptedBackend {
    async fn synthesize(
        &self,
        request: &BackendRequest,
        cancel: CancellationToken,
    ) -> Result<Bytes, BackendError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        let _in_flight = InFlight(self);

        tokio::select! {
            _ = cancel.cancelled() => return Err(BackendError::Cancelled),
            _ = tokio::time::sleep(self.delay) => {}
        }

        if self.failing.load(Ordering::SeqCst) {
            return Err(BackendError::Overloaded {
                reason: "CUDA out of memory".into(),
            });
        }
        Ok(Bytes::from(format!("pcm:{}", request.text)))
    }
}

pub fn marker() -> TrailerWatermarker {
    TrailerWatermarker::new(SECRET.to_vec())
}

pub fn is_watermarked(audio: &[u8]) -> bool {
    marker().is_marked(audio)
}

pub fn gateway(config: GatewayConfig, backend: Arc<ScriptedBackend>) -> Gateway {
    Gateway::builder(config)
        .backend(backend)
        .watermarker(Arc::new(marker()))
        .build()
        .expect("valid test gateway")
}
