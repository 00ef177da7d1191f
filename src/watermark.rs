//! Watermark enforcement at the gateway boundary.
//!
//! For a lane with `watermark_required`, every artifact leaving the gateway
//! carries the marker: fresh backend output is stamped before it is cached,
//! and cache hits are verified (and re-stamped if somehow unmarked) before
//! they are returned. A stamping failure is fatal for the request; an
//! unwatermarked artifact is never returned on such a lane.

use bytes::{BufMut, Bytes, BytesMut};
use sha2::{Digest, Sha256};
use std::sync::Arc;
use thiserror::Error;

/// Watermarking errors.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum WatermarkError {
    /// Nothing to stamp
    #[error("Cannot watermark an empty artifact")]
    EmptyArtifact,

    /// The marker implementation failed
    #[error("Watermark stamping failed: {details}")]
    Stamp {
        /// Failure details
        details: String,
    },

    /// Stamped output did not verify
    #[error("Watermark verification failed after stamping")]
    Verification,
}

/// Embeds and detects the marker in audio bytes.
pub trait Watermarker: Send + Sync {
    /// Return a marked copy of `audio`.
    fn stamp(&self, audio: &[u8]) -> Result<Bytes, WatermarkError>;

    /// Returns `true` if `audio` already carries the marker.
    fn is_marked(&self, audio: &[u8]) -> bool;
}

// ============================================================================
// Trailer watermarker
// ============================================================================

/// Magic bytes opening the trailer.
const TRAILER_MAGIC: &[u8; 4] = b"LGWM";
/// Trailer layout version.
const TRAILER_VERSION: u8 = 1;
/// Truncated keyed digest length.
const TAG_LEN: usize = 16;
/// Total trailer length.
const TRAILER_LEN: usize = TRAILER_MAGIC.len() + 1 + TAG_LEN;

/// Appends a keyed trailer: `LGWM | version | sha256(secret || audio)[..16]`.
///
/// The tag binds the marker to the audio it follows, so a trailer copied onto
/// different audio does not verify.
pub struct TrailerWatermarker {
    secret: Vec<u8>,
}

impl TrailerWatermarker {
    /// Create a marker keyed with `secret`.
    pub fn new(secret: impl Into<Vec<u8>>) -> Self {
        Self {
            secret: secret.into(),
        }
    }

    fn tag(&self, audio: &[u8]) -> [u8; TAG_LEN] {
        let mut hasher = Sha256::new();
        hasher.update(&self.secret);
        hasher.update(audio);
        let digest = hasher.finalize();

        let mut tag = [0u8; TAG_LEN];
        tag.copy_from_slice(&digest[..TAG_LEN]);
        tag
    }
}

impl Watermarker for TrailerWatermarker {
    fn stamp(&self, audio: &[u8]) -> Result<Bytes, WatermarkError> {
        if audio.is_empty() {
            return Err(WatermarkError::EmptyArtifact);
        }
        let mut out = BytesMut::with_capacity(audio.len() + TRAILER_LEN);
        out.put_slice(audio);
        out.put_slice(TRAILER_MAGIC);
        out.put_u8(TRAILER_VERSION);
        out.put_slice(&self.tag(audio));
        Ok(out.freeze())
    }

    fn is_marked(&self, audio: &[u8]) -> bool {
        if audio.len() <= TRAILER_LEN {
            return false;
        }
        let (body, trailer) = audio.split_at(audio.len() - TRAILER_LEN);
        let (magic, rest) = trailer.split_at(TRAILER_MAGIC.len());
        magic == TRAILER_MAGIC && rest[0] == TRAILER_VERSION && rest[1..] == self.tag(body)
    }
}

// ============================================================================
// Enforcer
// ============================================================================

/// Applies the lane watermark policy to artifacts.
#[derive(Clone)]
pub struct WatermarkEnforcer {
    marker: Arc<dyn Watermarker>,
}

impl WatermarkEnforcer {
    /// Enforce with the given marker implementation.
    pub fn new(marker: Arc<dyn Watermarker>) -> Self {
        Self { marker }
    }

    /// Return `artifact` unchanged when no watermark is required; otherwise
    /// return a verified, marked artifact. Already-marked input is passed
    /// through, so applying twice never double-stamps.
    ///
    /// # Errors
    ///
    /// Any [`WatermarkError`] means the artifact must not be returned.
    pub fn apply(&self, artifact: Bytes, required: bool) -> Result<Bytes, WatermarkError> {
        if !required || self.marker.is_marked(&artifact) {
            return Ok(artifact);
        }

        let stamped = self.marker.stamp(&artifact)?;
        if !self.marker.is_marked(&stamped) {
            return Err(WatermarkError::Verification);
        }
        Ok(stamped)
    }

    /// Returns `true` if `artifact` carries the marker.
    pub fn is_marked(&self, artifact: &[u8]) -> bool {
        self.marker.is_marked(artifact)
    }
}
