//! Inbound request and resolved synthesis parameters.

use crate::config::{GatewayConfig, LaneConfig};
use crate::error::{GatewayError, GatewayResult};
use serde::{Deserialize, Serialize};

/// Quality used when the client does not ask for one.
pub const DEFAULT_QUALITY: &str = "standard";

/// Sampler used when the client does not ask for one.
pub const DEFAULT_SAMPLER: &str = "default";

/// Request body as received from the transport layer.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SynthesisRequest {
    /// Text to speak
    pub text: String,
    /// Voice profile; `None` selects the base voice
    #[serde(default)]
    pub voice_id: Option<String>,
    /// Quality preset
    #[serde(default)]
    pub quality: Option<String>,
    /// Sampling method
    #[serde(default)]
    pub sampler: Option<String>,
    /// Client watermark preference. Can add a watermark, never remove a
    /// lane-mandated one.
    #[serde(default)]
    pub watermark: Option<bool>,
}

impl SynthesisRequest {
    /// Request for `text` with every option defaulted.
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            ..Self::default()
        }
    }

    /// Select a voice profile.
    pub fn with_voice(mut self, voice_id: impl Into<String>) -> Self {
        self.voice_id = Some(voice_id.into());
        self
    }
}

/// Fully resolved parameters. Given a fixed backend version these determine
/// the output bytes exactly, which is what makes them a cache key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct SynthesisParams {
    /// Trimmed input text
    pub text: String,
    /// Voice profile, `None` for the base voice
    pub voice_id: Option<String>,
    /// Model revision the backend is pinned to
    pub model_revision: String,
    /// Quality preset
    pub quality: String,
    /// Sampling method
    pub sampler: String,
    /// Whether the output carries the watermark
    pub watermark: bool,
    /// Output format version
    pub format_version: u32,
}

impl SynthesisParams {
    /// Validate `request` and fill in defaults for its lane.
    ///
    /// The effective watermark flag is `lane.watermark_required || requested`:
    /// a client can opt in on an unwatermarked lane but cannot opt out on a
    /// watermarked one.
    ///
    /// # Errors
    ///
    /// [`GatewayError::InvalidRequest`] when the text is empty after trimming
    /// or longer than `max_text_chars`.
    pub fn resolve(
        request: &SynthesisRequest,
        lane: &LaneConfig,
        config: &GatewayConfig,
    ) -> GatewayResult<Self> {
        let text = request.text.trim();
        if text.is_empty() {
            return Err(GatewayError::invalid("text is required"));
        }
        let chars = text.chars().count();
        if chars > config.max_text_chars {
            return Err(GatewayError::invalid(format!(
                "text must be <= {} chars (got {chars})",
                config.max_text_chars
            )));
        }

        Ok(Self {
            text: text.to_string(),
            voice_id: non_blank(request.voice_id.as_deref()),
            model_revision: config.model_revision.clone(),
            quality: non_blank(request.quality.as_deref())
                .unwrap_or_else(|| DEFAULT_QUALITY.to_string()),
            sampler: non_blank(request.sampler.as_deref())
                .unwrap_or_else(|| DEFAULT_SAMPLER.to_string()),
            watermark: lane.watermark_required || request.watermark.unwrap_or(false),
            format_version: config.format_version,
        })
    }

    /// Text length in characters.
    pub fn char_len(&self) -> usize {
        self.text.chars().count()
    }
}

fn non_blank(value: Option<&str>) -> Option<String> {
    value
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}
